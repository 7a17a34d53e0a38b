//! PHP version numbers

use serde::{Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// A PHP version such as `8.2.12` or `7.4.3-4ubuntu2.19`.
///
/// Missing minor/patch components count as zero. Ordering looks at the
/// numeric triple first and the suffix last: a pre-release suffix such as
/// `RC1` or `-beta2` sorts below the bare release, a distribution suffix
/// such as `-4ubuntu2.19` above it.
#[derive(Debug, Clone)]
pub struct PhpVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    /// Everything after the numeric part, e.g. `-4ubuntu2.19`
    pub suffix: String,
    raw: String,
}

impl PhpVersion {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            suffix: String::new(),
            raw: format!("{}.{}.{}", major, minor, patch),
        }
    }

    /// The text the version was parsed from
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// True for `RC1`, `alpha`, `-dev` and other suffixes starting with a letter
    pub fn is_prerelease(&self) -> bool {
        self.suffix
            .trim_start_matches(['-', '.', '~'])
            .starts_with(|c: char| c.is_ascii_alphabetic())
    }

    fn suffix_rank(&self) -> u8 {
        match (self.is_prerelease(), self.suffix.is_empty()) {
            (true, _) => 0,
            (false, true) => 1,
            (false, false) => 2,
        }
    }
}

impl FromStr for PhpVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::Parse {
            what: "PHP version",
            message: format!("malformed version {:?}", s),
        };

        let raw = s.trim();
        let text = raw.strip_prefix('v').unwrap_or(raw);

        let numeric_end = text
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(text.len());
        let (numeric, suffix) = text.split_at(numeric_end);

        let parts: Vec<&str> = numeric.split('.').collect();
        if parts.is_empty() || parts.len() > 3 || parts.iter().any(|p| p.is_empty()) {
            return Err(invalid());
        }
        let mut nums = [0u64; 3];
        for (slot, part) in nums.iter_mut().zip(&parts) {
            *slot = part.parse().map_err(|_| invalid())?;
        }

        let suffix_ok = suffix.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '+' | '~')
        });
        if !suffix_ok {
            return Err(invalid());
        }

        Ok(Self {
            major: nums[0],
            minor: nums[1],
            patch: nums[2],
            suffix: suffix.to_string(),
            raw: raw.to_string(),
        })
    }
}

impl Ord for PhpVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch, self.suffix_rank(), &self.suffix).cmp(&(
            other.major,
            other.minor,
            other.patch,
            other.suffix_rank(),
            &other.suffix,
        ))
    }
}

impl PartialOrd for PhpVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for PhpVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PhpVersion {}

impl fmt::Display for PhpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl Serialize for PhpVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain() {
        let v: PhpVersion = "8.2.12".parse().unwrap();
        assert_eq!((v.major, v.minor, v.patch), (8, 2, 12));
        assert!(v.suffix.is_empty());
        assert_eq!(v.to_string(), "8.2.12");
    }

    #[test]
    fn test_parse_distribution_suffix() {
        let v: PhpVersion = " 7.4.3-4ubuntu2.19\n".parse().unwrap();
        assert_eq!((v.major, v.minor, v.patch), (7, 4, 3));
        assert_eq!(v.suffix, "-4ubuntu2.19");
        assert_eq!(v.as_str(), "7.4.3-4ubuntu2.19");
    }

    #[test]
    fn test_short_versions_compare() {
        let short: PhpVersion = "7.0".parse().unwrap();
        assert_eq!(short, PhpVersion::new(7, 0, 0));
        assert!("7.4.33".parse::<PhpVersion>().unwrap() > short);
        assert!("8".parse::<PhpVersion>().unwrap() > "7.99.99".parse().unwrap());
    }

    #[test]
    fn test_prerelease_sorts_before_release() {
        let release: PhpVersion = "8.3.0".parse().unwrap();
        let rc: PhpVersion = "8.3.0RC1".parse().unwrap();
        let beta: PhpVersion = "8.3.0-beta2".parse().unwrap();
        let distro: PhpVersion = "8.3.0-1ubuntu1".parse().unwrap();

        assert!(rc.is_prerelease() && beta.is_prerelease());
        assert!(!distro.is_prerelease());
        assert!(rc < release);
        assert!(beta < rc);
        assert!(distro > release);
        assert!(rc > "8.2.99".parse().unwrap());
    }

    #[test]
    fn test_rejects_garbage() {
        for bad in ["", "PHP", "8..1", "8.1.2.3", "<br />\n<b>Warning</b>", "8.1 beta"] {
            assert!(bad.parse::<PhpVersion>().is_err(), "{bad:?} should fail");
        }
    }

    #[test]
    fn test_serializes_as_string() {
        let v: PhpVersion = "8.3.0RC1".parse().unwrap();
        assert_eq!(serde_json::to_string(&v).unwrap(), "\"8.3.0RC1\"");
    }
}
