//! PHP-FPM endpoint detection
//!
//! Detection runs in stages, each one only when the previous came up empty:
//!
//! 1. Dial the conventional sockets and ports (see [`crate::config::default_candidates`]).
//! 2. Find a running `*-fpm` master process.
//! 3. Re-run its command line with `-tt` and read `listen`, `user`, `group`,
//!    `listen.owner` and `listen.group` from the dumped configuration.
//! 4. Dial the extracted address once.
//!
//! Everything is blocking and sequential. Nothing is cached between calls.

pub mod dump;
pub mod probe;
pub mod process;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

use crate::config::{ConfigError, ProbeConfig};
use crate::error::{Error, Result};
use crate::php::PhpVersion;

pub use dump::RawConfig;
pub use probe::Prober;
pub use process::{ProcessInfo, ProcessSource, SystemProcesses};

/// Socket family of a FastCGI endpoint
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Unix,
}

impl Network {
    /// `host:port` is TCP, anything else is a socket path
    pub fn from_address(address: &str) -> Self {
        if address.contains(':') {
            Network::Tcp
        } else {
            Network::Unix
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Unix => "unix",
        }
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Network::Tcp),
            "unix" => Ok(Network::Unix),
            other => Err(format!("unknown network {:?}, expected tcp or unix", other)),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Facts gathered about an FPM instance.
///
/// Fields are only ever filled in, never cleared.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct FpmConfig {
    /// `host:port` or a socket path; empty until detected
    pub listen_address: String,
    /// Set exactly when `listen_address` is
    pub listen_network: Option<Network>,

    pub php_version: Option<PhpVersion>,
    pub php_extensions: Option<Vec<String>>,

    /// Unix user who will need write access for php
    pub php_user: Option<String>,
    /// Unix group who will need write access for php
    pub php_group: Option<String>,
    /// Unix owner of the socket
    pub listen_owner: Option<String>,
    /// Unix group of the socket
    pub listen_group: Option<String>,
}

impl FpmConfig {
    /// A config pointing at a caller-supplied endpoint.
    ///
    /// Fails when `network` disagrees with the address syntax.
    pub fn with_endpoint(network: Network, address: impl Into<String>) -> Result<Self> {
        let mut config = Self::default();
        config.set_listen(address);
        if config.listen_network != Some(network) {
            return Err(ConfigError::ValidationError(format!(
                "{} does not look like a {} address",
                config.listen_address, network
            ))
            .into());
        }
        Ok(config)
    }

    /// Record a listen address, deriving the network from its syntax.
    pub fn set_listen(&mut self, address: impl Into<String>) {
        let address = address.into();
        self.listen_network = Some(Network::from_address(&address));
        self.listen_address = address;
    }

    pub fn is_resolved(&self) -> bool {
        !self.listen_address.is_empty()
    }

    /// The endpoint to dial, if one is known
    pub fn endpoint(&self) -> Option<(Network, &str)> {
        if !self.is_resolved() {
            return None;
        }
        let network = self
            .listen_network
            .unwrap_or_else(|| Network::from_address(&self.listen_address));
        Some((network, self.listen_address.as_str()))
    }

    /// Look up the numeric ids of the accounts named in this config.
    ///
    /// Names unknown to the system resolve to `None`.
    pub fn resolve_ids(&self) -> Result<AccountIds> {
        Ok(AccountIds {
            php_uid: lookup_user(self.php_user.as_deref())?,
            php_gid: lookup_group(self.php_group.as_deref())?,
            listen_uid: lookup_user(self.listen_owner.as_deref())?,
            listen_gid: lookup_group(self.listen_group.as_deref())?,
        })
    }
}

impl fmt::Display for FpmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.endpoint() {
            Some((network, address)) => write!(f, "php-fpm on {} {}", network, address)?,
            None => write!(f, "php-fpm (endpoint unknown)")?,
        }
        if let Some(ref version) = self.php_version {
            write!(f, ", PHP {}", version)?;
        }
        if let Some(ref user) = self.php_user {
            write!(f, ", user {}", user)?;
        }
        if let Some(ref group) = self.php_group {
            write!(f, ", group {}", group)?;
        }
        Ok(())
    }
}

/// Numeric account ids for the names in an [`FpmConfig`]
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct AccountIds {
    pub php_uid: Option<u32>,
    pub php_gid: Option<u32>,
    pub listen_uid: Option<u32>,
    pub listen_gid: Option<u32>,
}

fn lookup_user(name: Option<&str>) -> Result<Option<u32>> {
    let Some(name) = name else { return Ok(None) };
    let user = nix::unistd::User::from_name(name).map_err(|e| Error::Account {
        name: name.to_string(),
        source: e.into(),
    })?;
    Ok(user.map(|u| u.uid.as_raw()))
}

fn lookup_group(name: Option<&str>) -> Result<Option<u32>> {
    let Some(name) = name else { return Ok(None) };
    let group = nix::unistd::Group::from_name(name).map_err(|e| Error::Account {
        name: name.to_string(),
        source: e.into(),
    })?;
    Ok(group.map(|g| g.gid.as_raw()))
}

/// Runs the detection stages against one process source
pub struct Detector {
    config: ProbeConfig,
    processes: Box<dyn ProcessSource>,
}

impl Detector {
    /// Create a detector that scans the real process table
    pub fn new(config: ProbeConfig) -> Self {
        Self {
            config,
            processes: Box::new(SystemProcesses),
        }
    }

    /// Replace the process table snapshot source
    pub fn with_process_source(mut self, source: impl ProcessSource + 'static) -> Self {
        self.processes = Box::new(source);
        self
    }

    pub fn prober(&self) -> Prober<'_> {
        Prober::new(&self.config.candidates, self.config.dial_timeout())
    }

    /// Find a reachable FPM endpoint.
    ///
    /// Fails with [`Error::NotFound`] when no strategy produced an address,
    /// and with [`Error::Unreachable`] when the address read from the FPM
    /// configuration could not be dialed.
    pub fn detect(&self) -> Result<FpmConfig> {
        let prober = self.prober();
        let mut config = FpmConfig::default();

        prober.probe(&mut config)?;
        if config.is_resolved() {
            info!("Detected {}", config);
            return Ok(config);
        }

        let process = process::locate(self.processes.as_ref(), &self.config.process_marker)
            .map_err(|e| Error::not_found(Some(e)))?;
        info!(
            "Found php-fpm process {} ({}), dumping its configuration",
            process.pid, process.name
        );

        if let Err(e) = dump::extract(
            &process,
            &mut config,
            &self.config.dump_flag,
            self.config.dump_timeout(),
        ) {
            warn!("Cannot read configuration of process {}: {}", process.pid, e);
            return Err(Error::not_found(Some(e)));
        }

        if !config.is_resolved() {
            warn!("php-fpm configuration dump has no listen directive");
            return Err(Error::not_found(None));
        }

        prober.probe(&mut config)?;
        info!("Detected {}", config);
        Ok(config)
    }
}

/// Detect the local FPM endpoint with default settings
pub fn detect_fpm_infos() -> Result<FpmConfig> {
    Detector::new(ProbeConfig::default()).detect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Candidate;
    use crate::fastcgi::testing::FakeResponder;
    use std::fs;
    use std::path::Path;

    struct NoProcesses;

    impl ProcessSource for NoProcesses {
        fn processes(&self) -> Vec<ProcessInfo> {
            Vec::new()
        }
    }

    struct FixedProcesses(Vec<ProcessInfo>);

    impl ProcessSource for FixedProcesses {
        fn processes(&self) -> Vec<ProcessInfo> {
            self.0.clone()
        }
    }

    fn hello(_: &crate::fastcgi::Params) -> Vec<u8> {
        b"Content-type: text/plain\r\n\r\nok".to_vec()
    }

    fn probe_config(candidates: Vec<Candidate>) -> ProbeConfig {
        ProbeConfig {
            candidates,
            dump_timeout_secs: 5,
            ..ProbeConfig::default()
        }
    }

    fn unreachable_candidates(dir: &Path) -> Vec<Candidate> {
        vec![
            Candidate::new(
                Network::Unix,
                dir.join("php-fpm.sock").to_string_lossy().to_string(),
            ),
            Candidate::new(
                Network::Unix,
                dir.join("php72-fpm.sock").to_string_lossy().to_string(),
            ),
        ]
    }

    /// Writes a shell script standing in for `php-fpm -tt`
    fn fake_fpm(dir: &Path, dump: &str) -> String {
        let path = dir.join("php-fpm7.4");
        let script = format!("cat <<'EOF' >&2\n{}\nEOF\n", dump);
        fs::write(&path, script).unwrap();
        path.to_string_lossy().to_string()
    }

    fn fpm_process(script: &str) -> ProcessInfo {
        ProcessInfo {
            pid: 4242,
            name: "php-fpm7.4".to_string(),
            exe: None,
            cmdline: vec!["/bin/sh".to_string(), script.to_string()],
        }
    }

    #[test]
    fn test_network_from_address() {
        assert_eq!(Network::from_address("127.0.0.1:9000"), Network::Tcp);
        assert_eq!(Network::from_address("[::1]:9000"), Network::Tcp);
        assert_eq!(Network::from_address("/run/php/php-fpm.sock"), Network::Unix);
        assert_eq!(Network::Tcp.to_string(), "tcp");
        assert_eq!("UNIX".parse::<Network>(), Ok(Network::Unix));
        assert!("udp".parse::<Network>().is_err());
    }

    #[test]
    fn test_set_listen_derives_network() {
        let mut config = FpmConfig::default();
        assert!(config.endpoint().is_none());

        config.set_listen("/run/php/php8.2-fpm.sock");
        assert_eq!(config.listen_network, Some(Network::Unix));

        config.set_listen("127.0.0.1:9000");
        assert_eq!(config.endpoint(), Some((Network::Tcp, "127.0.0.1:9000")));
    }

    #[test]
    fn test_with_endpoint_rejects_mismatched_network() {
        let err = FpmConfig::with_endpoint(Network::Tcp, "/run/php/php-fpm.sock").unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::ValidationError(_))));
        assert!(FpmConfig::with_endpoint(Network::Unix, "127.0.0.1:9000").is_err());

        let config = FpmConfig::with_endpoint(Network::Tcp, "127.0.0.1:9000").unwrap();
        assert_eq!(config.endpoint(), Some((Network::Tcp, "127.0.0.1:9000")));
    }

    #[test]
    fn test_config_serializes_network_lowercase() {
        let config = FpmConfig::with_endpoint(Network::Unix, "/run/php/php-fpm.sock").unwrap();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["listen_network"], "unix");
        assert_eq!(json["listen_address"], "/run/php/php-fpm.sock");
        assert!(json["php_version"].is_null());
    }

    #[test]
    fn test_resolve_ids_for_root() {
        let config = FpmConfig {
            php_user: Some("root".to_string()),
            listen_group: Some("fpm-probe-no-such-group".to_string()),
            ..FpmConfig::default()
        };
        let ids = config.resolve_ids().unwrap();
        assert_eq!(ids.php_uid, Some(0));
        assert_eq!(ids.php_gid, None);
        assert_eq!(ids.listen_gid, None);
    }

    #[test]
    fn test_detect_resolves_from_candidate_table() {
        let dir = tempfile::tempdir().unwrap();
        let fpm = FakeResponder::unix(hello);
        let mut candidates = unreachable_candidates(dir.path());
        candidates.push(Candidate::new(fpm.network, fpm.address.clone()));

        let detector = Detector::new(probe_config(candidates)).with_process_source(NoProcesses);
        let config = detector.detect().unwrap();
        assert_eq!(config.listen_address, fpm.address);
        assert_eq!(config.listen_network, Some(Network::Unix));
    }

    #[test]
    fn test_detect_without_anything_fails_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let detector = Detector::new(probe_config(unreachable_candidates(dir.path())))
            .with_process_source(NoProcesses);

        let err = detector.detect().unwrap_err();
        assert!(err.is_not_found());
        assert!(err
            .to_string()
            .contains("cannot find any suitable configuration"));
    }

    #[test]
    fn test_detect_falls_back_to_process_dump() {
        let dir = tempfile::tempdir().unwrap();
        let fpm = FakeResponder::tcp(hello);
        let dump = format!(
            "[03/May/2024:10:00:00] NOTICE: [www]\n\
             [03/May/2024:10:00:00] NOTICE: \tuser = www-data\n\
             [03/May/2024:10:00:00] NOTICE: \tgroup = www-data\n\
             [03/May/2024:10:00:00] NOTICE: \tlisten = {}\n\
             [03/May/2024:10:00:00] NOTICE: \tlisten.owner = nginx\n\
             [03/May/2024:10:00:00] NOTICE: \tlisten.group = undefined\n",
            fpm.address
        );
        let binary = fake_fpm(dir.path(), &dump);

        let detector = Detector::new(probe_config(unreachable_candidates(dir.path())))
            .with_process_source(FixedProcesses(vec![fpm_process(&binary)]));
        let config = detector.detect().unwrap();

        assert_eq!(config.listen_address, fpm.address);
        assert_eq!(config.listen_network, Some(Network::Tcp));
        assert_eq!(config.php_user.as_deref(), Some("www-data"));
        assert_eq!(config.php_group.as_deref(), Some("www-data"));
        assert_eq!(config.listen_owner.as_deref(), Some("nginx"));
        assert_eq!(config.listen_group, None);
    }

    #[test]
    fn test_detect_reports_unreachable_extracted_address() {
        let dir = tempfile::tempdir().unwrap();
        let dead = dir.path().join("dead.sock");
        let dump = format!(
            "[03/May/2024:10:00:00] NOTICE: \tlisten = {}",
            dead.display()
        );
        let binary = fake_fpm(dir.path(), &dump);

        let detector = Detector::new(probe_config(unreachable_candidates(dir.path())))
            .with_process_source(FixedProcesses(vec![fpm_process(&binary)]));
        let err = detector.detect().unwrap_err();

        assert!(!err.is_not_found());
        assert!(matches!(err, Error::Unreachable { network: Network::Unix, .. }));
    }

    #[test]
    fn test_detect_wraps_dump_failure_in_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("php-fpm");
        fs::write(&path, "echo 'ERROR: failed to open configuration file' >&2\nexit 78\n").unwrap();

        let detector = Detector::new(probe_config(unreachable_candidates(dir.path())))
            .with_process_source(FixedProcesses(vec![fpm_process(&path.to_string_lossy())]));
        let err = detector.detect().unwrap_err();

        assert!(err.is_not_found());
        let Error::NotFound { cause: Some(cause) } = err else {
            panic!("expected a wrapped cause");
        };
        assert!(matches!(*cause, Error::Extraction(_)));
    }

    #[test]
    fn test_detect_dump_without_listen_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let binary = fake_fpm(dir.path(), "[03/May/2024:10:00:00] NOTICE: \tuser = www-data");

        let detector = Detector::new(probe_config(unreachable_candidates(dir.path())))
            .with_process_source(FixedProcesses(vec![fpm_process(&binary)]));
        let err = detector.detect().unwrap_err();
        assert!(matches!(err, Error::NotFound { cause: None }));
    }
}
