//! PHP Runtime Introspection
//!
//! Once an FPM endpoint is known, two scripts are executed through it:
//!
//! - `version.php` echoes `PHP_VERSION`
//! - `extensions.php` echoes `json_encode(get_loaded_extensions())`
//!
//! Both files must already exist in the scripts directory, where
//! [`scripts::StagedScripts`] can put them. The directory has to be readable
//! by the FPM pool user.

pub mod scripts;
pub mod version;

use std::io;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::ProbeConfig;
use crate::detect::FpmConfig;
use crate::error::{Error, Result};
use crate::fastcgi::{Client, Params};

pub use scripts::{StagedScripts, EXTENSIONS_SCRIPT, VERSION_SCRIPT};
pub use version::PhpVersion;

/// Fill `php_version` and `php_extensions` with default timeouts
pub fn detect_php_infos(config: &mut FpmConfig, scripts_dir: &Path) -> Result<()> {
    detect_php_infos_with(config, scripts_dir, &ProbeConfig::default())
}

/// Fill `php_version` and `php_extensions` by running the introspection
/// scripts through the endpoint in `config`.
///
/// Stops at the first failure. A version found before the extension query
/// fails stays set.
pub fn detect_php_infos_with(
    config: &mut FpmConfig,
    scripts_dir: &Path,
    settings: &ProbeConfig,
) -> Result<()> {
    let timeout = settings.request_timeout();

    let output = php_get(config, &scripts_dir.join(VERSION_SCRIPT), timeout)?;
    let version: PhpVersion = String::from_utf8_lossy(&output).trim().parse()?;
    config.php_version = Some(version);

    let output = php_get(config, &scripts_dir.join(EXTENSIONS_SCRIPT), timeout)?;
    let extensions: Vec<String> =
        serde_json::from_slice(&output).map_err(|e| Error::Parse {
            what: "extension list",
            message: e.to_string(),
        })?;
    config.php_extensions = Some(extensions);

    info!(
        "PHP {} with {} extensions",
        config.php_version.as_ref().map(|v| v.as_str()).unwrap_or("?"),
        config.php_extensions.as_ref().map_or(0, Vec::len)
    );
    Ok(())
}

/// Execute `script` through FPM and return its body
fn php_get(config: &FpmConfig, script: &Path, timeout: Duration) -> Result<Vec<u8>> {
    let (network, address) = config.endpoint().ok_or_else(|| Error::not_found(None))?;

    let client = Client::dial(network, address, timeout).map_err(|source| Error::Unreachable {
        network,
        address: address.to_string(),
        source,
    })?;
    client.set_timeout(Some(timeout))?;

    let response = client.get(script, &Params::new())?;
    if !response.is_success() {
        return Err(Error::Transport(io::Error::new(
            io::ErrorKind::Other,
            format!("{} answered with status {}", script.display(), response.status),
        )));
    }

    debug!(
        "script {} content: {}",
        script.display(),
        String::from_utf8_lossy(&response.body)
    );
    Ok(response.body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fastcgi::testing::FakeResponder;

    fn fake_php(version: &'static str, extensions: &'static str) -> FakeResponder {
        FakeResponder::unix(move |params| {
            let script = &params["SCRIPT_FILENAME"];
            let body = if script.ends_with(VERSION_SCRIPT) {
                version
            } else if script.ends_with(EXTENSIONS_SCRIPT) {
                extensions
            } else {
                return b"Status: 404 Not Found\r\n\r\nFile not found.\n".to_vec();
            };
            format!("X-Powered-By: PHP\r\nContent-type: text/html; charset=UTF-8\r\n\r\n{}", body)
                .into_bytes()
        })
    }

    #[test]
    fn test_detect_php_infos() {
        let fpm = fake_php("8.2.12", r#"["Core","date","json","pcre","PDO"]"#);
        let mut config = FpmConfig::with_endpoint(fpm.network, fpm.address.clone()).unwrap();

        detect_php_infos(&mut config, Path::new("/srv/fpm-probe")).unwrap();

        let version = config.php_version.clone().unwrap();
        assert!(version > PhpVersion::new(7, 0, 0));
        let extensions = config.php_extensions.unwrap();
        assert!(extensions.contains(&"Core".to_string()));
        assert_eq!(extensions.len(), 5);
    }

    #[test]
    fn test_bad_version_aborts_before_extensions() {
        let fpm = fake_php("<b>Parse error</b>", r#"["Core"]"#);
        let mut config = FpmConfig::with_endpoint(fpm.network, fpm.address.clone()).unwrap();

        let err = detect_php_infos(&mut config, Path::new("/srv")).unwrap_err();
        assert!(matches!(err, Error::Parse { what: "PHP version", .. }));
        assert!(config.php_version.is_none());
        assert!(config.php_extensions.is_none());
    }

    #[test]
    fn test_bad_extensions_keep_version() {
        let fpm = fake_php("7.4.3", "Array");
        let mut config = FpmConfig::with_endpoint(fpm.network, fpm.address.clone()).unwrap();

        let err = detect_php_infos(&mut config, Path::new("/srv")).unwrap_err();
        assert!(matches!(err, Error::Parse { what: "extension list", .. }));
        assert_eq!(config.php_version, Some(PhpVersion::new(7, 4, 3)));
        assert!(config.php_extensions.is_none());
    }

    #[test]
    fn test_missing_script_is_transport_error() {
        let fpm = FakeResponder::tcp(|_| b"Status: 404 Not Found\r\n\r\nFile not found.\n".to_vec());
        let mut config = FpmConfig::with_endpoint(fpm.network, fpm.address.clone()).unwrap();

        let err = detect_php_infos(&mut config, Path::new("/srv")).unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[test]
    fn test_unresolved_config_is_rejected() {
        let mut config = FpmConfig::default();
        let err = detect_php_infos(&mut config, Path::new("/srv")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    #[ignore = "needs a running php-fpm; set FPM_PROBE_ADDRESS"]
    fn test_against_real_fpm() {
        let address = std::env::var("FPM_PROBE_ADDRESS").unwrap_or("127.0.0.1:9000".to_string());
        let mut config = FpmConfig::default();
        config.set_listen(address);

        let staged = StagedScripts::temporary().unwrap();
        detect_php_infos(&mut config, staged.dir()).unwrap();

        assert!(config.php_version.unwrap() > "7.0".parse().unwrap());
        assert!(config
            .php_extensions
            .unwrap()
            .contains(&"Core".to_string()));
    }
}
