//! Introspection scripts staged on disk for FPM to execute

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::debug;

pub const VERSION_SCRIPT: &str = "version.php";
pub const EXTENSIONS_SCRIPT: &str = "extensions.php";

const VERSION_SOURCE: &str = "<?php\necho PHP_VERSION;\n";
const EXTENSIONS_SOURCE: &str = "<?php\necho json_encode(get_loaded_extensions());\n";

/// The two scripts written into a directory, removed again on drop
pub struct StagedScripts {
    dir: PathBuf,
    _temp: Option<TempDir>,
}

impl StagedScripts {
    /// Write the scripts into an existing directory
    pub fn stage(dir: &Path) -> io::Result<Self> {
        write_scripts(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            _temp: None,
        })
    }

    /// Write the scripts into a fresh temporary directory
    pub fn temporary() -> io::Result<Self> {
        let temp = tempfile::Builder::new().prefix("fpm-probe-").tempdir()?;
        // FPM workers usually run as another user
        fs::set_permissions(temp.path(), fs::Permissions::from_mode(0o755))?;
        write_scripts(temp.path())?;
        Ok(Self {
            dir: temp.path().to_path_buf(),
            _temp: Some(temp),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl Drop for StagedScripts {
    fn drop(&mut self) {
        for name in [VERSION_SCRIPT, EXTENSIONS_SCRIPT] {
            let path = self.dir.join(name);
            if let Err(e) = fs::remove_file(&path) {
                debug!("Cannot remove {}: {}", path.display(), e);
            }
        }
    }
}

fn write_scripts(dir: &Path) -> io::Result<()> {
    for (name, source) in [
        (VERSION_SCRIPT, VERSION_SOURCE),
        (EXTENSIONS_SCRIPT, EXTENSIONS_SOURCE),
    ] {
        let path = dir.join(name);
        fs::write(&path, source)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644))?;
    }
    Ok(())
}
