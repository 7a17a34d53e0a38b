//! fpm-probe - PHP-FPM endpoint discovery
//!
//! Finds the FastCGI endpoint of a running PHP-FPM and reports what a web
//! server or deployment tool needs to know about it:
//! - the listen socket or `host:port`
//! - the user/group running PHP and owning the socket
//! - the PHP version and loaded extensions
//!
//! # Example
//!
//! ```rust,no_run
//! use fpm_probe::php::{self, StagedScripts};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = fpm_probe::detect_fpm_infos()?;
//!     let scripts = StagedScripts::temporary()?;
//!     php::detect_php_infos(&mut config, scripts.dir())?;
//!     println!("{}", config);
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod detect;
pub mod error;
pub mod fastcgi;
pub mod php;

pub use config::ProbeConfig;
pub use detect::{detect_fpm_infos, Detector, FpmConfig, Network};
pub use error::{Error, Result};
pub use php::{detect_php_infos, PhpVersion};

/// fpm-probe version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
