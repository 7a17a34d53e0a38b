//! Error types shared by every detection stage

use std::io;

use thiserror::Error;

use crate::detect::Network;

/// Result type for detection operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Dial to an explicit address failed
    #[error("cannot connect to php-fpm on {network} {address}: {source}")]
    Unreachable {
        network: Network,
        address: String,
        #[source]
        source: io::Error,
    },

    /// No process matched the FPM executable heuristic
    #[error("no running php-fpm process found")]
    ProcessNotFound,

    /// The configuration dump could not be obtained
    #[error("php-fpm configuration dump failed: {0}")]
    Extraction(String),

    /// Every detection strategy was exhausted
    #[error("cannot find any suitable configuration for php-fpm")]
    NotFound {
        #[source]
        cause: Option<Box<Error>>,
    },

    /// Malformed introspection output
    #[error("cannot parse {what}: {message}")]
    Parse { what: &'static str, message: String },

    /// I/O failure while talking FastCGI
    #[error("FastCGI transport error: {0}")]
    Transport(#[from] io::Error),

    /// The peer violated the FastCGI protocol
    #[error("FastCGI protocol error: {0}")]
    Protocol(String),

    /// Account database lookup failed
    #[error("cannot look up account {name}: {source}")]
    Account {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Invalid probe configuration
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

impl Error {
    pub(crate) fn not_found(cause: Option<Error>) -> Self {
        Error::NotFound {
            cause: cause.map(Box::new),
        }
    }

    /// Returns true for the generic "nothing found" outcome
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message_is_stable() {
        let err = Error::not_found(Some(Error::Extraction("exit status: 78".to_string())));
        assert_eq!(
            err.to_string(),
            "cannot find any suitable configuration for php-fpm"
        );
        assert!(err.is_not_found());

        let cause = std::error::Error::source(&err).map(|e| e.to_string());
        assert_eq!(
            cause.as_deref(),
            Some("php-fpm configuration dump failed: exit status: 78")
        );
    }

    #[test]
    fn test_unreachable_keeps_io_source() {
        let err = Error::Unreachable {
            network: Network::Unix,
            address: "/run/php/missing.sock".to_string(),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert!(!err.is_not_found());
        assert!(err.to_string().contains("unix /run/php/missing.sock"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
