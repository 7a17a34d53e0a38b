//! Reachability probing of FastCGI endpoints

use std::time::Duration;

use tracing::{debug, info};

use super::FpmConfig;
use crate::config::Candidate;
use crate::error::{Error, Result};
use crate::fastcgi::Client;

/// Dials either the endpoint already set on a config or, failing that,
/// each entry of a candidate table in order.
pub struct Prober<'a> {
    candidates: &'a [Candidate],
    timeout: Duration,
}

impl<'a> Prober<'a> {
    pub fn new(candidates: &'a [Candidate], timeout: Duration) -> Self {
        Self {
            candidates,
            timeout,
        }
    }

    /// Check that `config` points at a live endpoint.
    ///
    /// With an address set, exactly that endpoint is dialed once and a
    /// failure is returned as [`Error::Unreachable`]. Without one, the first
    /// reachable candidate is written into `config`; when none answers the
    /// config is left empty and `Ok` is returned.
    pub fn probe(&self, config: &mut FpmConfig) -> Result<()> {
        if let Some((network, address)) = config.endpoint() {
            return match Client::dial(network, address, self.timeout) {
                Ok(client) => {
                    info!("Successfully connected to {} {}", network, address);
                    client.close();
                    Ok(())
                }
                Err(source) => Err(Error::Unreachable {
                    network,
                    address: address.to_string(),
                    source,
                }),
            };
        }

        for candidate in self.candidates {
            match Client::dial(candidate.network, &candidate.address, self.timeout) {
                Ok(client) => {
                    client.close();
                    config.listen_address = candidate.address.clone();
                    config.listen_network = Some(candidate.network);
                    info!(
                        "Successfully connected to {} {}",
                        candidate.network, candidate.address
                    );
                    return Ok(());
                }
                Err(e) => debug!(
                    "No php-fpm on {} {}: {}",
                    candidate.network, candidate.address, e
                ),
            }
        }

        Ok(())
    }
}
