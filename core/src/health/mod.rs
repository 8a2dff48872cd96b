//! Health and readiness probes
//!
//! The supervisor uses these in two places:
//!
//! - [`TcpProbe`] backs port readiness: a port counts as bound once a
//!   loopback connect succeeds.
//! - [`HttpProbe`] backs periodic liveness checks against a service's
//!   `healthCheckUrl` (after `{port}` substitution). Any 2xx is healthy
//!   unless another [`Expect`] is configured.
//!
//! Every probe carries its own timeout; a probe never waits longer than that.

pub mod error;
pub mod http;
pub mod tcp;
pub mod types;

#[cfg(test)]
pub(crate) mod test_server;

pub use error::HealthError;
pub use http::HttpProbe;
pub use tcp::TcpProbe;
pub use types::{Expect, Probe};

use std::time::Duration;

/// Issue one bounded GET against `url`, accepting any 2xx
pub async fn check_url(url: &str, timeout: Duration) -> Result<(), HealthError> {
    HttpProbe::new(url, Expect::Any2xx, timeout)?.check().await
}
