//! TCP connect probing

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::trace;

use super::{HealthError, Probe};

/// Probe that succeeds once a TCP connection to `host:port` is established
///
/// The connection is dropped immediately; nothing is written.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpProbe {
    /// Create a new TCP probe
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }

    /// Probe `127.0.0.1:port`
    pub fn loopback(port: u16, timeout: Duration) -> Self {
        Self::new("127.0.0.1", port, timeout)
    }

    /// Get the target address as a string; IPv6 hosts are bracketed
    #[must_use]
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

#[async_trait]
impl Probe for TcpProbe {
    async fn check(&self) -> Result<(), HealthError> {
        let address = self.address();
        match timeout(self.timeout, TcpStream::connect(&address)).await {
            Ok(Ok(_stream)) => {
                trace!("TCP probe to {} connected", address);
                Ok(())
            }
            Ok(Err(e)) => {
                trace!("TCP probe to {} failed: {}", address, e);
                Err(HealthError::Tcp(e))
            }
            Err(_) => Err(HealthError::Timeout(self.timeout)),
        }
    }
}
