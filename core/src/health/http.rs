//! HTTP GET health probing

use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::{Body, Client, Method, Request, Uri};
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

use super::{Expect, HealthError, Probe};

/// Probe that issues a GET and validates the response against an [`Expect`]
///
/// The whole exchange (connect, headers and, when needed, body) shares one
/// timeout budget.
///
/// ```rust,no_run
/// use portwarden_core::health::{Expect, HttpProbe, Probe};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), portwarden_core::health::HealthError> {
/// let probe = HttpProbe::new("http://127.0.0.1:7100/health", Expect::Any2xx, Duration::from_secs(5))?;
/// probe.check().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpProbe {
    uri: Uri,
    expect: Expect,
    timeout: Duration,
    client: Client<HttpConnector>,
}

impl HttpProbe {
    /// Create a probe; fails if `url` is not a valid URI
    pub fn new(url: &str, expect: Expect, timeout: Duration) -> Result<Self, HealthError> {
        Ok(Self {
            uri: url
                .parse::<Uri>()
                .map_err(|e| HealthError::InvalidUri(format!("{url}: {e}")))?,
            expect,
            timeout,
            client: Client::new(),
        })
    }

    /// Target URI
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Expected response criteria
    pub fn expect(&self) -> &Expect {
        &self.expect
    }

    async fn exchange(&self) -> Result<(), HealthError> {
        let req = Request::builder()
            .method(Method::GET)
            .uri(self.uri.clone())
            .body(Body::empty())
            .map_err(|e| HealthError::Request(e.to_string()))?;

        let response = self.client.request(req).await?;
        let status = response.status().as_u16();
        debug!("HTTP probe {} returned {}", self.uri, status);

        if !self.expect.matches_status(status) {
            return Err(HealthError::UnexpectedStatus(status));
        }
        if self.expect.needs_body() {
            let bytes = hyper::body::to_bytes(response.into_body()).await?;
            if !self.expect.matches_body(&String::from_utf8_lossy(&bytes)) {
                return Err(HealthError::BodyMismatch);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn check(&self) -> Result<(), HealthError> {
        match timeout(self.timeout, self.exchange()).await {
            Ok(result) => result,
            Err(_) => {
                debug!("HTTP probe {} timed out after {:?}", self.uri, self.timeout);
                Err(HealthError::Timeout(self.timeout))
            }
        }
    }
}
