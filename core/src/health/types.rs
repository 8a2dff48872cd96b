//! Core types and traits for health checking

use super::HealthError;
use async_trait::async_trait;

/// What an HTTP probe accepts as healthy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expect {
    /// Any 2xx status code
    Any2xx,
    /// Exactly this status code
    Status(u16),
    /// Any 2xx status whose body contains this text
    BodyContains(String),
}

impl Expect {
    /// Check if a status code matches this expectation
    pub fn matches_status(&self, status: u16) -> bool {
        match self {
            Expect::Status(expected) => status == *expected,
            Expect::Any2xx | Expect::BodyContains(_) => (200..=299).contains(&status),
        }
    }

    /// Whether the body has to be read to decide
    pub fn needs_body(&self) -> bool {
        matches!(self, Expect::BodyContains(_))
    }

    /// Check if a response body matches this expectation
    pub fn matches_body(&self, body: &str) -> bool {
        match self {
            Expect::BodyContains(expected) => body.contains(expected.as_str()),
            Expect::Any2xx | Expect::Status(_) => true,
        }
    }
}

/// A single bounded check against a running service
#[async_trait]
pub trait Probe: Send + Sync {
    /// Run the check once; `Ok(())` means healthy
    async fn check(&self) -> Result<(), HealthError>;
}
