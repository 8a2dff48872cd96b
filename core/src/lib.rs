//! Core functionality for portwarden
//!
//! This crate holds the local process host: the per-service supervisor, port
//! allocation, the orphan-sweeping pid ledger, the terminal-server manager
//! and the configuration they share. The `portwardend` daemon wires them
//! together; embedding applications can do the same.

pub mod config;
pub mod error;
pub mod health;
pub mod ledger;
pub mod poll;
pub mod port;
pub mod process;
pub mod supervisor;
pub mod terminal;


// Re-export schema types for convenience
pub use schema::*;

pub use config::{HostConfig, SupervisorSettings, TerminalSettings};
pub use error::{CoreError, Result};
pub use ledger::OrphanTracker;
pub use port::PortAllocator;
pub use supervisor::{ProcessSupervisor, SupervisorHandle};
pub use terminal::TerminalServerManager;

/// Core utilities and helper functions
pub mod utils {
    use tracing::info;

    /// Initialize tracing for the application
    ///
    /// `RUST_LOG` wins over `level` when set.
    pub fn init_tracing(level: &str) -> crate::Result<()> {
        use tracing_subscriber::{fmt, EnvFilter};

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
            .map_err(|e| crate::CoreError::InitializationError(e.to_string()))?;

        info!("Tracing initialized with level: {}", level);
        Ok(())
    }
}
