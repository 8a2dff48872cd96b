//! Daemon library for portwarden
//!
//! `portwardend` is a thin binary over [`bootstrap`]; the same entry points
//! let an embedding application host services without the binary.

pub mod bootstrap;
pub mod error;


pub use bootstrap::{bootstrap, bootstrap_with, load_config, Host, HostOptions};
pub use error::{DaemonError, Result};

/// Resolve once SIGINT or (on unix) SIGTERM arrives
pub async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = term.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
