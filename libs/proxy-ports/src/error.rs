//! Error types for the proxy port subsystem.

use thiserror::Error;

/// Errors surfaced by proxy port allocation and redirect lifecycle
/// operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// A redirect referenced a listener that was never registered.
    #[error("listener {0:?} not found")]
    ListenerNotFound(String),

    /// No free port in the configured range.
    #[error("no available proxy ports in range [{min}, {max})")]
    AllocationExhausted { min: u16, max: u16 },

    /// A listener name is already registered under a different
    /// `(proxy_type, ingress)` identity.
    #[error("listener {0:?} is already registered with a different identity")]
    AlreadyRegistered(String),

    /// The listener exists but has no configured port to ack.
    #[error("proxy port {0:?} is not configured")]
    NotConfigured(String),

    /// The datapath rejected the redirect rules for a port.
    #[error("failed to install proxy rules for {name:?} on port {port}")]
    RuleInstall {
        name: String,
        port: u16,
        #[source]
        source: anyhow::Error,
    },

    /// Checkpoint file could not be read or written.
    #[error("proxy ports checkpoint failed")]
    Checkpoint(#[source] anyhow::Error),
}
