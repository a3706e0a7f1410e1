use thiserror::Error;

/// Error taxonomy for the supervisor.
///
/// Configuration and Startup errors are fatal and surface at process entry;
/// the remaining variants are recoverable at a higher level (a failed resume
/// falls back to stop-then-start, a failed connection handler only closes
/// that one client).
#[derive(Debug, Error)]
pub enum VirbyError {
    /// Invalid or missing configuration. Never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Unable to spawn vfkit, acquire the activation socket, or find the
    /// working directory.
    #[error("startup error: {0}")]
    Startup(String),

    /// Hypervisor REST failure, violated state precondition, VM death during
    /// discovery, or an open circuit breaker.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// The DHCP lease database could not be parsed.
    #[error("IP discovery error: {0}")]
    IpDiscovery(String),

    /// The guest's sshd did not become reachable within budget.
    #[error("SSH connectivity error: {0}")]
    SshConnectivity(String),
}

pub type Result<T> = std::result::Result<T, VirbyError>;
