use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("tunnel capacity of {limit} reached")]
    CapacityExceeded { limit: usize },

    #[error("tunnel \"{0}\" already exists")]
    AlreadyExists(String),

    #[error("no free port in range {min}-{max}")]
    PortAllocationFailed { min: u16, max: u16 },

    #[error("failed to bind tunnel listener on port {port}: {source}")]
    ListenerBind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("no pooled connection available, retries exceeded")]
    NoAvailableConnection,

    #[error("no response received before the read deadline")]
    ResponseTimeout,

    #[error("tunnel task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T, E = TunnelError> = std::result::Result<T, E>;
