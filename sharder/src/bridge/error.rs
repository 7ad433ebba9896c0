use std::io;

use super::protocol::{ErrorPayload, RemoteError};

/// Connection-level failures.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("no connected endpoint named {0}")]
    UnknownEndpoint(String),

    #[error("connection to {0} closed")]
    Disconnected(String),

    #[error("unsupported address {0}")]
    Unsupported(String),
}

/// Failure of a typed request: rejected locally, failed remotely, or lost.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("malformed payload: {0}")]
    Decode(#[from] serde_json::Error),
}

impl From<ErrorPayload> for IpcError {
    fn from(p: ErrorPayload) -> Self {
        Self::Remote(p.into())
    }
}
