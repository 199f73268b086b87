//! Error types shared by flowd backends.

use std::io;

use thiserror::Error;

/// Errors surfaced by the backend lifecycle (`init` / `cleanup`).
///
/// Per-event failures never show up here; the processing loop logs them and
/// moves on to the next flow.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The outbound socket could not be opened.
    #[error("failed to bind {backend} socket to {address}: {source}")]
    BindSocket {
        backend: &'static str,
        address: String,
        #[source]
        source: io::Error,
    },

    /// A lifecycle operation was invoked in the wrong state.
    #[error("{backend} backend cannot {operation} while {state}")]
    InvalidState {
        backend: &'static str,
        operation: &'static str,
        state: &'static str,
    },

    /// The backend's metrics could not be created or registered.
    #[error("failed to set up {backend} metrics: {source}")]
    Metrics {
        backend: &'static str,
        #[source]
        source: prometheus::Error,
    },
}

impl BackendError {
    pub fn bind_socket(backend: &'static str, address: impl Into<String>, source: io::Error) -> Self {
        Self::BindSocket {
            backend,
            address: address.into(),
            source,
        }
    }
}
