//! Plugin contract implemented by every flowd backend.

use std::fmt;

use async_trait::async_trait;
use flowd_common::FlowId;
use tokio::sync::{broadcast, mpsc};

use crate::error::BackendError;

/// A pluggable consumer of flow events.
///
/// The pipeline drives a backend through `init` → `run` → `cleanup`. The
/// `Display` implementation provides the backend's name for logs.
#[async_trait]
pub trait Backend: fmt::Display + Send {
    /// Acquires the resources the backend needs. A failure here is fatal and
    /// must be handled before `run` is called.
    async fn init(&mut self) -> Result<(), BackendError>;

    /// Consumes flows until `flows` is closed by its producer or a shutdown
    /// signal is received. Per-event failures are logged, never returned.
    async fn run(&mut self, shutdown_rx: broadcast::Receiver<()>, flows: mpsc::Receiver<FlowId>);

    /// Releases whatever `init` acquired. Calling it more than once is fine.
    async fn cleanup(&mut self) -> Result<(), BackendError>;
}

/// Lifecycle of a backend instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Uninitialized,
    Ready,
    Running,
    Stopped,
    Terminated,
}

impl BackendState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendState::Uninitialized => "uninitialized",
            BackendState::Ready => "ready",
            BackendState::Running => "running",
            BackendState::Stopped => "stopped",
            BackendState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
