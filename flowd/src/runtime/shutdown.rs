use std::time::Duration;

use crate::runtime::conf::Conf;

/// Configuration for shutdown behavior.
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time backends get to stop after the shutdown signal before they are abandoned.
    pub timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
        }
    }
}

impl From<&Conf> for ShutdownConfig {
    fn from(conf: &Conf) -> Self {
        Self {
            timeout: conf.shutdown_timeout,
        }
    }
}
