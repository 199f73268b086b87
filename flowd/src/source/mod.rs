//! Line-oriented flow source.
//!
//! Reads one flow per line from a file, a named pipe or stdin:
//!
//! ```text
//! <state> <protocol> <src-ip> <src-port> <dst-ip> <dst-port> <experiment-id> <activity-id>
//! ```
//!
//! Blank lines and lines starting with `#` are skipped. Lines that fail to
//! parse are logged and dropped.

use std::path::PathBuf;

use chrono::Utc;
use flowd_common::FlowId;
use tokio::{
    fs::File,
    io::{self, AsyncBufRead, AsyncBufReadExt, BufReader},
    sync::{broadcast, mpsc},
};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("failed to open flow source '{path}': {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to read from flow source: {0}")]
    Read(#[from] io::Error),
}

pub struct LineSource {
    path: Option<PathBuf>,
}

impl LineSource {
    /// Reads from `path`, or stdin when `None`.
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    /// Forwards parsed flows to `tx` until the input ends, the receiver goes
    /// away or shutdown is signalled. Returns the number of flows forwarded.
    pub async fn run(
        self,
        shutdown_rx: broadcast::Receiver<()>,
        tx: mpsc::Sender<FlowId>,
    ) -> Result<u64, SourceError> {
        match self.path {
            Some(path) => {
                let file = File::open(&path).await.map_err(|source| SourceError::Open {
                    path: path.display().to_string(),
                    source,
                })?;
                info!(
                    event.name = "source.opened",
                    source.path = %path.display(),
                    "reading flows from file"
                );
                pump(BufReader::new(file), shutdown_rx, tx).await
            }
            None => {
                info!(event.name = "source.opened", source.path = "-", "reading flows from stdin");
                pump(BufReader::new(io::stdin()), shutdown_rx, tx).await
            }
        }
    }
}

pub async fn pump<R>(
    reader: R,
    mut shutdown_rx: broadcast::Receiver<()>,
    tx: mpsc::Sender<FlowId>,
) -> Result<u64, SourceError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut forwarded = 0u64;

    loop {
        let line = tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                debug!(event.name = "task.stopped", task.name = "source", "flow source shutting down");
                break;
            }
            line = lines.next_line() => line?,
        };

        let Some(line) = line else {
            debug!(event.name = "source.eof", "flow source reached end of input");
            break;
        };

        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let flow = match line.parse::<FlowId>() {
            Ok(flow) => flow.stamp(Utc::now()),
            Err(e) => {
                warn!(
                    event.name = "source.parse_failed",
                    line = line,
                    error.message = %e,
                    "skipping malformed flow line"
                );
                continue;
            }
        };

        if tx.send(flow).await.is_err() {
            debug!(event.name = "source.receiver_closed", "no one is listening for flows anymore");
            break;
        }
        forwarded += 1;
    }

    Ok(forwarded)
}
