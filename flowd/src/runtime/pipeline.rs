//! Fans flow identifiers out to every registered backend.
//!
//! Each backend gets its own bounded channel and runs on its own task, so a
//! slow backend only delays itself (and, once its channel is full, the
//! fan-out). Backends are cleaned up after their `run` returns.

use flowd_common::FlowId;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{backend::Backend, error::BackendError};

pub struct Pipeline {
    backends: Vec<Box<dyn Backend>>,
    channel_capacity: usize,
}

impl Pipeline {
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            backends: Vec::new(),
            channel_capacity: channel_capacity.max(1),
        }
    }

    pub fn register(&mut self, backend: Box<dyn Backend>) {
        debug!(
            event.name = "pipeline.backend_registered",
            backend.name = %backend,
            "registered backend"
        );
        self.backends.push(backend);
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Initialises every backend in registration order. On the first failure
    /// the backends initialised so far are cleaned up and the error returned.
    pub async fn init(&mut self) -> Result<(), BackendError> {
        for i in 0..self.backends.len() {
            if let Err(e) = self.backends[i].init().await {
                error!(
                    event.name = "pipeline.backend_init_failed",
                    backend.name = %self.backends[i],
                    error.message = %e,
                    "failed to initialise backend"
                );
                for backend in self.backends[..i].iter_mut() {
                    if let Err(e) = backend.cleanup().await {
                        warn!(
                            event.name = "pipeline.backend_cleanup_failed",
                            backend.name = %backend,
                            error.message = %e,
                            "failed to clean up backend after init failure"
                        );
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Spawns one task per backend plus the fan-out task feeding them.
    pub fn start(
        self,
        shutdown_tx: &broadcast::Sender<()>,
        flows: mpsc::Receiver<FlowId>,
    ) -> RunningPipeline {
        let mut senders = Vec::with_capacity(self.backends.len());
        let mut handles = Vec::with_capacity(self.backends.len());

        for mut backend in self.backends {
            let (tx, rx) = mpsc::channel(self.channel_capacity);
            let shutdown_rx = shutdown_tx.subscribe();
            let name = backend.to_string();
            senders.push(tx);
            handles.push((
                name,
                tokio::spawn(async move {
                    backend.run(shutdown_rx, rx).await;
                    backend
                }),
            ));
        }

        let fan_out = tokio::spawn(fan_out(flows, senders, shutdown_tx.subscribe()));

        RunningPipeline { fan_out, handles }
    }
}

async fn fan_out(
    mut flows: mpsc::Receiver<FlowId>,
    senders: Vec<mpsc::Sender<FlowId>>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            flow = flows.recv() => match flow {
                Some(flow) => {
                    for tx in &senders {
                        if tx.send(flow.clone()).await.is_err() {
                            debug!(
                                event.name = "pipeline.backend_gone",
                                "backend stopped accepting flows"
                            );
                        }
                    }
                }
                None => break,
            },
        }
    }
    // Dropping the senders closes every backend's input.
}

/// Handle on a started pipeline.
pub struct RunningPipeline {
    fan_out: JoinHandle<()>,
    handles: Vec<(String, JoinHandle<Box<dyn Backend>>)>,
}

/// Outcome of [`RunningPipeline::join`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub backends_stopped: usize,
    pub backends_failed: usize,
    pub cleanup_failures: usize,
}

impl RunningPipeline {
    /// Waits for every backend to return from `run`, then cleans each up.
    pub async fn join(self) -> PipelineReport {
        let mut report = PipelineReport::default();

        for (name, handle) in self.handles {
            match handle.await {
                Ok(mut backend) => {
                    report.backends_stopped += 1;
                    if let Err(e) = backend.cleanup().await {
                        report.cleanup_failures += 1;
                        warn!(
                            event.name = "pipeline.backend_cleanup_failed",
                            backend.name = %name,
                            error.message = %e,
                            "failed to clean up backend"
                        );
                    }
                }
                Err(e) => {
                    report.backends_failed += 1;
                    error!(
                        event.name = "pipeline.backend_panicked",
                        backend.name = %name,
                        error.message = %e,
                        "backend task did not complete"
                    );
                }
            }
        }

        if let Err(e) = self.fan_out.await {
            error!(
                event.name = "pipeline.fan_out_failed",
                error.message = %e,
                "fan-out task did not complete"
            );
        }

        info!(
            event.name = "pipeline.stopped",
            backends_stopped = report.backends_stopped,
            backends_failed = report.backends_failed,
            cleanup_failures = report.cleanup_failures,
            "pipeline stopped"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fmt,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use async_trait::async_trait;

    use super::*;

    #[derive(Default)]
    struct Counters {
        inits: AtomicUsize,
        flows: AtomicUsize,
        cleanups: AtomicUsize,
    }

    struct Counting {
        counters: Arc<Counters>,
        fail_init: bool,
    }

    impl fmt::Display for Counting {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("Counting")
        }
    }

    #[async_trait]
    impl Backend for Counting {
        async fn init(&mut self) -> Result<(), BackendError> {
            self.counters.inits.fetch_add(1, Ordering::SeqCst);
            if self.fail_init {
                return Err(BackendError::InvalidState {
                    backend: "Counting",
                    operation: "init",
                    state: "broken",
                });
            }
            Ok(())
        }

        async fn run(
            &mut self,
            mut shutdown_rx: broadcast::Receiver<()>,
            mut flows: mpsc::Receiver<FlowId>,
        ) {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    flow = flows.recv() => match flow {
                        Some(_) => { self.counters.flows.fetch_add(1, Ordering::SeqCst); }
                        None => break,
                    },
                }
            }
        }

        async fn cleanup(&mut self) -> Result<(), BackendError> {
            self.counters.cleanups.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counting(counters: &Arc<Counters>, fail_init: bool) -> Box<dyn Backend> {
        Box::new(Counting {
            counters: Arc::clone(counters),
            fail_init,
        })
    }

    fn flow() -> FlowId {
        "start tcp 10.0.0.1 1 10.0.0.2 2 1 1".parse().unwrap()
    }

    #[tokio::test]
    async fn every_backend_sees_every_flow() {
        let a = Arc::new(Counters::default());
        let b = Arc::new(Counters::default());
        let mut pipeline = Pipeline::new(4);
        pipeline.register(counting(&a, false));
        pipeline.register(counting(&b, false));
        assert_eq!(pipeline.len(), 2);
        pipeline.init().await.unwrap();

        let (shutdown_tx, _) = broadcast::channel(1);
        let (flow_tx, flow_rx) = mpsc::channel(4);
        let running = pipeline.start(&shutdown_tx, flow_rx);

        for _ in 0..3 {
            flow_tx.send(flow()).await.unwrap();
        }
        drop(flow_tx);

        let report = tokio::time::timeout(Duration::from_secs(5), running.join())
            .await
            .expect("pipeline should stop once input is closed");

        assert_eq!(report.backends_stopped, 2);
        assert_eq!(report.cleanup_failures, 0);
        for counters in [&a, &b] {
            assert_eq!(counters.flows.load(Ordering::SeqCst), 3);
            assert_eq!(counters.cleanups.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn shutdown_stops_backends_with_open_input() {
        let a = Arc::new(Counters::default());
        let mut pipeline = Pipeline::new(4);
        pipeline.register(counting(&a, false));
        pipeline.init().await.unwrap();

        let (shutdown_tx, _) = broadcast::channel(1);
        let (_flow_tx, flow_rx) = mpsc::channel(4);
        let running = pipeline.start(&shutdown_tx, flow_rx);

        shutdown_tx.send(()).unwrap();
        let report = tokio::time::timeout(Duration::from_secs(5), running.join())
            .await
            .expect("pipeline should stop on shutdown");
        assert_eq!(report.backends_stopped, 1);
    }

    #[tokio::test]
    async fn init_failure_cleans_up_earlier_backends() {
        let ok = Arc::new(Counters::default());
        let broken = Arc::new(Counters::default());
        let never = Arc::new(Counters::default());
        let mut pipeline = Pipeline::new(1);
        pipeline.register(counting(&ok, false));
        pipeline.register(counting(&broken, true));
        pipeline.register(counting(&never, false));

        assert!(pipeline.init().await.is_err());
        assert_eq!(ok.cleanups.load(Ordering::SeqCst), 1);
        assert_eq!(broken.cleanups.load(Ordering::SeqCst), 0);
        assert_eq!(never.inits.load(Ordering::SeqCst), 0);
    }
}
