//! Firefly backend.
//!
//! Turns every flow it receives into a firefly: a JSON document describing
//! the flow, optionally wrapped in a syslog header and enriched with route
//! context, sent as a single UDP datagram. Each step runs in order in the
//! processing loop, one flow at a time. Route lookups run on the blocking
//! pool and are bounded by the provider's reply deadline.

use std::{fmt, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use flowd_common::FlowId;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, trace, warn};

use crate::{
    backend::{Backend, BackendState},
    error::BackendError,
    netlink::{ContextProvider, NetlinkContext, NetlinkError, RouteContextProvider},
    runtime::conf::FireflyConf,
};

pub mod payload;
pub mod stats;
pub mod syslog;
pub mod transmit;

pub use payload::{EncodeError, FireflyEncoder};
pub use stats::{FireflyOutcome, FireflyStats, FireflyStatsSnapshot};
pub use syslog::SyslogWrapper;
pub use transmit::{Transmit, TransmitError, UdpTransmitter};

const NAME: &str = "Firefly";

type OpenContextProvider = fn() -> Result<Arc<dyn ContextProvider>, NetlinkError>;

fn open_route_provider() -> Result<Arc<dyn ContextProvider>, NetlinkError> {
    Ok(Arc::new(RouteContextProvider::new()?))
}

pub struct FireflyBackend {
    conf: FireflyConf,
    state: BackendState,
    encoder: FireflyEncoder,
    syslog: SyslogWrapper,
    transmitter: Option<Box<dyn Transmit>>,
    context_provider: Option<Arc<dyn ContextProvider>>,
    open_context_provider: OpenContextProvider,
    stats: Arc<FireflyStats>,
}

impl FireflyBackend {
    pub fn new(conf: FireflyConf) -> Result<Self, BackendError> {
        let stats = FireflyStats::new().map_err(|source| BackendError::Metrics {
            backend: NAME,
            source,
        })?;
        let syslog = SyslogWrapper::new(conf.prepend_syslog);

        Ok(Self {
            conf,
            state: BackendState::Uninitialized,
            encoder: FireflyEncoder::default(),
            syslog,
            transmitter: None,
            context_provider: None,
            open_context_provider: open_route_provider,
            stats: Arc::new(stats),
        })
    }

    /// Uses `transmitter` instead of opening UDP sockets in `init`.
    pub fn with_transmitter(mut self, transmitter: Box<dyn Transmit>) -> Self {
        self.transmitter = Some(transmitter);
        self
    }

    /// Uses `provider` instead of opening an rtnetlink socket in `init`.
    /// Ignored when netlink context is disabled.
    pub fn with_context_provider(mut self, provider: Box<dyn ContextProvider>) -> Self {
        self.context_provider = Some(Arc::from(provider));
        self
    }

    pub fn with_encoder(mut self, encoder: FireflyEncoder) -> Self {
        self.encoder = encoder;
        self
    }

    /// Overrides the syslog envelope. Its enabled flag still follows
    /// `prepend_syslog`.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.syslog = SyslogWrapper::with_hostname(self.conf.prepend_syslog, hostname);
        self
    }

    pub fn conf(&self) -> &FireflyConf {
        &self.conf
    }

    pub fn state(&self) -> BackendState {
        self.state
    }

    pub fn stats(&self) -> Arc<FireflyStats> {
        Arc::clone(&self.stats)
    }

    fn destination(&self, flow: &FlowId) -> SocketAddr {
        let ip = self.conf.collector_address.unwrap_or_else(|| flow.dst.ip());
        SocketAddr::new(ip, self.conf.destination_port)
    }

    async fn enrich(&self, flow: &FlowId) -> Option<NetlinkContext> {
        let provider = Arc::clone(self.context_provider.as_ref()?);
        let lookup_flow = flow.clone();

        let result = match tokio::task::spawn_blocking(move || provider.lookup(&lookup_flow)).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match result {
            Ok(ctx) => Some(ctx),
            Err(e) => {
                self.stats.inc(FireflyOutcome::EnrichmentMiss);
                warn!(
                    event.name = "firefly.enrichment_failed",
                    flow = %flow,
                    error.message = %e,
                    "netlink context unavailable, sending firefly without it"
                );
                None
            }
        }
    }

    async fn process(&self, flow: FlowId) {
        self.stats.inc(FireflyOutcome::Received);
        trace!(event.name = "firefly.flow_received", flow = %flow, "got a flow");

        let now = Utc::now();
        let netlink = self.enrich(&flow).await;

        let payload = match self.encoder.encode(&flow, netlink.as_ref(), now) {
            Ok(payload) => payload,
            Err(e) => {
                self.stats.inc(FireflyOutcome::EncodeFailure);
                error!(
                    event.name = "firefly.encode_failed",
                    flow = %flow,
                    error.message = %e,
                    "dropping flow that could not be encoded"
                );
                return;
            }
        };
        let datagram = self.syslog.wrap(payload, now);

        let Some(transmitter) = self.transmitter.as_deref() else {
            self.stats.inc(FireflyOutcome::SendFailure);
            error!(
                event.name = "firefly.send_failed",
                flow = %flow,
                "no transmitter available, dropping firefly"
            );
            return;
        };

        let dst = self.destination(&flow);
        match transmitter.send(&datagram, dst).await {
            Ok(bytes) => {
                self.stats.inc(FireflyOutcome::Sent);
                debug!(
                    event.name = "firefly.sent",
                    flow = %flow,
                    destination = %dst,
                    bytes = bytes,
                    "firefly sent"
                );
            }
            Err(e) => {
                self.stats.inc(FireflyOutcome::SendFailure);
                error!(
                    event.name = "firefly.send_failed",
                    flow = %flow,
                    destination = %dst,
                    error.message = %e,
                    "error sending the firefly"
                );
            }
        }
    }
}

impl fmt::Display for FireflyBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(NAME)
    }
}

#[async_trait]
impl Backend for FireflyBackend {
    async fn init(&mut self) -> Result<(), BackendError> {
        if self.state != BackendState::Uninitialized {
            return Err(BackendError::InvalidState {
                backend: NAME,
                operation: "init",
                state: self.state.as_str(),
            });
        }

        debug!(
            event.name = "firefly.init",
            destination_port = self.conf.destination_port,
            prepend_syslog = self.conf.prepend_syslog,
            add_netlink_context = self.conf.add_netlink_context,
            collector_address = ?self.conf.collector_address,
            "initialising the firefly backend"
        );

        if self.transmitter.is_none() {
            self.transmitter = Some(Box::new(UdpTransmitter::bind().await?));
        }

        if !self.conf.add_netlink_context {
            self.context_provider = None;
        } else if self.context_provider.is_none() {
            match (self.open_context_provider)() {
                Ok(provider) => self.context_provider = Some(provider),
                Err(e) => warn!(
                    event.name = "firefly.netlink_unavailable",
                    error.message = %e,
                    "could not open netlink socket, fireflies will carry no netlink context"
                ),
            }
        }

        self.state = BackendState::Ready;
        Ok(())
    }

    async fn run(
        &mut self,
        mut shutdown_rx: broadcast::Receiver<()>,
        mut flows: mpsc::Receiver<FlowId>,
    ) {
        if self.state != BackendState::Ready {
            error!(
                event.name = "firefly.run_rejected",
                state = %self.state,
                "firefly backend can only run once, after a successful init"
            );
            return;
        }

        self.state = BackendState::Running;
        debug!(event.name = "task.started", task.name = "firefly", "running the firefly backend");

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    debug!(
                        event.name = "task.stopped",
                        task.name = "firefly",
                        "cleanly exiting the firefly backend"
                    );
                    break;
                }
                flow = flows.recv() => match flow {
                    Some(flow) => self.process(flow).await,
                    None => {
                        warn!(
                            event.name = "firefly.input_closed",
                            "somebody closed the input channel"
                        );
                        break;
                    }
                },
            }
        }

        self.state = BackendState::Stopped;

        let stats = self.stats.snapshot();
        info!(
            event.name = "firefly.stopped",
            flows.received = stats.received,
            fireflies.sent = stats.sent,
            encode_failures = stats.encode_failures,
            send_failures = stats.send_failures,
            enrichment_misses = stats.enrichment_misses,
            "firefly backend stopped"
        );
    }

    async fn cleanup(&mut self) -> Result<(), BackendError> {
        debug!(event.name = "firefly.cleanup", state = %self.state, "cleaning up the firefly backend");

        // `run` holds `&mut self`, so `Running` here means its future was dropped.
        if self.state == BackendState::Running {
            warn!(
                event.name = "firefly.run_cancelled",
                "firefly loop was cancelled before it stopped, releasing its sockets anyway"
            );
        }

        // Dropping the transmitter and provider closes their sockets.
        self.transmitter = None;
        self.context_provider = None;
        self.state = BackendState::Terminated;
        Ok(())
    }
}
