//! Prometheus counters for the firefly processing loop.
//!
//! Each backend owns its own [`Registry`] so several backends (and tests)
//! never share counters.

use prometheus::{IntCounterVec, Opts, Registry};

/// Values of the `outcome` label on `flowd_firefly_events_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireflyOutcome {
    Received,
    Sent,
    EncodeFailure,
    SendFailure,
    EnrichmentMiss,
}

impl FireflyOutcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            FireflyOutcome::Received => "received",
            FireflyOutcome::Sent => "sent",
            FireflyOutcome::EncodeFailure => "encode_failure",
            FireflyOutcome::SendFailure => "send_failure",
            FireflyOutcome::EnrichmentMiss => "enrichment_miss",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FireflyStats {
    registry: Registry,
    events: IntCounterVec,
}

/// Point-in-time copy of [`FireflyStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FireflyStatsSnapshot {
    pub received: u64,
    pub sent: u64,
    pub encode_failures: u64,
    pub send_failures: u64,
    pub enrichment_misses: u64,
}

impl FireflyStats {
    pub fn new() -> Result<Self, prometheus::Error> {
        let events = IntCounterVec::new(
            Opts::new("events_total", "Flows handled by the firefly backend, by outcome")
                .namespace("flowd")
                .subsystem("firefly"),
            &["outcome"],
        )?;

        let registry = Registry::new();
        registry.register(Box::new(events.clone()))?;

        Ok(Self { registry, events })
    }

    /// Registry holding this backend's counters, for scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn inc(&self, outcome: FireflyOutcome) {
        self.events.with_label_values(&[outcome.as_str()]).inc();
    }

    fn get(&self, outcome: FireflyOutcome) -> u64 {
        self.events.with_label_values(&[outcome.as_str()]).get()
    }

    pub fn snapshot(&self) -> FireflyStatsSnapshot {
        FireflyStatsSnapshot {
            received: self.get(FireflyOutcome::Received),
            sent: self.get(FireflyOutcome::Sent),
            encode_failures: self.get(FireflyOutcome::EncodeFailure),
            send_failures: self.get(FireflyOutcome::SendFailure),
            enrichment_misses: self.get(FireflyOutcome::EnrichmentMiss),
        }
    }
}
