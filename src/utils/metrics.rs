//! Claim pipeline counters.
//!
//! `ClaimMetrics` is an injectable set of atomic counters, one per
//! orchestrator decision point. A process-wide instance is available via
//! `ClaimMetrics::global()`; tests construct their own.
//!
//! With the `otel` feature every increment is mirrored to an OpenTelemetry
//! counter. Naming follows OTel semantic conventions (dot-separated).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use serde::Serialize;

/// Orchestrator decision points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    Attempt,
    Success,
    Duplicate,
    Replay,
    Conflict,
    Retry,
    Fatal,
}

impl Counter {
    pub const ALL: [Counter; 7] = [
        Counter::Attempt,
        Counter::Success,
        Counter::Duplicate,
        Counter::Replay,
        Counter::Conflict,
        Counter::Retry,
        Counter::Fatal,
    ];

    /// Exported counter name.
    pub fn name(&self) -> &'static str {
        match self {
            Counter::Attempt => "claim_attempt_total",
            Counter::Success => "claim_success_total",
            Counter::Duplicate => "claim_duplicate_total",
            Counter::Replay => "claim_replay_total",
            Counter::Conflict => "claim_conflict_total",
            Counter::Retry => "claim_retry_total",
            Counter::Fatal => "claim_fatal_total",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub claim_attempt_total: u64,
    pub claim_success_total: u64,
    pub claim_duplicate_total: u64,
    pub claim_replay_total: u64,
    pub claim_conflict_total: u64,
    pub claim_retry_total: u64,
    pub claim_fatal_total: u64,
}

static GLOBAL: LazyLock<Arc<ClaimMetrics>> = LazyLock::new(|| Arc::new(ClaimMetrics::new()));

#[derive(Debug, Default)]
pub struct ClaimMetrics {
    counters: [AtomicU64; 7],
}

impl ClaimMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide instance.
    pub fn global() -> Arc<ClaimMetrics> {
        Arc::clone(&GLOBAL)
    }

    pub fn increment(&self, counter: Counter) {
        self.counters[counter.index()].fetch_add(1, Ordering::Relaxed);

        #[cfg(feature = "otel")]
        otel::record(counter);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter.index()].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            claim_attempt_total: self.get(Counter::Attempt),
            claim_success_total: self.get(Counter::Success),
            claim_duplicate_total: self.get(Counter::Duplicate),
            claim_replay_total: self.get(Counter::Replay),
            claim_conflict_total: self.get(Counter::Conflict),
            claim_retry_total: self.get(Counter::Retry),
            claim_fatal_total: self.get(Counter::Fatal),
        }
    }

    pub fn reset(&self) {
        for counter in &self.counters {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(feature = "otel")]
mod otel {
    use std::sync::LazyLock;

    use opentelemetry::metrics::{Counter as OtelCounter, Meter};
    use opentelemetry::{global, KeyValue};

    use super::Counter;

    static METER: LazyLock<Meter> = LazyLock::new(|| global::meter("loyalty"));

    /// Total claim pipeline events, labelled by outcome.
    static CLAIM_TOTAL: LazyLock<OtelCounter<u64>> = LazyLock::new(|| {
        METER
            .u64_counter("loyalty.claim.total")
            .with_description("Claim pipeline events by outcome")
            .build()
    });

    /// Total transient-failure retries.
    static CLAIM_RETRY_TOTAL: LazyLock<OtelCounter<u64>> = LazyLock::new(|| {
        METER
            .u64_counter("loyalty.claim.retry.total")
            .with_description("Total claim transaction retries")
            .build()
    });

    pub(super) fn record(counter: Counter) {
        match counter {
            Counter::Retry => CLAIM_RETRY_TOTAL.add(1, &[]),
            other => CLAIM_TOTAL.add(1, &[outcome_attr(other)]),
        }
    }

    fn outcome_attr(counter: Counter) -> KeyValue {
        let outcome = counter
            .name()
            .trim_start_matches("claim_")
            .trim_end_matches("_total");
        KeyValue::new("outcome", outcome.to_string())
    }
}
