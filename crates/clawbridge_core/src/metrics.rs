//! OpenTelemetry instruments for gateway decisions.
//!
//! Instruments come from `opentelemetry::global::meter`, so they report to
//! whatever provider [`init_observability`](crate::init_observability)
//! installed. Without the `metrics` feature every method is a no-op.

use crate::AuditResult;
#[cfg(feature = "metrics")]
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Meter},
};
use std::sync::OnceLock;
use tracing::debug;

/// Counters describing what the gateway decided and what it lost.
#[derive(Clone)]
pub struct GatewayMetrics {
    #[cfg(feature = "metrics")]
    _meter: Meter,
    /// Mediated decisions, labelled by `result`
    #[cfg(feature = "metrics")]
    decisions: Counter<u64>,
    /// Audit records that failed to reach disk
    #[cfg(feature = "metrics")]
    audit_write_failures: Counter<u64>,
    /// Audit records dropped while recording was disabled
    #[cfg(feature = "metrics")]
    audit_skipped: Counter<u64>,
    /// Event streams closed by the gateway, labelled by `reason`
    #[cfg(feature = "metrics")]
    streams_closed: Counter<u64>,
}

impl std::fmt::Debug for GatewayMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayMetrics").finish_non_exhaustive()
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayMetrics {
    /// Instruments on the global `clawbridge` meter.
    pub fn new() -> Self {
        #[cfg(feature = "metrics")]
        {
            debug!("Getting global meter for clawbridge");
            Self::from_meter(global::meter("clawbridge"))
        }
        #[cfg(not(feature = "metrics"))]
        {
            debug!("Metrics feature disabled; gateway counters are no-ops");
            Self {}
        }
    }

    /// Instruments on a caller-supplied meter.
    #[cfg(feature = "metrics")]
    pub fn from_meter(meter: Meter) -> Self {
        let decisions = meter
            .u64_counter("clawbridge.decisions")
            .with_description("Mediated decisions by result")
            .build();
        let audit_write_failures = meter
            .u64_counter("clawbridge.audit.write_failures")
            .with_description("Audit records that failed to reach disk")
            .build();
        let audit_skipped = meter
            .u64_counter("clawbridge.audit.skipped")
            .with_description("Audit records dropped while recording was disabled")
            .build();
        let streams_closed = meter
            .u64_counter("clawbridge.streams.closed")
            .with_description("Event streams closed by the gateway")
            .build();
        debug!("GatewayMetrics instruments created");
        Self {
            _meter: meter,
            decisions,
            audit_write_failures,
            audit_skipped,
            streams_closed,
        }
    }

    /// Count one mediated decision.
    pub fn decision(&self, result: AuditResult) {
        #[cfg(feature = "metrics")]
        self.decisions.add(1, &[KeyValue::new("result", result.to_string())]);
        #[cfg(not(feature = "metrics"))]
        let _ = result;
    }

    /// Count one failed audit write.
    pub fn audit_write_failed(&self) {
        #[cfg(feature = "metrics")]
        self.audit_write_failures.add(1, &[]);
    }

    /// Count one audit record dropped while recording was disabled.
    pub fn audit_skipped(&self) {
        #[cfg(feature = "metrics")]
        self.audit_skipped.add(1, &[]);
    }

    /// Count event streams the gateway closed, e.g. `slow_consumer` or `revoked`.
    pub fn streams_closed(&self, reason: &'static str, count: u64) {
        #[cfg(feature = "metrics")]
        {
            if count > 0 {
                self.streams_closed.add(count, &[KeyValue::new("reason", reason)]);
            }
        }
        #[cfg(not(feature = "metrics"))]
        let _ = (reason, count);
    }
}

/// Process-wide instruments, built on first use.
///
/// Call [`init_observability`](crate::init_observability) before the first
/// use so the instruments bind to the installed provider.
pub fn gateway_metrics() -> &'static GatewayMetrics {
    static METRICS: OnceLock<GatewayMetrics> = OnceLock::new();
    METRICS.get_or_init(GatewayMetrics::new)
}
