//! Call metrics for the remote accelerator tier.
//!
//! Every probe and lookup against the accelerator is recorded here; the
//! derived health verdict is what the tiered resolver consults before
//! spending a request on that tier.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

/// Average latency above this marks the tier degraded.
pub const DEGRADED_LATENCY_MS: f64 = 2000.0;
/// Error rate above this marks the tier degraded.
pub const DEGRADED_ERROR_RATE: f64 = 0.05;

#[derive(Default)]
struct EndpointStats {
    calls: u64,
    errors: u64,
    latency_sum_ms: u64,
}

#[derive(Default)]
struct MetricsInner {
    success: u64,
    failure: u64,
    latency_sum_ms: u64,
    latency_min_ms: Option<u64>,
    latency_max_ms: u64,
    cache_hits: u64,
    cache_misses: u64,
    error_kinds: HashMap<String, u64>,
    endpoints: HashMap<String, EndpointStats>,
}

/// Running counters behind a mutex; snapshots are recomputed on demand.
#[derive(Default)]
pub struct ResolverMetrics {
    inner: Mutex<MetricsInner>,
}

/// Derived, side-effect-free view of the counters.
#[derive(Clone, Debug, Serialize)]
pub struct MetricsSnapshot {
    pub total_calls: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub min_latency_ms: Option<u64>,
    pub max_latency_ms: u64,
    pub cache_hit_rate: Option<f64>,
    /// Top error kinds by count, at most five.
    pub top_errors: Vec<(String, u64)>,
    /// Per-endpoint average latency, sorted by call volume.
    pub endpoints: Vec<EndpointSnapshot>,
}

#[derive(Clone, Debug, Serialize)]
pub struct EndpointSnapshot {
    pub endpoint: String,
    pub calls: u64,
    pub errors: u64,
    pub avg_latency_ms: f64,
}

impl ResolverMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, endpoint: &str, latency_ms: u64, cache_hit: Option<bool>) {
        let mut inner = self.inner.lock().unwrap();
        inner.success += 1;
        inner.latency_sum_ms += latency_ms;
        inner.latency_min_ms = Some(match inner.latency_min_ms {
            Some(min) => min.min(latency_ms),
            None => latency_ms,
        });
        inner.latency_max_ms = inner.latency_max_ms.max(latency_ms);
        match cache_hit {
            Some(true) => inner.cache_hits += 1,
            Some(false) => inner.cache_misses += 1,
            None => {}
        }
        let stats = inner.endpoints.entry(endpoint.to_string()).or_default();
        stats.calls += 1;
        stats.latency_sum_ms += latency_ms;
    }

    pub fn record_failure(&self, endpoint: &str, error_kind: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.failure += 1;
        *inner.error_kinds.entry(error_kind.to_string()).or_insert(0) += 1;
        let stats = inner.endpoints.entry(endpoint.to_string()).or_default();
        stats.calls += 1;
        stats.errors += 1;
    }

    /// Recompute the derived view. Idempotent, no side effects.
    pub fn summarize(&self) -> MetricsSnapshot {
        let inner = self.inner.lock().unwrap();
        let total = inner.success + inner.failure;
        let error_rate = if total == 0 {
            0.0
        } else {
            inner.failure as f64 / total as f64
        };
        let avg_latency_ms = if inner.success == 0 {
            0.0
        } else {
            inner.latency_sum_ms as f64 / inner.success as f64
        };
        let cache_lookups = inner.cache_hits + inner.cache_misses;
        let cache_hit_rate = if cache_lookups == 0 {
            None
        } else {
            Some(inner.cache_hits as f64 / cache_lookups as f64)
        };

        let mut top_errors: Vec<(String, u64)> = inner
            .error_kinds
            .iter()
            .map(|(kind, count)| (kind.clone(), *count))
            .collect();
        top_errors.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_errors.truncate(5);

        let mut endpoints: Vec<EndpointSnapshot> = inner
            .endpoints
            .iter()
            .map(|(endpoint, stats)| {
                let successes = stats.calls - stats.errors;
                EndpointSnapshot {
                    endpoint: endpoint.clone(),
                    calls: stats.calls,
                    errors: stats.errors,
                    avg_latency_ms: if successes == 0 {
                        0.0
                    } else {
                        stats.latency_sum_ms as f64 / successes as f64
                    },
                }
            })
            .collect();
        endpoints.sort_by(|a, b| b.calls.cmp(&a.calls).then_with(|| a.endpoint.cmp(&b.endpoint)));

        MetricsSnapshot {
            total_calls: total,
            success_count: inner.success,
            failure_count: inner.failure,
            success_rate: if total == 0 { 1.0 } else { inner.success as f64 / total as f64 },
            error_rate,
            avg_latency_ms,
            min_latency_ms: inner.latency_min_ms,
            max_latency_ms: inner.latency_max_ms,
            cache_hit_rate,
            top_errors,
            endpoints,
        }
    }

    /// Health verdict consulted before each accelerator attempt. Recomputed
    /// from scratch every call; there is no open/half-open breaker state.
    pub fn is_degraded(&self) -> bool {
        let snapshot = self.summarize();
        snapshot.avg_latency_ms > DEGRADED_LATENCY_MS || snapshot.error_rate > DEGRADED_ERROR_RATE
    }

    /// Zero all counters, e.g. after a transient outage is resolved.
    pub fn reset(&self) {
        *self.inner.lock().unwrap() = MetricsInner::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_metrics_are_healthy() {
        let metrics = ResolverMetrics::new();
        assert!(!metrics.is_degraded());
        let snapshot = metrics.summarize();
        assert_eq!(snapshot.total_calls, 0);
        assert_eq!(snapshot.error_rate, 0.0);
        assert!(snapshot.min_latency_ms.is_none());
    }

    #[test]
    fn test_latency_min_max_avg() {
        let metrics = ResolverMetrics::new();
        metrics.record_success("search", 100, None);
        metrics.record_success("search", 300, None);
        metrics.record_success("card", 200, None);

        let snapshot = metrics.summarize();
        assert_eq!(snapshot.min_latency_ms, Some(100));
        assert_eq!(snapshot.max_latency_ms, 300);
        assert_eq!(snapshot.avg_latency_ms, 200.0);
    }

    #[test]
    fn test_degraded_on_latency_boundary() {
        let metrics = ResolverMetrics::new();
        metrics.record_success("search", 2000, None);
        // exactly at the threshold is still healthy
        assert!(!metrics.is_degraded());

        metrics.record_success("search", 2002, None);
        assert!(metrics.is_degraded());
    }

    #[test]
    fn test_degraded_on_error_rate_boundary() {
        let metrics = ResolverMetrics::new();
        // 1 failure in 20 calls = exactly 5%: still healthy
        metrics.record_failure("search", "timeout");
        for _ in 0..19 {
            metrics.record_success("search", 10, None);
        }
        assert!(!metrics.is_degraded());

        // 2 failures in 21 calls > 5%: degraded
        metrics.record_failure("search", "timeout");
        assert!(metrics.is_degraded());
    }

    #[test]
    fn test_top_errors_capped_at_five() {
        let metrics = ResolverMetrics::new();
        for (kind, count) in [("a", 1), ("b", 2), ("c", 3), ("d", 4), ("e", 5), ("f", 6)] {
            for _ in 0..count {
                metrics.record_failure("search", kind);
            }
        }
        let snapshot = metrics.summarize();
        assert_eq!(snapshot.top_errors.len(), 5);
        assert_eq!(snapshot.top_errors[0], ("f".to_string(), 6));
        assert_eq!(snapshot.top_errors[4], ("b".to_string(), 2));
    }

    #[test]
    fn test_endpoints_sorted_by_volume() {
        let metrics = ResolverMetrics::new();
        metrics.record_success("card", 10, None);
        metrics.record_success("search", 10, None);
        metrics.record_success("search", 30, None);

        let snapshot = metrics.summarize();
        assert_eq!(snapshot.endpoints[0].endpoint, "search");
        assert_eq!(snapshot.endpoints[0].avg_latency_ms, 20.0);
        assert_eq!(snapshot.endpoints[1].endpoint, "card");
    }

    #[test]
    fn test_cache_hit_rate() {
        let metrics = ResolverMetrics::new();
        metrics.record_success("card", 10, Some(true));
        metrics.record_success("card", 10, Some(true));
        metrics.record_success("card", 10, Some(false));
        metrics.record_success("card", 10, None);

        let snapshot = metrics.summarize();
        assert_eq!(snapshot.cache_hit_rate, Some(2.0 / 3.0));
    }

    #[test]
    fn test_reset_zeroes_everything() {
        let metrics = ResolverMetrics::new();
        metrics.record_success("card", 5000, None);
        metrics.record_failure("card", "http_500");
        assert!(metrics.is_degraded());

        metrics.reset();
        assert!(!metrics.is_degraded());
        let snapshot = metrics.summarize();
        assert_eq!(snapshot.total_calls, 0);
        assert!(snapshot.top_errors.is_empty());
        assert!(snapshot.endpoints.is_empty());
    }
}
