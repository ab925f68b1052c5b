use commonware_runtime::Metrics as RuntimeMetrics;
use prometheus_client::metrics::{counter::Counter, gauge::Gauge};

/// Metrics for the [super::Manager].
#[derive(Clone, Default)]
pub struct Metrics {
    /// Number of requests served by a cached slot.
    pub hits: Counter,

    /// Number of slots backed with fresh pages.
    pub materialized: Counter,

    /// Number of fallback allocations.
    pub fallbacks: Counter,

    /// Number of requests that could not be served at all.
    pub exhausted: Counter,

    /// Number of cached slots evicted.
    pub evicted: Counter,

    /// Number of buffers leaked because their mapping could not be invalidated.
    pub leaked: Counter,

    /// Number of slots currently cached.
    pub cached: Gauge,

    /// Number of live fallback allocations.
    pub fallback_active: Gauge,
}

impl Metrics {
    /// Create and return a new set of metrics, registered with the given context.
    pub fn init<E: RuntimeMetrics>(context: E) -> Self {
        let metrics = Self::default();
        context.register(
            "hits",
            "Number of requests served by a cached slot",
            metrics.hits.clone(),
        );
        context.register(
            "materialized",
            "Number of slots backed with fresh pages",
            metrics.materialized.clone(),
        );
        context.register(
            "fallbacks",
            "Number of fallback allocations",
            metrics.fallbacks.clone(),
        );
        context.register(
            "exhausted",
            "Number of requests that could not be served",
            metrics.exhausted.clone(),
        );
        context.register(
            "evicted",
            "Number of cached slots evicted",
            metrics.evicted.clone(),
        );
        context.register(
            "leaked",
            "Number of buffers leaked because their mapping could not be invalidated",
            metrics.leaked.clone(),
        );
        context.register(
            "cached",
            "Number of slots currently cached",
            metrics.cached.clone(),
        );
        context.register(
            "fallback_active",
            "Number of live fallback allocations",
            metrics.fallback_active.clone(),
        );
        metrics
    }
}
