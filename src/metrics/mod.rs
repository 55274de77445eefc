//! Metrics collection for observability

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec_with_registry, register_counter_with_registry,
    register_histogram_with_registry, Counter, CounterVec, Histogram, Opts, Registry,
};
use std::sync::Arc;

/// Global metrics registry
pub static METRICS: Lazy<Arc<Metrics>> =
    Lazy::new(|| Arc::new(Metrics::new().expect("Failed to initialize metrics")));

/// Metrics collector
pub struct Metrics {
    registry: Registry,

    // Build metrics
    pub build_duration: Histogram,
    pub build_tokens: Histogram,
    pub builds_compacted: Counter,

    // Collection metrics
    pub source_failures: CounterVec,

    // Compaction metrics
    pub compaction_dropped: Counter,
    pub compaction_truncated: Counter,
    pub compaction_summarized: Counter,

    // Token accounting metrics
    pub token_cache_hits: Counter,
    pub token_cache_misses: Counter,
    pub tokenizer_fallbacks: Counter,

    // Shared pool metrics
    pub pool_writes: Counter,
    pub pool_conflicts: Counter,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let build_duration = register_histogram_with_registry!(
            "context_build_duration_seconds",
            "Context build duration in seconds",
            registry
        )?;

        let build_tokens = register_histogram_with_registry!(
            "context_build_tokens",
            "Tokens in the emitted context per build",
            vec![256.0, 1024.0, 4096.0, 16384.0, 65536.0, 262144.0],
            registry
        )?;

        let builds_compacted = register_counter_with_registry!(
            Opts::new("context_builds_compacted_total", "Builds that required compaction"),
            registry
        )?;

        let source_failures = register_counter_vec_with_registry!(
            Opts::new("context_source_failures_total", "Context source collection failures"),
            &["source"],
            registry
        )?;

        let compaction_dropped = register_counter_with_registry!(
            Opts::new("compaction_dropped_blocks_total", "Blocks dropped during compaction"),
            registry
        )?;

        let compaction_truncated = register_counter_with_registry!(
            Opts::new("compaction_truncated_blocks_total", "Blocks truncated during compaction"),
            registry
        )?;

        let compaction_summarized = register_counter_with_registry!(
            Opts::new("compaction_summarized_blocks_total", "Blocks summarized during compaction"),
            registry
        )?;

        let token_cache_hits = register_counter_with_registry!(
            Opts::new("token_cache_hits_total", "Token count cache hits"),
            registry
        )?;

        let token_cache_misses = register_counter_with_registry!(
            Opts::new("token_cache_misses_total", "Token count cache misses"),
            registry
        )?;

        let tokenizer_fallbacks = register_counter_with_registry!(
            Opts::new("tokenizer_fallbacks_total", "Counts served by the estimation fallback"),
            registry
        )?;

        let pool_writes = register_counter_with_registry!(
            Opts::new("shared_pool_writes_total", "Committed shared pool writes"),
            registry
        )?;

        let pool_conflicts = register_counter_with_registry!(
            Opts::new("shared_pool_conflicts_total", "Rejected shared pool writes"),
            registry
        )?;

        Ok(Self {
            registry,
            build_duration,
            build_tokens,
            builds_compacted,
            source_failures,
            compaction_dropped,
            compaction_truncated,
            compaction_summarized,
            token_cache_hits,
            token_cache_misses,
            tokenizer_fallbacks,
            pool_writes,
            pool_conflicts,
        })
    }

    /// Record a source failure
    pub fn record_source_failure(&self, source: &str) {
        self.source_failures.with_label_values(&[source]).inc();
    }

    /// Record one finished build
    pub fn record_build(&self, seconds: f64, tokens: usize, compacted: bool) {
        self.build_duration.observe(seconds);
        self.build_tokens.observe(tokens as f64);
        if compacted {
            self.builds_compacted.inc();
        }
    }

    /// Record the outcome of one compaction pass
    pub fn record_compaction(&self, dropped: usize, truncated: usize, summarized: usize) {
        self.compaction_dropped.inc_by(dropped as f64);
        self.compaction_truncated.inc_by(truncated as f64);
        self.compaction_summarized.inc_by(summarized as f64);
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap_or_default();

        String::from_utf8(buffer).unwrap_or_default()
    }
}
