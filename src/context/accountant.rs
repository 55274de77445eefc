//! Token accounting with a bounded cache and estimation fallback

use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::models::Message;
use super::token_estimator::{CharEstimator, TiktokenEstimator, TokenEstimator};
use crate::config::EngineConfig;
use crate::metrics::METRICS;

/// Token cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: u64,
    pub capacity: u64,
}

/// Counts tokens for text and messages
///
/// Constructed once and shared by reference (`Arc`) with every consumer; there
/// is no process-wide cache. When the primary backend is missing, or fails on a
/// call, counts come from the `max(1, chars / 4)` estimate instead.
pub struct TokenAccountant {
    backend: Option<Arc<dyn TokenEstimator>>,
    fallback: CharEstimator,
    cache: Cache<[u8; 32], usize>,
    capacity: u64,
    message_overhead: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TokenAccountant {
    /// Default per-message framing cost
    pub const DEFAULT_MESSAGE_OVERHEAD: usize = 3;

    /// Create an accountant over an explicit backend (`None` = estimate only)
    pub fn new(
        backend: Option<Arc<dyn TokenEstimator>>,
        cache_capacity: usize,
        message_overhead: usize,
    ) -> Self {
        let capacity = cache_capacity.max(1) as u64;
        let cache = Cache::builder()
            .max_capacity(capacity)
            .eviction_policy(EvictionPolicy::lru())
            .build();

        Self {
            backend,
            fallback: CharEstimator::default(),
            cache,
            capacity,
            message_overhead,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Create an accountant backed by tiktoken, estimating if it cannot load
    pub fn with_tiktoken(cache_capacity: usize, message_overhead: usize) -> Self {
        let backend: Option<Arc<dyn TokenEstimator>> = match TiktokenEstimator::new() {
            Ok(bpe) => Some(Arc::new(bpe)),
            Err(e) => {
                warn!("Tokenizer backend unavailable, using estimation: {}", e);
                METRICS.tokenizer_fallbacks.inc();
                None
            }
        };
        Self::new(backend, cache_capacity, message_overhead)
    }

    /// Create an estimate-only accountant
    pub fn estimating(cache_capacity: usize) -> Self {
        Self::new(None, cache_capacity, Self::DEFAULT_MESSAGE_OVERHEAD)
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        if config.use_tiktoken {
            Self::with_tiktoken(config.token_cache_capacity, config.message_overhead)
        } else {
            Self::new(None, config.token_cache_capacity, config.message_overhead)
        }
    }

    /// Count tokens in `text`
    pub fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }

        let key: [u8; 32] = Sha256::digest(text.as_bytes()).into();
        if let Some(count) = self.cache.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            METRICS.token_cache_hits.inc();
            return count;
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        METRICS.token_cache_misses.inc();

        let (count, cacheable) = self.count_uncached(text);
        if cacheable {
            self.cache.insert(key, count);
        }
        count
    }

    fn count_uncached(&self, text: &str) -> (usize, bool) {
        let Some(backend) = &self.backend else {
            return (self.fallback.count(text), true);
        };

        match backend.estimate(text) {
            Ok(count) => (count, true),
            Err(e) => {
                // Transient failure: estimate now, retry the backend next time.
                warn!("Tokenizer {} failed, estimating: {}", backend.name(), e);
                METRICS.tokenizer_fallbacks.inc();
                (self.fallback.count(text), false)
            }
        }
    }

    /// Tokens for one message including framing overhead
    pub fn count_message(&self, message: &Message) -> usize {
        self.count_framed(&message.content)
    }

    /// Tokens for a list of messages
    pub fn count_messages(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.count_message(m)).sum()
    }

    /// Tokens for content that will be emitted as its own message
    pub fn count_framed(&self, content: &str) -> usize {
        self.count(content) + self.message_overhead
    }

    pub fn message_overhead(&self) -> usize {
        self.message_overhead
    }

    /// Whether counts currently come from the estimate instead of a tokenizer
    pub fn is_estimating(&self) -> bool {
        self.backend.is_none()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.run_pending_tasks();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: self.cache.entry_count(),
            capacity: self.capacity,
        }
    }

    /// Drop all cached counts and reset hit/miss counters
    pub fn clear_cache(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        debug!("Token cache cleared");
    }
}

impl Default for TokenAccountant {
    fn default() -> Self {
        Self::with_tiktoken(10_000, Self::DEFAULT_MESSAGE_OVERHEAD)
    }
}
