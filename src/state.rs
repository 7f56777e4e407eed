use std::sync::Arc;

use crate::config::RelayConfig;
use crate::memory::{MemoryStore, NoMemory};
use crate::rate_limit::RateLimiter;
use crate::upstream::UpstreamClient;

/// Everything a request handler needs, cheap to clone per request
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub limiter: Arc<RateLimiter>,
    pub upstream: UpstreamClient,
    pub memory: Arc<dyn MemoryStore>,
}

impl AppState {
    #[must_use]
    pub fn new(config: RelayConfig) -> Self {
        let limiter = RateLimiter::new(&config.rate_limit);
        let upstream = UpstreamClient::new(config.upstream.clone(), config.backoff.clone());

        Self {
            config: Arc::new(config),
            limiter: Arc::new(limiter),
            upstream,
            memory: Arc::new(NoMemory),
        }
    }

    /// Replace the memory backend
    #[must_use]
    pub fn with_memory(
        mut self,
        memory: Arc<dyn MemoryStore>,
    ) -> Self {
        self.memory = memory;
        self
    }
}
