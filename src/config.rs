//! Relay configuration
//!
//! Every value is read from the environment (after loading a `.env` file when one is
//! present) and has a documented default. A value that fails to parse falls back to
//! its default with a warning rather than refusing to start.

use std::str::FromStr;
use std::time::Duration;

use crate::backoff::BackoffPolicy;
use crate::upstream::UpstreamFormat;

/// Upstream provider settings
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// `UPSTREAM_FORMAT`: `openai` (default) or `anthropic`
    pub format: UpstreamFormat,
    /// `UPSTREAM_BASE_URL`: defaults to the provider's public endpoint
    pub base_url: String,
    /// `OPENAI_API_KEY` or `UPSTREAM_API_KEY`
    pub api_key: Option<String>,
    /// `OPENAI_MODEL` or `UPSTREAM_MODEL`: default `gpt-4o-mini`
    pub model: String,
    /// `UPSTREAM_MAX_TOKENS`: default 512
    pub max_tokens: u32,
    /// `UPSTREAM_TEMPERATURE`: default 0.8
    pub temperature: f32,
}

impl UpstreamConfig {
    #[must_use]
    pub fn new(
        format: UpstreamFormat,
        base_url: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            format,
            base_url: base_url.into(),
            api_key,
            model: "gpt-4o-mini".to_string(),
            max_tokens: 512,
            temperature: 0.8,
        }
    }
}

/// Token bucket settings
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// `RATE_LIMIT_CAPACITY`: default 30
    pub capacity: u32,
    /// `RATE_LIMIT_REFILL_PER_SEC`: default 1.0
    pub refill_per_second: f64,
    /// `RATE_LIMIT_MAX_KEYS`: default 10000
    pub max_keys: u64,
    /// `RATE_LIMIT_IDLE_SECS`: default 600
    pub idle_ttl: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 30,
            refill_per_second: 1.0,
            max_keys: 10_000,
            idle_ttl: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub upstream: UpstreamConfig,
    pub rate_limit: RateLimitConfig,
    pub backoff: BackoffPolicy,
    /// `HEARTBEAT_SECS`: default 15, `0` disables heartbeats
    pub heartbeat_interval: Option<Duration>,
    /// `CORS_ALLOW_ORIGIN`: `*` (default), a fixed origin, or `echo`
    pub cors_allow_origin: String,
    /// `DEFAULT_AGENT`: persona used when a request names none
    pub default_agent: String,
    /// `BIND_ADDR`: default `127.0.0.1:8080`
    pub bind_addr: String,
}

impl RelayConfig {
    /// Defaults for a given upstream, without reading the environment
    #[must_use]
    pub fn new(upstream: UpstreamConfig) -> Self {
        Self {
            upstream,
            rate_limit: RateLimitConfig::default(),
            backoff: BackoffPolicy::default(),
            heartbeat_interval: Some(Duration::from_secs(15)),
            cors_allow_origin: "*".to_string(),
            default_agent: "Keilani".to_string(),
            bind_addr: "127.0.0.1:8080".to_string(),
        }
    }

    /// Load configuration from the process environment and `.env`.
    #[must_use]
    pub fn from_env() -> Self {
        if let Err(e) = dotenvy::dotenv() {
            tracing::debug!("No .env file loaded: {}", e);
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let format = parse_or(&lookup, "UPSTREAM_FORMAT", UpstreamFormat::OpenAi);
        let mut upstream = UpstreamConfig::new(
            format,
            lookup("UPSTREAM_BASE_URL").unwrap_or_else(|| format.default_base_url().to_string()),
            lookup("OPENAI_API_KEY").or_else(|| lookup("UPSTREAM_API_KEY")),
        );
        if let Some(model) = lookup("OPENAI_MODEL").or_else(|| lookup("UPSTREAM_MODEL")) {
            upstream.model = model;
        }
        upstream.max_tokens = parse_or(&lookup, "UPSTREAM_MAX_TOKENS", upstream.max_tokens);
        upstream.temperature = parse_or(&lookup, "UPSTREAM_TEMPERATURE", upstream.temperature);

        let defaults = RateLimitConfig::default();
        let rate_limit = RateLimitConfig {
            capacity: parse_or(&lookup, "RATE_LIMIT_CAPACITY", defaults.capacity),
            refill_per_second: refill_rate_or(&lookup, "RATE_LIMIT_REFILL_PER_SEC", defaults.refill_per_second),
            max_keys: parse_or(&lookup, "RATE_LIMIT_MAX_KEYS", defaults.max_keys),
            idle_ttl: Duration::from_secs(parse_or(&lookup, "RATE_LIMIT_IDLE_SECS", defaults.idle_ttl.as_secs())),
        };

        let policy = BackoffPolicy::default();
        let backoff = BackoffPolicy {
            max_retries: parse_or(&lookup, "RETRY_MAX", policy.max_retries),
            base_delay: millis_or(&lookup, "RETRY_BASE_MS", policy.base_delay),
            max_delay: millis_or(&lookup, "RETRY_MAX_DELAY_MS", policy.max_delay),
            jitter: millis_or(&lookup, "RETRY_JITTER_MS", policy.jitter),
        };

        let heartbeat_secs: u64 = parse_or(&lookup, "HEARTBEAT_SECS", 15);

        let mut config = Self::new(upstream);
        config.rate_limit = rate_limit;
        config.backoff = backoff;
        config.heartbeat_interval = (heartbeat_secs > 0).then(|| Duration::from_secs(heartbeat_secs));
        if let Some(origin) = lookup("CORS_ALLOW_ORIGIN") {
            config.cors_allow_origin = origin;
        }
        if let Some(agent) = lookup("DEFAULT_AGENT") {
            config.default_agent = agent;
        }
        if let Some(addr) = lookup("BIND_ADDR") {
            config.bind_addr = addr;
        }
        config
    }

    /// Value for `Access-Control-Allow-Origin` given the request's `Origin`
    #[must_use]
    pub fn allow_origin(
        &self,
        request_origin: Option<&str>,
    ) -> String {
        if self.cors_allow_origin.eq_ignore_ascii_case("echo") {
            return request_origin.unwrap_or("*").to_string();
        }
        self.cors_allow_origin.clone()
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring invalid {}={:?}, using default", key, raw);
            default
        }),
        None => default,
    }
}

/// Refill rates must be finite and non-negative; anything else disables or breaks the limiter.
fn refill_rate_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: f64,
) -> f64 {
    let rate: f64 = parse_or(lookup, key, default);
    if rate.is_finite() && rate >= 0.0 {
        return rate;
    }
    tracing::warn!("Ignoring out-of-range {}={}, using default", key, rate);
    default
}

fn millis_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Duration {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(parse_or(lookup, key, default_ms))
}
