// Tracer Configuration
//
// Configuration for a tracer instance, built in code or loaded from
// environment variables.

use std::env;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use interlace_core::{Plugin, Result, TracerError};

use crate::pipeline::RetryPolicy;

/// Default collector endpoint
pub const DEFAULT_BASE_URL: &str = "https://api.interlace.dev";

/// Configuration for a tracer
#[derive(Clone)]
pub struct TracerConfig {
    /// Collector API key
    pub api_key: Option<String>,

    /// Alias for `api_key`; ignored when `api_key` is set
    pub write_key: Option<String>,

    /// Collector base URL
    pub base_url: String,

    /// Log absorbed internal errors at warn level
    pub debug: bool,

    /// Turn every operation into a no-op
    pub disabled: bool,

    /// Periodic drain interval
    pub flush_interval: Duration,

    /// Items per batch; reaching this many queued items triggers a drain
    pub max_batch_size: usize,

    /// Queue bound; the oldest item is evicted beyond it
    pub queue_capacity: usize,

    /// Per-request HTTP timeout
    pub request_timeout: Duration,

    /// Bound for plugin flush/shutdown hooks
    pub hook_timeout: Duration,

    /// Backoff for transient delivery failures
    pub retry: RetryPolicy,

    /// Plugins, invoked in this order
    pub plugins: Vec<Arc<dyn Plugin>>,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            write_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            debug: false,
            disabled: false,
            flush_interval: Duration::from_millis(5000),
            max_batch_size: 100,
            queue_capacity: 10_000,
            request_timeout: Duration::from_secs(30),
            hook_timeout: Duration::from_secs(5),
            retry: RetryPolicy::exponential(),
            plugins: Vec::new(),
        }
    }
}

impl TracerConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `INTERLACE_API_KEY`: Collector API key
    /// - `INTERLACE_WRITE_KEY`: Alias for the API key
    /// - `INTERLACE_BASE_URL`: Collector URL (default: https://api.interlace.dev)
    /// - `INTERLACE_DEBUG`: Log absorbed errors (default: false)
    /// - `INTERLACE_DISABLED`: Disable all tracing (default: false)
    /// - `INTERLACE_FLUSH_INTERVAL_MS`: Drain interval (default: 5000)
    /// - `INTERLACE_MAX_BATCH_SIZE`: Batch size (default: 100)
    /// - `INTERLACE_QUEUE_CAPACITY`: Queue bound (default: 10000)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let non_empty = |key: &str| get(key).filter(|v| !v.trim().is_empty());
        let flag = |key: &str| {
            non_empty(key)
                .map(|v| {
                    let v = v.trim().to_lowercase();
                    v == "true" || v == "1"
                })
                .unwrap_or(false)
        };

        Self {
            api_key: non_empty("INTERLACE_API_KEY"),
            write_key: non_empty("INTERLACE_WRITE_KEY"),
            base_url: non_empty("INTERLACE_BASE_URL").unwrap_or(defaults.base_url),
            debug: flag("INTERLACE_DEBUG"),
            disabled: flag("INTERLACE_DISABLED"),
            flush_interval: non_empty("INTERLACE_FLUSH_INTERVAL_MS")
                .and_then(|v| v.trim().parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.flush_interval),
            max_batch_size: non_empty("INTERLACE_MAX_BATCH_SIZE")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.max_batch_size),
            queue_capacity: non_empty("INTERLACE_QUEUE_CAPACITY")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.queue_capacity),
            ..defaults
        }
    }

    /// The effective API key (`api_key` wins over `write_key`)
    pub fn resolved_api_key(&self) -> Option<&str> {
        self.api_key.as_deref().or(self.write_key.as_deref())
    }

    /// Batch ingestion endpoint
    pub fn batch_url(&self) -> String {
        format!("{}/v1/batch", self.base_url.trim_end_matches('/'))
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(TracerError::config("max_batch_size must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(TracerError::config("queue_capacity must be at least 1"));
        }
        if self.flush_interval.is_zero() {
            return Err(TracerError::config("flush_interval must be non-zero"));
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(TracerError::config(format!(
                "base_url must be an http(s) URL, got {}",
                self.base_url
            )));
        }
        Ok(())
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_write_key(mut self, write_key: impl Into<String>) -> Self {
        self.write_key = Some(write_key.into());
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_hook_timeout(mut self, timeout: Duration) -> Self {
        self.hook_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Register a plugin after any already registered
    pub fn with_plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.push(plugin);
        self
    }
}

impl fmt::Debug for TracerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let plugins: Vec<&str> = self.plugins.iter().map(|p| p.name()).collect();
        f.debug_struct("TracerConfig")
            .field("api_key", &self.resolved_api_key().map(|_| "<redacted>"))
            .field("base_url", &self.base_url)
            .field("debug", &self.debug)
            .field("disabled", &self.disabled)
            .field("flush_interval", &self.flush_interval)
            .field("max_batch_size", &self.max_batch_size)
            .field("queue_capacity", &self.queue_capacity)
            .field("request_timeout", &self.request_timeout)
            .field("hook_timeout", &self.hook_timeout)
            .field("retry", &self.retry)
            .field("plugins", &plugins)
            .finish()
    }
}
