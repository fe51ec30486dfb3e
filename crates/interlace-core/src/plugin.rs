// Plugin Dispatch Hub
//
// Plugins observe the lifecycle of interactions and events (OpenTelemetry
// export, custom metrics, audit logs). The hub fans each hook out to every
// registered plugin in registration order.
//
// A plugin can never break tracing or the host: errors and panics are
// caught per invocation, logged, and the remaining plugins still run.
// Every hook is bounded by the hub's timeout, so a stalled exporter costs
// the traced call at most `hook_timeout`. shutdown runs at most once.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::warn;

use crate::error::TracerError;
use crate::model::{Event, Interaction};

// ============================================================================
// Plugin Trait
// ============================================================================

/// Lifecycle observer for traced work
///
/// Every hook has a no-op default, so a plugin implements only what it
/// needs. Hooks receive read-only views of the tree.
///
/// # Example
///
/// ```ignore
/// use interlace_core::{Event, Plugin};
///
/// struct LatencyLog;
///
/// #[async_trait]
/// impl Plugin for LatencyLog {
///     fn name(&self) -> &str {
///         "latency-log"
///     }
///
///     async fn on_span(&self, event: &Event) -> anyhow::Result<()> {
///         tracing::info!(name = %event.name, latency_ms = ?event.latency_ms, "span closed");
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Human-readable name for logging
    fn name(&self) -> &str;

    /// An interaction was opened
    async fn on_interaction_start(&self, _interaction: &Interaction) -> anyhow::Result<()> {
        Ok(())
    }

    /// An interaction was finished (header only, before delivery)
    async fn on_interaction_end(&self, _interaction: &Interaction) -> anyhow::Result<()> {
        Ok(())
    }

    /// An event was closed
    async fn on_span(&self, _event: &Event) -> anyhow::Result<()> {
        Ok(())
    }

    /// The complete tree of a finished interaction
    async fn on_trace(&self, _interaction: &Interaction) -> anyhow::Result<()> {
        Ok(())
    }

    /// Flush any buffered plugin state
    async fn flush(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Release resources; called at most once
    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

// ============================================================================
// PluginHub
// ============================================================================

/// Ordered, failure-isolating fan-out over registered plugins
pub struct PluginHub {
    plugins: Vec<Arc<dyn Plugin>>,
    hook_timeout: Duration,
    shut_down: AtomicBool,
    failures: AtomicU64,
}

impl PluginHub {
    /// Create a hub; plugins are invoked in the given order
    pub fn new(plugins: Vec<Arc<dyn Plugin>>, hook_timeout: Duration) -> Self {
        Self {
            plugins,
            hook_timeout,
            shut_down: AtomicBool::new(false),
            failures: AtomicU64::new(0),
        }
    }

    /// Hub with no plugins
    pub fn empty() -> Self {
        Self::new(Vec::new(), Duration::from_secs(5))
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Plugin names in registration order
    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    /// Total hook failures observed so far
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub async fn on_interaction_start(&self, interaction: &Interaction) -> Vec<TracerError> {
        let mut failures = Vec::new();
        for plugin in &self.plugins {
            let fut = plugin.on_interaction_start(interaction);
            self.invoke(plugin.name(), "on_interaction_start", fut, &mut failures).await;
        }
        failures
    }

    pub async fn on_interaction_end(&self, interaction: &Interaction) -> Vec<TracerError> {
        let mut failures = Vec::new();
        for plugin in &self.plugins {
            let fut = plugin.on_interaction_end(interaction);
            self.invoke(plugin.name(), "on_interaction_end", fut, &mut failures).await;
        }
        failures
    }

    pub async fn on_span(&self, event: &Event) -> Vec<TracerError> {
        let mut failures = Vec::new();
        for plugin in &self.plugins {
            let fut = plugin.on_span(event);
            self.invoke(plugin.name(), "on_span", fut, &mut failures).await;
        }
        failures
    }

    pub async fn on_trace(&self, interaction: &Interaction) -> Vec<TracerError> {
        let mut failures = Vec::new();
        for plugin in &self.plugins {
            let fut = plugin.on_trace(interaction);
            self.invoke(plugin.name(), "on_trace", fut, &mut failures).await;
        }
        failures
    }

    /// Flush every plugin
    pub async fn flush(&self) -> Vec<TracerError> {
        let mut failures = Vec::new();
        for plugin in &self.plugins {
            let fut = plugin.flush();
            self.invoke(plugin.name(), "flush", fut, &mut failures).await;
        }
        failures
    }

    /// Shut every plugin down; later calls are no-ops
    pub async fn shutdown(&self) -> Vec<TracerError> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }

        let mut failures = Vec::new();
        for plugin in &self.plugins {
            let fut = plugin.shutdown();
            self.invoke(plugin.name(), "shutdown", fut, &mut failures).await;
        }
        failures
    }

    async fn invoke<F>(
        &self,
        plugin: &str,
        hook: &'static str,
        fut: F,
        failures: &mut Vec<TracerError>,
    ) where
        F: Future<Output = anyhow::Result<()>>,
    {
        let guarded = AssertUnwindSafe(fut).catch_unwind();
        let outcome = match tokio::time::timeout(self.hook_timeout, guarded).await {
            Ok(outcome) => outcome,
            Err(_) => Ok(Err(anyhow::anyhow!(
                "timed out after {:?}",
                self.hook_timeout
            ))),
        };

        let message = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
        };

        warn!(plugin = %plugin, hook = hook, error = %message, "Plugin hook failed");
        self.failures.fetch_add(1, Ordering::Relaxed);
        failures.push(TracerError::plugin(plugin, hook, message));
    }
}

impl std::fmt::Debug for PluginHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHub")
            .field("plugins", &self.names())
            .field("hook_timeout", &self.hook_timeout)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EventKind;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicU32;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Plugin for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        async fn on_span(&self, event: &Event) -> anyhow::Result<()> {
            self.log.lock().push(format!("{}:{}", self.name, event.name));
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Plugin for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn on_span(&self, _event: &Event) -> anyhow::Result<()> {
            anyhow::bail!("export rejected")
        }
    }

    struct Panicking;

    #[async_trait]
    impl Plugin for Panicking {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn on_span(&self, _event: &Event) -> anyhow::Result<()> {
            panic!("plugin bug");
        }
    }

    struct Slow;

    #[async_trait]
    impl Plugin for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn flush(&self) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    struct StalledExporter;

    #[async_trait]
    impl Plugin for StalledExporter {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn on_span(&self, _event: &Event) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    struct CountingShutdown(Arc<AtomicU32>);

    #[async_trait]
    impl Plugin for CountingShutdown {
        fn name(&self) -> &str {
            "counting"
        }

        async fn shutdown(&self) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn event() -> Event {
        Event::new(EventKind::Llm, "chat", "root", "root")
    }

    #[tokio::test]
    async fn test_hooks_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let hub = PluginHub::new(
            vec![
                Arc::new(Recorder {
                    name: "first",
                    log: log.clone(),
                }),
                Arc::new(Recorder {
                    name: "second",
                    log: log.clone(),
                }),
            ],
            Duration::from_secs(5),
        );

        assert_eq!(hub.names(), vec!["first", "second"]);
        assert!(hub.on_span(&event()).await.is_empty());
        assert_eq!(*log.lock(), vec!["first:chat", "second:chat"]);
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let hub = PluginHub::new(
            vec![
                Arc::new(Failing),
                Arc::new(Panicking),
                Arc::new(Recorder {
                    name: "after",
                    log: log.clone(),
                }),
            ],
            Duration::from_secs(5),
        );

        let failures = hub.on_span(&event()).await;
        assert_eq!(failures.len(), 2);
        assert_eq!(
            failures[0],
            TracerError::plugin("failing", "on_span", "export rejected")
        );
        assert!(matches!(
            &failures[1],
            TracerError::PluginHookFailure { plugin, message, .. }
                if plugin == "panicking" && message.contains("plugin bug")
        ));
        assert_eq!(*log.lock(), vec!["after:chat"]);
        assert_eq!(hub.failure_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_is_bounded_by_timeout() {
        let hub = PluginHub::new(vec![Arc::new(Slow)], Duration::from_secs(5));
        let failures = hub.flush().await;
        assert_eq!(failures.len(), 1);
        assert!(matches!(
            &failures[0],
            TracerError::PluginHookFailure { hook: "flush", .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_lifecycle_hook_is_abandoned() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let hub = PluginHub::new(
            vec![
                Arc::new(StalledExporter),
                Arc::new(Recorder {
                    name: "after",
                    log: log.clone(),
                }),
            ],
            Duration::from_secs(2),
        );

        let started = tokio::time::Instant::now();
        let failures = hub.on_span(&event()).await;
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(matches!(
            &failures[..],
            [TracerError::PluginHookFailure { plugin, hook: "on_span", message }]
                if plugin == "stalled" && message.contains("timed out")
        ));
        assert_eq!(*log.lock(), vec!["after:chat"]);
    }

    #[tokio::test]
    async fn test_shutdown_runs_at_most_once() {
        let count = Arc::new(AtomicU32::new(0));
        let hub = PluginHub::new(
            vec![Arc::new(CountingShutdown(count.clone()))],
            Duration::from_secs(5),
        );

        hub.shutdown().await;
        hub.shutdown().await;
        assert!(hub.is_shut_down());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_default_hooks_are_noops() {
        struct Bare;

        #[async_trait]
        impl Plugin for Bare {
            fn name(&self) -> &str {
                "bare"
            }
        }

        let hub = PluginHub::new(vec![Arc::new(Bare)], Duration::from_secs(5));
        let interaction = Interaction::new("rag_query");
        assert!(hub.on_interaction_start(&interaction).await.is_empty());
        assert!(hub.on_interaction_end(&interaction).await.is_empty());
        assert!(hub.on_trace(&interaction).await.is_empty());
        assert!(hub.flush().await.is_empty());
        assert!(hub.shutdown().await.is_empty());
    }
}
