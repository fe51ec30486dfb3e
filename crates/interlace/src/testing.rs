// In-memory test doubles
//
// A transport that records batches instead of sending them and a plugin
// that records every hook call. Useful for asserting on traced output in
// host application tests without a collector.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use interlace_core::{Event, Interaction, Plugin, Result, Signal, TracerError, UserIdentity};

use crate::pipeline::{Batch, Transport};

// ============================================================================
// MemoryTransport
// ============================================================================

/// Transport that keeps delivered batches in memory
///
/// Failures queued with `fail_next` are returned by the next sends, in
/// order, before any batch is recorded.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    batches: Mutex<Vec<Batch>>,
    failures: Mutex<VecDeque<TracerError>>,
    sends: AtomicUsize,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next send fail with `error`
    pub fn fail_next(&self, error: TracerError) {
        self.failures.lock().push_back(error);
    }

    /// Number of send attempts, failed ones included
    pub fn send_count(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }

    /// Successfully delivered batches
    pub fn batches(&self) -> Vec<Batch> {
        self.batches.lock().clone()
    }

    pub fn interactions(&self) -> Vec<Interaction> {
        self.batches
            .lock()
            .iter()
            .flat_map(|b| b.interactions.clone())
            .collect()
    }

    /// Standalone events (late, detached or manually tracked)
    pub fn events(&self) -> Vec<Event> {
        self.batches
            .lock()
            .iter()
            .flat_map(|b| b.events.clone())
            .collect()
    }

    pub fn signals(&self) -> Vec<Signal> {
        self.batches
            .lock()
            .iter()
            .flat_map(|b| b.signals.clone())
            .collect()
    }

    pub fn users(&self) -> Vec<UserIdentity> {
        self.batches
            .lock()
            .iter()
            .flat_map(|b| b.users.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, batch: &Batch) -> Result<()> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }
        self.batches.lock().push(batch.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

// ============================================================================
// RecordingPlugin
// ============================================================================

/// A recorded plugin hook invocation
#[derive(Debug, Clone, PartialEq)]
pub enum HookCall {
    InteractionStart(Interaction),
    InteractionEnd(Interaction),
    Span(Event),
    Trace(Interaction),
    Flush,
    Shutdown,
}

impl HookCall {
    pub fn hook(&self) -> &'static str {
        match self {
            HookCall::InteractionStart(_) => "on_interaction_start",
            HookCall::InteractionEnd(_) => "on_interaction_end",
            HookCall::Span(_) => "on_span",
            HookCall::Trace(_) => "on_trace",
            HookCall::Flush => "flush",
            HookCall::Shutdown => "shutdown",
        }
    }
}

/// Plugin that records every hook call in order
#[derive(Debug)]
pub struct RecordingPlugin {
    name: String,
    calls: Mutex<Vec<HookCall>>,
}

impl RecordingPlugin {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<HookCall> {
        self.calls.lock().clone()
    }

    /// Hook names in call order
    pub fn hooks(&self) -> Vec<&'static str> {
        self.calls.lock().iter().map(HookCall::hook).collect()
    }

    pub fn spans(&self) -> Vec<Event> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                HookCall::Span(event) => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn traces(&self) -> Vec<Interaction> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                HookCall::Trace(interaction) => Some(interaction.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn shutdown_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, HookCall::Shutdown))
            .count()
    }

    fn record(&self, call: HookCall) -> anyhow::Result<()> {
        self.calls.lock().push(call);
        Ok(())
    }
}

#[async_trait]
impl Plugin for RecordingPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_interaction_start(&self, interaction: &Interaction) -> anyhow::Result<()> {
        self.record(HookCall::InteractionStart(interaction.clone()))
    }

    async fn on_interaction_end(&self, interaction: &Interaction) -> anyhow::Result<()> {
        self.record(HookCall::InteractionEnd(interaction.clone()))
    }

    async fn on_span(&self, event: &Event) -> anyhow::Result<()> {
        self.record(HookCall::Span(event.clone()))
    }

    async fn on_trace(&self, interaction: &Interaction) -> anyhow::Result<()> {
        self.record(HookCall::Trace(interaction.clone()))
    }

    async fn flush(&self) -> anyhow::Result<()> {
        self.record(HookCall::Flush)
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        self.record(HookCall::Shutdown)
    }
}
