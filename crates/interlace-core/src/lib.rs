// Interlace Core
//
// Runtime-agnostic building blocks for LLM tracing: the event tree that
// records interactions and their nested calls, per-call-chain context
// propagation, and the plugin dispatch hub.
//
// Key design decisions:
// - The tree is mutated behind a short-lived parking_lot lock, never held across an await
// - Context lives in a tokio task_local bound to the logical call chain, not the OS thread
// - Plugins observe read-only views and can never fail the host's call
// - Nothing here knows about delivery; the `interlace` crate owns batching and transport

pub mod context;
pub mod error;
pub mod model;
pub mod plugin;
pub mod tree;

// Re-exports for convenience
pub use context::{
    current, run_detached, run_detached_sync, spawn_in_context, with_context, with_context_sync,
    ActiveNode, NodeKind, TraceContext,
};
pub use error::{Result, TracerError};
pub use model::{
    new_id, Attachment, AttachmentRole, AttachmentType, ErrorInfo, Event, EventKind, Interaction,
    Outcome, Properties, Sentiment, Signal, SignalType, Usage, UserIdentity,
};
pub use plugin::{Plugin, PluginHub};
pub use tree::{ClosedEvent, FinishedTree, SharedTree, TraceTree};
