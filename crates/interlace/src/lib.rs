// Interlace
//
// LLM call tracing for Rust services. Wrap a model client once and every
// call is recorded as an event under the interaction that is active on the
// caller's async chain; completed interactions are batched and delivered
// to the collector in the background.
//
// Key design decisions:
// - An explicit, clonable Tracer instance instead of a process-wide singleton
// - Tracing never changes what a wrapped call returns or how it fails
// - Delivery is bounded in memory and best effort: overflow evicts the oldest item
// - Plugins observe the same lifecycle the collector sees, in registration order

pub mod config;
pub mod extract;
pub mod logging;
pub mod options;
pub mod pipeline;
pub mod span;
pub mod testing;
pub mod tool;
pub mod tracer;
pub mod wrap;

// Re-exports
pub use config::{TracerConfig, DEFAULT_BASE_URL};
pub use extract::{
    Capability, ChatCompletionsExtractor, Extractor, MessagesExtractor, RawExtractor,
    RequestFields, ResponseFields,
};
pub use logging::{init_tracing, Diagnostics};
pub use options::{BeginOptions, FeedbackOptions, FinishOptions, SignalOptions, TrackEventOptions};
pub use pipeline::{
    Batch, DeliveryNotice, HttpTransport, PipelineStats, QueueItem, RetryPolicy, Transport,
};
pub use span::{SpanResult, TraceIds};
pub use tool::WrappedTool;
pub use tracer::{InteractionHandle, Tracer};
pub use wrap::{Instrumentation, ModelClient, Traced, Wrapped};

pub use interlace_core::{
    current, spawn_in_context, Attachment, AttachmentRole, AttachmentType, ErrorInfo, Event,
    EventKind, Interaction, Outcome, Plugin, Properties, Result, Sentiment, Signal, SignalType,
    TraceContext, TracerError, Usage, UserIdentity,
};
