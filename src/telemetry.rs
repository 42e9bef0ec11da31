//! Pluggable tracing hook for command processing.
//!
//! The stream adapter never builds spans itself; it asks the injected
//! [`Tracer`] for a [`TraceHandle`] when a command starts and hands it back
//! when the command finishes.

use std::fmt;

use crate::message::{EntityId, Metadata};

/// Metadata key carrying a W3C trace context from the caller.
pub const TRACEPARENT_KEY: &str = "traceparent";

/// What the tracer is told about a command when its span starts.
#[derive(Debug)]
pub struct SpanInfo<'a> {
    pub entity_type: &'static str,
    pub entity_id: &'a EntityId,
    pub operation: &'a str,
    pub command_id: u64,
    pub metadata: &'a Metadata,
}

/// How a traced command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanOutcome {
    Replied,
    Rejected,
    Failed,
}

impl SpanOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            SpanOutcome::Replied => "replied",
            SpanOutcome::Rejected => "rejected",
            SpanOutcome::Failed => "failed",
        }
    }
}

impl fmt::Display for SpanOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Span handle exposed to command handlers through the command context.
#[derive(Debug, Clone)]
pub struct TraceHandle {
    span: tracing::Span,
    traceparent: Option<String>,
}

impl TraceHandle {
    pub fn new(span: tracing::Span, traceparent: Option<String>) -> Self {
        Self { span, traceparent }
    }

    /// A handle that records nothing.
    pub fn disabled() -> Self {
        Self {
            span: tracing::Span::none(),
            traceparent: None,
        }
    }

    /// The `tracing` span covering the command.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Upstream trace context, if the caller sent one.
    pub fn traceparent(&self) -> Option<&str> {
        self.traceparent.as_deref()
    }
}

/// Injected tracing capability.
pub trait Tracer: Send + Sync + 'static {
    /// Called before the command handler runs.
    fn start_span(&self, info: &SpanInfo<'_>) -> TraceHandle;

    /// Called once the command's outbound message has been built.
    fn end_span(&self, handle: &TraceHandle, outcome: SpanOutcome);
}

/// Default tracer: one `tracing` span per command.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTracer;

impl Tracer for TracingTracer {
    fn start_span(&self, info: &SpanInfo<'_>) -> TraceHandle {
        let traceparent = info.metadata.get(TRACEPARENT_KEY).map(str::to_owned);
        let span = tracing::info_span!(
            "command",
            entity_type = info.entity_type,
            entity_id = %info.entity_id,
            operation = %info.operation,
            command_id = info.command_id,
            traceparent = traceparent.as_deref().unwrap_or(""),
            outcome = tracing::field::Empty,
        );
        TraceHandle::new(span, traceparent)
    }

    fn end_span(&self, handle: &TraceHandle, outcome: SpanOutcome) {
        handle.span.record("outcome", outcome.as_str());
    }
}

/// Tracer that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn start_span(&self, info: &SpanInfo<'_>) -> TraceHandle {
        TraceHandle::new(
            tracing::Span::none(),
            info.metadata.get(TRACEPARENT_KEY).map(str::to_owned),
        )
    }

    fn end_span(&self, _handle: &TraceHandle, _outcome: SpanOutcome) {}
}
