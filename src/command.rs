//! Per-command context handed to entity logic.
//!
//! A [`CommandContext`] is only valid while its handler runs. The stream
//! adapter holds the matching [`ContextScope`]; dropping the scope
//! deactivates every clone of the context, so a handler that stashes a
//! clone and uses it later gets a [`ContextError`] instead of stale data.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::ContextError;
use crate::message::{EntityId, Metadata, SequenceNumber};
use crate::telemetry::TraceHandle;

#[derive(Debug)]
struct ContextInner {
    entity_id: EntityId,
    sequence_number: SequenceNumber,
    operation: String,
    command_id: u64,
    metadata: Metadata,
    trace: TraceHandle,
    active: AtomicBool,
}

/// Metadata of the command currently being processed.
///
/// Cheap to clone; all clones share one activation flag. Every accessor
/// fails with [`ContextError::Inactive`] once the handler has returned.
///
/// # Examples
///
/// ```
/// use entity_stream::{CommandContext, EntityId, Metadata};
///
/// let ctx = CommandContext::detached(EntityId::from("c-1"), 4, "increaseBy", 9, Metadata::default());
/// assert_eq!(ctx.sequence_number(), Ok(4));
/// assert_eq!(ctx.operation(), Ok("increaseBy"));
/// ```
#[derive(Debug, Clone)]
pub struct CommandContext {
    inner: Arc<ContextInner>,
}

impl CommandContext {
    fn open(
        entity_id: EntityId,
        sequence_number: SequenceNumber,
        operation: impl Into<String>,
        command_id: u64,
        metadata: Metadata,
        trace: TraceHandle,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                entity_id,
                sequence_number,
                operation: operation.into(),
                command_id,
                metadata,
                trace,
                active: AtomicBool::new(true),
            }),
        }
    }

    /// Build an active context with no owning scope and tracing disabled.
    ///
    /// Intended for calling handlers directly in unit tests.
    pub fn detached(
        entity_id: EntityId,
        sequence_number: SequenceNumber,
        operation: impl Into<String>,
        command_id: u64,
        metadata: Metadata,
    ) -> Self {
        Self::open(
            entity_id,
            sequence_number,
            operation,
            command_id,
            metadata,
            TraceHandle::disabled(),
        )
    }

    fn check(&self) -> Result<&ContextInner, ContextError> {
        if self.inner.active.load(Ordering::Acquire) {
            Ok(&self.inner)
        } else {
            Err(ContextError::Inactive {
                operation: self.inner.operation.clone(),
            })
        }
    }

    pub fn entity_id(&self) -> Result<&EntityId, ContextError> {
        self.check().map(|inner| &inner.entity_id)
    }

    /// Sequence number of the last event applied before this command.
    pub fn sequence_number(&self) -> Result<SequenceNumber, ContextError> {
        self.check().map(|inner| inner.sequence_number)
    }

    pub fn operation(&self) -> Result<&str, ContextError> {
        self.check().map(|inner| inner.operation.as_str())
    }

    pub fn command_id(&self) -> Result<u64, ContextError> {
        self.check().map(|inner| inner.command_id)
    }

    pub fn metadata(&self) -> Result<&Metadata, ContextError> {
        self.check().map(|inner| &inner.metadata)
    }

    pub fn trace(&self) -> Result<&TraceHandle, ContextError> {
        self.check().map(|inner| &inner.trace)
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }
}

/// Owner of a [`CommandContext`]'s lifetime.
///
/// Opened right before the handler is invoked and dropped right after it
/// returns, on every exit path.
#[derive(Debug)]
pub(crate) struct ContextScope {
    context: CommandContext,
}

impl ContextScope {
    pub(crate) fn open(
        entity_id: EntityId,
        sequence_number: SequenceNumber,
        operation: &str,
        command_id: u64,
        metadata: Metadata,
        trace: TraceHandle,
    ) -> Self {
        Self {
            context: CommandContext::open(
                entity_id,
                sequence_number,
                operation,
                command_id,
                metadata,
                trace,
            ),
        }
    }

    /// A handle to pass into entity logic.
    pub(crate) fn context(&self) -> CommandContext {
        self.context.clone()
    }
}

impl Drop for ContextScope {
    fn drop(&mut self) {
        self.context.inner.active.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> ContextScope {
        ContextScope::open(
            EntityId::from("c-1"),
            2,
            "increaseBy",
            11,
            Metadata::default().with("actor", "user-1"),
            TraceHandle::disabled(),
        )
    }

    #[test]
    fn accessors_work_while_scope_is_open() {
        let scope = scope();
        let ctx = scope.context();
        assert_eq!(ctx.entity_id().map(EntityId::as_str), Ok("c-1"));
        assert_eq!(ctx.sequence_number(), Ok(2));
        assert_eq!(ctx.operation(), Ok("increaseBy"));
        assert_eq!(ctx.command_id(), Ok(11));
        assert_eq!(
            ctx.metadata().map(|m| m.get("actor")),
            Ok(Some("user-1"))
        );
        assert!(ctx.is_active());
    }

    #[test]
    fn dropping_scope_deactivates_every_clone() {
        let scope = scope();
        let ctx = scope.context();
        let stashed = ctx.clone();
        drop(scope);

        assert!(!ctx.is_active());
        let err = stashed.sequence_number().unwrap_err();
        assert_eq!(
            err,
            ContextError::Inactive {
                operation: "increaseBy".into()
            }
        );
        assert!(stashed.trace().is_err());
        assert!(stashed.metadata().is_err());
    }

    #[test]
    fn scope_is_released_when_unwinding() {
        let scope = scope();
        let ctx = scope.context();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _scope = scope;
            panic!("handler blew up");
        }));
        assert!(result.is_err());
        assert!(!ctx.is_active());
    }

    #[test]
    fn detached_context_is_active() {
        let ctx = CommandContext::detached(
            EntityId::from("x"),
            0,
            "noop",
            1,
            Metadata::default(),
        );
        assert!(ctx.is_active());
        assert_eq!(ctx.trace().map(|t| t.traceparent()), Ok(None));
    }
}
