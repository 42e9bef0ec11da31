//! Crate-level error types for the entity stream engine.
//!
//! How each of these is surfaced to the caller (fatal failure, error reply,
//! per-command failure) is decided by [`crate::classify`].

use crate::message::{EntityId, ErrorCode, SequenceNumber};

/// Malformed or out-of-order message sequence on an entity channel.
///
/// Always fatal: the channel is terminated after reporting it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// A second `Init` arrived on an already initialized channel.
    #[error("entity [{entity_id}] received a second init message")]
    DuplicateInit { entity_id: EntityId },

    /// Something other than `Init` arrived first.
    #[error("expected init as the first message, received {received}")]
    NotInitialized { received: &'static str },

    /// A message named a different entity than the channel's own.
    #[error("message for entity [{received}] arrived on the channel of entity [{expected}]")]
    EntityMismatch {
        expected: EntityId,
        received: EntityId,
    },

    /// A replayed event did not directly follow the previous one.
    #[error("replayed event has sequence number {received}, expected {expected}")]
    SequenceGap {
        expected: SequenceNumber,
        received: SequenceNumber,
    },

    /// A replay event arrived after the first command or snapshot request.
    #[error("replay event {sequence_number} received after the entity became active")]
    EventAfterActive { sequence_number: SequenceNumber },
}

/// Use of a [`CommandContext`](crate::CommandContext) after its handler
/// returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("command context for operation [{operation}] used after its handler returned")]
    Inactive { operation: String },
}

/// Error returned by a command handler.
///
/// `Rejected` is the explicit business-rule rejection: it becomes an error
/// reply and leaves the entity untouched. Everything else is an unexpected
/// failure.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Command declined by entity logic (validation failure and similar).
    #[error("{message}")]
    Rejected {
        message: String,
        code: Option<ErrorCode>,
    },

    /// The handler touched a deactivated context.
    #[error(transparent)]
    Context(#[from] ContextError),

    /// Any other failure raised while handling the command.
    #[error("unexpected handler failure: {0}")]
    Unexpected(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    /// Business rejection without a code hint.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
            code: None,
        }
    }

    /// Business rejection with a code hint.
    pub fn rejected_with_code(message: impl Into<String>, code: ErrorCode) -> Self {
        Self::Rejected {
            message: message.into(),
            code: Some(code),
        }
    }

    /// Wrap an arbitrary error as an unexpected failure.
    pub fn unexpected(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Unexpected(err.into())
    }
}

/// An effect that entity logic should never have produced.
#[derive(Debug, thiserror::Error)]
pub enum EffectDefect {
    #[error("effect deletes the entity but declines to reply")]
    DeleteWithoutReply,

    #[error("an error effect cannot delete the entity")]
    DeleteOnError,

    #[error("event-sourced entities change state only by emitting events")]
    StateReplacement,

    #[error("key-value entities cannot emit events")]
    EventsOnKeyValue,

    #[error("operation [{operation}] succeeded without emitting any event")]
    MissingMutation { operation: String },

    #[error("failed to encode reply payload: {0}")]
    ReplyEncoding(#[source] serde_json::Error),

    #[error("failed to encode event: {0}")]
    EventEncoding(#[source] serde_json::Error),

    #[error("failed to encode state: {0}")]
    StateEncoding(#[source] serde_json::Error),

    #[error("applying emitted events panicked")]
    ApplyPanicked,
}

/// Failure to route, run, or interpret a single command.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no handler registered for operation [{0}]")]
    UnknownOperation(String),

    #[error("invalid payload for operation [{operation}]: {source}")]
    InvalidPayload {
        operation: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error("handler for operation [{0}] panicked")]
    Panicked(String),

    #[error(transparent)]
    Effect(#[from] EffectDefect),
}

/// Failure while seeding or replaying an entity's history, or while
/// encoding the state for a snapshot request.
///
/// Unexpected tier: fatal during `Init` and replay, where state integrity
/// can no longer be trusted. A snapshot request that fails to encode is
/// answered with a `Failure` and the channel stays active.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("failed to decode snapshot state at sequence {sequence_number}: {source}")]
    SnapshotDecode {
        sequence_number: SequenceNumber,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode replayed event {sequence_number}: {source}")]
    EventDecode {
        sequence_number: SequenceNumber,
        #[source]
        source: serde_json::Error,
    },

    #[error("applying replayed event {sequence_number} panicked")]
    ApplyPanicked { sequence_number: SequenceNumber },

    #[error("failed to encode current state: {0}")]
    StateEncoding(#[source] serde_json::Error),
}

/// Error returned when opening or writing to an entity channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// Only one authoritative stream may exist per entity instance. Also
    /// returned while a released worker is still draining its queues.
    #[error("entity [{0}] already has a live channel")]
    AlreadyOpen(EntityId),

    /// The worker owning the channel has exited.
    #[error("entity worker is no longer running")]
    WorkerGone,
}

/// Error seeding an [`EntityTestKit`](crate::EntityTestKit) with history.
#[derive(Debug, thiserror::Error)]
pub enum TestKitError {
    #[error("failed to encode history event: {0}")]
    Encoding(#[from] serde_json::Error),

    /// The history was refused; carries the failure description.
    #[error("history rejected: {0}")]
    Rejected(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejected_displays_message_only() {
        let err = HandlerError::rejected_with_code("No order found for o-1", ErrorCode::NotFound);
        assert_eq!(err.to_string(), "No order found for o-1");
    }

    #[test]
    fn unexpected_wraps_source() {
        let io = std::io::Error::other("disk on fire");
        let err = HandlerError::unexpected(io);
        assert!(err.to_string().contains("disk on fire"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn context_error_converts_into_handler_error() {
        let ctx_err = ContextError::Inactive {
            operation: "increaseBy".into(),
        };
        let err: HandlerError = ctx_err.clone().into();
        assert!(matches!(err, HandlerError::Context(ref e) if *e == ctx_err));
    }

    #[test]
    fn protocol_error_mentions_both_identities() {
        let err = ProtocolError::EntityMismatch {
            expected: EntityId::from("a"),
            received: EntityId::from("b"),
        };
        let text = err.to_string();
        assert!(text.contains("[a]") && text.contains("[b]"), "got: {text}");
    }

    #[test]
    fn sequence_gap_display() {
        let err = ProtocolError::SequenceGap {
            expected: 3,
            received: 5,
        };
        assert_eq!(
            err.to_string(),
            "replayed event has sequence number 5, expected 3"
        );
    }

    #[test]
    fn channel_error_display() {
        assert_eq!(
            ChannelError::WorkerGone.to_string(),
            "entity worker is no longer running"
        );
    }

    // Errors cross task boundaries through tokio channels and join handles.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<ProtocolError>();
            assert_send_sync::<HandlerError>();
            assert_send_sync::<DispatchError>();
            assert_send_sync::<ReplayError>();
            assert_send_sync::<ChannelError>();
        }
    };
}
