//! Error classification and the logging contract for each tier.
//!
//! Every failure the stream adapter can hit falls into one of three tiers:
//!
//! | Tier | Logged at | Outbound message | Channel |
//! |---|---|---|---|
//! | [`ErrorTier::Protocol`] | `error`, with correlation id | `Failure` | terminated |
//! | [`ErrorTier::Validation`] | `debug` | `Reply` with `ClientAction::Error` | stays active |
//! | [`ErrorTier::Unexpected`] | `error`, with correlation id | `Failure` | stays active, unless raised outside `Active` |

use uuid::Uuid;

use crate::error::{DispatchError, HandlerError, ProtocolError, ReplayError};
use crate::message::{ClientAction, EntityId, ErrorCode, Failure};
use crate::stream::Phase;

/// Severity class of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorTier {
    /// Malformed or out-of-order message sequence.
    Protocol,
    /// Business rejection: an expected outcome, not a fault.
    Validation,
    /// Anything else raised by entity logic or internal processing.
    Unexpected,
}

impl ErrorTier {
    /// Whether a failure of this tier, raised during `phase`, terminates
    /// the channel.
    ///
    /// # Examples
    ///
    /// ```
    /// use entity_stream::{ErrorTier, Phase};
    ///
    /// assert!(ErrorTier::Protocol.is_fatal_in(Phase::Active));
    /// assert!(!ErrorTier::Unexpected.is_fatal_in(Phase::Active));
    /// assert!(ErrorTier::Unexpected.is_fatal_in(Phase::Replaying));
    /// assert!(!ErrorTier::Validation.is_fatal_in(Phase::Active));
    /// ```
    pub fn is_fatal_in(self, phase: Phase) -> bool {
        match self {
            ErrorTier::Protocol => true,
            ErrorTier::Validation => false,
            ErrorTier::Unexpected => phase != Phase::Active,
        }
    }
}

/// Tier of a per-command failure.
///
/// Explicit rejections and payloads that do not decode are validation
/// failures; everything else, including unknown operations, handler panics
/// and effect defects, is unexpected.
pub fn tier_of(err: &DispatchError) -> ErrorTier {
    match err {
        DispatchError::Handler(HandlerError::Rejected { .. })
        | DispatchError::InvalidPayload { .. } => ErrorTier::Validation,
        DispatchError::UnknownOperation(_)
        | DispatchError::Handler(_)
        | DispatchError::Panicked(_)
        | DispatchError::Effect(_) => ErrorTier::Unexpected,
    }
}

/// What a failed command turns into on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandFailure {
    /// Business rejection, sent back as an error client action.
    Rejected(ClientAction),
    /// Unexpected failure, sent back as a `Failure`.
    Failed(Failure),
}

/// Builds outbound failures and logs them according to their tier.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ErrorClassifier<'a> {
    pub entity_type: &'static str,
    pub entity_id: Option<&'a EntityId>,
}

impl<'a> ErrorClassifier<'a> {
    pub(crate) fn new(entity_type: &'static str, entity_id: Option<&'a EntityId>) -> Self {
        Self {
            entity_type,
            entity_id,
        }
    }

    fn entity(&self) -> &str {
        self.entity_id.map_or("", EntityId::as_str)
    }

    /// Fatal protocol violation. `command_id` is set when a command
    /// triggered it, so the caller still gets a terminal response.
    pub(crate) fn protocol(&self, err: &ProtocolError, command_id: Option<u64>) -> Failure {
        let correlation_id = Uuid::new_v4();
        tracing::error!(
            entity_type = self.entity_type,
            entity_id = %self.entity(),
            command_id,
            correlation_id = %correlation_id,
            error = %err,
            "protocol violation, terminating channel"
        );
        Failure {
            command_id,
            description: format!("protocol violation: {err} [{correlation_id}]"),
            correlation_id: Some(correlation_id),
        }
    }

    /// Unexpected failure while seeding or replaying history, or while
    /// encoding the current state. Raised during `phase`, which decides
    /// whether the channel survives it.
    pub(crate) fn recovery(&self, err: &ReplayError, phase: Phase) -> Failure {
        let correlation_id = Uuid::new_v4();
        tracing::error!(
            entity_type = self.entity_type,
            entity_id = %self.entity(),
            correlation_id = %correlation_id,
            error = %err,
            phase = ?phase,
            terminating = ErrorTier::Unexpected.is_fatal_in(phase),
            "unexpected entity failure"
        );
        Failure {
            command_id: None,
            description: format!("unexpected error [{correlation_id}]"),
            correlation_id: Some(correlation_id),
        }
    }

    /// Classify a per-command failure, log it, and build its outbound form.
    pub(crate) fn command(
        &self,
        operation: &str,
        command_id: u64,
        err: DispatchError,
    ) -> CommandFailure {
        match tier_of(&err) {
            ErrorTier::Validation => {
                tracing::debug!(
                    entity_type = self.entity_type,
                    entity_id = %self.entity(),
                    operation,
                    command_id,
                    reason = %err,
                    "command rejected"
                );
                CommandFailure::Rejected(rejection(err))
            }
            ErrorTier::Protocol | ErrorTier::Unexpected => {
                let correlation_id = Uuid::new_v4();
                tracing::error!(
                    entity_type = self.entity_type,
                    entity_id = %self.entity(),
                    operation,
                    command_id,
                    correlation_id = %correlation_id,
                    error = %err,
                    "command failed unexpectedly"
                );
                CommandFailure::Failed(Failure {
                    command_id: Some(command_id),
                    description: format!("unexpected error [{correlation_id}]"),
                    correlation_id: Some(correlation_id),
                })
            }
        }
    }
}

fn rejection(err: DispatchError) -> ClientAction {
    match err {
        DispatchError::Handler(HandlerError::Rejected { message, code }) => {
            ClientAction::Error { message, code }
        }
        other => ClientAction::Error {
            message: other.to_string(),
            code: Some(ErrorCode::InvalidArgument),
        },
    }
}
