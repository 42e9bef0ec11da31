//! Declarative command outcomes and their interpretation.
//!
//! Entity logic returns an [`Effect`]; [`interpret`] validates it against
//! the entity's [`StateModel`], folds any emitted events over a copy of the
//! current state, consults the [`SnapshotPolicy`], and produces a
//! [`CommandResult`] ready to be committed and written back.

use std::panic::{AssertUnwindSafe, catch_unwind};

use serde::Serialize;
use serde_json::Value;

use crate::error::EffectDefect;
use crate::message::{ClientAction, ErrorCode, EventRecord, ForwardTarget, SequenceNumber, Snapshot};
use crate::snapshot::SnapshotPolicy;

/// How an entity's state is allowed to change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateModel {
    /// State changes only by applying emitted events.
    ///
    /// With `require_events`, every successful command must emit at least
    /// one event as evidence of the mutation.
    EventSourced { require_events: bool },
    /// State is a single record replaced wholesale; no events.
    KeyValue,
}

impl Default for StateModel {
    fn default() -> Self {
        Self::EventSourced {
            require_events: false,
        }
    }
}

#[derive(Debug)]
enum Outcome {
    Reply(Result<Value, serde_json::Error>),
    Error {
        message: String,
        code: Option<ErrorCode>,
    },
    Forward(ForwardTarget),
    NoReply,
}

/// Intended outcome of a command handler.
///
/// # Examples
///
/// ```
/// use entity_stream::{Effect, ErrorCode};
/// use serde_json::json;
///
/// #[derive(Clone, serde::Serialize, serde::Deserialize)]
/// struct Increased { by: i64 }
///
/// let ok: Effect<i64, Increased> = Effect::persist([Increased { by: 2 }]).then_reply(json!({"value": 2}));
/// let rejected: Effect<i64, Increased> = Effect::error_with_code("negative", ErrorCode::InvalidArgument);
/// # let _ = (ok, rejected);
/// ```
#[derive(Debug)]
#[must_use = "an effect does nothing unless returned from a handler"]
pub struct Effect<S, E> {
    events: Vec<E>,
    new_state: Option<S>,
    outcome: Outcome,
    delete: bool,
}

impl<S, E> Effect<S, E> {
    fn with_outcome(outcome: Outcome) -> Self {
        Self {
            events: Vec::new(),
            new_state: None,
            outcome,
            delete: false,
        }
    }

    /// Reply with `payload` and change nothing.
    pub fn reply(payload: impl Serialize) -> Self {
        Self::with_outcome(Outcome::Reply(serde_json::to_value(payload)))
    }

    /// Complete without a reply payload.
    pub fn no_reply() -> Self {
        Self::with_outcome(Outcome::NoReply)
    }

    /// Hand the reply off to another component.
    pub fn forward(target: ForwardTarget) -> Self {
        Self::with_outcome(Outcome::Forward(target))
    }

    /// Reject the command. Carries no events and changes nothing.
    pub fn error(message: impl Into<String>) -> Self {
        Self::with_outcome(Outcome::Error {
            message: message.into(),
            code: None,
        })
    }

    pub fn error_with_code(message: impl Into<String>, code: ErrorCode) -> Self {
        Self::with_outcome(Outcome::Error {
            message: message.into(),
            code: Some(code),
        })
    }

    /// Emit events; chain a `then_*` call to choose the reply.
    pub fn persist(events: impl IntoIterator<Item = E>) -> Self {
        Self {
            events: events.into_iter().collect(),
            ..Self::no_reply()
        }
    }

    /// Replace the whole state (key-value entities).
    pub fn update_state(state: S) -> Self {
        Self {
            new_state: Some(state),
            ..Self::no_reply()
        }
    }

    /// Retire the entity once this command's reply has been sent.
    pub fn delete_entity() -> Self {
        Self {
            delete: true,
            ..Self::no_reply()
        }
    }

    pub fn then_reply(mut self, payload: impl Serialize) -> Self {
        self.outcome = Outcome::Reply(serde_json::to_value(payload));
        self
    }

    pub fn then_forward(mut self, target: ForwardTarget) -> Self {
        self.outcome = Outcome::Forward(target);
        self
    }

    pub fn then_no_reply(mut self) -> Self {
        self.outcome = Outcome::NoReply;
        self
    }

    /// Append more events to this effect.
    pub fn and_persist(mut self, events: impl IntoIterator<Item = E>) -> Self {
        self.events.extend(events);
        self
    }

    pub fn and_delete(mut self) -> Self {
        self.delete = true;
        self
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, Outcome::Error { .. })
    }
}

/// Normalized outcome of one command, not yet committed.
#[derive(Debug)]
pub struct CommandResult<S> {
    pub events: Vec<EventRecord>,
    pub client_action: ClientAction,
    pub snapshot: Option<Snapshot>,
    pub end_sequence_number: SequenceNumber,
    pub delete_entity: bool,
    pub state_update: Option<Value>,
    /// State to install on commit; `None` leaves the state as it was.
    pub(crate) next_state: Option<S>,
}

/// Inputs the interpreter needs besides the effect itself.
#[derive(Debug, Clone, Copy)]
pub struct Interpretation<'a> {
    pub operation: &'a str,
    pub model: StateModel,
    pub policy: SnapshotPolicy,
    /// Sequence number before the command.
    pub sequence_number: SequenceNumber,
}

fn check_shape<S, E>(
    effect: &Effect<S, E>,
    model: StateModel,
    operation: &str,
) -> Result<(), EffectDefect> {
    if effect.delete {
        match effect.outcome {
            Outcome::NoReply => return Err(EffectDefect::DeleteWithoutReply),
            Outcome::Error { .. } => return Err(EffectDefect::DeleteOnError),
            _ => {}
        }
    }
    if effect.is_error() {
        return Ok(());
    }
    match model {
        StateModel::EventSourced { require_events } => {
            if effect.new_state.is_some() {
                return Err(EffectDefect::StateReplacement);
            }
            if require_events && effect.events.is_empty() {
                return Err(EffectDefect::MissingMutation {
                    operation: operation.to_owned(),
                });
            }
        }
        StateModel::KeyValue => {
            if !effect.events.is_empty() {
                return Err(EffectDefect::EventsOnKeyValue);
            }
        }
    }
    Ok(())
}

/// Normalize `effect` into a [`CommandResult`].
///
/// `apply` folds emitted events over a clone of `state`; the caller's state
/// is never touched, so a defect leaves the entity exactly as it was.
///
/// # Errors
///
/// Returns an [`EffectDefect`] when the effect violates the state model or
/// the Effect contract, or when encoding or event application fails.
pub fn interpret<S, E, F>(
    effect: Effect<S, E>,
    state: &S,
    apply: F,
    params: Interpretation<'_>,
) -> Result<CommandResult<S>, EffectDefect>
where
    S: Clone + Serialize,
    E: Serialize,
    F: Fn(S, &E) -> S,
{
    check_shape(&effect, params.model, params.operation)?;

    let Effect {
        events,
        new_state,
        outcome,
        delete,
    } = effect;

    let client_action = match outcome {
        Outcome::Error { message, code } => {
            return Ok(CommandResult {
                events: Vec::new(),
                client_action: ClientAction::Error { message, code },
                snapshot: None,
                end_sequence_number: params.sequence_number,
                delete_entity: false,
                state_update: None,
                next_state: None,
            });
        }
        Outcome::Reply(payload) => ClientAction::Reply {
            payload: payload.map_err(EffectDefect::ReplyEncoding)?,
        },
        Outcome::Forward(target) => ClientAction::Forward { target },
        Outcome::NoReply => ClientAction::NoReply,
    };

    let mut records = Vec::with_capacity(events.len());
    for (offset, event) in events.iter().enumerate() {
        records.push(EventRecord {
            sequence_number: params.sequence_number + offset as SequenceNumber + 1,
            payload: serde_json::to_value(event).map_err(EffectDefect::EventEncoding)?,
        });
    }
    let end_sequence_number = params.sequence_number + records.len() as SequenceNumber;

    let (next_state, state_update) = match new_state {
        Some(replacement) => {
            let encoded = serde_json::to_value(&replacement).map_err(EffectDefect::StateEncoding)?;
            (Some(replacement), Some(encoded))
        }
        None if events.is_empty() => (None, None),
        None => {
            let start = state.clone();
            let folded = catch_unwind(AssertUnwindSafe(|| {
                events.iter().fold(start, |acc, event| apply(acc, event))
            }))
            .map_err(|_| EffectDefect::ApplyPanicked)?;
            (Some(folded), None)
        }
    };

    let snapshot = match &next_state {
        Some(next) if !events.is_empty() && params.policy.should_snapshot(end_sequence_number) => {
            Some(Snapshot {
                sequence_number: end_sequence_number,
                state: serde_json::to_value(next).map_err(EffectDefect::StateEncoding)?,
            })
        }
        _ => None,
    };

    Ok(CommandResult {
        events: records,
        client_action,
        snapshot,
        end_sequence_number,
        delete_entity: delete,
        state_update,
        next_state,
    })
}
