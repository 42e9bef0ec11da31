//! Stream protocol adapter: the per-entity protocol state machine.
//!
//! One [`EntityStream`] owns one entity channel. It consumes inbound
//! messages strictly in arrival order and produces at most one outbound
//! message for each:
//!
//! ```text
//! AwaitingInit --Init--> Replaying --Command | SnapshotRequest--> Active
//!       |                    |                                     |
//!       +--------------------+------- fatal failure ---------------+--> Terminated
//! ```
//!
//! Replayed events never produce output. Every command produces exactly one
//! `Reply` or `Failure`, and every snapshot request exactly one
//! `SnapshotReply` or a `Failure`.
//!
//! Whether a failure ends the channel is decided by
//! [`ErrorTier::is_fatal_in`](crate::ErrorTier::is_fatal_in) for the phase
//! it was raised in.

use std::fmt;
use std::future::Future;
use std::mem;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_stream::{Stream, StreamExt};
use tracing::Instrument;

use crate::classify::{CommandFailure, ErrorClassifier, ErrorTier, tier_of};
use crate::command::ContextScope;
use crate::effect::{self, Interpretation, StateModel};
use crate::entity::{CommandRouter, Entity};
use crate::error::{DispatchError, ProtocolError, ReplayError};
use crate::message::{
    Command, EntityId, EventRecord, Failure, InboundMessage, Init, OutboundMessage, Reply,
    SequenceNumber, Snapshot, SnapshotReply, SnapshotRequest,
};
use crate::sequence::SequenceTracker;
use crate::snapshot::SnapshotPolicy;
use crate::telemetry::{SpanInfo, SpanOutcome, Tracer, TracingTracer};

/// Lifecycle phase of an entity channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    AwaitingInit,
    Replaying,
    Active,
    Terminated,
}

/// Per-channel settings.
#[derive(Clone)]
pub struct StreamOptions {
    pub policy: SnapshotPolicy,
    pub tracer: Arc<dyn Tracer>,
    /// Identity the channel was opened for. An `Init` naming another entity
    /// is a protocol violation.
    pub expected_entity: Option<EntityId>,
    /// Discard any snapshot carried by `Init`; set for recently deleted
    /// identities.
    pub ignore_init_snapshot: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            policy: SnapshotPolicy::default(),
            tracer: Arc::new(TracingTracer),
            expected_entity: None,
            ignore_init_snapshot: false,
        }
    }
}

impl fmt::Debug for StreamOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamOptions")
            .field("policy", &self.policy)
            .field("expected_entity", &self.expected_entity)
            .field("ignore_init_snapshot", &self.ignore_init_snapshot)
            .finish_non_exhaustive()
    }
}

/// Why [`EntityStream::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamExit {
    /// The host closed the inbound side.
    InboundClosed,
    /// Nobody is reading outbound messages any more.
    OutboundClosed,
    /// A fatal failure was reported.
    Terminated,
    /// No message arrived within the passivation timeout.
    Passivated,
}

/// Summary of a finished channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamReport {
    pub exit: StreamExit,
    pub entity_id: Option<EntityId>,
    /// The entity was deleted and not recreated before the channel ended.
    pub deleted: bool,
}

struct Instance<S> {
    state: S,
    sequence: SequenceTracker,
}

impl<S> Instance<S> {
    fn fresh(state: S) -> Self {
        Self {
            state,
            sequence: SequenceTracker::new(),
        }
    }
}

/// The stream protocol adapter for one entity instance.
///
/// Owns the instance's state exclusively; entity logic only ever receives
/// clones of it.
pub struct EntityStream<L: Entity> {
    logic: Arc<L>,
    router: Arc<CommandRouter<L::State, L::Event>>,
    model: StateModel,
    options: StreamOptions,
    phase: Phase,
    entity_id: Option<EntityId>,
    instance: Option<Instance<L::State>>,
    deleted: bool,
}

impl<L: Entity> EntityStream<L> {
    pub fn new(logic: L) -> Self {
        Self::with_options(logic, StreamOptions::default())
    }

    pub fn with_options(logic: L, options: StreamOptions) -> Self {
        let router = Arc::new(logic.routes());
        Self::with_shared(Arc::new(logic), router, options)
    }

    /// Build a stream that shares its logic and routing table with others
    /// of the same entity type.
    pub(crate) fn with_shared(
        logic: Arc<L>,
        router: Arc<CommandRouter<L::State, L::Event>>,
        options: StreamOptions,
    ) -> Self {
        let model = logic.state_model();
        Self {
            logic,
            router,
            model,
            options,
            phase: Phase::AwaitingInit,
            entity_id: None,
            instance: None,
            deleted: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn entity_id(&self) -> Option<&EntityId> {
        self.entity_id.as_ref()
    }

    /// Current sequence number, or `None` before `Init` or after deletion.
    pub fn sequence_number(&self) -> Option<SequenceNumber> {
        self.instance.as_ref().map(|i| i.sequence.current())
    }

    /// Sequence number of the last snapshot taken or seeded from.
    pub fn last_snapshot(&self) -> Option<SequenceNumber> {
        self.instance.as_ref().map(|i| i.sequence.last_snapshot())
    }

    pub fn state(&self) -> Option<&L::State> {
        self.instance.as_ref().map(|i| &i.state)
    }

    pub fn was_deleted(&self) -> bool {
        self.deleted
    }

    /// Process one inbound message.
    ///
    /// # Returns
    ///
    /// The outbound message it produced, if any. Replayed events produce
    /// nothing; after termination only commands are answered.
    pub async fn handle(&mut self, message: InboundMessage) -> Option<OutboundMessage> {
        match (self.phase, message) {
            (Phase::Terminated, InboundMessage::Command(command)) => {
                Some(terminated_failure(command.command_id))
            }
            (Phase::Terminated, _) => None,
            (Phase::AwaitingInit, InboundMessage::Init(init)) => self.on_init(init),
            (Phase::AwaitingInit, other) => {
                let command_id = match &other {
                    InboundMessage::Command(c) => Some(c.command_id),
                    _ => None,
                };
                Some(self.protocol_violation(
                    ProtocolError::NotInitialized {
                        received: other.kind(),
                    },
                    command_id,
                ))
            }
            (_, InboundMessage::Init(init)) => Some(self.protocol_violation(
                ProtocolError::DuplicateInit {
                    entity_id: init.entity_id,
                },
                None,
            )),
            (Phase::Replaying, InboundMessage::Event(event)) => self.on_replay(event),
            (_, InboundMessage::Event(event)) => Some(self.protocol_violation(
                ProtocolError::EventAfterActive {
                    sequence_number: event.sequence_number,
                },
                None,
            )),
            (_, InboundMessage::Command(command)) => {
                self.phase = Phase::Active;
                Some(self.on_command(command).await)
            }
            (_, InboundMessage::SnapshotRequest(request)) => {
                self.phase = Phase::Active;
                Some(self.on_snapshot_request(request))
            }
        }
    }

    /// Drive the channel until it closes, terminates, or idles out.
    ///
    /// # Arguments
    ///
    /// * `inbound` - Ordered inbound messages for this channel.
    /// * `outbound` - Where replies are written, in processing order.
    /// * `passivation` - Stop after this long without any inbound message.
    pub async fn run<St>(
        mut self,
        mut inbound: St,
        outbound: mpsc::Sender<OutboundMessage>,
        passivation: Option<Duration>,
    ) -> StreamReport
    where
        St: Stream<Item = InboundMessage> + Unpin,
    {
        let span = tracing::info_span!(
            "entity",
            entity_type = L::ENTITY_TYPE,
            entity_id = self
                .options
                .expected_entity
                .as_ref()
                .map_or("", EntityId::as_str),
        );
        let exit = async {
            loop {
                let next = match passivation {
                    Some(idle) => match tokio::time::timeout(idle, inbound.next()).await {
                        Ok(next) => next,
                        Err(_elapsed) => {
                            tracing::info!(
                                entity_type = L::ENTITY_TYPE,
                                "entity idle, passivating"
                            );
                            break StreamExit::Passivated;
                        }
                    },
                    None => inbound.next().await,
                };
                let Some(message) = next else {
                    break StreamExit::InboundClosed;
                };
                if let Some(reply) = self.handle(message).await
                    && outbound.send(reply).await.is_err()
                {
                    tracing::debug!("outbound side closed, stopping");
                    break StreamExit::OutboundClosed;
                }
                if self.phase == Phase::Terminated {
                    break StreamExit::Terminated;
                }
            }
        }
        .instrument(span)
        .await;

        StreamReport {
            exit,
            entity_id: self.entity_id.or(self.options.expected_entity),
            deleted: self.deleted,
        }
    }

    pub(crate) fn on_init(&mut self, init: Init) -> Option<OutboundMessage> {
        if let Some(expected) = &self.options.expected_entity
            && *expected != init.entity_id
        {
            let err = ProtocolError::EntityMismatch {
                expected: expected.clone(),
                received: init.entity_id,
            };
            return Some(self.protocol_violation(err, None));
        }
        self.entity_id = Some(init.entity_id);

        let snapshot = match init.snapshot {
            Some(snapshot) if self.options.ignore_init_snapshot => {
                tracing::warn!(
                    entity_type = L::ENTITY_TYPE,
                    entity_id = %self.id_str(),
                    sequence_number = snapshot.sequence_number,
                    "ignoring snapshot of a recently deleted entity"
                );
                None
            }
            other => other,
        };

        let instance = match snapshot {
            Some(Snapshot {
                sequence_number,
                state,
            }) => match serde_json::from_value(state) {
                Ok(state) => Instance {
                    state,
                    sequence: SequenceTracker::from_snapshot(sequence_number),
                },
                Err(source) => {
                    return Some(self.unexpected_failure(ReplayError::SnapshotDecode {
                        sequence_number,
                        source,
                    }));
                }
            },
            None => Instance::fresh(self.logic.empty_state()),
        };

        tracing::debug!(
            entity_type = L::ENTITY_TYPE,
            entity_id = %self.id_str(),
            sequence_number = instance.sequence.current(),
            "entity initialized"
        );
        self.instance = Some(instance);
        self.phase = Phase::Replaying;
        None
    }

    pub(crate) fn on_replay(&mut self, record: EventRecord) -> Option<OutboundMessage> {
        let logic = &self.logic;
        let instance = self
            .instance
            .get_or_insert_with(|| Instance::fresh(logic.empty_state()));

        if let Err(err) = instance.sequence.record_replayed(record.sequence_number) {
            return Some(self.protocol_violation(err, None));
        }

        let event: L::Event = match serde_json::from_value(record.payload) {
            Ok(event) => event,
            Err(source) => {
                return Some(self.unexpected_failure(ReplayError::EventDecode {
                    sequence_number: record.sequence_number,
                    source,
                }));
            }
        };

        let current = mem::replace(&mut instance.state, logic.empty_state());
        match catch_unwind(AssertUnwindSafe(|| logic.apply_event(current, &event))) {
            Ok(next) => {
                instance.state = next;
                None
            }
            Err(_) => Some(self.unexpected_failure(ReplayError::ApplyPanicked {
                sequence_number: record.sequence_number,
            })),
        }
    }

    async fn on_command(&mut self, command: Command) -> OutboundMessage {
        let Command {
            command_id,
            entity_id,
            operation,
            payload,
            metadata,
        } = command;

        let own_id = match &self.entity_id {
            Some(own) if *own == entity_id => own.clone(),
            _ => {
                let err = ProtocolError::EntityMismatch {
                    expected: self.entity_id.clone().unwrap_or_else(|| EntityId::new("")),
                    received: entity_id,
                };
                return self.protocol_violation(err, Some(command_id));
            }
        };

        let (state, sequence_number) = {
            let instance = self.live_instance();
            (instance.state.clone(), instance.sequence.current())
        };

        let tracer = Arc::clone(&self.options.tracer);
        let trace = tracer.start_span(&SpanInfo {
            entity_type: L::ENTITY_TYPE,
            entity_id: &own_id,
            operation: &operation,
            command_id,
            metadata: &metadata,
        });

        let scope = ContextScope::open(
            own_id,
            sequence_number,
            &operation,
            command_id,
            metadata,
            trace.clone(),
        );
        let handled = match self
            .router
            .dispatch(&operation, state, scope.context(), payload)
        {
            Ok(future) => match HandlerTask::spawn(future.instrument(trace.span().clone())).await {
                Ok(result) => result.map_err(DispatchError::from),
                Err(_join) => Err(DispatchError::Panicked(operation.clone())),
            },
            Err(err) => Err(err),
        };
        drop(scope);

        let interpreted = match handled {
            Ok(effect) => {
                let logic = &self.logic;
                let instance = self
                    .instance
                    .get_or_insert_with(|| Instance::fresh(logic.empty_state()));
                effect::interpret(
                    effect,
                    &instance.state,
                    |state, event| logic.apply_event(state, event),
                    Interpretation {
                        operation: &operation,
                        model: self.model,
                        policy: self.options.policy,
                        sequence_number,
                    },
                )
                .map_err(DispatchError::from)
            }
            Err(err) => Err(err),
        };

        let (message, outcome) = match interpreted {
            Ok(result) => {
                let outcome = if result.client_action.is_error() {
                    tracing::debug!(
                        entity_type = L::ENTITY_TYPE,
                        entity_id = %self.id_str(),
                        operation = %operation,
                        command_id,
                        "command rejected"
                    );
                    SpanOutcome::Rejected
                } else {
                    SpanOutcome::Replied
                };

                if let Some(instance) = self.instance.as_mut() {
                    if let Some(next) = result.next_state {
                        instance.state = next;
                    }
                    let end = instance.sequence.advance(result.events.len());
                    if let Some(snapshot) = &result.snapshot {
                        instance.sequence.mark_snapshot(snapshot.sequence_number);
                    }
                    if !result.events.is_empty() {
                        tracing::debug!(
                            count = result.events.len(),
                            sequence_number = end,
                            snapshot = result.snapshot.is_some(),
                            "events emitted"
                        );
                    }
                }
                if result.delete_entity {
                    tracing::info!(
                        entity_type = L::ENTITY_TYPE,
                        entity_id = %self.id_str(),
                        "entity deleted"
                    );
                    self.instance = None;
                    self.deleted = true;
                }

                let reply = Reply {
                    command_id,
                    client_action: result.client_action,
                    emitted_events: result.events,
                    snapshot: result.snapshot,
                    state_update: result.state_update,
                    delete_after: result.delete_entity,
                };
                (OutboundMessage::Reply(reply), outcome)
            }
            Err(err) => {
                let tier = tier_of(&err);
                let failure = self.classifier().command(&operation, command_id, err);
                self.terminate_if_fatal(tier);
                match failure {
                    CommandFailure::Rejected(client_action) => (
                        OutboundMessage::Reply(Reply {
                            command_id,
                            client_action,
                            emitted_events: Vec::new(),
                            snapshot: None,
                            state_update: None,
                            delete_after: false,
                        }),
                        SpanOutcome::Rejected,
                    ),
                    CommandFailure::Failed(failure) => {
                        (OutboundMessage::Failure(failure), SpanOutcome::Failed)
                    }
                }
            }
        };

        tracer.end_span(&trace, outcome);
        message
    }

    fn on_snapshot_request(&mut self, request: SnapshotRequest) -> OutboundMessage {
        let instance = self.live_instance();
        let sequence_number = instance.sequence.current();
        match serde_json::to_value(&instance.state) {
            Ok(state) => OutboundMessage::SnapshotReply(SnapshotReply {
                request_id: request.request_id,
                snapshot: Snapshot {
                    sequence_number,
                    state,
                },
            }),
            Err(err) => self.unexpected_failure(ReplayError::StateEncoding(err)),
        }
    }

    /// The current instance, recreated from the empty state after deletion.
    fn live_instance(&mut self) -> &mut Instance<L::State> {
        if self.instance.is_none() && self.deleted {
            tracing::debug!(
                entity_type = L::ENTITY_TYPE,
                entity_id = %self.id_str(),
                "recreating deleted entity from empty state"
            );
            self.deleted = false;
        }
        let logic = &self.logic;
        self.instance
            .get_or_insert_with(|| Instance::fresh(logic.empty_state()))
    }

    fn id_str(&self) -> &str {
        self.entity_id.as_ref().map_or("", EntityId::as_str)
    }

    fn classifier(&self) -> ErrorClassifier<'_> {
        ErrorClassifier::new(L::ENTITY_TYPE, self.entity_id.as_ref())
    }

    fn protocol_violation(&mut self, err: ProtocolError, command_id: Option<u64>) -> OutboundMessage {
        let failure = self.classifier().protocol(&err, command_id);
        self.terminate_if_fatal(ErrorTier::Protocol);
        OutboundMessage::Failure(failure)
    }

    fn unexpected_failure(&mut self, err: ReplayError) -> OutboundMessage {
        let failure = self.classifier().recovery(&err, self.phase);
        self.terminate_if_fatal(ErrorTier::Unexpected);
        OutboundMessage::Failure(failure)
    }

    fn terminate_if_fatal(&mut self, tier: ErrorTier) {
        if tier.is_fatal_in(self.phase) {
            self.phase = Phase::Terminated;
        }
    }
}

/// A spawned command handler that is aborted when dropped.
///
/// The handler runs on its own task so a panic surfaces as a `JoinError`.
/// If the command's processing is cancelled, the handler goes with it.
struct HandlerTask<T>(JoinHandle<T>);

impl<T: Send + 'static> HandlerTask<T> {
    fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self(tokio::spawn(future))
    }
}

impl<T> Future for HandlerTask<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl<T> Drop for HandlerTask<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn terminated_failure(command_id: u64) -> OutboundMessage {
    OutboundMessage::Failure(Failure {
        command_id: Some(command_id),
        description: "channel terminated".to_owned(),
        correlation_id: None,
    })
}
