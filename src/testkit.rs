//! In-memory harness for unit-testing entity logic.
//!
//! Drives the same adapter the workers use, without a channel or a worker
//! task, so handlers see exactly the semantics they get in production.
//!
//! ```
//! use entity_stream::{CommandRouter, Effect, Entity, EntityTestKit, NoEvent, StateModel};
//! use serde_json::json;
//!
//! struct Counter;
//!
//! #[derive(serde::Deserialize)]
//! struct IncreaseBy { value: i64 }
//!
//! impl Entity for Counter {
//!     const ENTITY_TYPE: &'static str = "counter";
//!     type State = i64;
//!     type Event = NoEvent;
//!     fn state_model(&self) -> StateModel { StateModel::KeyValue }
//!     fn empty_state(&self) -> i64 { 0 }
//!     fn apply_event(&self, state: i64, event: &NoEvent) -> i64 { match *event {} }
//!     fn routes(&self) -> CommandRouter<i64, NoEvent> {
//!         CommandRouter::new().on("increaseBy", |s: i64, _ctx, cmd: IncreaseBy| async move {
//!             Ok(Effect::update_state(s + cmd.value).then_reply(s + cmd.value))
//!         })
//!     }
//! }
//!
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let mut kit = EntityTestKit::of(Counter);
//! let result = kit.call("increaseBy", json!({"value": 10})).await;
//! assert!(result.is_reply());
//! assert_eq!(result.reply::<i64>(), Some(10));
//! assert_eq!(kit.state(), 10);
//! # });
//! ```

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::entity::Entity;
use crate::error::TestKitError;
use crate::message::{
    ClientAction, Command, EntityId, ErrorCode, EventRecord, Failure, InboundMessage, Init,
    OutboundMessage, Reply, SequenceNumber, Snapshot, SnapshotRequest,
};
use crate::stream::{EntityStream, StreamOptions};
use crate::telemetry::NoopTracer;

/// Entity id used by [`EntityTestKit::of`].
pub const DEFAULT_TEST_ENTITY_ID: &str = "testkit-entity-id";

/// Test harness holding one entity instance.
pub struct EntityTestKit<L: Entity> {
    logic: Arc<L>,
    stream: EntityStream<L>,
    next_id: u64,
}

impl<L: Entity> EntityTestKit<L> {
    pub fn of(logic: L) -> Self {
        Self::with_entity_id(logic, DEFAULT_TEST_ENTITY_ID)
    }

    pub fn with_entity_id(logic: L, entity_id: impl Into<EntityId>) -> Self {
        let logic = Arc::new(logic);
        let router = Arc::new(logic.routes());
        let options = StreamOptions {
            tracer: Arc::new(NoopTracer),
            ..StreamOptions::default()
        };
        let mut stream = EntityStream::with_shared(Arc::clone(&logic), router, options);
        stream.on_init(Init {
            entity_id: entity_id.into(),
            snapshot: None,
        });
        Self {
            logic,
            stream,
            next_id: 1,
        }
    }

    /// Replay `events` as persisted history, numbered from the current
    /// sequence number.
    ///
    /// # Errors
    ///
    /// [`TestKitError`] if an event does not encode or the replay fails.
    pub fn with_history(
        mut self,
        events: impl IntoIterator<Item = L::Event>,
    ) -> Result<Self, TestKitError> {
        for event in events {
            let sequence_number = self.sequence_number() + 1;
            let record = EventRecord {
                sequence_number,
                payload: serde_json::to_value(&event)?,
            };
            if let Some(OutboundMessage::Failure(failure)) = self.stream.on_replay(record) {
                return Err(TestKitError::Rejected(failure.description));
            }
        }
        Ok(self)
    }

    /// Run `operation` with `payload` and return the outcome.
    ///
    /// Pass `Value::Null` for operations that take no payload.
    pub async fn call(&mut self, operation: &str, payload: Value) -> TestResult {
        let command_id = self.next_id;
        self.next_id += 1;
        let entity_id = self
            .stream
            .entity_id()
            .cloned()
            .unwrap_or_else(|| EntityId::new(DEFAULT_TEST_ENTITY_ID));
        let command = Command::new(command_id, entity_id, operation, Some(payload));
        let out = self
            .stream
            .handle(InboundMessage::Command(command))
            .await
            .unwrap_or_else(|| {
                OutboundMessage::Failure(Failure {
                    command_id: Some(command_id),
                    description: "no response".to_owned(),
                    correlation_id: None,
                })
            });
        TestResult { out }
    }

    /// Snapshot of the current state, as a `SnapshotRequest` would return it.
    pub async fn snapshot(&mut self) -> Option<Snapshot> {
        let request_id = self.next_id;
        self.next_id += 1;
        match self
            .stream
            .handle(InboundMessage::SnapshotRequest(SnapshotRequest { request_id }))
            .await
        {
            Some(OutboundMessage::SnapshotReply(reply)) => Some(reply.snapshot),
            _ => None,
        }
    }

    /// Current state; the empty state after deletion.
    pub fn state(&self) -> L::State {
        self.stream
            .state()
            .cloned()
            .unwrap_or_else(|| self.logic.empty_state())
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        self.stream.sequence_number().unwrap_or(0)
    }

    pub fn is_deleted(&self) -> bool {
        self.stream.was_deleted()
    }
}

/// Outcome of one [`EntityTestKit::call`].
#[derive(Debug, Clone, PartialEq)]
pub struct TestResult {
    out: OutboundMessage,
}

impl TestResult {
    fn as_reply(&self) -> Option<&Reply> {
        match &self.out {
            OutboundMessage::Reply(reply) => Some(reply),
            _ => None,
        }
    }

    /// The command succeeded with a reply payload.
    pub fn is_reply(&self) -> bool {
        matches!(
            self.as_reply().map(|r| &r.client_action),
            Some(ClientAction::Reply { .. })
        )
    }

    /// Reply payload decoded as `T`.
    pub fn reply<T: DeserializeOwned>(&self) -> Option<T> {
        match self.as_reply().map(|r| &r.client_action) {
            Some(ClientAction::Reply { payload }) => serde_json::from_value(payload.clone()).ok(),
            _ => None,
        }
    }

    pub fn is_no_reply(&self) -> bool {
        matches!(
            self.as_reply().map(|r| &r.client_action),
            Some(ClientAction::NoReply)
        )
    }

    pub fn is_forward(&self) -> bool {
        matches!(
            self.as_reply().map(|r| &r.client_action),
            Some(ClientAction::Forward { .. })
        )
    }

    /// The command was rejected by entity logic.
    pub fn is_error(&self) -> bool {
        self.as_reply().is_some_and(|r| r.client_action.is_error())
    }

    pub fn error_message(&self) -> Option<&str> {
        match self.as_reply().map(|r| &r.client_action) {
            Some(ClientAction::Error { message, .. }) => Some(message),
            _ => None,
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        match self.as_reply().map(|r| &r.client_action) {
            Some(ClientAction::Error { code, .. }) => *code,
            _ => None,
        }
    }

    /// The command failed unexpectedly.
    pub fn is_failure(&self) -> bool {
        matches!(self.out, OutboundMessage::Failure(_))
    }

    pub fn failure(&self) -> Option<&Failure> {
        match &self.out {
            OutboundMessage::Failure(failure) => Some(failure),
            _ => None,
        }
    }

    /// Events emitted by the command, decoded as `E`.
    ///
    /// # Errors
    ///
    /// Returns the decoding error of the first event that is not an `E`.
    pub fn events<E: DeserializeOwned>(&self) -> Result<Vec<E>, serde_json::Error> {
        self.as_reply()
            .map(|r| r.emitted_events.as_slice())
            .unwrap_or_default()
            .iter()
            .map(|record| serde_json::from_value(record.payload.clone()))
            .collect()
    }

    pub fn is_deleted(&self) -> bool {
        self.as_reply().is_some_and(|r| r.delete_after)
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.as_reply().and_then(|r| r.snapshot.as_ref())
    }

    /// Replacement state sent by a key-value entity.
    pub fn state_update(&self) -> Option<&Value> {
        self.as_reply().and_then(|r| r.state_update.as_ref())
    }

    pub fn raw(&self) -> &OutboundMessage {
        &self.out
    }
}
