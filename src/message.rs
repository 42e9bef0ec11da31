//! Wire-level message types exchanged over one entity channel.
//!
//! The host pushes [`InboundMessage`]s (one `Init`, zero or more replayed
//! `Event`s, then interleaved `Command`s and `SnapshotRequest`s) and reads
//! back [`OutboundMessage`]s. Payloads are opaque JSON values at this
//! layer; typed decoding happens in the entity's router.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Monotonically increasing per-entity event counter.
pub type SequenceNumber = u64;

/// Opaque key naming one entity instance.
///
/// Supplied by the caller and never generated by the engine.
///
/// # Examples
///
/// ```
/// use entity_stream::EntityId;
///
/// let id = EntityId::from("order-17");
/// assert_eq!(id.as_str(), "order-17");
/// assert_eq!(id.to_string(), "order-17");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Wrap an identity string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identity as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Open key/value bag travelling with a command (tracing ids, forwarded
/// headers). Passed through opaquely.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, String>);

impl Metadata {
    /// Look up a single entry.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Insert an entry, returning `self` for chaining.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    /// Insert or overwrite an entry.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Point-in-time materialization of an entity's state.
///
/// `state` is always the result of applying exactly the first
/// `sequence_number` events in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub sequence_number: SequenceNumber,
    pub state: Value,
}

/// One persisted event: its position in the entity's log and its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub sequence_number: SequenceNumber,
    pub payload: Value,
}

/// First message on every channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Init {
    pub entity_id: EntityId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Snapshot>,
}

/// A command addressed to the channel's entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Caller-assigned id echoed in the matching reply or failure.
    pub command_id: u64,
    pub entity_id: EntityId,
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
}

impl Command {
    /// Build a command without metadata.
    pub fn new(
        command_id: u64,
        entity_id: impl Into<EntityId>,
        operation: impl Into<String>,
        payload: Option<Value>,
    ) -> Self {
        Self {
            command_id,
            entity_id: entity_id.into(),
            operation: operation.into(),
            payload,
            metadata: Metadata::default(),
        }
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// On-demand request for the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub request_id: u64,
}

/// Messages the host sends into an entity channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InboundMessage {
    Init(Init),
    Event(EventRecord),
    Command(Command),
    SnapshotRequest(SnapshotRequest),
}

impl InboundMessage {
    /// Short name of the message kind, used in logs and protocol errors.
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::Init(_) => "init",
            InboundMessage::Event(_) => "event",
            InboundMessage::Command(_) => "command",
            InboundMessage::SnapshotRequest(_) => "snapshot_request",
        }
    }
}

/// Categorical hint attached to an error reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    PermissionDenied,
    Unavailable,
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::InvalidArgument => "invalid argument",
            ErrorCode::NotFound => "not found",
            ErrorCode::AlreadyExists => "already exists",
            ErrorCode::FailedPrecondition => "failed precondition",
            ErrorCode::PermissionDenied => "permission denied",
            ErrorCode::Unavailable => "unavailable",
            ErrorCode::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Destination of a forwarded command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardTarget {
    /// Component (entity type or service) receiving the forwarded call.
    pub component: String,
    pub operation: String,
    #[serde(default)]
    pub payload: Value,
}

impl ForwardTarget {
    pub fn new(component: impl Into<String>, operation: impl Into<String>, payload: Value) -> Self {
        Self {
            component: component.into(),
            operation: operation.into(),
            payload,
        }
    }
}

/// What the caller of a command gets back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientAction {
    /// Success with a payload.
    Reply { payload: Value },
    /// Business rejection. No events were applied.
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<ErrorCode>,
    },
    /// The reply is produced by another component.
    Forward { target: ForwardTarget },
    /// Fire-and-forget completion.
    NoReply,
}

impl ClientAction {
    pub fn is_error(&self) -> bool {
        matches!(self, ClientAction::Error { .. })
    }
}

/// Terminal response to a command that was processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub command_id: u64,
    pub client_action: ClientAction,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub emitted_events: Vec<EventRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Snapshot>,
    /// Wholesale state replacement produced by a key-value entity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_update: Option<Value>,
    #[serde(default)]
    pub delete_after: bool,
}

/// Failure report: either for one command or, without a command id, for the
/// whole channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Failure {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<u64>,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
}

/// Response to a [`SnapshotRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotReply {
    pub request_id: u64,
    pub snapshot: Snapshot,
}

/// Messages the engine writes back to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboundMessage {
    Reply(Reply),
    Failure(Failure),
    SnapshotReply(SnapshotReply),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn inbound_command_decodes_with_defaults() {
        let raw = json!({
            "kind": "command",
            "command_id": 7,
            "entity_id": "c-1",
            "operation": "increaseBy"
        });
        let msg: InboundMessage = serde_json::from_value(raw).expect("decode should succeed");
        let InboundMessage::Command(cmd) = msg else {
            panic!("expected a command");
        };
        assert_eq!(cmd.command_id, 7);
        assert_eq!(cmd.entity_id.as_str(), "c-1");
        assert_eq!(cmd.payload, None);
        assert!(cmd.metadata.is_empty());
    }

    #[test]
    fn init_without_snapshot_omits_field() {
        let init = InboundMessage::Init(Init {
            entity_id: EntityId::from("c-1"),
            snapshot: None,
        });
        let json = serde_json::to_value(&init).expect("encode should succeed");
        assert_eq!(json, json!({"kind": "init", "entity_id": "c-1"}));
    }

    #[test]
    fn error_action_carries_code_hint() {
        let action = ClientAction::Error {
            message: "nope".into(),
            code: Some(ErrorCode::InvalidArgument),
        };
        let json = serde_json::to_value(&action).expect("encode should succeed");
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "invalid_argument");
        assert!(action.is_error());
    }

    #[test]
    fn metadata_is_sorted_and_queryable() {
        let meta = Metadata::default()
            .with("traceparent", "00-abc-def-01")
            .with("actor", "user-1");
        let keys: Vec<_> = meta.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["actor", "traceparent"]);
        assert_eq!(meta.get("actor"), Some("user-1"));
        assert_eq!(meta.get("missing"), None);
    }

    #[test]
    fn message_kinds_are_stable() {
        assert_eq!(
            InboundMessage::SnapshotRequest(SnapshotRequest { request_id: 1 }).kind(),
            "snapshot_request"
        );
        assert_eq!(
            InboundMessage::Event(EventRecord {
                sequence_number: 1,
                payload: Value::Null
            })
            .kind(),
            "event"
        );
    }

    #[test]
    fn error_code_displays_human_readable() {
        assert_eq!(ErrorCode::FailedPrecondition.to_string(), "failed precondition");
    }
}
