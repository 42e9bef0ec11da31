//! Per-entity stream protocol engine for event-sourced and key-value
//! entities.
//!
//! One channel per live entity instance carries `Init`, replayed events,
//! then commands and snapshot requests. The engine replays history into the
//! instance, runs one command at a time through user logic, interprets the
//! returned [`Effect`], and writes exactly one terminal message back for
//! every command and snapshot request.

mod actor;
pub use actor::{EntityChannel, EntityHandle};
mod classify;
pub use classify::{CommandFailure, ErrorTier, tier_of};
mod command;
mod config;
mod effect;
mod entity;
mod error;
mod message;
mod registry;
mod sequence;
mod snapshot;
mod stream;
mod telemetry;
mod testkit;

pub use command::CommandContext;
pub use config::{
    DEFAULT_CHANNEL_CAPACITY, DEFAULT_CLEANUP_DELETED_ENTITY_AFTER, EngineConfig, EntityOptions,
};
pub use effect::{CommandResult, Effect, Interpretation, StateModel, interpret};
pub use entity::{CommandRouter, Entity, HandlerFuture, NoEvent};
pub use error::{
    ChannelError, ContextError, DispatchError, EffectDefect, HandlerError, ProtocolError,
    ReplayError, TestKitError,
};
pub use message::{
    ClientAction, Command, EntityId, ErrorCode, EventRecord, Failure, ForwardTarget,
    InboundMessage, Init, Metadata, OutboundMessage, Reply, SequenceNumber, Snapshot,
    SnapshotReply, SnapshotRequest,
};
pub use registry::{EntityRegistry, EntityRegistryBuilder};
pub use sequence::SequenceTracker;
pub use snapshot::{DEFAULT_SNAPSHOT_EVERY, SnapshotPolicy};
pub use stream::{EntityStream, Phase, StreamExit, StreamOptions, StreamReport};
pub use telemetry::{
    NoopTracer, SpanInfo, SpanOutcome, TRACEPARENT_KEY, TraceHandle, Tracer, TracingTracer,
};
pub use testkit::{DEFAULT_TEST_ENTITY_ID, EntityTestKit, TestResult};
