//! Shared fixtures for integration tests.

#![allow(dead_code)]

use entity_stream::{
    CommandContext, CommandRouter, Effect, Entity, ErrorCode, EventRecord, HandlerError,
    InboundMessage, Init, NoEvent, OutboundMessage, Reply, Snapshot, StateModel,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Install a test-scoped `tracing` subscriber, honoring `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ---------------------------------------------------------------------------
// Event-sourced counter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct CounterEntity;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Counter {
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum CounterEvent {
    ValueIncreased { value: i64 },
}

#[derive(Debug, Deserialize)]
pub struct IncreaseBy {
    pub value: i64,
}

impl Entity for CounterEntity {
    const ENTITY_TYPE: &'static str = "counter";

    type State = Counter;
    type Event = CounterEvent;

    fn empty_state(&self) -> Counter {
        Counter::default()
    }

    fn apply_event(&self, mut state: Counter, event: &CounterEvent) -> Counter {
        match event {
            CounterEvent::ValueIncreased { value } => state.value += value,
        }
        state
    }

    fn routes(&self) -> CommandRouter<Counter, CounterEvent> {
        CommandRouter::new()
            .on("increaseBy", |state: Counter, _ctx, cmd: IncreaseBy| async move {
                if cmd.value < 0 {
                    return Err(HandlerError::rejected_with_code(
                        "Increase requires a positive value",
                        ErrorCode::InvalidArgument,
                    ));
                }
                Ok(Effect::persist([CounterEvent::ValueIncreased { value: cmd.value }])
                    .then_reply(Counter {
                        value: state.value + cmd.value,
                    }))
            })
            .on("get", |state: Counter, _ctx, _: ()| async move {
                Ok(Effect::reply(state))
            })
            .on("slowIncrease", |state: Counter, _ctx, cmd: IncreaseBy| async move {
                // Simulates awaiting another service before deciding.
                tokio::time::sleep(std::time::Duration::from_millis(cmd.value as u64 * 5)).await;
                Ok(Effect::persist([CounterEvent::ValueIncreased { value: cmd.value }])
                    .then_reply(Counter {
                        value: state.value + cmd.value,
                    }))
            })
            .on("delete", |_state: Counter, _ctx, _: ()| async move {
                Ok(Effect::delete_entity().then_reply("deleted"))
            })
    }
}

// ---------------------------------------------------------------------------
// Key-value order
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct OrderEntity;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub placed: bool,
    pub confirmed: bool,
    pub item: String,
    pub quantity: u32,
}

#[derive(Debug, Deserialize)]
pub struct PlaceOrder {
    pub item: String,
    pub quantity: u32,
}

impl Entity for OrderEntity {
    const ENTITY_TYPE: &'static str = "order";

    type State = Order;
    type Event = NoEvent;

    fn state_model(&self) -> StateModel {
        StateModel::KeyValue
    }

    fn empty_state(&self) -> Order {
        Order::default()
    }

    fn apply_event(&self, _state: Order, event: &NoEvent) -> Order {
        match *event {}
    }

    fn routes(&self) -> CommandRouter<Order, NoEvent> {
        CommandRouter::new()
            .on("placeOrder", |_state: Order, _ctx, cmd: PlaceOrder| async move {
                let order = Order {
                    placed: true,
                    confirmed: false,
                    item: cmd.item,
                    quantity: cmd.quantity,
                };
                Ok(Effect::update_state(order.clone()).then_reply(order))
            })
            .on("cancel", |state: Order, ctx: CommandContext, _: ()| async move {
                if !state.placed {
                    return Ok(Effect::error_with_code(
                        format!("No order found for {}", ctx.entity_id()?),
                        ErrorCode::NotFound,
                    ));
                }
                Ok(Effect::update_state(Order::default()).then_reply("ok"))
            })
            .on("status", |state: Order, ctx: CommandContext, _: ()| async move {
                if !state.placed {
                    return Err(HandlerError::rejected(format!(
                        "No order found for {}",
                        ctx.entity_id()?
                    )));
                }
                Ok(Effect::reply(state))
            })
    }
}

// ---------------------------------------------------------------------------
// Message helpers
// ---------------------------------------------------------------------------

pub fn init(id: &str, snapshot: Option<Snapshot>) -> InboundMessage {
    InboundMessage::Init(Init {
        entity_id: id.into(),
        snapshot,
    })
}

pub fn replayed(seq: u64, value: i64) -> InboundMessage {
    InboundMessage::Event(EventRecord {
        sequence_number: seq,
        payload: json!({"type": "ValueIncreased", "data": {"value": value}}),
    })
}

pub fn command(id: u64, entity: &str, op: &str, payload: Option<Value>) -> InboundMessage {
    InboundMessage::Command(entity_stream::Command::new(id, entity, op, payload))
}

pub fn expect_reply(out: Option<OutboundMessage>) -> Reply {
    match out {
        Some(OutboundMessage::Reply(reply)) => reply,
        other => panic!("expected a reply, got {other:?}"),
    }
}
