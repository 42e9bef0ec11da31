//! Self-contained example driving an event-sourced counter through the
//! entity stream protocol: open a channel, replay history, run commands,
//! and recover from the snapshot the engine attached.
//!
//! Run with: `cargo run --example counter`
//!
//! Set `RUST_LOG=entity_stream=debug` to watch the engine's logs.

use entity_stream::{
    ClientAction, CommandRouter, Effect, Entity, EntityRegistry, ErrorCode, EventRecord,
    HandlerError, InboundMessage, OutboundMessage, Snapshot,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

// ---------------------------------------------------------------------------
// Counter entity
// ---------------------------------------------------------------------------

struct Counter;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CounterState {
    value: i64,
}

/// Adjacently tagged, matching the payloads the host stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
enum CounterEvent {
    Increased { by: i64 },
    WasReset,
}

#[derive(Deserialize)]
struct IncreaseBy {
    value: i64,
}

impl Entity for Counter {
    const ENTITY_TYPE: &'static str = "counter";
    type State = CounterState;
    type Event = CounterEvent;

    fn empty_state(&self) -> CounterState {
        CounterState::default()
    }

    fn apply_event(&self, mut state: CounterState, event: &CounterEvent) -> CounterState {
        match event {
            CounterEvent::Increased { by } => state.value += by,
            CounterEvent::WasReset => state.value = 0,
        }
        state
    }

    fn routes(&self) -> CommandRouter<CounterState, CounterEvent> {
        CommandRouter::new()
            .on("increaseBy", |state: CounterState, _ctx, cmd: IncreaseBy| async move {
                if cmd.value <= 0 {
                    return Err(HandlerError::rejected_with_code(
                        "Increase requires a positive value",
                        ErrorCode::InvalidArgument,
                    ));
                }
                Ok(Effect::persist([CounterEvent::Increased { by: cmd.value }])
                    .then_reply(json!({"value": state.value + cmd.value})))
            })
            .on("reset", |_state: CounterState, _ctx, _: ()| async move {
                Ok(Effect::persist([CounterEvent::WasReset]).then_reply(json!({"value": 0})))
            })
            .on("get", |state: CounterState, _ctx, _: ()| async move {
                Ok(Effect::reply(state))
            })
    }
}

fn describe(out: &OutboundMessage) -> String {
    match out {
        OutboundMessage::Reply(reply) => match &reply.client_action {
            ClientAction::Reply { payload } => format!(
                "reply #{} {} (+{} events, snapshot: {})",
                reply.command_id,
                payload,
                reply.emitted_events.len(),
                reply.snapshot.is_some()
            ),
            ClientAction::Error { message, code } => {
                format!("error #{} {message} ({code:?})", reply.command_id)
            }
            other => format!("#{} {other:?}", reply.command_id),
        },
        OutboundMessage::Failure(failure) => format!("failure: {}", failure.description),
        OutboundMessage::SnapshotReply(reply) => format!(
            "snapshot @{} {}",
            reply.snapshot.sequence_number, reply.snapshot.state
        ),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let registry = EntityRegistry::builder(Counter).snapshot_every(5).build();

    // Open "alpha" and replay two stored events before taking commands.
    let mut alpha = registry.open("alpha").await?;
    alpha.handle().init(None).await?;
    for (seq, by) in [(1, 2), (2, 3)] {
        alpha
            .handle()
            .send(InboundMessage::Event(EventRecord {
                sequence_number: seq,
                payload: serde_json::to_value(CounterEvent::Increased { by })?,
            }))
            .await?;
    }

    let mut last_snapshot: Option<Snapshot> = None;
    let commands = [
        ("increaseBy", Some(json!({"value": 10}))),
        ("increaseBy", Some(json!({"value": -1}))),
        ("increaseBy", Some(json!({"value": 1}))),
        ("reset", None),
        ("increaseBy", Some(json!({"value": 4}))),
    ];
    for (id, (operation, payload)) in (1..).zip(commands) {
        let out = alpha.call(id, operation, payload).await?;
        println!("alpha {operation}: {}", describe(&out));
        if let OutboundMessage::Reply(reply) = &out
            && let Some(snapshot) = &reply.snapshot
        {
            last_snapshot = Some(snapshot.clone());
        }
    }

    alpha.handle().snapshot_request(1).await?;
    if let Some(out) = alpha.recv().await {
        println!("alpha: {}", describe(&out));
    }

    // Release alpha and recover it from the attached snapshot.
    drop(alpha);
    let report = registry.wait_stopped(&"alpha".into()).await;
    println!("alpha stopped: {report:?}");

    let snapshot = last_snapshot.ok_or("expected a snapshot at sequence 5")?;
    assert_eq!(snapshot.sequence_number, 5);
    assert_eq!(snapshot.state, json!({"value": 0}));

    let mut alpha = registry.open("alpha").await?;
    alpha.handle().init(Some(snapshot)).await?;
    alpha
        .handle()
        .send(InboundMessage::Event(EventRecord {
            sequence_number: 6,
            payload: serde_json::to_value(CounterEvent::Increased { by: 4 })?,
        }))
        .await?;
    let out = alpha.call(10, "get", None).await?;
    println!("alpha recovered: {}", describe(&out));

    let OutboundMessage::Reply(reply) = out else {
        return Err("expected a reply".into());
    };
    assert_eq!(
        reply.client_action,
        ClientAction::Reply {
            payload: json!({"value": 4})
        }
    );

    println!("all assertions passed");

    Ok(())
}
