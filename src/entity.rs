//! Entity logic capability and the operation-name router.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::command::CommandContext;
use crate::effect::{Effect, StateModel};
use crate::error::{DispatchError, HandlerError};

/// User-defined business logic for one entity type.
///
/// The engine owns the state; logic only ever sees copies of it and
/// describes changes through the [`Effect`] its handlers return.
///
/// # Contract
///
/// - [`apply_event`](Entity::apply_event) must be pure and deterministic:
///   replaying the same events must always rebuild the same state.
/// - Handlers registered in [`routes`](Entity::routes) may be asynchronous.
///   The engine never runs two handlers of the same entity instance at once.
pub trait Entity: Send + Sync + 'static {
    /// Identifies this entity type (e.g. `"counter"`). Used in logs and spans.
    const ENTITY_TYPE: &'static str;

    type State: Clone + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Events emitted by handlers and applied to the state. Key-value
    /// entities use [`NoEvent`].
    type Event: Clone + Serialize + DeserializeOwned + Send + Sync + 'static;

    fn state_model(&self) -> StateModel {
        StateModel::default()
    }

    fn empty_state(&self) -> Self::State;

    fn apply_event(&self, state: Self::State, event: &Self::Event) -> Self::State;

    /// Operation table, built once per entity type.
    fn routes(&self) -> CommandRouter<Self::State, Self::Event>;
}

/// Uninhabited event type for key-value entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoEvent {}

/// Boxed future returned by a registered handler.
pub type HandlerFuture<S, E> =
    Pin<Box<dyn Future<Output = Result<Effect<S, E>, HandlerError>> + Send + 'static>>;

type BoxedHandler<S, E> = Box<
    dyn Fn(S, CommandContext, Value) -> Result<HandlerFuture<S, E>, serde_json::Error>
        + Send
        + Sync,
>;

/// Explicit mapping from operation name to handler.
///
/// Each handler declares the type its payload decodes into; an absent
/// payload decodes from JSON `null`, so `()` works for operations without
/// arguments.
///
/// # Examples
///
/// ```
/// use entity_stream::{CommandRouter, Effect};
///
/// #[derive(serde::Deserialize)]
/// struct IncreaseBy { value: i64 }
///
/// let router: CommandRouter<i64, i64> = CommandRouter::new()
///     .on("increaseBy", |state: i64, _ctx, cmd: IncreaseBy| async move {
///         Ok(Effect::persist([cmd.value]).then_reply(state + cmd.value))
///     })
///     .on("get", |state: i64, _ctx, _: ()| async move { Ok(Effect::reply(state)) });
///
/// assert!(router.contains("increaseBy"));
/// assert_eq!(router.len(), 2);
/// ```
pub struct CommandRouter<S, E> {
    handlers: HashMap<String, BoxedHandler<S, E>>,
}

impl<S, E> CommandRouter<S, E>
where
    S: Send + 'static,
    E: Send + 'static,
{
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register `handler` for `operation`.
    ///
    /// Registering the same name twice replaces the earlier handler.
    pub fn on<C, F, Fut>(mut self, operation: &str, handler: F) -> Self
    where
        C: DeserializeOwned + Send + 'static,
        F: Fn(S, CommandContext, C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Effect<S, E>, HandlerError>> + Send + 'static,
    {
        let boxed: BoxedHandler<S, E> = Box::new(move |state, ctx, payload| {
            let command: C = serde_json::from_value(payload)?;
            Ok(Box::pin(handler(state, ctx, command)))
        });
        if self.handlers.insert(operation.to_owned(), boxed).is_some() {
            tracing::warn!(operation, "handler registered twice; keeping the last one");
        }
        self
    }

    pub fn contains(&self, operation: &str) -> bool {
        self.handlers.contains_key(operation)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered operation names, unordered.
    pub fn operations(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Decode the payload and start the handler for `operation`.
    ///
    /// # Errors
    ///
    /// [`DispatchError::UnknownOperation`] when nothing is registered under
    /// that name, [`DispatchError::InvalidPayload`] when the payload does not
    /// decode into the handler's command type.
    pub(crate) fn dispatch(
        &self,
        operation: &str,
        state: S,
        ctx: CommandContext,
        payload: Option<Value>,
    ) -> Result<HandlerFuture<S, E>, DispatchError> {
        let handler = self
            .handlers
            .get(operation)
            .ok_or_else(|| DispatchError::UnknownOperation(operation.to_owned()))?;
        handler(state, ctx, payload.unwrap_or(Value::Null)).map_err(|source| {
            DispatchError::InvalidPayload {
                operation: operation.to_owned(),
                source,
            }
        })
    }
}

impl<S, E> Default for CommandRouter<S, E>
where
    S: Send + 'static,
    E: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<S, E> fmt::Debug for CommandRouter<S, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("CommandRouter")
            .field("operations", &names)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::message::ErrorCode;

    /// Event-sourced counter.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct CounterEntity {
        /// Receives the context leaked by the `stash` operation.
        pub stash: Arc<Mutex<Option<CommandContext>>>,
        /// Held by the `park` operation until its handler is dropped.
        pub parked: Arc<Mutex<Option<tokio::sync::oneshot::Sender<()>>>>,
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub(crate) struct Counter {
        pub value: i64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", content = "data")]
    pub(crate) enum CounterEvent {
        ValueIncreased { value: i64 },
        ValueReset,
    }

    #[derive(Debug, Deserialize)]
    pub(crate) struct IncreaseBy {
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
                CounterEvent::ValueReset => state.value = 0,
            }
            state
        }

        fn routes(&self) -> CommandRouter<Counter, CounterEvent> {
            let stash = Arc::clone(&self.stash);
            let parked = Arc::clone(&self.parked);
            CommandRouter::new()
                .on("increaseBy", |state: Counter, _ctx, cmd: IncreaseBy| async move {
                    if cmd.value < 0 {
                        return Err(HandlerError::rejected_with_code(
                            "Increase requires a positive value",
                            ErrorCode::InvalidArgument,
                        ));
                    }
                    let next = state.value + cmd.value;
                    Ok(Effect::persist([CounterEvent::ValueIncreased { value: cmd.value }])
                        .then_reply(Counter { value: next }))
                })
                .on("get", |state: Counter, _ctx, _: ()| async move {
                    Ok(Effect::reply(state))
                })
                .on("reset", |_state: Counter, _ctx, _: ()| async move {
                    Ok(Effect::persist([CounterEvent::ValueReset]).then_no_reply())
                })
                .on("delete", |_state: Counter, _ctx, _: ()| async move {
                    Ok(Effect::delete_entity().then_reply("deleted"))
                })
                .on("stash", move |_state: Counter, ctx: CommandContext, _: ()| {
                    let stash = Arc::clone(&stash);
                    async move {
                        let seq = ctx.sequence_number()?;
                        if let Ok(mut slot) = stash.lock() {
                            *slot = Some(ctx);
                        }
                        Ok(Effect::reply(seq))
                    }
                })
                .on("park", move |_state: Counter, _ctx, _: ()| {
                    let parked = Arc::clone(&parked);
                    async move {
                        let _held = parked.lock().ok().and_then(|mut slot| slot.take());
                        std::future::pending::<()>().await;
                        Ok(Effect::reply(()))
                    }
                })
                .on("explode", |_state: Counter, _ctx, _: ()| async move {
                    Err(HandlerError::unexpected(std::io::Error::other("backend down")))
                })
                .on("panic", |_state: Counter, _ctx, _: ()| async move {
                    if true {
                        panic!("handler panicked");
                    }
                    Ok(Effect::reply(()))
                })
        }
    }

    /// Key-value order record.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct OrderEntity;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub(crate) struct Order {
        pub placed: bool,
        pub confirmed: bool,
        pub item: String,
        pub quantity: u32,
    }

    #[derive(Debug, Deserialize)]
    pub(crate) struct PlaceOrder {
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
                    let id = ctx.entity_id()?.clone();
                    if !state.placed {
                        return Ok(Effect::error_with_code(
                            format!("No order found for {id}"),
                            ErrorCode::NotFound,
                        ));
                    }
                    if state.confirmed {
                        return Ok(Effect::error_with_code(
                            "Cannot cancel an already confirmed order",
                            ErrorCode::FailedPrecondition,
                        ));
                    }
                    Ok(Effect::update_state(Order::default()).then_reply("ok"))
                })
                .on("confirm", |state: Order, ctx: CommandContext, _: ()| async move {
                    if !state.placed {
                        return Ok(Effect::error(format!(
                            "No order found for {}",
                            ctx.entity_id()?
                        )));
                    }
                    let confirmed = Order {
                        confirmed: true,
                        ..state
                    };
                    Ok(Effect::update_state(confirmed).then_reply("ok"))
                })
                .on("delete", |_state: Order, _ctx, _: ()| async move {
                    Ok(Effect::delete_entity().then_reply("deleted"))
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_fixtures::{Counter, CounterEntity, CounterEvent};
    use super::*;
    use crate::message::{EntityId, Metadata};
    use serde_json::json;

    fn ctx(op: &str) -> CommandContext {
        CommandContext::detached(EntityId::from("c-1"), 0, op, 1, Metadata::default())
    }

    #[test]
    fn apply_folds_events() {
        let entity = CounterEntity::default();
        let state = [
            CounterEvent::ValueIncreased { value: 3 },
            CounterEvent::ValueIncreased { value: 4 },
        ]
        .iter()
        .fold(entity.empty_state(), |s, e| entity.apply_event(s, e));
        assert_eq!(state, Counter { value: 7 });
    }

    #[test]
    fn events_use_adjacent_tagging() {
        let json = serde_json::to_value(CounterEvent::ValueIncreased { value: 2 }).expect("encode");
        assert_eq!(json, json!({"type": "ValueIncreased", "data": {"value": 2}}));
    }

    #[tokio::test]
    async fn dispatch_decodes_payload_and_runs_handler() {
        let router = CounterEntity::default().routes();
        let fut = router
            .dispatch(
                "increaseBy",
                Counter { value: 1 },
                ctx("increaseBy"),
                Some(json!({"value": 5})),
            )
            .expect("known operation");
        let effect = fut.await.expect("handler succeeds");
        assert!(!effect.is_error());
    }

    #[tokio::test]
    async fn missing_payload_decodes_as_unit() {
        let router = CounterEntity::default().routes();
        let fut = router
            .dispatch("get", Counter::default(), ctx("get"), None)
            .expect("unit payload");
        assert!(fut.await.is_ok());
    }

    #[test]
    fn unknown_operation_is_reported() {
        let router = CounterEntity::default().routes();
        let err = router
            .dispatch("nope", Counter::default(), ctx("nope"), None)
            .err()
            .expect("unknown operation");
        assert!(matches!(err, DispatchError::UnknownOperation(ref op) if op == "nope"));
    }

    #[test]
    fn bad_payload_is_reported() {
        let router = CounterEntity::default().routes();
        let err = router
            .dispatch(
                "increaseBy",
                Counter::default(),
                ctx("increaseBy"),
                Some(json!({"value": "ten"})),
            )
            .err()
            .expect("payload does not decode");
        assert!(matches!(err, DispatchError::InvalidPayload { ref operation, .. } if operation == "increaseBy"));
    }

    #[test]
    fn debug_lists_sorted_operations() {
        let router: CommandRouter<i64, NoEvent> = CommandRouter::new()
            .on("b", |s: i64, _ctx, _: ()| async move { Ok(Effect::reply(s)) })
            .on("a", |s: i64, _ctx, _: ()| async move { Ok(Effect::reply(s)) });
        assert_eq!(format!("{router:?}"), r#"CommandRouter { operations: ["a", "b"] }"#);
    }
}
