//! Identity-to-worker registry for one entity type.
//!
//! The registry lazily spawns a worker the first time a channel is opened
//! for an identity, refuses a second live channel for the same identity,
//! reaps workers that have stopped, and remembers deleted identities for
//! the configured retention window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::actor::{EntityChannel, EntityHandle, WorkerConfig, spawn_worker};
use crate::config::EngineConfig;
use crate::entity::{CommandRouter, Entity};
use crate::error::ChannelError;
use crate::message::{EntityId, InboundMessage};
use crate::stream::{EntityStream, StreamOptions, StreamReport};
use crate::telemetry::{Tracer, TracingTracer};

/// Published by a worker's supervisor once the worker task has ended.
#[derive(Debug, Clone)]
enum WorkerStatus {
    Running,
    /// `None` when the worker task itself failed.
    Stopped(Option<StreamReport>),
}

struct Worker {
    generation: u64,
    sender: mpsc::WeakSender<InboundMessage>,
    status: watch::Receiver<WorkerStatus>,
}

impl Worker {
    fn upgrade(&self) -> Option<mpsc::Sender<InboundMessage>> {
        self.sender.upgrade().filter(|s| !s.is_closed())
    }

    fn is_stopped(&self) -> bool {
        matches!(*self.status.borrow(), WorkerStatus::Stopped(_))
    }
}

#[derive(Default)]
struct RegistryState {
    /// One entry per identity until its worker has stopped and been reaped.
    live: HashMap<EntityId, Worker>,
    /// Deleted identities and when their deletion was observed.
    tombstones: HashMap<EntityId, Instant>,
    next_generation: u64,
}

struct Shared<L: Entity> {
    logic: Arc<L>,
    router: Arc<CommandRouter<L::State, L::Event>>,
    config: EngineConfig,
    tracer: Arc<dyn Tracer>,
    state: Mutex<RegistryState>,
}

/// Registry of live entity channels for entity type `L`.
///
/// `Clone` is cheap; all clones share the same state.
pub struct EntityRegistry<L: Entity> {
    shared: Arc<Shared<L>>,
}

impl<L: Entity> Clone for EntityRegistry<L> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<L: Entity> std::fmt::Debug for EntityRegistry<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityRegistry")
            .field("entity_type", &L::ENTITY_TYPE)
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl<L: Entity> EntityRegistry<L> {
    /// Start configuring a registry for `logic`.
    pub fn builder(logic: L) -> EntityRegistryBuilder<L> {
        EntityRegistryBuilder::new(logic)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Open the channel for `entity_id`, spawning its worker.
    ///
    /// The caller must send `Init` first (see [`EntityHandle::init`]). The
    /// first channel opened for an identity deleted within the retention
    /// window ignores any snapshot carried by its `Init` and starts empty;
    /// opening it consumes the tombstone.
    ///
    /// # Errors
    ///
    /// [`ChannelError::AlreadyOpen`] while a worker for `entity_id` is still
    /// running, including one whose handles are gone but which has not
    /// finished draining its queues.
    pub async fn open(&self, entity_id: impl Into<EntityId>) -> Result<EntityChannel, ChannelError> {
        let entity_id = entity_id.into();
        let mut state = self.shared.state.lock().await;
        self.reap(&mut state);

        if state.live.contains_key(&entity_id) {
            return Err(ChannelError::AlreadyOpen(entity_id));
        }

        let tombstoned = state.tombstones.remove(&entity_id).is_some();
        if tombstoned {
            tracing::debug!(
                entity_type = L::ENTITY_TYPE,
                entity_id = %entity_id,
                "reopening deleted entity, tombstone consumed"
            );
        }
        let options = StreamOptions {
            policy: self.shared.config.snapshot_policy_for(L::ENTITY_TYPE),
            tracer: Arc::clone(&self.shared.tracer),
            expected_entity: Some(entity_id.clone()),
            ignore_init_snapshot: tombstoned,
        };
        let stream = EntityStream::with_shared(
            Arc::clone(&self.shared.logic),
            Arc::clone(&self.shared.router),
            options,
        );
        let worker_config = WorkerConfig {
            channel_capacity: self.shared.config.channel_capacity,
            passivation_timeout: self.shared.config.passivation_timeout,
        };
        let (channel, task) = spawn_worker(entity_id.clone(), stream, worker_config);

        let (status_tx, status_rx) = watch::channel(WorkerStatus::Running);
        tokio::spawn(self.clone().supervise(entity_id.clone(), task, status_tx));

        let generation = state.next_generation;
        state.next_generation += 1;
        state.live.insert(
            entity_id,
            Worker {
                generation,
                sender: channel.handle().downgrade(),
                status: status_rx,
            },
        );
        Ok(channel)
    }

    /// A sending handle to the live worker for `entity_id`, if any.
    pub async fn handle(&self, entity_id: &EntityId) -> Option<EntityHandle> {
        let mut state = self.shared.state.lock().await;
        self.reap(&mut state);
        state
            .live
            .get(entity_id)
            .and_then(Worker::upgrade)
            .map(|sender| EntityHandle::from_sender(entity_id.clone(), sender))
    }

    /// Identities with a running worker, sorted.
    pub async fn live_entities(&self) -> Vec<EntityId> {
        let mut state = self.shared.state.lock().await;
        self.reap(&mut state);
        let mut ids: Vec<_> = state.live.keys().cloned().collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids
    }

    /// Whether `entity_id` was deleted within the retention window and has
    /// not been reopened since.
    pub async fn is_tombstoned(&self, entity_id: &EntityId) -> bool {
        let mut state = self.shared.state.lock().await;
        self.reap(&mut state);
        state.tombstones.contains_key(entity_id)
    }

    /// Wait for the worker of `entity_id` to stop and return its report.
    ///
    /// The worker stops once every handle to it has been dropped, or on
    /// its own after termination or passivation. The identity stays
    /// reserved until then.
    pub async fn wait_stopped(&self, entity_id: &EntityId) -> Option<StreamReport> {
        let (generation, mut status) = {
            let state = self.shared.state.lock().await;
            let worker = state.live.get(entity_id)?;
            (worker.generation, worker.status.clone())
        };

        let report = match status
            .wait_for(|s| matches!(s, WorkerStatus::Stopped(_)))
            .await
        {
            Ok(stopped) => match &*stopped {
                WorkerStatus::Stopped(report) => report.clone(),
                WorkerStatus::Running => None,
            },
            Err(_) => None,
        };

        let mut state = self.shared.state.lock().await;
        if state
            .live
            .get(entity_id)
            .is_some_and(|w| w.generation == generation)
        {
            state.live.remove(entity_id);
        }
        report
    }

    /// Await the worker task, record its exit, then publish its report.
    async fn supervise(
        self,
        entity_id: EntityId,
        task: JoinHandle<StreamReport>,
        status: watch::Sender<WorkerStatus>,
    ) {
        let report = match task.await {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::error!(
                    entity_type = L::ENTITY_TYPE,
                    entity_id = %entity_id,
                    error = %e,
                    "entity worker failed"
                );
                None
            }
        };
        if let Some(report) = &report {
            let mut state = self.shared.state.lock().await;
            self.record_exit(&mut state, report);
        }
        status.send_replace(WorkerStatus::Stopped(report));
    }

    /// Drop stopped workers and expired tombstones.
    fn reap(&self, state: &mut RegistryState) {
        state.live.retain(|_, worker| !worker.is_stopped());

        let window = self.shared.config.cleanup_deleted_entity_after;
        let now = Instant::now();
        state.tombstones.retain(|id, deleted_at| {
            let keep = now.saturating_duration_since(*deleted_at) < window;
            if !keep {
                tracing::debug!(
                    entity_type = L::ENTITY_TYPE,
                    entity_id = %id,
                    "tombstone expired"
                );
            }
            keep
        });
    }

    fn record_exit(&self, state: &mut RegistryState, report: &StreamReport) {
        if report.deleted
            && let Some(id) = &report.entity_id
        {
            tracing::info!(
                entity_type = L::ENTITY_TYPE,
                entity_id = %id,
                retention_secs = self.shared.config.cleanup_deleted_entity_after.as_secs(),
                "recording tombstone for deleted entity"
            );
            state.tombstones.insert(id.clone(), Instant::now());
        }
    }
}

/// Builder for an [`EntityRegistry`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use entity_stream::{CommandRouter, Effect, Entity, EntityRegistry, NoEvent};
///
/// struct Register;
///
/// impl Entity for Register {
///     const ENTITY_TYPE: &'static str = "register";
///     type State = String;
///     type Event = NoEvent;
///     fn empty_state(&self) -> String { String::new() }
///     fn apply_event(&self, state: String, event: &NoEvent) -> String { match *event {} }
///     fn routes(&self) -> CommandRouter<String, NoEvent> {
///         CommandRouter::new().on("get", |s: String, _ctx, _: ()| async move { Ok(Effect::reply(s)) })
///     }
/// }
///
/// let registry = EntityRegistry::builder(Register)
///     .snapshot_every(50)
///     .cleanup_deleted_entity_after(Duration::from_secs(3600))
///     .channel_capacity(16)
///     .build();
/// assert_eq!(registry.config().snapshot_every, 50);
/// ```
pub struct EntityRegistryBuilder<L: Entity> {
    logic: L,
    config: EngineConfig,
    tracer: Arc<dyn Tracer>,
}

impl<L: Entity> EntityRegistryBuilder<L> {
    pub fn new(logic: L) -> Self {
        Self {
            logic,
            config: EngineConfig::default(),
            tracer: Arc::new(TracingTracer),
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Events between automatic snapshots. Defaults to 100.
    pub fn snapshot_every(mut self, every: i64) -> Self {
        self.config.snapshot_every = every;
        self
    }

    /// Tombstone retention for deleted identities. Defaults to 7 days.
    pub fn cleanup_deleted_entity_after(mut self, retention: Duration) -> Self {
        self.config.cleanup_deleted_entity_after = retention;
        self
    }

    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity;
        self
    }

    /// Stop workers that receive nothing for `timeout`. Disabled by default.
    pub fn passivation_timeout(mut self, timeout: Duration) -> Self {
        self.config.passivation_timeout = Some(timeout);
        self
    }

    pub fn tracer(mut self, tracer: impl Tracer) -> Self {
        self.tracer = Arc::new(tracer);
        self
    }

    pub fn build(self) -> EntityRegistry<L> {
        let router = Arc::new(self.logic.routes());
        tracing::debug!(
            entity_type = L::ENTITY_TYPE,
            operations = router.len(),
            "entity registry built"
        );
        EntityRegistry {
            shared: Arc::new(Shared {
                logic: Arc::new(self.logic),
                router,
                config: self.config,
                tracer: self.tracer,
                state: Mutex::new(RegistryState::default()),
            }),
        }
    }
}
