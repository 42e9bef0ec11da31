//! Worker task that owns one entity channel.
//!
//! Each live entity instance gets a dedicated tokio task running
//! [`EntityStream::run`] over a bounded inbound queue. The task processes
//! its queue strictly sequentially and writes replies to a bounded
//! outbound queue the host reads from.
//!
//! Public API: [`EntityHandle`] (cloneable sender side) and
//! [`EntityChannel`] (the host's view of both directions).

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use crate::entity::Entity;
use crate::error::ChannelError;
use crate::message::{
    Command, EntityId, InboundMessage, Init, OutboundMessage, Snapshot, SnapshotRequest,
};
use crate::stream::{EntityStream, StreamReport};

/// Configuration for one worker.
///
/// Internal to the crate; callers configure workers through
/// [`EntityRegistryBuilder`](crate::EntityRegistryBuilder).
#[derive(Debug, Clone, Copy)]
pub(crate) struct WorkerConfig {
    pub channel_capacity: usize,
    /// How long the worker waits for a message before shutting down.
    pub passivation_timeout: Option<Duration>,
}

/// Sending side of an entity channel.
///
/// Cheap to clone. The worker stops once every handle is dropped.
#[derive(Debug, Clone)]
pub struct EntityHandle {
    entity_id: EntityId,
    sender: mpsc::Sender<InboundMessage>,
}

impl EntityHandle {
    pub(crate) fn from_sender(entity_id: EntityId, sender: mpsc::Sender<InboundMessage>) -> Self {
        Self { entity_id, sender }
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    /// Queue a raw protocol message.
    ///
    /// # Errors
    ///
    /// [`ChannelError::WorkerGone`] if the worker has exited.
    pub async fn send(&self, message: InboundMessage) -> Result<(), ChannelError> {
        self.sender
            .send(message)
            .await
            .map_err(|_| ChannelError::WorkerGone)
    }

    /// Queue the channel's `Init`, seeded from `snapshot` if given.
    pub async fn init(&self, snapshot: Option<Snapshot>) -> Result<(), ChannelError> {
        self.send(InboundMessage::Init(Init {
            entity_id: self.entity_id.clone(),
            snapshot,
        }))
        .await
    }

    /// Queue a command addressed to this handle's entity.
    pub async fn command(
        &self,
        command_id: u64,
        operation: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<(), ChannelError> {
        self.send(InboundMessage::Command(Command::new(
            command_id,
            self.entity_id.clone(),
            operation,
            payload,
        )))
        .await
    }

    pub async fn snapshot_request(&self, request_id: u64) -> Result<(), ChannelError> {
        self.send(InboundMessage::SnapshotRequest(SnapshotRequest { request_id }))
            .await
    }

    /// Whether the worker is still accepting messages.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }

    pub(crate) fn downgrade(&self) -> mpsc::WeakSender<InboundMessage> {
        self.sender.downgrade()
    }
}

/// Host side of a live entity channel: a handle plus the reply queue.
#[derive(Debug)]
pub struct EntityChannel {
    handle: EntityHandle,
    replies: mpsc::Receiver<OutboundMessage>,
}

impl EntityChannel {
    pub fn handle(&self) -> &EntityHandle {
        &self.handle
    }

    pub fn entity_id(&self) -> &EntityId {
        self.handle.entity_id()
    }

    /// Next outbound message, or `None` once the worker has exited and the
    /// queue is drained.
    pub async fn recv(&mut self) -> Option<OutboundMessage> {
        self.replies.recv().await
    }

    /// Send a command and wait for its terminal response.
    ///
    /// Assumes no earlier reply is still unread.
    ///
    /// # Errors
    ///
    /// [`ChannelError::WorkerGone`] if the worker exited before answering.
    pub async fn call(
        &mut self,
        command_id: u64,
        operation: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<OutboundMessage, ChannelError> {
        self.handle.command(command_id, operation, payload).await?;
        self.replies.recv().await.ok_or(ChannelError::WorkerGone)
    }

    /// Split into the sending handle and the reply queue.
    pub fn into_parts(self) -> (EntityHandle, mpsc::Receiver<OutboundMessage>) {
        (self.handle, self.replies)
    }
}

/// Spawn a worker task driving `stream` for `entity_id`.
///
/// # Returns
///
/// The host's [`EntityChannel`] and the task's join handle, which yields
/// the [`StreamReport`] once the worker stops.
pub(crate) fn spawn_worker<L: Entity>(
    entity_id: EntityId,
    stream: EntityStream<L>,
    config: WorkerConfig,
) -> (EntityChannel, JoinHandle<StreamReport>) {
    let capacity = config.channel_capacity.max(1);
    let (in_tx, in_rx) = mpsc::channel::<InboundMessage>(capacity);
    let (out_tx, out_rx) = mpsc::channel::<OutboundMessage>(capacity);

    tracing::debug!(
        entity_type = L::ENTITY_TYPE,
        entity_id = %entity_id,
        "spawning entity worker"
    );

    let task = tokio::spawn(async move {
        let report = stream
            .run(ReceiverStream::new(in_rx), out_tx, config.passivation_timeout)
            .await;
        tracing::debug!(
            entity_type = L::ENTITY_TYPE,
            exit = ?report.exit,
            deleted = report.deleted,
            "entity worker stopped"
        );
        report
    });

    let channel = EntityChannel {
        handle: EntityHandle::from_sender(entity_id, in_tx),
        replies: out_rx,
    };
    (channel, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::test_fixtures::CounterEntity;
    use crate::message::{ClientAction, Reply};
    use crate::stream::{StreamExit, StreamOptions};
    use serde_json::json;

    fn config() -> WorkerConfig {
        WorkerConfig {
            channel_capacity: 4,
            passivation_timeout: None,
        }
    }

    fn spawn(id: &str) -> (EntityChannel, JoinHandle<StreamReport>) {
        let options = StreamOptions {
            expected_entity: Some(EntityId::from(id)),
            ..StreamOptions::default()
        };
        let stream = EntityStream::with_options(CounterEntity::default(), options);
        spawn_worker(EntityId::from(id), stream, config())
    }

    #[tokio::test]
    async fn commands_are_answered_in_order() {
        let (mut channel, task) = spawn("c-1");
        channel.handle().init(None).await.expect("init");

        for (id, expected) in [(1, 1), (2, 3), (3, 6)] {
            let out = channel
                .call(id, "increaseBy", Some(json!({"value": id})))
                .await
                .expect("worker alive");
            let OutboundMessage::Reply(Reply {
                command_id,
                client_action,
                ..
            }) = out
            else {
                panic!("expected a reply, got {out:?}");
            };
            assert_eq!(command_id, id);
            assert_eq!(
                client_action,
                ClientAction::Reply {
                    payload: json!({"value": expected})
                }
            );
        }

        drop(channel);
        let report = task.await.expect("worker task");
        assert_eq!(report.exit, StreamExit::InboundClosed);
    }

    #[tokio::test]
    async fn pipelined_commands_keep_arrival_order() {
        let (channel, _task) = spawn("c-1");
        let (handle, mut replies) = channel.into_parts();
        handle.init(None).await.expect("init");
        for id in 1..=3 {
            handle
                .command(id, "increaseBy", Some(json!({"value": 1})))
                .await
                .expect("send");
        }
        handle.snapshot_request(99).await.expect("send");

        for id in 1..=3 {
            match replies.recv().await {
                Some(OutboundMessage::Reply(r)) => assert_eq!(r.command_id, id),
                other => panic!("expected reply {id}, got {other:?}"),
            }
        }
        match replies.recv().await {
            Some(OutboundMessage::SnapshotReply(r)) => {
                assert_eq!(r.request_id, 99);
                assert_eq!(r.snapshot.sequence_number, 3);
            }
            other => panic!("expected a snapshot reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn handle_reports_dead_worker() {
        let (channel, task) = spawn("c-1");
        let handle = channel.handle().clone();
        handle.init(None).await.expect("init");
        handle.init(None).await.expect("second init is queued");

        let report = task.await.expect("worker task");
        assert_eq!(report.exit, StreamExit::Terminated);
        assert!(!handle.is_alive());
        assert_eq!(
            handle.command(1, "get", None).await,
            Err(ChannelError::WorkerGone)
        );
    }
}
