//! Runs a [`ChunkManager`] on its own task behind a command mailbox.
//!
//! The consumer side gets a cloneable [`ChunkManagerHandle`] for commands
//! and a [`Mirror`] fed by the owner's outbox. Owner state is only ever
//! touched by the actor task.

use std::sync::Arc;

use runtime::metrics::MetricsSnapshot;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::chunk::ChunkRequest;
use crate::config::{ConfigError, StreamingConfig};
use crate::manager::{ChunkManager, FetchOutcome, ManagerError};
use crate::mirror::Mirror;
use crate::protocol::{ConsumerMessage, OwnerMessage};
use crate::registration::SourceRefs;
use crate::registry::Registry;
use crate::request::{ChunkPriority, GridPosition, RequestId, SourceId};
use crate::source::SourceDescriptor;

#[derive(Debug)]
enum Command {
    AcquireSource {
        descriptor: SourceDescriptor,
        reply: oneshot::Sender<Result<SourceId, ManagerError>>,
    },
    RetainSource(SourceId),
    ReleaseSource(SourceId),
    FetchChunk {
        source: SourceId,
        position: GridPosition,
        priority: ChunkPriority,
        reply: oneshot::Sender<Result<ChunkRequest, ManagerError>>,
    },
    WithdrawRequest(RequestId),
    Message(ConsumerMessage),
    Metrics(oneshot::Sender<MetricsSnapshot>),
    Shutdown,
}

enum Event {
    Command(Command),
    Outcome(FetchOutcome),
}

pub struct ChunkManagerActor {
    manager: ChunkManager,
    commands: mpsc::UnboundedReceiver<Command>,
    outbox: mpsc::UnboundedSender<OwnerMessage>,
}

impl ChunkManagerActor {
    pub fn new(manager: ChunkManager) -> (Self, ChunkManagerHandle, Mirror) {
        let (tx, commands) = mpsc::unbounded_channel();
        let (outbox, inbox) = mpsc::unbounded_channel();
        (
            Self {
                manager,
                commands,
                outbox,
            },
            ChunkManagerHandle { tx },
            Mirror::new(inbox),
        )
    }

    /// Processes one command or fetch outcome at a time until shut down or
    /// every handle is gone. Returns the manager for inspection.
    pub async fn run(mut self) -> ChunkManager {
        info!("chunk manager started");
        loop {
            let event = tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => Event::Command(command),
                    None => break,
                },
                Some(outcome) = self.manager.next_outcome() => Event::Outcome(outcome),
            };
            match event {
                Event::Command(Command::Shutdown) => break,
                Event::Command(command) => self.handle(command),
                Event::Outcome(outcome) => self.manager.handle_outcome(outcome),
            }
            self.flush();
        }
        self.flush();
        info!(
            sources = self.manager.source_ids().len(),
            in_flight = self.manager.in_flight_len(),
            "chunk manager stopped"
        );
        self.manager
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::AcquireSource { descriptor, reply } => {
                let _ = reply.send(self.manager.acquire_source(descriptor));
            }
            Command::RetainSource(source) => SourceRefs::retain_source(&mut self.manager, source),
            Command::ReleaseSource(source) => SourceRefs::release_source(&mut self.manager, source),
            Command::FetchChunk {
                source,
                position,
                priority,
                reply,
            } => {
                let _ = reply.send(self.manager.fetch_chunk(source, position, priority));
            }
            Command::WithdrawRequest(id) => {
                self.manager.withdraw_request(id);
            }
            Command::Message(message) => self.manager.apply_consumer_message(message),
            Command::Metrics(reply) => {
                let _ = reply.send(self.manager.metrics().snapshot());
            }
            Command::Shutdown => {}
        }
    }

    fn flush(&mut self) {
        for message in self.manager.drain_events() {
            if self.outbox.send(message).is_err() {
                debug!("mirror gone, dropping owner messages");
                break;
            }
        }
    }
}

/// Spawns an actor on the current runtime.
pub fn spawn(
    config: StreamingConfig,
    registry: Arc<Registry>,
) -> Result<(ChunkManagerHandle, Mirror, JoinHandle<ChunkManager>), ConfigError> {
    let manager = ChunkManager::new(config, registry)?;
    let (actor, handle, mirror) = ChunkManagerActor::new(manager);
    Ok((handle, mirror, tokio::spawn(actor.run())))
}

/// Consumer-side command sender.
#[derive(Debug, Clone)]
pub struct ChunkManagerHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ChunkManagerHandle {
    fn command(&self, command: Command) -> Result<(), ManagerError> {
        self.tx.send(command).map_err(|_| ManagerError::Closed)
    }

    /// Opens or shares a source; the returned handle owns one reference.
    pub async fn acquire_source(
        &self,
        descriptor: SourceDescriptor,
    ) -> Result<RemoteSource, ManagerError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::AcquireSource { descriptor, reply })?;
        let id = rx.await.map_err(|_| ManagerError::Closed)??;
        Ok(RemoteSource {
            id,
            tx: self.tx.clone(),
        })
    }

    pub async fn fetch_chunk(
        &self,
        source: SourceId,
        position: impl Into<GridPosition>,
        priority: ChunkPriority,
    ) -> Result<ChunkRequest, ManagerError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::FetchChunk {
            source,
            position: position.into(),
            priority,
            reply,
        })?;
        rx.await.map_err(|_| ManagerError::Closed)?
    }

    pub fn withdraw_request(&self, id: RequestId) -> Result<(), ManagerError> {
        self.command(Command::WithdrawRequest(id))
    }

    pub fn send(&self, message: ConsumerMessage) -> Result<(), ManagerError> {
        self.command(Command::Message(message))
    }

    pub async fn metrics(&self) -> Result<MetricsSnapshot, ManagerError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Metrics(reply))?;
        rx.await.map_err(|_| ManagerError::Closed)
    }

    pub fn shutdown(&self) -> Result<(), ManagerError> {
        self.command(Command::Shutdown)
    }
}

impl SourceRefs for ChunkManagerHandle {
    fn retain_source(&mut self, source: SourceId) {
        let _ = self.command(Command::RetainSource(source));
    }

    fn release_source(&mut self, source: SourceId) {
        let _ = self.command(Command::ReleaseSource(source));
    }
}

/// One reference to an owner-side source. Cloning takes another reference;
/// dropping the last one disposes the source on the owner.
#[derive(Debug)]
pub struct RemoteSource {
    id: SourceId,
    tx: mpsc::UnboundedSender<Command>,
}

impl RemoteSource {
    pub fn id(&self) -> SourceId {
        self.id
    }
}

impl Clone for RemoteSource {
    fn clone(&self) -> Self {
        let _ = self.tx.send(Command::RetainSource(self.id));
        Self {
            id: self.id,
            tx: self.tx.clone(),
        }
    }
}

impl Drop for RemoteSource {
    fn drop(&mut self) {
        // Fails only when the owner is already gone.
        let _ = self.tx.send(Command::ReleaseSource(self.id));
    }
}
