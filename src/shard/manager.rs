//! Shard manager
//!
//! Owns every shard of one pool: spawns a session task per shard, restarts
//! lost connections with backoff, serializes IDENTIFYs through a shared
//! [`IdentifyThrottle`], and stops everything on the first fatal error.

use super::identify::IdentifyThrottle;
use super::session::{CycleOutcome, ShardCommand, ShardId, ShardSession};
use super::state::{ShardState, ShardStatusEvent};
use super::transport::TransportOpener;
use crate::config::{ManagerSettings, SessionSettings};
use crate::error::GatewayError;
use crate::events::GatewayEvent;

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

struct ShardHandle {
    cancel: CancellationToken,
    commands: mpsc::UnboundedSender<ShardCommand>,
    task: JoinHandle<()>,
}

/// Shard manager for one pool
pub struct ShardManager {
    settings: Arc<SessionSettings>,
    manager: ManagerSettings,
    opener: Arc<dyn TransportOpener>,
    sink: mpsc::Sender<GatewayEvent>,
    identify: Arc<IdentifyThrottle>,
    state: ShardState,
    shutdown: CancellationToken,
    shards: Mutex<HashMap<u32, ShardHandle>>,
    fatal_tx: mpsc::UnboundedSender<GatewayError>,
    fatal_rx: Mutex<mpsc::UnboundedReceiver<GatewayError>>,
}

impl ShardManager {
    /// Create a manager; no shard connects until [`ShardManager::start`] or
    /// [`ShardManager::connect`].
    pub fn new(
        settings: SessionSettings,
        manager: ManagerSettings,
        opener: Arc<dyn TransportOpener>,
        sink: mpsc::Sender<GatewayEvent>,
    ) -> Self {
        let range = manager.shard_range();
        info!(
            pool_id = manager.pool_id,
            start_shard = range.start,
            end_shard = range.end,
            total_shards = manager.total_shards,
            max_concurrency = manager.max_concurrency,
            "Creating shard manager"
        );

        let state = ShardState::new(range, manager.total_shards);
        let identify = Arc::new(IdentifyThrottle::new(manager.max_concurrency, manager.identify_window));
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();

        Self {
            settings: Arc::new(settings),
            manager,
            opener,
            sink,
            identify,
            state,
            shutdown: CancellationToken::new(),
            shards: Mutex::new(HashMap::new()),
            fatal_tx,
            fatal_rx: Mutex::new(fatal_rx),
        }
    }

    /// Get shared state (for health checks)
    pub fn state(&self) -> ShardState {
        self.state.clone()
    }

    /// Lifecycle stream: connecting, ready, reconnecting, disconnected, fatal
    pub fn subscribe(&self) -> broadcast::Receiver<ShardStatusEvent> {
        self.state.subscribe()
    }

    /// Shards owned by this manager
    pub fn shard_ids(&self) -> Range<u32> {
        self.manager.shard_range()
    }

    /// Connect every owned shard, staggered by `startup_stagger`.
    pub async fn start(&self) -> Result<(), GatewayError> {
        let ids = self.shard_ids();
        let last = ids.end.saturating_sub(1);
        for shard_id in ids {
            self.connect(shard_id).await?;
            if shard_id != last && !self.manager.startup_stagger.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.manager.startup_stagger) => {}
                    _ = self.shutdown.cancelled() => return Ok(()),
                }
            }
        }
        Ok(())
    }

    /// Start one shard. A shard that is already running is left alone.
    pub async fn connect(&self, shard_id: u32) -> Result<(), GatewayError> {
        self.check_owned(shard_id)?;

        let mut shards = self.shards.lock().await;
        if let Some(existing) = shards.get(&shard_id) {
            if !existing.task.is_finished() {
                return Ok(());
            }
        }

        let cancel = self.shutdown.child_token();
        let (commands, command_rx) = mpsc::unbounded_channel();
        let session = ShardSession::new(
            ShardId::new(shard_id, self.manager.total_shards),
            Arc::clone(&self.settings),
            Arc::clone(&self.opener),
            self.sink.clone(),
            Arc::clone(&self.identify),
            self.state.clone(),
        )
        .with_commands(command_rx);

        info!(shard_id, pool_id = self.manager.pool_id, "Shard starting");
        let task = tokio::spawn(drive_shard(session, cancel.clone(), self.fatal_tx.clone()));
        shards.insert(shard_id, ShardHandle { cancel, commands, task });
        Ok(())
    }

    /// Stop one shard: close with 1000 and wait for its task.
    pub async fn disconnect(&self, shard_id: u32) -> Result<(), GatewayError> {
        self.check_owned(shard_id)?;

        let handle = self.shards.lock().await.remove(&shard_id);
        if let Some(handle) = handle {
            handle.cancel.cancel();
            if let Err(e) = handle.task.await {
                warn!(shard_id, error = %e, "Shard task did not finish cleanly");
            }
        }
        Ok(())
    }

    /// Ask a running shard to drop its connection and resume.
    pub async fn reconnect(&self, shard_id: u32) -> Result<(), GatewayError> {
        self.check_owned(shard_id)?;

        let delivered = self
            .shards
            .lock()
            .await
            .get(&shard_id)
            .is_some_and(|handle| handle.commands.send(ShardCommand::Reconnect).is_ok());
        if delivered {
            Ok(())
        } else {
            self.connect(shard_id).await
        }
    }

    /// Wait until shutdown is requested or a shard fails fatally.
    ///
    /// A fatal error shuts down every shard and is returned.
    pub async fn run(&self) -> Result<(), GatewayError> {
        let mut fatal_rx = self.fatal_rx.lock().await;
        tokio::select! {
            Some(fatal) = fatal_rx.recv() => {
                error!(error = %fatal, error_type = fatal.error_type_label(), "Fatal shard error, stopping all shards");
                drop(fatal_rx);
                self.shutdown().await;
                Err(fatal)
            }
            _ = self.shutdown.cancelled() => Ok(()),
        }
    }

    /// Signal shutdown to all shards and wait for them to close.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<(u32, ShardHandle)> = self.shards.lock().await.drain().collect();
        for (shard_id, handle) in handles {
            if let Err(e) = handle.task.await {
                warn!(shard_id, error = %e, "Shard task did not finish cleanly");
            }
        }
        info!(pool_id = self.manager.pool_id, "Shard manager shut down");
    }

    fn check_owned(&self, shard_id: u32) -> Result<(), GatewayError> {
        let range = self.shard_ids();
        if range.contains(&shard_id) {
            Ok(())
        } else {
            Err(GatewayError::UnknownShard {
                shard_id,
                start: range.start,
                end: range.end,
            })
        }
    }
}

/// Reconnect loop for one shard
async fn drive_shard(
    mut session: ShardSession,
    cancel: CancellationToken,
    fatal_tx: mpsc::UnboundedSender<GatewayError>,
) {
    let shard_id = session.shard().index;
    loop {
        match session.run_once(&cancel).await {
            Ok(CycleOutcome::Shutdown) => {
                info!(shard_id, "Shard stopped");
                break;
            }
            Ok(CycleOutcome::Reconnect(reason)) => {
                let delay = session.next_backoff();
                warn!(
                    shard_id,
                    error = %reason,
                    error_type = reason.error_type_label(),
                    resume = session.can_resume(),
                    delay_ms = delay.as_millis() as u64,
                    "Shard disconnected, reconnecting"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        session.stop();
                        break;
                    }
                }
            }
            Err(fatal) => {
                error!(shard_id, error = %fatal, "Shard stopped on fatal error");
                let _ = fatal_tx.send(fatal);
                break;
            }
        }
    }
}
