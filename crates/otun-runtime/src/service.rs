//! Tunnel service - host-facing handle to the orchestrator worker.

use crate::message::{CommandAck, CommandId, ServiceEvent, ServiceMessage};
use crate::worker::spawn_worker;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use otun_vpn::{PolicySource, TunnelCommand, TunnelOrchestrator, TunnelState};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Queues tunnel commands for a single orchestrator worker.
pub struct TunnelService {
    /// Commands to the worker
    tx: Sender<ServiceMessage>,
    /// Completion events from the worker
    event_rx: Receiver<ServiceEvent>,
    /// Worker thread handle, taken on shutdown
    worker: Option<JoinHandle<()>>,
    /// Shared with the orchestrator
    state: Arc<RwLock<TunnelState>>,
    next_id: AtomicU64,
}

impl TunnelService {
    /// Move `orchestrator` onto its worker thread.
    pub fn new(
        orchestrator: TunnelOrchestrator,
        policy: Box<dyn PolicySource>,
    ) -> Result<Self, ServiceError> {
        info!("Initializing tunnel service");

        let (tx, rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let state = orchestrator.state_handle();
        let worker = spawn_worker(orchestrator, policy, rx, event_tx).map_err(ServiceError::Spawn)?;

        Ok(Self {
            tx,
            event_rx,
            worker: Some(worker),
            state,
            next_id: AtomicU64::new(1),
        })
    }

    /// Queue a command and return immediately.
    pub fn handle_command(&self, command: TunnelCommand) -> Result<CommandAck, ServiceError> {
        let id = CommandId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.tx
            .send(ServiceMessage::Command { id, command })
            .map_err(|_| ServiceError::Disconnected)?;

        debug!("Queued {} {:?}", id, command);
        Ok(CommandAck { id, command })
    }

    /// Block until every command queued so far has been handled.
    pub fn flush(&self) -> Result<(), ServiceError> {
        let (done_tx, done_rx) = bounded(1);
        self.tx
            .send(ServiceMessage::Flush { done: done_tx })
            .map_err(|_| ServiceError::Disconnected)?;
        done_rx.recv().map_err(|_| ServiceError::Disconnected)
    }

    /// Current tunnel state as last published by the worker.
    pub fn state(&self) -> TunnelState {
        *self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Poll for completion events (non-blocking).
    pub fn poll_events(&self) -> Vec<ServiceEvent> {
        self.event_rx.try_iter().collect()
    }

    /// Stop the worker and wait for it to tear the tunnel down.
    pub fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        info!("Shutting down tunnel service");
        let _ = self.tx.send(ServiceMessage::Shutdown);
        if worker.join().is_err() {
            warn!("Orchestrator worker panicked during shutdown");
        }
    }
}

impl Drop for TunnelService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Tunnel service errors
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Failed to spawn orchestrator worker: {0}")]
    Spawn(std::io::Error),

    #[error("Orchestrator worker is gone")]
    Disconnected,
}
