//! Orchestrator worker thread.
//!
//! Panics inside a command are caught only when the crate is built with
//! unwinding. Under `panic = "abort"` (the release profile) a panic ends
//! the process.

use crate::message::{CommandId, ServiceEvent, ServiceMessage};
use crossbeam_channel::{Receiver, Sender};
use otun_vpn::{PolicySource, TunnelCommand, TunnelOrchestrator};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use tracing::{debug, error, info};

pub const WORKER_THREAD_NAME: &str = "tunnel-orchestrator";

/// Spawn the single consumer of the command queue.
///
/// The worker owns the orchestrator; commands run strictly in arrival
/// order. With unwinding, a panicking command is reported without killing
/// the thread.
pub fn spawn_worker(
    orchestrator: TunnelOrchestrator,
    policy: Box<dyn PolicySource>,
    rx: Receiver<ServiceMessage>,
    event_tx: Sender<ServiceEvent>,
) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name(WORKER_THREAD_NAME.to_string())
        .spawn(move || {
            info!("Orchestrator worker started");
            run_worker_loop(orchestrator, policy, rx, event_tx);
            info!("Orchestrator worker stopped");
        })
}

fn run_worker_loop(
    mut orchestrator: TunnelOrchestrator,
    policy: Box<dyn PolicySource>,
    rx: Receiver<ServiceMessage>,
    event_tx: Sender<ServiceEvent>,
) {
    loop {
        let msg = match rx.recv() {
            Ok(msg) => msg,
            Err(_) => {
                debug!("Command channel closed, shutting down");
                break;
            }
        };

        match msg {
            ServiceMessage::Shutdown => {
                debug!("Orchestrator worker received shutdown");
                break;
            }
            ServiceMessage::Flush { done } => {
                let _ = done.send(());
            }
            ServiceMessage::Command { id, command } => {
                let event = run_command(&mut orchestrator, policy.as_ref(), id, command);
                let _ = event_tx.send(event);
            }
        }
    }

    // Dropping the orchestrator tears the tunnel down on this thread
    drop(orchestrator);
}

fn run_command(
    orchestrator: &mut TunnelOrchestrator,
    policy: &dyn PolicySource,
    id: CommandId,
    command: TunnelCommand,
) -> ServiceEvent {
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        // Fresh snapshot per command
        let snapshot = policy.snapshot();
        orchestrator.handle_command(command, &snapshot)
    }));

    match result {
        Ok(state) => {
            debug!("{} {:?} -> {}", id, command, state);
            ServiceEvent::Completed { id, state }
        }
        Err(panic_info) => {
            let error_msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic_info.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic".to_string()
            };

            error!("{} {:?} panicked: {}", id, command, error_msg);
            ServiceEvent::Crashed { id, error: error_msg }
        }
    }
}
