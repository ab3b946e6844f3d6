//! Message types for communication between the host and the orchestrator worker.

use crossbeam_channel::Sender;
use otun_vpn::{TunnelCommand, TunnelState};
use std::fmt;

/// Sequence number assigned to each submitted command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(pub u64);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cmd({})", self.0)
    }
}

/// Returned as soon as a command is queued; the work happens later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandAck {
    pub id: CommandId,
    pub command: TunnelCommand,
}

/// Messages sent from the host to the orchestrator worker.
#[derive(Debug)]
pub enum ServiceMessage {
    /// Run one tunnel command
    Command { id: CommandId, command: TunnelCommand },
    /// Reply once every earlier message has been handled
    Flush { done: Sender<()> },
    /// Graceful shutdown request
    Shutdown,
}

/// Messages sent from the orchestrator worker back to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    /// Command handled; state the tunnel settled in
    Completed { id: CommandId, state: TunnelState },
    /// Command panicked; the worker keeps running
    Crashed { id: CommandId, error: String },
}

impl ServiceEvent {
    pub fn id(&self) -> CommandId {
        match self {
            ServiceEvent::Completed { id, .. } | ServiceEvent::Crashed { id, .. } => *id,
        }
    }
}
