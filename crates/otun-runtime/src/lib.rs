//! otun Tunnel Runtime
//!
//! Serializes host commands onto a single orchestrator worker:
//! - Non-blocking command submission with acknowledgement tokens
//! - One named worker thread; a panicking command is reported as
//!   [`ServiceEvent::Crashed`] when built with `panic = "unwind"`. Release
//!   builds abort on panic, taking the process down instead.
//! - Flush and graceful shutdown that waits for teardown

mod message;
mod service;
mod worker;

pub use message::{CommandAck, CommandId, ServiceEvent, ServiceMessage};
pub use service::{ServiceError, TunnelService};
pub use worker::WORKER_THREAD_NAME;
