//! Packet Forwarder
//!
//! Seam for the tun2socks engine that turns packets read from the virtual
//! interface into SOCKS connections. Its packet handling is out of scope;
//! the orchestrator only starts and stops it.

use crate::interface::TunDescriptor;
use std::net::Ipv4Addr;

/// Everything the packet forwarder needs to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwarderParams {
    pub descriptor: TunDescriptor,
    pub mtu: u16,
    /// Address of the forwarder's own netif, distinct from the gateway
    pub virtual_ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    /// Upstream SOCKS proxy, `host:port`
    pub socks_addr: String,
    /// Local DNS forwarder, `host:port`
    pub dns_addr: String,
    /// Redirect every DNS query to `dns_addr` whatever server the client asked
    pub transparent_dns: bool,
}

/// A packet-to-socket forwarding engine
pub trait PacketForwarder: Send {
    fn start(&mut self, params: &ForwarderParams) -> Result<(), ForwarderError>;

    /// Stop forwarding. Safe to call when not running.
    fn stop(&mut self);

    fn is_running(&self) -> bool;
}

/// Packet forwarder errors
#[derive(Debug, thiserror::Error)]
pub enum ForwarderError {
    #[error("Packet forwarder already running")]
    AlreadyRunning,

    #[error("Failed to start packet forwarder: {0}")]
    Spawn(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
