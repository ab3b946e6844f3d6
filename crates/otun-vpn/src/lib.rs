//! otun VPN - Tunnel Orchestrator for a Local SOCKS Proxy
//!
//! Forces device traffic through the anonymizing client's SOCKS listener
//! and all DNS through a local forwarder bound to that client's resolver.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Device                               │
//! │                                                               │
//! │  ┌──────────┐   ┌─────────────────┐   ┌──────────────────┐   │
//! │  │   Apps   │──▶│ Virtual iface   │──▶│ Packet forwarder │   │
//! │  └──────────┘   │ 192.168.200.1   │   │   (tun2socks)    │   │
//! │                 └─────────────────┘   └──┬────────────┬──┘   │
//! │                                       TCP│         DNS│      │
//! │                                          ▼            ▼      │
//! │   ┌──────────────┐   ┌────────────┐   ┌──────────────────┐   │
//! │   │ Bypass proxy │◀──│ Tor client │◀──│  DNS forwarder   │   │
//! │   │  (protected) │   │ SOCKS/DNS  │   │ (pdnsd :8091)    │   │
//! │   └──────┬───────┘   └────────────┘   └──────────────────┘   │
//! └──────────│────────────────────────────────────────────────────┘
//!            ▼
//!        Internet
//! ```
//!
//! # Features
//!
//! - **Single interface**: a new interface is never opened before the old
//!   one is closed
//! - **Per-app routing**: allow-list of selected apps, or everything but
//!   this process
//! - **Bypass proxy**: keeps the client's own traffic out of the tunnel where
//!   the platform cannot exclude it natively
//! - **Bounded kills**: external daemons are signalled with retry and backoff

mod config;
mod dns;
mod forwarder;
mod interface;
mod orchestrator;
mod proxy;
mod routing;
mod supervisor;

pub use config::{
    port_from_wire, ConfigError, PersistedState, StateStore, VpnConfig, DEFAULT_DNS_FORWARDER_PORT,
    DEFAULT_MTU, DEFAULT_RESTART_GRACE, DEFAULT_TOR_DNS_PORT,
};
pub use dns::{read_pid_file, DnsForwarder, DnsForwarderError, ForwarderProcess, PdnsdConfig};
pub use forwarder::{ForwarderError, ForwarderParams, PacketForwarder};
pub use interface::{
    InterfaceBuilder, InterfaceError, InterfaceSettings, TunDescriptor, VirtualInterface,
};
pub use orchestrator::{
    TunnelCommand, TunnelError, TunnelOrchestrator, TunnelPorts, TunnelSession, TunnelState,
};
pub use proxy::{BypassError, BypassProxy, SocketProtector};
pub use routing::{
    compare_by_label, resolve, routing_decision, AppInventory, FilePolicy, InstalledApp,
    JsonAppInventory, PolicySnapshot, PolicySource, RoutedApplication, RoutingDecision,
    SelectionSet, StaticInventory, StaticPolicy, NETWORK_PERMISSION,
};
pub use supervisor::{
    find_pid_in, parse_pid_line, KillMechanism, KillTarget, ProcessHost, ProcessSupervisor,
    RetryPolicy, Signal, SupervisorError, SystemProcessHost,
};
