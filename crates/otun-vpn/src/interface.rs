//! Virtual Interface
//!
//! The OS-provided point-to-point device whose packets are delivered to the
//! packet forwarder. Establishing it is platform specific, so the
//! orchestrator only sees [`InterfaceBuilder`] and [`VirtualInterface`].

use crate::proxy::SocketProtector;
use crate::routing::RoutingDecision;
use std::net::Ipv4Addr;

/// How the packet forwarder reaches an established interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunDescriptor {
    /// Open file descriptor handed over by the platform
    Fd(i32),
    /// Named TUN device the forwarder opens itself
    Device(String),
}

impl std::fmt::Display for TunDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunDescriptor::Fd(fd) => write!(f, "fd {}", fd),
            TunDescriptor::Device(name) => write!(f, "dev {}", name),
        }
    }
}

/// Attributes requested for a new interface
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceSettings {
    pub session: String,
    pub mtu: u16,
    /// Interface addresses with prefix length
    pub addresses: Vec<(Ipv4Addr, u8)>,
    pub dns_servers: Vec<Ipv4Addr>,
    /// Routes captured by the interface
    pub routes: Vec<(Ipv4Addr, u8)>,
    /// When non-empty, only these packages are routed
    pub allowed_apps: Vec<String>,
    /// Packages never routed
    pub disallowed_apps: Vec<String>,
}

impl InterfaceSettings {
    pub fn new(session: &str) -> Self {
        Self {
            session: session.to_string(),
            ..Self::default()
        }
    }

    pub fn mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn add_address(mut self, addr: Ipv4Addr, prefix: u8) -> Self {
        self.addresses.push((addr, prefix));
        self
    }

    pub fn add_dns_server(mut self, addr: Ipv4Addr) -> Self {
        self.dns_servers.push(addr);
        self
    }

    pub fn add_route(mut self, addr: Ipv4Addr, prefix: u8) -> Self {
        self.routes.push((addr, prefix));
        self
    }

    /// Apply a per-app decision. Allow- and deny-lists are exclusive.
    pub fn apply_routing(mut self, decision: RoutingDecision) -> Self {
        match decision {
            RoutingDecision::AllowOnly(packages) => {
                self.allowed_apps = packages;
                self.disallowed_apps.clear();
            }
            RoutingDecision::DisallowOnly(packages) => {
                self.disallowed_apps = packages;
                self.allowed_apps.clear();
            }
        }
        self
    }

    /// Has a default route (0.0.0.0/0)
    pub fn captures_all_traffic(&self) -> bool {
        self.routes.iter().any(|(_, prefix)| *prefix == 0)
    }
}

/// An established virtual interface
pub trait VirtualInterface: Send {
    fn descriptor(&self) -> TunDescriptor;

    /// Release the interface. Closing twice is a no-op.
    fn close(&mut self) -> Result<(), InterfaceError>;

    fn is_closed(&self) -> bool;
}

/// Platform hook that creates virtual interfaces
pub trait InterfaceBuilder: Send {
    /// Whether per-app allow/deny lists are honored
    fn supports_app_exclusion(&self) -> bool;

    /// Hook that exempts a socket from this platform's tunnel, handed to
    /// the bypass proxy
    fn socket_protector(&self) -> Option<SocketProtector> {
        None
    }

    fn establish(&mut self, settings: &InterfaceSettings)
    -> Result<Box<dyn VirtualInterface>, InterfaceError>;
}

/// Interface errors
#[derive(Debug, thiserror::Error)]
pub enum InterfaceError {
    #[error("Failed to establish interface: {0}")]
    Establish(String),

    #[error("Interface already closed")]
    AlreadyClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
