//! Linux TUN interfaces managed through iproute2.
//!
//! The device is created persistent with `ip tuntap` and handed to the
//! packet forwarder by name. Tunnel routes live in their own table, reached
//! through a policy rule, so the host's main table is never touched:
//!
//! ```text
//! priority 7000: fwmark <mark> lookup main     (bypass proxy sockets)
//! priority 7001: lookup <table>                (everything else -> otun0)
//! ```
//!
//! Per-app rules are not available here, so the orchestrator falls back to
//! the bypass proxy, whose sockets carry the mark.

use otun_vpn::{
    InterfaceBuilder, InterfaceError, InterfaceSettings, SocketProtector, TunDescriptor,
    VirtualInterface,
};
use std::process::{Command, Stdio};
use std::sync::Arc;
use tracing::{debug, info, warn};

const IP: &str = "ip";

/// Routing table holding the tunnel routes
pub const DEFAULT_ROUTE_TABLE: u32 = 7007;

/// Mark put on bypass proxy sockets
pub const DEFAULT_FWMARK: u32 = 7007;

const BYPASS_RULE_PRIORITY: u32 = 7000;
const TUNNEL_RULE_PRIORITY: u32 = 7001;

/// Routing knobs for one TUN device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpLinkRouting {
    pub device: String,
    pub table: u32,
    pub fwmark: u32,
}

impl IpLinkRouting {
    /// `ip` invocations that bring the device up with `settings`
    pub fn setup_commands(&self, settings: &InterfaceSettings) -> Vec<Vec<String>> {
        let device = self.device.as_str();
        let table = self.table.to_string();
        let mut commands = vec![args(&["tuntap", "add", "dev", device, "mode", "tun"])];

        for (addr, prefix) in &settings.addresses {
            commands.push(args(&["addr", "add", &format!("{}/{}", addr, prefix), "dev", device]));
        }

        commands.push(args(&["link", "set", "dev", device, "mtu", &settings.mtu.to_string(), "up"]));

        for (addr, prefix) in &settings.routes {
            let target = if *prefix == 0 {
                "default".to_string()
            } else {
                format!("{}/{}", addr, prefix)
            };
            commands.push(args(&["route", "replace", &target, "dev", device, "table", &table]));
        }

        commands.push(args(&[
            "rule", "add", "fwmark", &self.fwmark.to_string(), "lookup", "main",
            "priority", &BYPASS_RULE_PRIORITY.to_string(),
        ]));
        commands.push(args(&[
            "rule", "add", "lookup", &table, "priority", &TUNNEL_RULE_PRIORITY.to_string(),
        ]));

        commands
    }

    /// Reverse of [`setup_commands`](Self::setup_commands). Rules go first
    /// so traffic returns to the main table before the device disappears.
    pub fn teardown_commands(&self) -> Vec<Vec<String>> {
        vec![
            args(&["rule", "del", "priority", &TUNNEL_RULE_PRIORITY.to_string()]),
            args(&["rule", "del", "priority", &BYPASS_RULE_PRIORITY.to_string()]),
            args(&["route", "flush", "table", &self.table.to_string()]),
            args(&["link", "delete", "dev", &self.device]),
        ]
    }

    /// Run every teardown step, reporting the first failure
    fn teardown(&self) -> Result<(), InterfaceError> {
        let mut first_error = None;
        for command in self.teardown_commands() {
            if let Err(e) = run_ip(&command) {
                debug!("{}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Creates TUN devices with the `ip` tool
#[derive(Debug, Clone)]
pub struct IpLinkBuilder {
    routing: IpLinkRouting,
}

impl IpLinkBuilder {
    pub fn new(device: &str, table: u32, fwmark: u32) -> Self {
        Self {
            routing: IpLinkRouting {
                device: device.to_string(),
                table,
                fwmark,
            },
        }
    }

    pub fn routing(&self) -> &IpLinkRouting {
        &self.routing
    }
}

impl InterfaceBuilder for IpLinkBuilder {
    fn supports_app_exclusion(&self) -> bool {
        false
    }

    fn socket_protector(&self) -> Option<SocketProtector> {
        let mark = self.routing.fwmark;
        Some(Arc::new(move |fd| mark_socket(fd, mark)))
    }

    fn establish(
        &mut self,
        settings: &InterfaceSettings,
    ) -> Result<Box<dyn VirtualInterface>, InterfaceError> {
        if !settings.dns_servers.is_empty() {
            debug!("DNS servers {:?} are answered by the forwarder", settings.dns_servers);
        }

        for command in self.routing.setup_commands(settings) {
            if let Err(e) = run_ip(&command) {
                // Leave nothing half-configured behind
                let _ = self.routing.teardown();
                return Err(e);
            }
        }

        info!(
            "TUN device {} up ({}, table {})",
            self.routing.device, settings.session, self.routing.table
        );
        Ok(Box::new(IpLinkInterface {
            routing: self.routing.clone(),
            closed: false,
        }))
    }
}

/// A TUN device created by [`IpLinkBuilder`]
#[derive(Debug)]
pub struct IpLinkInterface {
    routing: IpLinkRouting,
    closed: bool,
}

impl VirtualInterface for IpLinkInterface {
    fn descriptor(&self) -> TunDescriptor {
        TunDescriptor::Device(self.routing.device.clone())
    }

    fn close(&mut self) -> Result<(), InterfaceError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.routing.teardown()
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for IpLinkInterface {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to remove {}: {}", self.routing.device, e);
        }
    }
}

/// Set `SO_MARK` on a socket owned by the caller. Needs `CAP_NET_ADMIN`.
#[cfg(target_os = "linux")]
pub fn mark_socket(fd: i32, mark: u32) -> bool {
    use std::os::fd::BorrowedFd;

    // SAFETY: the bypass proxy keeps `fd` open for the duration of the call
    let fd = unsafe { BorrowedFd::borrow_raw(fd) };
    match socket2::SockRef::from(&fd).set_mark(mark) {
        Ok(()) => true,
        Err(e) => {
            warn!("Failed to mark socket: {}", e);
            false
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn mark_socket(_fd: i32, _mark: u32) -> bool {
    false
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn run_ip(args: &[String]) -> Result<(), InterfaceError> {
    debug!("{} {}", IP, args.join(" "));
    let output = Command::new(IP)
        .args(args)
        .stdin(Stdio::null())
        .output()?;

    if output.status.success() {
        Ok(())
    } else {
        Err(InterfaceError::Establish(format!(
            "{} {}: {}",
            IP,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}
