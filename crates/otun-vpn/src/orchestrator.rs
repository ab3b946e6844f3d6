//! Tunnel Orchestrator
//!
//! Owns the virtual interface and drives the cooperating services through
//! start, stop and restart. Commands are handled one at a time by a single
//! owner, so a teardown always completes before the next bring-up begins.

use crate::config::{ConfigError, StateStore, VpnConfig};
use crate::dns::DnsForwarder;
use crate::forwarder::{ForwarderError, ForwarderParams, PacketForwarder};
use crate::interface::{InterfaceBuilder, InterfaceError, InterfaceSettings, VirtualInterface};
use crate::proxy::{BypassError, BypassProxy};
use crate::routing::{self, AppInventory, PolicySnapshot};
use crate::supervisor::ProcessSupervisor;
use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, warn};

/// Tunnel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TunnelState {
    /// No interface, nothing running
    #[default]
    Idle,
    /// Bringing up a fresh tunnel
    Starting,
    /// Interface established and forwarders launched
    Running,
    /// Tearing down a running tunnel to rebuild it
    Restarting,
    /// Full teardown in progress
    Stopping,
}

impl TunnelState {
    pub fn is_running(&self) -> bool {
        matches!(self, TunnelState::Running)
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, TunnelState::Idle)
    }

    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            TunnelState::Starting | TunnelState::Restarting | TunnelState::Stopping
        )
    }
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TunnelState::Idle => "idle",
            TunnelState::Starting => "starting",
            TunnelState::Running => "running",
            TunnelState::Restarting => "restarting",
            TunnelState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Commands accepted from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelCommand {
    /// (Re)build the tunnel with the last known ports
    Start,
    /// Tear everything down
    Stop,
    /// The anonymizing client moved its listeners; negative means unknown
    PortsChanged { socks: i32, dns: i32 },
}

/// Ports of the anonymizing client's listeners
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelPorts {
    pub socks: Option<u16>,
    pub dns: Option<u16>,
}

/// Mutable state of the current tunnel
#[derive(Default)]
pub struct TunnelSession {
    pub ports: TunnelPorts,
    /// The one open interface, if any
    pub interface: Option<Box<dyn VirtualInterface>>,
    /// Set while an existing tunnel is being rebuilt
    pub restart: bool,
}

impl TunnelSession {
    pub fn has_interface(&self) -> bool {
        self.interface.is_some()
    }
}

/// Drives the interface, DNS forwarder, packet forwarder and bypass proxy
pub struct TunnelOrchestrator {
    config: VpnConfig,
    builder: Box<dyn InterfaceBuilder>,
    forwarder: Box<dyn PacketForwarder>,
    inventory: Box<dyn AppInventory>,
    dns: DnsForwarder,
    bypass: BypassProxy,
    session: TunnelSession,
    state: Arc<RwLock<TunnelState>>,
}

impl TunnelOrchestrator {
    /// Create an orchestrator using the system process table and the
    /// on-disk state store under the working directory. The bypass proxy
    /// protects its sockets with the builder's hook, if it has one.
    pub fn new(
        config: VpnConfig,
        builder: Box<dyn InterfaceBuilder>,
        forwarder: Box<dyn PacketForwarder>,
        inventory: Box<dyn AppInventory>,
    ) -> Result<Self, TunnelError> {
        config.validate()?;
        let dns = DnsForwarder::new(&config, ProcessSupervisor::system());
        let mut bypass = BypassProxy::new(&config, StateStore::new(config.state_path()))?;
        if let Some(protect) = builder.socket_protector() {
            bypass = bypass.with_protector(move |fd| protect(fd));
        }
        Ok(Self::from_parts(config, builder, forwarder, inventory, dns, bypass))
    }

    /// Assemble an orchestrator from prebuilt services
    pub fn from_parts(
        config: VpnConfig,
        builder: Box<dyn InterfaceBuilder>,
        forwarder: Box<dyn PacketForwarder>,
        inventory: Box<dyn AppInventory>,
        dns: DnsForwarder,
        bypass: BypassProxy,
    ) -> Self {
        Self {
            config,
            builder,
            forwarder,
            inventory,
            dns,
            bypass,
            session: TunnelSession::default(),
            state: Arc::new(RwLock::new(TunnelState::Idle)),
        }
    }

    pub fn state(&self) -> TunnelState {
        *self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Shared handle for observers on other threads
    pub fn state_handle(&self) -> Arc<RwLock<TunnelState>> {
        self.state.clone()
    }

    pub fn session(&self) -> &TunnelSession {
        &self.session
    }

    pub fn ports(&self) -> TunnelPorts {
        self.session.ports
    }

    pub fn config(&self) -> &VpnConfig {
        &self.config
    }

    pub fn dns(&self) -> &DnsForwarder {
        &self.dns
    }

    pub fn bypass(&self) -> &BypassProxy {
        &self.bypass
    }

    /// Handle one command. Failures are logged, never returned.
    pub fn handle_command(&mut self, command: TunnelCommand, policy: &PolicySnapshot) -> TunnelState {
        debug!("Handling {:?} in state {}", command, self.state());

        let result = match command {
            TunnelCommand::Start => self.start(policy),
            TunnelCommand::Stop => {
                info!("Stopping tunnel");
                self.stop();
                Ok(())
            }
            TunnelCommand::PortsChanged { socks, dns } => self.ports_changed(socks, dns, policy),
        };

        if let Err(e) = result {
            match e {
                TunnelError::NoSocksPort => warn!("Tunnel not started: {}", e),
                e => error!("Tunnel command {:?} failed: {}", command, e),
            }
            // A bring-up that failed part way leaves no half-built tunnel behind
            if self.state().is_transitioning() {
                self.abandon_bring_up();
            }
        }

        self.state()
    }

    fn start(&mut self, policy: &PolicySnapshot) -> Result<(), TunnelError> {
        if self.session.has_interface() || self.forwarder.is_running() {
            debug!("Stopping previous session before start");
            self.stop();
        }

        if self.session.ports.socks.is_none() {
            debug!("SOCKS port unknown, waiting for ports");
            return Ok(());
        }

        if self.needs_bypass() {
            self.bypass.start();
        }
        self.bring_up(policy)
    }

    fn ports_changed(&mut self, socks: i32, dns: i32, policy: &PolicySnapshot) -> Result<(), TunnelError> {
        let ports = TunnelPorts {
            socks: wire_port(socks, "socks")?,
            dns: wire_port(dns, "dns")?,
        };

        if ports != self.session.ports {
            info!("Ports changed: socks={:?} dns={:?}", ports.socks, ports.dns);
            self.session.ports = ports;
            if self.needs_bypass() {
                self.bypass.start();
            }
        }

        // Rebuild even when nothing changed
        self.bring_up(policy)
    }

    /// Full teardown. Ports survive so a later start can rebuild.
    fn stop(&mut self) {
        self.set_state(TunnelState::Stopping);

        self.bypass.stop();
        self.close_interface();
        self.dns.stop();
        self.forwarder.stop();
        self.session.restart = false;

        self.set_state(TunnelState::Idle);
    }

    fn bring_up(&mut self, policy: &PolicySnapshot) -> Result<(), TunnelError> {
        let socks_port = self.session.ports.socks.ok_or(TunnelError::NoSocksPort)?;
        let dns_port = self.session.ports.dns.unwrap_or(self.config.default_dns_port);

        if self.session.has_interface() {
            self.set_state(TunnelState::Restarting);
            self.session.restart = true;
            self.forwarder.stop();
            self.dns.stop();
            self.close_interface();

            let grace = self.config.restart_grace();
            if !grace.is_zero() {
                info!("Restarting tunnel, waiting {:?}", grace);
                std::thread::sleep(grace);
            }
        } else {
            self.set_state(TunnelState::Starting);
        }

        let settings = self.interface_settings(policy);
        let interface = self.builder.establish(&settings)?;
        let descriptor = interface.descriptor();
        info!("Interface established ({})", descriptor);
        self.session.interface = Some(interface);
        self.session.restart = false;

        match self.dns.start(
            &self.config.upstream_host.to_string(),
            dns_port,
            &self.config.gateway.to_string(),
            self.config.dns_forwarder_port,
        ) {
            Ok(process) => debug!("DNS forwarder started (pid {:?})", process.pid),
            // Packets still flow without local DNS
            Err(e) => warn!("DNS forwarder not started: {}", e),
        }

        if self.forwarder.is_running() {
            self.forwarder.stop();
        }
        self.forwarder.start(&ForwarderParams {
            descriptor,
            mtu: self.config.mtu,
            virtual_ip: self.config.virtual_ip,
            netmask: self.config.netmask,
            socks_addr: self.config.socks_addr(socks_port),
            dns_addr: self.config.local_dns_addr(),
            transparent_dns: true,
        })?;

        self.set_state(TunnelState::Running);
        info!("Tunnel running via {}", self.config.socks_addr(socks_port));
        Ok(())
    }

    /// Undo whatever a failed bring-up managed to start. The bypass proxy
    /// and known ports stay so the next command can rebuild.
    fn abandon_bring_up(&mut self) {
        self.forwarder.stop();
        self.dns.stop();
        self.close_interface();
        self.session.restart = false;
        self.set_state(TunnelState::Idle);
    }

    fn interface_settings(&self, policy: &PolicySnapshot) -> InterfaceSettings {
        let settings = InterfaceSettings::new(&self.config.session_name)
            .mtu(self.config.mtu)
            .add_address(self.config.gateway, 32)
            .add_dns_server(self.config.dummy_dns)
            .add_route(self.config.dummy_dns, 32)
            .add_route(Ipv4Addr::UNSPECIFIED, 0);

        if !self.uses_app_exclusion() {
            return settings;
        }

        let installed = self.inventory.installed_apps();
        let apps = routing::resolve(&installed, policy, &self.config.own_package);
        let decision = routing::routing_decision(&apps, &self.config.own_package);
        debug!("App routing: {:?}", decision);
        settings.apply_routing(decision)
    }

    fn close_interface(&mut self) {
        if let Some(mut interface) = self.session.interface.take() {
            debug!("Closing interface");
            match interface.close() {
                Ok(()) | Err(InterfaceError::AlreadyClosed) => {}
                Err(e) => debug!("Error closing interface: {}", e),
            }
        }
    }

    fn uses_app_exclusion(&self) -> bool {
        self.config.native_app_exclusion && self.builder.supports_app_exclusion()
    }

    fn needs_bypass(&self) -> bool {
        !self.uses_app_exclusion()
    }

    fn set_state(&self, state: TunnelState) {
        let mut current = self.state.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *current != state {
            debug!("Tunnel state {} -> {}", *current, state);
            *current = state;
        }
    }
}

impl Drop for TunnelOrchestrator {
    fn drop(&mut self) {
        if self.session.has_interface() || self.forwarder.is_running() {
            self.stop();
        }
    }
}

/// Negative wire values mean "unknown"; zero and values above 65535 are invalid
fn wire_port(value: i32, name: &'static str) -> Result<Option<u16>, TunnelError> {
    if value < 0 {
        return Ok(None);
    }
    crate::config::port_from_wire(value)
        .map(Some)
        .ok_or(TunnelError::Config(ConfigError::InvalidPort(name)))
}

/// Tunnel errors
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("SOCKS port not known")]
    NoSocksPort,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Interface error: {0}")]
    Interface(#[from] InterfaceError),

    #[error("Packet forwarder error: {0}")]
    Forwarder(#[from] ForwarderError),

    #[error("Bypass proxy error: {0}")]
    Bypass(#[from] BypassError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::TunDescriptor;
    use crate::routing::{InstalledApp, StaticInventory, NETWORK_PERMISSION};
    use crate::supervisor::{ProcessHost, RetryPolicy};
    use std::io;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};

    const OWN: &str = "org.torproject.android";

    struct EmptyHost;

    impl ProcessHost for EmptyHost {
        fn list_processes(&self) -> io::Result<String> {
            Ok("USER PID PPID NAME\n".to_string())
        }

        fn execute(&self, _program: &str, _args: &[String]) -> io::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder {
        open: AtomicUsize,
        max_open: AtomicUsize,
        established: AtomicUsize,
        next_fd: AtomicI32,
        settings: Mutex<Vec<InterfaceSettings>>,
        forwarder_params: Mutex<Vec<ForwarderParams>>,
        forwarder_running: Mutex<bool>,
        forwarder_fail: AtomicBool,
    }

    struct FakeInterface {
        fd: i32,
        closed: bool,
        recorder: Arc<Recorder>,
    }

    impl VirtualInterface for FakeInterface {
        fn descriptor(&self) -> TunDescriptor {
            TunDescriptor::Fd(self.fd)
        }

        fn close(&mut self) -> Result<(), InterfaceError> {
            if self.closed {
                return Err(InterfaceError::AlreadyClosed);
            }
            self.closed = true;
            self.recorder.open.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }

        fn is_closed(&self) -> bool {
            self.closed
        }
    }

    struct FakeBuilder {
        app_exclusion: bool,
        fail: bool,
        recorder: Arc<Recorder>,
    }

    impl InterfaceBuilder for FakeBuilder {
        fn supports_app_exclusion(&self) -> bool {
            self.app_exclusion
        }

        fn establish(
            &mut self,
            settings: &InterfaceSettings,
        ) -> Result<Box<dyn VirtualInterface>, InterfaceError> {
            if self.fail {
                return Err(InterfaceError::Establish("permission denied".into()));
            }
            self.recorder.settings.lock().unwrap().push(settings.clone());
            self.recorder.established.fetch_add(1, Ordering::SeqCst);
            let open = self.recorder.open.fetch_add(1, Ordering::SeqCst) + 1;
            self.recorder.max_open.fetch_max(open, Ordering::SeqCst);
            Ok(Box::new(FakeInterface {
                fd: 10 + self.recorder.next_fd.fetch_add(1, Ordering::SeqCst),
                closed: false,
                recorder: self.recorder.clone(),
            }))
        }
    }

    struct FakeForwarder {
        recorder: Arc<Recorder>,
    }

    impl PacketForwarder for FakeForwarder {
        fn start(&mut self, params: &ForwarderParams) -> Result<(), ForwarderError> {
            let mut running = self.recorder.forwarder_running.lock().unwrap();
            if *running {
                return Err(ForwarderError::AlreadyRunning);
            }
            if self.recorder.forwarder_fail.load(Ordering::SeqCst) {
                return Err(ForwarderError::Spawn("tun2socks: not found".into()));
            }
            *running = true;
            self.recorder.forwarder_params.lock().unwrap().push(params.clone());
            Ok(())
        }

        fn stop(&mut self) {
            *self.recorder.forwarder_running.lock().unwrap() = false;
        }

        fn is_running(&self) -> bool {
            *self.recorder.forwarder_running.lock().unwrap()
        }
    }

    fn app(package: &str, user: &str) -> InstalledApp {
        InstalledApp {
            package_id: package.to_string(),
            uid: 10000,
            user_name: user.to_string(),
            label: None,
            declared_permissions: vec![NETWORK_PERMISSION.to_string()],
            is_system_app: false,
        }
    }

    struct Harness {
        orchestrator: TunnelOrchestrator,
        recorder: Arc<Recorder>,
        dir: PathBuf,
    }

    fn harness(name: &str, app_exclusion: bool, fail: bool) -> Harness {
        harness_with_dns(name, app_exclusion, fail, "true")
    }

    fn harness_with_dns(name: &str, app_exclusion: bool, fail: bool, dns_forwarder: &str) -> Harness {
        let dir = std::env::temp_dir().join(format!("otun-tunnel-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);

        let config = VpnConfig {
            working_dir: dir.clone(),
            dns_forwarder_path: PathBuf::from(dns_forwarder),
            restart_grace_ms: 0,
            ..VpnConfig::default()
        };
        let recorder = Arc::new(Recorder::default());
        let supervisor = ProcessSupervisor::new(Arc::new(EmptyHost), RetryPolicy::default().immediate());
        let dns = DnsForwarder::new(&config, supervisor);
        let bypass = BypassProxy::new(&config, StateStore::ephemeral()).unwrap();
        let inventory = StaticInventory(vec![app("com.a", "A"), app("com.c", "C"), app(OWN, "O")]);

        let orchestrator = TunnelOrchestrator::from_parts(
            config,
            Box::new(FakeBuilder { app_exclusion, fail, recorder: recorder.clone() }),
            Box::new(FakeForwarder { recorder: recorder.clone() }),
            Box::new(inventory),
            dns,
            bypass,
        );
        Harness { orchestrator, recorder, dir }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    const PORTS: TunnelCommand = TunnelCommand::PortsChanged { socks: 9050, dns: 5400 };

    #[test]
    fn test_start_without_ports_does_nothing() {
        let mut h = harness("noports", true, false);

        let state = h.orchestrator.handle_command(TunnelCommand::Start, &PolicySnapshot::default());

        assert_eq!(state, TunnelState::Idle);
        assert_eq!(h.recorder.established.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_ports_changed_brings_tunnel_up() {
        let mut h = harness("up", true, false);

        let state = h.orchestrator.handle_command(PORTS, &PolicySnapshot::default());

        assert_eq!(state, TunnelState::Running);
        let settings = h.recorder.settings.lock().unwrap()[0].clone();
        assert_eq!(settings.session, "OrbotVPN");
        assert_eq!(settings.mtu, 1500);
        assert_eq!(settings.addresses, vec![(Ipv4Addr::new(192, 168, 200, 1), 32)]);
        assert_eq!(settings.dns_servers, vec![Ipv4Addr::new(1, 1, 1, 1)]);
        assert_eq!(
            settings.routes,
            vec![(Ipv4Addr::new(1, 1, 1, 1), 32), (Ipv4Addr::UNSPECIFIED, 0)]
        );

        let params = h.recorder.forwarder_params.lock().unwrap()[0].clone();
        assert_eq!(params.virtual_ip, Ipv4Addr::new(192, 168, 200, 2));
        assert_eq!(params.netmask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(params.socks_addr, "127.0.0.1:9050");
        assert_eq!(params.dns_addr, "192.168.200.1:8091");
        assert!(params.transparent_dns);

        let conf = std::fs::read_to_string(h.orchestrator.dns().config_path()).unwrap();
        assert!(conf.contains("port = 5400;"));
        assert!(conf.contains("server_port = 8091;"));
    }

    #[test]
    fn test_repeated_starts_keep_one_interface() {
        let mut h = harness("repeat", true, false);
        let policy = PolicySnapshot::default();

        h.orchestrator.handle_command(PORTS, &policy);
        for _ in 0..4 {
            h.orchestrator.handle_command(TunnelCommand::Start, &policy);
        }

        assert_eq!(h.recorder.established.load(Ordering::SeqCst), 5);
        assert_eq!(h.recorder.max_open.load(Ordering::SeqCst), 1);
        assert_eq!(h.recorder.open.load(Ordering::SeqCst), 1);
        assert!(h.orchestrator.state().is_running());
    }

    #[test]
    fn test_ports_changed_always_resyncs() {
        let mut h = harness("resync", true, false);
        let policy = PolicySnapshot::default();

        h.orchestrator.handle_command(PORTS, &policy);
        h.orchestrator.handle_command(PORTS, &policy);

        assert_eq!(h.recorder.established.load(Ordering::SeqCst), 2);
        assert_eq!(h.recorder.max_open.load(Ordering::SeqCst), 1);
        assert!(!h.orchestrator.session().restart);
    }

    #[test]
    fn test_stop_postconditions() {
        let mut h = harness("stop", true, false);
        let policy = PolicySnapshot::default();

        h.orchestrator.handle_command(PORTS, &policy);
        std::fs::write(h.orchestrator.dns().pid_path(), "4242\n").unwrap();

        let state = h.orchestrator.handle_command(TunnelCommand::Stop, &policy);

        assert_eq!(state, TunnelState::Idle);
        assert!(!h.orchestrator.session().has_interface());
        assert_eq!(h.recorder.open.load(Ordering::SeqCst), 0);
        assert!(h.orchestrator.dns().tracked().is_none());
        assert!(!h.orchestrator.dns().pid_path().exists());
        assert!(!*h.recorder.forwarder_running.lock().unwrap());
        assert!(!h.orchestrator.bypass().is_running());
    }

    #[test]
    fn test_start_after_stop_reuses_ports() {
        let mut h = harness("restart", true, false);
        let policy = PolicySnapshot::default();

        h.orchestrator.handle_command(PORTS, &policy);
        h.orchestrator.handle_command(TunnelCommand::Stop, &policy);
        let state = h.orchestrator.handle_command(TunnelCommand::Start, &policy);

        assert_eq!(state, TunnelState::Running);
        assert_eq!(h.orchestrator.ports().socks, Some(9050));
    }

    #[test]
    fn test_selected_apps_become_allow_list() {
        let mut h = harness("allow", true, false);

        h.orchestrator.handle_command(PORTS, &PolicySnapshot::new("A|B|O"));

        let settings = h.recorder.settings.lock().unwrap()[0].clone();
        assert_eq!(settings.allowed_apps, vec!["com.a".to_string()]);
        assert!(settings.disallowed_apps.is_empty());
    }

    #[test]
    fn test_empty_policy_denies_own_package() {
        let mut h = harness("deny", true, false);

        h.orchestrator.handle_command(PORTS, &PolicySnapshot::default());

        let settings = h.recorder.settings.lock().unwrap()[0].clone();
        assert!(settings.allowed_apps.is_empty());
        assert_eq!(settings.disallowed_apps, vec![OWN.to_string()]);
    }

    #[test]
    fn test_bypass_used_without_app_exclusion() {
        let mut h = harness("bypass", false, false);

        h.orchestrator.handle_command(PORTS, &PolicySnapshot::new("A"));

        let settings = h.recorder.settings.lock().unwrap()[0].clone();
        assert!(settings.allowed_apps.is_empty());
        assert!(settings.disallowed_apps.is_empty());
        let port = h.orchestrator.bypass().port().unwrap();
        assert!((10000..=10999).contains(&port));
    }

    #[test]
    fn test_unknown_dns_port_falls_back() {
        let mut h = harness("dnsfallback", true, false);

        h.orchestrator.handle_command(
            TunnelCommand::PortsChanged { socks: 9050, dns: -1 },
            &PolicySnapshot::default(),
        );

        let conf = std::fs::read_to_string(h.orchestrator.dns().config_path()).unwrap();
        assert!(conf.contains("port = 5400;"));
    }

    #[test]
    fn test_invalid_port_short_circuits() {
        let mut h = harness("invalid", true, false);

        let state = h.orchestrator.handle_command(
            TunnelCommand::PortsChanged { socks: 70000, dns: 5400 },
            &PolicySnapshot::default(),
        );

        assert_eq!(state, TunnelState::Idle);
        assert_eq!(h.orchestrator.ports(), TunnelPorts::default());
        assert_eq!(h.recorder.established.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_establish_failure_leaves_no_interface() {
        let mut h = harness("fail", true, true);

        let state = h.orchestrator.handle_command(PORTS, &PolicySnapshot::default());

        assert_eq!(state, TunnelState::Idle);
        assert!(!h.orchestrator.session().has_interface());
        assert!(h.recorder.forwarder_params.lock().unwrap().is_empty());
    }

    #[test]
    fn test_dns_spawn_failure_still_starts_forwarder() {
        let mut h = harness_with_dns("nodns", true, false, "/nonexistent/pdnsd");

        let state = h.orchestrator.handle_command(PORTS, &PolicySnapshot::default());

        assert_eq!(state, TunnelState::Running);
        assert_eq!(h.recorder.open.load(Ordering::SeqCst), 1);
        assert_eq!(h.recorder.forwarder_params.lock().unwrap().len(), 1);
        assert!(*h.recorder.forwarder_running.lock().unwrap());
        assert!(h.orchestrator.dns().tracked().is_none());
    }

    #[test]
    fn test_forwarder_failure_settles_idle_and_recovers() {
        let mut h = harness("fwdfail", true, false);
        let policy = PolicySnapshot::default();
        h.recorder.forwarder_fail.store(true, Ordering::SeqCst);

        let state = h.orchestrator.handle_command(PORTS, &policy);

        assert_eq!(state, TunnelState::Idle);
        assert!(!h.orchestrator.session().has_interface());
        assert_eq!(h.recorder.open.load(Ordering::SeqCst), 0);
        assert!(h.orchestrator.dns().tracked().is_none());
        assert_eq!(h.orchestrator.ports().socks, Some(9050));

        h.recorder.forwarder_fail.store(false, Ordering::SeqCst);
        let state = h.orchestrator.handle_command(TunnelCommand::Start, &policy);

        assert_eq!(state, TunnelState::Running);
        assert_eq!(h.recorder.open.load(Ordering::SeqCst), 1);
        assert_eq!(h.recorder.max_open.load(Ordering::SeqCst), 1);
        assert_eq!(h.recorder.forwarder_params.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_failed_restart_does_not_report_running() {
        let mut h = harness("restartfail", true, false);
        let policy = PolicySnapshot::default();

        h.orchestrator.handle_command(PORTS, &policy);
        h.recorder.forwarder_fail.store(true, Ordering::SeqCst);
        let state = h.orchestrator.handle_command(PORTS, &policy);

        assert_eq!(state, TunnelState::Idle);
        assert!(!h.orchestrator.session().has_interface());
        assert!(!h.orchestrator.session().restart);
    }

    #[test]
    fn test_new_protects_bypass_with_builder_hook() {
        struct ProtectingBuilder(FakeBuilder);

        impl InterfaceBuilder for ProtectingBuilder {
            fn supports_app_exclusion(&self) -> bool {
                false
            }

            fn socket_protector(&self) -> Option<crate::proxy::SocketProtector> {
                Some(Arc::new(|_fd| true))
            }

            fn establish(
                &mut self,
                settings: &InterfaceSettings,
            ) -> Result<Box<dyn VirtualInterface>, InterfaceError> {
                self.0.establish(settings)
            }
        }

        let dir = std::env::temp_dir().join(format!("otun-tunnel-protect-{}", std::process::id()));
        let recorder = Arc::new(Recorder::default());
        let config = VpnConfig { working_dir: dir.clone(), ..VpnConfig::default() };
        let inner = FakeBuilder { app_exclusion: false, fail: false, recorder: recorder.clone() };

        let protected = TunnelOrchestrator::new(
            config.clone(),
            Box::new(ProtectingBuilder(inner)),
            Box::new(FakeForwarder { recorder: recorder.clone() }),
            Box::new(StaticInventory::default()),
        )
        .unwrap();
        let plain = TunnelOrchestrator::new(
            config,
            Box::new(FakeBuilder { app_exclusion: false, fail: false, recorder: recorder.clone() }),
            Box::new(FakeForwarder { recorder }),
            Box::new(StaticInventory::default()),
        )
        .unwrap();

        assert!(protected.bypass().is_protected());
        assert!(!plain.bypass().is_protected());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_state_helpers() {
        assert!(TunnelState::Idle.is_idle());
        assert!(TunnelState::Running.is_running());
        assert!(TunnelState::Restarting.is_transitioning());
        assert!(!TunnelState::Running.is_transitioning());
        assert_eq!(TunnelState::Stopping.to_string(), "stopping");
    }
}
