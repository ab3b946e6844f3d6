//! DNS Forwarder Controller
//!
//! Runs a pdnsd instance that answers queries arriving through the tunnel
//! by forwarding them to the anonymizing client's DNS port.
//!
//! ```text
//! app ──DNS──▶ tun2socks ──▶ pdnsd (192.168.200.1:8091) ──▶ Tor DNSPort (127.0.0.1:5400)
//! ```
//!
//! pdnsd daemonizes itself: the launched process exits as soon as the
//! daemon has forked, and the daemon writes its pid to `pdnsd.pid`.

use crate::config::VpnConfig;
use crate::supervisor::{ProcessSupervisor, Signal};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Rendered pdnsd configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdnsdConfig {
    /// Upstream resolver address
    pub upstream_host: String,
    /// Upstream resolver port
    pub upstream_port: u16,
    /// Directory holding `pdnsd.cache`
    pub cache_dir: PathBuf,
    /// Local listen address
    pub bind_host: String,
    /// Local listen port
    pub bind_port: u16,
    /// Where the daemon records its pid
    pub pid_file: Option<PathBuf>,
}

impl PdnsdConfig {
    /// Render in pdnsd's configuration syntax
    pub fn render(&self) -> String {
        let mut global = format!(
            "global {{\n\
             \tperm_cache=0;\n\
             \tcache_dir=\"{}\";\n\
             \tserver_port = {};\n\
             \tserver_ip = {};\n\
             \tquery_method=udp_only;\n\
             \tmin_ttl=1m;\n\
             \tmax_ttl=1w;\n\
             \ttimeout=10;\n\
             \tdaemon=on;\n",
            self.cache_dir.display(),
            self.bind_port,
            self.bind_host,
        );
        if let Some(pid_file) = &self.pid_file {
            global.push_str(&format!("\tpid_file=\"{}\";\n", pid_file.display()));
        }
        global.push_str("}\n");

        format!(
            "{}\n\
             server {{\n\
             \tlabel= \"upstream\";\n\
             \tip = {};\n\
             \tport = {};\n\
             \tuptest = none;\n\
             }}\n\
             \n\
             rr {{\n\
             \tname=localhost;\n\
             \treverse=on;\n\
             \ta=127.0.0.1;\n\
             \towner=localhost;\n\
             \tsoa=localhost,root.localhost,42,86400,900,86400,86400;\n\
             }}\n",
            global, self.upstream_host, self.upstream_port,
        )
    }

    /// Parse a configuration produced by [`render`](Self::render)
    pub fn parse(content: &str) -> Result<Self, DnsForwarderError> {
        let mut section: Option<&str> = None;
        let mut upstream_host = None;
        let mut upstream_port = None;
        let mut cache_dir = None;
        let mut bind_host = None;
        let mut bind_port = None;
        let mut pid_file = None;

        for line in content.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_suffix('{') {
                section = Some(name.trim());
                continue;
            }
            if line == "}" {
                section = None;
                continue;
            }

            let Some((key, value)) = line.trim_end_matches(';').split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim().trim_matches('"');

            match (section, key) {
                (Some("global"), "server_ip") => bind_host = Some(value.to_string()),
                (Some("global"), "server_port") => bind_port = Some(parse_port(key, value)?),
                (Some("global"), "cache_dir") => cache_dir = Some(PathBuf::from(value)),
                (Some("global"), "pid_file") => pid_file = Some(PathBuf::from(value)),
                (Some("server"), "ip") => upstream_host = Some(value.to_string()),
                (Some("server"), "port") => upstream_port = Some(parse_port(key, value)?),
                _ => {}
            }
        }

        let missing = |field: &str| DnsForwarderError::MalformedConfig(format!("missing {}", field));
        Ok(Self {
            upstream_host: upstream_host.ok_or_else(|| missing("server.ip"))?,
            upstream_port: upstream_port.ok_or_else(|| missing("server.port"))?,
            cache_dir: cache_dir.ok_or_else(|| missing("global.cache_dir"))?,
            bind_host: bind_host.ok_or_else(|| missing("global.server_ip"))?,
            bind_port: bind_port.ok_or_else(|| missing("global.server_port"))?,
            pid_file,
        })
    }
}

fn parse_port(key: &str, value: &str) -> Result<u16, DnsForwarderError> {
    value
        .parse()
        .map_err(|_| DnsForwarderError::MalformedConfig(format!("{} = {}", key, value)))
}

/// A launched DNS forwarder daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwarderProcess {
    pub executable: PathBuf,
    pub config_path: PathBuf,
    /// Daemon pid, if it wrote a pid file
    pub pid: Option<u32>,
    pub running: bool,
}

/// Starts and stops the pdnsd daemon
pub struct DnsForwarder {
    executable: PathBuf,
    working_dir: PathBuf,
    config_path: PathBuf,
    pid_path: PathBuf,
    cache_path: PathBuf,
    output_path: PathBuf,
    supervisor: ProcessSupervisor,
    /// Currently tracked daemon; also serializes start/stop
    tracked: Mutex<Option<ForwarderProcess>>,
}

impl DnsForwarder {
    pub fn new(config: &VpnConfig, supervisor: ProcessSupervisor) -> Self {
        Self {
            executable: config.dns_forwarder_path.clone(),
            working_dir: config.working_dir.clone(),
            config_path: config.dns_config_path(),
            pid_path: config.dns_pid_path(),
            cache_path: config.dns_cache_path(),
            output_path: config.dns_output_path(),
            supervisor,
            tracked: Mutex::new(None),
        }
    }

    pub fn pid_path(&self) -> &Path {
        &self.pid_path
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// The daemon started by the last successful [`start`](Self::start)
    pub fn tracked(&self) -> Option<ForwarderProcess> {
        self.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.lock().as_ref().is_some_and(|p| p.running)
    }

    /// Write the config and launch the daemon.
    ///
    /// Blocks until the launcher exits, not until the daemon it forks
    /// releases stdout. A tracked daemon is stopped first.
    pub fn start(
        &self,
        upstream_host: &str,
        upstream_port: u16,
        bind_host: &str,
        bind_port: u16,
    ) -> Result<ForwarderProcess, DnsForwarderError> {
        let mut tracked = self.lock();
        if tracked.is_some() {
            debug!("DNS forwarder already tracked, stopping it first");
            self.stop_locked(&mut tracked);
        }

        std::fs::create_dir_all(&self.working_dir)?;

        let config = PdnsdConfig {
            upstream_host: upstream_host.to_string(),
            upstream_port,
            cache_dir: self.working_dir.clone(),
            bind_host: bind_host.to_string(),
            bind_port,
            pid_file: Some(self.pid_path.clone()),
        };
        let rendered = config.render();
        debug!("pdnsd conf:\n{}", rendered);
        std::fs::write(&self.config_path, rendered)?;

        if let Err(e) = OpenOptions::new().create(true).append(true).open(&self.cache_path) {
            debug!("Could not create {}: {}", self.cache_path.display(), e);
        }

        info!(
            "Starting DNS forwarder on {}:{} -> {}:{}",
            bind_host, bind_port, upstream_host, upstream_port
        );

        // One file for both streams keeps them interleaved in write order
        let capture = File::create(&self.output_path)?;
        let mut launcher = Command::new(&self.executable)
            .arg("-c")
            .arg(&self.config_path)
            .stdin(Stdio::null())
            .stdout(capture.try_clone()?)
            .stderr(capture)
            .spawn()
            .map_err(|e| DnsForwarderError::Spawn(format!("{}: {}", self.executable.display(), e)))?;
        let status = launcher.wait()?;

        info!("DNS forwarder launcher exited: {}", status);

        if !status.success() {
            let output = std::fs::read(&self.output_path)
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                .unwrap_or_default();
            for line in output.lines() {
                debug!("pdnsd: {}", line);
            }
            return Err(DnsForwarderError::StartFailed { status, output });
        }

        let process = ForwarderProcess {
            executable: self.executable.clone(),
            config_path: self.config_path.clone(),
            pid: read_pid_file(&self.pid_path).ok(),
            running: true,
        };
        *tracked = Some(process.clone());
        Ok(process)
    }

    /// Terminate the daemon by path, then by pid file. Never fails.
    pub fn stop(&self) {
        let mut tracked = self.lock();
        self.stop_locked(&mut tracked);
    }

    fn stop_locked(&self, tracked: &mut MutexGuard<'_, Option<ForwarderProcess>>) {
        if let Err(e) = self.supervisor.kill_path(&self.executable, Signal::Hup) {
            error!("DNS forwarder: {}", e);
        }

        if self.pid_path.exists() {
            match read_pid_file(&self.pid_path) {
                Ok(pid) => self.supervisor.kill_pid(pid, Signal::Kill),
                Err(e) => error!("Error killing DNS process: {}", e),
            }
            if let Err(e) = std::fs::remove_file(&self.pid_path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove {}: {}", self.pid_path.display(), e);
                }
            }
        }

        if tracked.take().is_some() {
            debug!("DNS forwarder stopped");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<ForwarderProcess>> {
        self.tracked.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Read the single-line pid file written by the daemon
pub fn read_pid_file(path: &Path) -> Result<u32, DnsForwarderError> {
    let content = std::fs::read_to_string(path)?;
    let line = content.lines().next().unwrap_or("").trim();
    line.parse()
        .map_err(|_| DnsForwarderError::InvalidPid(line.to_string()))
}

/// DNS forwarder errors
#[derive(Debug, thiserror::Error)]
pub enum DnsForwarderError {
    #[error("Failed to launch DNS forwarder: {0}")]
    Spawn(String),

    #[error("DNS forwarder exited with {status}: {output}")]
    StartFailed { status: ExitStatus, output: String },

    #[error("Malformed DNS forwarder config: {0}")]
    MalformedConfig(String),

    #[error("Invalid pid file contents: {0:?}")]
    InvalidPid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
