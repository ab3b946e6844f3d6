//! External tun2socks process as the packet forwarder.

use otun_vpn::{ForwarderError, ForwarderParams, PacketForwarder, TunDescriptor};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use tracing::{debug, info, warn};

/// Runs the tun2socks executable as a child process
#[derive(Debug)]
pub struct Tun2SocksProcess {
    executable: PathBuf,
    child: Option<Child>,
}

impl Tun2SocksProcess {
    pub fn new(executable: &Path) -> Self {
        Self {
            executable: executable.to_path_buf(),
            child: None,
        }
    }

    /// Command line for `params`
    pub fn arguments(params: &ForwarderParams) -> Vec<String> {
        let mut args = match &params.descriptor {
            TunDescriptor::Fd(fd) => vec!["--tunfd".to_string(), fd.to_string()],
            TunDescriptor::Device(name) => vec!["--tundev".to_string(), name.clone()],
        };

        args.extend([
            "--tunmtu".to_string(),
            params.mtu.to_string(),
            "--netif-ipaddr".to_string(),
            params.virtual_ip.to_string(),
            "--netif-netmask".to_string(),
            params.netmask.to_string(),
            "--socks-server-addr".to_string(),
            params.socks_addr.clone(),
            "--dnsgw".to_string(),
            params.dns_addr.clone(),
        ]);

        if params.transparent_dns {
            args.push("--transparent-dns".to_string());
        }
        args
    }
}

impl PacketForwarder for Tun2SocksProcess {
    fn start(&mut self, params: &ForwarderParams) -> Result<(), ForwarderError> {
        if self.is_running() {
            return Err(ForwarderError::AlreadyRunning);
        }

        let args = Self::arguments(params);
        debug!("{} {}", self.executable.display(), args.join(" "));

        let child = Command::new(&self.executable)
            .args(&args)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| ForwarderError::Spawn(format!("{}: {}", self.executable.display(), e)))?;

        info!("tun2socks started (pid {})", child.id());
        self.child = Some(child);
        Ok(())
    }

    fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        if let Err(e) = child.kill() {
            debug!("tun2socks kill: {}", e);
        }
        match child.wait() {
            Ok(status) => info!("tun2socks exited: {}", status),
            Err(e) => warn!("Failed to reap tun2socks: {}", e),
        }
    }

    fn is_running(&self) -> bool {
        self.child.is_some()
    }
}

impl Drop for Tun2SocksProcess {
    fn drop(&mut self) {
        self.stop();
    }
}
