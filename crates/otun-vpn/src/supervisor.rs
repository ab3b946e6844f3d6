//! Process Supervisor
//!
//! Finds helper daemons in the process table and terminates them.
//!
//! Devices differ in which kill utilities they ship (`toolbox`, `busybox`,
//! plain `kill`), so every attempt fires all of them and ignores their exit
//! codes. Success is judged only by the process disappearing from the
//! listing.

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Header column that marks the process listing's title line
pub const PS_HEADER_TOKEN: &str = "PID";

/// Signal passed to the kill utilities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGHUP
    Hup,
    /// SIGTERM
    Term,
    /// SIGKILL
    Kill,
}

impl Signal {
    /// Command line form (`-1`, `-15`, `-9`)
    pub fn as_arg(&self) -> &'static str {
        match self {
            Signal::Hup => "-1",
            Signal::Term => "-15",
            Signal::Kill => "-9",
        }
    }
}

/// What a kill utility expects as its target argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillTarget {
    /// Executable file name (`killall`)
    Name,
    /// Numeric process id
    Pid,
}

/// One way of delivering a signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillMechanism {
    pub program: String,
    pub args: Vec<String>,
    pub target: KillTarget,
}

impl KillMechanism {
    pub fn new(program: &str, args: &[&str], target: KillTarget) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            target,
        }
    }

    /// Full argument list for signalling `name`/`pid`
    pub fn arguments(&self, signal: Signal, name: &str, pid: u32) -> Vec<String> {
        let mut args = self.args.clone();
        args.push(signal.as_arg().to_string());
        args.push(match self.target {
            KillTarget::Name => name.to_string(),
            KillTarget::Pid => pid.to_string(),
        });
        args
    }
}

/// Bounded retry policy for terminating a process by path
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Rounds of signalling before giving up
    pub max_attempts: u32,
    /// Pause after each round
    pub backoff: Duration,
    /// Mechanisms fired on every round, in order
    pub mechanisms: Vec<KillMechanism>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_secs(1),
            mechanisms: vec![
                KillMechanism::new("busybox", &["killall"], KillTarget::Name),
                KillMechanism::new("toolbox", &["kill"], KillTarget::Pid),
                KillMechanism::new("busybox", &["kill"], KillTarget::Pid),
                KillMechanism::new("kill", &[], KillTarget::Pid),
            ],
        }
    }
}

impl RetryPolicy {
    /// Same mechanisms, no pause between rounds
    pub fn immediate(mut self) -> Self {
        self.backoff = Duration::ZERO;
        self
    }
}

/// Access to the OS process table and to external commands
pub trait ProcessHost: Send + Sync {
    /// Raw process listing, one process per line
    fn list_processes(&self) -> io::Result<String>;

    /// Run a command to completion, ignoring its exit status
    fn execute(&self, program: &str, args: &[String]) -> io::Result<()>;
}

/// [`ProcessHost`] backed by `ps` and real subprocesses
#[derive(Debug, Clone)]
pub struct SystemProcessHost {
    listing_command: Vec<String>,
}

impl SystemProcessHost {
    pub fn new(listing_command: Vec<String>) -> Self {
        Self { listing_command }
    }
}

impl Default for SystemProcessHost {
    fn default() -> Self {
        Self::new(vec!["ps".to_string(), "-ef".to_string()])
    }
}

impl ProcessHost for SystemProcessHost {
    fn list_processes(&self) -> io::Result<String> {
        let (program, args) = self
            .listing_command
            .split_first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty listing command"))?;

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn execute(&self, program: &str, args: &[String]) -> io::Result<()> {
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|_| ())
    }
}

/// Extract the pid from one listing line if it mentions `command`.
///
/// Most `ps` variants put the pid in the second column (after the user);
/// some put it first. The second column is tried first.
pub fn parse_pid_line(line: &str, command: &str) -> Option<u32> {
    if line.contains(PS_HEADER_TOKEN) || !line.contains(command) {
        return None;
    }

    let mut fields = line.split_whitespace();
    let first = fields.next()?;
    fields
        .next()
        .and_then(|second| second.parse().ok())
        .or_else(|| first.parse().ok())
}

/// First pid in `listing` whose line mentions `command`
pub fn find_pid_in(listing: &str, command: &str) -> Option<u32> {
    listing.lines().find_map(|line| parse_pid_line(line, command))
}

/// Finds and terminates processes
#[derive(Clone)]
pub struct ProcessSupervisor {
    host: Arc<dyn ProcessHost>,
    policy: RetryPolicy,
}

impl ProcessSupervisor {
    pub fn new(host: Arc<dyn ProcessHost>, policy: RetryPolicy) -> Self {
        Self { host, policy }
    }

    /// Supervisor using `ps -ef` and the default retry policy
    pub fn system() -> Self {
        Self::new(Arc::new(SystemProcessHost::default()), RetryPolicy::default())
    }

    /// Pid of the first running process whose listing line contains `command`
    pub fn find_pid(&self, command: &str) -> Option<u32> {
        match self.host.list_processes() {
            Ok(listing) => find_pid_in(&listing, command),
            Err(e) => {
                warn!("Failed to list processes: {}", e);
                None
            }
        }
    }

    /// Signal every process started from `executable` until none is left.
    ///
    /// Returns [`SupervisorError::Unkillable`] if the process is still
    /// listed after `max_attempts` rounds.
    pub fn kill_path(&self, executable: &Path, signal: Signal) -> Result<(), SupervisorError> {
        let path = std::fs::canonicalize(executable).unwrap_or_else(|_| executable.to_path_buf());
        let command = path.to_string_lossy();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| command.to_string());

        for attempt in 1..=self.policy.max_attempts {
            let Some(pid) = self.find_pid(&command) else {
                return Ok(());
            };

            debug!(
                "Sending {} to {} (pid {}, attempt {}/{})",
                signal.as_arg(),
                name,
                pid,
                attempt,
                self.policy.max_attempts
            );
            self.signal_all(signal, &name, pid, KillTarget::Name);

            if !self.policy.backoff.is_zero() {
                thread::sleep(self.policy.backoff);
            }
        }

        if self.find_pid(&command).is_some() {
            return Err(SupervisorError::Unkillable {
                path: path.clone(),
                attempts: self.policy.max_attempts,
            });
        }
        Ok(())
    }

    /// Fire every pid-based mechanism once at `pid`. Never fails.
    pub fn kill_pid(&self, pid: u32, signal: Signal) {
        debug!("Sending {} to pid {}", signal.as_arg(), pid);
        self.signal_all(signal, "", pid, KillTarget::Pid);
    }

    /// Run each mechanism in turn; `KillTarget::Pid` skips name-based ones.
    fn signal_all(&self, signal: Signal, name: &str, pid: u32, allowed: KillTarget) {
        for mechanism in &self.policy.mechanisms {
            if allowed == KillTarget::Pid && mechanism.target != KillTarget::Pid {
                continue;
            }
            let args = mechanism.arguments(signal, name, pid);
            if let Err(e) = self.host.execute(&mechanism.program, &args) {
                debug!("{} {:?} unavailable: {}", mechanism.program, args, e);
            }
        }
    }
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// Supervisor errors
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Cannot kill {} after {attempts} attempts", .path.display())]
    Unkillable { path: PathBuf, attempts: u32 },
}
