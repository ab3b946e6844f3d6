//! Bypass SOCKS5 Proxy
//!
//! On platforms without native per-app VPN exclusion the anonymizing
//! client's own connections would be captured by the tunnel it feeds. The
//! client is pointed at this proxy instead, whose outbound sockets are
//! "protected" (exempted from the VPN) before they connect.
//!
//! ```text
//! Tor ──SOCKS5──▶ bypass proxy (127.0.0.1:10xxx) ──protected socket──▶ Internet
//! ```
//!
//! The listen port is drawn once from 10000-10999 and persisted, so the
//! client configuration stays valid across restarts.

use crate::config::{PersistedState, StateStore, VpnConfig};
use rand::Rng;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// SOCKS5 version
const SOCKS5_VERSION: u8 = 0x05;

/// SOCKS5 authentication methods
const AUTH_NO_AUTH: u8 = 0x00;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

/// SOCKS5 commands
const CMD_CONNECT: u8 = 0x01;

/// SOCKS5 address types
const ADDR_IPV4: u8 = 0x01;
const ADDR_DOMAIN: u8 = 0x03;
const ADDR_IPV6: u8 = 0x04;

/// SOCKS5 reply codes
const REPLY_SUCCESS: u8 = 0x00;
const REPLY_GENERAL_FAILURE: u8 = 0x01;
const REPLY_CONNECTION_REFUSED: u8 = 0x05;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// Pending connections queued by the kernel before `accept`
const LISTEN_BACKLOG: u32 = 5;

/// How long `stop` waits for the listening socket to close
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Exempts a raw socket from the VPN; returns false if the platform refused
pub type SocketProtector = Arc<dyn Fn(i32) -> bool + Send + Sync>;

struct RunningServer {
    port: u16,
    running: Arc<AtomicBool>,
    task: JoinHandle<()>,
    /// Disconnects once the accept task has dropped its listener
    closed: mpsc::Receiver<()>,
}

/// Listener owned by the accept task. Fields drop in order, so the socket
/// is released before `closed` disconnects.
struct Listening {
    listener: TcpListener,
    _closed: mpsc::Sender<()>,
}

#[derive(Default)]
struct BypassInner {
    /// Chosen once per session, then reused
    port: Option<u16>,
    server: Option<RunningServer>,
}

/// Local SOCKS5 relay whose outbound connections bypass the tunnel
pub struct BypassProxy {
    listen_host: Ipv4Addr,
    port_min: u16,
    port_max: u16,
    max_connections: usize,
    store: StateStore,
    protector: Option<SocketProtector>,
    active_connections: Arc<AtomicU64>,
    runtime: Runtime,
    inner: Mutex<BypassInner>,
}

impl BypassProxy {
    /// Create a stopped proxy with its own background runtime
    pub fn new(config: &VpnConfig, store: StateStore) -> Result<Self, BypassError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("bypass-proxy")
            .enable_all()
            .build()
            .map_err(BypassError::Runtime)?;

        Ok(Self {
            listen_host: Ipv4Addr::LOCALHOST,
            port_min: config.bypass_port_min,
            port_max: config.bypass_port_max,
            max_connections: config.bypass_max_connections,
            store,
            protector: None,
            active_connections: Arc::new(AtomicU64::new(0)),
            runtime,
            inner: Mutex::new(BypassInner::default()),
        })
    }

    /// Register the platform's socket protection hook
    pub fn with_protector<F>(mut self, protector: F) -> Self
    where
        F: Fn(i32) -> bool + Send + Sync + 'static,
    {
        self.protector = Some(Arc::new(protector));
        self
    }

    /// Chosen port, if one has been picked yet
    pub fn port(&self) -> Option<u16> {
        self.lock().port
    }

    /// Whether outbound sockets are exempted from the tunnel
    pub fn is_protected(&self) -> bool {
        self.protector.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.lock()
            .server
            .as_ref()
            .is_some_and(|s| s.running.load(Ordering::Relaxed))
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// `socks5://` URL the anonymizing client should use
    pub fn proxy_url(&self) -> Option<String> {
        self.port()
            .map(|port| format!("socks5://{}:{}", self.listen_host, port))
    }

    /// Start (or restart) the listener and return its port.
    ///
    /// Binding happens on the proxy's runtime; failures are logged there and
    /// never reach the caller.
    pub fn start(&self) -> u16 {
        let mut inner = self.lock();
        let port = self.choose_port(&mut inner);

        if inner.server.is_some() {
            self.stop_locked(&mut inner);
        }

        let running = Arc::new(AtomicBool::new(true));
        let listen_addr = SocketAddr::from((self.listen_host, port));
        let (closed_tx, closed) = mpsc::channel();
        let task = self.runtime.spawn(Self::serve(
            listen_addr,
            closed_tx,
            self.max_connections,
            running.clone(),
            self.active_connections.clone(),
            self.protector.clone(),
        ));

        inner.server = Some(RunningServer { port, running, task, closed });
        port
    }

    /// Close the listener if one is running
    pub fn stop(&self) {
        let mut inner = self.lock();
        self.stop_locked(&mut inner);
    }

    fn stop_locked(&self, inner: &mut BypassInner) {
        if let Some(server) = inner.server.take() {
            info!(
                "Stopping bypass proxy on port {} ({} active connections)",
                server.port,
                self.active_connections()
            );
            server.running.store(false, Ordering::Relaxed);
            server.task.abort();
            // The port must be free before a restart rebinds it
            if let Err(mpsc::RecvTimeoutError::Timeout) = server.closed.recv_timeout(CLOSE_TIMEOUT) {
                warn!("Bypass proxy listener on port {} still open", server.port);
            }
        }
    }

    fn choose_port(&self, inner: &mut BypassInner) -> u16 {
        if let Some(port) = inner.port {
            return port;
        }

        let persisted = self
            .store
            .load()
            .bypass_proxy_port
            .filter(|p| (self.port_min..=self.port_max).contains(p));

        let port = match persisted {
            Some(port) => port,
            None => {
                let port = rand::thread_rng().gen_range(self.port_min..=self.port_max);
                let state = PersistedState { bypass_proxy_port: Some(port) };
                if let Err(e) = self.store.save(&state) {
                    warn!("Failed to persist bypass proxy port: {}", e);
                }
                port
            }
        };

        debug!("Bypass proxy port {}", port);
        inner.port = Some(port);
        port
    }

    fn lock(&self) -> MutexGuard<'_, BypassInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bind and accept until stopped, relaying at most `max_connections` at once
    async fn serve(
        listen_addr: SocketAddr,
        closed: mpsc::Sender<()>,
        max_connections: usize,
        running: Arc<AtomicBool>,
        active: Arc<AtomicU64>,
        protector: Option<SocketProtector>,
    ) {
        let listening = match bind_listener(listen_addr) {
            Ok(listener) => Listening { listener, _closed: closed },
            Err(e) => {
                error!("Bypass proxy failed to bind {}: {}", listen_addr, e);
                running.store(false, Ordering::Relaxed);
                return;
            }
        };
        info!(
            "Bypass proxy listening on {} (max {} connections)",
            listen_addr, max_connections
        );

        let semaphore = Arc::new(Semaphore::new(max_connections));

        while running.load(Ordering::Relaxed) {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };

            match listening.listener.accept().await {
                Ok((stream, addr)) => {
                    let active = active.clone();
                    let protector = protector.clone();
                    active.fetch_add(1, Ordering::Relaxed);

                    tokio::spawn(async move {
                        debug!("Bypass connection from {}", addr);
                        if let Err(e) = Self::handle_connection(stream, protector.as_ref()).await {
                            debug!("Bypass connection error: {}", e);
                        }
                        active.fetch_sub(1, Ordering::Relaxed);
                        drop(permit);
                    });
                }
                Err(e) => warn!("Accept error: {}", e),
            }
        }
    }

    /// Serve one SOCKS5 CONNECT request
    async fn handle_connection(
        mut stream: TcpStream,
        protector: Option<&SocketProtector>,
    ) -> Result<(), BypassError> {
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await?;

        if buf[0] != SOCKS5_VERSION {
            return Err(BypassError::InvalidVersion);
        }

        let mut methods = vec![0u8; buf[1] as usize];
        stream.read_exact(&mut methods).await?;

        if !methods.contains(&AUTH_NO_AUTH) {
            stream.write_all(&[SOCKS5_VERSION, AUTH_NO_ACCEPTABLE]).await?;
            return Err(BypassError::AuthNotSupported);
        }
        stream.write_all(&[SOCKS5_VERSION, AUTH_NO_AUTH]).await?;

        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await?;

        if header[0] != SOCKS5_VERSION {
            return Err(BypassError::InvalidVersion);
        }
        if header[1] != CMD_CONNECT {
            Self::send_reply(&mut stream, REPLY_COMMAND_NOT_SUPPORTED).await?;
            return Err(BypassError::UnsupportedCommand);
        }

        let dest = match header[3] {
            ADDR_IPV4 => {
                let mut ip = [0u8; 4];
                stream.read_exact(&mut ip).await?;
                let port = stream.read_u16().await?;
                format!("{}:{}", Ipv4Addr::from(ip), port)
            }
            ADDR_DOMAIN => {
                let len = stream.read_u8().await?;
                let mut domain = vec![0u8; len as usize];
                stream.read_exact(&mut domain).await?;
                let port = stream.read_u16().await?;
                format!("{}:{}", String::from_utf8_lossy(&domain), port)
            }
            ADDR_IPV6 => {
                let mut ip = [0u8; 16];
                stream.read_exact(&mut ip).await?;
                let port = stream.read_u16().await?;
                format!("[{}]:{}", Ipv6Addr::from(ip), port)
            }
            _ => {
                Self::send_reply(&mut stream, REPLY_GENERAL_FAILURE).await?;
                return Err(BypassError::InvalidAddress);
            }
        };

        debug!("Bypass CONNECT to {}", dest);

        match Self::connect_protected(&dest, protector).await {
            Ok(mut remote) => {
                Self::send_reply(&mut stream, REPLY_SUCCESS).await?;
                let _ = tokio::io::copy_bidirectional(&mut stream, &mut remote).await;
                Ok(())
            }
            Err(e) => {
                warn!("Bypass failed to connect to {}: {}", dest, e);
                Self::send_reply(&mut stream, REPLY_CONNECTION_REFUSED).await?;
                Err(BypassError::ConnectionFailed(e.to_string()))
            }
        }
    }

    /// Connect to `dest` through a socket exempted from the VPN
    async fn connect_protected(
        dest: &str,
        protector: Option<&SocketProtector>,
    ) -> io::Result<TcpStream> {
        let mut last_err = None;

        for addr in tokio::net::lookup_host(dest).await? {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };

            if let Some(protect) = protector {
                protect_socket(&socket, protect);
            }

            match socket.connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses resolved")))
    }

    async fn send_reply(stream: &mut TcpStream, reply: u8) -> Result<(), BypassError> {
        let response = [
            SOCKS5_VERSION,
            reply,
            0x00, // Reserved
            ADDR_IPV4,
            0, 0, 0, 0, // Bind address (0.0.0.0)
            0, 0, // Bind port (0)
        ];
        stream.write_all(&response).await?;
        Ok(())
    }
}

/// Bind `addr` with a short accept backlog
fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

#[cfg(unix)]
fn protect_socket(socket: &TcpSocket, protect: &SocketProtector) {
    use std::os::fd::AsRawFd;
    let fd = socket.as_raw_fd();
    if !protect(fd) {
        warn!("Socket fd={} protection failed", fd);
    }
}

#[cfg(not(unix))]
fn protect_socket(_socket: &TcpSocket, _protect: &SocketProtector) {}

impl Drop for BypassProxy {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Bypass proxy errors
#[derive(Debug, thiserror::Error)]
pub enum BypassError {
    #[error("Failed to build proxy runtime: {0}")]
    Runtime(io::Error),

    #[error("Invalid SOCKS version")]
    InvalidVersion,

    #[error("Authentication not supported")]
    AuthNotSupported,

    #[error("Unsupported command")]
    UnsupportedCommand,

    #[error("Invalid address")]
    InvalidAddress,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;

    fn proxy(store: StateStore) -> BypassProxy {
        BypassProxy::new(&VpnConfig::default(), store).unwrap()
    }

    fn state_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("otun-bypass-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir.join("state.toml")
    }

    /// The listener binds on the proxy's runtime, shortly after `start`
    fn connect_when_listening(port: u16) -> std::net::TcpStream {
        let mut attempts = 0;
        loop {
            match std::net::TcpStream::connect(("127.0.0.1", port)) {
                Ok(stream) => return stream,
                Err(e) if attempts < 50 => {
                    attempts += 1;
                    debug!("waiting for bypass listener: {}", e);
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(e) => panic!("bypass proxy never listened on {}: {}", port, e),
            }
        }
    }

    #[test]
    fn test_port_selection_is_idempotent() {
        let proxy = proxy(StateStore::ephemeral());

        let first = proxy.start();
        let second = proxy.start();
        proxy.stop();
        let third = proxy.start();

        assert!((10000..=10999).contains(&first));
        assert_eq!(first, second);
        assert_eq!(first, third);
        assert_eq!(proxy.proxy_url(), Some(format!("socks5://127.0.0.1:{}", first)));
        proxy.stop();
    }

    #[test]
    fn test_port_is_persisted() {
        let path = state_path("persist");
        let store = StateStore::new(&path);

        let port = {
            let proxy = proxy(store.clone());
            let port = proxy.start();
            proxy.stop();
            port
        };

        assert_eq!(store.load().bypass_proxy_port, Some(port));
        let reopened = proxy(store);
        assert_eq!(reopened.start(), port);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_stop_without_start() {
        let proxy = proxy(StateStore::ephemeral());
        proxy.stop();
        assert!(!proxy.is_running());
        assert_eq!(proxy.port(), None);
    }

    #[test]
    fn test_serves_more_clients_than_backlog() {
        use std::io::{Read, Write};

        let proxy = proxy(StateStore::ephemeral());
        let port = proxy.start();

        // Every client stays mid-handshake, holding its relay slot
        let mut clients = Vec::new();
        for _ in 0..(LISTEN_BACKLOG as usize + 3) {
            let mut client = connect_when_listening(port);
            client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
            client.write_all(&[SOCKS5_VERSION, 1, AUTH_NO_AUTH]).unwrap();
            clients.push(client);
        }

        for client in &mut clients {
            let mut choice = [0u8; 2];
            client.read_exact(&mut choice).unwrap();
            assert_eq!(choice, [SOCKS5_VERSION, AUTH_NO_AUTH]);
        }
        assert_eq!(proxy.active_connections(), clients.len() as u64);

        drop(clients);
        proxy.stop();
        assert!(!proxy.is_running());
    }

    #[test]
    fn test_concurrent_start_stop() {
        let proxy = Arc::new(proxy(StateStore::ephemeral()));
        let port = proxy.start();

        let workers: Vec<_> = (0..4)
            .map(|i| {
                let proxy = proxy.clone();
                std::thread::spawn(move || {
                    let mut ports = Vec::new();
                    for _ in 0..5 {
                        if i % 2 == 0 {
                            ports.push(proxy.start());
                        } else {
                            proxy.stop();
                        }
                    }
                    ports
                })
            })
            .collect();
        for worker in workers {
            assert!(worker.join().unwrap().iter().all(|p| *p == port));
        }

        // Each restart released the port before rebinding it
        assert_eq!(proxy.start(), port);
        drop(connect_when_listening(port));
        assert!(proxy.is_running());
        proxy.stop();
        assert!(!proxy.is_running());
        assert_eq!(proxy.port(), Some(port));
    }

    #[tokio::test]
    async fn test_connect_relays_through_protected_socket() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut s, _) = echo.accept().await.unwrap();
            let mut buf = [0u8; 4];
            s.read_exact(&mut buf).await.unwrap();
            s.write_all(&buf).await.unwrap();
        });

        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front.local_addr().unwrap();
        let protected = Arc::new(AtomicUsize::new(0));
        let counter = protected.clone();
        let protector: SocketProtector = Arc::new(move |_fd| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });
        tokio::spawn(async move {
            let (s, _) = front.accept().await.unwrap();
            let _ = BypassProxy::handle_connection(s, Some(&protector)).await;
        });

        let mut client = TcpStream::connect(front_addr).await.unwrap();
        client.write_all(&[SOCKS5_VERSION, 1, AUTH_NO_AUTH]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [SOCKS5_VERSION, AUTH_NO_AUTH]);

        let ip = match echo_addr.ip() {
            std::net::IpAddr::V4(ip) => ip.octets(),
            _ => unreachable!(),
        };
        let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0, ADDR_IPV4];
        request.extend_from_slice(&ip);
        request.extend_from_slice(&echo_addr.port().to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REPLY_SUCCESS);

        client.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");

        #[cfg(unix)]
        assert_eq!(protected.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejects_auth_only_clients() {
        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = front.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (s, _) = front.accept().await.unwrap();
            BypassProxy::handle_connection(s, None).await
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        // username/password only
        client.write_all(&[SOCKS5_VERSION, 1, 0x02]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();

        assert_eq!(choice, [SOCKS5_VERSION, AUTH_NO_ACCEPTABLE]);
        assert!(matches!(server.await.unwrap(), Err(BypassError::AuthNotSupported)));
    }
}
