//! Network outputs the router fans serial traffic out to
//!
//! Three variants share one capability contract (`OutputChannel`):
//!
//! | Type         | Egress                         | Inbound                       |
//! |--------------|--------------------------------|-------------------------------|
//! | `tcp_server` | per-client writer thread       | one reader thread per client  |
//! | `tcp_client` | the single outbound connection | one reader thread             |
//! | `udp`        | datagram to the remote address | one reader on the local port  |
//!
//! Inbound bytes from any variant go to the router's relay hook unchanged.
//! Every socket read uses a short timeout so loops notice `stop()` promptly.

mod tcp_client;
mod tcp_server;
mod udp;

pub use tcp_client::TcpClientOutput;
pub use tcp_server::TcpServerOutput;
pub use udp::UdpOutput;

use crate::error::{Error, Result};
use crate::router::RouterHooks;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Socket read timeout for every inbound loop
pub const SOCKET_READ_TIMEOUT: Duration = Duration::from_millis(100);
/// Socket write timeout; a peer that stalls this long is dropped
pub const SOCKET_WRITE_TIMEOUT: Duration = Duration::from_millis(500);
/// How long `stop()` waits for worker threads
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(2);
/// Outbound connect timeout for `tcp_client`
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Output variant tag, persisted as `type`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    TcpServer,
    TcpClient,
    Udp,
    /// Anything else found in a persisted list
    #[serde(other)]
    Unsupported,
}

impl OutputKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TcpServer => "tcp_server",
            Self::TcpClient => "tcp_client",
            Self::Udp => "udp",
            Self::Unsupported => "unsupported",
        }
    }
}

fn default_true() -> bool {
    true
}

/// Persisted output configuration; identity is `id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: OutputKind,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub auto_start: bool,
}

impl OutputConfig {
    pub fn new(id: &str, kind: OutputKind, host: &str, port: u16) -> Self {
        Self {
            id: id.to_string(),
            kind,
            host: host.to_string(),
            port,
            name: id.to_string(),
            enabled: true,
            auto_start: true,
        }
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Partial update; `None` leaves a field unchanged
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputUpdate {
    #[serde(rename = "type")]
    pub kind: Option<OutputKind>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub auto_start: Option<bool>,
}

impl OutputUpdate {
    pub fn apply_to(&self, config: &mut OutputConfig) {
        if let Some(kind) = self.kind {
            config.kind = kind;
        }
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(name) = &self.name {
            config.name = name.clone();
        }
        if let Some(enabled) = self.enabled {
            config.enabled = enabled;
        }
        if let Some(auto_start) = self.auto_start {
            config.auto_start = auto_start;
        }
    }
}

/// Per-output counters, shared by the router and the output's threads
#[derive(Debug, Default)]
pub struct OutputStats {
    tx: AtomicU64,
    rx: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub tx: u64,
    pub rx: u64,
    pub errors: u64,
}

impl OutputStats {
    pub fn record_tx(&self) {
        self.tx.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rx(&self) {
        self.rx.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tx: self.tx.load(Ordering::Relaxed),
            rx: self.rx.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// What an output's threads need from their owner
#[derive(Clone)]
pub struct ChannelContext {
    pub id: String,
    pub stats: Arc<OutputStats>,
    pub hooks: Arc<RouterHooks>,
}

impl ChannelContext {
    pub fn new(id: &str, stats: Arc<OutputStats>, hooks: Arc<RouterHooks>) -> Self {
        Self {
            id: id.to_string(),
            stats,
            hooks,
        }
    }

    /// Hand inbound bytes to the relay and count them
    pub fn deliver(&self, bytes: &[u8]) {
        self.stats.record_rx();
        self.hooks.relay(bytes);
    }

    /// Peer set or connection state changed
    pub fn changed(&self) {
        self.hooks.changed();
    }
}

/// One network endpoint
///
/// Methods take `&self`; implementations synchronize internally so the
/// router can send without holding its registry lock.
pub trait OutputChannel: Send + Sync {
    /// Open sockets and spawn loops; returns an operator-facing message
    fn start(&self) -> Result<String>;

    /// Close sockets and join loops (bounded)
    fn stop(&self);

    /// Best-effort delivery of one frame; returns how many peers took it
    fn send(&self, data: &[u8]) -> Result<usize>;

    fn is_running(&self) -> bool;

    /// Connected peers (tcp_server clients, 1 for a live tcp_client)
    fn peers(&self) -> usize {
        0
    }

    /// Bound local address while running
    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Build the implementation matching `config.kind`
pub fn create_output(config: &OutputConfig, ctx: ChannelContext) -> Result<Arc<dyn OutputChannel>> {
    let addr = config.address();
    Ok(match config.kind {
        OutputKind::TcpServer => Arc::new(TcpServerOutput::new(addr, ctx)),
        OutputKind::TcpClient => Arc::new(TcpClientOutput::new(addr, ctx)),
        OutputKind::Udp => Arc::new(UdpOutput::new(addr, ctx)),
        OutputKind::Unsupported => {
            return Err(Error::UnsupportedOutput(config.id.clone()));
        }
    })
}

/// Resolve `host:port` to one socket address
pub(crate) fn resolve(addr: &str) -> Result<SocketAddr> {
    use std::net::ToSocketAddrs;
    addr.to_socket_addrs()
        .map_err(|e| Error::from_socket(e, addr))?
        .next()
        .ok_or_else(|| Error::Other(format!("Address {} did not resolve", addr)))
}

/// Join worker threads, giving up after `timeout`.
///
/// Threads still running at the deadline are detached.
pub(crate) fn join_bounded(handles: Vec<JoinHandle<()>>, timeout: Duration, label: &str) {
    let deadline = Instant::now() + timeout;
    let mut pending = handles;
    while !pending.is_empty() && Instant::now() < deadline {
        let (done, rest): (Vec<_>, Vec<_>) = pending.into_iter().partition(|h| h.is_finished());
        for handle in done {
            if handle.join().is_err() {
                log::warn!("[{}] worker thread panicked", label);
            }
        }
        pending = rest;
        if !pending.is_empty() {
            std::thread::sleep(Duration::from_millis(10));
        }
    }
    if !pending.is_empty() {
        log::warn!(
            "[{}] {} worker thread(s) still running after {:?}, detaching",
            label,
            pending.len(),
            timeout
        );
    }
}

/// Read-timeout errors differ by platform (WouldBlock on Unix, TimedOut on Windows)
pub(crate) fn is_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}
