//! Forwarding session: listener lifecycle and the start/stop state machine

use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::ForwardError;
use crate::registry::{ConnectionEntry, ConnectionId, ConnectionInfo, ConnectionRegistry};
use crate::relay::relay;

/// Default bound on dialing the target for each accepted connection
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Engine tuning knobs
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long to wait for the target to accept a connection
    pub dial_timeout: Duration,
    /// Set TCP_NODELAY on both sides of every relayed pair
    pub nodelay: bool,
    /// Bind attempts when the source address is still in use (TIME_WAIT)
    pub bind_attempts: u32,
    /// Delay between bind attempts
    pub bind_retry_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            nodelay: true,
            bind_attempts: 3,
            bind_retry_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Stopped,
    Starting,
    Running,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Stopped => write!(f, "stopped"),
            SessionState::Starting => write!(f, "starting"),
            SessionState::Running => write!(f, "running"),
        }
    }
}

/// Read-only view of the session for status reporting
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub running: bool,
    pub source_addr: Option<String>,
    pub target_addr: Option<String>,
    /// Address the listener actually bound (resolves port 0)
    pub local_addr: Option<SocketAddr>,
    pub connection_count: usize,
    pub connection_ids: Vec<ConnectionId>,
    pub connections: Vec<ConnectionInfo>,
}

impl SessionSnapshot {
    /// The active forwarding rule as `"<source> - <target>"`, empty when stopped
    pub fn forward_info(&self) -> String {
        match (&self.source_addr, &self.target_addr) {
            (Some(source), Some(target)) if self.running => format!("{} - {}", source, target),
            _ => String::new(),
        }
    }
}

/// State guarded by the session lock
struct SessionInner {
    state: SessionState,
    source_addr: Option<String>,
    target_addr: Option<String>,
    local_addr: Option<SocketAddr>,
    /// The accept loop owns the listener; aborting it closes the listener
    accept_task: Option<JoinHandle<()>>,
    /// Bumped on every start so a stale accept loop cannot tear down a newer session
    generation: u64,
}

impl SessionInner {
    fn new() -> Self {
        Self {
            state: SessionState::Stopped,
            source_addr: None,
            target_addr: None,
            local_addr: None,
            accept_task: None,
            generation: 0,
        }
    }

    fn reset(&mut self) {
        self.state = SessionState::Stopped;
        self.source_addr = None;
        self.target_addr = None;
        self.local_addr = None;
    }
}

/// Owns the single active forwarding rule
///
/// Start, stop and snapshot are serialized by one lock. The connection
/// registry has its own lock so relays can deregister without contending
/// with state transitions.
pub struct ForwardingSession {
    config: SessionConfig,
    registry: Arc<ConnectionRegistry>,
    inner: Arc<Mutex<SessionInner>>,
}

impl ForwardingSession {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            registry: Arc::new(ConnectionRegistry::new()),
            inner: Arc::new(Mutex::new(SessionInner::new())),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Start forwarding `source_addr` to `target_addr`
    ///
    /// Any running rule is fully stopped first. Returns once the listener is
    /// bound; the accept loop runs as a detached task. On bind failure the
    /// session stays stopped.
    pub async fn start(
        &self,
        source_addr: &str,
        target_addr: &str,
    ) -> Result<SocketAddr, ForwardError> {
        let mut inner = self.inner.lock().await;
        self.stop_locked(&mut inner).await;

        if target_addr.trim().is_empty() {
            return Err(ForwardError::InvalidAddress(
                "target address is empty".to_string(),
            ));
        }

        inner.state = SessionState::Starting;
        info!(source = %source_addr, target_addr = %target_addr, "Starting forwarding session");

        let listener = match self.bind_with_retry(source_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                inner.reset();
                return Err(e);
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                inner.reset();
                return Err(e.into());
            }
        };

        inner.generation += 1;
        let generation = inner.generation;

        let accept_loop = AcceptLoop {
            listener,
            target_addr: target_addr.to_string(),
            config: self.config.clone(),
            registry: self.registry.clone(),
            inner: self.inner.clone(),
            generation,
        };
        inner.accept_task = Some(tokio::spawn(accept_loop.run()));
        inner.source_addr = Some(source_addr.to_string());
        inner.target_addr = Some(target_addr.to_string());
        inner.local_addr = Some(local_addr);
        inner.state = SessionState::Running;

        info!(
            "Forwarding {} (listening on {}) -> {}",
            source_addr, local_addr, target_addr
        );
        Ok(local_addr)
    }

    /// Stop forwarding; idempotent
    ///
    /// Closes the listener and every relayed connection. Returns the number
    /// of connections that were closed.
    pub async fn stop(&self) -> usize {
        let mut inner = self.inner.lock().await;
        self.stop_locked(&mut inner).await
    }

    async fn stop_locked(&self, inner: &mut SessionInner) -> usize {
        let was_active = inner.state != SessionState::Stopped;

        if let Some(task) = inner.accept_task.take() {
            task.abort();
            // Wait for the task to be dropped so the listener is closed on return
            let _ = task.await;
            info!("Listener closed");
        }

        let closed = self.registry.drain_and_close_all();
        inner.reset();

        if was_active || closed > 0 {
            info!(connections_closed = closed, "Forwarding session stopped");
        }
        closed
    }

    /// Current rule, state and live connections
    pub async fn snapshot(&self) -> SessionSnapshot {
        let inner = self.inner.lock().await;
        let connections = self.registry.snapshot();
        SessionSnapshot {
            state: inner.state,
            running: inner.state == SessionState::Running,
            source_addr: inner.source_addr.clone(),
            target_addr: inner.target_addr.clone(),
            local_addr: inner.local_addr,
            connection_count: connections.len(),
            connection_ids: connections.iter().map(|c| c.id).collect(),
            connections,
        }
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    async fn bind_with_retry(&self, source_addr: &str) -> Result<TcpListener, ForwardError> {
        let attempts = self.config.bind_attempts.max(1);
        let mut attempt = 1;
        loop {
            match TcpListener::bind(source_addr).await {
                Ok(listener) => {
                    if attempt > 1 {
                        info!(
                            "Successfully bound to {} on attempt {}/{}",
                            source_addr, attempt, attempts
                        );
                    }
                    return Ok(listener);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse && attempt < attempts => {
                    warn!(
                        "Address {} is in use (attempt {}/{}, may be in TIME_WAIT state), retrying in {:?}...",
                        source_addr, attempt, attempts, self.config.bind_retry_delay
                    );
                    tokio::time::sleep(self.config.bind_retry_delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!("Failed to bind {}: {}", source_addr, e);
                    return Err(bind_error(source_addr, e));
                }
            }
        }
    }
}

impl Drop for ForwardingSession {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.try_lock() {
            if let Some(task) = inner.accept_task.take() {
                task.abort();
            }
        }
        self.registry.drain_and_close_all();
    }
}

fn bind_error(source_addr: &str, e: std::io::Error) -> ForwardError {
    let (address, port) = match source_addr.parse::<SocketAddr>() {
        Ok(addr) => (addr.ip().to_string(), addr.port()),
        Err(_) => match source_addr.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port.parse().unwrap_or(0)),
            None => (source_addr.to_string(), 0),
        },
    };
    ForwardError::Bind {
        address,
        port,
        reason: e.to_string(),
    }
}

/// Dial the target, bounded by `timeout`
async fn dial(target_addr: &str, timeout: Duration) -> Result<TcpStream, ForwardError> {
    match tokio::time::timeout(timeout, TcpStream::connect(target_addr)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ForwardError::Dial {
            target: target_addr.to_string(),
            reason: e.to_string(),
        }),
        Err(_) => Err(ForwardError::DialTimeout {
            target: target_addr.to_string(),
            timeout,
        }),
    }
}

/// Everything the detached accept loop needs
///
/// The target is dialed inline, before the next accept, so a stop that has
/// drained the registry can never race a late registration. The cost is
/// head-of-line blocking: while one dial is pending (up to `dial_timeout`),
/// further inbound connections wait in the listener backlog.
struct AcceptLoop {
    listener: TcpListener,
    target_addr: String,
    config: SessionConfig,
    registry: Arc<ConnectionRegistry>,
    inner: Arc<Mutex<SessionInner>>,
    generation: u64,
}

impl AcceptLoop {
    async fn run(self) {
        loop {
            let (source, peer_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    break;
                }
            };
            debug!(peer = %peer_addr, "Accepted connection");

            let target = match dial(&self.target_addr, self.config.dial_timeout).await {
                Ok(target) => target,
                Err(e) => {
                    // Dropping the source stream closes it; nothing was registered
                    warn!(peer = %peer_addr, error = %e, "Dropping inbound connection");
                    continue;
                }
            };

            if self.config.nodelay {
                source.set_nodelay(true).ok();
                target.set_nodelay(true).ok();
            }

            let entry = ConnectionEntry::new(self.registry.next_id(), peer_addr, &self.target_addr);
            let id = entry.id();
            let cancel = entry.cancel_token();
            let counters = entry.counters();
            self.registry.insert(entry);
            debug!(connection_id = %id, peer = %peer_addr, target_addr = %self.target_addr, "Relay started");

            let registry = self.registry.clone();
            tokio::spawn(async move {
                if let Err(e) = relay(source, target, cancel, counters).await {
                    debug!(connection_id = %id, error = %e, "Relay ended with error");
                }
                registry.remove(id);
                debug!(connection_id = %id, "Connection closed");
            });
        }

        // The listener is presumed dead; fall back to stopped if still current
        drop(self.listener);
        let mut inner = self.inner.lock().await;
        if inner.generation == self.generation {
            inner.accept_task = None;
            inner.reset();
            self.registry.drain_and_close_all();
            info!("Forwarding session stopped after listener failure");
        }
    }
}
