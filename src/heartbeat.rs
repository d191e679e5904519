//! Heartbeat reception from the agent embedded in the server.
//!
//! A single TCP listener accepts exactly one peer. Every successful read on
//! that connection is a liveness proof; payload bytes are not interpreted.
//! When the peer disconnects the listener is not re-opened and the watchdog
//! sees the silence as staleness.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;

/// Last-heartbeat timestamp plus the responsiveness flag.
///
/// The timestamp is stored as milliseconds since `origin` and only moves
/// forward (`fetch_max`), so concurrent writers never move it back and
/// readers never block.
#[derive(Debug)]
pub struct HeartbeatState {
    origin: Instant,
    last_ms: AtomicU64,
    responding: AtomicBool,
}

impl HeartbeatState {
    /// Create a state whose last heartbeat is "now".
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
            responding: AtomicBool::new(true),
        }
    }

    fn offset_ms(&self, at: Instant) -> u64 {
        let ms = at.saturating_duration_since(self.origin).as_millis();
        u64::try_from(ms).unwrap_or(u64::MAX)
    }

    /// Record a liveness signal observed at `at`.
    ///
    /// Returns `true` if this heartbeat flipped the state back to responding.
    pub fn mark_alive(&self, at: Instant) -> bool {
        self.last_ms.fetch_max(self.offset_ms(at), Ordering::AcqRel);
        let recovered = self
            .responding
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if recovered {
            tracing::info!("server is responding again");
        }
        recovered
    }

    /// Instant of the most recent heartbeat.
    pub fn last_heartbeat(&self) -> Instant {
        self.origin + Duration::from_millis(self.last_ms.load(Ordering::Acquire))
    }

    /// Time since the last heartbeat, measured at `now`.
    pub fn staleness(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_heartbeat())
    }

    pub fn is_responding(&self) -> bool {
        self.responding.load(Ordering::Acquire)
    }

    /// Atomically change the flag, returning the previous value.
    pub fn set_responding(&self, responding: bool) -> bool {
        self.responding.swap(responding, Ordering::AcqRel)
    }

    /// Re-arm for a freshly launched process: heartbeat at `now`, responding.
    pub fn reset(&self, now: Instant) {
        self.last_ms.fetch_max(self.offset_ms(now), Ordering::AcqRel);
        self.responding.store(true, Ordering::Release);
    }
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors raised by the heartbeat listener.
#[derive(Debug)]
pub enum ChannelError {
    Bind {
        addr: String,
        source: std::io::Error,
    },
    Accept { source: std::io::Error },
    Read { source: std::io::Error },
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::Bind { addr, source } => {
                write!(f, "failed to bind heartbeat listener on {addr}: {source}")
            }
            ChannelError::Accept { source } => {
                write!(f, "failed to accept heartbeat connection: {source}")
            }
            ChannelError::Read { source } => write!(f, "heartbeat connection read failed: {source}"),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChannelError::Bind { source, .. } => Some(source),
            ChannelError::Accept { source } => Some(source),
            ChannelError::Read { source } => Some(source),
        }
    }
}

/// How the receiver loop ended.
#[derive(Debug)]
pub enum ChannelOutcome {
    /// The peer closed the connection.
    Disconnected { peer: SocketAddr },
    /// Accepting or reading failed.
    Failed(ChannelError),
    /// The channel was shut down by its owner.
    Aborted,
}

/// Handle to the running heartbeat channel.
pub struct ChannelHandle {
    local_addr: SocketAddr,
    signals: Arc<AtomicU64>,
    task: JoinHandle<ChannelOutcome>,
}

impl ChannelHandle {
    /// Address the listener is bound to (useful when binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of liveness signals received so far.
    pub fn signals_received(&self) -> u64 {
        self.signals.load(Ordering::Relaxed)
    }

    /// Wait for the receiver loop to end.
    pub async fn join(&mut self) -> ChannelOutcome {
        match (&mut self.task).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => ChannelOutcome::Aborted,
            Err(e) => ChannelOutcome::Failed(ChannelError::Read {
                source: std::io::Error::other(e),
            }),
        }
    }

    /// Handle that stops listening/receiving immediately, usable while
    /// another task is blocked in [`ChannelHandle::join`].
    pub fn abort_handle(&self) -> AbortHandle {
        self.task.abort_handle()
    }
}

/// Bind the heartbeat listener and start accepting its single peer.
pub async fn listen(addr: &str, state: Arc<HeartbeatState>) -> Result<ChannelHandle, ChannelError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ChannelError::Bind {
            addr: addr.to_string(),
            source: e,
        })?;
    let local_addr = listener.local_addr().map_err(|e| ChannelError::Bind {
        addr: addr.to_string(),
        source: e,
    })?;
    tracing::debug!(%local_addr, "heartbeat listener bound");

    let signals = Arc::new(AtomicU64::new(0));
    let task = tokio::spawn(accept_once(listener, state, Arc::clone(&signals)));

    Ok(ChannelHandle {
        local_addr,
        signals,
        task,
    })
}

async fn accept_once(
    listener: TcpListener,
    state: Arc<HeartbeatState>,
    signals: Arc<AtomicU64>,
) -> ChannelOutcome {
    let (stream, peer) = match listener.accept().await {
        Ok(accepted) => accepted,
        Err(e) => return ChannelOutcome::Failed(ChannelError::Accept { source: e }),
    };
    // Only one trusted peer: later connection attempts are refused.
    drop(listener);
    tracing::info!(%peer, "core agent connected");

    receive_loop(stream, peer, &state, &signals).await
}

async fn receive_loop(
    mut stream: TcpStream,
    peer: SocketAddr,
    state: &HeartbeatState,
    signals: &AtomicU64,
) -> ChannelOutcome {
    let mut buf = [0u8; 1024];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => return ChannelOutcome::Disconnected { peer },
            Ok(n) => {
                signals.fetch_add(1, Ordering::Relaxed);
                state.mark_alive(Instant::now());
                tracing::trace!(%peer, bytes = n, "heartbeat received");
            }
            Err(e) => return ChannelOutcome::Failed(ChannelError::Read { source: e }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test(start_paused = true)]
    async fn test_mark_alive_advances_timestamp() {
        let state = HeartbeatState::new();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(state.staleness(Instant::now()), Duration::from_secs(30));

        state.mark_alive(Instant::now());
        assert_eq!(state.staleness(Instant::now()), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_alive_never_moves_backwards() {
        let state = HeartbeatState::new();
        let early = Instant::now();
        tokio::time::advance(Duration::from_secs(10)).await;
        let late = Instant::now();

        state.mark_alive(late);
        state.mark_alive(early);
        assert_eq!(state.last_heartbeat(), late);
    }

    #[test]
    fn test_mark_alive_flips_responding() {
        let state = HeartbeatState::new();
        assert!(!state.mark_alive(Instant::now()));

        assert!(state.set_responding(false));
        assert!(state.mark_alive(Instant::now()));
        assert!(state.is_responding());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_rearms_state() {
        let state = HeartbeatState::new();
        state.set_responding(false);
        tokio::time::advance(Duration::from_secs(90)).await;

        state.reset(Instant::now());
        assert!(state.is_responding());
        assert_eq!(state.staleness(Instant::now()), Duration::ZERO);
    }

    #[test]
    fn test_concurrent_writers_keep_maximum() {
        let state = Arc::new(HeartbeatState::new());
        let base = Instant::now();
        let handles: Vec<_> = (0..8u64)
            .map(|i| {
                let state = Arc::clone(&state);
                std::thread::spawn(move || {
                    for j in 0..100u64 {
                        state.mark_alive(base + Duration::from_millis(i * 100 + j));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let newest = base + Duration::from_millis(799);
        assert!(state.staleness(newest) < Duration::from_millis(1));
        assert!(state.last_heartbeat() <= newest);
    }

    #[tokio::test]
    async fn test_bytes_from_peer_count_as_heartbeats() {
        let state = Arc::new(HeartbeatState::new());
        state.set_responding(false);
        let mut handle = listen("127.0.0.1:0", Arc::clone(&state)).await.unwrap();

        let mut client = TcpStream::connect(handle.local_addr()).await.unwrap();
        client.write_all(b"hb\n").await.unwrap();
        client.flush().await.unwrap();

        for _ in 0..100 {
            if handle.signals_received() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(handle.signals_received() >= 1);
        assert!(state.is_responding());

        let client_addr = client.local_addr().unwrap();
        drop(client);
        let outcome = handle.join().await;
        assert!(matches!(outcome, ChannelOutcome::Disconnected { peer } if peer == client_addr));
    }

    #[tokio::test]
    async fn test_second_peer_is_refused() {
        let state = Arc::new(HeartbeatState::new());
        let handle = listen("127.0.0.1:0", Arc::clone(&state)).await.unwrap();
        let addr = handle.local_addr();

        let mut first = TcpStream::connect(addr).await.unwrap();
        first.write_all(b"x").await.unwrap();
        for _ in 0..100 {
            if handle.signals_received() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_abort_ends_join_as_aborted() {
        let state = Arc::new(HeartbeatState::new());
        let mut handle = listen("127.0.0.1:0", state).await.unwrap();

        handle.abort_handle().abort();
        assert!(matches!(handle.join().await, ChannelOutcome::Aborted));
    }

    #[tokio::test]
    async fn test_bind_failure_reported() {
        let state = Arc::new(HeartbeatState::new());
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();

        let err = listen(&addr, state).await.err().unwrap();
        assert!(matches!(err, ChannelError::Bind { .. }));
    }
}
