use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::transport::{Link, Transport};

use super::error::TransportError;
use super::events::OutboundFrame;
use super::router::MessageRouter;

/// Connection state of the session transport. Exactly one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Failed => "failed",
        }
    }
}

/// Backoff for reconnecting after an unexpected close.
///
/// Attempt `n` (1-based) waits `base_delay * n`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(attempt.max(1))
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub reconnect: ReconnectPolicy,
    /// Upper bound on a single `Transport::open`.
    pub open_timeout: Duration,
    /// How long a health check waits for its pong.
    pub probe_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            open_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(3),
        }
    }
}

/// Outstanding health-check probes, keyed by nonce.
///
/// Shared between the connection manager (which registers probes) and the
/// router (which resolves them when a `pong` arrives).
#[derive(Clone, Default)]
pub struct ProbeWaiters {
    inner: Arc<DashMap<u64, oneshot::Sender<()>>>,
}

impl ProbeWaiters {
    fn register(&self, nonce: u64) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.inner.insert(nonce, tx);
        rx
    }

    /// Complete the probe for `nonce`. Returns false for late or unknown pongs.
    pub fn resolve(&self, nonce: u64) -> bool {
        match self.inner.remove(&nonce) {
            Some((_, tx)) => tx.send(()).is_ok(),
            None => false,
        }
    }

    fn forget(&self, nonce: u64) {
        self.inner.remove(&nonce);
    }

    fn clear(&self) {
        self.inner.clear();
    }

    pub fn pending(&self) -> usize {
        self.inner.len()
    }
}

/// Link bookkeeping guarded by one lock so that state transitions and the
/// epoch check happen together.
#[derive(Default)]
struct LinkSlot {
    /// Bumped on every `connect` and `disconnect`. Async work started in an
    /// older epoch never mutates state.
    epoch: u64,
    target: Option<String>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    cancel: CancellationToken,
}

/// Owns the single duplex connection of a session.
///
/// Connection state is published on a `watch` channel; this type is the
/// only writer.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    router: Arc<MessageRouter>,
    probes: ProbeWaiters,
    options: ConnectionOptions,
    state: watch::Sender<ConnectionState>,
    slot: Mutex<LinkSlot>,
    next_nonce: AtomicU64,
    /// Incremented each time a link is installed (first connect or reconnect).
    generation: AtomicU64,
}

impl ConnectionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        router: Arc<MessageRouter>,
        probes: ProbeWaiters,
        options: ConnectionOptions,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            router,
            probes,
            options,
            state,
            slot: Mutex::new(LinkSlot::default()),
            next_nonce: AtomicU64::new(1),
            generation: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Number of links installed so far. Changes on every successful reconnect.
    pub fn link_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Open the transport to `target`.
    ///
    /// No-op while already connected, connecting or reconnecting.
    pub async fn connect(self: &Arc<Self>, target: &str) -> Result<(), TransportError> {
        let claimed = {
            let mut slot = self.slot.lock();
            match self.state() {
                ConnectionState::Disconnected | ConnectionState::Failed => {
                    slot.epoch += 1;
                    slot.cancel = CancellationToken::new();
                    slot.target = Some(target.to_string());
                    slot.outbound = None;
                    self.state.send_replace(ConnectionState::Connecting);
                    Some((slot.epoch, slot.cancel.clone()))
                }
                _ => None,
            }
        };

        let Some((epoch, cancel)) = claimed else {
            debug!(state = self.state().as_str(), "connect ignored, connection already active");
            return Ok(());
        };

        info!(%target, epoch, "connecting");

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Closed),
            result = self.open_link(target) => result,
        };

        match result {
            Ok(link) => {
                let Some(inbound) = self.install_link(epoch, link) else {
                    return Err(TransportError::Closed);
                };
                info!(%target, "connected");
                let manager = Arc::clone(self);
                tokio::spawn(manager.run_link(epoch, cancel, inbound));
                Ok(())
            }
            Err(e) => {
                if self.set_state_for(epoch, ConnectionState::Failed) {
                    warn!(%target, error = %e, "connect failed");
                }
                Err(e)
            }
        }
    }

    /// Tear down the link and cancel any reconnection. Always succeeds.
    pub fn disconnect(&self) {
        let previous = {
            let mut slot = self.slot.lock();
            slot.epoch += 1;
            slot.cancel.cancel();
            slot.target = None;
            slot.outbound = None;
            self.state.send_replace(ConnectionState::Disconnected)
        };
        self.probes.clear();

        if previous != ConnectionState::Disconnected {
            info!(from = previous.as_str(), "disconnected");
        }
    }

    /// Serialize and send a frame on the live link.
    pub fn send(&self, frame: &OutboundFrame) -> Result<(), TransportError> {
        let payload =
            serde_json::to_string(frame).map_err(|e| TransportError::Encode(e.to_string()))?;

        let slot = self.slot.lock();
        let outbound = slot.outbound.as_ref().ok_or(TransportError::NotConnected)?;
        outbound.send(payload).map_err(|_| TransportError::Closed)
    }

    /// Round-trip a `ping` and wait for its `pong`.
    ///
    /// Returns false on any failure instead of erroring.
    pub async fn health_check(&self) -> bool {
        if self.state() != ConnectionState::Connected {
            return false;
        }

        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        let reply = self.probes.register(nonce);

        if let Err(e) = self.send(&OutboundFrame::Ping { nonce }) {
            self.probes.forget(nonce);
            debug!(error = %e, "health check probe not sent");
            return false;
        }

        let healthy = matches!(
            tokio::time::timeout(self.options.probe_timeout, reply).await,
            Ok(Ok(()))
        );
        self.probes.forget(nonce);

        if !healthy {
            warn!(nonce, "health check failed");
        }
        healthy
    }

    async fn open_link(&self, target: &str) -> Result<Link, TransportError> {
        match tokio::time::timeout(self.options.open_timeout, self.transport.open(target)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    /// Store the outbound half and mark `Connected`, unless the epoch moved on.
    fn install_link(&self, epoch: u64, link: Link) -> Option<mpsc::UnboundedReceiver<String>> {
        let mut slot = self.slot.lock();
        if slot.epoch != epoch || slot.cancel.is_cancelled() {
            debug!(epoch, "discarding link from a stale connection attempt");
            return None;
        }
        slot.outbound = Some(link.outbound);
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.state.send_replace(ConnectionState::Connected);
        Some(link.inbound)
    }

    fn set_state_for(&self, epoch: u64, state: ConnectionState) -> bool {
        let slot = self.slot.lock();
        if slot.epoch != epoch {
            return false;
        }
        self.state.send_replace(state);
        true
    }

    /// Pump inbound frames into the router, reconnecting when the link drops.
    async fn run_link(
        self: Arc<Self>,
        epoch: u64,
        cancel: CancellationToken,
        mut inbound: mpsc::UnboundedReceiver<String>,
    ) {
        loop {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    frame = inbound.recv() => match frame {
                        Some(frame) => {
                            self.router.on_frame(&frame);
                        }
                        None => break,
                    },
                }
            }

            match self.reconnect(epoch, &cancel).await {
                Some(next) => inbound = next,
                None => return,
            }
        }
    }

    async fn reconnect(
        &self,
        epoch: u64,
        cancel: &CancellationToken,
    ) -> Option<mpsc::UnboundedReceiver<String>> {
        let target = {
            let mut slot = self.slot.lock();
            if slot.epoch != epoch || cancel.is_cancelled() {
                return None;
            }
            slot.outbound = None;
            self.state.send_replace(ConnectionState::Reconnecting);
            slot.target.clone()?
        };
        self.probes.clear();

        warn!(%target, "transport closed unexpectedly, reconnecting");

        let policy = self.options.reconnect;
        for attempt in 1..=policy.max_attempts {
            let delay = policy.delay_for(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "waiting before reconnect");

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return None,
                result = self.open_link(&target) => result,
            };

            match result {
                Ok(link) => {
                    let inbound = self.install_link(epoch, link)?;
                    info!(%target, attempt, "reconnected");
                    return Some(inbound);
                }
                Err(e) => {
                    warn!(
                        %target,
                        attempt,
                        max_attempts = policy.max_attempts,
                        error = %e,
                        "reconnect attempt failed"
                    );
                }
            }
        }

        if self.set_state_for(epoch, ConnectionState::Failed) {
            error!(%target, attempts = policy.max_attempts, "reconnection exhausted, giving up");
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::bus::EventBus;
    use crate::engine::presence::PresenceTracker;
    use crate::transport::memory::MemoryTransport;

    fn manager(transport: &MemoryTransport, options: ConnectionOptions) -> Arc<ConnectionManager> {
        let probes = ProbeWaiters::default();
        let router = Arc::new(MessageRouter::new(
            Arc::new(PresenceTracker::new()),
            EventBus::new(),
            EventBus::new(),
            probes.clone(),
        ));
        Arc::new(ConnectionManager::new(
            Arc::new(transport.clone()),
            router,
            probes,
            options,
        ))
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    async fn wait_for(rx: &mut watch::Receiver<ConnectionState>, want: ConnectionState) {
        tokio::time::timeout(Duration::from_secs(120), rx.wait_for(|s| *s == want))
            .await
            .expect("state not reached in time")
            .expect("state channel closed");
    }

    #[test]
    fn test_backoff_is_linear_and_capped() {
        let policy = ReconnectPolicy {
            base_delay: Duration::from_secs(4),
            max_delay: Duration::from_secs(10),
            max_attempts: 6,
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for(2), Duration::from_secs(8));
        assert_eq!(policy.delay_for(3), Duration::from_secs(10));
        assert_eq!(policy.delay_for(50), Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_is_non_decreasing() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<Duration> = (1..=40).map(|n| policy.delay_for(n)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let transport = MemoryTransport::new();
        let manager = manager(&transport, ConnectionOptions::default());
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        manager.connect("mem://outposts").await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.link_generation(), 1);

        manager.disconnect();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(
            manager.send(&OutboundFrame::Ping { nonce: 1 }),
            Err(TransportError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_connect_when_connected_is_noop() {
        let transport = MemoryTransport::new();
        let manager = manager(&transport, ConnectionOptions::default());

        manager.connect("mem://outposts").await.unwrap();
        manager.connect("mem://outposts").await.unwrap();
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_while_connecting_opens_once() {
        let transport = MemoryTransport::new();
        transport.set_open_delay(Duration::from_millis(500));
        let manager = manager(&transport, ConnectionOptions::default());

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.connect("mem://outposts").await })
        };
        settle().await;
        assert_eq!(manager.state(), ConnectionState::Connecting);

        manager.connect("mem://outposts").await.unwrap();
        first.await.unwrap().unwrap();

        assert_eq!(transport.open_count(), 1);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_failed_open_transitions_to_failed() {
        let transport = MemoryTransport::new();
        transport.fail_next_opens(1);
        let manager = manager(&transport, ConnectionOptions::default());

        let err = manager.connect("mem://outposts").await.unwrap_err();
        assert!(matches!(err, TransportError::Open(_)));
        assert_eq!(manager.state(), ConnectionState::Failed);

        // Failed is not sticky: a new connect starts over.
        manager.connect("mem://outposts").await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_timeout() {
        let transport = MemoryTransport::new();
        transport.set_open_delay(Duration::from_secs(60));
        let options = ConnectionOptions {
            open_timeout: Duration::from_secs(2),
            ..ConnectionOptions::default()
        };
        let manager = manager(&transport, options);

        let err = manager.connect("mem://outposts").await.unwrap_err();
        assert_eq!(err, TransportError::Timeout);
        assert_eq!(manager.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn test_health_check_round_trip() {
        let transport = MemoryTransport::new();
        let manager = manager(&transport, ConnectionOptions::default());

        assert!(!manager.health_check().await, "no transport yet");

        manager.connect("mem://outposts").await.unwrap();
        assert!(manager.health_check().await);
        assert_eq!(manager.probes.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_times_out_without_pong() {
        let transport = MemoryTransport::new();
        transport.set_answer_pings(false);
        let manager = manager(&transport, ConnectionOptions::default());

        manager.connect("mem://outposts").await.unwrap();
        assert!(!manager.health_check().await);
        assert_eq!(manager.probes.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_unexpected_close() {
        let transport = MemoryTransport::new();
        let manager = manager(&transport, ConnectionOptions::default());
        let mut states = manager.subscribe();

        manager.connect("mem://outposts").await.unwrap();
        transport.drop_links();

        wait_for(&mut states, ConnectionState::Reconnecting).await;
        wait_for(&mut states, ConnectionState::Connected).await;

        assert_eq!(transport.open_count(), 2);
        assert_eq!(manager.link_generation(), 2);
        assert!(manager.health_check().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up_after_max_attempts() {
        let transport = MemoryTransport::new();
        let options = ConnectionOptions {
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(1),
                max_attempts: 3,
            },
            ..ConnectionOptions::default()
        };
        let manager = manager(&transport, options);
        let mut states = manager.subscribe();

        manager.connect("mem://outposts").await.unwrap();
        transport.set_refuse_all(true);
        transport.drop_links();

        wait_for(&mut states, ConnectionState::Failed).await;
        assert_eq!(transport.open_count(), 1 + 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_reconnect() {
        let transport = MemoryTransport::new();
        let manager = manager(&transport, ConnectionOptions::default());
        let mut states = manager.subscribe();

        manager.connect("mem://outposts").await.unwrap();
        transport.drop_links();
        wait_for(&mut states, ConnectionState::Reconnecting).await;

        manager.disconnect();
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(transport.open_count(), 1);
    }
}
