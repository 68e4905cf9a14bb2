use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::bus::EventBus;
use super::connection::ConnectionManager;
use super::error::{PolicyRejection, Rejected};
use super::events::{
    CooldownEvent, FeedbackOrigin, OutboundAction, OutboundFrame, ReactionFeedback, ReactionKind,
};

/// Reference cooldown between two reactions to the same user.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(10);

/// Cooldown bookkeeping for one (actor, target) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CooldownEntry {
    /// A submission for this pair is between validation and dispatch.
    Pending,
    Cooling { expires_at: Instant },
}

/// A `Pending` claim on one pair. Released on drop unless committed, so a
/// submission abandoned mid-flight never leaves the pair locked.
struct Reservation<'a> {
    cooldowns: &'a DashMap<(String, String), CooldownEntry>,
    key: Option<(String, String)>,
}

impl Reservation<'_> {
    fn commit(mut self, expires_at: Instant) {
        if let Some(key) = self.key.take() {
            self.cooldowns
                .insert(key, CooldownEntry::Cooling { expires_at });
        }
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            self.cooldowns
                .remove_if(&key, |_, entry| *entry == CooldownEntry::Pending);
        }
    }
}

/// A reaction that was dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    pub kind: ReactionKind,
    pub target_address: String,
    pub cooldown: Duration,
}

/// Gates, rate-limits and dispatches reactions for one joined session.
///
/// At most one reaction per (actor, target) pair is pending or cooling at a
/// time. Different pairs never wait on each other.
pub struct ReactionCoordinator {
    actor: String,
    window: Duration,
    connection: Arc<ConnectionManager>,
    cooldowns: DashMap<(String, String), CooldownEntry>,
    feedback: EventBus<ReactionFeedback>,
    countdown: EventBus<CooldownEvent>,
    /// Cancelled when the owning session ends.
    session: CancellationToken,
}

impl ReactionCoordinator {
    pub fn new(
        actor: String,
        window: Duration,
        connection: Arc<ConnectionManager>,
        feedback: EventBus<ReactionFeedback>,
        countdown: EventBus<CooldownEvent>,
        session: CancellationToken,
    ) -> Self {
        Self {
            actor,
            window,
            connection,
            cooldowns: DashMap::new(),
            feedback,
            countdown,
            session,
        }
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    /// Validate, rate-limit and send a reaction.
    ///
    /// Local feedback is published as soon as the frame is handed to the
    /// transport; there is no server acknowledgment to wait for.
    pub async fn submit(&self, action: OutboundAction) -> Result<Accepted, Rejected> {
        let target = action.target_user_address;
        if target == self.actor {
            return Err(PolicyRejection::SelfReaction.into());
        }

        let reservation = self.reserve((self.actor.clone(), target.clone()))?;

        if !self.connection.health_check().await {
            info!(target = %target, "reaction not sent, connection unhealthy");
            return Err(Rejected::Connectivity);
        }

        if self.session.is_cancelled() {
            return Err(Rejected::NotJoined);
        }

        let frame = OutboundFrame::Reaction {
            kind: action.kind,
            outpost_id: action.outpost_id,
            target_address: target.clone(),
        };
        self.connection.send(&frame)?;

        reservation.commit(Instant::now() + self.window);
        self.feedback.publish(ReactionFeedback {
            source_address: self.actor.clone(),
            target_address: target.clone(),
            kind: action.kind,
            origin: FeedbackOrigin::Local,
        });

        info!(kind = action.kind.as_str(), target = %target, "reaction sent");

        Ok(Accepted {
            kind: action.kind,
            target_address: target,
            cooldown: self.window,
        })
    }

    /// Claim the pair for a new submission, or explain why it is unavailable.
    fn reserve(&self, key: (String, String)) -> Result<Reservation<'_>, Rejected> {
        let now = Instant::now();
        match self.cooldowns.entry(key.clone()) {
            Entry::Occupied(mut entry) => match *entry.get() {
                CooldownEntry::Pending => return Err(Rejected::InFlight),
                CooldownEntry::Cooling { expires_at } if expires_at > now => {
                    let remaining_secs = ceil_secs(expires_at - now);
                    debug!(target = %key.1, remaining_secs, "reaction on cooldown");
                    return Err(Rejected::OnCooldown { remaining_secs });
                }
                CooldownEntry::Cooling { .. } => {
                    entry.insert(CooldownEntry::Pending);
                }
            },
            Entry::Vacant(entry) => {
                entry.insert(CooldownEntry::Pending);
            }
        }
        Ok(Reservation {
            cooldowns: &self.cooldowns,
            key: Some(key),
        })
    }

    /// Whole seconds left on the cooldown for `target`, if one is running.
    pub fn remaining(&self, target: &str) -> Option<u64> {
        let key = (self.actor.clone(), target.to_string());
        let now = Instant::now();
        match self.cooldowns.get(&key).map(|e| *e.value()) {
            Some(CooldownEntry::Cooling { expires_at }) if expires_at > now => {
                Some(ceil_secs(expires_at - now))
            }
            _ => None,
        }
    }

    /// Number of pairs currently pending or cooling.
    pub fn active_cooldowns(&self) -> usize {
        self.cooldowns.len()
    }

    /// Publish one countdown tick and purge expired entries.
    pub fn tick(&self) {
        let now = Instant::now();
        let mut expired = Vec::new();

        for entry in self.cooldowns.iter() {
            let CooldownEntry::Cooling { expires_at } = *entry.value() else {
                continue;
            };
            if expires_at <= now {
                expired.push(entry.key().clone());
            } else {
                self.countdown.publish(CooldownEvent::Tick {
                    target_address: entry.key().1.clone(),
                    remaining_secs: ceil_secs(expires_at - now),
                });
            }
        }

        for key in expired {
            let purged = self.cooldowns.remove_if(&key, |_, entry| {
                matches!(entry, CooldownEntry::Cooling { expires_at } if *expires_at <= now)
            });
            if purged.is_some() {
                debug!(target = %key.1, "reaction cooldown expired");
                self.countdown.publish(CooldownEvent::Expired {
                    target_address: key.1,
                });
            }
        }
    }

    /// Tick the countdown once per second until `cancel` fires.
    pub fn spawn_countdown(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => self.tick(),
                }
            }
        })
    }

    /// Forget every cooldown. Called when the session ends.
    pub fn clear(&self) {
        self.cooldowns.clear();
    }
}

/// Round a positive duration up to whole seconds.
fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs();
    if d.subsec_nanos() > 0 { secs + 1 } else { secs }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::connection::{ConnectionOptions, ProbeWaiters};
    use crate::engine::error::TransportError;
    use crate::engine::presence::PresenceTracker;
    use crate::engine::router::MessageRouter;
    use crate::transport::memory::MemoryTransport;

    struct Fixture {
        transport: MemoryTransport,
        connection: Arc<ConnectionManager>,
        coordinator: Arc<ReactionCoordinator>,
        feedback: EventBus<ReactionFeedback>,
        countdown: EventBus<CooldownEvent>,
        session: CancellationToken,
    }

    async fn fixture() -> Fixture {
        let transport = MemoryTransport::new();
        let probes = ProbeWaiters::default();
        let feedback = EventBus::new();
        let countdown = EventBus::new();
        let router = Arc::new(MessageRouter::new(
            Arc::new(PresenceTracker::new()),
            feedback.clone(),
            EventBus::new(),
            probes.clone(),
        ));
        let connection = Arc::new(ConnectionManager::new(
            Arc::new(transport.clone()),
            router,
            probes,
            ConnectionOptions::default(),
        ));
        connection.connect("mem://outposts").await.unwrap();

        let session = CancellationToken::new();
        let coordinator = Arc::new(ReactionCoordinator::new(
            "0xalice".into(),
            DEFAULT_COOLDOWN,
            connection.clone(),
            feedback.clone(),
            countdown.clone(),
            session.clone(),
        ));

        Fixture {
            transport,
            connection,
            coordinator,
            feedback,
            countdown,
            session,
        }
    }

    fn like(target: &str) -> OutboundAction {
        OutboundAction {
            kind: ReactionKind::Like,
            target_user_address: target.into(),
            outpost_id: "o1".into(),
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_ceil_secs() {
        assert_eq!(ceil_secs(Duration::from_secs(10)), 10);
        assert_eq!(ceil_secs(Duration::from_millis(9_001)), 10);
        assert_eq!(ceil_secs(Duration::from_millis(1)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_submit_is_on_cooldown_until_expiry() {
        let f = fixture().await;

        let accepted = f.coordinator.submit(like("0xbob")).await.unwrap();
        assert_eq!(accepted.cooldown, DEFAULT_COOLDOWN);

        let err = f.coordinator.submit(like("0xbob")).await.unwrap_err();
        assert_eq!(err, Rejected::OnCooldown { remaining_secs: 10 });

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(f.coordinator.remaining("0xbob"), Some(6));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(f.coordinator.remaining("0xbob"), None);
        assert!(f.coordinator.submit(like("0xbob")).await.is_ok());

        settle().await;
        assert_eq!(f.transport.sent_reactions().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_is_per_target() {
        let f = fixture().await;

        f.coordinator.submit(like("0xbob")).await.unwrap();
        f.coordinator.submit(like("0xcarol")).await.unwrap();
        assert_eq!(f.coordinator.active_cooldowns(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_self_reaction_always_rejected() {
        let f = fixture().await;
        let err = f.coordinator.submit(like("0xalice")).await.unwrap_err();
        assert_eq!(err, Rejected::Policy(PolicyRejection::SelfReaction));

        f.connection.disconnect();
        let err = f.coordinator.submit(like("0xalice")).await.unwrap_err();
        assert_eq!(err, Rejected::Policy(PolicyRejection::SelfReaction));
        assert_eq!(f.transport.sent_frames().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_connection_sends_nothing_and_sets_no_cooldown() {
        let f = fixture().await;
        f.transport.set_answer_pings(false);

        let err = f.coordinator.submit(like("0xbob")).await.unwrap_err();
        assert_eq!(err, Rejected::Connectivity);
        assert_eq!(f.coordinator.active_cooldowns(), 0);
        assert_eq!(f.coordinator.remaining("0xbob"), None);

        settle().await;
        assert!(f.transport.sent_reactions().is_empty());

        // Retry succeeds as soon as connectivity returns.
        f.transport.set_answer_pings(true);
        assert!(f.coordinator.submit(like("0xbob")).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_submits_for_same_pair_send_once() {
        let f = fixture().await;
        let a = f.coordinator.clone();
        let b = f.coordinator.clone();

        let (first, second) = tokio::join!(a.submit(like("0xbob")), b.submit(like("0xbob")));
        let results = [first, second];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.iter().any(|r| r == &Err(Rejected::InFlight)));

        settle().await;
        assert_eq!(f.transport.sent_reactions().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_feedback_published_on_accept() {
        let f = fixture().await;
        let mut rx = f.feedback.subscribe();

        f.coordinator.submit(like("0xbob")).await.unwrap();

        let event = rx.try_recv().unwrap();
        assert_eq!(event.origin, FeedbackOrigin::Local);
        assert_eq!(event.source_address, "0xalice");
        assert_eq!(event.target_address, "0xbob");
        assert_eq!(event.kind, ReactionKind::Like);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnected_transport_is_a_connectivity_error() {
        let f = fixture().await;
        f.connection.disconnect();

        let err = f.coordinator.submit(like("0xbob")).await.unwrap_err();
        assert_eq!(err, Rejected::Connectivity);
        assert_eq!(f.coordinator.active_cooldowns(), 0);
        assert_eq!(
            f.connection.send(&OutboundFrame::Ping { nonce: 1 }),
            Err(TransportError::NotConnected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ended_session_rejects_after_probe() {
        let f = fixture().await;
        f.session.cancel();

        let err = f.coordinator.submit(like("0xbob")).await.unwrap_err();
        assert_eq!(err, Rejected::NotJoined);
        assert_eq!(f.coordinator.active_cooldowns(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_countdown_ticks_then_expires() {
        let f = fixture().await;
        let mut rx = f.countdown.subscribe();
        let cancel = CancellationToken::new();
        let handle = f.coordinator.clone().spawn_countdown(cancel.clone());

        f.coordinator.submit(like("0xbob")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10_500)).await;

        let mut ticks = Vec::new();
        let mut expired = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                CooldownEvent::Tick { remaining_secs, .. } => ticks.push(remaining_secs),
                CooldownEvent::Expired { target_address } => {
                    assert_eq!(target_address, "0xbob");
                    expired = true;
                }
            }
        }

        assert!(expired);
        assert!(!ticks.is_empty());
        assert!(ticks.windows(2).all(|w| w[0] > w[1]));
        assert_eq!(f.coordinator.active_cooldowns(), 0);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_submit_releases_pair() {
        let f = fixture().await;
        f.transport.set_answer_pings(false);

        let abandoned =
            tokio::time::timeout(Duration::from_millis(500), f.coordinator.submit(like("0xbob")))
                .await;
        assert!(abandoned.is_err(), "submit should still be waiting on the probe");
        assert_eq!(f.coordinator.active_cooldowns(), 0);

        f.transport.set_answer_pings(true);
        assert!(f.coordinator.submit(like("0xbob")).await.is_ok());
        assert_eq!(f.coordinator.remaining("0xbob"), Some(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_drops_cooldowns() {
        let f = fixture().await;
        f.coordinator.submit(like("0xbob")).await.unwrap();
        f.coordinator.clear();
        assert_eq!(f.coordinator.remaining("0xbob"), None);
        assert!(f.coordinator.submit(like("0xbob")).await.is_ok());
    }
}
