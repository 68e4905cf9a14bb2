use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api::outposts::{OutpostDirectory, OutpostInfo};
use crate::auth::identity::IdentityProvider;
use crate::notify::{Notice, Notifier};
use crate::transport::Transport;

use super::bus::EventBus;
use super::connection::{ConnectionManager, ConnectionOptions, ConnectionState, ProbeWaiters};
use super::error::{JoinError, PolicyRejection, Rejected, TransportError};
use super::events::{
    CooldownEvent, OutboundAction, OutboundFrame, OutpostId, PresenceUpdate, ReactionFeedback,
    ReactionKind, SessionId, SessionSignal,
};
use super::presence::PresenceTracker;
use super::reactions::{Accepted, DEFAULT_COOLDOWN, ReactionCoordinator};
use super::router::MessageRouter;

/// Viewer key used for local visibility when nobody is signed in.
const GUEST_VIEWER: &str = "guest";

/// Join/leave phase of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    NotJoined,
    Joining,
    Joined,
    Leaving,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotJoined => "not joined",
            Self::Joining => "joining",
            Self::Joined => "joined",
            Self::Leaving => "leaving",
        }
    }
}

/// Read-only view of the current session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub outpost_id: OutpostId,
    pub connection_state: ConnectionState,
    pub joined_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Real-time endpoint handed to the transport.
    pub ws_url: String,
    pub reaction_cooldown: Duration,
    /// How long to wait for `join_ack` after sending `join`.
    pub join_timeout: Duration,
    pub connection: ConnectionOptions,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            ws_url: "ws://localhost:8080/ws".into(),
            reaction_cooldown: DEFAULT_COOLDOWN,
            join_timeout: Duration::from_secs(10),
            connection: ConnectionOptions::default(),
        }
    }
}

/// One joined outpost. Owned exclusively by the controller.
struct ActiveSession {
    id: SessionId,
    outpost_id: OutpostId,
    joined_at: Option<DateTime<Utc>>,
    /// Cancelled on leave; stops reconnection, the supervisor and the countdown.
    cancel: CancellationToken,
    reactions: Arc<ReactionCoordinator>,
}

/// Orchestrates joining and leaving an outpost and owns the lifetime of the
/// connection manager, router, presence tracker and reaction coordinator.
pub struct SessionController {
    options: SessionOptions,
    identity: Arc<dyn IdentityProvider>,
    directory: Arc<dyn OutpostDirectory>,
    notifier: Arc<dyn Notifier>,
    connection: Arc<ConnectionManager>,
    presence: Arc<PresenceTracker>,
    feedback: EventBus<ReactionFeedback>,
    countdown: EventBus<CooldownEvent>,
    signals: EventBus<SessionSignal>,
    phase: watch::Sender<SessionPhase>,
    active: Mutex<Option<ActiveSession>>,
}

impl SessionController {
    pub fn new(
        options: SessionOptions,
        transport: Arc<dyn Transport>,
        identity: Arc<dyn IdentityProvider>,
        directory: Arc<dyn OutpostDirectory>,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        let presence = Arc::new(PresenceTracker::new());
        let feedback = EventBus::new();
        let countdown = EventBus::new();
        let signals = EventBus::new();
        let probes = ProbeWaiters::default();

        let router = Arc::new(MessageRouter::new(
            presence.clone(),
            feedback.clone(),
            signals.clone(),
            probes.clone(),
        ));
        let connection = Arc::new(ConnectionManager::new(
            transport,
            router,
            probes,
            options.connection,
        ));
        let (phase, _) = watch::channel(SessionPhase::NotJoined);

        Arc::new(Self {
            options,
            identity,
            directory,
            notifier,
            connection,
            presence,
            feedback,
            countdown,
            signals,
            phase,
            active: Mutex::new(None),
        })
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SessionPhase> {
        self.phase.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.subscribe()
    }

    pub fn subscribe_feedback(&self) -> broadcast::Receiver<ReactionFeedback> {
        self.feedback.subscribe()
    }

    pub fn subscribe_countdown(&self) -> broadcast::Receiver<CooldownEvent> {
        self.countdown.subscribe()
    }

    pub fn subscribe_presence(&self) -> broadcast::Receiver<PresenceUpdate> {
        self.presence.subscribe()
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn snapshot(&self) -> Option<SessionSnapshot> {
        self.active.lock().as_ref().map(|s| SessionSnapshot {
            id: s.id,
            outpost_id: s.outpost_id.clone(),
            connection_state: self.connection.state(),
            joined_at: s.joined_at,
        })
    }

    /// Seconds left before the current actor may react to `target` again.
    pub fn cooldown_remaining(&self, target: &str) -> Option<u64> {
        let reactions = self.active.lock().as_ref().map(|s| s.reactions.clone())?;
        reactions.remaining(target)
    }

    /// Join an outpost. Resolves once the server acknowledged the join.
    pub async fn join(self: &Arc<Self>, outpost_id: &str) -> Result<SessionId, JoinError> {
        let phase = self.phase();
        if phase != SessionPhase::NotJoined {
            return Err(JoinError::InvalidPhase(phase));
        }

        let actor = self
            .identity
            .current()
            .ok_or(PolicyRejection::NotAuthenticated)?;
        let outpost = self.directory.fetch_outpost(outpost_id).await?;
        if let Err(rejection) = check_join_policy(&outpost, &actor.address, Utc::now()) {
            info!(%outpost_id, reason = %rejection, "join refused");
            self.notifier.notify(Notice::info(rejection.to_string()));
            return Err(rejection.into());
        }

        let claimed = self.phase.send_if_modified(|phase| {
            if *phase == SessionPhase::NotJoined {
                *phase = SessionPhase::Joining;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(JoinError::InvalidPhase(self.phase()));
        }

        let session_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let reactions = Arc::new(ReactionCoordinator::new(
            actor.address.clone(),
            self.options.reaction_cooldown,
            self.connection.clone(),
            self.feedback.clone(),
            self.countdown.clone(),
            cancel.clone(),
        ));
        *self.active.lock() = Some(ActiveSession {
            id: session_id,
            outpost_id: outpost_id.to_string(),
            joined_at: None,
            cancel: cancel.clone(),
            reactions: reactions.clone(),
        });

        info!(%session_id, %outpost_id, actor = %actor.address, "joining outpost");

        if let Err(e) = self.establish(outpost_id, &cancel).await {
            if self.abort_join(session_id) {
                warn!(%session_id, %outpost_id, error = %e, "join failed");
                if matches!(e, JoinError::Transport(_) | JoinError::Connectivity) {
                    self.notifier
                        .notify(Notice::warning(format!("Could not join the outpost: {e}")));
                }
            }
            return Err(e);
        }

        // A concurrent leave wins if it already moved the phase on.
        let committed = {
            let mut active = self.active.lock();
            self.phase.send_if_modified(|phase| match active.as_mut() {
                Some(session) if session.id == session_id && *phase == SessionPhase::Joining => {
                    session.joined_at = Some(Utc::now());
                    *phase = SessionPhase::Joined;
                    true
                }
                _ => false,
            })
        };
        if !committed {
            return Err(JoinError::Cancelled);
        }

        reactions.spawn_countdown(cancel.clone());
        self.spawn_supervisor(session_id, outpost_id.to_string(), cancel);

        info!(%session_id, %outpost_id, "joined outpost");
        Ok(session_id)
    }

    /// Connect, send `join` and wait for the acknowledgment.
    async fn establish(&self, outpost_id: &str, cancel: &CancellationToken) -> Result<(), JoinError> {
        // Subscribe before sending so the ack cannot slip past us.
        let mut signals = self.signals.subscribe();

        tokio::select! {
            _ = cancel.cancelled() => return Err(JoinError::Cancelled),
            result = self.connection.connect(&self.options.ws_url) => result?,
        }
        if self.connection.state() != ConnectionState::Connected {
            return Err(TransportError::NotConnected.into());
        }

        self.connection.send(&OutboundFrame::Join {
            outpost_id: outpost_id.to_string(),
        })?;

        let ack = async {
            loop {
                match signals.recv().await {
                    Ok(SessionSignal::JoinAcknowledged { outpost_id: acked })
                        if acked == outpost_id =>
                    {
                        return true;
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return false,
                }
            }
        };

        let acked = tokio::select! {
            _ = cancel.cancelled() => return Err(JoinError::Cancelled),
            result = tokio::time::timeout(self.options.join_timeout, ack) => matches!(result, Ok(true)),
        };
        if acked {
            return Ok(());
        }

        if self.connection.health_check().await {
            Err(TransportError::Timeout.into())
        } else {
            Err(JoinError::Connectivity)
        }
    }

    /// Roll back a join that never completed. Returns false if the session
    /// was already replaced or left.
    fn abort_join(&self, session_id: SessionId) -> bool {
        let session = {
            let mut active = self.active.lock();
            match active.as_ref() {
                Some(s) if s.id == session_id => active.take(),
                _ => None,
            }
        };
        let Some(session) = session else {
            return false;
        };

        self.teardown(session, false);
        self.phase.send_replace(SessionPhase::NotJoined);
        true
    }

    /// Leave the current outpost.
    pub fn leave(&self) -> Result<(), JoinError> {
        let claimed = self.phase.send_if_modified(|phase| match phase {
            SessionPhase::Joined | SessionPhase::Joining => {
                *phase = SessionPhase::Leaving;
                true
            }
            _ => false,
        });
        if !claimed {
            return Err(JoinError::InvalidPhase(self.phase()));
        }

        let session = self.active.lock().take();
        if let Some(session) = session {
            self.teardown(session, true);
        }
        self.phase.send_replace(SessionPhase::NotJoined);
        Ok(())
    }

    /// End the session because of something outside the user's control.
    fn end_session(&self, session_id: SessionId, notice: Notice) {
        let session = {
            let mut active = self.active.lock();
            match active.as_ref() {
                Some(s) if s.id == session_id => active.take(),
                _ => None,
            }
        };
        let Some(session) = session else {
            debug!(%session_id, "stale session end ignored");
            return;
        };

        self.phase.send_replace(SessionPhase::Leaving);
        self.teardown(session, false);
        self.phase.send_replace(SessionPhase::NotJoined);
        self.notifier.notify(notice);
    }

    fn teardown(&self, session: ActiveSession, announce: bool) {
        session.cancel.cancel();

        if announce
            && let Err(e) = self.connection.send(&OutboundFrame::Leave {
                outpost_id: session.outpost_id.clone(),
            })
        {
            debug!(error = %e, "leave frame not sent");
        }

        self.connection.disconnect();
        session.reactions.clear();
        self.presence.forget_members(&session.outpost_id);

        info!(session_id = %session.id, outpost_id = %session.outpost_id, "left outpost");
    }

    /// React to another participant of the joined outpost.
    pub async fn react(&self, kind: ReactionKind, target_address: &str) -> Result<Accepted, Rejected> {
        let (outpost_id, reactions) = {
            let active = self.active.lock();
            match active.as_ref() {
                Some(s) if s.joined_at.is_some() => (s.outpost_id.clone(), s.reactions.clone()),
                _ => return Err(Rejected::NotJoined),
            }
        };

        let result = reactions
            .submit(OutboundAction {
                kind,
                target_user_address: target_address.to_string(),
                outpost_id,
            })
            .await;

        match &result {
            Err(Rejected::Connectivity) => self
                .notifier
                .notify(Notice::warning("Check your connection and try again")),
            Err(Rejected::Policy(rejection)) => {
                self.notifier.notify(Notice::info(rejection.to_string()))
            }
            _ => {}
        }
        result
    }

    /// Record that an outpost's card scrolled into or out of view. Tells the
    /// server when the set changed and the transport is up.
    pub fn set_outpost_visibility(&self, outpost_id: &str, visible: bool) -> bool {
        let viewer = self
            .identity
            .current()
            .map(|i| i.address)
            .unwrap_or_else(|| GUEST_VIEWER.to_string());

        let changed = self
            .presence
            .set_local_visibility(outpost_id, &viewer, visible);

        if changed
            && self.connection.state() == ConnectionState::Connected
            && let Err(e) = self.connection.send(&OutboundFrame::Viewing {
                outpost_id: outpost_id.to_string(),
                visible,
            })
        {
            debug!(error = %e, "viewing frame not sent");
        }
        changed
    }

    fn is_current(&self, session_id: SessionId) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|s| s.id == session_id)
    }

    /// Watch the connection and session signals for the lifetime of a join.
    fn spawn_supervisor(
        self: &Arc<Self>,
        session_id: SessionId,
        outpost_id: OutpostId,
        cancel: CancellationToken,
    ) {
        let controller = Arc::clone(self);
        let mut states = self.connection.subscribe();
        let mut signals = self.signals.subscribe();
        let mut generation = self.connection.link_generation();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = states.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = *states.borrow_and_update();
                        match state {
                            ConnectionState::Failed => {
                                error!(%session_id, %outpost_id, "connection failed, ending session");
                                controller.end_session(
                                    session_id,
                                    Notice::error("Lost connection to the outpost"),
                                );
                                break;
                            }
                            ConnectionState::Connected => {
                                let current = controller.connection.link_generation();
                                if current != generation {
                                    generation = current;
                                    controller.rejoin(session_id, &outpost_id);
                                }
                            }
                            _ => {}
                        }
                    }
                    signal = signals.recv() => match signal {
                        Ok(SessionSignal::OutpostEnded { outpost_id: ended }) if ended == outpost_id => {
                            info!(%session_id, %outpost_id, "outpost ended by host");
                            controller.end_session(session_id, Notice::info("This outpost has ended"));
                            break;
                        }
                        Ok(SessionSignal::ServerError { message, .. }) => {
                            controller.notifier.notify(Notice::warning(message));
                        }
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!(%session_id, "session supervisor stopped");
        });
    }

    /// Re-announce the join on a fresh link after a reconnect.
    fn rejoin(&self, session_id: SessionId, outpost_id: &str) {
        if !self.is_current(session_id) {
            return;
        }
        match self.connection.send(&OutboundFrame::Join {
            outpost_id: outpost_id.to_string(),
        }) {
            Ok(()) => info!(%session_id, %outpost_id, "rejoined after reconnect"),
            Err(e) => warn!(%session_id, error = %e, "rejoin frame not sent"),
        }
    }
}

/// Scheduled outposts only admit their creator before the start time.
pub fn check_join_policy(
    outpost: &OutpostInfo,
    actor_address: &str,
    now: DateTime<Utc>,
) -> Result<(), PolicyRejection> {
    match outpost.scheduled_start_at {
        Some(start) if start > now && outpost.creator_address != actor_address => {
            Err(PolicyRejection::NotStarted {
                starts_in_secs: (start - now).num_seconds().max(1),
            })
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn outpost(start: Option<DateTime<Utc>>) -> OutpostInfo {
        OutpostInfo {
            id: "o1".into(),
            name: "Morning show".into(),
            creator_address: "0xhost".into(),
            scheduled_start_at: start,
        }
    }

    #[test]
    fn test_unscheduled_outpost_is_open() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert_eq!(check_join_policy(&outpost(None), "0xguest", now), Ok(()));
    }

    #[test]
    fn test_future_outpost_refuses_non_creator() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let start = now + chrono::Duration::minutes(5);

        assert_eq!(
            check_join_policy(&outpost(Some(start)), "0xguest", now),
            Err(PolicyRejection::NotStarted {
                starts_in_secs: 300
            })
        );
        assert_eq!(check_join_policy(&outpost(Some(start)), "0xhost", now), Ok(()));
    }

    #[test]
    fn test_started_outpost_admits_everyone() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let start = now - chrono::Duration::seconds(1);
        assert_eq!(check_join_policy(&outpost(Some(start)), "0xguest", now), Ok(()));
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(SessionPhase::NotJoined.as_str(), "not joined");
        assert_eq!(SessionPhase::Leaving.as_str(), "leaving");
    }
}
