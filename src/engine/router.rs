use std::sync::Arc;

use tracing::{debug, warn};

use super::bus::EventBus;
use super::connection::ProbeWaiters;
use super::events::{
    FeedbackOrigin, InboundEvent, ReactionFeedback, ReactionKind, ReactionPayload, SessionSignal,
};
use super::presence::PresenceTracker;

/// Which handler category an inbound frame was routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Reaction feedback bus.
    Feedback,
    /// Presence tracker (membership and snapshots).
    Presence,
    /// The session's own signal bus.
    Session,
    /// A health-check reply.
    Probe,
    /// Malformed or unknown; dropped.
    Dropped,
}

/// Decodes inbound frames and fans them out to exactly one handler each.
///
/// The router imposes no ordering. Reaction feedback is cosmetic and
/// presence snapshots are full replacements, so reordering and duplicates
/// are harmless downstream.
pub struct MessageRouter {
    presence: Arc<PresenceTracker>,
    feedback: EventBus<ReactionFeedback>,
    signals: EventBus<SessionSignal>,
    probes: ProbeWaiters,
}

impl MessageRouter {
    pub fn new(
        presence: Arc<PresenceTracker>,
        feedback: EventBus<ReactionFeedback>,
        signals: EventBus<SessionSignal>,
        probes: ProbeWaiters,
    ) -> Self {
        Self {
            presence,
            feedback,
            signals,
            probes,
        }
    }

    /// Parse a raw frame and route it. Malformed frames are logged and dropped.
    pub fn on_frame(&self, raw: &str) -> Dispatch {
        let event: InboundEvent = match serde_json::from_str(raw) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, len = raw.len(), "dropping malformed frame");
                return Dispatch::Dropped;
            }
        };
        self.dispatch(event)
    }

    pub fn dispatch(&self, event: InboundEvent) -> Dispatch {
        match event {
            InboundEvent::UserJoined {
                outpost_id,
                user_address,
            } => {
                self.presence.member_joined(&outpost_id, &user_address);
                Dispatch::Presence
            }
            InboundEvent::UserLeft {
                outpost_id,
                user_address,
            } => {
                self.presence.member_left(&outpost_id, &user_address);
                Dispatch::Presence
            }
            InboundEvent::PresenceSnapshot {
                outpost_id,
                online_users_count,
            } => {
                self.presence
                    .apply_presence_snapshot(&outpost_id, online_users_count);
                Dispatch::Presence
            }
            InboundEvent::UserLiked(payload) => self.reaction(ReactionKind::Like, payload),
            InboundEvent::UserDisliked(payload) => self.reaction(ReactionKind::Dislike, payload),
            InboundEvent::UserCheered(payload) => self.reaction(ReactionKind::Cheer, payload),
            InboundEvent::UserBooed(payload) => self.reaction(ReactionKind::Boo, payload),
            InboundEvent::JoinAck { outpost_id } => {
                self.signals
                    .publish(SessionSignal::JoinAcknowledged { outpost_id });
                Dispatch::Session
            }
            InboundEvent::OutpostEnded { outpost_id } => {
                self.signals.publish(SessionSignal::OutpostEnded { outpost_id });
                Dispatch::Session
            }
            InboundEvent::Error { code, message } => {
                warn!(%code, %message, "server reported an error");
                self.signals
                    .publish(SessionSignal::ServerError { code, message });
                Dispatch::Session
            }
            InboundEvent::Pong { nonce } => {
                if !self.probes.resolve(nonce) {
                    debug!(nonce, "late or unknown pong");
                }
                Dispatch::Probe
            }
            InboundEvent::Unknown => {
                debug!("dropping frame with unknown type");
                Dispatch::Dropped
            }
        }
    }

    fn reaction(&self, kind: ReactionKind, payload: ReactionPayload) -> Dispatch {
        let delivered = self.feedback.publish(ReactionFeedback {
            source_address: payload.source_address,
            target_address: payload.target_address,
            kind,
            origin: FeedbackOrigin::Remote,
        });
        debug!(kind = kind.as_str(), delivered, "reaction feedback published");
        Dispatch::Feedback
    }
}
