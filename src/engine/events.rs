use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of an outpost (room).
pub type OutpostId = String;

/// Unique identifier for a joined session (one per join, not per outpost).
pub type SessionId = Uuid;

/// The four reactions a participant can direct at another participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactionKind {
    Like,
    Dislike,
    Cheer,
    Boo,
}

impl ReactionKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "like" => Some(Self::Like),
            "dislike" => Some(Self::Dislike),
            "cheer" => Some(Self::Cheer),
            "boo" => Some(Self::Boo),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Like => "like",
            Self::Dislike => "dislike",
            Self::Cheer => "cheer",
            Self::Boo => "boo",
        }
    }
}

/// Source/target/timestamp triple carried by every reaction event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionPayload {
    pub source_address: String,
    pub target_address: String,
    pub timestamp: DateTime<Utc>,
}

/// Server-to-client event decoded from a transport frame.
///
/// Delivery order is not guaranteed to follow causation, and frames may be
/// duplicated; every consumer is written to tolerate both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    /// A participant entered the outpost.
    UserJoined {
        outpost_id: OutpostId,
        user_address: String,
    },

    /// A participant left the outpost.
    UserLeft {
        outpost_id: OutpostId,
        user_address: String,
    },

    UserLiked(ReactionPayload),
    UserDisliked(ReactionPayload),
    UserCheered(ReactionPayload),
    UserBooed(ReactionPayload),

    /// Full replacement of the online count for an outpost.
    PresenceSnapshot {
        outpost_id: OutpostId,
        online_users_count: u32,
    },

    /// The server accepted our `join` frame.
    JoinAck { outpost_id: OutpostId },

    /// The host ended the outpost.
    OutpostEnded { outpost_id: OutpostId },

    /// Reply to a health-check `ping`.
    Pong { nonce: u64 },

    /// Error from the server.
    Error { code: String, message: String },

    /// Any tag this client does not understand.
    #[serde(other)]
    Unknown,
}

impl InboundEvent {
    /// The reaction kind and payload, for the four reaction variants.
    pub fn reaction(&self) -> Option<(ReactionKind, &ReactionPayload)> {
        match self {
            Self::UserLiked(p) => Some((ReactionKind::Like, p)),
            Self::UserDisliked(p) => Some((ReactionKind::Dislike, p)),
            Self::UserCheered(p) => Some((ReactionKind::Cheer, p)),
            Self::UserBooed(p) => Some((ReactionKind::Boo, p)),
            _ => None,
        }
    }
}

/// Client-to-server frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Join {
        outpost_id: OutpostId,
    },
    Leave {
        outpost_id: OutpostId,
    },
    Reaction {
        kind: ReactionKind,
        outpost_id: OutpostId,
        target_address: String,
    },
    Ping {
        nonce: u64,
    },
    /// The local client started or stopped viewing an outpost's card.
    Viewing {
        outpost_id: OutpostId,
        visible: bool,
    },
}

/// A reaction the local user wants to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundAction {
    pub kind: ReactionKind,
    pub target_user_address: String,
    pub outpost_id: OutpostId,
}

/// Where a piece of reaction feedback came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackOrigin {
    /// Optimistic echo of a reaction this client just sent.
    Local,
    /// A reaction pushed by the server.
    Remote,
}

/// Cosmetic event for the UI (confetti, floating emoji). Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionFeedback {
    pub source_address: String,
    pub target_address: String,
    pub kind: ReactionKind,
    pub origin: FeedbackOrigin,
}

/// Per-second countdown of reaction cooldowns, rendered by the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CooldownEvent {
    Tick {
        target_address: String,
        remaining_secs: u64,
    },
    Expired {
        target_address: String,
    },
}

/// Published when the displayed presence of an outpost changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceUpdate {
    pub outpost_id: OutpostId,
    pub online_count: u32,
    pub live: bool,
}

/// Protocol events that concern the session itself rather than the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    JoinAcknowledged { outpost_id: OutpostId },
    OutpostEnded { outpost_id: OutpostId },
    ServerError { code: String, message: String },
}
