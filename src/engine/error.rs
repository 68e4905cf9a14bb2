use thiserror::Error;

use super::session::SessionPhase;

/// Failure of the underlying duplex channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("failed to open transport: {0}")]
    Open(String),

    #[error("transport operation timed out")]
    Timeout,

    #[error("transport is not connected")]
    NotConnected,

    #[error("transport closed")]
    Closed,

    #[error("failed to encode frame: {0}")]
    Encode(String),
}

/// Local policy refusal. Shown to the user, never retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyRejection {
    #[error("sign in to join an outpost")]
    NotAuthenticated,

    #[error("you cannot react to yourself")]
    SelfReaction,

    #[error("this outpost starts in {starts_in_secs} seconds")]
    NotStarted { starts_in_secs: i64 },
}

/// Why a reaction was not sent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejected {
    #[error(transparent)]
    Policy(#[from] PolicyRejection),

    /// Expected and non-fatal; the UI renders a countdown.
    #[error("wait {remaining_secs}s before reacting to this user again")]
    OnCooldown { remaining_secs: u64 },

    #[error("a reaction to this user is already being sent")]
    InFlight,

    #[error("not joined to an outpost")]
    NotJoined,

    /// Health check failed. Retryable immediately, no cooldown applied.
    #[error("check your connection")]
    Connectivity,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Failure talking to the REST backend for outpost metadata.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error("outpost {0} not found")]
    NotFound(String),

    #[error("outpost directory request failed: {0}")]
    Request(String),
}

/// Why a join attempt did not reach `Joined`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JoinError {
    #[error("cannot join or leave while {}", .0.as_str())]
    InvalidPhase(SessionPhase),

    #[error(transparent)]
    Policy(#[from] PolicyRejection),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("check your connection")]
    Connectivity,

    #[error("join was cancelled")]
    Cancelled,
}

impl JoinError {
    /// Whether the user may simply try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Connectivity | Self::Directory(DirectoryError::Request(_))
        )
    }
}
