use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::engine::error::TransportError;

pub mod memory;
pub mod websocket;

/// Both halves of an open duplex link.
///
/// Dropping `outbound` closes the link. `inbound` yielding `None` means the
/// remote side went away.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// A duplex text-frame channel to the real-time backend.
///
/// The connection manager is the only caller.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, url: &str) -> Result<Link, TransportError>;
}
