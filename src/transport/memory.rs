use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::engine::error::TransportError;
use crate::engine::events::{InboundEvent, OutboundFrame};

use super::{Link, Transport};

/// In-process loopback transport.
///
/// Plays the server side of every link it opens: records the frames the
/// client sends, answers `ping` with `pong` and `join` with `join_ack`
/// (each switchable), and lets the caller push frames or drop every link.
/// Used by the test suite and for running the client offline.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

struct Shared {
    opens: AtomicUsize,
    fail_next: AtomicU32,
    fail_all: AtomicBool,
    answer_pings: AtomicBool,
    ack_joins: AtomicBool,
    open_delay: Mutex<Duration>,
    sent: Mutex<Vec<OutboundFrame>>,
    links: Mutex<Vec<ServerSide>>,
}

struct ServerSide {
    to_client: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
}

impl Default for Shared {
    fn default() -> Self {
        Self {
            opens: AtomicUsize::new(0),
            fail_next: AtomicU32::new(0),
            fail_all: AtomicBool::new(false),
            answer_pings: AtomicBool::new(true),
            ack_joins: AtomicBool::new(true),
            open_delay: Mutex::new(Duration::ZERO),
            sent: Mutex::new(Vec::new()),
            links: Mutex::new(Vec::new()),
        }
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times `open` has been called.
    pub fn open_count(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }

    /// Make the next `n` opens fail.
    pub fn fail_next_opens(&self, n: u32) {
        self.shared.fail_next.store(n, Ordering::SeqCst);
    }

    /// Make every open fail until switched back.
    pub fn set_refuse_all(&self, refuse: bool) {
        self.shared.fail_all.store(refuse, Ordering::SeqCst);
    }

    pub fn set_open_delay(&self, delay: Duration) {
        *self.shared.open_delay.lock() = delay;
    }

    pub fn set_answer_pings(&self, answer: bool) {
        self.shared.answer_pings.store(answer, Ordering::SeqCst);
    }

    pub fn set_ack_joins(&self, ack: bool) {
        self.shared.ack_joins.store(ack, Ordering::SeqCst);
    }

    /// Every frame the client has sent, across all links, in arrival order.
    pub fn sent_frames(&self) -> Vec<OutboundFrame> {
        self.shared.sent.lock().clone()
    }

    /// Only the `reaction` frames the client has sent.
    pub fn sent_reactions(&self) -> Vec<OutboundFrame> {
        self.sent_frames()
            .into_iter()
            .filter(|f| matches!(f, OutboundFrame::Reaction { .. }))
            .collect()
    }

    /// Number of links whose client side is still attached.
    pub fn live_links(&self) -> usize {
        let mut links = self.shared.links.lock();
        links.retain(|l| !l.to_client.is_closed() && !l.cancel.is_cancelled());
        links.len()
    }

    /// Push an event to every live link.
    pub fn push(&self, event: &InboundEvent) {
        if let Ok(raw) = serde_json::to_string(event) {
            self.push_raw(&raw);
        }
    }

    /// Push a raw frame (possibly malformed) to every live link.
    pub fn push_raw(&self, raw: &str) {
        let mut links = self.shared.links.lock();
        links.retain(|l| l.to_client.send(raw.to_string()).is_ok());
    }

    /// Simulate the server dropping every open connection.
    pub fn drop_links(&self) {
        let links: Vec<ServerSide> = self.shared.links.lock().drain(..).collect();
        for link in links {
            link.cancel.cancel();
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, url: &str) -> Result<Link, TransportError> {
        self.shared.opens.fetch_add(1, Ordering::SeqCst);

        let delay = *self.shared.open_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let scripted_failure = self
            .shared
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted_failure || self.shared.fail_all.load(Ordering::SeqCst) {
            return Err(TransportError::Open(format!("{url} refused the connection")));
        }

        let (outbound, from_client) = mpsc::unbounded_channel::<String>();
        let (to_client, inbound) = mpsc::unbounded_channel::<String>();
        let cancel = CancellationToken::new();

        self.shared.links.lock().push(ServerSide {
            to_client: to_client.clone(),
            cancel: cancel.clone(),
        });

        tokio::spawn(serve_link(
            self.shared.clone(),
            from_client,
            to_client,
            cancel,
        ));

        Ok(Link { outbound, inbound })
    }
}

async fn serve_link(
    shared: Arc<Shared>,
    mut from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = from_client.recv() => {
                let Some(raw) = frame else { break };
                let frame: OutboundFrame = match serde_json::from_str(&raw) {
                    Ok(f) => f,
                    Err(e) => {
                        debug!(error = %e, "loopback received undecodable frame");
                        continue;
                    }
                };
                shared.sent.lock().push(frame.clone());

                let reply = match frame {
                    OutboundFrame::Ping { nonce } if shared.answer_pings.load(Ordering::SeqCst) => {
                        Some(InboundEvent::Pong { nonce })
                    }
                    OutboundFrame::Join { outpost_id } if shared.ack_joins.load(Ordering::SeqCst) => {
                        Some(InboundEvent::JoinAck { outpost_id })
                    }
                    _ => None,
                };

                if let Some(reply) = reply
                    && let Ok(raw) = serde_json::to_string(&reply)
                {
                    let _ = to_client.send(raw);
                }
            }
        }
    }
}
