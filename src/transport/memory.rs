use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use serde_json::Value;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use super::{Connection, Frame, Transport};
use crate::{error::TransportError, protocol::Message};

type Outbox = UnboundedSender<Result<Frame, TransportError>>;

/// An in-process public chat room.
///
/// Behaves like the endpoints chatstorm is pointed at: every chat is broadcast to
/// every other connected client, joins and leaves are tracked, and the hub can ping
/// its clients. It also exposes fault knobs (refusals, injected resets, raw
/// garbage frames) so the engine's error paths can be exercised without a network.
///
/// Cloning a hub yields another handle to the same room.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

#[derive(Default)]
struct HubInner {
    clients: Mutex<HashMap<u64, Outbox>>,
    next_id: AtomicU64,
    refusing: AtomicBool,
    connect_delay: Mutex<Duration>,
    broadcast: AtomicBool,
    stats: Counters,
}

#[derive(Default)]
struct Counters {
    connections: AtomicU64,
    closed: AtomicU64,
    joins: AtomicU64,
    leaves: AtomicU64,
    chats: AtomicU64,
    pongs: AtomicU64,
    unreadable: AtomicU64,
}

/// Point-in-time counters of what the hub has seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HubStats {
    pub connections: u64,
    pub active: u64,
    pub joins: u64,
    pub leaves: u64,
    pub chats: u64,
    pub pongs: u64,
    pub unreadable: u64,
}

impl MemoryHub {
    /// A hub that accepts everyone and broadcasts chat.
    pub fn new() -> Self {
        let hub = Self::default();
        hub.inner.broadcast.store(true, Ordering::Relaxed);
        hub
    }

    /// Turn chat broadcast on or off. Large populations without broadcast keep
    /// tests cheap when only the sender side matters.
    pub fn with_broadcast(self, broadcast: bool) -> Self {
        self.inner.broadcast.store(broadcast, Ordering::Relaxed);
        self
    }

    /// Delay every connect by `delay`.
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        *self
            .inner
            .connect_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = delay;
        self
    }

    /// Refuse (or accept again) all new connections.
    pub fn set_refusing(&self, refusing: bool) {
        self.inner.refusing.store(refusing, Ordering::Relaxed);
    }

    /// Send `{type: ping, ts}` to every connected client.
    pub fn ping_all(&self, ts: Value) {
        self.push_all(Message::Ping { ts }.to_json());
    }

    /// Push a raw text frame to every connected client.
    pub fn push_all(&self, text: impl Into<String>) {
        let text = text.into();
        for tx in self.clients().values() {
            let _ = tx.send(Ok(Frame::Text(text.clone())));
        }
    }

    /// Fail every live connection with `error` on its next receive.
    pub fn fail_all(&self, error: TransportError) {
        for tx in self.clients().values() {
            let _ = tx.send(Err(error.clone()));
        }
    }

    /// Drop every client from the room; their streams end.
    pub fn disconnect_all(&self) {
        self.clients().clear();
    }

    pub fn stats(&self) -> HubStats {
        let s = &self.inner.stats;
        let connections = s.connections.load(Ordering::SeqCst);
        let closed = s.closed.load(Ordering::SeqCst);
        HubStats {
            connections,
            active: connections.saturating_sub(closed),
            joins: s.joins.load(Ordering::SeqCst),
            leaves: s.leaves.load(Ordering::SeqCst),
            chats: s.chats.load(Ordering::SeqCst),
            pongs: s.pongs.load(Ordering::SeqCst),
            unreadable: s.unreadable.load(Ordering::SeqCst),
        }
    }

    fn clients(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Outbox>> {
        self.inner.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for MemoryHub {
    type Connection = MemoryConnection;

    async fn connect(&self, url: &str) -> Result<MemoryConnection, TransportError> {
        let delay = *self
            .inner
            .connect_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.inner.refusing.load(Ordering::Relaxed) {
            return Err(TransportError::Refused(format!("{url}: hub is refusing")));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = unbounded_channel();
        self.clients().insert(id, tx);
        self.inner.stats.connections.fetch_add(1, Ordering::SeqCst);
        tracing::trace!("Memory hub accepted client {id}");

        Ok(MemoryConnection {
            id,
            hub: self.clone(),
            rx,
            closed: false,
        })
    }
}

/// One client's end of a [`MemoryHub`].
pub struct MemoryConnection {
    id: u64,
    hub: MemoryHub,
    rx: UnboundedReceiver<Result<Frame, TransportError>>,
    closed: bool,
}

impl MemoryConnection {
    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.hub.clients().remove(&self.id);
            self.hub.inner.stats.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Connection for MemoryConnection {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        if self.closed || !self.hub.clients().contains_key(&self.id) {
            return Err(TransportError::ClosedByPeer);
        }
        let stats = &self.hub.inner.stats;
        match serde_json::from_str::<Message>(&text) {
            Ok(Message::Join { .. }) => {
                stats.joins.fetch_add(1, Ordering::SeqCst);
            }
            Ok(Message::Leave { .. }) => {
                stats.leaves.fetch_add(1, Ordering::SeqCst);
            }
            Ok(Message::Pong { .. }) => {
                stats.pongs.fetch_add(1, Ordering::SeqCst);
            }
            Ok(Message::Chat { .. }) => {
                stats.chats.fetch_add(1, Ordering::SeqCst);
                if self.hub.inner.broadcast.load(Ordering::Relaxed) {
                    // everyone but the sender
                    for (id, tx) in self.hub.clients().iter() {
                        if *id != self.id {
                            let _ = tx.send(Ok(Frame::Text(text.clone())));
                        }
                    }
                }
            }
            Ok(Message::Ping { .. }) | Err(_) => {
                stats.unreadable.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<Frame, TransportError>> {
        if self.closed {
            return None;
        }
        self.rx.recv().await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.release();
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.release();
    }
}
