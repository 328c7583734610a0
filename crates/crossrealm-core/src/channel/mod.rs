//! The message-passing primitive realms talk over.
//!
//! A channel is duplex, ordered and at-most-once, with an explicit close
//! that is visible from both ends. Each end is a [`Port`]: a cloneable
//! [`ChannelHandle`] for sending and an [`Inbound`] stream for receiving.
//!
//! # Transports
//!
//! - [`memory`]: both ends in one process (realms hosted side by side, tests)
//! - [`tcp`]: length-prefixed JSON frames over a local TCP connection

pub mod memory;
pub mod tcp;

use crate::envelope::Message;
use crate::realm::SenderDescriptor;
use crate::{MessengerError, Result};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::debug;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique channel identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    fn next() -> Self {
        Self(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// State shared by both ends of one channel.
#[derive(Debug)]
struct ChannelState {
    id: ChannelId,
    name: String,
    closed: watch::Sender<bool>,
}

impl ChannelState {
    fn new(name: impl Into<String>) -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            id: ChannelId::next(),
            name: name.into(),
            closed,
        })
    }
}

/// Sending side of one channel end.
#[derive(Clone)]
pub struct ChannelHandle {
    state: Arc<ChannelState>,
    outbound: mpsc::UnboundedSender<Value>,
    remote: Arc<SenderDescriptor>,
}

impl ChannelHandle {
    pub fn id(&self) -> ChannelId {
        self.state.id
    }

    /// Declared purpose of the channel.
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Who is on the other end.
    pub fn remote(&self) -> &SenderDescriptor {
        &self.remote
    }

    /// Send a message. Fails once the channel is closed.
    pub fn send(&self, message: &Message) -> Result<()> {
        let value = message.to_value()?;
        self.send_value(value)
    }

    /// Send a raw JSON value without envelope validation.
    pub fn send_value(&self, value: Value) -> Result<()> {
        if self.is_closed() {
            return Err(MessengerError::ChannelClosed { channel: self.id() });
        }
        self.outbound
            .send(value)
            .map_err(|_| MessengerError::ChannelClosed { channel: self.id() })
    }

    /// Close both ends. Safe to call more than once.
    pub fn close(&self) {
        let was_closed = self.state.closed.send_replace(true);
        if !was_closed {
            debug!(channel = %self.id(), name = %self.name(), "channel closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.state.closed.borrow()
    }

    /// Resolves once the channel is closed from either end.
    pub async fn closed(&self) {
        let mut rx = self.state.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl PartialEq for ChannelHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for ChannelHandle {}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("id", &self.state.id)
            .field("name", &self.state.name)
            .field("remote", &self.remote)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Receiving side of one channel end.
#[derive(Debug)]
pub struct Inbound {
    rx: mpsc::UnboundedReceiver<Value>,
    closed: watch::Receiver<bool>,
}

impl Inbound {
    /// Next message in send order, or `None` once the channel is closed.
    ///
    /// Messages already queued when the close happens are still delivered.
    pub async fn recv(&mut self) -> Option<Value> {
        tokio::select! {
            biased;
            message = self.rx.recv() => message,
            _ = self.closed.wait_for(|closed| *closed) => None,
        }
    }
}

/// One end of a channel.
#[derive(Debug)]
pub struct Port {
    pub handle: ChannelHandle,
    pub inbound: Inbound,
}

/// Transport-facing half of a port: what a transport task drives.
pub(crate) struct Link {
    /// Messages the local realm wants sent to the peer.
    pub outbound: mpsc::UnboundedReceiver<Value>,
    /// Messages received from the peer, for the local realm.
    pub inbound: mpsc::UnboundedSender<Value>,
}

/// Build a port whose wire side is driven by a transport task.
pub(crate) fn port_with_link(name: &str, remote: SenderDescriptor) -> (Port, Link) {
    let state = ChannelState::new(name);
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

    let port = Port {
        handle: ChannelHandle {
            state: state.clone(),
            outbound: outbound_tx,
            remote: Arc::new(remote),
        },
        inbound: Inbound {
            rx: inbound_rx,
            closed: state.closed.subscribe(),
        },
    };
    let link = Link {
        outbound: outbound_rx,
        inbound: inbound_tx,
    };
    (port, link)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_channel_ids_are_unique() {
        let a = ChannelId::next();
        let b = ChannelId::next();
        assert_ne!(a, b);
        assert_eq!(ChannelId::from_raw(a.as_u64()), a);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (port, _link) = port_with_link("test", SenderDescriptor::controller("ext"));
        port.handle.close();
        port.handle.close();

        let result = port.handle.send_value(json!({}));
        assert!(matches!(result, Err(MessengerError::ChannelClosed { .. })));
    }

    #[tokio::test]
    async fn test_queued_messages_survive_close() {
        let (mut port, link) = port_with_link("test", SenderDescriptor::controller("ext"));
        link.inbound.send(json!(1)).unwrap();
        link.inbound.send(json!(2)).unwrap();
        port.handle.close();

        assert_eq!(port.inbound.recv().await, Some(json!(1)));
        assert_eq!(port.inbound.recv().await, Some(json!(2)));
        assert_eq!(port.inbound.recv().await, None);
    }

    #[tokio::test]
    async fn test_closed_resolves_after_close() {
        let (port, _link) = port_with_link("test", SenderDescriptor::controller("ext"));
        let handle = port.handle.clone();
        let waiter = tokio::spawn(async move { handle.closed().await });
        port.handle.close();
        waiter.await.unwrap();
        assert!(port.handle.is_closed());
    }
}
