//! Connection lifecycle per remote endpoint.
//!
//! The manager keeps at most one live channel per [`EndpointKey`]. When a
//! channel closes, every entry holding it is removed from the map *before*
//! any cleanup side effect runs, so a cleanup callback that looks up the
//! endpoint again can never be handed the dead channel.
//!
//! All tables are guarded by short, non-async critical sections; work for
//! one endpoint never waits on another endpoint's callbacks.

use crate::auth::SenderPolicy;
use crate::channel::ChannelHandle;
use crate::envelope::Message;
use crate::realm::EndpointKey;
use crate::{MessengerError, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

type CleanupFn = Box<dyn FnOnce() + Send>;
type PermissionSender = oneshot::Sender<Result<Value>>;

/// Realm-specific reaction to an endpoint going away.
pub trait ConnectionHooks: Send + Sync + 'static {
    /// Clear per-endpoint transient state (for example UI state kept for a tab).
    fn on_endpoint_reset(&self, endpoint: &EndpointKey);
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl ConnectionHooks for NoopHooks {
    fn on_endpoint_reset(&self, _endpoint: &EndpointKey) {}
}

/// Tracks live channels by endpoint.
pub struct ConnectionManager {
    purpose: String,
    hooks: Arc<dyn ConnectionHooks>,
    connections: Mutex<HashMap<EndpointKey, ChannelHandle>>,
    cleanups: Mutex<HashMap<EndpointKey, Vec<CleanupFn>>>,
    permission_listeners: Mutex<HashMap<EndpointKey, Vec<PermissionSender>>>,
    opened: AtomicUsize,
}

impl ConnectionManager {
    pub fn new(purpose: impl Into<String>, hooks: Arc<dyn ConnectionHooks>) -> Self {
        Self {
            purpose: purpose.into(),
            hooks,
            connections: Mutex::new(HashMap::new()),
            cleanups: Mutex::new(HashMap::new()),
            permission_listeners: Mutex::new(HashMap::new()),
            opened: AtomicUsize::new(0),
        }
    }

    /// Purpose a channel must declare to be accepted.
    pub fn purpose(&self) -> &str {
        &self.purpose
    }

    /// Validate a newly opened channel and, if accepted, acknowledge and
    /// register it.
    ///
    /// The caller is responsible for running the channel's event loop; see
    /// [`Realm::accept`](crate::realm::Realm::accept).
    pub fn on_connect(&self, channel: &ChannelHandle, policy: &dyn SenderPolicy) -> Result<EndpointKey> {
        if channel.name() != self.purpose {
            debug!(
                channel = %channel.id(),
                name = %channel.name(),
                expected = %self.purpose,
                "refusing channel with unexpected purpose"
            );
            return Err(MessengerError::ConnectionRefused {
                reason: format!("unexpected channel purpose '{}'", channel.name()),
            });
        }

        let remote = channel.remote();
        if !policy.is_trusted_sender(remote) {
            debug!(
                channel = %channel.id(),
                extension_id = %remote.extension_id,
                kind = ?remote.kind,
                "refusing channel from untrusted sender"
            );
            return Err(MessengerError::ConnectionRefused {
                reason: "untrusted sender".to_string(),
            });
        }

        channel.send(&Message::Ack)?;
        let opened = self.opened.fetch_add(1, Ordering::Relaxed) + 1;

        let endpoint = remote.endpoint_key();
        self.register(endpoint, channel.clone());
        info!(channel = %channel.id(), %endpoint, opened, "connection accepted");
        Ok(endpoint)
    }

    /// Map `endpoint` to `channel`, superseding any other live channel.
    ///
    /// The superseded channel is closed so calls pending on it reject with a
    /// disconnect error. Re-registering the same channel is a no-op.
    pub fn register(&self, endpoint: EndpointKey, channel: ChannelHandle) -> Option<ChannelHandle> {
        let previous = self.connections.lock().insert(endpoint, channel.clone());

        match previous {
            Some(previous) if previous != channel => {
                if !previous.is_closed() {
                    warn!(
                        %endpoint,
                        previous = %previous.id(),
                        replacement = %channel.id(),
                        "endpoint already had a live channel; superseding it"
                    );
                    previous.close();
                }
                Some(previous)
            }
            _ => None,
        }
    }

    /// Tear down every connection using `channel`. Returns the affected
    /// endpoints; calling it again for the same channel does nothing.
    pub fn on_close(&self, channel: &ChannelHandle) -> Vec<EndpointKey> {
        let removed: Vec<EndpointKey> = {
            let mut connections = self.connections.lock();
            let keys: Vec<EndpointKey> = connections
                .iter()
                .filter(|(_, c)| *c == channel)
                .map(|(key, _)| *key)
                .collect();
            for key in &keys {
                connections.remove(key);
            }
            keys
        };

        for endpoint in &removed {
            debug!(%endpoint, channel = %channel.id(), "connection closed; cleaning up");
            self.hooks.on_endpoint_reset(endpoint);

            let cleanups = self.cleanups.lock().remove(endpoint).unwrap_or_default();
            for cleanup in cleanups {
                cleanup();
            }

            let listeners = self
                .permission_listeners
                .lock()
                .remove(endpoint)
                .unwrap_or_default();
            for listener in listeners {
                let _ = listener.send(Err(MessengerError::ConnectionCleanedUp {
                    endpoint: *endpoint,
                }));
            }
        }

        removed
    }

    /// Live channel for `endpoint`, if any.
    pub fn channel(&self, endpoint: &EndpointKey) -> Option<ChannelHandle> {
        self.connections
            .lock()
            .get(endpoint)
            .filter(|channel| !channel.is_closed())
            .cloned()
    }

    /// Endpoints that currently have a channel, sorted.
    pub fn endpoints(&self) -> Vec<EndpointKey> {
        let mut keys: Vec<EndpointKey> = self.connections.lock().keys().copied().collect();
        keys.sort();
        keys
    }

    /// Connections accepted since the realm started.
    pub fn opened_count(&self) -> usize {
        self.opened.load(Ordering::Relaxed)
    }

    /// Channels currently mapped to an endpoint.
    pub fn live_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Close every live channel. Each channel's event loop then tears its
    /// connections down as usual. Returns how many channels were closed.
    pub fn close_all(&self) -> usize {
        let channels: Vec<ChannelHandle> = self.connections.lock().values().cloned().collect();
        for channel in &channels {
            channel.close();
        }
        channels.len()
    }

    /// Run `cleanup` once when the connection for `endpoint` is torn down.
    pub fn on_cleanup(&self, endpoint: EndpointKey, cleanup: impl FnOnce() + Send + 'static) {
        self.cleanups
            .lock()
            .entry(endpoint)
            .or_default()
            .push(Box::new(cleanup));
    }

    /// Wait for a permission decision for `endpoint`.
    ///
    /// Resolves with the value passed to [`resolve_permission`](Self::resolve_permission),
    /// or fails with `ConnectionCleanedUp` if the endpoint's connection is
    /// torn down first.
    pub fn await_permission(
        &self,
        endpoint: EndpointKey,
    ) -> impl std::future::Future<Output = Result<Value>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        self.permission_listeners
            .lock()
            .entry(endpoint)
            .or_default()
            .push(tx);

        async move {
            rx.await
                .unwrap_or(Err(MessengerError::ConnectionCleanedUp { endpoint }))
        }
    }

    /// Settle every permission listener for `endpoint`. Returns how many
    /// were waiting.
    pub fn resolve_permission(&self, endpoint: &EndpointKey, value: Value) -> usize {
        let listeners = self
            .permission_listeners
            .lock()
            .remove(endpoint)
            .unwrap_or_default();
        let count = listeners.len();
        for listener in listeners {
            let _ = listener.send(Ok(value.clone()));
        }
        count
    }
}
