//! Realm identity and the per-realm messaging state.
//!
//! A [`Realm`] owns everything one isolated execution context needs to take
//! part in cross-realm calls: its handler registry, the policy deciding who
//! may call in, the connection manager and the pending-call correlator. It
//! is an explicit value rather than process-wide state, so several realms
//! can live side by side in one process (and in one test).

use crate::auth::{SenderPolicy, TrustPolicy};
use crate::channel::{ChannelHandle, Port};
use crate::config::MessagingConfig;
use crate::connection::{ConnectionHooks, ConnectionManager, NoopHooks};
use crate::correlator::Correlator;
use crate::dispatch;
use crate::envelope::CallType;
use crate::registry::{Handler, HandlerRegistry, Invocation};
use crate::{MessengerError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, info};

pub type TabId = u32;
pub type FrameId = u32;

/// The kinds of isolated realm taking part in messaging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RealmKind {
    /// The long-lived privileged realm.
    Controller,
    /// A script realm attached to one page frame.
    Page,
    /// A panel or other UI realm.
    Panel,
}

impl std::fmt::Display for RealmKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RealmKind::Controller => "controller",
            RealmKind::Page => "page",
            RealmKind::Panel => "panel",
        };
        write!(f, "{}", name)
    }
}

/// What a receiver knows about the realm on the far side of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderDescriptor {
    pub extension_id: String,
    pub kind: RealmKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<TabId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<FrameId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl SenderDescriptor {
    pub fn controller(extension_id: impl Into<String>) -> Self {
        Self {
            extension_id: extension_id.into(),
            kind: RealmKind::Controller,
            tab_id: None,
            frame_id: None,
            url: None,
        }
    }

    pub fn page(extension_id: impl Into<String>, tab_id: TabId, frame_id: FrameId) -> Self {
        Self {
            extension_id: extension_id.into(),
            kind: RealmKind::Page,
            tab_id: Some(tab_id),
            frame_id: Some(frame_id),
            url: None,
        }
    }

    pub fn panel(extension_id: impl Into<String>, tab_id: TabId) -> Self {
        Self {
            extension_id: extension_id.into(),
            kind: RealmKind::Panel,
            tab_id: Some(tab_id),
            frame_id: None,
            url: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Key the connection manager files this realm's channel under.
    pub fn endpoint_key(&self) -> EndpointKey {
        EndpointKey::new(self.kind, self.tab_id, self.frame_id)
    }
}

/// Identity of a remote endpoint: at most one live connection exists per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointKey {
    pub kind: RealmKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<TabId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_id: Option<FrameId>,
}

impl EndpointKey {
    pub fn new(kind: RealmKind, tab_id: Option<TabId>, frame_id: Option<FrameId>) -> Self {
        Self {
            kind,
            tab_id,
            frame_id,
        }
    }
}

impl std::fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(tab) = self.tab_id {
            write!(f, " tab {}", tab)?;
        }
        if let Some(frame) = self.frame_id {
            write!(f, " frame {}", frame)?;
        }
        Ok(())
    }
}

/// Point-in-time view of a realm's messaging state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub realm: RealmKind,
    pub extension_id: String,
    pub opened_connections: usize,
    pub live_endpoints: Vec<EndpointKey>,
    pub pending_calls: usize,
    pub call_types: Vec<CallType>,
}

pub(crate) struct RealmInner {
    pub(crate) descriptor: SenderDescriptor,
    pub(crate) registry: HandlerRegistry,
    pub(crate) policy: Arc<dyn SenderPolicy>,
    pub(crate) connections: ConnectionManager,
    pub(crate) correlator: Correlator,
    pub(crate) inbound: Arc<Semaphore>,
    max_inbound: usize,
    handshake_timeout: Duration,
}

/// One realm's messaging state. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Realm {
    pub(crate) inner: Arc<RealmInner>,
}

impl Realm {
    /// Start configuring a realm described by `descriptor`.
    pub fn builder(descriptor: SenderDescriptor) -> RealmBuilder {
        RealmBuilder::new(descriptor)
    }

    pub fn descriptor(&self) -> &SenderDescriptor {
        &self.inner.descriptor
    }

    pub fn kind(&self) -> RealmKind {
        self.inner.descriptor.kind
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.inner.connections
    }

    pub(crate) fn correlator(&self) -> &Correlator {
        &self.inner.correlator
    }

    pub(crate) fn policy(&self) -> &dyn SenderPolicy {
        self.inner.policy.as_ref()
    }

    /// Permits for handlers running on behalf of other realms.
    pub(crate) fn inbound_permits(&self) -> &Arc<Semaphore> {
        &self.inner.inbound
    }

    pub(crate) fn max_inbound(&self) -> usize {
        self.inner.max_inbound
    }

    /// Register an untyped handler. Returns `false` if `call_type` was
    /// already taken (the first registration is kept).
    pub fn register(
        &self,
        call_type: impl Into<CallType>,
        handler: Arc<dyn Handler>,
        invocation: Invocation,
    ) -> bool {
        self.inner.registry.register(call_type.into(), handler, invocation)
    }

    /// Accept a channel opened by another realm.
    ///
    /// Validates the declared purpose and the sender, acknowledges the
    /// channel, registers it under the sender's endpoint key and starts its
    /// event loop. A refused channel is closed.
    pub fn accept(&self, port: Port) -> Result<ChannelHandle> {
        let Port { handle, inbound } = port;
        match self.inner.connections.on_connect(&handle, self.policy()) {
            Ok(_) => {
                tokio::spawn(dispatch::run_channel(self.clone(), handle.clone(), inbound, None));
                Ok(handle)
            }
            Err(e) => {
                handle.close();
                Err(e)
            }
        }
    }

    /// Open a channel to another realm and wait for its acknowledgement.
    pub async fn connect(&self, port: Port) -> Result<ChannelHandle> {
        let Port { handle, inbound } = port;
        let (ack_tx, ack_rx) = oneshot::channel();
        tokio::spawn(dispatch::run_channel(
            self.clone(),
            handle.clone(),
            inbound,
            Some(ack_tx),
        ));

        let timeout = self.inner.handshake_timeout;
        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                return Err(MessengerError::ConnectionRefused {
                    reason: "channel closed before acknowledgement".to_string(),
                });
            }
            Err(_) => {
                debug!(channel = %handle.id(), "no acknowledgement within {:?}", timeout);
                handle.close();
                return Err(MessengerError::HandshakeTimeout(timeout));
            }
        }

        let endpoint = handle.remote().endpoint_key();
        self.inner.connections.register(endpoint, handle.clone());
        if handle.is_closed() {
            // The event loop may have torn down before the entry existed.
            self.inner.connections.on_close(&handle);
            return Err(MessengerError::ChannelClosed { channel: handle.id() });
        }

        info!(channel = %handle.id(), %endpoint, "connected");
        Ok(handle)
    }

    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            realm: self.kind(),
            extension_id: self.inner.descriptor.extension_id.clone(),
            opened_connections: self.inner.connections.opened_count(),
            live_endpoints: self.inner.connections.endpoints(),
            pending_calls: self.inner.correlator.pending_count(),
            call_types: self.inner.registry.call_types(),
        }
    }
}

impl std::fmt::Debug for Realm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Realm")
            .field("descriptor", &self.inner.descriptor)
            .field("handlers", &self.inner.registry.len())
            .finish_non_exhaustive()
    }
}

/// Builder for a [`Realm`].
///
/// # Example
///
/// ```rust,ignore
/// use crossrealm_core::{Realm, RealmKind, SenderDescriptor, TrustPolicy};
///
/// let realm = Realm::builder(SenderDescriptor::controller("my-extension"))
///     .trust_policy(TrustPolicy::new("my-extension").allow(RealmKind::Page))
///     .build();
/// ```
pub struct RealmBuilder {
    descriptor: SenderDescriptor,
    policy: Option<Arc<dyn SenderPolicy>>,
    hooks: Arc<dyn ConnectionHooks>,
    purpose: String,
    max_pending: usize,
    max_inbound: usize,
    handshake_timeout: Duration,
}

impl RealmBuilder {
    pub fn new(descriptor: SenderDescriptor) -> Self {
        Self {
            descriptor,
            policy: None,
            hooks: Arc::new(NoopHooks),
            purpose: MessagingConfig::DEFAULT_PURPOSE.to_string(),
            max_pending: MessagingConfig::MAX_PENDING_CALLS,
            max_inbound: MessagingConfig::MAX_INBOUND_CALLS,
            handshake_timeout: MessagingConfig::HANDSHAKE_TIMEOUT,
        }
    }

    /// Who may call into this realm.
    ///
    /// Default: only the controller realm of the same extension.
    pub fn trust_policy(mut self, policy: impl SenderPolicy) -> Self {
        self.policy = Some(Arc::new(policy));
        self
    }

    /// Realm-specific reaction to an endpoint's connection going away.
    pub fn connection_hooks(mut self, hooks: impl ConnectionHooks) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Channel purpose accepted by [`Realm::accept`].
    ///
    /// Default: [`MessagingConfig::DEFAULT_PURPOSE`]
    pub fn purpose(mut self, purpose: impl Into<String>) -> Self {
        self.purpose = purpose.into();
        self
    }

    /// Cap on calls awaiting a reply across all channels.
    ///
    /// Default: [`MessagingConfig::MAX_PENDING_CALLS`]
    pub fn max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    /// Cap on handlers running at once for calls from other realms. Requests
    /// over the cap are rejected; notifications over the cap are dropped.
    ///
    /// Default: [`MessagingConfig::MAX_INBOUND_CALLS`]
    pub fn max_inbound(mut self, max_inbound: usize) -> Self {
        self.max_inbound = max_inbound;
        self
    }

    /// How long [`Realm::connect`] waits for the acknowledgement.
    ///
    /// Default: [`MessagingConfig::HANDSHAKE_TIMEOUT`]
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn build(self) -> Realm {
        let policy = self
            .policy
            .unwrap_or_else(|| Arc::new(TrustPolicy::new(self.descriptor.extension_id.clone())));

        debug!(
            kind = %self.descriptor.kind,
            extension_id = %self.descriptor.extension_id,
            purpose = %self.purpose,
            "realm initialized"
        );

        Realm {
            inner: Arc::new(RealmInner {
                registry: HandlerRegistry::new(),
                policy,
                connections: ConnectionManager::new(self.purpose, self.hooks),
                correlator: Correlator::new(self.max_pending),
                inbound: Arc::new(Semaphore::new(self.max_inbound.min(Semaphore::MAX_PERMITS))),
                max_inbound: self.max_inbound,
                handshake_timeout: self.handshake_timeout,
                descriptor: self.descriptor,
            }),
        }
    }
}
