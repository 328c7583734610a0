//! Sender authentication.
//!
//! Every inbound call is checked against the realm's [`SenderPolicy`] before
//! the handler registry is consulted. Calls from untrusted senders are dropped
//! without a reply: answering, even with an error, would reveal which call
//! types the realm serves.

use crate::envelope::CallType;
use crate::realm::{RealmKind, SenderDescriptor};
use std::collections::HashSet;
use tracing::debug;

/// Decides whether a sender may call into this realm.
pub trait SenderPolicy: Send + Sync + 'static {
    fn is_trusted_sender(&self, sender: &SenderDescriptor) -> bool;
}

impl<F> SenderPolicy for F
where
    F: Fn(&SenderDescriptor) -> bool + Send + Sync + 'static,
{
    fn is_trusted_sender(&self, sender: &SenderDescriptor) -> bool {
        (self)(sender)
    }
}

/// Default policy: same extension identity, and either the privileged
/// controller realm or one of the explicitly allowed realm kinds.
#[derive(Debug, Clone)]
pub struct TrustPolicy {
    extension_id: String,
    allowed: HashSet<RealmKind>,
    top_frame_only: bool,
}

impl TrustPolicy {
    /// Trust only the controller realm of `extension_id`.
    pub fn new(extension_id: impl Into<String>) -> Self {
        Self {
            extension_id: extension_id.into(),
            allowed: HashSet::new(),
            top_frame_only: false,
        }
    }

    /// Also trust realms of this kind.
    pub fn allow(mut self, kind: RealmKind) -> Self {
        self.allowed.insert(kind);
        self
    }

    /// Reject non-controller senders that are not the top frame of their tab.
    pub fn top_frame_only(mut self, enable: bool) -> Self {
        self.top_frame_only = enable;
        self
    }

    pub fn extension_id(&self) -> &str {
        &self.extension_id
    }
}

impl SenderPolicy for TrustPolicy {
    fn is_trusted_sender(&self, sender: &SenderDescriptor) -> bool {
        if sender.extension_id != self.extension_id {
            return false;
        }
        if sender.kind == RealmKind::Controller {
            return true;
        }
        if !self.allowed.contains(&sender.kind) {
            return false;
        }
        !(self.top_frame_only && sender.frame_id.unwrap_or(0) != 0)
    }
}

/// Check a sender before dispatching `call_type`, logging rejections.
pub(crate) fn authenticate(
    policy: &dyn SenderPolicy,
    sender: &SenderDescriptor,
    call_type: &CallType,
) -> bool {
    let trusted = policy.is_trusted_sender(sender);
    if !trusted {
        debug!(
            call_type = %call_type,
            extension_id = %sender.extension_id,
            kind = ?sender.kind,
            tab_id = ?sender.tab_id,
            frame_id = ?sender.frame_id,
            "dropping call from untrusted sender"
        );
    }
    trusted
}
