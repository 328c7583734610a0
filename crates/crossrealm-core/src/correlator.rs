//! Matching replies to outstanding calls.
//!
//! Each outbound request parks a oneshot sender keyed by `(channel,
//! correlation id)`. Whatever settles the call (a reply, or the channel
//! closing) removes the entry first, so a call settles exactly once and any
//! later reply for the same id finds nothing and is ignored.
//!
//! ```text
//!          begin()                    settle() / disconnect()
//! caller ──────────▶ pending map ──────────────────────────▶ oneshot ──▶ caller
//!                    (channel, id)      entry removed here
//! ```

use crate::channel::ChannelId;
use crate::codec;
use crate::envelope::{CorrelationId, ReplyEnvelope, ReplyOutcome};
use crate::{MessengerError, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};

type Settle = oneshot::Sender<Result<Value>>;

/// Outstanding calls for one realm.
pub struct Correlator {
    pending: Mutex<HashMap<(ChannelId, CorrelationId), Settle>>,
    max_pending: usize,
}

impl Correlator {
    pub fn new(max_pending: usize) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            max_pending,
        }
    }

    /// Register a new call on `channel` and return its id and the receiver
    /// that will be settled.
    pub fn begin(&self, channel: ChannelId) -> Result<(CorrelationId, oneshot::Receiver<Result<Value>>)> {
        let mut pending = self.pending.lock();
        if pending.len() >= self.max_pending {
            warn!(
                pending = pending.len(),
                max_pending = self.max_pending,
                "too many pending calls; refusing new call"
            );
            return Err(MessengerError::TooManyPending {
                pending: pending.len(),
            });
        }

        let mut correlation_id = CorrelationId::generate();
        while pending.contains_key(&(channel, correlation_id.clone())) {
            correlation_id = CorrelationId::generate();
        }

        let (tx, rx) = oneshot::channel();
        pending.insert((channel, correlation_id.clone()), tx);
        Ok((correlation_id, rx))
    }

    /// Drop a pending call without settling it (the caller gave up or the
    /// send failed).
    pub fn forget(&self, channel: ChannelId, correlation_id: &CorrelationId) {
        self.pending.lock().remove(&(channel, correlation_id.clone()));
    }

    /// Settle the call a reply belongs to. Returns `false` if the call was
    /// unknown or already settled.
    pub fn settle(&self, channel: ChannelId, reply: ReplyEnvelope) -> bool {
        let waiter = self
            .pending
            .lock()
            .remove(&(channel, reply.correlation_id.clone()));

        let Some(waiter) = waiter else {
            debug!(
                call_type = %reply.call_type,
                correlation_id = %reply.correlation_id,
                %channel,
                "ignoring reply for unknown or settled call"
            );
            return false;
        };

        let result = match reply.outcome {
            ReplyOutcome::Fulfilled(value) => Ok(value),
            ReplyOutcome::Rejected(error) => Err(MessengerError::Remote(codec::decode(&error))),
        };
        if waiter.send(result).is_err() {
            debug!(
                call_type = %reply.call_type,
                correlation_id = %reply.correlation_id,
                "caller stopped waiting before the reply arrived"
            );
        }
        true
    }

    /// Reject every call still pending on `channel`. Returns how many.
    pub fn disconnect(&self, channel: ChannelId) -> usize {
        let waiters: Vec<Settle> = {
            let mut pending = self.pending.lock();
            let keys: Vec<(ChannelId, CorrelationId)> = pending
                .keys()
                .filter(|(id, _)| *id == channel)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| pending.remove(&key))
                .collect()
        };

        let count = waiters.len();
        for waiter in waiters {
            let _ = waiter.send(Err(MessengerError::Disconnected { channel }));
        }
        if count > 0 {
            debug!(%channel, count, "rejected pending calls on disconnect");
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn pending_on(&self, channel: ChannelId) -> usize {
        self.pending
            .lock()
            .keys()
            .filter(|(id, _)| *id == channel)
            .count()
    }
}

/// Forgets a pending call if the caller's future is dropped before it
/// settles. A no-op once the entry has been settled.
pub(crate) struct PendingGuard<'a> {
    correlator: &'a Correlator,
    channel: ChannelId,
    correlation_id: CorrelationId,
}

impl<'a> PendingGuard<'a> {
    pub(crate) fn new(correlator: &'a Correlator, channel: ChannelId, correlation_id: CorrelationId) -> Self {
        Self {
            correlator,
            channel,
            correlation_id,
        }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.correlator.forget(self.channel, &self.correlation_id);
    }
}
