//! Per-channel event loop.
//!
//! One task per open channel reads envelopes in arrival order and routes
//! them: calls go through sender authentication and the handler registry,
//! replies go to the correlator, the acknowledgement completes a pending
//! [`Realm::connect`]. Handlers run on their own tasks, so a slow handler
//! never holds up later envelopes on the same channel. The number of such
//! tasks per realm is capped; a request over the cap is rejected at once.
//!
//! Replies read after the channel is marked closed are discarded.
//!
//! When the inbound stream ends, the channel is torn down in a fixed order:
//! the channel is marked closed, its connections are removed and cleaned up,
//! and then every call still pending on it is rejected.

use crate::auth::authenticate;
use crate::channel::{ChannelHandle, Inbound};
use crate::codec;
use crate::envelope::{CallEnvelope, Message, ReplyEnvelope, ReplyOutcome};
use crate::realm::Realm;
use crate::registry::{CallContext, Invocation};
use crate::MessengerError;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tokio::sync::oneshot;
use tracing::{debug, warn};

pub(crate) async fn run_channel(
    realm: Realm,
    channel: ChannelHandle,
    mut inbound: Inbound,
    mut handshake: Option<oneshot::Sender<()>>,
) {
    debug!(channel = %channel.id(), name = %channel.name(), remote = %channel.remote().endpoint_key(), "channel event loop started");

    while let Some(value) = inbound.recv().await {
        let message = match Message::from_value(value) {
            Ok(message) => message,
            Err(e) => {
                warn!(channel = %channel.id(), "dropping malformed envelope: {}", e);
                continue;
            }
        };

        match message {
            Message::Call(call) => dispatch_call(&realm, &channel, call),
            Message::Reply(reply) if channel.is_closed() => {
                // Teardown rejects the call with the disconnect error instead.
                debug!(
                    channel = %channel.id(),
                    call_type = %reply.call_type,
                    correlation_id = %reply.correlation_id,
                    "ignoring reply received after close"
                );
            }
            Message::Reply(reply) => {
                realm.correlator().settle(channel.id(), reply);
            }
            Message::Ack => match handshake.take() {
                Some(ack) => {
                    let _ = ack.send(());
                }
                None => debug!(channel = %channel.id(), "ignoring unexpected acknowledgement"),
            },
        }
    }

    channel.close();
    let endpoints = realm.connections().on_close(&channel);
    let rejected = realm.correlator().disconnect(channel.id());
    debug!(
        channel = %channel.id(),
        endpoints = endpoints.len(),
        rejected,
        "channel event loop finished"
    );
}

fn dispatch_call(realm: &Realm, channel: &ChannelHandle, call: CallEnvelope) {
    let sender = channel.remote().clone();
    if !authenticate(realm.policy(), &sender, &call.call_type) {
        return;
    }

    let Some(entry) = realm.registry().lookup(&call.call_type) else {
        warn!(
            call_type = %call.call_type,
            correlation_id = %call.meta.correlation_id,
            channel = %channel.id(),
            "no handler registered; dropping call"
        );
        return;
    };

    let CallEnvelope {
        call_type,
        payload,
        meta,
    } = call;
    let correlation_id = meta.correlation_id.clone();

    let Ok(permit) = realm.inbound_permits().clone().try_acquire_owned() else {
        let refusal = MessengerError::TooManyInbound {
            call_type: call_type.to_string(),
            in_flight: realm.max_inbound(),
        };
        warn!(call_type = %call_type, correlation_id = %correlation_id, channel = %channel.id(), "{}", refusal);
        if entry.invocation == Invocation::Request {
            let reply = Message::Reply(ReplyEnvelope {
                call_type,
                correlation_id,
                outcome: ReplyOutcome::Rejected(codec::encode(&refusal).into_value()),
            });
            if let Err(e) = channel.send(&reply) {
                debug!(channel = %channel.id(), "could not deliver refusal: {}", e);
            }
        }
        return;
    };
    let ctx = CallContext {
        sender,
        channel: channel.clone(),
        meta,
    };
    let channel = channel.clone();

    tokio::spawn(async move {
        let _permit = permit;
        let outcome = AssertUnwindSafe(entry.handler.call(ctx, payload))
            .catch_unwind()
            .await;

        match entry.invocation {
            Invocation::Request => {
                let outcome = match outcome {
                    Ok(Ok(value)) => ReplyOutcome::Fulfilled(value),
                    Ok(Err(e)) => {
                        debug!(call_type = %call_type, correlation_id = %correlation_id, "handler failed: {:#}", e);
                        ReplyOutcome::Rejected(codec::encode_anyhow(&e).into_value())
                    }
                    Err(panic) => {
                        warn!(call_type = %call_type, correlation_id = %correlation_id, "handler panicked");
                        ReplyOutcome::Rejected(codec::encode_panic(panic.as_ref()).into_value())
                    }
                };
                let reply = Message::Reply(ReplyEnvelope {
                    call_type: call_type.clone(),
                    correlation_id: correlation_id.clone(),
                    outcome,
                });
                if let Err(e) = channel.send(&reply) {
                    debug!(
                        call_type = %call_type,
                        correlation_id = %correlation_id,
                        "could not deliver reply: {}",
                        e
                    );
                }
            }
            Invocation::Notification => match outcome {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    warn!(call_type = %call_type, correlation_id = %correlation_id, "notification handler failed: {:#}", e);
                }
                Err(_) => {
                    warn!(call_type = %call_type, correlation_id = %correlation_id, "notification handler panicked");
                }
            },
        }
    });
}
