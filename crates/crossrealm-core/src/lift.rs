//! Typed stubs for calling handlers in other realms.
//!
//! `lift_request` registers a handler in the realm that runs it and returns
//! a [`RequestStub`] any realm can use to call it. Calling a stub always
//! goes through the full envelope round trip, even when the handler lives
//! in the caller's own realm, so a call behaves the same wherever it
//! originates.
//!
//! ```rust,ignore
//! let echo = realm.lift_request("ECHO", |_ctx, (value,): (i64,)| async move { Ok(value) });
//! let answer: i64 = echo.call(&channel, (42,)).await?;
//! ```

use crate::channel::ChannelHandle;
use crate::correlator::PendingGuard;
use crate::envelope::{CallEnvelope, CallType, CorrelationId, Message, Meta};
use crate::realm::{EndpointKey, Realm};
use crate::registry::{encode_args, CallContext, Invocation, TypedHandler};
use crate::{MessengerError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;

impl Realm {
    /// Register `func` as the request handler for `call_type` and return a
    /// stub for calling it.
    pub fn lift_request<A, R, F, Fut>(&self, call_type: impl Into<CallType>, func: F) -> RequestStub<A, R>
    where
        F: Fn(CallContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        A: Serialize + DeserializeOwned + Send + 'static,
        R: Serialize + DeserializeOwned + Send + 'static,
    {
        let call_type = call_type.into();
        let handler = TypedHandler::new(call_type.clone(), func);
        self.inner
            .registry
            .register(call_type.clone(), Arc::new(handler), Invocation::Request);
        self.stub(call_type)
    }

    /// Register `func` as the notification handler for `call_type` and return
    /// a stub for sending it.
    pub fn lift_notification<A, F, Fut>(&self, call_type: impl Into<CallType>, func: F) -> NotificationStub<A>
    where
        F: Fn(CallContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
        A: Serialize + DeserializeOwned + Send + 'static,
    {
        let call_type = call_type.into();
        let handler = TypedHandler::new(call_type.clone(), func);
        self.inner
            .registry
            .register(call_type.clone(), Arc::new(handler), Invocation::Notification);
        self.notification_stub(call_type)
    }

    /// Stub for a request handled in another realm.
    pub fn stub<A, R>(&self, call_type: impl Into<CallType>) -> RequestStub<A, R> {
        RequestStub {
            realm: self.clone(),
            call_type: call_type.into(),
            _marker: PhantomData,
        }
    }

    /// Stub for a notification handled in another realm.
    pub fn notification_stub<A>(&self, call_type: impl Into<CallType>) -> NotificationStub<A> {
        NotificationStub {
            realm: self.clone(),
            call_type: call_type.into(),
            _marker: PhantomData,
        }
    }
}

/// Calls a request handler across a channel and awaits its result.
pub struct RequestStub<A, R> {
    realm: Realm,
    call_type: CallType,
    _marker: PhantomData<fn(A) -> R>,
}

impl<A, R> Clone for RequestStub<A, R> {
    fn clone(&self) -> Self {
        Self {
            realm: self.realm.clone(),
            call_type: self.call_type.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A, R> RequestStub<A, R>
where
    A: Serialize,
    R: DeserializeOwned,
{
    pub fn call_type(&self) -> &CallType {
        &self.call_type
    }

    /// Call the handler on the far side of `channel`.
    ///
    /// Resolves with the handler's result, fails with
    /// [`MessengerError::Remote`] if the handler failed, or with
    /// [`MessengerError::Disconnected`] if the channel closes first. There is
    /// no built-in timeout; race the future against a timer if one is needed.
    pub async fn call(&self, channel: &ChannelHandle, args: A) -> Result<R> {
        let payload = encode_args(&args).map_err(|e| MessengerError::InvalidArguments {
            call_type: self.call_type.to_string(),
            message: e.to_string(),
        })?;

        let correlator = self.realm.correlator();
        let (correlation_id, reply) = correlator.begin(channel.id())?;
        let _guard = PendingGuard::new(correlator, channel.id(), correlation_id.clone());

        let envelope = Message::Call(CallEnvelope {
            call_type: self.call_type.clone(),
            payload,
            meta: Meta::new(correlation_id.clone(), channel.remote(), self.realm.kind()),
        });
        channel.send(&envelope)?;
        debug!(
            call_type = %self.call_type,
            correlation_id = %correlation_id,
            channel = %channel.id(),
            "sent request"
        );

        let value = reply
            .await
            .map_err(|_| MessengerError::Disconnected { channel: channel.id() })??;
        Ok(serde_json::from_value(value)?)
    }

    /// Call the handler in the realm connected as `endpoint`.
    pub async fn call_endpoint(&self, endpoint: &EndpointKey, args: A) -> Result<R> {
        let channel = self
            .realm
            .connections()
            .channel(endpoint)
            .ok_or(MessengerError::NoChannel { endpoint: *endpoint })?;
        self.call(&channel, args).await
    }
}

/// Sends a notification: no reply is awaited and handler failures are never
/// reported back.
pub struct NotificationStub<A> {
    realm: Realm,
    call_type: CallType,
    _marker: PhantomData<fn(A)>,
}

impl<A> Clone for NotificationStub<A> {
    fn clone(&self) -> Self {
        Self {
            realm: self.realm.clone(),
            call_type: self.call_type.clone(),
            _marker: PhantomData,
        }
    }
}

impl<A: Serialize> NotificationStub<A> {
    pub fn call_type(&self) -> &CallType {
        &self.call_type
    }

    /// Send the notification over `channel`. Returns as soon as it is queued.
    pub fn notify(&self, channel: &ChannelHandle, args: A) -> Result<()> {
        let payload = encode_args(&args).map_err(|e| MessengerError::InvalidArguments {
            call_type: self.call_type.to_string(),
            message: e.to_string(),
        })?;

        let envelope = Message::Call(CallEnvelope {
            call_type: self.call_type.clone(),
            payload,
            meta: Meta::new(CorrelationId::generate(), channel.remote(), self.realm.kind()),
        });
        channel.send(&envelope)
    }

    /// Send the notification to the realm connected as `endpoint`.
    pub fn notify_endpoint(&self, endpoint: &EndpointKey, args: A) -> Result<()> {
        let channel = self
            .realm
            .connections()
            .channel(endpoint)
            .ok_or(MessengerError::NoChannel { endpoint: *endpoint })?;
        self.notify(&channel, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::memory;
    use crate::realm::SenderDescriptor;
    use serde_json::json;

    fn realm() -> Realm {
        Realm::builder(SenderDescriptor::controller("ext")).build()
    }

    #[tokio::test]
    async fn test_call_sends_envelope_and_awaits_reply() {
        let realm = realm();
        let stub: RequestStub<(i64,), i64> = realm.stub("ECHO");
        let (local, mut remote) = memory::pair(
            "crossrealm",
            SenderDescriptor::controller("ext"),
            SenderDescriptor::page("ext", 2, 0),
        );

        let call = tokio::spawn({
            let stub = stub.clone();
            let channel = local.handle.clone();
            async move { stub.call(&channel, (5,)).await }
        });

        let sent = remote.inbound.recv().await.unwrap();
        assert_eq!(sent["type"], "ECHO");
        assert_eq!(sent["payload"], json!([5]));
        assert_eq!(sent["meta"]["targetTab"], 2);
        assert_eq!(sent["meta"]["sourceRealm"], "controller");

        // No event loop runs here, so settle the reply by hand.
        let id = CorrelationId::from(sent["meta"]["correlationId"].as_str().unwrap().to_string());
        realm.correlator().settle(
            local.handle.id(),
            crate::envelope::ReplyEnvelope {
                call_type: CallType::from_static("ECHO"),
                correlation_id: id,
                outcome: crate::envelope::ReplyOutcome::Fulfilled(json!(5)),
            },
        );
        assert_eq!(call.await.unwrap().unwrap(), 5);
        assert_eq!(realm.correlator().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_call_on_closed_channel_leaves_nothing_pending() {
        let realm = realm();
        let stub: RequestStub<(), serde_json::Value> = realm.stub("PING");
        let (local, _remote) = memory::pair(
            "crossrealm",
            SenderDescriptor::controller("ext"),
            SenderDescriptor::page("ext", 2, 0),
        );
        local.handle.close();

        let result = stub.call(&local.handle, ()).await;
        assert!(matches!(result, Err(MessengerError::ChannelClosed { .. })));
        assert_eq!(realm.correlator().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_call_endpoint_without_channel() {
        let realm = realm();
        let stub: RequestStub<(), serde_json::Value> = realm.stub("PING");
        let endpoint = SenderDescriptor::page("ext", 9, 0).endpoint_key();

        let result = stub.call_endpoint(&endpoint, ()).await;
        assert!(matches!(result, Err(MessengerError::NoChannel { .. })));
    }

    #[tokio::test]
    async fn test_notify_returns_immediately_without_bookkeeping() {
        let realm = realm();
        let stub: NotificationStub<(String,)> = realm.notification_stub("LOG");
        let (local, mut remote) = memory::pair(
            "crossrealm",
            SenderDescriptor::controller("ext"),
            SenderDescriptor::page("ext", 2, 0),
        );

        stub.notify(&local.handle, ("hello".to_string(),)).unwrap();
        assert_eq!(realm.correlator().pending_count(), 0);

        let sent = remote.inbound.recv().await.unwrap();
        assert_eq!(sent["type"], "LOG");
        assert_eq!(sent["payload"], json!(["hello"]));
    }

    #[test]
    fn test_lift_registers_handler() {
        let realm = realm();
        let _ping = realm.lift_request("PING", |_ctx, (): ()| async move {
            Ok::<_, anyhow::Error>(json!({"ok": true}))
        });
        let _log = realm.lift_notification("LOG", |_ctx, (_line,): (String,)| async move {
            Ok::<_, anyhow::Error>(())
        });

        let ping = realm.registry().lookup(&CallType::from_static("PING")).unwrap();
        assert_eq!(ping.invocation, Invocation::Request);
        let log = realm.registry().lookup(&CallType::from_static("LOG")).unwrap();
        assert_eq!(log.invocation, Invocation::Notification);
    }
}
