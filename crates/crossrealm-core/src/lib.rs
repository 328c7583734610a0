//! Crossrealm Core - RPC between isolated realms over ordered message channels.
//!
//! Each realm (a privileged controller, per-page script realms, panel UIs)
//! registers handlers under string call types and calls handlers in other
//! realms through typed stubs. The library takes care of envelope
//! construction, sender authentication, reply correlation, error transport
//! and connection teardown.
//!
//! # Example
//!
//! ```rust,ignore
//! use crossrealm_core::{memory, MessagingConfig, Realm, RealmKind, SenderDescriptor, TrustPolicy};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> crossrealm_core::Result<()> {
//!     let controller = Realm::builder(SenderDescriptor::controller("ext"))
//!         .trust_policy(TrustPolicy::new("ext").allow(RealmKind::Page))
//!         .build();
//!     let page = Realm::builder(SenderDescriptor::page("ext", 1, 0)).build();
//!
//!     controller.lift_request("PING", |_ctx, (): ()| async move { Ok(json!({"ok": true})) });
//!     let ping = page.stub::<(), serde_json::Value>("PING");
//!
//!     let (server, client) = memory::pair(
//!         MessagingConfig::DEFAULT_PURPOSE,
//!         controller.descriptor().clone(),
//!         page.descriptor().clone(),
//!     );
//!     controller.accept(server)?;
//!     let channel = page.connect(client).await?;
//!
//!     println!("{}", ping.call(&channel, ()).await?);
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod envelope;
pub mod error;
pub mod lift;
pub mod realm;
pub mod registry;

mod dispatch;

// Re-export commonly used types
pub use auth::{SenderPolicy, TrustPolicy};
pub use channel::{memory, tcp, ChannelHandle, ChannelId, Inbound, Port};
pub use codec::{ErrorCategory, RemoteError, SerializedError};
pub use config::{MessagingConfig, TransportConfig};
pub use connection::{ConnectionHooks, ConnectionManager, NoopHooks};
pub use envelope::{
    CallEnvelope, CallType, CorrelationId, Message, Meta, ReplyEnvelope, ReplyOutcome,
};
pub use error::{MessengerError, Result};
pub use lift::{NotificationStub, RequestStub};
pub use realm::{
    Diagnostics, EndpointKey, FrameId, Realm, RealmBuilder, RealmKind, SenderDescriptor, TabId,
};
pub use registry::{CallContext, Handler, HandlerEntry, HandlerRegistry, Invocation, TypedHandler};
