//! Built-in handlers served by the controller realm.

use crossrealm_core::{CallContext, CallType, Realm};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

pub const PING: CallType = CallType::from_static("PING");
pub const ECHO: CallType = CallType::from_static("ECHO");
pub const GET_DIAGNOSTICS: CallType = CallType::from_static("GET_DIAGNOSTICS");
pub const LOG: CallType = CallType::from_static("LOG");

/// Register every built-in handler in `realm`.
pub fn register(realm: &Realm) {
    realm.lift_request(PING, |_ctx, (): ()| async move {
        Ok::<_, anyhow::Error>(json!({"ok": true}))
    });

    realm.lift_request(ECHO, |_ctx, (value,): (Value,)| async move {
        Ok::<_, anyhow::Error>(value)
    });

    // The realm outlives every connection; the handler keeps it alive for
    // the life of the process.
    let diagnostics_realm = realm.clone();
    realm.lift_request(GET_DIAGNOSTICS, move |_ctx, (): ()| {
        let diagnostics = diagnostics_realm.diagnostics();
        async move { Ok::<_, anyhow::Error>(diagnostics) }
    });

    realm.lift_notification(LOG, |ctx: CallContext, (level, message): (String, String)| async move {
        let endpoint = ctx.sender.endpoint_key();
        match level.as_str() {
            "debug" => debug!(%endpoint, "{}", message),
            "info" => info!(%endpoint, "{}", message),
            "warn" => warn!(%endpoint, "{}", message),
            "error" => error!(%endpoint, "{}", message),
            other => anyhow::bail!("unknown log level '{}'", other),
        }
        Ok(())
    });
}
