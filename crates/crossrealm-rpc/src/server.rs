//! Realm TCP listener and HTTP diagnostics server.
//!
//! Other realms reach the controller over local TCP: each accepted stream
//! becomes a framed channel (see `crossrealm_core::tcp`) handed to
//! [`Realm::accept`]. The realm's connection manager is the only record of
//! open channels; the listener reads its live count to enforce the
//! connection cap and asks it to close everything on shutdown.
//!
//! A small HTTP server next to it exposes `/health` and `/diagnostics` for
//! the parent process.

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use crossrealm_core::{tcp, ChannelHandle, MessengerError, Realm, RealmKind, TransportConfig};
use serde_json::json;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Maximum concurrent HTTP requests.
const MAX_HTTP_CONCURRENCY: usize = 64;

/// A running realm listener. Dropping it stops the listener and closes
/// every channel the realm holds.
pub struct RealmListener {
    addr: SocketAddr,
    realm: Realm,
    stop_tx: Option<oneshot::Sender<()>>,
    accept_task: Option<JoinHandle<()>>,
}

impl RealmListener {
    /// Listen on `host:port` (port 0 picks a free port).
    pub async fn bind(realm: Realm, host: &str, port: u16) -> anyhow::Result<Self> {
        let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;

        info!("Realm listener on {}", addr);

        let (stop_tx, stop_rx) = oneshot::channel();
        let accept_task = tokio::spawn(accept_channels(listener, realm.clone(), stop_rx));

        Ok(Self {
            addr,
            realm,
            stop_tx: Some(stop_tx),
            accept_task: Some(accept_task),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting and close every open channel. Returns how many
    /// channels were closed; a second call closes nothing.
    pub fn shutdown(&mut self) -> usize {
        let Some(stop_tx) = self.stop_tx.take() else {
            return 0;
        };
        let _ = stop_tx.send(());
        let closed = self.realm.connections().close_all();
        info!(closed, "Realm listener stopped");
        closed
    }
}

impl Drop for RealmListener {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

async fn accept_channels(listener: TcpListener, realm: Realm, mut stop_rx: oneshot::Receiver<()>) {
    loop {
        let (stream, peer_addr) = tokio::select! {
            biased;
            _ = &mut stop_rx => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Realm accept error: {}", e);
                    continue;
                }
            },
        };

        let live = realm.connections().live_count();
        if live >= TransportConfig::MAX_CONNECTIONS {
            warn!(
                %peer_addr,
                live,
                "Refusing realm connection: at max capacity ({})",
                TransportConfig::MAX_CONNECTIONS
            );
            continue;
        }

        let realm = realm.clone();
        tokio::spawn(async move {
            match admit(stream, &realm).await {
                Ok(channel) => debug!(%peer_addr, channel = %channel.id(), "Realm channel admitted"),
                Err(e) => debug!(%peer_addr, "Realm connection refused: {}", e),
            }
        });
    }
}

/// Handshake with a TCP peer and hand its channel to the realm.
///
/// Only this process hosts the controller realm, so a peer declaring itself
/// a controller is refused before the trust policy sees it.
async fn admit(stream: TcpStream, realm: &Realm) -> crossrealm_core::Result<ChannelHandle> {
    let hello = tcp::Hello::new(realm.connections().purpose(), realm.descriptor().clone());
    let port = tcp::accept(stream, hello).await?;

    if port.handle.remote().kind == RealmKind::Controller {
        port.handle.close();
        return Err(MessengerError::ConnectionRefused {
            reason: "TCP peers cannot act as the controller realm".to_string(),
        });
    }

    realm.accept(port)
}

async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn handle_diagnostics(State(realm): State<Realm>) -> impl IntoResponse {
    Json(realm.diagnostics())
}

/// Start the HTTP diagnostics server.
///
/// Returns the actual address the server is bound to (useful when port=0).
pub async fn start_http_server(realm: Realm, host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(handle_health))
        .route("/diagnostics", get(handle_diagnostics))
        .layer(ConcurrencyLimitLayer::new(MAX_HTTP_CONCURRENCY))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(realm);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("HTTP server listening on {}", actual_addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    });

    Ok(actual_addr)
}
