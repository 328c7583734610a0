//! Crossrealm RPC daemon - hosts the controller realm over local TCP.
//!
//! Page and panel realms connect to the realm port and call the controller's
//! handlers through `crossrealm-core` stubs. A side HTTP server reports
//! health and diagnostics to the parent process.

mod handlers;
mod server;

use anyhow::Result;
use clap::Parser;
use crossrealm_core::{Realm, RealmKind, SenderDescriptor, TrustPolicy};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "crossrealm-rpc")]
#[command(about = "Controller realm daemon for crossrealm messaging")]
struct Args {
    /// Realm port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// HTTP diagnostics port (0 = auto-assign)
    #[arg(long, default_value = "0")]
    http_port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Extension identity realms must present to be trusted
    #[arg(long, default_value = "crossrealm-dev")]
    extension_id: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn init_logging(debug: bool, json: bool) {
    // RUST_LOG wins over --debug when set.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));

    // stdout is reserved for the port lines the parent process reads.
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.debug, args.json_logs);

    info!("Starting Crossrealm RPC daemon");
    info!("Trusted extension: {}", args.extension_id);

    let realm = Realm::builder(SenderDescriptor::controller(args.extension_id.as_str()))
        .trust_policy(
            TrustPolicy::new(args.extension_id.as_str())
                .allow(RealmKind::Page)
                .allow(RealmKind::Panel),
        )
        .build();
    handlers::register(&realm);

    let mut realm_listener = server::RealmListener::bind(realm.clone(), &args.host, args.port).await?;
    let http_addr = server::start_http_server(realm, &args.host, args.http_port).await?;

    // Print ports for the parent process to read (intentional stdout for IPC)
    println!("RPC_PORT={}", realm_listener.addr().port());
    println!("HTTP_PORT={}", http_addr.port());

    info!("Realm server running on {}", realm_listener.addr());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    realm_listener.shutdown();

    Ok(())
}
