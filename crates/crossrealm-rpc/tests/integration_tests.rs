//! Integration tests for the crossrealm-rpc daemon.
//!
//! These tests start the real binary, read the ports it prints, and talk to
//! it the way a page realm and the parent process would.

use crossrealm_core::{
    tcp, ChannelHandle, MessagingConfig, MessengerError, Realm, SenderDescriptor,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;

const EXTENSION_ID: &str = "integration-ext";

/// GET a JSON document from the daemon's HTTP server.
async fn http_get(port: u16, path: &str) -> Result<Value, String> {
    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://127.0.0.1:{}{}", port, path))
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .map_err(|e| e.to_string())?;

    response.json::<Value>().await.map_err(|e| e.to_string())
}

/// Check health endpoint.
async fn check_health(port: u16) -> bool {
    match http_get(port, "/health").await {
        Ok(json) => json.get("status").and_then(|v| v.as_str()) == Some("ok"),
        Err(_) => false,
    }
}

/// Wait for server to be ready.
async fn wait_for_server(port: u16, timeout_secs: u64) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < Duration::from_secs(timeout_secs) {
        if check_health(port).await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

struct DaemonHandle {
    child: tokio::process::Child,
    rpc_port: u16,
    http_port: u16,
    stdout_drain: Option<tokio::task::JoinHandle<()>>,
}

impl DaemonHandle {
    async fn stop(mut self) {
        if let Some(drain) = self.stdout_drain.take() {
            drain.abort();
        }
        let _ = self.child.kill().await;
        let _ = self.child.wait().await;
    }
}

impl Drop for DaemonHandle {
    fn drop(&mut self) {
        if let Some(drain) = self.stdout_drain.take() {
            drain.abort();
        }
        let _ = self.child.start_kill();
    }
}

fn daemon_binary() -> Result<PathBuf, String> {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_crossrealm-rpc") {
        return Ok(PathBuf::from(path));
    }

    let current_exe = std::env::current_exe()
        .map_err(|e| format!("failed to resolve current_exe for fallback: {e}"))?;
    let target_debug_dir = current_exe
        .parent()
        .and_then(|p| p.parent())
        .ok_or_else(|| "failed to resolve target/debug directory for fallback".to_string())?;

    let mut fallback = target_debug_dir.join("crossrealm-rpc");
    if cfg!(target_os = "windows") {
        fallback.set_extension("exe");
    }
    if !fallback.exists() {
        return Err(format!(
            "CARGO_BIN_EXE_crossrealm-rpc not set and fallback binary not found at {}",
            fallback.display()
        ));
    }
    Ok(fallback)
}

fn parse_port(line: &str, prefix: &str) -> Result<Option<u16>, String> {
    match line.strip_prefix(prefix) {
        Some(value) => value
            .trim()
            .parse::<u16>()
            .map(Some)
            .map_err(|e| format!("invalid {prefix} value '{value}': {e}")),
        None => Ok(None),
    }
}

/// Start the daemon and wait until `/health` is ready.
async fn start_daemon() -> Result<DaemonHandle, String> {
    let binary = daemon_binary()?;

    let mut child = tokio::process::Command::new(&binary)
        .arg("--host")
        .arg("127.0.0.1")
        .arg("--port")
        .arg("0")
        .arg("--http-port")
        .arg("0")
        .arg("--extension-id")
        .arg(EXTENSION_ID)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| format!("failed to spawn crossrealm-rpc: {e}"))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "failed to capture stdout".to_string())?;
    let mut lines = tokio::io::BufReader::new(stdout).lines();

    let mut rpc_port: Option<u16> = None;
    let mut http_port: Option<u16> = None;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    while tokio::time::Instant::now() < deadline && (rpc_port.is_none() || http_port.is_none()) {
        match tokio::time::timeout(Duration::from_millis(250), lines.next_line()).await {
            Ok(Ok(Some(line))) => {
                if let Some(port) = parse_port(&line, "RPC_PORT=")? {
                    rpc_port = Some(port);
                }
                if let Some(port) = parse_port(&line, "HTTP_PORT=")? {
                    http_port = Some(port);
                }
            }
            Ok(Ok(None)) => break,
            Ok(Err(err)) => return Err(format!("failed to read crossrealm-rpc stdout: {err}")),
            Err(_) => continue,
        }
    }

    let rpc_port = rpc_port.ok_or_else(|| "RPC_PORT line not emitted".to_string())?;
    let http_port = http_port.ok_or_else(|| "HTTP_PORT line not emitted".to_string())?;
    if !wait_for_server(http_port, 15).await {
        return Err(format!("crossrealm-rpc failed health check on port {http_port}"));
    }

    let stdout_drain =
        tokio::spawn(async move { while let Ok(Some(_)) = lines.next_line().await {} });

    Ok(DaemonHandle {
        child,
        rpc_port,
        http_port,
        stdout_drain: Some(stdout_drain),
    })
}

/// Connect a fresh page realm to the daemon over TCP.
async fn connect_page(
    daemon: &DaemonHandle,
    extension_id: &str,
    tab: u32,
) -> (Realm, crossrealm_core::Result<ChannelHandle>) {
    let page = Realm::builder(SenderDescriptor::page(extension_id, tab, 0)).build();
    let hello = tcp::Hello::new(MessagingConfig::DEFAULT_PURPOSE, page.descriptor().clone());
    let addr = format!("127.0.0.1:{}", daemon.rpc_port).parse().unwrap();

    let channel = match tcp::connect(addr, hello).await {
        Ok(port) => page.connect(port).await,
        Err(e) => Err(e),
    };
    (page, channel)
}

#[tokio::test]
async fn test_daemon_health_and_diagnostics() {
    let daemon = start_daemon().await.expect("daemon failed to start");

    let diagnostics = http_get(daemon.http_port, "/diagnostics").await.unwrap();
    assert_eq!(diagnostics["realm"], "controller");
    assert_eq!(diagnostics["extensionId"], EXTENSION_ID);
    assert_eq!(diagnostics["openedConnections"], 0);
    assert_eq!(
        diagnostics["callTypes"],
        json!(["ECHO", "GET_DIAGNOSTICS", "LOG", "PING"])
    );

    daemon.stop().await;
}

#[tokio::test]
async fn test_page_realm_round_trip_over_tcp() {
    let daemon = start_daemon().await.expect("daemon failed to start");
    let (page, channel) = connect_page(&daemon, EXTENSION_ID, 12).await;
    let channel = channel.expect("page failed to connect");

    let pong: Value = page.stub::<(), Value>("PING").call(&channel, ()).await.unwrap();
    assert_eq!(pong, json!({"ok": true}));

    let payload = json!({"text": "hello", "n": [1, 2, 3]});
    let echoed: Value = page
        .stub::<(Value,), Value>("ECHO")
        .call(&channel, (payload.clone(),))
        .await
        .unwrap();
    assert_eq!(echoed, payload);

    page.notification_stub::<(String, String)>("LOG")
        .notify(&channel, ("info".to_string(), "from the page".to_string()))
        .unwrap();

    let remote: Value = page
        .stub::<(), Value>("GET_DIAGNOSTICS")
        .call(&channel, ())
        .await
        .unwrap();
    assert_eq!(remote["openedConnections"], 1);
    assert_eq!(
        remote["liveEndpoints"],
        json!([{"kind": "page", "tabId": 12, "frameId": 0}])
    );

    let missing = page.stub::<(), Value>("NOT_A_HANDLER");
    let hung = tokio::time::timeout(Duration::from_millis(300), missing.call(&channel, ())).await;
    assert!(hung.is_err(), "unknown call types must not be answered");

    daemon.stop().await;
}

#[tokio::test]
async fn test_foreign_extension_is_refused() {
    let daemon = start_daemon().await.expect("daemon failed to start");
    let (_page, channel) = connect_page(&daemon, "someone-else", 1).await;

    assert!(matches!(
        channel,
        Err(MessengerError::ConnectionRefused { .. })
    ));

    let diagnostics = http_get(daemon.http_port, "/diagnostics").await.unwrap();
    assert_eq!(diagnostics["openedConnections"], 0);

    daemon.stop().await;
}
