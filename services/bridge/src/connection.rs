//! Appx WebSocket sessions: connect, bootstrap, pool, and the per-endpoint
//! session task.
//!
//! # Session lifecycle
//! ```text
//!   connecting → alive → draining → closed
//!                  ↓
//!               stale → respawning → alive
//! ```
//! One task per endpoint owns the whole lifecycle: a read loop feeding the
//! shared fan-in queue, a ping driver at `keepalive / 2`, and a pong
//! watchdog.  A stale or lost session leaves the pool before the respawn
//! wait; the respawn interval is fixed.
//!
//! # Write contract
//! The writer half sits behind a mutex.  Pings and downlink writes take the
//! same mutex, so concurrent writers never interleave frames.

use crate::config::SslConfig;
use crate::metrics;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

pub type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Application-level ping payload.
const PING_PAYLOAD: &[u8] = b"keepalive";

// ---------------------------------------------------------------------------
// Raw frames on the fan-in queue
// ---------------------------------------------------------------------------

/// One raw frame read from an appx session, tagged with its source.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub appx_uri: String,
    pub appx_id: String,
    pub payload: String,
}

// ---------------------------------------------------------------------------
// Bootstrap catalog
// ---------------------------------------------------------------------------

/// One appx endpoint from the bootstrap catalog.
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangePoint {
    pub appxid: String,
    pub uri: String,
}

/// The bootstrap endpoint's response to an owner invite.
#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapCatalog {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub appx_list: Vec<ExchangePoint>,
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub release: u32,
}

/// Short-lived bootstrap exchange: send `{"owner": <id>}`, read the catalog.
///
/// An unreachable endpoint or an empty `appx_list` is fatal for startup; the
/// caller decides the exit path.
pub async fn bootstrap(
    uri: &str,
    owner_id: &str,
    ssl: &SslConfig,
) -> Result<BootstrapCatalog, ConnectError> {
    let mut ws = connect_appx(uri, ssl).await?;

    let invite = serde_json::json!({ "owner": owner_id });
    ws.send(Message::Text(invite.to_string().into()))
        .await
        .map_err(|e| ConnectError::Ws(e.to_string()))?;

    let catalog = loop {
        match ws.next().await {
            None => return Err(ConnectError::Disconnected),
            Some(Err(e)) => return Err(ConnectError::Ws(e.to_string())),
            Some(Ok(Message::Text(t))) => {
                break serde_json::from_str::<BootstrapCatalog>(&t)
                    .map_err(|e| ConnectError::Protocol(format!("catalog parse: {}", e)))?;
            }
            Some(Ok(Message::Close(_))) => return Err(ConnectError::Disconnected),
            Some(Ok(_)) => continue,
        }
    };
    let _ = ws.close(None).await;

    if !catalog.error.is_empty() {
        return Err(ConnectError::Protocol(format!(
            "bootstrap endpoint returned error: {}",
            catalog.error
        )));
    }
    if catalog.appx_list.is_empty() {
        return Err(ConnectError::EmptyCatalog);
    }
    Ok(catalog)
}

// ---------------------------------------------------------------------------
// Connecting
// ---------------------------------------------------------------------------

/// Open one WebSocket session against an appx URI.
///
/// `wss://` endpoints authenticate with the configured client certificate;
/// `ws://` is plaintext.
pub async fn connect_appx(uri: &str, ssl: &SslConfig) -> Result<WsStream, ConnectError> {
    let request = build_ws_request(uri)?;

    let connector = if uri.starts_with("wss://") {
        Some(Connector::NativeTls(build_tls_connector(ssl)?))
    } else {
        None
    };

    let (ws, _response) =
        tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector)
            .await
            .map_err(|e| ConnectError::Handshake(format!("{}: {}", uri, e)))?;

    info!(uri = %uri, "appx connection established");
    Ok(ws)
}

fn build_ws_request(
    uri: &str,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, ConnectError> {
    let mut request = uri
        .into_client_request()
        .map_err(|e| ConnectError::InvalidUri(format!("'{}': {}", uri, e)))?;

    let host = request
        .uri()
        .host()
        .unwrap_or_default()
        .to_owned();
    let headers = request.headers_mut();
    headers.insert(
        "Origin",
        host.parse()
            .map_err(|_| ConnectError::InvalidUri(format!("'{}': host not a header value", uri)))?,
    );
    headers.insert(
        "Sec-WebSocket-Extensions",
        "permessage-deflate; client_max_window_bits;"
            .parse()
            .map_err(|_| ConnectError::InvalidUri("extension header".to_owned()))?,
    );
    Ok(request)
}

fn build_tls_connector(ssl: &SslConfig) -> Result<native_tls::TlsConnector, ConnectError> {
    let (cert_path, key_path) = match (&ssl.certificate, &ssl.private_key) {
        (Some(c), Some(k)) => (c, k),
        _ => {
            return Err(ConnectError::Tls(
                "wss:// endpoint but ssl.certificate / ssl.private_key not configured".to_owned(),
            ))
        }
    };
    let cert = std::fs::read(cert_path)
        .map_err(|e| ConnectError::Tls(format!("reading '{}': {}", cert_path, e)))?;
    let key = std::fs::read(key_path)
        .map_err(|e| ConnectError::Tls(format!("reading '{}': {}", key_path, e)))?;
    let identity = native_tls::Identity::from_pkcs8(&cert, &key)
        .map_err(|e| ConnectError::Tls(format!("client identity: {}", e)))?;

    let mut builder = native_tls::TlsConnector::builder();
    builder.identity(identity);
    if let Some(chain_path) = &ssl.trust_chain {
        let chain = std::fs::read(chain_path)
            .map_err(|e| ConnectError::Tls(format!("reading '{}': {}", chain_path, e)))?;
        let ca = native_tls::Certificate::from_pem(&chain)
            .map_err(|e| ConnectError::Tls(format!("trust chain: {}", e)))?;
        builder.add_root_certificate(ca);
    }
    builder
        .build()
        .map_err(|e| ConnectError::Tls(e.to_string()))
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// A live appx session: the writer half plus liveness bookkeeping.  The read
/// half stays inside the session task.
pub struct Connection {
    pub appx_uri: String,
    pub appx_id: String,
    writer: Mutex<WsSink>,
    last_pong: std::sync::Mutex<Instant>,
    msgs_rx: AtomicU64,
}

impl Connection {
    fn new(appx_uri: String, appx_id: String, writer: WsSink) -> Arc<Connection> {
        Arc::new(Connection {
            appx_uri,
            appx_id,
            writer: Mutex::new(writer),
            last_pong: std::sync::Mutex::new(Instant::now()),
            msgs_rx: AtomicU64::new(0),
        })
    }

    /// Write one text frame.  Serialized against pings and other writers by
    /// the internal mutex.
    pub async fn write_text(&self, text: String) -> Result<(), ConnectError> {
        self.writer
            .lock()
            .await
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| ConnectError::Ws(e.to_string()))
    }

    async fn send_ping(&self) -> Result<(), ConnectError> {
        self.writer
            .lock()
            .await
            .send(Message::Ping(PING_PAYLOAD.to_vec().into()))
            .await
            .map_err(|e| ConnectError::Ws(e.to_string()))
    }

    fn record_pong(&self) {
        if let Ok(mut guard) = self.last_pong.lock() {
            *guard = Instant::now();
        }
    }

    fn pong_age(&self) -> Duration {
        self.last_pong
            .lock()
            .map(|guard| guard.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    fn record_rx(&self) -> u64 {
        self.msgs_rx.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn messages_received(&self) -> u64 {
        self.msgs_rx.load(Ordering::Relaxed)
    }

    /// Write a close frame and shut the socket down.  Best effort.
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.send(Message::Close(None)).await;
        let _ = writer.close().await;
    }
}

// ---------------------------------------------------------------------------
// Connection pool
// ---------------------------------------------------------------------------

/// The set of live sessions.  Readers snapshot under the lock and act on
/// the snapshot; nothing runs callbacks while holding it.
#[derive(Clone)]
pub struct ConnPool {
    connections: Arc<Mutex<Vec<Arc<Connection>>>>,
    next: Arc<AtomicUsize>,
}

impl ConnPool {
    pub fn new() -> ConnPool {
        ConnPool {
            connections: Arc::new(Mutex::new(Vec::new())),
            next: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn add(&self, conn: Arc<Connection>) {
        self.connections.lock().await.push(conn);
    }

    /// Remove a session.  Returns false when the session was already drained
    /// (e.g. by `close_all`).
    pub async fn remove(&self, conn: &Arc<Connection>) -> bool {
        let mut connections = self.connections.lock().await;
        let before = connections.len();
        connections.retain(|c| !Arc::ptr_eq(c, conn));
        connections.len() != before
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().await.clone()
    }

    /// Round-robin over a snapshot of the live sessions.
    pub async fn pick(&self) -> Option<Arc<Connection>> {
        let snapshot = self.snapshot().await;
        if snapshot.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % snapshot.len();
        Some(snapshot[index].clone())
    }

    /// Drain the pool: write a close frame on every live session and close
    /// the sockets.
    pub async fn close_all(&self) {
        let drained: Vec<Arc<Connection>> = {
            let mut connections = self.connections.lock().await;
            connections.drain(..).collect()
        };
        for conn in drained {
            info!(
                appx_id = %conn.appx_id,
                uri = %conn.appx_uri,
                served = conn.messages_received(),
                "closing appx session"
            );
            conn.close().await;
            metrics::WS_CONNECTIONS.dec();
        }
    }
}

impl Default for ConnPool {
    fn default() -> Self {
        ConnPool::new()
    }
}

// ---------------------------------------------------------------------------
// Session task
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
enum SessionEnd {
    /// Cooperative shutdown; do not respawn.
    Shutdown,
    /// Read error, close, or pong timeout; respawn after the fixed wait.
    Lost,
}

/// Fixed timing for the session tasks, from the `-K` / `-R` flags.
#[derive(Debug, Clone, Copy)]
pub struct SessionTiming {
    pub keepalive: Duration,
    pub respawn: Duration,
}

/// Per-endpoint session task.  `stream` is the already-established first
/// connection (a bootstrap connect failure is the supervisor's decision, not
/// this task's).
pub async fn run_session(
    uri: String,
    appx_id: String,
    ssl: SslConfig,
    pool: ConnPool,
    frames: mpsc::Sender<RawFrame>,
    timing: SessionTiming,
    mut shutdown_rx: watch::Receiver<bool>,
    mut stream: WsStream,
) {
    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        let (writer, reader) = stream.split();
        let conn = Connection::new(uri.clone(), appx_id.clone(), writer);
        pool.add(conn.clone()).await;
        metrics::WS_CONNECTIONS.inc();

        let end = drive_session(&conn, reader, &frames, timing.keepalive, &mut shutdown_rx).await;

        if pool.remove(&conn).await {
            metrics::WS_CONNECTIONS.dec();
        }
        conn.close().await;

        if end == SessionEnd::Shutdown {
            return;
        }

        // Respawn with a fixed interval until the endpoint answers again.
        loop {
            tokio::select! {
                _ = tokio::time::sleep(timing.respawn) => {}
                _ = shutdown_rx.changed() => {}
            }
            if *shutdown_rx.borrow() {
                return;
            }
            match connect_appx(&uri, &ssl).await {
                Ok(s) => {
                    info!(uri = %uri, appx_id = %appx_id, "appx session respawned");
                    stream = s;
                    break;
                }
                Err(e) => {
                    warn!(
                        uri = %uri,
                        error = %e,
                        respawn_secs = timing.respawn.as_secs(),
                        "respawn attempt failed, trying again"
                    );
                }
            }
        }
    }
}

/// The alive state: read frames, drive pings, watch pongs.
async fn drive_session(
    conn: &Arc<Connection>,
    mut reader: WsSource,
    frames: &mpsc::Sender<RawFrame>,
    keepalive: Duration,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let mut ping = tokio::time::interval(keepalive / 2);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe = reader.next() => match maybe {
                Some(Ok(Message::Text(text))) => {
                    conn.record_rx();
                    metrics::RAW_MESSAGES_RECEIVED
                        .with_label_values(&[&conn.appx_id, &conn.appx_uri])
                        .inc();
                    let frame = RawFrame {
                        appx_uri: conn.appx_uri.clone(),
                        appx_id: conn.appx_id.clone(),
                        payload: text.to_string(),
                    };
                    // A full queue blocks here; backpressure reaches the
                    // peer through the TCP window.
                    if frames.send(frame).await.is_err() {
                        return SessionEnd::Shutdown;
                    }
                }
                Some(Ok(Message::Pong(_))) => {
                    metrics::WS_PONG_RCVD.inc();
                    conn.record_pong();
                }
                Some(Ok(Message::Close(_))) | None => {
                    warn!(uri = %conn.appx_uri, "appx session closed by peer");
                    return SessionEnd::Lost;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(uri = %conn.appx_uri, error = %e, "appx read failed");
                    return SessionEnd::Lost;
                }
            },
            _ = ping.tick() => {
                if conn.pong_age() > keepalive {
                    warn!(
                        uri = %conn.appx_uri,
                        keepalive_secs = keepalive.as_secs(),
                        "pong watchdog fired, session is stale"
                    );
                    return SessionEnd::Lost;
                }
                if let Err(e) = conn.send_ping().await {
                    warn!(uri = %conn.appx_uri, error = %e, "ping write failed");
                    return SessionEnd::Lost;
                }
                metrics::WS_PING_SENT.inc();
                debug!(uri = %conn.appx_uri, "ping sent");
            },
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return SessionEnd::Shutdown;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConnectError {
    InvalidUri(String),
    Tls(String),
    Handshake(String),
    Ws(String),
    Protocol(String),
    EmptyCatalog,
    Disconnected,
}

impl std::fmt::Display for ConnectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectError::InvalidUri(s) => write!(f, "invalid WebSocket URI {}", s),
            ConnectError::Tls(s) => write!(f, "TLS setup error: {}", s),
            ConnectError::Handshake(s) => write!(f, "WebSocket handshake failed: {}", s),
            ConnectError::Ws(s) => write!(f, "WebSocket error: {}", s),
            ConnectError::Protocol(s) => write!(f, "protocol error: {}", s),
            ConnectError::EmptyCatalog => write!(f, "bootstrap returned an empty appx list"),
            ConnectError::Disconnected => write!(f, "WebSocket disconnected"),
        }
    }
}

impl std::error::Error for ConnectError {}
