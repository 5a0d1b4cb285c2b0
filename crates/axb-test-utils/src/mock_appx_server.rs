// mock_appx_server: A mock appx node for testing bridge connections.
//
// Accepts WebSocket connections on 127.0.0.1:<random>, optionally streams a
// scripted list of frames to every client, answers pings, and records every
// text frame the client writes (downlinks) for test assertions.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::protocol::Message;

/// Behavior knobs for [`MockAppxServer`].
#[derive(Debug, Clone, Default)]
pub struct MockAppxOptions {
    /// Frames sent to each client right after the handshake.
    pub greeting_frames: Vec<String>,
    /// Close the connection after the greeting frames (exercise respawn).
    pub close_after_send: bool,
}

/// A mock appx node for integration testing.
///
/// Binds to port 0 (random) and exposes the actual bound address.  Each test
/// can spin up its own isolated instance.
pub struct MockAppxServer {
    addr: SocketAddr,
    received: Mutex<mpsc::UnboundedReceiver<String>>,
    connections: Arc<AtomicUsize>,
    /// Handle to the background accept loop; dropped when the server is dropped.
    _task: tokio::task::JoinHandle<()>,
}

impl MockAppxServer {
    /// Start the mock server, binding to a random available port.
    pub async fn start(options: MockAppxOptions) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let connections = Arc::new(AtomicUsize::new(0));

        let counter = connections.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        let options = options.clone();
                        let tx = tx.clone();
                        let counter = counter.clone();
                        tokio::spawn(async move {
                            // In tests, connection errors are expected (client
                            // drops, shutdown mid-frame). Swallow silently.
                            let _ = Self::handle_connection(stream, options, tx, counter).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Self {
            addr,
            received: Mutex::new(rx),
            connections,
            _task: task,
        })
    }

    /// The address the server is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// A `ws://` URL for the server.
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// How many WebSocket sessions have been accepted so far.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// The next text frame a client wrote, in arrival order across all
    /// connections.
    pub async fn next_received(&self) -> Option<String> {
        self.received.lock().await.recv().await
    }

    // -- internal --

    async fn handle_connection(
        stream: tokio::net::TcpStream,
        options: MockAppxOptions,
        tx: mpsc::UnboundedSender<String>,
        counter: Arc<AtomicUsize>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws = tokio_tungstenite::accept_async(stream).await?;
        counter.fetch_add(1, Ordering::SeqCst);
        let (mut write, mut read) = ws.split();

        for frame in &options.greeting_frames {
            write.send(Message::Text(frame.clone().into())).await?;
        }

        if options.close_after_send {
            write.send(Message::Close(None)).await?;
            let _ = write.close().await;
            return Ok(());
        }

        while let Some(msg_result) = read.next().await {
            match msg_result? {
                Message::Text(t) => {
                    let _ = tx.send(t.to_string());
                }
                Message::Ping(data) => {
                    write.send(Message::Pong(data)).await?;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        Ok(())
    }
}
