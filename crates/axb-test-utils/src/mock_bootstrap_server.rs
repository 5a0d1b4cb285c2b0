// mock_bootstrap_server: A mock bootstrap endpoint.
//
// Serves the short-lived catalog exchange: reads the `{"owner": ...}` invite,
// replies with a configured catalog JSON, and closes.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::protocol::Message;

/// A mock bootstrap endpoint for integration testing.
pub struct MockBootstrapServer {
    addr: SocketAddr,
    invites: Mutex<mpsc::UnboundedReceiver<String>>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockBootstrapServer {
    /// Start the mock, answering every connection with `catalog_json`.
    pub async fn start(catalog_json: String) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (tx, rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        let catalog = catalog_json.clone();
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            let _ = Self::handle_connection(stream, catalog, tx).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Self {
            addr,
            invites: Mutex::new(rx),
            _task: task,
        })
    }

    /// A `ws://` URL for the server.
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// The next invite payload a client sent.
    pub async fn next_invite(&self) -> Option<String> {
        self.invites.lock().await.recv().await
    }

    // -- internal --

    async fn handle_connection(
        stream: tokio::net::TcpStream,
        catalog: String,
        tx: mpsc::UnboundedSender<String>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws = tokio_tungstenite::accept_async(stream).await?;
        let (mut write, mut read) = ws.split();

        while let Some(msg_result) = read.next().await {
            match msg_result? {
                Message::Text(t) => {
                    let _ = tx.send(t.to_string());
                    write.send(Message::Text(catalog.clone().into())).await?;
                    write.send(Message::Close(None)).await?;
                    break;
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
