use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

use super::{Connector, Endpoint, Link, TransportError};

/// Connects channels over WebSocket, one text frame per protocol message.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Link, TransportError> {
        let url = endpoint.url.as_str();
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|err| classify_connect_error(url, err))?;
        debug!(endpoint = %endpoint, "websocket connected");

        let (tx_out, rx_out) = mpsc::unbounded_channel::<String>();
        let (tx_in, rx_in) = mpsc::unbounded_channel::<String>();
        let label = endpoint.to_string();
        tokio::spawn(async move {
            pump_websocket(ws_stream, rx_out, tx_in).await;
            debug!(endpoint = %label, "websocket pump finished");
        });

        Ok(Link::new(tx_out, rx_in))
    }
}

fn classify_connect_error(url: &str, err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Http(response)
            if matches!(response.status().as_u16(), 401 | 403) =>
        {
            TransportError::Rejected {
                url: url.to_string(),
                reason: format!("http {}", response.status()),
            }
        }
        other => TransportError::Connect {
            url: url.to_string(),
            reason: other.to_string(),
        },
    }
}

/// Moves frames between the socket and the link's queues until either side
/// goes away. Dropping the link's sender closes the socket gracefully.
async fn pump_websocket(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut rx_out: mpsc::UnboundedReceiver<String>,
    tx_in: mpsc::UnboundedSender<String>,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let send_task = tokio::spawn(async move {
        while let Some(text) = rx_out.recv().await {
            if ws_sender.send(Message::Text(text)).await.is_err() {
                return;
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if tx_in.send(text).is_err() {
                    break;
                }
            }
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => {
                    if tx_in.send(text).is_err() {
                        break;
                    }
                }
                Err(_) => warn!("dropping non-utf8 binary frame"),
            },
            Ok(Message::Close(frame)) => {
                debug!(?frame, "websocket closed by peer");
                break;
            }
            Err(err) => {
                debug!(error = %err, "websocket read failed");
                break;
            }
            _ => {}
        }
    }

    send_task.abort();
    let _ = send_task.await;
}
