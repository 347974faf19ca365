//! WebSocket transport to the realtime endpoint
//!
//! The socket is split into a writer task and a reader task on the tokio
//! runtime. The streaming threads talk to them through channels, so `send`
//! never waits on the network and `receive` blocks only its own thread.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;

use crate::config::RealtimeConfig;
use crate::error::TransportError;
use crate::network::transport::TransportChannel;
use crate::protocol::Envelope;

type Inbound = Result<Envelope, TransportError>;

/// [`TransportChannel`] over a single WebSocket connection
pub struct WsTransport {
    outbound: mpsc::UnboundedSender<Message>,
    inbound: crossbeam_channel::Receiver<Inbound>,
    closed: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl WsTransport {
    /// Connect and start the reader/writer tasks. Must run inside a tokio
    /// runtime.
    pub async fn connect(config: &RealtimeConfig, api_key: &str) -> Result<Self, TransportError> {
        let mut request = config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let headers = request.headers_mut();
        headers.insert(
            "Authorization",
            format!("Bearer {}", api_key)
                .parse()
                .map_err(|_| TransportError::ConnectionFailed("invalid API key".to_string()))?,
        );
        headers.insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

        let (ws_stream, response) = connect_async(request)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        tracing::info!("Connected to realtime endpoint ({})", response.status());

        let (mut write, mut read) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (inbound_tx, inbound) = crossbeam_channel::unbounded::<Inbound>();

        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = write.send(message).await {
                    tracing::error!("WebSocket send failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            tracing::debug!("WebSocket writer stopped");
        });

        let reader = tokio::spawn(async move {
            while let Some(result) = read.next().await {
                let message = match result {
                    Ok(message) => message,
                    Err(e) => {
                        let _ = inbound_tx.send(Err(TransportError::ReceiveFailed(e.to_string())));
                        return;
                    }
                };

                match message {
                    Message::Text(text) => match Envelope::parse(&text) {
                        Ok(envelope) => {
                            if inbound_tx.send(Ok(envelope)).is_err() {
                                return;
                            }
                        }
                        Err(e) => tracing::warn!("Ignoring message: {}", e),
                    },
                    Message::Close(frame) => {
                        tracing::info!("Server closed the connection: {:?}", frame);
                        return;
                    }
                    _ => {}
                }
            }
            // Dropping inbound_tx tells receive() the connection is gone
        });

        Ok(Self {
            outbound,
            inbound,
            closed: AtomicBool::new(false),
            reader: Mutex::new(Some(reader)),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl TransportChannel for WsTransport {
    fn send(&self, message: Envelope) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let text = serde_json::to_string(&message)?;
        self.outbound
            .send(Message::Text(text))
            .map_err(|_| TransportError::SendFailed("writer task stopped".to_string()))
    }

    fn receive(&self) -> Result<Envelope, TransportError> {
        match self.inbound.recv() {
            Ok(result) => result,
            Err(_) => Err(TransportError::Closed),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = self.outbound.send(Message::Close(None));
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        tracing::debug!("WebSocket transport closed");
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ClientEvent, SPEECH_STARTED};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    async fn local_endpoint() -> (TcpListener, RealtimeConfig) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = RealtimeConfig {
            url: format!("ws://{}", listener.local_addr().unwrap()),
            ..RealtimeConfig::default()
        };
        (listener, config)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_exchange_with_local_server() {
        let (listener, config) = local_endpoint().await;

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text("not json".to_string())).await.unwrap();
            ws.send(Message::Text(format!(r#"{{"type":"{}"}}"#, SPEECH_STARTED)))
                .await
                .unwrap();
            let received = ws.next().await.unwrap().unwrap();
            ws.close(None).await.unwrap();
            received
        });

        let transport = Arc::new(WsTransport::connect(&config, "sk-test").await.unwrap());

        let reader = transport.clone();
        let first = tokio::task::spawn_blocking(move || reader.receive())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.kind, SPEECH_STARTED);

        transport
            .send(ClientEvent::append_audio("AAEC".to_string()).into())
            .unwrap();
        let received = server.await.unwrap();
        let envelope = Envelope::parse(received.to_text().unwrap()).unwrap();
        assert_eq!(envelope.kind, "input_audio_buffer.append");
        assert_eq!(envelope.fields["audio"], "AAEC");

        let reader = transport.clone();
        let end = tokio::task::spawn_blocking(move || reader.receive())
            .await
            .unwrap();
        assert!(matches!(end, Err(TransportError::Closed)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_unblocks_receive() {
        let (listener, config) = local_endpoint().await;

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            // Stay silent until the client goes away
            while let Some(Ok(_)) = ws.next().await {}
        });

        let transport = Arc::new(WsTransport::connect(&config, "sk-test").await.unwrap());
        let reader = transport.clone();
        let blocked = tokio::task::spawn_blocking(move || reader.receive());

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        transport.close();
        transport.close();

        assert!(blocked.await.unwrap().is_err());
        assert!(matches!(
            transport.send(Envelope::new("session.update")),
            Err(TransportError::Closed)
        ));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let config = RealtimeConfig {
            url: "ws://127.0.0.1:1".to_string(),
            ..RealtimeConfig::default()
        };
        assert!(matches!(
            WsTransport::connect(&config, "sk-test").await,
            Err(TransportError::ConnectionFailed(_))
        ));
    }
}
