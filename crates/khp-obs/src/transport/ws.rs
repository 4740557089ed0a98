//! WebSocket transport over `tokio-tungstenite`.
//!
//! The session is synchronous, so the connector owns a small tokio runtime.
//! Each connection gets one handler task that owns the socket: outgoing
//! messages arrive on an unbounded channel, incoming text frames are parsed
//! and pushed to the blocking side. Binary, ping and pong frames are skipped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

use super::{Connector, Transport, TransportError};
use crate::config::Endpoint;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens `ws://host:port` connections.
pub struct WsConnector {
    runtime: Arc<Runtime>,
}

impl WsConnector {
    /// Connector with its own single-worker runtime.
    pub fn new() -> Result<Self, TransportError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("obs-ws")
            .enable_all()
            .build()
            .map_err(|e| TransportError::Io(format!("cannot start runtime: {e}")))?;
        Ok(Self::with_runtime(Arc::new(runtime)))
    }

    /// Connector that spawns its handler tasks on `runtime`.
    ///
    /// `open` blocks on the runtime, so it must not be called from inside an
    /// async context.
    pub fn with_runtime(runtime: Arc<Runtime>) -> Self {
        Self { runtime }
    }
}

impl Connector for WsConnector {
    fn open(&self, endpoint: &Endpoint) -> Result<Arc<dyn Transport>, TransportError> {
        let url = endpoint.url();
        let (ws, _) = self
            .runtime
            .block_on(connect_async(url.as_str()))
            .map_err(map_connect_error)?;
        debug!(%url, "websocket connected");

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let handler = self
            .runtime
            .spawn(ws_handler_loop(ws, outgoing_rx, incoming_tx));

        Ok(Arc::new(WsTransport {
            outgoing: outgoing_tx,
            incoming: Mutex::new(incoming_rx),
            closed: AtomicBool::new(false),
            _handler: handler,
        }))
    }
}

fn map_connect_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Io(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            TransportError::Refused(e.to_string())
        }
        other => TransportError::Io(other.to_string()),
    }
}

enum Outgoing {
    Text(String),
    Close,
}

struct WsTransport {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    incoming: Mutex<mpsc::UnboundedReceiver<Value>>,
    closed: AtomicBool,
    _handler: JoinHandle<()>,
}

impl Transport for WsTransport {
    fn send(&self, message: Value) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed("transport closed".into()));
        }
        self.outgoing
            .send(Outgoing::Text(message.to_string()))
            .map_err(|_| TransportError::Closed("websocket task ended".into()))
    }

    fn receive(&self) -> Result<Value, TransportError> {
        self.incoming
            .lock()
            .blocking_recv()
            .ok_or_else(|| TransportError::Closed("end of stream".into()))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.outgoing.send(Outgoing::Close);
        }
    }
}

async fn ws_handler_loop(
    ws: WsStream,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    incoming: mpsc::UnboundedSender<Value>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    loop {
        tokio::select! {
            out = outgoing.recv() => {
                match out {
                    Some(Outgoing::Text(text)) => {
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Outgoing::Close) | None => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            msg = ws_rx.next() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    // Empty or invalid text becomes Null and is rejected by the decoder.
                    Message::Text(text) => {
                        let value = serde_json::from_str(&text).unwrap_or(Value::Null);
                        if incoming.send(value).is_err() {
                            break;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }
    debug!("websocket handler exiting");
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn runtime() -> Arc<Runtime> {
        Arc::new(
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .enable_all()
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn exchanges_json_with_a_websocket_peer() {
        let runtime = runtime();
        let listener = runtime
            .block_on(tokio::net::TcpListener::bind("127.0.0.1:0"))
            .unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = runtime.spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text(
                String::from(r#"{"op":0,"d":{"rpcVersion":1}}"#).into(),
            ))
            .await
            .unwrap();
            let reply = ws.next().await.unwrap().unwrap();
            ws.send(Message::Text(String::from("not json").into()))
                .await
                .unwrap();
            let _ = ws.close(None).await;
            reply.into_text().unwrap().as_str().to_owned()
        });

        let connector = WsConnector::with_runtime(Arc::clone(&runtime));
        let transport = connector.open(&Endpoint::new("127.0.0.1", port)).unwrap();

        let hello = transport.receive().unwrap();
        assert_eq!(hello["op"], 0);
        transport.send(json!({"op": 1})).unwrap();
        assert_eq!(transport.receive().unwrap(), Value::Null);
        assert!(matches!(transport.receive(), Err(TransportError::Closed(_))));

        let reply = runtime.block_on(server).unwrap();
        assert_eq!(reply, r#"{"op":1}"#);
    }

    #[test]
    fn refused_connection_maps_to_refused() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let connector = WsConnector::with_runtime(runtime());
        let result = connector.open(&Endpoint::new("127.0.0.1", port));
        assert!(matches!(result, Err(TransportError::Refused(_))));
    }

    #[test]
    fn send_after_close_fails() {
        let runtime = runtime();
        let listener = runtime
            .block_on(tokio::net::TcpListener::bind("127.0.0.1:0"))
            .unwrap();
        let port = listener.local_addr().unwrap().port();
        let _server = runtime.spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let connector = WsConnector::with_runtime(Arc::clone(&runtime));
        let transport = connector.open(&Endpoint::new("127.0.0.1", port)).unwrap();
        transport.close();
        transport.close();
        assert!(matches!(
            transport.send(json!({"op": 6})),
            Err(TransportError::Closed(_))
        ));
        assert!(transport.receive().is_err());
    }
}
