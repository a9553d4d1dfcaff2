//! Transport seam and the WebSocket + MessagePack implementation.

use std::collections::HashMap;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;

use crate::Error;
use crate::protocol::{ErrorInfo, ProtocolMessage, decode_msg, encode_msg, error_code};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const PROTOCOL_VERSION: &str = "5";
const AGENT_STRING: &str = "ably-presence-rs/0.1";

// ---------------------------------------------------------------------------
// Type aliases for WebSocket split halves
// ---------------------------------------------------------------------------

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

type WsRead = futures_util::stream::SplitStream<WsStream>;
type WsWrite = futures_util::stream::SplitSink<WsStream, tungstenite::Message>;

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// Everything a transport needs to open a link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectParams {
    pub host: String,
    pub tls: bool,
    pub key: Option<String>,
    pub token: Option<String>,
    pub client_id: Option<String>,
    pub echo: bool,
    /// Connection key of the session to resume.
    pub resume: Option<String>,
    pub extra: HashMap<String, String>,
}

/// What a transport reports back to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(ProtocolMessage),
    /// The link is gone. `None` for an orderly close.
    Closed(Option<ErrorInfo>),
}

/// Delivers events for one link. Events from a link the client has since
/// replaced are discarded by the client.
#[derive(Debug, Clone)]
pub struct TransportSink {
    generation: u64,
    tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

impl TransportSink {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<(u64, TransportEvent)>) -> Self {
        Self { generation, tx }
    }

    /// Returns `false` once the client has shut down.
    pub fn deliver(&self, event: TransportEvent) -> bool {
        self.tx.send((self.generation, event)).is_ok()
    }
}

/// A bidirectional link to the service.
///
/// Calls come from the client task and must not block. `open` replaces any
/// previous link; `close` on a closed transport is a no-op.
pub trait Transport: Send + 'static {
    fn open(&mut self, params: ConnectParams, sink: TransportSink);
    fn send(&mut self, message: &ProtocolMessage) -> Result<(), Error>;
    fn close(&mut self);
}

// ---------------------------------------------------------------------------
// WebSocket URL construction
// ---------------------------------------------------------------------------

pub(crate) fn build_ws_url(params: &ConnectParams) -> Result<String, Error> {
    let scheme = if params.tls { "wss" } else { "ws" };
    let mut u = url::Url::parse(&format!("{scheme}://{}/", params.host))?;
    {
        let mut q = u.query_pairs_mut();
        if let Some(ref token) = params.token {
            q.append_pair("access_token", token);
        } else if let Some(ref key) = params.key {
            q.append_pair("key", key);
        }
        q.append_pair("format", "msgpack");
        q.append_pair("v", PROTOCOL_VERSION);
        q.append_pair("agent", AGENT_STRING);
        q.append_pair("heartbeats", "true");
        q.append_pair("echo", if params.echo { "true" } else { "false" });
        if let Some(ref client_id) = params.client_id {
            q.append_pair("clientId", client_id);
        }
        if let Some(ref key) = params.resume {
            q.append_pair("resume", key);
        }
        let mut extra: Vec<_> = params.extra.iter().collect();
        extra.sort();
        for (k, v) in extra {
            q.append_pair(k, v);
        }
    }
    Ok(u.to_string())
}

// ---------------------------------------------------------------------------
// WebSocket transport
// ---------------------------------------------------------------------------

/// WebSocket link carrying binary MessagePack frames.
#[derive(Debug, Default)]
pub struct WebSocketTransport {
    outgoing: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transport for WebSocketTransport {
    fn open(&mut self, params: ConnectParams, sink: TransportSink) {
        let (tx, rx) = mpsc::unbounded_channel();
        // Dropping the previous sender ends the previous link task.
        self.outgoing = Some(tx);
        tokio::spawn(run_link(params, sink, rx));
    }

    fn send(&mut self, message: &ProtocolMessage) -> Result<(), Error> {
        let not_open = || Error::Protocol {
            code: error_code::DISCONNECTED,
            message: "transport is not open".to_string(),
        };
        let outgoing = self.outgoing.as_ref().ok_or_else(not_open)?;
        let data = encode_msg(message)?;
        outgoing.send(data).map_err(|_| not_open())
    }

    fn close(&mut self) {
        self.outgoing = None;
    }
}

async fn connect_and_split(url: &str) -> Result<(WsWrite, WsRead), Error> {
    let (ws, _resp) = tokio_tungstenite::connect_async(url).await?;
    Ok(ws.split())
}

fn link_error(message: String) -> TransportEvent {
    TransportEvent::Closed(Some(ErrorInfo::new(error_code::DISCONNECTED, None, message)))
}

async fn run_link(
    params: ConnectParams,
    sink: TransportSink,
    mut outgoing: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let url = match build_ws_url(&params) {
        Ok(url) => url,
        Err(e) => {
            sink.deliver(TransportEvent::Closed(Some(ErrorInfo::new(
                error_code::FAILED,
                Some(400),
                format!("invalid connection URL: {e}"),
            ))));
            return;
        }
    };
    tracing::debug!(host = %params.host, resume = params.resume.is_some(), "Opening WebSocket");

    let (mut ws_write, mut ws_read) = match connect_and_split(&url).await {
        Ok(halves) => halves,
        Err(e) => {
            tracing::warn!("WebSocket connect failed: {e}");
            sink.deliver(link_error(format!("connect failed: {e}")));
            return;
        }
    };

    loop {
        tokio::select! {
            frame = ws_read.next() => {
                match frame {
                    Some(Ok(tungstenite::Message::Binary(data))) => {
                        match decode_msg(&data) {
                            Ok(msg) => {
                                if !sink.deliver(TransportEvent::Message(msg)) {
                                    return;
                                }
                            }
                            Err(e) => {
                                tracing::warn!("Failed to decode message: {e}");
                            }
                        }
                    }
                    Some(Ok(tungstenite::Message::Close(_))) | None => {
                        tracing::info!("WebSocket stream ended");
                        sink.deliver(TransportEvent::Closed(None));
                        return;
                    }
                    Some(Ok(_)) => {
                        // Ignore text, ping, pong frames
                    }
                    Some(Err(e)) => {
                        tracing::warn!("WebSocket error: {e}");
                        sink.deliver(link_error(e.to_string()));
                        return;
                    }
                }
            }

            data = outgoing.recv() => {
                match data {
                    Some(data) => {
                        if let Err(e) = ws_write.send(tungstenite::Message::Binary(data.into())).await {
                            tracing::warn!("WebSocket send failed: {e}");
                            sink.deliver(link_error(e.to_string()));
                            return;
                        }
                    }
                    None => {
                        // Closed by the client; nothing more to report.
                        let _ = ws_write.send(tungstenite::Message::Close(None)).await;
                        return;
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Recording transport for unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Records everything the client asks of it.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct RecordingTransport {
        pub opened: Arc<Mutex<Vec<ConnectParams>>>,
        pub sent: Arc<Mutex<Vec<ProtocolMessage>>>,
        pub closes: Arc<Mutex<usize>>,
    }

    impl RecordingTransport {
        pub fn sent(&self) -> Vec<ProtocolMessage> {
            self.sent.lock().unwrap().clone()
        }

        pub fn sent_actions(&self) -> Vec<i32> {
            self.sent().iter().map(|m| m.action).collect()
        }

        pub fn clear_sent(&self) {
            self.sent.lock().unwrap().clear();
        }

        pub fn opened(&self) -> Vec<ConnectParams> {
            self.opened.lock().unwrap().clone()
        }

        pub fn closes(&self) -> usize {
            *self.closes.lock().unwrap()
        }
    }

    impl Transport for RecordingTransport {
        fn open(&mut self, params: ConnectParams, _sink: TransportSink) {
            self.opened.lock().unwrap().push(params);
        }

        fn send(&mut self, message: &ProtocolMessage) -> Result<(), Error> {
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }

        fn close(&mut self) {
            *self.closes.lock().unwrap() += 1;
        }
    }
}
