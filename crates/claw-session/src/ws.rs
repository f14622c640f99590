//! WebSocket transport over tokio-tungstenite.
//!
//! Each transport is a background task that owns the socket. The
//! [`WsTransport`] handle only talks to that task through a channel, so
//! [`Transport::send`] and [`Transport::close`] never block.

use std::borrow::Cow;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};
use url::Url;

use crate::error::TransportError;
use crate::transport::{CLOSE_NORMAL, CloseInfo, Connector, Transport, TransportEvents};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code reported when the peer's close frame carried no status.
const CLOSE_NO_STATUS: u16 = 1005;

/// Default bound on a close handshake, in either direction.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// Opens WebSocket transports on the current tokio runtime.
#[derive(Debug, Clone)]
pub struct WsConnector {
    close_timeout: Duration,
}

impl WsConnector {
    /// Create a connector with the default close timeout.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }

    /// Set how long a close handshake may take before the close is reported
    /// anyway: our close waiting for the peer's reply, or the peer's close
    /// waiting for it to drop the socket.
    #[must_use]
    pub const fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for WsConnector {
    fn open(
        &self,
        url: &Url,
        events: TransportEvents,
    ) -> Result<Box<dyn Transport>, TransportError> {
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(TransportError::Construction(format!(
                    "unsupported scheme '{other}'"
                )));
            }
        }

        let runtime = Handle::try_current()
            .map_err(|e| TransportError::Construction(format!("no async runtime: {e}")))?;

        let (tx, rx) = mpsc::unbounded_channel();
        runtime.spawn(run_socket(url.clone(), events, rx, self.close_timeout));

        Ok(Box::new(WsTransport { tx }))
    }
}

/// Handle to a socket task.
#[derive(Debug)]
pub struct WsTransport {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Transport for WsTransport {
    fn send(&mut self, text: &str) -> Result<(), TransportError> {
        self.tx
            .send(Outbound::Text(text.to_string()))
            .map_err(|_| TransportError::Closed)
    }

    fn close(&mut self, code: u16, reason: &str) {
        let command = Outbound::Close {
            code,
            reason: reason.to_string(),
        };
        if self.tx.send(command).is_err() {
            debug!(code, "socket task already finished");
        }
    }
}

async fn run_socket(
    url: Url,
    events: TransportEvents,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    close_timeout: Duration,
) {
    let generation = events.generation();

    let connecting = connect_async(url.as_str());
    tokio::pin!(connecting);

    let ws = loop {
        tokio::select! {
            result = &mut connecting => match result {
                Ok((ws, _response)) => break ws,
                Err(e) => {
                    warn!(generation, url = %url, error = %e, "websocket connect failed");
                    events.error(TransportError::Connect(e.to_string()));
                    events.closed(CloseInfo::abnormal());
                    return;
                }
            },
            command = outbound.recv() => match command {
                Some(Outbound::Text(_)) => {
                    debug!(generation, "dropping frame queued before open");
                }
                Some(Outbound::Close { .. }) | None => {
                    debug!(generation, "transport released before open");
                    return;
                }
            },
        }
    };

    debug!(generation, url = %url, "websocket open");
    events.opened();

    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => events.message(text),
                Some(Ok(Message::Close(frame))) => {
                    let info = close_info_from_frame(frame.as_ref());
                    debug!(generation, code = info.code, "peer closed websocket");
                    // Reading flushes our reply; the peer should then drop TCP.
                    if tokio::time::timeout(close_timeout, drain(&mut stream)).await.is_err() {
                        debug!(generation, "peer kept the socket open after closing");
                    }
                    events.closed(info);
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(generation, error = %e, "websocket read failed");
                    events.error(TransportError::Protocol(e.to_string()));
                    events.closed(CloseInfo::abnormal());
                    return;
                }
                None => {
                    events.closed(CloseInfo::abnormal());
                    return;
                }
            },
            command = outbound.recv() => match command {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        warn!(generation, error = %e, "websocket write failed");
                        events.error(TransportError::Send(e.to_string()));
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    let info = close_locally(&mut sink, &mut stream, code, reason, close_timeout).await;
                    events.closed(info);
                    return;
                }
                None => {
                    let info = close_locally(&mut sink, &mut stream, CLOSE_NORMAL, String::new(), close_timeout).await;
                    events.closed(info);
                    return;
                }
            },
        }
    }
}

/// Send a close frame and wait for the peer to finish the handshake.
async fn close_locally(
    sink: &mut SplitSink<WsStream, Message>,
    stream: &mut SplitStream<WsStream>,
    code: u16,
    reason: String,
    timeout: Duration,
) -> CloseInfo {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: Cow::Owned(reason.clone()),
    };
    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
        debug!(error = %e, "failed to send close frame");
    }

    let drained = tokio::time::timeout(timeout, drain(stream)).await;

    CloseInfo {
        code,
        reason,
        was_clean: drained.is_ok(),
    }
}

/// Read until the stream ends or fails.
async fn drain(stream: &mut SplitStream<WsStream>) {
    while let Some(frame) = stream.next().await {
        if frame.is_err() {
            break;
        }
    }
}

fn close_info_from_frame(frame: Option<&CloseFrame<'_>>) -> CloseInfo {
    frame.map_or(
        CloseInfo {
            code: CLOSE_NO_STATUS,
            reason: String::new(),
            was_clean: true,
        },
        |frame| CloseInfo {
            code: u16::from(frame.code),
            reason: frame.reason.to_string(),
            was_clean: true,
        },
    )
}
