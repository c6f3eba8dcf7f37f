//! Streaming protocol variant: one WebSocket carries JSON control messages
//! as text frames and audio as binary frames.

use crate::audio::frame::AudioFrame;
use crate::config::{IdentityConfig, WebsocketConfig};
use crate::error::{DeviceError, ProtocolError};
use crate::protocol::binary::{self, BinaryVersion, TYPE_JSON};
use crate::protocol::message::{ControlMessage, Envelope};
use crate::protocol::net::NetTask;
use crate::protocol::{HelloSettings, ListenerSlot, Protocol, ProtocolListener, ServerHello};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Session state written by the socket loop, read by callers.
#[derive(Default)]
struct SessionState {
    connected: AtomicBool,
    server_rate: AtomicU32,
    session_id: Mutex<Option<String>>,
}

impl SessionState {
    fn session_id(&self) -> MutexGuard<'_, Option<String>> {
        self.session_id.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Connection {
    task: NetTask,
    outbound: mpsc::UnboundedSender<Message>,
}

/// [`Protocol`] over a single WebSocket.
pub struct WebsocketProtocol {
    config: WebsocketConfig,
    identity: IdentityConfig,
    hello: HelloSettings,
    version: BinaryVersion,
    listener: Arc<ListenerSlot>,
    state: Arc<SessionState>,
    conn: Mutex<Option<Connection>>,
}

impl WebsocketProtocol {
    /// # Errors
    ///
    /// Returns an error for an unparseable URL or unsupported binary version.
    pub fn new(
        config: WebsocketConfig,
        identity: IdentityConfig,
        hello: HelloSettings,
    ) -> crate::Result<Self> {
        url::Url::parse(&config.url)
            .map_err(|e| DeviceError::Config(format!("websocket url {:?}: {e}", config.url)))?;
        let version = BinaryVersion::try_from(config.version)?;
        let state = Arc::new(SessionState::default());
        state
            .server_rate
            .store(hello.default_server_rate, Ordering::Release);
        Ok(Self {
            config,
            identity,
            hello,
            version,
            listener: Arc::new(ListenerSlot::default()),
            state,
            conn: Mutex::new(None),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Option<Connection>> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn build_request(&self) -> Result<Request, ProtocolError> {
        let mut request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ProtocolError::Connect(format!("bad request: {e}")))?;
        let headers = request.headers_mut();
        if !self.config.token.is_empty() {
            headers.insert(
                "Authorization",
                header_value(&format!("Bearer {}", self.config.token))?,
            );
        }
        headers.insert(
            "Protocol-Version",
            header_value(&self.version.as_u8().to_string())?,
        );
        headers.insert("Device-Id", header_value(&self.identity.device_id)?);
        headers.insert("Client-Id", header_value(&self.identity.client_id)?);
        Ok(request)
    }

    fn outbound(&self, message: Message) -> Result<(), ProtocolError> {
        match self.conn().as_ref() {
            Some(conn) => conn
                .outbound
                .send(message)
                .map_err(|_| ProtocolError::Closed("websocket loop ended".into())),
            None => Err(ProtocolError::NotConnected),
        }
    }
}

fn header_value(value: &str) -> Result<HeaderValue, ProtocolError> {
    HeaderValue::from_str(value)
        .map_err(|e| ProtocolError::Connect(format!("invalid header value {value:?}: {e}")))
}

impl Protocol for WebsocketProtocol {
    fn name(&self) -> &'static str {
        "websocket"
    }

    fn set_listener(&self, listener: Arc<dyn ProtocolListener>) {
        self.listener.set(listener);
    }

    fn connect(&self) -> Result<(), ProtocolError> {
        self.close();

        let request = self.build_request()?;
        let hello_text = self
            .hello
            .device_hello(self.version.as_u8(), "websocket")
            .to_wire(None)?;
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let ctx = LoopContext {
            request,
            hello_text,
            version: self.version,
            timeout: self.hello.timeout,
            default_rate: self.hello.default_server_rate,
            listener: Arc::clone(&self.listener),
            state: Arc::clone(&self.state),
            ready: ready_tx,
        };
        let task = NetTask::spawn("fae-websocket", move |cancel| {
            run_connection(ctx, out_rx, cancel)
        })?;
        *self.conn() = Some(Connection {
            task,
            outbound: out_tx,
        });

        let outcome = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(ProtocolError::Closed("closed during connect".into())));
        match outcome {
            Ok(server) => {
                info!(
                    "websocket session {:?} open, downlink {}Hz",
                    server.session_id, server.sample_rate
                );
                Ok(())
            }
            Err(e) => {
                warn!("websocket connect failed: {e}");
                self.close();
                Err(e)
            }
        }
    }

    fn send_control(&self, message: &ControlMessage) -> Result<(), ProtocolError> {
        if !self.is_connected() {
            return Err(ProtocolError::NotConnected);
        }
        let session = self.state.session_id().clone();
        let text = message.to_wire(session.as_deref())?;
        debug!("websocket send {}", message.wire_type());
        self.outbound(Message::Text(text))
    }

    fn send_audio(&self, frame: AudioFrame) -> Result<(), ProtocolError> {
        if !self.is_connected() {
            return Err(ProtocolError::NotConnected);
        }
        let payload = frame
            .payload()
            .ok_or_else(|| ProtocolError::InvalidFrame("PCM frame handed to transport".into()))?;
        let data = binary::encode_audio(self.version, frame.timestamp, payload)?;
        self.outbound(Message::Binary(data))
    }

    fn close(&self) {
        let conn = self.conn().take();
        if let Some(mut conn) = conn {
            conn.task.stop();
            info!("websocket closed");
        }
        self.state.connected.store(false, Ordering::Release);
        *self.state.session_id() = None;
    }

    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::Acquire)
            && self.conn().as_ref().is_some_and(|c| !c.task.is_finished())
    }

    fn session_id(&self) -> Option<String> {
        self.state.session_id().clone()
    }

    fn server_sample_rate(&self) -> u32 {
        self.state.server_rate.load(Ordering::Acquire)
    }
}

impl Drop for WebsocketProtocol {
    fn drop(&mut self) {
        self.close();
    }
}

// ── Socket loop ─────────────────────────────────────────────────────

struct LoopContext {
    request: Request,
    hello_text: String,
    version: BinaryVersion,
    timeout: Duration,
    default_rate: u32,
    listener: Arc<ListenerSlot>,
    state: Arc<SessionState>,
    ready: crossbeam_channel::Sender<Result<ServerHello, ProtocolError>>,
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

/// Open the socket, send our hello and wait for the server's.
async fn handshake(
    request: Request,
    hello_text: String,
    default_rate: u32,
) -> Result<(WsWrite, WsRead, ServerHello), ProtocolError> {
    let (ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| ProtocolError::Connect(e.to_string()))?;
    let (mut write, mut read) = ws.split();
    write
        .send(Message::Text(hello_text))
        .await
        .map_err(|e| ProtocolError::Send(e.to_string()))?;

    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match ControlMessage::parse(&text) {
                Ok(Envelope {
                    session_id,
                    message: ControlMessage::Hello(hello),
                }) => {
                    let server = ServerHello::from_message(hello, session_id, default_rate);
                    return Ok((write, read, server));
                }
                Ok(other) => debug!("ignoring {} before hello", other.message.wire_type()),
                Err(e) => debug!("ignoring unparseable message before hello: {e}"),
            },
            Some(Ok(Message::Close(_))) | None => {
                return Err(ProtocolError::Closed("server closed during handshake".into()));
            }
            Some(Err(e)) => return Err(ProtocolError::Handshake(e.to_string())),
            Some(Ok(_)) => {}
        }
    }
}

async fn run_connection(
    ctx: LoopContext,
    mut out_rx: mpsc::UnboundedReceiver<Message>,
    cancel: CancellationToken,
) {
    let LoopContext {
        request,
        hello_text,
        version,
        timeout,
        default_rate,
        listener,
        state,
        ready,
    } = ctx;

    let result = tokio::select! {
        () = cancel.cancelled() => return,
        r = tokio::time::timeout(timeout, handshake(request, hello_text, default_rate)) => r.unwrap_or_else(|_| {
            Err(ProtocolError::Timeout("no server hello".into()))
        }),
    };
    let (mut write, mut read, server) = match result {
        Ok(parts) => parts,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    *state.session_id() = server.session_id.clone();
    state.server_rate.store(server.sample_rate, Ordering::Release);
    state.connected.store(true, Ordering::Release);
    let rate = server.sample_rate;
    let _ = ready.send(Ok(server));

    let reason = loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                break None;
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => dispatch_text(&text, &listener),
                Some(Ok(Message::Binary(data))) => dispatch_binary(&data, version, rate, &listener),
                Some(Ok(Message::Close(frame))) => {
                    break Some(frame.map_or_else(
                        || "closed by server".to_owned(),
                        |f| format!("closed by server: {}", f.reason),
                    ));
                }
                None => break Some("connection lost".to_owned()),
                Some(Err(e)) => break Some(format!("read error: {e}")),
                Some(Ok(_)) => {}
            },
            Some(out) = out_rx.recv() => {
                if let Err(e) = write.send(out).await {
                    break Some(format!("send error: {e}"));
                }
            }
        }
    };

    state.connected.store(false, Ordering::Release);
    if let Some(reason) = reason {
        warn!("websocket dropped: {reason}");
        if let Some(listener) = listener.get() {
            listener.on_channel_closed(Some(reason));
        }
    }
}

fn dispatch_text(text: &str, listener: &ListenerSlot) {
    match ControlMessage::parse(text) {
        Ok(Envelope {
            message: ControlMessage::Hello(_),
            ..
        }) => debug!("ignoring repeated hello"),
        Ok(envelope) => {
            if let Some(listener) = listener.get() {
                listener.on_control(envelope.message);
            }
        }
        Err(e) => debug!("ignoring unparseable control message: {e}"),
    }
}

fn dispatch_binary(data: &[u8], version: BinaryVersion, rate: u32, listener: &ListenerSlot) {
    let frame = match binary::decode(version, data) {
        Ok(frame) => frame,
        Err(e) => {
            debug!("dropping binary frame: {e}");
            return;
        }
    };
    if frame.kind == TYPE_JSON {
        match std::str::from_utf8(&frame.payload) {
            Ok(text) => dispatch_text(text, listener),
            Err(e) => debug!("dropping non-UTF-8 JSON frame: {e}"),
        }
        return;
    }
    if let Some(listener) = listener.get() {
        listener.on_audio(AudioFrame::encoded(frame.payload, rate, frame.timestamp));
    }
}
