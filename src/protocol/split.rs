//! Split protocol variant: control JSON over a reliable ordered channel,
//! audio over best-effort datagrams.
//!
//! The server hello on the control channel announces the datagram endpoint,
//! a hex key and a hex 16-byte packet header template. Every datagram is
//! that header with length, timestamp and sequence filled in, followed by
//! the payload run through a [`PayloadCipher`]:
//!
//! ```text
//! [0]     0x01 (audio)
//! [1]     flags
//! [2..4]  payload length   u16 BE
//! [4..8]  ssrc             u32 BE
//! [8..12] timestamp        u32 BE
//! [12..16] sequence        u32 BE
//! ```

use crate::audio::frame::AudioFrame;
use crate::error::ProtocolError;
use crate::protocol::message::{ControlMessage, Envelope};
use crate::protocol::net::NetTask;
use crate::protocol::{HelloSettings, ListenerSlot, Protocol, ProtocolListener, ServerHello};
use crossbeam_channel::RecvTimeoutError;
use ctr::cipher::{KeyIvInit, StreamCipher};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Protocol version announced in the split hello.
pub const SPLIT_PROTOCOL_VERSION: u8 = 3;

pub const PACKET_TYPE_AUDIO: u8 = 0x01;
pub const PACKET_HEADER_LEN: usize = 16;

const MAX_DATAGRAM: usize = 2048;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Channel seams ───────────────────────────────────────────────────

/// Something that happened on the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Message(String),
    /// The peer or the network closed the channel. Not raised for a local
    /// `close()`.
    Closed(Option<String>),
}

pub type ChannelEvents = Arc<dyn Fn(ChannelEvent) + Send + Sync>;
pub type DatagramHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Reliable, ordered carrier for control JSON.
pub trait ControlChannel: Send + Sync {
    /// Connect and start delivering events. Blocks until connected.
    ///
    /// # Errors
    ///
    /// Connect failures and timeouts.
    fn open(&self, events: ChannelEvents) -> Result<(), ProtocolError>;

    /// Queue one message. Messages queued before `close()` are still written.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::NotConnected`] when the channel is not open.
    fn send(&self, text: String) -> Result<(), ProtocolError>;

    /// Keep an idle channel alive.
    ///
    /// # Errors
    ///
    /// Same as [`ControlChannel::send`].
    fn keepalive(&self) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn close(&self);
}

/// Best-effort carrier for audio packets.
pub trait DatagramChannel: Send + Sync {
    /// # Errors
    ///
    /// Socket setup failures.
    fn open(&self, server: &str, port: u16, on_packet: DatagramHandler)
    -> Result<(), ProtocolError>;

    /// # Errors
    ///
    /// [`ProtocolError::NotConnected`] when the channel is not open.
    fn send(&self, packet: Vec<u8>) -> Result<(), ProtocolError>;

    fn close(&self);
}

/// Payload transform keyed by the session key and the packet header.
/// Applying it twice with the same inputs must restore the input.
pub trait PayloadCipher: Send + Sync {
    /// Reject key material this cipher cannot use.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Handshake`] for an unusable key.
    fn check_key(&self, _key: &[u8]) -> Result<(), ProtocolError> {
        Ok(())
    }

    /// # Errors
    ///
    /// [`ProtocolError::InvalidFrame`] if the payload cannot be transformed.
    fn apply(
        &self,
        key: &[u8],
        header: &[u8; PACKET_HEADER_LEN],
        data: &mut [u8],
    ) -> Result<(), ProtocolError>;
}

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

/// AES-128 in counter mode. The packet header is the initial counter block,
/// so every datagram gets its own keystream.
#[derive(Debug, Default, Clone, Copy)]
pub struct AesCtrCipher;

impl PayloadCipher for AesCtrCipher {
    fn check_key(&self, key: &[u8]) -> Result<(), ProtocolError> {
        if key.len() == 16 {
            Ok(())
        } else {
            Err(ProtocolError::Handshake(format!(
                "udp key is {} bytes, want 16",
                key.len()
            )))
        }
    }

    fn apply(
        &self,
        key: &[u8],
        header: &[u8; PACKET_HEADER_LEN],
        data: &mut [u8],
    ) -> Result<(), ProtocolError> {
        let mut cipher = Aes128Ctr::new_from_slices(key, header)
            .map_err(|e| ProtocolError::InvalidFrame(format!("aes-ctr setup: {e}")))?;
        cipher.apply_keystream(data);
        Ok(())
    }
}

/// Leaves payloads untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughCipher;

impl PayloadCipher for PassthroughCipher {
    fn apply(
        &self,
        _key: &[u8],
        _header: &[u8; PACKET_HEADER_LEN],
        _data: &mut [u8],
    ) -> Result<(), ProtocolError> {
        Ok(())
    }
}

// ── Packet codec ────────────────────────────────────────────────────

/// Per-session datagram framing.
pub struct PacketCodec {
    template: [u8; PACKET_HEADER_LEN],
    key: Vec<u8>,
    cipher: Arc<dyn PayloadCipher>,
    local_sequence: AtomicU32,
    remote_sequence: Mutex<Option<u32>>,
}

impl PacketCodec {
    /// Build from the hex `key` and `nonce` of a server hello.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::Handshake`] for bad hex, a key the cipher rejects,
    /// or a nonce that is not 16 bytes.
    pub fn new(
        key_hex: &str,
        nonce_hex: &str,
        cipher: Arc<dyn PayloadCipher>,
    ) -> Result<Self, ProtocolError> {
        let key = hex::decode(key_hex)
            .map_err(|e| ProtocolError::Handshake(format!("udp key: {e}")))?;
        cipher.check_key(&key)?;
        let nonce = hex::decode(nonce_hex)
            .map_err(|e| ProtocolError::Handshake(format!("udp nonce: {e}")))?;
        let template: [u8; PACKET_HEADER_LEN] = nonce.as_slice().try_into().map_err(|_| {
            ProtocolError::Handshake(format!(
                "udp nonce is {} bytes, want {PACKET_HEADER_LEN}",
                nonce.len()
            ))
        })?;
        Ok(Self {
            template,
            key,
            cipher,
            local_sequence: AtomicU32::new(0),
            remote_sequence: Mutex::new(None),
        })
    }

    /// Frame one outbound payload with the next sequence number.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::InvalidFrame`] if the payload exceeds `u16::MAX`.
    pub fn seal(&self, timestamp: u32, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let len = u16::try_from(payload.len()).map_err(|_| {
            ProtocolError::InvalidFrame(format!("{} byte payload too large", payload.len()))
        })?;
        let sequence = self
            .local_sequence
            .fetch_add(1, Ordering::AcqRel)
            .wrapping_add(1);

        let mut header = self.template;
        header[0] = PACKET_TYPE_AUDIO;
        header[2..4].copy_from_slice(&len.to_be_bytes());
        header[8..12].copy_from_slice(&timestamp.to_be_bytes());
        header[12..16].copy_from_slice(&sequence.to_be_bytes());

        let mut body = payload.to_vec();
        self.cipher.apply(&self.key, &header, &mut body)?;

        let mut packet = Vec::with_capacity(PACKET_HEADER_LEN + body.len());
        packet.extend_from_slice(&header);
        packet.extend_from_slice(&body);
        Ok(packet)
    }

    /// Unframe one inbound packet, returning `(timestamp, payload)`.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::InvalidFrame`] for a wrong type byte, a short packet,
    /// an ssrc other than this session's, or a sequence not newer than the
    /// last accepted one.
    pub fn open(&self, packet: &[u8]) -> Result<(u32, Vec<u8>), ProtocolError> {
        let header: [u8; PACKET_HEADER_LEN] = packet
            .get(..PACKET_HEADER_LEN)
            .and_then(|h| h.try_into().ok())
            .ok_or_else(|| {
                ProtocolError::InvalidFrame(format!("{} byte datagram too short", packet.len()))
            })?;
        if header[0] != PACKET_TYPE_AUDIO {
            return Err(ProtocolError::InvalidFrame(format!(
                "datagram type {:#04x}",
                header[0]
            )));
        }
        if header[4..8] != self.template[4..8] {
            return Err(ProtocolError::InvalidFrame(format!(
                "datagram ssrc {} from another session",
                hex::encode(&header[4..8])
            )));
        }
        let len = usize::from(u16::from_be_bytes([header[2], header[3]]));
        let body = packet
            .get(PACKET_HEADER_LEN..PACKET_HEADER_LEN + len)
            .ok_or_else(|| {
                ProtocolError::InvalidFrame(format!(
                    "datagram claims {len} bytes, carries {}",
                    packet.len() - PACKET_HEADER_LEN
                ))
            })?;
        let timestamp = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
        let sequence = u32::from_be_bytes([header[12], header[13], header[14], header[15]]);

        {
            let mut last = lock(&self.remote_sequence);
            if let Some(prev) = *last
                && sequence <= prev
            {
                return Err(ProtocolError::InvalidFrame(format!(
                    "stale sequence {sequence} (last {prev})"
                )));
            }
            *last = Some(sequence);
        }

        let mut payload = body.to_vec();
        self.cipher.apply(&self.key, &header, &mut payload)?;
        Ok((timestamp, payload))
    }
}

// ── Protocol ────────────────────────────────────────────────────────

struct SplitShared {
    listener: ListenerSlot,
    connected: AtomicBool,
    default_rate: u32,
    server_rate: AtomicU32,
    session_id: Mutex<Option<String>>,
    hello_tx: Mutex<Option<crossbeam_channel::Sender<ServerHello>>>,
    codec: RwLock<Option<Arc<PacketCodec>>>,
    last_send: Mutex<Instant>,
}

impl SplitShared {
    fn codec(&self) -> Option<Arc<PacketCodec>> {
        self.codec
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_codec(&self, codec: Option<Arc<PacketCodec>>) {
        *self.codec.write().unwrap_or_else(PoisonError::into_inner) = codec;
    }

    fn touch(&self) {
        *lock(&self.last_send) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        lock(&self.last_send).elapsed()
    }

    fn on_control_text(&self, text: &str) {
        let Envelope {
            session_id,
            message,
        } = match ControlMessage::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!("ignoring unparseable control message: {e}");
                return;
            }
        };
        match message {
            ControlMessage::Hello(hello) => match lock(&self.hello_tx).take() {
                Some(tx) => {
                    let _ = tx.send(ServerHello::from_message(
                        hello,
                        session_id,
                        self.default_rate,
                    ));
                }
                None => debug!("ignoring unexpected hello"),
            },
            ControlMessage::Goodbye => {
                let current = lock(&self.session_id).clone();
                if session_id.is_some() && session_id != current {
                    debug!("ignoring goodbye for session {session_id:?}");
                    return;
                }
                info!("server closed audio session {current:?}");
                self.connected.store(false, Ordering::Release);
                self.set_codec(None);
                if let Some(listener) = self.listener.get() {
                    listener.on_control(ControlMessage::Goodbye);
                }
            }
            other => {
                if let Some(listener) = self.listener.get() {
                    listener.on_control(other);
                }
            }
        }
    }

    fn on_closed(&self, reason: Option<String>) {
        lock(&self.hello_tx).take();
        if self.connected.swap(false, Ordering::AcqRel) {
            warn!("control channel dropped: {reason:?}");
            if let Some(listener) = self.listener.get() {
                listener.on_channel_closed(reason);
            }
        }
    }

    fn on_datagram(&self, packet: &[u8]) {
        let Some(codec) = self.codec() else {
            return;
        };
        match codec.open(packet) {
            Ok((timestamp, payload)) => {
                if let Some(listener) = self.listener.get() {
                    let rate = self.server_rate.load(Ordering::Acquire);
                    listener.on_audio(AudioFrame::encoded(payload, rate, timestamp));
                }
            }
            Err(e) => debug!("dropping datagram: {e}"),
        }
    }
}

/// [`Protocol`] over a control channel plus a datagram channel.
pub struct SplitProtocol {
    control: Arc<dyn ControlChannel>,
    datagram: Box<dyn DatagramChannel>,
    hello: HelloSettings,
    keepalive: Duration,
    cipher: Arc<dyn PayloadCipher>,
    shared: Arc<SplitShared>,
    keepalive_task: Mutex<Option<NetTask>>,
}

impl SplitProtocol {
    /// A zero `keepalive` disables keepalives.
    #[must_use]
    pub fn new(
        control: Box<dyn ControlChannel>,
        datagram: Box<dyn DatagramChannel>,
        hello: HelloSettings,
        keepalive: Duration,
    ) -> Self {
        let shared = Arc::new(SplitShared {
            listener: ListenerSlot::default(),
            connected: AtomicBool::new(false),
            default_rate: hello.default_server_rate,
            server_rate: AtomicU32::new(hello.default_server_rate),
            session_id: Mutex::new(None),
            hello_tx: Mutex::new(None),
            codec: RwLock::new(None),
            last_send: Mutex::new(Instant::now()),
        });
        Self {
            control: Arc::from(control),
            datagram,
            hello,
            keepalive,
            cipher: Arc::new(AesCtrCipher),
            shared,
            keepalive_task: Mutex::new(None),
        }
    }

    /// Replace the payload cipher used for new sessions.
    #[must_use]
    pub fn with_cipher(mut self, cipher: Arc<dyn PayloadCipher>) -> Self {
        self.cipher = cipher;
        self
    }

    fn handshake(
        &self,
        hello_rx: &crossbeam_channel::Receiver<ServerHello>,
    ) -> Result<(), ProtocolError> {
        let shared = Arc::clone(&self.shared);
        let events: ChannelEvents = Arc::new(move |event: ChannelEvent| match event {
            ChannelEvent::Message(text) => shared.on_control_text(&text),
            ChannelEvent::Closed(reason) => shared.on_closed(reason),
        });
        self.control.open(events)?;

        let hello = self
            .hello
            .device_hello(SPLIT_PROTOCOL_VERSION, "udp")
            .to_wire(None)?;
        self.control.send(hello)?;

        let server = match hello_rx.recv_timeout(self.hello.timeout) {
            Ok(server) => server,
            Err(RecvTimeoutError::Timeout) => {
                return Err(ProtocolError::Timeout("no server hello".into()));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(ProtocolError::Closed("closed during connect".into()));
            }
        };
        let udp = server
            .udp
            .ok_or_else(|| ProtocolError::Handshake("server hello has no udp endpoint".into()))?;
        let codec = PacketCodec::new(&udp.key, &udp.nonce, Arc::clone(&self.cipher))?;

        self.shared.set_codec(Some(Arc::new(codec)));
        self.shared
            .server_rate
            .store(server.sample_rate, Ordering::Release);
        *lock(&self.shared.session_id) = server.session_id.clone();

        let shared = Arc::clone(&self.shared);
        self.datagram.open(
            &udp.server,
            udp.port,
            Arc::new(move |packet: Vec<u8>| shared.on_datagram(&packet)),
        )?;

        self.shared.touch();
        self.shared.connected.store(true, Ordering::Release);
        info!(
            "split session {:?} open, audio {}:{}, downlink {}Hz",
            server.session_id, udp.server, udp.port, server.sample_rate
        );
        Ok(())
    }

    fn start_keepalive(&self) -> Result<(), ProtocolError> {
        if self.keepalive.is_zero() {
            return Ok(());
        }
        let period = self.keepalive;
        let control = Arc::clone(&self.control);
        let shared = Arc::clone(&self.shared);
        let task = NetTask::spawn("fae-keepalive", move |cancel| async move {
            let mut tick = tokio::time::interval((period / 2).max(Duration::from_millis(1)));
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        if shared.idle_for() >= period {
                            if let Err(e) = control.keepalive() {
                                debug!("keepalive failed: {e}");
                            }
                            shared.touch();
                        }
                    }
                }
            }
        })?;
        *lock(&self.keepalive_task) = Some(task);
        Ok(())
    }
}

impl Protocol for SplitProtocol {
    fn name(&self) -> &'static str {
        "udp"
    }

    fn set_listener(&self, listener: Arc<dyn ProtocolListener>) {
        self.shared.listener.set(listener);
    }

    fn connect(&self) -> Result<(), ProtocolError> {
        self.close();

        let (hello_tx, hello_rx) = crossbeam_channel::bounded(1);
        *lock(&self.shared.hello_tx) = Some(hello_tx);

        let result = self
            .handshake(&hello_rx)
            .and_then(|()| self.start_keepalive());
        if let Err(e) = &result {
            warn!("split connect failed: {e}");
            self.close();
        }
        result
    }

    fn send_control(&self, message: &ControlMessage) -> Result<(), ProtocolError> {
        if !self.is_connected() {
            return Err(ProtocolError::NotConnected);
        }
        let session = lock(&self.shared.session_id).clone();
        let text = message.to_wire(session.as_deref())?;
        debug!("split send {}", message.wire_type());
        self.control.send(text)?;
        self.shared.touch();
        Ok(())
    }

    fn send_audio(&self, frame: AudioFrame) -> Result<(), ProtocolError> {
        if !self.is_connected() {
            return Err(ProtocolError::NotConnected);
        }
        let codec = self.shared.codec().ok_or(ProtocolError::NotConnected)?;
        let payload = frame
            .payload()
            .ok_or_else(|| ProtocolError::InvalidFrame("PCM frame handed to transport".into()))?;
        let packet = codec.seal(frame.timestamp, payload)?;
        self.datagram.send(packet)
    }

    fn close(&self) {
        if self.shared.connected.swap(false, Ordering::AcqRel) {
            let session = lock(&self.shared.session_id).clone();
            match ControlMessage::Goodbye.to_wire(session.as_deref()) {
                Ok(text) => {
                    if let Err(e) = self.control.send(text) {
                        debug!("goodbye not sent: {e}");
                    }
                }
                Err(e) => debug!("goodbye not sent: {e}"),
            }
        }
        lock(&self.shared.hello_tx).take();
        let task = lock(&self.keepalive_task).take();
        if let Some(mut task) = task {
            task.stop();
        }
        self.datagram.close();
        self.control.close();
        self.shared.set_codec(None);
        *lock(&self.shared.session_id) = None;
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    fn session_id(&self) -> Option<String> {
        lock(&self.shared.session_id).clone()
    }

    fn server_sample_rate(&self) -> u32 {
        self.shared.server_rate.load(Ordering::Acquire)
    }
}

impl Drop for SplitProtocol {
    fn drop(&mut self) {
        self.close();
    }
}

// ── TCP control channel ─────────────────────────────────────────────

struct ChannelConn {
    task: NetTask,
    outbound: mpsc::UnboundedSender<String>,
}

fn send_on(conn: &Mutex<Option<ChannelConn>>, item: String) -> Result<(), ProtocolError> {
    match lock(conn).as_ref() {
        Some(c) if !c.task.is_finished() => c
            .outbound
            .send(item)
            .map_err(|_| ProtocolError::Closed("channel loop ended".into())),
        _ => Err(ProtocolError::NotConnected),
    }
}

fn close_conn(conn: &Mutex<Option<ChannelConn>>) {
    let taken = lock(conn).take();
    if let Some(mut c) = taken {
        c.task.stop();
    }
}

/// Newline-delimited JSON over TCP.
pub struct TcpControlChannel {
    addr: String,
    connect_timeout: Duration,
    conn: Mutex<Option<ChannelConn>>,
}

impl TcpControlChannel {
    #[must_use]
    pub fn new(addr: &str, connect_timeout: Duration) -> Self {
        Self {
            addr: addr.to_owned(),
            connect_timeout,
            conn: Mutex::new(None),
        }
    }
}

impl ControlChannel for TcpControlChannel {
    fn open(&self, events: ChannelEvents) -> Result<(), ProtocolError> {
        self.close();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let addr = self.addr.clone();
        let timeout = self.connect_timeout;
        let task = NetTask::spawn("fae-control", move |cancel| {
            run_tcp_control(addr, timeout, events, out_rx, ready_tx, cancel)
        })?;
        *lock(&self.conn) = Some(ChannelConn {
            task,
            outbound: out_tx,
        });

        let outcome = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(ProtocolError::Closed("closed during connect".into())));
        if outcome.is_err() {
            close_conn(&self.conn);
        }
        outcome
    }

    fn send(&self, text: String) -> Result<(), ProtocolError> {
        send_on(&self.conn, text)
    }

    fn keepalive(&self) -> Result<(), ProtocolError> {
        // A blank line; receivers skip it.
        send_on(&self.conn, String::new())
    }

    fn close(&self) {
        close_conn(&self.conn);
    }
}

impl Drop for TcpControlChannel {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_tcp_control(
    addr: String,
    timeout: Duration,
    events: ChannelEvents,
    mut out_rx: mpsc::UnboundedReceiver<String>,
    ready: crossbeam_channel::Sender<Result<(), ProtocolError>>,
    cancel: CancellationToken,
) {
    let connected = tokio::select! {
        () = cancel.cancelled() => return,
        r = tokio::time::timeout(timeout, TcpStream::connect(&addr)) => match r {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                let _ = ready.send(Err(ProtocolError::Connect(format!("{addr}: {e}"))));
                return;
            }
            Err(_) => {
                let _ = ready.send(Err(ProtocolError::Timeout(format!("connecting to {addr}"))));
                return;
            }
        },
    };
    debug!("control channel connected to {addr}");
    let _ = ready.send(Ok(()));

    let (reader, writer) = connected.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut writer = BufWriter::new(writer);

    let reason = loop {
        tokio::select! {
            () = cancel.cancelled() => {
                // Flush what was queued before close, e.g. a goodbye.
                while let Ok(text) = out_rx.try_recv() {
                    if write_line(&mut writer, &text).await.is_err() {
                        break;
                    }
                }
                break None;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if !line.is_empty() {
                        events(ChannelEvent::Message(line.to_owned()));
                    }
                }
                Ok(None) => break Some("closed by server".to_owned()),
                Err(e) => break Some(format!("read error: {e}")),
            },
            Some(text) = out_rx.recv() => {
                if let Err(e) = write_line(&mut writer, &text).await {
                    break Some(format!("write error: {e}"));
                }
            }
        }
    };

    if let Some(reason) = reason {
        events(ChannelEvent::Closed(Some(reason)));
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, text: &str) -> std::io::Result<()> {
    writer.write_all(text.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

// ── UDP datagram channel ────────────────────────────────────────────

struct DatagramConn {
    task: NetTask,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

/// Connected UDP socket on its own network thread.
#[derive(Default)]
pub struct UdpDatagramChannel {
    conn: Mutex<Option<DatagramConn>>,
}

impl UdpDatagramChannel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl DatagramChannel for UdpDatagramChannel {
    fn open(
        &self,
        server: &str,
        port: u16,
        on_packet: DatagramHandler,
    ) -> Result<(), ProtocolError> {
        self.close();
        let target = format!("{server}:{port}");
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let task = NetTask::spawn("fae-udp", move |cancel| {
            run_udp(target, on_packet, out_rx, ready_tx, cancel)
        })?;
        *lock(&self.conn) = Some(DatagramConn {
            task,
            outbound: out_tx,
        });

        let outcome = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(ProtocolError::Closed("closed during connect".into())));
        if outcome.is_err() {
            self.close();
        }
        outcome
    }

    fn send(&self, packet: Vec<u8>) -> Result<(), ProtocolError> {
        match lock(&self.conn).as_ref() {
            Some(c) if !c.task.is_finished() => c
                .outbound
                .send(packet)
                .map_err(|_| ProtocolError::Closed("udp loop ended".into())),
            _ => Err(ProtocolError::NotConnected),
        }
    }

    fn close(&self) {
        let taken = lock(&self.conn).take();
        if let Some(mut c) = taken {
            c.task.stop();
        }
    }
}

impl Drop for UdpDatagramChannel {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_udp(
    target: String,
    on_packet: DatagramHandler,
    mut out_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ready: crossbeam_channel::Sender<Result<(), ProtocolError>>,
    cancel: CancellationToken,
) {
    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => socket,
        Err(e) => {
            let _ = ready.send(Err(ProtocolError::Connect(format!("udp bind: {e}"))));
            return;
        }
    };
    if let Err(e) = socket.connect(&target).await {
        let _ = ready.send(Err(ProtocolError::Connect(format!("udp {target}: {e}"))));
        return;
    }
    debug!("udp channel connected to {target}");
    let _ = ready.send(Ok(()));

    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            r = socket.recv(&mut buf) => match r {
                Ok(n) => on_packet(buf[..n].to_vec()),
                // ICMP unreachable and friends; datagrams are best effort.
                Err(e) => debug!("udp recv: {e}"),
            },
            Some(packet) = out_rx.recv() => {
                if let Err(e) = socket.send(&packet).await {
                    debug!("udp send: {e}");
                }
            }
        }
    }
}
