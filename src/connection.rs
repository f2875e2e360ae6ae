//! Full-duplex TCP session with a Tuya device.
//!
//! One connection owns one socket plus two background tasks: a receive loop
//! that routes responses to pending requests by sequence number (unsolicited
//! frames go to a broadcast channel), and a periodic heartbeat. Writes are
//! serialized under a mutex; state transitions are observable through a
//! watch channel.

use crate::bytes;
use crate::error::{Result, TuyaError};
use crate::protocol::{CommandType, HEADER_LEN, MessageCodec, PREFIX_55AA, TuyaMessage};
use futures_core::stream::Stream;
use log::{debug, error, warn};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex as AsyncMutex, broadcast, oneshot, watch};
use tokio::time::{Duration, Instant, MissedTickBehavior, interval_at, timeout};
use tokio_util::sync::CancellationToken;

/// Unsolicited messages buffered per subscriber; the oldest are dropped on
/// lag since status pushes are idempotent refreshes.
const UNSOLICITED_BUFFER: usize = 16;

/// Observable lifecycle of a [`Connection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Failed(TuyaError),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Timeouts governing one TCP session.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionConfig {
    pub connection_timeout: Duration,
    pub response_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

type PendingMap = HashMap<u32, oneshot::Sender<TuyaMessage>>;

/// A TCP session with exactly one device.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct Connection {
    addr: String,
    codec: Arc<MessageCodec>,
    config: ConnectionConfig,
    seqno: Arc<AtomicU32>,
    pending: Arc<StdMutex<PendingMap>>,
    writer: Arc<AsyncMutex<Option<OwnedWriteHalf>>>,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    unsolicited_tx: broadcast::Sender<TuyaMessage>,
    cancel: Arc<StdMutex<CancellationToken>>,
}

impl Connection {
    /// Create a connection handle for `addr` ("ip:port"). No socket is
    /// opened until [`connect`](Self::connect).
    pub fn new<A: Into<String>>(addr: A, codec: MessageCodec, config: ConnectionConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (unsolicited_tx, _) = broadcast::channel(UNSOLICITED_BUFFER);
        Self {
            addr: addr.into(),
            codec: Arc::new(codec),
            config,
            seqno: Arc::new(AtomicU32::new(1)),
            pending: Arc::new(StdMutex::new(HashMap::new())),
            writer: Arc::new(AsyncMutex::new(None)),
            state_tx: Arc::new(state_tx),
            unsolicited_tx,
            cancel: Arc::new(StdMutex::new(CancellationToken::new())),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// A receiver observing every state transition.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Snapshot of the current state.
    pub fn current_state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state_tx.borrow().is_connected()
    }

    /// State transitions as a Stream, starting from the current state.
    pub fn state_stream(&self) -> impl Stream<Item = ConnectionState> + Send + 'static {
        let mut rx = self.state_tx.subscribe();
        async_stream::stream! {
            let current = rx.borrow_and_update().clone();
            yield current;
            while rx.changed().await.is_ok() {
                let state = rx.borrow_and_update().clone();
                yield state;
            }
        }
    }

    /// Subscribe to messages whose sequence number matches no pending
    /// request (status pushes from the device).
    pub fn subscribe(&self) -> broadcast::Receiver<TuyaMessage> {
        self.unsolicited_tx.subscribe()
    }

    /// Unsolicited messages as a Stream. Lagged entries are skipped.
    pub fn unsolicited_stream(&self) -> impl Stream<Item = TuyaMessage> + Send + 'static {
        let mut rx = self.unsolicited_tx.subscribe();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(msg) => yield msg,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    /// Establish the TCP session and start the receive and heartbeat tasks.
    ///
    /// Transitions Disconnected -> Connecting -> Connected within the
    /// connection timeout, or into Failed on error.
    pub async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.state_tx.send_replace(ConnectionState::Connecting);
        debug!("connecting to {}", self.addr);

        let stream = match timeout(
            self.config.connection_timeout,
            TcpStream::connect(&self.addr),
        )
        .await
        {
            Err(_) => {
                let err = TuyaError::ConnectTimeout;
                self.state_tx.send_replace(ConnectionState::Failed(err.clone()));
                return Err(err);
            }
            Ok(Err(e)) => {
                let err = if e.kind() == std::io::ErrorKind::ConnectionRefused {
                    TuyaError::ConnectionFailed
                } else {
                    TuyaError::Io(e.to_string())
                };
                self.state_tx.send_replace(ConnectionState::Failed(err.clone()));
                return Err(err);
            }
            Ok(Ok(s)) => s,
        };

        // Fresh sequence space and task scope for this session
        self.seqno.store(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        {
            let mut guard = self.cancel.lock().expect("cancel token lock poisoned");
            guard.cancel();
            *guard = token.clone();
        }

        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);
        self.state_tx.send_replace(ConnectionState::Connected);
        debug!("connected to {}", self.addr);

        let conn = self.clone();
        let recv_token = token.clone();
        tokio::spawn(async move { conn.run_receive_loop(read_half, recv_token).await });

        let conn = self.clone();
        tokio::spawn(async move { conn.run_heartbeat(token).await });

        Ok(())
    }

    /// Tear the session down: cancel the background tasks, cancel every
    /// pending request, and close the socket. Always ends Disconnected.
    ///
    /// The teardown runs on a spawned task so it completes even when the
    /// caller is cancelled mid-await; otherwise the socket could leak.
    pub async fn disconnect(&self) {
        let conn = self.clone();
        let teardown = tokio::spawn(async move { conn.teardown().await });
        let _ = teardown.await;
    }

    async fn teardown(&self) {
        if matches!(self.current_state(), ConnectionState::Disconnected) {
            return;
        }
        self.state_tx.send_replace(ConnectionState::Disconnecting);
        debug!("disconnecting from {}", self.addr);

        self.cancel.lock().expect("cancel token lock poisoned").cancel();
        self.cancel_pending();

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }

    /// Send a message and await the response with the matching sequence
    /// number. A zero sequence number is replaced with a freshly assigned
    /// one. Times out with `ResponseTimeout` after the response timeout.
    pub async fn send(&self, mut msg: TuyaMessage) -> Result<TuyaMessage> {
        if !self.is_connected() {
            return Err(TuyaError::NotConnected);
        }
        if msg.seqno == 0 {
            msg.seqno = self.next_seqno();
        }
        let seqno = msg.seqno;

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending map lock poisoned")
            .insert(seqno, tx);
        let mut guard = PendingGuard {
            pending: &self.pending,
            seqno,
            armed: true,
        };

        // The session may have failed between the state check and the
        // insert; the guard removes the orphaned entry.
        if !self.is_connected() {
            return Err(TuyaError::NotConnected);
        }

        self.write_message(&msg).await?;

        match timeout(self.config.response_timeout, rx).await {
            Ok(Ok(response)) => {
                guard.armed = false;
                Ok(response)
            }
            // Sender dropped: the connection was torn down mid-flight
            Ok(Err(_)) => {
                guard.armed = false;
                Err(TuyaError::ConnectionClosed)
            }
            Err(_) => {
                debug!("response timeout for seqno {}", seqno);
                Err(TuyaError::ResponseTimeout)
            }
        }
    }

    /// Fire-and-forget send; no pending entry is created.
    pub async fn send_no_response(&self, mut msg: TuyaMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(TuyaError::NotConnected);
        }
        if msg.seqno == 0 {
            msg.seqno = self.next_seqno();
        }
        self.write_message(&msg).await
    }

    /// Send an empty heartbeat frame and await its response.
    pub async fn send_heartbeat(&self) -> Result<TuyaMessage> {
        self.send(TuyaMessage::empty(CommandType::HeartBeat)).await
    }

    fn next_seqno(&self) -> u32 {
        self.seqno.fetch_add(1, Ordering::SeqCst)
    }

    async fn write_message(&self, msg: &TuyaMessage) -> Result<()> {
        let encoded = self.codec.encode(msg)?;
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TuyaError::NotConnected)?;
        timeout(self.config.connection_timeout, writer.write_all(&encoded))
            .await
            .map_err(|_| TuyaError::Io("write timeout".into()))?
            .map_err(TuyaError::from)?;
        Ok(())
    }

    /// Resolve every pending request with a cancellation outcome.
    fn cancel_pending(&self) {
        let drained: Vec<_> = self
            .pending
            .lock()
            .expect("pending map lock poisoned")
            .drain()
            .collect();
        if !drained.is_empty() {
            debug!("cancelling {} pending request(s)", drained.len());
        }
        // Dropping the senders resolves the receivers with an error.
    }

    /// Transition into Failed and clean up. A no-op when a disconnect is
    /// already in progress.
    async fn fail(&self, err: TuyaError) {
        let transitioned = self.state_tx.send_if_modified(|state| {
            if matches!(
                state,
                ConnectionState::Connected | ConnectionState::Connecting
            ) {
                *state = ConnectionState::Failed(err.clone());
                true
            } else {
                false
            }
        });
        if !transitioned {
            return;
        }
        warn!("connection to {} failed: {}", self.addr, err);
        self.cancel.lock().expect("cancel token lock poisoned").cancel();
        self.cancel_pending();
        self.writer.lock().await.take();
    }

    async fn run_receive_loop(self, mut reader: OwnedReadHalf, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                frame = self.read_frame(&mut reader) => {
                    match frame.and_then(|f| self.codec.decode(&f, Some(false))) {
                        Ok(msg) => self.dispatch(msg),
                        Err(e) => {
                            self.fail(e).await;
                            break;
                        }
                    }
                }
            }
        }
        debug!("receive loop for {} stopped", self.addr);
    }

    /// Read one full frame: prefix, remaining header, then exactly the
    /// declared number of bytes.
    async fn read_frame(&self, reader: &mut OwnedReadHalf) -> Result<Vec<u8>> {
        let mut header = [0u8; HEADER_LEN];
        reader.read_exact(&mut header[..4]).await?;
        if bytes::read_u32_be(&header, 0)? != PREFIX_55AA {
            return Err(TuyaError::MalformedFrame("bad prefix".into()));
        }

        let io_timeout = self.config.connection_timeout;
        timeout(io_timeout, reader.read_exact(&mut header[4..]))
            .await
            .map_err(|_| TuyaError::Io("read header timeout".into()))??;

        let declared = bytes::read_u32_be(&header, 12)? as usize;
        if declared > crate::protocol::MAX_PAYLOAD_LEN as usize {
            return Err(TuyaError::MalformedFrame(format!(
                "declared length {} too large",
                declared
            )));
        }
        let mut frame = header.to_vec();
        frame.resize(HEADER_LEN + declared, 0);
        timeout(io_timeout, reader.read_exact(&mut frame[HEADER_LEN..]))
            .await
            .map_err(|_| TuyaError::Io("read body timeout".into()))??;

        Ok(frame)
    }

    fn dispatch(&self, msg: TuyaMessage) {
        let sender = self
            .pending
            .lock()
            .expect("pending map lock poisoned")
            .remove(&msg.seqno);
        match sender {
            Some(tx) => {
                debug!("routed response for seqno {}", msg.seqno);
                if tx.send(msg).is_err() {
                    debug!("requester gone before response arrived");
                }
            }
            None => {
                debug!(
                    "unsolicited message: cmd={:?} seqno={} payload_len={}",
                    msg.cmd,
                    msg.seqno,
                    msg.payload.len()
                );
                let _ = self.unsolicited_tx.send(msg);
            }
        }
    }

    async fn run_heartbeat(self, token: CancellationToken) {
        // Start jitter avoids synchronized heartbeats across many devices
        let jitter = Duration::from_millis((rand::rng().next_u32() % 2000) as u64);
        let mut interval = interval_at(
            Instant::now() + self.config.heartbeat_interval + jitter,
            self.config.heartbeat_interval,
        );
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.send_heartbeat().await {
                        error!("heartbeat to {} failed: {}", self.addr, e);
                        self.fail(e).await;
                        break;
                    }
                    debug!("heartbeat to {} acknowledged", self.addr);
                }
            }
        }
        debug!("heartbeat task for {} stopped", self.addr);
    }
}

/// Removes a pending entry when its request is dropped before resolving
/// (caller cancellation, timeout, or write failure).
struct PendingGuard<'a> {
    pending: &'a StdMutex<PendingMap>,
    seqno: u32,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed
            && let Ok(mut map) = self.pending.lock()
        {
            map.remove(&self.seqno);
        }
    }
}
