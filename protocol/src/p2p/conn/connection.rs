//! The multiplexed connection.
//!
//! Two tasks per connection: the send routine owns the write half and the
//! per-channel queues, the receive routine owns the read half and the
//! reassembly buffers. They talk through a small control channel (pong
//! requests and pong arrivals) and share one quit signal.

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, trace};

use super::packet::{max_frame_size, read_packet, write_packet, Packet};
use super::throttle::RateLimiter;
use super::ConnError;
use crate::config::{
    DEFAULT_MAX_PACKET_PAYLOAD, DEFAULT_RECV_MESSAGE_CAPACITY, DEFAULT_RECV_RATE,
    DEFAULT_SEND_QUEUE_CAPACITY, DEFAULT_SEND_RATE, DEFAULT_SEND_TIMEOUT, FLUSH_THROTTLE,
    PING_INTERVAL, PONG_TIMEOUT,
};

const STATS_UPDATE_INTERVAL: Duration = Duration::from_secs(2);
/// Frames written per wakeup before the send routine looks at its timers
/// and control messages again.
const SEND_BATCH_SIZE: usize = 10;
const RECENTLY_SENT_DECAY: f64 = 0.8;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// A logical channel as declared by a reactor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDescriptor {
    pub id: u8,
    pub priority: u32,
    pub send_queue_capacity: usize,
    pub recv_message_capacity: usize,
}

impl ChannelDescriptor {
    pub fn new(id: u8, priority: u32) -> Self {
        Self {
            id,
            priority,
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
            recv_message_capacity: DEFAULT_RECV_MESSAGE_CAPACITY,
        }
    }

    pub fn with_send_queue_capacity(mut self, capacity: usize) -> Self {
        self.send_queue_capacity = capacity.max(1);
        self
    }
}

#[derive(Debug, Clone)]
pub struct MConnConfig {
    /// Bytes per second; zero disables shaping.
    pub send_rate: u64,
    pub recv_rate: u64,
    pub max_packet_payload: usize,
    pub flush_throttle: Duration,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    /// Deadline of a blocking [`MConnection::send`].
    pub send_timeout: Duration,
}

impl Default for MConnConfig {
    fn default() -> Self {
        Self {
            send_rate: DEFAULT_SEND_RATE,
            recv_rate: DEFAULT_RECV_RATE,
            max_packet_payload: DEFAULT_MAX_PACKET_PAYLOAD,
            flush_throttle: FLUSH_THROTTLE,
            ping_interval: PING_INTERVAL,
            pong_timeout: PONG_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

/// Callbacks into the owner of a connection.
///
/// Both run on the connection's tasks and must not block. `on_error` is
/// called at most once, after which the connection is stopped.
pub trait ConnHandler: Send + Sync + 'static {
    fn on_receive(&self, channel: u8, msg: Vec<u8>);
    fn on_error(&self, err: ConnError);
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    pub id: u8,
    pub priority: u32,
    pub send_queue_capacity: usize,
    pub send_queue_size: usize,
    pub recently_sent: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub duration_secs: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub channels: Vec<ChannelStatus>,
}

// ---------------------------------------------------------------------------
// Connection Handle
// ---------------------------------------------------------------------------

struct Shared {
    handler: Arc<dyn ConnHandler>,
    quit: watch::Sender<bool>,
    stopped: AtomicBool,
    sent: AtomicU64,
    received: AtomicU64,
}

impl Shared {
    fn fail(&self, err: ConnError) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            debug!(error = %err, "connection failed");
            self.quit.send_replace(true);
            self.handler.on_error(err);
        }
    }
}

struct ChannelHandle {
    desc: ChannelDescriptor,
    tx: mpsc::Sender<Bytes>,
    recently_sent: Arc<AtomicU64>,
}

enum Control {
    SendPong,
    PongReceived,
}

pub struct MConnection {
    channels: HashMap<u8, ChannelHandle>,
    config: MConnConfig,
    wake: Arc<Notify>,
    shared: Arc<Shared>,
    created: Instant,
    routines: Mutex<Option<[BoxFuture<'static, ()>; 2]>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MConnection {
    /// Wraps `stream`. Nothing is read or written until [`start`](Self::start).
    pub fn new<S>(
        stream: S,
        descriptors: &[ChannelDescriptor],
        handler: Arc<dyn ConnHandler>,
        config: MConnConfig,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (quit, quit_rx) = watch::channel(false);
        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        let wake = Arc::new(Notify::new());
        let shared = Arc::new(Shared {
            handler,
            quit,
            stopped: AtomicBool::new(false),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
        });

        let mut channels = HashMap::new();
        let mut send_channels = Vec::new();
        let mut recv_channels = HashMap::new();
        for desc in descriptors {
            let (tx, rx) = mpsc::channel(desc.send_queue_capacity.max(1));
            let recently_sent = Arc::new(AtomicU64::new(0));
            send_channels.push(SendChannel {
                id: desc.id,
                priority: desc.priority.max(1),
                rx,
                sending: None,
                recently_sent: recently_sent.clone(),
            });
            recv_channels.insert(
                desc.id,
                RecvChannel {
                    capacity: desc.recv_message_capacity,
                    buf: Vec::new(),
                },
            );
            channels.insert(
                desc.id,
                ChannelHandle {
                    desc: desc.clone(),
                    tx,
                    recently_sent,
                },
            );
        }

        let sender = SendRoutine {
            writer: BufWriter::new(write_half),
            channels: send_channels,
            ctl: ctl_rx,
            wake: wake.clone(),
            limiter: RateLimiter::new(config.send_rate),
            config: config.clone(),
            quit: quit_rx.clone(),
            shared: shared.clone(),
        };
        let receiver = RecvRoutine {
            reader: BufReader::new(read_half),
            channels: recv_channels,
            ctl: ctl_tx,
            limiter: RateLimiter::new(config.recv_rate),
            max_payload: config.max_packet_payload,
            quit: quit_rx,
            shared: shared.clone(),
        };

        let send_shared = shared.clone();
        let send = async move {
            if let Err(e) = sender.run().await {
                send_shared.fail(e);
            }
        }
        .boxed();
        let recv_shared = shared.clone();
        let recv = async move {
            if let Err(e) = receiver.run().await {
                recv_shared.fail(e);
            }
        }
        .boxed();

        Self {
            channels,
            config,
            wake,
            shared,
            created: Instant::now(),
            routines: Mutex::new(Some([send, recv])),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the send and receive routines. Later calls are no-ops.
    pub fn start(&self) {
        let Some(routines) = self.routines.lock().take() else {
            return;
        };
        if !self.is_running() {
            return;
        }
        let mut tasks = self.tasks.lock();
        for routine in routines {
            tasks.push(tokio::spawn(routine));
        }
    }

    /// Queues `msg` on `channel`, waiting up to the send timeout for room.
    /// Returns `false` on an unknown channel, a timeout, or a stopped
    /// connection. A timeout fails the whole connection.
    pub async fn send(&self, channel: u8, msg: impl Into<Bytes>) -> bool {
        if !self.is_running() {
            return false;
        }
        let Some(ch) = self.channels.get(&channel) else {
            debug!(channel, "send on unknown channel");
            return false;
        };
        match tokio::time::timeout(self.config.send_timeout, ch.tx.send(msg.into())).await {
            Ok(Ok(())) => {
                self.wake.notify_one();
                true
            }
            Ok(Err(_)) => false,
            Err(_) => {
                self.shared.fail(ConnError::SendTimeout(channel));
                false
            }
        }
    }

    /// Queues `msg` only if there is room right now.
    pub fn try_send(&self, channel: u8, msg: impl Into<Bytes>) -> bool {
        if !self.is_running() {
            return false;
        }
        let Some(ch) = self.channels.get(&channel) else {
            return false;
        };
        match ch.tx.try_send(msg.into()) {
            Ok(()) => {
                self.wake.notify_one();
                true
            }
            Err(_) => false,
        }
    }

    pub fn can_send(&self, channel: u8) -> bool {
        self.is_running()
            && self
                .channels
                .get(&channel)
                .map(|ch| ch.tx.capacity() > 0)
                .unwrap_or(false)
    }

    pub fn is_running(&self) -> bool {
        !self.shared.stopped.load(Ordering::SeqCst)
    }

    /// Stops both routines and closes the stream. Does not call `on_error`.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.quit.send_replace(true);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        let mut channels: Vec<ChannelStatus> = self
            .channels
            .values()
            .map(|ch| ChannelStatus {
                id: ch.desc.id,
                priority: ch.desc.priority,
                send_queue_capacity: ch.desc.send_queue_capacity,
                send_queue_size: ch.tx.max_capacity() - ch.tx.capacity(),
                recently_sent: ch.recently_sent.load(Ordering::Relaxed),
            })
            .collect();
        channels.sort_by_key(|c| c.id);
        ConnectionStatus {
            duration_secs: self.created.elapsed().as_secs(),
            bytes_sent: self.shared.sent.load(Ordering::Relaxed),
            bytes_received: self.shared.received.load(Ordering::Relaxed),
            channels,
        }
    }
}

impl Drop for MConnection {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Send Routine
// ---------------------------------------------------------------------------

struct SendChannel {
    id: u8,
    priority: u32,
    rx: mpsc::Receiver<Bytes>,
    sending: Option<(Bytes, usize)>,
    recently_sent: Arc<AtomicU64>,
}

impl SendChannel {
    fn is_send_pending(&mut self) -> bool {
        if self.sending.is_none() {
            if let Ok(msg) = self.rx.try_recv() {
                self.sending = Some((msg, 0));
            }
        }
        self.sending.is_some()
    }

    /// Next frame of the message in flight.
    fn next_packet(&mut self, max_payload: usize) -> Packet {
        let Some((msg, offset)) = self.sending.as_mut() else {
            return Packet::msg(self.id, true, Vec::new());
        };
        let end = (*offset + max_payload).min(msg.len());
        let data = msg[*offset..end].to_vec();
        *offset = end;
        let eof = end == msg.len();
        if eof {
            self.sending = None;
        }
        Packet::msg(self.id, eof, data)
    }

    fn load(&self) -> f64 {
        self.recently_sent.load(Ordering::Relaxed) as f64 / self.priority as f64
    }
}

struct SendRoutine<W> {
    writer: BufWriter<W>,
    channels: Vec<SendChannel>,
    ctl: mpsc::UnboundedReceiver<Control>,
    wake: Arc<Notify>,
    limiter: RateLimiter,
    config: MConnConfig,
    quit: watch::Receiver<bool>,
    shared: Arc<Shared>,
}

impl<W: AsyncWrite + Unpin> SendRoutine<W> {
    async fn run(mut self) -> Result<(), ConnError> {
        let start = Instant::now();
        let mut ping_tick = interval_at(start + self.config.ping_interval, self.config.ping_interval);
        ping_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stats_tick = interval_at(start + STATS_UPDATE_INTERVAL, STATS_UPDATE_INTERVAL);
        stats_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut pong_deadline: Option<Instant> = None;
        let mut flush_at: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = ping_tick.tick() => {
                    trace!("send ping");
                    self.write(&Packet::Ping).await?;
                    self.writer.flush().await?;
                    pong_deadline.get_or_insert_with(|| Instant::now() + self.config.pong_timeout);
                }
                _ = stats_tick.tick() => {
                    for ch in &self.channels {
                        let decayed = ch.recently_sent.load(Ordering::Relaxed) as f64 * RECENTLY_SENT_DECAY;
                        ch.recently_sent.store(decayed as u64, Ordering::Relaxed);
                    }
                }
                Some(ctl) = self.ctl.recv() => match ctl {
                    Control::SendPong => {
                        trace!("send pong");
                        self.write(&Packet::Pong).await?;
                        self.writer.flush().await?;
                    }
                    Control::PongReceived => {
                        // Pongs without an outstanding ping are ignored.
                        pong_deadline = None;
                    }
                },
                _ = sleep_until(pong_deadline.unwrap_or(start)), if pong_deadline.is_some() => {
                    return Err(ConnError::PongTimeout);
                }
                _ = sleep_until(flush_at.unwrap_or(start)), if flush_at.is_some() => {
                    self.writer.flush().await?;
                    flush_at = None;
                }
                _ = self.quit.changed() => return Ok(()),
            }
            if *self.quit.borrow() {
                return Ok(());
            }

            if self.send_pending().await? && flush_at.is_none() {
                flush_at = Some(Instant::now() + self.config.flush_throttle);
            }
        }
    }

    /// Writes up to [`SEND_BATCH_SIZE`] frames. If data is still queued
    /// afterwards the routine wakes itself for another round. Returns
    /// whether anything was written.
    async fn send_pending(&mut self) -> Result<bool, ConnError> {
        let mut wrote = false;
        for _ in 0..SEND_BATCH_SIZE {
            let Some(idx) = self.least_loaded() else {
                return Ok(wrote);
            };
            let packet = self.channels[idx].next_packet(self.config.max_packet_payload);
            let n = self.write(&packet).await?;
            self.channels[idx].recently_sent.fetch_add(n as u64, Ordering::Relaxed);
            wrote = true;
        }
        if self.least_loaded().is_some() {
            self.wake.notify_one();
        }
        Ok(wrote)
    }

    /// Pending channel with the lowest `recently_sent / priority`.
    fn least_loaded(&mut self) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (idx, ch) in self.channels.iter_mut().enumerate() {
            if !ch.is_send_pending() {
                continue;
            }
            let load = ch.load();
            if best.map_or(true, |(_, b)| load < b) {
                best = Some((idx, load));
            }
        }
        best.map(|(idx, _)| idx)
    }

    async fn write(&mut self, packet: &Packet) -> Result<usize, ConnError> {
        let n = write_packet(&mut self.writer, packet).await?;
        self.shared.sent.fetch_add(n as u64, Ordering::Relaxed);
        self.limiter.consume(n).await;
        Ok(n)
    }
}

// ---------------------------------------------------------------------------
// Receive Routine
// ---------------------------------------------------------------------------

struct RecvChannel {
    capacity: usize,
    buf: Vec<u8>,
}

struct RecvRoutine<R> {
    reader: BufReader<R>,
    channels: HashMap<u8, RecvChannel>,
    ctl: mpsc::UnboundedSender<Control>,
    limiter: RateLimiter,
    max_payload: usize,
    quit: watch::Receiver<bool>,
    shared: Arc<Shared>,
}

impl<R: AsyncRead + Unpin> RecvRoutine<R> {
    async fn run(mut self) -> Result<(), ConnError> {
        let max_frame = max_frame_size(self.max_payload);
        loop {
            let (packet, n) = tokio::select! {
                res = read_packet(&mut self.reader, max_frame) => res?,
                _ = self.quit.changed() => return Ok(()),
            };
            self.shared.received.fetch_add(n as u64, Ordering::Relaxed);
            self.limiter.consume(n).await;

            match packet {
                Packet::Ping => {
                    let _ = self.ctl.send(Control::SendPong);
                }
                Packet::Pong => {
                    let _ = self.ctl.send(Control::PongReceived);
                }
                Packet::Msg { channel, eof, data } => {
                    if data.len() > self.max_payload {
                        return Err(ConnError::MessageTooLarge {
                            channel,
                            size: data.len(),
                        });
                    }
                    let ch = self
                        .channels
                        .get_mut(&channel)
                        .ok_or(ConnError::UnknownChannel(channel))?;
                    if ch.buf.len() + data.len() > ch.capacity {
                        return Err(ConnError::MessageTooLarge {
                            channel,
                            size: ch.buf.len() + data.len(),
                        });
                    }
                    ch.buf.extend_from_slice(&data);
                    if eof {
                        let msg = std::mem::take(&mut ch.buf);
                        trace!(channel, len = msg.len(), "received message");
                        self.shared.handler.on_receive(channel, msg);
                    }
                }
            }
        }
    }
}
