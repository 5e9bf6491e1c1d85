use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};

use super::channel::{BoxedChannel, Connector};
use super::correlator::CommandSink;
use crate::protocol::{Frame, FrameDecoder, FrameDecoderConfig};
use crate::utils::error::{DriverError, Result};

const READ_CHUNK: usize = 256;
const OUTGOING_QUEUE_DEPTH: usize = 16;
const TRANSITION_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// What the link hands to the correlator, in arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Frame(Frame),
    /// The channel went away; nothing outstanding will be answered.
    Lost,
}

#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub retry_interval: Duration,
    pub connect_timeout: Duration,
    /// `None` keeps an idle channel open forever.
    pub activity_timeout: Option<Duration>,
    pub error_backoff: Duration,
    pub decoder: FrameDecoderConfig,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
            activity_timeout: Some(Duration::from_secs(60)),
            error_backoff: Duration::from_secs(2),
            decoder: FrameDecoderConfig::default(),
        }
    }
}

#[derive(Debug, Default)]
struct LinkCounters {
    connect_attempts: AtomicU64,
    connects: AtomicU64,
    disconnects: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_discarded: AtomicU64,
    frames_decoded: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    pub connect_attempts: u64,
    pub connects: u64,
    pub disconnects: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub bytes_discarded: u64,
    pub frames_decoded: u64,
}

impl LinkCounters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LinkStats {
        LinkStats {
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_discarded: self.bytes_discarded.load(Ordering::Relaxed),
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
        }
    }
}

struct Outgoing {
    bytes: Vec<u8>,
    ack: oneshot::Sender<Result<()>>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    outgoing: mpsc::Sender<Outgoing>,
    handle: JoinHandle<()>,
}

fn not_open() -> DriverError {
    DriverError::ConnectionError("channel not open".to_string())
}

/// Sole owner of the channel to the controller.
///
/// A single supervisor task walks the Disconnected -> Connecting -> Connected
/// cycle, retrying on a fixed interval. Because retries are a loop inside that
/// one task, a burst of close events can never stack up extra retry timers or
/// overlapping connect attempts.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    settings: LinkSettings,
    state: Arc<watch::Sender<ConnectionState>>,
    transitions: broadcast::Sender<ConnectionState>,
    events: mpsc::Sender<LinkEvent>,
    counters: Arc<LinkCounters>,
    running: Mutex<Option<Running>>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        settings: LinkSettings,
        events: mpsc::Sender<LinkEvent>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        Self {
            connector,
            settings,
            state: Arc::new(state),
            transitions,
            events,
            counters: Arc::new(LinkCounters::default()),
            running: Mutex::new(None),
        }
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Latest state only. Quick successions such as Connecting -> Disconnected
    /// on a refused connect collapse into the last value; use `transitions`
    /// to see every step.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Every state change in order, as long as the receiver keeps up.
    pub fn transitions(&self) -> broadcast::Receiver<ConnectionState> {
        self.transitions.subscribe()
    }

    pub fn stats(&self) -> LinkStats {
        self.counters.snapshot()
    }

    pub fn endpoint(&self) -> String {
        self.connector.describe()
    }

    pub fn is_running(&self) -> bool {
        self.running()
            .as_ref()
            .map(|running| !running.handle.is_finished())
            .unwrap_or(false)
    }

    /// Spawns the supervisor. Returns false if it was already running.
    pub fn start(&self) -> bool {
        let mut running = self.running();
        if let Some(current) = running.as_ref() {
            if !current.handle.is_finished() {
                debug!("Link supervisor already running for {}", self.connector.describe());
                return false;
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_QUEUE_DEPTH);
        let supervisor = Supervisor {
            connector: self.connector.clone(),
            settings: self.settings.clone(),
            state: self.state.clone(),
            transitions: self.transitions.clone(),
            events: self.events.clone(),
            counters: self.counters.clone(),
            outgoing: outgoing_rx,
            decoder: FrameDecoder::new(self.settings.decoder.clone()),
        };

        info!("🔌 Starting link supervisor for {}", self.connector.describe());
        let handle = tokio::spawn(supervisor.run(shutdown_rx));
        *running = Some(Running {
            shutdown: shutdown_tx,
            outgoing: outgoing_tx,
            handle,
        });
        true
    }

    /// Stops retries and tears the channel down. Returns false if nothing was running.
    pub async fn stop(&self) -> bool {
        let running = self.running().take();
        let Some(Running { shutdown, outgoing, handle }) = running else {
            return false;
        };

        let _ = shutdown.send(true);
        drop(outgoing);
        if let Err(e) = handle.await {
            error!("❌ Link supervisor ended abnormally: {}", e);
            self.state.send_replace(ConnectionState::Disconnected);
        }
        info!("🛑 Link to {} stopped", self.connector.describe());
        true
    }

    /// Queues bytes for the channel and waits until they are flushed.
    pub async fn write(&self, bytes: &[u8]) -> Result<()> {
        if self.state() != ConnectionState::Connected {
            return Err(not_open());
        }

        let outgoing = self
            .running()
            .as_ref()
            .map(|running| running.outgoing.clone())
            .ok_or_else(not_open)?;

        let (ack_tx, ack_rx) = oneshot::channel();
        outgoing
            .send(Outgoing {
                bytes: bytes.to_vec(),
                ack: ack_tx,
            })
            .await
            .map_err(|_| not_open())?;

        ack_rx.await.map_err(|_| not_open())?
    }
}

#[async_trait]
impl CommandSink for ConnectionManager {
    async fn send_command(&self, bytes: &[u8]) -> Result<()> {
        self.write(bytes).await
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Ok(running) = self.running.get_mut() {
            if let Some(running) = running.take() {
                let _ = running.shutdown.send(true);
            }
        }
    }
}

enum Exit {
    Closed(String),
    Failed(String),
    Shutdown,
}

struct Supervisor {
    connector: Arc<dyn Connector>,
    settings: LinkSettings,
    state: Arc<watch::Sender<ConnectionState>>,
    transitions: broadcast::Sender<ConnectionState>,
    events: mpsc::Sender<LinkEvent>,
    counters: Arc<LinkCounters>,
    outgoing: mpsc::Receiver<Outgoing>,
    decoder: FrameDecoder,
}

async fn idle_deadline(last_activity: Instant, limit: Option<Duration>) {
    match limit {
        Some(limit) => sleep_until(last_activity + limit).await,
        None => std::future::pending::<()>().await,
    }
}

impl Supervisor {
    fn transition(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!("🔄 Link {} -> {}", previous, next);
            let _ = self.transitions.send(next);
        }
    }

    fn reject_queued(&mut self) {
        while let Ok(queued) = self.outgoing.try_recv() {
            let _ = queued.ack.send(Err(not_open()));
        }
    }

    /// Waits out `delay` while turning away writes. Returns true on shutdown.
    async fn pause(&mut self, delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return false,
                _ = shutdown.changed() => return true,
                Some(queued) = self.outgoing.recv() => {
                    let _ = queued.ack.send(Err(not_open()));
                }
            }
        }
    }

    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut first_attempt = true;

        'supervise: loop {
            if !first_attempt && self.pause(self.settings.retry_interval, &mut shutdown).await {
                break 'supervise;
            }
            first_attempt = false;

            self.transition(ConnectionState::Connecting);
            LinkCounters::bump(&self.counters.connect_attempts, 1);

            let connector = self.connector.clone();
            let attempt = timeout(self.settings.connect_timeout, connector.connect());
            tokio::pin!(attempt);
            let attempt = loop {
                tokio::select! {
                    result = &mut attempt => break result,
                    _ = shutdown.changed() => break 'supervise,
                    Some(queued) = self.outgoing.recv() => {
                        let _ = queued.ack.send(Err(not_open()));
                    }
                }
            };

            let channel = match attempt {
                Ok(Ok(channel)) => channel,
                Ok(Err(e)) => {
                    warn!("⚠️  Connect to {} failed: {}", connector.describe(), e);
                    self.transition(ConnectionState::Disconnected);
                    continue;
                }
                Err(_) => {
                    warn!(
                        "⏰ Connect to {} timed out after {:?}",
                        connector.describe(),
                        self.settings.connect_timeout
                    );
                    self.transition(ConnectionState::Disconnected);
                    continue;
                }
            };

            LinkCounters::bump(&self.counters.connects, 1);
            self.transition(ConnectionState::Connected);
            info!("✅ Connected to {}", connector.describe());

            let exit = self.drive(channel, &mut shutdown).await;
            LinkCounters::bump(&self.counters.disconnects, 1);
            self.reject_queued();
            self.decoder.reset();
            let _ = self.events.send(LinkEvent::Lost).await;

            match exit {
                Exit::Closed(reason) => {
                    info!("📴 Channel closed: {}", reason);
                    self.transition(ConnectionState::Disconnected);
                }
                Exit::Failed(reason) => {
                    error!("❌ Channel failed: {}", reason);
                    self.transition(ConnectionState::Error);
                    let stopping = self.pause(self.settings.error_backoff, &mut shutdown).await;
                    self.transition(ConnectionState::Disconnected);
                    if stopping {
                        break 'supervise;
                    }
                }
                Exit::Shutdown => break 'supervise,
            }
        }

        self.outgoing.close();
        self.reject_queued();
        self.transition(ConnectionState::Disconnected);
        debug!("Link supervisor for {} exited", self.connector.describe());
    }

    async fn drive(&mut self, channel: BoxedChannel, shutdown: &mut watch::Receiver<bool>) -> Exit {
        let (mut reader, mut writer) = tokio::io::split(channel);
        self.decoder.reset();
        let mut buf = [0u8; READ_CHUNK];
        let mut last_activity = Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.changed() => return Exit::Shutdown,
                read = reader.read(&mut buf) => match read {
                    Ok(0) => return Exit::Closed("peer closed the channel".to_string()),
                    Ok(n) => {
                        last_activity = Instant::now();
                        LinkCounters::bump(&self.counters.bytes_received, n as u64);
                        debug!("⬇️  RX {}", hex::encode(&buf[..n]));

                        let discarded_before = self.decoder.discarded();
                        let frames = self.decoder.feed(&buf[..n]);
                        LinkCounters::bump(
                            &self.counters.bytes_discarded,
                            self.decoder.discarded() - discarded_before,
                        );
                        for frame in frames {
                            LinkCounters::bump(&self.counters.frames_decoded, 1);
                            if self.events.send(LinkEvent::Frame(frame)).await.is_err() {
                                return Exit::Shutdown;
                            }
                        }
                    }
                    Err(e) => return Exit::Failed(format!("read failed: {}", e)),
                },
                queued = self.outgoing.recv() => match queued {
                    Some(Outgoing { bytes, ack }) => {
                        debug!("⬆️  TX {}", hex::encode(&bytes));
                        let written = match writer.write_all(&bytes).await {
                            Ok(()) => writer.flush().await,
                            Err(e) => Err(e),
                        };
                        match written {
                            Ok(()) => {
                                last_activity = Instant::now();
                                LinkCounters::bump(&self.counters.bytes_sent, bytes.len() as u64);
                                let _ = ack.send(Ok(()));
                            }
                            Err(e) => {
                                let _ = ack.send(Err(DriverError::ConnectionError(format!(
                                    "write failed: {}",
                                    e
                                ))));
                                return Exit::Failed(format!("write failed: {}", e));
                            }
                        }
                    }
                    None => return Exit::Shutdown,
                },
                _ = idle_deadline(last_activity, self.settings.activity_timeout) => {
                    warn!("⏰ No traffic for {:?}, dropping channel", self.settings.activity_timeout);
                    return Exit::Closed("activity timeout".to_string());
                }
            }
        }
    }
}
