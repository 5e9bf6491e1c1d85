use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::channel::{Connector, TcpConnector};
use super::connection::{ConnectionManager, ConnectionState, LinkEvent, LinkStats};
use super::correlator::{FrameOutcome, RequestCorrelator, RequestKind};
use crate::config::Config;
use crate::devices::registry::VERSION;
use crate::devices::{
    ControllerState, HistoryEntry, HistoryReader, Model, Quantity, Reading, RegisterSource,
    SemanticRegistry, SystemConfig, SystemVoltage,
};
use crate::protocol::{Command, MemorySpace, LOOPBACK_REPLY};
use crate::utils::error::{DriverError, Result};

const LINK_EVENT_QUEUE_DEPTH: usize = 64;
const DRIVER_EVENT_CAPACITY: usize = 64;

/// Advisory notifications that are not tied to any caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DriverEvent {
    /// The device sent an error frame nobody was waiting for.
    ProtocolError { code: u8 },
    /// A data frame arrived after its request had already given up.
    LateFrame { value: u8 },
}

#[derive(Debug, Default)]
struct RequestCounters {
    sent: AtomicU64,
    resolved: AtomicU64,
    timeouts: AtomicU64,
    failures: AtomicU64,
    late_frames: AtomicU64,
    protocol_errors: AtomicU64,
}

impl RequestCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DriverStats {
    pub session_id: String,
    pub endpoint: String,
    pub state: ConnectionState,
    pub link: LinkStats,
    pub requests_sent: u64,
    pub requests_resolved: u64,
    pub timeouts: u64,
    pub failures: u64,
    pub late_frames: u64,
    pub protocol_errors: u64,
    pub outstanding: usize,
}

impl DriverStats {
    pub fn success_rate(&self) -> f64 {
        if self.requests_sent == 0 {
            return 0.0;
        }
        self.requests_resolved as f64 / self.requests_sent as f64 * 100.0
    }
}

/// Everything `read_all` could get out of the controller in one pass.
#[derive(Debug, Clone, Serialize)]
pub struct SolarSnapshot {
    pub timestamp: DateTime<Utc>,
    pub model: Model,
    pub system_voltage: SystemVoltage,
    pub version: Option<u8>,
    pub battery_voltage: Option<f64>,
    pub battery_temperature: Option<f64>,
    pub solar_voltage: Option<f64>,
    pub state_of_charge: Option<f64>,
    pub charge_current: Option<f64>,
    pub load_current: Option<f64>,
    pub controller_state: Option<ControllerState>,
    pub readings: Vec<Reading>,
    pub raw: BTreeMap<u8, Option<u8>>,
}

impl SolarSnapshot {
    pub fn reading(&self, quantity: Quantity) -> Option<&Reading> {
        self.readings.iter().find(|reading| reading.quantity == quantity)
    }

    pub fn is_complete(&self) -> bool {
        self.raw.values().all(Option::is_some)
    }

    fn scalar(readings: &[Reading], quantity: Quantity) -> Option<f64> {
        readings
            .iter()
            .find(|reading| reading.quantity == quantity)
            .and_then(|reading| reading.value.as_f64())
    }
}

/// One driver instance per controller. Owns the link, the correlator and the
/// counters; nothing here is process-global.
pub struct PlDriver {
    session_id: Uuid,
    config: Config,
    system: SystemConfig,
    registry: SemanticRegistry,
    link: Arc<ConnectionManager>,
    correlator: RequestCorrelator,
    counters: Arc<RequestCounters>,
    events: broadcast::Sender<DriverEvent>,
    link_events: Mutex<Option<mpsc::Receiver<LinkEvent>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl PlDriver {
    pub fn new(config: Config, connector: Arc<dyn Connector>) -> Self {
        let (link_tx, link_rx) = mpsc::channel(LINK_EVENT_QUEUE_DEPTH);
        let (events, _) = broadcast::channel(DRIVER_EVENT_CAPACITY);
        let link = ConnectionManager::new(connector, config.link_settings(), link_tx);
        let session_id = Uuid::new_v4();

        info!(
            "🆔 Driver session {} for {} ({} {})",
            session_id,
            link.endpoint(),
            config.device.model,
            config.device.system_voltage
        );

        Self {
            session_id,
            system: config.system_config(),
            config,
            registry: SemanticRegistry::default(),
            link: Arc::new(link),
            correlator: RequestCorrelator::new(),
            counters: Arc::new(RequestCounters::default()),
            events,
            link_events: Mutex::new(Some(link_rx)),
            dispatcher: Mutex::new(None),
        }
    }

    /// Driver talking TCP to the relay named in `config.device`.
    pub fn from_config(config: Config) -> Self {
        let connector = TcpConnector::new(&config.device.host, config.device.port);
        Self::new(config, Arc::new(connector))
    }

    pub fn with_registry(mut self, registry: SemanticRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn system(&self) -> &SystemConfig {
        &self.system
    }

    pub fn registry(&self) -> &SemanticRegistry {
        &self.registry
    }

    pub fn request_timeout(&self) -> Duration {
        self.config.request_timeout()
    }

    /// Starts the link supervisor. Calling it again while running does nothing.
    pub fn connect(&self) -> bool {
        self.spawn_dispatcher();
        self.link.start()
    }

    /// Stops retrying and closes the channel. Safe to call repeatedly.
    pub async fn disconnect(&self) -> bool {
        let stopped = self.link.stop().await;
        if stopped {
            info!("👋 Driver session {} disconnected", self.session_id);
        }
        stopped
    }

    pub fn state(&self) -> ConnectionState {
        self.link.state()
    }

    /// Latest-value view of the link state; rapid changes can be merged.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.link.subscribe()
    }

    /// Every link state change, in order.
    pub fn transitions(&self) -> broadcast::Receiver<ConnectionState> {
        self.link.transitions()
    }

    pub fn events(&self) -> broadcast::Receiver<DriverEvent> {
        self.events.subscribe()
    }

    /// Returns false if the link is not up within `timeout`.
    pub async fn wait_until_connected(&self, timeout: Duration) -> bool {
        let mut states = self.link.subscribe();
        let reached = matches!(
            tokio::time::timeout(
                timeout,
                states.wait_for(|state| *state == ConnectionState::Connected)
            )
            .await,
            Ok(Ok(_))
        );
        reached
    }

    pub fn stats(&self) -> DriverStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        DriverStats {
            session_id: self.session_id.to_string(),
            endpoint: self.link.endpoint(),
            state: self.link.state(),
            link: self.link.stats(),
            requests_sent: load(&self.counters.sent),
            requests_resolved: load(&self.counters.resolved),
            timeouts: load(&self.counters.timeouts),
            failures: load(&self.counters.failures),
            late_frames: load(&self.counters.late_frames),
            protocol_errors: load(&self.counters.protocol_errors),
            outstanding: self.correlator.outstanding(),
        }
    }

    /// Reads one RAM register.
    pub async fn read(&self, address: u8, timeout: Duration) -> Result<u8> {
        self.read_in(MemorySpace::Ram, address, timeout).await
    }

    pub async fn read_eeprom(&self, address: u8, timeout: Duration) -> Result<u8> {
        self.read_in(MemorySpace::Eeprom, address, timeout).await
    }

    pub async fn read_in(&self, space: MemorySpace, address: u8, timeout: Duration) -> Result<u8> {
        let result = self
            .submit(Command::read(space, address), RequestKind::Register, timeout)
            .await;
        if let Ok(value) = result {
            debug!("Register {:?}:{} = {}", space, address, value);
        }
        result
    }

    /// Reads each address in turn. A failed address maps to `None`; the batch goes on.
    pub async fn read_batch(&self, addresses: &[u8]) -> BTreeMap<u8, Option<u8>> {
        let timeout = self.request_timeout();
        let mut values = BTreeMap::new();
        for &address in addresses {
            let value = match self.read(address, timeout).await {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!("⚠️  Register {} unavailable: {}", address, e);
                    None
                }
            };
            values.insert(address, value);
        }
        values
    }

    /// Reads every register the registry knows plus the version byte.
    pub async fn read_all(&self) -> SolarSnapshot {
        let mut addresses = vec![VERSION];
        addresses.extend(self.registry.addresses());
        let raw = self.read_batch(&addresses).await;

        let readings: Vec<Reading> = raw
            .iter()
            .filter_map(|(&address, value)| {
                value.and_then(|raw| self.registry.decode(address, raw, &self.system))
            })
            .collect();

        SolarSnapshot {
            timestamp: Utc::now(),
            model: self.system.model,
            system_voltage: self.system.system_voltage,
            version: raw.get(&VERSION).copied().flatten(),
            battery_voltage: SolarSnapshot::scalar(&readings, Quantity::BatteryVoltage),
            battery_temperature: SolarSnapshot::scalar(&readings, Quantity::BatteryTemperature),
            solar_voltage: SolarSnapshot::scalar(&readings, Quantity::SolarVoltage),
            state_of_charge: SolarSnapshot::scalar(&readings, Quantity::StateOfCharge),
            charge_current: SolarSnapshot::scalar(&readings, Quantity::ChargeCurrent),
            load_current: SolarSnapshot::scalar(&readings, Quantity::LoadCurrent),
            controller_state: readings
                .iter()
                .find_map(|reading| reading.value.as_state()),
            readings,
            raw,
        }
    }

    pub async fn read_history(&self) -> Result<Vec<HistoryEntry>> {
        HistoryReader::new(self.config.history, self.system.voltage_ratio())
            .read(self)
            .await
    }

    /// Loopback self-test. Any failure is logged and reported as `false`.
    pub async fn test(&self) -> bool {
        let result = self
            .submit(
                Command::loopback(),
                RequestKind::Loopback { reply: LOOPBACK_REPLY },
                self.request_timeout(),
            )
            .await;
        match result {
            Ok(LOOPBACK_REPLY) => {
                info!("✅ Loopback answered");
                true
            }
            Ok(other) => {
                warn!("⚠️  Loopback answered 0x{:02x}, expected 0x{:02x}", other, LOOPBACK_REPLY);
                false
            }
            Err(e) => {
                warn!("⚠️  Loopback failed: {}", e);
                false
            }
        }
    }

    async fn submit(&self, command: Command, kind: RequestKind, timeout: Duration) -> Result<u8> {
        RequestCounters::bump(&self.counters.sent);
        let result = self
            .correlator
            .submit(self.link.as_ref(), command, kind, timeout)
            .await;
        match &result {
            Ok(_) => {}
            Err(DriverError::Timeout { .. }) => RequestCounters::bump(&self.counters.timeouts),
            Err(_) => RequestCounters::bump(&self.counters.failures),
        }
        result
    }

    fn spawn_dispatcher(&self) {
        let mut dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if dispatcher.is_some() {
            return;
        }
        let Some(link_events) = self
            .link_events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        else {
            return;
        };

        *dispatcher = Some(tokio::spawn(dispatch(
            link_events,
            self.correlator.clone(),
            self.counters.clone(),
            self.events.clone(),
        )));
    }
}

/// Moves decoded frames from the link into the correlator, in arrival order.
async fn dispatch(
    mut link_events: mpsc::Receiver<LinkEvent>,
    correlator: RequestCorrelator,
    counters: Arc<RequestCounters>,
    events: broadcast::Sender<DriverEvent>,
) {
    while let Some(event) = link_events.recv().await {
        match event {
            LinkEvent::Frame(frame) => match correlator.on_frame(frame) {
                FrameOutcome::Resolved { id, address, elapsed } => {
                    RequestCounters::bump(&counters.resolved);
                    debug!("Request #{} for register {} answered in {:?}", id, address, elapsed);
                }
                FrameOutcome::Unsolicited { value } => {
                    RequestCounters::bump(&counters.late_frames);
                    debug!("Dropping unsolicited data byte 0x{:02x}", value);
                    let _ = events.send(DriverEvent::LateFrame { value });
                }
                FrameOutcome::Advisory { code } => {
                    RequestCounters::bump(&counters.protocol_errors);
                    warn!("⚠️  {}", DriverError::ProtocolError(code));
                    let _ = events.send(DriverEvent::ProtocolError { code });
                }
            },
            LinkEvent::Lost => {
                let failed = correlator.fail_all(DriverError::ChannelClosed);
                if failed > 0 {
                    warn!("📴 Link lost with {} request(s) outstanding", failed);
                }
            }
        }
    }
    debug!("Frame dispatcher exited");
}

#[async_trait]
impl RegisterSource for PlDriver {
    async fn read_register(&self, space: MemorySpace, address: u8) -> Result<u8> {
        self.read_in(space, address, self.request_timeout()).await
    }
}

impl Drop for PlDriver {
    fn drop(&mut self) {
        if let Ok(dispatcher) = self.dispatcher.get_mut() {
            if let Some(handle) = dispatcher.take() {
                handle.abort();
            }
        }
    }
}
