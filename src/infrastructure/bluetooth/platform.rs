//! Platform BLE Abstraction
//!
//! The seam between the protocol engine and the operating-system BLE stack.
//! A backend implements [`BleCentral`] (fire-and-forget commands) and posts
//! the results as [`CentralEvent`]s into the engine's event channel, where
//! they are consumed on a single sequential task.

use uuid::Uuid;

/// Power/authorization state of the local BLE adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl AdapterState {
    /// Whether scanning can be started right now.
    pub fn is_powered_on(self) -> bool {
        self == AdapterState::PoweredOn
    }

    /// Whether the adapter can ever become usable without user intervention.
    pub fn is_usable(self) -> bool {
        !matches!(self, AdapterState::Unsupported | AdapterState::Unauthorized)
    }
}

/// Opaque peripheral identity assigned by the platform stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeripheralId(pub u64);

impl std::fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#014x}", self.0)
    }
}

/// Outcome of a write-with-response request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteStatus {
    Acknowledged,
    Failed(String),
}

/// Typed platform callback, delivered in arrival order on the engine task.
#[derive(Debug, Clone, PartialEq)]
pub enum CentralEvent {
    AdapterStateChanged(AdapterState),
    PeripheralDiscovered {
        id: PeripheralId,
        name: Option<String>,
        services: Vec<Uuid>,
        rssi: Option<i16>,
    },
    PeripheralConnected {
        id: PeripheralId,
    },
    ConnectFailed {
        id: PeripheralId,
        reason: String,
    },
    PeripheralDisconnected {
        id: PeripheralId,
    },
    ServicesDiscovered {
        id: PeripheralId,
        services: Vec<Uuid>,
    },
    /// Service or characteristic discovery failed at the platform level.
    DiscoveryFailed {
        id: PeripheralId,
        reason: String,
    },
    CharacteristicsDiscovered {
        id: PeripheralId,
        service: Uuid,
        characteristics: Vec<Uuid>,
    },
    /// A read response or an unsolicited notification.
    CharacteristicValue {
        id: PeripheralId,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    WriteCompleted {
        id: PeripheralId,
        characteristic: Uuid,
        status: WriteStatus,
    },
}

/// Commands the engine issues to the platform stack.
///
/// Implementations must not block: each call starts the operation and the
/// outcome comes back later as a [`CentralEvent`]. Calls against a peripheral
/// that has gone away may be ignored by the backend; the engine fences stale
/// completions itself.
pub trait BleCentral: Send + 'static {
    fn adapter_state(&self) -> AdapterState;
    fn start_scan(&mut self, service: Uuid);
    fn stop_scan(&mut self);
    fn connect(&mut self, id: PeripheralId);
    /// Cancels an in-flight connect or tears down an established link.
    fn cancel_connection(&mut self, id: PeripheralId);
    fn discover_services(&mut self, id: PeripheralId, service: Uuid);
    fn discover_characteristics(&mut self, id: PeripheralId, service: Uuid);
    fn subscribe(&mut self, id: PeripheralId, characteristic: Uuid);
    fn read(&mut self, id: PeripheralId, characteristic: Uuid);
    fn write_with_response(&mut self, id: PeripheralId, characteristic: Uuid, value: &[u8]);
}
