//! Core value types shared across the crate.

use thiserror::Error;

use crate::infrastructure::bluetooth::platform::AdapterState;
use crate::infrastructure::bluetooth::protocol::{DecodeError, SensorKind};

/// Lifecycle state of the headset session. Exactly one per device session,
/// mutated only by the connection state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Scanning,
    Connecting,
    Connected,
    Disconnecting,
}

/// Calibrated head orientation derived from the most recent rotation frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrientationEstimate {
    /// Roll in radians; positive leans the head left.
    pub roll: f64,
    /// Pitch in radians, wrapped into (−π, π].
    pub pitch: f64,
    /// Yaw in radians; positive turns the head right.
    pub yaw: f64,
    /// Sensor-reported accuracy, 0 (unreliable) to 3 (high).
    pub accuracy: u8,
}

/// Raw accelerometer/gyroscope sample, surfaced for diagnostic consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorReading {
    pub sensor: SensorKind,
    pub timestamp: u16,
    pub x: i16,
    pub y: i16,
    pub z: i16,
    pub accuracy: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeadTrackingError {
    /// The BLE radio is unusable (unsupported or unauthorized). Not retried.
    #[error("bluetooth adapter unavailable ({0:?})")]
    AdapterUnavailable(AdapterState),

    /// The peripheral rejected or dropped the connection attempt. The caller
    /// decides whether to scan again.
    #[error("connection attempt failed: {0}")]
    ConnectFailed(String),

    /// One or more head-tracking characteristics were missing at discovery.
    /// The session continues degraded; this is surfaced for visibility only.
    #[error("service discovery incomplete: {0}")]
    DiscoveryIncomplete(String),

    /// A config write got no acknowledgement, or the device silently kept
    /// its previous configuration.
    #[error("config write was not acknowledged by the device")]
    WriteNotAcknowledged,

    /// A previous config write sequence has not settled yet.
    #[error("a config write is already in flight")]
    Busy,

    /// Tracking was requested before the device config had been read.
    #[error("head tracking is not ready (no device config)")]
    NotReady,

    /// The operation is not valid in the current lifecycle state.
    #[error("operation invalid in state {0:?}")]
    InvalidState(ConnectionState),

    /// The session ended while an operation was pending.
    #[error("not connected")]
    NotConnected,

    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The client driver task is gone.
    #[error("head-tracking client is shut down")]
    Closed,
}
