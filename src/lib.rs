//! BLE head-tracking client for Bose Frames-class headsets.
//!
//! Connects to a headset advertising the head-tracking GATT service,
//! negotiates its sensor-streaming configuration, and turns raw notification
//! frames into calibrated roll/pitch/yaw estimates for spatial-audio
//! rendering.
//!
//! The crate is built around three pieces:
//!
//! * [`infrastructure::bluetooth::protocol`], the binary codec for the
//!   Config/Data/Info characteristics,
//! * [`domain::orientation`], fixed-point quaternion decode, correction
//!   transform and Euler extraction,
//! * [`ConnectionStateMachine`] + [`HeadTrackingClient`], the connection
//!   lifecycle and the async façade the application talks to.
//!
//! Platform BLE access goes through the [`BleCentral`] trait; a WinRT
//! backend is provided on Windows, and a command-recording mock ships for
//! tests and headless development.

pub mod domain;
pub mod infrastructure;

pub use domain::models::{
    ConnectionState, HeadTrackingError, OrientationEstimate, VectorReading,
};
pub use domain::orientation::{OrientationEstimator, Quaternion};
pub use domain::settings::{LogSettings, SettingsService, TrackerSettings};
pub use infrastructure::bluetooth::client::HeadTrackingClient;
pub use infrastructure::bluetooth::platform::{
    AdapterState, BleCentral, CentralEvent, PeripheralId, WriteStatus,
};
pub use infrastructure::bluetooth::protocol::{
    DecodeError, SensorConfig, SensorFrame, SensorIdMap, SensorKind,
};
pub use infrastructure::bluetooth::state_machine::{
    ConnectionStateMachine, DeviceHandle, DiagnosticsSnapshot,
};

#[cfg(windows)]
pub use infrastructure::bluetooth::winrt::WinRtCentral;
