//! Connection State Machine
//!
//! Drives a headset from idle to streaming-ready and back: scan → connect →
//! service discovery → characteristic discovery → subscribe → ready. Every
//! in-progress state has exactly two exits: success-continue, or failure
//! straight back to `Disconnected` with the session cleared. Retry is the
//! caller's decision, never ours.
//!
//! All mutation happens inside [`ConnectionStateMachine::handle_event`],
//! which the client runs on a single sequential task; platform commands go
//! out through the [`BleCentral`] trait.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{oneshot, watch};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::domain::models::{
    ConnectionState, HeadTrackingError, OrientationEstimate, VectorReading,
};
use crate::domain::orientation::OrientationEstimator;
use crate::domain::settings::TrackerSettings;
use crate::infrastructure::bluetooth::platform::{
    BleCentral, CentralEvent, PeripheralId, WriteStatus,
};
use crate::infrastructure::bluetooth::protocol::{
    self, CharacteristicKind, DecodeError, SensorConfig, SensorFrame,
};

/// The connected peripheral plus its discovered GATT handles.
#[derive(Debug, Clone)]
pub struct DeviceHandle {
    pub id: PeripheralId,
    pub name: Option<String>,
    /// Session marker; bumped on every clear so log lines from superseded
    /// callbacks are attributable.
    pub generation: u64,
    pub service: Option<Uuid>,
    pub config: Option<Uuid>,
    pub data: Option<Uuid>,
    pub info: Option<Uuid>,
}

impl DeviceHandle {
    fn new(id: PeripheralId, name: Option<String>, generation: u64) -> Self {
        Self {
            id,
            name,
            generation,
            service: None,
            config: None,
            data: None,
            info: None,
        }
    }

    pub fn characteristic(&self, kind: CharacteristicKind) -> Option<Uuid> {
        match kind {
            CharacteristicKind::Config => self.config,
            CharacteristicKind::Data => self.data,
            CharacteristicKind::Info => self.info,
        }
    }

    fn missing_characteristics(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.config.is_none() {
            missing.push("config");
        }
        if self.data.is_none() {
            missing.push("data");
        }
        if self.info.is_none() {
            missing.push("info");
        }
        missing
    }
}

/// Frame-pipeline counters, shared with the façade.
#[derive(Debug, Default)]
pub struct Diagnostics {
    quaternion_frames: AtomicU64,
    vector_frames: AtomicU64,
    truncated_frames: AtomicU64,
    unknown_sensor_frames: AtomicU64,
}

impl Diagnostics {
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            quaternion_frames: self.quaternion_frames.load(Ordering::Relaxed),
            vector_frames: self.vector_frames.load(Ordering::Relaxed),
            truncated_frames: self.truncated_frames.load(Ordering::Relaxed),
            unknown_sensor_frames: self.unknown_sensor_frames.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub quaternion_frames: u64,
    pub vector_frames: u64,
    pub truncated_frames: u64,
    pub unknown_sensor_frames: u64,
}

impl DiagnosticsSnapshot {
    /// Frames dropped from the orientation stream for any reason.
    pub fn dropped_frames(&self) -> u64 {
        self.truncated_frames + self.unknown_sensor_frames
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteStage {
    /// Config written, waiting for the write acknowledgement callback.
    AwaitingAck,
    /// Acknowledged; waiting for the confirming Config re-read.
    AwaitingConfirm,
}

/// The single in-flight config write sequence.
struct PendingWrite {
    target_period: u16,
    stage: WriteStage,
    deadline: Instant,
    reply: oneshot::Sender<Result<(), HeadTrackingError>>,
}

pub struct ConnectionStateMachine<C: BleCentral> {
    central: C,
    settings: TrackerSettings,
    state: ConnectionState,
    /// A scan was requested while the adapter was off; re-issue on power-on.
    scan_pending: bool,
    device: Option<DeviceHandle>,
    sensor_config: Option<SensorConfig>,
    device_info: Option<Vec<u8>>,
    generation: u64,
    pending_write: Option<PendingWrite>,
    estimator: OrientationEstimator,
    diagnostics: Arc<Diagnostics>,
    state_tx: watch::Sender<ConnectionState>,
    orientation_tx: watch::Sender<Option<OrientationEstimate>>,
    vector_tx: watch::Sender<Option<VectorReading>>,
}

impl<C: BleCentral> ConnectionStateMachine<C> {
    pub fn new(
        central: C,
        settings: TrackerSettings,
        diagnostics: Arc<Diagnostics>,
        state_tx: watch::Sender<ConnectionState>,
        orientation_tx: watch::Sender<Option<OrientationEstimate>>,
        vector_tx: watch::Sender<Option<VectorReading>>,
    ) -> Self {
        Self {
            central,
            settings,
            state: ConnectionState::Disconnected,
            scan_pending: false,
            device: None,
            sensor_config: None,
            device_info: None,
            generation: 0,
            pending_write: None,
            estimator: OrientationEstimator::new(),
            diagnostics,
            state_tx,
            orientation_tx,
            vector_tx,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn device(&self) -> Option<&DeviceHandle> {
        self.device.as_ref()
    }

    pub fn sensor_config(&self) -> Option<&SensorConfig> {
        self.sensor_config.as_ref()
    }

    pub fn device_info(&self) -> Option<&[u8]> {
        self.device_info.as_deref()
    }

    /// Request a scan for the head-tracking service.
    ///
    /// Valid only from `Disconnected`. With the adapter off the request is
    /// remembered and the scan starts automatically once the adapter powers
    /// on; an unusable adapter is surfaced immediately.
    pub fn begin_scan(&mut self) -> Result<(), HeadTrackingError> {
        if self.state != ConnectionState::Disconnected {
            return Err(HeadTrackingError::InvalidState(self.state));
        }

        let adapter = self.central.adapter_state();
        if !adapter.is_usable() {
            warn!(?adapter, "cannot scan, adapter unusable");
            return Err(HeadTrackingError::AdapterUnavailable(adapter));
        }
        if !adapter.is_powered_on() {
            info!(?adapter, "adapter not powered on, scan deferred");
            self.scan_pending = true;
            return Ok(());
        }

        self.start_scan();
        Ok(())
    }

    /// Tear down the session from any in-flight or established state.
    pub fn disconnect(&mut self) {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Disconnecting => {}
            ConnectionState::Scanning => {
                self.central.stop_scan();
                self.scan_pending = false;
                self.clear_session();
            }
            ConnectionState::Connecting | ConnectionState::Connected => {
                if let Some(device) = &self.device {
                    let id = device.id;
                    self.set_state(ConnectionState::Disconnecting);
                    self.central.cancel_connection(id);
                } else {
                    self.clear_session();
                }
            }
        }
    }

    /// Start or stop the rotation stream via a write-then-confirm sequence.
    ///
    /// The reply resolves once the device has confirmed (or refused, or
    /// ignored) the new configuration. A second call while one sequence is
    /// in flight gets `Busy`; a call that would not change the device is a
    /// no-op resolving immediately.
    pub fn set_tracking(
        &mut self,
        enabled: bool,
        reply: oneshot::Sender<Result<(), HeadTrackingError>>,
    ) {
        if self.state != ConnectionState::Connected {
            let _ = reply.send(Err(HeadTrackingError::InvalidState(self.state)));
            return;
        }
        let Some(device) = &self.device else {
            let _ = reply.send(Err(HeadTrackingError::NotConnected));
            return;
        };
        let Some(config_char) = device.config else {
            let _ = reply.send(Err(HeadTrackingError::NotReady));
            return;
        };
        let Some(current) = self.sensor_config else {
            let _ = reply.send(Err(HeadTrackingError::NotReady));
            return;
        };
        if self.pending_write.is_some() {
            let _ = reply.send(Err(HeadTrackingError::Busy));
            return;
        }

        let target_period = if enabled { self.nominal_period() } else { 0 };
        if current.rotation_period == target_period {
            debug!(target_period, "rotation stream already in requested state");
            let _ = reply.send(Ok(()));
            return;
        }

        let mut next = current;
        next.rotation_period = target_period;
        let payload = protocol::encode_config(&next, &self.settings.sensor_ids);

        info!(target_period, "writing sensor config");
        let id = device.id;
        self.central
            .write_with_response(id, config_char, &payload);
        self.pending_write = Some(PendingWrite {
            target_period,
            stage: WriteStage::AwaitingAck,
            deadline: Instant::now() + self.write_timeout(),
            reply,
        });
    }

    /// Deadline of the in-flight config write, if any. The driver task uses
    /// this to schedule a timeout wake-up.
    pub fn write_deadline(&self) -> Option<Instant> {
        self.pending_write.as_ref().map(|p| p.deadline)
    }

    /// Called by the driver when the write deadline elapses. A silent
    /// non-response becomes `WriteNotAcknowledged`.
    pub fn handle_write_timeout(&mut self) {
        let due = self
            .pending_write
            .as_ref()
            .is_some_and(|p| Instant::now() >= p.deadline);
        if !due {
            return;
        }
        if let Some(pending) = self.pending_write.take() {
            warn!(
                target_period = pending.target_period,
                "config write timed out without acknowledgement"
            );
            let _ = pending.reply.send(Err(HeadTrackingError::WriteNotAcknowledged));
        }
    }

    /// Single entry point for every platform callback.
    pub fn handle_event(&mut self, event: CentralEvent) {
        match event {
            CentralEvent::AdapterStateChanged(adapter) => {
                info!(?adapter, "adapter state changed");
                if adapter.is_powered_on() {
                    if self.scan_pending {
                        self.scan_pending = false;
                        self.start_scan();
                    }
                } else if self.state == ConnectionState::Scanning {
                    warn!("adapter lost while scanning, will rescan on power-on");
                    self.scan_pending = true;
                }
            }

            CentralEvent::PeripheralDiscovered {
                id,
                name,
                services,
                rssi,
            } => {
                if self.state != ConnectionState::Scanning {
                    trace!(%id, "discovery while not scanning, ignored");
                    return;
                }
                if !self.matches_headset(name.as_deref(), &services) {
                    trace!(%id, ?name, "peripheral does not match, ignored");
                    return;
                }
                info!(%id, ?name, ?rssi, "found head-tracking peripheral");
                self.central.stop_scan();
                self.device = Some(DeviceHandle::new(id, name, self.generation));
                self.set_state(ConnectionState::Connecting);
                self.central.connect(id);
            }

            CentralEvent::PeripheralConnected { id } => {
                if !self.is_current(id) {
                    trace!(%id, "stale connect event, ignored");
                    return;
                }
                if self.state != ConnectionState::Connecting {
                    warn!(%id, state = ?self.state, "connect event outside Connecting, ignored");
                    return;
                }
                info!(%id, "peripheral connected, discovering services");
                self.set_state(ConnectionState::Connected);
                self.central
                    .discover_services(id, protocol::HEAD_TRACKING_SERVICE_UUID);
            }

            CentralEvent::ConnectFailed { id, reason } => {
                if !self.is_current(id) {
                    return;
                }
                warn!(%id, %reason, "connect failed");
                self.central.cancel_connection(id);
                self.clear_session();
            }

            CentralEvent::PeripheralDisconnected { id } => {
                if !self.is_current(id) {
                    trace!(%id, "stale disconnect event, ignored");
                    return;
                }
                info!(%id, "peripheral disconnected");
                self.clear_session();
            }

            CentralEvent::ServicesDiscovered { id, services } => {
                if !self.is_current(id) || self.state != ConnectionState::Connected {
                    return;
                }
                if services.contains(&protocol::HEAD_TRACKING_SERVICE_UUID) {
                    if let Some(device) = &mut self.device {
                        device.service = Some(protocol::HEAD_TRACKING_SERVICE_UUID);
                    }
                    self.central
                        .discover_characteristics(id, protocol::HEAD_TRACKING_SERVICE_UUID);
                } else {
                    warn!(%id, "head-tracking service not present, disconnecting");
                    self.central.cancel_connection(id);
                    self.clear_session();
                }
            }

            CentralEvent::DiscoveryFailed { id, reason } => {
                if !self.is_current(id) {
                    return;
                }
                warn!(%id, %reason, "discovery failed, disconnecting");
                self.central.cancel_connection(id);
                self.clear_session();
            }

            CentralEvent::CharacteristicsDiscovered {
                id,
                service,
                characteristics,
            } => {
                if !self.is_current(id) || self.state != ConnectionState::Connected {
                    return;
                }
                if service != protocol::HEAD_TRACKING_SERVICE_UUID {
                    return;
                }
                self.on_characteristics_discovered(id, &characteristics);
            }

            CentralEvent::CharacteristicValue {
                id,
                characteristic,
                value,
            } => {
                if !self.is_current(id) {
                    trace!(%id, generation = self.generation, "stale value event, ignored");
                    return;
                }
                match CharacteristicKind::from_uuid(characteristic) {
                    Some(CharacteristicKind::Config) => self.on_config_value(&value),
                    Some(CharacteristicKind::Data) => self.on_data_value(&value),
                    Some(CharacteristicKind::Info) => {
                        debug!(len = value.len(), "device info read");
                        self.device_info = Some(value);
                    }
                    None => debug!(%characteristic, "value from unrelated characteristic"),
                }
            }

            CentralEvent::WriteCompleted {
                id,
                characteristic,
                status,
            } => {
                if !self.is_current(id) {
                    return;
                }
                if CharacteristicKind::from_uuid(characteristic)
                    != Some(CharacteristicKind::Config)
                {
                    return;
                }
                self.on_config_write_completed(id, characteristic, status);
            }
        }
    }

    fn on_characteristics_discovered(&mut self, id: PeripheralId, characteristics: &[Uuid]) {
        let Some(device) = &mut self.device else {
            return;
        };

        device.config = None;
        device.data = None;
        device.info = None;
        for &uuid in characteristics {
            match CharacteristicKind::from_uuid(uuid) {
                Some(CharacteristicKind::Config) => device.config = Some(uuid),
                Some(CharacteristicKind::Data) => device.data = Some(uuid),
                Some(CharacteristicKind::Info) => device.info = Some(uuid),
                None => debug!(%uuid, "unrelated characteristic, skipped"),
            }
        }

        // Config gets notifications and an initial read; Data notifications
        // only; Info a one-time read.
        if let Some(config) = device.config {
            self.central.subscribe(id, config);
            self.central.read(id, config);
        }
        if let Some(data) = device.data {
            self.central.subscribe(id, data);
        }
        if let Some(info) = device.info {
            self.central.read(id, info);
        }

        let missing = self
            .device
            .as_ref()
            .map(|d| d.missing_characteristics())
            .unwrap_or_default();
        if missing.is_empty() {
            info!("all head-tracking characteristics discovered");
        } else {
            warn!(?missing, "characteristics missing, continuing degraded");
        }
    }

    fn on_config_value(&mut self, value: &[u8]) {
        match protocol::decode_config(value, &self.settings.sensor_ids) {
            Ok(config) => {
                debug!(?config, "sensor config updated");
                self.sensor_config = Some(config);

                let confirming = self
                    .pending_write
                    .as_ref()
                    .is_some_and(|p| p.stage == WriteStage::AwaitingConfirm);
                if !confirming {
                    return;
                }
                if let Some(pending) = self.pending_write.take() {
                    if config.rotation_period == pending.target_period {
                        info!(
                            period = pending.target_period,
                            "device confirmed rotation period"
                        );
                        let _ = pending.reply.send(Ok(()));
                    } else {
                        warn!(
                            requested = pending.target_period,
                            actual = config.rotation_period,
                            "device kept its previous rotation period"
                        );
                        let _ = pending
                            .reply
                            .send(Err(HeadTrackingError::WriteNotAcknowledged));
                    }
                }
            }
            Err(e) => warn!(error = %e, "undecodable sensor config, keeping cache"),
        }
    }

    fn on_data_value(&mut self, value: &[u8]) {
        match protocol::decode_frame(value, &self.settings.sensor_ids) {
            Ok(frame @ SensorFrame::Quaternion { .. }) => {
                if let Some(estimate) = self.estimator.estimate(&frame) {
                    self.diagnostics
                        .quaternion_frames
                        .fetch_add(1, Ordering::Relaxed);
                    self.orientation_tx.send_replace(Some(estimate));
                }
            }
            Ok(SensorFrame::Vector {
                sensor,
                timestamp,
                x,
                y,
                z,
                accuracy,
            }) => {
                self.diagnostics.vector_frames.fetch_add(1, Ordering::Relaxed);
                self.vector_tx.send_replace(Some(VectorReading {
                    sensor,
                    timestamp,
                    x,
                    y,
                    z,
                    accuracy,
                }));
            }
            Err(e) => {
                match e {
                    DecodeError::Truncated { .. } => {
                        self.diagnostics.truncated_frames.fetch_add(1, Ordering::Relaxed)
                    }
                    DecodeError::UnknownSensorId(_) => self
                        .diagnostics
                        .unknown_sensor_frames
                        .fetch_add(1, Ordering::Relaxed),
                };
                trace!(error = %e, len = value.len(), "dropped malformed frame");
            }
        }
    }

    fn on_config_write_completed(
        &mut self,
        id: PeripheralId,
        characteristic: Uuid,
        status: WriteStatus,
    ) {
        let Some(mut pending) = self.pending_write.take() else {
            debug!("write completion with no awaiting write, ignored");
            return;
        };
        if pending.stage != WriteStage::AwaitingAck {
            self.pending_write = Some(pending);
            debug!("write completion while awaiting confirmation, ignored");
            return;
        }

        match status {
            WriteStatus::Acknowledged => {
                debug!("config write acknowledged, re-reading to confirm");
                pending.stage = WriteStage::AwaitingConfirm;
                pending.deadline = Instant::now() + self.settings.write_timeout();
                self.pending_write = Some(pending);
                self.central.read(id, characteristic);
            }
            WriteStatus::Failed(reason) => {
                warn!(%reason, "config write failed");
                let _ = pending
                    .reply
                    .send(Err(HeadTrackingError::WriteNotAcknowledged));
            }
        }
    }

    fn start_scan(&mut self) {
        info!("scanning for head-tracking service");
        self.central
            .start_scan(protocol::HEAD_TRACKING_SERVICE_UUID);
        self.set_state(ConnectionState::Scanning);
    }

    fn matches_headset(&self, name: Option<&str>, services: &[Uuid]) -> bool {
        if services.contains(&protocol::HEAD_TRACKING_SERVICE_UUID) {
            return true;
        }
        name.is_some_and(|n| {
            n.to_lowercase()
                .starts_with(&self.settings.device_name_prefix.to_lowercase())
        })
    }

    fn is_current(&self, id: PeripheralId) -> bool {
        self.device.as_ref().is_some_and(|d| d.id == id)
    }

    fn nominal_period(&self) -> u16 {
        let period = self.settings.rotation_period_ms;
        if protocol::is_valid_period(period) && period != 0 {
            period
        } else {
            warn!(period, "configured rotation period invalid, using 80 ms");
            80
        }
    }

    fn write_timeout(&self) -> Duration {
        self.settings.write_timeout()
    }

    /// Collapse to `Disconnected`: drop the handle, the cached config and
    /// any pending write, and bump the generation fence.
    fn clear_session(&mut self) {
        self.generation += 1;
        self.device = None;
        self.sensor_config = None;
        self.device_info = None;
        if let Some(pending) = self.pending_write.take() {
            let _ = pending.reply.send(Err(HeadTrackingError::NotConnected));
        }
        self.set_state(ConnectionState::Disconnected);
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            info!(from = ?self.state, to = ?next, "connection state changed");
            self.state = next;
            self.state_tx.send_replace(next);
        }
    }
}
