//! Head-Tracking Client
//!
//! Façade over the connection state machine, codec and estimator. Owns the
//! single sequential driver task that consumes platform events, caller
//! commands and the config-write timeout, and publishes orientation and
//! connection state through most-recent-wins `watch` slots.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::domain::models::{
    ConnectionState, HeadTrackingError, OrientationEstimate, VectorReading,
};
use crate::domain::settings::TrackerSettings;
use crate::infrastructure::bluetooth::platform::{BleCentral, CentralEvent};
use crate::infrastructure::bluetooth::state_machine::{
    ConnectionStateMachine, Diagnostics, DiagnosticsSnapshot,
};

enum ClientCommand {
    BeginScan(oneshot::Sender<Result<(), HeadTrackingError>>),
    Disconnect(oneshot::Sender<Result<(), HeadTrackingError>>),
    SetTracking(bool, oneshot::Sender<Result<(), HeadTrackingError>>),
}

/// Handle to a running head-tracking session.
///
/// Cheap to share behind an `Arc`; dropping the last handle stops the driver
/// task.
pub struct HeadTrackingClient {
    commands: mpsc::UnboundedSender<ClientCommand>,
    state_rx: watch::Receiver<ConnectionState>,
    orientation_rx: watch::Receiver<Option<OrientationEstimate>>,
    vector_rx: watch::Receiver<Option<VectorReading>>,
    diagnostics: Arc<Diagnostics>,
    driver: JoinHandle<()>,
}

impl HeadTrackingClient {
    /// Spawn the driver task over a platform backend and its event channel.
    ///
    /// The backend posts [`CentralEvent`]s into `events`; decoding,
    /// estimation and state transitions all happen on the spawned task in
    /// strict arrival order.
    pub fn spawn<C: BleCentral>(
        central: C,
        events: mpsc::UnboundedReceiver<CentralEvent>,
        settings: TrackerSettings,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (orientation_tx, orientation_rx) = watch::channel(None);
        let (vector_tx, vector_rx) = watch::channel(None);
        let diagnostics = Arc::new(Diagnostics::default());

        let machine = ConnectionStateMachine::new(
            central,
            settings,
            diagnostics.clone(),
            state_tx,
            orientation_tx,
            vector_tx,
        );
        let (commands, command_rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(drive(machine, events, command_rx));

        Self {
            commands,
            state_rx,
            orientation_rx,
            vector_rx,
            diagnostics,
            driver,
        }
    }

    /// Start scanning for a headset. Resolves immediately; watch
    /// [`Self::connection_state`] for progress.
    pub async fn begin_scan(&self) -> Result<(), HeadTrackingError> {
        self.request(ClientCommand::BeginScan).await
    }

    /// Tear down the current session (or abort an in-flight connect).
    pub async fn disconnect(&self) -> Result<(), HeadTrackingError> {
        self.request(ClientCommand::Disconnect).await
    }

    /// Enable the rotation stream. Resolves once the device has confirmed
    /// the configuration change.
    pub async fn start_tracking(&self) -> Result<(), HeadTrackingError> {
        self.request(|reply| ClientCommand::SetTracking(true, reply))
            .await
    }

    /// Disable the rotation stream. A second call while already stopped is a
    /// no-op.
    pub async fn stop_tracking(&self) -> Result<(), HeadTrackingError> {
        self.request(|reply| ClientCommand::SetTracking(false, reply))
            .await
    }

    /// Connection lifecycle stream for status display.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Orientation stream: lazy, infinite, non-restartable. The slot holds
    /// only the most recent undelivered estimate; slow subscribers skip
    /// intermediate values rather than queueing them.
    pub fn orientation(&self) -> watch::Receiver<Option<OrientationEstimate>> {
        self.orientation_rx.clone()
    }

    /// Most recent raw accelerometer/gyroscope reading, for diagnostics.
    pub fn latest_vector(&self) -> watch::Receiver<Option<VectorReading>> {
        self.vector_rx.clone()
    }

    /// Frame-pipeline counters, including dropped malformed frames.
    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    /// Stop the driver task. Pending calls resolve with [`HeadTrackingError::Closed`].
    pub fn shutdown(&self) {
        self.driver.abort();
    }

    async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<(), HeadTrackingError>>) -> ClientCommand,
    ) -> Result<(), HeadTrackingError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| HeadTrackingError::Closed)?;
        response.await.map_err(|_| HeadTrackingError::Closed)?
    }
}

impl Drop for HeadTrackingClient {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// The single sequential delivery context: every platform callback, caller
/// command and timeout fires here, one at a time, in arrival order.
async fn drive<C: BleCentral>(
    mut machine: ConnectionStateMachine<C>,
    mut events: mpsc::UnboundedReceiver<CentralEvent>,
    mut commands: mpsc::UnboundedReceiver<ClientCommand>,
) {
    loop {
        let deadline = machine.write_deadline();
        // The sleep is only polled when a write is pending; the fallback
        // instant just keeps the future constructible.
        let sleep_until = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            event = events.recv() => match event {
                Some(event) => machine.handle_event(event),
                None => {
                    debug!("platform event channel closed, driver exiting");
                    break;
                }
            },
            command = commands.recv() => match command {
                Some(ClientCommand::BeginScan(reply)) => {
                    let _ = reply.send(machine.begin_scan());
                }
                Some(ClientCommand::Disconnect(reply)) => {
                    machine.disconnect();
                    let _ = reply.send(Ok(()));
                }
                Some(ClientCommand::SetTracking(enabled, reply)) => {
                    machine.set_tracking(enabled, reply);
                }
                None => {
                    debug!("client handle dropped, driver exiting");
                    break;
                }
            },
            _ = tokio::time::sleep_until(sleep_until), if deadline.is_some() => {
                machine.handle_write_timeout();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::mock::{MockCentral, MockCommand, MockJournal};
    use crate::infrastructure::bluetooth::platform::{PeripheralId, WriteStatus};
    use crate::infrastructure::bluetooth::protocol::{
        encode_config, SensorConfig, SensorIdMap, CONFIG_CHARACTERISTIC_UUID,
        DATA_CHARACTERISTIC_UUID, HEAD_TRACKING_SERVICE_UUID, INFO_CHARACTERISTIC_UUID,
    };

    const DEVICE: PeripheralId = PeripheralId(0xB05E);

    fn client() -> (
        HeadTrackingClient,
        mpsc::UnboundedSender<CentralEvent>,
        MockJournal,
    ) {
        let (central, journal) = MockCentral::new();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mut settings = TrackerSettings::default();
        settings.write_timeout_ms = 200;
        let client = HeadTrackingClient::spawn(central, event_rx, settings);
        (client, event_tx, journal)
    }

    fn send_connect_sequence(event_tx: &mpsc::UnboundedSender<CentralEvent>) {
        event_tx
            .send(CentralEvent::PeripheralDiscovered {
                id: DEVICE,
                name: Some("le-bose frames 123".into()),
                services: vec![HEAD_TRACKING_SERVICE_UUID],
                rssi: Some(-55),
            })
            .unwrap();
        event_tx
            .send(CentralEvent::PeripheralConnected { id: DEVICE })
            .unwrap();
        event_tx
            .send(CentralEvent::ServicesDiscovered {
                id: DEVICE,
                services: vec![HEAD_TRACKING_SERVICE_UUID],
            })
            .unwrap();
        event_tx
            .send(CentralEvent::CharacteristicsDiscovered {
                id: DEVICE,
                service: HEAD_TRACKING_SERVICE_UUID,
                characteristics: vec![
                    CONFIG_CHARACTERISTIC_UUID,
                    DATA_CHARACTERISTIC_UUID,
                    INFO_CHARACTERISTIC_UUID,
                ],
            })
            .unwrap();
    }

    fn send_config(event_tx: &mpsc::UnboundedSender<CentralEvent>, config: SensorConfig) {
        event_tx
            .send(CentralEvent::CharacteristicValue {
                id: DEVICE,
                characteristic: CONFIG_CHARACTERISTIC_UUID,
                value: encode_config(&config, &SensorIdMap::default()).to_vec(),
            })
            .unwrap();
    }

    fn quaternion_frame(accuracy: u8) -> CentralEvent {
        CentralEvent::CharacteristicValue {
            id: DEVICE,
            characteristic: DATA_CHARACTERISTIC_UUID,
            value: vec![2, 0, 10, 0, 0, 0, 0, 0, 0, 0x20, 0x00, accuracy],
        }
    }

    async fn wait_for_write(journal: &MockJournal) {
        for _ in 0..200 {
            let wrote = journal
                .commands()
                .iter()
                .any(|c| matches!(c, MockCommand::Write(..)));
            if wrote {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("config write never issued");
    }

    #[tokio::test]
    async fn facade_reaches_connected() {
        let (client, event_tx, _journal) = client();
        client.begin_scan().await.unwrap();
        send_connect_sequence(&event_tx);

        let mut state = client.connection_state();
        tokio::time::timeout(
            Duration::from_secs(1),
            state.wait_for(|s| *s == ConnectionState::Connected),
        )
        .await
        .expect("timed out")
        .unwrap();
    }

    #[tokio::test]
    async fn orientation_stream_delivers_latest_estimate() {
        let (client, event_tx, _journal) = client();
        client.begin_scan().await.unwrap();
        send_connect_sequence(&event_tx);

        // Burst of frames: a slow subscriber must still see the newest one.
        event_tx.send(quaternion_frame(1)).unwrap();
        event_tx.send(quaternion_frame(2)).unwrap();
        event_tx.send(quaternion_frame(3)).unwrap();

        let mut orientation = client.orientation();
        let estimate = tokio::time::timeout(
            Duration::from_secs(1),
            orientation.wait_for(|o| o.is_some_and(|e| e.accuracy == 3)),
        )
        .await
        .expect("timed out")
        .unwrap()
        .expect("estimate present");
        assert!((estimate.pitch - std::f64::consts::PI).abs() < 1e-6);
        assert_eq!(client.diagnostics().quaternion_frames, 3);
    }

    #[tokio::test]
    async fn malformed_frames_count_in_diagnostics() {
        let (client, event_tx, _journal) = client();
        client.begin_scan().await.unwrap();
        send_connect_sequence(&event_tx);

        event_tx
            .send(CentralEvent::CharacteristicValue {
                id: DEVICE,
                characteristic: DATA_CHARACTERISTIC_UUID,
                value: vec![2, 0, 10],
            })
            .unwrap();

        for _ in 0..200 {
            if client.diagnostics().dropped_frames() == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("dropped frame never counted");
    }

    #[tokio::test]
    async fn start_tracking_confirms_with_device() {
        let (client, event_tx, journal) = client();
        client.begin_scan().await.unwrap();
        send_connect_sequence(&event_tx);
        send_config(&event_tx, SensorConfig::default());

        let client = Arc::new(client);
        let tracking = {
            let client = client.clone();
            tokio::spawn(async move { client.start_tracking().await })
        };

        wait_for_write(&journal).await;
        event_tx
            .send(CentralEvent::WriteCompleted {
                id: DEVICE,
                characteristic: CONFIG_CHARACTERISTIC_UUID,
                status: WriteStatus::Acknowledged,
            })
            .unwrap();
        let mut streaming = SensorConfig::default();
        streaming.rotation_period = 80;
        send_config(&event_tx, streaming);

        assert_eq!(tracking.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn unacknowledged_write_times_out() {
        let (client, event_tx, journal) = client();
        client.begin_scan().await.unwrap();
        send_connect_sequence(&event_tx);
        send_config(&event_tx, SensorConfig::default());

        let client = Arc::new(client);
        let tracking = {
            let client = client.clone();
            tokio::spawn(async move { client.start_tracking().await })
        };
        wait_for_write(&journal).await;

        // No acknowledgement ever arrives; the 200 ms timeout must fire.
        assert_eq!(
            tracking.await.unwrap(),
            Err(HeadTrackingError::WriteNotAcknowledged)
        );
    }

    #[tokio::test]
    async fn shutdown_closes_pending_calls() {
        let (client, _event_tx, _journal) = client();
        client.shutdown();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            client.begin_scan().await,
            Err(HeadTrackingError::Closed)
        );
    }
}
