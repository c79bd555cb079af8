//! Windows BLE Backend
//!
//! [`BleCentral`] implementation over the WinRT Bluetooth LE APIs:
//! advertisement watcher for scanning, address-based connect, GATT
//! service/characteristic lookup, CCCD subscription and characteristic I/O.
//! Every completion is posted back as a [`CentralEvent`]; nothing here
//! blocks the engine task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use windows::core::GUID;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEScanningMode,
};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
    GattCommunicationStatus, GattDeviceService, GattValueChangedEventArgs, GattWriteOption,
};
use windows::Devices::Bluetooth::{BluetoothConnectionStatus, BluetoothLEDevice};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter, IBuffer};

use crate::infrastructure::bluetooth::platform::{
    AdapterState, BleCentral, CentralEvent, PeripheralId, WriteStatus,
};

fn guid_from_uuid(uuid: Uuid) -> GUID {
    GUID::from_u128(uuid.as_u128())
}

fn uuid_from_guid(guid: &GUID) -> Uuid {
    Uuid::from_u128(guid.to_u128())
}

fn buffer_to_vec(buffer: &IBuffer) -> windows::core::Result<Vec<u8>> {
    let reader = DataReader::FromBuffer(buffer)?;
    let length = reader.UnconsumedBufferLength()? as usize;
    let mut bytes = vec![0u8; length];
    reader.ReadBytes(&mut bytes)?;
    Ok(bytes)
}

#[derive(Default)]
struct Inner {
    watcher: Option<BluetoothLEAdvertisementWatcher>,
    device: Option<BluetoothLEDevice>,
    service: Option<GattDeviceService>,
    characteristics: HashMap<Uuid, GattCharacteristic>,
}

/// WinRT-backed BLE central. Construct inside a tokio runtime; asynchronous
/// WinRT operations run on spawned tasks and report through the event
/// channel returned by [`WinRtCentral::new`].
pub struct WinRtCentral {
    events: mpsc::UnboundedSender<CentralEvent>,
    inner: Arc<Mutex<Inner>>,
}

impl WinRtCentral {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CentralEvent>) {
        let (events, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                events,
                inner: Arc::new(Mutex::new(Inner::default())),
            },
            event_rx,
        )
    }

    fn characteristic(&self, uuid: Uuid) -> Option<GattCharacteristic> {
        self.inner.lock().unwrap().characteristics.get(&uuid).cloned()
    }

    fn current_device(&self) -> Option<BluetoothLEDevice> {
        self.inner.lock().unwrap().device.clone()
    }
}

impl BleCentral for WinRtCentral {
    fn adapter_state(&self) -> AdapterState {
        // WinRT surfaces radio problems as scan/connect failures rather than
        // an up-front state query; report the optimistic answer and let those
        // failures drive the state machine.
        AdapterState::PoweredOn
    }

    fn start_scan(&mut self, service: Uuid) {
        info!(%service, "starting BLE advertisement watcher");
        let watcher = match BluetoothLEAdvertisementWatcher::new() {
            Ok(w) => w,
            Err(e) => {
                warn!(error = %e, "could not create advertisement watcher");
                return;
            }
        };
        if let Err(e) = watcher.SetScanningMode(BluetoothLEScanningMode::Active) {
            warn!(error = %e, "could not set active scanning mode");
        }

        let events = self.events.clone();
        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let advertisement = args.Advertisement()?;

                    let mut services = Vec::new();
                    if let Ok(uuids) = advertisement.ServiceUuids() {
                        for i in 0..uuids.Size()? {
                            services.push(uuid_from_guid(&uuids.GetAt(i)?));
                        }
                    }

                    let name = advertisement
                        .LocalName()
                        .ok()
                        .map(|n| n.to_string())
                        .filter(|n| !n.is_empty());

                    let _ = events.send(CentralEvent::PeripheralDiscovered {
                        id: PeripheralId(args.BluetoothAddress()?),
                        name,
                        services,
                        rssi: args.RawSignalStrengthInDBm().ok(),
                    });
                }
                Ok(())
            },
        );

        if let Err(e) = watcher.Received(&handler) {
            warn!(error = %e, "could not register advertisement handler");
            return;
        }
        if let Err(e) = watcher.Start() {
            warn!(error = %e, "could not start advertisement watcher");
            return;
        }
        self.inner.lock().unwrap().watcher = Some(watcher);
    }

    fn stop_scan(&mut self) {
        if let Some(watcher) = self.inner.lock().unwrap().watcher.take() {
            info!("stopping BLE advertisement watcher");
            if let Err(e) = watcher.Stop() {
                warn!(error = %e, "could not stop advertisement watcher");
            }
        }
    }

    fn connect(&mut self, id: PeripheralId) {
        let events = self.events.clone();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let connected: windows::core::Result<BluetoothLEDevice> = async {
                BluetoothLEDevice::FromBluetoothAddressAsync(id.0)?.await
            }
            .await;

            match connected {
                Ok(device) => {
                    // Link-loss watcher, mirrors the unsolicited-disconnect
                    // delegate callback.
                    let status_events = events.clone();
                    let handler = TypedEventHandler::new(
                        move |dev: windows::core::Ref<BluetoothLEDevice>, _| {
                            if let Some(dev) = dev.as_ref() {
                                if let Ok(status) = dev.ConnectionStatus() {
                                    if status == BluetoothConnectionStatus::Disconnected {
                                        let _ = status_events
                                            .send(CentralEvent::PeripheralDisconnected { id });
                                    }
                                }
                            }
                            Ok(())
                        },
                    );
                    if let Err(e) = device.ConnectionStatusChanged(&handler) {
                        warn!(error = %e, "could not watch connection status");
                    }

                    inner.lock().unwrap().device = Some(device);
                    let _ = events.send(CentralEvent::PeripheralConnected { id });
                }
                Err(e) => {
                    let _ = events.send(CentralEvent::ConnectFailed {
                        id,
                        reason: e.to_string(),
                    });
                }
            }
        });
    }

    fn cancel_connection(&mut self, id: PeripheralId) {
        let mut inner = self.inner.lock().unwrap();
        inner.characteristics.clear();
        inner.service = None;
        if let Some(device) = inner.device.take() {
            info!(%id, "closing BLE device");
            if let Err(e) = device.Close() {
                warn!(error = %e, "error closing device");
            }
            // Close() produces no status-change callback for an already-dead
            // link; report the disconnect ourselves.
            let _ = self.events.send(CentralEvent::PeripheralDisconnected { id });
        } else {
            let _ = self.events.send(CentralEvent::PeripheralDisconnected { id });
        }
    }

    fn discover_services(&mut self, id: PeripheralId, service: Uuid) {
        let Some(device) = self.current_device() else {
            return;
        };
        let events = self.events.clone();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let result: windows::core::Result<Option<GattDeviceService>> = async {
                let services = device
                    .GetGattServicesForUuidAsync(guid_from_uuid(service))?
                    .await?;
                if services.Status()? != GattCommunicationStatus::Success {
                    return Ok(None);
                }
                let list = services.Services()?;
                if list.Size()? == 0 {
                    return Ok(None);
                }
                Ok(Some(list.GetAt(0)?))
            }
            .await;

            match result {
                Ok(Some(gatt_service)) => {
                    inner.lock().unwrap().service = Some(gatt_service);
                    let _ = events.send(CentralEvent::ServicesDiscovered {
                        id,
                        services: vec![service],
                    });
                }
                Ok(None) => {
                    let _ = events.send(CentralEvent::ServicesDiscovered {
                        id,
                        services: Vec::new(),
                    });
                }
                Err(e) => {
                    let _ = events.send(CentralEvent::DiscoveryFailed {
                        id,
                        reason: e.to_string(),
                    });
                }
            }
        });
    }

    fn discover_characteristics(&mut self, id: PeripheralId, service: Uuid) {
        let gatt_service = self.inner.lock().unwrap().service.clone();
        let Some(gatt_service) = gatt_service else {
            return;
        };
        let events = self.events.clone();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let result: windows::core::Result<Vec<(Uuid, GattCharacteristic)>> = async {
                let chars = gatt_service.GetCharacteristicsAsync()?.await?;
                if chars.Status()? != GattCommunicationStatus::Success {
                    return Ok(Vec::new());
                }
                let list = chars.Characteristics()?;
                let mut found = Vec::new();
                for i in 0..list.Size()? {
                    let characteristic = list.GetAt(i)?;
                    found.push((uuid_from_guid(&characteristic.Uuid()?), characteristic));
                }
                Ok(found)
            }
            .await;

            match result {
                Ok(found) => {
                    let uuids: Vec<Uuid> = found.iter().map(|(u, _)| *u).collect();
                    debug!(count = uuids.len(), "characteristics discovered");
                    inner.lock().unwrap().characteristics.extend(found);
                    let _ = events.send(CentralEvent::CharacteristicsDiscovered {
                        id,
                        service,
                        characteristics: uuids,
                    });
                }
                Err(e) => {
                    let _ = events.send(CentralEvent::DiscoveryFailed {
                        id,
                        reason: e.to_string(),
                    });
                }
            }
        });
    }

    fn subscribe(&mut self, id: PeripheralId, characteristic: Uuid) {
        let Some(gatt_char) = self.characteristic(characteristic) else {
            warn!(%characteristic, "subscribe to unknown characteristic, ignored");
            return;
        };
        let events = self.events.clone();
        tokio::spawn(async move {
            let value_events = events.clone();
            let handler = TypedEventHandler::new(
                move |c: windows::core::Ref<GattCharacteristic>,
                      args: windows::core::Ref<GattValueChangedEventArgs>| {
                    if let (Some(c), Some(args)) = (c.as_ref(), args.as_ref()) {
                        let uuid = uuid_from_guid(&c.Uuid()?);
                        if let Ok(bytes) = buffer_to_vec(&args.CharacteristicValue()?) {
                            let _ = value_events.send(CentralEvent::CharacteristicValue {
                                id,
                                characteristic: uuid,
                                value: bytes,
                            });
                        }
                    }
                    Ok(())
                },
            );
            if let Err(e) = gatt_char.ValueChanged(&handler) {
                warn!(error = %e, "could not register value-changed handler");
                return;
            }

            let status = async {
                gatt_char
                    .WriteClientCharacteristicConfigurationDescriptorAsync(
                        GattClientCharacteristicConfigurationDescriptorValue::Notify,
                    )?
                    .await
            }
            .await;
            match status {
                Ok(GattCommunicationStatus::Success) => {
                    debug!(%characteristic, "notifications enabled")
                }
                Ok(other) => warn!(%characteristic, ?other, "notification subscription refused"),
                Err(e) => warn!(%characteristic, error = %e, "notification subscription failed"),
            }
        });
    }

    fn read(&mut self, id: PeripheralId, characteristic: Uuid) {
        let Some(gatt_char) = self.characteristic(characteristic) else {
            warn!(%characteristic, "read of unknown characteristic, ignored");
            return;
        };
        let events = self.events.clone();
        tokio::spawn(async move {
            let result: windows::core::Result<Option<Vec<u8>>> = async {
                let read = gatt_char.ReadValueAsync()?.await?;
                if read.Status()? != GattCommunicationStatus::Success {
                    return Ok(None);
                }
                Ok(Some(buffer_to_vec(&read.Value()?)?))
            }
            .await;

            match result {
                Ok(Some(value)) => {
                    let _ = events.send(CentralEvent::CharacteristicValue {
                        id,
                        characteristic,
                        value,
                    });
                }
                Ok(None) => warn!(%characteristic, "characteristic read refused"),
                Err(e) => warn!(%characteristic, error = %e, "characteristic read failed"),
            }
        });
    }

    fn write_with_response(&mut self, id: PeripheralId, characteristic: Uuid, value: &[u8]) {
        let Some(gatt_char) = self.characteristic(characteristic) else {
            warn!(%characteristic, "write to unknown characteristic, ignored");
            return;
        };
        let events = self.events.clone();
        let payload = value.to_vec();
        tokio::spawn(async move {
            let status: windows::core::Result<GattCommunicationStatus> = async {
                let writer = DataWriter::new()?;
                writer.WriteBytes(&payload)?;
                let buffer = writer.DetachBuffer()?;
                gatt_char
                    .WriteValueWithOptionAsync(&buffer, GattWriteOption::WriteWithResponse)?
                    .await
            }
            .await;

            let status = match status {
                Ok(GattCommunicationStatus::Success) => WriteStatus::Acknowledged,
                Ok(other) => WriteStatus::Failed(format!("{other:?}")),
                Err(e) => WriteStatus::Failed(e.to_string()),
            };
            let _ = events.send(CentralEvent::WriteCompleted {
                id,
                characteristic,
                status,
            });
        });
    }
}
