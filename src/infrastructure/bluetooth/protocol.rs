//! Bose Frames Head-Tracking Protocol
//!
//! Wire-format definitions for the head-tracking GATT service: UUID
//! constants, the sensor configuration record, and the sensor data frames.
//! Everything in this module is pure: bytes in, values out.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Head-tracking GATT service, advertised as the 16-bit id `0xFDD2`.
pub const HEAD_TRACKING_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000fdd2_0000_1000_8000_00805f9b34fb);

/// Config characteristic: read + write-with-response + notify.
///
/// Holds the 12-byte sensor configuration record; writing it starts or stops
/// the individual sensor streams.
pub const CONFIG_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x5af38af6_000e_404b_9b46_07f77580890b);

/// Data characteristic: notify only. Carries the 10/12-byte sensor frames.
pub const DATA_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x56a72ab8_4988_4cc8_a752_fbd1d54a953d);

/// Info characteristic: read only. Opaque device information blob.
pub const INFO_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x855cb3e7_98ff_42a6_80fc_40b32a2221c1);

/// Advertised-name prefix used as a secondary match during scanning.
pub const DEVICE_NAME_PREFIX: &str = "le-bose frames";

/// Update periods the firmware accepts, in milliseconds. 0 disables a stream.
pub const VALID_PERIODS_MS: [u16; 6] = [0, 20, 40, 80, 160, 320];

/// Exact wire size of the config record.
pub const CONFIG_LEN: usize = 12;
/// Exact wire size of a vector (accelerometer/gyroscope) frame.
pub const VECTOR_FRAME_LEN: usize = 10;
/// Exact wire size of a quaternion (rotation/game-rotation) frame.
pub const QUATERNION_FRAME_LEN: usize = 12;

pub fn is_valid_period(period_ms: u16) -> bool {
    VALID_PERIODS_MS.contains(&period_ms)
}

/// The three characteristics of the head-tracking service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharacteristicKind {
    Config,
    Data,
    Info,
}

impl CharacteristicKind {
    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        match uuid {
            CONFIG_CHARACTERISTIC_UUID => Some(Self::Config),
            DATA_CHARACTERISTIC_UUID => Some(Self::Data),
            INFO_CHARACTERISTIC_UUID => Some(Self::Info),
            _ => None,
        }
    }

    pub fn uuid(self) -> Uuid {
        match self {
            Self::Config => CONFIG_CHARACTERISTIC_UUID,
            Self::Data => DATA_CHARACTERISTIC_UUID,
            Self::Info => INFO_CHARACTERISTIC_UUID,
        }
    }
}

/// The four sensor streams the device can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    Accelerometer,
    Gyroscope,
    Rotation,
    GameRotation,
}

impl SensorKind {
    /// Fixed record order inside the config characteristic.
    pub const CONFIG_ORDER: [SensorKind; 4] = [
        SensorKind::Accelerometer,
        SensorKind::Gyroscope,
        SensorKind::Rotation,
        SensorKind::GameRotation,
    ];

    /// Whether frames from this sensor carry a quaternion (12 bytes) rather
    /// than a vector (10 bytes).
    pub fn is_quaternion(self) -> bool {
        matches!(self, SensorKind::Rotation | SensorKind::GameRotation)
    }

    pub fn frame_len(self) -> usize {
        if self.is_quaternion() {
            QUATERNION_FRAME_LEN
        } else {
            VECTOR_FRAME_LEN
        }
    }
}

/// Mapping from sensor kind to its one-byte wire id.
///
/// Firmware revisions have been observed with the accelerometer/gyroscope
/// assignment swapped; rotation = 2 and game-rotation = 3 are stable. The
/// default reflects the latest capture; confirm against real hardware before
/// trusting vector frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorIdMap {
    pub accelerometer: u8,
    pub gyroscope: u8,
    pub rotation: u8,
    pub game_rotation: u8,
}

impl Default for SensorIdMap {
    fn default() -> Self {
        Self {
            gyroscope: 0,
            accelerometer: 1,
            rotation: 2,
            game_rotation: 3,
        }
    }
}

impl SensorIdMap {
    pub fn id_of(&self, kind: SensorKind) -> u8 {
        match kind {
            SensorKind::Accelerometer => self.accelerometer,
            SensorKind::Gyroscope => self.gyroscope,
            SensorKind::Rotation => self.rotation,
            SensorKind::GameRotation => self.game_rotation,
        }
    }

    pub fn kind_of(&self, id: u8) -> Option<SensorKind> {
        SensorKind::CONFIG_ORDER
            .into_iter()
            .find(|&kind| self.id_of(kind) == id)
    }
}

/// Per-sensor update periods in milliseconds, 0 = stream disabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SensorConfig {
    pub accelerometer_period: u16,
    pub gyroscope_period: u16,
    pub rotation_period: u16,
    pub game_rotation_period: u16,
}

impl SensorConfig {
    pub fn period(&self, kind: SensorKind) -> u16 {
        match kind {
            SensorKind::Accelerometer => self.accelerometer_period,
            SensorKind::Gyroscope => self.gyroscope_period,
            SensorKind::Rotation => self.rotation_period,
            SensorKind::GameRotation => self.game_rotation_period,
        }
    }

    pub fn set_period(&mut self, kind: SensorKind, period_ms: u16) {
        match kind {
            SensorKind::Accelerometer => self.accelerometer_period = period_ms,
            SensorKind::Gyroscope => self.gyroscope_period = period_ms,
            SensorKind::Rotation => self.rotation_period = period_ms,
            SensorKind::GameRotation => self.game_rotation_period = period_ms,
        }
    }
}

/// A single decoded Data-characteristic notification.
///
/// Frames are ephemeral: decoded, consumed, dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorFrame {
    /// 10-byte accelerometer/gyroscope sample.
    Vector {
        sensor: SensorKind,
        timestamp: u16,
        x: i16,
        y: i16,
        z: i16,
        accuracy: u8,
    },
    /// 12-byte rotation/game-rotation sample; components are fixed-point
    /// with a 2^13 scale factor.
    Quaternion {
        sensor: SensorKind,
        timestamp: u16,
        x: i16,
        y: i16,
        z: i16,
        w: i16,
        accuracy: u8,
    },
}

impl SensorFrame {
    pub fn sensor(&self) -> SensorKind {
        match *self {
            SensorFrame::Vector { sensor, .. } | SensorFrame::Quaternion { sensor, .. } => sensor,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("truncated payload: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("unknown sensor id {0:#04x}")]
    UnknownSensorId(u8),
}

#[inline]
fn be_u16(hi: u8, lo: u8) -> u16 {
    (u16::from(hi) << 8) | u16::from(lo)
}

#[inline]
fn be_i16(hi: u8, lo: u8) -> i16 {
    be_u16(hi, lo) as i16
}

/// Decode the 12-byte config record: four (id, u16 BE period) entries.
///
/// Ids are resolved through `ids` rather than assumed positional, so a
/// firmware that reorders the records still decodes correctly.
pub fn decode_config(bytes: &[u8], ids: &SensorIdMap) -> Result<SensorConfig, DecodeError> {
    if bytes.len() != CONFIG_LEN {
        return Err(DecodeError::Truncated {
            expected: CONFIG_LEN,
            actual: bytes.len(),
        });
    }

    let mut config = SensorConfig::default();
    for record in bytes.chunks_exact(3) {
        let kind = ids
            .kind_of(record[0])
            .ok_or(DecodeError::UnknownSensorId(record[0]))?;
        config.set_period(kind, be_u16(record[1], record[2]));
    }
    Ok(config)
}

/// Encode a config record, records in the fixed order accelerometer,
/// gyroscope, rotation, game-rotation. Exact inverse of [`decode_config`].
pub fn encode_config(config: &SensorConfig, ids: &SensorIdMap) -> [u8; CONFIG_LEN] {
    let mut bytes = [0u8; CONFIG_LEN];
    for (record, kind) in bytes.chunks_exact_mut(3).zip(SensorKind::CONFIG_ORDER) {
        let period = config.period(kind);
        record[0] = ids.id_of(kind);
        record[1] = (period >> 8) as u8;
        record[2] = (period & 0xff) as u8;
    }
    bytes
}

/// Classify and decode one Data-characteristic notification.
///
/// The first byte names the sensor; vector sensors require exactly 10 bytes,
/// quaternion sensors exactly 12. All words are big-endian.
pub fn decode_frame(bytes: &[u8], ids: &SensorIdMap) -> Result<SensorFrame, DecodeError> {
    let &sensor_id = bytes.first().ok_or(DecodeError::Truncated {
        expected: 1,
        actual: 0,
    })?;
    let sensor = ids
        .kind_of(sensor_id)
        .ok_or(DecodeError::UnknownSensorId(sensor_id))?;

    if bytes.len() != sensor.frame_len() {
        return Err(DecodeError::Truncated {
            expected: sensor.frame_len(),
            actual: bytes.len(),
        });
    }

    let timestamp = be_u16(bytes[1], bytes[2]);
    let x = be_i16(bytes[3], bytes[4]);
    let y = be_i16(bytes[5], bytes[6]);
    let z = be_i16(bytes[7], bytes[8]);

    if sensor.is_quaternion() {
        Ok(SensorFrame::Quaternion {
            sensor,
            timestamp,
            x,
            y,
            z,
            w: be_i16(bytes[9], bytes[10]),
            accuracy: bytes[11],
        })
    } else {
        Ok(SensorFrame::Vector {
            sensor,
            timestamp,
            x,
            y,
            z,
            accuracy: bytes[9],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> SensorIdMap {
        SensorIdMap::default()
    }

    #[test]
    fn config_round_trip() {
        for &accel in &VALID_PERIODS_MS {
            for &rotation in &VALID_PERIODS_MS {
                let config = SensorConfig {
                    accelerometer_period: accel,
                    gyroscope_period: 20,
                    rotation_period: rotation,
                    game_rotation_period: 320,
                };
                let encoded = encode_config(&config, &ids());
                assert_eq!(decode_config(&encoded, &ids()), Ok(config));
            }
        }
    }

    #[test]
    fn config_known_bytes() {
        // accel id=1 period 0, gyro id=0 period 0, rotation id=2 period 80,
        // game-rotation id=3 period 320
        let bytes = [1, 0, 0, 0, 0, 0, 2, 0, 80, 3, 1, 64];
        let config = decode_config(&bytes, &ids()).unwrap();
        assert_eq!(config.rotation_period, 80);
        assert_eq!(config.game_rotation_period, 320);
        assert_eq!(config.accelerometer_period, 0);
        assert_eq!(encode_config(&config, &ids()), bytes);
    }

    #[test]
    fn config_rejects_wrong_length() {
        for len in [0, 1, 11, 13] {
            let bytes = vec![0u8; len];
            assert_eq!(
                decode_config(&bytes, &ids()),
                Err(DecodeError::Truncated {
                    expected: CONFIG_LEN,
                    actual: len
                })
            );
        }
    }

    #[test]
    fn config_rejects_unknown_id() {
        let mut bytes = encode_config(&SensorConfig::default(), &ids());
        bytes[6] = 9;
        assert_eq!(
            decode_config(&bytes, &ids()),
            Err(DecodeError::UnknownSensorId(9))
        );
    }

    #[test]
    fn vector_frame_decodes() {
        // gyroscope (id 0), timestamp 258, x=-2, y=1, z=-256, accuracy 3
        let bytes = [0, 1, 2, 0xff, 0xfe, 0, 1, 0xff, 0, 3];
        assert_eq!(
            decode_frame(&bytes, &ids()),
            Ok(SensorFrame::Vector {
                sensor: SensorKind::Gyroscope,
                timestamp: 258,
                x: -2,
                y: 1,
                z: -256,
                accuracy: 3,
            })
        );
    }

    #[test]
    fn quaternion_frame_decodes() {
        let bytes = [2, 0, 10, 0, 0, 0, 0, 0, 0, 0x20, 0x00, 2];
        assert_eq!(
            decode_frame(&bytes, &ids()),
            Ok(SensorFrame::Quaternion {
                sensor: SensorKind::Rotation,
                timestamp: 10,
                x: 0,
                y: 0,
                z: 0,
                w: 0x2000,
                accuracy: 2,
            })
        );
    }

    #[test]
    fn frame_length_is_exact() {
        // A rotation frame must be exactly 12 bytes; shorter or longer is truncated.
        for len in [1usize, 9, 11, 13] {
            let mut bytes = vec![0u8; len];
            bytes[0] = 2;
            assert_eq!(
                decode_frame(&bytes, &ids()),
                Err(DecodeError::Truncated {
                    expected: QUATERNION_FRAME_LEN,
                    actual: len
                })
            );
        }
        // Vector frames are 10 bytes.
        let bytes = vec![0u8; 12];
        assert_eq!(
            decode_frame(&bytes, &ids()),
            Err(DecodeError::Truncated {
                expected: VECTOR_FRAME_LEN,
                actual: 12
            })
        );
    }

    #[test]
    fn frame_rejects_unknown_sensor() {
        let bytes = [7u8, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            decode_frame(&bytes, &ids()),
            Err(DecodeError::UnknownSensorId(7))
        );
    }

    #[test]
    fn empty_frame_is_truncated() {
        assert_eq!(
            decode_frame(&[], &ids()),
            Err(DecodeError::Truncated {
                expected: 1,
                actual: 0
            })
        );
    }

    #[test]
    fn id_map_swap_reclassifies_vectors() {
        let swapped = SensorIdMap {
            accelerometer: 0,
            gyroscope: 1,
            ..SensorIdMap::default()
        };
        let bytes = [0, 0, 1, 0, 0, 0, 0, 0, 0, 0];
        match decode_frame(&bytes, &swapped).unwrap() {
            SensorFrame::Vector { sensor, .. } => assert_eq!(sensor, SensorKind::Accelerometer),
            other => panic!("expected vector frame, got {other:?}"),
        }
    }

    #[test]
    fn characteristic_kinds_resolve() {
        assert_eq!(
            CharacteristicKind::from_uuid(CONFIG_CHARACTERISTIC_UUID),
            Some(CharacteristicKind::Config)
        );
        assert_eq!(
            CharacteristicKind::from_uuid(DATA_CHARACTERISTIC_UUID),
            Some(CharacteristicKind::Data)
        );
        assert_eq!(
            CharacteristicKind::from_uuid(INFO_CHARACTERISTIC_UUID),
            Some(CharacteristicKind::Info)
        );
        assert_eq!(
            CharacteristicKind::from_uuid(HEAD_TRACKING_SERVICE_UUID),
            None
        );
    }
}
