//! Head-Orientation Estimation
//!
//! Turns raw fixed-point quaternion frames into roll/pitch/yaw, corrected
//! for the headset's mounting and axis convention. Pure math, no I/O.

use crate::domain::models::OrientationEstimate;
use crate::infrastructure::bluetooth::protocol::SensorFrame;

/// Fixed-point scale of the quaternion components on the wire (2^13).
const QUATERNION_SCALE: f64 = 8192.0;

/// Reference orientation matrix (column-major 4x4), the calibration anchor
/// the correction transform is derived from.
const REFERENCE_ORIENTATION: [f64; 16] = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

/// Axis reflection applied to the reference basis. The headset reports a
/// left-handed frame; flipping Z brings it into the world frame used by the
/// audio renderer. Calibrated empirically per physical device.
const REFLECTION: [f64; 3] = [1.0, 1.0, -1.0];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quaternion {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

impl Quaternion {
    pub const IDENTITY: Quaternion = Quaternion {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        w: 1.0,
    };

    /// Hamilton product `self * rhs`. Order matters; the correction is
    /// always applied on the right.
    pub fn multiply(self, rhs: Quaternion) -> Quaternion {
        let Quaternion {
            x: qax,
            y: qay,
            z: qaz,
            w: qaw,
        } = self;
        let Quaternion {
            x: qbx,
            y: qby,
            z: qbz,
            w: qbw,
        } = rhs;

        Quaternion {
            x: qax * qbw + qaw * qbx + qay * qbz - qaz * qby,
            y: qay * qbw + qaw * qby + qaz * qbx - qax * qbz,
            z: qaz * qbw + qaw * qbz + qax * qby - qay * qbx,
            w: qaw * qbw - qax * qbx - qay * qby - qaz * qbz,
        }
    }

    /// Build a quaternion from a column-major 4x4 rotation matrix using the
    /// trace method.
    pub fn from_rotation_matrix(te: &[f64; 16]) -> Quaternion {
        let (m11, m12, m13) = (te[0], te[4], te[8]);
        let (m21, m22, m23) = (te[1], te[5], te[9]);
        let (m31, m32, m33) = (te[2], te[6], te[10]);
        let trace = m11 + m22 + m33;

        if trace > 0.0 {
            let s = 0.5 / (trace + 1.0).sqrt();
            Quaternion {
                w: 0.25 / s,
                x: (m32 - m23) * s,
                y: (m13 - m31) * s,
                z: (m21 - m12) * s,
            }
        } else if m11 > m22 && m11 > m33 {
            let s = 2.0 * (1.0 + m11 - m22 - m33).sqrt();
            Quaternion {
                w: (m32 - m23) / s,
                x: 0.25 * s,
                y: (m12 + m21) / s,
                z: (m13 + m31) / s,
            }
        } else if m22 > m33 {
            let s = 2.0 * (1.0 + m22 - m11 - m33).sqrt();
            Quaternion {
                w: (m13 - m31) / s,
                x: (m12 + m21) / s,
                y: 0.25 * s,
                z: (m23 + m32) / s,
            }
        } else {
            let s = 2.0 * (1.0 + m33 - m11 - m22).sqrt();
            Quaternion {
                w: (m21 - m12) / s,
                x: (m13 + m31) / s,
                y: (m23 + m32) / s,
                z: 0.25 * s,
            }
        }
    }

    /// Pitch in radians. The device zero points straight down, hence the +π
    /// shift followed by wrapping back into (−π, π].
    pub fn pitch(&self) -> f64 {
        let sinp = 2.0 * (self.w * self.x + self.y * self.z);
        let cosp = 1.0 - 2.0 * (self.x * self.x + self.y * self.y);
        let pitch = sinp.atan2(cosp) + std::f64::consts::PI;
        if pitch > std::f64::consts::PI {
            pitch - 2.0 * std::f64::consts::PI
        } else {
            pitch
        }
    }

    /// Roll in radians, clamped to ±π/2 at the gimbal-lock singularity.
    pub fn roll(&self) -> f64 {
        let sinr = 2.0 * (self.w * self.y - self.z * self.x);
        if sinr.abs() >= 1.0 {
            -(sinr.signum() * std::f64::consts::FRAC_PI_2)
        } else {
            -sinr.asin()
        }
    }

    /// Yaw in radians, negated so positive yaw is a rightward head turn.
    pub fn yaw(&self) -> f64 {
        let siny = 2.0 * (self.w * self.z + self.x * self.y);
        let cosy = 1.0 - 2.0 * (self.y * self.y + self.z * self.z);
        -siny.atan2(cosy)
    }
}

/// Correction matrix: the reference basis with [`REFLECTION`] applied.
fn correction_matrix() -> [f64; 16] {
    let te = REFERENCE_ORIENTATION;
    let vec_x = [te[0] * REFLECTION[0], te[1] * REFLECTION[1], te[2] * REFLECTION[2]];
    let vec_y = [te[4] * REFLECTION[0], te[5] * REFLECTION[1], te[6] * REFLECTION[2]];
    let vec_z = [te[8] * REFLECTION[0], te[9] * REFLECTION[1], te[10] * REFLECTION[2]];

    [
        vec_x[0], vec_y[0], vec_z[0], 0.0, //
        vec_x[1], vec_y[1], vec_z[1], 0.0, //
        vec_x[2], vec_y[2], vec_z[2], 0.0, //
        0.0, 0.0, 0.0, 1.0,
    ]
}

/// Converts quaternion frames into calibrated orientation estimates.
///
/// The correction transform is derived once at construction and immutable
/// afterwards.
#[derive(Debug, Clone)]
pub struct OrientationEstimator {
    correction: Quaternion,
}

impl Default for OrientationEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl OrientationEstimator {
    pub fn new() -> Self {
        Self {
            correction: Quaternion::from_rotation_matrix(&correction_matrix()),
        }
    }

    /// The fixed device-to-world correction quaternion.
    pub fn correction(&self) -> Quaternion {
        self.correction
    }

    /// Estimate orientation from a quaternion frame. Returns `None` for
    /// vector frames, which carry no orientation.
    pub fn estimate(&self, frame: &SensorFrame) -> Option<OrientationEstimate> {
        let SensorFrame::Quaternion {
            x, y, z, w, accuracy, ..
        } = *frame
        else {
            return None;
        };

        let raw = Quaternion {
            x: f64::from(x) / QUATERNION_SCALE,
            y: f64::from(y) / QUATERNION_SCALE,
            z: f64::from(z) / QUATERNION_SCALE,
            w: f64::from(w) / QUATERNION_SCALE,
        };
        let corrected = raw.multiply(self.correction);

        Some(OrientationEstimate {
            roll: corrected.roll(),
            pitch: corrected.pitch(),
            yaw: corrected.yaw(),
            accuracy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::{decode_frame, SensorIdMap};

    const EPS: f64 = 1e-6;

    #[test]
    fn correction_is_z_reflection_quaternion() {
        let estimator = OrientationEstimator::new();
        let c = estimator.correction();
        assert!((c.x - 0.0).abs() < 1e-12);
        assert!((c.y - 0.0).abs() < 1e-12);
        assert!((c.z - 0.0).abs() < 1e-12);
        assert!((c.w - std::f64::consts::FRAC_1_SQRT_2).abs() < 1e-12);
    }

    #[test]
    fn identity_frame_matches_correction_alone() {
        let estimator = OrientationEstimator::new();
        let frame = SensorFrame::Quaternion {
            sensor: crate::infrastructure::bluetooth::protocol::SensorKind::Rotation,
            timestamp: 0,
            x: 0,
            y: 0,
            z: 0,
            w: 8192,
            accuracy: 3,
        };
        let estimate = estimator.estimate(&frame).unwrap();

        let anchor = estimator.correction();
        assert!((estimate.pitch - anchor.pitch()).abs() < EPS);
        assert!((estimate.roll - anchor.roll()).abs() < EPS);
        assert!((estimate.yaw - anchor.yaw()).abs() < EPS);
    }

    #[test]
    fn gimbal_lock_clamps_roll() {
        // w*y - z*x = 1 → sin(roll argument) = 2, well past the asin domain.
        let locked = Quaternion {
            x: 0.0,
            y: 1.0,
            z: 0.0,
            w: 1.0,
        };
        assert_eq!(locked.roll(), -std::f64::consts::FRAC_PI_2);

        let locked_neg = Quaternion {
            x: 0.0,
            y: -1.0,
            z: 0.0,
            w: 1.0,
        };
        assert_eq!(locked_neg.roll(), std::f64::consts::FRAC_PI_2);
        assert!(!locked.roll().is_nan());
    }

    #[test]
    fn boundary_sine_is_still_clamped() {
        // |2(wy - zx)| == 1 exactly takes the clamped branch.
        let q = Quaternion {
            x: 0.0,
            y: 0.5,
            z: 0.0,
            w: 1.0,
        };
        assert_eq!(q.roll(), -std::f64::consts::FRAC_PI_2);
    }

    #[test]
    fn end_to_end_rotation_frame() {
        // Rotation id 2, timestamp 10, x=y=z=0, w=0x2000 (identity), accuracy 2.
        let bytes = [2, 0, 10, 0, 0, 0, 0, 0, 0, 0x20, 0x00, 2];
        let frame = decode_frame(&bytes, &SensorIdMap::default()).unwrap();
        let estimate = OrientationEstimator::new().estimate(&frame).unwrap();

        assert_eq!(estimate.accuracy, 2);
        assert!((estimate.pitch - std::f64::consts::PI).abs() < EPS);
        assert!(estimate.roll.abs() < EPS);
        assert!(estimate.yaw.abs() < EPS);
    }

    #[test]
    fn vector_frames_produce_no_estimate() {
        let estimator = OrientationEstimator::new();
        let frame = SensorFrame::Vector {
            sensor: crate::infrastructure::bluetooth::protocol::SensorKind::Gyroscope,
            timestamp: 0,
            x: 1,
            y: 2,
            z: 3,
            accuracy: 1,
        };
        assert!(estimator.estimate(&frame).is_none());
    }

    #[test]
    fn hamilton_product_is_ordered() {
        let a = Quaternion {
            x: 1.0,
            y: 0.0,
            z: 0.0,
            w: 0.0,
        };
        let b = Quaternion {
            x: 0.0,
            y: 1.0,
            z: 0.0,
            w: 0.0,
        };
        let ab = a.multiply(b);
        let ba = b.multiply(a);
        assert!((ab.z - 1.0).abs() < EPS);
        assert!((ba.z + 1.0).abs() < EPS);
    }
}
