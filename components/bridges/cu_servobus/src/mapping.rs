//! Conversions between joint angles in degrees and raw positions.
//!
//! The mapping is piecewise linear around `zero`: `max` sits at +90° and
//! `min` at -90°. Angles beyond ±90° extrapolate along the same line, the
//! mapping never clamps. Reversed servos (`max < zero < min`) need no
//! special case, the signs of the spans carry the direction.

use crate::calibration::{CalibrationPoint, RawPosition};

/// Angle of the `max` and `min` reference points.
pub const REFERENCE_ANGLE: f64 = 90.0;

impl CalibrationPoint {
    /// Raw span covered by 0..+90°.
    fn positive_span(&self) -> i64 {
        self.max as i64 - self.zero as i64
    }

    /// Raw span covered by -90..0°.
    fn negative_span(&self) -> i64 {
        self.zero as i64 - self.min as i64
    }

    /// Raw position for `angle` degrees, rounded to the nearest unit.
    pub fn angle_to_position(&self, angle: f64) -> RawPosition {
        if angle == 0.0 {
            return self.zero;
        }
        let span = if angle > 0.0 {
            self.positive_span()
        } else {
            self.negative_span()
        };
        let position = self.zero as f64 + angle / REFERENCE_ANGLE * span as f64;
        position.round() as RawPosition
    }

    /// Angle in degrees for a raw position.
    ///
    /// A degenerate calibration, where the span on the relevant side is zero,
    /// maps to 0°.
    pub fn position_to_angle(&self, position: RawPosition) -> f64 {
        let offset = position as i64 - self.zero as i64;
        if offset == 0 {
            return 0.0;
        }
        let (pos, neg) = (self.positive_span(), self.negative_span());
        // Direction in which raw values grow toward +90°.
        let direction = if pos != 0 { pos.signum() } else { neg.signum() };
        if direction == 0 {
            return 0.0;
        }
        let span = if offset.signum() == direction { pos } else { neg };
        if span == 0 {
            return 0.0;
        }
        REFERENCE_ANGLE * offset as f64 / span as f64
    }
}
