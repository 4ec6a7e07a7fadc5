use serde::{Deserialize, Serialize};

use super::header::BoundingVolume;

const AXIS_NAMES: [&str; 3] = ["x", "y", "z"];

/// Converts a real coordinate into its integer storage value, rounding to nearest.
pub fn to_storage(real: f64, scale: f64, offset: f64) -> i32 {
    let n = ((real - offset) / scale).round();
    n.clamp(i32::MIN as f64, i32::MAX as f64) as i32
}

/// `real = value * scale + offset`
pub fn to_real(value: i32, scale: f64, offset: f64) -> f64 {
    value as f64 * scale + offset
}

/// True when `real` can be stored without saturating an `i32`.
pub fn fits_storage(real: f64, scale: f64, offset: f64) -> bool {
    let n = ((real - offset) / scale).round();
    n >= i32::MIN as f64 && n <= i32::MAX as f64
}

/// Offset that keeps a coordinate range centered on a round multiple of ten million units.
pub fn auto_offset(min: f64, max: f64, scale: f64) -> f64 {
    let center = (min + max) / scale / 20_000_000.0;
    if !center.is_finite() {
        return 0.0;
    }
    (center as i64) as f64 * 10_000_000.0 * scale
}

// LAS data coordinates are stored as i32 values
// The actual coordinates are calculated based on a combination of scale and offset, as follows
// x = (X * scale[0]) + offset[0]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quantizer {
    pub scale: [f64; 3],
    pub offset: [f64; 3],
}

impl Default for Quantizer {
    fn default() -> Self {
        Self {
            scale: [0.01, 0.01, 0.01],
            offset: [0.0, 0.0, 0.0],
        }
    }
}

impl Quantizer {
    pub fn new(scale: [f64; 3], offset: [f64; 3]) -> Self {
        Self { scale, offset }
    }

    pub fn to_storage(&self, axis: usize, real: f64) -> i32 {
        to_storage(real, self.scale[axis], self.offset[axis])
    }

    pub fn to_real(&self, axis: usize, value: i32) -> f64 {
        to_real(value, self.scale[axis], self.offset[axis])
    }

    pub fn quantize(&self, real: [f64; 3]) -> [i32; 3] {
        [
            self.to_storage(0, real[0]),
            self.to_storage(1, real[1]),
            self.to_storage(2, real[2]),
        ]
    }

    /// Moves `real` onto the quantization grid of `axis`.
    ///
    /// A snap whose result lies on the other side of zero than the input is refused:
    /// the input is returned unchanged together with `true`, and a warning is logged.
    pub fn snap(&self, axis: usize, label: &str, real: f64) -> (f64, bool) {
        let dequantized = self.to_real(axis, self.to_storage(axis, real));
        if (real > 0.0) != (dequantized > 0.0) {
            log::warn!(
                "quantization sign flip for {} from {} to {}",
                label,
                real,
                dequantized
            );
            log::warn!(
                "set a scale factor for {} finer than {} with --rescale",
                AXIS_NAMES[axis],
                self.scale[axis]
            );
            (real, true)
        } else {
            (dequantized, false)
        }
    }

    /// Snaps every corner of `bounds`; returns the number of refused sign flips.
    pub fn snap_bounds(&self, bounds: &mut BoundingVolume) -> usize {
        let mut flips = 0;
        for axis in 0..3 {
            let label = format!("min_{}", AXIS_NAMES[axis]);
            let (min, flipped) = self.snap(axis, &label, bounds.min[axis]);
            bounds.min[axis] = min;
            flips += flipped as usize;

            let label = format!("max_{}", AXIS_NAMES[axis]);
            let (max, flipped) = self.snap(axis, &label, bounds.max[axis]);
            bounds.max[axis] = max;
            flips += flipped as usize;
        }
        flips
    }

    /// True when some corner of `bounds` does not fit into `i32` storage.
    pub fn overflows(&self, bounds: &BoundingVolume) -> bool {
        if bounds.is_empty() {
            return false;
        }
        (0..3).any(|axis| {
            !fits_storage(bounds.min[axis], self.scale[axis], self.offset[axis])
                || !fits_storage(bounds.max[axis], self.scale[axis], self.offset[axis])
        })
    }

    /// Offsets centered on `bounds` for each axis, keeping the current scale.
    pub fn auto_offset(&self, bounds: &BoundingVolume) -> [f64; 3] {
        if bounds.is_empty() {
            return [0.0; 3];
        }
        [
            auto_offset(bounds.min[0], bounds.max[0], self.scale[0]),
            auto_offset(bounds.min[1], bounds.max[1], self.scale[1]),
            auto_offset(bounds.min[2], bounds.max[2], self.scale[2]),
        ]
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn storage_round_trip_has_no_drift() {
        let cases = [(0.01, 0.0), (0.001, 500_000.0), (1.0, 0.1), (0.25, -1234.5)];
        for (scale, offset) in cases {
            for value in [i32::MIN + 1, -1_000_000, -1, 0, 1, 42, 7_654_321, i32::MAX - 1] {
                let real = to_real(value, scale, offset);
                assert_eq!(to_storage(real, scale, offset), value, "{scale} {offset}");
            }
        }
    }

    #[test]
    fn to_storage_rounds_to_nearest() {
        assert_eq!(to_storage(1.004, 0.01, 0.0), 100);
        assert_eq!(to_storage(1.006, 0.01, 0.0), 101);
        assert_eq!(to_storage(-1.006, 0.01, 0.0), -101);
        assert_eq!(to_storage(10.5, 1.0, 0.0), 11);
    }

    #[test]
    fn sign_flip_keeps_original_value() {
        let quantizer = Quantizer::new([1.0, 1.0, 1.0], [0.1, 0.0, 0.0]);
        let (value, flipped) = quantizer.snap(0, "min_x", -0.3);
        assert!(flipped);
        assert_relative_eq!(value, -0.3);

        let mut bounds = BoundingVolume {
            min: [-0.3, 2.2, 0.0],
            max: [4.6, 7.7, 1.2],
        };
        let flips = quantizer.snap_bounds(&mut bounds);
        assert_eq!(flips, 1);
        assert_relative_eq!(bounds.min[0], -0.3);
        assert_relative_eq!(bounds.max[0], 5.1);
        assert_relative_eq!(bounds.min[1], 2.0);
        assert_relative_eq!(bounds.max[2], 1.0);
    }

    #[test]
    fn snap_without_flip_takes_grid_value() {
        let quantizer = Quantizer::new([0.01, 0.01, 0.01], [0.0; 3]);
        let (value, flipped) = quantizer.snap(1, "min_y", 12.3456);
        assert!(!flipped);
        assert_relative_eq!(value, 12.35, epsilon = 1e-9);
    }

    #[test]
    fn detects_storage_overflow() {
        let quantizer = Quantizer::new([0.001, 0.001, 0.001], [0.0; 3]);
        let bounds = BoundingVolume {
            min: [0.0, 0.0, 0.0],
            max: [3_000_000.0, 10.0, 10.0],
        };
        assert!(quantizer.overflows(&bounds));

        let centered = Quantizer::new(quantizer.scale, quantizer.auto_offset(&bounds));
        assert!(!centered.overflows(&bounds));
    }

    #[test]
    fn auto_offset_of_non_finite_range_is_zero() {
        assert_eq!(auto_offset(f64::MAX, f64::MAX, 0.001), 0.0);
        assert_eq!(auto_offset(f64::NAN, 1.0, 0.01), 0.0);
        assert_relative_eq!(auto_offset(400_000.0, 600_000.0, 0.01), 500_000.0);
    }
}
