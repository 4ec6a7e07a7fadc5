use pcd_core::pointcloud::{header::Header, quantize::Quantizer};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Replacement scale and offset applied to a header right after open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RescaleReoffset {
    /// Per-axis scale; `None` keeps the source scale of that axis.
    pub scale: [Option<f64>; 3],
    pub offset: Option<[f64; 3]>,
    /// Center the offset on the bounding box. Ignored when `offset` is set.
    pub auto_offset: bool,
}

impl RescaleReoffset {
    /// Forces exactly `quantizer`, as merged readers do for their members.
    pub fn fixed(quantizer: Quantizer) -> Self {
        Self {
            scale: quantizer.scale.map(Some),
            offset: Some(quantizer.offset),
            auto_offset: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.scale.iter().any(Option::is_some) || self.offset.is_some() || self.auto_offset
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (scale, axis) in self.scale.iter().zip(['x', 'y', 'z']) {
            if let Some(scale) = *scale {
                if !(scale.is_finite() && scale > 0.0) {
                    return Err(ConfigError::InvalidScale(scale, axis));
                }
            }
        }
        Ok(())
    }

    /// Resulting quantizer for `header`, without touching it.
    pub fn resolve(&self, header: &Header) -> Quantizer {
        let current = header.quantizer;
        let mut scale = current.scale;
        for (axis, value) in self.scale.iter().enumerate() {
            if let Some(value) = *value {
                scale[axis] = value;
            }
        }
        let offset = match self.offset {
            Some(offset) => offset,
            None if self.auto_offset => Quantizer::new(scale, current.offset).auto_offset(&header.bounds),
            None => current.offset,
        };
        Quantizer::new(scale, offset)
    }

    /// Rewrites the header quantization. Returns the new quantizer when points
    /// need requantizing.
    pub fn apply(&self, header: &mut Header) -> Option<Quantizer> {
        if !self.is_active() {
            return None;
        }
        let quantizer = self.resolve(header);
        if quantizer == header.quantizer {
            return None;
        }
        if quantizer.overflows(&header.bounds) {
            log::warn!(
                "bounding box {:?} overflows 32-bit storage with scale {:?} and offset {:?}",
                header.bounds,
                quantizer.scale,
                quantizer.offset
            );
        }
        header.quantizer = quantizer;
        header.snap_bounds();
        Some(quantizer)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use pcd_core::pointcloud::header::BoundingVolume;

    use super::*;

    fn header() -> Header {
        Header {
            quantizer: Quantizer::new([0.01; 3], [0.0; 3]),
            bounds: BoundingVolume {
                min: [630000.123, 4830000.456, 10.0],
                max: [631000.0, 4831000.0, 20.0],
            },
            ..Default::default()
        }
    }

    #[test]
    fn inactive_leaves_header_alone() {
        let mut header = header();
        assert!(RescaleReoffset::default().apply(&mut header).is_none());
        assert_eq!(header.bounds.min[0], 630000.123);
    }

    #[test]
    fn rescale_snaps_bounds() {
        let mut header = header();
        let rescale = RescaleReoffset {
            scale: [Some(0.1), Some(0.1), None],
            ..Default::default()
        };
        let quantizer = rescale.apply(&mut header).unwrap();
        assert_eq!(quantizer.scale, [0.1, 0.1, 0.01]);
        assert_relative_eq!(header.bounds.min[0], 630000.1, epsilon = 1e-6);
        assert_relative_eq!(header.bounds.min[1], 4830000.5, epsilon = 1e-6);
    }

    #[test]
    fn auto_offset_centers_on_bounds() {
        let mut header = header();
        let rescale = RescaleReoffset {
            auto_offset: true,
            ..Default::default()
        };
        let quantizer = rescale.apply(&mut header).unwrap();
        assert!(quantizer.offset[0] > 0.0);
        assert!(!quantizer.overflows(&header.bounds));
    }

    #[test]
    fn rejects_non_positive_scale() {
        let rescale = RescaleReoffset {
            scale: [None, None, Some(0.0)],
            ..Default::default()
        };
        assert!(matches!(
            rescale.validate(),
            Err(ConfigError::InvalidScale(_, 'z'))
        ));
    }
}
