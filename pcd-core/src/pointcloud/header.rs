use serde::{Deserialize, Serialize};

use super::point::Point;
use super::quantize::Quantizer;

/// The LAS extra-bytes VLR addresses at most this many attribute descriptors.
pub const MAX_EXTRA_ATTRIBUTES: usize = 32;

/// Number of return slots tracked by LAS 1.4 headers.
pub const RETURN_SLOTS: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingVolume {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl Default for BoundingVolume {
    fn default() -> Self {
        Self::empty()
    }
}

impl BoundingVolume {
    pub fn empty() -> Self {
        Self {
            min: [f64::MAX, f64::MAX, f64::MAX],
            max: [f64::MIN, f64::MIN, f64::MIN],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.min[0] > self.max[0] || self.min[1] > self.max[1] || self.min[2] > self.max[2]
    }

    pub fn extend(&mut self, position: [f64; 3]) {
        for axis in 0..3 {
            self.min[axis] = self.min[axis].min(position[axis]);
            self.max[axis] = self.max[axis].max(position[axis]);
        }
    }

    pub fn union(&mut self, other: &BoundingVolume) {
        if other.is_empty() {
            return;
        }
        self.extend(other.min);
        self.extend(other.max);
    }

    /// Closed-interval overlap test in the xy plane.
    pub fn intersects_xy(&self, other: &BoundingVolume) -> bool {
        self.min[0] <= other.max[0]
            && self.max[0] >= other.min[0]
            && self.min[1] <= other.max[1]
            && self.max[1] >= other.min[1]
    }

    pub fn contains_xy(&self, x: f64, y: f64) -> bool {
        self.min[0] <= x && x <= self.max[0] && self.min[1] <= y && y <= self.max[1]
    }

    /// Grows the box by `distance` in x and y.
    pub fn grown_xy(&self, distance: f64) -> Self {
        Self {
            min: [self.min[0] - distance, self.min[1] - distance, self.min[2]],
            max: [self.max[0] + distance, self.max[1] + distance, self.max[2]],
        }
    }
}

/// Describes one extra per-point attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDescriptor {
    pub name: String,
    /// LAS extra-bytes data type (1..=10), or 0 for opaque bytes of `size` length.
    pub data_type: u8,
    pub size: usize,
    pub scale: f64,
    pub offset: f64,
    pub no_data: Option<f64>,
    pub description: String,
}

impl AttributeDescriptor {
    pub fn new(name: &str, data_type: u8) -> Self {
        Self {
            name: name.to_string(),
            data_type,
            size: Self::size_of_type(data_type).unwrap_or(1),
            scale: 1.0,
            offset: 0.0,
            no_data: None,
            description: String::new(),
        }
    }

    pub fn size_of_type(data_type: u8) -> Option<usize> {
        match data_type {
            1 | 2 => Some(1),
            3 | 4 => Some(2),
            5 | 6 | 9 => Some(4),
            7 | 8 | 10 => Some(8),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub file_source_id: u16,
    pub point_format: u8,
    pub point_record_length: u16,
    pub point_count: u64,
    pub point_count_by_return: [u64; RETURN_SLOTS],
    pub quantizer: Quantizer,
    pub bounds: BoundingVolume,
    pub attributes: Vec<AttributeDescriptor>,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            file_source_id: 0,
            point_format: 0,
            point_record_length: 20,
            point_count: 0,
            point_count_by_return: [0; RETURN_SLOTS],
            quantizer: Quantizer::default(),
            bounds: BoundingVolume::empty(),
            attributes: Vec::new(),
        }
    }
}

impl Header {
    /// Registers an extra attribute, returning its index, or `None` when the table is full.
    pub fn add_attribute(&mut self, descriptor: AttributeDescriptor) -> Option<usize> {
        if self.attributes.len() >= MAX_EXTRA_ATTRIBUTES {
            log::warn!(
                "cannot add attribute '{}': at most {} extra attributes are supported",
                descriptor.name,
                MAX_EXTRA_ATTRIBUTES
            );
            return None;
        }
        self.attributes.push(descriptor);
        Some(self.attributes.len() - 1)
    }

    pub fn attribute_index(&self, name: &str) -> Option<usize> {
        self.attributes.iter().position(|a| a.name == name)
    }

    /// Clears the counts and the bounding box before a populate pass.
    pub fn reset_statistics(&mut self) {
        self.point_count = 0;
        self.point_count_by_return = [0; RETURN_SLOTS];
        self.bounds = BoundingVolume::empty();
    }

    /// Adds one point to the counts and the bounding box.
    pub fn count_point(&mut self, point: &Point) {
        self.point_count += 1;
        let return_number = point.attributes.return_number as usize;
        if (1..=RETURN_SLOTS).contains(&return_number) {
            self.point_count_by_return[return_number - 1] += 1;
        }
        self.bounds.extend(point.coordinates());
    }

    /// Adds the counts and box of another header, as done when concatenating sources.
    pub fn accumulate(&mut self, other: &Header) {
        self.point_count += other.point_count;
        for (count, other) in self
            .point_count_by_return
            .iter_mut()
            .zip(other.point_count_by_return)
        {
            *count += other;
        }
        self.bounds.union(&other.bounds);
    }

    /// Re-derives the bounding box from its own quantized corners.
    pub fn snap_bounds(&mut self) -> usize {
        if self.bounds.is_empty() {
            return 0;
        }
        let quantizer = self.quantizer;
        quantizer.snap_bounds(&mut self.bounds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pointcloud::point::Point;

    fn make_point(x: f64, y: f64, z: f64, return_number: u8) -> Point {
        let mut point = Point::new(Quantizer::default());
        point.set_coordinates([x, y, z]);
        point.attributes.return_number = return_number;
        point
    }

    #[test]
    fn count_point_tracks_returns_and_bounds() {
        let mut header = Header::default();
        header.count_point(&make_point(1.0, 2.0, 3.0, 1));
        header.count_point(&make_point(-1.0, 5.0, 0.5, 2));
        header.count_point(&make_point(0.0, 0.0, 0.0, 0));

        assert_eq!(header.point_count, 3);
        assert_eq!(header.point_count_by_return[0], 1);
        assert_eq!(header.point_count_by_return[1], 1);
        assert_eq!(header.bounds.min, [-1.0, 0.0, 0.0]);
        assert_eq!(header.bounds.max, [1.0, 5.0, 3.0]);
    }

    #[test]
    fn attribute_table_is_bounded() {
        let mut header = Header::default();
        for i in 0..MAX_EXTRA_ATTRIBUTES {
            let index = header.add_attribute(AttributeDescriptor::new(&format!("a{i}"), 9));
            assert_eq!(index, Some(i));
        }
        assert!(header
            .add_attribute(AttributeDescriptor::new("overflow", 9))
            .is_none());
        assert_eq!(header.attribute_index("a3"), Some(3));
    }

    #[test]
    fn union_ignores_empty_boxes() {
        let mut bounds = BoundingVolume {
            min: [0.0, 0.0, 0.0],
            max: [1.0, 1.0, 1.0],
        };
        bounds.union(&BoundingVolume::empty());
        assert_eq!(bounds.max, [1.0, 1.0, 1.0]);
        assert!(BoundingVolume::empty().is_empty());
    }
}
