use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use super::quantize::Quantizer;

bitflags! {
    /// Per-point classification and scanner flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct PointFlags: u8 {
        const SYNTHETIC = 0b0000_0001;
        const KEYPOINT = 0b0000_0010;
        const WITHHELD = 0b0000_0100;
        const OVERLAP = 0b0000_1000;
        /// Set when the mirror moves from left to right.
        const SCAN_DIRECTION = 0b0001_0000;
        const EDGE_OF_FLIGHTLINE = 0b0010_0000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Color {
    pub r: u16,
    pub g: u16,
    pub b: u16,
}

/// Reference into an external waveform packet store.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct WavePacket {
    pub descriptor_index: u8,
    pub byte_offset: u64,
    pub packet_size: u32,
    pub return_point: f32,
    pub dx: f32,
    pub dy: f32,
    pub dz: f32,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PointAttributes {
    pub intensity: u16,
    pub return_number: u8,
    pub number_of_returns: u8,
    /// Extended 8-bit classification.
    pub classification: u8,
    pub scanner_channel: u8,
    pub flags: PointFlags,
    pub scan_angle: f32,
    pub user_data: u8,
    pub point_source_id: u16,
    pub gps_time: Option<f64>,
    pub nir: Option<u16>,
    pub wave_packet: Option<WavePacket>,
    /// Values of the extra attributes declared in the header, already scaled.
    pub extra: Vec<f64>,
}

/// One point record. Coordinates are held as integers together with the quantizer
/// of the source they came from.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub quantizer: Quantizer,
    pub color: Option<Color>,
    pub attributes: PointAttributes,
}

impl Point {
    pub fn new(quantizer: Quantizer) -> Self {
        Self {
            quantizer,
            ..Default::default()
        }
    }

    pub fn get_x(&self) -> f64 {
        self.quantizer.to_real(0, self.x)
    }

    pub fn get_y(&self) -> f64 {
        self.quantizer.to_real(1, self.y)
    }

    pub fn get_z(&self) -> f64 {
        self.quantizer.to_real(2, self.z)
    }

    pub fn coordinates(&self) -> [f64; 3] {
        [self.get_x(), self.get_y(), self.get_z()]
    }

    pub fn set_x(&mut self, x: f64) {
        self.x = self.quantizer.to_storage(0, x);
    }

    pub fn set_y(&mut self, y: f64) {
        self.y = self.quantizer.to_storage(1, y);
    }

    pub fn set_z(&mut self, z: f64) {
        self.z = self.quantizer.to_storage(2, z);
    }

    pub fn set_coordinates(&mut self, coordinates: [f64; 3]) {
        [self.x, self.y, self.z] = self.quantizer.quantize(coordinates);
    }

    /// Re-expresses the coordinates with another quantizer.
    pub fn requantize(&mut self, quantizer: &Quantizer) {
        if self.quantizer == *quantizer {
            return;
        }
        let coordinates = self.coordinates();
        self.quantizer = *quantizer;
        self.set_coordinates(coordinates);
    }

    /// Classification as stored by point formats 0-5, which only have five bits.
    pub fn legacy_classification(&self) -> u8 {
        if self.attributes.classification < 32 {
            self.attributes.classification
        } else {
            0
        }
    }

    pub fn is_first_return(&self) -> bool {
        self.attributes.return_number <= 1
    }

    pub fn is_last_return(&self) -> bool {
        self.attributes.return_number >= self.attributes.number_of_returns
    }

    pub fn is_single_return(&self) -> bool {
        self.attributes.number_of_returns <= 1
    }

    pub fn has_flag(&self, flag: PointFlags) -> bool {
        self.attributes.flags.contains(flag)
    }

    pub fn set_flag(&mut self, flag: PointFlags, value: bool) {
        self.attributes.flags.set(flag, value);
    }

    pub fn extra_attribute(&self, index: usize) -> Option<f64> {
        self.attributes.extra.get(index).copied()
    }

    pub fn to_rgb8(&self) -> Option<[u8; 3]> {
        self.color.map(|c| {
            [
                (c.r as f64 / 65535.0 * 255.0) as u8,
                (c.g as f64 / 65535.0 * 255.0) as u8,
                (c.b as f64 / 65535.0 * 255.0) as u8,
            ]
        })
    }
}
