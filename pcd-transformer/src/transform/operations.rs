use std::collections::BTreeMap;

use pcd_core::pointcloud::{
    field_mask::FieldMask,
    point::{Point, PointFlags},
};
use rand::{rngs::StdRng, Rng, SeedableRng};

use super::Operation;
use crate::error::TransformError;

macro_rules! operation_boilerplate {
    () => {
        fn box_clone(&self) -> Box<dyn Operation> {
            Box::new(self.clone())
        }
    };
}

// --- coordinates -----------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TranslateXYZ {
    delta: [f64; 3],
}

impl TranslateXYZ {
    pub fn new(dx: f64, dy: f64, dz: f64) -> Self {
        Self {
            delta: [dx, dy, dz],
        }
    }
}

impl Operation for TranslateXYZ {
    fn name(&self) -> &'static str {
        "translate_xyz"
    }

    fn apply(&mut self, point: &mut Point) {
        let [x, y, z] = point.coordinates();
        point.set_coordinates([x + self.delta[0], y + self.delta[1], z + self.delta[2]]);
    }

    fn decompress_hint(&self) -> FieldMask {
        FieldMask::Z
    }

    operation_boilerplate!();
}

#[derive(Debug, Clone)]
pub struct ScaleXYZ {
    factor: [f64; 3],
}

impl ScaleXYZ {
    pub fn new(sx: f64, sy: f64, sz: f64) -> Self {
        Self {
            factor: [sx, sy, sz],
        }
    }
}

impl Operation for ScaleXYZ {
    fn name(&self) -> &'static str {
        "scale_xyz"
    }

    fn apply(&mut self, point: &mut Point) {
        let [x, y, z] = point.coordinates();
        point.set_coordinates([x * self.factor[0], y * self.factor[1], z * self.factor[2]]);
    }

    fn decompress_hint(&self) -> FieldMask {
        FieldMask::Z
    }

    operation_boilerplate!();
}

/// Rotates around `(x, y)` by `angle` degrees counter-clockwise.
#[derive(Debug, Clone)]
pub struct RotateXY {
    center: [f64; 2],
    cos: f64,
    sin: f64,
}

impl RotateXY {
    pub fn new(angle: f64, x: f64, y: f64) -> Self {
        let radians = angle.to_radians();
        Self {
            center: [x, y],
            cos: radians.cos(),
            sin: radians.sin(),
        }
    }
}

impl Operation for RotateXY {
    fn name(&self) -> &'static str {
        "rotate_xy"
    }

    fn apply(&mut self, point: &mut Point) {
        let x = point.get_x() - self.center[0];
        let y = point.get_y() - self.center[1];
        point.set_x(self.cos * x - self.sin * y + self.center[0]);
        point.set_y(self.cos * y + self.sin * x + self.center[1]);
    }

    operation_boilerplate!();
}

#[derive(Debug, Clone)]
pub struct ClampZ {
    min: f64,
    max: f64,
}

impl ClampZ {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }
}

impl Operation for ClampZ {
    fn name(&self) -> &'static str {
        "clamp_z"
    }

    fn apply(&mut self, point: &mut Point) {
        let z = point.get_z();
        if z < self.min {
            point.set_z(self.min);
        } else if z > self.max {
            point.set_z(self.max);
        }
    }

    fn decompress_hint(&self) -> FieldMask {
        FieldMask::Z
    }

    operation_boilerplate!();
}

#[derive(Debug, Clone)]
pub struct ClampRawZ {
    min: i32,
    max: i32,
}

impl ClampRawZ {
    pub fn new(min: i32, max: i32) -> Self {
        Self { min, max }
    }
}

impl Operation for ClampRawZ {
    fn name(&self) -> &'static str {
        "clamp_raw_z"
    }

    fn apply(&mut self, point: &mut Point) {
        point.z = point.z.clamp(self.min, self.max);
    }

    fn decompress_hint(&self) -> FieldMask {
        FieldMask::Z
    }

    operation_boilerplate!();
}

/// Adds a uniformly distributed integer offset in `-max..=max` to the raw X and Y.
#[derive(Debug, Clone)]
pub struct TranslateRawXYAtRandom {
    max: [i32; 2],
    seed: u64,
    rng: StdRng,
}

impl TranslateRawXYAtRandom {
    pub fn new(max_x: i32, max_y: i32, seed: u64) -> Self {
        Self {
            max: [max_x.abs(), max_y.abs()],
            seed,
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Operation for TranslateRawXYAtRandom {
    fn name(&self) -> &'static str {
        "translate_raw_xy_at_random"
    }

    fn apply(&mut self, point: &mut Point) {
        let dx = self.rng.random_range(-self.max[0]..=self.max[0]);
        let dy = self.rng.random_range(-self.max[1]..=self.max[1]);
        point.x = point.x.saturating_add(dx);
        point.y = point.y.saturating_add(dy);
    }

    fn reset(&mut self) {
        self.rng = StdRng::seed_from_u64(self.seed);
    }

    operation_boilerplate!();
}

// --- attributes ------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SetClassification(u8);

impl SetClassification {
    pub fn new(classification: u8) -> Self {
        Self(classification)
    }
}

impl Operation for SetClassification {
    fn name(&self) -> &'static str {
        "set_classification"
    }

    fn apply(&mut self, point: &mut Point) {
        point.attributes.classification = self.0;
    }

    operation_boilerplate!();
}

#[derive(Debug, Clone)]
pub struct ChangeClassificationFromTo {
    from: u8,
    to: u8,
}

impl ChangeClassificationFromTo {
    pub fn new(from: u8, to: u8) -> Self {
        Self { from, to }
    }
}

impl Operation for ChangeClassificationFromTo {
    fn name(&self) -> &'static str {
        "change_classification_from_to"
    }

    fn apply(&mut self, point: &mut Point) {
        if point.attributes.classification == self.from {
            point.attributes.classification = self.to;
        }
    }

    fn decompress_hint(&self) -> FieldMask {
        FieldMask::CLASSIFICATION
    }

    operation_boilerplate!();
}

#[derive(Debug, Clone)]
pub struct SetPointSource(u16);

impl SetPointSource {
    pub const NAME: &'static str = "set_point_source";

    pub fn new(point_source_id: u16) -> Self {
        Self(point_source_id)
    }
}

impl Operation for SetPointSource {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn apply(&mut self, point: &mut Point) {
        point.attributes.point_source_id = self.0;
    }

    operation_boilerplate!();
}

/// Writes `floor(gps_time / bin_size)` into the point source ID.
#[derive(Debug, Clone)]
pub struct BinGpsTimeIntoPointSource {
    bin_size: f64,
}

impl BinGpsTimeIntoPointSource {
    pub fn new(bin_size: f64) -> Result<Self, TransformError> {
        if bin_size <= 0.0 || !bin_size.is_finite() {
            return Err(TransformError::InvalidParameter {
                operation: "bin_gps_time_into_point_source",
                message: format!("bin size {} must be positive", bin_size),
            });
        }
        Ok(Self { bin_size })
    }
}

impl Operation for BinGpsTimeIntoPointSource {
    fn name(&self) -> &'static str {
        "bin_gps_time_into_point_source"
    }

    fn apply(&mut self, point: &mut Point) {
        let time = point.attributes.gps_time.unwrap_or(0.0);
        let bin = (time / self.bin_size).floor();
        point.attributes.point_source_id = bin.clamp(0.0, u16::MAX as f64) as u16;
    }

    fn decompress_hint(&self) -> FieldMask {
        FieldMask::GPS_TIME
    }

    operation_boilerplate!();
}

#[derive(Debug, Clone)]
pub struct SetUserData(u8);

impl SetUserData {
    pub fn new(user_data: u8) -> Self {
        Self(user_data)
    }
}

impl Operation for SetUserData {
    fn name(&self) -> &'static str {
        "set_user_data"
    }

    fn apply(&mut self, point: &mut Point) {
        point.attributes.user_data = self.0;
    }

    operation_boilerplate!();
}

#[derive(Debug, Clone)]
pub struct ScaleIntensity(f32);

impl ScaleIntensity {
    pub fn new(factor: f32) -> Self {
        Self(factor)
    }
}

impl Operation for ScaleIntensity {
    fn name(&self) -> &'static str {
        "scale_intensity"
    }

    fn apply(&mut self, point: &mut Point) {
        let scaled = point.attributes.intensity as f32 * self.0 + 0.5;
        point.attributes.intensity = scaled.clamp(0.0, u16::MAX as f32) as u16;
    }

    fn decompress_hint(&self) -> FieldMask {
        FieldMask::INTENSITY
    }

    operation_boilerplate!();
}

/// Replaces intensities found in a lookup table; other values pass unchanged.
#[derive(Debug, Clone)]
pub struct MapIntensity {
    table: BTreeMap<u16, u16>,
}

impl MapIntensity {
    pub fn new(table: BTreeMap<u16, u16>) -> Self {
        Self { table }
    }
}

impl Operation for MapIntensity {
    fn name(&self) -> &'static str {
        "map_intensity"
    }

    fn apply(&mut self, point: &mut Point) {
        if let Some(&mapped) = self.table.get(&point.attributes.intensity) {
            point.attributes.intensity = mapped;
        }
    }

    fn decompress_hint(&self) -> FieldMask {
        FieldMask::INTENSITY
    }

    operation_boilerplate!();
}

/// Sets zero return numbers and zero return counts to one.
#[derive(Debug, Clone)]
pub struct RepairZeroReturns;

impl Operation for RepairZeroReturns {
    fn name(&self) -> &'static str {
        "repair_zero_returns"
    }

    fn apply(&mut self, point: &mut Point) {
        if point.attributes.number_of_returns == 0 {
            point.attributes.number_of_returns = 1;
        }
        if point.attributes.return_number == 0 {
            point.attributes.return_number = 1;
        }
    }

    operation_boilerplate!();
}

#[derive(Debug, Clone)]
pub struct SetFlag {
    flag: PointFlags,
    value: bool,
    name: &'static str,
}

impl SetFlag {
    pub fn withheld(value: bool) -> Self {
        Self {
            flag: PointFlags::WITHHELD,
            value,
            name: "set_withheld_flag",
        }
    }

    pub fn synthetic(value: bool) -> Self {
        Self {
            flag: PointFlags::SYNTHETIC,
            value,
            name: "set_synthetic_flag",
        }
    }

    pub fn keypoint(value: bool) -> Self {
        Self {
            flag: PointFlags::KEYPOINT,
            value,
            name: "set_keypoint_flag",
        }
    }

    pub fn overlap(value: bool) -> Self {
        Self {
            flag: PointFlags::OVERLAP,
            value,
            name: "set_overlap_flag",
        }
    }
}

impl Operation for SetFlag {
    fn name(&self) -> &'static str {
        self.name
    }

    fn apply(&mut self, point: &mut Point) {
        point.set_flag(self.flag, self.value);
    }

    operation_boilerplate!();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RgbScale {
    /// 16-bit to 8-bit.
    Down,
    /// 8-bit to 16-bit.
    Up,
}

#[derive(Debug, Clone)]
pub struct ScaleRgb(RgbScale);

impl ScaleRgb {
    pub fn new(direction: RgbScale) -> Self {
        Self(direction)
    }
}

impl Operation for ScaleRgb {
    fn name(&self) -> &'static str {
        match self.0 {
            RgbScale::Down => "scale_rgb_down",
            RgbScale::Up => "scale_rgb_up",
        }
    }

    fn apply(&mut self, point: &mut Point) {
        if let Some(color) = point.color.as_mut() {
            for channel in [&mut color.r, &mut color.g, &mut color.b] {
                *channel = match self.0 {
                    RgbScale::Down => *channel / 256,
                    RgbScale::Up => channel.saturating_mul(256),
                };
            }
        }
    }

    fn decompress_hint(&self) -> FieldMask {
        FieldMask::RGB
    }

    operation_boilerplate!();
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use pcd_core::pointcloud::point::Color;
    use pcd_core::pointcloud::quantize::Quantizer;

    use super::*;

    fn make_point(x: f64, y: f64, z: f64) -> Point {
        let mut point = Point::new(Quantizer::new([0.001; 3], [0.0; 3]));
        point.set_coordinates([x, y, z]);
        point
    }

    #[test]
    fn rotate_quarter_turn_around_center() {
        let mut rotate = RotateXY::new(90.0, 10.0, 10.0);
        let mut point = make_point(11.0, 10.0, 0.0);
        rotate.apply(&mut point);
        assert_relative_eq!(point.get_x(), 10.0, epsilon = 1e-9);
        assert_relative_eq!(point.get_y(), 11.0, epsilon = 1e-9);
    }

    #[test]
    fn clamp_z_limits_both_ends() {
        let mut clamp = ClampZ::new(0.0, 5.0);
        let mut low = make_point(0.0, 0.0, -3.0);
        let mut high = make_point(0.0, 0.0, 8.0);
        let mut mid = make_point(0.0, 0.0, 2.5);
        clamp.apply(&mut low);
        clamp.apply(&mut high);
        clamp.apply(&mut mid);
        assert_eq!(low.z, 0);
        assert_eq!(high.z, 5000);
        assert_eq!(mid.z, 2500);

        let mut raw = ClampRawZ::new(-10, 10);
        raw.apply(&mut high);
        assert_eq!(high.z, 10);
    }

    #[test]
    fn classification_changes() {
        let mut point = make_point(0.0, 0.0, 0.0);
        point.attributes.classification = 1;
        ChangeClassificationFromTo::new(1, 2).apply(&mut point);
        assert_eq!(point.attributes.classification, 2);
        ChangeClassificationFromTo::new(1, 7).apply(&mut point);
        assert_eq!(point.attributes.classification, 2);
    }

    #[test]
    fn gps_time_bins() {
        let mut bin = BinGpsTimeIntoPointSource::new(100.0).unwrap();
        let mut point = make_point(0.0, 0.0, 0.0);
        point.attributes.gps_time = Some(1234.5);
        bin.apply(&mut point);
        assert_eq!(point.attributes.point_source_id, 12);
        assert!(BinGpsTimeIntoPointSource::new(0.0).is_err());
    }

    #[test]
    fn intensity_operations() {
        let mut point = make_point(0.0, 0.0, 0.0);
        point.attributes.intensity = 100;
        ScaleIntensity::new(2.5).apply(&mut point);
        assert_eq!(point.attributes.intensity, 250);
        ScaleIntensity::new(1000.0).apply(&mut point);
        assert_eq!(point.attributes.intensity, u16::MAX);

        let mut map = MapIntensity::new(BTreeMap::from([(u16::MAX, 1), (5, 6)]));
        map.apply(&mut point);
        assert_eq!(point.attributes.intensity, 1);
        map.apply(&mut point);
        assert_eq!(point.attributes.intensity, 1);
    }

    #[test]
    fn repair_zero_returns() {
        let mut point = make_point(0.0, 0.0, 0.0);
        RepairZeroReturns.apply(&mut point);
        assert_eq!(point.attributes.return_number, 1);
        assert_eq!(point.attributes.number_of_returns, 1);
    }

    #[test]
    fn flags_and_rgb() {
        let mut point = make_point(0.0, 0.0, 0.0);
        SetFlag::synthetic(true).apply(&mut point);
        assert!(point.has_flag(PointFlags::SYNTHETIC));
        SetFlag::synthetic(false).apply(&mut point);
        assert!(!point.has_flag(PointFlags::SYNTHETIC));

        point.color = Some(Color {
            r: 65535,
            g: 256,
            b: 0,
        });
        ScaleRgb::new(RgbScale::Down).apply(&mut point);
        assert_eq!(point.color, Some(Color { r: 255, g: 1, b: 0 }));
        ScaleRgb::new(RgbScale::Up).apply(&mut point);
        assert_eq!(
            point.color,
            Some(Color {
                r: 65280,
                g: 256,
                b: 0
            })
        );
    }
}
