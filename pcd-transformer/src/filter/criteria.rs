use std::any::Any;
use std::collections::{hash_map::Entry, BTreeSet, HashMap, HashSet};

use pcd_core::pointcloud::{
    field_mask::FieldMask,
    header::Header,
    point::{Point, PointFlags},
};
use rand::{rngs::StdRng, Rng, SeedableRng};

use super::Criterion;
use crate::error::FilterError;

macro_rules! criterion_boilerplate {
    () => {
        fn as_any(&self) -> &dyn Any {
            self
        }

        fn box_clone(&self) -> Box<dyn Criterion> {
            Box::new(self.clone())
        }
    };
}

/// 256-bit membership set for 8-bit values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ByteSet([u64; 4]);

impl ByteSet {
    pub fn from_values(values: &[u8]) -> Self {
        let mut set = Self::default();
        for &value in values {
            set.insert(value);
        }
        set
    }

    pub fn insert(&mut self, value: u8) {
        self.0[(value >> 6) as usize] |= 1 << (value & 63);
    }

    pub fn contains(&self, value: u8) -> bool {
        self.0[(value >> 6) as usize] & (1 << (value & 63)) != 0
    }

    pub fn union(&mut self, other: &ByteSet) {
        for (word, other) in self.0.iter_mut().zip(other.0) {
            *word |= other;
        }
    }

    pub fn values(&self) -> impl Iterator<Item = u8> + '_ {
        (0..=255u8).filter(|&v| self.contains(v))
    }

    fn describe(&self, name: &str) -> String {
        let mut text = name.to_string();
        for value in self.values() {
            text.push_str(&format!(" {}", value));
        }
        text
    }
}

// --- spatial ---------------------------------------------------------------

/// Keeps points with `min <= xy < max`.
#[derive(Debug, Clone)]
pub struct KeepXY {
    min: [f64; 2],
    max: [f64; 2],
}

impl KeepXY {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min: [min_x, min_y],
            max: [max_x, max_y],
        }
    }
}

impl Criterion for KeepXY {
    fn name(&self) -> &'static str {
        "keep_xy"
    }

    fn reject(&mut self, point: &Point) -> bool {
        let (x, y) = (point.get_x(), point.get_y());
        !(self.min[0] <= x && self.min[1] <= y && x < self.max[0] && y < self.max[1])
    }

    criterion_boilerplate!();
}

#[derive(Debug, Clone)]
pub struct KeepXYZ {
    min: [f64; 3],
    max: [f64; 3],
}

impl KeepXYZ {
    pub fn new(min: [f64; 3], max: [f64; 3]) -> Self {
        Self { min, max }
    }

    fn inside(&self, point: &Point) -> bool {
        let position = point.coordinates();
        (0..3).all(|axis| self.min[axis] <= position[axis] && position[axis] < self.max[axis])
    }
}

impl Criterion for KeepXYZ {
    fn name(&self) -> &'static str {
        "keep_xyz"
    }

    fn reject(&mut self, point: &Point) -> bool {
        !self.inside(point)
    }

    fn decompress_hint(&self) -> FieldMask {
        FieldMask::Z
    }

    criterion_boilerplate!();
}

#[derive(Debug, Clone)]
pub struct DropXYZ(KeepXYZ);

impl DropXYZ {
    pub fn new(min: [f64; 3], max: [f64; 3]) -> Self {
        Self(KeepXYZ::new(min, max))
    }
}

impl Criterion for DropXYZ {
    fn name(&self) -> &'static str {
        "drop_xyz"
    }

    fn reject(&mut self, point: &Point) -> bool {
        self.0.inside(point)
    }

    fn decompress_hint(&self) -> FieldMask {
        FieldMask::Z
    }

    criterion_boilerplate!();
}

/// Keeps points with `min <= z < max`.
#[derive(Debug, Clone)]
pub struct KeepZ {
    min: f64,
    max: f64,
}

impl KeepZ {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn below(max: f64) -> Self {
        Self::new(f64::MIN, max)
    }

    pub fn above(min: f64) -> Self {
        Self::new(min, f64::MAX)
    }
}

impl Criterion for KeepZ {
    fn name(&self) -> &'static str {
        "keep_z"
    }

    fn reject(&mut self, point: &Point) -> bool {
        let z = point.get_z();
        !(self.min <= z && z < self.max)
    }

    fn decompress_hint(&self) -> FieldMask {
        FieldMask::Z
    }

    criterion_boilerplate!();
}

#[derive(Debug, Clone)]
pub struct DropZ {
    min: f64,
    max: f64,
}

impl DropZ {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }
}

impl Criterion for DropZ {
    fn name(&self) -> &'static str {
        "drop_z"
    }

    fn reject(&mut self, point: &Point) -> bool {
        let z = point.get_z();
        self.min <= z && z < self.max
    }

    fn decompress_hint(&self) -> FieldMask {
        FieldMask::Z
    }

    criterion_boilerplate!();
}

// --- masks -----------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct KeepClassifications {
    classes: ByteSet,
}

impl KeepClassifications {
    pub fn new(classes: &[u8]) -> Self {
        Self {
            classes: ByteSet::from_values(classes),
        }
    }
}

impl Criterion for KeepClassifications {
    fn name(&self) -> &'static str {
        "keep_classification"
    }

    fn reject(&mut self, point: &Point) -> bool {
        !self.classes.contains(point.attributes.classification)
    }

    fn decompress_hint(&self) -> FieldMask {
        FieldMask::CLASSIFICATION
    }

    fn merge(&mut self, other: &dyn Criterion) -> bool {
        match other.as_any().downcast_ref::<Self>() {
            Some(other) => {
                self.classes.union(&other.classes);
                true
            }
            None => false,
        }
    }

    fn describe(&self) -> String {
        self.classes.describe(self.name())
    }

    criterion_boilerplate!();
}

#[derive(Debug, Clone)]
pub struct DropClassifications {
    classes: ByteSet,
}

impl DropClassifications {
    pub fn new(classes: &[u8]) -> Self {
        Self {
            classes: ByteSet::from_values(classes),
        }
    }
}

impl Criterion for DropClassifications {
    fn name(&self) -> &'static str {
        "drop_classification"
    }

    fn reject(&mut self, point: &Point) -> bool {
        self.classes.contains(point.attributes.classification)
    }

    fn decompress_hint(&self) -> FieldMask {
        FieldMask::CLASSIFICATION
    }

    fn merge(&mut self, other: &dyn Criterion) -> bool {
        match other.as_any().downcast_ref::<Self>() {
            Some(other) => {
                self.classes.union(&other.classes);
                true
            }
            None => false,
        }
    }

    fn describe(&self) -> String {
        self.classes.describe(self.name())
    }

    criterion_boilerplate!();
}

/// Keeps points whose return number is in the set (0 through 15).
#[derive(Debug, Clone)]
pub struct KeepReturns {
    mask: u16,
}

impl KeepReturns {
    pub fn new(returns: &[u8]) -> Self {
        let mask = returns
            .iter()
            .filter(|&&r| r < 16)
            .fold(0u16, |mask, &r| mask | (1 << r));
        Self { mask }
    }
}

impl Criterion for KeepReturns {
    fn name(&self) -> &'static str {
        "keep_return"
    }

    fn reject(&mut self, point: &Point) -> bool {
        let r = point.attributes.return_number;
        r >= 16 || self.mask & (1 << r) == 0
    }

    fn merge(&mut self, other: &dyn Criterion) -> bool {
        match other.as_any().downcast_ref::<Self>() {
            Some(other) => {
                self.mask |= other.mask;
                true
            }
            None => false,
        }
    }

    fn describe(&self) -> String {
        let mut text = self.name().to_string();
        for r in (0..16).filter(|r| self.mask & (1 << r) != 0) {
            text.push_str(&format!(" {}", r));
        }
        text
    }

    criterion_boilerplate!();
}

/// Membership in a set of point source IDs. Several IDs are OR-combined.
#[derive(Debug, Clone)]
pub struct KeepPointSources {
    ids: BTreeSet<u16>,
}

impl KeepPointSources {
    pub fn new(ids: &[u16]) -> Self {
        Self {
            ids: ids.iter().copied().collect(),
        }
    }
}

impl Criterion for KeepPointSources {
    fn name(&self) -> &'static str {
        "keep_point_source"
    }

    fn reject(&mut self, point: &Point) -> bool {
        !self.ids.contains(&point.attributes.point_source_id)
    }

    fn decompress_hint(&self) -> FieldMask {
        FieldMask::POINT_SOURCE
    }

    fn merge(&mut self, other: &dyn Criterion) -> bool {
        match other.as_any().downcast_ref::<Self>() {
            Some(other) => {
                self.ids.extend(other.ids.iter().copied());
                true
            }
            None => false,
        }
    }

    fn describe(&self) -> String {
        let mut text = self.name().to_string();
        for id in &self.ids {
            text.push_str(&format!(" {}", id));
        }
        text
    }

    criterion_boilerplate!();
}

#[derive(Debug, Clone)]
pub struct KeepUserData {
    values: ByteSet,
}

impl KeepUserData {
    pub fn new(values: &[u8]) -> Self {
        Self {
            values: ByteSet::from_values(values),
        }
    }
}

impl Criterion for KeepUserData {
    fn name(&self) -> &'static str {
        "keep_user_data"
    }

    fn reject(&mut self, point: &Point) -> bool {
        !self.values.contains(point.attributes.user_data)
    }

    fn decompress_hint(&self) -> FieldMask {
        FieldMask::USER_DATA
    }

    fn merge(&mut self, other: &dyn Criterion) -> bool {
        match other.as_any().downcast_ref::<Self>() {
            Some(other) => {
                self.values.union(&other.values);
                true
            }
            None => false,
        }
    }

    fn describe(&self) -> String {
        self.values.describe(self.name())
    }

    criterion_boilerplate!();
}

#[derive(Debug, Clone)]
pub struct KeepScannerChannels {
    mask: u8,
}

impl KeepScannerChannels {
    pub fn new(channels: &[u8]) -> Self {
        let mask = channels
            .iter()
            .filter(|&&c| c < 4)
            .fold(0u8, |mask, &c| mask | (1 << c));
        Self { mask }
    }
}

impl Criterion for KeepScannerChannels {
    fn name(&self) -> &'static str {
        "keep_scanner_channel"
    }

    fn reject(&mut self, point: &Point) -> bool {
        let channel = point.attributes.scanner_channel;
        channel >= 4 || self.mask & (1 << channel) == 0
    }

    fn merge(&mut self, other: &dyn Criterion) -> bool {
        match other.as_any().downcast_ref::<Self>() {
            Some(other) => {
                self.mask |= other.mask;
                true
            }
            None => false,
        }
    }

    criterion_boilerplate!();
}

// --- simple predicates -----------------------------------------------------

#[derive(Debug, Clone)]
pub struct KeepFirstReturn;

impl Criterion for KeepFirstReturn {
    fn name(&self) -> &'static str {
        "keep_first"
    }

    fn reject(&mut self, point: &Point) -> bool {
        !point.is_first_return()
    }

    criterion_boilerplate!();
}

#[derive(Debug, Clone)]
pub struct KeepLastReturn;

impl Criterion for KeepLastReturn {
    fn name(&self) -> &'static str {
        "keep_last"
    }

    fn reject(&mut self, point: &Point) -> bool {
        !point.is_last_return()
    }

    criterion_boilerplate!();
}

#[derive(Debug, Clone)]
pub struct DropSingleReturns;

impl Criterion for DropSingleReturns {
    fn name(&self) -> &'static str {
        "drop_single"
    }

    fn reject(&mut self, point: &Point) -> bool {
        point.is_single_return()
    }

    criterion_boilerplate!();
}

/// Closed intensity range.
#[derive(Debug, Clone)]
pub struct KeepIntensityRange {
    min: u16,
    max: u16,
}

impl KeepIntensityRange {
    pub fn new(min: u16, max: u16) -> Self {
        Self { min, max }
    }
}

impl Criterion for KeepIntensityRange {
    fn name(&self) -> &'static str {
        "keep_intensity"
    }

    fn reject(&mut self, point: &Point) -> bool {
        let intensity = point.attributes.intensity;
        intensity < self.min || intensity > self.max
    }

    fn decompress_hint(&self) -> FieldMask {
        FieldMask::INTENSITY
    }

    criterion_boilerplate!();
}

#[derive(Debug, Clone)]
pub struct KeepScanAngleRange {
    min: f32,
    max: f32,
}

impl KeepScanAngleRange {
    pub fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }
}

impl Criterion for KeepScanAngleRange {
    fn name(&self) -> &'static str {
        "keep_scan_angle"
    }

    fn reject(&mut self, point: &Point) -> bool {
        let angle = point.attributes.scan_angle;
        angle < self.min || angle > self.max
    }

    fn decompress_hint(&self) -> FieldMask {
        FieldMask::SCAN_ANGLE
    }

    criterion_boilerplate!();
}

/// Keeps points with `min <= gps_time < max`. Points without a time are dropped.
#[derive(Debug, Clone)]
pub struct KeepGpsTimeRange {
    min: f64,
    max: f64,
}

impl KeepGpsTimeRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }
}

impl Criterion for KeepGpsTimeRange {
    fn name(&self) -> &'static str {
        "keep_gps_time"
    }

    fn reject(&mut self, point: &Point) -> bool {
        match point.attributes.gps_time {
            Some(t) => !(self.min <= t && t < self.max),
            None => true,
        }
    }

    fn decompress_hint(&self) -> FieldMask {
        FieldMask::GPS_TIME
    }

    criterion_boilerplate!();
}

/// Drops points carrying a flag.
#[derive(Debug, Clone)]
pub struct DropFlagged {
    flag: PointFlags,
    name: &'static str,
}

impl DropFlagged {
    pub fn withheld() -> Self {
        Self {
            flag: PointFlags::WITHHELD,
            name: "drop_withheld",
        }
    }

    pub fn synthetic() -> Self {
        Self {
            flag: PointFlags::SYNTHETIC,
            name: "drop_synthetic",
        }
    }

    pub fn keypoint() -> Self {
        Self {
            flag: PointFlags::KEYPOINT,
            name: "drop_keypoint",
        }
    }

    pub fn overlap() -> Self {
        Self {
            flag: PointFlags::OVERLAP,
            name: "drop_overlap",
        }
    }
}

impl Criterion for DropFlagged {
    fn name(&self) -> &'static str {
        self.name
    }

    fn reject(&mut self, point: &Point) -> bool {
        point.has_flag(self.flag)
    }

    fn decompress_hint(&self) -> FieldMask {
        FieldMask::FLAGS
    }

    criterion_boilerplate!();
}

/// Closed range over one extra attribute. Points lacking the attribute are dropped.
#[derive(Debug, Clone)]
pub struct KeepAttributeRange {
    index: usize,
    min: f64,
    max: f64,
}

impl KeepAttributeRange {
    pub fn new(index: usize, min: f64, max: f64) -> Self {
        Self { index, min, max }
    }
}

impl Criterion for KeepAttributeRange {
    fn name(&self) -> &'static str {
        "keep_attribute"
    }

    fn reject(&mut self, point: &Point) -> bool {
        match point.extra_attribute(self.index) {
            Some(value) => value < self.min || value > self.max,
            None => true,
        }
    }

    fn decompress_hint(&self) -> FieldMask {
        FieldMask::extra_attribute(self.index)
    }

    fn validate(&self, header: &Header) -> Result<(), FilterError> {
        if self.index >= header.attributes.len() {
            return Err(FilterError::AttributeOutOfRange {
                criterion: self.name(),
                index: self.index,
                available: header.attributes.len(),
            });
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!(
            "{} {} {} {}",
            self.name(),
            self.index,
            self.min,
            self.max
        )
    }

    criterion_boilerplate!();
}

// --- stateful --------------------------------------------------------------

/// Keeps every nth point.
#[derive(Debug, Clone)]
pub struct KeepEveryNth {
    nth: u32,
    counter: u32,
}

impl KeepEveryNth {
    pub fn new(nth: u32) -> Result<Self, FilterError> {
        if nth == 0 {
            return Err(FilterError::InvalidParameter {
                criterion: "keep_every_nth",
                message: "n must be at least 1".to_string(),
            });
        }
        Ok(Self { nth, counter: 1 })
    }
}

impl Criterion for KeepEveryNth {
    fn name(&self) -> &'static str {
        "keep_every_nth"
    }

    fn reject(&mut self, _point: &Point) -> bool {
        if self.counter == self.nth {
            self.counter = 1;
            false
        } else {
            self.counter += 1;
            true
        }
    }

    fn reset(&mut self) {
        self.counter = 1;
    }

    fn describe(&self) -> String {
        format!("{} {}", self.name(), self.nth)
    }

    criterion_boilerplate!();
}

/// Keeps a pseudo-random fraction of the points, reproducible per seed.
#[derive(Debug, Clone)]
pub struct KeepRandomFraction {
    fraction: f32,
    seed: u64,
    rng: StdRng,
}

impl KeepRandomFraction {
    pub fn new(fraction: f32, seed: u64) -> Result<Self, FilterError> {
        if !(0.0..=1.0).contains(&fraction) {
            return Err(FilterError::InvalidParameter {
                criterion: "keep_random_fraction",
                message: format!("fraction {} is outside 0..=1", fraction),
            });
        }
        Ok(Self {
            fraction,
            seed,
            rng: StdRng::seed_from_u64(seed),
        })
    }
}

impl Criterion for KeepRandomFraction {
    fn name(&self) -> &'static str {
        "keep_random_fraction"
    }

    fn reject(&mut self, _point: &Point) -> bool {
        self.rng.random::<f32>() >= self.fraction
    }

    fn reset(&mut self) {
        self.rng = StdRng::seed_from_u64(self.seed);
    }

    fn describe(&self) -> String {
        format!("{} {}", self.name(), self.fraction)
    }

    criterion_boilerplate!();
}

/// Keeps the first point that falls into each grid cell.
#[derive(Debug, Clone)]
pub struct ThinWithGrid {
    size: f64,
    cells: HashSet<(i64, i64)>,
}

impl ThinWithGrid {
    pub fn new(size: f64) -> Result<Self, FilterError> {
        if size <= 0.0 || !size.is_finite() {
            return Err(FilterError::InvalidParameter {
                criterion: "thin_with_grid",
                message: format!("grid size {} must be positive", size),
            });
        }
        Ok(Self {
            size,
            cells: HashSet::new(),
        })
    }
}

impl Criterion for ThinWithGrid {
    fn name(&self) -> &'static str {
        "thin_with_grid"
    }

    fn reject(&mut self, point: &Point) -> bool {
        let cell = (
            (point.get_x() / self.size).floor() as i64,
            (point.get_y() / self.size).floor() as i64,
        );
        !self.cells.insert(cell)
    }

    fn reset(&mut self) {
        self.cells.clear();
    }

    fn describe(&self) -> String {
        format!("{} {}", self.name(), self.size)
    }

    criterion_boilerplate!();
}

/// Keeps all returns of the first pulse seen in each GPS-time bucket.
#[derive(Debug, Clone)]
pub struct ThinPulsesWithTime {
    spacing: f64,
    buckets: HashMap<i64, f64>,
}

impl ThinPulsesWithTime {
    pub fn new(spacing: f64) -> Result<Self, FilterError> {
        if spacing <= 0.0 || !spacing.is_finite() {
            return Err(FilterError::InvalidParameter {
                criterion: "thin_pulses_with_time",
                message: format!("time spacing {} must be positive", spacing),
            });
        }
        Ok(Self {
            spacing,
            buckets: HashMap::new(),
        })
    }
}

impl Criterion for ThinPulsesWithTime {
    fn name(&self) -> &'static str {
        "thin_pulses_with_time"
    }

    fn reject(&mut self, point: &Point) -> bool {
        let time = point.attributes.gps_time.unwrap_or(0.0);
        let bucket = (time / self.spacing).floor() as i64;
        match self.buckets.entry(bucket) {
            Entry::Vacant(entry) => {
                entry.insert(time);
                false
            }
            Entry::Occupied(entry) => *entry.get() != time,
        }
    }

    fn reset(&mut self) {
        self.buckets.clear();
    }

    fn decompress_hint(&self) -> FieldMask {
        FieldMask::GPS_TIME
    }

    criterion_boilerplate!();
}

/// Keeps only points where the scan direction flips.
#[derive(Debug, Clone, Default)]
pub struct KeepScanDirectionChange {
    previous: Option<bool>,
}

impl Criterion for KeepScanDirectionChange {
    fn name(&self) -> &'static str {
        "keep_scan_direction_change"
    }

    fn reject(&mut self, point: &Point) -> bool {
        let direction = point.has_flag(PointFlags::SCAN_DIRECTION);
        match self.previous.replace(direction) {
            Some(previous) => previous == direction,
            None => true,
        }
    }

    fn reset(&mut self) {
        self.previous = None;
    }

    fn decompress_hint(&self) -> FieldMask {
        FieldMask::FLAGS
    }

    criterion_boilerplate!();
}

#[cfg(test)]
mod tests {
    use pcd_core::pointcloud::header::AttributeDescriptor;
    use pcd_core::pointcloud::quantize::Quantizer;

    use super::*;

    fn make_point(x: f64, y: f64, z: f64) -> Point {
        let mut point = Point::new(Quantizer::default());
        point.set_coordinates([x, y, z]);
        point
    }

    #[test]
    fn byte_set_covers_all_values() {
        let set = ByteSet::from_values(&[0, 63, 64, 255]);
        assert!(set.contains(0));
        assert!(set.contains(63));
        assert!(set.contains(64));
        assert!(set.contains(255));
        assert!(!set.contains(128));
        assert_eq!(set.values().collect::<Vec<_>>(), vec![0, 63, 64, 255]);
    }

    #[test]
    fn keep_point_sources_is_a_set_membership() {
        let mut criterion = KeepPointSources::new(&[3]);
        assert!(criterion.merge(&KeepPointSources::new(&[5])));

        let mut point = make_point(0.0, 0.0, 0.0);
        for (id, rejected) in [(3, false), (5, false), (4, true)] {
            point.attributes.point_source_id = id;
            assert_eq!(criterion.reject(&point), rejected, "{id}");
        }
        assert_eq!(criterion.describe(), "keep_point_source 3 5");
    }

    #[test]
    fn keep_returns_merge() {
        let mut criterion = KeepReturns::new(&[1]);
        assert!(criterion.merge(&KeepReturns::new(&[3])));
        assert!(!criterion.merge(&KeepFirstReturn));

        let mut point = make_point(0.0, 0.0, 0.0);
        point.attributes.return_number = 3;
        assert!(!criterion.reject(&point));
        point.attributes.return_number = 2;
        assert!(criterion.reject(&point));
    }

    #[test]
    fn drop_classification_merges_its_own_kind_only() {
        let mut drop = DropClassifications::new(&[7]);
        assert!(drop.merge(&DropClassifications::new(&[18])));
        assert!(!drop.merge(&KeepClassifications::new(&[2])));

        let mut point = make_point(0.0, 0.0, 0.0);
        point.attributes.classification = 18;
        assert!(drop.reject(&point));
        point.attributes.classification = 2;
        assert!(!drop.reject(&point));
    }

    #[test]
    fn z_ranges_are_half_open() {
        let mut keep = KeepZ::new(0.0, 10.0);
        assert!(!keep.reject(&make_point(0.0, 0.0, 0.0)));
        assert!(keep.reject(&make_point(0.0, 0.0, 10.0)));

        let mut drop = DropZ::new(0.0, 10.0);
        assert!(drop.reject(&make_point(0.0, 0.0, 5.0)));
        assert!(!drop.reject(&make_point(0.0, 0.0, -5.0)));

        assert!(!KeepZ::below(3.0).reject(&make_point(0.0, 0.0, -100.0)));
        assert!(KeepZ::above(3.0).reject(&make_point(0.0, 0.0, 2.0)));
    }

    #[test]
    fn xyz_boxes() {
        let mut keep = KeepXYZ::new([0.0; 3], [1.0; 3]);
        let mut drop = DropXYZ::new([0.0; 3], [1.0; 3]);
        let inside = make_point(0.5, 0.5, 0.5);
        let outside = make_point(0.5, 0.5, 1.5);
        assert!(!keep.reject(&inside));
        assert!(keep.reject(&outside));
        assert!(drop.reject(&inside));
        assert!(!drop.reject(&outside));
    }

    #[test]
    fn flags_and_returns() {
        let mut point = make_point(0.0, 0.0, 0.0);
        point.attributes.return_number = 1;
        point.attributes.number_of_returns = 1;
        assert!(DropSingleReturns.reject(&point));
        assert!(!KeepFirstReturn.reject(&point));
        assert!(!KeepLastReturn.reject(&point));

        assert!(!DropFlagged::withheld().reject(&point));
        point.set_flag(PointFlags::WITHHELD, true);
        assert!(DropFlagged::withheld().reject(&point));
        assert!(!DropFlagged::overlap().reject(&point));
    }

    #[test]
    fn gps_time_range_drops_points_without_time() {
        let mut criterion = KeepGpsTimeRange::new(10.0, 20.0);
        let mut point = make_point(0.0, 0.0, 0.0);
        assert!(criterion.reject(&point));
        point.attributes.gps_time = Some(15.0);
        assert!(!criterion.reject(&point));
        point.attributes.gps_time = Some(20.0);
        assert!(criterion.reject(&point));
    }

    #[test]
    fn attribute_range_validates_index() {
        let criterion = KeepAttributeRange::new(1, 0.0, 1.0);
        let mut header = Header::default();
        header.add_attribute(AttributeDescriptor::new("height", 9));
        assert!(matches!(
            criterion.validate(&header),
            Err(FilterError::AttributeOutOfRange { index: 1, available: 1, .. })
        ));
        header.add_attribute(AttributeDescriptor::new("echo", 1));
        assert!(criterion.validate(&header).is_ok());

        let mut criterion = criterion;
        let mut point = make_point(0.0, 0.0, 0.0);
        assert!(criterion.reject(&point));
        point.attributes.extra = vec![5.0, 0.5];
        assert!(!criterion.reject(&point));
    }

    #[test]
    fn every_nth_keeps_multiples() {
        let mut criterion = KeepEveryNth::new(3).unwrap();
        let point = make_point(0.0, 0.0, 0.0);
        let kept: Vec<usize> = (1..=9).filter(|_| !criterion.reject(&point)).collect();
        assert_eq!(kept, vec![3, 6, 9]);
        assert!(KeepEveryNth::new(0).is_err());
    }

    #[test]
    fn random_fraction_repeats_after_reset() {
        let mut criterion = KeepRandomFraction::new(0.5, 42).unwrap();
        let point = make_point(0.0, 0.0, 0.0);
        let first: Vec<bool> = (0..64).map(|_| criterion.reject(&point)).collect();
        criterion.reset();
        let second: Vec<bool> = (0..64).map(|_| criterion.reject(&point)).collect();
        assert_eq!(first, second);
        assert!(first.iter().any(|&r| r));
        assert!(first.iter().any(|&r| !r));

        let mut all = KeepRandomFraction::new(1.0, 7).unwrap();
        assert!((0..100).all(|_| !all.reject(&point)));
        assert!(KeepRandomFraction::new(1.5, 0).is_err());
    }

    #[test]
    fn grid_thinning_keeps_one_point_per_cell() {
        let mut criterion = ThinWithGrid::new(1.0).unwrap();
        assert!(!criterion.reject(&make_point(0.2, 0.2, 0.0)));
        assert!(criterion.reject(&make_point(0.8, 0.9, 0.0)));
        assert!(!criterion.reject(&make_point(1.2, 0.2, 0.0)));
        criterion.reset();
        assert!(!criterion.reject(&make_point(0.8, 0.9, 0.0)));
        assert!(ThinWithGrid::new(0.0).is_err());
    }

    #[test]
    fn pulse_thinning_keeps_all_returns_of_first_pulse() {
        let mut criterion = ThinPulsesWithTime::new(1.0).unwrap();
        let mut point = make_point(0.0, 0.0, 0.0);
        let mut decisions = Vec::new();
        for time in [0.25, 0.25, 0.5, 1.5, 1.5, 1.75] {
            point.attributes.gps_time = Some(time);
            decisions.push(criterion.reject(&point));
        }
        assert_eq!(decisions, vec![false, false, true, false, false, true]);
    }

    #[test]
    fn scan_direction_change_tracks_previous_flag() {
        let mut criterion = KeepScanDirectionChange::default();
        let mut point = make_point(0.0, 0.0, 0.0);
        let mut decisions = Vec::new();
        for direction in [false, false, true, true, false] {
            point.set_flag(PointFlags::SCAN_DIRECTION, direction);
            decisions.push(criterion.reject(&point));
        }
        assert_eq!(decisions, vec![true, true, false, true, false]);

        criterion.reset();
        assert!(criterion.reject(&point));
    }
}
