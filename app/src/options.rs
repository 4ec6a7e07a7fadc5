use clap::Args;
use pcd_transformer::{
    filter::criteria::*,
    transform::operations::*,
    FilterChain, FilterError, TransformError, TransformPipeline,
};

/// Criteria selectable on the command line. They are added to the chain in the
/// order the fields are declared.
#[derive(Args, Debug, Default, Clone)]
pub struct FilterArgs {
    #[arg(long, num_args = 1.., value_name = "CLASS")]
    pub keep_class: Vec<u8>,

    #[arg(long, num_args = 1.., value_name = "CLASS")]
    pub drop_class: Vec<u8>,

    #[arg(long, num_args = 1.., value_name = "RETURN")]
    pub keep_return: Vec<u8>,

    #[arg(long)]
    pub keep_first: bool,

    #[arg(long)]
    pub keep_last: bool,

    #[arg(long)]
    pub drop_single: bool,

    #[arg(long, num_args = 1.., value_name = "ID")]
    pub keep_point_source: Vec<u16>,

    #[arg(long, num_args = 1.., value_name = "VALUE")]
    pub keep_user_data: Vec<u8>,

    #[arg(long, num_args = 1.., value_name = "CHANNEL")]
    pub keep_scanner_channel: Vec<u8>,

    #[arg(long, num_args = 4, value_names = ["MIN_X", "MIN_Y", "MAX_X", "MAX_Y"], allow_negative_numbers = true)]
    pub keep_xy: Option<Vec<f64>>,

    #[arg(long, num_args = 2, value_names = ["MIN", "MAX"], allow_negative_numbers = true)]
    pub keep_z: Option<Vec<f64>>,

    #[arg(long, num_args = 2, value_names = ["MIN", "MAX"], allow_negative_numbers = true)]
    pub drop_z: Option<Vec<f64>>,

    #[arg(long, num_args = 2, value_names = ["MIN", "MAX"])]
    pub keep_intensity: Option<Vec<u16>>,

    #[arg(long, num_args = 2, value_names = ["MIN", "MAX"], allow_negative_numbers = true)]
    pub keep_scan_angle: Option<Vec<f32>>,

    #[arg(long, num_args = 2, value_names = ["MIN", "MAX"], allow_negative_numbers = true)]
    pub keep_gps_time: Option<Vec<f64>>,

    #[arg(long, num_args = 3, value_names = ["INDEX", "MIN", "MAX"], allow_negative_numbers = true)]
    pub keep_attribute: Option<Vec<f64>>,

    #[arg(long)]
    pub drop_withheld: bool,

    #[arg(long)]
    pub drop_synthetic: bool,

    #[arg(long)]
    pub drop_keypoint: bool,

    #[arg(long)]
    pub drop_overlap: bool,

    #[arg(long, value_name = "N")]
    pub keep_every_nth: Option<u32>,

    #[arg(long, value_name = "FRACTION")]
    pub keep_random_fraction: Option<f32>,

    #[arg(long, value_name = "SIZE")]
    pub thin_with_grid: Option<f64>,

    #[arg(long, value_name = "SECONDS")]
    pub thin_pulses_with_time: Option<f64>,

    #[arg(long)]
    pub keep_scan_direction_change: bool,

    /// Seed for randomized criteria and operations.
    #[arg(long, default_value_t = 0)]
    pub seed: u64,
}

fn pair<T: Copy>(values: &[T]) -> (T, T) {
    (values[0], values[1])
}

impl FilterArgs {
    pub fn to_chain(&self) -> Result<Option<FilterChain>, FilterError> {
        let mut chain = FilterChain::new();

        if !self.keep_class.is_empty() {
            chain.add(KeepClassifications::new(&self.keep_class));
        }
        if !self.drop_class.is_empty() {
            chain.add(DropClassifications::new(&self.drop_class));
        }
        if !self.keep_return.is_empty() {
            chain.add(KeepReturns::new(&self.keep_return));
        }
        if self.keep_first {
            chain.add(KeepFirstReturn);
        }
        if self.keep_last {
            chain.add(KeepLastReturn);
        }
        if self.drop_single {
            chain.add(DropSingleReturns);
        }
        if !self.keep_point_source.is_empty() {
            chain.add(KeepPointSources::new(&self.keep_point_source));
        }
        if !self.keep_user_data.is_empty() {
            chain.add(KeepUserData::new(&self.keep_user_data));
        }
        if !self.keep_scanner_channel.is_empty() {
            chain.add(KeepScannerChannels::new(&self.keep_scanner_channel));
        }
        if let Some(v) = &self.keep_xy {
            chain.add(KeepXY::new(v[0], v[1], v[2], v[3]));
        }
        if let Some(v) = &self.keep_z {
            let (min, max) = pair(v);
            chain.add(KeepZ::new(min, max));
        }
        if let Some(v) = &self.drop_z {
            let (min, max) = pair(v);
            chain.add(DropZ::new(min, max));
        }
        if let Some(v) = &self.keep_intensity {
            let (min, max) = pair(v);
            chain.add(KeepIntensityRange::new(min, max));
        }
        if let Some(v) = &self.keep_scan_angle {
            let (min, max) = pair(v);
            chain.add(KeepScanAngleRange::new(min, max));
        }
        if let Some(v) = &self.keep_gps_time {
            let (min, max) = pair(v);
            chain.add(KeepGpsTimeRange::new(min, max));
        }
        if let Some(v) = &self.keep_attribute {
            if v[0] < 0.0 || v[0].fract() != 0.0 {
                return Err(FilterError::InvalidParameter {
                    criterion: "keep_attribute",
                    message: format!("{} is not an attribute index", v[0]),
                });
            }
            chain.add(KeepAttributeRange::new(v[0] as usize, v[1], v[2]));
        }
        if self.drop_withheld {
            chain.add(DropFlagged::withheld());
        }
        if self.drop_synthetic {
            chain.add(DropFlagged::synthetic());
        }
        if self.drop_keypoint {
            chain.add(DropFlagged::keypoint());
        }
        if self.drop_overlap {
            chain.add(DropFlagged::overlap());
        }
        if let Some(n) = self.keep_every_nth {
            chain.add(KeepEveryNth::new(n)?);
        }
        if let Some(fraction) = self.keep_random_fraction {
            chain.add(KeepRandomFraction::new(fraction, self.seed)?);
        }
        if let Some(size) = self.thin_with_grid {
            chain.add(ThinWithGrid::new(size)?);
        }
        if let Some(spacing) = self.thin_pulses_with_time {
            chain.add(ThinPulsesWithTime::new(spacing)?);
        }
        if self.keep_scan_direction_change {
            chain.add(KeepScanDirectionChange::default());
        }

        Ok((!chain.is_empty()).then_some(chain))
    }
}

/// Operations selectable on the command line, applied in declaration order.
#[derive(Args, Debug, Default, Clone)]
pub struct TransformArgs {
    #[arg(long, num_args = 3, value_names = ["DX", "DY", "DZ"], allow_negative_numbers = true)]
    pub translate_xyz: Option<Vec<f64>>,

    #[arg(long, num_args = 3, value_names = ["SX", "SY", "SZ"], allow_negative_numbers = true)]
    pub scale_xyz: Option<Vec<f64>>,

    #[arg(long, num_args = 3, value_names = ["ANGLE", "X", "Y"], allow_negative_numbers = true)]
    pub rotate_xy: Option<Vec<f64>>,

    #[arg(long, num_args = 2, value_names = ["MIN", "MAX"], allow_negative_numbers = true)]
    pub clamp_z: Option<Vec<f64>>,

    #[arg(long, num_args = 2, value_names = ["MAX_X", "MAX_Y"])]
    pub translate_raw_xy_at_random: Option<Vec<i32>>,

    #[arg(long, value_name = "CLASS")]
    pub set_classification: Option<u8>,

    #[arg(long, num_args = 2, value_names = ["FROM", "TO"])]
    pub change_classification_from_to: Option<Vec<u8>>,

    #[arg(long, value_name = "ID")]
    pub set_point_source: Option<u16>,

    #[arg(long, value_name = "SECONDS")]
    pub bin_gps_time_into_point_source: Option<f64>,

    #[arg(long, value_name = "VALUE")]
    pub set_user_data: Option<u8>,

    #[arg(long, value_name = "FACTOR")]
    pub scale_intensity: Option<f32>,

    #[arg(long)]
    pub repair_zero_returns: bool,

    #[arg(long)]
    pub set_withheld: bool,

    #[arg(long)]
    pub scale_rgb_down: bool,

    #[arg(long)]
    pub scale_rgb_up: bool,
}

impl TransformArgs {
    pub fn to_pipeline(&self, seed: u64) -> Result<Option<TransformPipeline>, TransformError> {
        let mut pipeline = TransformPipeline::new();

        if let Some(v) = &self.translate_xyz {
            pipeline.add(TranslateXYZ::new(v[0], v[1], v[2]));
        }
        if let Some(v) = &self.scale_xyz {
            pipeline.add(ScaleXYZ::new(v[0], v[1], v[2]));
        }
        if let Some(v) = &self.rotate_xy {
            pipeline.add(RotateXY::new(v[0], v[1], v[2]));
        }
        if let Some(v) = &self.clamp_z {
            let (min, max) = pair(v);
            pipeline.add(ClampZ::new(min, max));
        }
        if let Some(v) = &self.translate_raw_xy_at_random {
            let (max_x, max_y) = pair(v);
            pipeline.add(TranslateRawXYAtRandom::new(max_x, max_y, seed));
        }
        if let Some(class) = self.set_classification {
            pipeline.add(SetClassification::new(class));
        }
        if let Some(v) = &self.change_classification_from_to {
            let (from, to) = pair(v);
            pipeline.add(ChangeClassificationFromTo::new(from, to));
        }
        if let Some(id) = self.set_point_source {
            pipeline.set_point_source(id);
        }
        if let Some(bin) = self.bin_gps_time_into_point_source {
            pipeline.add(BinGpsTimeIntoPointSource::new(bin)?);
        }
        if let Some(value) = self.set_user_data {
            pipeline.add(SetUserData::new(value));
        }
        if let Some(factor) = self.scale_intensity {
            pipeline.add(ScaleIntensity::new(factor));
        }
        if self.repair_zero_returns {
            pipeline.add(RepairZeroReturns);
        }
        if self.set_withheld {
            pipeline.add(SetFlag::withheld(true));
        }
        if self.scale_rgb_down {
            pipeline.add(ScaleRgb::new(RgbScale::Down));
        }
        if self.scale_rgb_up {
            pipeline.add(ScaleRgb::new(RgbScale::Up));
        }

        Ok((!pipeline.is_empty()).then_some(pipeline))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_arguments_build_nothing() {
        assert!(FilterArgs::default().to_chain().unwrap().is_none());
        assert!(TransformArgs::default().to_pipeline(0).unwrap().is_none());
    }

    #[test]
    fn criteria_follow_declaration_order() {
        let args = FilterArgs {
            keep_class: vec![2, 6],
            keep_first: true,
            keep_z: Some(vec![0.0, 100.0]),
            keep_every_nth: Some(3),
            ..Default::default()
        };
        let chain = args.to_chain().unwrap().unwrap();
        let names: Vec<String> = chain.counters().into_iter().map(|(name, _)| name).collect();
        assert_eq!(names.len(), 4);
        assert_eq!(names[0], "keep_classification 2 6");
        assert!(names[3].starts_with("keep_every_nth"));
    }

    #[test]
    fn invalid_parameters_are_reported() {
        let args = FilterArgs {
            keep_every_nth: Some(0),
            ..Default::default()
        };
        assert!(args.to_chain().is_err());

        let args = FilterArgs {
            keep_attribute: Some(vec![1.5, 0.0, 1.0]),
            ..Default::default()
        };
        assert!(args.to_chain().is_err());

        let args = TransformArgs {
            bin_gps_time_into_point_source: Some(0.0),
            ..Default::default()
        };
        assert!(args.to_pipeline(0).is_err());
    }

    #[test]
    fn operations_follow_declaration_order() {
        let args = TransformArgs {
            translate_xyz: Some(vec![1.0, 2.0, 3.0]),
            set_classification: Some(2),
            set_point_source: Some(9),
            ..Default::default()
        };
        let pipeline = args.to_pipeline(0).unwrap().unwrap();
        assert_eq!(
            pipeline.names(),
            vec!["translate_xyz", "set_classification", "set_point_source"]
        );
    }
}
