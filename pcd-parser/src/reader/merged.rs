use std::path::PathBuf;

use pcd_core::pointcloud::{
    field_mask::FieldMask,
    header::{BoundingVolume, Header},
    point::Point,
    quantize::{fits_storage, Quantizer},
};
use rayon::prelude::*;

use super::{PointReader, RescaleReoffset, SharedFilter, SharedTransform, SingleReader};
use crate::{
    decoder::{read_header, DecoderOptions},
    error::ReaderError,
    region::{QueryRegion, RegionState},
};

const AXIS_NAMES: [&str; 3] = ["x", "y", "z"];

/// Per-file settings shared by every member of a merge.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeSettings {
    pub options: DecoderOptions,
    pub rescale: RescaleReoffset,
    /// Stamp points of file `i` with point source `start + i`.
    pub flightline_start: Option<u16>,
    /// Stamp points with the file source ID of their file.
    pub apply_file_source_id: bool,
    pub use_index: bool,
    pub selective: Option<FieldMask>,
}

/// Coarsens scale and recenters offset, per axis, until `bounds` fits into i32 storage.
pub fn fit_storage(quantizer: Quantizer, bounds: &BoundingVolume) -> Quantizer {
    if bounds.is_empty() {
        return quantizer;
    }
    let mut fitted = quantizer;
    for axis in 0..3 {
        let fits = |scale: f64, offset: f64| {
            fits_storage(bounds.min[axis], scale, offset)
                && fits_storage(bounds.max[axis], scale, offset)
        };
        let (scale, offset) = (quantizer.scale[axis], quantizer.offset[axis]);
        if fits(scale, offset) {
            continue;
        }

        let centered = ((bounds.min[axis] + bounds.max[axis]) / 2.0).round();
        let mut coarser = scale;
        while !fits(coarser, centered) {
            coarser *= 10.0;
        }
        if coarser != scale {
            log::warn!(
                "changed {} scale from {} to {} to accommodate the merged bounding box",
                AXIS_NAMES[axis],
                scale,
                coarser
            );
            fitted.scale[axis] = coarser;
        }
        if !fits(coarser, offset) {
            log::warn!(
                "changed {} offset from {} to {} to accommodate the merged bounding box",
                AXIS_NAMES[axis],
                offset,
                centered
            );
            fitted.offset[axis] = centered;
        }
    }
    fitted
}

/// Concatenates several files into one stream with a common quantization.
pub struct MergedReader {
    files: Vec<PathBuf>,
    file_headers: Vec<Header>,
    header: Header,
    settings: MergeSettings,
    current: Option<SingleReader>,
    next_file: usize,
    region: RegionState,
    filter: Option<SharedFilter>,
    transform: Option<SharedTransform>,
    point: Point,
    points_read: u64,
    exhausted: bool,
    closed: bool,
}

impl MergedReader {
    /// Reads every header (in parallel) and builds the union header. No point
    /// data is touched until the first `read_next`.
    pub fn open(files: Vec<PathBuf>, settings: MergeSettings) -> Result<Self, ReaderError> {
        let file_headers = files
            .par_iter()
            .map(|path| read_header(path, &settings.options))
            .collect::<Result<Vec<_>, _>>()?;

        let mut header = file_headers.first().cloned().unwrap_or_default();
        header.reset_statistics();
        header.file_source_id = 0;
        for (path, file_header) in files.iter().zip(&file_headers) {
            if file_header.point_format != header.point_format {
                log::warn!(
                    "{:?} has point format {} but the merge uses {}",
                    path,
                    file_header.point_format,
                    header.point_format
                );
            }
            if file_header.attributes != header.attributes {
                log::warn!("{:?} has different extra attributes than the first file", path);
            }
            if file_header.quantizer.scale != header.quantizer.scale {
                log::debug!(
                    "{:?} has scale {:?}, the merge uses {:?}",
                    path,
                    file_header.quantizer.scale,
                    header.quantizer.scale
                );
            }
            header.accumulate(file_header);
        }

        let requested = settings.rescale.resolve(&header);
        header.quantizer = fit_storage(requested, &header.bounds);
        header.snap_bounds();

        log::info!(
            "merging {} files with {} points",
            files.len(),
            header.point_count
        );

        let point = Point::new(header.quantizer);
        Ok(Self {
            files,
            file_headers,
            header,
            settings,
            current: None,
            next_file: 0,
            region: RegionState::default(),
            filter: None,
            transform: None,
            point,
            points_read: 0,
            exhausted: false,
            closed: false,
        })
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Index of the file the current point came from.
    pub fn current_file(&self) -> Option<usize> {
        self.current.as_ref().map(|_| self.next_file - 1)
    }

    fn open_file(&mut self, file_index: usize) -> Result<SingleReader, ReaderError> {
        let mut reader = SingleReader::open(&self.files[file_index], &self.settings.options)?;
        reader.rescale(&RescaleReoffset::fixed(self.header.quantizer));
        reader.set_decompress_selective(self.settings.selective);
        if self.region.is_active() {
            reader.set_region(*self.region.region());
        }
        if self.settings.use_index {
            reader.set_index(true)?;
        }

        let point_source = match self.settings.flightline_start {
            Some(start) => Some(start.wrapping_add(file_index as u16)),
            None if self.settings.apply_file_source_id => {
                Some(self.file_headers[file_index].file_source_id)
            }
            None => None,
        };
        if let (Some(point_source), Some(transform)) = (point_source, &self.transform) {
            transform.borrow_mut().set_point_source(point_source);
        }

        reader.set_filter(self.filter.clone());
        reader.set_transform(self.transform.clone());
        Ok(reader)
    }

    /// Opens the next file that can contain points of the region.
    fn advance(&mut self) -> bool {
        while self.next_file < self.files.len() {
            let file_index = self.next_file;
            self.next_file += 1;

            let bounds = &self.file_headers[file_index].bounds;
            if !self.region.region().intersects(bounds) {
                log::debug!("skipping {:?}, outside of the region", self.files[file_index]);
                continue;
            }
            match self.open_file(file_index) {
                Ok(reader) => {
                    self.current = Some(reader);
                    return true;
                }
                Err(error) => {
                    log::warn!(
                        "stopping the merge at {:?}: {}",
                        self.files[file_index],
                        error
                    );
                    self.header.point_count = self.file_headers[..file_index]
                        .iter()
                        .map(|h| h.point_count)
                        .sum();
                    self.exhausted = true;
                    return false;
                }
            }
        }
        false
    }

    fn forward<F: FnOnce(&mut SingleReader)>(&mut self, f: F) {
        if let Some(reader) = self.current.as_mut() {
            f(reader);
        }
    }
}

impl PointReader for MergedReader {
    fn header(&self) -> &Header {
        &self.header
    }

    fn point(&self) -> &Point {
        &self.point
    }

    fn read_next(&mut self) -> bool {
        if self.closed || self.exhausted || !self.region.intersects() {
            return false;
        }
        loop {
            if self.current.is_none() && !self.advance() {
                self.exhausted = true;
                return false;
            }
            let Some(reader) = self.current.as_mut() else {
                return false;
            };
            if reader.read_next() {
                self.point.clone_from(reader.point());
                self.points_read += 1;
                return true;
            }
            self.current = None;
        }
    }

    /// Seeks by record index across the concatenation of all files.
    fn seek(&mut self, index: u64) -> Result<(), ReaderError> {
        if self.closed {
            return Err(ReaderError::Closed);
        }
        let mut start = 0;
        for (file_index, file_header) in self.file_headers.iter().enumerate() {
            let end = start + file_header.point_count;
            if index < end || file_index + 1 == self.file_headers.len() {
                if index > end {
                    break;
                }
                let mut reader = self.open_file(file_index)?;
                reader.seek(index - start)?;
                self.current = Some(reader);
                self.next_file = file_index + 1;
                self.exhausted = false;
                return Ok(());
            }
            start = end;
        }
        Err(ReaderError::SeekOutOfRange {
            index,
            count: self.header.point_count,
        })
    }

    fn reopen(&mut self) -> Result<(), ReaderError> {
        if self.closed {
            return Err(ReaderError::Closed);
        }
        self.current = None;
        self.next_file = 0;
        self.points_read = 0;
        self.exhausted = false;
        if let Some(filter) = &self.filter {
            filter.borrow_mut().reset();
        }
        if let Some(transform) = &self.transform {
            transform.borrow_mut().reset();
        }
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut reader) = self.current.take() {
            reader.close();
        }
        self.closed = true;
    }

    fn set_region(&mut self, region: QueryRegion) -> bool {
        let intersects = self.region.install(region, &mut self.header);
        self.forward(|reader| {
            reader.set_region(region);
        });
        intersects
    }

    fn clear_region(&mut self) {
        self.region.clear(&mut self.header);
        self.forward(|reader| reader.clear_region());
    }

    fn region(&self) -> QueryRegion {
        *self.region.region()
    }

    fn set_filter(&mut self, filter: Option<SharedFilter>) {
        self.filter = filter.clone();
        self.forward(|reader| reader.set_filter(filter));
    }

    fn set_transform(&mut self, transform: Option<SharedTransform>) {
        self.transform = transform.clone();
        self.forward(|reader| reader.set_transform(transform));
    }

    fn set_index(&mut self, enabled: bool) -> Result<bool, ReaderError> {
        self.settings.use_index = enabled;
        match self.current.as_mut() {
            Some(reader) => reader.set_index(enabled),
            None => Ok(enabled),
        }
    }

    fn points_read(&self) -> u64 {
        self.points_read
    }
}

impl Drop for MergedReader {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, fs, rc::Rc};

    use approx::assert_relative_eq;
    use pcd_transformer::TransformPipeline;

    use super::*;
    use crate::test_utils::{grid_points, write_points, write_text};

    fn two_tiles(dir: &std::path::Path) -> Vec<PathBuf> {
        vec![
            write_points(dir, "a.csv", &grid_points((1000.0, 1000.0), 3, 1.0)),
            write_points(dir, "b.csv", &grid_points((2000.0, 1000.0), 2, 1.0)),
        ]
    }

    #[test]
    fn union_header_and_concatenation() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = MergedReader::open(two_tiles(dir.path()), MergeSettings::default()).unwrap();
        assert_eq!(reader.header().point_count, 13);
        assert_eq!(reader.header().file_source_id, 0);
        assert_relative_eq!(reader.header().bounds.min[0], 1000.0, epsilon = 1e-9);
        assert_relative_eq!(reader.header().bounds.max[0], 2001.0, epsilon = 1e-9);

        let mut count = 0;
        while reader.read_next() {
            count += 1;
        }
        assert_eq!(count, 13);
        assert_eq!(reader.points_read(), 13);
    }

    #[test]
    fn flightlines_are_numbered_from_start() {
        let dir = tempfile::tempdir().unwrap();
        let settings = MergeSettings {
            flightline_start: Some(7),
            ..Default::default()
        };
        let mut reader = MergedReader::open(two_tiles(dir.path()), settings).unwrap();
        reader.set_transform(Some(Rc::new(RefCell::new(TransformPipeline::new()))));

        let mut sources = Vec::new();
        while reader.read_next() {
            sources.push(reader.point().attributes.point_source_id);
        }
        assert_eq!(&sources[..9], &[7; 9]);
        assert_eq!(&sources[9..], &[8; 4]);
    }

    #[test]
    fn files_outside_the_region_are_never_opened() {
        let dir = tempfile::tempdir().unwrap();
        let files = two_tiles(dir.path());
        let mut reader = MergedReader::open(files.clone(), MergeSettings::default()).unwrap();
        fs::remove_file(&files[0]).unwrap();

        assert!(reader.set_region(QueryRegion::Rectangle {
            min_x: 1999.0,
            min_y: 999.0,
            max_x: 2100.0,
            max_y: 1100.0,
        }));
        let mut count = 0;
        while reader.read_next() {
            count += 1;
        }
        assert_eq!(count, 4);
    }

    #[test]
    fn seek_crosses_file_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = MergedReader::open(two_tiles(dir.path()), MergeSettings::default()).unwrap();
        reader.seek(10).unwrap();
        assert!(reader.read_next());
        assert_relative_eq!(reader.point().get_x(), 2001.0, epsilon = 1e-9);
        assert_eq!(reader.current_file(), Some(1));
        assert!(reader.seek(14).is_err());

        reader.reopen().unwrap();
        assert!(reader.read_next());
        assert_relative_eq!(reader.point().get_x(), 1000.0, epsilon = 1e-9);
    }

    #[test]
    fn indexed_members_match_a_scan_after_rescaling() {
        let dir = tempfile::tempdir().unwrap();
        let files: Vec<PathBuf> = [("a.csv", 0), ("b.csv", 4)]
            .into_iter()
            .map(|(name, y)| {
                let mut contents = format!("x,y,z\n0.0,{y},0\n");
                for i in 0..=30 {
                    contents.push_str(&format!("{i}.6,{y},0\n"));
                }
                write_text(dir.path(), name, &contents)
            })
            .collect();
        let region = QueryRegion::Tile {
            ll_x: 10.0,
            ll_y: 0.0,
            size: 10.0,
        };
        let run = |use_index: bool| {
            let settings = MergeSettings {
                rescale: RescaleReoffset {
                    scale: [Some(1.0); 3],
                    ..Default::default()
                },
                use_index,
                ..Default::default()
            };
            let mut reader = MergedReader::open(files.clone(), settings).unwrap();
            reader.set_region(region);
            let mut points = Vec::new();
            while reader.read_next() {
                points.push((reader.point().get_x(), reader.point().get_y()));
            }
            points
        };

        let scanned = run(false);
        assert_eq!(scanned.len(), 20);
        assert_eq!(scanned[0], (10.0, 0.0));
        assert_eq!(run(true), scanned);
    }

    #[test]
    fn enlarged_box_coarsens_scale() {
        let quantizer = Quantizer::new([0.01; 3], [0.0; 3]);
        let bounds = BoundingVolume {
            min: [0.0, 0.0, 0.0],
            max: [50_000_000.0, 10.0, 10.0],
        };
        let fitted = fit_storage(quantizer, &bounds);
        assert_relative_eq!(fitted.scale[0], 0.1);
        // The coarser scale alone is enough, so the offset stays.
        assert_eq!(fitted.offset[0], 0.0);
        assert_eq!(fitted.scale[1], 0.01);
        assert!(!fitted.overflows(&bounds));

        let recentered = fit_storage(
            quantizer,
            &BoundingVolume {
                min: [30_000_000.0, 0.0, 0.0],
                max: [30_000_001.0, 1.0, 1.0],
            },
        );
        assert_eq!(recentered.scale[0], 0.01);
        assert_eq!(recentered.offset[0], 30_000_001.0);
    }
}
