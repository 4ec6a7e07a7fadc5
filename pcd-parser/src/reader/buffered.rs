use std::{
    fs,
    path::{Path, PathBuf},
};

use pcd_core::pointcloud::{header::Header, point::Point};

use super::{
    merged::{MergeSettings, MergedReader},
    PointReader, SharedFilter, SharedTransform, SingleReader,
};
use crate::{
    error::ReaderError,
    region::{QueryRegion, RegionState},
};

/// Where the buffer points live between collection and replay.
#[derive(Debug)]
enum BufferStore {
    Memory(Vec<Point>),
    Spilled { path: PathBuf, count: usize },
}

impl BufferStore {
    fn len(&self) -> usize {
        match self {
            BufferStore::Memory(points) => points.len(),
            BufferStore::Spilled { count, .. } => *count,
        }
    }

    fn spill(points: Vec<Point>, path: PathBuf) -> Result<Self, ReaderError> {
        let count = points.len();
        fs::write(&path, bitcode::serialize(&points)?)?;
        log::debug!("spilled {} buffer points to {:?}", count, path);
        Ok(BufferStore::Spilled { path, count })
    }

    fn load(&self) -> Result<Vec<Point>, ReaderError> {
        match self {
            BufferStore::Memory(points) => Ok(points.clone()),
            BufferStore::Spilled { path, .. } => Ok(bitcode::deserialize(&fs::read(path)?)?),
        }
    }

    fn discard(&mut self) {
        if let BufferStore::Spilled { path, .. } = self {
            if let Err(error) = fs::remove_file(&*path) {
                log::debug!("could not remove {:?}: {}", path, error);
            }
        }
        *self = BufferStore::Memory(Vec::new());
    }
}

/// Reads one file followed by the points of its neighbors that fall within
/// `buffer_size` of its bounding box.
pub struct BufferedReader {
    main: SingleReader,
    neighbors: Option<MergedReader>,
    buffer_size: f64,
    spill_path: Option<PathBuf>,
    /// Header of the main file without buffer and region.
    base: Header,
    /// Counts and box of the buffer points alone.
    buffer_stats: Header,
    header: Header,
    region: RegionState,
    filter: Option<SharedFilter>,
    transform: Option<SharedTransform>,
    store: BufferStore,
    replay: Option<Vec<Point>>,
    cursor: usize,
    point: Point,
    in_buffer: bool,
    points_read: u64,
    closed: bool,
}

pub(crate) fn spill_path(base: &Path, main: &Path) -> PathBuf {
    let stem = main
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("points");
    PathBuf::from(format!("{}_{}_buffer.bin", base.display(), stem))
}

impl BufferedReader {
    pub fn open(
        main: &Path,
        neighbors: &[PathBuf],
        buffer_size: f64,
        settings: MergeSettings,
        temp_files: Option<&Path>,
    ) -> Result<Self, ReaderError> {
        let mut reader = SingleReader::open(main, &settings.options)?;
        reader.rescale(&settings.rescale);
        reader.set_decompress_selective(settings.selective);
        let base = reader.header().clone();

        let neighbor_files: Vec<PathBuf> = neighbors
            .iter()
            .filter(|path| path.as_path() != main)
            .cloned()
            .collect();
        let neighbors = if neighbor_files.is_empty() {
            None
        } else {
            let neighbor_settings = MergeSettings {
                rescale: super::RescaleReoffset::fixed(base.quantizer),
                flightline_start: None,
                apply_file_source_id: false,
                ..settings
            };
            let mut merged = MergedReader::open(neighbor_files, neighbor_settings)?;
            if merged.header().point_format != base.point_format {
                log::warn!(
                    "neighbors have point format {} but {:?} has {}",
                    merged.header().point_format,
                    main,
                    base.point_format
                );
            }
            let grown = base.bounds.grown_xy(buffer_size);
            merged.set_region(QueryRegion::Rectangle {
                min_x: grown.min[0],
                min_y: grown.min[1],
                max_x: grown.max[0],
                max_y: grown.max[1],
            });
            Some(merged)
        };

        let mut buffered = Self {
            main: reader,
            neighbors,
            buffer_size,
            spill_path: temp_files.map(|base| spill_path(base, main)),
            header: base.clone(),
            base,
            buffer_stats: Header::default(),
            region: RegionState::default(),
            filter: None,
            transform: None,
            store: BufferStore::Memory(Vec::new()),
            replay: None,
            cursor: 0,
            point: Point::default(),
            in_buffer: false,
            points_read: 0,
            closed: false,
        };
        buffered.collect_buffer()?;
        Ok(buffered)
    }

    pub fn buffer_size(&self) -> f64 {
        self.buffer_size
    }

    /// Number of neighbor points appended after the main file.
    pub fn buffer_len(&self) -> usize {
        self.store.len()
    }

    /// True while the current point comes from a neighbor.
    pub fn in_buffer(&self) -> bool {
        self.in_buffer
    }

    /// Reads the neighbors through the current filter and transform and widens
    /// the header by what they contribute.
    fn collect_buffer(&mut self) -> Result<(), ReaderError> {
        self.store.discard();
        self.replay = None;
        self.buffer_stats = Header::default();
        let Some(neighbors) = self.neighbors.as_mut() else {
            self.rebuild_header();
            return Ok(());
        };
        neighbors.reopen()?;
        neighbors.set_filter(self.filter.clone());
        neighbors.set_transform(self.transform.clone());

        let mut points = Vec::new();
        while neighbors.read_next() {
            let point = neighbors.point();
            self.buffer_stats.count_point(point);
            points.push(point.clone());
        }
        log::info!(
            "buffered {} neighbor points within {} of the main box",
            points.len(),
            self.buffer_size
        );

        self.store = match &self.spill_path {
            Some(path) if !points.is_empty() => BufferStore::spill(points, path.clone())?,
            _ => BufferStore::Memory(points),
        };
        self.rebuild_header();
        Ok(())
    }

    fn rebuild_header(&mut self) {
        let region = *self.region.region();
        self.region = RegionState::default();
        self.header = self.base.clone();
        self.header.accumulate(&self.buffer_stats);
        if !region.is_none() {
            self.region.install(region, &mut self.header);
        }
    }

    /// Drops the neighbor points and restores the header of the main file.
    pub fn remove_buffer(&mut self) {
        self.store.discard();
        self.replay = None;
        self.buffer_stats = Header::default();
        self.neighbors = None;
        self.rebuild_header();
    }

    /// Rewinds to the first main point; `keep_buffer == false` also removes the buffer.
    pub fn reopen_with(&mut self, keep_buffer: bool) -> Result<(), ReaderError> {
        if !keep_buffer {
            self.remove_buffer();
        }
        self.reopen()
    }

    fn next_buffered(&mut self) -> Result<bool, ReaderError> {
        if self.replay.is_none() {
            self.replay = Some(self.store.load()?);
        }
        let Some(points) = self.replay.as_ref() else {
            return Ok(false);
        };
        while let Some(point) = points.get(self.cursor) {
            self.cursor += 1;
            if self.region.contains(point.get_x(), point.get_y()) {
                self.point.clone_from(point);
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl PointReader for BufferedReader {
    fn header(&self) -> &Header {
        &self.header
    }

    fn point(&self) -> &Point {
        if self.in_buffer {
            &self.point
        } else {
            self.main.point()
        }
    }

    fn read_next(&mut self) -> bool {
        if self.closed || !self.region.intersects() {
            return false;
        }
        if !self.in_buffer {
            if self.main.read_next() {
                self.points_read += 1;
                return true;
            }
            self.in_buffer = true;
        }
        match self.next_buffered() {
            Ok(true) => {
                self.points_read += 1;
                true
            }
            Ok(false) => false,
            Err(error) => {
                log::warn!("cannot replay buffer points: {}", error);
                false
            }
        }
    }

    fn seek(&mut self, index: u64) -> Result<(), ReaderError> {
        let main_count = self.main.header().point_count;
        if index <= main_count {
            self.main.seek(index)?;
            self.in_buffer = false;
            self.cursor = 0;
        } else {
            let offset = (index - main_count) as usize;
            if offset > self.store.len() {
                return Err(ReaderError::SeekOutOfRange {
                    index,
                    count: self.header.point_count,
                });
            }
            self.main.seek(main_count)?;
            self.in_buffer = true;
            self.cursor = offset;
        }
        Ok(())
    }

    fn reopen(&mut self) -> Result<(), ReaderError> {
        self.main.reopen()?;
        self.in_buffer = false;
        self.cursor = 0;
        self.points_read = 0;
        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.main.close();
        if let Some(mut neighbors) = self.neighbors.take() {
            neighbors.close();
        }
        self.store.discard();
        self.replay = None;
        self.closed = true;
    }

    fn set_region(&mut self, region: QueryRegion) -> bool {
        self.main.set_region(region);
        self.region.install(region, &mut self.header)
    }

    fn clear_region(&mut self) {
        self.main.clear_region();
        self.region.clear(&mut self.header);
    }

    fn region(&self) -> QueryRegion {
        *self.region.region()
    }

    fn set_filter(&mut self, filter: Option<SharedFilter>) {
        self.filter = filter.clone();
        self.main.set_filter(filter);
        if let Err(error) = self.collect_buffer() {
            log::warn!("cannot collect buffer points: {}", error);
        }
    }

    fn set_transform(&mut self, transform: Option<SharedTransform>) {
        self.transform = transform.clone();
        self.main.set_transform(transform);
        if let Err(error) = self.collect_buffer() {
            log::warn!("cannot collect buffer points: {}", error);
        }
    }

    fn set_index(&mut self, enabled: bool) -> Result<bool, ReaderError> {
        if let Some(neighbors) = self.neighbors.as_mut() {
            neighbors.set_index(enabled)?;
        }
        self.main.set_index(enabled)
    }

    fn points_read(&self) -> u64 {
        self.points_read
    }

    fn can_seek(&self) -> bool {
        self.main.can_seek()
    }
}

impl Drop for BufferedReader {
    fn drop(&mut self) {
        self.close();
    }
}
