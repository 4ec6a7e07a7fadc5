use pcd_core::pointcloud::{header::Header, point::Point};

use super::{PointReader, SharedFilter, SharedTransform};
use crate::{
    error::ReaderError,
    region::{QueryRegion, RegionState},
};

/// Keeps every delivered point in memory during the first pass so that later
/// passes replay them without touching the source again.
pub struct StoredReader {
    inner: Option<Box<dyn PointReader>>,
    header: Header,
    store: Vec<Point>,
    empty: Point,
    region: RegionState,
    started: bool,
    replaying: bool,
    cursor: usize,
    points_read: u64,
}

impl StoredReader {
    pub fn new(inner: Box<dyn PointReader>) -> Self {
        let header = inner.header().clone();
        Self {
            inner: Some(inner),
            empty: Point::new(header.quantizer),
            header,
            store: Vec::new(),
            region: RegionState::default(),
            started: false,
            replaying: false,
            cursor: 0,
            points_read: 0,
        }
    }

    pub fn stored(&self) -> usize {
        self.store.len()
    }

    pub fn is_replaying(&self) -> bool {
        self.replaying
    }

    /// Finishes the first pass and releases the source.
    fn switch_to_replay(&mut self) -> Result<(), ReaderError> {
        if self.replaying {
            return Ok(());
        }
        if !self.started {
            return Err(ReaderError::NothingStored);
        }
        if let Some(mut inner) = self.inner.take() {
            while inner.read_next() {
                self.store.push(inner.point().clone());
            }
            // replay owns the region from here on, with the unnarrowed bounds saved
            let region = inner.region();
            inner.clear_region();
            self.header = inner.header().clone();
            inner.close();
            self.region.install(region, &mut self.header);
        }
        log::debug!("replaying {} stored points", self.store.len());
        self.replaying = true;
        self.cursor = 0;
        Ok(())
    }
}

impl PointReader for StoredReader {
    fn header(&self) -> &Header {
        match &self.inner {
            Some(inner) => inner.header(),
            None => &self.header,
        }
    }

    fn point(&self) -> &Point {
        match &self.inner {
            Some(inner) => inner.point(),
            None => self
                .store
                .get(self.cursor.wrapping_sub(1))
                .unwrap_or(&self.empty),
        }
    }

    fn read_next(&mut self) -> bool {
        self.started = true;
        if !self.replaying {
            let Some(inner) = self.inner.as_mut() else {
                return false;
            };
            if inner.read_next() {
                self.store.push(inner.point().clone());
                self.points_read += 1;
                return true;
            }
            return false;
        }
        while let Some(point) = self.store.get(self.cursor) {
            self.cursor += 1;
            if self.region.contains(point.get_x(), point.get_y()) {
                self.points_read += 1;
                return true;
            }
        }
        false
    }

    /// Seeks among the stored points, finishing the first pass if needed.
    fn seek(&mut self, index: u64) -> Result<(), ReaderError> {
        self.switch_to_replay()?;
        if index as usize > self.store.len() {
            return Err(ReaderError::SeekOutOfRange {
                index,
                count: self.store.len() as u64,
            });
        }
        self.cursor = index as usize;
        Ok(())
    }

    fn reopen(&mut self) -> Result<(), ReaderError> {
        self.switch_to_replay()?;
        self.cursor = 0;
        self.points_read = 0;
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut inner) = self.inner.take() {
            self.header = inner.header().clone();
            inner.close();
        }
        self.store = Vec::new();
        self.cursor = 0;
        self.replaying = true;
    }

    fn set_region(&mut self, region: QueryRegion) -> bool {
        match self.inner.as_mut() {
            Some(inner) => inner.set_region(region),
            None => self.region.install(region, &mut self.header),
        }
    }

    fn clear_region(&mut self) {
        match self.inner.as_mut() {
            Some(inner) => inner.clear_region(),
            None => self.region.clear(&mut self.header),
        }
    }

    fn region(&self) -> QueryRegion {
        match &self.inner {
            Some(inner) => inner.region(),
            None => *self.region.region(),
        }
    }

    fn set_filter(&mut self, filter: Option<SharedFilter>) {
        match self.inner.as_mut() {
            Some(inner) => inner.set_filter(filter),
            None => log::debug!("stored points are replayed without a new filter"),
        }
    }

    fn set_transform(&mut self, transform: Option<SharedTransform>) {
        match self.inner.as_mut() {
            Some(inner) => inner.set_transform(transform),
            None => log::debug!("stored points are replayed without a new transform"),
        }
    }

    fn set_index(&mut self, enabled: bool) -> Result<bool, ReaderError> {
        match self.inner.as_mut() {
            Some(inner) => inner.set_index(enabled),
            None => Ok(false),
        }
    }

    fn points_read(&self) -> u64 {
        self.points_read
    }
}
