use std::path::Path;

use pcd_core::pointcloud::{
    field_mask::FieldMask, header::Header, point::Point, quantize::Quantizer,
};

use super::{
    rejects, transforms, Dispatch, PointReader, RescaleReoffset, Scan, SharedFilter,
    SharedTransform,
};
use crate::{
    decoder::{open_decoder, DecoderOptions, PointDecoder},
    error::ReaderError,
    index::{GridIndex, SpatialIndex},
    region::{QueryRegion, RegionState},
};

/// Number of grid cells along the longer side of an index built on demand.
const INDEX_CELLS_PER_SIDE: f64 = 64.0;

/// Reads one decoder, applying region, index, filter and transform.
pub struct SingleReader {
    decoder: Box<dyn PointDecoder>,
    header: Header,
    point: Point,
    target: Option<Quantizer>,
    region: RegionState,
    index: Option<GridIndex>,
    filter: Option<SharedFilter>,
    transform: Option<SharedTransform>,
    dispatch: Dispatch,
    selective: Option<FieldMask>,
    points_read: u64,
    exhausted: bool,
    closed: bool,
}

impl SingleReader {
    pub fn new(decoder: Box<dyn PointDecoder>) -> Self {
        let header = decoder.header().clone();
        let point = Point::new(header.quantizer);
        let mut reader = Self {
            decoder,
            header,
            point,
            target: None,
            region: RegionState::default(),
            index: None,
            filter: None,
            transform: None,
            dispatch: Dispatch::Plain(Scan::All),
            selective: None,
            points_read: 0,
            exhausted: false,
            closed: false,
        };
        reader.update_selective();
        reader
    }

    pub fn open(path: &Path, options: &DecoderOptions) -> Result<Self, ReaderError> {
        Ok(Self::new(open_decoder(path, options)?))
    }

    /// Rewrites the header quantization; delivered points are requantized to match.
    pub fn rescale(&mut self, rescale: &RescaleReoffset) {
        let saved = *self.region.region();
        self.region.clear(&mut self.header);
        if let Some(quantizer) = rescale.apply(&mut self.header) {
            self.target = Some(quantizer);
            self.point.quantizer = quantizer;
        }
        if !saved.is_none() {
            self.set_region(saved);
        }
    }

    /// Fields the caller needs beyond what the filter and transform declare;
    /// `None` asks for everything.
    pub fn set_decompress_selective(&mut self, mask: Option<FieldMask>) {
        self.selective = mask;
        self.update_selective();
    }

    pub fn path(&self) -> Option<&Path> {
        self.decoder.path()
    }

    pub fn dispatch(&self) -> Dispatch {
        self.dispatch
    }

    fn update_selective(&mut self) {
        let Some(mask) = self.selective else {
            self.decoder.set_decompress_selective(FieldMask::all());
            return;
        };
        let mut mask = mask | FieldMask::CHANNEL_RETURNS_XY;
        if let Some(filter) = &self.filter {
            mask |= filter.borrow().decompress_hint();
        }
        if let Some(transform) = &self.transform {
            mask |= transform.borrow().decompress_hint();
        }
        self.decoder.set_decompress_selective(mask);
    }

    fn redispatch(&mut self) {
        let region = self
            .region
            .is_active()
            .then(|| self.region.intersects());
        let filtered = self
            .filter
            .as_ref()
            .is_some_and(|filter| filter.borrow().is_active());
        let transformed = self
            .transform
            .as_ref()
            .is_some_and(|transform| transform.borrow().is_active());
        self.dispatch = Dispatch::select(region, self.index.is_some(), filtered, transformed);
        log::trace!("dispatch is now {:?}", self.dispatch);
    }

    fn fail(&mut self, error: ReaderError) {
        let position = self.decoder.position();
        log::warn!(
            "stopping after {} of {} points: {}",
            position,
            self.header.point_count,
            error
        );
        self.header.point_count = position;
        self.exhausted = true;
    }

    fn read_raw(&mut self) -> bool {
        if self.exhausted || self.closed {
            return false;
        }
        match self.decoder.read_point(&mut self.point) {
            Ok(true) => {
                if let Some(target) = &self.target {
                    self.point.requantize(target);
                }
                true
            }
            Ok(false) => {
                self.exhausted = true;
                false
            }
            Err(error) => {
                self.fail(error);
                false
            }
        }
    }

    fn read_scan(&mut self, scan: Scan) -> bool {
        loop {
            if scan == Scan::InsideIndexed {
                if let Some(index) = self.index.as_mut() {
                    match index.seek_next(self.decoder.as_mut()) {
                        Ok(true) => {}
                        Ok(false) => return false,
                        Err(error) => {
                            self.fail(error);
                            return false;
                        }
                    }
                }
            }
            if !self.read_raw() {
                return false;
            }
            if scan == Scan::All || self.region.contains(self.point.get_x(), self.point.get_y()) {
                return true;
            }
        }
    }

    fn prepare_index(&mut self) {
        if let Some(index) = self.index.as_mut() {
            // the index holds source cells, the region is tested after requantizing
            let margin = self
                .target
                .map_or(0.0, |target| target.scale[0].max(target.scale[1]));
            index.set_margin(margin);
            index.intersect(self.region.region());
        }
    }
}

impl PointReader for SingleReader {
    fn header(&self) -> &Header {
        &self.header
    }

    fn point(&self) -> &Point {
        &self.point
    }

    fn read_next(&mut self) -> bool {
        loop {
            let Some(scan) = self.dispatch.scan() else {
                return false;
            };
            if !self.read_scan(scan) {
                return false;
            }
            let accepted = match self.dispatch {
                Dispatch::Filtered(_) => !rejects(&self.filter, &self.point),
                Dispatch::Transformed(_) => transforms(&self.transform, &mut self.point),
                Dispatch::FilteredAndTransformed(_) => {
                    !rejects(&self.filter, &self.point)
                        && transforms(&self.transform, &mut self.point)
                }
                Dispatch::Plain(_) | Dispatch::Empty => true,
            };
            if accepted {
                self.points_read += 1;
                return true;
            }
        }
    }

    fn seek(&mut self, index: u64) -> Result<(), ReaderError> {
        if self.closed {
            return Err(ReaderError::Closed);
        }
        self.decoder.seek(index)?;
        self.exhausted = false;
        self.prepare_index();
        Ok(())
    }

    fn reopen(&mut self) -> Result<(), ReaderError> {
        if self.closed {
            return Err(ReaderError::Closed);
        }
        self.decoder.reopen()?;
        self.exhausted = false;
        self.points_read = 0;
        if let Some(filter) = &self.filter {
            filter.borrow_mut().reset();
        }
        if let Some(transform) = &self.transform {
            transform.borrow_mut().reset();
        }
        self.prepare_index();
        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.decoder.close();
        self.index = None;
        self.closed = true;
        log::debug!(
            "closed {:?} after {} points",
            self.decoder.path(),
            self.points_read
        );
    }

    fn set_region(&mut self, region: QueryRegion) -> bool {
        let intersects = self.region.install(region, &mut self.header);
        self.prepare_index();
        self.redispatch();
        intersects
    }

    fn clear_region(&mut self) {
        self.region.clear(&mut self.header);
        self.prepare_index();
        self.redispatch();
    }

    fn region(&self) -> QueryRegion {
        *self.region.region()
    }

    fn set_filter(&mut self, filter: Option<SharedFilter>) {
        self.filter = filter;
        self.update_selective();
        self.redispatch();
    }

    fn set_transform(&mut self, transform: Option<SharedTransform>) {
        self.transform = transform;
        self.update_selective();
        self.redispatch();
    }

    /// Loads the sidecar index of the source, building one in memory when none
    /// exists. Returns whether an index is in use.
    fn set_index(&mut self, enabled: bool) -> Result<bool, ReaderError> {
        if !enabled {
            self.index = None;
            self.redispatch();
            return Ok(false);
        }
        if self.index.is_none() {
            let loaded = match self.decoder.path() {
                Some(path) => GridIndex::load_for(path, self.decoder.header().point_count)?,
                None => None,
            };
            self.index = match loaded {
                Some(index) => Some(index),
                None if self.decoder.can_seek() => {
                    let bounds = self.decoder.header().bounds;
                    let extent = if bounds.is_empty() {
                        0.0
                    } else {
                        (bounds.max[0] - bounds.min[0]).max(bounds.max[1] - bounds.min[1])
                    };
                    let cell_size = (extent / INDEX_CELLS_PER_SIDE).max(1.0);
                    let position = self.decoder.position();
                    let index = GridIndex::build(self.decoder.as_mut(), cell_size)?;
                    self.decoder.seek(position)?;
                    Some(index)
                }
                None => None,
            };
        }
        self.prepare_index();
        self.redispatch();
        Ok(self.index.is_some())
    }

    fn points_read(&self) -> u64 {
        self.points_read
    }

    fn can_seek(&self) -> bool {
        self.decoder.can_seek()
    }
}

impl Drop for SingleReader {
    fn drop(&mut self) {
        self.close();
    }
}
