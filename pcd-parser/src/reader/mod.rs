use std::{cell::RefCell, rc::Rc};

use pcd_core::pointcloud::{header::Header, point::Point};
use pcd_transformer::{FilterChain, TransformPipeline};

use crate::{error::ReaderError, region::QueryRegion};

pub mod buffered;
pub mod merged;
pub mod pipe_on;
pub mod rescale;
pub mod single;
pub mod stored;

pub use buffered::BufferedReader;
pub use merged::MergedReader;
pub use pipe_on::{PipeOnReader, PointSink};
pub use rescale::RescaleReoffset;
pub use single::SingleReader;
pub use stored::StoredReader;

/// Filter chain shared by every reader built from one configuration.
pub type SharedFilter = Rc<RefCell<FilterChain>>;
/// Transform pipeline shared by every reader built from one configuration.
pub type SharedTransform = Rc<RefCell<TransformPipeline>>;

/// How raw records are pulled from the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scan {
    All,
    Inside,
    InsideIndexed,
}

/// Read strategy, re-derived whenever the region, index, filter or transform changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Empty,
    Plain(Scan),
    Filtered(Scan),
    Transformed(Scan),
    FilteredAndTransformed(Scan),
}

impl Dispatch {
    pub fn select(region: Option<bool>, indexed: bool, filtered: bool, transformed: bool) -> Self {
        let scan = match region {
            Some(false) => return Dispatch::Empty,
            None => Scan::All,
            Some(true) if indexed => Scan::InsideIndexed,
            Some(true) => Scan::Inside,
        };
        match (filtered, transformed) {
            (false, false) => Dispatch::Plain(scan),
            (true, false) => Dispatch::Filtered(scan),
            (false, true) => Dispatch::Transformed(scan),
            (true, true) => Dispatch::FilteredAndTransformed(scan),
        }
    }

    pub fn scan(&self) -> Option<Scan> {
        match *self {
            Dispatch::Empty => None,
            Dispatch::Plain(scan)
            | Dispatch::Filtered(scan)
            | Dispatch::Transformed(scan)
            | Dispatch::FilteredAndTransformed(scan) => Some(scan),
        }
    }
}

/// Pull-based point source. `read_next` advances and `point` exposes the
/// current record, which is overwritten by the next read.
pub trait PointReader {
    fn header(&self) -> &Header;

    fn point(&self) -> &Point;

    /// `false` at the end of the stream, including after a mid-stream failure.
    fn read_next(&mut self) -> bool;

    fn seek(&mut self, index: u64) -> Result<(), ReaderError>;

    fn reopen(&mut self) -> Result<(), ReaderError>;

    fn close(&mut self);

    /// Installs a query region; returns whether it can contain any point.
    fn set_region(&mut self, region: QueryRegion) -> bool;

    fn clear_region(&mut self);

    /// The installed query region, `QueryRegion::None` when there is none.
    fn region(&self) -> QueryRegion;

    fn set_filter(&mut self, filter: Option<SharedFilter>);

    fn set_transform(&mut self, transform: Option<SharedTransform>);

    /// Enables or disables the spatial index for region queries.
    fn set_index(&mut self, enabled: bool) -> Result<bool, ReaderError>;

    /// Points delivered since the last open or reopen.
    fn points_read(&self) -> u64;

    fn can_seek(&self) -> bool {
        true
    }
}

impl<R: PointReader + ?Sized> PointReader for Box<R> {
    fn header(&self) -> &Header {
        (**self).header()
    }

    fn point(&self) -> &Point {
        (**self).point()
    }

    fn read_next(&mut self) -> bool {
        (**self).read_next()
    }

    fn seek(&mut self, index: u64) -> Result<(), ReaderError> {
        (**self).seek(index)
    }

    fn reopen(&mut self) -> Result<(), ReaderError> {
        (**self).reopen()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn set_region(&mut self, region: QueryRegion) -> bool {
        (**self).set_region(region)
    }

    fn clear_region(&mut self) {
        (**self).clear_region()
    }

    fn region(&self) -> QueryRegion {
        (**self).region()
    }

    fn set_filter(&mut self, filter: Option<SharedFilter>) {
        (**self).set_filter(filter)
    }

    fn set_transform(&mut self, transform: Option<SharedTransform>) {
        (**self).set_transform(transform)
    }

    fn set_index(&mut self, enabled: bool) -> Result<bool, ReaderError> {
        (**self).set_index(enabled)
    }

    fn points_read(&self) -> u64 {
        (**self).points_read()
    }

    fn can_seek(&self) -> bool {
        (**self).can_seek()
    }
}

/// Runs the shared filter on `point`; `true` when the point is rejected.
pub(crate) fn rejects(filter: &Option<SharedFilter>, point: &Point) -> bool {
    filter
        .as_ref()
        .is_some_and(|filter| filter.borrow_mut().filter(point))
}

/// Runs the shared transform on `point`; `false` when the pipeline vetoed it.
pub(crate) fn transforms(transform: &Option<SharedTransform>, point: &mut Point) -> bool {
    transform
        .as_ref()
        .map_or(true, |transform| transform.borrow_mut().transform(point))
}
