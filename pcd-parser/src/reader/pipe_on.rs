use std::io;

use pcd_core::pointcloud::{header::Header, point::Point};

use super::{PointReader, SharedFilter, SharedTransform};
use crate::{error::ReaderError, region::QueryRegion};

/// Consumer receiving every point a pipe-on reader delivers.
pub trait PointSink {
    /// Called once before the first point of each pass.
    fn begin(&mut self, _header: &Header) -> io::Result<()> {
        Ok(())
    }

    fn write_point(&mut self, point: &Point) -> io::Result<()>;

    /// Called at the end of each pass.
    fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Forwards each delivered point to a sink while handing it on to the caller.
pub struct PipeOnReader {
    inner: Box<dyn PointReader>,
    sink: Box<dyn PointSink>,
    begun: bool,
    failed: bool,
}

impl PipeOnReader {
    pub fn new(inner: Box<dyn PointReader>, sink: Box<dyn PointSink>) -> Self {
        Self {
            inner,
            sink,
            begun: false,
            failed: false,
        }
    }

    fn finish_pass(&mut self) {
        if self.begun {
            if let Err(error) = self.sink.finish() {
                log::warn!("pipe-on consumer failed to finish: {}", error);
            }
            self.begun = false;
        }
    }
}

impl PointReader for PipeOnReader {
    fn header(&self) -> &Header {
        self.inner.header()
    }

    fn point(&self) -> &Point {
        self.inner.point()
    }

    fn read_next(&mut self) -> bool {
        if !self.inner.read_next() {
            self.finish_pass();
            return false;
        }
        if self.failed {
            return true;
        }
        if !self.begun {
            self.begun = true;
            if let Err(error) = self.sink.begin(self.inner.header()) {
                log::warn!("pipe-on consumer failed to start, disabling it: {}", error);
                self.failed = true;
                return true;
            }
        }
        if let Err(error) = self.sink.write_point(self.inner.point()) {
            log::warn!("pipe-on consumer failed, disabling it: {}", error);
            self.failed = true;
        }
        true
    }

    fn seek(&mut self, index: u64) -> Result<(), ReaderError> {
        self.finish_pass();
        self.inner.seek(index)
    }

    fn reopen(&mut self) -> Result<(), ReaderError> {
        self.finish_pass();
        self.inner.reopen()
    }

    fn close(&mut self) {
        self.finish_pass();
        self.inner.close();
    }

    fn set_region(&mut self, region: QueryRegion) -> bool {
        self.inner.set_region(region)
    }

    fn clear_region(&mut self) {
        self.inner.clear_region()
    }

    fn region(&self) -> QueryRegion {
        self.inner.region()
    }

    fn set_filter(&mut self, filter: Option<SharedFilter>) {
        self.inner.set_filter(filter)
    }

    fn set_transform(&mut self, transform: Option<SharedTransform>) {
        self.inner.set_transform(transform)
    }

    fn set_index(&mut self, enabled: bool) -> Result<bool, ReaderError> {
        self.inner.set_index(enabled)
    }

    fn points_read(&self) -> u64 {
        self.inner.points_read()
    }

    fn can_seek(&self) -> bool {
        self.inner.can_seek()
    }
}

impl Drop for PipeOnReader {
    fn drop(&mut self) {
        self.finish_pass();
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::*;
    use crate::{
        decoder::DecoderOptions,
        reader::SingleReader,
        test_utils::{grid_points, write_points},
    };

    #[derive(Default)]
    struct Recorder {
        xs: Rc<RefCell<Vec<f64>>>,
        finished: Rc<RefCell<usize>>,
    }

    impl PointSink for Recorder {
        fn write_point(&mut self, point: &Point) -> io::Result<()> {
            self.xs.borrow_mut().push(point.get_x());
            Ok(())
        }

        fn finish(&mut self) -> io::Result<()> {
            *self.finished.borrow_mut() += 1;
            Ok(())
        }
    }

    #[test]
    fn forwards_every_delivered_point() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_points(dir.path(), "grid.csv", &grid_points((0.0, 0.0), 2, 1.0));
        let single = SingleReader::open(&path, &DecoderOptions::default()).unwrap();

        let recorder = Recorder::default();
        let (xs, finished) = (recorder.xs.clone(), recorder.finished.clone());
        let mut reader = PipeOnReader::new(Box::new(single), Box::new(recorder));

        let mut delivered = Vec::new();
        while reader.read_next() {
            delivered.push(reader.point().get_x());
        }
        assert_eq!(*xs.borrow(), delivered);
        assert_eq!(*finished.borrow(), 1);

        reader.reopen().unwrap();
        while reader.read_next() {}
        assert_eq!(xs.borrow().len(), 8);
        assert_eq!(*finished.borrow(), 2);

        reader.close();
        assert_eq!(*finished.borrow(), 2);
    }

    #[test]
    fn seek_ends_the_pass_in_progress() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_points(dir.path(), "grid.csv", &grid_points((0.0, 0.0), 2, 1.0));
        let single = SingleReader::open(&path, &DecoderOptions::default()).unwrap();

        let recorder = Recorder::default();
        let (xs, finished) = (recorder.xs.clone(), recorder.finished.clone());
        let mut reader = PipeOnReader::new(Box::new(single), Box::new(recorder));

        assert!(reader.read_next());
        assert!(reader.read_next());
        reader.seek(3).unwrap();
        assert_eq!(*finished.borrow(), 1);

        assert!(reader.read_next());
        assert!(!reader.read_next());
        assert_eq!(*finished.borrow(), 2);
        assert_eq!(xs.borrow().len(), 3);

        // nothing was begun since the last finish
        reader.seek(0).unwrap();
        assert_eq!(*finished.borrow(), 2);
    }
}
