use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use pcd_core::pointcloud::point::Point;
use serde::{Deserialize, Serialize};

use crate::{decoder::PointDecoder, error::ReaderError, region::QueryRegion};

/// Accelerates region queries by limiting which records are visited.
///
/// An index may visit records outside the region; readers still test every
/// delivered point against the region.
pub trait SpatialIndex {
    /// Prepares the record intervals of `region`. Returns `false` when no record
    /// can lie inside.
    fn intersect(&mut self, region: &QueryRegion) -> bool;

    /// Positions `decoder` on the next candidate record at or after its current
    /// position. Returns `false` when no candidate is left.
    fn seek_next(&mut self, decoder: &mut dyn PointDecoder) -> Result<bool, ReaderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GridCell {
    col: i32,
    row: i32,
    intervals: Vec<Interval>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexFile {
    cell_size: f64,
    origin: [f64; 2],
    point_count: u64,
    cells: Vec<GridCell>,
}

/// Uniform xy grid mapping each cell to the record intervals that fall inside it.
#[derive(Debug, Clone, Default)]
pub struct GridIndex {
    cell_size: f64,
    origin: [f64; 2],
    point_count: u64,
    cells: HashMap<(i32, i32), Vec<Interval>>,
    margin: f64,
    selected: Vec<Interval>,
    cursor: usize,
}

pub fn index_path(source: &Path) -> PathBuf {
    source.with_extension("pidx")
}

impl GridIndex {
    /// Scans `decoder` from its first record and rewinds it afterwards.
    pub fn build(decoder: &mut dyn PointDecoder, cell_size: f64) -> Result<Self, ReaderError> {
        let header = decoder.header();
        let origin = if header.bounds.is_empty() {
            [0.0, 0.0]
        } else {
            [header.bounds.min[0], header.bounds.min[1]]
        };
        let mut index = Self {
            cell_size,
            origin,
            ..Default::default()
        };

        decoder.reopen()?;
        let mut point = Point::new(decoder.header().quantizer);
        let mut position = 0;
        while decoder.read_point(&mut point)? {
            let cell = index.cell_of(point.get_x(), point.get_y());
            let intervals = index.cells.entry(cell).or_default();
            match intervals.last_mut() {
                Some(last) if last.end == position => last.end += 1,
                _ => intervals.push(Interval {
                    start: position,
                    end: position + 1,
                }),
            }
            position += 1;
        }
        index.point_count = position;
        decoder.reopen()?;

        log::debug!(
            "indexed {} points into {} cells of size {}",
            position,
            index.cells.len(),
            cell_size
        );
        Ok(index)
    }

    /// Loads the sidecar index of `source`, if one exists and matches `point_count`.
    pub fn load_for(source: &Path, point_count: u64) -> Result<Option<Self>, ReaderError> {
        let path = index_path(source);
        if !path.exists() {
            return Ok(None);
        }
        let index = Self::read(&path)?;
        if index.point_count != point_count {
            log::warn!(
                "ignoring index {:?}: it covers {} points but the source has {}",
                path,
                index.point_count,
                point_count
            );
            return Ok(None);
        }
        Ok(Some(index))
    }

    pub fn read(path: &Path) -> Result<Self, ReaderError> {
        let bytes = fs::read(path)?;
        let file: IndexFile = bitcode::deserialize(&bytes)?;
        let cells = file
            .cells
            .into_iter()
            .map(|cell| ((cell.col, cell.row), cell.intervals))
            .collect();
        Ok(Self {
            cell_size: file.cell_size,
            origin: file.origin,
            point_count: file.point_count,
            cells,
            ..Default::default()
        })
    }

    pub fn write(&self, path: &Path) -> Result<(), ReaderError> {
        let mut cells: Vec<GridCell> = self
            .cells
            .iter()
            .map(|(&(col, row), intervals)| GridCell {
                col,
                row,
                intervals: intervals.clone(),
            })
            .collect();
        cells.sort_by_key(|cell| (cell.row, cell.col));
        let file = IndexFile {
            cell_size: self.cell_size,
            origin: self.origin,
            point_count: self.point_count,
            cells,
        };
        fs::write(path, bitcode::serialize(&file)?)?;
        Ok(())
    }

    pub fn point_count(&self) -> u64 {
        self.point_count
    }

    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// Widens every query by `margin`, for readers that move points after
    /// decoding (requantization can shift a point by up to one grid step).
    pub fn set_margin(&mut self, margin: f64) {
        self.margin = margin.max(0.0);
    }

    fn cell_of(&self, x: f64, y: f64) -> (i32, i32) {
        (
            ((x - self.origin[0]) / self.cell_size).floor() as i32,
            ((y - self.origin[1]) / self.cell_size).floor() as i32,
        )
    }
}

/// Sorts and coalesces overlapping or adjacent intervals.
fn merge_intervals(mut intervals: Vec<Interval>) -> Vec<Interval> {
    intervals.sort_by_key(|i| i.start);
    let mut merged: Vec<Interval> = Vec::with_capacity(intervals.len());
    for interval in intervals {
        match merged.last_mut() {
            Some(last) if interval.start <= last.end => last.end = last.end.max(interval.end),
            _ => merged.push(interval),
        }
    }
    merged
}

impl SpatialIndex for GridIndex {
    fn intersect(&mut self, region: &QueryRegion) -> bool {
        self.cursor = 0;
        let Some(bbox) = region.bounding_box() else {
            self.selected = vec![Interval {
                start: 0,
                end: self.point_count,
            }];
            return self.point_count > 0;
        };

        let margin = self.margin;
        let (min_col, min_row) = self.cell_of(bbox.min[0] - margin, bbox.min[1] - margin);
        let (max_col, max_row) = self.cell_of(bbox.max[0] + margin, bbox.max[1] + margin);
        let candidates = self
            .cells
            .iter()
            .filter(|(&(col, row), _)| {
                min_col <= col && col <= max_col && min_row <= row && row <= max_row
            })
            .flat_map(|(_, intervals)| intervals.iter().copied())
            .collect();
        self.selected = merge_intervals(candidates);
        !self.selected.is_empty()
    }

    fn seek_next(&mut self, decoder: &mut dyn PointDecoder) -> Result<bool, ReaderError> {
        let position = decoder.position();
        while self
            .selected
            .get(self.cursor)
            .is_some_and(|interval| interval.end <= position)
        {
            self.cursor += 1;
        }
        let Some(interval) = self.selected.get(self.cursor) else {
            return Ok(false);
        };
        if position < interval.start {
            decoder.seek(interval.start)?;
        }
        Ok(true)
    }
}
