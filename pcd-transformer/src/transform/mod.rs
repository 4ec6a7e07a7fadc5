use std::fmt;

use pcd_core::pointcloud::{field_mask::FieldMask, header::Header, point::Point};

use crate::{error::TransformError, filter::Criterion};

pub mod operations;

use operations::SetPointSource;

/// A named in-place point mutation.
pub trait Operation: fmt::Debug + Send {
    fn name(&self) -> &'static str;

    fn apply(&mut self, point: &mut Point);

    /// Fields this operation reads, independent of what it writes.
    fn decompress_hint(&self) -> FieldMask {
        FieldMask::CHANNEL_RETURNS_XY
    }

    fn reset(&mut self) {}

    fn validate(&self, _header: &Header) -> Result<(), TransformError> {
        Ok(())
    }

    fn box_clone(&self) -> Box<dyn Operation>;
}

impl Clone for Box<dyn Operation> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

/// Ordered list of operations with an optional criterion that vetoes the whole list.
#[derive(Debug, Clone, Default)]
pub struct TransformPipeline {
    operations: Vec<Box<dyn Operation>>,
    filter: Option<Box<dyn Criterion>>,
    vetoed: u64,
}

impl TransformPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<O: Operation + 'static>(&mut self, operation: O) {
        self.operations.push(Box::new(operation));
    }

    pub fn add_boxed(&mut self, operation: Box<dyn Operation>) {
        self.operations.push(operation);
    }

    /// Installs a criterion; points it rejects are neither transformed nor delivered.
    pub fn set_filter(&mut self, criterion: Box<dyn Criterion>) {
        self.filter = Some(criterion);
    }

    pub fn clear_filter(&mut self) {
        self.filter = None;
    }

    /// Retargets the point source assignment, replacing an earlier one in place.
    pub fn set_point_source(&mut self, point_source_id: u16) {
        let operation = Box::new(SetPointSource::new(point_source_id));
        match self
            .operations
            .iter_mut()
            .find(|op| op.name() == SetPointSource::NAME)
        {
            Some(slot) => *slot = operation,
            None => self.operations.push(operation),
        }
    }

    /// True when the pipeline would change or veto any point.
    pub fn is_active(&self) -> bool {
        !self.operations.is_empty() || self.filter.is_some()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Runs every operation in order. Returns `false` when the attached criterion
    /// vetoed the point.
    pub fn transform(&mut self, point: &mut Point) -> bool {
        if let Some(filter) = self.filter.as_mut() {
            if filter.reject(point) {
                self.vetoed += 1;
                return false;
            }
        }
        for operation in &mut self.operations {
            operation.apply(point);
        }
        true
    }

    pub fn reset(&mut self) {
        if let Some(filter) = self.filter.as_mut() {
            filter.reset();
        }
        for operation in &mut self.operations {
            operation.reset();
        }
    }

    pub fn decompress_hint(&self) -> FieldMask {
        let mask = self
            .operations
            .iter()
            .fold(FieldMask::CHANNEL_RETURNS_XY, |mask, op| {
                mask | op.decompress_hint()
            });
        match &self.filter {
            Some(filter) => mask | filter.decompress_hint(),
            None => mask,
        }
    }

    pub fn validate(&self, header: &Header) -> Result<(), TransformError> {
        if let Some(filter) = &self.filter {
            filter.validate(header)?;
        }
        for operation in &self.operations {
            operation.validate(header)?;
        }
        Ok(())
    }

    pub fn vetoed(&self) -> u64 {
        self.vetoed
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.operations.iter().map(|op| op.name()).collect()
    }
}
