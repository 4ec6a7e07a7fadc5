use std::any::Any;

use pcd_core::pointcloud::{field_mask::FieldMask, header::Header, point::Point};

use super::Criterion;
use crate::error::FilterError;

/// Rejects when either child rejects, evaluating `one` first.
#[derive(Debug, Clone)]
pub struct And {
    one: Box<dyn Criterion>,
    two: Box<dyn Criterion>,
}

impl And {
    pub fn new(one: Box<dyn Criterion>, two: Box<dyn Criterion>) -> Self {
        Self { one, two }
    }
}

impl Criterion for And {
    fn name(&self) -> &'static str {
        "filter_and"
    }

    fn reject(&mut self, point: &Point) -> bool {
        self.one.reject(point) || self.two.reject(point)
    }

    fn reset(&mut self) {
        self.one.reset();
        self.two.reset();
    }

    fn decompress_hint(&self) -> FieldMask {
        self.one.decompress_hint() | self.two.decompress_hint()
    }

    fn validate(&self, header: &Header) -> Result<(), FilterError> {
        self.one.validate(header)?;
        self.two.validate(header)
    }

    fn describe(&self) -> String {
        format!("({} and {})", self.one.describe(), self.two.describe())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn box_clone(&self) -> Box<dyn Criterion> {
        Box::new(self.clone())
    }
}

/// Rejects only when both children reject.
#[derive(Debug, Clone)]
pub struct Or {
    one: Box<dyn Criterion>,
    two: Box<dyn Criterion>,
}

impl Or {
    pub fn new(one: Box<dyn Criterion>, two: Box<dyn Criterion>) -> Self {
        Self { one, two }
    }
}

impl Criterion for Or {
    fn name(&self) -> &'static str {
        "filter_or"
    }

    fn reject(&mut self, point: &Point) -> bool {
        self.one.reject(point) && self.two.reject(point)
    }

    fn reset(&mut self) {
        self.one.reset();
        self.two.reset();
    }

    fn decompress_hint(&self) -> FieldMask {
        self.one.decompress_hint() | self.two.decompress_hint()
    }

    fn validate(&self, header: &Header) -> Result<(), FilterError> {
        self.one.validate(header)?;
        self.two.validate(header)
    }

    fn describe(&self) -> String {
        format!("({} or {})", self.one.describe(), self.two.describe())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn box_clone(&self) -> Box<dyn Criterion> {
        Box::new(self.clone())
    }
}

#[derive(Debug, Clone)]
pub struct Not {
    inner: Box<dyn Criterion>,
}

impl Not {
    pub fn new(inner: Box<dyn Criterion>) -> Self {
        Self { inner }
    }
}

impl Criterion for Not {
    fn name(&self) -> &'static str {
        "filter_not"
    }

    fn reject(&mut self, point: &Point) -> bool {
        !self.inner.reject(point)
    }

    fn reset(&mut self) {
        self.inner.reset();
    }

    fn decompress_hint(&self) -> FieldMask {
        self.inner.decompress_hint()
    }

    fn validate(&self, header: &Header) -> Result<(), FilterError> {
        self.inner.validate(header)
    }

    fn describe(&self) -> String {
        format!("not {}", self.inner.describe())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn box_clone(&self) -> Box<dyn Criterion> {
        Box::new(self.clone())
    }
}
