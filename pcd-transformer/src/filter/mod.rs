use std::any::Any;
use std::fmt;

use pcd_core::pointcloud::{field_mask::FieldMask, header::Header, point::Point};

use crate::error::FilterError;

mod combinator;
pub mod criteria;

pub use combinator::{And, Not, Or};

/// A named predicate over a point.
pub trait Criterion: fmt::Debug + Send {
    fn name(&self) -> &'static str;

    /// Returns `true` when the point must be dropped.
    fn reject(&mut self, point: &Point) -> bool;

    /// Forgets per-source state such as counters, seen cells or seeds.
    fn reset(&mut self) {}

    fn decompress_hint(&self) -> FieldMask {
        FieldMask::CHANNEL_RETURNS_XY
    }

    fn validate(&self, _header: &Header) -> Result<(), FilterError> {
        Ok(())
    }

    /// Widens `self` with `other` when both are mask criteria of the same kind.
    fn merge(&mut self, _other: &dyn Criterion) -> bool {
        false
    }

    fn describe(&self) -> String {
        self.name().to_string()
    }

    fn as_any(&self) -> &dyn Any;

    fn box_clone(&self) -> Box<dyn Criterion>;
}

impl Clone for Box<dyn Criterion> {
    fn clone(&self) -> Self {
        self.box_clone()
    }
}

#[derive(Debug, Clone)]
struct Entry {
    criterion: Box<dyn Criterion>,
    rejected: u64,
}

/// Ordered conjunction of criteria. The first criterion that rejects a point
/// claims the rejection in its counter.
#[derive(Debug, Clone, Default)]
pub struct FilterChain {
    entries: Vec<Entry>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<C: Criterion + 'static>(&mut self, criterion: C) {
        self.add_boxed(Box::new(criterion));
    }

    pub fn add_boxed(&mut self, criterion: Box<dyn Criterion>) {
        if let Some(last) = self.entries.last_mut() {
            if last.criterion.merge(criterion.as_ref()) {
                log::debug!("merged into {}", last.criterion.describe());
                return;
            }
        }
        self.entries.push(Entry {
            criterion,
            rejected: 0,
        });
    }

    /// Replaces the two most recent criteria with their conjunction.
    pub fn and(&mut self) -> Result<(), FilterError> {
        let (one, two) = self.pop_pair("filter_and")?;
        self.push_combined(Box::new(And::new(one, two)));
        Ok(())
    }

    /// Replaces the two most recent criteria with their disjunction.
    pub fn or(&mut self) -> Result<(), FilterError> {
        let (one, two) = self.pop_pair("filter_or")?;
        self.push_combined(Box::new(Or::new(one, two)));
        Ok(())
    }

    /// Inverts the most recent criterion.
    pub fn not(&mut self) -> Result<(), FilterError> {
        let entry = self
            .entries
            .pop()
            .ok_or(FilterError::MissingOperands("filter_not", 1))?;
        self.push_combined(Box::new(Not::new(entry.criterion)));
        Ok(())
    }

    fn pop_pair(
        &mut self,
        combinator: &'static str,
    ) -> Result<(Box<dyn Criterion>, Box<dyn Criterion>), FilterError> {
        if self.entries.len() < 2 {
            return Err(FilterError::MissingOperands(combinator, 2));
        }
        let two = self.entries.pop().map(|e| e.criterion);
        let one = self.entries.pop().map(|e| e.criterion);
        match (one, two) {
            (Some(one), Some(two)) => Ok((one, two)),
            _ => Err(FilterError::MissingOperands(combinator, 2)),
        }
    }

    fn push_combined(&mut self, criterion: Box<dyn Criterion>) {
        self.entries.push(Entry {
            criterion,
            rejected: 0,
        });
    }

    pub fn is_active(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns `true` when the point is rejected.
    pub fn filter(&mut self, point: &Point) -> bool {
        for entry in &mut self.entries {
            if entry.criterion.reject(point) {
                entry.rejected += 1;
                return true;
            }
        }
        false
    }

    /// Resets the state of every criterion. Counters are kept.
    pub fn reset(&mut self) {
        for entry in &mut self.entries {
            entry.criterion.reset();
        }
    }

    pub fn decompress_hint(&self) -> FieldMask {
        self.entries
            .iter()
            .fold(FieldMask::CHANNEL_RETURNS_XY, |mask, entry| {
                mask | entry.criterion.decompress_hint()
            })
    }

    pub fn validate(&self, header: &Header) -> Result<(), FilterError> {
        for entry in &self.entries {
            entry.criterion.validate(header)?;
        }
        Ok(())
    }

    /// Rejection count per criterion, in chain order.
    pub fn counters(&self) -> Vec<(String, u64)> {
        self.entries
            .iter()
            .map(|entry| (entry.criterion.describe(), entry.rejected))
            .collect()
    }

    pub fn total_rejected(&self) -> u64 {
        self.entries.iter().map(|entry| entry.rejected).sum()
    }

    pub fn clear_counters(&mut self) {
        for entry in &mut self.entries {
            entry.rejected = 0;
        }
    }

    pub fn log_summary(&self) {
        for (description, rejected) in self.counters() {
            log::info!("  {} rejected {} points", description, rejected);
        }
    }

    pub fn criterion(&self, index: usize) -> Option<&dyn Criterion> {
        self.entries.get(index).map(|entry| entry.criterion.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use pcd_core::pointcloud::quantize::Quantizer;

    use super::criteria::*;
    use super::*;

    fn make_point(x: f64, y: f64, classification: u8) -> Point {
        let mut point = Point::new(Quantizer::default());
        point.set_coordinates([x, y, 0.0]);
        point.attributes.classification = classification;
        point.attributes.return_number = 1;
        point.attributes.number_of_returns = 1;
        point
    }

    #[test]
    fn first_rejecting_criterion_claims_the_count() {
        let mut chain = FilterChain::new();
        chain.add(KeepClassifications::new(&[2]));
        chain.add(KeepXY::new(0.0, 0.0, 10.0, 10.0));

        assert!(!chain.filter(&make_point(1.0, 1.0, 2)));
        assert!(chain.filter(&make_point(1.0, 1.0, 6)));
        assert!(chain.filter(&make_point(20.0, 1.0, 6)));
        assert!(chain.filter(&make_point(20.0, 1.0, 2)));

        let counters = chain.counters();
        assert_eq!(counters[0].1, 2);
        assert_eq!(counters[1].1, 1);
        assert_eq!(chain.total_rejected(), 3);
    }

    #[test]
    fn classification_masks_merge_when_back_to_back() {
        let mut chain = FilterChain::new();
        chain.add(KeepClassifications::new(&[2]));
        chain.add(KeepClassifications::new(&[6]));

        assert_eq!(chain.len(), 1);
        assert!(!chain.filter(&make_point(0.0, 0.0, 2)));
        assert!(!chain.filter(&make_point(0.0, 0.0, 6)));
        assert!(chain.filter(&make_point(0.0, 0.0, 5)));
        assert_eq!(chain.counters()[0].0, "keep_classification 2 6");
    }

    #[test]
    fn masks_separated_by_another_criterion_do_not_merge() {
        let mut chain = FilterChain::new();
        chain.add(KeepClassifications::new(&[2]));
        chain.add(KeepFirstReturn);
        chain.add(KeepClassifications::new(&[6]));

        assert_eq!(chain.len(), 3);
        assert!(chain.filter(&make_point(0.0, 0.0, 2)));
    }

    #[test]
    fn and_is_order_independent_for_stateless_criteria() {
        let build = |swap: bool| {
            let mut chain = FilterChain::new();
            let a = KeepXY::new(0.0, 0.0, 10.0, 10.0);
            let b = KeepClassifications::new(&[2, 3]);
            if swap {
                chain.add(b);
                chain.add(a);
            } else {
                chain.add(a);
                chain.add(b);
            }
            chain.and().unwrap();
            chain
        };
        let mut ab = build(false);
        let mut ba = build(true);
        assert_eq!(ab.len(), 1);

        for x in [-5.0, 0.0, 5.0, 9.99, 10.0, 15.0] {
            for class in [1, 2, 3, 4] {
                let point = make_point(x, 5.0, class);
                assert_eq!(ab.filter(&point), ba.filter(&point), "{x} {class}");
            }
        }
    }

    #[test]
    fn or_rejects_only_when_both_reject() {
        let mut chain = FilterChain::new();
        chain.add(KeepClassifications::new(&[2]));
        chain.add(KeepXY::new(0.0, 0.0, 10.0, 10.0));
        chain.or().unwrap();

        assert!(!chain.filter(&make_point(50.0, 50.0, 2)));
        assert!(!chain.filter(&make_point(5.0, 5.0, 9)));
        assert!(chain.filter(&make_point(50.0, 50.0, 9)));
    }

    #[test]
    fn not_inverts_last_criterion() {
        let mut chain = FilterChain::new();
        chain.add(KeepClassifications::new(&[7]));
        chain.not().unwrap();
        assert!(chain.filter(&make_point(0.0, 0.0, 7)));
        assert!(!chain.filter(&make_point(0.0, 0.0, 2)));
    }

    #[test]
    fn combinators_need_operands() {
        let mut chain = FilterChain::new();
        chain.add(KeepFirstReturn);
        assert!(matches!(
            chain.and(),
            Err(FilterError::MissingOperands("filter_and", 2))
        ));
        assert_eq!(chain.len(), 1);
        assert!(FilterChain::new().not().is_err());
    }

    #[test]
    fn reset_restarts_state_but_keeps_counters() {
        let mut chain = FilterChain::new();
        chain.add(KeepEveryNth::new(2).unwrap());

        let point = make_point(0.0, 0.0, 2);
        let first: Vec<bool> = (0..4).map(|_| chain.filter(&point)).collect();
        chain.reset();
        let second: Vec<bool> = (0..4).map(|_| chain.filter(&point)).collect();

        assert_eq!(first, second);
        assert_eq!(chain.total_rejected(), 4);
    }

    #[test]
    fn hint_never_loses_bits() {
        let mut chain = FilterChain::new();
        let mut previous = chain.decompress_hint();
        let criteria: Vec<Box<dyn Criterion>> = vec![
            Box::new(KeepGpsTimeRange::new(0.0, 10.0)),
            Box::new(KeepXY::new(0.0, 0.0, 1.0, 1.0)),
            Box::new(KeepIntensityRange::new(0, 100)),
            Box::new(KeepClassifications::new(&[1])),
            Box::new(KeepAttributeRange::new(2, 0.0, 1.0)),
        ];
        for criterion in criteria {
            chain.add_boxed(criterion);
            let hint = chain.decompress_hint();
            assert!(hint.contains(previous));
            previous = hint;
        }
        assert!(previous.contains(FieldMask::GPS_TIME | FieldMask::INTENSITY));
        assert!(previous.contains(FieldMask::CLASSIFICATION));
        assert!(previous.needs_extra_bytes());
    }

    #[test]
    fn cloned_chain_has_independent_state() {
        let mut chain = FilterChain::new();
        chain.add(KeepEveryNth::new(3).unwrap());
        let point = make_point(0.0, 0.0, 2);
        chain.filter(&point);

        let mut copy = chain.clone();
        copy.reset();
        copy.clear_counters();
        assert_eq!(chain.total_rejected(), 1);
        assert!(copy.filter(&point));
        assert!(chain.filter(&point));
        assert!(!chain.filter(&point));
    }
}
