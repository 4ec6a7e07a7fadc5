use pcd_core::pointcloud::{header::BoundingVolume, header::Header, quantize::Quantizer};
use serde::{Deserialize, Serialize};

/// Spatial query restricting which points a reader delivers.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryRegion {
    #[default]
    None,
    /// Square tile anchored at its lower-left corner, half-open on the upper edges.
    Tile { ll_x: f64, ll_y: f64, size: f64 },
    Circle {
        center_x: f64,
        center_y: f64,
        radius: f64,
    },
    Rectangle {
        min_x: f64,
        min_y: f64,
        max_x: f64,
        max_y: f64,
    },
}

impl QueryRegion {
    pub fn is_none(&self) -> bool {
        matches!(self, QueryRegion::None)
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        match *self {
            QueryRegion::None => true,
            QueryRegion::Tile { ll_x, ll_y, size } => {
                ll_x <= x && x < ll_x + size && ll_y <= y && y < ll_y + size
            }
            QueryRegion::Circle {
                center_x,
                center_y,
                radius,
            } => {
                let dx = x - center_x;
                let dy = y - center_y;
                dx * dx + dy * dy <= radius * radius
            }
            QueryRegion::Rectangle {
                min_x,
                min_y,
                max_x,
                max_y,
            } => min_x <= x && x <= max_x && min_y <= y && y <= max_y,
        }
    }

    /// Axis-aligned box enclosing the region in the xy plane; z is unbounded.
    pub fn bounding_box(&self) -> Option<BoundingVolume> {
        let (min_x, min_y, max_x, max_y) = match *self {
            QueryRegion::None => return None,
            QueryRegion::Tile { ll_x, ll_y, size } => (ll_x, ll_y, ll_x + size, ll_y + size),
            QueryRegion::Circle {
                center_x,
                center_y,
                radius,
            } => (
                center_x - radius,
                center_y - radius,
                center_x + radius,
                center_y + radius,
            ),
            QueryRegion::Rectangle {
                min_x,
                min_y,
                max_x,
                max_y,
            } => (min_x, min_y, max_x, max_y),
        };
        Some(BoundingVolume {
            min: [min_x, min_y, f64::MIN],
            max: [max_x, max_y, f64::MAX],
        })
    }

    /// Unknown (empty) bounds are assumed to intersect.
    pub fn intersects(&self, bounds: &BoundingVolume) -> bool {
        if bounds.is_empty() {
            return true;
        }
        match self.bounding_box() {
            None => true,
            Some(region) => {
                let overlaps = region.intersects_xy(bounds);
                match *self {
                    // The tile excludes its upper edges.
                    QueryRegion::Tile { ll_x, ll_y, size } => {
                        overlaps && bounds.min[0] < ll_x + size && bounds.min[1] < ll_y + size
                    }
                    _ => overlaps,
                }
            }
        }
    }

    /// Intersection of `bounds` with the region box. The open upper tile edges are
    /// pulled in by one quantization step.
    pub fn narrow(&self, bounds: &BoundingVolume, quantizer: &Quantizer) -> BoundingVolume {
        let Some(region) = self.bounding_box() else {
            return *bounds;
        };
        let mut narrowed = *bounds;
        for axis in 0..2 {
            let mut upper = region.max[axis];
            if matches!(self, QueryRegion::Tile { .. }) {
                upper -= quantizer.scale[axis];
            }
            narrowed.min[axis] = narrowed.min[axis].max(region.min[axis]);
            narrowed.max[axis] = narrowed.max[axis].min(upper);
        }
        narrowed
    }
}

/// The active region of a reader together with the header bounds it replaced.
#[derive(Debug, Clone, Default)]
pub struct RegionState {
    region: QueryRegion,
    original: Option<BoundingVolume>,
    intersects: bool,
}

impl RegionState {
    /// Installs `region`, narrowing the header bounds when they overlap it.
    /// Returns whether the source can contain any point of the region.
    pub fn install(&mut self, region: QueryRegion, header: &mut Header) -> bool {
        self.clear(header);
        if region.is_none() {
            self.intersects = true;
            return true;
        }

        self.region = region;
        self.intersects = region.intersects(&header.bounds);
        if self.intersects && !header.bounds.is_empty() {
            self.original = Some(header.bounds);
            header.bounds = region.narrow(&header.bounds, &header.quantizer);
        } else if !self.intersects {
            log::debug!(
                "region {:?} does not intersect bounds {:?}",
                region,
                header.bounds
            );
        }
        self.intersects
    }

    /// Removes the region and restores the bounds exactly as they were.
    pub fn clear(&mut self, header: &mut Header) {
        if let Some(original) = self.original.take() {
            header.bounds = original;
        }
        self.region = QueryRegion::None;
        self.intersects = true;
    }

    pub fn region(&self) -> &QueryRegion {
        &self.region
    }

    pub fn is_active(&self) -> bool {
        !self.region.is_none()
    }

    /// False when the region cannot contain any point of the source.
    pub fn intersects(&self) -> bool {
        self.intersects || self.region.is_none()
    }

    pub fn contains(&self, x: f64, y: f64) -> bool {
        self.region.contains(x, y)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    fn header_with_bounds(min: [f64; 3], max: [f64; 3]) -> Header {
        Header {
            bounds: BoundingVolume { min, max },
            ..Default::default()
        }
    }

    #[test]
    fn tile_is_half_open() {
        let tile = QueryRegion::Tile {
            ll_x: 1000.0,
            ll_y: 2000.0,
            size: 10.0,
        };
        assert!(tile.contains(1005.0, 2005.0));
        assert!(tile.contains(1000.0, 2000.0));
        assert!(!tile.contains(1010.0, 2005.0));
        assert!(!tile.contains(1005.0, 2010.0));
    }

    #[test]
    fn circle_and_rectangle_are_closed() {
        let circle = QueryRegion::Circle {
            center_x: 0.0,
            center_y: 0.0,
            radius: 5.0,
        };
        assert!(circle.contains(3.0, 4.0));
        assert!(!circle.contains(3.0, 4.1));

        let rectangle = QueryRegion::Rectangle {
            min_x: 0.0,
            min_y: 0.0,
            max_x: 1.0,
            max_y: 2.0,
        };
        assert!(rectangle.contains(1.0, 2.0));
        assert!(!rectangle.contains(1.01, 2.0));
        assert!(QueryRegion::None.contains(f64::MAX, f64::MIN));
    }

    #[test]
    fn narrowing_and_restoring_is_exact() {
        let mut header = header_with_bounds([990.0, 1990.0, 0.0], [1020.0, 2020.0, 50.0]);
        let original = header.bounds;
        let mut state = RegionState::default();

        let tile = QueryRegion::Tile {
            ll_x: 1000.0,
            ll_y: 2000.0,
            size: 10.0,
        };
        assert!(state.install(tile, &mut header));
        assert_relative_eq!(header.bounds.min[0], 1000.0);
        assert_relative_eq!(header.bounds.max[0], 1009.99);
        assert_relative_eq!(header.bounds.max[1], 2009.99);
        assert_relative_eq!(header.bounds.max[2], 50.0);

        let circle = QueryRegion::Circle {
            center_x: 1000.0,
            center_y: 2000.0,
            radius: 5.0,
        };
        assert!(state.install(circle, &mut header));
        assert_relative_eq!(header.bounds.min[0], 995.0);

        state.clear(&mut header);
        assert_eq!(header.bounds, original);
        assert!(!state.is_active());
    }

    #[test]
    fn disjoint_region_leaves_header_untouched() {
        let mut header = header_with_bounds([0.0, 0.0, 0.0], [10.0, 10.0, 1.0]);
        let original = header.bounds;
        let mut state = RegionState::default();

        let far = QueryRegion::Rectangle {
            min_x: 100.0,
            min_y: 100.0,
            max_x: 200.0,
            max_y: 200.0,
        };
        assert!(!state.install(far, &mut header));
        assert!(!state.intersects());
        assert_eq!(header.bounds, original);

        // A tile whose lower-left corner sits on the max edge sees nothing.
        let edge = QueryRegion::Tile {
            ll_x: 10.0,
            ll_y: 0.0,
            size: 5.0,
        };
        assert!(state.install(edge, &mut header));
        let beyond = QueryRegion::Tile {
            ll_x: 10.5,
            ll_y: 0.0,
            size: 5.0,
        };
        assert!(!state.install(beyond, &mut header));
        assert_eq!(header.bounds, original);
    }

    #[test]
    fn unknown_bounds_intersect() {
        let mut header = Header::default();
        let mut state = RegionState::default();
        let tile = QueryRegion::Tile {
            ll_x: 0.0,
            ll_y: 0.0,
            size: 1.0,
        };
        assert!(state.install(tile, &mut header));
        assert!(header.bounds.is_empty());
    }
}
