//! Projected integer grid used for all polygon intersection tests.
//! Coordinates map onto a 2^30 wide grid so cell relations are exact
//! integer predicates, identical on every node.

use wire::{Coordinate, SpatialRange};

pub const GRID_WIDTH: i64 = 1 << 30;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GridPoint {
    pub x: i64,
    pub y: i64,
}

pub fn project(coordinate: &Coordinate) -> GridPoint {
    GridPoint {
        x: ((coordinate.lon + 180.0)
            * GRID_WIDTH as f64 / 360.0) as i64,
        y: ((90.0 - coordinate.lat)
            * GRID_WIDTH as f64 / 180.0) as i64,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GridRect {
    pub x_lo: i64,
    pub x_hi: i64,
    pub y_lo: i64,
    pub y_hi: i64,
}

impl GridRect {
    pub fn from_range(range: &SpatialRange) -> GridRect {
        // y axis is inverted, the north edge has the low y value
        let nw = project(&Coordinate::new(range.lat_hi, range.lon_lo));
        let se = project(&Coordinate::new(range.lat_lo, range.lon_hi));

        GridRect {
            x_lo: nw.x,
            x_hi: se.x,
            y_lo: nw.y,
            y_hi: se.y,
        }
    }

    pub fn contains_point(&self, point: &GridPoint) -> bool {
        point.x >= self.x_lo && point.x <= self.x_hi
            && point.y >= self.y_lo && point.y <= self.y_hi
    }

    pub fn contains_rect(&self, other: &GridRect) -> bool {
        other.x_lo >= self.x_lo && other.x_hi <= self.x_hi
            && other.y_lo >= self.y_lo && other.y_hi <= self.y_hi
    }

    pub fn corners(&self) -> [GridPoint; 4] {
        [
            GridPoint { x: self.x_lo, y: self.y_lo },
            GridPoint { x: self.x_hi, y: self.y_lo },
            GridPoint { x: self.x_hi, y: self.y_hi },
            GridPoint { x: self.x_lo, y: self.y_hi },
        ]
    }

    pub fn edges(&self) -> [(GridPoint, GridPoint); 4] {
        let corners = self.corners();
        [
            (corners[0], corners[1]),
            (corners[1], corners[2]),
            (corners[2], corners[3]),
            (corners[3], corners[0]),
        ]
    }
}

#[derive(Clone, Debug)]
pub struct GridPolygon {
    points: Vec<GridPoint>,
}

impl GridPolygon {
    pub fn new(coordinates: &[Coordinate]) -> GridPolygon {
        GridPolygon {
            points: coordinates.iter().map(project).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn bounding_rect(&self) -> Option<GridRect> {
        let first = self.points.first()?;
        let mut rect = GridRect {
            x_lo: first.x,
            x_hi: first.x,
            y_lo: first.y,
            y_hi: first.y,
        };

        for point in &self.points[1..] {
            rect.x_lo = rect.x_lo.min(point.x);
            rect.x_hi = rect.x_hi.max(point.x);
            rect.y_lo = rect.y_lo.min(point.y);
            rect.y_hi = rect.y_hi.max(point.y);
        }

        Some(rect)
    }

    fn edges(&self) -> Vec<(GridPoint, GridPoint)> {
        let count = self.points.len();
        if count < 2 {
            return Vec::new();
        }

        (0..count)
            .map(|i| (self.points[i], self.points[(i + 1) % count]))
            .collect()
    }

    // boundary points count as inside
    pub fn contains_point(&self, point: &GridPoint) -> bool {
        for (a, b) in self.edges() {
            if on_segment(&a, &b, point) {
                return true;
            }
        }

        if self.points.len() < 3 {
            return false;
        }

        // ray cast east, counting crossings by y-straddle
        let mut inside = false;
        for (a, b) in self.edges() {
            if (a.y > point.y) != (b.y > point.y) {
                // exact: point.x < a.x + (point.y - a.y)(b.x - a.x)/(b.y - a.y)
                let lhs = (point.x - a.x) * (b.y - a.y);
                let rhs = (point.y - a.y) * (b.x - a.x);
                let crosses = if b.y > a.y {
                    lhs < rhs
                } else {
                    lhs > rhs
                };

                if crosses {
                    inside = !inside;
                }
            }
        }

        inside
    }

    pub fn intersects_rect(&self, rect: &GridRect) -> bool {
        for point in &self.points {
            if rect.contains_point(point) {
                return true;
            }
        }

        for corner in &rect.corners() {
            if self.contains_point(corner) {
                return true;
            }
        }

        for (a, b) in self.edges() {
            for (c, d) in &rect.edges() {
                if segments_intersect(&a, &b, c, d) {
                    return true;
                }
            }
        }

        false
    }

    pub fn contains_rect(&self, rect: &GridRect) -> bool {
        for corner in &rect.corners() {
            if !self.contains_point(corner) {
                return false;
            }
        }

        // an edge crossing means part of the rectangle is outside
        for (a, b) in self.edges() {
            for (c, d) in &rect.edges() {
                if segments_properly_intersect(&a, &b, c, d) {
                    return false;
                }
            }
        }

        true
    }
}

fn orientation(a: &GridPoint, b: &GridPoint, c: &GridPoint) -> i64 {
    let value = (b.x - a.x) * (c.y - a.y) - (b.y - a.y) * (c.x - a.x);
    value.signum()
}

fn on_segment(a: &GridPoint, b: &GridPoint, point: &GridPoint) -> bool {
    orientation(a, b, point) == 0
        && point.x >= a.x.min(b.x) && point.x <= a.x.max(b.x)
        && point.y >= a.y.min(b.y) && point.y <= a.y.max(b.y)
}

pub fn segments_intersect(a: &GridPoint, b: &GridPoint,
        c: &GridPoint, d: &GridPoint) -> bool {
    let o1 = orientation(a, b, c);
    let o2 = orientation(a, b, d);
    let o3 = orientation(c, d, a);
    let o4 = orientation(c, d, b);

    if o1 != o2 && o3 != o4 {
        return true;
    }

    (o1 == 0 && on_segment(a, b, c))
        || (o2 == 0 && on_segment(a, b, d))
        || (o3 == 0 && on_segment(c, d, a))
        || (o4 == 0 && on_segment(c, d, b))
}

// strict crossing, shared endpoints and collinear overlap excluded
fn segments_properly_intersect(a: &GridPoint, b: &GridPoint,
        c: &GridPoint, d: &GridPoint) -> bool {
    let o1 = orientation(a, b, c);
    let o2 = orientation(a, b, d);
    let o3 = orientation(c, d, a);
    let o4 = orientation(c, d, b);

    o1 != o2 && o3 != o4 && o1 != 0 && o2 != 0 && o3 != 0 && o4 != 0
}
