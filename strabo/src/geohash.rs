use wire::{Coordinate, SpatialRange};

use crate::error::{Error, Result};
use crate::grid::{GridPolygon, GridRect};

use std::collections::{HashSet, VecDeque};

pub const ALPHABET: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";
pub const MAX_PRECISION: usize = 12;

fn char_index(character: u8) -> Result<u64> {
    match ALPHABET.iter().position(|x| *x == character) {
        Some(index) => Ok(index as u64),
        None => Err(Error::Validation(format!(
            "invalid geohash character '{}'", character as char))),
    }
}

// wrap out of range coordinates modulo the full extent
fn normalize(coordinate: &Coordinate) -> Coordinate {
    let mut lat = coordinate.lat;
    let mut lon = coordinate.lon;

    while lat > 90.0 {
        lat -= 180.0;
    }
    while lat < -90.0 {
        lat += 180.0;
    }

    while lon > 180.0 {
        lon -= 360.0;
    }
    while lon < -180.0 {
        lon += 360.0;
    }

    Coordinate::new(lat, lon)
}

fn check_precision(precision: usize) -> Result<()> {
    if precision == 0 || precision > MAX_PRECISION {
        return Err(Error::Validation(format!(
            "precision {} outside [1, {}]", precision, MAX_PRECISION)));
    }

    Ok(())
}

/// Encode a coordinate into a geohash of `precision` characters.
///
/// Bits interleave longitude (even positions) and latitude (odd),
/// bisecting with a strict `>` so boundary points fall into the
/// south/west cell.
pub fn encode(coordinate: &Coordinate, precision: usize)
        -> Result<String> {
    check_precision(precision)?;
    let coordinate = normalize(coordinate);

    let (mut lat_lo, mut lat_hi) = (-90.0, 90.0);
    let (mut lon_lo, mut lon_hi) = (-180.0, 180.0);

    let mut geohash = String::with_capacity(precision);
    let mut buffer = 0u8;
    for i in 0..5 * precision {
        let bit = if i % 2 == 0 {
            let mid = (lon_lo + lon_hi) / 2.0;
            if coordinate.lon > mid {
                lon_lo = mid;
                1
            } else {
                lon_hi = mid;
                0
            }
        } else {
            let mid = (lat_lo + lat_hi) / 2.0;
            if coordinate.lat > mid {
                lat_lo = mid;
                1
            } else {
                lat_hi = mid;
                0
            }
        };

        buffer = (buffer << 1) | bit;
        if i % 5 == 4 {
            geohash.push(ALPHABET[buffer as usize] as char);
            buffer = 0;
        }
    }

    Ok(geohash)
}

/// Decode a geohash into the rectangle it denotes.
pub fn decode(geohash: &str) -> Result<SpatialRange> {
    if geohash.is_empty() || geohash.len() > MAX_PRECISION {
        return Err(Error::Validation(format!(
            "geohash length {} outside [1, {}]",
            geohash.len(), MAX_PRECISION)));
    }

    let (mut lat_lo, mut lat_hi) = (-90.0, 90.0);
    let (mut lon_lo, mut lon_hi) = (-180.0, 180.0);

    let mut bit_index = 0;
    for character in geohash.bytes() {
        let value = char_index(character)?;
        for offset in (0..5).rev() {
            let bit = (value >> offset) & 1;
            if bit_index % 2 == 0 {
                let mid = (lon_lo + lon_hi) / 2.0;
                if bit == 1 {
                    lon_lo = mid;
                } else {
                    lon_hi = mid;
                }
            } else {
                let mid = (lat_lo + lat_hi) / 2.0;
                if bit == 1 {
                    lat_lo = mid;
                } else {
                    lat_hi = mid;
                }
            }

            bit_index += 1;
        }
    }

    Ok(SpatialRange {
        lat_lo: lat_lo,
        lat_hi: lat_hi,
        lon_lo: lon_lo,
        lon_hi: lon_hi,
    })
}

/// Interpret up to twelve characters as a 60 bit routing key,
/// 5 bits per character MSB first. Order preserving per length.
pub fn hash_to_long(geohash: &str) -> Result<u64> {
    if !geohash.is_ascii() {
        return Err(Error::Validation(format!(
            "invalid geohash '{}'", geohash)));
    }

    let truncated = &geohash[..geohash.len().min(MAX_PRECISION)];

    let mut hash = 0u64;
    for character in truncated.bytes() {
        hash = (hash << 5) | char_index(character)?;
    }

    Ok(hash)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    NorthWest,
    North,
    NorthEast,
    West,
    East,
    SouthWest,
    South,
    SouthEast,
}

pub const DIRECTIONS: [Direction; 8] = [
    Direction::NorthWest,
    Direction::North,
    Direction::NorthEast,
    Direction::West,
    Direction::East,
    Direction::SouthWest,
    Direction::South,
    Direction::SouthEast,
];

impl Direction {
    pub fn opposite(&self) -> Direction {
        match self {
            Direction::NorthWest => Direction::SouthEast,
            Direction::North => Direction::South,
            Direction::NorthEast => Direction::SouthWest,
            Direction::West => Direction::East,
            Direction::East => Direction::West,
            Direction::SouthWest => Direction::NorthEast,
            Direction::South => Direction::North,
            Direction::SouthEast => Direction::NorthWest,
        }
    }

    // north and south step the longitude axis, east and west the
    // latitude axis; peers and stored covers agree on this orientation
    fn offsets(&self) -> (f64, f64) {
        match self {
            Direction::NorthWest => (-1.0, 1.0),
            Direction::North => (0.0, 1.0),
            Direction::NorthEast => (1.0, 1.0),
            Direction::West => (-1.0, 0.0),
            Direction::East => (1.0, 0.0),
            Direction::SouthWest => (-1.0, -1.0),
            Direction::South => (0.0, -1.0),
            Direction::SouthEast => (1.0, -1.0),
        }
    }
}

/// Neighbor at the same precision, computed by re-encoding the cell
/// center offset by one cell extent. Antimeridian crossings wrap
/// through coordinate normalization.
pub fn neighbor(geohash: &str, direction: Direction) -> Result<String> {
    let range = decode(geohash)?;
    let center = range.center();
    let height = range.lat_hi - range.lat_lo;
    let width = range.lon_hi - range.lon_lo;

    let (lat_step, lon_step) = direction.offsets();
    let offset = Coordinate::new(center.lat + lat_step * height,
        center.lon + lon_step * width);

    encode(&offset, geohash.len())
}

pub fn neighbors(geohash: &str) -> Result<Vec<String>> {
    DIRECTIONS.iter()
        .map(|direction| neighbor(geohash, *direction))
        .collect()
}

/// Fixed precision polygon cover: BFS flood fill over neighbors from
/// the cell of the first vertex, keeping every cell whose rectangle
/// intersects the polygon on the projected grid.
pub fn cover_polygon(polygon: &[Coordinate], precision: usize)
        -> Result<Vec<String>> {
    check_precision(precision)?;
    if polygon.is_empty() {
        return Err(Error::Validation(
            "empty polygon".to_string()));
    }

    let grid_polygon = GridPolygon::new(polygon);
    let start = encode(&polygon[0], precision)?;

    // single cell short circuit
    let start_rect = GridRect::from_range(&decode(&start)?);
    if let Some(bounds) = grid_polygon.bounding_rect() {
        if start_rect.contains_rect(&bounds) {
            return Ok(vec![start]);
        }
    }

    let mut visited = HashSet::new();
    let mut queue = VecDeque::new();
    visited.insert(start.clone());
    queue.push_back(start);

    let mut cover = Vec::new();
    while let Some(geohash) = queue.pop_front() {
        let rect = GridRect::from_range(&decode(&geohash)?);
        if !grid_polygon.intersects_rect(&rect) {
            continue;
        }

        for adjacent in neighbors(&geohash)? {
            if visited.insert(adjacent.clone()) {
                queue.push_back(adjacent);
            }
        }

        cover.push(geohash);
    }

    cover.sort();
    Ok(cover)
}

/// Variable length cover by prefix refinement: bisect cells bit by
/// bit, stop at a cell the polygon fully contains, emit only at
/// character boundaries. Cheaper than the flood fill for sparse
/// polygons spanning many cells.
pub fn cover_polygon_prefixes(polygon: &[Coordinate], precision: usize)
        -> Result<Vec<String>> {
    check_precision(precision)?;
    if polygon.is_empty() {
        return Err(Error::Validation(
            "empty polygon".to_string()));
    }

    let grid_polygon = GridPolygon::new(polygon);
    let mut cover = Vec::new();
    refine(&grid_polygon, 0, 0, 5 * precision as u8, &mut cover);

    cover.sort();
    Ok(cover)
}

fn prefix_range(bits: u64, bit_length: u8) -> SpatialRange {
    let (mut lat_lo, mut lat_hi) = (-90.0, 90.0);
    let (mut lon_lo, mut lon_hi) = (-180.0, 180.0);

    for i in 0..bit_length {
        let bit = (bits >> (bit_length - i - 1)) & 1;
        if i % 2 == 0 {
            let mid = (lon_lo + lon_hi) / 2.0;
            if bit == 1 {
                lon_lo = mid;
            } else {
                lon_hi = mid;
            }
        } else {
            let mid = (lat_lo + lat_hi) / 2.0;
            if bit == 1 {
                lat_lo = mid;
            } else {
                lat_hi = mid;
            }
        }
    }

    SpatialRange {
        lat_lo: lat_lo,
        lat_hi: lat_hi,
        lon_lo: lon_lo,
        lon_hi: lon_hi,
    }
}

fn prefix_string(bits: u64, bit_length: u8) -> String {
    let characters = bit_length / 5;
    (0..characters)
        .map(|i| {
            let shift = bit_length - 5 * (i + 1);
            ALPHABET[((bits >> shift) & 0x1f) as usize] as char
        })
        .collect()
}

fn refine(polygon: &GridPolygon, bits: u64, bit_length: u8,
        max_bits: u8, cover: &mut Vec<String>) {
    let rect = GridRect::from_range(&prefix_range(bits, bit_length));
    if !polygon.intersects_rect(&rect) {
        return;
    }

    if bit_length > 0 && bit_length % 5 == 0 {
        if bit_length == max_bits || polygon.contains_rect(&rect) {
            cover.push(prefix_string(bits, bit_length));
            return;
        }
    }

    refine(polygon, bits << 1, bit_length + 1, max_bits, cover);
    refine(polygon, (bits << 1) | 1, bit_length + 1, max_bits, cover);
}
