use chrono::{Datelike, TimeZone, Utc};
use wire::{Coordinate, FilesystemDescriptor, Metadata, TemporalType,
    TimeWindow};

use crate::error::{Error, Result};
use crate::geohash;
use crate::hash;
use crate::topology::{Group, NetworkTopology, NodeInfo};

use std::collections::BTreeSet;
use std::sync::Arc;

// polygons whose bounding box spans more cells than this are covered
// by prefix refinement instead of the flood fill
const COVER_FLOOD_LIMIT: u64 = 4096;

pub struct Partitioner {
    topology: Arc<NetworkTopology>,
}

impl Partitioner {
    pub fn new(topology: Arc<NetworkTopology>) -> Partitioner {
        Partitioner {
            topology: topology,
        }
    }

    fn checked_groups(&self) -> Result<&[Group]> {
        let groups = self.topology.groups();
        if groups.is_empty() {
            return Err(Error::Partition(
                "topology has no groups".to_string()));
        }

        for group in groups {
            if group.nodes.is_empty() {
                return Err(Error::Partition(format!(
                    "group '{}' has no nodes", group.name)));
            }
        }

        Ok(groups)
    }

    /// Deterministic single write destination: geohash prefix selects
    /// the group, temporal bucket selects the node within it.
    pub fn locate_data(&self, metadata: &Metadata,
            descriptor: &FilesystemDescriptor) -> Result<NodeInfo> {
        let groups = self.checked_groups()?;

        let spatial_hash = hash::geohash_hash(metadata,
            descriptor.spatial_precision as usize)?;
        let group = &groups[(spatial_hash % groups.len() as u64)
            as usize];

        let temporal = hash::temporal_hash(metadata,
            descriptor.temporal_type)?;
        let index = node_index(temporal, descriptor.nodes_per_group,
            group.nodes.len());

        Ok(group.nodes[index].clone())
    }

    /// Every node whose records could possibly match the partial
    /// metadata. Identical inputs always yield the identical list.
    pub fn find_destinations(&self, polygon: Option<&[Coordinate]>,
            window: Option<&TimeWindow>,
            descriptor: &FilesystemDescriptor)
            -> Result<Vec<NodeInfo>> {
        let groups = self.checked_groups()?;

        let group_indices: Vec<usize> = match polygon {
            Some(polygon) => self.cover_groups(polygon, descriptor,
                groups.len())?.into_iter().collect(),
            None => (0..groups.len()).collect(),
        };

        let bucket_indices = match window {
            Some(window) => Some(bucket_indices(window,
                descriptor.temporal_type,
                descriptor.nodes_per_group)?),
            None => None,
        };

        let mut destinations = Vec::new();
        for group_index in group_indices {
            let group = &groups[group_index];
            match &bucket_indices {
                Some(indices) => {
                    for index in indices {
                        let index = index % group.nodes.len();
                        let node = group.nodes[index].clone();
                        if !destinations.contains(&node) {
                            destinations.push(node);
                        }
                    }
                },
                None => {
                    for node in &group.nodes {
                        if !destinations.contains(node) {
                            destinations.push(node.clone());
                        }
                    }
                },
            }
        }

        Ok(destinations)
    }

    fn cover_groups(&self, polygon: &[Coordinate],
            descriptor: &FilesystemDescriptor, group_count: usize)
            -> Result<BTreeSet<usize>> {
        let precision = descriptor.spatial_precision as usize;

        let cover = if estimate_cell_count(polygon, precision)
                > COVER_FLOOD_LIMIT {
            geohash::cover_polygon_prefixes(polygon, precision)?
        } else {
            geohash::cover_polygon(polygon, precision)?
        };

        let mut indices = BTreeSet::new();
        for cell in &cover {
            for index in
                    group_indices_for_cell(cell, precision,
                        group_count)? {
                indices.insert(index);
            }

            if indices.len() == group_count {
                break;
            }
        }

        Ok(indices)
    }
}

fn node_index(temporal: i64, nodes_per_group: u16,
        group_size: usize) -> usize {
    let index = temporal.rem_euclid(nodes_per_group.max(1) as i64)
        as usize;
    index % group_size
}

// a cell shorter than the routing precision stands for a block of
// consecutive routing keys, so its residues modulo the group count
// are consecutive as well
fn group_indices_for_cell(cell: &str, precision: usize,
        group_count: usize) -> Result<Vec<usize>> {
    let hash = geohash::hash_to_long(cell)?;
    let extra = precision.saturating_sub(cell.len()) as u32;

    let span = (32u128).pow(extra);
    if span >= group_count as u128 {
        return Ok((0..group_count).collect());
    }

    let base = hash << (5 * extra);
    Ok((0..span as u64)
        .map(|suffix| ((base + suffix) % group_count as u64) as usize)
        .collect())
}

fn estimate_cell_count(polygon: &[Coordinate], precision: usize)
        -> u64 {
    let lon_bits = (5 * precision + 1) / 2;
    let lat_bits = 5 * precision / 2;
    let cell_width = 360.0 / (1u64 << lon_bits) as f64;
    let cell_height = 180.0 / (1u64 << lat_bits) as f64;

    let mut lat_lo = f64::MAX;
    let mut lat_hi = f64::MIN;
    let mut lon_lo = f64::MAX;
    let mut lon_hi = f64::MIN;
    for coordinate in polygon {
        lat_lo = lat_lo.min(coordinate.lat);
        lat_hi = lat_hi.max(coordinate.lat);
        lon_lo = lon_lo.min(coordinate.lon);
        lon_hi = lon_hi.max(coordinate.lon);
    }

    if polygon.is_empty() {
        return 0;
    }

    let columns = ((lon_hi - lon_lo) / cell_width).ceil() as u64 + 1;
    let rows = ((lat_hi - lat_lo) / cell_height).ceil() as u64 + 1;
    columns.saturating_mul(rows)
}

// every temporal bucket intersecting the window contributes one
// intra group index; once every index appears the scan stops
fn bucket_indices(window: &TimeWindow, temporal_type: TemporalType,
        nodes_per_group: u16) -> Result<BTreeSet<usize>> {
    let nodes_per_group = nodes_per_group.max(1);

    let mut indices = BTreeSet::new();
    let mut bucket =
        hash::truncate_timestamp(window.start_ms, temporal_type)?;
    while bucket < window.end_ms
            && indices.len() < nodes_per_group as usize {
        indices.insert(bucket.rem_euclid(nodes_per_group as i64)
            as usize);
        bucket = next_bucket(bucket, temporal_type)?;
    }

    Ok(indices)
}

fn next_bucket(bucket_ms: i64, temporal_type: TemporalType)
        -> Result<i64> {
    match temporal_type {
        TemporalType::Hour => Ok(bucket_ms + 3600 * 1000),
        TemporalType::Day => Ok(bucket_ms + 86400 * 1000),
        TemporalType::Month | TemporalType::Year => {
            let datetime = match Utc.timestamp_millis_opt(bucket_ms)
                    .single() {
                Some(datetime) => datetime,
                None => return Err(Error::Hash(format!(
                    "invalid bucket {}", bucket_ms))),
            };

            let (year, month) = match temporal_type {
                TemporalType::Month if datetime.month() == 12 =>
                    (datetime.year() + 1, 1),
                TemporalType::Month =>
                    (datetime.year(), datetime.month() + 1),
                _ => (datetime.year() + 1, 1),
            };

            match Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
                    .single() {
                Some(next) => Ok(next.timestamp_millis()),
                None => Err(Error::Hash(format!(
                    "invalid bucket {}", bucket_ms))),
            }
        },
    }
}
