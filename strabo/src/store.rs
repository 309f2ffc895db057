use wire::{Block, Metadata, Predicate, QuerySpec, RecordRow};

use crate::error::{Error, Result};
use crate::grid::GridPolygon;
use crate::grid;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// One indexed block: payload file on disk plus the metadata needed
/// for block level matching.
#[derive(Clone, Debug)]
pub struct BlockEntry {
    pub id: String,
    pub path: PathBuf,
    pub size: u64,
    pub geohash: String,
    pub metadata: Metadata,
}

/// Per filesystem block store. Payloads live under
/// `directory/<geohash>/<timestamp>-<sequence>.blk` with a metadata
/// sidecar next to each; the sidecars rebuild the index at startup.
pub struct BlockStore {
    directory: PathBuf,
    entries: Vec<BlockEntry>,
    sequence: u64,
}

impl BlockStore {
    pub fn open(directory: &Path) -> Result<BlockStore> {
        std::fs::create_dir_all(directory)?;

        // parse existing block sidecars
        let mut entries = Vec::new();
        let expression = format!("{}/*/*.meta",
            directory.to_string_lossy());
        for entry in glob::glob(&expression)
                .map_err(|e| Error::Filesystem(e.to_string()))? {
            let path = entry
                .map_err(|e| Error::Filesystem(e.to_string()))?;

            match read_sidecar(&path) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("failed to parse block sidecar \
                    '{:?}': {}", path, e),
            }
        }

        entries.sort_by(|a, b| a.id.cmp(&b.id));
        let sequence = entries.len() as u64;

        Ok(BlockStore {
            directory: directory.to_path_buf(),
            entries: entries,
            sequence: sequence,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn store(&mut self, block: &Block, geohash: &str)
            -> Result<&BlockEntry> {
        let mut directory = self.directory.clone();
        directory.push(geohash);
        if !directory.exists() {
            std::fs::create_dir(&directory)?;
        }

        let stem = format!("{}-{}",
            block.metadata.timestamp_ms, self.sequence);
        self.sequence += 1;

        // payload first, sidecar second; a missing sidecar means the
        // block is invisible rather than unreadable
        let mut path = directory.clone();
        path.push(&stem);
        path.set_extension("blk");
        std::fs::write(&path, &block.payload)?;

        let mut sidecar_path = directory;
        sidecar_path.push(&stem);
        sidecar_path.set_extension("meta");
        let buffer = bincode::serialize(&block.metadata)?;
        std::fs::write(&sidecar_path, &buffer)?;

        let entry = BlockEntry {
            id: format!("{}/{}", geohash, stem),
            path: path,
            size: block.payload.len() as u64,
            geohash: geohash.to_string(),
            metadata: block.metadata.clone(),
        };

        self.entries.push(entry);
        Ok(self.entries.last().unwrap())
    }

    /// Block level matching: spatial membership on the projected
    /// grid, half open time window, then feature and metadata
    /// predicates.
    pub fn match_blocks(&self, query: &QuerySpec)
            -> Result<Vec<&BlockEntry>> {
        let polygon = query.polygon.as_ref()
            .map(|polygon| GridPolygon::new(polygon));

        let mut matched = Vec::new();
        for entry in &self.entries {
            if let Some(polygon) = &polygon {
                let spatial = match &entry.metadata.spatial {
                    Some(spatial) => spatial,
                    None => continue,
                };

                if !polygon.contains_point(&grid::project(spatial)) {
                    continue;
                }
            }

            if let Some(window) = &query.time {
                if !window.contains(entry.metadata.timestamp_ms) {
                    continue;
                }
            }

            if !matches_features(&entry.metadata,
                    &query.feature_predicates)? {
                continue;
            }

            if !matches_metadata(entry, &query.metadata_predicates)? {
                continue;
            }

            matched.push(entry);
        }

        Ok(matched)
    }

    pub fn rows(&self, filesystem: &str, entries: &[&BlockEntry])
            -> Vec<RecordRow> {
        entries.iter()
            .map(|entry| RecordRow {
                filesystem: filesystem.to_string(),
                path: entry.path.to_string_lossy().to_string(),
                size: entry.size,
                timestamp_ms: entry.metadata.timestamp_ms,
                geohash: entry.geohash.clone(),
            })
            .collect()
    }

    /// Per geohash block counts plus the covered time range, for
    /// overview metadata replies.
    pub fn summary(&self) -> StoreSummary {
        let mut extents: Vec<(String, u64)> = Vec::new();
        let mut time_range: Option<(i64, i64)> = None;

        for entry in &self.entries {
            match extents.iter_mut()
                    .find(|(geohash, _)| geohash == &entry.geohash) {
                Some((_, count)) => *count += 1,
                None => extents.push((entry.geohash.clone(), 1)),
            }

            let timestamp = entry.metadata.timestamp_ms;
            time_range = Some(match time_range {
                Some((lo, hi)) =>
                    (lo.min(timestamp), hi.max(timestamp)),
                None => (timestamp, timestamp),
            });
        }

        extents.sort();

        StoreSummary {
            block_count: self.entries.len() as u64,
            extents: extents,
            time_range: time_range,
        }
    }
}

pub struct StoreSummary {
    pub block_count: u64,
    pub extents: Vec<(String, u64)>,
    pub time_range: Option<(i64, i64)>,
}

fn read_sidecar(sidecar_path: &Path) -> Result<BlockEntry> {
    let buffer = std::fs::read(sidecar_path)?;
    let metadata: Metadata = bincode::deserialize(&buffer)?;

    let mut path = sidecar_path.to_path_buf();
    path.set_extension("blk");
    let size = std::fs::metadata(&path)?.len();

    let geohash = sidecar_path.parent()
        .and_then(|parent| parent.file_name())
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    let stem = sidecar_path.file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_default();

    Ok(BlockEntry {
        id: format!("{}/{}", geohash, stem),
        path: path,
        size: size,
        geohash: geohash,
        metadata: metadata,
    })
}

fn matches_features(metadata: &Metadata, predicates: &[Predicate])
        -> Result<bool> {
    for predicate in predicates {
        let value = match metadata.feature(&predicate.name) {
            Some(value) => value,
            None => return Ok(false),
        };

        if !predicate.matches(value)? {
            return Ok(false);
        }
    }

    Ok(true)
}

// reserved pseudo fields: timestamp compares as a long, geohash
// equality matches hierarchically by prefix
fn matches_metadata(entry: &BlockEntry, predicates: &[Predicate])
        -> Result<bool> {
    for predicate in predicates {
        let matched = match predicate.name.as_str() {
            "timestamp" => predicate.matches(
                &wire::FeatureValue::Long(
                    entry.metadata.timestamp_ms))?,
            "geohash" => {
                let value = predicate.value.as_string()?;
                match predicate.op {
                    wire::CompareOp::Eq =>
                        entry.geohash.starts_with(value),
                    _ => predicate.matches(
                        &wire::FeatureValue::String(
                            entry.geohash.clone()))?,
                }
            },
            x => return Err(Error::Validation(format!(
                "unknown metadata field '{}'", x))),
        };

        if !matched {
            return Ok(false);
        }
    }

    Ok(true)
}

/// Spool rows to a JSON file; pure over its inputs so it can run on
/// a worker thread.
pub fn spool_rows(path: &Path, rows: &[RecordRow])
        -> Result<wire::SpoolStats> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, rows)?;
    writer.flush()?;

    let size = std::fs::metadata(path)?.len();
    Ok(wire::SpoolStats {
        path: path.to_string_lossy().to_string(),
        size: size,
        count: rows.len() as u64,
    })
}
