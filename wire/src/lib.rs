use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::cmp::Ordering;
use std::io::{Read, Write};

// frames larger than this are assumed corrupt
pub const MAX_FRAME_LENGTH: u32 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("frame length {0} exceeds maximum {MAX_FRAME_LENGTH}")]
    FrameTooLarge(u32),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("feature type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: &'static str, found: &'static str },
    #[error("incomparable values: {0} vs {1}")]
    Incomparable(&'static str, &'static str),
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> Coordinate {
        Coordinate {
            lat: lat,
            lon: lon,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpatialRange {
    pub lat_lo: f64,
    pub lat_hi: f64,
    pub lon_lo: f64,
    pub lon_hi: f64,
}

impl SpatialRange {
    pub fn contains(&self, coordinate: &Coordinate) -> bool {
        coordinate.lat >= self.lat_lo && coordinate.lat <= self.lat_hi
            && coordinate.lon >= self.lon_lo
            && coordinate.lon <= self.lon_hi
    }

    pub fn center(&self) -> Coordinate {
        Coordinate::new((self.lat_lo + self.lat_hi) / 2.0,
            (self.lon_lo + self.lon_hi) / 2.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemporalType {
    Hour,
    Day,
    Month,
    Year,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FeatureValue {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl FeatureValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            FeatureValue::Int(_) => "int",
            FeatureValue::Long(_) => "long",
            FeatureValue::Float(_) => "float",
            FeatureValue::Double(_) => "double",
            FeatureValue::String(_) => "string",
            FeatureValue::Bytes(_) => "bytes",
        }
    }

    pub fn as_int(&self) -> Result<i32, WireError> {
        match self {
            FeatureValue::Int(value) => Ok(*value),
            x => Err(WireError::TypeMismatch {
                expected: "int",
                found: x.type_name(),
            }),
        }
    }

    pub fn as_long(&self) -> Result<i64, WireError> {
        match self {
            FeatureValue::Long(value) => Ok(*value),
            x => Err(WireError::TypeMismatch {
                expected: "long",
                found: x.type_name(),
            }),
        }
    }

    pub fn as_float(&self) -> Result<f32, WireError> {
        match self {
            FeatureValue::Float(value) => Ok(*value),
            x => Err(WireError::TypeMismatch {
                expected: "float",
                found: x.type_name(),
            }),
        }
    }

    pub fn as_double(&self) -> Result<f64, WireError> {
        match self {
            FeatureValue::Double(value) => Ok(*value),
            x => Err(WireError::TypeMismatch {
                expected: "double",
                found: x.type_name(),
            }),
        }
    }

    pub fn as_string(&self) -> Result<&str, WireError> {
        match self {
            FeatureValue::String(value) => Ok(value),
            x => Err(WireError::TypeMismatch {
                expected: "string",
                found: x.type_name(),
            }),
        }
    }

    pub fn as_bytes(&self) -> Result<&[u8], WireError> {
        match self {
            FeatureValue::Bytes(value) => Ok(value),
            x => Err(WireError::TypeMismatch {
                expected: "bytes",
                found: x.type_name(),
            }),
        }
    }

    pub fn numeric(&self) -> Option<f64> {
        match self {
            FeatureValue::Int(value) => Some(*value as f64),
            FeatureValue::Long(value) => Some(*value as f64),
            FeatureValue::Float(value) => Some(*value as f64),
            FeatureValue::Double(value) => Some(*value),
            _ => None,
        }
    }

    // numeric variants compare through f64, strings lexicographically,
    // bytes only by equality
    pub fn compare(&self, other: &FeatureValue)
            -> Result<Option<Ordering>, WireError> {
        if let (Some(a), Some(b)) = (self.numeric(), other.numeric()) {
            return Ok(a.partial_cmp(&b));
        }

        match (self, other) {
            (FeatureValue::String(a), FeatureValue::String(b)) =>
                Ok(Some(a.cmp(b))),
            (FeatureValue::Bytes(a), FeatureValue::Bytes(b)) =>
                Ok(if a == b { Some(Ordering::Equal) } else { None }),
            (a, b) => Err(WireError::Incomparable(
                a.type_name(), b.type_name())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub name: String,
    pub value: FeatureValue,
}

impl Feature {
    pub fn new(name: &str, value: FeatureValue) -> Feature {
        Feature {
            name: name.to_string(),
            value: value,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub timestamp_ms: i64,
    pub spatial: Option<Coordinate>,
    pub features: Vec<Feature>,
}

impl Metadata {
    pub fn feature(&self, name: &str) -> Option<&FeatureValue> {
        self.features.iter()
            .find(|feature| feature.name == name)
            .map(|feature| &feature.value)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub filesystem: String,
    pub metadata: Metadata,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureField {
    pub name: String,
    pub field_type: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpatialHint {
    pub lat_name: String,
    pub lon_name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilesystemDescriptor {
    pub name: String,
    pub spatial_precision: u8,
    pub temporal_type: TemporalType,
    pub nodes_per_group: u16,
    pub feature_schema: Vec<FeatureField>,
    pub spatial_hint: Option<SpatialHint>,
}

// half-open window [start_ms, end_ms)
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl TimeWindow {
    pub fn contains(&self, timestamp_ms: i64) -> bool {
        timestamp_ms >= self.start_ms && timestamp_ms < self.end_ms
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub name: String,
    pub op: CompareOp,
    pub value: FeatureValue,
}

impl Predicate {
    pub fn new(name: &str, op: CompareOp, value: FeatureValue)
            -> Predicate {
        Predicate {
            name: name.to_string(),
            op: op,
            value: value,
        }
    }

    pub fn matches(&self, value: &FeatureValue)
            -> Result<bool, WireError> {
        let ordering = value.compare(&self.value)?;
        Ok(match (self.op, ordering) {
            (CompareOp::Eq, Some(Ordering::Equal)) => true,
            (CompareOp::Ne, Some(Ordering::Equal)) => false,
            (CompareOp::Ne, _) => true,
            (CompareOp::Lt, Some(Ordering::Less)) => true,
            (CompareOp::Le, Some(Ordering::Less))
                | (CompareOp::Le, Some(Ordering::Equal)) => true,
            (CompareOp::Gt, Some(Ordering::Greater)) => true,
            (CompareOp::Ge, Some(Ordering::Greater))
                | (CompareOp::Ge, Some(Ordering::Equal)) => true,
            _ => false,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetadataKind {
    Filesystem,
    Features,
    Overview,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilesystemAction {
    Create,
    Delete,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordRow {
    pub filesystem: String,
    pub path: String,
    pub size: u64,
    pub timestamp_ms: i64,
    pub geohash: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpoolStats {
    pub path: String,
    pub size: u64,
    pub count: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum QueryPayload {
    BlockIds(Vec<String>),
    Rows(Vec<RecordRow>),
    Spooled(SpoolStats),
    Aggregate {
        rows: Vec<RecordRow>,
        block_ids: Vec<String>,
        spooled_json: Option<String>,
        missing: Vec<String>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub filesystem: String,
    pub polygon: Option<Vec<Coordinate>>,
    pub time: Option<TimeWindow>,
    pub feature_predicates: Vec<Predicate>,
    pub metadata_predicates: Vec<Predicate>,
    pub interactive: bool,
    pub dry_run: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    StorageRequest {
        block: Block,
    },
    StorageEvent {
        block: Block,
    },
    QueryRequest {
        query: QuerySpec,
    },
    QueryEvent {
        query_id: String,
        origin: String,
        query: QuerySpec,
    },
    QueryResponse {
        query_id: String,
        origin: String,
        payload: QueryPayload,
        error: Option<String>,
    },
    MetadataRequest {
        kind: MetadataKind,
        filesystem: Option<String>,
    },
    MetadataEvent {
        request_id: String,
        origin: String,
        kind: MetadataKind,
        filesystem: Option<String>,
    },
    MetadataResponse {
        request_id: String,
        origin: String,
        kind: MetadataKind,
        result: Option<String>,
        error: Option<String>,
    },
    FilesystemRequest {
        action: FilesystemAction,
        descriptor: FilesystemDescriptor,
    },
    FilesystemEvent {
        action: FilesystemAction,
        descriptor: FilesystemDescriptor,
    },
    Shutdown,
}

pub fn write_message<T: Write>(message: &Message, writer: &mut T)
        -> Result<(), WireError> {
    let buffer = bincode::serialize(message)?;
    if buffer.len() as u32 > MAX_FRAME_LENGTH {
        return Err(WireError::FrameTooLarge(buffer.len() as u32));
    }

    writer.write_u32::<BigEndian>(buffer.len() as u32)?;
    writer.write_all(&buffer)?;
    writer.flush()?;
    Ok(())
}

pub fn read_message<T: Read>(reader: &mut T)
        -> Result<Message, WireError> {
    let length = reader.read_u32::<BigEndian>()?;
    if length > MAX_FRAME_LENGTH {
        return Err(WireError::FrameTooLarge(length));
    }

    let mut buffer = vec![0u8; length as usize];
    reader.read_exact(&mut buffer)?;
    Ok(bincode::deserialize(&buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_round_trip() {
        let message = Message::StorageRequest {
            block: Block {
                filesystem: "weather".to_string(),
                metadata: Metadata {
                    timestamp_ms: 1686830400000,
                    spatial: Some(Coordinate::new(40.7, -74.0)),
                    features: vec!(
                        Feature::new("temperature",
                            FeatureValue::Double(21.5)),
                        Feature::new("station",
                            FeatureValue::String("knyc".to_string())),
                    ),
                },
                payload: vec![1, 2, 3, 4],
            },
        };

        let mut buffer = Vec::new();
        write_message(&message, &mut buffer).expect("write message");
        let decoded = read_message(&mut &buffer[..])
            .expect("read message");

        assert_eq!(message, decoded);
    }

    #[test]
    fn frame_length_limit() {
        let mut buffer = Vec::new();
        buffer.write_u32::<BigEndian>(MAX_FRAME_LENGTH + 1).unwrap();

        match read_message(&mut &buffer[..]) {
            Err(WireError::FrameTooLarge(_)) => {},
            x => panic!("expected FrameTooLarge, found {:?}",
                x.map(|_| ())),
        }
    }

    #[test]
    fn feature_accessor_mismatch() {
        let value = FeatureValue::Int(42);
        assert_eq!(value.as_int().unwrap(), 42);

        match value.as_string() {
            Err(WireError::TypeMismatch { expected, found }) => {
                assert_eq!(expected, "string");
                assert_eq!(found, "int");
            },
            x => panic!("expected TypeMismatch, found {:?}", x),
        }
    }

    #[test]
    fn predicate_numeric_widening() {
        let predicate = Predicate::new("reading",
            CompareOp::Gt, FeatureValue::Int(10));

        assert!(predicate.matches(
            &FeatureValue::Double(10.5)).unwrap());
        assert!(!predicate.matches(
            &FeatureValue::Long(10)).unwrap());
        assert!(predicate.matches(&FeatureValue::Float(11.0)).unwrap());
    }

    #[test]
    fn predicate_incomparable() {
        let predicate = Predicate::new("station",
            CompareOp::Lt, FeatureValue::String("a".to_string()));

        match predicate.matches(&FeatureValue::Int(1)) {
            Err(WireError::Incomparable(_, _)) => {},
            x => panic!("expected Incomparable, found {:?}", x),
        }
    }

    #[test]
    fn bytes_equality_only() {
        let a = FeatureValue::Bytes(vec![1, 2]);
        let b = FeatureValue::Bytes(vec![1, 2]);
        let c = FeatureValue::Bytes(vec![3]);

        assert_eq!(a.compare(&b).unwrap(), Some(Ordering::Equal));
        assert_eq!(a.compare(&c).unwrap(), None);
    }
}
