use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use wire::{Metadata, TemporalType, TimeWindow};

use crate::error::{Error, Result};
use crate::geohash;

/// Routing key for placement: the record's coordinates encoded at the
/// filesystem's precision, interpreted as a 64 bit integer.
pub fn geohash_hash(metadata: &Metadata, precision: usize)
        -> Result<u64> {
    let spatial = match &metadata.spatial {
        Some(spatial) => spatial,
        None => return Err(Error::Hash(
            "metadata carries no spatial coordinates".to_string())),
    };

    let encoded = geohash::encode(spatial, precision)?;
    geohash::hash_to_long(&encoded)
}

/// Truncate an epoch millisecond timestamp to the bucket boundary of
/// the temporal type, in UTC.
pub fn truncate_timestamp(timestamp_ms: i64,
        temporal_type: TemporalType) -> Result<i64> {
    let datetime = match Utc.timestamp_millis_opt(timestamp_ms)
            .single() {
        Some(datetime) => datetime,
        None => return Err(Error::Hash(format!(
            "invalid timestamp {}", timestamp_ms))),
    };

    let (year, month, day, hour) = match temporal_type {
        TemporalType::Hour => (datetime.year(), datetime.month(),
            datetime.day(), datetime.hour()),
        TemporalType::Day => (datetime.year(), datetime.month(),
            datetime.day(), 0),
        TemporalType::Month => (datetime.year(), datetime.month(),
            1, 0),
        TemporalType::Year => (datetime.year(), 1, 1, 0),
    };

    match Utc.with_ymd_and_hms(year, month, day, hour, 0, 0).single() {
        Some(truncated) => Ok(truncated.timestamp_millis()),
        None => Err(Error::Hash(format!(
            "untruncatable timestamp {}", timestamp_ms))),
    }
}

/// Temporal placement value: the truncated bucket boundary itself.
pub fn temporal_hash(metadata: &Metadata,
        temporal_type: TemporalType) -> Result<i64> {
    truncate_timestamp(metadata.timestamp_ms, temporal_type)
}

/// Parse a partial time specification `yyyy[-MM[-dd[THH]]]` into the
/// window it spans. An `x` component substitutes the corresponding
/// component of `now`, but only when `allow_wildcard` is set;
/// otherwise wildcards are rejected.
pub fn parse_time_window(spec: &str, allow_wildcard: bool,
        now: DateTime<Utc>) -> Result<TimeWindow> {
    let (date_part, hour_part) = match spec.find('T') {
        Some(index) => (&spec[..index], Some(&spec[index + 1..])),
        None => (spec, None),
    };

    let date_components: Vec<&str> = date_part.split('-').collect();
    if date_components.len() > 3 || date_components[0].is_empty() {
        return Err(Error::Validation(format!(
            "malformed time specification '{}'", spec)));
    }

    let component = |value: &str, current: u32| -> Result<u32> {
        if value == "x" {
            if !allow_wildcard {
                return Err(Error::Validation(format!(
                    "wildcard component in '{}'", spec)));
            }
            return Ok(current);
        }

        value.parse::<u32>().map_err(|_| Error::Validation(format!(
            "malformed time component '{}'", value)))
    };

    let year = component(date_components[0], now.year() as u32)? as i32;
    let month = match date_components.get(1) {
        Some(value) => Some(component(value, now.month())?),
        None => None,
    };
    let day = match date_components.get(2) {
        Some(value) => Some(component(value, now.day())?),
        None => None,
    };
    let hour = match hour_part {
        Some(value) if day.is_some() =>
            Some(component(value, now.hour())?),
        Some(_) => return Err(Error::Validation(format!(
            "hour without a full date in '{}'", spec))),
        None => None,
    };

    let start = Utc.with_ymd_and_hms(year, month.unwrap_or(1),
        day.unwrap_or(1), hour.unwrap_or(0), 0, 0).single();
    let start = match start {
        Some(start) => start,
        None => return Err(Error::Validation(format!(
            "invalid calendar date in '{}'", spec))),
    };

    let end = if hour.is_some() {
        start + Duration::hours(1)
    } else if day.is_some() {
        start + Duration::days(1)
    } else if month.is_some() {
        let (next_year, next_month) = match start.month() {
            12 => (start.year() + 1, 1),
            x => (start.year(), x + 1),
        };
        match Utc.with_ymd_and_hms(next_year, next_month, 1, 0, 0, 0)
                .single() {
            Some(end) => end,
            None => return Err(Error::Validation(format!(
                "invalid calendar date in '{}'", spec))),
        }
    } else {
        match Utc.with_ymd_and_hms(start.year() + 1, 1, 1, 0, 0, 0)
                .single() {
            Some(end) => end,
            None => return Err(Error::Validation(format!(
                "invalid calendar date in '{}'", spec))),
        }
    };

    Ok(TimeWindow {
        start_ms: start.timestamp_millis(),
        end_ms: end.timestamp_millis(),
    })
}
