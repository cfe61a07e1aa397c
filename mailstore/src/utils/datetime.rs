/*
 * mailstore - date and time helpers
 *
 * Copyright 2020 Manos Pitsidianakis
 *
 * This file is part of meli.
 *
 * meli is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * meli is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with meli. If not, see <http://www.gnu.org/licenses/>.
 */

//! Functions for dealing with UNIX Epoch timestamps.
//!
//! # Examples
//!
//! ```rust
//! # use mailstore::utils::datetime::*;
//! let ts = from_components(2020, 1, 8, 18, 44, 3).unwrap();
//! assert_eq!(ts, 1578509043);
//! assert_eq!(
//!     timestamp_to_string(ts, Some(formats::ASCTIME_FMT)),
//!     "Wed Jan  8 18:44:03 2020"
//! );
//! ```

use std::{
    fs::Metadata,
    time::{SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, NaiveDate};

pub type UnixTimestamp = u64;

pub mod formats {
    /// `<date>`T`<time>`
    pub const RFC3339_DATETIME: &str = "%Y-%m-%dT%H:%M:%S";
    pub const RFC3339_DATETIME_AND_SPACE: &str = "%Y-%m-%d %H:%M:%S";
    //"Tue May 21 13:46:22 1991"
    //"Wed Sep  9 00:27:54 2020"
    pub const ASCTIME_FMT: &str = "%a %b %e %H:%M:%S %Y";
}

pub fn now() -> UnixTimestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Return a UNIX epoch timestamp as string in UTC, using `fmt` (defaults to
/// [`formats::RFC3339_DATETIME_AND_SPACE`]).
pub fn timestamp_to_string(timestamp: UnixTimestamp, fmt: Option<&str>) -> String {
    let Some(datetime) = i64::try_from(timestamp)
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
    else {
        return String::new();
    };
    datetime
        .format(fmt.unwrap_or(formats::RFC3339_DATETIME_AND_SPACE))
        .to_string()
}

/// Convert broken-down UTC calendar time into a timestamp. Returns `None` for
/// out of range fields or dates before the epoch.
pub fn from_components(
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
) -> Option<UnixTimestamp> {
    let secs = NaiveDate::from_ymd_opt(year, month, day)?
        .and_hms_opt(hour, minute, second)?
        .and_utc()
        .timestamp();
    UnixTimestamp::try_from(secs).ok()
}

/// Modification and access time of a file, in seconds.
pub fn file_times(metadata: &Metadata) -> (UnixTimestamp, UnixTimestamp) {
    use std::os::unix::fs::MetadataExt;

    (
        UnixTimestamp::try_from(metadata.mtime()).unwrap_or(0),
        UnixTimestamp::try_from(metadata.atime()).unwrap_or(0),
    )
}
