/*
 * mailstore - notmuch module.
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

//! Time-windowed queries.
//!
//! A window of `duration` timebase units is put in front of a query.
//! Position `0` is the most recent window, each step backward moves the
//! window one `duration` further into the past:
//!
//! ```
//! # use mailstore::notmuch::window::WindowedQuery;
//! let mut window = WindowedQuery::new(2, "week", 0);
//! assert_eq!(
//!     window.apply("tag:inbox").as_deref(),
//!     Some("date:2week.. and tag:inbox")
//! );
//! window.backward();
//! assert_eq!(
//!     window.apply("tag:inbox").as_deref(),
//!     Some("date:4week..2week and tag:inbox")
//! );
//! ```

use std::str::FromStr;

use crate::error::{Error, ErrorKind, Result};

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Timebase {
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl FromStr for Timebase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "hour" => Self::Hour,
            "day" => Self::Day,
            "week" => Self::Week,
            "month" => Self::Month,
            "year" => Self::Year,
            other => {
                return Err(Error::new(format!(
                    "Invalid query window timebase `{}`. Valid values are: hour, day, week, \
                     month, year",
                    other
                ))
                .set_kind(ErrorKind::ValueError))
            }
        })
    }
}

impl std::fmt::Display for Timebase {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            fmt,
            "{}",
            match self {
                Self::Hour => "hour",
                Self::Day => "day",
                Self::Week => "week",
                Self::Month => "month",
                Self::Year => "year",
            }
        )
    }
}

impl Timebase {
    /// Length of one unit in seconds, as the in-process index reads
    /// relative dates.
    pub const fn seconds(self) -> u64 {
        match self {
            Self::Hour => 60 * 60,
            Self::Day => 24 * 60 * 60,
            Self::Week => 7 * 24 * 60 * 60,
            Self::Month => 30 * 24 * 60 * 60,
            Self::Year => 365 * 24 * 60 * 60,
        }
    }
}

/// A sliding date window over a query.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct WindowedQuery {
    /// Window length in timebase units; `0` or less disables windowing.
    pub duration: i32,
    /// Kept as written in the configuration and checked when applied.
    pub timebase: String,
    position: u32,
    current_search: Option<String>,
}

impl WindowedQuery {
    pub fn new(duration: i32, timebase: &str, position: u32) -> Self {
        Self {
            duration,
            timebase: timebase.to_string(),
            position,
            current_search: None,
        }
    }

    #[inline]
    pub fn position(&self) -> u32 {
        self.position
    }

    pub fn set_position(&mut self, position: u32) {
        self.position = position;
    }

    pub fn reset(&mut self) {
        log::debug!("query window reset");
        self.position = 0;
    }

    /// Move towards the present. Stops at position `0`.
    pub fn forward(&mut self) {
        self.position = self.position.saturating_sub(1);
        log::debug!("query window position {}", self.position);
    }

    /// Move into the past.
    pub fn backward(&mut self) {
        self.position = self.position.saturating_add(1);
        log::debug!("query window position {}", self.position);
    }

    pub fn is_enabled(&self) -> bool {
        self.duration > 0
    }

    /// Restrict `query` to the current window.
    ///
    /// Returns `None` when windowing is disabled or the timebase is invalid;
    /// the query is then used as is. Applying a different query than the
    /// previous call moves the window back to position `0`.
    pub fn apply(&mut self, query: &str) -> Option<String> {
        if self.duration <= 0 {
            self.position = 0;
            return None;
        }
        match self.current_search.as_deref() {
            Some(previous) if previous == query => {}
            Some(_) => {
                self.reset();
                self.current_search = Some(query.to_string());
            }
            None => self.current_search = Some(query.to_string()),
        }
        let timebase = match Timebase::from_str(&self.timebase) {
            Ok(t) => t,
            Err(err) => {
                log::error!("{}", err);
                return None;
            }
        };
        let duration = i64::from(self.duration);
        let position = i64::from(self.position);
        let beg = duration * (position + 1);
        let end = duration * position;
        let ret = if end == 0 {
            format!("date:{beg}{timebase}.. and {query}")
        } else {
            format!("date:{beg}{timebase}..{end}{timebase} and {query}")
        };
        log::debug!("windowed query: {}", ret);
        Some(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_positions() {
        let mut window = WindowedQuery::new(2, "week", 0);
        assert_eq!(
            window.apply("tag:inbox").as_deref(),
            Some("date:2week.. and tag:inbox")
        );
        window.backward();
        assert_eq!(
            window.apply("tag:inbox").as_deref(),
            Some("date:4week..2week and tag:inbox")
        );
        window.backward();
        assert_eq!(
            window.apply("tag:inbox").as_deref(),
            Some("date:6week..4week and tag:inbox")
        );
        window.forward();
        window.forward();
        window.forward();
        assert_eq!(window.position(), 0);
    }

    #[test]
    fn test_window_initial_position() {
        let mut window = WindowedQuery::new(3, "day", 2);
        assert_eq!(
            window.apply("*").as_deref(),
            Some("date:9day..6day and *")
        );
    }

    #[test]
    fn test_window_resets_on_new_query() {
        let mut window = WindowedQuery::new(1, "month", 0);
        window.apply("tag:inbox");
        window.backward();
        window.backward();
        assert_eq!(
            window.apply("tag:inbox").as_deref(),
            Some("date:3month..2month and tag:inbox")
        );
        assert_eq!(
            window.apply("tag:work").as_deref(),
            Some("date:1month.. and tag:work")
        );
        assert_eq!(window.position(), 0);
    }

    #[test]
    fn test_window_disabled() {
        let mut window = WindowedQuery::new(0, "week", 4);
        assert_eq!(window.apply("tag:inbox"), None);
        assert_eq!(window.position(), 0);

        let mut window = WindowedQuery::new(2, "fortnight", 0);
        assert_eq!(window.apply("tag:inbox"), None);
    }
}
