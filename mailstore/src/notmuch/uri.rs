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

//! Query URIs of virtual mailboxes.
//!
//! ```text
//! notmuch://<database path>?type={messages|threads}&limit=<N>&query=<query>
//! ```
//!
//! The query and the database path are percent-encoded (see
//! [`crate::utils::percent`]); in the path only `?` and `%` need escaping.
//! Any scheme is accepted when parsing; URIs are always written with
//! [`SCHEME`].

use std::{path::PathBuf, str::FromStr};

use crate::{
    error::{Error, ErrorKind, Result},
    utils::percent,
};

pub const SCHEME: &str = "notmuch://";

/// Whether a query yields single messages or whole threads.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum QueryType {
    #[default]
    Messages,
    Threads,
}

impl QueryType {
    /// Parse a query type; anything unknown is logged and read as
    /// [`QueryType::Messages`].
    pub fn new_lenient(s: &str) -> Self {
        Self::from_str(s).unwrap_or_else(|err| {
            log::error!("{}", err);
            Self::Messages
        })
    }
}

impl FromStr for QueryType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "messages" => Ok(Self::Messages),
            "threads" => Ok(Self::Threads),
            other => Err(Error::new(format!(
                "failed to parse query type `{}`, expected `messages` or `threads`",
                other
            ))
            .set_kind(ErrorKind::ValueError)),
        }
    }
}

impl std::fmt::Display for QueryType {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            fmt,
            "{}",
            match self {
                Self::Messages => "messages",
                Self::Threads => "threads",
            }
        )
    }
}

/// A parsed query URI. Missing parts fall back to the store defaults.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct QueryUri {
    pub db_path: Option<PathBuf>,
    pub query_type: Option<QueryType>,
    pub limit: Option<usize>,
    pub query: Option<String>,
}

impl QueryUri {
    pub fn new(query: &str) -> Self {
        Self {
            query: Some(query.to_string()),
            ..Self::default()
        }
    }

    pub fn parse(uri: &str) -> Result<Self> {
        let invalid = |reason: &str| {
            Error::new(format!("failed to parse notmuch uri: {}", uri))
                .set_details(reason.to_string())
                .set_kind(ErrorKind::ValueError)
        };
        let (_scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| invalid("missing `scheme://` prefix"))?;
        let (path, params) = rest.split_once('?').unwrap_or((rest, ""));
        let mut ret = Self::default();
        if !path.is_empty() {
            ret.db_path = Some(PathBuf::from(percent::decode(path)?));
        }
        for param in params.split('&').filter(|p| !p.is_empty()) {
            let (name, value) = param.split_once('=').unwrap_or((param, ""));
            match name {
                "query" => ret.query = Some(percent::decode(value)?),
                "type" => ret.query_type = Some(QueryType::new_lenient(&percent::decode(value)?)),
                "limit" => {
                    ret.limit = Some(
                        value
                            .parse::<usize>()
                            .map_err(|_| invalid(&format!("failed to parse limit: {}", value)))?,
                    )
                }
                other => log::debug!("ignoring unknown uri parameter `{}` in {}", other, uri),
            }
        }
        Ok(ret)
    }

    /// Serialize with `type` always present and `limit` only when it differs
    /// from `default_limit`.
    pub fn to_uri_string(&self, default_query_type: QueryType, default_limit: usize) -> String {
        let mut ret = String::from(SCHEME);
        if let Some(path) = self.db_path.as_ref() {
            ret.push_str(&percent::encode_path(&path.display().to_string()));
        }
        ret.push_str("?type=");
        ret.push_str(&self.query_type.unwrap_or(default_query_type).to_string());
        match self.limit {
            Some(limit) if limit != default_limit => {
                ret.push_str(&format!("&limit={}", limit));
            }
            _ => {}
        }
        ret.push_str("&query=");
        ret.push_str(&percent::encode(self.query.as_deref().unwrap_or_default()));
        ret
    }
}

impl FromStr for QueryUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Remove `type=threads`/`type=messages` parameters that ended up inside a
/// query, returning the cleaned query and the last type found.
///
/// Matching ignores ASCII case.
pub fn strip_type_from_query(query: &str) -> (String, Option<QueryType>) {
    const VARIANTS: [(&str, QueryType); 6] = [
        ("&type=threads", QueryType::Threads),
        ("&type=messages", QueryType::Messages),
        ("type=threads&", QueryType::Threads),
        ("type=messages&", QueryType::Messages),
        ("type=threads", QueryType::Threads),
        ("type=messages", QueryType::Messages),
    ];
    let mut ret = query.to_string();
    let mut found = None;
    for (variant, query_type) in VARIANTS {
        let mut removed = false;
        while let Some(pos) = ret.to_ascii_lowercase().find(variant) {
            ret.replace_range(pos..pos + variant.len(), "");
            removed = true;
        }
        if removed {
            found = Some(query_type);
        }
    }
    (ret, found)
}
