/*
 * mailstore - configuration module.
 *
 * Copyright 2017 Manos Pitsidianakis
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

//! Configuration of a single store.
//!
//! A store is described by a [`StoreSettings`] table. The fields every store
//! has are typed; everything else ends up, in file order, in
//! [`StoreSettings::extra`] and is interpreted by the backend:
//! [`MboxSettings`](crate::mbox::MboxSettings) or
//! [`NotmuchSettings`](crate::notmuch::NotmuchSettings).
//!
//! ```toml
//! name = "personal"
//! root_mailbox = "~/Mail/inbox.mbox"
//! format = "mbox"
//! prefer_format = "mmdf"
//! lock_retries = "3"
//! ```

use std::path::PathBuf;

use indexmap::IndexMap;

use crate::error::{Error, ErrorKind, Result};

/// Read a typed backend setting out of [`StoreSettings::extra`].
///
/// `get_conf_val!(s["key"])` fails when the key is missing;
/// `get_conf_val!(s["key"], default)` falls back to `default`. The value type
/// is inferred and parsed with [`FromStr`](std::str::FromStr).
#[macro_export]
macro_rules! get_conf_val {
    ($s:ident[$var:literal]) => {
        $s.extra.get($var).ok_or_else(|| {
            $crate::error::Error::new(format!(
                "Configuration error ({}): store requires the field `{}` set",
                $s.name.as_str(),
                $var
            ))
            .set_kind($crate::error::ErrorKind::Configuration)
        })
    };
    ($s:ident[$var:literal], $default:expr) => {
        $s.extra
            .get($var)
            .map(|v| {
                <_ as ::std::str::FromStr>::from_str(v).map_err(|e| {
                    $crate::error::Error::new(format!(
                        "Configuration error ({}): Invalid value for field `{}`: {v}\n{e}",
                        $s.name.as_str(),
                        $var
                    ))
                    .set_kind($crate::error::ErrorKind::Configuration)
                })
            })
            .unwrap_or_else(|| Ok($default))
    };
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct StoreSettings {
    #[serde(default)]
    pub name: String,
    /// Path of the store file, or the index query URI.
    pub root_mailbox: String,
    pub format: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(flatten)]
    pub extra: IndexMap<String, String>,
}

impl StoreSettings {
    pub fn new(name: &str, root_mailbox: &str, format: &str) -> Self {
        Self {
            name: name.to_string(),
            root_mailbox: root_mailbox.to_string(),
            format: format.to_string(),
            ..Self::default()
        }
    }

    /// Builder-style setter for backend keys, mostly for tests and tools.
    pub fn with_extra(mut self, key: &str, value: &str) -> Self {
        self.extra.insert(key.to_string(), value.to_string());
        self
    }

    /// [`StoreSettings::root_mailbox`] with a leading `~/` expanded to the
    /// home directory.
    pub fn root_path(&self) -> PathBuf {
        expand_home(&self.root_mailbox)
    }

    /// Check that `format` names a supported backend.
    pub fn validate(&self) -> Result<()> {
        match self.format.to_ascii_lowercase().as_str() {
            "mbox" | "mmdf" | "notmuch" => Ok(()),
            other => Err(Error::new(format!(
                "Configuration error ({}): unknown store format `{}`",
                self.name, other
            ))
            .set_kind(ErrorKind::Configuration)),
        }
    }
}

pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => PathBuf::from(path),
    }
}

/// The directory used for temporary files: `$TMPDIR` if set, `/tmp`
/// otherwise.
pub fn default_tmpdir() -> PathBuf {
    std::env::var_os("TMPDIR")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conf_get_val() {
        let s = StoreSettings::new("test", "/tmp/mbox", "mbox")
            .with_extra("lock_retries", "3")
            .with_extra("check_recent", "maybe");
        let retries: Result<u8> = get_conf_val!(s["lock_retries"], 5);
        assert_eq!(retries.unwrap(), 3);
        let wait: Result<u64> = get_conf_val!(s["lock_retry_wait_ms"], 1000);
        assert_eq!(wait.unwrap(), 1000);
        let recent: Result<bool> = get_conf_val!(s["check_recent"], false);
        let err = recent.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);
        assert!(err.summary.contains("check_recent"));
        get_conf_val!(s["missing"]).unwrap_err();
    }

    #[test]
    fn test_conf_validate_format() {
        StoreSettings::new("a", "/x", "mbox").validate().unwrap();
        StoreSettings::new("a", "/x", "NotMuch").validate().unwrap();
        StoreSettings::new("a", "/x", "maildir")
            .validate()
            .unwrap_err();
    }
}
