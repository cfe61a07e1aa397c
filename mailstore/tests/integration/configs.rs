//
// mailstore
//
// Copyright 2024 Emmanouil Pitsidianakis <manos@pitsidianak.is>
//
// This file is part of meli.
//
// meli is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// meli is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with meli. If not, see <http://www.gnu.org/licenses/>.
//
// SPDX-License-Identifier: EUPL-1.2 OR GPL-3.0-or-later

use mailstore::{
    mbox::{MboxMailbox, MboxSettings, StoreFormat},
    notmuch::{MemoryIndex, NotmuchMailbox, NotmuchSettings, QueryType},
    ErrorKind, StoreSettings,
};
use tempfile::TempDir;

use crate::{write_store, THREE_MESSAGES};

#[test]
fn test_mbox_config() {
    let tmp_dir = TempDir::new().unwrap();
    let path = write_store(tmp_dir.path(), "inbox", THREE_MESSAGES);

    let s: StoreSettings = toml::from_str(&format!(
        r#"
name = "personal"
root_mailbox = "{}"
format = "mmdf"
lock_retries = "2"
lock_retry_wait_ms = "10"
tmpdir = "{}"
"#,
        path.display(),
        tmp_dir.path().display()
    ))
    .unwrap();
    let settings = MboxSettings::new(&s).unwrap();
    assert_eq!(settings.name, "personal");
    assert_eq!(settings.lock_retries, 2);
    assert_eq!(settings.lock_retry_wait.as_millis(), 10);
    assert_eq!(settings.tmpdir, tmp_dir.path());
    assert_eq!(settings.prefer_format, None);
    assert!(!settings.read_only);

    // `format = "mmdf"` makes the session expect MMDF records.
    let err = MboxMailbox::from_settings(&s).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Corrupt);

    let s: StoreSettings = toml::from_str(&format!(
        r#"
name = "personal"
root_mailbox = "{}"
format = "mbox"
read_only = true
"#,
        path.display(),
    ))
    .unwrap();
    let mailbox = MboxMailbox::from_settings(&s).unwrap();
    assert_eq!(mailbox.format(), StoreFormat::Mbox);
    assert!(mailbox.is_read_only());
    assert_eq!(mailbox.snapshot().len(), 3);
}

#[test]
fn test_mbox_config_errors() {
    let tmp_dir = TempDir::new().unwrap();
    let s: StoreSettings = toml::from_str(&format!(
        r#"
name = "personal"
root_mailbox = "{}"
format = "mbox"
"#,
        tmp_dir.path().join("missing").display()
    ))
    .unwrap();
    let err = MboxMailbox::from_settings(&s).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Configuration);

    let s = StoreSettings::new("personal", "/tmp/x", "maildir");
    assert_eq!(
        MboxMailbox::from_settings(&s).unwrap_err().kind,
        ErrorKind::Configuration
    );

    let s = StoreSettings::new("personal", "/tmp/x", "mbox").with_extra("prefer_format", "babyl");
    let err = MboxSettings::new(&s).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Configuration);
    assert!(err.summary.contains("prefer_format"));

    let s = StoreSettings::new("personal", "/tmp/x", "mbox").with_extra("lock_retries", "many");
    assert_eq!(
        MboxSettings::new(&s).unwrap_err().kind,
        ErrorKind::Configuration
    );
}

#[test]
fn test_notmuch_config() {
    let tmp_dir = TempDir::new().unwrap();
    let s: StoreSettings = toml::from_str(&format!(
        r#"
name = "index"
root_mailbox = "notmuch://{}?type=threads&query=tag%3Ainbox"
format = "notmuch"
exclude_tags = "spam deleted"
query_window_duration = "2"
query_window_timebase = "month"
record_tags = "+sent -unread"
"#,
        tmp_dir.path().display()
    ))
    .unwrap();
    let settings = NotmuchSettings::new(&s).unwrap();
    assert_eq!(settings.exclude_tags, ["spam", "deleted"]);
    assert_eq!(settings.query_window_duration, 2);
    assert_eq!(settings.record_tags.as_deref(), Some("+sent -unread"));
    assert_eq!(settings.query_type, QueryType::Messages);

    let mut mailbox = NotmuchMailbox::from_settings(MemoryIndex::new(tmp_dir.path()), &s).unwrap();
    assert_eq!(mailbox.query_type(), QueryType::Threads);
    assert_eq!(mailbox.db_path().unwrap(), tmp_dir.path());
    assert_eq!(
        mailbox.query_string(true).unwrap(),
        "date:2month.. and tag:inbox"
    );

    let s = StoreSettings::new("index", "notmuch://db?query=*", "mbox");
    assert_eq!(
        NotmuchMailbox::from_settings(MemoryIndex::new(tmp_dir.path()), &s)
            .unwrap_err()
            .kind,
        ErrorKind::Configuration
    );
}
