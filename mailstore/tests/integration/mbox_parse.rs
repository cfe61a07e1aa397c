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
    mbox::{MboxMailbox, MboxSettings, RecordFlags, StoreFormat},
    ErrorKind, StoreStatus,
};
use tempfile::TempDir;

use crate::{write_store, THREE_MESSAGES};

#[test]
fn test_mbox_load() {
    let tmp_dir = TempDir::new().unwrap();
    let path = write_store(tmp_dir.path(), "inbox", THREE_MESSAGES);
    let mut mailbox = MboxMailbox::open(&path, MboxSettings::default()).unwrap();
    assert_eq!(mailbox.format(), StoreFormat::Mbox);

    let snapshot = mailbox.snapshot();
    assert_eq!(snapshot.len(), 3);
    let subjects = snapshot
        .iter()
        .map(|r| r.envelope.subject.clone().unwrap())
        .collect::<Vec<_>>();
    assert_eq!(subjects, ["A", "B", "C"]);
    assert_eq!(snapshot.get(0).unwrap().offset, 0);
    assert_eq!(snapshot.get(0).unwrap().lines, 2);
    assert_eq!(snapshot.get(2).unwrap().lines, 3);
    assert!(snapshot.get(1).unwrap().flags.contains(RecordFlags::OLD));
    assert_eq!(snapshot.counts.total, 3);
    assert_eq!(snapshot.counts.new, 2);
    assert!(mailbox.has_new());

    let bytes = mailbox.message_bytes(1).unwrap();
    assert!(bytes.starts_with(b"From bob@example.com "));
    assert!(bytes.ends_with(b"\n\nsecond message\n"));

    mailbox.close();
    assert_eq!(
        mailbox.message_bytes(0).unwrap_err().kind,
        ErrorKind::ValueError
    );
}

#[test]
fn test_mbox_wrong_content_length() {
    let tmp_dir = TempDir::new().unwrap();
    // The declared length points into the middle of the body, so the record
    // end has to be found by scanning for the next `From_` line.
    let path = write_store(
        tmp_dir.path(),
        "inbox",
        b"From a@example.com Fri Jun 23 02:56:55 2000
Subject: one
Content-Length: 3

hello
world

From b@example.com Fri Jun 23 02:57:55 2000
Subject: two
Content-Length: 5

only

",
    );
    let mailbox = MboxMailbox::open(&path, MboxSettings::default()).unwrap();
    let snapshot = mailbox.snapshot();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot.get(0).unwrap().length, 12);
    assert_eq!(snapshot.get(0).unwrap().lines, 2);
    assert_eq!(snapshot.get(1).unwrap().length, 5);
    assert_eq!(
        snapshot.get(1).unwrap().envelope.subject.as_deref(),
        Some("two")
    );
}

#[test]
fn test_mmdf_load() {
    let tmp_dir = TempDir::new().unwrap();
    let path = write_store(
        tmp_dir.path(),
        "inbox.mmdf",
        b"\x01\x01\x01\x01\nFrom: a@example.com\nSubject: one\n\nfirst\n\x01\x01\x01\x01\n\x01\x01\x01\x01\nFrom: b@example.com\nSubject: two\nStatus: RO\n\nsecond\nbody\n\x01\x01\x01\x01\n",
    );
    let mut mailbox = MboxMailbox::open(&path, MboxSettings::default()).unwrap();
    assert_eq!(mailbox.format(), StoreFormat::Mmdf);
    assert_eq!(mailbox.snapshot().len(), 2);
    let second = mailbox.snapshot().get(1).unwrap();
    assert_eq!(second.length, 12);
    assert!(second.flags.contains(RecordFlags::READ));
    assert_eq!(
        mailbox.message_bytes(0).unwrap(),
        b"From: a@example.com\nSubject: one\n\nfirst\n"
    );
}

#[test]
fn test_mbox_leading_garbage() {
    let tmp_dir = TempDir::new().unwrap();
    let mut contents = b"this is not a message\n".to_vec();
    contents.extend_from_slice(THREE_MESSAGES);
    let path = write_store(tmp_dir.path(), "inbox", &contents);

    let err = MboxMailbox::open(&path, MboxSettings::default()).unwrap_err();
    assert_eq!(err.kind, ErrorKind::ValueError);

    let settings = MboxSettings {
        prefer_format: Some(StoreFormat::Mbox),
        ..MboxSettings::default()
    };
    let err = MboxMailbox::open(&path, settings).unwrap_err();
    assert_eq!(err.kind, ErrorKind::Corrupt);
}

#[test]
fn test_mbox_append_then_check() {
    let tmp_dir = TempDir::new().unwrap();
    let path = write_store(tmp_dir.path(), "inbox", THREE_MESSAGES);
    let mut mailbox = MboxMailbox::open(&path, MboxSettings::default()).unwrap();
    assert_eq!(mailbox.check().unwrap(), StoreStatus::Success);

    mailbox
        .append_message(
            b"Message-ID: <d@example.com>\r\nSubject: D\r\n\r\nFrom the start\r\nend\r\n",
            Some("dave@example.com"),
            Some(961_729_015),
        )
        .unwrap();
    assert_eq!(mailbox.snapshot().len(), 3);
    assert_eq!(mailbox.check().unwrap(), StoreStatus::NewMail);
    assert_eq!(mailbox.snapshot().len(), 4);

    let record = mailbox.snapshot().get(3).unwrap();
    assert_eq!(record.envelope.subject.as_deref(), Some("D"));
    assert_eq!(record.envelope.return_path.as_deref(), Some("dave@example.com"));
    let bytes = mailbox.message_bytes(3).unwrap();
    assert!(bytes.starts_with(b"From dave@example.com "));
    assert!(bytes.ends_with(b"\n\n>From the start\nend\n"));

    mailbox
        .append_message(b"Subject: bad\n\nx\n", Some("has space@example.com"), None)
        .unwrap_err();
}
