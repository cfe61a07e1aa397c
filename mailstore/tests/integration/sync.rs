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

use std::{
    fs::OpenOptions,
    io::{Seek, SeekFrom, Write},
    path::PathBuf,
};

use mailstore::{
    mbox::{
        headers::HeaderSource, session::SessionState, CopyMessage, MboxMailbox, MboxSettings,
        MessageRecord, MessageWriter, RecordFlags,
    },
    utils::{current_hostname, current_username},
    Error, ErrorKind, Result, StoreStatus,
};
use tempfile::TempDir;

use crate::{write_store, THREE_MESSAGES};

fn settings(tmp_dir: &TempDir) -> MboxSettings {
    MboxSettings {
        tmpdir: tmp_dir.path().to_path_buf(),
        ..MboxSettings::default()
    }
}

#[test]
fn test_sync_without_changes() {
    let tmp_dir = TempDir::new().unwrap();
    let path = write_store(tmp_dir.path(), "inbox", THREE_MESSAGES);
    let mut mailbox = MboxMailbox::open(&path, settings(&tmp_dir)).unwrap();
    assert!(!mailbox.snapshot().is_dirty());
    assert_eq!(mailbox.sync().unwrap(), StoreStatus::Success);
    assert_eq!(std::fs::read(&path).unwrap(), THREE_MESSAGES);

    // Local flags alone leave nothing to write.
    assert!(mailbox.set_flag(0, RecordFlags::TAGGED, true).unwrap());
    assert!(!mailbox.snapshot().is_dirty());
    assert_eq!(mailbox.sync().unwrap(), StoreStatus::Success);
    assert_eq!(std::fs::read(&path).unwrap(), THREE_MESSAGES);
}

#[test]
fn test_sync_deletes_last_record() {
    let tmp_dir = TempDir::new().unwrap();
    let path = write_store(tmp_dir.path(), "inbox", THREE_MESSAGES);
    let mut mailbox = MboxMailbox::open(&path, settings(&tmp_dir)).unwrap();
    let c = mailbox.snapshot().get(2).unwrap().clone();
    let span = c.span(mailbox.format().padding_size());

    assert!(mailbox.set_flag(2, RecordFlags::DELETED, true).unwrap());
    assert!(mailbox.snapshot().is_dirty());
    assert_eq!(mailbox.snapshot().first_dirty(), Some(2));
    assert_eq!(mailbox.sync().unwrap(), StoreStatus::Success);

    let contents = std::fs::read(&path).unwrap();
    assert_eq!(contents.len() as u64, THREE_MESSAGES.len() as u64 - span);
    assert_eq!(contents.as_slice(), &THREE_MESSAGES[..c.offset as usize]);
    assert_eq!(mailbox.snapshot().len(), 2);
    assert!(!mailbox.snapshot().is_dirty());
    assert_eq!(mailbox.check().unwrap(), StoreStatus::Success);
    // Nothing is left behind in the temporary directory.
    assert_eq!(std::fs::read_dir(tmp_dir.path()).unwrap().count(), 1);
}

#[test]
fn test_sync_rewrites_from_first_dirty_record() {
    let tmp_dir = TempDir::new().unwrap();
    let path = write_store(tmp_dir.path(), "inbox", THREE_MESSAGES);
    let mut mailbox = MboxMailbox::open(&path, settings(&tmp_dir)).unwrap();
    let b_offset = mailbox.snapshot().get(1).unwrap().offset as usize;

    assert!(mailbox.set_flag(1, RecordFlags::FLAGGED, true).unwrap());
    assert!(mailbox.set_flag(0, RecordFlags::DELETED, false).is_ok());
    assert_eq!(mailbox.snapshot().first_dirty(), Some(1));
    assert_eq!(mailbox.sync().unwrap(), StoreStatus::Success);

    let contents = std::fs::read(&path).unwrap();
    assert_eq!(&contents[..b_offset], &THREE_MESSAGES[..b_offset]);
    assert_ne!(contents.as_slice(), THREE_MESSAGES);
    drop(mailbox);

    let mailbox = MboxMailbox::open(&path, settings(&tmp_dir)).unwrap();
    let snapshot = mailbox.snapshot();
    assert_eq!(snapshot.len(), 3);
    assert!(snapshot.get(1).unwrap().flags.contains(RecordFlags::FLAGGED));
    assert!(!snapshot.get(0).unwrap().flags.contains(RecordFlags::FLAGGED));
    assert_eq!(
        snapshot.get(2).unwrap().envelope.subject.as_deref(),
        Some("C")
    );
    assert_eq!(snapshot.get(2).unwrap().lines, 3);
}

#[test]
fn test_sync_read_only() {
    let tmp_dir = TempDir::new().unwrap();
    let path = write_store(tmp_dir.path(), "inbox", THREE_MESSAGES);
    let mut mailbox = MboxMailbox::open(
        &path,
        MboxSettings {
            read_only: true,
            ..settings(&tmp_dir)
        },
    )
    .unwrap();
    assert!(mailbox.is_read_only());
    assert!(!mailbox.set_flag(0, RecordFlags::DELETED, true).unwrap());
    assert_eq!(mailbox.snapshot().counts.deleted, 0);
    assert_eq!(mailbox.sync().unwrap(), StoreStatus::Success);
    assert_eq!(std::fs::read(&path).unwrap(), THREE_MESSAGES);
}

const DAVE: &[u8] = b"From dave@example.com Fri Jun 23 05:00:00 2000
Message-ID: <d@example.com>
From: dave@example.com
Subject: D

fourth message

";

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Fails when asked to copy record `.0`.
#[derive(Debug)]
struct FailOn(usize);

impl MessageWriter for FailOn {
    fn write_message(
        &self,
        source: &mut dyn HeaderSource,
        record: &MessageRecord,
        dest: &mut dyn Write,
    ) -> Result<()> {
        if record.index == self.0 {
            return Err(Error::new("No space left on device"));
        }
        CopyMessage.write_message(source, record, dest)
    }
}

/// Scribbles over the store while the rewrite is in progress.
#[derive(Debug)]
struct Scribble {
    path: PathBuf,
    offset: u64,
}

impl MessageWriter for Scribble {
    fn write_message(
        &self,
        source: &mut dyn HeaderSource,
        record: &MessageRecord,
        dest: &mut dyn Write,
    ) -> Result<()> {
        let mut store = OpenOptions::new().write(true).open(&self.path)?;
        store.seek(SeekFrom::Start(self.offset))?;
        store.write_all(b"XXXX")?;
        CopyMessage.write_message(source, record, dest)
    }
}

#[test]
fn test_sync_after_external_append() {
    let tmp_dir = TempDir::new().unwrap();
    let path = write_store(tmp_dir.path(), "inbox", THREE_MESSAGES);
    let mut mailbox = MboxMailbox::open(&path, settings(&tmp_dir)).unwrap();
    assert!(mailbox.set_flag(0, RecordFlags::FLAGGED, true).unwrap());

    OpenOptions::new()
        .append(true)
        .open(&path)
        .unwrap()
        .write_all(DAVE)
        .unwrap();
    let expected = [THREE_MESSAGES, DAVE].concat();
    assert_eq!(mailbox.sync().unwrap(), StoreStatus::NewMail);
    assert_eq!(std::fs::read(&path).unwrap(), expected);
    assert_eq!(mailbox.snapshot().len(), 4);
    assert!(mailbox.snapshot().get(0).unwrap().is_changed());

    assert_eq!(mailbox.sync().unwrap(), StoreStatus::Success);
    drop(mailbox);
    let mailbox = MboxMailbox::open(&path, settings(&tmp_dir)).unwrap();
    let snapshot = mailbox.snapshot();
    assert_eq!(snapshot.len(), 4);
    assert!(snapshot.get(0).unwrap().flags.contains(RecordFlags::FLAGGED));
    assert_eq!(
        snapshot.get(3).unwrap().envelope.subject.as_deref(),
        Some("D")
    );
}

#[test]
fn test_sync_after_external_rewrite() {
    let tmp_dir = TempDir::new().unwrap();
    let path = write_store(tmp_dir.path(), "inbox", THREE_MESSAGES);
    let mut mailbox = MboxMailbox::open(&path, settings(&tmp_dir)).unwrap();
    let b = mailbox.snapshot().get(1).unwrap().offset as usize;
    let c = mailbox.snapshot().get(2).unwrap().offset as usize;
    assert!(mailbox.set_flag(2, RecordFlags::FLAGGED, true).unwrap());

    let without_b = [&THREE_MESSAGES[..b], &THREE_MESSAGES[c..]].concat();
    std::fs::write(&path, &without_b).unwrap();
    assert_eq!(mailbox.sync().unwrap(), StoreStatus::Reopened);
    assert_eq!(std::fs::read(&path).unwrap(), without_b);
    assert_eq!(mailbox.snapshot().len(), 2);
    let carol = mailbox.snapshot().get(1).unwrap();
    assert_eq!(carol.envelope.subject.as_deref(), Some("C"));
    assert!(carol.flags.contains(RecordFlags::FLAGGED));
    assert!(carol.is_changed());

    assert_eq!(mailbox.sync().unwrap(), StoreStatus::Success);
    drop(mailbox);
    let mailbox = MboxMailbox::open(&path, settings(&tmp_dir)).unwrap();
    let snapshot = mailbox.snapshot();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(
        snapshot.get(0).unwrap().envelope.subject.as_deref(),
        Some("A")
    );
    assert!(snapshot.get(1).unwrap().flags.contains(RecordFlags::FLAGGED));
}

#[test]
fn test_sync_write_failure_rolls_back() {
    let tmp_dir = TempDir::new().unwrap();
    let path = write_store(tmp_dir.path(), "inbox", THREE_MESSAGES);
    let mut mailbox = MboxMailbox::open(&path, settings(&tmp_dir)).unwrap();
    assert!(mailbox.set_flag(0, RecordFlags::READ, true).unwrap());
    let positions = |mailbox: &MboxMailbox| {
        mailbox
            .snapshot()
            .iter()
            .map(|r| (r.offset, r.body_offset, r.length, r.lines))
            .collect::<Vec<_>>()
    };
    let before = positions(&mailbox);

    let err = mailbox.sync_with(&FailOn(1)).unwrap_err();
    assert_eq!(err.kind, ErrorKind::IOFailure);
    assert_eq!(std::fs::read(&path).unwrap(), THREE_MESSAGES);
    assert_eq!(positions(&mailbox), before);
    // The temporary file was removed.
    assert_eq!(std::fs::read_dir(tmp_dir.path()).unwrap().count(), 1);
    assert_eq!(mailbox.state(), SessionState::Open);
    assert!(mailbox.snapshot().get(0).unwrap().is_changed());

    assert_eq!(mailbox.sync().unwrap(), StoreStatus::Success);
    drop(mailbox);
    let mailbox = MboxMailbox::open(&path, settings(&tmp_dir)).unwrap();
    assert_eq!(mailbox.snapshot().len(), 3);
    assert!(mailbox.snapshot().get(0).unwrap().is_read());
}

#[test]
fn test_sync_store_changed_during_rewrite() {
    let tmp_dir = TempDir::new().unwrap();
    let path = write_store(tmp_dir.path(), "inbox", THREE_MESSAGES);
    let mut mailbox = MboxMailbox::open(&path, settings(&tmp_dir)).unwrap();
    let b = mailbox.snapshot().get(1).unwrap().offset;
    assert!(mailbox.set_flag(1, RecordFlags::FLAGGED, true).unwrap());

    let err = mailbox
        .sync_with(&Scribble {
            path: path.clone(),
            offset: b,
        })
        .unwrap_err();
    assert_eq!(err.kind, ErrorKind::Corrupt);
    let saved = tmp_dir.path().join(format!(
        "mailstore.{}-{}-{}",
        current_username(),
        current_hostname(),
        std::process::id()
    ));
    assert_eq!(err.related_path.as_deref(), Some(saved.as_path()));
    assert!(err.summary.contains("Saved partial mailbox"));

    // The rewritten records are kept in the recovery file.
    let partial = std::fs::read(&saved).unwrap();
    assert!(contains(&partial, b"X-Status: F"));
    assert!(contains(&partial, b"Subject: C"));
    assert!(contains(&partial, b"last line"));

    // The store only has what was scribbled on it.
    let mut expected = THREE_MESSAGES.to_vec();
    expected[b as usize..b as usize + 4].copy_from_slice(b"XXXX");
    assert_eq!(std::fs::read(&path).unwrap(), expected);

    assert_eq!(mailbox.state(), SessionState::Closed);
    assert_eq!(mailbox.sync().unwrap_err().kind, ErrorKind::ValueError);
}
