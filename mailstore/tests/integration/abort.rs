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

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use mailstore::{
    mbox::{
        headers::HeaderSource, session::SessionState, Envelope, HeaderParser, MboxMailbox,
        MboxSettings, RecordFlags, Rfc822HeaderParser, ScanStatus,
    },
    utils::AbortSignal,
    Result, StoreStatus,
};
use tempfile::TempDir;

use crate::{write_store, THREE_MESSAGES};

/// Raises `abort` while parsing the `raise_at`-th header block it is given.
#[derive(Debug)]
struct RaiseAbort {
    abort: AbortSignal,
    raise_at: usize,
    parsed: AtomicUsize,
}

impl RaiseAbort {
    fn new(abort: &AbortSignal, raise_at: usize) -> Arc<Self> {
        Arc::new(Self {
            abort: abort.clone(),
            raise_at,
            parsed: AtomicUsize::new(0),
        })
    }
}

impl HeaderParser for RaiseAbort {
    fn parse(&self, reader: &mut dyn HeaderSource) -> Result<Envelope> {
        if self.parsed.fetch_add(1, Ordering::SeqCst) + 1 == self.raise_at {
            self.abort.raise();
        }
        Rfc822HeaderParser.parse(reader)
    }
}

fn settings(tmp_dir: &TempDir) -> MboxSettings {
    MboxSettings {
        tmpdir: tmp_dir.path().to_path_buf(),
        ..MboxSettings::default()
    }
}

fn offset_of(needle: &[u8]) -> usize {
    THREE_MESSAGES
        .windows(needle.len())
        .position(|w| w == needle)
        .unwrap()
}

#[test]
fn test_aborted_load_is_resumed_before_sync() {
    let tmp_dir = TempDir::new().unwrap();
    let path = write_store(tmp_dir.path(), "inbox", THREE_MESSAGES);
    let b = offset_of(b"From bob@");
    let abort = AbortSignal::new();
    let mut mailbox = MboxMailbox::new(&path, settings(&tmp_dir))
        .with_parser(RaiseAbort::new(&abort, 1))
        .with_abort(abort.clone());

    assert_eq!(mailbox.load().unwrap(), ScanStatus::Aborted);
    assert_eq!(mailbox.snapshot().len(), 1);
    // Only the bytes of the loaded record are accounted for.
    assert_eq!(mailbox.snapshot().stamp.size, b as u64);

    assert!(mailbox.set_flag(0, RecordFlags::READ, true).unwrap());
    // The rest of the store is scanned first, and that is aborted as well.
    assert_eq!(mailbox.sync().unwrap(), StoreStatus::Aborted);
    assert_eq!(std::fs::read(&path).unwrap(), THREE_MESSAGES);
    assert_eq!(mailbox.snapshot().len(), 1);
    assert_eq!(mailbox.snapshot().stamp.size, b as u64);

    abort.reset();
    assert_eq!(mailbox.check().unwrap(), StoreStatus::NewMail);
    assert_eq!(mailbox.snapshot().len(), 3);
    assert!(mailbox.snapshot().get(0).unwrap().is_changed());
    assert_eq!(mailbox.sync().unwrap(), StoreStatus::Success);

    let contents = std::fs::read(&path).unwrap();
    for subject in [&b"Subject: B"[..], b"Subject: C", b"third message"] {
        assert!(contents.windows(subject.len()).any(|w| w == subject));
    }
    let reopened = MboxMailbox::open(&path, settings(&tmp_dir)).unwrap();
    assert_eq!(reopened.snapshot().len(), 3);
    assert!(reopened.snapshot().get(0).unwrap().is_read());
}

#[test]
fn test_aborted_reopen_keeps_snapshot() {
    let tmp_dir = TempDir::new().unwrap();
    let path = write_store(tmp_dir.path(), "inbox", THREE_MESSAGES);
    let (b, c) = (offset_of(b"From bob@"), offset_of(b"From carol@"));
    let abort = AbortSignal::new();
    // Headers 1 to 3 are read by the load, the 4th by the rescan.
    let mut mailbox = MboxMailbox::new(&path, settings(&tmp_dir))
        .with_parser(RaiseAbort::new(&abort, 4))
        .with_abort(abort.clone());
    assert_eq!(mailbox.load().unwrap(), ScanStatus::Complete);
    assert!(mailbox.set_flag(2, RecordFlags::DELETED, true).unwrap());

    // Someone else removes B.
    let without_b = [&THREE_MESSAGES[..b], &THREE_MESSAGES[c..]].concat();
    std::fs::write(&path, &without_b).unwrap();

    assert_eq!(mailbox.check().unwrap(), StoreStatus::Aborted);
    assert_eq!(mailbox.state(), SessionState::Open);
    assert_eq!(mailbox.snapshot().len(), 3);
    assert!(mailbox.snapshot().get(2).unwrap().is_deleted());

    // Nothing is written over a store that could not be rescanned.
    assert_eq!(mailbox.sync().unwrap(), StoreStatus::Aborted);
    assert_eq!(std::fs::read(&path).unwrap(), without_b);

    abort.reset();
    assert_eq!(mailbox.check().unwrap(), StoreStatus::Reopened);
    assert_eq!(mailbox.snapshot().len(), 2);
    let carol = mailbox.snapshot().get(1).unwrap();
    assert_eq!(carol.envelope.subject.as_deref(), Some("C"));
    assert!(carol.is_deleted());

    assert_eq!(mailbox.sync().unwrap(), StoreStatus::Success);
    assert_eq!(std::fs::read(&path).unwrap(), &THREE_MESSAGES[..b]);
}
