/*
 * mailstore - mbox module.
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

//! In-memory view of a store.
//!
//! A [`MailboxSnapshot`] is built by a full scan of a store and owned by the
//! session that opened it. When the store is found modified by somebody else
//! it is rescanned and the new snapshot is [reconciled](reconcile) with the
//! old one, so that local flag edits survive the reload.

use std::{
    fs::Metadata,
    io::{Read, Seek},
};

use super::{record::MessageRecord, scanner::RecordScanner, RecordFlags, StoreFormat};
use crate::{
    error::{ErrorKind, Result, StoreStatus},
    utils::{
        datetime::{self, UnixTimestamp},
        AbortSignal,
    },
};

/// Size and times of the backing file when it was last loaded or written.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StoreStamp {
    pub size: u64,
    pub mtime: UnixTimestamp,
    pub atime: UnixTimestamp,
}

impl StoreStamp {
    pub fn from_metadata(metadata: &Metadata) -> Self {
        let (mtime, atime) = datetime::file_times(metadata);
        Self {
            size: metadata.len(),
            mtime,
            atime,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MailboxCounts {
    pub total: usize,
    pub unread: usize,
    pub new: usize,
    pub flagged: usize,
    pub deleted: usize,
    pub tagged: usize,
}

impl MailboxCounts {
    fn tally(&mut self, record: &MessageRecord, add: bool) {
        let counters = [
            (&mut self.total, true),
            (&mut self.unread, !record.is_read()),
            (&mut self.new, record.is_new()),
            (&mut self.flagged, record.flags.contains(RecordFlags::FLAGGED)),
            (&mut self.deleted, record.is_deleted()),
            (&mut self.tagged, record.flags.contains(RecordFlags::TAGGED)),
        ];
        for (counter, applies) in counters {
            if !applies {
                continue;
            }
            if add {
                *counter += 1;
            } else {
                *counter = counter.saturating_sub(1);
            }
        }
    }
}

/// How a scan ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScanStatus {
    Complete,
    /// The abort signal was raised; the records loaded so far are valid.
    Aborted,
}

#[derive(Clone, Debug, Default)]
pub struct MailboxSnapshot {
    pub format: StoreFormat,
    pub records: Vec<MessageRecord>,
    pub stamp: StoreStamp,
    pub read_only: bool,
    /// Some record has a persisted flag that differs from the store.
    pub changed: bool,
    pub counts: MailboxCounts,
}

impl MailboxSnapshot {
    pub fn new(format: StoreFormat, read_only: bool) -> Self {
        Self {
            format,
            read_only,
            ..Self::default()
        }
    }

    /// Scan a whole store.
    ///
    /// A corrupt store is an error: no partial snapshot is returned. An
    /// aborted scan returns the records read before the signal was seen.
    pub fn load_full<R: Read + Seek>(
        reader: R,
        format: StoreFormat,
        read_only: bool,
        abort: Option<AbortSignal>,
    ) -> Result<(Self, ScanStatus)> {
        let mut ret = Self::new(format, read_only);
        let mut scanner = RecordScanner::new(reader, format)?;
        if let Some(abort) = abort {
            scanner = scanner.with_abort(abort);
        }
        let status = ret.extend(&mut scanner)?;
        Ok((ret, status))
    }

    /// Append the records of `scanner`, which must start numbering at
    /// [`MailboxSnapshot::len`]. After an abort,
    /// [`RecordScanner::scanned_to`] tells where the records read end.
    pub fn extend<R: Read + Seek>(
        &mut self,
        scanner: &mut RecordScanner<R>,
    ) -> Result<ScanStatus> {
        for record in scanner {
            match record {
                Ok(record) => self.push(record),
                Err(err) if err.kind == ErrorKind::Aborted => {
                    log::debug!("scan aborted after {} records", self.records.len());
                    return Ok(ScanStatus::Aborted);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(ScanStatus::Complete)
    }

    pub fn push(&mut self, mut record: MessageRecord) {
        record.index = self.records.len();
        self.counts.tally(&record, true);
        self.records.push(record);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&MessageRecord> {
        self.records.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MessageRecord> {
        self.records.iter()
    }

    /// There is something for a sync to write.
    pub fn is_dirty(&self) -> bool {
        self.changed || self.counts.deleted > 0
    }

    /// First record a sync has to rewrite.
    pub fn first_dirty(&self) -> Option<usize> {
        self.records
            .iter()
            .position(|r| r.is_deleted() || r.is_changed())
    }

    /// Any record that is neither deleted, read nor old.
    pub fn has_new(&self) -> bool {
        self.records
            .iter()
            .any(|r| !r.flags.intersects(RecordFlags::DELETED | RecordFlags::READ | RecordFlags::OLD))
    }

    /// Recompute [`MailboxSnapshot::counts`] from scratch.
    pub fn recount(&mut self) {
        let mut counts = MailboxCounts::default();
        for record in &self.records {
            counts.tally(record, true);
        }
        self.counts = counts;
    }

    /// Set or clear every flag in `flags` on record `index`, returning
    /// whether anything changed.
    ///
    /// Toggling a persisted flag marks the record `CHANGED`; `DELETED`,
    /// `PURGE` and `TAGGED` are local and only update the counts. Setting
    /// `REPLIED` also sets `READ`. A read-only snapshot refuses deletion.
    pub fn set_flag(&mut self, index: usize, flags: RecordFlags, value: bool) -> Result<bool> {
        let read_only = self.read_only;
        let record = self.records.get_mut(index).ok_or_else(|| {
            crate::error::Error::new(format!("No message with index {}", index))
                .set_kind(ErrorKind::NotFound)
        })?;
        self.counts.tally(record, false);
        let mut update = false;
        let mut persisted = false;
        for flag in flags.iter() {
            let before = record.flags;
            if flag == RecordFlags::DELETED && value && read_only {
                log::debug!("refusing to delete message {} of read-only mailbox", index);
            } else if flag == RecordFlags::REPLIED && value {
                record.flags.insert(RecordFlags::REPLIED | RecordFlags::READ);
            } else if flag == RecordFlags::CHANGED {
                record.flags.set(RecordFlags::CHANGED, value);
                persisted |= value;
            } else {
                record.flags.set(flag, value);
            }
            if record.flags != before {
                update = true;
                persisted |= RecordFlags::PERSISTED.intersects(flag);
            }
        }
        if persisted {
            record.flags.insert(RecordFlags::CHANGED);
            self.changed = true;
        }
        self.counts.tally(record, true);
        Ok(update)
    }

    /// Forget that anything was changed, after the store was written.
    pub fn mark_synced(&mut self) {
        for record in self.records.iter_mut() {
            record.flags.remove(RecordFlags::CHANGED);
        }
        self.changed = false;
    }
}

/// Result of matching a fresh scan against the previous snapshot.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Reconciliation {
    /// For each new record, the index of the old record it matched.
    pub mapping: Vec<Option<usize>>,
    /// Old records with no counterpart in the new scan.
    pub orphaned: Vec<usize>,
    pub status: StoreStatus,
}

impl Reconciliation {
    pub fn any_orphaned(&self) -> bool {
        !self.orphaned.is_empty()
    }
}

/// Match every record of `new` with a record of `old` by fingerprint and carry
/// local state over.
///
/// Old records are searched starting at the index of the new record up to the
/// end and then from the start, which finds the match in one step when
/// messages were only appended or removed. Persisted flags are carried over
/// only from records that had unsaved changes; `DELETED`, `PURGE` and
/// `TAGGED` are always carried over.
///
/// The status is [`StoreStatus::Reopened`] if local changes were carried over
/// or records disappeared, [`StoreStatus::NewMail`] otherwise. A read-only
/// `new` snapshot takes nothing over.
pub fn reconcile(old: &MailboxSnapshot, new: &mut MailboxSnapshot) -> Result<Reconciliation> {
    let mut ret = Reconciliation {
        mapping: vec![None; new.len()],
        ..Reconciliation::default()
    };
    if new.read_only {
        log::debug!("read-only mailbox, not migrating flags");
        ret.status = if new.changed {
            StoreStatus::Reopened
        } else {
            StoreStatus::NewMail
        };
        return Ok(ret);
    }
    let old_len = old.len();
    let mut consumed = vec![false; old_len];
    for i in 0..new.len() {
        let fingerprint = &new.records[i].fingerprint;
        let found = (i..old_len)
            .chain(0..i.min(old_len))
            .find(|&j| !consumed[j] && old.records[j].fingerprint == *fingerprint);
        let Some(j) = found else {
            continue;
        };
        consumed[j] = true;
        ret.mapping[i] = Some(j);
        let old_flags = old.records[j].flags;
        if old_flags.contains(RecordFlags::CHANGED) {
            for flag in [
                RecordFlags::FLAGGED,
                RecordFlags::REPLIED,
                RecordFlags::OLD,
                RecordFlags::READ,
            ] {
                new.set_flag(i, flag, old_flags.contains(flag))?;
            }
        }
        for flag in [RecordFlags::DELETED, RecordFlags::PURGE, RecordFlags::TAGGED] {
            new.set_flag(i, flag, old_flags.contains(flag))?;
        }
    }
    ret.orphaned = consumed
        .iter()
        .enumerate()
        .filter_map(|(j, used)| (!used).then_some(j))
        .collect();
    if ret.any_orphaned() {
        log::debug!(
            "{} message(s) disappeared from the mailbox: {:?}",
            ret.orphaned.len(),
            ret.orphaned
        );
    }
    ret.status = if new.changed || ret.any_orphaned() {
        StoreStatus::Reopened
    } else {
        StoreStatus::NewMail
    };
    Ok(ret)
}
