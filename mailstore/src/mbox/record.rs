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

use std::path::PathBuf;

use super::{headers::Envelope, FromLine};
use crate::utils::datetime::UnixTimestamp;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
    pub struct RecordFlags: u16 {
        const READ     = 0b0000_0001;
        const OLD      = 0b0000_0010;
        const DELETED  = 0b0000_0100;
        const FLAGGED  = 0b0000_1000;
        const REPLIED  = 0b0001_0000;
        const TAGGED   = 0b0010_0000;
        /// Deleted and not kept in a trash folder.
        const PURGE    = 0b0100_0000;
        /// Some persisted flag differs from what is stored.
        const CHANGED  = 0b1000_0000;
    }
}

impl RecordFlags {
    /// Flags that are written back to the store and so mark a record
    /// `CHANGED` when they are toggled.
    pub const PERSISTED: Self = Self::READ
        .union(Self::OLD)
        .union(Self::FLAGGED)
        .union(Self::REPLIED);

    /// Flags that represent local intent and always survive a reload.
    pub const LOCAL_INTENT: Self = Self::DELETED.union(Self::PURGE).union(Self::TAGGED);
}

/// Identity of a message that is independent of its position in the store.
///
/// Two records with equal fingerprints are considered the same message when a
/// store is reloaded.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct Fingerprint {
    pub received: UnixTimestamp,
    pub date: Option<String>,
    pub length: i64,
    pub lines: i64,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    pub subject: Option<String>,
    pub references: Option<String>,
    pub from: Option<String>,
    pub sender: Option<String>,
    pub reply_to: Option<String>,
    pub to: Option<String>,
    pub cc: Option<String>,
    pub return_path: Option<String>,
}

impl Fingerprint {
    pub fn new(envelope: &Envelope, received: UnixTimestamp, length: i64, lines: i64) -> Self {
        Self {
            received,
            date: envelope.date.clone(),
            length,
            lines,
            content_type: envelope.content_type.clone(),
            message_id: envelope.message_id.clone(),
            subject: envelope.subject.clone(),
            references: envelope.references.clone(),
            from: envelope.from.clone(),
            sender: envelope.sender.clone(),
            reply_to: envelope.reply_to.clone(),
            to: envelope.to.clone(),
            cc: envelope.cc.clone(),
            return_path: envelope.return_path.clone(),
        }
    }
}

/// Where the bytes of a message live for an index-backed mailbox.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct IndexHandle {
    /// Message id in the index.
    pub virtual_id: String,
    /// Maildir folder the file is in.
    pub folder: PathBuf,
    /// Current file of the message.
    pub path: PathBuf,
    /// Set when the file was found renamed; the index still has this name.
    pub old_path: Option<PathBuf>,
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StoreHandle {
    /// A record of a flat file; carries its `From_` line if it had one.
    FlatFile(Option<FromLine>),
    Indexed(IndexHandle),
}

impl Default for StoreHandle {
    fn default() -> Self {
        Self::FlatFile(None)
    }
}

/// One message of a store.
#[derive(Clone, Debug, Default)]
pub struct MessageRecord {
    /// Position in the snapshot.
    pub index: usize,
    /// Byte offset of the header block.
    pub offset: u64,
    /// Byte offset of the body.
    pub body_offset: u64,
    /// Body length in bytes, `-1` while unknown.
    pub length: i64,
    pub lines: i64,
    pub flags: RecordFlags,
    pub fingerprint: Fingerprint,
    pub envelope: Envelope,
    pub handle: StoreHandle,
    /// Cleared when a record is not seen again during an index check.
    pub active: bool,
}

impl MessageRecord {
    pub fn new(index: usize, offset: u64) -> Self {
        Self {
            index,
            offset,
            length: -1,
            active: true,
            ..Self::default()
        }
    }

    /// Load the flags stored in the header block.
    pub fn set_flags_from_envelope(&mut self) {
        let status = self.envelope.status;
        self.flags.set(RecordFlags::READ, status.read);
        self.flags.set(RecordFlags::OLD, status.old);
        self.flags.set(RecordFlags::REPLIED, status.replied);
        self.flags.set(RecordFlags::FLAGGED, status.flagged);
        self.flags.set(RecordFlags::DELETED, status.deleted);
    }

    /// Compute the fingerprint from the envelope and the final length and
    /// line count.
    pub fn update_fingerprint(&mut self) {
        let received = match (&self.handle, self.envelope.received) {
            (StoreHandle::FlatFile(Some(from)), _) => from.received,
            (_, Some(received)) => received,
            _ => 0,
        };
        self.fingerprint = Fingerprint::new(&self.envelope, received, self.length, self.lines);
    }

    #[inline]
    pub fn is_deleted(&self) -> bool {
        self.flags.contains(RecordFlags::DELETED)
    }

    #[inline]
    pub fn is_changed(&self) -> bool {
        self.flags.contains(RecordFlags::CHANGED)
    }

    #[inline]
    pub fn is_read(&self) -> bool {
        self.flags.contains(RecordFlags::READ)
    }

    /// Neither read nor old.
    #[inline]
    pub fn is_new(&self) -> bool {
        !self
            .flags
            .intersects(RecordFlags::READ | RecordFlags::OLD | RecordFlags::DELETED)
    }

    /// On-disk span of the record: header block, body and trailing framing.
    pub fn span(&self, padding: u64) -> u64 {
        (self.body_offset - self.offset) + self.length.max(0) as u64 + padding
    }

    pub fn index_handle(&self) -> Option<&IndexHandle> {
        match self.handle {
            StoreHandle::Indexed(ref h) => Some(h),
            StoreHandle::FlatFile(_) => None,
        }
    }

    pub fn index_handle_mut(&mut self) -> Option<&mut IndexHandle> {
        match self.handle {
            StoreHandle::Indexed(ref mut h) => Some(h),
            StoreHandle::FlatFile(_) => None,
        }
    }
}
