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

//! An open flat-file store.
//!
//! [`MboxMailbox`] owns the file handle, the lock taken on it and the
//! [`MailboxSnapshot`] loaded from it. All advisory locks of a session are
//! taken on that one handle: open file description locks belong to the
//! handle, so a second handle of the same process would conflict with them.

use std::{
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use super::{
    headers::{HeaderParser, Rfc822HeaderParser},
    probe_path,
    record::{MessageRecord, RecordFlags},
    scanner::RecordScanner,
    snapshot::{reconcile, MailboxSnapshot, Reconciliation, ScanStatus, StoreStamp},
    MboxSettings, StoreFormat,
};
use crate::{
    conf::StoreSettings,
    error::{Error, ErrorKind, Result, ResultIntoError, StoreStatus},
    utils::{
        datetime::UnixTimestamp,
        lock::{FileLockOptions, LockKind, LockState},
        AbortSignal,
    },
};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SessionState {
    #[default]
    Unopened,
    Open,
    /// Rescanning after the store was modified by someone else.
    Reopening,
    Closed,
}

pub struct MboxMailbox {
    pub(super) path: PathBuf,
    pub(super) settings: MboxSettings,
    pub(super) format: StoreFormat,
    pub(super) file: Option<File>,
    pub(super) lock: LockState,
    pub(super) snapshot: MailboxSnapshot,
    pub(super) state: SessionState,
    abort: AbortSignal,
    parser: Arc<dyn HeaderParser>,
}

impl std::fmt::Debug for MboxMailbox {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct(stringify!(MboxMailbox))
            .field("path", &self.path)
            .field("format", &self.format)
            .field("state", &self.state)
            .field("lock", &self.lock)
            .field("records", &self.snapshot.len())
            .field("read_only", &self.snapshot.read_only)
            .finish()
    }
}

impl MboxMailbox {
    /// A session for the store at `path` that is not opened yet.
    pub fn new(path: &Path, settings: MboxSettings) -> Self {
        let read_only = settings.read_only;
        Self {
            path: path.to_path_buf(),
            format: settings.prefer_format.unwrap_or_default(),
            settings,
            file: None,
            lock: LockState::new(),
            snapshot: MailboxSnapshot::new(StoreFormat::default(), read_only),
            state: SessionState::Unopened,
            abort: AbortSignal::new(),
            parser: Arc::new(Rfc822HeaderParser),
        }
    }

    pub fn with_parser(mut self, parser: Arc<dyn HeaderParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Scans watch `abort` and stop early once it is raised.
    pub fn with_abort(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    /// Open and load the store at `path`.
    pub fn open(path: &Path, settings: MboxSettings) -> Result<Self> {
        let mut ret = Self::new(path, settings);
        ret.load()?;
        Ok(ret)
    }

    /// Open the store a [`StoreSettings`] table describes.
    pub fn from_settings(s: &StoreSettings) -> Result<Self> {
        s.validate()?;
        let path = s.root_path();
        if !path.try_exists().unwrap_or(false) {
            return Err(Error::new(format!(
                "\"root_mailbox\" {} for store {} is not a valid path.",
                s.root_mailbox.as_str(),
                s.name
            ))
            .set_kind(ErrorKind::Configuration));
        }
        let mut settings = MboxSettings::new(s)?;
        if settings.prefer_format.is_none() && s.format.eq_ignore_ascii_case("mmdf") {
            settings.prefer_format = Some(StoreFormat::Mmdf);
        }
        Self::open(&path, settings)
    }

    /// Open the file and scan it. Takes a shared lock for the duration of the
    /// scan; if it cannot be taken the session becomes read-only instead of
    /// failing.
    pub fn load(&mut self) -> Result<ScanStatus> {
        if self.state != SessionState::Unopened {
            return Err(Error::new("Mailbox session was already opened").set_kind(ErrorKind::Bug));
        }
        let mut read_only = self.settings.read_only;
        let file = self.open_file(&mut read_only)?;
        let metadata = file.metadata()?;
        self.format = match self.settings.prefer_format {
            Some(format) => format,
            None if metadata.len() == 0 => StoreFormat::default(),
            None => probe_path(&self.path, self.settings.check_recent).ok_or_else(|| {
                Error::new(format!("{} is not a mbox or MMDF file", self.path.display()))
                    .set_kind(ErrorKind::ValueError)
                    .set_related_path(Some(&self.path))
            })?,
        };
        if let Err(err) = self.lock.acquire(
            &file,
            LockKind::Shared,
            self.settings.lock_options(),
            &self.path,
        ) {
            log::warn!(
                "{}: {}, opening read-only",
                self.path.display(),
                err.summary
            );
            read_only = true;
        }
        self.file = Some(file);
        let ret = self.scan(read_only);
        self.release_lock();
        let (snapshot, status) = match ret {
            Ok(ok) => ok,
            Err(err) => {
                self.file = None;
                self.state = SessionState::Closed;
                return Err(err);
            }
        };
        log::debug!(
            "loaded {} {} records from {}{}",
            snapshot.len(),
            self.format,
            self.path.display(),
            if snapshot.read_only { " (read-only)" } else { "" }
        );
        self.snapshot = snapshot;
        self.state = SessionState::Open;
        Ok(status)
    }

    fn open_file(&self, read_only: &mut bool) -> Result<File> {
        if !*read_only {
            match OpenOptions::new().read(true).write(true).open(&self.path) {
                Ok(file) => return Ok(file),
                Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                    log::debug!("{} is not writable, opening read-only", self.path.display());
                    *read_only = true;
                }
                Err(err) => return Err(Error::from(err).set_related_path(Some(&self.path))),
            }
        }
        File::open(&self.path).chain_err_related_path(&self.path)
    }

    fn file(&self) -> Result<&File> {
        self.file.as_ref().ok_or_else(Self::closed_error)
    }

    fn closed_error() -> Error {
        Error::new("Mailbox session is closed").set_kind(ErrorKind::ValueError)
    }

    pub(super) fn ensure_open(&self) -> Result<()> {
        if self.state == SessionState::Open && self.file.is_some() {
            Ok(())
        } else {
            Err(Self::closed_error())
        }
    }

    fn scanner_at<'f>(
        file: &'f File,
        format: StoreFormat,
        parser: &Arc<dyn HeaderParser>,
        abort: &AbortSignal,
        offset: u64,
        first_index: usize,
    ) -> Result<RecordScanner<&'f File>> {
        Ok(RecordScanner::new_at(file, format, offset, first_index)?
            .with_parser(parser.clone())
            .with_abort(abort.clone()))
    }

    /// Scan the whole file into a new snapshot.
    ///
    /// After an abort the stamp only covers the records that were read, so
    /// that the next [`MboxMailbox::check`] scans the rest as new mail.
    fn scan(&self, read_only: bool) -> Result<(MailboxSnapshot, ScanStatus)> {
        let metadata = self.file()?.metadata()?;
        let mut snapshot = MailboxSnapshot::new(self.format, read_only);
        let mut scanner =
            Self::scanner_at(self.file()?, self.format, &self.parser, &self.abort, 0, 0)?;
        let status = snapshot.extend(&mut scanner)?;
        let size = match status {
            ScanStatus::Complete => scanner.size(),
            ScanStatus::Aborted => scanner.scanned_to(),
        };
        snapshot.stamp = StoreStamp {
            size,
            ..StoreStamp::from_metadata(&metadata)
        };
        Ok((snapshot, status))
    }

    pub(super) fn lock_store(&mut self, kind: LockKind, options: FileLockOptions) -> Result<()> {
        let file = self.file.as_ref().ok_or_else(Self::closed_error)?;
        self.lock.acquire(file, kind, options, &self.path)
    }

    /// Drop the lock if one is held. Failures are logged: there is nothing a
    /// caller could do about them.
    pub(super) fn release_lock(&mut self) {
        if let Some(file) = self.file.as_mut() {
            if let Err(err) = self.lock.release(file) {
                log::warn!("could not unlock {}: {}", self.path.display(), err);
            }
        }
    }

    /// Detect changes made to the store by somebody else.
    ///
    /// - unchanged size and modification time: [`StoreStatus::Success`]
    /// - unchanged size: the new modification time is adopted,
    ///   [`StoreStatus::Success`]
    /// - grown, with a record starting at the old end: only the new records
    ///   are scanned, [`StoreStatus::NewMail`]
    /// - otherwise the store is rescanned and reconciled,
    ///   [`StoreStatus::Reopened`]
    ///
    /// [`StoreStatus::Aborted`] is returned when the abort signal stops a
    /// scan. Records appended before that point are kept; an aborted rescan
    /// keeps the previous snapshot. Either way the next check resumes.
    ///
    /// [`StoreStatus::Locked`] is returned when a lock is needed and cannot
    /// be taken. If the rescan fails the session is closed and the error
    /// (of kind [`ErrorKind::Corrupt`] for a corrupt store) returned.
    pub fn check(&mut self) -> Result<StoreStatus> {
        self.ensure_open()?;
        let metadata = match std::fs::metadata(&self.path) {
            Ok(metadata) => metadata,
            Err(err) => {
                log::debug!("could not stat {}: {}", self.path.display(), err);
                return self.fail(
                    Error::from(err)
                        .set_summary("Mailbox was corrupted")
                        .set_kind(ErrorKind::Corrupt),
                );
            }
        };
        let current = StoreStamp::from_metadata(&metadata);
        let stamp = self.snapshot.stamp;
        if current.mtime == stamp.mtime && current.size == stamp.size {
            return Ok(StoreStatus::Success);
        }
        if current.size == stamp.size {
            self.snapshot.stamp.mtime = current.mtime;
            return Ok(StoreStatus::Success);
        }

        let mut unlock = false;
        if !self.lock.is_held() {
            if let Err(err) = self.lock_store(LockKind::Shared, FileLockOptions::try_once()) {
                log::debug!("{}: {}", self.path.display(), err);
                return Ok(StoreStatus::Locked);
            }
            unlock = true;
        }

        if current.size > stamp.size {
            match self.scan_tail(stamp.size, current.mtime) {
                Ok(Some(status)) => {
                    if unlock {
                        self.release_lock();
                    }
                    return Ok(match status {
                        ScanStatus::Complete => StoreStatus::NewMail,
                        ScanStatus::Aborted => StoreStatus::Aborted,
                    });
                }
                Ok(None) => {}
                Err(err) => {
                    log::debug!("could not read appended records: {}", err);
                }
            }
        } else {
            log::debug!(
                "{} shrunk from {} to {} bytes",
                self.path.display(),
                stamp.size,
                current.size
            );
        }

        let ret = match self.reopen() {
            Ok(_) => StoreStatus::Reopened,
            Err(err) if err.kind == ErrorKind::Aborted => {
                log::debug!("reopen of {} aborted", self.path.display());
                StoreStatus::Aborted
            }
            Err(err) => {
                return self.fail(
                    err.set_summary("Mailbox was corrupted")
                        .set_kind(ErrorKind::Corrupt),
                );
            }
        };
        if unlock {
            self.release_lock();
        }
        Ok(ret)
    }

    /// Close the session and return `err`.
    fn fail<T>(&mut self, err: Error) -> Result<T> {
        log::error!("{}: {}", self.path.display(), err);
        self.close();
        Err(err)
    }

    /// If a record starts at byte `old_size`, scan the records from there on.
    /// Returns how the scan ended, or `None` if there was no record to scan.
    fn scan_tail(
        &mut self,
        old_size: u64,
        mtime: UnixTimestamp,
    ) -> Result<Option<ScanStatus>> {
        {
            let mut file = self.file()?;
            file.seek(SeekFrom::Start(old_size))?;
            let mut line = Vec::with_capacity(64);
            BufReader::new(file).read_until(b'\n', &mut line)?;
            if !self.format.is_record_start(&line) {
                log::debug!(
                    "{}: no record at old end of file {}, found {:?}",
                    self.path.display(),
                    old_size,
                    String::from_utf8_lossy(&line).trim_end()
                );
                return Ok(None);
            }
        }
        let before = self.snapshot.len();
        let file = self.file.as_ref().ok_or_else(Self::closed_error)?;
        let mut scanner =
            Self::scanner_at(file, self.format, &self.parser, &self.abort, old_size, before)?;
        let status = match self.snapshot.extend(&mut scanner) {
            Ok(status) => status,
            Err(err) => {
                self.snapshot.records.truncate(before);
                self.snapshot.recount();
                return Err(err);
            }
        };
        self.snapshot.stamp.size = match status {
            ScanStatus::Complete => scanner.size(),
            ScanStatus::Aborted => scanner.scanned_to(),
        };
        self.snapshot.stamp.mtime = mtime;
        log::debug!(
            "{}: {} new record(s){}",
            self.path.display(),
            self.snapshot.len() - before,
            if status == ScanStatus::Aborted {
                " (aborted)"
            } else {
                ""
            }
        );
        Ok(Some(status))
    }

    /// Reopen the file, rescan it and reconcile the result with the current
    /// snapshot.
    ///
    /// A lock held before is held again on the new handle afterwards. If the
    /// rescan is aborted the current snapshot is kept unchanged and an error
    /// of kind [`ErrorKind::Aborted`] is returned.
    pub fn reopen(&mut self) -> Result<Reconciliation> {
        self.ensure_open()?;
        self.state = SessionState::Reopening;
        let ret = self.reopen_inner();
        if self.state == SessionState::Reopening {
            self.state = SessionState::Open;
        }
        ret
    }

    fn reopen_inner(&mut self) -> Result<Reconciliation> {
        let relock = self.lock.is_held().then(|| {
            if self.lock.is_exclusive() {
                LockKind::Exclusive
            } else {
                LockKind::Shared
            }
        });
        self.release_lock();
        let mut read_only = self.snapshot.read_only;
        let file = self.open_file(&mut read_only)?;
        self.file = Some(file);
        if let Some(kind) = relock {
            self.lock_store(kind, self.settings.lock_options())?;
        }
        let (mut snapshot, status) = self.scan(read_only)?;
        if status == ScanStatus::Aborted {
            log::debug!(
                "rescan of {} aborted after {} records",
                self.path.display(),
                snapshot.len()
            );
            return Err(Error::new(format!(
                "Rescan of {} was aborted",
                self.path.display()
            ))
            .set_kind(ErrorKind::Aborted));
        }
        let rec = reconcile(&self.snapshot, &mut snapshot)?;
        log::debug!(
            "reopened {}: {} records, {} orphaned, {}",
            self.path.display(),
            snapshot.len(),
            rec.orphaned.len(),
            rec.status
        );
        self.snapshot = snapshot;
        Ok(rec)
    }

    /// Set or clear `flags` on record `index`. See
    /// [`MailboxSnapshot::set_flag`].
    pub fn set_flag(&mut self, index: usize, flags: RecordFlags, value: bool) -> Result<bool> {
        self.ensure_open()?;
        self.snapshot.set_flag(index, flags, value)
    }

    /// Release the lock and the file. Further operations fail.
    pub fn close(&mut self) {
        self.release_lock();
        self.file = None;
        self.state = SessionState::Closed;
    }

    /// Raw bytes of a record: its header block, `From_` line included, and
    /// its body.
    pub fn message_bytes(&mut self, index: usize) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let record: &MessageRecord = self.snapshot.get(index).ok_or_else(|| {
            Error::new(format!("No message with index {}", index)).set_kind(ErrorKind::NotFound)
        })?;
        let (offset, len) = (
            record.offset,
            record.body_offset - record.offset + record.length.max(0) as u64,
        );
        let unlock = !self.lock.is_held();
        if unlock {
            self.lock_store(LockKind::Shared, FileLockOptions::try_thrice())?;
        }
        let ret = (|| -> Result<Vec<u8>> {
            let mut file = self.file()?;
            file.seek(SeekFrom::Start(offset))?;
            let mut ret = Vec::with_capacity(len as usize);
            file.take(len).read_to_end(&mut ret)?;
            Ok(ret)
        })();
        if unlock {
            self.release_lock();
        }
        ret
    }

    /// Deliver a message to the end of the store.
    ///
    /// The new record is seen by the next [`MboxMailbox::check`].
    pub fn append_message(
        &mut self,
        bytes: &[u8],
        envelope_from: Option<&str>,
        received: Option<UnixTimestamp>,
    ) -> Result<()> {
        self.ensure_open()?;
        if self.snapshot.read_only {
            return Err(Error::new(format!(
                "Cannot append to read-only mailbox {}",
                self.path.display()
            ))
            .set_kind(ErrorKind::ReadOnly));
        }
        let previous = self.lock.is_held().then(|| self.lock.is_exclusive());
        self.lock_store(LockKind::Exclusive, self.settings.lock_options())?;
        let format = self.format;
        let ret = (|| -> Result<()> {
            let mut file = self.file()?;
            file.seek(SeekFrom::End(0))?;
            let mut writer = BufWriter::new(file);
            format.append(&mut writer, bytes, envelope_from, received)?;
            writer.flush()?;
            file.sync_all()?;
            Ok(())
        })();
        match previous {
            None => self.release_lock(),
            Some(false) => {
                if let Err(err) = self.lock_store(LockKind::Shared, FileLockOptions::try_once()) {
                    log::warn!("could not downgrade lock of {}: {}", self.path.display(), err);
                }
            }
            Some(true) => {}
        }
        ret.chain_err_related_path(&self.path)
    }

    pub fn has_new(&self) -> bool {
        self.snapshot.has_new()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> StoreFormat {
        self.format
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_read_only(&self) -> bool {
        self.snapshot.read_only
    }

    pub fn snapshot(&self) -> &MailboxSnapshot {
        &self.snapshot
    }

    pub fn settings(&self) -> &MboxSettings {
        &self.settings
    }
}

impl Drop for MboxMailbox {
    fn drop(&mut self) {
        self.release_lock();
    }
}
