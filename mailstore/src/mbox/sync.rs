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

//! Writing a snapshot back to its store.
//!
//! Everything before the first deleted or changed record stays where it is.
//! The records from there on are copied to a temporary file, which is then
//! copied over the store starting at that record, and the store is truncated
//! to its new length.
//!
//! Until the copy back starts the store is untouched, and a failure only
//! removes the temporary file. If the copy back fails the temporary file is
//! kept under a recovery name that the error carries in
//! [`Error::related_path`].

use std::{
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
};

use super::{
    headers::HeaderSource,
    record::{MessageRecord, RecordFlags},
    session::MboxMailbox,
    set_file_times,
    snapshot::{MailboxSnapshot, StoreStamp},
    StoreFormat, MMDF_SEP,
};
use crate::{
    error::{Error, ErrorKind, Result, ResultIntoError, StoreStatus},
    utils::{
        current_hostname, current_username,
        datetime::{self, UnixTimestamp},
        lock::LockKind,
    },
};

/// Copies one record, without its framing, to the rewritten store.
///
/// Implementations must write the body of `record` unchanged and last: the
/// new body offset is computed from the bytes written and the body length.
pub trait MessageWriter {
    fn write_message(
        &self,
        source: &mut dyn HeaderSource,
        record: &MessageRecord,
        dest: &mut dyn Write,
    ) -> Result<()>;
}

/// The default [`MessageWriter`].
///
/// Records without local changes are copied byte for byte. The header block of
/// a changed record is rewritten with `Status:` and `X-Status:` fields for its
/// current flags and with its `Content-Length:` and `Lines:`.
#[derive(Clone, Copy, Debug, Default)]
pub struct CopyMessage;

impl CopyMessage {
    const REGENERATED: [&'static [u8]; 4] = [b"status:", b"x-status:", b"content-length:", b"lines:"];

    fn is_regenerated(line: &[u8]) -> bool {
        Self::REGENERATED
            .iter()
            .any(|h| line.len() >= h.len() && line[..h.len()].eq_ignore_ascii_case(h))
    }

    fn write_headers(
        source: &mut dyn HeaderSource,
        record: &MessageRecord,
        dest: &mut dyn Write,
    ) -> Result<()> {
        let mut line = Vec::with_capacity(256);
        let mut skipping = false;
        while source.stream_position()? < record.body_offset {
            line.clear();
            if source.read_until(b'\n', &mut line)? == 0 {
                break;
            }
            if matches!(line.as_slice(), b"\n" | b"\r\n") {
                break;
            }
            if matches!(line[0], b' ' | b'\t') {
                if !skipping {
                    dest.write_all(&line)?;
                }
                continue;
            }
            skipping = Self::is_regenerated(&line);
            if !skipping {
                dest.write_all(&line)?;
                if !line.ends_with(b"\n") {
                    dest.write_all(b"\n")?;
                }
            }
        }

        let (read, old, replied, flagged) = (
            record.is_read(),
            record.flags.contains(RecordFlags::OLD),
            record.flags.contains(RecordFlags::REPLIED),
            record.flags.contains(RecordFlags::FLAGGED),
        );
        if read || old {
            dest.write_all(b"Status: ")?;
            if read {
                dest.write_all(b"R")?;
            }
            if old {
                dest.write_all(b"O")?;
            }
            dest.write_all(b"\n")?;
        }
        if replied || flagged {
            dest.write_all(b"X-Status: ")?;
            if replied {
                dest.write_all(b"A")?;
            }
            if flagged {
                dest.write_all(b"F")?;
            }
            dest.write_all(b"\n")?;
        }
        writeln!(dest, "Content-Length: {}", record.length)?;
        if record.lines != 0 || record.length == 0 {
            writeln!(dest, "Lines: {}", record.lines)?;
        }
        dest.write_all(b"\n")?;
        Ok(())
    }
}

fn copy_exact(source: &mut dyn HeaderSource, dest: &mut dyn Write, len: u64) -> Result<()> {
    let copied = std::io::copy(&mut source.take(len), dest)?;
    if copied != len {
        return Err(Error::new(format!(
            "Short read: expected {} bytes, got {}",
            len, copied
        ))
        .set_kind(ErrorKind::IOFailure));
    }
    Ok(())
}

impl MessageWriter for CopyMessage {
    fn write_message(
        &self,
        source: &mut dyn HeaderSource,
        record: &MessageRecord,
        dest: &mut dyn Write,
    ) -> Result<()> {
        source.seek(SeekFrom::Start(record.offset))?;
        if !record.is_changed() {
            let len = record.body_offset - record.offset + record.length.max(0) as u64;
            return copy_exact(source, dest, len);
        }
        Self::write_headers(source, record, dest)?;
        source.seek(SeekFrom::Start(record.body_offset))?;
        copy_exact(source, dest, record.length.max(0) as u64)
    }
}

/// A [`Write`] adaptor that counts the bytes written through it.
struct CountingWriter<W: Write> {
    inner: W,
    written: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[derive(Clone, Copy, Debug)]
struct OffsetBackup {
    offset: u64,
    body_offset: u64,
    length: i64,
    lines: i64,
}

/// State of one rewrite.
#[derive(Debug)]
struct RewritePlan {
    /// First record that is rewritten.
    first: usize,
    /// Where in the store the rewritten part starts.
    offset: u64,
    /// Positions of records `first..` before the rewrite.
    backup: Vec<OffsetBackup>,
    tmp_path: PathBuf,
}

impl RewritePlan {
    fn new(snapshot: &MailboxSnapshot, first: usize, tmpdir: &Path) -> Self {
        let mut offset = snapshot.records[first].offset;
        // The offset of an MMDF record is past its separator.
        if snapshot.format == StoreFormat::Mmdf {
            offset -= MMDF_SEP.len() as u64;
        }
        Self {
            first,
            offset,
            backup: Vec::with_capacity(snapshot.len() - first),
            tmp_path: tmpdir.join(format!(
                "mailstore-{}",
                uuid::Uuid::new_v4().as_simple()
            )),
        }
    }

    /// Put back the positions of every record touched so far.
    fn restore(&self, snapshot: &mut MailboxSnapshot) {
        for (record, saved) in snapshot.records[self.first..]
            .iter_mut()
            .zip(self.backup.iter())
        {
            record.offset = saved.offset;
            record.body_offset = saved.body_offset;
            record.length = saved.length;
            record.lines = saved.lines;
        }
    }

    /// Copy records `first..` to `out`, moving their offsets to where they
    /// will be once `out` is copied back at `offset`.
    fn write_records(
        &mut self,
        store: &File,
        snapshot: &mut MailboxSnapshot,
        writer: &dyn MessageWriter,
        out: &mut CountingWriter<BufWriter<File>>,
    ) -> Result<()> {
        let format = snapshot.format;
        let mut source = BufReader::new(store);
        for record in snapshot.records[self.first..].iter_mut() {
            self.backup.push(OffsetBackup {
                offset: record.offset,
                body_offset: record.body_offset,
                length: record.length,
                lines: record.lines,
            });
            if record.is_deleted() {
                continue;
            }
            if format == StoreFormat::Mmdf {
                out.write_all(MMDF_SEP)?;
            }
            let hdr = out.written + self.offset;
            writer.write_message(&mut source, record, out)?;
            let body = out.written - record.length.max(0) as u64 + self.offset;
            match format {
                StoreFormat::Mmdf => out.write_all(MMDF_SEP)?,
                StoreFormat::Mbox => out.write_all(b"\n")?,
            }
            record.offset = hdr;
            record.body_offset = body;
        }
        out.flush()?;
        Ok(())
    }
}

impl MboxMailbox {
    /// Write local changes back with [`CopyMessage`].
    pub fn sync(&mut self) -> Result<StoreStatus> {
        self.sync_with(&CopyMessage)
    }

    /// Write local changes back to the store.
    ///
    /// Returns [`StoreStatus::NewMail`] or [`StoreStatus::Reopened`] without
    /// writing anything if the store was modified since it was loaded; the
    /// caller should look at the snapshot again and retry. A snapshot whose
    /// load was aborted does not cover the whole store: the check scans the
    /// rest first, and [`StoreStatus::Aborted`] is returned if that is
    /// aborted too.
    pub fn sync_with(&mut self, writer: &dyn MessageWriter) -> Result<StoreStatus> {
        self.ensure_open()?;
        if !self.snapshot.is_dirty() {
            return Ok(StoreStatus::Success);
        }
        if self.snapshot.read_only {
            return Err(Error::new(format!(
                "Cannot write read-only mailbox {}",
                self.path.display()
            ))
            .set_kind(ErrorKind::ReadOnly));
        }
        self.lock_store(LockKind::Exclusive, self.settings.lock_options())
            .chain_err_summary(|| "Unable to lock mailbox")?;
        let ret = self.sync_locked(writer);
        self.release_lock();
        ret
    }

    fn sync_locked(&mut self, writer: &dyn MessageWriter) -> Result<StoreStatus> {
        match self.check()? {
            status @ (StoreStatus::NewMail | StoreStatus::Reopened | StoreStatus::Aborted) => {
                log::debug!(
                    "{} changed on disk, not writing: {}",
                    self.path.display(),
                    status
                );
                return Ok(status);
            }
            StoreStatus::Success => {}
            other => {
                return Err(Error::new(format!("Could not check mailbox: {}", other))
                    .set_kind(ErrorKind::Bug))
            }
        }

        let Some(first) = self.snapshot.first_dirty() else {
            return Err(Error::new("sync: mailbox modified, but no modified messages")
                .set_kind(ErrorKind::Bug));
        };
        let mut plan = RewritePlan::new(&self.snapshot, first, &self.settings.tmpdir);
        let tmp = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&plan.tmp_path)
            .chain_err_summary(|| "Could not create temporary file")
            .chain_err_related_path(&plan.tmp_path)?;
        log::debug!(
            "rewriting {} from record {} at offset {} through {}",
            self.path.display(),
            first,
            plan.offset,
            plan.tmp_path.display()
        );

        let mut out = CountingWriter {
            inner: BufWriter::new(tmp),
            written: 0,
        };
        let store = self.file.as_ref().ok_or_else(|| {
            Error::new("Mailbox session is closed").set_kind(ErrorKind::ValueError)
        })?;
        let written = plan
            .write_records(store, &mut self.snapshot, writer, &mut out)
            .and_then(|()| {
                out.inner
                    .into_inner()
                    .map_err(|err| Error::from(err.into_error()))?
                    .sync_all()?;
                Ok(())
            });
        if let Err(err) = written {
            plan.restore(&mut self.snapshot);
            if let Err(rm_err) = std::fs::remove_file(&plan.tmp_path) {
                log::warn!(
                    "could not remove {}: {}",
                    plan.tmp_path.display(),
                    rm_err
                );
            }
            return Err(err
                .set_summary(format!("Could not write {}", plan.tmp_path.display()))
                .set_kind(ErrorKind::IOFailure));
        }

        let before = std::fs::metadata(&self.path).map(|m| StoreStamp::from_metadata(&m));
        let before = match before {
            Ok(before) => before,
            Err(err) => {
                plan.restore(&mut self.snapshot);
                if let Err(rm_err) = std::fs::remove_file(&plan.tmp_path) {
                    log::warn!("could not remove {}: {}", plan.tmp_path.display(), rm_err);
                }
                return Err(Error::from(err).set_kind(ErrorKind::IOFailure));
            }
        };

        match self.verify_boundary(plan.offset) {
            Ok(true) => {}
            Ok(false) => {
                return Err(self.save_partial(&plan, ErrorKind::Corrupt));
            }
            Err(err) => {
                log::error!("could not verify {}: {}", self.path.display(), err);
                return Err(self.save_partial(&plan, ErrorKind::FatalUnrecoverable));
            }
        }
        if let Err(err) = self.copy_back(&plan) {
            log::error!("could not write back {}: {}", self.path.display(), err);
            return Err(self.save_partial(&plan, ErrorKind::FatalUnrecoverable));
        }

        self.reset_atime(before);
        self.finish_sync();
        if let Err(err) = std::fs::remove_file(&plan.tmp_path) {
            log::warn!("could not remove {}: {}", plan.tmp_path.display(), err);
        }
        Ok(StoreStatus::Success)
    }

    /// Whether a record still starts at `offset` in the store.
    fn verify_boundary(&self, offset: u64) -> Result<bool> {
        let mut store = self.file.as_ref().ok_or_else(|| {
            Error::new("Mailbox session is closed").set_kind(ErrorKind::ValueError)
        })?;
        store.seek(SeekFrom::Start(offset))?;
        let mut line = Vec::with_capacity(32);
        BufReader::new(store).read_until(b'\n', &mut line)?;
        let ok = self.format.is_record_start(&line);
        if !ok {
            log::debug!("message not in expected position.");
            log::debug!("\tLINE: {}", String::from_utf8_lossy(&line).trim_end());
        }
        Ok(ok)
    }

    fn copy_back(&mut self, plan: &RewritePlan) -> Result<()> {
        let mut store = self.file.as_ref().ok_or_else(|| {
            Error::new("Mailbox session is closed").set_kind(ErrorKind::ValueError)
        })?;
        let mut tmp = File::open(&plan.tmp_path)?;
        store.seek(SeekFrom::Start(plan.offset))?;
        let copied = std::io::copy(&mut tmp, &mut store)?;
        let size = plan.offset + copied;
        store.set_len(size)?;
        store.sync_all()?;
        self.snapshot.stamp.size = size;
        Ok(())
    }

    /// Keep the temporary file under a recovery name, close the session and
    /// return an error naming the file.
    fn save_partial(&mut self, plan: &RewritePlan, kind: ErrorKind) -> Error {
        plan.restore(&mut self.snapshot);
        let savefile = self.settings.tmpdir.join(format!(
            "mailstore.{}-{}-{}",
            current_username(),
            current_hostname(),
            std::process::id()
        ));
        let saved = match std::fs::rename(&plan.tmp_path, &savefile) {
            Ok(()) => savefile,
            Err(err) => {
                log::error!(
                    "could not rename {} to {}: {}",
                    plan.tmp_path.display(),
                    savefile.display(),
                    err
                );
                plan.tmp_path.clone()
            }
        };
        self.close();
        let err = Error::new(format!(
            "Write failed! Saved partial mailbox to {}",
            saved.display()
        ))
        .set_kind(kind)
        .set_related_path(Some(saved));
        log::error!("{}", err);
        err
    }

    /// Put back the times the store had before it was written, with the
    /// access time before the modification time if there is new mail.
    fn reset_atime(&self, before: StoreStamp) {
        let mut atime: UnixTimestamp = before.atime;
        if !self.settings.check_recent && atime >= before.mtime && self.snapshot.has_new() {
            atime = before.mtime.saturating_sub(1);
        }
        if let Err(err) = set_file_times(&self.path, atime, before.mtime) {
            log::debug!("{}", err);
        }
    }

    /// Bring the snapshot in line with the rewritten store.
    fn finish_sync(&mut self) {
        self.snapshot.records.retain(|r| !r.is_deleted());
        for (i, record) in self.snapshot.records.iter_mut().enumerate() {
            record.index = i;
        }
        self.snapshot.mark_synced();
        self.snapshot.recount();
        match std::fs::metadata(&self.path) {
            Ok(metadata) => self.snapshot.stamp = StoreStamp::from_metadata(&metadata),
            Err(err) => log::debug!("could not stat {}: {}", self.path.display(), err),
        }
        log::debug!(
            "synced {}: {} records, {} bytes, mtime {}",
            self.path.display(),
            self.snapshot.len(),
            self.snapshot.stamp.size,
            datetime::timestamp_to_string(self.snapshot.stamp.mtime, None)
        );
    }
}
