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

//! Split a flat file into [`MessageRecord`]s.
//!
//! [`RecordScanner`] is an iterator over the records of a store, starting at
//! any record boundary. A declared `Content-Length` is used to jump over a
//! body only after checking that the next record really starts where the
//! length says it does; otherwise the body is scanned line by line.
//!
//! The iterator yields:
//!
//! - `Ok(record)` for each complete record;
//! - `Err(_)` with [`ErrorKind::Corrupt`] if a line that must be a record
//!   boundary is not one, after which it is exhausted;
//! - `Err(_)` with [`ErrorKind::Aborted`] once the abort signal is observed.
//!   Records yielded before it are complete and valid.

use std::{
    io::{BufRead, BufReader, Read, Seek, SeekFrom},
    sync::Arc,
};

use super::{
    headers::{HeaderParser, Rfc822HeaderParser},
    is_from_line,
    record::{MessageRecord, StoreHandle},
    FromLine, StoreFormat, MMDF_SEP,
};
use crate::{
    error::{Error, ErrorKind, Result},
    utils::AbortSignal,
};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    /// Before the first record of this scan.
    Start,
    Running,
    /// The abort signal was seen; report it on the next call.
    Aborting,
    Done,
}

pub struct RecordScanner<R: Read + Seek> {
    reader: BufReader<R>,
    format: StoreFormat,
    size: u64,
    parser: Arc<dyn HeaderParser>,
    abort: Option<AbortSignal>,
    next_index: usize,
    /// Offset where the first record not returned yet starts.
    scanned_to: u64,
    /// `mbox` only: record whose end has not been seen yet.
    pending: Option<MessageRecord>,
    /// `mbox` only: body lines read since the last `From_` line.
    lines: i64,
    line: Vec<u8>,
    state: State,
}

impl<R: Read + Seek> std::fmt::Debug for RecordScanner<R> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct(stringify!(RecordScanner))
            .field("format", &self.format)
            .field("size", &self.size)
            .field("next_index", &self.next_index)
            .field("state", &self.state)
            .finish()
    }
}

impl<R: Read + Seek> RecordScanner<R> {
    /// Scan from the start of `reader`.
    pub fn new(reader: R, format: StoreFormat) -> Result<Self> {
        Self::new_at(reader, format, 0, 0)
    }

    /// Scan from byte `offset`, which must be a record boundary. Records are
    /// numbered from `first_index`.
    pub fn new_at(mut reader: R, format: StoreFormat, offset: u64, first_index: usize) -> Result<Self> {
        let size = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(offset))?;
        Ok(Self {
            reader: BufReader::new(reader),
            format,
            size,
            parser: Arc::new(Rfc822HeaderParser),
            abort: None,
            next_index: first_index,
            scanned_to: offset,
            pending: None,
            lines: 0,
            line: Vec::with_capacity(256),
            state: State::Start,
        })
    }

    pub fn with_parser(mut self, parser: Arc<dyn HeaderParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_abort(mut self, abort: AbortSignal) -> Self {
        self.abort = Some(abort);
        self
    }

    /// Size of the stream when the scan started.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Where a scan stopped: the end of the stream once every record was
    /// returned, or the boundary of the first record that was not read when
    /// the scan was aborted. Scanning again from there picks up the rest.
    pub fn scanned_to(&self) -> u64 {
        self.scanned_to
    }

    pub fn into_inner(self) -> R {
        self.reader.into_inner()
    }

    fn aborted(&self) -> bool {
        self.abort.as_ref().map(AbortSignal::is_raised).unwrap_or(false)
    }

    fn position(&mut self) -> Result<i64> {
        Ok(self.reader.stream_position()? as i64)
    }

    /// Read the next line into `self.line`; `false` at end of stream.
    fn read_line(&mut self) -> Result<bool> {
        self.line.clear();
        Ok(self.reader.read_until(b'\n', &mut self.line)? > 0)
    }

    fn corrupt(&mut self, loc: i64) -> Error {
        self.state = State::Done;
        log::debug!("corrupt mailbox at offset {}", loc);
        Error::new("Mailbox is corrupt")
            .set_details(format!(
                "Expected a record boundary at offset {}, found {:?}",
                loc,
                String::from_utf8_lossy(&self.line[..self.line.len().min(80)])
            ))
            .set_kind(ErrorKind::Corrupt)
    }

    fn aborted_error() -> Error {
        Error::new("Action aborted").set_kind(ErrorKind::Aborted)
    }

    /// Parse the header block at the current position into `record`, then
    /// set its body offset.
    fn read_headers(&mut self, record: &mut MessageRecord) -> Result<i64> {
        record.envelope = self.parser.parse(&mut self.reader)?;
        let loc = self.position()?;
        record.body_offset = loc as u64;
        record.length = record.envelope.content_length.unwrap_or(-1);
        record.lines = record.envelope.lines.unwrap_or(0);
        record.set_flags_from_envelope();
        if let StoreHandle::FlatFile(Some(ref from)) = record.handle {
            if record.envelope.return_path.is_none() && !from.return_path.is_empty() {
                record.envelope.return_path = Some(from.return_path.clone());
            }
        }
        if record.envelope.from.is_none() {
            record.envelope.from = record.envelope.return_path.clone();
        }
        Ok(loc)
    }

    /// Close the pending `mbox` record now that the next boundary (or the end
    /// of the stream) is at `loc`.
    fn finish_pending(&mut self, loc: i64) -> Option<MessageRecord> {
        let mut record = self.pending.take()?;
        if record.length < 0 {
            record.length = (loc - record.body_offset as i64 - 1).max(0);
        }
        if record.lines == 0 {
            record.lines = if self.lines > 0 { self.lines - 1 } else { 0 };
        }
        record.update_fingerprint();
        Some(record)
    }

    /// Verify a declared `mbox` body length, counting lines if they were not
    /// declared, and leave the stream at the next boundary if it holds.
    fn check_mbox_length(&mut self, record: &mut MessageRecord, loc: i64) -> Result<()> {
        if record.length <= 0 {
            return Ok(());
        }
        let size = self.size as i64;
        let tmploc = if record.length < size {
            loc + record.length + 1
        } else {
            -1
        };
        if tmploc > 0 && tmploc < size {
            self.reader.seek(SeekFrom::Start(tmploc as u64))?;
            if !self.read_line()? || !self.line.starts_with(b"From ") {
                log::debug!(
                    "bad content-length in message {} (cl={})",
                    record.index,
                    record.length
                );
                log::debug!("\tLINE: {}", String::from_utf8_lossy(&self.line).trim_end());
                self.reader.seek(SeekFrom::Start(loc as u64))?;
                record.length = -1;
            }
        } else if tmploc != size {
            // Past the end of the file, so it must be wrong.
            record.length = -1;
        }

        if record.length != -1 {
            if record.lines == 0 {
                self.reader.seek(SeekFrom::Start(loc as u64))?;
                let mut body = (&mut self.reader).take(record.length as u64);
                let mut buf = [0_u8; 8192];
                loop {
                    let n = body.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    record.lines += buf[..n].iter().filter(|b| **b == b'\n').count() as i64;
                }
            }
            self.reader.seek(SeekFrom::Start(tmploc as u64))?;
        }
        Ok(())
    }

    fn next_mbox(&mut self) -> Result<Option<MessageRecord>> {
        loop {
            let loc = self.position()?;
            if !self.read_line()? {
                self.state = State::Done;
                self.scanned_to = loc as u64;
                return Ok(self.finish_pending(loc));
            }
            if self.state == State::Start {
                if matches!(self.line.as_slice(), b"\n" | b"\r\n") {
                    continue;
                }
                if is_from_line(&self.line).is_none() {
                    return Err(self.corrupt(loc));
                }
                self.state = State::Running;
            }
            let Some(from) = is_from_line(&self.line) else {
                self.lines += 1;
                continue;
            };
            if self.aborted() {
                self.state = State::Aborting;
                self.scanned_to = loc as u64;
                return Ok(self.finish_pending(loc));
            }
            let finished = self.finish_pending(loc);

            let mut record = MessageRecord::new(self.next_index, loc as u64);
            self.next_index += 1;
            record.handle = StoreHandle::FlatFile(Some(from));
            let body = self.read_headers(&mut record)?;
            self.check_mbox_length(&mut record, body)?;
            self.pending = Some(record);
            self.lines = 0;
            if finished.is_some() {
                return Ok(finished);
            }
        }
    }

    fn next_mmdf(&mut self) -> Result<Option<MessageRecord>> {
        let loc = self.position()?;
        self.scanned_to = loc as u64;
        if self.aborted() {
            self.state = State::Aborting;
            return Ok(None);
        }
        if !self.read_line()? {
            self.state = State::Done;
            return Ok(None);
        }
        if self.line != MMDF_SEP {
            return Err(self.corrupt(loc));
        }
        self.state = State::Running;
        let offset = self.position()?;
        let mut record = MessageRecord::new(self.next_index, offset as u64);
        if !self.read_line()? {
            log::debug!("unexpected EOF after separator at {}", loc);
            self.state = State::Done;
            return Ok(None);
        }
        self.next_index += 1;
        let from: Option<FromLine> = is_from_line(&self.line);
        if from.is_none() {
            self.reader.seek(SeekFrom::Start(offset as u64))?;
        }
        record.handle = StoreHandle::FlatFile(from);
        let mut loc = self.read_headers(&mut record)?;
        let size = self.size as i64;

        if record.length > 0 && record.lines > 0 {
            let tmploc = loc + record.length;
            if tmploc > 0 && tmploc < size {
                self.reader.seek(SeekFrom::Start(tmploc as u64))?;
                if !self.read_line()? || self.line != MMDF_SEP {
                    self.reader.seek(SeekFrom::Start(loc as u64))?;
                    record.length = -1;
                }
            } else {
                record.length = -1;
            }
        } else {
            record.length = -1;
        }

        if record.length < 0 {
            let mut lines = -1;
            loop {
                loc = self.position()?;
                if !self.read_line()? {
                    break;
                }
                lines += 1;
                if self.line == MMDF_SEP {
                    break;
                }
            }
            record.lines = lines;
            record.length = loc - record.body_offset as i64;
        }
        record.update_fingerprint();
        Ok(Some(record))
    }
}

impl<R: Read + Seek> Iterator for RecordScanner<R> {
    type Item = Result<MessageRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.state {
            State::Done => return None,
            State::Aborting => {
                self.state = State::Done;
                return Some(Err(Self::aborted_error()));
            }
            State::Start | State::Running => {}
        }
        let ret = match self.format {
            StoreFormat::Mbox => self.next_mbox(),
            StoreFormat::Mmdf => self.next_mmdf(),
        };
        match ret {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) if self.state == State::Aborting => {
                self.state = State::Done;
                Some(Err(Self::aborted_error()))
            }
            Ok(None) => None,
            Err(err) => {
                self.state = State::Done;
                Some(Err(err))
            }
        }
    }
}
