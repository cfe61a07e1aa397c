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

//! Header block parsing.
//!
//! Record scanning only needs a handful of header fields: the declared body
//! length and line count, the status flags stored in the file and the fields
//! that identify a message across reloads. [`HeaderParser`] is the seam
//! through which a scanner obtains them; [`Rfc822HeaderParser`] is the
//! default implementation.

use std::io::{BufRead, Seek, SeekFrom};

use indexmap::IndexMap;
use nom::{
    bytes::complete::{tag, take_while, take_while1},
    character::complete::space0,
    sequence::{terminated, tuple},
    IResult,
};

use super::is_from_line;
use crate::{error::Result, utils::datetime::UnixTimestamp};

/// A readable stream a header parser can rewind.
pub trait HeaderSource: BufRead + Seek {}

impl<T: BufRead + Seek> HeaderSource for T {}

/// Given a stream positioned at the start of a header block, return the
/// parsed [`Envelope`] and leave the stream positioned at the first byte of
/// the body.
pub trait HeaderParser: std::fmt::Debug + Send + Sync {
    fn parse(&self, reader: &mut dyn HeaderSource) -> Result<Envelope>;
}

/// The header fields of one message.
///
/// `content_length` and `lines` keep the raw semantics of the file: a
/// negative `Content-Length` becomes `-1` and an unparsable one becomes `0`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Envelope {
    pub message_id: Option<String>,
    pub date: Option<String>,
    pub from: Option<String>,
    pub sender: Option<String>,
    pub reply_to: Option<String>,
    pub to: Option<String>,
    pub cc: Option<String>,
    pub subject: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Option<String>,
    pub return_path: Option<String>,
    pub content_type: Option<String>,
    pub content_length: Option<i64>,
    pub lines: Option<i64>,
    /// A `From_` line found inside the header block.
    pub received: Option<UnixTimestamp>,
    pub status: StatusFlags,
    pub other_headers: IndexMap<String, String>,
}

/// Flags stored in the `Status:` and `X-Status:` headers.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct StatusFlags {
    pub read: bool,
    pub old: bool,
    pub replied: bool,
    pub flagged: bool,
    pub deleted: bool,
}

impl Envelope {
    /// `Message-ID` with surrounding angle brackets and whitespace removed.
    pub fn message_id_bare(&self) -> Option<&str> {
        self.message_id
            .as_deref()
            .map(|id| id.trim().trim_start_matches('<').trim_end_matches('>'))
    }

    fn set_field(&mut self, name: &str, value: String) {
        match name.to_ascii_lowercase().as_str() {
            "message-id" => self.message_id = Some(value),
            "date" => self.date = Some(value),
            "from" => self.from = Some(value),
            "sender" => self.sender = Some(value),
            "reply-to" => self.reply_to = Some(value),
            "to" => self.to = Some(value),
            "cc" => self.cc = Some(value),
            "subject" => self.subject = Some(value),
            "in-reply-to" => self.in_reply_to = Some(value),
            "references" => self.references = Some(value),
            "return-path" => self.return_path = Some(value),
            "content-type" => self.content_type = Some(value),
            "content-length" => {
                let len = leading_int(&value);
                self.content_length = Some(if len < 0 { -1 } else { len });
            }
            "lines" => self.lines = Some(leading_int(&value).max(0)),
            "status" => {
                for ch in value.chars() {
                    match ch {
                        'R' => self.status.read = true,
                        'O' => self.status.old = true,
                        'r' => self.status.replied = true,
                        _ => {}
                    }
                }
            }
            "x-status" => {
                for ch in value.chars() {
                    match ch {
                        'A' => self.status.replied = true,
                        'D' => self.status.deleted = true,
                        'F' => self.status.flagged = true,
                        _ => {}
                    }
                }
            }
            _ => {
                self.other_headers.insert(name.to_string(), value);
            }
        }
    }
}

/// `atol(3)`-like parse: optional sign, then digits, anything else stops.
fn leading_int(s: &str) -> i64 {
    let s = s.trim_start();
    let (neg, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let end = digits
        .bytes()
        .position(|b| !b.is_ascii_digit())
        .unwrap_or(digits.len());
    let val = digits[..end].parse::<i64>().unwrap_or(0);
    if neg {
        -val
    } else {
        val
    }
}

/// `field-name ":" [WSP]`, returning the field name.
fn field_name(input: &[u8]) -> IResult<&[u8], &[u8]> {
    terminated(
        take_while1(|b: u8| b > b' ' && b < 127 && b != b':'),
        tuple((tag(":"), space0)),
    )(input)
}

fn field(input: &[u8]) -> IResult<&[u8], (&[u8], &[u8])> {
    let (rest, name) = field_name(input)?;
    let (rest, value) = take_while(|_: u8| true)(rest)?;
    Ok((rest, (name, value)))
}

fn trim_eol(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Rfc822HeaderParser;

impl Rfc822HeaderParser {
    fn add_field(envelope: &mut Envelope, unfolded: &[u8]) {
        if let Ok((_, (name, value))) = field(unfolded) {
            let name = String::from_utf8_lossy(name);
            let value = String::from_utf8_lossy(value).trim_end().to_string();
            envelope.set_field(&name, value);
        }
    }
}

impl HeaderParser for Rfc822HeaderParser {
    fn parse(&self, reader: &mut dyn HeaderSource) -> Result<Envelope> {
        let mut envelope = Envelope::default();
        let mut current: Vec<u8> = Vec::new();
        let mut line = Vec::with_capacity(256);
        loop {
            line.clear();
            let read = reader.read_until(b'\n', &mut line)?;
            if read == 0 {
                break;
            }
            let content = trim_eol(&line);
            if content.is_empty() {
                break;
            }
            if matches!(content[0], b' ' | b'\t') {
                if !current.is_empty() {
                    current.push(b' ');
                    let start = content
                        .iter()
                        .position(|b| !b.is_ascii_whitespace())
                        .unwrap_or(content.len());
                    current.extend_from_slice(&content[start..]);
                }
                continue;
            }
            if field_name(content).is_err() {
                // Quoted From_ lines are written by some MTAs.
                if content.starts_with(b">From ") {
                    continue;
                }
                if let Some(from) = is_from_line(content) {
                    if envelope.received.is_none() {
                        envelope.received = Some(from.received);
                    }
                    continue;
                }
                // Not a header: the block ends before this line.
                reader.seek(SeekFrom::Current(-(read as i64)))?;
                break;
            }
            if !current.is_empty() {
                Self::add_field(&mut envelope, &current);
                current.clear();
            }
            current.extend_from_slice(content);
        }
        if !current.is_empty() {
            Self::add_field(&mut envelope, &current);
        }
        Ok(envelope)
    }
}
