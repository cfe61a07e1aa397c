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

use std::io::Write;

use super::*;
use crate::utils::datetime;

const CRLF: &[u8] = b"\r\n";

/// Split a message at the first empty line. The separator is not part of
/// either half.
fn split_message(input: &[u8]) -> (&[u8], &[u8]) {
    let mut pos = 0;
    while pos < input.len() {
        let end = input[pos..]
            .iter()
            .position(|b| *b == b'\n')
            .map(|p| pos + p + 1)
            .unwrap_or(input.len());
        if matches!(&input[pos..end], b"\n" | b"\r\n") {
            return (&input[..pos], &input[end..]);
        }
        pos = end;
    }
    (input, &[])
}

/// Replace CRLF line endings with LF.
fn to_lf(bytes: &[u8]) -> Vec<u8> {
    let mut ret = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i..].starts_with(CRLF) {
            ret.push(b'\n');
            i += 2;
        } else {
            ret.push(bytes[i]);
            i += 1;
        }
    }
    ret
}

/// Drop `Content-Length:` fields, with their continuation lines, from a
/// header block.
fn strip_content_length(headers: &[u8]) -> Vec<u8> {
    let mut ret = Vec::with_capacity(headers.len());
    let mut skipping = false;
    for line in headers.split_inclusive(|b| *b == b'\n') {
        if matches!(line.first(), Some(b' ' | b'\t')) {
            if !skipping {
                ret.extend_from_slice(line);
            }
            continue;
        }
        skipping = line.len() >= b"content-length:".len()
            && line[..b"content-length:".len()].eq_ignore_ascii_case(b"content-length:");
        if !skipping {
            ret.extend_from_slice(line);
        }
    }
    ret
}

impl StoreFormat {
    /// Write `input`, a complete RFC 822 message, as a new record of this
    /// format.
    ///
    /// The record gets a fresh `From_` line built from `envelope_from` and
    /// `delivery_date` and a `Content-Length:` field. In `mbox` stores body
    /// lines starting with `From ` are quoted with `>`. Line endings
    /// are converted to LF.
    pub fn append(
        self,
        writer: &mut dyn Write,
        input: &[u8],
        envelope_from: Option<&str>,
        delivery_date: Option<crate::UnixTimestamp>,
    ) -> Result<()> {
        if envelope_from.map(|f| f.contains(char::is_whitespace)).unwrap_or(false) {
            return Err(Error::new("mbox envelope sender can't contain spaces")
                .set_kind(ErrorKind::ValueError));
        }
        let input = match input.iter().position(|b| *b == b'\n') {
            Some(end) if is_from_line(&input[..end]).is_some() => &input[end + 1..],
            _ => input,
        };
        let (headers, body) = split_message(input);
        let headers = strip_content_length(&to_lf(headers));
        let mut body = to_lf(body);
        if !body.is_empty() && !body.ends_with(b"\n") {
            body.push(b'\n');
        }
        if self == Self::Mbox {
            let mut quoted = Vec::with_capacity(body.len());
            for line in body.split_inclusive(|b| *b == b'\n') {
                if line.starts_with(b"From ") {
                    quoted.push(b'>');
                }
                quoted.extend_from_slice(line);
            }
            body = quoted;
        }

        if self == Self::Mmdf {
            writer.write_all(MMDF_SEP)?;
        }
        writer.write_all(b"From ")?;
        if let Some(from) = envelope_from {
            writer.write_all(from.as_bytes())?;
        } else {
            write!(writer, "{}", uuid::Uuid::nil().as_simple())?;
        }
        writer.write_all(b" ")?;
        writer.write_all(
            datetime::timestamp_to_string(
                delivery_date.unwrap_or_else(datetime::now),
                Some(datetime::formats::ASCTIME_FMT),
            )
            .trim()
            .as_bytes(),
        )?;
        writer.write_all(b"\n")?;
        writer.write_all(&headers)?;
        if !headers.is_empty() && !headers.ends_with(b"\n") {
            writer.write_all(b"\n")?;
        }
        writeln!(writer, "Content-Length: {}", body.len())?;
        writer.write_all(b"\n")?;
        writer.write_all(&body)?;
        match self {
            Self::Mbox => writer.write_all(b"\n")?,
            Self::Mmdf => writer.write_all(MMDF_SEP)?,
        }
        Ok(())
    }
}
