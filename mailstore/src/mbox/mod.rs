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

//! # Flat-file stores
//!
//! ## Resources
//!
//! [^0]: <https://web.archive.org/web/20160812091518/https://jdebp.eu./FGA/mail-mbox-formats.html>
//! [^1]: <https://wiki2.dovecot.org/MailboxFormat/mbox>
//! [^2]: <https://manpages.debian.org/buster/mutt/mbox.5.en.html>
//!
//! ## `mbox` format
//!
//! "All of the 'mbox' formats store all of the messages in the mailbox in a
//! single file. Delivery appends new messages to the end of the file." [^0]
//!
//! "Each message is preceded by a From_ line and followed by a blank line. A
//! From_ line is a line that begins with the five characters 'F', 'r', 'o',
//! 'm', and ' '." [^0]
//!
//! ```text
//! From example@example.com Fri Jun 23 02:56:55 2000
//! ```
//!
//! A `Content-Length:` header, when present, is trusted only after checking
//! that the byte range it declares ends right before the next `From_` line
//! (or at the end of the file). Otherwise the body is scanned line by line
//! until the next `From_` line.
//!
//! ## `MMDF` format
//!
//! Every message is enclosed between two separator lines made of four `^A`
//! characters ([`MMDF_SEP`]). The byte offset of an `MMDF` record points right
//! after its opening separator.
//!
//! ## Metadata
//!
//! Message flags are stored in the headers:
//!
//! - `Status`: R (Seen) and O (non-Recent) flags
//! - `X-Status`: A (Answered), F (Flagged) and D (Deleted) flags
//!
//! ## Scanning a store
//!
//! ```
//! # use mailstore::mbox::{scanner::RecordScanner, StoreFormat};
//! # use std::io::Cursor;
//! let contents: &[u8] = b"From a@b.c Fri Jun 23 02:56:55 2000\nSubject: hi\n\nHello\n\n";
//! let records = RecordScanner::new(Cursor::new(contents), StoreFormat::Mbox)?
//!     .collect::<mailstore::Result<Vec<_>>>()?;
//! assert_eq!(records.len(), 1);
//! assert_eq!(records[0].length, 6);
//! assert_eq!(records[0].lines, 1);
//! # Ok::<(), mailstore::Error>(())
//! ```

use std::{
    ffi::CString,
    fs::File,
    io::{BufRead, BufReader},
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use nom::{
    bytes::complete::take_while1,
    character::complete::{char as nom_char, digit1},
    combinator::{map_res, opt},
    sequence::{preceded, tuple},
    IResult,
};

use crate::{
    conf::{default_tmpdir, StoreSettings},
    error::{Error, ErrorKind, Result},
    utils::{
        datetime::{self, UnixTimestamp},
        lock::FileLockOptions,
    },
};

pub mod headers;
pub mod record;
pub mod scanner;
pub mod session;
pub mod snapshot;
pub mod sync;
pub mod write;

pub use headers::{Envelope, HeaderParser, Rfc822HeaderParser};
pub use record::{Fingerprint, MessageRecord, RecordFlags, StoreHandle};
pub use scanner::RecordScanner;
pub use session::MboxMailbox;
pub use snapshot::{MailboxSnapshot, Reconciliation, ScanStatus};
pub use sync::{CopyMessage, MessageWriter};

/// The `MMDF` record separator line.
pub const MMDF_SEP: &[u8] = b"\x01\x01\x01\x01\n";

/// Which flat-file format a store is in.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum StoreFormat {
    #[default]
    Mbox,
    Mmdf,
}

impl StoreFormat {
    /// Bytes of framing between the end of one record's body and the offset
    /// of the next: the blank line after an `mbox` message, or the closing
    /// and opening separators around `MMDF` ones.
    pub const fn padding_size(self) -> u64 {
        match self {
            Self::Mbox => 1,
            Self::Mmdf => 2 * MMDF_SEP.len() as u64,
        }
    }

    /// Whether `line` is where a record of this format may start.
    pub fn is_record_start(self, line: &[u8]) -> bool {
        match self {
            Self::Mbox => line.starts_with(b"From "),
            Self::Mmdf => line == MMDF_SEP,
        }
    }
}

impl FromStr for StoreFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            s if s.eq_ignore_ascii_case("mbox") => Ok(Self::Mbox),
            s if s.eq_ignore_ascii_case("mmdf") => Ok(Self::Mmdf),
            _ => Err(Error::new("Expected one of `mbox`, `mmdf`").set_kind(ErrorKind::ValueError)),
        }
    }
}

impl std::fmt::Display for StoreFormat {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            fmt,
            "{}",
            match self {
                Self::Mbox => "mbox",
                Self::Mmdf => "mmdf",
            }
        )
    }
}

/// Settings of a flat-file store, read from [`StoreSettings::extra`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MboxSettings {
    pub name: String,
    /// `None` means detect the format from the file contents.
    pub prefer_format: Option<StoreFormat>,
    pub lock_retries: u8,
    pub lock_retry_wait: Duration,
    pub tmpdir: PathBuf,
    /// When set, access times are left alone after probing or syncing.
    pub check_recent: bool,
    pub read_only: bool,
}

impl Default for MboxSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            prefer_format: None,
            lock_retries: 5,
            lock_retry_wait: Duration::from_millis(1000),
            tmpdir: default_tmpdir(),
            check_recent: false,
            read_only: false,
        }
    }
}

impl MboxSettings {
    pub fn new(s: &StoreSettings) -> Result<Self> {
        let prefer_format: String = get_conf_val!(s["prefer_format"], "auto".to_string())?;
        let prefer_format = if prefer_format.eq_ignore_ascii_case("auto") {
            None
        } else {
            Some(StoreFormat::from_str(&prefer_format).map_err(|err| {
                err.set_summary(format!(
                    "Configuration error ({}): Invalid value for field `prefer_format`: {}",
                    s.name, prefer_format
                ))
                .set_kind(ErrorKind::Configuration)
            })?)
        };
        let lock_retries: u8 = get_conf_val!(s["lock_retries"], 5)?;
        let lock_retry_wait_ms: u64 = get_conf_val!(s["lock_retry_wait_ms"], 1000)?;
        let tmpdir: String = get_conf_val!(s["tmpdir"], String::new())?;
        let check_recent: bool = get_conf_val!(s["check_recent"], false)?;
        Ok(Self {
            name: s.name.clone(),
            prefer_format,
            lock_retries,
            lock_retry_wait: Duration::from_millis(lock_retry_wait_ms),
            tmpdir: if tmpdir.is_empty() {
                default_tmpdir()
            } else {
                crate::conf::expand_home(&tmpdir)
            },
            check_recent,
            read_only: s.read_only,
        })
    }

    pub fn lock_options(&self) -> FileLockOptions {
        FileLockOptions::Nonblocking {
            max_tries: self.lock_retries.max(1),
            try_wait: Some(self.lock_retry_wait),
        }
    }
}

/// The contents of a `From_` line.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct FromLine {
    /// Envelope sender, empty when the line has none.
    pub return_path: String,
    pub received: UnixTimestamp,
}

const WEEKDAYS: [&[u8]; 7] = [b"sun", b"mon", b"tue", b"wed", b"thu", b"fri", b"sat"];
const MONTHS: [&[u8]; 12] = [
    b"jan", b"feb", b"mar", b"apr", b"may", b"jun", b"jul", b"aug", b"sep", b"oct", b"nov", b"dec",
];

#[inline]
fn is_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r' | b'\x0b' | b'\x0c')
}

fn skip_space(s: &[u8]) -> &[u8] {
    let start = s.iter().position(|b| !is_space(*b)).unwrap_or(s.len());
    &s[start..]
}

/// Skip the current word and the whitespace after it.
fn next_word(s: &[u8]) -> &[u8] {
    let end = s.iter().position(|b| is_space(*b)).unwrap_or(s.len());
    skip_space(&s[end..])
}

fn is_day_name(s: &[u8]) -> bool {
    s.len() > 3
        && is_space(s[3])
        && WEEKDAYS
            .iter()
            .any(|d| s[..3].eq_ignore_ascii_case(d))
}

fn month(s: &[u8]) -> Option<u32> {
    let name = s.get(..3)?;
    MONTHS
        .iter()
        .position(|m| name.eq_ignore_ascii_case(m))
        .map(|i| i as u32 + 1)
}

fn number<T: FromStr>(input: &[u8]) -> IResult<&[u8], T> {
    map_res(digit1, |d: &[u8]| {
        std::str::from_utf8(d)
            .map_err(|_| ())
            .and_then(|d| d.parse::<T>().map_err(|_| ()))
    })(input)
}

/// `hh:mm[:ss]`
fn time_of_day(input: &[u8]) -> IResult<&[u8], (u32, u32, u32)> {
    let (rest, (hour, _, minute, second)) = tuple((
        number::<u32>,
        nom_char(':'),
        number::<u32>,
        opt(preceded(nom_char(':'), number::<u32>)),
    ))(input)?;
    Ok((rest, (hour, minute, second.unwrap_or(0))))
}

/// The envelope sender. A quoted local part may contain spaces.
fn return_path(input: &[u8]) -> IResult<&[u8], &[u8]> {
    if input.first() == Some(&b'"') {
        let mut i = 1;
        while i < input.len() {
            match input[i] {
                b'\\' => i += 2,
                b'"' => break,
                _ => i += 1,
            }
        }
        let end = (i + 1..input.len())
            .find(|&j| is_space(input[j]))
            .unwrap_or(input.len());
        return Ok((&input[end.min(input.len())..], &input[..end.min(input.len())]));
    }
    take_while1(|b: u8| !is_space(b))(input)
}

/// Recognize a `From_` line:
///
/// ```text
/// From [sender] Www Mmm dd hh:mm[:ss] [tz [tz]] yyyy
/// ```
///
/// Two digit years below 70 are in the 2000s and the others in the 1900s. The
/// timestamp is taken as UTC.
pub fn is_from_line(line: &[u8]) -> Option<FromLine> {
    let s = line.strip_prefix(b"From ")?;
    let mut s = skip_space(s);
    if s.is_empty() {
        return None;
    }
    let mut ret = FromLine::default();
    if !is_day_name(s) {
        let (rest, path) = return_path(s).ok()?;
        ret.return_path = String::from_utf8_lossy(path).into_owned();
        s = skip_space(rest);
        if s.is_empty() {
            return None;
        }
        // Archives that obfuscate the sender as "user at example.com".
        if s.len() > 3 && s[..3].eq_ignore_ascii_case(b"at ") {
            s = next_word(next_word(s));
            if s.is_empty() {
                return None;
            }
        }
        if !is_day_name(s) {
            return None;
        }
    }
    s = next_word(s);
    let month = month(s)?;
    s = next_word(s);
    let (_, day) = number::<u32>(s).ok()?;
    s = next_word(s);
    let (_, (hour, minute, second)) = time_of_day(s).ok()?;
    s = next_word(s);
    if s.is_empty() {
        return None;
    }
    if s[0].is_ascii_alphabetic() || s[0] == b'+' || s[0] == b'-' {
        s = next_word(s);
        if s.is_empty() {
            return None;
        }
        // e.g. "MET DST"
        if s[0].is_ascii_alphabetic() {
            s = next_word(s);
            if s.is_empty() {
                return None;
            }
        }
    }
    let (_, year) = number::<i32>(s).ok()?;
    let year = if year > 1900 {
        year
    } else if year < 70 {
        year + 2000
    } else {
        year + 1900
    };
    ret.received = datetime::from_components(year, month, day, hour, minute, second)?;
    Some(ret)
}

/// Guess the format of the store at `path` from its first non-blank line.
///
/// Unless `check_recent` is set, the file's access and modification times are
/// restored afterwards so that probing does not hide new mail.
pub fn probe_path(path: &Path, check_recent: bool) -> Option<StoreFormat> {
    let file = File::open(path).ok()?;
    let metadata = file.metadata().ok()?;
    if !metadata.is_file() {
        return None;
    }
    let mut reader = BufReader::new(file);
    let mut line = Vec::new();
    loop {
        let buf = reader.fill_buf().ok()?;
        if buf.is_empty() {
            return None;
        }
        let skip = buf
            .iter()
            .position(|b| !matches!(b, b'\n' | b'\r'))
            .unwrap_or(buf.len());
        let done = skip < buf.len();
        reader.consume(skip);
        if done {
            break;
        }
    }
    reader.read_until(b'\n', &mut line).ok()?;
    let ret = if line.starts_with(b"From ") {
        Some(StoreFormat::Mbox)
    } else if line == MMDF_SEP {
        Some(StoreFormat::Mmdf)
    } else {
        None
    };
    if !check_recent {
        let (mtime, atime) = datetime::file_times(&metadata);
        if let Err(err) = set_file_times(path, atime, mtime) {
            log::debug!("could not restore times of {}: {}", path.display(), err);
        }
    }
    ret
}

/// Set access and modification time of `path`, in seconds.
pub fn set_file_times(path: &Path, atime: UnixTimestamp, mtime: UnixTimestamp) -> Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())?;
    let times = [
        libc::timeval {
            tv_sec: atime as libc::time_t,
            tv_usec: 0,
        },
        libc::timeval {
            tv_sec: mtime as libc::time_t,
            tv_usec: 0,
        },
    ];
    // SAFETY: c_path is a valid NUL terminated string and times has two
    // elements as utimes(2) requires.
    let ret = unsafe { libc::utimes(c_path.as_ptr(), times.as_ptr()) };
    if ret != 0 {
        return Err(Error::from(nix::errno::Errno::last())
            .set_summary(format!("Could not set times of {}", path.display()))
            .set_related_path(Some(path)));
    }
    Ok(())
}
