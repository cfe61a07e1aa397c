/*
 * mailstore - error module
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

//! An error object for `mailstore`, and the integer-coded status values
//! returned by store operations.

use std::{borrow::Cow, fmt, io, path::PathBuf, str, string, sync::Arc};

pub use nix::errno::Errno;

pub type Result<T> = std::result::Result<T, Error>;

/// What went wrong, at the granularity callers make decisions on.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum ErrorKind {
    #[default]
    None,
    /// A record boundary was missing where the format requires one. The store
    /// must not be trusted further without a full reload.
    Corrupt,
    /// An advisory lock could not be acquired in time.
    LockBusy,
    /// The caller raised the abort signal mid-operation. Whatever was built
    /// before the signal is valid but incomplete.
    Aborted,
    /// The backing store changed size or modification time since it was
    /// loaded.
    ExternalDivergence,
    /// A read, write, seek or rename failed while rewriting; the rewrite was
    /// rolled back.
    IOFailure,
    /// Rolling back was not possible. See [`Error::related_path`] for the
    /// preserved temporary copy, if any.
    FatalUnrecoverable,
    /// An operation was attempted that requires write access.
    ReadOnly,
    /// Internal invariant violated.
    Bug,
    NotFound,
    ValueError,
    Configuration,
    /// Error reported by an external collaborator (the index database).
    External,
    OSError(Errno),
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "{}",
            match self {
                Self::None => "",
                Self::Corrupt => "Mailbox is corrupt",
                Self::LockBusy => "Could not lock mailbox",
                Self::Aborted => "Action aborted",
                Self::ExternalDivergence => "Mailbox was modified externally",
                Self::IOFailure => "I/O failure",
                Self::FatalUnrecoverable => "Fatal error",
                Self::ReadOnly => "Mailbox is read-only",
                Self::Bug => "Bug, please report this!",
                Self::NotFound => "Not found",
                Self::ValueError => "Invalid value",
                Self::Configuration => "Configuration error",
                Self::External => "External error",
                Self::OSError(_) => "OS Error",
            }
        )
    }
}

impl ErrorKind {
    /// Errors a caller can recover from inline by retrying, reopening or
    /// using partial results, without reporting data loss.
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::LockBusy | Self::ExternalDivergence | Self::Aborted
        )
    }

    /// Errors that leave the store in an unusable state.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Corrupt | Self::FatalUnrecoverable)
    }
}

#[derive(Clone, Debug)]
pub struct Error {
    pub summary: Cow<'static, str>,
    pub details: Option<Cow<'static, str>>,
    pub source: Option<Box<Self>>,
    pub inner: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
    pub related_path: Option<PathBuf>,
    pub kind: ErrorKind,
}

pub trait IntoError {
    fn set_err_summary<M>(self, msg: M) -> Error
    where
        M: Into<Cow<'static, str>>;

    fn set_err_details<M>(self, msg: M) -> Error
    where
        M: Into<Cow<'static, str>>;

    fn set_err_kind(self, kind: ErrorKind) -> Error;
}

pub trait ResultIntoError<T> {
    fn chain_err_summary<M, F>(self, msg_fn: F) -> Result<T>
    where
        F: Fn() -> M,
        M: Into<Cow<'static, str>>;

    fn chain_err_details<M, F>(self, msg_fn: F) -> Result<T>
    where
        F: Fn() -> M,
        M: Into<Cow<'static, str>>;

    fn chain_err_kind(self, kind: ErrorKind) -> Result<T>;

    fn chain_err_related_path(self, p: &std::path::Path) -> Result<T>;
}

/// Wrap any error into an [`Error`] whose summary is supplied by the
/// closure; the original error is kept as the source.
pub trait WrapResultIntoError<T, I>
where
    I: Send + Sync + std::error::Error + 'static,
{
    fn wrap_err<M, F>(self, msg_fn: F) -> Result<T>
    where
        F: Fn() -> M,
        M: Into<Cow<'static, str>>;
}

impl<T, I> WrapResultIntoError<T, I> for std::result::Result<T, I>
where
    I: Send + Sync + std::error::Error + 'static,
{
    #[inline]
    fn wrap_err<M, F>(self, msg_fn: F) -> Result<T>
    where
        F: Fn() -> M,
        M: Into<Cow<'static, str>>,
    {
        self.map_err(|err| Error::new(msg_fn()).set_source(Some(Arc::new(err))))
    }
}

impl<I: Into<Error>> IntoError for I {
    #[inline]
    fn set_err_summary<M>(self, msg: M) -> Error
    where
        M: Into<Cow<'static, str>>,
    {
        let err: Error = self.into();
        err.set_summary(msg)
    }

    #[inline]
    fn set_err_details<M>(self, msg: M) -> Error
    where
        M: Into<Cow<'static, str>>,
    {
        let err: Error = self.into();
        err.set_details(msg)
    }

    #[inline]
    fn set_err_kind(self, kind: ErrorKind) -> Error {
        let err: Error = self.into();
        err.set_kind(kind)
    }
}

impl<T, I: Into<Error>> ResultIntoError<T> for std::result::Result<T, I> {
    #[inline]
    fn chain_err_summary<M, F>(self, msg_fn: F) -> Result<T>
    where
        F: Fn() -> M,
        M: Into<Cow<'static, str>>,
    {
        self.map_err(|err| err.set_err_summary(msg_fn()))
    }

    #[inline]
    fn chain_err_details<M, F>(self, msg_fn: F) -> Result<T>
    where
        F: Fn() -> M,
        M: Into<Cow<'static, str>>,
    {
        self.map_err(|err| err.set_err_details(msg_fn()))
    }

    #[inline]
    fn chain_err_kind(self, kind: ErrorKind) -> Result<T> {
        self.map_err(|err| err.set_err_kind(kind))
    }

    #[inline]
    fn chain_err_related_path(self, p: &std::path::Path) -> Result<T> {
        self.map_err(|err| err.into().set_related_path(Some(p)))
    }
}

impl Error {
    pub fn new<M>(msg: M) -> Self
    where
        M: Into<Cow<'static, str>>,
    {
        Self {
            summary: msg.into(),
            details: None,
            source: None,
            inner: None,
            related_path: None,
            kind: ErrorKind::None,
        }
    }

    pub fn set_details<M>(mut self, details: M) -> Self
    where
        M: Into<Cow<'static, str>>,
    {
        if let Some(old_details) = self.details.as_ref() {
            self.details = Some(format!("{}. {}", old_details, details.into()).into());
        } else {
            self.details = Some(details.into());
        }
        self
    }

    pub fn set_summary<M>(mut self, summary: M) -> Self
    where
        M: Into<Cow<'static, str>>,
    {
        let mut old = summary.into();
        std::mem::swap(&mut self.summary, &mut old);
        if !old.is_empty() {
            self.details = Some(match self.details.take() {
                Some(details) => format!("{old}. {details}").into(),
                None => old,
            });
        }
        self
    }

    pub fn set_source(
        mut self,
        new_val: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        self.inner = new_val;
        self
    }

    pub fn set_kind(mut self, new_val: ErrorKind) -> Self {
        self.kind = new_val;
        self
    }

    pub fn set_related_path<P: Into<PathBuf>>(mut self, new_val: Option<P>) -> Self {
        self.related_path = new_val.map(Into::into);
        self
    }

    /// Chain `self` as the cause of a new error.
    pub fn wrap<M>(self, summary: M) -> Self
    where
        M: Into<Cow<'static, str>>,
    {
        let kind = self.kind.clone();
        Self {
            source: Some(Box::new(self)),
            kind,
            ..Self::new(summary)
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.summary)?;
        if let Some(details) = self.details.as_ref() {
            if !details.trim().is_empty() {
                write!(f, "\n{}", details)?;
            }
        }
        if let Some(ref path) = self.related_path {
            write!(f, "\nRelated path: {}", path.display())?;
        }
        if let Some(ref source) = self.source {
            write!(f, "\nCaused by: {}", source)?;
        }
        if let Some(ref inner) = self.inner {
            write!(f, "\nCaused by: {}", inner)?;
        }
        if self.kind != ErrorKind::None {
            write!(f, "\nError kind: {}", self.kind)?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|s| &(**s) as &(dyn std::error::Error + 'static))
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(err: io::Error) -> Self {
        let s = err.to_string();
        let kind = match err.kind() {
            io::ErrorKind::NotFound => ErrorKind::NotFound,
            io::ErrorKind::WouldBlock => ErrorKind::LockBusy,
            io::ErrorKind::PermissionDenied => ErrorKind::ReadOnly,
            _ => err
                .raw_os_error()
                .map(|code| ErrorKind::OSError(Errno::from_raw(code)))
                .unwrap_or(ErrorKind::IOFailure),
        };
        Self::new(s)
            .set_details(err.kind().to_string())
            .set_source(Some(Arc::new(err)))
            .set_kind(kind)
    }
}

impl From<Errno> for Error {
    #[inline]
    fn from(err: Errno) -> Self {
        Self::new(err.desc())
            .set_source(Some(Arc::new(err)))
            .set_kind(ErrorKind::OSError(err))
    }
}

impl<'a> From<Cow<'a, str>> for Error {
    #[inline]
    fn from(err: Cow<'_, str>) -> Self {
        Self::new(err.to_string())
    }
}

impl From<string::FromUtf8Error> for Error {
    #[inline]
    fn from(err: string::FromUtf8Error) -> Self {
        Self::new(err.to_string())
            .set_source(Some(Arc::new(err)))
            .set_kind(ErrorKind::ValueError)
    }
}

impl From<str::Utf8Error> for Error {
    #[inline]
    fn from(err: str::Utf8Error) -> Self {
        Self::new(err.to_string())
            .set_source(Some(Arc::new(err)))
            .set_kind(ErrorKind::ValueError)
    }
}

impl From<std::num::ParseIntError> for Error {
    #[inline]
    fn from(err: std::num::ParseIntError) -> Self {
        Self::new(err.to_string())
            .set_source(Some(Arc::new(err)))
            .set_kind(ErrorKind::ValueError)
    }
}

impl From<std::num::TryFromIntError> for Error {
    #[inline]
    fn from(err: std::num::TryFromIntError) -> Self {
        Self::new(err.to_string())
            .set_source(Some(Arc::new(err)))
            .set_kind(ErrorKind::ValueError)
    }
}

impl From<std::ffi::NulError> for Error {
    #[inline]
    fn from(err: std::ffi::NulError) -> Self {
        Self::new(err.to_string())
            .set_source(Some(Arc::new(err)))
            .set_kind(ErrorKind::ValueError)
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    #[inline]
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::new(err.to_string()).set_kind(ErrorKind::Bug)
    }
}

impl<'a> From<nom::Err<nom::error::Error<&'a [u8]>>> for Error {
    #[inline]
    fn from(err: nom::Err<nom::error::Error<&'a [u8]>>) -> Self {
        Self::new("Parsing error").set_details(match err {
            nom::Err::Incomplete(_) => "Incomplete input".to_string(),
            nom::Err::Error(err) | nom::Err::Failure(err) => format!(
                "{:?} at {:?}",
                err.code,
                String::from_utf8_lossy(&err.input[..err.input.len().min(32)])
            ),
        })
    }
}

impl<'a> From<&'a str> for Error {
    #[inline]
    fn from(err: &str) -> Self {
        Self::new(err.to_string())
    }
}

impl From<String> for Error {
    #[inline]
    fn from(err: String) -> Self {
        Self::new(err)
    }
}

/// Integer-coded result of store operations.
///
/// The positive values follow the classic mailbox check return codes;
/// negative values are failures.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[repr(i8)]
pub enum StoreStatus {
    /// Operation succeeded, or nothing changed.
    #[default]
    Success = 0,
    /// New records were appended to the store.
    NewMail = 1,
    /// The store could not be locked; the caller may retry later.
    Locked = 2,
    /// The store was reloaded and reconciled with the previous snapshot.
    Reopened = 3,
    /// Flags of known records changed externally.
    Flags = 4,
    /// The store is corrupt or could not be written back.
    Fatal = -1,
    /// The operation was interrupted by the abort signal.
    Aborted = -2,
}

impl StoreStatus {
    pub const fn code(self) -> i32 {
        self as i8 as i32
    }

    /// Collapse an operation result into its status code.
    pub fn from_result(result: &Result<Self>) -> Self {
        match result {
            Ok(status) => *status,
            Err(err) => match err.kind {
                ErrorKind::LockBusy => Self::Locked,
                ErrorKind::Aborted => Self::Aborted,
                ErrorKind::ExternalDivergence => Self::Reopened,
                _ => Self::Fatal,
            },
        }
    }
}

impl TryFrom<i32> for StoreStatus {
    type Error = Error;

    fn try_from(code: i32) -> Result<Self> {
        Ok(match code {
            0 => Self::Success,
            1 => Self::NewMail,
            2 => Self::Locked,
            3 => Self::Reopened,
            4 => Self::Flags,
            -1 => Self::Fatal,
            -2 => Self::Aborted,
            other => {
                return Err(Error::new(format!("Invalid status code {other}"))
                    .set_kind(ErrorKind::ValueError))
            }
        })
    }
}

impl fmt::Display for StoreStatus {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "{}",
            match self {
                Self::Success => "success",
                Self::NewMail => "new mail",
                Self::Locked => "locked",
                Self::Reopened => "reopened",
                Self::Flags => "flags changed",
                Self::Fatal => "fatal",
                Self::Aborted => "aborted",
            }
        )
    }
}
