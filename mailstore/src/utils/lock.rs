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

//! Advisory whole-file locks.
//!
//! On Linux and Android open file description locks are used, so a lock
//! belongs to the file handle that took it and not to the process. Two
//! handles to the same file in one process therefore exclude each other, the
//! same way two processes do. Elsewhere traditional POSIX record locks are
//! used.

use std::{io::Write, os::fd::AsRawFd, path::Path, thread::sleep, time::Duration};

use crate::error::{Errno, Error, ErrorKind, Result};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FileLockOptions {
    Nonblocking {
        max_tries: u8,
        try_wait: Option<Duration>,
    },
    Blocking,
}

impl FileLockOptions {
    pub const fn try_thrice() -> Self {
        Self::Nonblocking {
            max_tries: 3,
            try_wait: Some(Duration::from_millis(100)),
        }
    }

    pub const fn try_once() -> Self {
        Self::Nonblocking {
            max_tries: 1,
            try_wait: None,
        }
    }
}

impl Default for FileLockOptions {
    fn default() -> Self {
        Self::try_thrice()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LockKind {
    Shared,
    Exclusive,
}

impl LockKind {
    const fn l_type(self) -> libc::c_short {
        (match self {
            Self::Shared => libc::F_RDLCK,
            Self::Exclusive => libc::F_WRLCK,
        }) as libc::c_short
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        // F_OFD_SETLKW
        const F_SETLKW: libc::c_int = 38;
        // F_OFD_SETLK
        const F_SETLK: libc::c_int = 37;
    } else {
        const F_SETLKW: libc::c_int = libc::F_SETLKW;
        const F_SETLK: libc::c_int = libc::F_SETLK;
    }
}

fn whole_file(l_type: libc::c_short) -> libc::flock {
    libc::flock {
        l_type,
        l_whence: libc::SEEK_SET as libc::c_short,
        l_start: 0,
        // Specifying 0 for l_len has the special meaning: lock all bytes
        // starting at the location specified by l_whence and l_start through
        // to the end of file, no matter how large the file grows.
        l_len: 0,
        // The l_pid field must be set to zero for open file description
        // locks.
        l_pid: 0,
        #[cfg(target_os = "freebsd")]
        l_sysid: 0,
    }
}

/// Take a whole-file lock on `fd`, retrying according to `options`.
///
/// A failure is always reported with [`ErrorKind::LockBusy`].
pub fn lock_fd<F: AsRawFd>(
    file: &F,
    kind: LockKind,
    options: FileLockOptions,
    path: &Path,
) -> Result<()> {
    let fd: libc::c_int = file.as_raw_fd();
    let mut flock = whole_file(kind.l_type());
    let op = match options {
        FileLockOptions::Blocking => F_SETLKW,
        FileLockOptions::Nonblocking { .. } => F_SETLK,
    };
    // SAFETY: fd is a valid descriptor for the lifetime of `file` and flock is
    // a properly initialised struct.
    let ret_val = unsafe { libc::fcntl(fd, op, &mut flock) };
    if ret_val == 0 {
        log::trace!("locked {} ({:?}) on fd {}", path.display(), kind, fd);
        return Ok(());
    }
    let mut err = Errno::last();

    let (max_tries, try_wait) = if let FileLockOptions::Nonblocking {
        max_tries,
        try_wait,
    } = options
    {
        (max_tries.saturating_sub(1), try_wait)
    } else {
        (0, None)
    };
    for attempt in 0..max_tries {
        log::debug!(
            "{} is locked, retrying ({}/{})",
            path.display(),
            attempt + 1,
            max_tries
        );
        if let Some(dur) = try_wait {
            sleep(dur);
        }
        // SAFETY: see above.
        let ret_val = unsafe { libc::fcntl(fd, op, &mut flock) };
        if ret_val == 0 {
            log::trace!("locked {} ({:?}) on fd {}", path.display(), kind, fd);
            return Ok(());
        }
        err = Errno::last();
    }

    Err(Error::new(format!("Could not lock {}", path.display()))
        .set_details(format!("fcntl() returned {}", err.desc()))
        .set_related_path(Some(path))
        .set_kind(ErrorKind::LockBusy))
}

/// Drop any lock `fd` holds.
pub fn unlock_fd<F: AsRawFd>(file: &F) -> Result<()> {
    let fd: libc::c_int = file.as_raw_fd();
    let mut flock = whole_file(libc::F_UNLCK as libc::c_short);
    // SAFETY: see [`lock_fd`].
    let ret_val = unsafe { libc::fcntl(fd, F_SETLK, &mut flock) };
    log::trace!("dropped lock for fd {}, got {}", fd, ret_val);
    if ret_val != 0 {
        return Err(Errno::last().into());
    }
    Ok(())
}

/// Book-keeping for the lock a session holds on its store handle.
///
/// The handle itself is not owned; callers pass it on every call.
#[derive(Debug, Default)]
pub struct LockState {
    held: bool,
    exclusive: bool,
}

impl LockState {
    pub const fn new() -> Self {
        Self {
            held: false,
            exclusive: false,
        }
    }

    pub const fn is_held(&self) -> bool {
        self.held
    }

    pub const fn is_exclusive(&self) -> bool {
        self.held && self.exclusive
    }

    /// Acquire a lock of `kind`. Taking a lock of the kind already held is a
    /// no-op; a different kind converts the existing lock.
    pub fn acquire<F: AsRawFd>(
        &mut self,
        file: &F,
        kind: LockKind,
        options: FileLockOptions,
        path: &Path,
    ) -> Result<()> {
        let exclusive = kind == LockKind::Exclusive;
        if self.held && self.exclusive == exclusive {
            return Ok(());
        }
        lock_fd(file, kind, options, path)?;
        self.held = true;
        self.exclusive = exclusive;
        Ok(())
    }

    /// Flush pending writes and unlock. Releasing an unheld lock does
    /// nothing.
    pub fn release<F: AsRawFd + Write>(&mut self, file: &mut F) -> Result<()> {
        if !self.held {
            return Ok(());
        }
        let flushed = file.flush();
        self.held = false;
        self.exclusive = false;
        let unlocked = unlock_fd(file);
        flushed?;
        unlocked
    }
}

#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;

    use super::*;

    #[test]
    fn test_lock_state_release_is_idempotent() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let path = tmp_dir.path().join("mbox");
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        let mut state = LockState::new();
        state
            .acquire(&file, LockKind::Shared, FileLockOptions::try_once(), &path)
            .unwrap();
        assert!(state.is_held());
        assert!(!state.is_exclusive());
        state
            .acquire(&file, LockKind::Exclusive, FileLockOptions::try_once(), &path)
            .unwrap();
        assert!(state.is_exclusive());
        state.release(&mut file).unwrap();
        assert!(!state.is_held());
        state.release(&mut file).unwrap();
        assert!(!state.is_held());
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn test_lock_conflict_is_lock_busy() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let path = tmp_dir.path().join("mbox");
        let open = || {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .unwrap()
        };
        let mut first = open();
        let second = open();
        let mut state = LockState::new();
        state
            .acquire(&first, LockKind::Exclusive, FileLockOptions::try_once(), &path)
            .unwrap();
        let err = lock_fd(&second, LockKind::Shared, FileLockOptions::try_once(), &path)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::LockBusy);
        state.release(&mut first).unwrap();
        lock_fd(&second, LockKind::Shared, FileLockOptions::try_once(), &path).unwrap();
        unlock_fd(&second).unwrap();
    }
}
