/*
 * mailstore - notmuch module.
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

//! Maildir file names of indexed messages.
//!
//! A message file lives in `<folder>/{cur,new,tmp}/<unique>[:2,<flags>]`.
//! Flags are single letters in ASCII order: `D`raft, `F`lagged, `P`assed,
//! `R`eplied, `S`een and `T`rashed.

use std::{
    ffi::OsStr,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};

use crate::{error::Result, mbox::RecordFlags};

const INFO_SEP: &[u8] = b":2,";

/// Flags in the `:2,` suffix of a file name.
///
/// A name with an unknown flag letter yields no flags at all. `T` only
/// deletes messages that are not flagged.
pub fn parse_flags(path: &Path) -> RecordFlags {
    let name = path.file_name().map(OsStrExt::as_bytes).unwrap_or_default();
    let Some(pos) = name
        .windows(INFO_SEP.len())
        .rposition(|w| w == INFO_SEP)
    else {
        return RecordFlags::empty();
    };
    let mut flags = RecordFlags::empty();
    let mut trashed = false;
    for b in &name[pos + INFO_SEP.len()..] {
        match b {
            b'F' => flags |= RecordFlags::FLAGGED,
            b'R' => flags |= RecordFlags::REPLIED,
            b'S' => flags |= RecordFlags::READ,
            b'T' => trashed = true,
            b'D' | b'P' => {}
            _ => return RecordFlags::empty(),
        }
    }
    if trashed && !flags.contains(RecordFlags::FLAGGED) {
        flags |= RecordFlags::DELETED;
    }
    flags
}

/// The `:2,` suffix for `flags`, empty when no flag is set.
pub fn flags_suffix(flags: RecordFlags) -> String {
    let mut ret = String::new();
    for (flag, ch) in [
        (RecordFlags::FLAGGED, 'F'),
        (RecordFlags::REPLIED, 'R'),
        (RecordFlags::READ, 'S'),
        (RecordFlags::DELETED, 'T'),
    ] {
        if flags.contains(flag) {
            ret.push(ch);
        }
    }
    if ret.is_empty() {
        ret
    } else {
        format!(":2,{}", ret)
    }
}

/// The name without its `:` info suffix.
pub fn unique_name(path: &Path) -> &OsStr {
    let name = path.file_name().map(OsStrExt::as_bytes).unwrap_or_default();
    let end = name.iter().position(|b| *b == b':').unwrap_or(name.len());
    OsStr::from_bytes(&name[..end])
}

/// The maildir folder of a message file, if the file is inside `cur`, `new`
/// or `tmp`.
pub fn folder_of(path: &Path) -> Option<PathBuf> {
    let subdir = path.parent()?;
    if !matches!(
        subdir.file_name().and_then(OsStr::to_str),
        Some("cur" | "new" | "tmp")
    ) {
        return None;
    }
    subdir
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
}

/// Where a message file belongs for `flags`: seen or old messages go to
/// `cur`, others to `new`.
pub fn path_for_flags(path: &Path, flags: RecordFlags) -> Option<PathBuf> {
    let folder = folder_of(path)?;
    let subdir = if flags.intersects(RecordFlags::READ | RecordFlags::OLD) {
        "cur"
    } else {
        "new"
    };
    let mut name = unique_name(path).to_os_string();
    name.push(flags_suffix(flags));
    Some(folder.join(subdir).join(name))
}

/// Rename a message file to match `flags`. Returns the new path, or `None`
/// when the name already matches.
pub fn rename_for_flags(path: &Path, flags: RecordFlags) -> Result<Option<PathBuf>> {
    let Some(new_path) = path_for_flags(path, flags) else {
        return Ok(None);
    };
    if new_path == path {
        return Ok(None);
    }
    std::fs::rename(path, &new_path).map_err(|err| {
        log::debug!(
            "rename {} -> {} failed: {}",
            path.display(),
            new_path.display(),
            err
        );
        crate::error::Error::from(err).set_related_path(Some(path))
    })?;
    Ok(Some(new_path))
}

/// Look for a message that was moved to another subdirectory or got new
/// flags since it was indexed, by its unique name.
pub fn find_message(folder: &Path, path: &Path) -> Option<PathBuf> {
    let unique = unique_name(path);
    for subdir in ["cur", "new"] {
        let Ok(entries) = std::fs::read_dir(folder.join(subdir)) else {
            continue;
        };
        for entry in entries.flatten() {
            let candidate = entry.path();
            if unique_name(&candidate) == unique {
                return Some(candidate);
            }
        }
    }
    None
}
