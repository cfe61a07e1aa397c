/*
 * mailstore - notmuch module.
 *
 * Copyright 2020 Manos Pitsidianakis
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

//! The interface of an external message index.
//!
//! [`IndexBackend`] opens databases, [`IndexDatabase`] is one open
//! database. Messages and threads are returned as owned values; every
//! mutation goes through the database by message id.
//!
//! Backends report a database that is temporarily locked by another
//! process with [`ErrorKind::LockBusy`](crate::error::ErrorKind::LockBusy),
//! which makes openers retry. Any other open error is final.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use crate::{error::Result, utils::datetime::UnixTimestamp};

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

impl OpenMode {
    pub const fn new(writable: bool) -> Self {
        if writable {
            Self::ReadWrite
        } else {
            Self::ReadOnly
        }
    }

    #[inline]
    pub const fn is_writable(self) -> bool {
        matches!(self, Self::ReadWrite)
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum SortOrder {
    #[default]
    NewestFirst,
    OldestFirst,
    Unsorted,
}

/// A search to run against a database.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct IndexQuery {
    pub query: String,
    /// Messages with any of these tags are excluded, unless the query names
    /// the tag itself.
    pub exclude_tags: Vec<String>,
    /// Drop excluded messages from results instead of only flagging them.
    pub omit_excluded: bool,
    pub sort: SortOrder,
}

impl IndexQuery {
    pub fn new(query: &str) -> Self {
        Self {
            query: query.to_string(),
            ..Self::default()
        }
    }

    pub fn with_exclude_tags(mut self, tags: &[String]) -> Self {
        if !tags.is_empty() {
            self.exclude_tags = tags.to_vec();
            self.omit_excluded = true;
        }
        self
    }

    pub fn with_sort(mut self, sort: SortOrder) -> Self {
        self.sort = sort;
        self
    }
}

/// A message as stored in the index.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct IndexMessage {
    /// Message id without angle brackets.
    pub id: String,
    pub thread_id: String,
    /// Every file with this message id, oldest first.
    pub filenames: Vec<PathBuf>,
    pub tags: BTreeSet<String>,
    pub date: UnixTimestamp,
}

impl IndexMessage {
    /// The file the message was last indexed under.
    pub fn last_filename(&self) -> Option<&Path> {
        self.filenames.last().map(PathBuf::as_path)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Tags joined with spaces, in order.
    pub fn tags_string(&self) -> String {
        self.tags.iter().map(String::as_str).collect::<Vec<_>>().join(" ")
    }
}

/// A thread that has at least one message matching a query.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct IndexThread {
    pub id: String,
    /// Messages of the thread without a parent in it, oldest first.
    pub toplevel: Vec<IndexMessage>,
    pub total_messages: usize,
}

/// Outcome of adding or removing a file.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum FileStatus {
    /// The message was added, or its last file was removed.
    Done,
    /// Other files with the same message id exist.
    Duplicate,
}

pub trait IndexDatabase: std::fmt::Debug {
    fn mode(&self) -> OpenMode;

    fn search_messages(&self, query: &IndexQuery) -> Result<Vec<IndexMessage>>;

    fn search_threads(&self, query: &IndexQuery) -> Result<Vec<IndexThread>>;

    fn count_messages(&self, query: &IndexQuery) -> Result<usize>;

    fn find_message(&self, id: &str) -> Result<Option<IndexMessage>>;

    fn find_message_by_filename(&self, path: &Path) -> Result<Option<IndexMessage>>;

    /// Direct replies of a message, oldest first.
    fn replies(&self, id: &str) -> Result<Vec<IndexMessage>>;

    fn add_tag(&mut self, id: &str, tag: &str) -> Result<()>;

    fn remove_tag(&mut self, id: &str, tag: &str) -> Result<()>;

    /// Defer tag changes of a message until [`IndexDatabase::thaw`].
    fn freeze(&mut self, id: &str) -> Result<()>;

    fn thaw(&mut self, id: &str) -> Result<()>;

    /// Index a file, returning the message it belongs to.
    fn index_file(&mut self, path: &Path) -> Result<(FileStatus, IndexMessage)>;

    fn remove_file(&mut self, path: &Path) -> Result<FileStatus>;

    /// Set the `draft`, `flagged`, `passed`, `replied` and `unread` tags from
    /// the maildir flags of the message's files.
    fn maildir_flags_to_tags(&mut self, id: &str) -> Result<()>;

    fn all_tags(&self) -> Result<Vec<String>>;

    fn begin_atomic(&mut self) -> Result<()>;

    fn end_atomic(&mut self) -> Result<()>;

    /// Time of the last change to the database.
    fn last_modified(&self) -> Result<UnixTimestamp>;
}

pub trait IndexBackend: std::fmt::Debug {
    type Database: IndexDatabase;

    fn open(&self, path: &Path, mode: OpenMode) -> Result<Self::Database>;
}
