/*
 * mailstore - notmuch module.
 *
 * Copyright 2019 Manos Pitsidianakis
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

//! # Virtual mailboxes over a message index
//!
//! A [`NotmuchMailbox`] is the result of a query against an external index
//! of maildir messages (`notmuch` style). The index is reached through the
//! [`IndexBackend`] and [`IndexDatabase`] traits; [`MemoryIndex`] is an
//! in-process implementation.
//!
//! The mailbox is described by a query URI (see [`uri`]):
//!
//! ```text
//! notmuch:///home/user/Mail?type=threads&limit=50&query=tag%3Ainbox
//! ```
//!
//! Records of the mailbox point at maildir files through
//! [`StoreHandle::Indexed`]. Flag changes are written back by renaming the
//! files ([`NotmuchMailbox::sync`]), tag changes go to the index directly
//! ([`NotmuchMailbox::tags_commit`]).
//!
//! ## Database handles
//!
//! The database is opened when an operation needs it and closed when it
//! returns. To keep it open across several operations take a [`LongRun`]
//! token with [`NotmuchMailbox::longrun_begin`] and give it back to
//! [`NotmuchMailbox::longrun_end`].

use std::{
    collections::{BTreeSet, HashMap},
    fs::File,
    io::{BufReader, Read, Seek},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use smallvec::SmallVec;

use crate::{
    conf::{expand_home, StoreSettings},
    error::{Error, ErrorKind, Result, StoreStatus},
    mbox::{
        headers::{HeaderParser, Rfc822HeaderParser},
        record::{IndexHandle, MessageRecord, RecordFlags, StoreHandle},
        snapshot::{MailboxSnapshot, ScanStatus},
        StoreFormat,
    },
    utils::{
        datetime::{self, UnixTimestamp},
        AbortSignal,
    },
};

pub mod database;
pub mod maildir;
pub mod memory;
pub mod tags;
pub mod uri;
pub mod window;

pub use database::{
    FileStatus, IndexBackend, IndexDatabase, IndexMessage, IndexQuery, IndexThread, OpenMode,
    SortOrder,
};
pub use memory::{MemoryDatabase, MemoryIndex};
pub use tags::TagEdit;
pub use uri::{QueryType, QueryUri};
pub use window::{Timebase, WindowedQuery};

const OPEN_RETRY_WAIT: Duration = Duration::from_millis(500);

/// Settings of an index-backed store, read from [`StoreSettings::extra`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NotmuchSettings {
    pub name: String,
    /// Maximum number of messages a query loads, `0` for no limit.
    pub db_limit: usize,
    /// URI or path of the database for URIs that do not name one.
    pub default_uri: Option<String>,
    pub exclude_tags: Vec<String>,
    /// Seconds to keep retrying while the database is locked.
    pub open_timeout: u32,
    pub query_type: QueryType,
    pub query_window_duration: i32,
    pub query_window_timebase: String,
    pub query_window_current_position: u32,
    /// Tag expression applied to recorded messages.
    pub record_tags: Option<String>,
    pub unread_tag: String,
}

impl Default for NotmuchSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            db_limit: 0,
            default_uri: None,
            exclude_tags: vec![],
            open_timeout: 5,
            query_type: QueryType::Messages,
            query_window_duration: 0,
            query_window_timebase: "week".to_string(),
            query_window_current_position: 0,
            record_tags: None,
            unread_tag: "unread".to_string(),
        }
    }
}

impl NotmuchSettings {
    pub fn new(s: &StoreSettings) -> Result<Self> {
        let db_limit: usize = get_conf_val!(s["db_limit"], 0)?;
        let default_uri: String = get_conf_val!(s["default_uri"], String::new())?;
        let exclude_tags: String = get_conf_val!(s["exclude_tags"], String::new())?;
        let open_timeout: u32 = get_conf_val!(s["open_timeout"], 5)?;
        let query_type: String = get_conf_val!(s["query_type"], "messages".to_string())?;
        let query_window_duration: i32 = get_conf_val!(s["query_window_duration"], 0)?;
        let query_window_timebase: String =
            get_conf_val!(s["query_window_timebase"], "week".to_string())?;
        let query_window_current_position: u32 =
            get_conf_val!(s["query_window_current_position"], 0)?;
        let record_tags: String = get_conf_val!(s["record_tags"], String::new())?;
        let unread_tag: String = get_conf_val!(s["unread_tag"], "unread".to_string())?;
        if let Err(err) = Timebase::from_str(&query_window_timebase) {
            log::warn!("{}: {}; query windows are disabled", s.name, err);
        }
        Ok(Self {
            name: s.name.clone(),
            db_limit,
            default_uri: Some(default_uri).filter(|u| !u.is_empty()),
            exclude_tags: tags::split_tags(&exclude_tags)
                .into_iter()
                .map(str::to_string)
                .collect(),
            open_timeout,
            query_type: QueryType::new_lenient(&query_type),
            query_window_duration,
            query_window_timebase,
            query_window_current_position,
            record_tags: Some(record_tags).filter(|t| !t.is_empty()),
            unread_tag,
        })
    }

    /// Database path of [`NotmuchSettings::default_uri`].
    pub fn default_db_path(&self) -> Option<PathBuf> {
        let uri = self.default_uri.as_deref()?;
        if uri.contains("://") {
            QueryUri::parse(uri).ok()?.db_path
        } else {
            Some(expand_home(uri))
        }
    }
}

/// Open a database, retrying every half second for up to `timeout` seconds
/// while it is locked.
fn open_database<B: IndexBackend>(
    backend: &B,
    path: &Path,
    mode: OpenMode,
    timeout: u32,
    verbose: bool,
) -> Result<B::Database> {
    log::debug!(
        "db open '{}' {} (timeout {})",
        path.display(),
        if mode.is_writable() {
            "[WRITE]"
        } else {
            "[READ]"
        },
        timeout
    );
    let mut tries: u32 = 0;
    loop {
        match backend.open(path, mode) {
            Ok(db) => return Ok(db),
            Err(err) if err.kind == ErrorKind::LockBusy && timeout > 0 && tries / 2 <= timeout => {
                if verbose && tries > 0 && tries % 2 == 0 {
                    log::info!("Waiting for index database... ({} sec)", tries / 2);
                }
                std::thread::sleep(OPEN_RETRY_WAIT);
                tries += 1;
            }
            Err(err) => {
                if verbose {
                    log::error!("Cannot open index database: {}: {}", path.display(), err);
                }
                return Err(err);
            }
        }
    }
}

fn count_query<D: IndexDatabase>(
    db: &D,
    query: &str,
    query_type: QueryType,
    exclude_tags: &[String],
) -> Result<usize> {
    let q = IndexQuery::new(query).with_exclude_tags(exclude_tags);
    let ret = match query_type {
        QueryType::Messages => db.count_messages(&q)?,
        QueryType::Threads => db
            .search_threads(&q)?
            .iter()
            .map(|t| t.total_messages)
            .sum(),
    };
    log::debug!("count '{}', result={}", query, ret);
    Ok(ret)
}

/// Add, remove or toggle tags of message `id`. `current` is kept in step
/// with the index.
fn apply_tag_edits<D: IndexDatabase>(
    db: &mut D,
    id: &str,
    current: &mut BTreeSet<String>,
    edits: &[TagEdit],
) -> Result<()> {
    for edit in edits {
        let tag = edit.tag();
        if tag.is_empty() {
            continue;
        }
        let add = match edit {
            TagEdit::Add(_) => true,
            TagEdit::Remove(_) => false,
            TagEdit::Toggle(_) => !current.contains(tag),
        };
        if add {
            log::debug!("add tag: '{}'", tag);
            db.add_tag(id, tag)?;
        } else {
            log::debug!("remove tag: '{}'", tag);
            db.remove_tag(id, tag)?;
        }
        edit.apply(current);
    }
    Ok(())
}

fn remove_file_quietly(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => log::debug!("unlink {} failed: {}", path.display(), err),
    }
}

/// Build the URI of `query` on the database of `base`.
///
/// A `type=` parameter that was typed into the query is moved out of it.
/// The limit is written only when it differs from the configured default.
pub fn uri_from_query(query: &str, base: &QueryUri, settings: &NotmuchSettings) -> Result<String> {
    let (query, query_type) = uri::strip_type_from_query(query);
    let db_path = base
        .db_path
        .clone()
        .or_else(|| settings.default_db_path())
        .ok_or_else(|| {
            Error::new(format!(
                "Configuration error ({}): no index database path given",
                settings.name
            ))
            .set_kind(ErrorKind::Configuration)
        })?;
    let ret = QueryUri {
        db_path: Some(db_path),
        query_type: Some(
            query_type
                .or(base.query_type)
                .unwrap_or(settings.query_type),
        ),
        limit: Some(base.limit.unwrap_or(settings.db_limit)),
        query: Some(query),
    }
    .to_uri_string(settings.query_type, settings.db_limit);
    log::debug!("uri from query '{}'", ret);
    Ok(ret)
}

/// Rewrite a query URI in canonical form, so that equivalent URIs compare
/// equal.
pub fn normalize_uri(uri: &str, settings: &NotmuchSettings) -> Result<String> {
    let parsed = QueryUri::parse(uri)?;
    let query = parsed.query.as_deref().ok_or_else(|| {
        Error::new(format!("failed to parse notmuch uri: {}", uri))
            .set_details("uri has no query")
            .set_kind(ErrorKind::ValueError)
    })?;
    uri_from_query(query, &parsed, settings)
}

/// Proof that a [`NotmuchMailbox`] keeps its database open; end the long
/// run with [`NotmuchMailbox::longrun_end`].
#[must_use = "the database stays open until the token is given to `longrun_end`"]
#[derive(Debug)]
pub struct LongRun {
    _private: (),
}

/// A mailbox made of the results of an index query.
pub struct NotmuchMailbox<B: IndexBackend> {
    backend: B,
    settings: NotmuchSettings,
    uri: QueryUri,
    window: WindowedQuery,
    db: Option<B::Database>,
    longrun: bool,
    in_transaction: bool,
    snapshot: MailboxSnapshot,
    /// Message id to record index.
    ids: HashMap<String, usize>,
    /// When the mailbox last looked at the database.
    mtime: UnixTimestamp,
    /// Query results left out because they were already loaded.
    skipped: usize,
    abort: AbortSignal,
    parser: Arc<dyn HeaderParser>,
}

impl<B: IndexBackend> std::fmt::Debug for NotmuchMailbox<B> {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct(stringify!(NotmuchMailbox))
            .field("backend", &self.backend)
            .field("uri", &self.uri)
            .field("window", &self.window)
            .field("db", &self.db.is_some())
            .field("longrun", &self.longrun)
            .field("records", &self.snapshot.len())
            .field("mtime", &self.mtime)
            .finish()
    }
}

impl<B: IndexBackend> NotmuchMailbox<B> {
    pub fn new(backend: B, uri: &str, settings: NotmuchSettings) -> Result<Self> {
        let uri = QueryUri::parse(uri)?;
        let window = WindowedQuery::new(
            settings.query_window_duration,
            &settings.query_window_timebase,
            settings.query_window_current_position,
        );
        Ok(Self {
            backend,
            settings,
            uri,
            window,
            db: None,
            longrun: false,
            in_transaction: false,
            snapshot: MailboxSnapshot::new(StoreFormat::default(), false),
            ids: HashMap::default(),
            mtime: 0,
            skipped: 0,
            abort: AbortSignal::new(),
            parser: Arc::new(Rfc822HeaderParser),
        })
    }

    /// The mailbox a [`StoreSettings`] table with format `notmuch`
    /// describes; `root_mailbox` is its query URI.
    pub fn from_settings(backend: B, s: &StoreSettings) -> Result<Self> {
        s.validate()?;
        if !s.format.eq_ignore_ascii_case("notmuch") {
            return Err(Error::new(format!(
                "Configuration error ({}): store format `{}` is not an index",
                s.name, s.format
            ))
            .set_kind(ErrorKind::Configuration));
        }
        let settings = NotmuchSettings::new(s)?;
        Self::new(backend, &s.root_mailbox, settings)
    }

    pub fn with_parser(mut self, parser: Arc<dyn HeaderParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Loading stops at the next message once `abort` is raised.
    pub fn with_abort(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    pub fn uri(&self) -> &QueryUri {
        &self.uri
    }

    pub fn settings(&self) -> &NotmuchSettings {
        &self.settings
    }

    pub fn snapshot(&self) -> &MailboxSnapshot {
        &self.snapshot
    }

    pub fn window(&self) -> &WindowedQuery {
        &self.window
    }

    pub fn window_mut(&mut self) -> &mut WindowedQuery {
        &mut self.window
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    pub fn query_type(&self) -> QueryType {
        self.uri.query_type.unwrap_or(self.settings.query_type)
    }

    pub fn limit(&self) -> usize {
        self.uri.limit.unwrap_or(self.settings.db_limit)
    }

    pub fn db_path(&self) -> Result<PathBuf> {
        self.uri
            .db_path
            .clone()
            .or_else(|| self.settings.default_db_path())
            .ok_or_else(|| {
                Error::new(format!(
                    "Configuration error ({}): no index database path given",
                    self.settings.name
                ))
                .set_kind(ErrorKind::Configuration)
            })
    }

    /// Index of the record with message id `id`.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.ids.get(id).copied()
    }

    /// The query of the mailbox. With `window` set, a query without a date
    /// term is restricted to the current time window.
    pub fn query_string(&mut self, window: bool) -> Result<String> {
        let query = self.uri.query.clone().ok_or_else(|| {
            Error::new(format!("{}: query uri has no query", self.settings.name))
                .set_kind(ErrorKind::ValueError)
        })?;
        if window && !query.contains("date:") {
            if let Some(windowed) = self.window.apply(&query) {
                return Ok(windowed);
            }
        }
        Ok(query)
    }

    fn index_query(&self, query: &str) -> IndexQuery {
        IndexQuery::new(query)
            .with_exclude_tags(&self.settings.exclude_tags)
            .with_sort(SortOrder::NewestFirst)
    }

    /// The URI of `query` on the database of this mailbox.
    pub fn uri_from_query(&self, query: &str) -> Result<String> {
        let base = QueryUri {
            db_path: Some(self.db_path()?),
            ..self.uri.clone()
        };
        uri_from_query(query, &base, &self.settings)
    }

    fn database(&mut self, writable: bool) -> Result<&mut B::Database> {
        if matches!(self.db.as_ref(), Some(db) if writable && !db.mode().is_writable()) {
            log::debug!("db reopen for writing");
            self.db = None;
        }
        if self.db.is_none() {
            let path = self.db_path()?;
            let db = open_database(
                &self.backend,
                &path,
                OpenMode::new(writable),
                self.settings.open_timeout,
                true,
            )?;
            self.db = Some(db);
        }
        self.db.as_mut().ok_or_else(|| {
            Error::new("Index database is not open").set_kind(ErrorKind::Bug)
        })
    }

    fn release_db(&mut self) {
        if self.db.take().is_some() {
            log::debug!("db close");
        }
        self.longrun = false;
    }

    /// Run `f`, then close the database unless a long run keeps it open.
    fn scoped<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let ret = f(self);
        if !self.longrun {
            self.release_db();
        }
        ret
    }

    /// Keep the database open until [`NotmuchMailbox::longrun_end`].
    pub fn longrun_begin(&mut self, writable: bool) -> Result<LongRun> {
        self.database(writable)?;
        self.longrun = true;
        log::debug!("long run initialized");
        Ok(LongRun { _private: () })
    }

    pub fn longrun_end(&mut self, token: LongRun) {
        let LongRun { _private: () } = token;
        self.release_db();
        log::debug!("long run deinitialized");
    }

    pub fn in_longrun(&self) -> bool {
        self.longrun
    }

    fn trans_begin(&mut self) -> Result<bool> {
        if self.in_transaction {
            return Ok(false);
        }
        log::trace!("db trans start");
        self.database(true)?.begin_atomic()?;
        self.in_transaction = true;
        Ok(true)
    }

    fn trans_end(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Ok(());
        }
        log::trace!("db trans end");
        self.in_transaction = false;
        match self.db.as_mut() {
            Some(db) => db.end_atomic(),
            None => Ok(()),
        }
    }

    /// Run `f` inside an index transaction. Nested calls join the outer
    /// transaction.
    pub fn atomically<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let started = self.trans_begin()?;
        let ret = f(self);
        if started {
            let end = self.trans_end();
            return ret.and_then(|ret| end.map(|()| ret));
        }
        ret
    }

    fn refresh_stamp(&mut self) -> Result<()> {
        let modified = self.database(false)?.last_modified()?;
        self.mtime = datetime::now().max(modified);
        Ok(())
    }

    fn virtual_id(&self, index: usize) -> Result<String> {
        self.snapshot
            .get(index)
            .and_then(MessageRecord::index_handle)
            .map(|h| h.virtual_id.clone())
            .ok_or_else(|| {
                Error::new(format!("No indexed message with index {}", index))
                    .set_kind(ErrorKind::NotFound)
            })
    }

    /// Run the query and load its results.
    pub fn load(&mut self) -> Result<ScanStatus> {
        log::debug!("reading messages...[current count={}]", self.snapshot.len());
        self.skipped = 0;
        let ret = self.scoped(|this| {
            let modified = this.database(false)?.last_modified()?;
            let query = this.query_string(true)?;
            let query = this.index_query(&query);
            let limit = this.limit();
            let status = match this.query_type() {
                QueryType::Messages => this.read_messages(&query, false, limit)?,
                QueryType::Threads => this.read_threads(&query, false, limit)?,
            };
            Ok((status, modified))
        });
        let (status, modified) = ret?;
        self.mtime = datetime::now().max(modified);
        log::debug!(
            "reading messages... done [count={}, skipped={}]",
            self.snapshot.len(),
            self.skipped
        );
        Ok(status)
    }

    /// Forget all records and load the query again.
    pub fn reload(&mut self) -> Result<ScanStatus> {
        self.snapshot = MailboxSnapshot::new(StoreFormat::default(), false);
        self.ids.clear();
        self.load()
    }

    fn read_messages(&mut self, query: &IndexQuery, dedup: bool, limit: usize) -> Result<ScanStatus> {
        let messages = self.database(false)?.search_messages(query)?;
        for m in messages {
            if limit != 0 && self.snapshot.len() >= limit {
                break;
            }
            if self.abort.is_raised() {
                return Ok(ScanStatus::Aborted);
            }
            self.append_message(&m, dedup);
        }
        Ok(ScanStatus::Complete)
    }

    /// Load whole threads: every top level message followed by its replies,
    /// depth first.
    fn read_threads(&mut self, query: &IndexQuery, dedup: bool, limit: usize) -> Result<ScanStatus> {
        let threads = self.database(false)?.search_threads(query)?;
        for thread in threads {
            if limit != 0 && self.snapshot.len() >= limit {
                break;
            }
            let mut stack: SmallVec<[IndexMessage; 8]> = thread.toplevel.into_iter().rev().collect();
            while let Some(m) = stack.pop() {
                if self.abort.is_raised() {
                    return Ok(ScanStatus::Aborted);
                }
                let replies = self.database(false)?.replies(&m.id)?;
                self.append_message(&m, dedup);
                stack.extend(replies.into_iter().rev());
            }
        }
        Ok(ScanStatus::Complete)
    }

    fn append_message(&mut self, m: &IndexMessage, dedup: bool) {
        if dedup && self.ids.contains_key(&m.id) {
            self.skipped += 1;
            log::trace!("ignore id={}, already in the mailbox", m.id);
            return;
        }
        let Some(path) = m.last_filename() else {
            return;
        };
        log::trace!(
            "appending message, i={}, id={}, path={}",
            self.snapshot.len(),
            m.id,
            path.display()
        );
        let mut moved = false;
        let file_path = if path.exists() {
            path.to_path_buf()
        } else {
            match maildir::folder_of(path).and_then(|folder| maildir::find_message(&folder, path)) {
                Some(found) => {
                    log::debug!("not up-to-date: {} -> {}", path.display(), found.display());
                    moved = true;
                    found
                }
                None => {
                    log::debug!("failed to parse message: {}", path.display());
                    return;
                }
            }
        };
        let mut record = match self.read_record(&file_path, m) {
            Ok(record) => record,
            Err(err) => {
                log::debug!("failed to append message {}: {}", file_path.display(), err);
                return;
            }
        };
        if moved {
            if let Some(handle) = record.index_handle_mut() {
                log::debug!("remember obsolete path: {}", path.display());
                handle.old_path = Some(path.to_path_buf());
            }
        }
        self.ids.insert(m.id.clone(), self.snapshot.len());
        self.snapshot.push(record);
    }

    fn read_record(&self, path: &Path, m: &IndexMessage) -> Result<MessageRecord> {
        let folder = maildir::folder_of(path).ok_or_else(|| {
            Error::new(format!("{} is not inside a maildir folder", path.display()))
                .set_kind(ErrorKind::ValueError)
        })?;
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut envelope = self.parser.parse(&mut reader)?;
        let body_offset = reader.stream_position()?;
        let mut body = Vec::with_capacity(len.saturating_sub(body_offset) as usize);
        reader.read_to_end(&mut body)?;

        if envelope.message_id.is_none() {
            envelope.message_id = Some(format!("<{}>", m.id));
        }
        let mut record = MessageRecord::new(0, 0);
        record.body_offset = body_offset;
        record.length = i64::try_from(body.len())?;
        record.lines = i64::try_from(body.iter().filter(|b| **b == b'\n').count())?;
        record.flags = maildir::parse_flags(path);
        record.envelope = envelope;
        record.handle = StoreHandle::Indexed(IndexHandle {
            virtual_id: m.id.clone(),
            folder,
            path: path.to_path_buf(),
            old_path: None,
            tags: m.tags.iter().cloned().collect(),
        });
        record.update_fingerprint();
        Ok(record)
    }

    /// Look for changes in the index since the last look.
    ///
    /// Known messages get their file name and tags refreshed, and their
    /// flags too unless they were changed locally. New results are
    /// appended. Known messages missing from the results are left inactive
    /// (see [`NotmuchMailbox::occulted`]) and make the status `Reopened`.
    pub fn check(&mut self) -> Result<StoreStatus> {
        self.scoped(|this| this.check_inner())
    }

    fn check_inner(&mut self) -> Result<StoreStatus> {
        let modified = self.database(false)?.last_modified()?;
        if self.mtime >= modified {
            log::trace!(
                "check unnecessary (db={} mailbox={})",
                modified,
                self.mtime
            );
            return Ok(StoreStatus::Success);
        }
        log::debug!("checking (db={} mailbox={})", modified, self.mtime);
        let query = self.query_string(true)?;
        let query = self.index_query(&query);
        let limit = self.limit();
        let old_count = self.snapshot.len();
        for record in self.snapshot.records.iter_mut() {
            record.active = false;
        }
        let messages = self.database(false)?.search_messages(&query)?;
        let mut new_flags = 0;
        for (i, m) in messages.iter().enumerate() {
            if limit != 0 && i >= limit {
                break;
            }
            let Some(record) = self
                .ids
                .get(&m.id)
                .and_then(|&index| self.snapshot.records.get_mut(index))
            else {
                self.append_message(m, false);
                continue;
            };
            record.active = true;
            let changed = record.is_changed();
            let MessageRecord {
                ref mut flags,
                handle: StoreHandle::Indexed(ref mut handle),
                ..
            } = *record
            else {
                continue;
            };
            if let Some(new) = m.last_filename() {
                if handle.path != new {
                    log::debug!(
                        "message {} moved: {} -> {}",
                        m.id,
                        handle.path.display(),
                        new.display()
                    );
                    handle.path = new.to_path_buf();
                    if let Some(folder) = maildir::folder_of(new) {
                        handle.folder = folder;
                    }
                }
                if !changed {
                    let on_disk = maildir::parse_flags(new);
                    for flag in [RecordFlags::READ, RecordFlags::FLAGGED, RecordFlags::REPLIED] {
                        flags.set(flag, on_disk.contains(flag));
                    }
                }
            }
            let tags = m.tags.iter().cloned().collect::<Vec<String>>();
            if handle.tags != tags {
                handle.tags = tags;
                new_flags += 1;
            }
        }
        self.snapshot.recount();
        let occult = self.snapshot.iter().any(|r| !r.active);
        self.mtime = datetime::now().max(modified);
        log::debug!(
            "... check done [count={}, new_flags={}, occult={}]",
            self.snapshot.len(),
            new_flags,
            occult
        );
        Ok(if occult {
            StoreStatus::Reopened
        } else if self.snapshot.len() > old_count {
            StoreStatus::NewMail
        } else if new_flags > 0 {
            StoreStatus::Flags
        } else {
            StoreStatus::Success
        })
    }

    /// Records that the last [`NotmuchMailbox::check`] did not find in the
    /// query results any more.
    pub fn occulted(&self) -> impl Iterator<Item = usize> + '_ {
        self.snapshot
            .iter()
            .filter(|r| !r.active)
            .map(|r| r.index)
    }

    /// Set or clear local flags of record `index`; see
    /// [`MailboxSnapshot::set_flag`].
    pub fn set_flag(&mut self, index: usize, flags: RecordFlags, value: bool) -> Result<bool> {
        self.snapshot.set_flag(index, flags, value)
    }

    /// The raw bytes of the file of record `index`.
    pub fn message_bytes(&self, index: usize) -> Result<Vec<u8>> {
        let handle = self
            .snapshot
            .get(index)
            .and_then(MessageRecord::index_handle)
            .ok_or_else(|| {
                Error::new(format!("No indexed message with index {}", index))
                    .set_kind(ErrorKind::NotFound)
            })?;
        match std::fs::read(&handle.path) {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let found = maildir::find_message(&handle.folder, &handle.path).ok_or_else(|| {
                    Error::from(err).set_related_path(Some(&handle.path))
                })?;
                Ok(std::fs::read(found)?)
            }
            other => Ok(other?),
        }
    }

    /// Write local changes back: rename the maildir files of changed
    /// records to match their flags, remove deleted ones and update the
    /// index accordingly. Deleted records are dropped afterwards.
    pub fn sync(&mut self) -> Result<StoreStatus> {
        log::debug!("sync start ...");
        let ret = self.scoped(|this| this.sync_inner());
        log::debug!(".... sync done [{:?}]", ret.as_ref().map_err(|err| &err.summary));
        ret
    }

    fn sync_inner(&mut self) -> Result<StoreStatus> {
        let mut changed = false;
        for index in 0..self.snapshot.len() {
            let Some(record) = self.snapshot.records.get_mut(index) else {
                break;
            };
            let deleted = record.is_deleted();
            let dirty = record.is_changed();
            let flags = record.flags;
            let Some(handle) = record.index_handle_mut() else {
                continue;
            };
            let current = handle.path.clone();
            let old = match handle.old_path.take() {
                Some(old_path) => {
                    log::debug!("fixing obsolete path '{}'", old_path.display());
                    old_path
                }
                None => current.clone(),
            };
            let new = if deleted {
                remove_file_quietly(&current);
                None
            } else if dirty {
                let new = maildir::rename_for_flags(&current, flags)?.unwrap_or(current);
                handle.path = new.clone();
                Some(new)
            } else {
                Some(current)
            };
            match new {
                None => match self.remove_filename(&old) {
                    Ok(()) => changed = true,
                    Err(err) => log::debug!("failed to remove '{}': {}", old.display(), err),
                },
                Some(new) if new != old => match self.rename_filename(&old, &new, Some(index)) {
                    Ok(()) => changed = true,
                    Err(err) => log::debug!(
                        "failed to rename '{}' -> '{}': {}",
                        old.display(),
                        new.display(),
                        err
                    ),
                },
                Some(_) => {}
            }
        }

        self.snapshot.records.retain(|r| !r.is_deleted());
        self.ids.clear();
        for (i, record) in self.snapshot.records.iter_mut().enumerate() {
            record.index = i;
            if let Some(handle) = record.index_handle() {
                self.ids.insert(handle.virtual_id.clone(), i);
            }
        }
        self.snapshot.mark_synced();
        self.snapshot.recount();
        if changed {
            self.refresh_stamp()?;
        }
        Ok(StoreStatus::Success)
    }

    fn remove_filename(&mut self, path: &Path) -> Result<()> {
        log::trace!("remove filename '{}'", path.display());
        let message = self
            .database(true)?
            .find_message_by_filename(path)?
            .ok_or_else(|| {
                Error::new(format!("{} is not in the index", path.display()))
                    .set_kind(ErrorKind::NotFound)
            })?;
        self.atomically(|this| {
            let db = this.database(true)?;
            match db.remove_file(path)? {
                FileStatus::Done => {
                    log::trace!("remove success, call unlink");
                    remove_file_quietly(path);
                }
                FileStatus::Duplicate => {
                    log::trace!("remove success (duplicate), call unlink");
                    remove_file_quietly(path);
                    for other in message.filenames.iter().filter(|p| *p != path) {
                        log::trace!("remove duplicate: '{}'", other.display());
                        remove_file_quietly(other);
                        if let Err(err) = db.remove_file(other) {
                            log::debug!("failed to remove '{}': {}", other.display(), err);
                        }
                    }
                }
            }
            Ok(())
        })
    }

    fn rename_filename(&mut self, old: &Path, new: &Path, index: Option<usize>) -> Result<()> {
        if !new.exists() {
            return Err(Error::new(format!("{} does not exist", new.display()))
                .set_kind(ErrorKind::NotFound)
                .set_related_path(Some(new)));
        }
        log::debug!("rename filename, {} -> {}", old.display(), new.display());
        let flags = index
            .and_then(|i| self.snapshot.get(i))
            .map(|r| r.flags)
            .unwrap_or_default();
        let tags = self.atomically(|this| {
            let db = this.database(true)?;
            log::trace!("rename: add '{}'", new.display());
            let (_, message) = db.index_file(new)?;
            log::trace!("rename: rem '{}'", old.display());
            match db.remove_file(old) {
                Ok(FileStatus::Done) => {}
                Ok(FileStatus::Duplicate) => {
                    log::trace!("rename: syncing duplicate filename");
                    let others = db
                        .find_message_by_filename(new)?
                        .map(|m| m.filenames)
                        .unwrap_or_default();
                    for path in others.iter().filter(|p| *p != new) {
                        log::trace!("rename: syncing duplicate: {}", path.display());
                        match maildir::rename_for_flags(path, flags) {
                            Ok(Some(new_path)) => {
                                log::trace!(
                                    "rename dup {} -> {}",
                                    path.display(),
                                    new_path.display()
                                );
                                db.remove_file(path)?;
                                db.index_file(&new_path)?;
                            }
                            Ok(None) => {}
                            Err(err) => log::debug!("{}", err),
                        }
                    }
                }
                Err(err) => {
                    log::debug!("failed to remove '{}': {}", old.display(), err);
                    return Ok(None);
                }
            }
            db.maildir_flags_to_tags(&message.id)?;
            Ok(db.find_message(&message.id)?.map(|m| m.tags))
        })?;
        if let (Some(tags), Some(handle)) = (
            tags,
            index
                .and_then(|i| self.snapshot.records.get_mut(i))
                .and_then(MessageRecord::index_handle_mut),
        ) {
            handle.tags = tags.into_iter().collect();
        }
        Ok(())
    }

    /// Apply a tag expression (see [`tags`]) to the message of record
    /// `index`.
    ///
    /// Edits of `unread`, `replied` and `flagged` also change the local
    /// flags; the record is marked changed so that its file name follows on
    /// the next [`NotmuchMailbox::sync`].
    pub fn tags_commit(&mut self, index: usize, expr: &str) -> Result<()> {
        if expr.trim().is_empty() {
            return Err(Error::new("No tags to change").set_kind(ErrorKind::ValueError));
        }
        let id = self.virtual_id(index)?;
        let edits = tags::parse_tag_expression(expr);
        let tags = self.scoped(|this| {
            let db = this.database(true)?;
            let message = db.find_message(&id)?.ok_or_else(|| {
                Error::new(format!("Message {} not found in index", id))
                    .set_kind(ErrorKind::NotFound)
            })?;
            log::debug!("tags modify: '{}'", expr);
            let mut current = message.tags;
            db.freeze(&id)?;
            let applied = apply_tag_edits(db, &id, &mut current, &edits);
            db.thaw(&id)?;
            applied?;
            let tags = db
                .find_message(&id)?
                .map(|m| m.tags)
                .unwrap_or(current);
            this.refresh_stamp()?;
            Ok(tags)
        })?;
        for edit in &edits {
            if let Some((flag, value)) = edit.flag_change() {
                self.snapshot.set_flag(index, flag, value)?;
            }
        }
        if let Some(handle) = self
            .snapshot
            .records
            .get_mut(index)
            .and_then(MessageRecord::index_handle_mut)
        {
            handle.tags = tags.into_iter().collect();
        }
        self.snapshot.set_flag(index, RecordFlags::CHANGED, true)?;
        log::debug!("tags modify done");
        Ok(())
    }

    /// Append the rest of the thread of record `index` to the mailbox.
    pub fn read_entire_thread(&mut self, index: usize) -> Result<StoreStatus> {
        let id = self.virtual_id(index)?;
        let old_count = self.snapshot.len();
        log::debug!(
            "reading entire-thread messages...[current count={}]",
            old_count
        );
        let ret = self.scoped(|this| {
            let message = this.database(false)?.find_message(&id)?.ok_or_else(|| {
                Error::new(format!("Message {} not found in index", id))
                    .set_kind(ErrorKind::NotFound)
            })?;
            let query = this.index_query(&format!("thread:{}", message.thread_id));
            this.read_threads(&query, true, 0)
        });
        self.mtime = self.mtime.max(datetime::now());
        let status = ret?;
        if self.snapshot.len() == old_count {
            log::info!("No more messages in the thread");
        }
        log::debug!(
            "reading entire-thread messages... done [count={}]",
            self.snapshot.len()
        );
        Ok(match status {
            ScanStatus::Complete => StoreStatus::Success,
            ScanStatus::Aborted => StoreStatus::Aborted,
        })
    }

    /// Whether the message of record `index` still matches the query of the
    /// mailbox.
    pub fn message_is_still_queried(&mut self, index: usize) -> Result<bool> {
        let id = self.virtual_id(index)?;
        self.scoped(|this| {
            let query = format!("id:{} and ({})", id, this.query_string(true)?);
            log::trace!("checking if message is still queried: {}", query);
            let query_type = this.query_type();
            let query = IndexQuery::new(&query).with_sort(SortOrder::Unsorted);
            let db = this.database(false)?;
            let ret = match query_type {
                QueryType::Messages => !db.search_messages(&query)?.is_empty(),
                QueryType::Threads => !db.search_threads(&query)?.is_empty(),
            };
            log::trace!("checking if message is still queried: {} = {}", query.query, ret);
            Ok(ret)
        })
    }

    /// Count the results of a query URI and how many of them are unread,
    /// without a mailbox.
    pub fn count(backend: &B, settings: &NotmuchSettings, uri: &str) -> Result<(usize, usize)> {
        log::debug!("count {}", uri);
        let uri = QueryUri::parse(uri)?;
        let query = uri.query.as_deref().ok_or_else(|| {
            Error::new("query uri has no query").set_kind(ErrorKind::ValueError)
        })?;
        let query_type = uri.query_type.unwrap_or(settings.query_type);
        let path = uri
            .db_path
            .clone()
            .or_else(|| settings.default_db_path())
            .ok_or_else(|| {
                Error::new(format!(
                    "Configuration error ({}): no index database path given",
                    settings.name
                ))
                .set_kind(ErrorKind::Configuration)
            })?;
        let db = open_database(backend, &path, OpenMode::ReadOnly, settings.open_timeout, false)?;
        let all = count_query(&db, query, query_type, &settings.exclude_tags)?;
        let unread = count_query(
            &db,
            &format!("( {} ) tag:{}", query, settings.unread_tag),
            query_type,
            &settings.exclude_tags,
        )?;
        Ok((all, unread))
    }

    /// Every tag in the database.
    pub fn all_tags(&mut self) -> Result<Vec<String>> {
        log::debug!("get all tags");
        self.scoped(|this| {
            let mut ret = this.database(false)?.all_tags()?;
            ret.retain(|t| !t.is_empty());
            Ok(ret)
        })
    }

    /// Add the message file at `path` to the index.
    ///
    /// A newly indexed message gets tags from its maildir flags, then
    /// `tags`, then the configured `record_tags`. Paths that do not exist
    /// are ignored.
    pub fn record_message(&mut self, path: &Path, tags: &[String]) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        log::debug!("record message: {}", path.display());
        let mut edits = tags.iter().map(|t| TagEdit::new(t)).collect::<Vec<_>>();
        if let Some(record_tags) = self.settings.record_tags.as_deref() {
            edits.extend(tags::parse_tag_expression(record_tags));
        }
        self.scoped(|this| {
            this.atomically(|this| {
                let db = this.database(true)?;
                let (status, message) = db.index_file(path)?;
                if status == FileStatus::Duplicate {
                    return Ok(());
                }
                db.maildir_flags_to_tags(&message.id)?;
                let mut current = db
                    .find_message(&message.id)?
                    .map(|m| m.tags)
                    .unwrap_or_default();
                db.freeze(&message.id)?;
                let applied = apply_tag_edits(db, &message.id, &mut current, &edits);
                db.thaw(&message.id)?;
                applied
            })
        })
    }

    /// Tell the index that the file of a message was renamed from `old` to
    /// `new`. Without `old` the current file of record `index` is used.
    pub fn update_filename(
        &mut self,
        old: Option<&Path>,
        new: &Path,
        index: Option<usize>,
    ) -> Result<()> {
        let old = match (old, index) {
            (Some(old), _) => old.to_path_buf(),
            (None, Some(index)) => self
                .snapshot
                .get(index)
                .and_then(MessageRecord::index_handle)
                .map(|h| h.path.clone())
                .ok_or_else(|| {
                    Error::new(format!("No indexed message with index {}", index))
                        .set_kind(ErrorKind::NotFound)
                })?,
            (None, None) => {
                return Err(Error::new("No old file name given").set_kind(ErrorKind::ValueError))
            }
        };
        self.scoped(|this| {
            this.rename_filename(&old, new, index)?;
            if let Some(handle) = index
                .and_then(|i| this.snapshot.records.get_mut(i))
                .and_then(MessageRecord::index_handle_mut)
            {
                handle.path = new.to_path_buf();
            }
            this.refresh_stamp()
        })
    }
}
