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

//! An index kept in process memory.
//!
//! [`MemoryIndex`] indexes maildir files the way an external index would and
//! understands a subset of its query syntax:
//!
//! - `*`
//! - `tag:<tag>`, `id:<message id>`, `thread:<thread id>`
//! - `date:<since>..<until>`, where each end is empty, `<N><timebase>` (that
//!   long ago), `@<timestamp>` or `<timestamp>`
//! - `from:<text>`, `subject:<text>`, `folder:<text>` and bare words, which
//!   match case-insensitively
//! - `and`, `or`, `not`, parentheses, and juxtaposition as `and`
//!
//! Handles are cheap to clone and share the same messages.

use std::{
    collections::BTreeSet,
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{Arc, Mutex},
};

use indexmap::IndexMap;

use super::{
    database::{
        FileStatus, IndexBackend, IndexDatabase, IndexMessage, IndexQuery, IndexThread, OpenMode,
        SortOrder,
    },
    window::Timebase,
};
use crate::{
    error::{Error, ErrorKind, Result},
    mbox::headers::{HeaderParser, Rfc822HeaderParser},
    utils::datetime::{self, UnixTimestamp},
};

#[derive(Clone, Debug)]
struct StoredMessage {
    message: IndexMessage,
    parent: Option<String>,
    from: String,
    subject: String,
}

#[derive(Debug, Default)]
struct MemoryStore {
    path: PathBuf,
    messages: IndexMap<String, StoredMessage>,
    busy: usize,
    opens: usize,
    modified: UnixTimestamp,
    atomic_depth: usize,
    frozen: BTreeSet<String>,
    next_thread: u64,
}

impl MemoryStore {
    fn touch(&mut self) {
        self.modified = datetime::now().max(self.modified + 1);
    }

    fn by_filename(&self, path: &Path) -> Option<&StoredMessage> {
        self.messages
            .values()
            .find(|m| m.message.filenames.iter().any(|f| f == path))
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut StoredMessage> {
        self.messages.get_mut(id).ok_or_else(|| {
            Error::new(format!("Message {} not found in index", id)).set_kind(ErrorKind::NotFound)
        })
    }

    fn matching(&self, query: &IndexQuery) -> Result<Vec<&StoredMessage>> {
        let expr = Expr::parse(&query.query)?;
        let mut mentioned = BTreeSet::new();
        expr.tags(&mut mentioned);
        let excluded = query
            .exclude_tags
            .iter()
            .filter(|t| !mentioned.contains(t.as_str()))
            .collect::<Vec<_>>();
        let mut ret = self
            .messages
            .values()
            .filter(|m| expr.matches(m))
            .filter(|m| {
                !query.omit_excluded || !excluded.iter().any(|t| m.message.has_tag(t.as_str()))
            })
            .collect::<Vec<_>>();
        match query.sort {
            SortOrder::NewestFirst => ret.sort_by_key(|m| std::cmp::Reverse(m.message.date)),
            SortOrder::OldestFirst => ret.sort_by_key(|m| m.message.date),
            SortOrder::Unsorted => {}
        }
        Ok(ret)
    }

    fn thread(&self, thread_id: &str) -> IndexThread {
        let mut members = self
            .messages
            .values()
            .filter(|m| m.message.thread_id == thread_id)
            .collect::<Vec<_>>();
        members.sort_by_key(|m| m.message.date);
        let toplevel = members
            .iter()
            .filter(|m| match m.parent.as_ref() {
                None => true,
                Some(parent) => self
                    .messages
                    .get(parent)
                    .map(|p| p.message.thread_id != thread_id)
                    .unwrap_or(true),
            })
            .map(|m| m.message.clone())
            .collect();
        IndexThread {
            id: thread_id.to_string(),
            toplevel,
            total_messages: members.len(),
        }
    }

    fn new_thread_id(&mut self) -> String {
        self.next_thread += 1;
        format!("{:016x}", self.next_thread)
    }
}

/// An in-process index rooted at a database path.
#[derive(Clone, Debug, Default)]
pub struct MemoryIndex {
    store: Arc<Mutex<MemoryStore>>,
}

impl MemoryIndex {
    pub fn new(path: &Path) -> Self {
        Self {
            store: Arc::new(Mutex::new(MemoryStore {
                path: path.to_path_buf(),
                ..MemoryStore::default()
            })),
        }
    }

    /// Make the next `n` opens fail as if another process held the database.
    pub fn set_busy(&self, n: usize) -> Result<()> {
        self.store.lock()?.busy = n;
        Ok(())
    }

    /// Number of successful opens so far.
    pub fn opens(&self) -> Result<usize> {
        Ok(self.store.lock()?.opens)
    }
}

impl IndexBackend for MemoryIndex {
    type Database = MemoryDatabase;

    fn open(&self, path: &Path, mode: OpenMode) -> Result<MemoryDatabase> {
        let mut store = self.store.lock()?;
        if store.path != path {
            return Err(Error::new(format!(
                "Could not open index database at path {}: no such database",
                path.display()
            ))
            .set_kind(ErrorKind::NotFound)
            .set_related_path(Some(path)));
        }
        if store.busy > 0 {
            store.busy -= 1;
            return Err(Error::new(format!(
                "Index database at {} is locked by another process",
                path.display()
            ))
            .set_kind(ErrorKind::LockBusy));
        }
        store.opens += 1;
        Ok(MemoryDatabase {
            store: self.store.clone(),
            mode,
        })
    }
}

/// An open [`MemoryIndex`].
#[derive(Debug)]
pub struct MemoryDatabase {
    store: Arc<Mutex<MemoryStore>>,
    mode: OpenMode,
}

impl MemoryDatabase {
    fn check_writable(&self) -> Result<()> {
        if self.mode.is_writable() {
            Ok(())
        } else {
            Err(Error::new("Index database was opened read-only").set_kind(ErrorKind::ReadOnly))
        }
    }
}

impl IndexDatabase for MemoryDatabase {
    fn mode(&self) -> OpenMode {
        self.mode
    }

    fn search_messages(&self, query: &IndexQuery) -> Result<Vec<IndexMessage>> {
        let store = self.store.lock()?;
        Ok(store
            .matching(query)?
            .into_iter()
            .map(|m| m.message.clone())
            .collect())
    }

    fn search_threads(&self, query: &IndexQuery) -> Result<Vec<IndexThread>> {
        let store = self.store.lock()?;
        let mut seen = BTreeSet::new();
        let mut ret = vec![];
        for m in store.matching(query)? {
            if seen.insert(m.message.thread_id.as_str()) {
                ret.push(store.thread(&m.message.thread_id));
            }
        }
        Ok(ret)
    }

    fn count_messages(&self, query: &IndexQuery) -> Result<usize> {
        Ok(self.store.lock()?.matching(query)?.len())
    }

    fn find_message(&self, id: &str) -> Result<Option<IndexMessage>> {
        Ok(self
            .store
            .lock()?
            .messages
            .get(id)
            .map(|m| m.message.clone()))
    }

    fn find_message_by_filename(&self, path: &Path) -> Result<Option<IndexMessage>> {
        Ok(self
            .store
            .lock()?
            .by_filename(path)
            .map(|m| m.message.clone()))
    }

    fn replies(&self, id: &str) -> Result<Vec<IndexMessage>> {
        let store = self.store.lock()?;
        let mut ret = store
            .messages
            .values()
            .filter(|m| m.parent.as_deref() == Some(id))
            .map(|m| m.message.clone())
            .collect::<Vec<_>>();
        ret.sort_by_key(|m| m.date);
        Ok(ret)
    }

    fn add_tag(&mut self, id: &str, tag: &str) -> Result<()> {
        self.check_writable()?;
        let mut store = self.store.lock()?;
        if store.get_mut(id)?.message.tags.insert(tag.to_string()) {
            store.touch();
        }
        Ok(())
    }

    fn remove_tag(&mut self, id: &str, tag: &str) -> Result<()> {
        self.check_writable()?;
        let mut store = self.store.lock()?;
        if store.get_mut(id)?.message.tags.remove(tag) {
            store.touch();
        }
        Ok(())
    }

    fn freeze(&mut self, id: &str) -> Result<()> {
        self.check_writable()?;
        let mut store = self.store.lock()?;
        store.get_mut(id)?;
        store.frozen.insert(id.to_string());
        Ok(())
    }

    fn thaw(&mut self, id: &str) -> Result<()> {
        let mut store = self.store.lock()?;
        if !store.frozen.remove(id) {
            return Err(
                Error::new(format!("Unbalanced thaw of message {}", id)).set_kind(ErrorKind::Bug)
            );
        }
        Ok(())
    }

    fn index_file(&mut self, path: &Path) -> Result<(FileStatus, IndexMessage)> {
        self.check_writable()?;
        let file = File::open(path).map_err(|err| Error::from(err).set_related_path(Some(path)))?;
        let modified = file
            .metadata()
            .map(|m| datetime::file_times(&m).0)
            .unwrap_or(0);
        let envelope = Rfc822HeaderParser.parse(&mut BufReader::new(file))?;

        let mut store = self.store.lock()?;
        if let Some(existing) = store.by_filename(path) {
            return Ok((FileStatus::Duplicate, existing.message.clone()));
        }
        let id = envelope
            .message_id_bare()
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("mailstore-{}", uuid::Uuid::new_v4().as_simple()));
        if let Some(existing) = store.messages.get_mut(&id) {
            existing.message.filenames.push(path.to_path_buf());
            let ret = existing.message.clone();
            store.touch();
            return Ok((FileStatus::Duplicate, ret));
        }

        let parent = envelope
            .in_reply_to
            .as_deref()
            .and_then(|v| v.split_whitespace().next())
            .or_else(|| {
                envelope
                    .references
                    .as_deref()
                    .and_then(|v| v.split_whitespace().last())
            })
            .map(|v| v.trim_start_matches('<').trim_end_matches('>').to_string())
            .filter(|v| !v.is_empty() && *v != id);
        let thread_id = match parent.as_ref().and_then(|p| store.messages.get(p)) {
            Some(p) => p.message.thread_id.clone(),
            None => match store
                .messages
                .values()
                .find(|m| m.parent.as_deref() == Some(id.as_str()))
            {
                Some(child) => child.message.thread_id.clone(),
                None => store.new_thread_id(),
            },
        };
        let date = envelope
            .date
            .as_deref()
            .and_then(|d| chrono::DateTime::parse_from_rfc2822(d.trim()).ok())
            .and_then(|d| UnixTimestamp::try_from(d.timestamp()).ok())
            .unwrap_or(modified);
        let message = IndexMessage {
            id: id.clone(),
            thread_id,
            filenames: vec![path.to_path_buf()],
            tags: BTreeSet::new(),
            date,
        };
        log::trace!("indexed {} as {}", path.display(), id);
        store.messages.insert(
            id,
            StoredMessage {
                message: message.clone(),
                parent,
                from: envelope.from.unwrap_or_default(),
                subject: envelope.subject.unwrap_or_default(),
            },
        );
        store.touch();
        Ok((FileStatus::Done, message))
    }

    fn remove_file(&mut self, path: &Path) -> Result<FileStatus> {
        self.check_writable()?;
        let mut store = self.store.lock()?;
        let id = store
            .by_filename(path)
            .map(|m| m.message.id.clone())
            .ok_or_else(|| {
                Error::new(format!("{} is not in the index", path.display()))
                    .set_kind(ErrorKind::NotFound)
            })?;
        let stored = store.get_mut(&id)?;
        stored.message.filenames.retain(|f| f != path);
        let ret = if stored.message.filenames.is_empty() {
            store.messages.shift_remove(&id);
            FileStatus::Done
        } else {
            FileStatus::Duplicate
        };
        store.touch();
        Ok(ret)
    }

    fn maildir_flags_to_tags(&mut self, id: &str) -> Result<()> {
        use std::os::unix::ffi::OsStrExt;

        self.check_writable()?;
        let mut store = self.store.lock()?;
        let stored = store.get_mut(id)?;
        let mut letters = BTreeSet::new();
        for f in &stored.message.filenames {
            let name = f.file_name().map(OsStrExt::as_bytes).unwrap_or_default();
            if let Some(pos) = name.windows(3).rposition(|w| w == b":2,") {
                letters.extend(name[pos + 3..].iter().copied());
            }
        }
        let tags = &mut stored.message.tags;
        for (letter, tag) in [
            (b'D', "draft"),
            (b'F', "flagged"),
            (b'P', "passed"),
            (b'R', "replied"),
        ] {
            if letters.contains(&letter) {
                tags.insert(tag.to_string());
            } else {
                tags.remove(tag);
            }
        }
        if letters.contains(&b'S') {
            tags.remove("unread");
        } else {
            tags.insert("unread".to_string());
        }
        store.touch();
        Ok(())
    }

    fn all_tags(&self) -> Result<Vec<String>> {
        let store = self.store.lock()?;
        let tags = store
            .messages
            .values()
            .flat_map(|m| m.message.tags.iter())
            .filter(|t| !t.is_empty())
            .cloned()
            .collect::<BTreeSet<String>>();
        Ok(tags.into_iter().collect())
    }

    fn begin_atomic(&mut self) -> Result<()> {
        self.check_writable()?;
        self.store.lock()?.atomic_depth += 1;
        Ok(())
    }

    fn end_atomic(&mut self) -> Result<()> {
        let mut store = self.store.lock()?;
        if store.atomic_depth == 0 {
            return Err(Error::new("end_atomic without begin_atomic").set_kind(ErrorKind::Bug));
        }
        store.atomic_depth -= 1;
        Ok(())
    }

    fn last_modified(&self) -> Result<UnixTimestamp> {
        Ok(self.store.lock()?.modified)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Expr {
    All,
    Tag(String),
    Id(String),
    Thread(String),
    Date(Option<UnixTimestamp>, Option<UnixTimestamp>),
    From(String),
    Subject(String),
    Folder(String),
    Text(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

#[derive(Clone, Debug, Eq, PartialEq)]
enum Token {
    Open,
    Close,
    Word(String),
}

fn tokenize(query: &str) -> Vec<Token> {
    let mut ret = vec![];
    let mut word = String::new();
    let mut quoted = false;
    let flush = |word: &mut String, ret: &mut Vec<Token>| {
        if !word.is_empty() {
            ret.push(Token::Word(std::mem::take(word)));
        }
    };
    for c in query.chars() {
        match c {
            '"' => quoted = !quoted,
            c if quoted => word.push(c),
            '(' => {
                flush(&mut word, &mut ret);
                ret.push(Token::Open);
            }
            ')' => {
                flush(&mut word, &mut ret);
                ret.push(Token::Close);
            }
            c if c.is_whitespace() => flush(&mut word, &mut ret),
            c => word.push(c),
        }
    }
    flush(&mut word, &mut ret);
    ret
}

struct Parser<'q> {
    query: &'q str,
    tokens: Vec<Token>,
    pos: usize,
    now: UnixTimestamp,
}

impl Parser<'_> {
    fn error(&self, reason: &str) -> Error {
        Error::new(format!("Invalid query `{}`", self.query))
            .set_details(reason.to_string())
            .set_kind(ErrorKind::ValueError)
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.tokens.get(self.pos), Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword))
    }

    fn or_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.and_expr()?;
        while self.peek_keyword("or") {
            self.pos += 1;
            let rhs = self.and_expr()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.unary()?;
        loop {
            if self.peek_keyword("and") {
                self.pos += 1;
            } else if self.peek_keyword("or")
                || matches!(self.tokens.get(self.pos), None | Some(Token::Close))
            {
                return Ok(lhs);
            }
            let rhs = self.unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.peek_keyword("not") {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        match self.tokens.get(self.pos).cloned() {
            Some(Token::Open) => {
                self.pos += 1;
                let inner = self.or_expr()?;
                if self.tokens.get(self.pos) != Some(&Token::Close) {
                    return Err(self.error("unbalanced parentheses"));
                }
                self.pos += 1;
                Ok(inner)
            }
            Some(Token::Word(word)) => {
                self.pos += 1;
                self.term(&word)
            }
            Some(Token::Close) => Err(self.error("unexpected `)`")),
            None => Err(self.error("unexpected end of query")),
        }
    }

    fn term(&self, word: &str) -> Result<Expr> {
        if word == "*" {
            return Ok(Expr::All);
        }
        let Some((prefix, value)) = word.split_once(':') else {
            return Ok(Expr::Text(word.to_lowercase()));
        };
        Ok(match prefix {
            "tag" => Expr::Tag(value.to_string()),
            "id" | "mid" => Expr::Id(
                value
                    .trim_start_matches('<')
                    .trim_end_matches('>')
                    .to_string(),
            ),
            "thread" => Expr::Thread(value.to_string()),
            "date" => {
                let (since, until) = value.split_once("..").unwrap_or((value, ""));
                Expr::Date(self.date(since)?, self.date(until)?)
            }
            "from" => Expr::From(value.to_lowercase()),
            "subject" => Expr::Subject(value.to_lowercase()),
            "folder" | "path" => Expr::Folder(value.to_string()),
            _ => Expr::Text(word.to_lowercase()),
        })
    }

    fn date(&self, value: &str) -> Result<Option<UnixTimestamp>> {
        if value.is_empty() {
            return Ok(None);
        }
        let value = value.strip_prefix('@').unwrap_or(value);
        if let Ok(timestamp) = value.parse::<UnixTimestamp>() {
            return Ok(Some(timestamp));
        }
        let digits = value
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(value.len());
        let (n, unit) = value.split_at(digits);
        let n = n
            .parse::<u64>()
            .map_err(|_| self.error(&format!("invalid date `{}`", value)))?;
        let unit = Timebase::from_str(unit).map_err(|err| self.error(&err.summary))?;
        Ok(Some(self.now.saturating_sub(n * unit.seconds())))
    }
}

impl Expr {
    fn parse(query: &str) -> Result<Self> {
        let mut parser = Parser {
            query,
            tokens: tokenize(query),
            pos: 0,
            now: datetime::now(),
        };
        if parser.tokens.is_empty() {
            return Err(parser.error("empty query"));
        }
        let ret = parser.or_expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(parser.error("unbalanced parentheses"));
        }
        Ok(ret)
    }

    fn tags<'e>(&'e self, ret: &mut BTreeSet<&'e str>) {
        match self {
            Self::Tag(tag) => {
                ret.insert(tag);
            }
            Self::Not(e) => e.tags(ret),
            Self::And(a, b) | Self::Or(a, b) => {
                a.tags(ret);
                b.tags(ret);
            }
            _ => {}
        }
    }

    fn matches(&self, m: &StoredMessage) -> bool {
        match self {
            Self::All => true,
            Self::Tag(tag) => m.message.has_tag(tag),
            Self::Id(id) => m.message.id == *id,
            Self::Thread(id) => m.message.thread_id == *id,
            Self::Date(since, until) => {
                since.map(|s| m.message.date >= s).unwrap_or(true)
                    && until.map(|u| m.message.date <= u).unwrap_or(true)
            }
            Self::From(text) => m.from.to_lowercase().contains(text.as_str()),
            Self::Subject(text) => m.subject.to_lowercase().contains(text.as_str()),
            Self::Folder(text) => m
                .message
                .filenames
                .iter()
                .any(|f| f.to_string_lossy().contains(text.as_str())),
            Self::Text(text) => {
                m.subject.to_lowercase().contains(text.as_str())
                    || m.from.to_lowercase().contains(text.as_str())
            }
            Self::Not(e) => !e.matches(m),
            Self::And(a, b) => a.matches(m) && b.matches(m),
            Self::Or(a, b) => a.matches(m) || b.matches(m),
        }
    }
}
