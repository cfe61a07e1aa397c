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

//! The tag edit language.
//!
//! An expression is a list of tokens separated by spaces or commas:
//!
//! - `-tag` removes `tag`
//! - `!tag` toggles `tag`
//! - `+tag` or `tag` adds `tag`
//!
//! ```
//! # use mailstore::notmuch::tags::{parse_tag_expression, TagEdit};
//! assert_eq!(
//!     parse_tag_expression("+inbox,-unread !todo"),
//!     vec![
//!         TagEdit::Add("inbox".into()),
//!         TagEdit::Remove("unread".into()),
//!         TagEdit::Toggle("todo".into()),
//!     ]
//! );
//! ```
//!
//! A separator that starts a token (as in `a ,b` or `a,,b`) ends the
//! expression; whatever follows it is ignored.

use std::collections::BTreeSet;

use crate::mbox::RecordFlags;

/// Split a tag list into its raw tokens.
pub fn split_tags(expr: &str) -> Vec<&str> {
    let bytes = expr.as_bytes();
    let mut ret = vec![];
    let mut start: Option<usize> = None;
    for (i, &b) in bytes.iter().enumerate() {
        if start.is_none() && b.is_ascii_whitespace() {
            continue;
        }
        let tag_start = *start.get_or_insert(i);
        let end = if b == b',' || b == b' ' {
            i
        } else if i + 1 == bytes.len() {
            i + 1
        } else {
            continue;
        };
        if tag_start >= end {
            break;
        }
        ret.push(&expr[tag_start..end]);
        start = None;
    }
    ret
}

#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum TagEdit {
    Add(String),
    Remove(String),
    Toggle(String),
}

impl TagEdit {
    pub fn new(token: &str) -> Self {
        if let Some(tag) = token.strip_prefix('-') {
            Self::Remove(tag.to_string())
        } else if let Some(tag) = token.strip_prefix('!') {
            Self::Toggle(tag.to_string())
        } else {
            Self::Add(token.strip_prefix('+').unwrap_or(token).to_string())
        }
    }

    pub fn tag(&self) -> &str {
        match self {
            Self::Add(tag) | Self::Remove(tag) | Self::Toggle(tag) => tag,
        }
    }

    /// Apply the edit to a tag set. Edits with an empty tag name do nothing.
    pub fn apply(&self, tags: &mut BTreeSet<String>) {
        if self.tag().is_empty() {
            return;
        }
        match self {
            Self::Add(tag) => {
                tags.insert(tag.clone());
            }
            Self::Remove(tag) => {
                tags.remove(tag);
            }
            Self::Toggle(tag) => {
                if !tags.remove(tag) {
                    tags.insert(tag.clone());
                }
            }
        }
    }

    /// The local flag an edit of one of the well-known tags stands for.
    ///
    /// `unread` is the inverse of [`RecordFlags::READ`]. Toggles are not
    /// mapped.
    pub fn flag_change(&self) -> Option<(RecordFlags, bool)> {
        let (tag, added) = match self {
            Self::Add(tag) => (tag.as_str(), true),
            Self::Remove(tag) => (tag.as_str(), false),
            Self::Toggle(_) => return None,
        };
        match tag {
            "unread" => Some((RecordFlags::READ, !added)),
            "replied" => Some((RecordFlags::REPLIED, added)),
            "flagged" => Some((RecordFlags::FLAGGED, added)),
            _ => None,
        }
    }
}

pub fn parse_tag_expression(expr: &str) -> Vec<TagEdit> {
    split_tags(expr).into_iter().map(TagEdit::new).collect()
}

/// Apply a whole expression to a tag set.
pub fn apply_tag_expression(expr: &str, tags: &mut BTreeSet<String>) {
    for edit in parse_tag_expression(expr) {
        log::trace!("tag edit {:?}", edit);
        edit.apply(tags);
    }
}
