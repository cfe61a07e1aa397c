/*
 * mailstore - lib.rs
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

#![deny(
    rustdoc::redundant_explicit_links,
    unsafe_op_in_unsafe_fn,
    /* groups */
    clippy::correctness,
    clippy::suspicious,
    clippy::complexity,
    clippy::perf,
    clippy::cargo,
    clippy::style,
    /* restriction */
    clippy::dbg_macro,
    clippy::rc_buffer,
    clippy::as_underscore,
    clippy::assertions_on_result_states,
    /* rustdoc */
    rustdoc::broken_intra_doc_links,
    /* pedantic */
    clippy::doc_markdown,
    clippy::expect_fun_call,
    clippy::or_fun_call,
    clippy::borrow_as_ptr,
)]
#![allow(
    clippy::option_if_let_else,
    clippy::missing_const_for_fn,
    clippy::significant_drop_tightening,
    clippy::multiple_crate_versions,
    clippy::cognitive_complexity
)]

//! A crate that stores e-mail in flat files and bridges to an external
//! full-text index.
//!
//! - Scan `mbox` and `MMDF` files into ordered message records (see
//!   [`mbox::scanner`])
//! - Hold an in-memory [`MailboxSnapshot`](mbox::MailboxSnapshot) of a store,
//!   detect external modification and reconcile a fresh scan against it
//! - Rewrite a store in place from the first modified record onwards, with
//!   rollback and recovery of the temporary copy (see [`mbox::sync`])
//! - Present a tag query of a `notmuch`-style index as a mailbox, keep it in
//!   sync and edit tags (see [`notmuch`])
//!
//! Other exports are
//! - Store configuration (see module [`conf`])
//! - Advisory file locks, a logger and date helpers (see module [`utils`])

pub use utils::{
    datetime::UnixTimestamp,
    logging::{LogLevel, StderrLogger},
};

#[macro_use]
pub mod conf;
pub use conf::*;
pub mod error;
pub use error::*;

#[macro_use]
pub mod utils;

pub mod mbox;
pub mod notmuch;

#[macro_use]
extern crate serde_derive;
pub extern crate log;
pub extern crate nom;

#[macro_use]
extern crate bitflags;
pub extern crate indexmap;
