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

mod abort;
mod configs;
mod mbox_parse;
mod sync;

use std::path::{Path, PathBuf};

/// Three `mbox` records: A, B and C.
pub const THREE_MESSAGES: &[u8] = b"From alice@example.com Fri Jun 23 02:56:55 2000
Message-ID: <a@example.com>
From: alice@example.com
Subject: A

first message
has two lines

From bob@example.com Fri Jun 23 03:00:00 2000
Message-ID: <b@example.com>
From: bob@example.com
Subject: B
Status: O

second message

From carol@example.com Fri Jun 23 04:00:00 2000
Message-ID: <c@example.com>
From: carol@example.com
Subject: C

third message
>From quoted
last line

";

pub fn write_store(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}
