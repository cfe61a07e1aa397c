/*
 * mailstore - mboxparse.rs
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

extern crate mailstore;
use mailstore::{
    mbox::{MboxMailbox, MboxSettings},
    utils::datetime,
    LogLevel, Result, StderrLogger,
};

/// Scans mbox or MMDF files read-only and prints one line per record.
///
/// # Example invocation
/// ```sh
/// ./mboxparse /path/to/mbox
/// ```
fn main() -> Result<()> {
    if std::env::args().len() == 1 {
        eprintln!("Usage: ./mboxparse /path/to/mbox");
        std::process::exit(1);
    }
    let _logger = StderrLogger::new(LogLevel::WARN);

    for i in std::env::args().skip(1) {
        println!("Path is {}", i);
        let filename = std::path::PathBuf::from(&i);

        if !(filename.exists() && filename.is_file()) {
            println!("{} is not a valid file.", i);
            continue;
        }
        let settings = MboxSettings {
            read_only: true,
            check_recent: true,
            ..MboxSettings::default()
        };
        match MboxMailbox::open(&filename, settings) {
            Ok(mailbox) => {
                let snapshot = mailbox.snapshot();
                println!(
                    "{} {} records parsed ({} unread, {} flagged)",
                    snapshot.len(),
                    mailbox.format(),
                    snapshot.counts.unread,
                    snapshot.counts.flagged
                );
                for record in snapshot.iter() {
                    println!(
                        "{:>5} @{:<10} {:>8}B {:>5}L {} {:?}",
                        record.index,
                        record.offset,
                        record.length,
                        record.lines,
                        datetime::timestamp_to_string(record.fingerprint.received, None),
                        record.envelope.subject.as_deref().unwrap_or_default()
                    );
                }
            }
            Err(err) => {
                println!("Error in parsing {}: {}", i, err);
            }
        }
    }
    Ok(())
}
