//
// mailstore
//
// Copyright 2025 Emmanouil Pitsidianakis <manos@pitsidianak.is>
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

use rusty_fork::rusty_fork_test;

rusty_fork_test! {
    #[test]
    fn test_notmuch_open_retries_busy_database() {
        tests::run_open_retries_busy_database();
    }
}

mod tests {
    use std::{path::PathBuf, time::Duration};

    use mailstore::{
        mbox::RecordFlags,
        notmuch::*,
        utils::logging::{LogLevel, StderrLogger},
        ErrorKind, StoreStatus,
    };
    use tempfile::TempDir;

    /// The index has a resolution of one second; wait for the next one so
    /// that the mailbox can tell an external change from its own.
    fn wait_for_next_second() {
        std::thread::sleep(Duration::from_millis(1100));
    }

    struct Fixture {
        temp_dir: TempDir,
        root: PathBuf,
        inbox: PathBuf,
        index: MemoryIndex,
    }

    impl Fixture {
        /// A maildir with three indexed messages: `one` (seen), its reply
        /// `two`, and `three`, which is spam. All are tagged `inbox`.
        fn new() -> Self {
            let temp_dir = TempDir::new().unwrap();
            let root = temp_dir.path().join("Mail");
            let inbox = root.join("INBOX");
            for d in &["cur", "new", "tmp"] {
                std::fs::create_dir_all(inbox.join(d)).unwrap();
            }
            let index = MemoryIndex::new(&root);
            let ret = Self {
                temp_dir,
                root,
                inbox,
                index,
            };
            ret.deliver(
                "cur/1700000001.1.host:2,S",
                "one@example.com",
                None,
                "Mon, 01 Jan 2024 10:00:00 +0000",
                "first",
                &["inbox"],
            );
            ret.deliver(
                "new/1700000002.2.host",
                "two@example.com",
                Some("one@example.com"),
                "Tue, 02 Jan 2024 10:00:00 +0000",
                "Re: first",
                &["inbox"],
            );
            ret.deliver(
                "new/1700000003.3.host",
                "three@example.com",
                None,
                "Wed, 03 Jan 2024 10:00:00 +0000",
                "buy now",
                &["inbox", "spam"],
            );
            ret
        }

        fn deliver(
            &self,
            name: &str,
            id: &str,
            in_reply_to: Option<&str>,
            date: &str,
            subject: &str,
            tags: &[&str],
        ) -> PathBuf {
            let path = self.inbox.join(name);
            let mut contents = format!(
                "Message-ID: <{id}>\nDate: {date}\nFrom: someone@example.com\nSubject: \
                 {subject}\n"
            );
            if let Some(parent) = in_reply_to {
                contents.push_str(&format!("In-Reply-To: <{parent}>\n"));
            }
            contents.push_str("\nHello,\nthis is a test.\n");
            std::fs::write(&path, contents).unwrap();

            let mut db = self.index.open(&self.root, OpenMode::ReadWrite).unwrap();
            let (status, message) = db.index_file(&path).unwrap();
            assert_eq!(status, FileStatus::Done);
            db.maildir_flags_to_tags(&message.id).unwrap();
            for tag in tags {
                db.add_tag(&message.id, tag).unwrap();
            }
            path
        }

        fn settings(&self) -> NotmuchSettings {
            NotmuchSettings {
                name: "index".to_string(),
                exclude_tags: vec!["spam".to_string()],
                ..NotmuchSettings::default()
            }
        }

        fn uri(&self, params: &str) -> String {
            format!("notmuch://{}?{}", self.root.display(), params)
        }

        fn mailbox(&self, params: &str) -> NotmuchMailbox<MemoryIndex> {
            NotmuchMailbox::new(self.index.clone(), &self.uri(params), self.settings()).unwrap()
        }

        fn message(&self, id: &str) -> Option<IndexMessage> {
            self.index
                .open(&self.root, OpenMode::ReadOnly)
                .unwrap()
                .find_message(id)
                .unwrap()
        }

        fn edit_tags(&self, id: &str, add: &[&str], remove: &[&str]) {
            let mut db = self.index.open(&self.root, OpenMode::ReadWrite).unwrap();
            for tag in add {
                db.add_tag(id, tag).unwrap();
            }
            for tag in remove {
                db.remove_tag(id, tag).unwrap();
            }
        }
    }

    fn ids(mailbox: &NotmuchMailbox<MemoryIndex>) -> Vec<String> {
        mailbox
            .snapshot()
            .iter()
            .map(|r| r.index_handle().unwrap().virtual_id.clone())
            .collect()
    }

    fn path_of(mailbox: &NotmuchMailbox<MemoryIndex>, index: usize) -> PathBuf {
        mailbox
            .snapshot()
            .get(index)
            .unwrap()
            .index_handle()
            .unwrap()
            .path
            .clone()
    }

    #[test]
    fn test_notmuch_load_messages() {
        let f = Fixture::new();
        let mut mailbox = f.mailbox("query=tag%3Ainbox");
        mailbox.load().unwrap();
        assert_eq!(ids(&mailbox), ["two@example.com", "one@example.com"]);

        let two = mailbox.snapshot().get(0).unwrap();
        assert!(!two.flags.contains(RecordFlags::READ));
        assert_eq!(
            two.index_handle().unwrap().tags,
            ["inbox".to_string(), "unread".to_string()]
        );
        assert_eq!(two.index_handle().unwrap().folder, f.inbox);
        assert_eq!(two.envelope.subject.as_deref(), Some("Re: first"));
        assert_eq!(two.lines, 2);
        assert_eq!(two.length, 23);

        let one = mailbox.snapshot().get(1).unwrap();
        assert!(one.flags.contains(RecordFlags::READ));
        assert_eq!(mailbox.snapshot().counts.unread, 1);
        assert_eq!(mailbox.position("one@example.com"), Some(1));

        let bytes = mailbox.message_bytes(1).unwrap();
        assert!(bytes.starts_with(b"Message-ID: <one@example.com>\n"));

        // Naming an excluded tag in the query brings its messages back.
        let mut mailbox = f.mailbox("query=tag%3Aspam");
        mailbox.load().unwrap();
        assert_eq!(ids(&mailbox), ["three@example.com"]);

        let mut mailbox = f.mailbox("query=tag%3Ainbox&limit=1");
        mailbox.load().unwrap();
        assert_eq!(ids(&mailbox), ["two@example.com"]);
    }

    #[test]
    fn test_notmuch_load_threads() {
        let f = Fixture::new();
        f.deliver(
            "new/1700000004.4.host",
            "four@example.com",
            None,
            "Thu, 04 Jan 2024 10:00:00 +0000",
            "other",
            &["inbox"],
        );
        let mut mailbox = f.mailbox("type=threads&query=tag%3Ainbox");
        mailbox.load().unwrap();
        assert_eq!(
            ids(&mailbox),
            ["four@example.com", "one@example.com", "two@example.com"]
        );

        // A reply pulls in the rest of its thread.
        let mut mailbox = f.mailbox("query=id%3Atwo%40example.com");
        mailbox.load().unwrap();
        assert_eq!(ids(&mailbox), ["two@example.com"]);
        assert_eq!(mailbox.read_entire_thread(0).unwrap(), StoreStatus::Success);
        assert_eq!(ids(&mailbox), ["two@example.com", "one@example.com"]);
        assert_eq!(mailbox.skipped(), 1);
        assert_eq!(mailbox.read_entire_thread(1).unwrap(), StoreStatus::Success);
        assert_eq!(mailbox.snapshot().len(), 2);
    }

    #[test]
    fn test_notmuch_check() {
        let f = Fixture::new();
        let mut mailbox = f.mailbox("query=tag%3Ainbox");
        mailbox.load().unwrap();
        assert_eq!(mailbox.check().unwrap(), StoreStatus::Success);

        wait_for_next_second();
        f.deliver(
            "new/1700000004.4.host",
            "four@example.com",
            None,
            "Thu, 04 Jan 2024 10:00:00 +0000",
            "other",
            &["inbox"],
        );
        assert_eq!(mailbox.check().unwrap(), StoreStatus::NewMail);
        assert_eq!(mailbox.snapshot().len(), 3);
        assert_eq!(mailbox.occulted().count(), 0);

        wait_for_next_second();
        f.edit_tags("one@example.com", &["important"], &[]);
        assert_eq!(mailbox.check().unwrap(), StoreStatus::Flags);
        assert!(mailbox
            .snapshot()
            .get(1)
            .unwrap()
            .index_handle()
            .unwrap()
            .tags
            .contains(&"important".to_string()));

        wait_for_next_second();
        f.edit_tags("two@example.com", &[], &["inbox"]);
        assert_eq!(mailbox.check().unwrap(), StoreStatus::Reopened);
        assert_eq!(mailbox.occulted().collect::<Vec<_>>(), [0]);
        assert!(!mailbox.message_is_still_queried(0).unwrap());
        assert!(mailbox.message_is_still_queried(1).unwrap());

        mailbox.reload().unwrap();
        assert_eq!(ids(&mailbox), ["four@example.com", "one@example.com"]);
    }

    #[test]
    fn test_notmuch_tags_commit_and_sync() {
        let f = Fixture::new();
        let mut mailbox = f.mailbox("query=tag%3Ainbox");
        mailbox.load().unwrap();
        let old_path = path_of(&mailbox, 0);

        mailbox.tags_commit(0, "").unwrap_err();
        mailbox.tags_commit(0, "-unread +todo !inbox").unwrap();
        let record = mailbox.snapshot().get(0).unwrap();
        assert!(record.flags.contains(RecordFlags::READ));
        assert!(record.is_changed());
        assert_eq!(
            record.index_handle().unwrap().tags,
            ["todo".to_string()]
        );
        let two = f.message("two@example.com").unwrap();
        assert!(two.has_tag("todo"));
        assert!(!two.has_tag("unread"));
        assert!(!two.has_tag("inbox"));
        // The index changed, but not behind the mailbox's back.
        assert_eq!(mailbox.check().unwrap(), StoreStatus::Success);

        assert_eq!(mailbox.sync().unwrap(), StoreStatus::Success);
        let new_path = f.inbox.join("cur").join("1700000002.2.host:2,S");
        assert!(!old_path.exists());
        assert!(new_path.exists());
        assert_eq!(path_of(&mailbox, 0), new_path);
        assert!(!mailbox.snapshot().get(0).unwrap().is_changed());
        let two = f.message("two@example.com").unwrap();
        assert_eq!(two.filenames, [new_path]);
        assert!(two.has_tag("todo"));
        assert!(!two.has_tag("unread"));
    }

    #[test]
    fn test_notmuch_sync_deleted() {
        let f = Fixture::new();
        let mut mailbox = f.mailbox("query=tag%3Ainbox");
        mailbox.load().unwrap();
        let path = path_of(&mailbox, 1);

        assert!(mailbox.set_flag(1, RecordFlags::DELETED, true).unwrap());
        assert_eq!(mailbox.sync().unwrap(), StoreStatus::Success);
        assert!(!path.exists());
        assert_eq!(f.message("one@example.com"), None);
        assert_eq!(ids(&mailbox), ["two@example.com"]);
        assert_eq!(mailbox.position("two@example.com"), Some(0));
        assert_eq!(mailbox.position("one@example.com"), None);
    }

    #[test]
    fn test_notmuch_update_filename() {
        let f = Fixture::new();
        let mut mailbox = f.mailbox("query=tag%3Ainbox");
        mailbox.load().unwrap();
        let old_path = path_of(&mailbox, 1);
        let new_path = f.inbox.join("cur").join("1700000001.1.host:2,FS");
        std::fs::rename(&old_path, &new_path).unwrap();

        mailbox.update_filename(None, &new_path, Some(1)).unwrap();
        assert_eq!(path_of(&mailbox, 1), new_path);
        let one = f.message("one@example.com").unwrap();
        assert_eq!(one.filenames, [new_path.clone()]);
        assert!(one.has_tag("flagged"));
        assert!(mailbox
            .snapshot()
            .get(1)
            .unwrap()
            .index_handle()
            .unwrap()
            .tags
            .contains(&"flagged".to_string()));

        mailbox
            .update_filename(None, &f.inbox.join("cur").join("missing"), Some(1))
            .unwrap_err();
    }

    #[test]
    fn test_notmuch_moved_file_is_found() {
        let f = Fixture::new();
        // Move the file behind the index's back.
        let indexed = f.inbox.join("new").join("1700000002.2.host");
        let moved = f.inbox.join("cur").join("1700000002.2.host:2,RS");
        std::fs::rename(&indexed, &moved).unwrap();

        let mut mailbox = f.mailbox("query=tag%3Ainbox");
        mailbox.load().unwrap();
        let handle = mailbox.snapshot().get(0).unwrap().index_handle().unwrap();
        assert_eq!(handle.path, moved);
        assert_eq!(handle.old_path.as_deref(), Some(indexed.as_path()));
        assert!(mailbox
            .snapshot()
            .get(0)
            .unwrap()
            .flags
            .contains(RecordFlags::READ | RecordFlags::REPLIED));

        // Sync points the index at the new name.
        assert_eq!(mailbox.sync().unwrap(), StoreStatus::Success);
        let two = f.message("two@example.com").unwrap();
        assert_eq!(two.filenames, [moved]);
        assert!(two.has_tag("replied"));
        assert!(!two.has_tag("unread"));
    }

    #[test]
    fn test_notmuch_count_and_tags() {
        let f = Fixture::new();
        let settings = f.settings();
        assert_eq!(
            NotmuchMailbox::count(&f.index, &settings, &f.uri("query=tag%3Ainbox")).unwrap(),
            (2, 1)
        );
        assert_eq!(
            NotmuchMailbox::count(&f.index, &settings, &f.uri("type=threads&query=tag%3Ainbox"))
                .unwrap(),
            (2, 2)
        );
        assert_eq!(
            NotmuchMailbox::count(&f.index, &settings, &f.uri("query=*")).unwrap(),
            (2, 1)
        );
        assert_eq!(
            NotmuchMailbox::count(&f.index, &settings, "notmuch:///nowhere?query=*")
                .unwrap_err()
                .kind,
            ErrorKind::NotFound
        );

        let mut mailbox = f.mailbox("query=*");
        assert_eq!(mailbox.all_tags().unwrap(), ["inbox", "spam", "unread"]);
    }

    #[test]
    fn test_notmuch_record_message() {
        let f = Fixture::new();
        let mut settings = f.settings();
        settings.record_tags = Some("+archived -inbox".to_string());
        let mut mailbox =
            NotmuchMailbox::new(f.index.clone(), &f.uri("query=tag%3Asent"), settings).unwrap();

        let path = f.inbox.join("cur").join("1700000005.5.host:2,S");
        std::fs::write(
            &path,
            "Message-ID: <five@example.com>\nSubject: sent\nDate: Fri, 05 Jan 2024 10:00:00 \
             +0000\n\nbody\n",
        )
        .unwrap();
        mailbox
            .record_message(&path, &["sent".to_string(), "inbox".to_string()])
            .unwrap();
        let five = f.message("five@example.com").unwrap();
        assert_eq!(five.tags_string(), "archived sent");
        assert_eq!(five.filenames, [path]);

        mailbox
            .record_message(&f.inbox.join("cur").join("missing"), &[])
            .unwrap();

        mailbox.load().unwrap();
        assert_eq!(ids(&mailbox), ["five@example.com"]);
    }

    #[test]
    fn test_notmuch_longrun() {
        let f = Fixture::new();
        let opens = f.index.opens().unwrap();
        let mut mailbox = f.mailbox("query=tag%3Ainbox");

        let token = mailbox.longrun_begin(false).unwrap();
        assert!(mailbox.in_longrun());
        mailbox.load().unwrap();
        mailbox.check().unwrap();
        mailbox.message_is_still_queried(0).unwrap();
        assert_eq!(f.index.opens().unwrap(), opens + 1);
        mailbox.longrun_end(token);
        assert!(!mailbox.in_longrun());

        mailbox.check().unwrap();
        mailbox.check().unwrap();
        assert_eq!(f.index.opens().unwrap(), opens + 3);
    }

    #[test]
    fn test_notmuch_open_errors() {
        let f = Fixture::new();
        let mut settings = f.settings();
        settings.open_timeout = 0;
        let mut mailbox =
            NotmuchMailbox::new(f.index.clone(), &f.uri("query=tag%3Ainbox"), settings).unwrap();
        f.index.set_busy(1).unwrap();
        assert_eq!(mailbox.load().unwrap_err().kind, ErrorKind::LockBusy);
        mailbox.load().unwrap();
        assert_eq!(mailbox.snapshot().len(), 2);

        let mut mailbox = NotmuchMailbox::new(
            f.index.clone(),
            "notmuch://?query=tag%3Ainbox",
            f.settings(),
        )
        .unwrap();
        assert_eq!(mailbox.load().unwrap_err().kind, ErrorKind::Configuration);

        let mut settings = f.settings();
        settings.default_uri = Some(f.root.display().to_string());
        let mut mailbox =
            NotmuchMailbox::new(f.index.clone(), "notmuch://?query=tag%3Ainbox", settings)
                .unwrap();
        mailbox.load().unwrap();
        assert_eq!(mailbox.snapshot().len(), 2);
        assert_eq!(
            mailbox.uri_from_query("tag:inbox&type=threads").unwrap(),
            format!("notmuch://{}?type=threads&query=tag%3Ainbox", f.root.display())
        );
    }

    #[test]
    fn test_notmuch_query_window() {
        let f = Fixture::new();
        let settings = NotmuchSettings {
            query_window_duration: 1,
            query_window_timebase: "week".to_string(),
            ..f.settings()
        };
        let mut mailbox =
            NotmuchMailbox::new(f.index.clone(), &f.uri("query=tag%3Ainbox"), settings).unwrap();
        // The fixture's messages are older than one week.
        mailbox.load().unwrap();
        assert_eq!(mailbox.snapshot().len(), 0);

        // A query with a date term is left alone.
        let mut mailbox = NotmuchMailbox::new(
            f.index.clone(),
            &f.uri("query=tag%3Ainbox%20and%20date%3A1704067200..1704240000"),
            NotmuchSettings {
                query_window_duration: 1,
                ..f.settings()
            },
        )
        .unwrap();
        mailbox.load().unwrap();
        assert_eq!(
            ids(&mailbox),
            ["two@example.com", "one@example.com"]
        );
    }

    pub fn run_open_retries_busy_database() {
        let f = Fixture::new();
        std::env::set_var("XDG_DATA_HOME", f.temp_dir.path());
        let mut logger = StderrLogger::new(LogLevel::INFO);
        let log_path = f.temp_dir.path().join("mailstore.log");
        logger.change_log_dest(log_path.clone()).unwrap();

        let mut mailbox = f.mailbox("query=tag%3Ainbox");
        f.index.set_busy(3).unwrap();
        mailbox.load().unwrap();
        assert_eq!(mailbox.snapshot().len(), 2);

        let log = std::fs::read_to_string(&log_path).unwrap();
        assert!(log.contains("Waiting for index database... (1 sec)"), "{log}");

        f.index.set_busy(usize::MAX).unwrap();
        let mut settings = f.settings();
        settings.open_timeout = 1;
        let mut mailbox =
            NotmuchMailbox::new(f.index.clone(), &f.uri("query=tag%3Ainbox"), settings).unwrap();
        assert_eq!(mailbox.load().unwrap_err().kind, ErrorKind::LockBusy);
        let log = std::fs::read_to_string(&log_path).unwrap();
        assert!(log.contains("Cannot open index database"), "{log}");
    }
}
