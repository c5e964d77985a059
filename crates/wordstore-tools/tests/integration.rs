//! Integration tests: maintenance tools and word lists over real stores.

use std::io::Cursor;

use tempfile::TempDir;
use wordstore_core::{
    Config, CounterRecord, Datastore, Handle, MetaKey, OpenMode, PruneThresholds, StoreError,
};
use wordstore_tools::{
    dump, load, prune, purge_logs, recover, verify, CountField, DumpOptions, ListKind, ListSpec,
    LoadOptions, LoadStats, ToolError, ToolResult, WordLists,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn configs() -> Vec<Config> {
    vec![
        Config {
            lock_retries: 100_000,
            ..Config::transactional()
        },
        Config {
            lock_retries: 100_000,
            ..Config::traditional()
        },
    ]
}

fn open_lists(config: Config, specs: &[ListSpec]) -> WordLists {
    WordLists::open(Datastore::new(config).unwrap(), specs).unwrap()
}

fn load_text(ds: &Datastore, h: &mut Handle, text: &str) -> ToolResult<LoadStats> {
    load(ds, h, Cursor::new(text), &LoadOptions::default())
}

fn dump_string(ds: &Datastore, dir: &std::path::Path, list: &str, options: &DumpOptions) -> String {
    let h = ds.open(dir, list, OpenMode::Read).unwrap();
    let mut out = Vec::new();
    dump(&h, &mut out, options).unwrap();
    ds.close(h, false).unwrap();
    String::from_utf8(out).unwrap()
}

// ---------------------------------------------------------------------------
// Dump / Load
// ---------------------------------------------------------------------------

#[test]
fn test_dump_format() {
    for config in configs() {
        let tmp = TempDir::new().unwrap();
        let ds = Datastore::new(config).unwrap();
        let mut h = ds.open(tmp.path(), "spam", OpenMode::Write).unwrap();
        ds.begin(&mut h).unwrap();
        h.write(b"cash", &CounterRecord::new(4, 1, 20240105)).unwrap();
        h.write(b"dated-not", &CounterRecord::counts(2, 0)).unwrap();
        h.set_metadata(MetaKey::MessageCount, &CounterRecord::counts(7, 0)).unwrap();
        ds.commit(&mut h).unwrap();
        ds.close(h, true).unwrap();

        let text = dump_string(&ds, tmp.path(), "spam", &DumpOptions::default());
        assert_eq!(text, ".MSG_COUNT 7\n.WORDLIST_VERSION 1\ncash 4 20240105\ndated-not 2\n");

        let good = DumpOptions {
            field: Some(CountField::Good),
            ..DumpOptions::default()
        };
        let text = dump_string(&ds, tmp.path(), "spam", &good);
        assert!(text.contains("cash 1 20240105\n"));
    }
}

#[test]
fn test_dump_replaces_non_ascii() {
    let tmp = TempDir::new().unwrap();
    let ds = Datastore::new(Config::traditional()).unwrap();
    let mut h = ds.open(tmp.path(), "spam", OpenMode::Write).unwrap();
    h.write("größe".as_bytes(), &CounterRecord::counts(1, 0)).unwrap();
    ds.close(h, true).unwrap();

    let options = DumpOptions {
        replace_non_ascii: true,
        ..DumpOptions::default()
    };
    let text = dump_string(&ds, tmp.path(), "spam", &options);
    assert!(text.contains("gr????e 1\n"));
}

#[test]
fn test_load_merges_counts_and_keeps_newest_date() {
    for config in configs() {
        let tmp = TempDir::new().unwrap();
        let ds = Datastore::new(Config {
            timestamps: true,
            ..config
        })
        .unwrap();
        let mut h = ds.open(tmp.path(), "good", OpenMode::Write).unwrap();
        ds.begin(&mut h).unwrap();
        h.write(b"meeting", &CounterRecord::new(0, 3, 20240301)).unwrap();
        ds.commit(&mut h).unwrap();

        let input = "meeting 2 20240101\nagenda 5 20240202\n\n\
                     .WORDLIST_VERSION 9\n.MSG_COUNT 4\nagenda 1\n";
        let stats = load_text(&ds, &mut h, input).unwrap();
        assert_eq!((stats.lines, stats.merged, stats.skipped), (6, 4, 1));

        let meeting = h.read(b"meeting").unwrap().unwrap();
        assert_eq!((meeting.good_count, meeting.last_seen), (5, 20240301));
        let agenda = h.read(b"agenda").unwrap().unwrap();
        assert_eq!((agenda.good_count, agenda.last_seen), (6, 20240202));
        let messages = h.get_metadata(MetaKey::MessageCount).unwrap();
        assert_eq!(messages.map(|r| r.good_count), Some(4));
        let version = h.get_metadata(MetaKey::WordlistVersion).unwrap();
        assert_eq!(version.map(|r| r.spam_count), Some(1));
        ds.close(h, true).unwrap();
    }
}

#[test]
fn test_dump_then_load_into_fresh_store() {
    for config in configs() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let ds = Datastore::new(config).unwrap();

        let mut h = ds.open(src.path(), "spam", OpenMode::Write).unwrap();
        ds.begin(&mut h).unwrap();
        for i in 0..2500u32 {
            let token = format!("tok{i:05}");
            h.write(token.as_bytes(), &CounterRecord::new(i + 1, 0, 20240101)).unwrap();
        }
        ds.commit(&mut h).unwrap();
        ds.close(h, true).unwrap();

        let text = dump_string(&ds, src.path(), "spam", &DumpOptions::default());
        let mut h = ds.open(dst.path(), "spam", OpenMode::Write).unwrap();
        let stats = load_text(&ds, &mut h, &text).unwrap();
        assert_eq!(stats.merged, 2500);
        ds.close(h, true).unwrap();

        assert_eq!(dump_string(&ds, dst.path(), "spam", &DumpOptions::default()), text);
    }
}

#[test]
fn test_load_parse_error_reports_line() {
    let tmp = TempDir::new().unwrap();
    let ds = Datastore::new(Config::transactional()).unwrap();
    let mut h = ds.open(tmp.path(), "spam", OpenMode::Write).unwrap();
    let err = load_text(&ds, &mut h, "ok 1\nbroken\n").unwrap_err();
    assert!(matches!(err, ToolError::Parse { line: 2, .. }));
    assert_eq!(h.read(b"ok").unwrap(), None);
    ds.close(h, false).unwrap();
}

#[test]
fn test_load_skips_overlong_tokens() {
    let tmp = TempDir::new().unwrap();
    let ds = Datastore::new(Config {
        max_token_len: 8,
        ..Config::traditional()
    })
    .unwrap();
    let mut h = ds.open(tmp.path(), "spam", OpenMode::Write).unwrap();
    let stats = load_text(&ds, &mut h, "short 1\nmuch-too-long 1\n").unwrap();
    assert_eq!((stats.merged, stats.skipped), (1, 1));
    ds.close(h, true).unwrap();
}

// ---------------------------------------------------------------------------
// Prune
// ---------------------------------------------------------------------------

#[test]
fn test_prune_by_thresholds() {
    for config in configs() {
        let tmp = TempDir::new().unwrap();
        let ds = Datastore::new(config).unwrap();
        let mut h = ds.open(tmp.path(), "spam", OpenMode::Write).unwrap();
        ds.begin(&mut h).unwrap();
        h.write(b"rare", &CounterRecord::new(1, 0, 20240601)).unwrap();
        h.write(b"stale", &CounterRecord::new(9, 0, 20200101)).unwrap();
        h.write(b"keeper", &CounterRecord::new(9, 0, 20240601)).unwrap();
        h.write(b"undated", &CounterRecord::counts(9, 0)).unwrap();
        h.set_metadata(MetaKey::MessageCount, &CounterRecord::counts(1, 0)).unwrap();
        ds.commit(&mut h).unwrap();

        let thresholds = PruneThresholds {
            min_count: 2,
            min_date: 20230101,
            max_token_len: 0,
        };
        assert_eq!(prune(&ds, &mut h, &thresholds).unwrap(), 2);
        assert_eq!(h.read(b"rare").unwrap(), None);
        assert_eq!(h.read(b"stale").unwrap(), None);
        assert!(h.read(b"keeper").unwrap().is_some());
        assert!(h.read(b"undated").unwrap().is_some());
        assert!(h.get_metadata(MetaKey::MessageCount).unwrap().is_some());
        ds.close(h, true).unwrap();
    }
}

#[test]
fn test_prune_tokens_over_a_lowered_limit() {
    for config in configs() {
        let tmp = TempDir::new().unwrap();
        let ds = Datastore::new(Config {
            max_token_len: 30,
            ..config.clone()
        })
        .unwrap();
        let mut h = ds.open(tmp.path(), "spam", OpenMode::Write).unwrap();
        ds.begin(&mut h).unwrap();
        h.write(b"twelve-bytes", &CounterRecord::counts(3, 0)).unwrap();
        h.write(b"short", &CounterRecord::counts(3, 0)).unwrap();
        ds.commit(&mut h).unwrap();
        ds.close(h, true).unwrap();

        let ds = Datastore::new(Config {
            max_token_len: 8,
            ..config
        })
        .unwrap();
        let mut h = ds.open(tmp.path(), "spam", OpenMode::Write).unwrap();
        let thresholds = PruneThresholds {
            max_token_len: 8,
            ..PruneThresholds::default()
        };
        assert_eq!(prune(&ds, &mut h, &thresholds).unwrap(), 1);
        assert_eq!(h.len().unwrap(), 2);
        ds.close(h, true).unwrap();
    }
}

// ---------------------------------------------------------------------------
// Maintenance
// ---------------------------------------------------------------------------

#[test]
fn test_verify_clean_store() {
    for config in configs() {
        let tmp = TempDir::new().unwrap();
        let ds = Datastore::new(config.clone()).unwrap();
        let mut h = ds.open(tmp.path(), "spam", OpenMode::Write).unwrap();
        ds.begin(&mut h).unwrap();
        h.write(b"cash", &CounterRecord::counts(1, 0)).unwrap();
        ds.commit(&mut h).unwrap();
        ds.close(h, true).unwrap();

        let report = verify(tmp.path(), &config).unwrap();
        assert!(report.is_clean(), "{:?}", report.problems);
        assert_eq!(report.lists.len(), 1);
        assert_eq!(report.lists[0].version, Some(1));
        assert_eq!(report.zombies, 0);
    }
}

#[test]
fn test_verify_reports_damage() {
    let tmp = TempDir::new().unwrap();
    let config = Config::traditional();
    let ds = Datastore::new(config.clone()).unwrap();
    let mut h = ds.open(tmp.path(), "spam", OpenMode::Write).unwrap();
    for i in 0..50u32 {
        h.write(format!("tok{i}").as_bytes(), &CounterRecord::counts(i, 0)).unwrap();
    }
    ds.close(h, true).unwrap();

    let path = tmp.path().join("spam.db");
    let mut bytes = std::fs::read(&path).unwrap();
    let mid = bytes.len() / 2;
    for b in &mut bytes[mid..mid + 8] {
        *b ^= 0xFF;
    }
    std::fs::write(&path, bytes).unwrap();

    let report = verify(tmp.path(), &config).unwrap();
    assert!(!report.is_clean());
    assert!(report.lists.is_empty());
}

#[test]
fn test_verify_missing_directory() {
    let tmp = TempDir::new().unwrap();
    let err = verify(&tmp.path().join("absent"), &Config::default()).unwrap_err();
    assert!(matches!(err, ToolError::Store(StoreError::NotFound { .. })));
}

#[test]
fn test_recover_and_purge() {
    let tmp = TempDir::new().unwrap();
    let config = Config {
        log_segment_bytes: 64 * 1024,
        ..Config::transactional()
    };
    let ds = Datastore::new(config.clone()).unwrap();
    let mut h = ds.open(tmp.path(), "spam", OpenMode::Write).unwrap();
    for i in 0..200u32 {
        ds.begin(&mut h).unwrap();
        h.write(format!("token-{i:04}").as_bytes(), &CounterRecord::counts(i, 0)).unwrap();
        ds.commit(&mut h).unwrap();
    }
    ds.close(h, true).unwrap();
    drop(ds);

    let report = recover(tmp.path(), &config, false).unwrap();
    assert_eq!(report.zombies_cleared, 0);
    purge_logs(tmp.path(), &config).unwrap();

    let ds = Datastore::new(config.clone()).unwrap();
    let h = ds.open(tmp.path(), "spam", OpenMode::Read).unwrap();
    assert_eq!(h.read(b"token-0199").unwrap().map(|r| r.spam_count), Some(199));
    ds.close(h, false).unwrap();
    assert!(verify(tmp.path(), &config).unwrap().is_clean());
}

// ---------------------------------------------------------------------------
// Word lists
// ---------------------------------------------------------------------------

#[test]
fn test_register_and_lookup_split_lists() {
    for config in configs() {
        let tmp = TempDir::new().unwrap();
        let specs = [
            ListSpec::new(tmp.path(), "spam", ListKind::Spam, 1),
            ListSpec::new(tmp.path(), "good", ListKind::Good, 1),
        ];
        let mut lists = open_lists(config, &specs);

        lists.register(&["cash", "cash", "prize"], true).unwrap();
        lists.register(&["cash", "meeting"], false).unwrap();
        lists.register(&["lottery"], true).unwrap();

        assert_eq!(lists.lookup(b"cash").unwrap(), (1, 1));
        assert_eq!(lists.lookup(b"prize").unwrap(), (1, 0));
        assert_eq!(lists.lookup(b"meeting").unwrap(), (0, 1));
        assert_eq!(lists.lookup(b"absent").unwrap(), (0, 0));
        assert_eq!(lists.message_counts().unwrap(), (2, 1));

        lists.unregister(&["cash", "prize"], true).unwrap();
        assert_eq!(lists.lookup(b"cash").unwrap(), (0, 1));
        assert_eq!(lists.lookup(b"prize").unwrap(), (0, 0));
        assert_eq!(lists.message_counts().unwrap(), (1, 1));
        lists.close(true).unwrap();
    }
}

#[test]
fn test_lookup_stops_at_first_level_holding_token() {
    let tmp = TempDir::new().unwrap();
    let ds = Datastore::new(Config::traditional()).unwrap();
    let mut system = ds.open(tmp.path(), "system", OpenMode::Write).unwrap();
    system.write(b"cash", &CounterRecord::counts(50, 50)).unwrap();
    system.write(b"invoice", &CounterRecord::counts(0, 40)).unwrap();
    ds.close(system, true).unwrap();
    drop(ds);

    let specs = [
        ListSpec::new(tmp.path(), "system", ListKind::Combined, 2).read_only(),
        ListSpec::new(tmp.path(), "user", ListKind::Combined, 1),
    ];
    let mut lists = open_lists(Config::traditional(), &specs);
    lists.register(&["cash"], true).unwrap();

    assert_eq!(lists.lookup(b"cash").unwrap(), (1, 0));
    assert_eq!(lists.lookup(b"invoice").unwrap(), (0, 40));
    lists.close(true).unwrap();
}

#[test]
fn test_unregister_never_goes_negative() {
    let tmp = TempDir::new().unwrap();
    let specs = [ListSpec::new(tmp.path(), "wordlist", ListKind::Combined, 1)];
    let mut lists = open_lists(Config::transactional(), &specs);
    lists.register(&["cash"], false).unwrap();
    lists.unregister(&["cash", "never-seen"], true).unwrap();

    assert_eq!(lists.lookup(b"cash").unwrap(), (0, 1));
    assert_eq!(lists.lookup(b"never-seen").unwrap(), (0, 0));
    assert_eq!(lists.message_counts().unwrap(), (0, 1));
    lists.close(true).unwrap();
}

#[test]
fn test_no_writable_list() {
    let tmp = TempDir::new().unwrap();
    let ds = Datastore::new(Config::traditional()).unwrap();
    ds.close(ds.open(tmp.path(), "spam", OpenMode::Write).unwrap(), true).unwrap();
    drop(ds);

    let specs = [ListSpec::new(tmp.path(), "spam", ListKind::Spam, 1).read_only()];
    let mut lists = open_lists(Config::traditional(), &specs);
    assert!(matches!(lists.register(&["cash"], true), Err(ToolError::InvalidLists(_))));
    lists.close(false).unwrap();
}

#[test]
fn test_failed_open_releases_earlier_lists() {
    let tmp = TempDir::new().unwrap();
    let specs = [
        ListSpec::new(tmp.path(), "user", ListKind::Combined, 1),
        ListSpec::new(tmp.path(), "system", ListKind::Combined, 2).read_only(),
    ];
    let result = WordLists::open(Datastore::new(Config::traditional()).unwrap(), &specs);
    assert!(matches!(result, Err(ToolError::Store(StoreError::NotFound { .. }))));

    // the writable list opened first was closed again, file lock included
    let config = Config {
        lock_retries: 5,
        ..Config::traditional()
    };
    let mut lists = open_lists(config, &specs[..1]);
    lists.register(&["cash"], true).unwrap();
    lists.close(true).unwrap();
}

#[test]
fn test_registrations_from_two_datastores_accumulate() {
    let tmp = TempDir::new().unwrap();
    let config = Config {
        lock_retries: 100_000,
        ..Config::transactional()
    };
    let specs = [ListSpec::new(tmp.path(), "wordlist", ListKind::Combined, 1)];
    let mut first = open_lists(config.clone(), &specs);
    let mut second = open_lists(config.clone(), &specs);

    first.register(&["cash"], true).unwrap();
    second.register(&["cash", "prize"], true).unwrap();
    first.close(true).unwrap();
    second.close(true).unwrap();

    let lists = open_lists(config, &specs);
    assert_eq!(lists.lookup(b"cash").unwrap(), (2, 0));
    assert_eq!(lists.lookup(b"prize").unwrap(), (1, 0));
    assert_eq!(lists.message_counts().unwrap(), (2, 0));
    lists.close(false).unwrap();
}

#[test]
fn test_writable_level_across_directories_is_refused() {
    let spam_dir = TempDir::new().unwrap();
    let good_dir = TempDir::new().unwrap();
    let specs = [
        ListSpec::new(spam_dir.path(), "spam", ListKind::Spam, 1),
        ListSpec::new(good_dir.path(), "good", ListKind::Good, 1),
    ];
    let result = WordLists::open(Datastore::new(Config::transactional()).unwrap(), &specs);
    assert!(matches!(result, Err(ToolError::InvalidLists(_))));

    // one of them read-only is fine
    let specs = [specs[0].clone(), specs[1].clone().read_only()];
    let ds = Datastore::new(Config::transactional()).unwrap();
    ds.close(ds.open(good_dir.path(), "good", OpenMode::Write).unwrap(), true).unwrap();
    let lists = WordLists::open(ds, &specs).unwrap();
    lists.close(false).unwrap();
}
