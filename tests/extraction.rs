//! Bulk extraction: outcomes, aliasing, volumes, sinks and cancellation.

mod common;

use std::fs;
use std::io::Cursor;

use arkiv::progress::ProgressReporter;
use arkiv::{
    Archive, CancellationToken, DirectoryVolumes, Error, ExtractMode, ExtractOptions,
    FilesystemSink, ItemOutcome, MemorySink, MemoryVolumes, NullSink, OpenOptions, Selection,
    StatisticsProgress, WithCancellation,
};
use common::*;

#[test]
fn test_one_corrupt_item_does_not_stop_the_batch() {
    let mut files: Vec<RarFile> = (0..6)
        .map(|i| RarFile::stored(&format!("item{i}.txt"), format!("body {i}").as_bytes()))
        .collect();
    files[3].crc = Some(0xDEAD_BEEF);
    let mut archive = open(rar5(&files));

    let mut sink = MemorySink::new();
    let report = archive
        .extract(Selection::All, ExtractOptions::new(), &mut sink)
        .unwrap();
    assert_eq!(report.outcomes.len(), 6);
    assert_eq!(report.count(ItemOutcome::Ok), 5);
    assert_eq!(report.outcome(3), Some(ItemOutcome::CrcError));
    assert_eq!(report.failures().collect::<Vec<_>>(), [(3, ItemOutcome::CrcError)]);
    assert_eq!(sink.get("item5.txt"), Some(&b"body 5"[..]));
    assert_eq!(sink.get("item3.txt"), None);

    let relaxed = archive
        .test(Selection::Indices(vec![3]), ExtractOptions::new().verify_crc(false))
        .unwrap();
    assert!(relaxed.is_ok());
}

#[test]
fn test_short_folder_is_data_error_for_its_item_only() {
    let cab = Cabinet {
        folders: vec![
            vec![(b"one".to_vec(), 3)],
            vec![(b"two".to_vec(), 3)],
            vec![(b"three".to_vec(), 5)],
        ],
        files: vec![
            CabFile {
                name: "a",
                folder: 0,
                offset: 0,
                size: 3,
            },
            CabFile {
                name: "b",
                folder: 1,
                offset: 0,
                size: 10,
            },
            CabFile {
                name: "c",
                folder: 2,
                offset: 0,
                size: 5,
            },
        ],
        ..Cabinet::single(Vec::new(), Vec::new())
    };
    let mut archive = open(cab.build());
    let mut sink = MemorySink::new();
    let report = archive
        .extract(Selection::All, ExtractOptions::new(), &mut sink)
        .unwrap();
    assert_eq!(report.count(ItemOutcome::Ok), 2);
    assert_eq!(report.outcome(1), Some(ItemOutcome::DataError));
    assert_eq!(sink.get("c"), Some(&b"three"[..]));
}

#[test]
fn test_cab_aliases_decode_once_and_replay() {
    let cab = Cabinet::single(
        vec![(b"shared-bytes|tail".to_vec(), 17)],
        vec![
            CabFile {
                name: "first.txt",
                folder: 0,
                offset: 0,
                size: 12,
            },
            CabFile {
                name: "copy.txt",
                folder: 0,
                offset: 0,
                size: 12,
            },
            CabFile {
                name: "tail.txt",
                folder: 0,
                offset: 13,
                size: 4,
            },
            CabFile {
                name: "again.txt",
                folder: 0,
                offset: 0,
                size: 12,
            },
        ],
    );
    let mut archive = open(cab.build());
    assert_eq!(archive.len(), 4);
    assert!(archive.info().solid);

    let mut sink = MemorySink::new();
    let report = archive
        .extract(Selection::All, ExtractOptions::new(), &mut sink)
        .unwrap();
    assert!(report.is_ok(), "{report:?}");
    for name in ["first.txt", "copy.txt", "again.txt"] {
        assert_eq!(sink.get(name), Some(&b"shared-bytes"[..]), "{name}");
    }
    assert_eq!(sink.get("tail.txt"), Some(&b"tail"[..]));

    // Reverse order forces the cursor to restart for earlier offsets.
    let mut reverse = MemorySink::new();
    let report = archive
        .extract(Selection::Indices(vec![3, 2, 1, 0]), ExtractOptions::new(), &mut reverse)
        .unwrap();
    assert!(report.is_ok());
    assert_eq!(reverse.len(), 4);
}

#[test]
fn test_cab_folder_checksum_failure_is_crc_error() {
    let mut data = Cabinet::single(
        vec![(b"abcdefgh".to_vec(), 8)],
        vec![CabFile {
            name: "x",
            folder: 0,
            offset: 0,
            size: 8,
        }],
    )
    .build();
    let last = data.len() - 1;
    data[last] ^= 0x20;
    let mut archive = open(data);
    let report = archive.test(Selection::All, ExtractOptions::new()).unwrap();
    assert_eq!(report.outcome(0), Some(ItemOutcome::CrcError));
}

fn cabinet_set() -> (Vec<u8>, Vec<u8>) {
    let first = Cabinet {
        set_id: 7,
        number: 0,
        prev: None,
        next: Some("disk2.cab"),
        folders: vec![vec![(b"hello ".to_vec(), 6)]],
        files: vec![
            CabFile {
                name: "greeting.txt",
                folder: CONTINUED_TO_NEXT,
                offset: 0,
                size: 12,
            },
        ],
    };
    let second = Cabinet {
        set_id: 7,
        number: 1,
        prev: Some("disk1.cab"),
        next: None,
        folders: vec![vec![(b"world!".to_vec(), 6)], vec![(b"own".to_vec(), 3)]],
        files: vec![
            CabFile {
                name: "greeting.txt",
                folder: CONTINUED_FROM_PREV,
                offset: 0,
                size: 12,
            },
            CabFile {
                name: "own.txt",
                folder: 1,
                offset: 0,
                size: 3,
            },
        ],
    };
    (first.build(), second.build())
}

#[test]
fn test_cab_folder_spanning_two_cabinets() {
    let (first, second) = cabinet_set();
    let options = OpenOptions::new().volumes(MemoryVolumes::new().with("disk2.cab", second));
    let mut archive = Archive::open(Cursor::new(first), options).unwrap();
    assert_eq!(archive.info().volumes, 2);
    assert_eq!(archive.len(), 2);

    let mut sink = MemorySink::new();
    let report = archive
        .extract(Selection::All, ExtractOptions::new(), &mut sink)
        .unwrap();
    assert!(report.is_ok(), "{report:?}");
    assert_eq!(sink.get("greeting.txt"), Some(&b"hello world!"[..]));
    assert_eq!(sink.get("own.txt"), Some(&b"own"[..]));
}

#[test]
fn test_cab_missing_second_cabinet() {
    let (first, _) = cabinet_set();
    let mut archive = open(first);
    assert_eq!(archive.info().volumes, 1);
    assert!(!archive.warnings().is_empty());

    let mut stats = StatisticsProgress::new();
    let report = archive
        .test(Selection::All, ExtractOptions::new().progress(&mut stats))
        .unwrap();
    assert_eq!(report.outcomes.len(), 1);
    assert!(!report.is_ok());
    assert_eq!(stats.warnings, archive.warnings());
}

#[test]
fn test_open_path_finds_sibling_cabinets() {
    let dir = tempfile::tempdir().unwrap();
    let (first, second) = cabinet_set();
    fs::write(dir.path().join("disk1.cab"), first).unwrap();
    fs::write(dir.path().join("disk2.cab"), second).unwrap();

    let mut archive = Archive::open_path(dir.path().join("disk1.cab"), OpenOptions::new()).unwrap();
    assert_eq!(archive.info().volumes, 2);
    let mut out = String::new();
    std::io::Read::read_to_string(&mut archive.get_stream(0).unwrap(), &mut out).unwrap();
    assert_eq!(out, "hello world!");

    let explicit = OpenOptions::new().volumes(DirectoryVolumes::new(dir.path()));
    let data = fs::read(dir.path().join("disk1.cab")).unwrap();
    let archive = Archive::open(Cursor::new(data), explicit).unwrap();
    assert_eq!(archive.info().volumes, 2);
}

#[test]
fn test_rar5_split_item_across_volumes() {
    let content = b"first half|second half";
    let mut head = RarFile::stored("split.bin", &content[..11]);
    head.size = Some(content.len() as u64);
    head.split_after = true;
    let mut tail = RarFile::stored("split.bin", &content[11..]);
    tail.size = Some(content.len() as u64);
    tail.crc = Some(crc32fast::hash(content));
    tail.split_before = true;

    let first = rar5_volume(0, &[head], true);
    let second = rar5_volume(1, &[tail], false);
    let options = OpenOptions::new()
        .name("set.part1.rar")
        .volumes(MemoryVolumes::new().with("set.part2.rar", second));
    let mut archive = Archive::open(Cursor::new(first), options).unwrap();
    assert_eq!(archive.len(), 1);
    assert_eq!(archive.info().volumes, 2);

    let mut sink = MemorySink::new();
    let report = archive
        .extract(Selection::All, ExtractOptions::new(), &mut sink)
        .unwrap();
    assert!(report.is_ok(), "{report:?}");
    assert_eq!(sink.get("split.bin"), Some(&content[..]));
}

#[test]
fn test_filesystem_sink_round_trip() {
    let mut data = Vec::new();
    tar_entry(&mut data, "top/", b'5', b"", "");
    tar_entry(&mut data, "top/a.txt", b'0', b"alpha", "");
    tar_entry(&mut data, "top/nested/b.txt", b'0', b"bravo", "");
    tar_entry(&mut data, "top/hard", b'1', b"", "top/a.txt");
    data.resize(data.len() + 1024, 0);
    let mut archive = open(data);

    let dir = tempfile::tempdir().unwrap();
    let mut sink = FilesystemSink::new(dir.path()).unwrap();
    let report = archive
        .extract(Selection::All, ExtractOptions::new(), &mut sink)
        .unwrap();
    assert!(report.is_ok(), "{report:?}");
    assert_eq!(fs::read(dir.path().join("top/a.txt")).unwrap(), b"alpha");
    assert_eq!(fs::read(dir.path().join("top/nested/b.txt")).unwrap(), b"bravo");
    assert_eq!(fs::read(dir.path().join("top/hard")).unwrap(), b"alpha");
}

#[test]
fn test_filesystem_sink_traversal_ends_the_batch() {
    let data = tar(&[("ok.txt", b"fine"), ("../escape.txt", b"nope")]);
    let mut archive = open(data);
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("out");
    let mut sink = FilesystemSink::new(&root).unwrap();
    let err = archive
        .extract(Selection::All, ExtractOptions::new(), &mut sink)
        .unwrap_err();
    assert!(matches!(err, Error::PathTraversal { item_index: 1, .. }), "{err:?}");
    assert!(root.join("ok.txt").exists());
    assert!(!dir.path().join("escape.txt").exists());
}

#[test]
fn test_filesystem_sink_removes_failed_items() {
    let mut files = vec![RarFile::stored("good.txt", b"good"), RarFile::stored("bad.txt", b"bad")];
    files[1].crc = Some(0);
    let mut archive = open(rar5(&files));
    let dir = tempfile::tempdir().unwrap();
    let mut sink = FilesystemSink::new(dir.path()).unwrap();
    let report = archive
        .extract(Selection::All, ExtractOptions::new(), &mut sink)
        .unwrap();
    assert_eq!(report.outcome(1), Some(ItemOutcome::CrcError));
    assert!(dir.path().join("good.txt").exists());
    assert!(!dir.path().join("bad.txt").exists());
}

#[test]
fn test_test_mode_never_asks_for_writers() {
    struct Refuses;
    impl arkiv::ExtractSink for Refuses {
        fn writer(
            &mut self,
            _item: &arkiv::Item,
            _index: usize,
        ) -> arkiv::Result<Option<Box<dyn std::io::Write + '_>>> {
            panic!("test mode requested a writer");
        }
        fn finish(&mut self, _: &arkiv::Item, _: usize, _: ItemOutcome) -> arkiv::Result<()> {
            panic!("test mode finished an item");
        }
    }

    let mut archive = open(tar(&[("a", b"1"), ("b", b"22")]));
    let options = ExtractOptions::new().mode(ExtractMode::Test);
    let report = archive.extract(Selection::All, options, &mut Refuses).unwrap();
    assert!(report.is_ok());
    assert_eq!(report.bytes, 3);
}

/// Cancels through a shared token once the first item completes.
struct CancelAfterFirst {
    token: CancellationToken,
    completed: usize,
}

impl ProgressReporter for CancelAfterFirst {
    fn on_item_complete(&mut self, _name: &str, _outcome: ItemOutcome) {
        self.completed += 1;
        self.token.cancel();
    }

    fn should_cancel(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[test]
fn test_cancellation_between_items() {
    let mut archive = open(tar(&[("a", b"1"), ("b", b"2"), ("c", b"3")]));
    let mut reporter = CancelAfterFirst {
        token: CancellationToken::new(),
        completed: 0,
    };
    let mut sink = NullSink::new();
    let err = archive
        .extract(Selection::All, ExtractOptions::new().progress(&mut reporter), &mut sink)
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(reporter.completed, 1);
    assert_eq!(sink.items(), 1);
}

#[test]
fn test_cancellation_inside_large_item() {
    let big = vec![0x42u8; 1 << 20];
    let mut archive = open(tar(&[("big.bin", &big)]));
    let token = CancellationToken::new();
    let progress = WithCancellation::new(Cancelling(token.clone()), token);
    let err = archive
        .test(Selection::All, ExtractOptions::new().progress(progress))
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));

    /// Cancels on the first byte-level progress report.
    struct Cancelling(CancellationToken);
    impl ProgressReporter for Cancelling {
        fn on_progress(&mut self, done: u64, _total: u64) -> bool {
            if done > 0 {
                self.0.cancel();
            }
            true
        }
    }
}

#[test]
fn test_progress_totals_follow_selection() {
    let mut archive = open(tar(&[("a", b"123"), ("b", b"4567")]));
    let mut stats = StatisticsProgress::new();
    archive
        .test(Selection::Indices(vec![1]), ExtractOptions::new().progress(&mut stats))
        .unwrap();
    assert_eq!(stats.state.total_bytes, 4);
    assert_eq!(stats.state.items_total, 1);
    assert_eq!(stats.state.processed_bytes, 4);
    assert_eq!(stats.outcomes, [("b".to_string(), ItemOutcome::Ok)]);
}
