use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use twinpane_core::{EngineConfig, EngineError, ErrorKind, FileItem};
use twinpane_ops::{
    BatchSummary, ChannelSink, Conflict, ConflictAnswer, ConflictResolver, Decision,
    FileOperationsManager, ItemState, OperationEvent, OperationItem, OperationKind,
    OperationProgress, ProgressSink, SizingProgress,
};

fn manager() -> FileOperationsManager {
    FileOperationsManager::new(
        EngineConfig::builder()
            .concurrency(2usize)
            .chunk_size(4096usize)
            .progress_interval_bytes(4096u64)
            .build()
            .unwrap(),
    )
}

fn quiet() -> Arc<dyn ProgressSink> {
    Arc::new(())
}

fn snap(path: impl AsRef<Path>) -> FileItem {
    FileItem::from_path(path).unwrap()
}

fn write(path: impl AsRef<Path>, contents: &[u8]) {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
}

fn find<'a>(items: &'a [OperationItem], source: &Path) -> &'a OperationItem {
    items
        .iter()
        .find(|i| i.source() == source)
        .unwrap_or_else(|| panic!("no item for {}", source.display()))
}

fn assert_all_terminal(items: &[OperationItem]) {
    for item in items {
        assert!(item.is_terminal(), "{} is {}", item.source().display(), item.state());
    }
}

#[tokio::test]
async fn test_copy_overwrites_existing_file() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("src").join("a.txt");
    let dst = temp.path().join("dst");
    write(&src, b"0123456789");
    write(dst.join("a.txt"), b"01234");

    let items = manager()
        .copy_items(&[snap(&src)], &dst, ConflictResolver::Overwrite, quiet(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(items.len(), 1);
    assert_eq!(items[0].state(), ItemState::Completed);
    assert_eq!(items[0].conflict_decision(), Some(&Decision::Overwrite));
    assert_eq!(items[0].bytes_transferred(), 10);
    assert_eq!(fs::metadata(dst.join("a.txt")).unwrap().len(), 10);
}

#[tokio::test]
async fn test_copy_directory_into_missing_destination() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("src");
    write(src.join("x.txt"), b"hello");
    let dest = temp.path().join("dest");

    let items = manager()
        .copy_items(&[snap(&src)], &dest, ConflictResolver::Skip, quiet(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(items.len(), 2);
    assert_eq!(items[0].kind(), OperationKind::CreateDirectory);
    assert_eq!(items[0].destination(), Some(dest.join("src").as_path()));
    assert_eq!(items[1].kind(), OperationKind::Copy);
    assert_eq!(items[1].destination(), Some(dest.join("src").join("x.txt").as_path()));
    assert!(items.iter().all(|i| i.state() == ItemState::Completed));

    // The directory was done before the file started
    assert!(items[0].finished_at().unwrap() <= items[1].started_at().unwrap());
    assert_eq!(fs::read(dest.join("src").join("x.txt")).unwrap(), b"hello");
}

#[tokio::test]
async fn test_copy_preserves_modification_time() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("old.txt");
    write(&src, b"data");
    let mtime = std::time::SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000_000);
    fs::File::options().write(true).open(&src).unwrap().set_modified(mtime).unwrap();

    let dst = temp.path().join("dst");
    manager()
        .copy_items(&[snap(&src)], &dst, ConflictResolver::Skip, quiet(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(fs::metadata(dst.join("old.txt")).unwrap().modified().unwrap(), mtime);
}

/// Cancels the batch as soon as any item starts.
struct CancelOnStart(CancellationToken);

impl ProgressSink for CancelOnStart {
    fn on_progress(&self, _item: &OperationItem, bytes_transferred: u64, _total_bytes: u64) {
        if bytes_transferred == 0 {
            self.0.cancel();
        }
    }
}

#[tokio::test]
async fn test_delete_cancelled_right_after_start() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("dir");
    write(dir.join("file.txt"), b"content");

    let cancel = CancellationToken::new();
    let sink = Arc::new(CancelOnStart(cancel.clone()));
    let items = manager()
        .delete_items(&[snap(&dir)], sink, cancel)
        .await
        .unwrap();

    assert_eq!(items.len(), 2);
    let file = find(&items, &dir.join("file.txt"));
    let folder = find(&items, &dir);
    assert_eq!(file.state(), ItemState::Cancelled);
    assert_eq!(folder.state(), ItemState::Cancelled);
    assert!(folder.started_at().is_none());
    assert!(items.iter().all(|i| i.error().is_none()));
    assert!(dir.join("file.txt").exists());
}

#[tokio::test]
async fn test_delete_removes_children_before_directory() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("root");
    write(root.join("a.txt"), b"a");
    write(root.join("sub").join("b.txt"), b"bb");
    write(root.join("sub").join("deeper").join("c.txt"), b"ccc");

    let items = manager()
        .delete_items(&[snap(&root)], quiet(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(items.len(), 6);
    assert!(items.iter().all(|i| i.state() == ItemState::Completed));
    assert!(!root.exists());

    let root_item = find(&items, &root);
    let sub_item = find(&items, &root.join("sub"));
    for item in &items {
        if item.source() != root {
            assert!(item.finished_at() <= root_item.started_at());
        }
        if item.source().starts_with(root.join("sub")) && item.source() != root.join("sub") {
            assert!(item.finished_at() <= sub_item.started_at());
        }
    }
    // Post-order: the root comes last
    assert_eq!(items.last().unwrap().source(), root.as_path());
}

#[tokio::test]
async fn test_move_within_volume() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("src");
    write(src.join("a.txt"), b"aaa");
    write(src.join("d").join("x.txt"), b"xx");
    let dst = temp.path().join("dst");
    fs::create_dir(&dst).unwrap();

    let items = manager()
        .move_items(
            &[snap(src.join("a.txt")), snap(src.join("d"))],
            &dst,
            ConflictResolver::Skip,
            quiet(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(items.len(), 3);
    assert!(items.iter().all(|i| i.state() == ItemState::Completed));
    assert!(items.iter().all(|i| i.kind() == OperationKind::Move));
    assert!(!src.join("a.txt").exists());
    assert!(!src.join("d").exists());
    assert_eq!(fs::read(dst.join("a.txt")).unwrap(), b"aaa");
    assert_eq!(fs::read(dst.join("d").join("x.txt")).unwrap(), b"xx");
    assert_eq!(find(&items, &src.join("d").join("x.txt")).bytes_transferred(), 2);
}

#[tokio::test]
async fn test_move_merges_and_keeps_skipped_sources() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("src").join("d");
    write(src.join("new.txt"), b"new");
    write(src.join("same.txt"), b"incoming");
    let dst = temp.path().join("dst");
    write(dst.join("d").join("same.txt"), b"existing");

    let items = manager()
        .move_items(&[snap(&src)], &dst, ConflictResolver::Merge, quiet(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(items.len(), 3);
    assert_eq!(find(&items, &src).conflict_decision(), Some(&Decision::MergeDirectories));
    assert_eq!(find(&items, &src.join("new.txt")).state(), ItemState::Completed);
    assert_eq!(find(&items, &src.join("same.txt")).state(), ItemState::Skipped);
    // The source directory still holds the skipped file, so it stays
    assert_eq!(find(&items, &src).state(), ItemState::Skipped);
    assert!(src.join("same.txt").exists());
    assert_eq!(fs::read(dst.join("d").join("same.txt")).unwrap(), b"existing");
    assert_eq!(fs::read(dst.join("d").join("new.txt")).unwrap(), b"new");
}

#[tokio::test]
async fn test_move_merge_removes_emptied_source() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("src").join("d");
    write(src.join("one.txt"), b"1");
    let dst = temp.path().join("dst");
    write(dst.join("d").join("other.txt"), b"2");

    let items = manager()
        .move_items(&[snap(&src)], &dst, ConflictResolver::Overwrite, quiet(), CancellationToken::new())
        .await
        .unwrap();

    assert!(items.iter().all(|i| i.state() == ItemState::Completed));
    assert!(!src.exists());
    assert!(dst.join("d").join("one.txt").exists());
    assert!(dst.join("d").join("other.txt").exists());
}

#[tokio::test]
async fn test_copy_merge_directories() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("src").join("d");
    write(src.join("x.txt"), b"new x");
    write(src.join("y.txt"), b"new y");
    let dst = temp.path().join("dst");
    write(dst.join("d").join("x.txt"), b"old x");
    write(dst.join("d").join("keep.txt"), b"keep");

    let items = manager()
        .copy_items(&[snap(&src)], &dst, ConflictResolver::Merge, quiet(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(items.len(), 3);
    assert_eq!(find(&items, &src).state(), ItemState::Completed);
    assert_eq!(find(&items, &src.join("x.txt")).state(), ItemState::Skipped);
    assert_eq!(find(&items, &src.join("y.txt")).state(), ItemState::Completed);
    assert_eq!(fs::read(dst.join("d").join("x.txt")).unwrap(), b"old x");
    assert_eq!(fs::read(dst.join("d").join("y.txt")).unwrap(), b"new y");
    assert_eq!(fs::read(dst.join("d").join("keep.txt")).unwrap(), b"keep");
}

#[tokio::test]
async fn test_type_mismatch_is_never_overwritten() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("src").join("a");
    write(&src, b"file");
    let dst = temp.path().join("dst");
    fs::create_dir_all(dst.join("a")).unwrap();

    let items = manager()
        .copy_items(&[snap(&src)], &dst, ConflictResolver::Overwrite, quiet(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(items[0].state(), ItemState::Failed);
    assert_eq!(items[0].error().map(|e| e.kind), Some(ErrorKind::TypeMismatch));
    assert!(dst.join("a").is_dir());

    let items = manager()
        .copy_items(&[snap(&src)], &dst, ConflictResolver::Rename, quiet(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(items[0].state(), ItemState::Completed);
    assert_eq!(items[0].destination(), Some(dst.join("a (1)").as_path()));
    assert_eq!(fs::read(dst.join("a (1)")).unwrap(), b"file");
}

#[tokio::test]
async fn test_copy_onto_itself_with_rename_duplicates() {
    let temp = TempDir::new().unwrap();
    let file = temp.path().join("report.pdf");
    write(&file, b"pdf");

    let items = manager()
        .copy_items(&[snap(&file)], temp.path(), ConflictResolver::Rename, quiet(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(items[0].state(), ItemState::Completed);
    assert!(temp.path().join("report (1).pdf").exists());

    let items = manager()
        .copy_items(&[snap(&file)], temp.path(), ConflictResolver::Overwrite, quiet(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(items[0].error().map(|e| e.kind), Some(ErrorKind::InvalidDestination));
    assert_eq!(fs::read(&file).unwrap(), b"pdf");
}

#[tokio::test]
async fn test_copy_directory_into_itself_fails() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("src");
    write(src.join("sub").join("f.txt"), b"f");

    let items = manager()
        .copy_items(&[snap(&src)], &src.join("sub"), ConflictResolver::Overwrite, quiet(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(items.len(), 3);
    assert!(items.iter().all(|i| i.state() == ItemState::Failed));
    assert_eq!(items[0].error().map(|e| e.kind), Some(ErrorKind::InvalidDestination));
    assert!(!src.join("sub").join("src").exists());
}

/// Signals when an item with the given file name reaches a terminal state.
struct NotifyTerminal {
    name: &'static str,
    tx: Mutex<mpsc::Sender<()>>,
}

impl ProgressSink for NotifyTerminal {
    fn on_item_terminal(&self, item: &OperationItem) {
        if item.source().file_name().is_some_and(|n| n == self.name) {
            let _ = self.tx.lock().unwrap().send(());
        }
    }
}

#[tokio::test]
async fn test_pending_decision_does_not_block_siblings() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("src");
    write(src.join("a.txt"), b"new a");
    write(src.join("b.txt"), b"new b");
    let dst = temp.path().join("dst");
    write(dst.join("a.txt"), b"old a");

    let (tx, rx) = mpsc::channel();
    let sink = Arc::new(NotifyTerminal {
        name: "b.txt",
        tx: Mutex::new(tx),
    });
    let rx = Mutex::new(rx);
    // Only answers once b.txt is done; times out to Skip otherwise
    let resolver = ConflictResolver::ask(move |_: &Conflict| {
        match rx.lock().unwrap().recv_timeout(Duration::from_secs(10)) {
            Ok(()) => ConflictAnswer::Once(Decision::Overwrite),
            Err(_) => ConflictAnswer::Once(Decision::Skip),
        }
    });

    let items = manager()
        .copy_items(
            &[snap(src.join("a.txt")), snap(src.join("b.txt"))],
            &dst,
            resolver,
            sink,
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(items[0].state(), ItemState::Completed);
    assert_eq!(items[0].conflict_decision(), Some(&Decision::Overwrite));
    assert_eq!(items[1].state(), ItemState::Completed);
    assert_eq!(fs::read(dst.join("a.txt")).unwrap(), b"new a");
}

#[tokio::test]
async fn test_answer_for_all_is_asked_once() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("src");
    let dst = temp.path().join("dst");
    let mut sources = Vec::new();
    for name in ["1.txt", "2.txt", "3.txt"] {
        write(src.join(name), b"new");
        write(dst.join(name), b"old");
        sources.push(snap(src.join(name)));
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let resolver = ConflictResolver::ask(move |_: &Conflict| {
        counter.fetch_add(1, Ordering::SeqCst);
        ConflictAnswer::ForAll(Decision::Overwrite)
    });

    let items = manager()
        .copy_items(&sources, &dst, resolver, quiet(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(items.iter().all(|i| i.state() == ItemState::Completed));
    assert!(items.iter().all(|i| i.conflict_decision() == Some(&Decision::Overwrite)));
    for name in ["1.txt", "2.txt", "3.txt"] {
        assert_eq!(fs::read(dst.join(name)).unwrap(), b"new");
    }
}

#[tokio::test]
async fn test_abort_cancels_batch() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("src");
    let dst = temp.path().join("dst");
    write(src.join("a.txt"), b"new");
    write(src.join("b.txt"), b"new");
    write(dst.join("a.txt"), b"old");
    write(dst.join("b.txt"), b"old");

    let resolver = ConflictResolver::ask(|_: &Conflict| ConflictAnswer::Abort);
    let items = manager()
        .copy_items(
            &[snap(src.join("a.txt")), snap(src.join("b.txt"))],
            &dst,
            resolver,
            quiet(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(items.iter().all(|i| i.state() == ItemState::Cancelled));
    assert_eq!(fs::read(dst.join("a.txt")).unwrap(), b"old");
    assert_eq!(fs::read(dst.join("b.txt")).unwrap(), b"old");
}

#[tokio::test]
async fn test_directory_conflict_is_asked_while_planning() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("src").join("d");
    write(src.join("f.txt"), b"f");
    let dst = temp.path().join("dst");
    fs::create_dir_all(dst.join("d")).unwrap();

    let resolver = ConflictResolver::ask(|conflict: &Conflict| {
        assert!(conflict.existing.is_dir());
        ConflictAnswer::Once(Decision::Rename("d-copy".into()))
    });
    let items = manager()
        .copy_items(&[snap(&src)], &dst, resolver, quiet(), CancellationToken::new())
        .await
        .unwrap();

    assert!(items.iter().all(|i| i.state() == ItemState::Completed));
    assert_eq!(fs::read(dst.join("d-copy").join("f.txt")).unwrap(), b"f");
}

#[tokio::test]
async fn test_vanished_source_fails_alone() {
    let temp = TempDir::new().unwrap();
    let gone = temp.path().join("gone.txt");
    let kept = temp.path().join("kept.txt");
    write(&gone, b"x");
    write(&kept, b"y");
    let selection = [snap(&gone), snap(&kept)];
    fs::remove_file(&gone).unwrap();

    let dst = temp.path().join("dst");
    let items = manager()
        .copy_items(&selection, &dst, ConflictResolver::Skip, quiet(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(items.len(), 2);
    assert_eq!(items[0].state(), ItemState::Failed);
    assert_eq!(items[0].error().map(|e| e.kind), Some(ErrorKind::NotFound));
    assert_eq!(items[1].state(), ItemState::Completed);
}

/// Appends to a file once sizing is done, so the copy sees a different size.
struct GrowAfterSizing(PathBuf);

impl ProgressSink for GrowAfterSizing {
    fn on_sizing(&self, progress: &SizingProgress) {
        if progress.finished {
            let mut file = fs::OpenOptions::new().append(true).open(&self.0).unwrap();
            file.write_all(b"extra").unwrap();
        }
    }
}

#[tokio::test]
async fn test_size_change_is_integrity_failure() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("grow.txt");
    write(&src, b"12345");
    let dst = temp.path().join("dst");

    let items = manager()
        .copy_items(
            &[snap(&src)],
            &dst,
            ConflictResolver::Skip,
            Arc::new(GrowAfterSizing(src.clone())),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(items[0].state(), ItemState::Failed);
    assert_eq!(items[0].error().map(|e| e.kind), Some(ErrorKind::IntegrityMismatch));
    assert!(!dst.join("grow.txt").exists());
}

/// Cancels once the first bytes of a transfer are reported.
struct CancelAfterBytes(CancellationToken);

impl ProgressSink for CancelAfterBytes {
    fn on_progress(&self, _item: &OperationItem, bytes_transferred: u64, _total_bytes: u64) {
        if bytes_transferred > 0 {
            self.0.cancel();
        }
    }
}

#[tokio::test]
async fn test_cancel_mid_copy_leaves_no_partial_file() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("big.bin");
    write(&src, &vec![42u8; 1024 * 1024]);
    let dst = temp.path().join("dst");

    let cancel = CancellationToken::new();
    let items = manager()
        .copy_items(
            &[snap(&src)],
            &dst,
            ConflictResolver::Skip,
            Arc::new(CancelAfterBytes(cancel.clone())),
            cancel,
        )
        .await
        .unwrap();

    assert_eq!(items[0].state(), ItemState::Cancelled);
    assert!(items[0].error().is_none());
    assert!(items[0].bytes_transferred() > 0);
    assert!(items[0].bytes_transferred() < 1024 * 1024);
    assert_eq!(fs::read_dir(&dst).unwrap().count(), 0);
}

#[tokio::test]
async fn test_copy_file_with_maximum_length_name() {
    let temp = TempDir::new().unwrap();
    let name = format!("{}.txt", "n".repeat(245));
    let src = temp.path().join("src").join(&name);
    write(&src, b"payload");
    let dst = temp.path().join("dst");

    let items = manager()
        .copy_items(&[snap(&src)], &dst, ConflictResolver::Skip, quiet(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(items[0].state(), ItemState::Completed, "{:?}", items[0].error());
    assert_eq!(fs::read(dst.join(&name)).unwrap(), b"payload");
    assert_eq!(fs::read_dir(&dst).unwrap().count(), 1);
}

#[tokio::test]
async fn test_copy_keeps_user_file_named_like_a_partial() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("src").join("a.txt");
    write(&src, b"fresh");
    let dst = temp.path().join("dst");
    let lookalike = dst.join(".a.txt.twinpane-partial");
    write(&lookalike, b"user data");

    let items = manager()
        .copy_items(&[snap(&src)], &dst, ConflictResolver::Skip, quiet(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(items[0].state(), ItemState::Completed);
    assert_eq!(fs::read(dst.join("a.txt")).unwrap(), b"fresh");
    assert_eq!(fs::read(&lookalike).unwrap(), b"user data");
}

#[tokio::test]
async fn test_channel_sink_reports_batch() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("src");
    write(src.join("a.txt"), b"aaaa");
    write(src.join("b.txt"), b"bb");
    let dst = temp.path().join("dst");

    let (sink, mut rx) = ChannelSink::new();
    let items = manager()
        .copy_items(
            &[snap(src.join("a.txt")), snap(src.join("b.txt"))],
            &dst,
            ConflictResolver::Skip,
            Arc::new(sink),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_all_terminal(&items);

    let mut terminals = 0;
    let mut sizing_done = false;
    let mut last_batch = None;
    while let Ok(event) = rx.try_recv() {
        match event {
            OperationEvent::Terminal(_) => terminals += 1,
            OperationEvent::Sizing(progress) => sizing_done |= progress.finished,
            // Workers report outside the batch lock, so snapshots may interleave
            OperationEvent::Batch(progress) => {
                if last_batch
                    .as_ref()
                    .is_none_or(|b: &OperationProgress| progress.items_completed >= b.items_completed)
                {
                    last_batch = Some(progress);
                }
            }
            OperationEvent::Progress { .. } => {}
        }
    }

    assert_eq!(terminals, 2);
    assert!(sizing_done);
    let last = last_batch.unwrap();
    assert_eq!(last.items_completed, 2);
    assert_eq!(last.bytes_total, 6);
    assert_eq!(last.bytes_processed, 6);
    assert_eq!(last.percentage(), 100.0);

    let summary = BatchSummary::from_items(OperationKind::Copy, &items);
    assert!(summary.is_success());
    assert_eq!(summary.summary(), "Copied 2 items");
}

#[tokio::test]
async fn test_duplicate_and_nested_selection_collapses() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("dir");
    write(dir.join("f.txt"), b"f");
    let dst = temp.path().join("dst");

    let items = manager()
        .copy_items(
            &[snap(&dir), snap(dir.join("f.txt")), snap(&dir)],
            &dst,
            ConflictResolver::Skip,
            quiet(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|i| i.state() == ItemState::Completed));
}

#[tokio::test]
async fn test_whole_call_errors() {
    let temp = TempDir::new().unwrap();
    let file = temp.path().join("file.txt");
    write(&file, b"x");

    let result = manager()
        .copy_items(&[], temp.path(), ConflictResolver::Skip, quiet(), CancellationToken::new())
        .await;
    assert!(matches!(result, Err(EngineError::EmptyRequest)));

    let result = manager()
        .copy_items(&[snap(&file)], &file, ConflictResolver::Skip, quiet(), CancellationToken::new())
        .await;
    assert!(matches!(result, Err(EngineError::NotADirectory { .. })));
}

#[tokio::test]
async fn test_create_directory() {
    let temp = TempDir::new().unwrap();
    let manager = manager();

    let item = manager
        .create_directory(temp.path(), "new", ConflictResolver::Skip)
        .await
        .unwrap();
    assert_eq!(item.kind(), OperationKind::CreateDirectory);
    assert_eq!(item.state(), ItemState::Completed);
    assert!(temp.path().join("new").is_dir());

    let item = manager
        .create_directory(temp.path(), "new", ConflictResolver::Skip)
        .await
        .unwrap();
    assert_eq!(item.state(), ItemState::Skipped);

    let item = manager
        .create_directory(temp.path(), "new", ConflictResolver::Rename)
        .await
        .unwrap();
    assert_eq!(item.state(), ItemState::Completed);
    assert!(temp.path().join("new (1)").is_dir());

    write(temp.path().join("taken"), b"file");
    let item = manager
        .create_directory(temp.path(), "taken", ConflictResolver::Rename)
        .await
        .unwrap();
    assert_eq!(item.state(), ItemState::Failed);
    assert_eq!(item.error().map(|e| e.kind), Some(ErrorKind::TypeMismatch));

    let result = manager
        .create_directory(temp.path(), "bad/name", ConflictResolver::Skip)
        .await;
    assert!(matches!(result, Err(EngineError::InvalidName { .. })));
}

#[tokio::test]
async fn test_calculate_size() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("dir");
    write(dir.join("a"), &[0u8; 100]);
    write(dir.join("sub").join("b"), &[0u8; 50]);

    let manager = manager();
    let size = manager
        .calculate_size(&[snap(&dir)], quiet(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(size, 150);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = manager.calculate_size(&[snap(&dir)], quiet(), cancel).await;
    assert!(matches!(result, Err(EngineError::Cancelled)));
}

#[tokio::test]
async fn test_every_entry_gets_one_terminal_item() {
    let temp = TempDir::new().unwrap();
    let src = temp.path().join("tree");
    for i in 0..20 {
        write(src.join(format!("d{}", i % 4)).join(format!("f{i}.txt")), format!("{i}").as_bytes());
    }
    let dst = temp.path().join("dst");

    let items = manager()
        .copy_items(&[snap(&src)], &dst, ConflictResolver::Skip, quiet(), CancellationToken::new())
        .await
        .unwrap();

    // 1 root + 4 directories + 20 files
    assert_eq!(items.len(), 25);
    assert_all_terminal(&items);
    let mut sources: Vec<&Path> = items.iter().map(|i| i.source()).collect();
    sources.sort();
    sources.dedup();
    assert_eq!(sources.len(), 25);
    let summary = BatchSummary::from_items(OperationKind::Copy, &items);
    assert_eq!(summary.completed, 25);
    assert_eq!(items.iter().map(|i| i.bytes_transferred()).sum::<u64>(), summary.bytes_processed);
}
