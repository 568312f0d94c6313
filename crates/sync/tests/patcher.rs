use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use vlt_config::{PatchConfig, SyncConfig};
use vlt_manifest::format::{self, ManifestFormat};
use vlt_manifest::{Fingerprint, Record, RecordIndex, ScanOptions};
use vlt_storage::backend::{LocalBackend, MockBackend};
use vlt_storage::{BackendHandle, StorageBackend};
use vlt_sync::error::ErrorKind;
use vlt_sync::{ManifestStore, Patcher, PullReport};

fn tree(files: &[(&str, &str)]) -> MockBackend {
    MockBackend::with_files(files.iter().map(|(p, d)| (p.to_string(), d.as_bytes().to_vec())))
}

fn handle(backend: &MockBackend) -> BackendHandle {
    Arc::new(backend.clone())
}

fn patcher(local: &MockBackend, remote: &MockBackend) -> Patcher {
    Patcher::new(handle(local), handle(remote), SyncConfig::default(), PatchConfig::default())
}

async fn remote_index(remote: &MockBackend) -> RecordIndex {
    format::load(remote, Path::new("index.json"), ManifestFormat::Json).await.unwrap().unwrap()
}

async fn local_manifest(local: &MockBackend) -> RecordIndex {
    let store = ManifestStore::new(handle(local), ".vlt");
    let options = ScanOptions::default().excluding(".vlt");
    store.load(&options, &CancellationToken::new()).await.unwrap().unwrap().index
}

fn content_paths(backend: &MockBackend) -> Vec<PathBuf> {
    backend.paths().into_iter().filter(|p| !p.starts_with(".vlt")).collect()
}

#[tokio::test]
async fn test_push_packages_changes() {
    let workstation = tree(&[("a.txt", "alpha"), ("dir/b.txt", "bravo")]);
    let remote = MockBackend::default();
    let report = patcher(&workstation, &remote).push().await.unwrap().unwrap();
    assert_eq!(report.packaged, 2);
    let archive = report.archive.unwrap();
    assert!(archive.starts_with("patch-") && archive.ends_with(".tar.gz"));
    assert!(remote.exists(&Path::new("patches").join(&archive)).await.unwrap());

    let index = remote_index(&remote).await;
    assert_eq!(index.live_len(), 2);
    assert!(index.iter().all(|r| r.archive.as_deref() == Some(archive.as_str())));

    // Nothing changed, nothing to push.
    let again = patcher(&workstation, &remote).push().await.unwrap().unwrap();
    assert_eq!(again.archive, None);

    // A removal becomes a tombstone; a change gets a new archive.
    workstation.delete(Path::new("a.txt")).await.unwrap();
    workstation.write(Path::new("dir/b.txt"), b"bravo two").await.unwrap();
    let report = patcher(&workstation, &remote).push().await.unwrap().unwrap();
    assert_eq!((report.packaged, report.removed), (1, 1));
    let index = remote_index(&remote).await;
    assert!(index.get("a.txt").unwrap().deleted);
    assert_eq!(index.get_live("dir/b.txt").unwrap().hash, Fingerprint::of("bravo two"));
    assert_eq!(index.get_live("dir/b.txt").unwrap().archive, report.archive);
}

#[tokio::test]
async fn test_pull_reproduces_the_pushed_tree() {
    let workstation = tree(&[("a.txt", "alpha"), ("dir/b.txt", "bravo")]);
    let remote = MockBackend::default();
    let player = tree(&[("stale.txt", "stale")]);
    patcher(&workstation, &remote).push().await.unwrap();

    let report = patcher(&player, &remote).pull().await.unwrap().unwrap();
    assert_eq!(report, PullReport { downloaded: 1, reused: 0, extracted: 2, removed: 1 });
    assert_eq!(content_paths(&player), content_paths(&workstation));
    assert_eq!(player.read(Path::new("dir/b.txt")).await.unwrap(), b"bravo");

    // Pulling again changes nothing.
    let again = patcher(&player, &remote).pull().await.unwrap().unwrap();
    assert_eq!(again, PullReport::default());

    // Follow-up patches apply on top, and tombstones remove files.
    workstation.delete(Path::new("a.txt")).await.unwrap();
    workstation.write(Path::new("c.txt"), b"charlie").await.unwrap();
    patcher(&workstation, &remote).push().await.unwrap();
    let report = patcher(&player, &remote).pull().await.unwrap().unwrap();
    assert_eq!((report.downloaded, report.extracted, report.removed), (1, 1, 1));
    assert_eq!(content_paths(&player), vec![PathBuf::from("c.txt"), PathBuf::from("dir/b.txt")]);
    let manifest = local_manifest(&player).await;
    assert_eq!(manifest.fingerprints(), remote_index(&remote).await.live().map(|r| (r.key(), r.hash)).collect());
}

fn cached_archives(backend: &MockBackend) -> Vec<PathBuf> {
    backend.paths().into_iter().filter(|p| p.starts_with(".vlt/patches")).collect()
}

#[tokio::test]
async fn test_truncated_cached_archive_is_downloaded_again() {
    let workstation = tree(&[("a.txt", "alpha")]);
    let remote = MockBackend::default();
    let archive = patcher(&workstation, &remote).push().await.unwrap().unwrap().archive.unwrap();
    let full = remote.read(&Path::new("patches").join(&archive)).await.unwrap();

    // A download that died halfway.
    let player = MockBackend::default();
    let cached = Path::new(".vlt/patches").join(&archive);
    player.write(&cached, &full[..full.len() / 2]).await.unwrap();

    let report = patcher(&player, &remote).pull().await.unwrap().unwrap();
    assert_eq!(report, PullReport { downloaded: 1, reused: 0, extracted: 1, removed: 0 });
    assert_eq!(player.read(Path::new("a.txt")).await.unwrap(), b"alpha");
    assert_eq!(player.read(&cached).await.unwrap(), full);
    assert!(player.paths().iter().all(|p| !p.to_string_lossy().ends_with(".vltpart")));

    let again = patcher(&player, &remote).pull().await.unwrap().unwrap();
    assert_eq!(again, PullReport::default());
}

#[tokio::test]
async fn test_pull_prunes_unreferenced_archives() {
    let workstation = tree(&[("a.txt", "alpha")]);
    let remote = MockBackend::default();
    let player = MockBackend::default();
    let first = patcher(&workstation, &remote).push().await.unwrap().unwrap().archive.unwrap();
    patcher(&player, &remote).pull().await.unwrap();
    assert_eq!(cached_archives(&player), vec![Path::new(".vlt/patches").join(&first)]);

    workstation.write(Path::new("a.txt"), b"alpha two").await.unwrap();
    let second = patcher(&workstation, &remote).push().await.unwrap().unwrap().archive.unwrap();
    assert_ne!(first, second);
    player.write(Path::new(".vlt/patches/stale.tar.gz.vltpart"), b"partial").await.unwrap();
    patcher(&player, &remote).pull().await.unwrap();

    assert_eq!(cached_archives(&player), vec![Path::new(".vlt/patches").join(&second)]);
    assert_eq!(player.read(Path::new("a.txt")).await.unwrap(), b"alpha two");
}

#[tokio::test]
async fn test_missing_member_leaves_local_tree_alone() {
    // The archive is already cached locally and lacks `b.txt`; the remote
    // doesn't even hold a copy, so any download attempt would fail differently.
    let packed = vlt_storage::archive::pack([("a.txt", b"alpha".to_vec())]).unwrap();
    let player = tree(&[("old.txt", "old")]);
    player.write(Path::new(".vlt/patches/patch-1.tar.gz"), &packed).await.unwrap();
    let mut before = local_manifest(&player).await;
    ManifestStore::new(handle(&player), ".vlt").commit(&before).await.unwrap();
    before = local_manifest(&player).await;

    let mut index = RecordIndex::new("remote");
    for (path, content) in [("a.txt", "alpha"), ("b.txt", "bravo")] {
        let record = Record::new(path, Fingerprint::of(content), content.len() as u64, time::OffsetDateTime::now_utc())
            .unwrap()
            .with_archive("patch-1.tar.gz");
        index.insert(record);
    }
    let remote = MockBackend::default();
    format::save(&remote, Path::new("index.json"), &index, ManifestFormat::Json).await.unwrap();

    let err = patcher(&player, &remote).pull().await.unwrap_err();
    match &*err {
        ErrorKind::Extraction { archive, member } => {
            assert_eq!(archive, "patch-1.tar.gz");
            assert_eq!(member, "b.txt");
        },
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(content_paths(&player), vec![PathBuf::from("old.txt")]);
    assert_eq!(local_manifest(&player).await, before);
    assert!(player.paths().iter().all(|p| !p.to_string_lossy().ends_with(".vltpart")));
}

#[tokio::test]
async fn test_record_without_archive_is_rejected() {
    let mut index = RecordIndex::new("remote");
    index.insert(Record::new("a.txt", Fingerprint::of("a"), 1, time::OffsetDateTime::now_utc()).unwrap());
    let remote = MockBackend::default();
    format::save(&remote, Path::new("index.json"), &index, ManifestFormat::Json).await.unwrap();
    let err = patcher(&MockBackend::default(), &remote).pull().await.unwrap_err();
    assert!(matches!(&*err, ErrorKind::MissingArchiveRef(path) if path == "a.txt"));
}

#[tokio::test]
async fn test_pull_without_index() {
    let err = patcher(&MockBackend::default(), &MockBackend::default()).pull().await.unwrap_err();
    assert!(matches!(&*err, ErrorKind::MissingIndex(_)));
}

#[tokio::test]
async fn test_round_trip_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    for (path, content) in [("src/a.txt", "alpha"), ("src/nested/b.txt", "bravo")] {
        let path = dir.path().join(path);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }
    let local = |name: &str| -> BackendHandle { Arc::new(LocalBackend::new(name, dir.path().join(name)).unwrap()) };
    let push = Patcher::new(local("src"), local("remote"), SyncConfig::default(), PatchConfig::default());
    push.push().await.unwrap().unwrap();
    let pull = Patcher::new(local("dst"), local("remote"), SyncConfig::default(), PatchConfig::default());
    let report = pull.pull().await.unwrap().unwrap();
    assert_eq!(report.extracted, 2);
    assert_eq!(std::fs::read(dir.path().join("dst/nested/b.txt")).unwrap(), b"bravo");
    assert!(dir.path().join("dst/.vlt/manifest").is_file());
    assert!(!dir.path().join("dst/nested/b.txt.vltpart").exists());
}
