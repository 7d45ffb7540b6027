//! End-to-end generation tests: backup runs against a real tree, snapshots
//! inspected with the recipient key, restores compared against the source.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use snapback::config::{BackupConfig, Config, RestoreConfig};
use snapback::crypt::keyfile::{self, Keypair};
use snapback::engine;
use snapback::restore;
use snapback::snapshot::{RecordKind, SnapshotReader};
use snapback::util::{self, CancelToken};
use snapback::SnapbackError;

struct Fixture {
    _tmp: tempfile::TempDir,
    src: PathBuf,
    backup_dir: PathBuf,
    keys: Keypair,
    cfg: Config,
}

impl Fixture {
    fn new(maxintervals: u16, excludes: Vec<String>) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir(&src).unwrap();
        let backup_dir = tmp.path().join("backups");

        let group = util::lookup_group_name(util::effective_gid())
            .unwrap()
            .expect("effective gid has no group name");

        let cfg = Config {
            backuppath: backup_dir.clone(),
            backup: BackupConfig {
                group,
                paths: vec![src.clone()],
                excludes,
                pubkeyfile: PathBuf::new(),
                maxintervals,
                gzlevel: 6,
            },
            restore: RestoreConfig::default(),
            ..Default::default()
        };

        Self {
            _tmp: tmp,
            src,
            backup_dir,
            keys: keyfile::generate(),
            cfg,
        }
    }

    fn backup(&self) {
        engine::backup(&CancelToken::new(), &self.keys.public, &self.cfg).unwrap();
    }

    fn snapshots(&self) -> Vec<PathBuf> {
        let mut names: Vec<PathBuf> = fs::read_dir(&self.backup_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.to_string_lossy().ends_with(".gz.enc"))
            .collect();
        names.sort();
        names
    }

    fn records(&self, snapshot: &Path) -> Vec<(PathBuf, RecordKind, Vec<u8>)> {
        let mut reader = SnapshotReader::open(snapshot, &self.keys.secret).unwrap();
        let mut records = Vec::new();
        while let Some(rec) = reader.next_record().unwrap() {
            let payload = reader.read_payload().unwrap();
            records.push((rec.meta.path.clone(), rec.kind, payload));
        }
        records
    }

    /// Where a source path lands after restoring into `dest`.
    fn restored(&self, dest: &Path, source: &Path) -> PathBuf {
        let canonical = fs::canonicalize(&self.src).unwrap();
        let relative = source.strip_prefix(&self.src).unwrap();
        dest.join(canonical.strip_prefix("/").unwrap()).join(relative)
    }

    fn restore_to(&self, dest: &Path, ceiling: Option<u16>) {
        restore::restore(
            &CancelToken::new(),
            &self.keys.secret,
            &self.backup_dir,
            dest,
            None,
            ceiling,
        )
        .unwrap();
    }
}

#[test]
fn first_run_emits_full_contents() {
    let fx = Fixture::new(5, vec![]);
    fs::write(fx.src.join("a.txt"), b"hello\n").unwrap();
    fs::create_dir(fx.src.join("d")).unwrap();
    fs::write(fx.src.join("d/b.txt"), b"world\n").unwrap();

    fx.backup();

    let snaps = fx.snapshots();
    assert_eq!(snaps.len(), 1);
    assert!(snaps[0].to_string_lossy().ends_with("-0.gz.enc"));
    assert!(fx.backup_dir.join("sig.cache").exists());
    assert!(!fx.backup_dir.join("sig.cache.inprogress").exists());

    let records = fx.records(&snaps[0]);
    let root = fs::canonicalize(&fx.src).unwrap();

    // Lexicographic walk, directories before their children.
    assert_eq!(records.len(), 4);
    assert_eq!(records[0].0, root);
    assert_eq!(records[0].1, RecordKind::Meta);
    assert_eq!(records[1].0, root.join("a.txt"));
    assert_eq!(records[1].1, RecordKind::Full);
    assert_eq!(records[1].2, b"hello\n");
    assert_eq!(records[2].0, root.join("d"));
    assert_eq!(records[2].1, RecordKind::Meta);
    assert_eq!(records[3].0, root.join("d/b.txt"));
    assert_eq!(records[3].1, RecordKind::Full);
    assert_eq!(records[3].2, b"world\n");

    let cache = snapback::sigcache::SigCache::load(&fx.backup_dir.join("sig.cache"))
        .unwrap()
        .unwrap();
    assert_eq!(cache.len(), 4);
    assert_eq!(cache.generation().increment, 0);
}

#[test]
fn incremental_run_carries_only_the_change() {
    let fx = Fixture::new(5, vec![]);
    fs::write(fx.src.join("a.txt"), b"hello\n").unwrap();
    fs::create_dir(fx.src.join("d")).unwrap();
    fs::write(fx.src.join("d/b.txt"), b"world\n").unwrap();
    fx.backup();

    let mut file = fs::OpenOptions::new()
        .append(true)
        .open(fx.src.join("a.txt"))
        .unwrap();
    use std::io::Write;
    file.write_all(b"!\n").unwrap();
    drop(file);

    fx.backup();

    let snaps = fx.snapshots();
    assert_eq!(snaps.len(), 2);
    assert!(snaps[1].to_string_lossy().ends_with("-1.gz.enc"));

    let records = fx.records(&snaps[1]);
    let root = fs::canonicalize(&fx.src).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].0, root.join("a.txt"));
    assert_eq!(records[0].1, RecordKind::Delta);
    assert!(!records[0].2.is_empty());
}

#[test]
fn deletion_is_tombstoned_and_restores_honor_it() {
    let fx = Fixture::new(5, vec![]);
    fs::write(fx.src.join("a.txt"), b"hello\n").unwrap();
    fs::create_dir(fx.src.join("d")).unwrap();
    fs::write(fx.src.join("d/b.txt"), b"world\n").unwrap();
    fs::set_permissions(fx.src.join("a.txt"), fs::Permissions::from_mode(0o604)).unwrap();
    fx.backup();

    use std::io::Write;
    let mut file = fs::OpenOptions::new()
        .append(true)
        .open(fx.src.join("a.txt"))
        .unwrap();
    file.write_all(b"!\n").unwrap();
    drop(file);
    fx.backup();

    sleep(Duration::from_millis(1100)); // let the parent dir mtime move
    fs::remove_file(fx.src.join("d/b.txt")).unwrap();
    fx.backup();

    let snaps = fx.snapshots();
    assert_eq!(snaps.len(), 3);
    let records = fx.records(&snaps[2]);
    let root = fs::canonicalize(&fx.src).unwrap();
    let tombstone = records
        .iter()
        .find(|(path, _, _)| path == &root.join("d/b.txt"))
        .expect("tombstone for deleted file");
    assert_eq!(tombstone.1, RecordKind::Tombstone);
    assert!(tombstone.2.is_empty());

    // Full restore: deletion applied.
    let dest = fx._tmp.path().join("restore_full");
    fx.restore_to(&dest, None);
    assert_eq!(
        fs::read(fx.restored(&dest, &fx.src.join("a.txt"))).unwrap(),
        b"hello\n!\n"
    );
    assert!(!fx.restored(&dest, &fx.src.join("d/b.txt")).exists());
    assert!(fx.restored(&dest, &fx.src.join("d")).is_dir());

    let restored_mode = fs::metadata(fx.restored(&dest, &fx.src.join("a.txt")))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(restored_mode & 0o777, 0o604);

    // Ceiling 1: the file is back, with the appended content.
    let dest = fx._tmp.path().join("restore_inc1");
    fx.restore_to(&dest, Some(1));
    assert_eq!(
        fs::read(fx.restored(&dest, &fx.src.join("d/b.txt"))).unwrap(),
        b"world\n"
    );
    assert_eq!(
        fs::read(fx.restored(&dest, &fx.src.join("a.txt"))).unwrap(),
        b"hello\n!\n"
    );

    // Ceiling 0: the original content.
    let dest = fx._tmp.path().join("restore_inc0");
    fx.restore_to(&dest, Some(0));
    assert_eq!(
        fs::read(fx.restored(&dest, &fx.src.join("a.txt"))).unwrap(),
        b"hello\n"
    );
}

#[test]
fn generation_rollover_discards_prior_snapshots() {
    let fx = Fixture::new(2, vec![]);
    fs::write(fx.src.join("f"), b"content").unwrap();

    fx.backup();
    assert_eq!(fx.snapshots().len(), 1);
    fx.backup();
    assert_eq!(fx.snapshots().len(), 2);
    fx.backup();
    assert_eq!(fx.snapshots().len(), 3);

    // increment would reach 3 > maxintervals: fresh generation.
    fx.backup();
    let snaps = fx.snapshots();
    assert_eq!(snaps.len(), 1);
    assert!(snaps[0].to_string_lossy().ends_with("-0.gz.enc"));

    let records = fx.records(&snaps[0]);
    // Everything is resent in full.
    assert!(records
        .iter()
        .any(|(path, kind, _)| path.ends_with("f") && *kind == RecordKind::Full));
}

#[test]
fn excludes_prune_whole_subtrees() {
    let fx = Fixture::new(5, vec!["/tmp(/|$)".into()]);
    fs::write(fx.src.join("ok.txt"), b"keep me").unwrap();
    fs::create_dir(fx.src.join("tmp")).unwrap();
    fs::write(fx.src.join("tmp/secret.txt"), b"do not record").unwrap();

    fx.backup();

    let snaps = fx.snapshots();
    let records = fx.records(&snaps[0]);
    assert!(records
        .iter()
        .any(|(path, _, _)| path.to_string_lossy().ends_with("ok.txt")));
    assert!(records
        .iter()
        .all(|(path, _, _)| !path.to_string_lossy().contains("/tmp")));
}

#[test]
fn cancellation_leaves_no_partial_state() {
    let fx = Fixture::new(5, vec![]);
    fs::write(fx.src.join("a.txt"), b"hello\n").unwrap();

    let cancelled = CancelToken::new();
    cancelled.cancel();
    let err = engine::backup(&cancelled, &fx.keys.public, &fx.cfg).unwrap_err();
    assert!(matches!(err, SnapbackError::Cancelled));

    assert!(fx.snapshots().is_empty());
    assert!(!fx.backup_dir.join("sig.cache").exists());
    assert!(!fx.backup_dir.join("sig.cache.inprogress").exists());
}

#[test]
fn cancelled_run_keeps_previous_cache() {
    let fx = Fixture::new(5, vec![]);
    fs::write(fx.src.join("a.txt"), b"hello\n").unwrap();
    fx.backup();
    let cache_before = fs::read(fx.backup_dir.join("sig.cache")).unwrap();

    let cancelled = CancelToken::new();
    cancelled.cancel();
    assert!(engine::backup(&cancelled, &fx.keys.public, &fx.cfg).is_err());

    let cache_after = fs::read(fx.backup_dir.join("sig.cache")).unwrap();
    assert_eq!(cache_before, cache_after);
    assert_eq!(fx.snapshots().len(), 1);
}

#[test]
fn symlinks_round_trip_as_targets() {
    let fx = Fixture::new(5, vec![]);
    fs::write(fx.src.join("a.txt"), b"hello\n").unwrap();
    std::os::unix::fs::symlink("a.txt", fx.src.join("link")).unwrap();

    fx.backup();
    let records = fx.records(&fx.snapshots()[0]);
    let root = fs::canonicalize(&fx.src).unwrap();
    let link = records
        .iter()
        .find(|(path, _, _)| path == &root.join("link"))
        .unwrap();
    assert_eq!(link.1, RecordKind::Full);
    assert_eq!(link.2, b"a.txt");

    // Retarget the link: the next run carries a delta.
    fs::remove_file(fx.src.join("link")).unwrap();
    std::os::unix::fs::symlink("elsewhere", fx.src.join("link")).unwrap();
    fx.backup();

    let snaps = fx.snapshots();
    let records = fx.records(&snaps[1]);
    let link = records
        .iter()
        .find(|(path, _, _)| path == &root.join("link"))
        .unwrap();
    assert_eq!(link.1, RecordKind::Delta);

    let dest = fx._tmp.path().join("restore");
    fx.restore_to(&dest, None);
    let restored = fx.restored(&dest, &fx.src.join("link"));
    assert_eq!(
        fs::read_link(&restored).unwrap(),
        PathBuf::from("elsewhere")
    );
}

#[test]
fn empty_roots_still_produce_a_snapshot() {
    let fx = {
        let mut fx = Fixture::new(5, vec![]);
        fx.cfg.backup.paths.clear();
        fx
    };
    fx.backup();
    let snaps = fx.snapshots();
    assert_eq!(snaps.len(), 1);
    assert!(fx.records(&snaps[0]).is_empty());
}

#[test]
fn backup_directory_is_never_backed_up() {
    let mut fx = Fixture::new(5, vec![]);
    // Backup directory inside the source root.
    fx.cfg.backuppath = fx.src.join("backups");
    fx.backup_dir = fx.cfg.backuppath.clone();
    fs::write(fx.src.join("a.txt"), b"data").unwrap();

    fx.backup();

    let records = fx.records(&fx.snapshots()[0]);
    assert!(records
        .iter()
        .all(|(path, _, _)| !path.starts_with(&fx.backup_dir)));
    assert!(records
        .iter()
        .any(|(path, _, _)| path.to_string_lossy().ends_with("a.txt")));
}

#[test]
fn unreadable_file_is_tombstoned_and_resent_when_readable() {
    if util::effective_uid() == 0 {
        // root ignores permission bits, so the open can't be made to fail
        return;
    }

    let fx = Fixture::new(5, vec![]);
    fs::write(fx.src.join("a.txt"), b"stable").unwrap();
    fs::write(fx.src.join("b.txt"), b"precious").unwrap();
    fx.backup();

    // The file turns unreadable: it is not recorded, stays in the deletion
    // seed, and is tombstoned in the same run.
    fs::set_permissions(fx.src.join("b.txt"), fs::Permissions::from_mode(0o000)).unwrap();
    fx.backup();

    let snaps = fx.snapshots();
    let records = fx.records(&snaps[1]);
    let root = fs::canonicalize(&fx.src).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].0, root.join("b.txt"));
    assert_eq!(records[0].1, RecordKind::Tombstone);

    let cache = snapback::sigcache::SigCache::load(&fx.backup_dir.join("sig.cache"))
        .unwrap()
        .unwrap();
    assert!(cache.get(&root.join("b.txt")).is_none());
    assert!(cache.get(&root.join("a.txt")).is_some());

    // Readable again: the next run sends it in full, as a new file.
    fs::set_permissions(fx.src.join("b.txt"), fs::Permissions::from_mode(0o644)).unwrap();
    fx.backup();

    let snaps = fx.snapshots();
    let records = fx.records(&snaps[2]);
    let resent = records
        .iter()
        .find(|(path, _, _)| path == &root.join("b.txt"))
        .expect("re-sent after becoming readable");
    assert_eq!(resent.1, RecordKind::Full);
    assert_eq!(resent.2, b"precious");
}

#[test]
fn path_replaced_by_socket_is_tombstoned() {
    let fx = Fixture::new(5, vec![]);
    fs::write(fx.src.join("b.txt"), b"was a file").unwrap();
    fx.backup();

    // Sockets are skipped entirely and never clear the deletion seed, so a
    // path that becomes one is treated as deleted.
    fs::remove_file(fx.src.join("b.txt")).unwrap();
    let _listener = std::os::unix::net::UnixListener::bind(fx.src.join("b.txt")).unwrap();
    fx.backup();

    let snaps = fx.snapshots();
    let records = fx.records(&snaps[1]);
    let root = fs::canonicalize(&fx.src).unwrap();
    let tombstone = records
        .iter()
        .find(|(path, _, _)| path == &root.join("b.txt"))
        .expect("tombstone for socket-replaced path");
    assert_eq!(tombstone.1, RecordKind::Tombstone);

    let cache = snapback::sigcache::SigCache::load(&fx.backup_dir.join("sig.cache"))
        .unwrap()
        .unwrap();
    assert!(cache.get(&root.join("b.txt")).is_none());
}

#[test]
fn unchanged_second_run_is_empty_but_cache_is_complete() {
    let fx = Fixture::new(5, vec![]);
    fs::write(fx.src.join("a.txt"), b"stable").unwrap();
    fx.backup();
    fx.backup();

    let snaps = fx.snapshots();
    assert_eq!(snaps.len(), 2);
    assert!(fx.records(&snaps[1]).is_empty());

    // Unchanged paths still appear in the cache (cache/snapshot agreement).
    let cache = snapback::sigcache::SigCache::load(&fx.backup_dir.join("sig.cache"))
        .unwrap()
        .unwrap();
    assert_eq!(cache.len(), 2);
    assert_eq!(cache.generation().increment, 1);
}
