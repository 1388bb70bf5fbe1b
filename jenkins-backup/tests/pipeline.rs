//! Producer and executor integration tests
//!
//! Both pipelines run against a throwaway directory tree laid out like a
//! Jenkins host. The service and health adapters are fakes, so nothing
//! here talks to systemd or the network.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use jenkins_backup::bundle::archive::{
    member_prefix, unpack_bundle, ArchiveStats, ArchiveWriter, TarZstArchiver,
};
use jenkins_backup::bundle::digest::{DigestStatus, DigestVerifier, Sha256Verifier};
use jenkins_backup::bundle::{digest_path, list_bundles, STATE_ARCHIVE_MEMBER};
use jenkins_backup::executor::backup::BackupProducer;
use jenkins_backup::executor::restore::{RestoreExecutor, RestoreStage};
use jenkins_backup::fs::walker::{walk_tree, EntryKind};
use jenkins_backup::health::HealthChecker;
use jenkins_backup::service::ServiceController;
use jenkins_backup::{BackupError, Config, Result};

/// Records every call so tests can assert on the service timeline
#[derive(Clone, Default)]
struct FakeService {
    calls: Arc<Mutex<Vec<&'static str>>>,
    /// Calls that fail the next time they are made
    fail_once: Arc<Mutex<Vec<&'static str>>>,
    unprivileged: bool,
}

impl FakeService {
    fn failing_once(call: &'static str) -> Self {
        let service = Self::default();
        service.fail_once.lock().unwrap().push(call);
        service
    }

    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: &'static str) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        let mut fail_once = self.fail_once.lock().unwrap();
        match fail_once.iter().position(|c| *c == call) {
            Some(i) => {
                fail_once.remove(i);
                Err(BackupError::Command {
                    command: format!("systemctl {}", call),
                    reason: "exit status 1".to_string(),
                })
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ServiceController for FakeService {
    fn check_privileges(&self) -> Result<()> {
        if self.unprivileged {
            return Err(BackupError::PermissionDenied("not root".to_string()));
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.record("stop")
    }

    async fn start(&self) -> Result<()> {
        self.record("start")
    }

    async fn reload_units(&self) -> Result<()> {
        self.record("reload")
    }

    async fn ensure_runtime(&self) -> Result<()> {
        Ok(())
    }

    async fn fix_ownership(&self, _root: &Path) -> Result<()> {
        self.record("chown")
    }
}

struct FixedHealth(bool);

#[async_trait]
impl HealthChecker for FixedHealth {
    async fn probe(&self) -> bool {
        self.0
    }
}

/// Archives state normally but fails while packaging
struct BrokenPackager;

impl ArchiveWriter for BrokenPackager {
    fn write_state_archive(&self, live_root: &Path, dest: &Path) -> Result<ArchiveStats> {
        TarZstArchiver::default().write_state_archive(live_root, dest)
    }

    fn package(&self, _staging: &Path, dest: &Path) -> Result<u64> {
        // Leave a truncated file behind, as a crash mid-write would
        fs::write(dest, b"\x28\xb5\x2f\xfd")?;
        Err(BackupError::Archive("disk full".to_string()))
    }
}

/// Loses the safety copy while reporting the service unhealthy
struct LosesSafetyCopy(PathBuf);

#[async_trait]
impl HealthChecker for LosesSafetyCopy {
    async fn probe(&self) -> bool {
        let _ = fs::remove_dir_all(&self.0);
        false
    }
}

struct Host {
    _dir: TempDir,
    root: PathBuf,
    config: Config,
}

impl Host {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();

        let mut config = Config::default();
        config.jenkins.home = root.join("var/lib/jenkins");
        config.jenkins.war_path = root.join("usr/share/java/jenkins.war");
        config.jenkins.unit_file = root.join("lib/systemd/system/jenkins.service");
        config.backup.dir = root.join("var/backups/jenkins");
        config.backup.work_dir = root.join("var/tmp/jenkins-backup");
        config.backup.keep = 2;
        config.restore.health_timeout_secs = 1;
        config.restore.poll_interval_secs = 1;
        config.runtime.binary = "definitely-not-a-runtime-binary".to_string();

        let home = &config.jenkins.home;
        fs::create_dir_all(home.join("jobs/app")).unwrap();
        fs::write(home.join("config.xml"), b"<hudson><version>2.440</version></hudson>").unwrap();
        fs::write(home.join("jobs/app/config.xml"), b"<project/>").unwrap();
        std::os::unix::fs::symlink("jobs/app", home.join("lastJob")).unwrap();

        Self {
            _dir: dir,
            root,
            config,
        }
    }

    fn home(&self) -> &Path {
        &self.config.jenkins.home
    }

    fn producer(&self) -> BackupProducer {
        BackupProducer::new(&self.config, None)
    }

    fn executor(&self, service: &FakeService, healthy: bool) -> RestoreExecutor {
        RestoreExecutor::new(
            &self.config,
            Box::new(service.clone()),
            Box::new(FixedHealth(healthy)),
        )
    }

    /// Entries next to the live root whose name marks a safety copy
    fn safety_copies(&self) -> Vec<PathBuf> {
        let parent = self.home().parent().unwrap();
        fs::read_dir(parent)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.to_string_lossy().contains(".pre-restore-"))
            .collect()
    }
}

/// Entries beside the live root left by a shadow swap
fn swap_leftovers(home: &Path) -> Vec<String> {
    fs::read_dir(home.parent().unwrap())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.contains(".incoming-") || n.contains(".outgoing-"))
        .collect()
}

#[derive(Debug, PartialEq, Eq)]
enum Node {
    Dir,
    File(Vec<u8>),
    Link(PathBuf),
}

/// Content of a tree: every relative path with its bytes or link target
fn snapshot(root: &Path) -> BTreeMap<PathBuf, Node> {
    walk_tree(root)
        .unwrap()
        .into_iter()
        .map(|entry| {
            let node = match entry.kind {
                EntryKind::Dir => Node::Dir,
                EntryKind::File => Node::File(fs::read(&entry.path).unwrap()),
                EntryKind::Symlink => Node::Link(fs::read_link(&entry.path).unwrap()),
                EntryKind::Special => panic!("unexpected special file {}", entry.path.display()),
            };
            (entry.relative_path, node)
        })
        .collect()
}

fn at(second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, second).unwrap()
}

fn mutate_live_state(home: &Path) {
    fs::write(home.join("config.xml"), b"<hudson><version>2.452</version></hudson>").unwrap();
    fs::remove_dir_all(home.join("jobs/app")).unwrap();
    fs::create_dir_all(home.join("jobs/other")).unwrap();
    fs::write(home.join("jobs/other/config.xml"), b"<flow-definition/>").unwrap();
}

#[tokio::test]
async fn test_failed_packaging_leaves_nothing_in_backup_dir() {
    let host = Host::new();

    let err = host
        .producer()
        .with_archiver(Arc::new(BrokenPackager))
        .run_at(at(0))
        .await
        .unwrap_err();

    assert!(matches!(err, BackupError::Archive(_)));
    assert_eq!(fs::read_dir(&host.config.backup.dir).unwrap().count(), 0);

    // The staging directory went with the failed run
    let work: Vec<_> = fs::read_dir(&host.config.backup.work_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(work, vec![".jenkins-backup.lock".to_string()]);
}

#[tokio::test]
async fn test_digest_round_trip_and_single_byte_mutation() {
    let host = Host::new();
    let report = host.producer().run_at(at(0)).await.unwrap();

    assert_eq!(
        Sha256Verifier.verify(&report.bundle).unwrap(),
        DigestStatus::Verified(report.digest.clone())
    );

    let mut bytes = fs::read(&report.bundle).unwrap();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0x01;
    fs::write(&report.bundle, bytes).unwrap();

    assert!(matches!(
        Sha256Verifier.verify(&report.bundle),
        Err(BackupError::DigestMismatch { .. })
    ));
}

#[tokio::test]
async fn test_retention_keeps_newest_bundles() {
    let mut host = Host::new();
    host.config.backup.keep = 3;

    for second in 0..5 {
        host.producer().run_at(at(second)).await.unwrap();
    }

    let bundles = list_bundles(&host.config.backup.dir).unwrap();
    let tokens: Vec<_> = bundles.iter().map(|b| b.name.token().to_string()).collect();
    assert_eq!(
        tokens,
        vec!["20240601T120004Z", "20240601T120003Z", "20240601T120002Z"]
    );
    assert!(bundles.iter().all(|b| b.has_digest));

    let digests = fs::read_dir(&host.config.backup.dir)
        .unwrap()
        .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().ends_with(".sha256"))
        .count();
    assert_eq!(digests, 3);
}

#[tokio::test]
async fn test_state_archive_keeps_absolute_path_and_owner() {
    let host = Host::new();
    let report = host.producer().run_at(at(0)).await.unwrap();
    assert_eq!(report.pruned.len(), 0);

    let workspace = TempDir::new().unwrap();
    unpack_bundle(&report.bundle, workspace.path()).unwrap();

    let expected = member_prefix(host.home()).unwrap().join("config.xml");
    let owner = fs::metadata(host.home().join("config.xml")).unwrap().uid() as u64;

    let mut archive =
        tar::Archive::new(fs::File::open(workspace.path().join(STATE_ARCHIVE_MEMBER)).unwrap());
    let entry = archive
        .entries()
        .unwrap()
        .map(|e| e.unwrap())
        .find(|e| e.path().unwrap() == expected)
        .expect("config.xml stored under its absolute path");
    assert_eq!(entry.header().uid().unwrap(), owner);
}

#[tokio::test]
async fn test_corrupted_digest_leaves_live_state_untouched() {
    let host = Host::new();
    let report = host.producer().run_at(at(0)).await.unwrap();
    mutate_live_state(host.home());
    let before = snapshot(host.home());

    let sidecar = digest_path(&report.bundle);
    let name = report.bundle.file_name().unwrap().to_string_lossy().into_owned();
    fs::write(&sidecar, format!("{}  {}\n", "0".repeat(64), name)).unwrap();

    let service = FakeService::default();
    let err = host
        .executor(&service, true)
        .run_at(&report.bundle, at(30))
        .await
        .unwrap_err();

    assert!(matches!(err, BackupError::DigestMismatch { .. }));
    assert_eq!(err.exit_code(), 2);
    assert!(service.calls().is_empty());
    assert!(host.safety_copies().is_empty());
    assert_eq!(snapshot(host.home()), before);
}

#[tokio::test]
async fn test_unhealthy_restore_rolls_back_byte_identical() {
    let host = Host::new();
    let report = host.producer().run_at(at(0)).await.unwrap();
    mutate_live_state(host.home());
    let before = snapshot(host.home());

    let service = FakeService::default();
    let executor = host.executor(&service, false);
    let expected_copy = executor.safety_copy_path(at(30));
    let err = executor.run_at(&report.bundle, at(30)).await.unwrap_err();

    match &err {
        BackupError::RolledBack { safety_copy, .. } => assert_eq!(safety_copy, &expected_copy),
        other => panic!("expected rollback, got {:?}", other),
    }
    assert_eq!(err.exit_code(), 3);
    assert!(err.to_string().contains(&expected_copy.display().to_string()));

    assert_eq!(snapshot(host.home()), before);
    assert_eq!(snapshot(&expected_copy), before);
    assert_eq!(
        service.calls(),
        vec!["stop", "chown", "start", "stop", "start"]
    );

    // No shadow or displaced trees are left beside the live root
    let leftovers = swap_leftovers(host.home());
    assert!(leftovers.is_empty(), "{:?}", leftovers);
}

#[tokio::test]
async fn test_unprivileged_restore_is_refused_before_any_change() {
    let host = Host::new();
    let report = host.producer().run_at(at(0)).await.unwrap();
    mutate_live_state(host.home());
    let before = snapshot(host.home());

    let service = FakeService {
        unprivileged: true,
        ..FakeService::default()
    };
    let err = host
        .executor(&service, true)
        .run_at(&report.bundle, at(30))
        .await
        .unwrap_err();

    assert!(matches!(err, BackupError::PermissionDenied(_)));
    assert_eq!(err.exit_code(), 2);
    assert!(service.calls().is_empty());
    assert!(host.safety_copies().is_empty());
    assert_eq!(snapshot(host.home()), before);
}

#[tokio::test]
async fn test_bundle_without_state_archive_aborts_at_extract() {
    let host = Host::new();
    let before = snapshot(host.home());

    // A bundle with a plugin manifest but no jenkins_home.tar
    fs::create_dir_all(&host.config.backup.dir).unwrap();
    let bundle = host
        .config
        .backup
        .dir
        .join("jenkins-backup-20240601T120000Z.tar.zst");
    let manifest = b"git:5.2.1\n";
    let mut header = tar::Header::new_gnu();
    header.set_size(manifest.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    let mut builder =
        tar::Builder::new(zstd::Encoder::new(fs::File::create(&bundle).unwrap(), 3).unwrap());
    builder
        .append_data(&mut header, "plugins.txt", &manifest[..])
        .unwrap();
    builder.into_inner().unwrap().finish().unwrap();

    let service = FakeService::default();
    let executor = host.executor(&service, true);
    let err = executor.run_at(&bundle, at(30)).await.unwrap_err();

    match &err {
        BackupError::MissingMember { member, .. } => assert_eq!(member, STATE_ARCHIVE_MEMBER),
        other => panic!("expected missing member, got {:?}", other),
    }
    assert_eq!(err.exit_code(), 1);

    // Stopped for the safety copy, started again once extraction failed
    assert_eq!(service.calls(), vec!["stop", "start"]);
    assert_eq!(snapshot(host.home()), before);
    assert_eq!(snapshot(&executor.safety_copy_path(at(30))), before);
    assert!(swap_leftovers(host.home()).is_empty());
}

#[tokio::test]
async fn test_failed_start_after_replace_rolls_back() {
    let host = Host::new();
    let report = host.producer().run_at(at(0)).await.unwrap();
    mutate_live_state(host.home());
    let before = snapshot(host.home());

    let service = FakeService::failing_once("start");
    let err = host
        .executor(&service, true)
        .run_at(&report.bundle, at(30))
        .await
        .unwrap_err();

    match &err {
        BackupError::RolledBack { reason, .. } => assert!(reason.starts_with("START"), "{}", reason),
        other => panic!("expected rollback, got {:?}", other),
    }
    assert_eq!(err.exit_code(), 3);
    assert_eq!(
        service.calls(),
        vec!["stop", "chown", "start", "stop", "start"]
    );
    assert_eq!(snapshot(host.home()), before);
}

#[tokio::test]
async fn test_lost_safety_copy_fails_rollback() {
    let host = Host::new();
    let report = host.producer().run_at(at(0)).await.unwrap();

    let service = FakeService::default();
    let safety_copy = host.executor(&service, true).safety_copy_path(at(30));
    let executor = RestoreExecutor::new(
        &host.config,
        Box::new(service.clone()),
        Box::new(LosesSafetyCopy(safety_copy.clone())),
    );

    let err = executor.run_at(&report.bundle, at(30)).await.unwrap_err();

    match &err {
        BackupError::RollbackFailed { safety_copy: kept, .. } => assert_eq!(kept, &safety_copy),
        other => panic!("expected failed rollback, got {:?}", other),
    }
    assert_eq!(err.exit_code(), 4);
    // No restart once the copy back failed
    assert_eq!(service.calls(), vec!["stop", "chown", "start", "stop"]);
}

#[tokio::test]
async fn test_restore_twice_yields_same_state() {
    let host = Host::new();
    let original = snapshot(host.home());
    let report = host.producer().run_at(at(0)).await.unwrap();
    mutate_live_state(host.home());

    let service = FakeService::default();
    let first = host
        .executor(&service, true)
        .run_at(&report.bundle, at(10))
        .await
        .unwrap();
    let after_first = snapshot(host.home());

    let second = host
        .executor(&service, true)
        .run_at(&report.bundle, at(20))
        .await
        .unwrap();
    let after_second = snapshot(host.home());

    assert_eq!(after_first, original);
    assert_eq!(after_second, after_first);
    assert_ne!(first.safety_copy, second.safety_copy);
    assert!(matches!(first.digest, DigestStatus::Verified(_)));
    assert_eq!(first.stages.last(), Some(&RestoreStage::Done));
    assert_eq!(host.safety_copies().len(), 2);
}

#[tokio::test]
async fn test_restore_without_digest_file_proceeds_unverified() {
    let host = Host::new();
    let report = host.producer().run_at(at(0)).await.unwrap();
    fs::remove_file(&report.digest_file).unwrap();

    let service = FakeService::default();
    let restored = host
        .executor(&service, true)
        .run_at(&report.bundle, at(10))
        .await
        .unwrap();

    assert_eq!(restored.digest, DigestStatus::Unverified);
    let metadata = restored.metadata.expect("bundle carries METADATA");
    assert_eq!(metadata.jenkins_home, host.home());
}

#[tokio::test]
async fn test_ancillary_files_are_installed() {
    let host = Host::new();
    let war = &host.config.jenkins.war_path;
    let unit = &host.config.jenkins.unit_file;
    fs::create_dir_all(war.parent().unwrap()).unwrap();
    fs::create_dir_all(unit.parent().unwrap()).unwrap();
    fs::write(war, b"war v1").unwrap();
    fs::write(unit, b"[Service]\nUser=jenkins\n").unwrap();

    let report = host.producer().run_at(at(0)).await.unwrap();
    fs::remove_file(war).unwrap();
    fs::write(unit, b"[Service]\nUser=root\n").unwrap();

    let service = FakeService::default();
    host.executor(&service, true)
        .run_at(&report.bundle, at(10))
        .await
        .unwrap();

    assert_eq!(fs::read(war).unwrap(), b"war v1");
    assert_eq!(fs::read(unit).unwrap(), b"[Service]\nUser=jenkins\n");
    assert_eq!(
        service.calls(),
        vec!["stop", "chown", "reload", "start"]
    );
    assert!(host.root.join("var/backups/jenkins").is_dir());
}
