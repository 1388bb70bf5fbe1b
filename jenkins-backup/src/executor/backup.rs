//! Bundle producer - one point-in-time bundle of a Jenkins host.
//!
//! Members are staged in a private directory under the work directory and
//! packaged there. Only a finished bundle is moved into the backup
//! directory, and its digest file follows it, so a failed or interrupted
//! run never leaves a digest for an incomplete payload. If the digest file
//! cannot be placed the bundle is removed again.

use super::blocking;
use crate::bundle::archive::{ArchiveStats, ArchiveWriter, TarZstArchiver};
use crate::bundle::digest::{write_sidecar, DigestVerifier, Sha256Verifier};
use crate::bundle::metadata::Metadata;
use crate::bundle::{
    retention, BundleName, METADATA_MEMBER, PAYLOAD_DIR, PLUGINS_MEMBER, STATE_ARCHIVE_MEMBER,
    UNIT_MEMBER, WAR_MEMBER,
};
use crate::config::{BackupConfig, Config, JenkinsConfig};
use crate::fs::copy::persist_file;
use crate::fs::lock::WorkLock;
use crate::jenkins::{plugin_manifest, JenkinsClient};
use crate::service::runtime_version;
use crate::utils::errors::{BackupError, Result};
use crate::utils::format::{format_bytes, format_duration};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Staged members live here inside the staging directory; the packaged
/// bundle is written next to it so it never packages itself.
const MEMBERS_DIR: &str = "members";

/// Outcome of a successful producer run
#[derive(Debug)]
pub struct BackupReport {
    pub bundle: PathBuf,
    pub digest_file: PathBuf,
    pub digest: String,
    pub size_bytes: u64,
    pub archive: ArchiveStats,
    /// Plugins listed in `plugins.txt` (0 when the inventory was unavailable)
    pub plugins: usize,
    /// Bundles deleted by retention, newest first
    pub pruned: Vec<PathBuf>,
    pub duration: Duration,
}

pub struct BackupProducer {
    jenkins: JenkinsConfig,
    backup: BackupConfig,
    runtime_binary: String,
    client: Option<JenkinsClient>,
    archiver: Arc<dyn ArchiveWriter>,
    verifier: Arc<dyn DigestVerifier>,
}

impl BackupProducer {
    /// Producer with the tar/zstd archiver and SHA-256 digests.
    ///
    /// Without a client the quiesce hooks, plugin inventory and version
    /// probe are skipped.
    pub fn new(config: &Config, client: Option<JenkinsClient>) -> Self {
        Self {
            jenkins: config.jenkins.clone(),
            backup: config.backup.clone(),
            runtime_binary: config.runtime.binary.clone(),
            client,
            archiver: Arc::new(TarZstArchiver::default()),
            verifier: Arc::new(Sha256Verifier),
        }
    }

    pub fn with_archiver(mut self, archiver: Arc<dyn ArchiveWriter>) -> Self {
        self.archiver = archiver;
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn DigestVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Produce a bundle stamped with the current time
    pub async fn run(&self) -> Result<BackupReport> {
        self.run_at(Utc::now()).await
    }

    /// Produce a bundle stamped with `at`
    pub async fn run_at(&self, at: DateTime<Utc>) -> Result<BackupReport> {
        let started = Instant::now();
        let _lock = WorkLock::acquire(&self.backup.work_dir)?;

        let home = &self.jenkins.home;
        if !home.is_dir() {
            return Err(BackupError::FileNotFound(format!(
                "JENKINS_HOME {}",
                home.display()
            )));
        }
        fs::create_dir_all(&self.backup.dir)?;

        let name = BundleName::new(at);
        let staging = tempfile::Builder::new()
            .prefix("staging-")
            .tempdir_in(&self.backup.work_dir)?;
        let members = staging.path().join(MEMBERS_DIR);
        fs::create_dir(&members)?;

        info!("Creating {} from {}", name.file_name(), home.display());

        let quiesced = self.quiesce().await;
        let staged = self.stage(at, &members).await;
        if quiesced {
            self.resume().await;
        }
        let (archive, plugins) = staged?;

        // Package next to the members directory, never inside it
        let packaged = staging.path().join(name.file_name());
        let size_bytes = {
            let archiver = Arc::clone(&self.archiver);
            let (members, packaged) = (members.clone(), packaged.clone());
            blocking(move || archiver.package(&members, &packaged)).await?
        };

        let digest = {
            let verifier = Arc::clone(&self.verifier);
            let packaged = packaged.clone();
            blocking(move || verifier.digest(&packaged)).await?
        };

        let bundle = {
            let (dest, file_name) = (self.backup.dir.clone(), name.file_name());
            blocking(move || persist_file(&packaged, &dest, &file_name)).await?
        };

        let (digest_file, pruned) = match self.seal(staging.path(), &name, &digest).await {
            Ok(sealed) => sealed,
            Err(e) => {
                // A bundle without its digest file must not outlive the run
                if let Err(rm) = fs::remove_file(&bundle) {
                    warn!("Failed to remove {}: {}", bundle.display(), rm);
                }
                return Err(e);
            }
        };

        let duration = started.elapsed();
        info!(
            "Bundle {} written ({}, {} entries, {} plugins) in {}",
            bundle.display(),
            format_bytes(size_bytes),
            archive.entries,
            plugins,
            format_duration(duration.as_secs())
        );

        Ok(BackupReport {
            bundle,
            digest_file,
            digest,
            size_bytes,
            archive,
            plugins,
            pruned,
            duration,
        })
    }

    /// Place the digest file next to the persisted bundle, then apply
    /// retention. On failure the digest file is taken back out.
    async fn seal(
        &self,
        staging: &Path,
        name: &BundleName,
        digest: &str,
    ) -> Result<(PathBuf, Vec<PathBuf>)> {
        let dest = self.backup.dir.clone();
        let sidecar = write_sidecar(staging, &name.file_name(), digest)?;
        let digest_file = {
            let (dest, file_name) = (dest.clone(), name.digest_file_name());
            blocking(move || persist_file(&sidecar, &dest, &file_name)).await?
        };

        let keep = self.backup.keep;
        match blocking(move || retention::prune(&dest, keep)).await {
            Ok(pruned) => Ok((digest_file, pruned)),
            Err(e) => {
                if let Err(rm) = fs::remove_file(&digest_file) {
                    warn!("Failed to remove {}: {}", digest_file.display(), rm);
                }
                Err(e)
            }
        }
    }

    /// Stage every member into `members`, the state archive last
    async fn stage(&self, at: DateTime<Utc>, members: &Path) -> Result<(ArchiveStats, usize)> {
        let plugins = self.write_plugin_manifest(members).await?;

        let war_path = self
            .stage_payload(&self.jenkins.war_path, members, WAR_MEMBER)
            .await?;
        let unit_file = self
            .stage_payload(&self.jenkins.unit_file, members, UNIT_MEMBER)
            .await?;

        let metadata = Metadata {
            created_at: at,
            jenkins_home: self.jenkins.home.clone(),
            war_path,
            unit_file,
            hostname: local_hostname(),
            jenkins_version: self.jenkins_version().await,
            java_version: runtime_version(&self.runtime_binary).await,
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            extra: Default::default(),
        };
        fs::write(members.join(METADATA_MEMBER), metadata.render())?;

        let archiver = Arc::clone(&self.archiver);
        let home = self.jenkins.home.clone();
        let dest = members.join(STATE_ARCHIVE_MEMBER);
        let stats = blocking(move || archiver.write_state_archive(&home, &dest)).await?;

        debug!(
            "State archive: {} entries, {} files, {}",
            stats.entries,
            stats.files,
            format_bytes(stats.bytes)
        );
        Ok((stats, plugins))
    }

    /// Write `plugins.txt` from the live inventory; unavailable inventory is a warning
    async fn write_plugin_manifest(&self, members: &Path) -> Result<usize> {
        let Some(client) = &self.client else {
            return Ok(0);
        };

        match client.plugins().await {
            Ok(plugins) => {
                let manifest = plugin_manifest(&plugins);
                fs::write(members.join(PLUGINS_MEMBER), manifest.render())?;
                Ok(manifest.len())
            }
            Err(e) => {
                warn!("Plugin inventory unavailable, omitting {}: {}", PLUGINS_MEMBER, e);
                Ok(0)
            }
        }
    }

    /// Copy an optional payload file; returns its source path when included
    async fn stage_payload(
        &self,
        source: &Path,
        members: &Path,
        member: &str,
    ) -> Result<Option<PathBuf>> {
        if !source.is_file() {
            debug!("{} not present, skipping {}", source.display(), member);
            return Ok(None);
        }

        fs::create_dir_all(members.join(PAYLOAD_DIR))?;
        let (src, dst) = (source.to_path_buf(), members.join(member));
        blocking(move || fs::copy(&src, &dst)).await?;
        Ok(Some(source.to_path_buf()))
    }

    async fn jenkins_version(&self) -> Option<String> {
        let client = self.client.as_ref()?;
        match client.version().await {
            Ok(version) => version,
            Err(e) => {
                warn!("Could not read Jenkins version: {}", e);
                None
            }
        }
    }

    /// Ask Jenkins to stop scheduling builds. Returns whether a request was made.
    async fn quiesce(&self) -> bool {
        if !self.backup.quiesce {
            return false;
        }
        let Some(client) = &self.client else {
            return false;
        };

        match client.quiet_down().await {
            Ok(()) => info!("Jenkins is quieting down"),
            Err(e) => warn!("Quiesce request failed, archiving a live instance: {}", e),
        }
        true
    }

    async fn resume(&self) {
        let Some(client) = &self.client else {
            return;
        };
        match client.cancel_quiet_down().await {
            Ok(()) => info!("Jenkins resumed"),
            Err(e) => warn!("Resume request failed: {}", e),
        }
    }
}

fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}
