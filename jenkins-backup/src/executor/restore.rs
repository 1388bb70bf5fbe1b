//! Restore executor - replace the live Jenkins state with a bundle.
//!
//! A single driver walks the stages in order:
//!
//! ```text
//! VERIFY → STOP → SNAPSHOT → EXTRACT → REPLACE → RESTORE_ANCILLARY → START → HEALTH_CHECK
//!        → DONE | ROLLBACK → DONE_WITH_ROLLBACK
//! ```
//!
//! Failures up to EXTRACT abort without touching the live root; once the
//! service has been stopped it is started again before returning. From
//! REPLACE on, any failure (and an unhealthy service) rolls the live root
//! back from the safety copy. The safety copy is never deleted.

use super::{blocking, sibling};
use crate::bundle::archive::{unpack_bundle, unpack_state_archive};
use crate::bundle::digest::{DigestStatus, DigestVerifier, Sha256Verifier};
use crate::bundle::manifest::PluginManifest;
use crate::bundle::metadata::Metadata;
use crate::bundle::{
    timestamp_token, METADATA_MEMBER, PLUGINS_MEMBER, STATE_ARCHIVE_MEMBER, UNIT_MEMBER,
    WAR_MEMBER,
};
use crate::config::{Config, JenkinsConfig};
use crate::fs::copy::{copy_tree, persist_file, remove_tree, swap_dir};
use crate::fs::metadata::running_as_root;
use crate::health::HealthChecker;
use crate::service::ServiceController;
use crate::utils::errors::{BackupError, Result};
use crate::utils::format::{format_bytes, format_duration};
use chrono::{DateTime, Utc};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreStage {
    Verify,
    Stop,
    Snapshot,
    Extract,
    Replace,
    RestoreAncillary,
    Start,
    HealthCheck,
    Done,
    Rollback,
    DoneWithRollback,
}

impl fmt::Display for RestoreStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RestoreStage::Verify => "VERIFY",
            RestoreStage::Stop => "STOP",
            RestoreStage::Snapshot => "SNAPSHOT",
            RestoreStage::Extract => "EXTRACT",
            RestoreStage::Replace => "REPLACE",
            RestoreStage::RestoreAncillary => "RESTORE_ANCILLARY",
            RestoreStage::Start => "START",
            RestoreStage::HealthCheck => "HEALTH_CHECK",
            RestoreStage::Done => "DONE",
            RestoreStage::Rollback => "ROLLBACK",
            RestoreStage::DoneWithRollback => "DONE_WITH_ROLLBACK",
        };
        f.write_str(name)
    }
}

/// Outcome of a successful restore
#[derive(Debug)]
pub struct RestoreReport {
    pub bundle: PathBuf,
    pub safety_copy: PathBuf,
    pub digest: DigestStatus,
    /// Parsed `METADATA`, when the bundle carried a readable one
    pub metadata: Option<Metadata>,
    /// Stages entered, in order
    pub stages: Vec<RestoreStage>,
    pub duration: Duration,
}

/// State carried between stages of one attempt
struct Attempt {
    bundle: PathBuf,
    token: String,
    safety_copy: PathBuf,
    digest: DigestStatus,
    workspace: Option<TempDir>,
    metadata: Option<Metadata>,
    failure: Option<String>,
    stages: Vec<RestoreStage>,
}

impl Attempt {
    fn workspace(&self) -> Result<&Path> {
        self.workspace
            .as_ref()
            .map(TempDir::path)
            .ok_or_else(|| BackupError::Archive("bundle has not been extracted".to_string()))
    }
}

pub struct RestoreExecutor {
    jenkins: JenkinsConfig,
    work_dir: PathBuf,
    health_timeout: Duration,
    poll_interval: Duration,
    service: Box<dyn ServiceController>,
    health: Box<dyn HealthChecker>,
    verifier: Arc<dyn DigestVerifier>,
}

impl RestoreExecutor {
    pub fn new(
        config: &Config,
        service: Box<dyn ServiceController>,
        health: Box<dyn HealthChecker>,
    ) -> Self {
        Self {
            jenkins: config.jenkins.clone(),
            work_dir: config.backup.work_dir.clone(),
            health_timeout: config.restore.health_timeout(),
            poll_interval: config.restore.poll_interval(),
            service,
            health,
            verifier: Arc::new(Sha256Verifier),
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn DigestVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Safety copy location for a restore started at `at`
    pub fn safety_copy_path(&self, at: DateTime<Utc>) -> PathBuf {
        sibling(
            &self.jenkins.home,
            "",
            &format!(".pre-restore-{}", timestamp_token(at)),
        )
    }

    /// Restore `bundle`, stamping the safety copy with the current time
    pub async fn run(&self, bundle: &Path) -> Result<RestoreReport> {
        self.run_at(bundle, Utc::now()).await
    }

    /// Restore `bundle`, stamping the safety copy with `at`
    pub async fn run_at(&self, bundle: &Path, at: DateTime<Utc>) -> Result<RestoreReport> {
        let started = Instant::now();
        let mut attempt = Attempt {
            bundle: bundle.to_path_buf(),
            token: timestamp_token(at),
            safety_copy: self.safety_copy_path(at),
            digest: DigestStatus::Unverified,
            workspace: None,
            metadata: None,
            failure: None,
            stages: Vec::new(),
        };

        info!(
            "Restoring {} into {}",
            bundle.display(),
            self.jenkins.home.display()
        );

        let mut stage = RestoreStage::Verify;
        loop {
            attempt.stages.push(stage);
            info!("Restore stage {}", stage);

            stage = match stage {
                RestoreStage::Verify => {
                    self.verify(&mut attempt).await?;
                    RestoreStage::Stop
                }
                RestoreStage::Stop => {
                    self.service.stop().await?;
                    RestoreStage::Snapshot
                }
                RestoreStage::Snapshot => {
                    let result = self.snapshot(&attempt).await;
                    self.restart_if_aborted(result).await?;
                    RestoreStage::Extract
                }
                RestoreStage::Extract => {
                    let result = self.extract(&mut attempt).await;
                    self.restart_if_aborted(result).await?;
                    RestoreStage::Replace
                }
                RestoreStage::Replace => {
                    let result = self.replace(&attempt).await;
                    advance(result, RestoreStage::RestoreAncillary, &mut attempt)
                }
                RestoreStage::RestoreAncillary => {
                    let result = self.restore_ancillary(&attempt).await;
                    advance(result, RestoreStage::Start, &mut attempt)
                }
                RestoreStage::Start => {
                    let result = self.start().await;
                    advance(result, RestoreStage::HealthCheck, &mut attempt)
                }
                RestoreStage::HealthCheck => {
                    if self
                        .health
                        .wait_until_healthy(self.health_timeout, self.poll_interval)
                        .await
                    {
                        RestoreStage::Done
                    } else {
                        attempt.failure = Some(format!(
                            "service not healthy within {}",
                            format_duration(self.health_timeout.as_secs())
                        ));
                        RestoreStage::Rollback
                    }
                }
                RestoreStage::Rollback => {
                    self.rollback(&mut attempt).await?;
                    RestoreStage::DoneWithRollback
                }
                RestoreStage::Done => {
                    info!(
                        "Restore of {} complete in {}; safety copy kept at {}",
                        attempt.bundle.display(),
                        format_duration(started.elapsed().as_secs()),
                        attempt.safety_copy.display()
                    );
                    return Ok(RestoreReport {
                        bundle: attempt.bundle,
                        safety_copy: attempt.safety_copy,
                        digest: attempt.digest,
                        metadata: attempt.metadata,
                        stages: attempt.stages,
                        duration: started.elapsed(),
                    });
                }
                RestoreStage::DoneWithRollback => {
                    return Err(BackupError::RolledBack {
                        safety_copy: attempt.safety_copy,
                        reason: attempt
                            .failure
                            .unwrap_or_else(|| "unknown failure".to_string()),
                    });
                }
            };
        }
    }

    async fn verify(&self, attempt: &mut Attempt) -> Result<()> {
        self.service.check_privileges()?;
        if !attempt.bundle.is_file() {
            return Err(BackupError::FileNotFound(attempt.bundle.display().to_string()));
        }
        if !self.jenkins.home.is_dir() {
            return Err(BackupError::FileNotFound(format!(
                "JENKINS_HOME {}",
                self.jenkins.home.display()
            )));
        }
        if attempt.safety_copy.exists() {
            return Err(BackupError::Snapshot(format!(
                "{} already exists",
                attempt.safety_copy.display()
            )));
        }

        let verifier = Arc::clone(&self.verifier);
        let bundle = attempt.bundle.clone();
        attempt.digest = blocking(move || verifier.verify(&bundle)).await?;
        if let DigestStatus::Verified(hex) = &attempt.digest {
            info!("Digest verified: {}", hex);
        }
        Ok(())
    }

    async fn snapshot(&self, attempt: &Attempt) -> Result<()> {
        let live = self.jenkins.home.clone();
        let safety = attempt.safety_copy.clone();
        let privileged = running_as_root();

        let stats = blocking(move || {
            let result = copy_tree(&live, &safety, privileged);
            if result.is_err() {
                // A partial copy is not a usable rollback source
                let _ = remove_tree(&safety);
            }
            result
        })
        .await
        .map_err(|e| BackupError::Snapshot(e.to_string()))?;

        info!(
            "Safety copy at {} ({} files, {})",
            attempt.safety_copy.display(),
            stats.files,
            format_bytes(stats.bytes)
        );
        Ok(())
    }

    async fn extract(&self, attempt: &mut Attempt) -> Result<()> {
        fs::create_dir_all(&self.work_dir)?;
        let workspace = tempfile::Builder::new()
            .prefix("restore-")
            .tempdir_in(&self.work_dir)?;

        let (bundle, path) = (attempt.bundle.clone(), workspace.path().to_path_buf());
        blocking(move || unpack_bundle(&bundle, &path)).await?;

        attempt.metadata = match fs::read_to_string(workspace.path().join(METADATA_MEMBER)) {
            Ok(text) => match Metadata::parse(&text) {
                Ok(metadata) => {
                    info!(
                        "Bundle taken on {} at {} (Jenkins {})",
                        metadata.hostname,
                        metadata.created_at,
                        metadata.jenkins_version.as_deref().unwrap_or("unknown")
                    );
                    Some(metadata)
                }
                Err(e) => {
                    warn!("Unreadable {}: {}", METADATA_MEMBER, e);
                    None
                }
            },
            Err(_) => None,
        };

        if let Ok(text) = fs::read_to_string(workspace.path().join(PLUGINS_MEMBER)) {
            info!("Bundle lists {} plugins", PluginManifest::parse(&text).len());
        }

        attempt.workspace = Some(workspace);
        Ok(())
    }

    /// Unpack the state archive next to the live root and swap it in
    async fn replace(&self, attempt: &Attempt) -> Result<()> {
        let live = self.jenkins.home.clone();
        let captured = match &attempt.metadata {
            Some(metadata) if metadata.jenkins_home != live => {
                warn!(
                    "Bundle was captured from {}, restoring into {}",
                    metadata.jenkins_home.display(),
                    live.display()
                );
                metadata.jenkins_home.clone()
            }
            _ => live.clone(),
        };

        let archive = attempt.workspace()?.join(STATE_ARCHIVE_MEMBER);
        let shadow_root = sibling(&live, ".", &format!(".incoming-{}", attempt.token));
        let outgoing = sibling(&live, ".", &format!(".outgoing-{}", attempt.token));
        let privileged = running_as_root();
        if !privileged {
            warn!("Not running as root, ownership and extended attributes are not restored");
        }

        let target = live.clone();
        blocking(move || {
            fs::create_dir(&shadow_root)?;
            let result: Result<()> = (|| {
                let restored =
                    unpack_state_archive(&archive, &captured, &shadow_root, privileged)?;
                swap_dir(&restored, &target, &outgoing)?;
                Ok(())
            })();
            if let Err(e) = remove_tree(&shadow_root) {
                warn!("Failed to remove {}: {}", shadow_root.display(), e);
            }
            result
        })
        .await?;

        self.service.fix_ownership(&live).await
    }

    /// Install the unit descriptor and war shipped in the bundle, if any
    async fn restore_ancillary(&self, attempt: &Attempt) -> Result<()> {
        let workspace = attempt.workspace()?;

        let unit_installed =
            install_member(workspace, UNIT_MEMBER, &self.jenkins.unit_file).await?;
        install_member(workspace, WAR_MEMBER, &self.jenkins.war_path).await?;

        if unit_installed {
            if let Err(e) = self.service.reload_units().await {
                warn!("Unit reload failed: {}", e);
            }
        }
        Ok(())
    }

    /// After STOP and before REPLACE the live root is untouched, so an
    /// aborting failure brings the service back up before it is returned
    async fn restart_if_aborted(&self, result: Result<()>) -> Result<()> {
        if let Err(e) = &result {
            warn!("Restore aborted before replacing state ({}), restarting service", e);
            if let Err(start) = self.service.start().await {
                error!("Service did not start after aborted restore: {}", start);
            }
        }
        result
    }

    async fn start(&self) -> Result<()> {
        self.service.ensure_runtime().await?;
        self.service.start().await
    }

    /// Delete the live root, copy the safety copy back, start again
    async fn rollback(&self, attempt: &mut Attempt) -> Result<()> {
        let reason = attempt
            .failure
            .clone()
            .unwrap_or_else(|| "unknown failure".to_string());
        error!(
            "Restore failed ({}), rolling back from {}",
            reason,
            attempt.safety_copy.display()
        );

        if let Err(e) = self.service.stop().await {
            warn!("Stop before rollback failed: {}", e);
        }

        let (live, safety) = (self.jenkins.home.clone(), attempt.safety_copy.clone());
        let privileged = running_as_root();
        blocking(move || {
            remove_tree(&live)?;
            copy_tree(&safety, &live, privileged)
        })
        .await
        .map_err(|e| BackupError::RollbackFailed {
            safety_copy: attempt.safety_copy.clone(),
            reason: e.to_string(),
        })?;

        if let Err(e) = self.service.start().await {
            error!("Service did not start after rollback: {}", e);
            attempt.failure = Some(format!("{}; restart after rollback failed: {}", reason, e));
        }

        info!("Rolled back to the pre-restore state");
        Ok(())
    }
}

/// Next stage on success, ROLLBACK (recording the cause) on failure
fn advance(result: Result<()>, next: RestoreStage, attempt: &mut Attempt) -> RestoreStage {
    match result {
        Ok(()) => next,
        Err(e) => {
            let stage = attempt.stages.last().copied().unwrap_or(next);
            error!("Stage {} failed: {}", stage, e);
            attempt.failure = Some(format!("{}: {}", stage, e));
            RestoreStage::Rollback
        }
    }
}

/// Put a workspace member at `target`, replacing any existing file
async fn install_member(workspace: &Path, member: &str, target: &Path) -> Result<bool> {
    let src = workspace.join(member);
    if !src.is_file() {
        return Ok(false);
    }

    let (Some(dir), Some(name)) = (target.parent(), target.file_name()) else {
        return Err(BackupError::Config(format!(
            "invalid install path {}",
            target.display()
        )));
    };
    let (dir, name) = (dir.to_path_buf(), name.to_string_lossy().into_owned());

    blocking(move || {
        fs::create_dir_all(&dir)?;
        persist_file(&src, &dir, &name)
    })
    .await?;

    info!("Installed {}", target.display());
    Ok(true)
}
