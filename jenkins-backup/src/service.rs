//! Control of the live Jenkins service through systemd.
//!
//! Also owns the host-level repairs a restore needs: installing the runtime
//! when it is missing and handing JENKINS_HOME back to the service identity.

use crate::config::{JenkinsConfig, RuntimeConfig};
use crate::fs::metadata::running_as_root;
use crate::fs::walker::walk_tree;
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{Pid, User};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn};

/// Grace period between SIGTERM and SIGKILL for leftover processes
const TERMINATE_GRACE: Duration = Duration::from_secs(10);

#[async_trait]
pub trait ServiceController: Send + Sync {
    /// Fail unless this process may stop the service and restore ownership
    fn check_privileges(&self) -> Result<()>;

    /// Stop the service. Not an error when it is already stopped.
    async fn stop(&self) -> Result<()>;

    async fn start(&self) -> Result<()>;

    /// Pick up a reinstalled unit descriptor
    async fn reload_units(&self) -> Result<()>;

    /// Install the runtime the service needs when it is missing
    async fn ensure_runtime(&self) -> Result<()>;

    /// Hand `root` recursively to the service identity, creating it if needed
    async fn fix_ownership(&self, root: &Path) -> Result<()>;
}

/// systemd-managed Jenkins
pub struct SystemdService {
    service_name: String,
    service_user: Option<String>,
    war_path: PathBuf,
    runtime: RuntimeConfig,
}

impl SystemdService {
    pub fn new(jenkins: &JenkinsConfig, runtime: &RuntimeConfig) -> Self {
        Self {
            service_name: jenkins.service_name.clone(),
            service_user: jenkins.service_user.clone(),
            war_path: jenkins.war_path.clone(),
            runtime: runtime.clone(),
        }
    }

    /// Terminate processes still running the war after `systemctl stop`
    async fn terminate_leftovers(&self) {
        let pattern = self.war_path.display().to_string();
        let pids = match run("pgrep", &["-f", &pattern]).await {
            Ok(out) => parse_pids(&out),
            // pgrep exits 1 when nothing matches
            Err(_) => return,
        };
        if pids.is_empty() {
            return;
        }

        warn!(?pids, "Service processes still resident after stop, sending SIGTERM");
        for pid in &pids {
            let _ = kill(*pid, Signal::SIGTERM);
        }

        let deadline = tokio::time::Instant::now() + TERMINATE_GRACE;
        while tokio::time::Instant::now() < deadline {
            if pids.iter().all(|pid| kill(*pid, None).is_err()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        for pid in &pids {
            if kill(*pid, None).is_ok() {
                warn!(pid = pid.as_raw(), "Sending SIGKILL");
                let _ = kill(*pid, Signal::SIGKILL);
            }
        }
    }
}

#[async_trait]
impl ServiceController for SystemdService {
    fn check_privileges(&self) -> Result<()> {
        if running_as_root() {
            return Ok(());
        }
        Err(BackupError::PermissionDenied(format!(
            "restoring {} needs root to control the service and keep file ownership",
            self.service_name
        )))
    }

    async fn stop(&self) -> Result<()> {
        info!(service = %self.service_name, "Stopping service");
        if let Err(e) = run("systemctl", &["stop", &self.service_name]).await {
            warn!(service = %self.service_name, error = %e, "systemctl stop failed, continuing");
        }
        self.terminate_leftovers().await;
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        info!(service = %self.service_name, "Starting service");
        run("systemctl", &["start", &self.service_name]).await?;
        Ok(())
    }

    async fn reload_units(&self) -> Result<()> {
        run("systemctl", &["daemon-reload"]).await?;
        Ok(())
    }

    async fn ensure_runtime(&self) -> Result<()> {
        if runtime_version(&self.runtime.binary).await.is_some() {
            return Ok(());
        }

        let Some((program, args)) = self.runtime.install_command.split_first() else {
            return Err(BackupError::FileNotFound(format!(
                "runtime `{}` is missing and no install command is configured",
                self.runtime.binary
            )));
        };

        warn!(runtime = %self.runtime.binary, "Runtime missing, installing");
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run(program, &args).await?;

        if runtime_version(&self.runtime.binary).await.is_none() {
            return Err(BackupError::command(
                self.runtime.install_command.join(" "),
                format!("`{}` still not runnable after install", self.runtime.binary),
            ));
        }
        Ok(())
    }

    async fn fix_ownership(&self, root: &Path) -> Result<()> {
        let Some(name) = self.service_user.as_deref() else {
            return Ok(());
        };
        self.check_privileges()?;

        let user = match lookup_user(name)? {
            Some(user) => user,
            None => {
                info!(user = name, "Creating service user");
                let home = root.display().to_string();
                run(
                    "useradd",
                    &["--system", "--home-dir", &home, "--shell", "/usr/sbin/nologin", name],
                )
                .await?;
                lookup_user(name)?.ok_or_else(|| {
                    BackupError::command("useradd", format!("user {} still missing", name))
                })?
            }
        };

        let root = root.to_path_buf();
        let (uid, gid) = (user.uid.as_raw(), user.gid.as_raw());
        let changed = tokio::task::spawn_blocking(move || chown_tree(&root, uid, gid))
            .await
            .map_err(|e| BackupError::Io(std::io::Error::other(e)))??;
        info!(user = name, entries = changed, "Ownership fixed");
        Ok(())
    }
}

fn lookup_user(name: &str) -> Result<Option<User>> {
    User::from_name(name).map_err(|e| BackupError::Io(std::io::Error::from(e)))
}

/// lchown every entry of a tree
pub fn chown_tree(root: &Path, uid: u32, gid: u32) -> std::io::Result<usize> {
    let entries = walk_tree(root)?;
    for entry in &entries {
        std::os::unix::fs::lchown(&entry.path, Some(uid), Some(gid))?;
    }
    Ok(entries.len())
}

/// First line of `<binary> -version`, or None when the runtime is not runnable.
///
/// Java prints its version to stderr.
pub async fn runtime_version(binary: &str) -> Option<String> {
    let output = Command::new(binary).arg("-version").output().await.ok()?;
    if !output.status.success() {
        return None;
    }
    let text = if output.stderr.is_empty() {
        output.stdout
    } else {
        output.stderr
    };
    String::from_utf8_lossy(&text)
        .lines()
        .next()
        .map(|l| l.trim().to_string())
}

/// Run a command to completion, returning stdout
async fn run(program: &str, args: &[&str]) -> Result<String> {
    let command_line = format!("{} {}", program, args.join(" "));
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| BackupError::command(&command_line, e))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(BackupError::command(
            command_line,
            format!("{}: {}", output.status, stderr.trim()),
        ));
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

fn parse_pids(output: &str) -> Vec<Pid> {
    let own = std::process::id() as i32;
    output
        .lines()
        .filter_map(|l| l.trim().parse::<i32>().ok())
        .filter(|pid| *pid != own)
        .map(Pid::from_raw)
        .collect()
}
