//! Configuration management for jenkins-backup.
//!
//! Built once at startup from layered sources: built-in defaults, an optional
//! TOML file, then `.env` / `JENKINS_BACKUP_*` environment variables
//! (`JENKINS_BACKUP_BACKUP__KEEP=3` sets `backup.keep`). Command-line flags
//! are applied on top by the binary.

use crate::utils::errors::{BackupError, Result};
use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "JENKINS_BACKUP";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub jenkins: JenkinsConfig,
    pub backup: BackupConfig,
    pub restore: RestoreConfig,
    pub runtime: RuntimeConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JenkinsConfig {
    /// Live state root (JENKINS_HOME)
    pub home: PathBuf,

    /// Installed application package
    pub war_path: PathBuf,

    /// systemd unit descriptor
    pub unit_file: PathBuf,

    /// Base URL of the Jenkins web UI / REST API
    pub url: String,

    /// API user for quiesce hooks and plugin inventory
    #[serde(default)]
    pub user: Option<String>,

    /// API token paired with `user`
    #[serde(default)]
    pub api_token: Option<String>,

    /// systemd service name
    pub service_name: String,

    /// Identity that owns JENKINS_HOME after a restore (None skips the ownership fix)
    #[serde(default)]
    pub service_user: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Destination directory for bundles and digests
    pub dir: PathBuf,

    /// Working directory for the lock file, staging and scratch workspaces
    pub work_dir: PathBuf,

    /// Number of bundles retained
    pub keep: usize,

    /// Ask Jenkins to quiet down while archiving
    pub quiesce: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreConfig {
    /// Endpoint polled after START
    pub health_url: String,

    pub health_timeout_secs: u64,

    pub poll_interval_secs: u64,

    /// Connect timeout for every HTTP call
    pub connect_timeout_secs: u64,

    /// Overall timeout for every HTTP call
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Runtime binary Jenkins needs (probed with `-version`)
    pub binary: String,

    /// Command run when the runtime is missing
    #[serde(default)]
    pub install_command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            jenkins: JenkinsConfig {
                home: PathBuf::from("/var/lib/jenkins"),
                war_path: PathBuf::from("/usr/share/java/jenkins.war"),
                unit_file: PathBuf::from("/lib/systemd/system/jenkins.service"),
                url: "http://localhost:8080".to_string(),
                user: None,
                api_token: None,
                service_name: "jenkins".to_string(),
                service_user: Some("jenkins".to_string()),
            },
            backup: BackupConfig {
                dir: PathBuf::from("/var/backups/jenkins"),
                work_dir: PathBuf::from("/var/tmp/jenkins-backup"),
                keep: 7,
                quiesce: true,
            },
            restore: RestoreConfig {
                health_url: "http://localhost:8080/login".to_string(),
                health_timeout_secs: 300,
                poll_interval_secs: 5,
                connect_timeout_secs: 5,
                request_timeout_secs: 10,
            },
            runtime: RuntimeConfig {
                binary: "java".to_string(),
                install_command: vec![
                    "apt-get".to_string(),
                    "install".to_string(),
                    "-y".to_string(),
                    "openjdk-17-jre-headless".to_string(),
                ],
            },
            log: LogConfig {
                level: "info".to_string(),
            },
        }
    }
}

impl Config {
    /// Load configuration from defaults, an optional TOML file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::layered(path, Environment::with_prefix(ENV_PREFIX))
    }

    fn layered(path: Option<&Path>, env: Environment) -> Result<Self> {
        let defaults = config::Config::try_from(&Config::default()).map_err(config_error)?;
        let mut builder = config::Config::builder().add_source(defaults);

        if let Some(path) = path {
            if !path.exists() {
                return Err(BackupError::FileNotFound(path.display().to_string()));
            }
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }

        let config: Config = builder
            .add_source(
                env.prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(config_error)?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipelines cannot work with
    pub fn validate(&self) -> Result<()> {
        if !self.jenkins.home.is_absolute() {
            return Err(BackupError::Config(format!(
                "jenkins.home must be absolute, got {}",
                self.jenkins.home.display()
            )));
        }
        if self.jenkins.home.parent().is_none() {
            return Err(BackupError::Config("jenkins.home cannot be /".to_string()));
        }
        if self.backup.keep == 0 {
            return Err(BackupError::Config("backup.keep must be at least 1".to_string()));
        }
        if self.restore.poll_interval_secs == 0 {
            return Err(BackupError::Config(
                "restore.poll_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl RestoreConfig {
    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// HTTP client with the configured connect/overall timeouts
    pub fn http_client(&self) -> Result<reqwest::Client> {
        Ok(reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .timeout(Duration::from_secs(self.request_timeout_secs))
            .build()?)
    }
}

fn config_error(e: config::ConfigError) -> BackupError {
    BackupError::Config(e.to_string())
}
