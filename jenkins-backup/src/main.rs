//! jenkins-backup - Main entry point

use anyhow::Context;
use clap::{Parser, Subcommand};
use jenkins_backup::bundle::archive::list_members;
use jenkins_backup::bundle::digest::{DigestStatus, DigestVerifier, Sha256Verifier};
use jenkins_backup::bundle::{list_bundles, STATE_ARCHIVE_MEMBER};
use jenkins_backup::executor::backup::BackupProducer;
use jenkins_backup::executor::restore::RestoreExecutor;
use jenkins_backup::health::HttpHealthChecker;
use jenkins_backup::jenkins::{render_health_table, JenkinsClient};
use jenkins_backup::service::SystemdService;
use jenkins_backup::utils::{self, format::format_bytes, shutdown::wait_for_signal};
use jenkins_backup::{BackupError, Config};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a bundle of the live Jenkins state
    Backup {
        /// Backup directory (overrides config)
        #[arg(long, value_name = "DIR")]
        dest: Option<PathBuf>,

        /// Number of bundles to keep (overrides config)
        #[arg(long)]
        keep: Option<usize>,

        /// Do not ask Jenkins to quiet down while archiving
        #[arg(long)]
        no_quiesce: bool,
    },

    /// Replace the live Jenkins state with a bundle, rolling back if unhealthy
    Restore {
        bundle: PathBuf,

        /// Endpoint polled after start (overrides config)
        #[arg(long, value_name = "URL")]
        health_url: Option<String>,

        /// Seconds to wait for a healthy service (overrides config)
        #[arg(long, value_name = "SECS")]
        health_timeout: Option<u64>,
    },

    /// Check a bundle against its digest file and layout
    Verify { bundle: PathBuf },

    /// List bundles in the backup directory, newest first
    List {
        /// Backup directory (overrides config)
        #[arg(long, value_name = "DIR")]
        dest: Option<PathBuf>,
    },

    /// Print the plugin health table of the live instance
    Plugins,

    /// Print the effective configuration as TOML
    ShowConfig,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::from(2);
        }
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    if let Err(e) = utils::logger::init(log_level) {
        eprintln!("Error: {:#}", e);
        return ExitCode::from(1);
    }

    tracing::debug!("jenkins-backup v{}", env!("CARGO_PKG_VERSION"));

    match run(args.command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

/// Defaults, file and environment, then command-line overrides
fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = Config::load(args.config.as_deref()).context("loading configuration")?;

    match &args.command {
        Command::Backup {
            dest,
            keep,
            no_quiesce,
        } => {
            if let Some(dest) = dest {
                config.backup.dir = dest.clone();
            }
            if let Some(keep) = keep {
                config.backup.keep = *keep;
            }
            if *no_quiesce {
                config.backup.quiesce = false;
            }
        }
        Command::Restore {
            health_url,
            health_timeout,
            ..
        } => {
            if let Some(url) = health_url {
                config.restore.health_url = url.clone();
            }
            if let Some(secs) = health_timeout {
                config.restore.health_timeout_secs = *secs;
            }
        }
        Command::List { dest: Some(dest) } => config.backup.dir = dest.clone(),
        _ => {}
    }

    config.validate().context("validating overrides")?;
    Ok(config)
}

async fn run(command: Command, config: Config) -> Result<(), BackupError> {
    match command {
        Command::Backup { .. } => backup(&config).await,
        Command::Restore { bundle, .. } => restore(&config, &bundle).await,
        Command::Verify { bundle } => verify(&bundle).await,
        Command::List { .. } => list(&config),
        Command::Plugins => plugins(&config).await,
        Command::ShowConfig => show_config(config),
    }
}

async fn backup(config: &Config) -> Result<(), BackupError> {
    let client = JenkinsClient::new(config.restore.http_client()?, &config.jenkins);
    let producer = BackupProducer::new(config, Some(client));

    // Dropping the pipeline on a signal releases the lock and staging directory
    tokio::select! {
        report = producer.run() => {
            let report = report?;
            println!("{}", report.bundle.display());
            Ok(())
        }
        signal = wait_for_signal() => {
            tracing::warn!("Backup aborted by {:?}", signal);
            Err(BackupError::Interrupted)
        }
    }
}

async fn restore(config: &Config, bundle: &Path) -> Result<(), BackupError> {
    let client = config.restore.http_client()?;
    let executor = RestoreExecutor::new(
        config,
        Box::new(SystemdService::new(&config.jenkins, &config.runtime)),
        Box::new(HttpHealthChecker::new(client, config.restore.health_url.clone())),
    );

    let report = executor.run(bundle).await?;
    println!("Restored {}", report.bundle.display());
    println!("Safety copy: {}", report.safety_copy.display());
    Ok(())
}

async fn verify(bundle: &Path) -> Result<(), BackupError> {
    if !bundle.is_file() {
        return Err(BackupError::FileNotFound(bundle.display().to_string()));
    }

    let path = bundle.to_path_buf();
    let (status, members) = tokio::task::spawn_blocking(move || {
        let status = Sha256Verifier.verify(&path)?;
        let members = list_members(&path)?;
        Ok::<_, BackupError>((status, members))
    })
    .await
    .map_err(|e| BackupError::Io(std::io::Error::other(e)))??;

    if !members.iter().any(|m| m == STATE_ARCHIVE_MEMBER) {
        return Err(BackupError::MissingMember {
            bundle: bundle.to_path_buf(),
            member: STATE_ARCHIVE_MEMBER.to_string(),
        });
    }

    match status {
        DigestStatus::Verified(hex) => println!("OK {}  {}", hex, bundle.display()),
        DigestStatus::Unverified => println!("UNVERIFIED (no digest file) {}", bundle.display()),
    }
    for member in members {
        println!("  {}", member);
    }
    Ok(())
}

fn list(config: &Config) -> Result<(), BackupError> {
    let bundles = list_bundles(&config.backup.dir)?;
    if bundles.is_empty() {
        println!("No bundles in {}", config.backup.dir.display());
        return Ok(());
    }

    for bundle in bundles {
        println!(
            "{}  {:>10}  {}",
            bundle.name.token(),
            format_bytes(bundle.size_bytes),
            if bundle.has_digest { "sha256" } else { "no digest" }
        );
    }
    Ok(())
}

async fn plugins(config: &Config) -> Result<(), BackupError> {
    let client = JenkinsClient::new(config.restore.http_client()?, &config.jenkins);
    let plugins = client.plugins().await?;
    print!("{}", render_health_table(&plugins));
    Ok(())
}

fn show_config(mut config: Config) -> Result<(), BackupError> {
    if config.jenkins.api_token.is_some() {
        config.jenkins.api_token = Some("********".to_string());
    }
    let text = toml::to_string_pretty(&config).map_err(|e| BackupError::Config(e.to_string()))?;
    print!("{}", text);
    Ok(())
}
