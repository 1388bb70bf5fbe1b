//! Bundle naming, layout and listing.
//!
//! A bundle is a zstd-compressed tar named `jenkins-backup-<TOKEN>.tar.zst`
//! where `<TOKEN>` is the UTC creation time as `YYYYMMDDTHHMMSSZ`, so names
//! sort in creation order. Its sibling `<name>.sha256` holds the digest.
//!
//! ```text
//! METADATA                 key=value record
//! plugins.txt              optional, "<name>:<version>" per line
//! payload/jenkins.war      optional
//! payload/jenkins.service  optional
//! jenkins_home.tar         required
//! ```

pub mod archive;
pub mod digest;
pub mod manifest;
pub mod metadata;
pub mod retention;

use chrono::{DateTime, NaiveDateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};

pub const BUNDLE_PREFIX: &str = "jenkins-backup-";
pub const BUNDLE_SUFFIX: &str = ".tar.zst";
pub const DIGEST_SUFFIX: &str = ".sha256";

pub const METADATA_MEMBER: &str = "METADATA";
pub const PLUGINS_MEMBER: &str = "plugins.txt";
pub const PAYLOAD_DIR: &str = "payload";
pub const WAR_MEMBER: &str = "payload/jenkins.war";
pub const UNIT_MEMBER: &str = "payload/jenkins.service";
pub const STATE_ARCHIVE_MEMBER: &str = "jenkins_home.tar";

/// `YYYYMMDDTHHMMSSZ`
pub const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Timestamp token for a point in time
pub fn timestamp_token(at: DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Identity of a bundle, derived from its creation time
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BundleName {
    token: String,
}

impl BundleName {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            token: timestamp_token(at),
        }
    }

    /// Parse `jenkins-backup-<TOKEN>.tar.zst`
    pub fn parse(file_name: &str) -> Option<Self> {
        let token = file_name
            .strip_prefix(BUNDLE_PREFIX)?
            .strip_suffix(BUNDLE_SUFFIX)?;
        NaiveDateTime::parse_from_str(token, TIMESTAMP_FORMAT).ok()?;
        Some(Self {
            token: token.to_string(),
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        NaiveDateTime::parse_from_str(&self.token, TIMESTAMP_FORMAT)
            .ok()
            .map(|t| t.and_utc())
    }

    pub fn file_name(&self) -> String {
        format!("{}{}{}", BUNDLE_PREFIX, self.token, BUNDLE_SUFFIX)
    }

    pub fn digest_file_name(&self) -> String {
        format!("{}{}", self.file_name(), DIGEST_SUFFIX)
    }
}

/// Sidecar digest path of a bundle file
pub fn digest_path(bundle: &Path) -> PathBuf {
    let mut name = bundle.as_os_str().to_owned();
    name.push(DIGEST_SUFFIX);
    PathBuf::from(name)
}

/// A bundle found in the backup directory
#[derive(Debug, Clone)]
pub struct BundleInfo {
    pub name: BundleName,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub has_digest: bool,
}

/// List bundles in `dir`, newest first. A missing directory holds no bundles.
pub fn list_bundles(dir: &Path) -> std::io::Result<Vec<BundleInfo>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut bundles = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str().and_then(BundleName::parse) else {
            continue;
        };

        let path = entry.path();
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }

        bundles.push(BundleInfo {
            has_digest: digest_path(&path).is_file(),
            size_bytes: metadata.len(),
            name,
            path,
        });
    }

    bundles.sort_by(|a, b| b.name.cmp(&a.name));

    Ok(bundles)
}
