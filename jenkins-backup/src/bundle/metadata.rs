//! The `METADATA` member: one `key=value` pair per line.

use super::TIMESTAMP_FORMAT;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

const KEY_TIMESTAMP: &str = "timestamp";
const KEY_JENKINS_HOME: &str = "jenkins_home";
const KEY_WAR: &str = "war";
const KEY_UNIT_FILE: &str = "unit_file";
const KEY_HOSTNAME: &str = "hostname";
const KEY_JENKINS_VERSION: &str = "jenkins_version";
const KEY_JAVA_VERSION: &str = "java_version";
const KEY_TOOL_VERSION: &str = "tool_version";

#[derive(Error, Debug, PartialEq)]
pub enum MetadataError {
    #[error("malformed metadata line: {0}")]
    MalformedLine(String),

    #[error("missing {0}")]
    MissingKey(&'static str),

    #[error("bad timestamp {value}: {source}")]
    BadTimestamp {
        value: String,
        source: chrono::ParseError,
    },
}

/// Free-form description of where and how a bundle was taken
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub created_at: DateTime<Utc>,

    /// Live state root the state archive was captured from
    pub jenkins_home: PathBuf,

    /// Source of `payload/jenkins.war`, when included
    pub war_path: Option<PathBuf>,

    /// Source of `payload/jenkins.service`, when included
    pub unit_file: Option<PathBuf>,

    pub hostname: String,
    pub jenkins_version: Option<String>,
    pub java_version: Option<String>,
    pub tool_version: String,

    /// Keys this version does not know about
    pub extra: BTreeMap<String, String>,
}

impl Metadata {
    /// Render as `key=value` lines
    pub fn render(&self) -> String {
        let mut lines = vec![
            (KEY_TIMESTAMP, self.created_at.format(TIMESTAMP_FORMAT).to_string()),
            (KEY_JENKINS_HOME, self.jenkins_home.display().to_string()),
        ];
        if let Some(war) = &self.war_path {
            lines.push((KEY_WAR, war.display().to_string()));
        }
        if let Some(unit) = &self.unit_file {
            lines.push((KEY_UNIT_FILE, unit.display().to_string()));
        }
        lines.push((KEY_HOSTNAME, self.hostname.clone()));
        if let Some(v) = &self.jenkins_version {
            lines.push((KEY_JENKINS_VERSION, v.clone()));
        }
        if let Some(v) = &self.java_version {
            lines.push((KEY_JAVA_VERSION, v.clone()));
        }
        lines.push((KEY_TOOL_VERSION, self.tool_version.clone()));

        let mut out = String::new();
        for (key, value) in lines {
            out.push_str(&format!("{}={}\n", key, sanitize(&value)));
        }
        for (key, value) in &self.extra {
            out.push_str(&format!("{}={}\n", key, sanitize(value)));
        }
        out
    }

    /// Parse `key=value` lines. `timestamp` and `jenkins_home` are required.
    pub fn parse(text: &str) -> Result<Self, MetadataError> {
        let mut values: BTreeMap<String, String> = BTreeMap::new();

        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| MetadataError::MalformedLine(line.to_string()))?;
            values.insert(key.trim().to_string(), value.to_string());
        }

        let timestamp = values
            .remove(KEY_TIMESTAMP)
            .ok_or(MetadataError::MissingKey(KEY_TIMESTAMP))?;
        let created_at = NaiveDateTime::parse_from_str(&timestamp, TIMESTAMP_FORMAT)
            .map_err(|source| MetadataError::BadTimestamp {
                value: timestamp.clone(),
                source,
            })?
            .and_utc();
        let jenkins_home = values
            .remove(KEY_JENKINS_HOME)
            .map(PathBuf::from)
            .ok_or(MetadataError::MissingKey(KEY_JENKINS_HOME))?;

        Ok(Self {
            created_at,
            jenkins_home,
            war_path: values.remove(KEY_WAR).map(PathBuf::from),
            unit_file: values.remove(KEY_UNIT_FILE).map(PathBuf::from),
            hostname: values.remove(KEY_HOSTNAME).unwrap_or_default(),
            jenkins_version: values.remove(KEY_JENKINS_VERSION),
            java_version: values.remove(KEY_JAVA_VERSION),
            tool_version: values.remove(KEY_TOOL_VERSION).unwrap_or_default(),
            extra: values,
        })
    }
}

/// Values are single-line
fn sanitize(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}
