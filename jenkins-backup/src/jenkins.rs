//! Jenkins REST client: quiesce hooks, version and plugin inventory.

use crate::bundle::manifest::PluginManifest;
use crate::config::JenkinsConfig;
use crate::utils::errors::Result;
use reqwest::{Method, RequestBuilder};
use serde::Deserialize;
use tracing::debug;

const PLUGINS_PATH: &str = "/pluginManager/api/json?depth=1";

/// An installed plugin as reported by the plugin manager
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PluginInfo {
    pub short_name: String,
    #[serde(default)]
    pub long_name: Option<String>,
    pub version: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub has_update: bool,
}

impl PluginInfo {
    /// 100 enabled and current, 50 enabled with an update pending, 0 disabled
    pub fn health_score(&self) -> u8 {
        match (self.enabled, self.has_update) {
            (false, _) => 0,
            (true, true) => 50,
            (true, false) => 100,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PluginList {
    plugins: Vec<PluginInfo>,
}

pub struct JenkinsClient {
    client: reqwest::Client,
    base_url: String,
    user: Option<String>,
    api_token: Option<String>,
}

impl JenkinsClient {
    pub fn new(client: reqwest::Client, config: &JenkinsConfig) -> Self {
        Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            user: config.user.clone(),
            api_token: config.api_token.clone(),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.user {
            Some(user) => builder.basic_auth(user, self.api_token.as_deref()),
            None => builder,
        }
    }

    /// Stop scheduling new builds (the quiesce hook)
    pub async fn quiet_down(&self) -> Result<()> {
        self.request(Method::POST, "/quietDown")
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Resume scheduling (the resume hook)
    pub async fn cancel_quiet_down(&self) -> Result<()> {
        self.request(Method::POST, "/cancelQuietDown")
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Version from the `X-Jenkins` response header
    pub async fn version(&self) -> Result<Option<String>> {
        let resp = self.request(Method::GET, "/login").send().await?;
        let version = resp
            .headers()
            .get("x-jenkins")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        debug!(?version, "Jenkins version probed");
        Ok(version)
    }

    /// Installed plugins, sorted by short name
    pub async fn plugins(&self) -> Result<Vec<PluginInfo>> {
        let list: PluginList = self
            .request(Method::GET, PLUGINS_PATH)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let mut plugins = list.plugins;
        plugins.sort_by(|a, b| a.short_name.cmp(&b.short_name));
        Ok(plugins)
    }
}

/// `plugins.txt` content for an inventory
pub fn plugin_manifest(plugins: &[PluginInfo]) -> PluginManifest {
    PluginManifest::from_pairs(
        plugins
            .iter()
            .map(|p| (p.short_name.clone(), p.version.clone())),
    )
}

/// Fixed-width table: ID, name, version, health score
pub fn render_health_table(plugins: &[PluginInfo]) -> String {
    let rows: Vec<[String; 4]> = plugins
        .iter()
        .map(|p| {
            [
                p.short_name.clone(),
                p.long_name.clone().unwrap_or_else(|| p.short_name.clone()),
                p.version.clone(),
                p.health_score().to_string(),
            ]
        })
        .collect();

    let header = ["ID", "NAME", "VERSION", "HEALTH"].map(String::from);
    let mut widths = header.clone().map(|h| h.len());
    for row in &rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.len());
        }
    }

    std::iter::once(&header)
        .chain(rows.iter())
        .map(|row| {
            format!(
                "{:<w0$}  {:<w1$}  {:<w2$}  {:>w3$}\n",
                row[0],
                row[1],
                row[2],
                row[3],
                w0 = widths[0],
                w1 = widths[1],
                w2 = widths[2],
                w3 = widths[3],
            )
        })
        .collect()
}
