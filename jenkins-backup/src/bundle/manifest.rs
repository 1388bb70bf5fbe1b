//! Plugin manifest (`plugins.txt`).
//!
//! Records every installed plugin as `<name>:<version>`, sorted by name, so
//! the plugin set of a bundle can be diffed against a live instance.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginManifest {
    /// Plugin short name to version
    pub plugins: BTreeMap<String, String>,
}

impl PluginManifest {
    pub fn from_pairs<I, N, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (N, V)>,
        N: Into<String>,
        V: Into<String>,
    {
        Self {
            plugins: pairs
                .into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        }
    }

    pub fn render(&self) -> String {
        self.plugins
            .iter()
            .map(|(name, version)| format!("{}:{}\n", name, version))
            .collect()
    }

    /// Lines without a `:` are skipped
    pub fn parse(text: &str) -> Self {
        Self::from_pairs(text.lines().filter_map(|line| {
            let (name, version) = line.trim().split_once(':')?;
            Some((name.to_string(), version.to_string()))
        }))
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}
