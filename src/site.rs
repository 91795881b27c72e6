//! Site configurations and the store that persists them
//!
//! A site configuration names a workspace and an ordered list of mappings
//! from request path prefixes to workspace paths or remote URLs. Configurations
//! are owned per user; running instances live in the [`crate::registry`].

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single mapping rule of a site configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Mapping {
    /// Path prefix under the virtual host, e.g. `/assets`
    #[serde(alias = "source")]
    pub source: String,
    /// Workspace-relative path (`/projA/web`) or absolute URL (`http://cdn.example.org/lib`)
    #[serde(alias = "target")]
    pub target: String,
}

impl Mapping {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// Durable description of a site that can be hosted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SiteConfiguration {
    /// Unique per owning user
    pub id: String,
    /// Display name
    pub name: String,
    /// Advisory hint used to derive a friendly host name
    #[serde(default)]
    pub host_hint: String,
    /// Workspace the local mappings resolve against
    #[serde(rename = "Workspace")]
    pub workspace_id: String,
    /// Ordered mapping list
    #[serde(default)]
    pub mappings: Vec<Mapping>,
}

impl SiteConfiguration {
    pub fn new(name: &str, workspace_id: &str) -> Self {
        Self {
            id: String::new(),
            name: name.to_string(),
            host_hint: String::new(),
            workspace_id: workspace_id.to_string(),
            mappings: Vec::new(),
        }
    }

    /// Set the host hint (builder pattern)
    pub fn with_host_hint(mut self, hint: &str) -> Self {
        self.host_hint = hint.to_string();
        self
    }

    /// Set the mappings (builder pattern)
    pub fn with_mappings(mut self, mappings: Vec<Mapping>) -> Self {
        self.mappings = mappings;
        self
    }
}

/// Partial update of a site configuration, as sent by API clients
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SiteUpdate {
    pub name: Option<String>,
    pub host_hint: Option<String>,
    pub workspace: Option<String>,
    pub mappings: Option<Vec<Mapping>>,
}

impl SiteUpdate {
    /// Copy the present properties onto `target`.
    ///
    /// The name is only copied when `copy_name` is set. Fails if the result
    /// lacks a name or a workspace.
    pub fn apply(&self, target: &mut SiteConfiguration, copy_name: bool) -> Result<(), String> {
        if copy_name {
            if let Some(name) = &self.name {
                target.name = name.clone();
            }
        }
        if let Some(hint) = &self.host_hint {
            target.host_hint = hint.clone();
        }
        if let Some(workspace) = &self.workspace {
            target.workspace_id = workspace.clone();
        }
        if let Some(mappings) = &self.mappings {
            target.mappings = mappings.clone();
        }

        if target.name.is_empty() {
            return Err("Name was not specified".to_string());
        }
        if target.workspace_id.is_empty() {
            return Err("Workspace was not specified".to_string());
        }
        Ok(())
    }
}

/// Persistence boundary for site configurations
pub trait SiteStore: Send + Sync {
    /// All configurations owned by `user_id`
    fn list(&self, user_id: &str) -> Vec<SiteConfiguration>;

    /// A single configuration
    fn get(&self, user_id: &str, site_id: &str) -> Option<SiteConfiguration>;

    /// Store a new configuration, assigning it a fresh id when `site.id` is empty
    fn insert(&self, user_id: &str, site: SiteConfiguration) -> SiteConfiguration;

    /// Overwrite an existing configuration (or create it under its own id)
    fn save(&self, user_id: &str, site: SiteConfiguration);

    /// Remove a configuration, returning whether it existed
    fn delete(&self, user_id: &str, site_id: &str) -> bool;
}

/// In-memory [`SiteStore`]
#[derive(Default)]
pub struct InMemorySiteStore {
    sites: DashMap<String, BTreeMap<String, SiteConfiguration>>,
}

impl InMemorySiteStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Smallest `<user>-<n>` id not present in `existing`
fn next_site_id(user_id: &str, existing: &BTreeMap<String, SiteConfiguration>) -> String {
    (0u64..)
        .map(|n| format!("{}-{}", user_id, n))
        .find(|candidate| !existing.contains_key(candidate))
        .unwrap_or_else(|| format!("{}-{}", user_id, uuid::Uuid::new_v4()))
}

impl SiteStore for InMemorySiteStore {
    fn list(&self, user_id: &str) -> Vec<SiteConfiguration> {
        self.sites
            .get(user_id)
            .map(|sites| sites.values().cloned().collect())
            .unwrap_or_default()
    }

    fn get(&self, user_id: &str, site_id: &str) -> Option<SiteConfiguration> {
        self.sites
            .get(user_id)
            .and_then(|sites| sites.get(site_id).cloned())
    }

    fn insert(&self, user_id: &str, mut site: SiteConfiguration) -> SiteConfiguration {
        let mut sites = self.sites.entry(user_id.to_string()).or_default();
        if site.id.is_empty() {
            site.id = next_site_id(user_id, &sites);
        }
        sites.insert(site.id.clone(), site.clone());
        site
    }

    fn save(&self, user_id: &str, site: SiteConfiguration) {
        self.sites
            .entry(user_id.to_string())
            .or_default()
            .insert(site.id.clone(), site);
    }

    fn delete(&self, user_id: &str, site_id: &str) -> bool {
        self.sites
            .get_mut(user_id)
            .map(|mut sites| sites.remove(site_id).is_some())
            .unwrap_or(false)
    }
}
