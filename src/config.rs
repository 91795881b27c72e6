use crate::hosts::HostPool;
use crate::pool::PoolConfig;
use crate::proxy::ProxySettings;
use crate::site::{Mapping, SiteConfiguration};
use crate::workspace::{FsWorkspaceStore, WorkspaceAccess};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the hosting service
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Hosted site settings
    #[serde(default)]
    pub hosting: HostingConfig,

    /// Workspaces available to local mappings, by id
    #[serde(default)]
    pub workspaces: HashMap<String, WorkspaceConfig>,

    /// Site configurations loaded at startup
    #[serde(default)]
    pub sites: Vec<SiteEntry>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listen port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Token for the site API.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Maximum idle upstream connections per host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle upstream connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            admin_token: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HostingConfig {
    /// Host pool, e.g. `domains=*.sites.example.org,ips=127.0.0.2`.
    /// Defaults to the loopback aliases 127.0.0.2 - 127.0.0.17
    pub virtual_hosts: Option<String>,

    /// Port appended to every allocated host (default: the server port)
    pub port: Option<u16>,

    /// Upstream connect timeout in seconds (default: 10)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Time to wait for upstream response headers in seconds (default: 30)
    #[serde(default = "default_response_timeout")]
    pub response_timeout_secs: u64,

    /// Max-Forwards assumed when a request carries none (default: 5)
    #[serde(default = "default_max_forwards")]
    pub max_forwards: u32,
}

impl Default for HostingConfig {
    fn default() -> Self {
        Self {
            virtual_hosts: None,
            port: None,
            connect_timeout_secs: default_connect_timeout(),
            response_timeout_secs: default_response_timeout(),
            max_forwards: default_max_forwards(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkspaceConfig {
    /// Directory holding the workspace contents
    pub root: PathBuf,

    /// Users allowed to read this workspace
    #[serde(default)]
    pub users: Vec<String>,
}

/// A site configuration provisioned from the config file
#[derive(Debug, Deserialize, Clone)]
pub struct SiteEntry {
    /// Owning user
    pub user: String,

    /// Fixed id (default: generated)
    pub id: Option<String>,

    pub name: String,

    /// Workspace id
    pub workspace: String,

    #[serde(default)]
    pub host_hint: String,

    /// Start hosting immediately
    #[serde(default)]
    pub started: bool,

    #[serde(default)]
    pub mappings: Vec<Mapping>,
}

impl SiteEntry {
    pub fn to_configuration(&self) -> SiteConfiguration {
        let mut site = SiteConfiguration::new(&self.name, &self.workspace)
            .with_host_hint(&self.host_hint)
            .with_mappings(self.mappings.clone());
        site.id = self.id.clone().unwrap_or_default();
        site
    }

    fn validate(&self, index: usize, workspaces: &HashMap<String, WorkspaceConfig>) -> Vec<String> {
        let mut errors = Vec::new();
        let label = format!("sites[{}]", index);
        if self.user.trim().is_empty() {
            errors.push(format!("{}: user must not be empty", label));
        }
        if self.name.trim().is_empty() {
            errors.push(format!("{}: name must not be empty", label));
        }
        if !workspaces.contains_key(&self.workspace) {
            errors.push(format!("{}: unknown workspace '{}'", label, self.workspace));
        }
        errors
    }
}

fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_response_timeout() -> u64 {
    30
}

fn default_max_forwards() -> u32 {
    5
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.hosting.connect_timeout_secs == 0 {
            errors.push("hosting.connect_timeout_secs must be positive".to_string());
        }
        if self.hosting.response_timeout_secs == 0 {
            errors.push("hosting.response_timeout_secs must be positive".to_string());
        }
        if self.hosting.max_forwards < 2 {
            errors.push("hosting.max_forwards must be at least 2".to_string());
        }
        if self.host_pool().is_empty() {
            errors.push("hosting.virtual_hosts contains no usable hosts".to_string());
        }

        let mut ids = HashSet::new();
        for (index, site) in self.sites.iter().enumerate() {
            errors.extend(site.validate(index, &self.workspaces));
            if let Some(id) = &site.id {
                if !ids.insert((site.user.as_str(), id.as_str())) {
                    errors.push(format!("sites[{}]: duplicate id '{}' for user '{}'", index, id, site.user));
                }
            }
        }

        for (id, workspace) in &self.workspaces {
            if workspace.root.as_os_str().is_empty() {
                errors.push(format!("workspaces.{}: root must not be empty", id));
            }
        }

        if !errors.is_empty() {
            errors.sort();
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Port appended to allocated hosts
    pub fn hosting_port(&self) -> u16 {
        self.hosting.port.unwrap_or(self.server.port)
    }

    pub fn host_pool(&self) -> HostPool {
        HostPool::from_setting(self.hosting.virtual_hosts.as_deref(), self.hosting_port())
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_idle_per_host: self.server.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(self.server.pool_idle_timeout_secs),
            connect_timeout: Duration::from_secs(self.hosting.connect_timeout_secs),
        }
    }

    pub fn proxy_settings(&self) -> ProxySettings {
        ProxySettings {
            response_timeout: Duration::from_secs(self.hosting.response_timeout_secs),
            default_max_forwards: self.hosting.max_forwards,
        }
    }

    pub fn workspace_store(&self) -> FsWorkspaceStore {
        self.workspaces
            .iter()
            .fold(FsWorkspaceStore::new(), |store, (id, workspace)| {
                store.with_workspace(id, &workspace.root)
            })
    }

    pub fn workspace_access(&self) -> WorkspaceAccess {
        let mut access = WorkspaceAccess::new();
        for (id, workspace) in &self.workspaces {
            for user in &workspace.users {
                access.grant(id, user);
            }
        }
        access
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::AccessControl;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 9090
bind = "127.0.0.1"
admin_token = "secret"

[hosting]
virtual_hosts = "domains=*.sites.example.org,ips=127.0.0.2"
port = 80
response_timeout_secs = 5

[workspaces.ws1]
root = "/srv/ws1"
users = ["alice"]

[[sites]]
user = "alice"
name = "Demo"
workspace = "ws1"
host_hint = "demo"
started = true
mappings = [{ source = "/", target = "/projA" }, { source = "/lib", target = "http://cdn.example.org/lib" }]
"#;

        let config = Config::parse(toml).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.admin_token.as_deref(), Some("secret"));
        assert_eq!(config.hosting_port(), 80);
        assert_eq!(config.hosting.connect_timeout_secs, 10);
        assert_eq!(config.proxy_settings().response_timeout, Duration::from_secs(5));
        assert_eq!(config.sites.len(), 1);

        let site = config.sites[0].to_configuration();
        assert_eq!(site.host_hint, "demo");
        assert_eq!(site.mappings[1], Mapping::new("/lib", "http://cdn.example.org/lib"));
        assert!(config.sites[0].started);

        let pool = config.host_pool();
        assert_eq!(pool.allocate("demo", |_| false).unwrap(), "demo.sites.example.org:80");
    }

    #[test]
    fn test_default_config() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.hosting_port(), 8080);
        assert_eq!(config.hosting.max_forwards, 5);
        assert_eq!(config.pool_config().connect_timeout, Duration::from_secs(10));
        assert_eq!(
            config.host_pool().allocate("", |_| false).unwrap(),
            "127.0.0.2:8080"
        );
    }

    #[test]
    fn test_workspace_access_from_config() {
        let config = Config::parse(
            r#"
[workspaces.ws1]
root = "/srv/ws1"
users = ["alice", "bob"]

[workspaces.ws2]
root = "/srv/ws2"
"#,
        )
        .unwrap();

        let access = config.workspace_access();
        assert!(access.can_read("bob", "/workspace/ws1"));
        assert!(!access.can_read("alice", "/workspace/ws2"));
        assert_eq!(
            config.workspace_store().root("ws2"),
            Some(Path::new("/srv/ws2"))
        );
    }

    #[test]
    fn test_validate_multiple_errors() {
        let toml = r#"
[hosting]
virtual_hosts = "ips=not-an-ip"
max_forwards = 1

[[sites]]
user = ""
name = "Demo"
workspace = "missing"
"#;

        let err = Config::parse(toml).unwrap_err().to_string();
        assert!(err.contains("max_forwards"));
        assert!(err.contains("no usable hosts"));
        assert!(err.contains("user must not be empty"));
        assert!(err.contains("unknown workspace 'missing'"));
    }

    #[test]
    fn test_duplicate_site_ids_rejected() {
        let toml = r#"
[workspaces.ws1]
root = "/srv/ws1"

[[sites]]
user = "alice"
id = "blog"
name = "A"
workspace = "ws1"

[[sites]]
user = "alice"
id = "blog"
name = "B"
workspace = "ws1"
"#;

        let err = Config::parse(toml).unwrap_err().to_string();
        assert!(err.contains("duplicate id 'blog'"));
    }
}
