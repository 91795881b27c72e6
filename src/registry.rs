//! Registry of running hosted sites
//!
//! Sites are indexed twice: by allocated host (the routing hot path) and by
//! `(configuration id, user id)`. Reads go straight to the concurrent maps.
//! Mutations are serialized through a single mutex so that allocate-then-insert
//! and lookup-then-remove each happen as one step.
//!
//! Each hosted site is published as an `Arc`, fully built before insertion, so
//! a reader sees either no site or a complete one.

use crate::error::HostingError;
use crate::hosts::HostPool;
use crate::mapping::{MappingTable, Resolution};
use crate::site::SiteConfiguration;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

/// A running instance of a site configuration
#[derive(Debug, Clone)]
pub struct HostedSite {
    /// Allocated `hostname:port`, unique across the registry
    pub host: String,
    pub site_configuration_id: String,
    pub user_id: String,
    pub workspace_id: String,
    /// Display name at start time
    pub name: String,
    /// Snapshot of the configuration's mappings taken at start
    pub mappings: MappingTable,
    /// Origin of the authoring server, used for edit back-links
    pub edit_server_url: String,
    /// Externally reachable URL of the site
    pub url: String,
}

impl HostedSite {
    /// Resolve a request path against this site's mapping snapshot
    pub fn resolve(&self, path: &str, query: Option<&str>) -> Option<Resolution> {
        self.mappings.resolve(path, query)
    }
}

type OwnerKey = (String, String);

/// Authoritative table of running hosted sites
pub struct SiteRegistry {
    pool: HostPool,
    by_host: DashMap<String, Arc<HostedSite>>,
    by_owner: DashMap<OwnerKey, String>,
    mutation: Mutex<()>,
}

impl SiteRegistry {
    pub fn new(pool: HostPool) -> Self {
        Self {
            pool,
            by_host: DashMap::new(),
            by_owner: DashMap::new(),
            mutation: Mutex::new(()),
        }
    }

    /// The host pool sites are allocated from
    pub fn pool(&self) -> &HostPool {
        &self.pool
    }

    /// Start hosting `config` for `user_id`.
    ///
    /// Starting a site that is already running returns the running instance
    /// unchanged. On failure nothing is inserted.
    pub fn start(
        &self,
        config: &SiteConfiguration,
        user_id: &str,
        edit_server_url: &str,
        scheme: &str,
    ) -> Result<Arc<HostedSite>, HostingError> {
        let _guard = self.mutation.lock();

        let key = (config.id.clone(), user_id.to_string());
        if let Some(existing) = self.find_by_owner(&key) {
            debug!(
                host = %existing.host,
                site = %config.id,
                user = user_id,
                "Site already running"
            );
            return Ok(existing);
        }

        let host = self
            .pool
            .allocate(&config.host_hint, |candidate| self.by_host.contains_key(candidate))?;

        let site = Arc::new(HostedSite {
            host: host.clone(),
            site_configuration_id: config.id.clone(),
            user_id: user_id.to_string(),
            workspace_id: config.workspace_id.clone(),
            name: config.name.clone(),
            mappings: MappingTable::from_mappings(&config.mappings),
            edit_server_url: edit_server_url.trim_end_matches('/').to_string(),
            url: format!("{}://{}", scheme, host),
        });

        let previous = self.by_host.insert(host.clone(), Arc::clone(&site));
        assert!(previous.is_none(), "allocated host {} was already in use", host);
        self.by_owner.insert(key, host.clone());

        info!(
            host = %host,
            site = %config.id,
            user = user_id,
            mappings = site.mappings.len(),
            "Started hosted site"
        );
        Ok(site)
    }

    /// Stop the site started from `configuration_id` by `user_id`.
    ///
    /// Returns the removed site, or `None` if it was not running. The host is
    /// free for reallocation as soon as this returns.
    pub fn stop(&self, configuration_id: &str, user_id: &str) -> Option<Arc<HostedSite>> {
        let _guard = self.mutation.lock();

        let key = (configuration_id.to_string(), user_id.to_string());
        let (_, host) = self.by_owner.remove(&key)?;
        let removed = self.by_host.remove(&host);
        assert!(
            removed.is_some(),
            "host {} indexed for {:?} but not registered",
            host,
            key
        );

        info!(host = %host, site = configuration_id, user = user_id, "Stopped hosted site");
        removed.map(|(_, site)| site)
    }

    pub fn lookup_by_host(&self, host: &str) -> Option<Arc<HostedSite>> {
        self.by_host.get(host).map(|entry| Arc::clone(entry.value()))
    }

    pub fn lookup_by_configuration(
        &self,
        configuration_id: &str,
        user_id: &str,
    ) -> Option<Arc<HostedSite>> {
        self.find_by_owner(&(configuration_id.to_string(), user_id.to_string()))
    }

    pub fn is_hosted(&self, host: &str) -> bool {
        self.by_host.contains_key(host)
    }

    /// All running sites, ordered by host
    pub fn list(&self) -> Vec<Arc<HostedSite>> {
        let mut sites: Vec<Arc<HostedSite>> = self
            .by_host
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        sites.sort_by(|a, b| a.host.cmp(&b.host));
        sites
    }

    pub fn len(&self) -> usize {
        self.by_host.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_host.is_empty()
    }

    fn find_by_owner(&self, key: &OwnerKey) -> Option<Arc<HostedSite>> {
        let host = self.by_owner.get(key).map(|entry| entry.value().clone())?;
        self.lookup_by_host(&host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site::Mapping;
    use std::collections::HashSet;
    use std::sync::Barrier;
    use std::thread;

    fn config(id: &str, hint: &str) -> SiteConfiguration {
        let mut config = SiteConfiguration::new(id, "ws1")
            .with_host_hint(hint)
            .with_mappings(vec![Mapping::new("/", "/projA")]);
        config.id = id.to_string();
        config
    }

    fn loopback_registry(count: usize) -> SiteRegistry {
        let ips: Vec<String> = (2..2 + count).map(|n| format!("127.0.0.{}", n)).collect();
        SiteRegistry::new(HostPool::parse(&format!("ips={}", ips.join(",")), 8080))
    }

    #[test]
    fn test_start_allocates_host() {
        let registry = loopback_registry(2);
        let site = registry.start(&config("s1", ""), "alice", "http://ide:8080", "http").unwrap();

        assert_eq!(site.host, "127.0.0.2:8080");
        assert_eq!(site.url, "http://127.0.0.2:8080");
        assert_eq!(site.workspace_id, "ws1");
        assert!(registry.is_hosted("127.0.0.2:8080"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_start_is_idempotent() {
        let registry = loopback_registry(2);
        let first = registry.start(&config("s1", ""), "alice", "", "http").unwrap();
        let second = registry.start(&config("s1", ""), "alice", "", "http").unwrap();

        assert_eq!(first.host, second.host);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_same_configuration_different_users() {
        let registry = loopback_registry(2);
        let a = registry.start(&config("s1", ""), "alice", "", "http").unwrap();
        let b = registry.start(&config("s1", ""), "bob", "", "http").unwrap();

        assert_ne!(a.host, b.host);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_stop_releases_host() {
        let registry = loopback_registry(1);
        let site = registry.start(&config("s1", ""), "alice", "", "http").unwrap();

        assert!(registry.start(&config("s2", ""), "bob", "", "http").is_err());

        let stopped = registry.stop("s1", "alice").unwrap();
        assert_eq!(stopped.host, site.host);
        assert!(registry.lookup_by_host(&site.host).is_none());
        assert!(registry.lookup_by_configuration("s1", "alice").is_none());

        let reused = registry.start(&config("s2", ""), "bob", "", "http").unwrap();
        assert_eq!(reused.host, site.host);
    }

    #[test]
    fn test_stop_not_running_is_noop() {
        let registry = loopback_registry(1);
        assert!(registry.stop("s1", "alice").is_none());

        registry.start(&config("s1", ""), "alice", "", "http").unwrap();
        assert!(registry.stop("s1", "bob").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_exhausted_pool_leaves_no_state() {
        let registry = loopback_registry(1);
        registry.start(&config("s1", ""), "alice", "", "http").unwrap();

        let err = registry.start(&config("s2", ""), "alice", "", "http").unwrap_err();
        assert_eq!(err, HostingError::NoHostsAvailable);
        assert!(registry.lookup_by_configuration("s2", "alice").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_invalid_hint_leaves_no_state() {
        let registry = SiteRegistry::new(HostPool::parse("domains=*.example.org", 80));
        let err = registry.start(&config("s1", "bad hint"), "alice", "", "http").unwrap_err();

        assert!(matches!(err, HostingError::InvalidHostHint(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_mappings_are_snapshotted() {
        let registry = loopback_registry(1);
        let mut cfg = config("s1", "");
        let site = registry.start(&cfg, "alice", "", "http").unwrap();

        cfg.mappings = vec![Mapping::new("/", "/other")];
        let again = registry.start(&cfg, "alice", "", "http").unwrap();

        assert_eq!(
            again.resolve("/index.html", None),
            Some(Resolution::Local("/projA/index.html".to_string()))
        );
        assert!(Arc::ptr_eq(&site, &again));
    }

    #[test]
    fn test_wildcard_hosts_stay_unique() {
        let registry = SiteRegistry::new(HostPool::parse("domains=*.example.org", 8080));
        let hosts: Vec<String> = (0..5)
            .map(|n| {
                registry
                    .start(&config(&format!("s{}", n), "foo"), "alice", "", "https")
                    .unwrap()
                    .host
                    .clone()
            })
            .collect();

        assert_eq!(hosts[0], "foo.example.org:8080");
        assert_eq!(hosts[1], "foo0.example.org:8080");
        assert_eq!(hosts[4], "foo3.example.org:8080");

        registry.stop("s1", "alice");
        let next = registry.start(&config("s9", "foo"), "alice", "", "http").unwrap();
        assert_eq!(next.host, "foo0.example.org:8080");
    }

    #[test]
    fn test_uniqueness_across_start_stop_sequence() {
        let registry = loopback_registry(4);
        let users = ["alice", "bob"];

        for round in 0..20 {
            let id = format!("s{}", round % 3);
            let user = users[round % 2];
            if round % 4 == 3 {
                registry.stop(&id, user);
            } else {
                let _ = registry.start(&config(&id, ""), user, "", "http");
            }

            let sites = registry.list();
            let hosts: HashSet<&str> = sites.iter().map(|s| s.host.as_str()).collect();
            let owners: HashSet<(&str, &str)> = sites
                .iter()
                .map(|s| (s.site_configuration_id.as_str(), s.user_id.as_str()))
                .collect();
            assert_eq!(hosts.len(), sites.len());
            assert_eq!(owners.len(), sites.len());
        }
    }

    #[test]
    fn test_concurrent_reads_see_complete_sites() {
        const READERS: usize = 8;

        let registry = Arc::new(loopback_registry(1));
        let barrier = Arc::new(Barrier::new(READERS + 1));

        let readers: Vec<_> = (0..READERS)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    let mut seen = false;
                    for _ in 0..10_000 {
                        if let Some(site) = registry.lookup_by_host("127.0.0.2:8080") {
                            assert_eq!(site.site_configuration_id, "s1");
                            assert_eq!(site.user_id, "alice");
                            assert_eq!(site.workspace_id, "ws1");
                            assert_eq!(site.mappings.len(), 1);
                            seen = true;
                        } else {
                            assert!(!seen, "site disappeared after being observed");
                        }
                    }
                })
            })
            .collect();

        barrier.wait();
        registry.start(&config("s1", ""), "alice", "", "http").unwrap();

        for reader in readers {
            reader.join().unwrap();
        }
        assert!(registry.is_hosted("127.0.0.2:8080"));
    }
}
