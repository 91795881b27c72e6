//! Virtual host pool and allocation
//!
//! The pool is described by a small grammar: a comma-separated list where
//! `domains=` and `ips=` start a section and bare entries continue the
//! current one, e.g. `domains=*.sites.example.org,demo.example.org,ips=127.0.0.2,127.0.0.3`.
//! Entries before any section are classified by whether they parse as an IP.
//!
//! Allocation is a pure function of the pool, the set of hosts in use and a
//! hint. Domain entries are tried first in listed order, then IP aliases.
//! Every allocated host has the form `hostname:port`.

use crate::error::HostingError;
use std::fmt;
use std::net::IpAddr;
use tracing::warn;

/// Number of loopback aliases in the default pool
const DEFAULT_HOST_COUNT: u8 = 16;

/// Hint used when the caller supplies none
const DEFAULT_HINT: &str = "site";

/// Maximum hostname length (RFC 1035)
const MAX_HOSTNAME_LEN: usize = 253;

/// A single allocatable entry of the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEntry {
    /// `*.example.org`, stored as the domain suffix `example.org`
    Wildcard(String),
    /// A literal domain or IP alias
    Literal(String),
}

impl fmt::Display for HostEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostEntry::Wildcard(suffix) => write!(f, "*.{}", suffix),
            HostEntry::Literal(host) => f.write_str(host),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Domains,
    Ips,
    /// Entries following an unknown key are skipped
    Unknown,
}

/// The configured set of virtual hosts available to hosted sites
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPool {
    domains: Vec<HostEntry>,
    ips: Vec<HostEntry>,
    port: u16,
}

impl HostPool {
    /// Parse a pool description. Malformed entries are logged and skipped.
    pub fn parse(description: &str, port: u16) -> Self {
        let mut pool = Self {
            domains: Vec::new(),
            ips: Vec::new(),
            port,
        };
        let mut section: Option<Section> = None;

        let tokens = description
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|t| !t.is_empty());

        for token in tokens {
            let value = match token.split_once('=') {
                Some((key, value)) => {
                    section = Some(match key.trim().to_ascii_lowercase().as_str() {
                        "domains" => Section::Domains,
                        "ips" => Section::Ips,
                        other => {
                            warn!(key = other, "Unknown host pool key, skipping its entries");
                            Section::Unknown
                        }
                    });
                    value.trim()
                }
                None => token,
            };

            if value.is_empty() {
                continue;
            }

            match section {
                Some(Section::Domains) => pool.add_domain(value),
                Some(Section::Ips) => pool.add_ip(value),
                Some(Section::Unknown) => {
                    warn!(entry = value, "Skipping host pool entry under unknown key");
                }
                None => {
                    if value.parse::<IpAddr>().is_ok() {
                        pool.add_ip(value);
                    } else {
                        pool.add_domain(value);
                    }
                }
            }
        }

        if pool.is_empty() {
            warn!(description, "Host pool configuration yielded no usable hosts");
        }

        pool
    }

    /// Pool of loopback aliases `127.0.0.2` .. `127.0.0.17`
    pub fn default_loopback(port: u16) -> Self {
        let ips = (2..2 + DEFAULT_HOST_COUNT)
            .map(|last| HostEntry::Literal(format!("127.0.0.{}", last)))
            .collect();
        Self {
            domains: Vec::new(),
            ips,
            port,
        }
    }

    /// Build the pool from the optional `virtual_hosts` setting
    pub fn from_setting(virtual_hosts: Option<&str>, port: u16) -> Self {
        match virtual_hosts {
            Some(description) => Self::parse(description, port),
            None => Self::default_loopback(port),
        }
    }

    fn add_domain(&mut self, value: &str) {
        let domain = value.to_ascii_lowercase();
        match domain.matches('*').count() {
            0 if is_valid_hostname(&domain) => self.domains.push(HostEntry::Literal(domain)),
            1 => match domain.strip_prefix("*.") {
                Some(suffix) if is_valid_hostname(suffix) => {
                    self.domains.push(HostEntry::Wildcard(suffix.to_string()))
                }
                _ => warn!(entry = value, "Wildcard must be the leftmost label, skipping"),
            },
            _ => warn!(entry = value, "Malformed domain in host pool, skipping"),
        }
    }

    fn add_ip(&mut self, value: &str) {
        match value.parse::<IpAddr>() {
            Ok(IpAddr::V4(ip)) => self.ips.push(HostEntry::Literal(ip.to_string())),
            Ok(IpAddr::V6(ip)) => self.ips.push(HostEntry::Literal(format!("[{}]", ip))),
            Err(_) => warn!(entry = value, "Malformed IP address in host pool, skipping"),
        }
    }

    /// The hosting port appended to every allocated host
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty() && self.ips.is_empty()
    }

    /// Entries in allocation order
    pub fn entries(&self) -> impl Iterator<Item = &HostEntry> {
        self.domains.iter().chain(self.ips.iter())
    }

    /// Pick an unused host for a new site.
    ///
    /// A wildcard entry substitutes the hint for `*`; when that host is taken
    /// it tries `hint0`, `hint1`, ... until a free one is found. Literal
    /// entries are returned as-is when free.
    pub fn allocate<F>(&self, hint: &str, is_used: F) -> Result<String, HostingError>
    where
        F: Fn(&str) -> bool,
    {
        let label = normalize_hint(hint)?;

        for entry in self.entries() {
            match entry {
                HostEntry::Wildcard(suffix) => {
                    let mut candidate = format!("{}.{}:{}", label, suffix, self.port);
                    let mut n: u64 = 0;
                    while is_used(&candidate) {
                        candidate = format!("{}{}.{}:{}", label, n, suffix, self.port);
                        n += 1;
                    }
                    return Ok(candidate);
                }
                HostEntry::Literal(host) => {
                    let candidate = format!("{}:{}", host, self.port);
                    if !is_used(&candidate) {
                        return Ok(candidate);
                    }
                }
            }
        }

        Err(HostingError::NoHostsAvailable)
    }

    /// Whether `hostname` (without port) is one this pool could hand out
    pub fn matches_virtual_host(&self, hostname: &str) -> bool {
        let hostname = hostname.to_ascii_lowercase();
        self.entries().any(|entry| match entry {
            HostEntry::Literal(host) => *host == hostname,
            HostEntry::Wildcard(suffix) => hostname
                .strip_suffix(suffix.as_str())
                .and_then(|label| label.strip_suffix('.'))
                .is_some_and(|label| !label.is_empty()),
        })
    }
}

impl fmt::Display for HostPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries: Vec<String> = self.entries().map(|e| e.to_string()).collect();
        write!(f, "[{}] on port {}", entries.join(", "), self.port)
    }
}

/// Lower-case the hint, defaulting blank hints to `site`
fn normalize_hint(hint: &str) -> Result<String, HostingError> {
    let trimmed = hint.trim();
    if trimmed.is_empty() {
        return Ok(DEFAULT_HINT.to_string());
    }
    if !trimmed.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return Err(HostingError::InvalidHostHint(hint.to_string()));
    }
    Ok(trimmed.to_ascii_lowercase())
}

fn is_valid_hostname(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= MAX_HOSTNAME_LEN
        && !host.starts_with('.')
        && !host.ends_with('.')
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}
