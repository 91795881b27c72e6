//! Sitehost - publish workspace folders as virtual-host sites
//!
//! This library provides a site hosting service that:
//! - Allocates a virtual host per running site from a pool of domains and IP aliases
//! - Keeps running sites in a concurrent registry, unique per host and per owner
//! - Resolves request paths against a site's mappings by longest prefix
//! - Serves mapped workspace files directly
//! - Reverse-proxies mapped remote URLs with loop prevention
//! - Exposes a JSON API to manage site configurations and their hosting state

pub mod admin;
pub mod config;
pub mod error;
pub mod hosts;
pub mod mapping;
pub mod pool;
pub mod proxy;
pub mod registry;
pub mod router;
pub mod server;
pub mod site;
pub mod workspace;
