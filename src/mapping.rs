//! Path mapping resolution for hosted sites
//!
//! A site's mappings form a table keyed by normalized source prefix. A request
//! path is resolved by trying its segment prefixes from longest to shortest;
//! the first hit wins and the remaining segments are appended to the target.

use crate::site::Mapping;
use hyper::Uri;
use std::collections::HashMap;
use tracing::warn;

/// Where a mapping sends matching requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingTarget {
    /// Workspace-relative path, always starting with `/`
    Local(String),
    /// Absolute URL of a remote origin
    Remote(Uri),
}

/// Result of resolving a request path against a site
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Serve this workspace-relative path
    Local(String),
    /// Proxy to this absolute URL
    Remote(Uri),
}

/// Immutable mapping table of a hosted site
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingTable {
    entries: HashMap<String, MappingTarget>,
}

impl MappingTable {
    /// Build the table from a configuration's mapping list.
    ///
    /// Later mappings with the same source replace earlier ones. Targets that
    /// look like URLs but do not parse are logged and dropped.
    pub fn from_mappings(mappings: &[Mapping]) -> Self {
        let mut entries = HashMap::with_capacity(mappings.len());
        for mapping in mappings {
            match parse_target(&mapping.target) {
                Some(target) => {
                    entries.insert(normalize_path(&mapping.source), target);
                }
                None => {
                    warn!(
                        source = %mapping.source,
                        url = %mapping.target,
                        "Ignoring mapping with malformed target URL"
                    );
                }
            }
        }
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Target registered for an exact (normalized) source prefix
    pub fn get(&self, source: &str) -> Option<&MappingTarget> {
        self.entries.get(&normalize_path(source))
    }

    /// Resolve `request_path` using the most specific matching mapping.
    ///
    /// `request_path` is the percent-encoded request path. Sources and local
    /// targets work on the decoded segments; remote targets get the segments
    /// as they arrived. `query` is the inbound query string; it is carried over
    /// to remote targets that have no query of their own. Returns `None` when
    /// nothing matches (there is no implicit root mapping) or a segment
    /// decodes to `..`, contains `/` or is not UTF-8.
    pub fn resolve(&self, request_path: &str, query: Option<&str>) -> Option<Resolution> {
        let mut encoded: Vec<&str> = Vec::new();
        let mut decoded: Vec<String> = Vec::new();
        for segment in request_path.split('/').filter(|s| !s.is_empty()) {
            let plain = urlencoding::decode(segment).ok()?;
            if plain == "." {
                continue;
            }
            if plain == ".." || plain.contains(['/', '\0']) {
                return None;
            }
            encoded.push(segment);
            decoded.push(plain.into_owned());
        }

        for i in (0..=decoded.len()).rev() {
            let prefix = format!("/{}", decoded[..i].join("/"));
            if let Some(target) = self.entries.get(&prefix) {
                return match target {
                    MappingTarget::Local(base) => {
                        Some(Resolution::Local(append_segments(base, &decoded[i..])))
                    }
                    MappingTarget::Remote(url) => {
                        let rest = &encoded[i..];
                        let trailing_slash = !rest.is_empty() && request_path.ends_with('/');
                        remote_url(url, rest, trailing_slash, query).map(Resolution::Remote)
                    }
                };
            }
        }

        None
    }
}

fn parse_target(target: &str) -> Option<MappingTarget> {
    if !target.contains("://") {
        return Some(MappingTarget::Local(normalize_path(target)));
    }
    let uri: Uri = target.trim().parse().ok()?;
    if uri.scheme().is_none() || uri.authority().is_none() {
        return None;
    }
    Some(MappingTarget::Remote(uri))
}

/// Collapse empty and `.` segments, producing `/a/b` (or `/` for the root)
pub fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    format!("/{}", segments.join("/"))
}

fn append_segments(base: &str, rest: &[String]) -> String {
    if rest.is_empty() {
        return base.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), rest.join("/"))
}

fn remote_url(base: &Uri, rest: &[&str], trailing_slash: bool, query: Option<&str>) -> Option<Uri> {
    let base_path = base.path().trim_end_matches('/');
    let mut path = if rest.is_empty() {
        if base_path.is_empty() {
            "/".to_string()
        } else {
            base.path().to_string()
        }
    } else {
        format!("{}/{}", base_path, rest.join("/"))
    };
    if trailing_slash {
        path.push('/');
    }

    let path_and_query = match base.query().or(query) {
        Some(q) if !q.is_empty() => format!("{}?{}", path, q),
        _ => path,
    };

    let scheme = base.scheme()?.clone();
    let authority = base.authority()?.clone();
    Uri::builder()
        .scheme(scheme)
        .authority(authority)
        .path_and_query(path_and_query.as_str())
        .build()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(mappings: &[(&str, &str)]) -> MappingTable {
        let mappings: Vec<Mapping> = mappings.iter().map(|(s, t)| Mapping::new(*s, *t)).collect();
        MappingTable::from_mappings(&mappings)
    }

    fn local(path: &str) -> Option<Resolution> {
        Some(Resolution::Local(path.to_string()))
    }

    fn remote(url: &str) -> Option<Resolution> {
        Some(Resolution::Remote(url.parse().unwrap()))
    }

    #[test]
    fn test_longest_prefix_wins() {
        let t = table(&[("/", "/projA"), ("/assets", "/shared/assets")]);

        assert_eq!(t.resolve("/assets/logo.png", None), local("/shared/assets/logo.png"));
        assert_eq!(t.resolve("/docs/readme.md", None), local("/projA/docs/readme.md"));
        assert_eq!(t.resolve("/", None), local("/projA"));
    }

    #[test]
    fn test_no_root_mapping() {
        let t = table(&[("/assets", "/shared/assets")]);

        assert_eq!(t.resolve("/", None), None);
        assert_eq!(t.resolve("/docs/readme.md", None), None);
    }

    #[test]
    fn test_sources_match_whole_segments() {
        let t = table(&[("/asset", "/a")]);

        assert_eq!(t.resolve("/assets/x.png", None), None);
        assert_eq!(t.resolve("/asset/x.png", None), local("/a/x.png"));
    }

    #[test]
    fn test_sources_are_normalized() {
        let t = table(&[("assets/", "/shared//assets/"), ("", "projA")]);

        assert_eq!(t.resolve("/assets/logo.png", None), local("/shared/assets/logo.png"));
        assert_eq!(t.resolve("/index.html", None), local("/projA/index.html"));
        assert!(t.get("/assets").is_some());
    }

    #[test]
    fn test_root_target() {
        let t = table(&[("/", "/")]);
        assert_eq!(t.resolve("/projA/index.html", None), local("/projA/index.html"));
    }

    #[test]
    fn test_remote_target() {
        let t = table(&[("/", "/projA"), ("/lib", "http://cdn.example.org/libs/v1")]);

        assert_eq!(
            t.resolve("/lib/jquery.js", None),
            remote("http://cdn.example.org/libs/v1/jquery.js")
        );
        assert_eq!(t.resolve("/lib", None), remote("http://cdn.example.org/libs/v1"));
    }

    #[test]
    fn test_remote_target_at_origin_root() {
        let t = table(&[("/", "http://example.org:8081")]);

        assert_eq!(t.resolve("/", None), remote("http://example.org:8081/"));
        assert_eq!(t.resolve("/a/b/", None), remote("http://example.org:8081/a/b/"));
    }

    #[test]
    fn test_remote_query_handling() {
        let t = table(&[("/api", "http://api.example.org"), ("/fixed", "http://x.org/f?v=1")]);

        assert_eq!(
            t.resolve("/api/users", Some("page=2")),
            remote("http://api.example.org/users?page=2")
        );
        assert_eq!(t.resolve("/fixed", Some("page=2")), remote("http://x.org/f?v=1"));
    }

    #[test]
    fn test_dot_segments() {
        let t = table(&[("/", "/projA"), ("/assets", "/shared")]);

        assert_eq!(t.resolve("/./assets/./a.css", None), local("/shared/a.css"));
        assert_eq!(t.resolve("/assets/../../secret", None), None);
    }

    #[test]
    fn test_percent_encoded_paths() {
        let t = table(&[
            ("/", "/projA"),
            ("/my docs", "/shared/docs"),
            ("/lib", "http://cdn.example.org/libs"),
        ]);

        assert_eq!(t.resolve("/read%20me.md", None), local("/projA/read me.md"));
        assert_eq!(t.resolve("/caf%C3%A9.html", None), local("/projA/café.html"));
        assert_eq!(t.resolve("/my%20docs/a.txt", None), local("/shared/docs/a.txt"));
        assert_eq!(
            t.resolve("/lib/a%20b.js", None),
            remote("http://cdn.example.org/libs/a%20b.js")
        );
    }

    #[test]
    fn test_encoded_traversal_rejected() {
        let t = table(&[("/", "/projA")]);

        assert_eq!(t.resolve("/%2e%2e/secret", None), None);
        assert_eq!(t.resolve("/a%2F..%2Fb", None), None);
        assert_eq!(t.resolve("/%FF", None), None);
        assert_eq!(t.resolve("/%2e/index.html", None), local("/projA/index.html"));
    }

    #[test]
    fn test_malformed_url_target_dropped() {
        let t = table(&[("/", "/projA"), ("/bad", "http://exa mple.org/")]);

        assert_eq!(t.len(), 1);
        assert_eq!(t.resolve("/bad/x", None), local("/projA/bad/x"));
    }

    #[test]
    fn test_later_mapping_replaces_earlier() {
        let t = table(&[("/", "/old"), ("/", "/new")]);
        assert_eq!(t.resolve("/x", None), local("/new/x"));
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("a//b/./c/"), "/a/b/c");
    }
}
