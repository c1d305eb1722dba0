//! Navigation allow-list
//!
//! Patterns are host names (`example.com` also matches its subdomains),
//! explicit wildcards (`*.example.com`, subdomains only) or full URL prefixes
//! (`https://example.com/docs`). The deny-list wins over the allow-list; an
//! empty allow-list allows every host.

use url::Url;

use crate::config::Config;

/// Browser-internal pages that are always reachable
const INTERNAL_URLS: &[&str] = &["about:blank", "chrome://new-tab-page/", "chrome://newtab/"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NavigationPolicy {
    allowed: Vec<String>,
    prohibited: Vec<String>,
}

impl NavigationPolicy {
    pub fn new(allowed: Vec<String>, prohibited: Vec<String>) -> Self {
        let normalize = |items: Vec<String>| -> Vec<String> {
            items
                .into_iter()
                .map(|p| p.trim().to_ascii_lowercase())
                .filter(|p| !p.is_empty())
                .collect()
        };
        Self {
            allowed: normalize(allowed),
            prohibited: normalize(prohibited),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.allowed_domains.clone(), config.prohibited_domains.clone())
    }

    /// Policy allowing everything
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// `Ok(())` when navigating to `url` is permitted, otherwise the reason
    pub fn check(&self, url: &str) -> Result<(), String> {
        let url = url.trim();
        if INTERNAL_URLS.contains(&url) {
            return Ok(());
        }

        let parsed = Url::parse(url).map_err(|e| format!("invalid URL {}: {}", url, e))?;
        let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();

        if let Some(pattern) = self
            .prohibited
            .iter()
            .find(|p| matches_pattern(p, &host, &parsed))
        {
            return Err(format!("{} matches prohibited pattern {}", url, pattern));
        }

        if self.allowed.is_empty() {
            return Ok(());
        }

        if matches!(parsed.scheme(), "data" | "blob") {
            return Err(format!("{} uses a scheme outside the allow-list", url));
        }

        if self
            .allowed
            .iter()
            .any(|p| matches_pattern(p, &host, &parsed))
        {
            Ok(())
        } else {
            Err(format!("{} is not in the allowed domains", url))
        }
    }

    pub fn is_allowed(&self, url: &str) -> bool {
        self.check(url).is_ok()
    }
}

fn matches_pattern(pattern: &str, host: &str, url: &Url) -> bool {
    if pattern.contains("://") {
        return matches_url_prefix(pattern, url);
    }
    if host.is_empty() {
        return false;
    }
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return host.ends_with(&format!(".{}", suffix));
    }
    host == pattern || host.ends_with(&format!(".{}", pattern))
}

/// Same scheme, host and port; path prefix only on a segment boundary
fn matches_url_prefix(pattern: &str, url: &Url) -> bool {
    let Ok(prefix) = Url::parse(pattern) else {
        return false;
    };
    if prefix.scheme() != url.scheme()
        || prefix.host_str() != url.host_str()
        || prefix.port_or_known_default() != url.port_or_known_default()
    {
        return false;
    }

    let base = prefix.path();
    let path = url.path();
    if base.ends_with('/') {
        return path.starts_with(base);
    }
    path == base || path.strip_prefix(base).is_some_and(|rest| rest.starts_with('/'))
}
