//! Next-page cursor resolution.
//!
//! Upstreams report the next page as `page_meta.next`, which may be an
//! absolute URL on whatever host served the response, a path rooted at the
//! server, or a path relative to the API root. The fetch loop only ever deals
//! with paths relative to its configured base URL, so the same cursor works
//! against production, staging or a local mirror.

use reqwest::Url;

use crate::error::ConfigError;

/// Segment that marks the API root when the base path does not match.
pub const DEFAULT_API_ROOT_MARKER: &str = "/api/data";

/// Resolves pagination cursors against a base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageResolver {
    base_url: String,
    base_path: String,
    marker: String,
}

impl PageResolver {
    pub fn new(base_url: &str, marker: &str) -> Result<Self, ConfigError> {
        let parsed = Url::parse(base_url.trim())
            .map_err(|error| ConfigError::invalid("base_url", error.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::invalid(
                "base_url",
                format!("unsupported scheme '{}'", parsed.scheme()),
            ));
        }

        let base_path = parsed.path().trim_end_matches('/').to_owned();
        let marker = marker.trim().trim_end_matches('/');
        let marker = if marker.is_empty() || marker.starts_with('/') {
            marker.to_owned()
        } else {
            format!("/{marker}")
        };

        Ok(Self {
            base_url: base_url.trim().trim_end_matches('/').to_owned(),
            base_path,
            marker,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL for a path relative to the base URL.
    pub fn absolute(&self, relative: &str) -> String {
        let relative = relative.trim();
        if relative.starts_with('/') || relative.is_empty() {
            format!("{}{relative}", self.base_url)
        } else {
            format!("{}/{relative}", self.base_url)
        }
    }

    /// Reduce a `page_meta.next` cursor to `/path?query` relative to the base
    /// URL. `current` is the relative path of the page that carried the
    /// cursor; it anchors query-only cursors such as `?offset=20`.
    pub fn resolve(&self, next: &str, current: &str) -> Option<String> {
        let next = next.trim();
        if next.is_empty() || next == "null" {
            return None;
        }

        if let Some(query) = next.strip_prefix('?') {
            let current_path = current.split('?').next().unwrap_or_default();
            return Some(format!("{}?{query}", ensure_leading_slash(current_path)));
        }

        let (path, query) = match Url::parse(next) {
            Ok(url) => (url.path().to_owned(), url.query().map(str::to_owned)),
            Err(_) => match next.split_once('?') {
                Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
                None => (next.to_owned(), None),
            },
        };

        let relative = if path.starts_with('/') {
            self.strip_api_root(&path)
        } else {
            // Already relative to the API root.
            ensure_leading_slash(path.trim_start_matches("./"))
        };

        Some(match query {
            Some(query) if !query.is_empty() => format!("{relative}?{query}"),
            _ => relative,
        })
    }

    fn strip_api_root(&self, path: &str) -> String {
        if let Some(rest) = strip_segment_prefix(path, &self.base_path) {
            return ensure_leading_slash(rest);
        }

        if !self.marker.is_empty() {
            for (index, _) in path.match_indices(self.marker.as_str()) {
                let rest = &path[index + self.marker.len()..];
                if rest.is_empty() || rest.starts_with('/') {
                    return ensure_leading_slash(rest);
                }
            }
        }

        path.to_owned()
    }
}

/// Convenience wrapper around [`PageResolver::resolve`].
pub fn resolve_next_page(next: &str, base_url: &str, current: &str) -> Option<String> {
    PageResolver::new(base_url, DEFAULT_API_ROOT_MARKER)
        .ok()?
        .resolve(next, current)
}

fn strip_segment_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    if prefix.is_empty() {
        return None;
    }
    let rest = path.strip_prefix(prefix)?;
    (rest.is_empty() || rest.starts_with('/')).then_some(rest)
}

fn ensure_leading_slash(path: &str) -> String {
    if path.starts_with('/') {
        path.to_owned()
    } else {
        format!("/{path}")
    }
}
