// src/utils/url.rs

//! URL manipulation utilities.

use url::Url;

/// Resolve a potentially relative link against the page it appears on.
///
/// Only http(s) targets survive; fragments are dropped.
///
/// # Examples
/// ```
/// use bikeshare_ingest::utils::url::resolve;
///
/// assert_eq!(
///     resolve("https://example.com/path/", "page.html#top").as_deref(),
///     Some("https://example.com/path/page.html")
/// );
/// assert_eq!(resolve("https://example.com/", "mailto:x@example.com"), None);
/// ```
pub fn resolve(base: &str, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }
    let base = Url::parse(base).ok()?;
    let mut joined = base.join(href).ok()?;
    if !matches!(joined.scheme(), "http" | "https") {
        return None;
    }
    joined.set_fragment(None);
    Some(joined.to_string())
}

/// Canonical form used for visited-set membership.
///
/// Scheme and host are lower-cased by the parser, default ports and
/// fragments are removed, and an empty path becomes `/`.
pub fn normalize(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    // The parser already drops default ports and lower-cases the host.
    url.set_fragment(None);
    Some(url.to_string())
}

/// Extract the lower-cased host from a URL.
///
/// # Examples
/// ```
/// use bikeshare_ingest::utils::url::get_domain;
///
/// assert_eq!(
///     get_domain("https://Example.com/path"),
///     Some("example.com".to_string())
/// );
/// ```
pub fn get_domain(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
}

/// Whether two URLs share scheme, host and port.
pub fn same_origin(a: &str, b: &str) -> bool {
    match (Url::parse(a), Url::parse(b)) {
        (Ok(a), Ok(b)) => a.origin() == b.origin(),
        _ => false,
    }
}

/// Path component of a URL (`/` when absent).
pub fn path_of(url: &str) -> String {
    Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| "/".to_string())
}

/// Whether the URL path ends with one of `extensions` (case-insensitive).
pub fn has_extension(url: &str, extensions: &[String]) -> bool {
    let path = path_of(url).to_ascii_lowercase();
    extensions
        .iter()
        .any(|ext| path.ends_with(&ext.to_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(
            normalize("HTTPS://Example.COM:443/a#frag").as_deref(),
            Some("https://example.com/a")
        );
        assert_eq!(
            normalize("http://example.com").as_deref(),
            Some("http://example.com/")
        );
        assert_eq!(
            normalize("http://example.com:8080/x").as_deref(),
            Some("http://example.com:8080/x")
        );
        assert_eq!(normalize("ftp://example.com/"), None);
    }

    #[test]
    fn test_same_origin() {
        assert!(same_origin("https://a.test/x", "https://a.test/y?q=1"));
        assert!(!same_origin("https://a.test/x", "http://a.test/x"));
        assert!(!same_origin("https://a.test/x", "https://b.test/x"));
    }

    #[test]
    fn test_has_extension() {
        let exts = vec![".pdf".to_string(), ".png".to_string()];
        assert!(has_extension("https://a.test/docs/Report.PDF", &exts));
        assert!(!has_extension("https://a.test/docs/report.html", &exts));
        assert!(!has_extension("https://a.test/?file=x.pdf", &exts));
    }
}
