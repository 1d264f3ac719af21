//! Website URL normalization for cross-record deduplication.
//!
//! Input data spells the same site many ways (`http://` vs `https://`,
//! `www.` prefixes, trailing slashes, tracking fragments). The normalized
//! form is the dedup fingerprint, so two records pointing at the same site
//! scrape it once.

use url::Url;

/// Normalize a website URL into a stable fingerprint. Returns `None` for
/// strings that do not parse as an http(s) URL even after prepending a
/// scheme.
pub fn normalize_website_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    // Absolute non-http URLs (mailto:, ftp:) are rejected outright;
    // scheme-relative strings get https prepended.
    let mut url = match Url::parse(trimmed) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            Url::parse(&format!("https://{trimmed}")).ok()?
        }
        Err(_) => return None,
    };
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }

    let host = url.host_str()?.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host).to_string();
    if host.is_empty() {
        return None;
    }
    url.set_host(Some(&host)).ok()?;

    url.set_fragment(None);
    // Default ports are already dropped by the parser; scheme differences
    // are not significant for identity.
    let _ = url.set_scheme("https");

    let mut normalized = url.to_string();
    while normalized.ends_with('/') {
        normalized.pop();
    }
    Some(normalized)
}
