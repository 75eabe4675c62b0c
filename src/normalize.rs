use std::collections::HashSet;

use url::{form_urlencoded, Url};

/// Query keys that only identify the referrer and never the article.
const TRACKING_KEYS: &[&str] = &[
    "fbclid", "gclid", "yclid", "dclid", "msclkid", "igshid", "mc_cid", "mc_eid", "_ga",
];
const TRACKING_PREFIXES: &[&str] = &["utm_"];

/// Canonicalize and de-duplicate candidate URLs, keeping first-seen order.
///
/// Blank and unparseable entries (and non-http schemes) are discarded. The
/// output is a fixed point: `normalize(&normalize(x)) == normalize(x)`.
pub fn normalize<S: AsRef<str>>(urls: &[S]) -> Vec<String> {
    let mut seen = HashSet::new();
    urls.iter()
        .filter_map(|raw| canonicalize(raw.as_ref()))
        .filter(|url| seen.insert(url.clone()))
        .collect()
}

/// Canonical form used both for batch de-duplication and ledger matching.
pub fn canonicalize(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut url = Url::parse(trimmed).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);

    // Kept segments are never re-encoded.
    let query = url.query().map(|q| {
        q.split('&')
            .filter(|seg| !seg.is_empty() && !is_tracking_segment(seg))
            .collect::<Vec<_>>()
            .join("&")
    });
    url.set_query(query.as_deref().filter(|q| !q.is_empty()));
    Some(url.to_string())
}

fn is_tracking_segment(segment: &str) -> bool {
    form_urlencoded::parse(segment.as_bytes())
        .next()
        .is_some_and(|(key, _)| is_tracking_key(&key))
}

fn is_tracking_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    TRACKING_KEYS.contains(&key.as_str()) || TRACKING_PREFIXES.iter().any(|p| key.starts_with(p))
}
