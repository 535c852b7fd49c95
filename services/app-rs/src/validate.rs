//! URL validation and custom-alias checking.

use std::sync::OnceLock;

use regex::Regex;
use url::Url;

use crate::error::{ServiceError, ServiceResult};
use crate::store::UrlStore;

pub const MAX_URL_BYTES: usize = 2_048;

/// One grammar for aliases and short codes: 3-30 of alnum, `_`, `-`.
pub fn code_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{3,30}$").unwrap())
}

pub fn is_valid_short_code(code: &str) -> bool {
    code_pattern().is_match(code)
}

/// Validate and canonicalize a long URL.
///
/// Scheme and host are lower-cased and default ports stripped, so the
/// content hash of two spellings of the same target agrees.
pub fn validate_url(raw: &str) -> ServiceResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ServiceError::InvalidUrl("empty URL".to_string()));
    }
    if trimmed.len() > MAX_URL_BYTES {
        return Err(ServiceError::InvalidUrl(format!(
            "URL exceeds {MAX_URL_BYTES} bytes"
        )));
    }

    let parsed =
        Url::parse(trimmed).map_err(|e| ServiceError::InvalidUrl(format!("parse error: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        other => {
            return Err(ServiceError::InvalidUrl(format!(
                "unsupported scheme '{other}'"
            )))
        }
    }
    if parsed.host_str().is_none() {
        return Err(ServiceError::InvalidUrl("URL has no host".to_string()));
    }

    // Url's serialization already lower-cases scheme and host and drops
    // default ports (http:80, https:443).
    Ok(parsed.to_string())
}

/// Validate a user-supplied alias against the grammar. Case is preserved.
pub fn validate_alias(alias: &str) -> ServiceResult<String> {
    let alias = alias.trim();
    if !code_pattern().is_match(alias) {
        return Err(ServiceError::InvalidAlias(
            "aliases are 3-30 characters of letters, digits, '_' or '-'".to_string(),
        ));
    }
    Ok(alias.to_string())
}

/// Ordered candidate transforms tried when an alias is taken.
fn candidate_aliases(base: &str) -> Vec<String> {
    let mut out = Vec::new();
    for suffix in ["1", "2", "3", "123"] {
        out.push(format!("{base}{suffix}"));
    }
    for year in ["2024", "24"] {
        out.push(format!("{base}{year}"));
    }
    for prefix in ["my", "get", "go"] {
        out.push(format!("{prefix}{base}"));
    }
    for suffix in ["url", "link", "now"] {
        out.push(format!("{base}{suffix}"));
    }
    for sep in ["_1", "-1", "_url", "-link"] {
        out.push(format!("{base}{sep}"));
    }
    out
}

/// Collect up to five grammar-valid, unclaimed alternatives for a taken
/// alias, probing the store for each candidate.
pub async fn suggest_aliases(store: &UrlStore, base: &str) -> Vec<String> {
    let mut suggestions = Vec::with_capacity(5);
    for candidate in candidate_aliases(base) {
        if suggestions.len() >= 5 {
            break;
        }
        if !code_pattern().is_match(&candidate) {
            continue;
        }
        match store.short_code_exists(&candidate).await {
            Ok(false) => suggestions.push(candidate),
            Ok(true) => {}
            Err(e) => {
                tracing::warn!(error = %e, "suggestion probe failed, stopping early");
                break;
            }
        }
    }
    suggestions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_and_normalizes_http_urls() {
        let sanitized = validate_url("HTTPS://Example.COM:443/Path?q=1").unwrap();
        assert_eq!(sanitized, "https://example.com/Path?q=1");
    }

    #[test]
    fn keeps_explicit_nondefault_ports() {
        let sanitized = validate_url("http://example.com:8080/x").unwrap();
        assert_eq!(sanitized, "http://example.com:8080/x");
    }

    #[test]
    fn rejects_bad_urls() {
        assert!(validate_url("").is_err());
        assert!(validate_url("ftp://example.com").is_err());
        assert!(validate_url("notaurl").is_err());
        assert!(validate_url("http://").is_err());
        let long = format!("https://example.com/{}", "a".repeat(MAX_URL_BYTES));
        assert!(validate_url(&long).is_err());
    }

    #[test]
    fn alias_grammar_bounds() {
        assert!(validate_alias("abc").is_ok());
        assert!(validate_alias("promo_2024-x").is_ok());
        assert!(validate_alias(&"a".repeat(30)).is_ok());
        assert!(validate_alias("ab").is_err());
        assert!(validate_alias(&"a".repeat(31)).is_err());
        assert!(validate_alias("has space").is_err());
        assert!(validate_alias("uni·code").is_err());
    }

    #[test]
    fn candidates_follow_strategy_order() {
        let all = candidate_aliases("promo");
        assert_eq!(all[0], "promo1");
        assert_eq!(all[3], "promo123");
        assert_eq!(all[4], "promo2024");
        assert_eq!(all[6], "mypromo");
        assert!(all.contains(&"promo_url".to_string()));
    }

    #[test]
    fn overlong_candidates_fail_grammar() {
        // A 29-char base pushes suffixed candidates past 30; the grammar
        // filter must reject those before any store probe.
        let base = "a".repeat(29);
        let viable: Vec<_> = candidate_aliases(&base)
            .into_iter()
            .filter(|c| code_pattern().is_match(c))
            .collect();
        assert!(viable.iter().all(|c| c.len() <= 30));
    }
}
