//! Bearer-token principal extraction.
//!
//! Registration and login live elsewhere; this side only verifies HS256
//! access tokens and yields the owner id and rate-limit tier.

use axum::http::HeaderMap;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::enums::Tier;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub tier: Option<String>,
    pub exp: i64,
}

/// An authenticated caller.
#[derive(Debug, Clone, Copy)]
pub struct Principal {
    pub user_id: Uuid,
    pub tier: Tier,
}

/// Parse `Authorization: Bearer <jwt>`. Absent or unverifiable tokens both
/// read as anonymous; endpoints that require auth check for the principal.
pub fn principal_from_headers(headers: &HeaderMap, secret: &str) -> Option<Principal> {
    let raw = headers.get("authorization")?.to_str().ok()?;
    let token = raw.strip_prefix("Bearer ").or_else(|| raw.strip_prefix("bearer "))?;

    let decoded = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .ok()?;

    let user_id = Uuid::parse_str(&decoded.claims.sub).ok()?;
    let tier = decoded
        .claims
        .tier
        .as_deref()
        .map(Tier::from_str)
        .unwrap_or(Tier::Standard);
    Some(Principal { user_id, tier })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token(secret: &str, tier: Option<&str>) -> String {
        let claims = Claims {
            sub: Uuid::new_v4().to_string(),
            tier: tier.map(|t| t.to_string()),
            exp: chrono::Utc::now().timestamp() + 600,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn headers_with(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    #[test]
    fn valid_token_yields_principal() {
        let headers = headers_with(&token("s3cret", Some("premium")));
        let principal = principal_from_headers(&headers, "s3cret").unwrap();
        assert_eq!(principal.tier, Tier::Premium);
    }

    #[test]
    fn missing_tier_defaults_to_standard() {
        let headers = headers_with(&token("s3cret", None));
        let principal = principal_from_headers(&headers, "s3cret").unwrap();
        assert_eq!(principal.tier, Tier::Standard);
    }

    #[test]
    fn wrong_secret_reads_as_anonymous() {
        let headers = headers_with(&token("other", Some("premium")));
        assert!(principal_from_headers(&headers, "s3cret").is_none());
    }

    #[test]
    fn absent_header_reads_as_anonymous() {
        assert!(principal_from_headers(&HeaderMap::new(), "s3cret").is_none());
    }
}
