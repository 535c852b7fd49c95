/// Shared enums for the URL shortener services.
///
/// These enums provide type safety for status and policy fields across the
/// codebase. They serialize to strings for JSON compatibility on the wire
/// and in cache payloads.
use serde::{Deserialize, Serialize};

/// Health check status values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Rate-limit class attached to a principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Anonymous,
    Standard,
    Premium,
    Enterprise,
    Strict,
}

impl Tier {
    /// Safely parse from string, falling back to Standard for unknown values.
    pub fn from_str(s: &str) -> Self {
        match s {
            "anonymous" => Self::Anonymous,
            "premium" => Self::Premium,
            "enterprise" => Self::Enterprise,
            "strict" => Self::Strict,
            _ => Self::Standard,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anonymous => "anonymous",
            Self::Standard => "standard",
            Self::Premium => "premium",
            Self::Enterprise => "enterprise",
            Self::Strict => "strict",
        }
    }
}

/// Per-user policy when the same long URL is shortened twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateStrategy {
    GenerateNew,
    ReuseExisting,
}

impl DuplicateStrategy {
    /// Safely parse from string, falling back to GenerateNew for unknown values.
    pub fn from_str(s: &str) -> Self {
        match s {
            "reuse_existing" => Self::ReuseExisting,
            _ => Self::GenerateNew,
        }
    }
}

/// Which issuance path produced a short code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdMethod {
    Counter,
    Hash,
}

/// Which layer answered a cache lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSource {
    Memory,
    Redis,
    Database,
    NotFound,
}

impl CacheSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Redis => "redis",
            Self::Database => "database",
            Self::NotFound => "not_found",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_round_trips_known_values() {
        for tier in [
            Tier::Anonymous,
            Tier::Standard,
            Tier::Premium,
            Tier::Enterprise,
            Tier::Strict,
        ] {
            assert_eq!(Tier::from_str(tier.as_str()), tier);
        }
    }

    #[test]
    fn unknown_strings_fall_back() {
        assert_eq!(Tier::from_str("gold"), Tier::Standard);
        assert_eq!(
            DuplicateStrategy::from_str("whatever"),
            DuplicateStrategy::GenerateNew
        );
    }
}
