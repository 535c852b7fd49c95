//! Hash-based short-code generator, the fallback when the counter
//! allocator cannot reserve ranges.
//!
//! Codes come from `SHA-256(url || nonce)`: the leading 8 bytes are
//! Base62-encoded and trimmed to the requested length. A deterministic
//! call (nonce 0, no entropy) always produces the same code for the same
//! URL; the random flavor seeds the nonce from entropy.

use std::sync::Arc;

use rand::Rng;
use sha2::{Digest, Sha256};

use crate::base62;
use crate::error::{ServiceError, ServiceResult};
use crate::store::UrlStore;

pub const MIN_HASH_CODE_LENGTH: usize = 7;

pub struct HashIdGenerator {
    store: Arc<UrlStore>,
    max_retries: u32,
}

impl HashIdGenerator {
    pub fn new(store: Arc<UrlStore>, max_retries: u32) -> Self {
        Self { store, max_retries }
    }

    /// Deterministic code derived from the URL content.
    pub async fn from_url(&self, long_url: &str, length: usize) -> ServiceResult<(String, u32)> {
        self.generate(long_url, 0, length).await
    }

    /// Entropy-seeded code of the requested length.
    pub async fn random(&self, length: usize) -> ServiceResult<(String, u32)> {
        let nonce: u64 = rand::thread_rng().gen();
        self.generate("", nonce, length).await
    }

    async fn generate(
        &self,
        seed: &str,
        start_nonce: u64,
        length: usize,
    ) -> ServiceResult<(String, u32)> {
        let length = length.max(MIN_HASH_CODE_LENGTH);
        let mut nonce = start_nonce;
        for attempt in 1..=self.max_retries {
            let code = derive_code(seed, nonce, length);
            let taken = self
                .store
                .short_code_exists(&code)
                .await
                .map_err(|e| ServiceError::HashUnavailable(e.to_string()))?;
            if !taken {
                return Ok((code, attempt));
            }
            tracing::warn!(%code, attempt, "hash code collision, bumping nonce");
            nonce = nonce.wrapping_add(1);
        }
        Err(ServiceError::HashExhausted(self.max_retries))
    }
}

/// Pure derivation step: digest, encode the leading 8 bytes, fit to length.
pub fn derive_code(seed: &str, nonce: u64, length: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    if nonce != 0 {
        hasher.update(nonce.to_be_bytes());
    }
    let digest = hasher.finalize();

    let mut leading = [0u8; 8];
    leading.copy_from_slice(&digest[..8]);
    let encoded = base62::encode_min_len(u64::from_be_bytes(leading), length);
    if encoded.len() > length {
        encoded[..length].to_string()
    } else {
        encoded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let a = derive_code("https://example.com/a", 0, 7);
        let b = derive_code("https://example.com/a", 0, 7);
        assert_eq!(a, b);
        assert_eq!(a.len(), 7);
        assert!(base62::is_valid(&a));
    }

    #[test]
    fn nonce_changes_the_code() {
        let a = derive_code("https://example.com/a", 0, 7);
        let b = derive_code("https://example.com/a", 1, 7);
        assert_ne!(a, b);
    }

    #[test]
    fn length_is_honored() {
        for len in [7usize, 9, 12] {
            assert_eq!(derive_code("https://example.com", 3, len).len(), len);
        }
    }
}
