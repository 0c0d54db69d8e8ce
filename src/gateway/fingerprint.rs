//! Request Fingerprinting
//!
//! Computes a stable identity for a completion request so caching and
//! in-flight coalescing agree on what "the same request" means. The
//! fingerprint covers the resolved provider and model, every message in
//! order, and the normalized tuning parameters. Field boundaries are
//! length-prefixed so adjacent values can never be confused for each
//! other ("ab" + "c" hashes differently from "a" + "bc").

use sha2::{Digest, Sha256};

use crate::types::CompletionRequest;

/// Stable request identity as a lowercase hex SHA-256 digest.
///
/// Used as the response cache primary key and the coalescing map key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute the fingerprint for a request routed to `provider`/`model`.
    ///
    /// Callers must pass the resolved provider and model (defaults already
    /// applied), so a request naming the default provider explicitly and one
    /// leaving it unset produce the same fingerprint.
    pub fn compute(provider: &str, model: &str, request: &CompletionRequest) -> Self {
        let mut hasher = Sha256::new();

        update_field(&mut hasher, provider.as_bytes());
        update_field(&mut hasher, model.as_bytes());

        hasher.update((request.messages.len() as u64).to_be_bytes());
        for message in &request.messages {
            update_field(&mut hasher, message.role.as_str().as_bytes());
            update_field(&mut hasher, message.content.as_bytes());
        }

        // Fixed-width numeric fields, normalized so unset == default
        hasher.update(request.normalized_temperature().to_bits().to_be_bytes());
        hasher.update(request.normalized_max_tokens().to_be_bytes());
        // json_mode changes the response shape, so it is part of the identity
        hasher.update([request.json_mode as u8]);

        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Hash a variable-length field with a length prefix.
fn update_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}
