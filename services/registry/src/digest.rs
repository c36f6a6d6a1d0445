//! Content digests in the `sha256:<hex>` form used by the distribution API.

use sha2::{Digest as _, Sha256};

use crate::error::{RegistryError, RegistryResult};

/// Prefix for every digest this registry computes.
pub const SHA256_PREFIX: &str = "sha256:";

/// Compute the `sha256:` digest of a byte sequence.
pub fn sha256(data: &[u8]) -> String {
    format!("{SHA256_PREFIX}{}", hex::encode(Sha256::digest(data)))
}

/// Compute the digest of several buffers as if they were one.
pub fn sha256_chunks<'a>(chunks: impl IntoIterator<Item = &'a [u8]>) -> String {
    let mut hasher = Sha256::new();
    for chunk in chunks {
        hasher.update(chunk);
    }
    format!("{SHA256_PREFIX}{}", hex::encode(hasher.finalize()))
}

/// Whether a reference has the `algorithm:encoded` shape of a digest.
///
/// Tags can't contain `:`, so this is how references are told apart.
pub fn is_digest(reference: &str) -> bool {
    matches!(
        reference.split_once(':'),
        Some((algorithm, encoded)) if !algorithm.is_empty() && !encoded.is_empty()
    )
}

/// Validate digest format
pub fn validate(digest: &str) -> RegistryResult<()> {
    if !is_digest(digest) {
        return Err(RegistryError::InvalidDigest(digest.to_string()));
    }
    Ok(())
}
