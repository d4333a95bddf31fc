//! SHA-256 helpers and scene-version derivation.

use sha2::{Digest, Sha256};

/// Number of hex characters kept for a derived scene version.
const SCENE_VERSION_LEN: usize = 16;

/// Compute a SHA-256 hex digest of the given bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{hash:x}")
}

/// Derive the scene-version tag from a kernel identity string.
///
/// Two processes agree on the tag exactly when they run the same kernel
/// build, which is what lets a server discard results rendered by stale
/// clients.
pub fn scene_version(kernel_identity: &str) -> String {
    let mut digest = sha256_hex(kernel_identity.as_bytes());
    digest.truncate(SCENE_VERSION_LEN);
    digest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_produces_known_hash() {
        let hash = sha256_hex(b"");
        assert_eq!(
            hash,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn scene_version_is_short_and_stable() {
        let a = scene_version("sky/1");
        assert_eq!(a.len(), SCENE_VERSION_LEN);
        assert_eq!(a, scene_version("sky/1"));
        assert_ne!(a, scene_version("sky/2"));
    }
}
