//! Constant-time verification of shared-secret tokens.
//!
//! The configured secret is never compared byte-by-byte. Both sides are run
//! through HMAC-SHA256 under a per-process random key and the tags compared
//! with `verify_slice`, so timing leaks neither content nor length.

use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// A configured secret that candidates can be checked against.
#[derive(Clone)]
pub struct SharedSecret {
    key: [u8; 32],
    expected_tag: Option<Vec<u8>>,
}

impl SharedSecret {
    /// An empty secret disables the channel: nothing verifies.
    pub fn new(secret: &str) -> Self {
        let mut key = [0u8; 32];
        rand::rng().fill(&mut key);

        let expected_tag = if secret.is_empty() {
            None
        } else {
            tag(&key, secret.as_bytes())
        };

        Self { key, expected_tag }
    }

    pub fn is_configured(&self) -> bool {
        self.expected_tag.is_some()
    }

    pub fn verify(&self, candidate: &str) -> bool {
        let Some(expected) = self.expected_tag.as_deref() else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.key) else {
            return false;
        };
        mac.update(candidate.as_bytes());
        mac.verify_slice(expected).is_ok()
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSecret")
            .field("configured", &self.is_configured())
            .finish()
    }
}

fn tag(key: &[u8], message: &[u8]) -> Option<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key).ok()?;
    mac.update(message);
    Some(mac.finalize().into_bytes().to_vec())
}
