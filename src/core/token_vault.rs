use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::RngCore;

/// Number of random bytes behind each access key. The original source
/// generates 1024 bytes of entropy; the spec's own open question (§9)
/// recommends capping at 32 bytes (256 bits) without loss of security,
/// which this daemon does.
const ACCESS_KEY_BYTES: usize = 32;

/// Access keys expire 3600 seconds after being issued (§4.3).
const ACCESS_KEY_TTL: Duration = Duration::from_secs(3600);

/// Mints and consumes single-use, TTL-bound access keys.
///
/// Loosely grounded on the `cco` example's `TokenManager`
/// (`daemon/security/auth.rs`) for the shape of an issuer/validator pair,
/// but simplified: keys live only in process memory (the spec has no
/// persisted state), are not hashed at rest (they exist for at most an
/// hour and are never written to disk), and are genuinely single-use —
/// `consume` removes the key rather than marking it revoked.
pub struct TokenVault {
    keys: Mutex<HashMap<String, Instant>>,
}

impl Default for TokenVault {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenVault {
    pub fn new() -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Generates a cryptographically random key and stores its expiry.
    pub fn issue_access_key(&self) -> String {
        let mut bytes = [0u8; ACCESS_KEY_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        let key = hex::encode(bytes);

        let mut keys = self.keys.lock().expect("token vault lock poisoned");
        keys.insert(key.clone(), Instant::now() + ACCESS_KEY_TTL);
        log::debug!("access key issued ({}...)", &key[..8]);
        key
    }

    /// Sweeps expired entries (lazily, only here), then checks `key`. If
    /// present and unexpired it is removed and this returns `true`;
    /// otherwise `false`. A key can therefore satisfy `consume` at most
    /// once.
    pub fn consume(&self, key: &str) -> bool {
        let mut keys = self.keys.lock().expect("token vault lock poisoned");

        let now = Instant::now();
        keys.retain(|_, expiry| *expiry > now);

        let consumed = keys.remove(key).is_some();
        let prefix = &key[..key.len().min(8)];
        if consumed {
            log::debug!("access key consumed ({prefix}...)");
        } else {
            log::debug!("access key rejected ({prefix}...): unknown, expired, or already used");
        }
        consumed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_key_is_64_hex_chars() {
        let vault = TokenVault::new();
        let key = vault.issue_access_key();
        assert_eq!(key.len(), ACCESS_KEY_BYTES * 2);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn consume_is_single_use() {
        let vault = TokenVault::new();
        let key = vault.issue_access_key();
        assert!(vault.consume(&key));
        assert!(!vault.consume(&key));
    }

    #[test]
    fn unknown_key_is_rejected() {
        let vault = TokenVault::new();
        assert!(!vault.consume("not-a-real-key"));
    }

    #[test]
    fn expired_key_is_rejected() {
        let vault = TokenVault::new();
        let key = "deadbeef".to_string();
        vault
            .keys
            .lock()
            .unwrap()
            .insert(key.clone(), Instant::now() - Duration::from_secs(1));
        assert!(!vault.consume(&key));
    }
}
