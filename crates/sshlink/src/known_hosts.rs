//! Known-hosts trust store.
//!
//! An in-memory verification table loaded from and saved to OpenSSH-style
//! known-hosts files (`hostname key-type base64-key` per line). The store is
//! consulted once per handshake; whether the result gates the connection is
//! the session's decision, not the store's.

use std::collections::HashMap;
use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::engine::{HostKey, HostKeyKind};

/// Result of checking a server key against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownHostCheck {
    /// The hostname is known and the key matches.
    Match,
    /// The hostname is known but the key differs.
    Mismatch,
    /// The hostname has no entry.
    NotFound,
}

/// One trusted key for a hostname.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TrustEntry {
    kind: HostKeyKind,
    key: Vec<u8>,
}

/// In-memory known-hosts table.
///
/// Mutated only via explicit [`add`](Self::add) and persisted only via
/// explicit [`save`](Self::save); `check` never alters the store.
#[derive(Debug, Default)]
pub struct KnownHostsStore {
    entries: HashMap<String, Vec<TrustEntry>>,
}

impl KnownHostsStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of hostnames with at least one trusted key.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Load trust entries from an OpenSSH-style file.
    ///
    /// Malformed lines and unknown key types are skipped. Returns the number
    /// of entries loaded.
    pub fn load(&mut self, path: &Path) -> std::io::Result<usize> {
        let contents = std::fs::read_to_string(path)?;
        let mut loaded = 0;

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('@') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let (Some(hostname), Some(key_type), Some(key_data)) =
                (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            let kind = HostKeyKind::from_label(key_type);
            if kind == HostKeyKind::Unknown {
                tracing::debug!(key_type = %key_type, "skipping unknown key type in known_hosts");
                continue;
            }
            let Ok(key) = BASE64.decode(key_data) else {
                tracing::debug!(host = %hostname, "skipping undecodable known_hosts entry");
                continue;
            };
            self.entries
                .entry(hostname.to_string())
                .or_default()
                .push(TrustEntry { kind, key });
            loaded += 1;
        }

        tracing::debug!(path = %path.display(), loaded, "loaded known_hosts file");
        Ok(loaded)
    }

    /// Check a server key against the trusted entries for `hostname`.
    #[must_use]
    pub fn check(&self, hostname: &str, key: &HostKey) -> KnownHostCheck {
        match self.entries.get(hostname) {
            None => KnownHostCheck::NotFound,
            Some(entries) => {
                if entries.iter().any(|e| e.key == key.key) {
                    KnownHostCheck::Match
                } else {
                    KnownHostCheck::Mismatch
                }
            }
        }
    }

    /// Insert a trusted key for `hostname`.
    ///
    /// Only RSA and DSS keys have a defined encoding; an unknown key kind is
    /// rejected and the store is left untouched.
    pub fn add(&mut self, hostname: &str, key: &HostKey) -> bool {
        if key.kind.label().is_none() {
            tracing::warn!(host = %hostname, "rejecting known_hosts entry with unknown key type");
            return false;
        }
        self.entries
            .entry(hostname.to_string())
            .or_default()
            .push(TrustEntry {
                kind: key.kind,
                key: key.key.clone(),
            });
        true
    }

    /// Persist the store to `path` in OpenSSH format.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let mut out = String::new();
        for (hostname, entries) in &self.entries {
            for entry in entries {
                // Unknown kinds cannot enter the store, so label() holds.
                let Some(label) = entry.kind.label() else {
                    continue;
                };
                out.push_str(hostname);
                out.push(' ');
                out.push_str(label);
                out.push(' ');
                out.push_str(&BASE64.encode(&entry.key));
                out.push('\n');
            }
        }
        std::fs::write(path, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rsa_key(bytes: &[u8]) -> HostKey {
        HostKey {
            kind: HostKeyKind::Rsa,
            fingerprint: vec![0u8; 16],
            key: bytes.to_vec(),
        }
    }

    #[test]
    fn check_empty_store() {
        let store = KnownHostsStore::new();
        assert_eq!(
            store.check("example.com", &rsa_key(b"abc")),
            KnownHostCheck::NotFound
        );
    }

    #[test]
    fn add_then_check_match_and_mismatch() {
        let mut store = KnownHostsStore::new();
        assert!(store.add("example.com", &rsa_key(b"abc")));

        assert_eq!(
            store.check("example.com", &rsa_key(b"abc")),
            KnownHostCheck::Match
        );
        assert_eq!(
            store.check("example.com", &rsa_key(b"xyz")),
            KnownHostCheck::Mismatch
        );
        assert_eq!(
            store.check("other.com", &rsa_key(b"abc")),
            KnownHostCheck::NotFound
        );
    }

    #[test]
    fn add_unknown_kind_rejected_without_mutation() {
        let mut store = KnownHostsStore::new();
        let key = HostKey {
            kind: HostKeyKind::Unknown,
            fingerprint: vec![],
            key: b"abc".to_vec(),
        };
        assert!(!store.add("example.com", &key));
        assert!(store.is_empty());
    }

    #[test]
    fn save_and_reload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");

        let mut store = KnownHostsStore::new();
        store.add("example.com", &rsa_key(b"server-key-material"));
        store.save(&path).unwrap();

        let mut reloaded = KnownHostsStore::new();
        let loaded = reloaded.load(&path).unwrap();
        assert_eq!(loaded, 1);
        assert_eq!(
            reloaded.check("example.com", &rsa_key(b"server-key-material")),
            KnownHostCheck::Match
        );
    }

    #[test]
    fn save_to_unwritable_path_fails_without_panic() {
        let store = KnownHostsStore::new();
        let result = store.save(Path::new("/nonexistent-dir/known_hosts"));
        assert!(result.is_err());
    }

    #[test]
    fn load_skips_comments_and_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        std::fs::write(
            &path,
            "# comment\n\
             @revoked example.org ssh-rsa AAAA\n\
             short-line\n\
             example.com ssh-rsa c2VydmVyLWtleQ==\n\
             example.net ssh-ed25519 c2VydmVyLWtleQ==\n",
        )
        .unwrap();

        let mut store = KnownHostsStore::new();
        let loaded = store.load(&path).unwrap();
        assert_eq!(loaded, 1);
        assert_eq!(
            store.check("example.com", &rsa_key(b"server-key")),
            KnownHostCheck::Match
        );
    }
}
