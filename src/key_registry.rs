//! Per-session registry of host-only crypto keys.
//!
//! Keys never cross into the VM. Scripts hold an opaque handle carrying the
//! registry id (`__keyId`); every bridged call resolves that id here.
//!
//! Entries use a sliding TTL: a successful [`KeyRegistry::get`] pushes the
//! expiry out to `now + ttl`. Expired entries are evicted on access and by a
//! periodic sweep that runs once per TTL interval. There is no weak-reference
//! tracking; the TTL sweep is the only reclamation path besides explicit
//! removal and [`KeyRegistry::dispose`].

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::CryptoError;
use crate::webcrypto::{CryptoKey, CryptoKeyPair, CryptoProvider};

/// Default lifetime of an unaccessed key (5 minutes).
pub const KEY_EXPIRY_MS: u64 = 300_000;

// ============================================================================
// Clock
// ============================================================================

/// Millisecond clock, injectable for deterministic tests.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        u64::try_from(now.as_millis()).unwrap_or(u64::MAX)
    }
}

#[derive(Debug)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub const fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    pub fn set(&self, ms: u64) {
        self.now_ms.store(ms, AtomicOrdering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.now_ms.fetch_add(ms, AtomicOrdering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(AtomicOrdering::SeqCst)
    }
}

// ============================================================================
// Registry
// ============================================================================

/// What an id resolves to.
#[derive(Debug, Clone)]
pub enum RegisteredKey {
    Single(Rc<CryptoKey>),
    Pair(Rc<CryptoKeyPair>),
}

impl From<CryptoKey> for RegisteredKey {
    fn from(key: CryptoKey) -> Self {
        Self::Single(Rc::new(key))
    }
}

impl From<CryptoKeyPair> for RegisteredKey {
    fn from(pair: CryptoKeyPair) -> Self {
        Self::Pair(Rc::new(pair))
    }
}

#[derive(Debug)]
struct Entry {
    key: RegisteredKey,
    ttl_ms: u64,
    expires_at_ms: u64,
}

pub struct KeyRegistry {
    clock: Arc<dyn Clock>,
    provider: Option<Arc<dyn CryptoProvider>>,
    default_ttl_ms: u64,
    entries: HashMap<String, Entry>,
    /// `None` once disposed; the periodic sweep is stopped.
    next_sweep_at_ms: Option<u64>,
    fallback_seq: u64,
}

impl std::fmt::Debug for KeyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRegistry")
            .field("entries", &self.entries.len())
            .field("default_ttl_ms", &self.default_ttl_ms)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

impl KeyRegistry {
    pub fn new(
        clock: Arc<dyn Clock>,
        default_ttl_ms: u64,
        provider: Option<Arc<dyn CryptoProvider>>,
    ) -> Self {
        let next_sweep_at_ms = Some(clock.now_ms().saturating_add(default_ttl_ms));
        Self {
            clock,
            provider,
            default_ttl_ms,
            entries: HashMap::new(),
            next_sweep_at_ms,
            fallback_seq: 0,
        }
    }

    /// Registry on the system clock with the default TTL.
    pub fn with_defaults(provider: Option<Arc<dyn CryptoProvider>>) -> Self {
        Self::new(Arc::new(SystemClock), KEY_EXPIRY_MS, provider)
    }

    pub const fn is_disposed(&self) -> bool {
        self.next_sweep_at_ms.is_none()
    }

    pub fn store(&mut self, key: impl Into<RegisteredKey>) -> String {
        self.store_with_ttl(key, self.default_ttl_ms)
    }

    /// Store a key and return its fresh id. A disposed registry hands out an
    /// id but keeps nothing, so the id never resolves.
    pub fn store_with_ttl(&mut self, key: impl Into<RegisteredKey>, ttl_ms: u64) -> String {
        let id = self.generate_id();
        if self.is_disposed() {
            tracing::warn!(
                event = "sandbox.key_registry.store_after_dispose",
                key_id = %id,
                "Key stored after registry dispose; dropping"
            );
            return id;
        }
        self.sweep_if_due();
        let expires_at_ms = self.clock.now_ms().saturating_add(ttl_ms);
        self.entries.insert(
            id.clone(),
            Entry {
                key: key.into(),
                ttl_ms,
                expires_at_ms,
            },
        );
        tracing::trace!(
            event = "sandbox.key_registry.store",
            key_id = %id,
            ttl_ms,
            entries = self.entries.len(),
            "Stored key"
        );
        id
    }

    /// Resolve an id. Expired entries are evicted; live ones get their
    /// expiry reset to `now + ttl`.
    pub fn get(&mut self, id: &str) -> Option<RegisteredKey> {
        self.sweep_if_due();
        let now = self.clock.now_ms();
        let entry = self.entries.get_mut(id)?;
        if entry.expires_at_ms <= now {
            self.entries.remove(id);
            tracing::debug!(
                event = "sandbox.key_registry.expired",
                key_id = %id,
                "Evicted expired key on access"
            );
            return None;
        }
        entry.expires_at_ms = now.saturating_add(entry.ttl_ms);
        Some(entry.key.clone())
    }

    /// Resolve an id that must name a single key.
    pub fn get_key(&mut self, id: &str) -> Result<Rc<CryptoKey>, CryptoError> {
        match self.get(id) {
            Some(RegisteredKey::Single(key)) => Ok(key),
            Some(RegisteredKey::Pair(_)) => Err(CryptoError::invalid_key(
                "expected CryptoKey, got CryptoKeyPair",
            )),
            None => Err(CryptoError::invalid_key("key not found in registry")),
        }
    }

    /// Presence check without touching the expiry.
    pub fn has(&self, id: &str) -> bool {
        let now = self.clock.now_ms();
        self.entries
            .get(id)
            .is_some_and(|entry| entry.expires_at_ms > now)
    }

    pub fn delete(&mut self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of live entries; expired entries are purged first.
    pub fn len(&mut self) -> usize {
        self.purge_expired();
        self.entries.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    /// Stop the periodic sweep and drop every entry. Idempotent.
    pub fn dispose(&mut self) {
        if self.is_disposed() {
            return;
        }
        let dropped = self.entries.len();
        self.entries.clear();
        self.next_sweep_at_ms = None;
        tracing::debug!(
            event = "sandbox.key_registry.dispose",
            dropped,
            "Disposed key registry"
        );
    }

    /// Run the periodic sweep if its interval has elapsed. Returns the number
    /// of entries removed.
    pub fn sweep_if_due(&mut self) -> usize {
        let Some(next) = self.next_sweep_at_ms else {
            return 0;
        };
        let now = self.clock.now_ms();
        if now < next {
            return 0;
        }
        self.next_sweep_at_ms = Some(now.saturating_add(self.default_ttl_ms));
        let removed = self.purge_expired();
        if removed > 0 {
            tracing::debug!(
                event = "sandbox.key_registry.sweep",
                removed,
                remaining = self.entries.len(),
                "Swept expired keys"
            );
        }
        removed
    }

    fn purge_expired(&mut self) -> usize {
        let now = self.clock.now_ms();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at_ms > now);
        before - self.entries.len()
    }

    /// Provider UUID, then a v4 UUID from secure random bytes, then a
    /// non-cryptographic id as a last resort.
    fn generate_id(&mut self) -> String {
        if let Some(uuid) = self.provider.as_ref().and_then(|p| p.random_uuid()) {
            return uuid;
        }
        let mut bytes = [0u8; 16];
        let filled = match &self.provider {
            Some(provider) => provider.get_random_values(&mut bytes).is_ok(),
            None => false,
        } || getrandom::fill(&mut bytes).is_ok();
        if filled {
            return uuid::Builder::from_random_bytes(bytes)
                .into_uuid()
                .to_string();
        }
        self.fallback_seq += 1;
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or_default();
        tracing::warn!(
            event = "sandbox.key_registry.weak_id",
            "No secure random source; using a non-cryptographic key id"
        );
        format!("{}-{}-{nanos}", self.clock.now_ms(), self.fallback_seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webcrypto::{KeyAlgorithm, KeyType, KeyUsage};

    const MINUTE: u64 = 60_000;

    fn secret_key() -> CryptoKey {
        CryptoKey::secret(
            KeyAlgorithm::AesGcm { length: 128 },
            false,
            vec![KeyUsage::Encrypt],
            vec![0u8; 16],
        )
    }

    fn registry(clock: &Arc<ManualClock>) -> KeyRegistry {
        KeyRegistry::new(clock.clone(), KEY_EXPIRY_MS, None)
    }

    #[test]
    fn ids_are_v4_uuids_and_unique() {
        let clock = Arc::new(ManualClock::new(0));
        let mut reg = registry(&clock);
        let a = reg.store(secret_key());
        let b = reg.store(secret_key());
        assert_ne!(a, b);
        let parsed = uuid::Uuid::parse_str(&a).expect("uuid");
        assert_eq!(parsed.get_version_num(), 4);
    }

    #[test]
    fn get_resets_the_expiry() {
        let clock = Arc::new(ManualClock::new(1_000));
        let mut reg = registry(&clock);
        let id = reg.store(secret_key());

        clock.advance(4 * MINUTE);
        assert!(reg.get(&id).is_some());
        clock.advance(4 * MINUTE);
        assert!(reg.get(&id).is_some());
        clock.advance(6 * MINUTE);
        assert!(reg.get(&id).is_none());
        assert!(!reg.has(&id));
    }

    #[test]
    fn sliding_ttl_boundaries() {
        let clock = Arc::new(ManualClock::new(0));
        let mut reg = registry(&clock);
        let id = reg.store(secret_key());
        clock.set(10_000);
        assert!(reg.get(&id).is_some());
        clock.set(10_000 + KEY_EXPIRY_MS - 1);
        assert!(reg.has(&id));
        clock.set(10_000 + 2 * KEY_EXPIRY_MS + 1);
        assert!(reg.get(&id).is_none());
    }

    #[test]
    fn periodic_sweep_removes_unaccessed_entries() {
        let clock = Arc::new(ManualClock::new(0));
        let mut reg = registry(&clock);
        reg.store(secret_key());
        reg.store_with_ttl(secret_key(), 10 * KEY_EXPIRY_MS);
        assert_eq!(reg.sweep_if_due(), 0);

        clock.advance(KEY_EXPIRY_MS);
        assert_eq!(reg.sweep_if_due(), 1);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.sweep_if_due(), 0, "next sweep is one interval away");
    }

    #[test]
    fn pair_where_single_expected_is_invalid_key() {
        let clock = Arc::new(ManualClock::new(0));
        let mut reg = registry(&clock);
        let pair = CryptoKeyPair {
            public_key: CryptoKey {
                key_type: KeyType::Public,
                ..secret_key()
            },
            private_key: secret_key(),
        };
        let id = reg.store(pair);
        let err = reg.get_key(&id).unwrap_err();
        assert_eq!(err.message, "Invalid key: expected CryptoKey, got CryptoKeyPair");
        let err = reg.get_key("missing").unwrap_err();
        assert_eq!(err.message, "Invalid key: key not found in registry");
    }

    #[test]
    fn dispose_is_idempotent_and_final() {
        let clock = Arc::new(ManualClock::new(0));
        let mut reg = registry(&clock);
        let id = reg.store(secret_key());
        reg.dispose();
        reg.dispose();
        assert!(reg.is_disposed());
        assert!(reg.get(&id).is_none());
        let late = reg.store(secret_key());
        assert!(reg.get(&late).is_none());
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn delete_and_clear() {
        let clock = Arc::new(ManualClock::new(0));
        let mut reg = registry(&clock);
        let a = reg.store(secret_key());
        let b = reg.store(secret_key());
        assert!(reg.delete(&a));
        assert!(!reg.delete(&a));
        assert!(reg.has(&b));
        reg.clear();
        assert!(reg.is_empty());
    }
}
