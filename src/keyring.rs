//! Symmetric keys with validity windows.
//!
//! A keyring holds every key that may still be needed to read a live token.
//! Encryption always uses the key with the latest `valid_till` among those
//! already in effect; decryption prefers the key whose window covers the
//! token's creation time, and callers fall back to trying the whole ring.
//!
//! # Security Properties
//!
//! - **Zeroize on drop**: [`Key`] material is cleared when dropped
//! - **Fail closed on unknown versions**: a keyring file with any version other
//!   than [`KEYRING_VERSION`] is rejected before any entry is parsed
//! - **Atomic persistence**: files are written to a temporary file in the
//!   target directory and renamed into place

use std::fmt;
use std::path::Path;

use rand::RngCore;
use tracing::{debug, info};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::attrs::AttrList;
use crate::encoding::{decode_record, encode_record, Record, Rule, RuleKind, Value};
use crate::error::{Result, WebAuthError};
use crate::store::write_atomic;
use crate::unix_now;

/// Only supported keyring file version
pub const KEYRING_VERSION: u32 = 1;

/// Length of keys generated by rotation (AES-256)
pub const GENERATED_KEY_LEN: usize = 32;

/// Key algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Aes,
}

impl KeyType {
    /// Wire code stored in keyring files
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            KeyType::Aes => 1,
        }
    }

    pub fn from_code(code: u32) -> Result<Self> {
        match code {
            1 => Ok(KeyType::Aes),
            other => Err(WebAuthError::BadKey(format!("unknown key type {other}"))),
        }
    }

    fn check_len(self, len: usize) -> Result<()> {
        match (self, len) {
            (KeyType::Aes, 16 | 24 | 32) => Ok(()),
            (KeyType::Aes, n) => Err(WebAuthError::BadKey(format!("invalid AES key length {n}"))),
        }
    }
}

/// Key material tagged with its algorithm
/// Automatically zeroized on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Key {
    #[zeroize(skip)]
    key_type: KeyType,
    material: Vec<u8>,
}

impl Key {
    pub fn new(key_type: KeyType, material: Vec<u8>) -> Result<Self> {
        key_type.check_len(material.len())?;
        Ok(Self { key_type, material })
    }

    /// Fresh random key of the given length
    pub fn generate(key_type: KeyType, len: usize) -> Result<Self> {
        key_type.check_len(len)?;
        let mut material = vec![0u8; len];
        rand::rng().fill_bytes(&mut material);
        Ok(Self { key_type, material })
    }

    #[must_use]
    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    /// Get the key bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.material
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("key_type", &self.key_type)
            .field("len", &self.material.len())
            .finish()
    }
}

/// Which direction a key is selected for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUsage {
    Encrypt,
    Decrypt,
}

#[derive(Debug, Clone)]
pub struct KeyringEntry {
    pub creation_time: u64,
    pub valid_from: u64,
    pub valid_till: u64,
    pub key: Key,
}

/// When and how a ring gets a fresh key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    /// Age after which the newest key is replaced
    pub lifetime: u64,
    /// Validity window given to a newly generated key
    pub validity: u64,
    /// Time an expired key stays on the ring for in-flight tokens
    pub grace: u64,
}

/// What a rotation pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RotationReport {
    pub added: bool,
    pub removed: usize,
}

impl RotationReport {
    #[must_use]
    pub fn changed(&self) -> bool {
        self.added || self.removed > 0
    }
}

const ENTRY_RULES: &[Rule] = &[
    Rule::new("ct", "key creation time", RuleKind::Time),
    Rule::new("va", "key valid after", RuleKind::Time),
    Rule::new("vt", "key valid till", RuleKind::Time),
    Rule::new("kt", "key type", RuleKind::Uint32),
    Rule::new("kd", "key data", RuleKind::Data),
];

const KEYRING_RULES: &[Rule] = &[
    Rule::new("v", "keyring version", RuleKind::Uint32),
    Rule::new("n", "keyring entries", RuleKind::Repeat(ENTRY_RULES)),
];

/// Ordered collection of keys
#[derive(Debug, Clone, Default)]
pub struct Keyring {
    entries: Vec<KeyringEntry>,
}

impl Keyring {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ring holding a single key valid from `now` for `validity` seconds
    pub fn with_generated_key(now: u64, validity: u64) -> Result<Self> {
        let mut ring = Self::new();
        ring.add(now, now, now.saturating_add(validity), Key::generate(KeyType::Aes, GENERATED_KEY_LEN)?);
        Ok(ring)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn entries(&self) -> &[KeyringEntry] {
        &self.entries
    }

    /// Append a key. Zero creation or start times mean "now".
    pub fn add(&mut self, creation_time: u64, valid_from: u64, valid_till: u64, key: Key) {
        let now = unix_now();
        self.entries.push(KeyringEntry {
            creation_time: if creation_time == 0 { now } else { creation_time },
            valid_from: if valid_from == 0 { now } else { valid_from },
            valid_till,
            key,
        });
    }

    pub fn remove(&mut self, index: usize) -> Option<KeyringEntry> {
        (index < self.entries.len()).then(|| self.entries.remove(index))
    }

    /// Index of the best entry for `usage` at time `hint`
    ///
    /// Encrypt: latest `valid_till` among entries already in effect, ties
    /// going to the newest. An entry past its `valid_till` is still chosen when
    /// nothing better exists, which tolerates clock skew between servers.
    ///
    /// Decrypt: an entry whose window contains `hint`, if any.
    #[must_use]
    pub fn best_index(&self, usage: KeyUsage, hint: u64) -> Option<usize> {
        let mut candidates = self.entries.iter().enumerate();
        match usage {
            KeyUsage::Encrypt => candidates
                .filter(|(_, e)| e.valid_from <= hint)
                .max_by_key(|(_, e)| (e.valid_till, e.creation_time))
                .map(|(i, _)| i),
            KeyUsage::Decrypt => candidates
                .find(|(_, e)| e.valid_from <= hint && hint <= e.valid_till)
                .map(|(i, _)| i),
        }
    }

    #[must_use]
    pub fn best_entry(&self, usage: KeyUsage, hint: u64) -> Option<&KeyringEntry> {
        self.best_index(usage, hint).map(|i| &self.entries[i])
    }

    #[must_use]
    pub fn best_key(&self, usage: KeyUsage, hint: u64) -> Option<&Key> {
        self.best_entry(usage, hint).map(|e| &e.key)
    }

    /// Apply a rotation policy at time `now`
    ///
    /// Adds a fresh key when no key younger than `lifetime` is in effect, then
    /// drops keys whose `valid_till + grace` has passed. The current encryption
    /// key is never dropped. A zero `lifetime` never adds a key.
    pub fn rotate(&mut self, now: u64, policy: &RotationPolicy) -> Result<RotationReport> {
        let mut report = RotationReport::default();

        let fresh = policy.lifetime == 0
            || self
                .entries
                .iter()
                .any(|e| e.valid_from <= now && now < e.valid_from.saturating_add(policy.lifetime));
        if !fresh {
            let key = Key::generate(KeyType::Aes, GENERATED_KEY_LEN)?;
            self.add(now, now, now.saturating_add(policy.validity), key);
            report.added = true;
        }

        let keep = self.best_index(KeyUsage::Encrypt, now);
        let before = self.entries.len();
        let mut index = 0;
        self.entries.retain(|e| {
            let retain = Some(index) == keep || e.valid_till.saturating_add(policy.grace) >= now;
            index += 1;
            retain
        });
        report.removed = before - self.entries.len();

        if report.changed() {
            info!(added = report.added, removed = report.removed, keys = self.entries.len(), "Rotated keyring");
        }
        Ok(report)
    }

    /// Serialize to the versioned keyring file format
    pub fn encode(&self) -> Result<Vec<u8>> {
        let entries = self
            .entries
            .iter()
            .map(|e| {
                let mut r = Record::new();
                r.set("ct", Value::Time(e.creation_time))
                    .set("va", Value::Time(e.valid_from))
                    .set("vt", Value::Time(e.valid_till))
                    .set("kt", Value::Uint32(e.key.key_type().code()))
                    .set("kd", Value::Data(e.key.as_bytes().to_vec()));
                r
            })
            .collect();
        let mut record = Record::new();
        record
            .set("v", Value::Uint32(KEYRING_VERSION))
            .set("n", Value::Repeat(entries));
        encode_record(KEYRING_RULES, &record, 0)?.encode()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let attrs = AttrList::decode(bytes)?;
        let version = attrs
            .get_u32("v")
            .map_err(|_| WebAuthError::corrupt("keyring has no version"))?;
        if version != KEYRING_VERSION {
            return Err(WebAuthError::KeyringVersion(version));
        }
        let record = decode_record(KEYRING_RULES, &attrs)?;
        let mut entries = Vec::new();
        for r in record.repeat("n") {
            let field = |name: &str| r.time(name).ok_or_else(|| WebAuthError::corrupt(format!("keyring entry missing {name}")));
            let key_type = KeyType::from_code(r.uint32("kt").unwrap_or(0))?;
            let material = r.data("kd").unwrap_or_default().to_vec();
            entries.push(KeyringEntry {
                creation_time: field("ct")?,
                valid_from: field("va")?,
                valid_till: field("vt")?,
                key: Key::new(key_type, material)?,
            });
        }
        Ok(Self { entries })
    }

    pub fn read_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|source| WebAuthError::KeyringIo {
            path: path.to_owned(),
            source,
        })?;
        let ring = Self::decode(&bytes)?;
        debug!(path = %path.display(), keys = ring.len(), "Loaded keyring");
        Ok(ring)
    }

    /// Write atomically: temp file in the same directory, then rename
    pub fn write_file(&self, path: &Path) -> Result<()> {
        let bytes = self.encode()?;
        write_atomic(path, &bytes).map_err(|source| WebAuthError::KeyringIo {
            path: path.to_owned(),
            source,
        })?;
        debug!(path = %path.display(), keys = self.len(), "Wrote keyring");
        Ok(())
    }
}

// ============================================================
// TESTS
// ============================================================
