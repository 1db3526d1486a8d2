//! Keyring persistence backends and the process-wide shared handle.
//!
//! [`KeyringStore`] abstracts where the keyring lives:
//! - A file on disk (production)
//! - In-memory (for testing)
//!
//! [`SharedKeyring`] is what request handlers hold. Readers take a cheap
//! snapshot and never block; rotation builds a new ring, persists it, and
//! swaps it in under a mutex, so a reader sees either the old ring or the new
//! one, never a mix.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::{Result, WebAuthError};
use crate::keyring::{Keyring, RotationPolicy, RotationReport};

/// Default validity given to the key of a freshly created ring (10 years)
pub const DEFAULT_KEY_VALIDITY: u64 = 10 * 365 * 24 * 60 * 60;

/// Replace `path` with `bytes` via a synced temp file in the same directory
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Where a keyring is loaded from and saved to
pub trait KeyringStore: Send + Sync {
    /// `Ok(None)` when no keyring has been stored yet
    fn load(&self) -> Result<Option<Keyring>>;

    fn save(&self, ring: &Keyring) -> Result<()>;
}

/// Keyring file on disk
#[derive(Debug, Clone)]
pub struct FileKeyringStore {
    path: PathBuf,
}

impl FileKeyringStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KeyringStore for FileKeyringStore {
    fn load(&self) -> Result<Option<Keyring>> {
        if !self.path.exists() {
            return Ok(None);
        }
        Keyring::read_file(&self.path).map(Some)
    }

    fn save(&self, ring: &Keyring) -> Result<()> {
        ring.write_file(&self.path)
    }
}

/// In-memory keyring store for testing
/// Clones share the same underlying bytes
#[derive(Default, Clone)]
pub struct InMemoryKeyringStore {
    bytes: Arc<Mutex<Option<Vec<u8>>>>,
    saves: Arc<AtomicUsize>,
}

impl InMemoryKeyringStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-encoded keyring bytes (for testing corrupt input)
    pub fn put_raw(&self, bytes: Vec<u8>) {
        *self.bytes.lock() = Some(bytes);
    }

    /// Number of successful saves
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl KeyringStore for InMemoryKeyringStore {
    fn load(&self) -> Result<Option<Keyring>> {
        self.bytes.lock().as_deref().map(Keyring::decode).transpose()
    }

    fn save(&self, ring: &Keyring) -> Result<()> {
        let bytes = ring.encode()?;
        *self.bytes.lock() = Some(bytes);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Thread-safe keyring handle with copy-on-write rotation
pub struct SharedKeyring {
    current: ArcSwap<Keyring>,
    store: Box<dyn KeyringStore>,
    policy: Option<RotationPolicy>,
    /// Serializes rotation and persistence
    writer: Mutex<()>,
}

impl SharedKeyring {
    /// Wrap an in-hand ring without loading
    pub fn new(ring: Keyring, store: impl KeyringStore + 'static, policy: Option<RotationPolicy>) -> Self {
        Self {
            current: ArcSwap::from_pointee(ring),
            store: Box::new(store),
            policy,
            writer: Mutex::new(()),
        }
    }

    /// Load the ring from `store`, creating one if allowed
    ///
    /// 1. Load; a missing ring is created only when `create` is set
    /// 2. Apply the rotation policy once
    /// 3. Persist if anything changed
    ///
    /// Any failure here is fatal for the caller: nothing can be served
    /// without key material.
    pub fn open(
        store: impl KeyringStore + 'static,
        create: bool,
        policy: Option<RotationPolicy>,
        now: u64,
    ) -> Result<Self> {
        let (ring, created) = match store.load()? {
            Some(ring) => (ring, false),
            None if create => {
                let validity = policy.map_or(DEFAULT_KEY_VALIDITY, |p| p.validity);
                (Keyring::with_generated_key(now, validity)?, true)
            }
            None => return Err(WebAuthError::BadKey("keyring does not exist".into())),
        };
        if created {
            store.save(&ring)?;
            info!("Created new keyring");
        }
        let shared = Self::new(ring, store, policy);
        shared.rotate_if_needed(now)?;
        if shared.snapshot().is_empty() {
            return Err(WebAuthError::BadKey("keyring is empty".into()));
        }
        Ok(shared)
    }

    /// Current ring; stays valid even if a rotation swaps in a new one
    #[must_use]
    pub fn snapshot(&self) -> Arc<Keyring> {
        self.current.load_full()
    }

    /// Apply the rotation policy, persisting and swapping on change
    pub fn rotate_if_needed(&self, now: u64) -> Result<RotationReport> {
        let Some(policy) = self.policy else {
            return Ok(RotationReport::default());
        };
        let _guard = self.writer.lock();
        let mut next = Keyring::clone(&self.current.load());
        let report = next.rotate(now, &policy)?;
        if report.changed() {
            self.store.save(&next)?;
            self.current.store(Arc::new(next));
        }
        Ok(report)
    }

    /// Persist and install a replacement ring
    pub fn replace(&self, ring: Keyring) -> Result<()> {
        let _guard = self.writer.lock();
        self.store.save(&ring)?;
        self.current.store(Arc::new(ring));
        Ok(())
    }

    /// Re-read the store, keeping the current ring if the store is unreadable
    pub fn reload(&self) -> Result<()> {
        let _guard = self.writer.lock();
        match self.store.load() {
            Ok(Some(ring)) => {
                self.current.store(Arc::new(ring));
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                warn!(error = %e, "Keyring reload failed, keeping current keys");
                Err(e)
            }
        }
    }
}

// ============================================================
// TESTS
// ============================================================
