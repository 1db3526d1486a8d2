//! The WebKDC collaborator and the cached service token.
//!
//! The enforcement point authenticates itself to the WebKDC with a service
//! token: an opaque string the WebKDC sealed for itself, plus a session key
//! both sides share. The token is cached process-wide and renewed ahead of
//! expiry; a request never waits on renewal if the cached token is still
//! usable.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::CredSpec;
use crate::crypto;
use crate::encoding::{decode_record, encode_record, Record, Rule, RuleKind, Value};
use crate::error::{Result, WebAuthError};
use crate::keyring::{Key, KeyType, Keyring};
use crate::store::write_atomic;
use crate::tokens::{CredToken, ProxyToken};

/// Credential with the WebKDC
#[derive(Debug, Clone)]
pub struct ServiceToken {
    /// Opaque webkdc-service token, passed back verbatim
    pub token: String,
    /// Shared with the WebKDC; seals request tokens
    pub session_key: Key,
    pub creation: u64,
    pub expiration: u64,
}

const CACHE_RULES: &[Rule] = &[
    Rule::new("st", "service token", RuleKind::String),
    Rule::new("k", "session key", RuleKind::Data),
    Rule::new("ct", "creation time", RuleKind::Time),
    Rule::new("et", "expiration time", RuleKind::Time),
];

impl ServiceToken {
    #[must_use]
    pub fn is_expired(&self, now: u64) -> bool {
        self.expiration <= now
    }

    /// True once `now` is inside the renewal window before expiry
    #[must_use]
    pub fn needs_refresh(&self, now: u64, window: u64) -> bool {
        now.saturating_add(window) >= self.expiration
    }

    /// Seal for the on-disk cache with our own keyring
    pub fn seal(&self, ring: &Keyring, now: u64) -> Result<String> {
        let mut r = Record::new();
        r.set("st", Value::String(self.token.clone()))
            .set("k", Value::Data(self.session_key.as_bytes().to_vec()))
            .set("ct", Value::Time(self.creation))
            .set("et", Value::Time(self.expiration));
        crypto::create(&encode_record(CACHE_RULES, &r, now)?, now, ring)
    }

    pub fn unseal(sealed: &str, ring: &Keyring) -> Result<Self> {
        let r = decode_record(CACHE_RULES, &crypto::parse(sealed, 0, ring)?)?;
        let missing = |name: &str| WebAuthError::corrupt(format!("service token cache missing {name}"));
        Ok(Self {
            token: r.string("st").ok_or_else(|| missing("st"))?.to_owned(),
            session_key: Key::new(KeyType::Aes, r.data("k").ok_or_else(|| missing("k"))?.to_vec())?,
            creation: r.time("ct").ok_or_else(|| missing("ct"))?,
            expiration: r.time("et").ok_or_else(|| missing("et"))?,
        })
    }
}

/// Requests the enforcement point makes to the WebKDC
///
/// Implementations own the transport (XML over HTTPS in production) and any
/// timeout; errors are reported as `External`.
pub trait WebKdc: Send + Sync {
    /// Obtain a fresh service token
    fn request_service_token(&self, now: u64) -> Result<ServiceToken>;

    /// Exchange a proxy token for delegated credentials
    fn get_creds(&self, service: &ServiceToken, proxy: &ProxyToken, wanted: &[CredSpec]) -> Result<Vec<CredToken>>;
}

/// Process-wide service token with time-based renewal
pub struct ServiceTokenCache {
    current: ArcSwapOption<ServiceToken>,
    refresh_window: u64,
    path: Option<PathBuf>,
    /// Only one renewal at a time
    renew: Mutex<()>,
}

impl ServiceTokenCache {
    #[must_use]
    pub fn new(refresh_window: u64, path: Option<PathBuf>) -> Self {
        Self {
            current: ArcSwapOption::empty(),
            refresh_window,
            path,
            renew: Mutex::new(()),
        }
    }

    /// Prime from the cache file; an unreadable cache is ignored
    pub fn load(&self, ring: &Keyring, now: u64) {
        let Some(path) = self.path.as_deref() else { return };
        match read_cache(path, ring) {
            Ok(token) if !token.is_expired(now) => {
                debug!(path = %path.display(), expiration = token.expiration, "Loaded service token cache");
                self.current.store(Some(Arc::new(token)));
            }
            Ok(_) => debug!(path = %path.display(), "Cached service token expired"),
            Err(e) => warn!(path = %path.display(), error = %e, "Ignoring unreadable service token cache"),
        }
    }

    /// Install a token directly
    pub fn set(&self, token: ServiceToken) {
        self.current.store(Some(Arc::new(token)));
    }

    #[must_use]
    pub fn peek(&self) -> Option<Arc<ServiceToken>> {
        self.current.load_full()
    }

    fn fresh(&self, now: u64) -> Option<Arc<ServiceToken>> {
        self.current
            .load_full()
            .filter(|t| !t.needs_refresh(now, self.refresh_window))
    }

    /// Current token, renewing it from the WebKDC when due
    ///
    /// Only one caller renews. While it does, others get the cached token if
    /// it has not expired and block only when there is nothing usable.
    /// If renewal fails but the cached token has not actually expired, the
    /// cached token is returned and renewal is retried on the next call.
    pub fn get(&self, kdc: &dyn WebKdc, ring: &Keyring, now: u64) -> Result<Arc<ServiceToken>> {
        if let Some(token) = self.fresh(now) {
            return Ok(token);
        }
        let _guard = match self.renew.try_lock() {
            Some(guard) => guard,
            None => {
                if let Some(token) = self.current.load_full().filter(|t| !t.is_expired(now)) {
                    debug!(expiration = token.expiration, "Renewal in progress, using cached service token");
                    return Ok(token);
                }
                self.renew.lock()
            }
        };
        if let Some(token) = self.fresh(now) {
            return Ok(token);
        }
        match kdc.request_service_token(now) {
            Ok(token) => {
                info!(expiration = token.expiration, "Obtained new service token");
                if let Some(path) = self.path.as_deref() {
                    if let Err(e) = write_cache(path, &token, ring, now) {
                        warn!(path = %path.display(), error = %e, "Cannot write service token cache");
                    }
                }
                let token = Arc::new(token);
                self.current.store(Some(Arc::clone(&token)));
                Ok(token)
            }
            Err(e) => match self.current.load_full() {
                Some(old) if !old.is_expired(now) => {
                    warn!(error = %e, "Service token renewal failed, using cached token");
                    Ok(old)
                }
                _ => Err(e),
            },
        }
    }
}

fn read_cache(path: &Path, ring: &Keyring) -> Result<ServiceToken> {
    let sealed = std::fs::read_to_string(path).map_err(|e| WebAuthError::External(e.to_string()))?;
    ServiceToken::unseal(&sealed, ring)
}

fn write_cache(path: &Path, token: &ServiceToken, ring: &Keyring, now: u64) -> Result<()> {
    let sealed = token.seal(ring, now)?;
    write_atomic(path, sealed.as_bytes()).map_err(|e| WebAuthError::External(e.to_string()))
}

// ============================================================
// TESTS
// ============================================================
