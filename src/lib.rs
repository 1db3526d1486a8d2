//! WebAuth - token engine for web single sign-on
//!
//! This crate implements the enforcement point side of WebAuth: the web
//! server that protects content and trusts a central login server (the
//! WebKDC) to authenticate users. It provides:
//! - A canonical attribute-list codec (`name=value;`)
//! - Authenticated encryption of attribute lists into transport-safe tokens
//! - A keyring of time-bounded keys with rotation and atomic persistence
//! - Typed token kinds (app, cred, error, id, proxy, request, service)
//! - A delegated Kerberos credential codec
//! - The per-request redirect flow
//!
//! ## Architecture
//!
//! ```text
//! HTTP integration (HttpRequest, CookieJar)
//!     ↓ handle(dir, request, now)
//! SsoFlow
//!     ├── ReturnedTokens   (WEBAUTHR / WEBAUTHS URL markers)
//!     ├── ServiceTokenCache → WebKdc       (login server)
//!     ├── CredentialType    → KerberosLayer (ticket caches)
//!     └── tokens (typed kinds + rule tables)
//!             ↓
//!         crypto (HKDF subkeys, AES-256-CBC, HMAC-SHA256)
//!             ↓
//!         attrs (name=value; codec)
//! SharedKeyring → KeyringStore (file / memory)
//! ```

#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod attrs;
pub mod config;
pub mod crypto;
pub mod encoding;
pub mod error;
pub mod keyring;
pub mod krb5;
pub mod request;
pub mod session;
pub mod store;
pub mod tokens;
pub mod webkdc;

use std::time::{SystemTime, UNIX_EPOCH};

pub use attrs::{AttrList, Attribute};
pub use config::{ConfigError, CredSpec, DirConfig, ServerConfig, Timeouts, WebAuthConfig};
pub use crypto::{create, create_with_key, parse, parse_with_key, token_length, MIN_TOKEN_LEN};
pub use error::{Result, WebAuthError};
pub use keyring::{Key, KeyType, KeyUsage, Keyring, KeyringEntry, RotationPolicy, RotationReport};
pub use krb5::{Credential, CredentialType, KerberosLayer, SessionHandle};
pub use request::{CookieJar, HttpRequest, Method, ReturnedTokens, SetCookie, SimpleRequest};
pub use session::{FlowError, FlowState, Identity, Outcome, Response, SsoFlow};
pub use store::{FileKeyringStore, InMemoryKeyringStore, KeyringStore, SharedKeyring};
pub use tokens::{
    decode_token, encode_token, AppToken, CredToken, ErrorToken, IdToken, ProxyToken, RequestToken, Token,
    TokenType, WebkdcServiceToken,
};
pub use webkdc::{ServiceToken, ServiceTokenCache, WebKdc};

/// Seconds since the Unix epoch; zero if the clock is before it
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}
