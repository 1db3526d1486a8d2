//! Typed token kinds and their wire schemas.
//!
//! Each kind is a plain struct with a rule table. Encoding writes the type
//! attribute `t` first, then the fields in rule order, and seals the list with
//! [`crate::crypto`]. Decoding reverses that and rejects a token of the wrong
//! kind with `Corrupt`.
//!
//! Semantic checks run in both directions. Violations are `InvalidInput` when
//! encoding (caller bug) and `Corrupt` when decoding (bad token). On decode, a
//! token whose expiration time has passed is `Expired`.

use std::fmt;
use std::str::FromStr;

use url::Url;

use crate::attrs::AttrList;
use crate::crypto;
use crate::encoding::{decode_record, encode_into, Record, Rule, RuleKind, Value};
use crate::error::{Result, WebAuthError};
use crate::keyring::{Key, Keyring};
use crate::unix_now;

/// Attribute carrying the token type
pub const ATTR_TYPE: &str = "t";

/// Only credential and proxy type understood by this engine
pub const KRB5: &str = "krb5";
/// Subject authenticator type asserted directly by the WebKDC
pub const AUTH_WEBKDC: &str = "webkdc";

/// Request option: force the user to log in again
pub const OPTION_FORCE_LOGIN: &str = "fa";
/// Request option: the application handles a canceled login
pub const OPTION_LOGIN_CANCEL: &str = "lc";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenType {
    App,
    Cred,
    Error,
    Id,
    Proxy,
    Request,
    WebkdcService,
}

impl TokenType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            TokenType::App => "app",
            TokenType::Cred => "cred",
            TokenType::Error => "error",
            TokenType::Id => "id",
            TokenType::Proxy => "proxy",
            TokenType::Request => "req",
            TokenType::WebkdcService => "webkdc-service",
        }
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenType {
    type Err = WebAuthError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "app" => TokenType::App,
            "cred" => TokenType::Cred,
            "error" => TokenType::Error,
            "id" => TokenType::Id,
            "proxy" => TokenType::Proxy,
            "req" => TokenType::Request,
            "webkdc-service" => TokenType::WebkdcService,
            other => return Err(WebAuthError::corrupt(format!("unknown token type {other:?}"))),
        })
    }
}

/// Direction of a semantic check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    Encode,
    Decode,
}

impl Check {
    fn fail(self, kind: TokenType, msg: &str) -> WebAuthError {
        let msg = format!("{kind} token: {msg}");
        match self {
            Check::Encode => WebAuthError::InvalidInput(msg),
            Check::Decode => WebAuthError::Corrupt(msg),
        }
    }

    fn expiration(self, kind: TokenType, expiration: u64, now: u64) -> Result<()> {
        if expiration == 0 {
            return Err(self.fail(kind, "missing expiration"));
        }
        if self == Check::Decode && expiration < now {
            return Err(WebAuthError::Expired(format!("{kind} token expired at {expiration}")));
        }
        Ok(())
    }
}

/// A token kind with a wire schema
pub trait TokenKind: Sized {
    const TYPE: TokenType;
    const RULES: &'static [Rule];

    fn to_record(&self) -> Record;

    fn from_record(record: &Record) -> Result<Self>;

    fn check(&self, mode: Check, now: u64) -> Result<()>;
}

fn req_string(r: &Record, attr: &str) -> Result<String> {
    r.string(attr)
        .map(str::to_owned)
        .ok_or_else(|| WebAuthError::corrupt(format!("missing {attr}")))
}

fn req_data(r: &Record, attr: &str) -> Result<Vec<u8>> {
    r.data(attr)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| WebAuthError::corrupt(format!("missing {attr}")))
}

fn opt_string(r: &Record, attr: &str) -> Option<String> {
    r.string(attr).map(str::to_owned)
}

// An empty optional field is not written, so `Some` of an empty value
// reads back as `None`.
fn string(v: &Option<String>) -> Option<Value> {
    v.clone().filter(|s| !s.is_empty()).map(Value::String)
}

fn data(v: &Option<Vec<u8>>) -> Option<Value> {
    v.clone().filter(|d| !d.is_empty()).map(Value::Data)
}

// ============================================================
// APP
// ============================================================

/// Local session cookie, or the carrier of a session key for the returned
/// WEBAUTHS marker
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppToken {
    pub subject: Option<String>,
    pub session_key: Option<Vec<u8>>,
    pub creation: u64,
    pub expiration: u64,
    /// Zero when the token does not track activity
    pub last_used: u64,
}

impl TokenKind for AppToken {
    const TYPE: TokenType = TokenType::App;
    const RULES: &'static [Rule] = &[
        Rule::new("s", "subject", RuleKind::String).optional(),
        Rule::new("k", "session key", RuleKind::Data).optional(),
        Rule::new("lt", "last used time", RuleKind::Time).optional(),
        Rule::new("ct", "creation time", RuleKind::Time).creation(),
        Rule::new("et", "expiration time", RuleKind::Time),
    ];

    fn to_record(&self) -> Record {
        let mut r = Record::new();
        r.set_opt("s", string(&self.subject))
            .set_opt("k", data(&self.session_key))
            .set("lt", Value::Time(self.last_used))
            .set("ct", Value::Time(self.creation))
            .set("et", Value::Time(self.expiration));
        r
    }

    fn from_record(r: &Record) -> Result<Self> {
        Ok(Self {
            subject: opt_string(r, "s"),
            session_key: r.data("k").map(<[u8]>::to_vec),
            creation: r.time("ct").unwrap_or(0),
            expiration: r.time("et").unwrap_or(0),
            last_used: r.time("lt").unwrap_or(0),
        })
    }

    fn check(&self, mode: Check, now: u64) -> Result<()> {
        mode.expiration(Self::TYPE, self.expiration, now)?;
        match (&self.subject, &self.session_key) {
            (Some(_), None) => Ok(()),
            (None, Some(_)) if self.last_used == 0 => Ok(()),
            (None, Some(_)) => Err(mode.fail(Self::TYPE, "session key token with last used time")),
            (Some(_), Some(_)) => Err(mode.fail(Self::TYPE, "both subject and session key")),
            (None, None) => Err(mode.fail(Self::TYPE, "neither subject nor session key")),
        }
    }
}

// ============================================================
// CRED
// ============================================================

/// Cached delegated credential
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredToken {
    pub subject: String,
    pub cred_type: String,
    pub service: String,
    pub data: Vec<u8>,
    pub creation: u64,
    pub expiration: u64,
}

impl TokenKind for CredToken {
    const TYPE: TokenType = TokenType::Cred;
    const RULES: &'static [Rule] = &[
        Rule::new("s", "subject", RuleKind::String),
        Rule::new("crt", "credential type", RuleKind::String),
        Rule::new("crs", "credential service", RuleKind::String),
        Rule::new("crd", "credential data", RuleKind::Data),
        Rule::new("ct", "creation time", RuleKind::Time).creation(),
        Rule::new("et", "expiration time", RuleKind::Time),
    ];

    fn to_record(&self) -> Record {
        let mut r = Record::new();
        r.set("s", Value::String(self.subject.clone()))
            .set("crt", Value::String(self.cred_type.clone()))
            .set("crs", Value::String(self.service.clone()))
            .set("crd", Value::Data(self.data.clone()))
            .set("ct", Value::Time(self.creation))
            .set("et", Value::Time(self.expiration));
        r
    }

    fn from_record(r: &Record) -> Result<Self> {
        Ok(Self {
            subject: req_string(r, "s")?,
            cred_type: req_string(r, "crt")?,
            service: req_string(r, "crs")?,
            data: req_data(r, "crd")?,
            creation: r.time("ct").unwrap_or(0),
            expiration: r.time("et").unwrap_or(0),
        })
    }

    fn check(&self, mode: Check, now: u64) -> Result<()> {
        if self.cred_type != KRB5 {
            return Err(mode.fail(Self::TYPE, "unknown credential type"));
        }
        if self.subject.is_empty() || self.service.is_empty() || self.data.is_empty() {
            return Err(mode.fail(Self::TYPE, "empty subject, service or data"));
        }
        mode.expiration(Self::TYPE, self.expiration, now)
    }
}

// ============================================================
// ERROR
// ============================================================

/// Error code the WebKDC uses when the user canceled the login
pub const LOGIN_CANCELED: i32 = 16;

/// Failure reported by the WebKDC
///
/// The code travels as a decimal string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorToken {
    pub code: i32,
    pub message: String,
    pub creation: u64,
}

impl TokenKind for ErrorToken {
    const TYPE: TokenType = TokenType::Error;
    const RULES: &'static [Rule] = &[
        Rule::new("ec", "error code", RuleKind::String),
        Rule::new("em", "error message", RuleKind::String),
        Rule::new("ct", "creation time", RuleKind::Time).creation(),
    ];

    fn to_record(&self) -> Record {
        let mut r = Record::new();
        r.set("ec", Value::String(self.code.to_string()))
            .set("em", Value::String(self.message.clone()))
            .set("ct", Value::Time(self.creation));
        r
    }

    fn from_record(r: &Record) -> Result<Self> {
        Ok(Self {
            code: req_string(r, "ec")?
                .parse()
                .map_err(|_| WebAuthError::corrupt("error code is not a number"))?,
            message: req_string(r, "em")?,
            creation: r.time("ct").unwrap_or(0),
        })
    }

    fn check(&self, mode: Check, _now: u64) -> Result<()> {
        if self.code == 0 {
            return Err(mode.fail(Self::TYPE, "error code is zero"));
        }
        if self.message.is_empty() {
            return Err(mode.fail(Self::TYPE, "empty error message"));
        }
        Ok(())
    }
}

// ============================================================
// ID
// ============================================================

/// Identity assertion from the WebKDC
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdToken {
    pub subject: Option<String>,
    /// `webkdc` or `krb5`
    pub auth: String,
    /// Kerberos authenticator when `auth` is `krb5`
    pub auth_data: Option<Vec<u8>>,
    pub creation: u64,
    pub expiration: u64,
}

impl TokenKind for IdToken {
    const TYPE: TokenType = TokenType::Id;
    const RULES: &'static [Rule] = &[
        Rule::new("s", "subject", RuleKind::String).optional(),
        Rule::new("sa", "subject auth type", RuleKind::String),
        Rule::new("sad", "subject auth data", RuleKind::Data).optional(),
        Rule::new("ct", "creation time", RuleKind::Time).creation(),
        Rule::new("et", "expiration time", RuleKind::Time),
    ];

    fn to_record(&self) -> Record {
        let mut r = Record::new();
        r.set_opt("s", string(&self.subject))
            .set("sa", Value::String(self.auth.clone()))
            .set_opt("sad", data(&self.auth_data))
            .set("ct", Value::Time(self.creation))
            .set("et", Value::Time(self.expiration));
        r
    }

    fn from_record(r: &Record) -> Result<Self> {
        Ok(Self {
            subject: opt_string(r, "s"),
            auth: req_string(r, "sa")?,
            auth_data: r.data("sad").map(<[u8]>::to_vec),
            creation: r.time("ct").unwrap_or(0),
            expiration: r.time("et").unwrap_or(0),
        })
    }

    fn check(&self, mode: Check, now: u64) -> Result<()> {
        match self.auth.as_str() {
            AUTH_WEBKDC if self.subject.is_none() => {
                return Err(mode.fail(Self::TYPE, "webkdc authenticator without subject"));
            }
            KRB5 if self.auth_data.is_none() => {
                return Err(mode.fail(Self::TYPE, "krb5 authenticator without data"));
            }
            AUTH_WEBKDC | KRB5 => {}
            _ => return Err(mode.fail(Self::TYPE, "unknown subject auth type")),
        }
        mode.expiration(Self::TYPE, self.expiration, now)
    }
}

// ============================================================
// PROXY
// ============================================================

/// Lets the enforcement point obtain credentials on the user's behalf
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyToken {
    pub subject: String,
    pub proxy_type: String,
    /// Opaque webkdc-proxy token, only the WebKDC can read it
    pub webkdc_proxy: Vec<u8>,
    pub creation: u64,
    pub expiration: u64,
}

impl TokenKind for ProxyToken {
    const TYPE: TokenType = TokenType::Proxy;
    const RULES: &'static [Rule] = &[
        Rule::new("s", "subject", RuleKind::String),
        Rule::new("prt", "proxy type", RuleKind::String),
        Rule::new("wt", "webkdc proxy token", RuleKind::Data),
        Rule::new("ct", "creation time", RuleKind::Time).creation(),
        Rule::new("et", "expiration time", RuleKind::Time),
    ];

    fn to_record(&self) -> Record {
        let mut r = Record::new();
        r.set("s", Value::String(self.subject.clone()))
            .set("prt", Value::String(self.proxy_type.clone()))
            .set("wt", Value::Data(self.webkdc_proxy.clone()))
            .set("ct", Value::Time(self.creation))
            .set("et", Value::Time(self.expiration));
        r
    }

    fn from_record(r: &Record) -> Result<Self> {
        Ok(Self {
            subject: req_string(r, "s")?,
            proxy_type: req_string(r, "prt")?,
            webkdc_proxy: req_data(r, "wt")?,
            creation: r.time("ct").unwrap_or(0),
            expiration: r.time("et").unwrap_or(0),
        })
    }

    fn check(&self, mode: Check, now: u64) -> Result<()> {
        if self.proxy_type != KRB5 {
            return Err(mode.fail(Self::TYPE, "unknown proxy type"));
        }
        if self.subject.is_empty() || self.webkdc_proxy.is_empty() {
            return Err(mode.fail(Self::TYPE, "empty subject or proxy data"));
        }
        mode.expiration(Self::TYPE, self.expiration, now)
    }
}

// ============================================================
// REQUEST
// ============================================================

/// Authentication request sent to the WebKDC
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestToken {
    /// `id` or `proxy`
    pub requested_type: String,
    pub proxy_type: Option<String>,
    pub auth: Option<String>,
    /// Comma separated request options
    pub options: Option<String>,
    /// Returned unchanged by the WebKDC as WEBAUTHS
    pub state: Option<Vec<u8>>,
    pub return_url: String,
    pub creation: u64,
}

impl RequestToken {
    /// Build the options string from the two flags the flow sets
    #[must_use]
    pub fn options_for(force_login: bool, cancel_allowed: bool) -> Option<String> {
        let opts: Vec<&str> = [
            (force_login, OPTION_FORCE_LOGIN),
            (cancel_allowed, OPTION_LOGIN_CANCEL),
        ]
        .into_iter()
        .filter_map(|(on, name)| on.then_some(name))
        .collect();
        (!opts.is_empty()).then(|| opts.join(","))
    }

    #[must_use]
    pub fn has_option(&self, option: &str) -> bool {
        self.options
            .as_deref()
            .is_some_and(|o| o.split(',').any(|x| x.trim() == option))
    }
}

impl TokenKind for RequestToken {
    const TYPE: TokenType = TokenType::Request;
    const RULES: &'static [Rule] = &[
        Rule::new("rtt", "requested token type", RuleKind::String),
        Rule::new("sa", "subject auth type", RuleKind::String).optional(),
        Rule::new("prt", "proxy type", RuleKind::String).optional(),
        Rule::new("as", "application state", RuleKind::Data).optional(),
        Rule::new("ru", "return url", RuleKind::String),
        Rule::new("ro", "request options", RuleKind::String).optional(),
        Rule::new("ct", "creation time", RuleKind::Time).creation(),
    ];

    fn to_record(&self) -> Record {
        let mut r = Record::new();
        r.set("rtt", Value::String(self.requested_type.clone()))
            .set_opt("sa", string(&self.auth))
            .set_opt("prt", string(&self.proxy_type))
            .set_opt("as", data(&self.state))
            .set("ru", Value::String(self.return_url.clone()))
            .set_opt("ro", string(&self.options))
            .set("ct", Value::Time(self.creation));
        r
    }

    fn from_record(r: &Record) -> Result<Self> {
        Ok(Self {
            requested_type: req_string(r, "rtt")?,
            proxy_type: opt_string(r, "prt"),
            auth: opt_string(r, "sa"),
            options: opt_string(r, "ro"),
            state: r.data("as").map(<[u8]>::to_vec),
            return_url: req_string(r, "ru")?,
            creation: r.time("ct").unwrap_or(0),
        })
    }

    fn check(&self, mode: Check, _now: u64) -> Result<()> {
        match self.requested_type.as_str() {
            "id" if self.auth.is_none() => return Err(mode.fail(Self::TYPE, "id request without auth type")),
            "proxy" if self.proxy_type.is_none() => {
                return Err(mode.fail(Self::TYPE, "proxy request without proxy type"))
            }
            "id" | "proxy" => {}
            _ => return Err(mode.fail(Self::TYPE, "unknown requested token type")),
        }
        if !self.return_url.is_ascii() {
            return Err(mode.fail(Self::TYPE, "return url is not ASCII"));
        }
        match Url::parse(&self.return_url) {
            Ok(url) if url.has_host() => Ok(()),
            _ => Err(mode.fail(Self::TYPE, "return url is not absolute")),
        }
    }
}

// ============================================================
// WEBKDC SERVICE
// ============================================================

/// The enforcement point's credential with the WebKDC
///
/// Sealed under the WebKDC's own key; this side only ever sees it as an
/// opaque string, but the schema is kept so test doubles can mint one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebkdcServiceToken {
    pub subject: String,
    pub session_key: Vec<u8>,
    pub creation: u64,
    pub expiration: u64,
}

impl TokenKind for WebkdcServiceToken {
    const TYPE: TokenType = TokenType::WebkdcService;
    const RULES: &'static [Rule] = &[
        Rule::new("s", "subject", RuleKind::String),
        Rule::new("k", "session key", RuleKind::Data),
        Rule::new("ct", "creation time", RuleKind::Time).creation(),
        Rule::new("et", "expiration time", RuleKind::Time),
    ];

    fn to_record(&self) -> Record {
        let mut r = Record::new();
        r.set("s", Value::String(self.subject.clone()))
            .set("k", Value::Data(self.session_key.clone()))
            .set("ct", Value::Time(self.creation))
            .set("et", Value::Time(self.expiration));
        r
    }

    fn from_record(r: &Record) -> Result<Self> {
        Ok(Self {
            subject: req_string(r, "s")?,
            session_key: req_data(r, "k")?,
            creation: r.time("ct").unwrap_or(0),
            expiration: r.time("et").unwrap_or(0),
        })
    }

    fn check(&self, mode: Check, now: u64) -> Result<()> {
        mode.expiration(Self::TYPE, self.expiration, now)
    }
}

// ============================================================
// DISPATCH
// ============================================================

/// Any decoded token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    App(AppToken),
    Cred(CredToken),
    Error(ErrorToken),
    Id(IdToken),
    Proxy(ProxyToken),
    Request(RequestToken),
    WebkdcService(WebkdcServiceToken),
}

impl Token {
    #[must_use]
    pub fn token_type(&self) -> TokenType {
        match self {
            Token::App(_) => TokenType::App,
            Token::Cred(_) => TokenType::Cred,
            Token::Error(_) => TokenType::Error,
            Token::Id(_) => TokenType::Id,
            Token::Proxy(_) => TokenType::Proxy,
            Token::Request(_) => TokenType::Request,
            Token::WebkdcService(_) => TokenType::WebkdcService,
        }
    }
}

fn kind_to_attrs<T: TokenKind>(token: &T, now: u64) -> Result<AttrList> {
    token.check(Check::Encode, now)?;
    let mut attrs = AttrList::new();
    attrs.add_str(ATTR_TYPE, T::TYPE.as_str())?;
    encode_into(T::RULES, &token.to_record(), now, &mut attrs)?;
    Ok(attrs)
}

fn kind_from_attrs<T: TokenKind>(attrs: &AttrList, now: u64) -> Result<T> {
    let token = T::from_record(&decode_record(T::RULES, attrs)?)?;
    token.check(Check::Decode, now)?;
    Ok(token)
}

/// Validate a token and flatten it to attributes, type first
pub fn token_to_attrs(token: &Token, now: u64) -> Result<AttrList> {
    match token {
        Token::App(t) => kind_to_attrs(t, now),
        Token::Cred(t) => kind_to_attrs(t, now),
        Token::Error(t) => kind_to_attrs(t, now),
        Token::Id(t) => kind_to_attrs(t, now),
        Token::Proxy(t) => kind_to_attrs(t, now),
        Token::Request(t) => kind_to_attrs(t, now),
        Token::WebkdcService(t) => kind_to_attrs(t, now),
    }
}

/// Rebuild a token from decrypted attributes
///
/// With `expected` set, a token of any other type is `Corrupt`.
pub fn token_from_attrs(attrs: &AttrList, expected: Option<TokenType>, now: u64) -> Result<Token> {
    let kind: TokenType = attrs
        .get_str(ATTR_TYPE)
        .map_err(|_| WebAuthError::corrupt("token has no type"))?
        .parse()?;
    if let Some(want) = expected {
        if want != kind {
            return Err(WebAuthError::corrupt(format!("wrong token type {kind}, expected {want}")));
        }
    }
    Ok(match kind {
        TokenType::App => Token::App(kind_from_attrs(attrs, now)?),
        TokenType::Cred => Token::Cred(kind_from_attrs(attrs, now)?),
        TokenType::Error => Token::Error(kind_from_attrs(attrs, now)?),
        TokenType::Id => Token::Id(kind_from_attrs(attrs, now)?),
        TokenType::Proxy => Token::Proxy(kind_from_attrs(attrs, now)?),
        TokenType::Request => Token::Request(kind_from_attrs(attrs, now)?),
        TokenType::WebkdcService => Token::WebkdcService(kind_from_attrs(attrs, now)?),
    })
}

/// Seal a token with the keyring's current encryption key
pub fn encode_token(token: &Token, ring: &Keyring) -> Result<String> {
    encode_token_at(token, ring, unix_now())
}

pub fn encode_token_at(token: &Token, ring: &Keyring, now: u64) -> Result<String> {
    crypto::create(&token_to_attrs(token, now)?, now, ring)
}

/// Seal a token with a single key, such as a WebKDC session key
pub fn encode_token_with_key(token: &Token, key: &Key) -> Result<String> {
    encode_token_with_key_at(token, key, unix_now())
}

pub fn encode_token_with_key_at(token: &Token, key: &Key, now: u64) -> Result<String> {
    crypto::create_with_key(&token_to_attrs(token, now)?, now, key)
}

pub fn decode_token(token: &str, expected: Option<TokenType>, ttl: u64, ring: &Keyring) -> Result<Token> {
    decode_token_at(token, expected, ttl, ring, unix_now())
}

pub fn decode_token_at(
    token: &str,
    expected: Option<TokenType>,
    ttl: u64,
    ring: &Keyring,
    now: u64,
) -> Result<Token> {
    let attrs = crypto::parse_at(token, ttl, ring, now)?;
    token_from_attrs(&attrs, expected, now)
}

pub fn decode_token_with_key(token: &str, expected: Option<TokenType>, ttl: u64, key: &Key) -> Result<Token> {
    decode_token_with_key_at(token, expected, ttl, key, unix_now())
}

pub fn decode_token_with_key_at(
    token: &str,
    expected: Option<TokenType>,
    ttl: u64,
    key: &Key,
    now: u64,
) -> Result<Token> {
    let attrs = crypto::parse_with_key_at(token, ttl, key, now)?;
    token_from_attrs(&attrs, expected, now)
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyring::KeyType;

    const NOW: u64 = 1_700_000_000;

    fn ring() -> Keyring {
        let mut ring = Keyring::new();
        ring.add(1, 1, u64::from(u32::MAX), Key::new(KeyType::Aes, vec![5; 16]).unwrap());
        ring
    }

    fn app(subject: &str) -> AppToken {
        AppToken {
            subject: Some(subject.into()),
            expiration: NOW + 3600,
            ..Default::default()
        }
    }

    fn round_trip(token: Token) -> Token {
        let attrs = token_to_attrs(&token, NOW).unwrap();
        token_from_attrs(&attrs, Some(token.token_type()), NOW).unwrap()
    }

    #[test]
    fn test_type_names() {
        for t in [
            TokenType::App,
            TokenType::Cred,
            TokenType::Error,
            TokenType::Id,
            TokenType::Proxy,
            TokenType::Request,
            TokenType::WebkdcService,
        ] {
            assert_eq!(t.as_str().parse::<TokenType>().unwrap(), t);
        }
        assert!("bogus".parse::<TokenType>().is_err());
    }

    #[test]
    fn test_type_attribute_first_and_creation_filled() {
        let attrs = token_to_attrs(&Token::App(app("alice")), NOW).unwrap();
        assert_eq!(attrs.iter().next().unwrap().name, ATTR_TYPE);
        assert_eq!(attrs.get_time("ct").unwrap(), NOW);
        assert!(attrs.find("lt").is_none());
        assert!(attrs.find("k").is_none());
    }

    #[test]
    fn test_app_round_trip_through_cipher() {
        let ring = ring();
        let now = unix_now();
        let token = AppToken {
            subject: Some("alice".into()),
            expiration: now + 3600,
            last_used: now,
            ..Default::default()
        };
        let sealed = encode_token(&Token::App(token.clone()), &ring).unwrap();
        let Token::App(back) = decode_token(&sealed, Some(TokenType::App), 60, &ring).unwrap() else {
            panic!("expected app token");
        };
        assert_eq!(back.subject.as_deref(), Some("alice"));
        assert_eq!(back.last_used, now);
        assert_eq!(back.expiration, token.expiration);
    }

    #[test]
    fn test_wrong_type_rejected() {
        let attrs = token_to_attrs(&Token::App(app("alice")), NOW).unwrap();
        let err = token_from_attrs(&attrs, Some(TokenType::Id), NOW).unwrap_err();
        assert!(matches!(err, WebAuthError::Corrupt(_)));
    }

    #[test]
    fn test_expired_on_decode_only() {
        let mut token = app("alice");
        token.expiration = NOW - 1;
        let attrs = token_to_attrs(&Token::App(token), NOW).unwrap();
        let err = token_from_attrs(&attrs, None, NOW).unwrap_err();
        assert!(matches!(err, WebAuthError::Expired(_)));
    }

    #[test]
    fn test_app_checks() {
        let both = AppToken {
            subject: Some("a".into()),
            session_key: Some(vec![1; 16]),
            expiration: NOW + 1,
            ..Default::default()
        };
        assert!(matches!(token_to_attrs(&Token::App(both), NOW), Err(WebAuthError::InvalidInput(_))));

        let key_only = AppToken {
            session_key: Some(vec![1; 16]),
            expiration: NOW + 1,
            ..Default::default()
        };
        let back = round_trip(Token::App(key_only.clone()));
        assert_eq!(back, Token::App(AppToken { creation: NOW, ..key_only }));

        let no_exp = AppToken { subject: Some("a".into()), ..Default::default() };
        assert!(token_to_attrs(&Token::App(no_exp), NOW).is_err());
    }

    #[test]
    fn test_id_checks() {
        let krb = IdToken {
            auth: KRB5.into(),
            auth_data: Some(b"authenticator".to_vec()),
            expiration: NOW + 10,
            ..Default::default()
        };
        assert!(matches!(round_trip(Token::Id(krb)), Token::Id(_)));

        let webkdc_no_subject = IdToken { auth: AUTH_WEBKDC.into(), expiration: NOW + 10, ..Default::default() };
        assert!(token_to_attrs(&Token::Id(webkdc_no_subject), NOW).is_err());

        let unknown = IdToken {
            subject: Some("a".into()),
            auth: "password".into(),
            expiration: NOW + 10,
            ..Default::default()
        };
        assert!(token_to_attrs(&Token::Id(unknown), NOW).is_err());
    }

    #[test]
    fn test_request_checks() {
        let good = RequestToken {
            requested_type: "id".into(),
            auth: Some(AUTH_WEBKDC.into()),
            options: RequestToken::options_for(true, true),
            return_url: "https://app.example.com/private/".into(),
            ..Default::default()
        };
        let Token::Request(back) = round_trip(Token::Request(good.clone())) else {
            panic!("expected request token");
        };
        assert_eq!(back.options.as_deref(), Some("fa,lc"));
        assert!(back.has_option(OPTION_LOGIN_CANCEL));

        let relative = RequestToken { return_url: "/private/".into(), ..good.clone() };
        assert!(token_to_attrs(&Token::Request(relative), NOW).is_err());

        let proxy_no_type = RequestToken { requested_type: "proxy".into(), ..good.clone() };
        assert!(token_to_attrs(&Token::Request(proxy_no_type), NOW).is_err());

        let non_ascii = RequestToken { return_url: "https://exämple.com/".into(), ..good };
        assert!(token_to_attrs(&Token::Request(non_ascii), NOW).is_err());
    }

    #[test]
    fn test_empty_optional_fields_read_back_absent() {
        let token = RequestToken {
            requested_type: "id".into(),
            auth: Some(AUTH_WEBKDC.into()),
            options: Some(String::new()),
            state: Some(Vec::new()),
            return_url: "https://app.example.com/private/".into(),
            ..Default::default()
        };
        let attrs = token_to_attrs(&Token::Request(token), NOW).unwrap();
        assert!(attrs.find("ro").is_none());
        assert!(attrs.find("as").is_none());
        let Token::Request(back) = token_from_attrs(&attrs, Some(TokenType::Request), NOW).unwrap() else {
            panic!("expected request token");
        };
        assert_eq!(back.options, None);
        assert_eq!(back.state, None);
    }

    #[test]
    fn test_request_options_absent() {
        assert_eq!(RequestToken::options_for(false, false), None);
        assert_eq!(RequestToken::options_for(false, true).as_deref(), Some("lc"));
    }

    #[test]
    fn test_cred_and_proxy_require_krb5() {
        let cred = CredToken {
            subject: "alice".into(),
            cred_type: "x509".into(),
            service: "host/db".into(),
            data: vec![1],
            expiration: NOW + 5,
            ..Default::default()
        };
        assert!(token_to_attrs(&Token::Cred(cred.clone()), NOW).is_err());
        let cred = CredToken { cred_type: KRB5.into(), ..cred };
        assert!(matches!(round_trip(Token::Cred(cred)), Token::Cred(_)));

        let proxy = ProxyToken {
            subject: "alice".into(),
            proxy_type: KRB5.into(),
            webkdc_proxy: vec![9; 8],
            expiration: NOW + 5,
            ..Default::default()
        };
        assert!(matches!(round_trip(Token::Proxy(proxy)), Token::Proxy(_)));
    }

    #[test]
    fn test_error_token() {
        let err = ErrorToken { code: LOGIN_CANCELED, message: "user canceled".into(), creation: 0 };
        let attrs = token_to_attrs(&Token::Error(err.clone()), NOW).unwrap();
        assert_eq!(attrs.get_str("ec").unwrap(), "16");
        let Token::Error(back) = round_trip(Token::Error(err)) else {
            panic!("expected error token");
        };
        assert_eq!(back.code, LOGIN_CANCELED);
        assert_eq!(back.creation, NOW);
        assert!(token_to_attrs(&Token::Error(ErrorToken::default()), NOW).is_err());
    }

    #[test]
    fn test_non_numeric_error_code_is_corrupt() {
        let mut attrs = AttrList::new();
        attrs.add_str(ATTR_TYPE, "error").unwrap();
        attrs.add_str("ec", "sixteen").unwrap();
        attrs.add_str("em", "bad").unwrap();
        attrs.add_time("ct", NOW).unwrap();
        assert!(matches!(token_from_attrs(&attrs, None, NOW), Err(WebAuthError::Corrupt(_))));
    }

    #[test]
    fn test_missing_type_is_corrupt() {
        let mut attrs = AttrList::new();
        attrs.add_str("s", "alice").unwrap();
        assert!(matches!(token_from_attrs(&attrs, None, NOW), Err(WebAuthError::Corrupt(_))));
    }

    #[test]
    fn test_decode_missing_required_attribute() {
        let mut attrs = AttrList::new();
        attrs.add_str(ATTR_TYPE, "proxy").unwrap();
        attrs.add_str("s", "alice").unwrap();
        let err = token_from_attrs(&attrs, None, NOW).unwrap_err();
        assert!(matches!(err, WebAuthError::InvalidInput(_)));
    }
}
