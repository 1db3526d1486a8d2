//! Per-request SSO flow for the enforcement point.
//!
//! Drives one request through:
//!
//! ```text
//! Start -> TokenDiscovery -> NeedsRedirectToAuthority
//!                         -> HasIdentity -> CredentialGathering -> Authenticated
//!
//! ErrorRedirect is reachable from any state
//! ```
//!
//! # Properties
//!
//! - **One decision per request**: the first redirect or denial ends the
//!   flow; nothing after it runs
//! - **Bad cookies are not errors**: an app, proxy or cred cookie that fails
//!   to decrypt or has expired is logged, staged for deletion and treated
//!   as absent
//! - **Rate-limited activity tracking**: the app cookie's last-used time is
//!   rewritten at most once per `last_use_update_interval`
//! - **Legacy tokens**: an app token with no last-used time is exempt from
//!   inactivity expiry

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::{CredSpec, DirConfig, ServerConfig};
use crate::error::WebAuthError;
use crate::keyring::{Key, KeyType, Keyring};
use crate::krb5::{CredentialType, KerberosLayer, SessionHandle};
use crate::request::{
    absolute_url, cred_cookie_name, is_logout_cookie, proxy_cookie_name, strip_markers, CookieJar, HttpRequest,
    Method, ReturnedTokens, APP_COOKIE,
};
use crate::store::SharedKeyring;
use crate::tokens::{
    decode_token_at, decode_token_with_key_at, encode_token_at, encode_token_with_key_at, AppToken, CredToken,
    ErrorToken, IdToken, ProxyToken, RequestToken, Token, TokenType, KRB5, LOGIN_CANCELED,
};
use crate::webkdc::{ServiceToken, ServiceTokenCache, WebKdc};

/// Failures that end a request with a server error
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("Token error: {0}")]
    Token(#[from] WebAuthError),
    #[error("Missing configuration: {0}")]
    MissingConfig(&'static str),
    #[error("No service token: {0}")]
    NoServiceToken(#[source] WebAuthError),
    #[error("Invalid URL {0:?}")]
    InvalidUrl(String),
}

/// Flow state, logged on every transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Start,
    TokenDiscovery,
    NeedsRedirectToAuthority,
    HasIdentity,
    CredentialGathering,
    Authenticated,
    ErrorRedirect,
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The authenticated user, handed to the integration layer
#[derive(Debug, Clone)]
pub struct Identity {
    pub subject: String,
    pub creation: u64,
    pub expiration: u64,
    /// Zero when activity is not tracked
    pub last_used: u64,
    /// Delegated credentials gathered for this request
    pub creds: Vec<CredToken>,
    /// Ticket cache holding `creds`, if any were materialised
    pub credential_cache: Option<SessionHandle>,
}

impl Identity {
    /// Environment variables describing the user
    ///
    /// Times are only exported when set. With a prefix every variable is
    /// exported a second time under the prefixed name. `KRB5CCNAME` points at
    /// the prepared ticket cache and is never prefixed.
    #[must_use]
    pub fn environment(&self, var_prefix: Option<&str>) -> Vec<(String, String)> {
        let mut vars = vec![("WEBAUTH_USER".to_owned(), self.subject.clone())];
        for (name, time) in [
            ("WEBAUTH_TOKEN_CREATION", self.creation),
            ("WEBAUTH_TOKEN_EXPIRATION", self.expiration),
            ("WEBAUTH_TOKEN_LASTUSED", self.last_used),
        ] {
            if time != 0 {
                vars.push((name.to_owned(), time.to_string()));
            }
        }
        if let Some(prefix) = var_prefix.filter(|p| !p.is_empty()) {
            let prefixed: Vec<_> = vars.iter().map(|(k, v)| (format!("{prefix}{k}"), v.clone())).collect();
            vars.extend(prefixed);
        }
        if let Some(cache) = &self.credential_cache {
            vars.push(("KRB5CCNAME".to_owned(), cache.0.clone()));
        }
        vars
    }
}

/// What the integration layer must do with the request
#[derive(Debug, Clone)]
pub enum Outcome {
    Authenticated(Identity),
    Redirect { location: String },
    Unauthorized,
    ServerError(String),
    LoggedOut,
}

#[derive(Debug, Clone)]
pub struct Response {
    pub outcome: Outcome,
    /// Cookie writes to send with the response, whatever the outcome
    pub cookies: CookieJar,
    /// Ask the integration layer to mark the response uncacheable
    pub dont_cache: bool,
}

/// Working set of one request
struct RequestState<'r> {
    req: &'r dyn HttpRequest,
    dir: &'r DirConfig,
    now: u64,
    https: bool,
    ring: Arc<Keyring>,
    state: FlowState,
    cookies: CookieJar,
    app: Option<AppToken>,
    /// Proxy tokens in hand, by proxy type
    proxies: HashMap<String, ProxyToken>,
    creds: Vec<CredToken>,
}

impl RequestState<'_> {
    fn enter(&mut self, next: FlowState) {
        debug!(from = %self.state, to = %next, "Flow transition");
        self.state = next;
    }

    fn subject(&self) -> Option<&str> {
        self.app.as_ref().and_then(|a| a.subject.as_deref())
    }

    /// Stage deletion of a cookie the request actually sent
    fn discard(&mut self, name: &str) {
        if self.req.cookie(name).is_some() {
            self.cookies.expire(name);
        }
    }
}

/// The enforcement point's side of the SSO protocol
pub struct SsoFlow<'a> {
    server: &'a ServerConfig,
    keyring: &'a SharedKeyring,
    service: &'a ServiceTokenCache,
    webkdc: &'a dyn WebKdc,
    kerberos: Option<&'a dyn KerberosLayer>,
}

impl<'a> SsoFlow<'a> {
    pub fn new(
        server: &'a ServerConfig,
        keyring: &'a SharedKeyring,
        service: &'a ServiceTokenCache,
        webkdc: &'a dyn WebKdc,
    ) -> Self {
        Self { server, keyring, service, webkdc, kerberos: None }
    }

    /// Enable `krb5` id tokens and credential materialisation
    #[must_use]
    pub fn with_kerberos(mut self, layer: &'a dyn KerberosLayer) -> Self {
        self.kerberos = Some(layer);
        self
    }

    /// Decide what to do with one request
    pub fn handle(&self, dir: &DirConfig, req: &dyn HttpRequest, now: u64) -> Response {
        let mut st = RequestState {
            req,
            dir,
            now,
            https: req.is_https(),
            ring: self.keyring.snapshot(),
            state: FlowState::Start,
            cookies: CookieJar::new(),
            app: None,
            proxies: HashMap::new(),
            creds: Vec::new(),
        };
        let outcome = match self.run(&mut st) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, url = %strip_markers(req.url()), "WebAuth request failed");
                Outcome::ServerError(e.to_string())
            }
        };
        Response {
            outcome,
            cookies: st.cookies,
            dont_cache: dir.dont_cache,
        }
    }

    fn run(&self, st: &mut RequestState<'_>) -> Result<Outcome, FlowError> {
        if st.dir.do_logout {
            return Ok(self.logout(st));
        }
        if self.server.require_ssl && !st.https {
            return self.insecure(st);
        }

        st.enter(FlowState::TokenDiscovery);
        let returned = ReturnedTokens::extract(st.req.url());
        if let Some(tokens) = &returned {
            if let Some(outcome) = self.check_url(st, tokens)? {
                return Ok(outcome);
            }
        }
        if st.app.is_none() {
            self.check_app_cookie(st)?;
        }
        if st.app.is_none() {
            return self.redirect_to_authority(st, None);
        }
        st.enter(FlowState::HasIdentity);

        if let Some(tokens) = returned {
            if st.dir.extra_redirect.unwrap_or(self.server.extra_redirect) {
                debug!(location = %tokens.clean_url, "Redirecting to strip returned tokens");
                return Ok(Outcome::Redirect { location: tokens.clean_url });
            }
        }

        if st.dir.use_creds && !st.dir.creds.is_empty() {
            st.enter(FlowState::CredentialGathering);
            if let Some(outcome) = self.gather_creds(st)? {
                return Ok(outcome);
            }
        }

        st.enter(FlowState::Authenticated);
        Ok(Outcome::Authenticated(self.identity(st)))
    }

    fn logout(&self, st: &mut RequestState<'_>) -> Outcome {
        for name in st.req.cookie_names() {
            if is_logout_cookie(&name) {
                st.cookies.expire(name);
            }
        }
        info!(cookies = st.cookies.iter().count(), "Logged out");
        Outcome::LoggedOut
    }

    fn insecure(&self, st: &RequestState<'_>) -> Result<Outcome, FlowError> {
        if !self.server.ssl_redirect {
            warn!("Rejecting request over plain HTTP");
            return Ok(Outcome::Unauthorized);
        }
        let bad = || FlowError::InvalidUrl(st.req.url().to_owned());
        let mut url = Url::parse(st.req.url()).map_err(|_| bad())?;
        url.set_scheme("https").map_err(|()| bad())?;
        url.set_port(self.server.ssl_redirect_port.filter(|p| *p != 443)).map_err(|()| bad())?;
        debug!(location = %url, "Redirecting to HTTPS");
        Ok(Outcome::Redirect { location: url.into() })
    }

    fn service_token(&self, st: &RequestState<'_>) -> Result<Arc<ServiceToken>, FlowError> {
        self.service
            .get(self.webkdc, &st.ring, st.now)
            .map_err(FlowError::NoServiceToken)
    }

    // ============================================================
    // RETURNED TOKENS
    // ============================================================

    /// Session key carried in the WEBAUTHS app state
    fn state_key(&self, st: &RequestState<'_>, state: &str) -> Result<Key, WebAuthError> {
        match decode_token_at(state, Some(TokenType::App), 0, &st.ring, st.now)? {
            Token::App(AppToken { session_key: Some(key), .. }) => Key::new(KeyType::Aes, key),
            _ => Err(WebAuthError::corrupt("app state has no session key")),
        }
    }

    /// Consume WEBAUTHR, returning an outcome only for an error token
    fn check_url(&self, st: &mut RequestState<'_>, tokens: &ReturnedTokens) -> Result<Option<Outcome>, FlowError> {
        let key = match &tokens.webauths {
            Some(state) => match self.state_key(st, state) {
                Ok(key) => key,
                Err(e) => {
                    warn!(error = %e, "Ignoring returned token with unusable app state");
                    return Ok(None);
                }
            },
            None => self.service_token(st)?.session_key.clone(),
        };
        let token = match decode_token_with_key_at(&tokens.webauthr, None, self.server.token_max_ttl, &key, st.now) {
            Ok(token) => token,
            Err(e) => {
                warn!(error = %e, "Ignoring unusable returned token");
                return Ok(None);
            }
        };
        debug!(kind = %token.token_type(), "Found returned token");
        match token {
            Token::Id(id) => self.handle_id_token(st, id)?,
            Token::Proxy(proxy) => self.handle_proxy_token(st, proxy)?,
            Token::Error(err) => return self.handle_error_token(st, &err).map(Some),
            other => warn!(kind = %other.token_type(), "Unhandled returned token type"),
        }
        Ok(None)
    }

    fn handle_id_token(&self, st: &mut RequestState<'_>, id: IdToken) -> Result<(), FlowError> {
        let subject = if id.auth == KRB5 {
            let (Some(layer), Some(data)) = (self.kerberos, id.auth_data.as_deref()) else {
                warn!("krb5 id token but no Kerberos layer configured");
                return Ok(());
            };
            match layer.verify_authenticator(data) {
                Ok(principal) => principal,
                Err(e) => {
                    warn!(error = %e, "Kerberos authenticator rejected");
                    return Ok(());
                }
            }
        } else {
            match id.subject {
                Some(subject) => subject,
                None => return Ok(()),
            }
        };
        info!(subject = %subject, auth = %id.auth, "Authenticated from id token");
        self.mint_app(st, subject, id.expiration)
    }

    fn handle_proxy_token(&self, st: &mut RequestState<'_>, proxy: ProxyToken) -> Result<(), FlowError> {
        let sealed = encode_token_at(&Token::Proxy(proxy.clone()), &st.ring, st.now)?;
        st.cookies.set(proxy_cookie_name(&proxy.proxy_type), sealed, st.https);
        info!(subject = %proxy.subject, proxy_type = %proxy.proxy_type, "Authenticated from proxy token");
        let (subject, expiration) = (proxy.subject.clone(), proxy.expiration);
        st.proxies.insert(proxy.proxy_type.clone(), proxy);
        self.mint_app(st, subject, expiration)
    }

    fn handle_error_token(&self, st: &mut RequestState<'_>, err: &ErrorToken) -> Result<Outcome, FlowError> {
        st.enter(FlowState::ErrorRedirect);
        let target = if err.code == LOGIN_CANCELED {
            info!("User canceled login");
            st.dir.login_canceled_url.as_deref().or(st.dir.failure_url.as_deref())
        } else {
            error!(code = err.code, message = %err.message, "WebKDC returned an error token");
            st.dir.failure_url.as_deref()
        };
        let target = target.ok_or(FlowError::MissingConfig("failure_url"))?;
        let location = absolute_url(target, st.req.url()).ok_or_else(|| FlowError::InvalidUrl(target.to_owned()))?;
        Ok(Outcome::Redirect { location })
    }

    /// Issue a new app cookie for `subject`
    fn mint_app(&self, st: &mut RequestState<'_>, subject: String, expiration: u64) -> Result<(), FlowError> {
        let dir = st.dir;
        let app = AppToken {
            subject: Some(subject),
            session_key: None,
            creation: st.now,
            expiration: if dir.app_token_lifetime > 0 {
                st.now.saturating_add(dir.app_token_lifetime)
            } else {
                expiration
            },
            last_used: if dir.last_use_update_interval > 0 { st.now } else { 0 },
        };
        let sealed = encode_token_at(&Token::App(app.clone()), &st.ring, st.now)?;
        st.cookies.set(APP_COOKIE, sealed, st.https);
        st.app = Some(app);
        Ok(())
    }

    // ============================================================
    // APP COOKIE
    // ============================================================

    fn check_app_cookie(&self, st: &mut RequestState<'_>) -> Result<(), FlowError> {
        let Some(value) = st.req.cookie(APP_COOKIE) else {
            return Ok(());
        };
        let mut app = match decode_token_at(value, Some(TokenType::App), 0, &st.ring, st.now) {
            Ok(Token::App(app)) if app.subject.is_some() => app,
            Ok(_) => {
                warn!("App cookie carries no subject");
                st.discard(APP_COOKIE);
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, "Discarding unusable app cookie");
                st.discard(APP_COOKIE);
                return Ok(());
            }
        };

        let dir = st.dir;
        if dir.inactive_expire > 0 && app.last_used != 0 && app.last_used.saturating_add(dir.inactive_expire) < st.now {
            debug!(last_used = app.last_used, "App cookie inactive too long");
            st.discard(APP_COOKIE);
            return Ok(());
        }
        let interval = dir.last_use_update_interval;
        if interval > 0 && app.last_used != 0 && app.last_used.saturating_add(interval) <= st.now {
            app.last_used = st.now;
            let sealed = encode_token_at(&Token::App(app.clone()), &st.ring, st.now)?;
            st.cookies.set(APP_COOKIE, sealed, st.https);
            debug!("Refreshed app cookie last used time");
        }
        st.app = Some(app);
        Ok(())
    }

    // ============================================================
    // REDIRECT
    // ============================================================

    fn return_url(&self, st: &RequestState<'_>) -> Result<String, FlowError> {
        let configured = match st.req.method() {
            Method::Get => st.dir.return_url.as_deref(),
            Method::Post => st.dir.post_return_url.as_deref(),
            Method::Other => None,
        };
        let url = match configured {
            Some(url) => absolute_url(url, st.req.url()).ok_or_else(|| FlowError::InvalidUrl(url.to_owned()))?,
            None => strip_markers(st.req.url()),
        };
        match url.strip_prefix("http:") {
            Some(rest) if st.dir.ssl_return => Ok(format!("https:{rest}")),
            _ => Ok(url),
        }
    }

    /// Send the browser to the WebKDC login page
    ///
    /// With `proxy_type` set a proxy token of that type is requested;
    /// otherwise the directory's credential settings decide.
    fn redirect_to_authority(
        &self,
        st: &mut RequestState<'_>,
        proxy_type: Option<&str>,
    ) -> Result<Outcome, FlowError> {
        st.enter(FlowState::NeedsRedirectToAuthority);
        let dir = st.dir;
        match st.req.method() {
            Method::Get => {}
            Method::Post if dir.post_return_url.is_some() => {}
            method => {
                debug!(?method, "Cannot redirect this request for login");
                return Ok(Outcome::Unauthorized);
            }
        }

        let service = self.service_token(st)?;
        let state = AppToken {
            session_key: Some(service.session_key.as_bytes().to_vec()),
            expiration: service.expiration,
            ..Default::default()
        };
        let state = encode_token_at(&Token::App(state), &st.ring, st.now)?;

        let proxy_type = proxy_type.or_else(|| dir.default_proxy_type());
        let mut request = RequestToken {
            options: RequestToken::options_for(dir.force_login, dir.login_canceled_url.is_some()),
            state: Some(state.into_bytes()),
            return_url: self.return_url(st)?,
            creation: st.now,
            ..Default::default()
        };
        match proxy_type {
            Some(proxy_type) => {
                request.requested_type = "proxy".into();
                request.proxy_type = Some(proxy_type.to_owned());
            }
            None => {
                request.requested_type = "id".into();
                request.auth = Some(self.server.subject_auth_type.clone());
            }
        }
        let sealed = encode_token_with_key_at(&Token::Request(request.clone()), &service.session_key, st.now)?;
        let location = format!("{}?RT={sealed};ST={}", self.server.login_url, service.token);
        info!(
            requested = %request.requested_type,
            return_url = %request.return_url,
            "Redirecting to WebKDC for login"
        );
        Ok(Outcome::Redirect { location })
    }

    // ============================================================
    // CREDENTIALS
    // ============================================================

    /// Held proxy token of `proxy_type`, or one from its cookie
    fn proxy_token(&self, st: &mut RequestState<'_>, proxy_type: &str) -> Option<ProxyToken> {
        if let Some(proxy) = st.proxies.get(proxy_type) {
            return Some(proxy.clone());
        }
        let name = proxy_cookie_name(proxy_type);
        let value = st.req.cookie(&name)?;
        match decode_token_at(value, Some(TokenType::Proxy), 0, &st.ring, st.now) {
            Ok(Token::Proxy(proxy)) if Some(proxy.subject.as_str()) == st.subject() => {
                st.proxies.insert(proxy_type.to_owned(), proxy.clone());
                Some(proxy)
            }
            Ok(_) => {
                warn!(cookie = %name, "Proxy cookie belongs to another user");
                st.discard(&name);
                None
            }
            Err(e) => {
                warn!(cookie = %name, error = %e, "Discarding unusable proxy cookie");
                st.discard(&name);
                None
            }
        }
    }

    /// Cached cred token for `slot`, if its cookie is usable
    fn cached_cred(&self, st: &mut RequestState<'_>, slot: &CredSpec) -> Option<CredToken> {
        let name = cred_cookie_name(&slot.cred_type, &slot.service);
        let value = st.req.cookie(&name)?;
        match decode_token_at(value, Some(TokenType::Cred), 0, &st.ring, st.now) {
            Ok(Token::Cred(cred))
                if Some(cred.subject.as_str()) == st.subject()
                    && cred.cred_type == slot.cred_type
                    && cred.service == slot.service =>
            {
                Some(cred)
            }
            Ok(_) => {
                warn!(cookie = %name, "Cred cookie does not match its slot");
                st.discard(&name);
                None
            }
            Err(e) => {
                warn!(cookie = %name, error = %e, "Discarding unusable cred cookie");
                st.discard(&name);
                None
            }
        }
    }

    fn gather_creds(&self, st: &mut RequestState<'_>) -> Result<Option<Outcome>, FlowError> {
        let dir = st.dir;
        let mut missing: BTreeMap<String, Vec<CredSpec>> = BTreeMap::new();
        for slot in &dir.creds {
            match self.cached_cred(st, slot) {
                Some(cred) => st.creds.push(cred),
                None => missing.entry(slot.cred_type.clone()).or_default().push(slot.clone()),
            }
        }

        for (proxy_type, wanted) in missing {
            let Some(proxy) = self.proxy_token(st, &proxy_type) else {
                debug!(proxy_type = %proxy_type, "No proxy token for missing credentials");
                return self.redirect_to_authority(st, Some(&proxy_type)).map(Some);
            };
            let service = self.service_token(st)?;
            let creds = match self.webkdc.get_creds(&service, &proxy, &wanted) {
                Ok(creds) => creds,
                Err(e) => {
                    error!(proxy_type = %proxy_type, error = %e, "Cannot obtain credentials from the WebKDC");
                    continue;
                }
            };
            for cred in creds {
                match encode_token_at(&Token::Cred(cred.clone()), &st.ring, st.now) {
                    Ok(sealed) => st.cookies.set(cred_cookie_name(&cred.cred_type, &cred.service), sealed, st.https),
                    Err(e) => {
                        warn!(service = %cred.service, error = %e, "Discarding credential from the WebKDC");
                        continue;
                    }
                }
                debug!(service = %cred.service, "Obtained delegated credential");
                st.creds.push(cred);
            }
        }
        Ok(None)
    }

    fn identity(&self, st: &mut RequestState<'_>) -> Identity {
        let credential_cache = match (self.kerberos, st.creds.is_empty()) {
            (_, true) => None,
            (Some(layer), false) => match CredentialType::Krb5.prepare_for_use(layer, &st.creds) {
                Ok(cache) => cache,
                Err(e) => {
                    error!(error = %e, "Cannot prepare delegated credentials");
                    None
                }
            },
            (None, false) => {
                warn!("Credentials gathered but no Kerberos layer configured");
                None
            }
        };
        let app = st.app.take().unwrap_or_default();
        Identity {
            subject: app.subject.unwrap_or_default(),
            creation: app.creation,
            expiration: app.expiration,
            last_used: app.last_used,
            creds: std::mem::take(&mut st.creds),
            credential_cache,
        }
    }
}

// ============================================================
// TESTS
// ============================================================
