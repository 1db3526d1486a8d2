//! The HTTP side of the flow: request view, staged cookies, URL markers.
//!
//! The enforcement point never talks to a web server directly. It reads the
//! request through [`HttpRequest`] and collects every cookie it wants written
//! in a [`CookieJar`], which the integration layer flushes once as
//! `Set-Cookie` headers.
//!
//! After login the WebKDC sends the browser back to the return URL with the
//! result appended as markers:
//!
//! ```text
//! https://app.example.com/private/?WEBAUTHR=<token>;;WEBAUTHS=<token>;
//! ```
//!
//! [`ReturnedTokens::extract`] pulls both tokens out and rebuilds the URL
//! without them.

use std::collections::BTreeMap;

use url::{form_urlencoded, Url};

/// App token cookie
pub const APP_COOKIE: &str = "webauth_at";
/// Prefix shared by every cookie the engine writes
pub const COOKIE_PREFIX: &str = "webauth_";
/// WebKDC proxy cookies belong to the login server and survive logout
const WEBKDC_COOKIE_PREFIX: &str = "webauth_wpt";

const RESULT_MARKER: &str = "WEBAUTHR=";
const STATE_MARKER: &str = "WEBAUTHS=";

/// Proxy token cookie for `proxy_type`
#[must_use]
pub fn proxy_cookie_name(proxy_type: &str) -> String {
    format!("webauth_pt_{proxy_type}")
}

/// Cred token cookie for a `(type, service)` pair
///
/// `=` is not allowed in a cookie name and shows up in Kerberos principals,
/// so it is replaced with `-`.
#[must_use]
pub fn cred_cookie_name(cred_type: &str, service: &str) -> String {
    format!("webauth_ct_{cred_type}_{}", service.replace('=', "-"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Other,
}

/// Read-only view of the request being authorised
pub trait HttpRequest {
    fn method(&self) -> Method;

    /// Absolute URL as received, markers included
    fn url(&self) -> &str;

    fn cookie(&self, name: &str) -> Option<&str>;

    /// Names of every cookie on the request
    fn cookie_names(&self) -> Vec<String>;

    fn is_https(&self) -> bool {
        Url::parse(self.url()).is_ok_and(|u| u.scheme() == "https")
    }
}

/// Owned request, for tests and simple integrations
#[derive(Debug, Clone)]
pub struct SimpleRequest {
    method: Method,
    url: String,
    cookies: BTreeMap<String, String>,
}

impl SimpleRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            cookies: BTreeMap::new(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::Post, url)
    }

    #[must_use]
    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    /// Parse a `Cookie:` header into the request
    #[must_use]
    pub fn with_cookie_header(mut self, header: &str) -> Self {
        for (name, value) in parse_cookie_header(header) {
            self.cookies.insert(name.to_owned(), value.to_owned());
        }
        self
    }
}

impl HttpRequest for SimpleRequest {
    fn method(&self) -> Method {
        self.method
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    fn cookie_names(&self) -> Vec<String> {
        self.cookies.keys().cloned().collect()
    }
}

fn parse_cookie_header(header: &str) -> impl Iterator<Item = (&str, &str)> {
    header.split(';').filter_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        let name = name.trim();
        (!name.is_empty()).then(|| (name, value.trim()))
    })
}

/// Remove the engine's cookies from a `Cookie:` header before it is
/// forwarded to a backend
///
/// Returns `None` when nothing is left.
#[must_use]
pub fn strip_webauth_cookies(header: &str) -> Option<String> {
    let kept: Vec<&str> = header
        .split(';')
        .map(str::trim)
        .filter(|pair| !pair.is_empty() && !pair.starts_with(COOKIE_PREFIX))
        .collect();
    (!kept.is_empty()).then(|| kept.join("; "))
}

/// True for cookies a logout must remove
#[must_use]
pub fn is_logout_cookie(name: &str) -> bool {
    name.starts_with(COOKIE_PREFIX) && !name.starts_with(WEBKDC_COOKIE_PREFIX)
}

// ============================================================
// COOKIES
// ============================================================

/// A staged cookie write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetCookie {
    pub name: String,
    /// `None` expires the cookie
    pub value: Option<String>,
    pub secure: bool,
}

impl SetCookie {
    /// `Set-Cookie` header value
    #[must_use]
    pub fn header_value(&self) -> String {
        match &self.value {
            Some(value) if self.secure => format!("{}={value}; path=/; secure", self.name),
            Some(value) => format!("{}={value}; path=/", self.name),
            None => format!("{}=; path=/; expires=Thu, 26-Mar-1998 00:00:01 GMT", self.name),
        }
    }
}

/// Cookie writes staged during one request, last write per name wins
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieJar {
    staged: Vec<SetCookie>,
}

impl CookieJar {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>, secure: bool) {
        self.stage(SetCookie {
            name: name.into(),
            value: Some(value.into()),
            secure,
        });
    }

    pub fn expire(&mut self, name: impl Into<String>) {
        self.stage(SetCookie {
            name: name.into(),
            value: None,
            secure: false,
        });
    }

    fn stage(&mut self, cookie: SetCookie) {
        self.staged.retain(|c| c.name != cookie.name);
        self.staged.push(cookie);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&SetCookie> {
        self.staged.iter().find(|c| c.name == name)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SetCookie> {
        self.staged.iter()
    }

    #[must_use]
    pub fn headers(&self) -> Vec<String> {
        self.staged.iter().map(SetCookie::header_value).collect()
    }
}

// ============================================================
// URL MARKERS
// ============================================================

/// Tokens the WebKDC appended to the return URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnedTokens {
    /// The result token: id, proxy or error
    pub webauthr: String,
    /// App state echoed back from the request token
    pub webauths: Option<String>,
    /// The request URL without the markers
    pub clean_url: String,
}

/// Byte offset in the query where the markers start
fn marker_start(query: &str) -> Option<usize> {
    if query.starts_with(RESULT_MARKER) {
        return Some(0);
    }
    query.find(&format!("?{RESULT_MARKER}"))
}

/// Percent-decode a token; `+`, `=` and `&` are literal base64 here
fn unescape(raw: &str) -> String {
    let escaped = raw.replace('+', "%2B").replace('=', "%3D").replace('&', "%26");
    form_urlencoded::parse(escaped.as_bytes())
        .next()
        .map(|(k, _)| k.into_owned())
        .unwrap_or_default()
}

fn marker_value<'a>(s: &'a str, marker: &str) -> Option<(&'a str, &'a str)> {
    let rest = s.strip_prefix(marker)?;
    rest.split_once(';')
}

impl ReturnedTokens {
    /// Find `WEBAUTHR=<t>;` and an optional `;WEBAUTHS=<t>;` in the query
    ///
    /// Returns `None` when the URL carries no result marker or either marker
    /// is not terminated.
    #[must_use]
    pub fn extract(url: &str) -> Option<Self> {
        let mut parsed = Url::parse(url).ok()?;
        let query = parsed.query()?.to_owned();
        let start = marker_start(&query)?;
        let body = query[start..].trim_start_matches('?');

        let (webauthr, rest) = marker_value(body, RESULT_MARKER)?;
        if webauthr.is_empty() {
            return None;
        }
        let webauths = match rest.trim_start_matches(';').strip_prefix(STATE_MARKER) {
            Some(s) => {
                let (ws, _) = s.split_once(';')?;
                (!ws.is_empty()).then(|| unescape(ws))
            }
            None => None,
        };

        let kept = &query[..start];
        parsed.set_query((!kept.is_empty()).then_some(kept));
        Some(Self {
            webauthr: unescape(webauthr),
            webauths,
            clean_url: parsed.into(),
        })
    }
}

/// The URL with any WebKDC markers removed
#[must_use]
pub fn strip_markers(url: &str) -> String {
    ReturnedTokens::extract(url).map_or_else(|| url.to_owned(), |t| t.clean_url)
}

/// Resolve a configured URL against the request
///
/// Absolute URLs pass through; a path starting with `/` is joined to the
/// request's scheme and host.
#[must_use]
pub fn absolute_url(configured: &str, request_url: &str) -> Option<String> {
    if let Ok(url) = Url::parse(configured) {
        return Some(url.into());
    }
    if !configured.starts_with('/') {
        return None;
    }
    Url::parse(request_url).ok()?.join(configured).ok().map(Into::into)
}

// ============================================================
// TESTS
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_names() {
        assert_eq!(proxy_cookie_name("krb5"), "webauth_pt_krb5");
        assert_eq!(
            cred_cookie_name("krb5", "service/db=primary@EXAMPLE.COM"),
            "webauth_ct_krb5_service/db-primary@EXAMPLE.COM"
        );
    }

    #[test]
    fn test_extract_both_markers() {
        let url = "https://app.example.com/private/page?WEBAUTHR=abc+/d==;;WEBAUTHS=xyz;";
        let tokens = ReturnedTokens::extract(url).unwrap();
        assert_eq!(tokens.webauthr, "abc+/d==");
        assert_eq!(tokens.webauths.as_deref(), Some("xyz"));
        assert_eq!(tokens.clean_url, "https://app.example.com/private/page");
    }

    #[test]
    fn test_extract_keeps_real_query() {
        let url = "https://app.example.com/p?x=1&y=2?WEBAUTHR=abc;";
        let tokens = ReturnedTokens::extract(url).unwrap();
        assert_eq!(tokens.webauthr, "abc");
        assert!(tokens.webauths.is_none());
        assert_eq!(tokens.clean_url, "https://app.example.com/p?x=1&y=2");
    }

    #[test]
    fn test_extract_unescapes() {
        let tokens = ReturnedTokens::extract("https://a.example.com/?WEBAUTHR=ab%3Dc;").unwrap();
        assert_eq!(tokens.webauthr, "ab=c");
    }

    #[test]
    fn test_extract_rejects_missing_or_unterminated() {
        assert!(ReturnedTokens::extract("https://a.example.com/p").is_none());
        assert!(ReturnedTokens::extract("https://a.example.com/p?q=WEBAUTHR=abc;").is_none());
        assert!(ReturnedTokens::extract("https://a.example.com/p?WEBAUTHR=abc").is_none());
        assert!(ReturnedTokens::extract("not a url").is_none());
        // A state token without its terminator spoils the whole set
        assert!(ReturnedTokens::extract("https://a.example.com/p?WEBAUTHR=abc;;WEBAUTHS=xyz").is_none());
        assert_eq!(
            strip_markers("https://a.example.com/p?WEBAUTHR=abc;;WEBAUTHS=xyz"),
            "https://a.example.com/p?WEBAUTHR=abc;;WEBAUTHS=xyz"
        );
        assert_eq!(strip_markers("https://a.example.com/p?q=1"), "https://a.example.com/p?q=1");
    }

    #[test]
    fn test_absolute_url() {
        let base = "https://app.example.com/private/page?x=1";
        assert_eq!(absolute_url("/failed", base).as_deref(), Some("https://app.example.com/failed"));
        assert_eq!(
            absolute_url("https://other.example.com/x", base).as_deref(),
            Some("https://other.example.com/x")
        );
        assert!(absolute_url("relative/path", base).is_none());
    }

    #[test]
    fn test_jar_last_write_wins() {
        let mut jar = CookieJar::new();
        jar.set(APP_COOKIE, "one", true);
        jar.expire(APP_COOKIE);
        jar.set("webauth_pt_krb5", "two", false);
        assert_eq!(jar.iter().count(), 2);
        assert!(jar.get(APP_COOKIE).unwrap().value.is_none());
        assert_eq!(
            jar.headers(),
            vec![
                "webauth_at=; path=/; expires=Thu, 26-Mar-1998 00:00:01 GMT".to_owned(),
                "webauth_pt_krb5=two; path=/".to_owned(),
            ]
        );
    }

    #[test]
    fn test_secure_cookie_header() {
        let mut jar = CookieJar::new();
        jar.set(APP_COOKIE, "v", true);
        assert_eq!(jar.headers(), vec!["webauth_at=v; path=/; secure".to_owned()]);
    }

    #[test]
    fn test_strip_webauth_cookies() {
        assert_eq!(
            strip_webauth_cookies("a=1; webauth_at=x; b=2").as_deref(),
            Some("a=1; b=2")
        );
        assert!(strip_webauth_cookies("webauth_at=x").is_none());
    }

    #[test]
    fn test_logout_cookie_selection() {
        assert!(is_logout_cookie("webauth_at"));
        assert!(is_logout_cookie("webauth_ct_krb5_host/db"));
        assert!(!is_logout_cookie("webauth_wpt_krb5"));
        assert!(!is_logout_cookie("session"));
    }

    #[test]
    fn test_request_https_and_cookie_header() {
        let req = SimpleRequest::get("https://a.example.com/")
            .with_cookie_header("webauth_at=abc; other=1");
        assert!(req.is_https());
        assert_eq!(req.cookie(APP_COOKIE), Some("abc"));
        assert_eq!(req.cookie_names(), vec!["other".to_owned(), "webauth_at".to_owned()]);
        assert!(!SimpleRequest::get("http://a.example.com/").is_https());
    }
}
