//! Authentication helpers
//!
//! Timing-safe token comparison, the bearer-token → session-cookie flow,
//! and the in-memory auth-session table with idle eviction.
//!
//! A request is authorized when it carries the configured bearer token
//! (`token` query parameter) or an unexpired session cookie. The first
//! token hit mints a 256-bit session token returned as an
//! `HttpOnly; Secure; SameSite=Strict` cookie; later requests prefer the
//! cookie so the token can be scrubbed from the URL.

use std::collections::HashMap;

use axum::http::HeaderMap;
use parking_lot::Mutex;

use crate::crypto::generate_hex_secret;
use crate::util::now_ms;

/// Cookie carrying the auth-session token.
pub const SESSION_COOKIE: &str = "relay_session";

/// Sessions idle longer than this are evicted.
pub const SESSION_IDLE_MS: u64 = 24 * 60 * 60 * 1000;
/// Cadence of the eviction sweep.
pub const SESSION_SWEEP_INTERVAL_SECS: u64 = 60 * 60;

/// Timing-safe string equality.
pub fn timing_safe_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut out = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        out |= x ^ y;
    }
    out == 0
}

#[derive(Debug, Clone)]
struct AuthSession {
    created: u64,
    last_seen: u64,
}

/// In-memory table of minted auth sessions.
#[derive(Debug)]
pub struct AuthSessionStore {
    sessions: Mutex<HashMap<String, AuthSession>>,
}

impl Default for AuthSessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthSessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Mint a fresh 256-bit session token.
    pub fn mint(&self) -> String {
        let token = generate_hex_secret(32).unwrap_or_else(|_| {
            // getrandom only fails on broken platforms; fall back to a
            // uuid pair rather than serving unauthenticated.
            format!(
                "{}{}",
                uuid::Uuid::new_v4().simple(),
                uuid::Uuid::new_v4().simple()
            )
        });
        let now = now_ms();
        self.sessions.lock().insert(
            token.clone(),
            AuthSession {
                created: now,
                last_seen: now,
            },
        );
        token
    }

    /// Validate a session token, extending it on success.
    pub fn validate(&self, token: &str) -> bool {
        let mut sessions = self.sessions.lock();
        let now = now_ms();
        match sessions.get_mut(token) {
            Some(session) if now.saturating_sub(session.last_seen) <= SESSION_IDLE_MS => {
                session.last_seen = now;
                true
            }
            Some(_) => {
                sessions.remove(token);
                false
            }
            None => false,
        }
    }

    /// Drop sessions idle past the cap.
    pub fn sweep(&self) {
        let now = now_ms();
        self.sessions
            .lock()
            .retain(|_, s| now.saturating_sub(s.last_seen) <= SESSION_IDLE_MS);
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    #[cfg(test)]
    fn age_session(&self, token: &str, last_seen: u64) {
        if let Some(s) = self.sessions.lock().get_mut(token) {
            s.last_seen = last_seen;
            s.created = last_seen;
        }
    }
}

/// Outcome of authenticating an incoming client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientAuth {
    /// Bearer token matched; a new session cookie should be issued.
    Token { mint_cookie: bool },
    /// An existing session cookie matched.
    Cookie,
    Denied,
}

/// Authenticate a client request from its query string and headers.
pub fn authenticate_client(
    configured_token: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    store: &AuthSessionStore,
) -> ClientAuth {
    if let Some(cookie_token) = extract_cookie(headers, SESSION_COOKIE) {
        if store.validate(&cookie_token) {
            return ClientAuth::Cookie;
        }
    }
    if let Some(token) = extract_query_param(query, "token") {
        if timing_safe_eq(&token, configured_token) {
            return ClientAuth::Token { mint_cookie: true };
        }
    }
    ClientAuth::Denied
}

/// Pull one parameter out of a raw query string.
pub fn extract_query_param(query: Option<&str>, name: &str) -> Option<String> {
    let query = query?;
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        if parts.next() == Some(name) {
            let value = parts.next().unwrap_or("");
            return Some(percent_decode(value));
        }
    }
    None
}

/// Pull one cookie value out of the Cookie header.
pub fn extract_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    for pair in raw.split(';') {
        let mut parts = pair.trim().splitn(2, '=');
        if parts.next() == Some(name) {
            return parts.next().map(|v| v.to_string());
        }
    }
    None
}

/// Build the Set-Cookie value for a freshly minted session.
pub fn session_cookie_value(token: &str) -> String {
    format!(
        "{}={}; HttpOnly; Secure; SameSite=Strict; Path=/",
        SESSION_COOKIE, token
    )
}

/// Minimal percent-decoding for query parameter values.
fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = &value[i + 1..i + 3];
            if let Ok(byte) = u8::from_str_radix(hex, 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        if bytes[i] == b'+' {
            out.push(b' ');
        } else {
            out.push(bytes[i]);
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn timing_safe_eq_basics() {
        assert!(timing_safe_eq("abc", "abc"));
        assert!(!timing_safe_eq("abc", "abd"));
        assert!(!timing_safe_eq("abc", "abcd"));
        assert!(timing_safe_eq("", ""));
    }

    #[test]
    fn mint_and_validate() {
        let store = AuthSessionStore::new();
        let token = store.mint();
        assert_eq!(token.len(), 64);
        assert!(store.validate(&token));
        assert!(!store.validate("bogus"));
    }

    #[test]
    fn idle_sessions_evicted() {
        let store = AuthSessionStore::new();
        let token = store.mint();
        store.age_session(&token, now_ms() - SESSION_IDLE_MS - 1_000);
        store.sweep();
        assert!(store.is_empty());
        assert!(!store.validate(&token));
    }

    #[test]
    fn validate_extends_session() {
        let store = AuthSessionStore::new();
        let token = store.mint();
        store.age_session(&token, now_ms() - SESSION_IDLE_MS + 5_000);
        assert!(store.validate(&token));
        store.sweep();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn authenticate_with_query_token() {
        let store = AuthSessionStore::new();
        let headers = HeaderMap::new();
        let auth = authenticate_client("secret", Some("token=secret"), &headers, &store);
        assert_eq!(auth, ClientAuth::Token { mint_cookie: true });

        let auth = authenticate_client("secret", Some("token=wrong"), &headers, &store);
        assert_eq!(auth, ClientAuth::Denied);

        let auth = authenticate_client("secret", None, &headers, &store);
        assert_eq!(auth, ClientAuth::Denied);
    }

    #[test]
    fn authenticate_prefers_cookie() {
        let store = AuthSessionStore::new();
        let session = store.mint();
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::COOKIE,
            HeaderValue::from_str(&format!("{}={}", SESSION_COOKIE, session)).unwrap(),
        );
        let auth = authenticate_client("secret", None, &headers, &store);
        assert_eq!(auth, ClientAuth::Cookie);
    }

    #[test]
    fn stale_cookie_falls_back_to_token() {
        let store = AuthSessionStore::new();
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::COOKIE,
            HeaderValue::from_static("relay_session=stale"),
        );
        let auth = authenticate_client("secret", Some("token=secret"), &headers, &store);
        assert_eq!(auth, ClientAuth::Token { mint_cookie: true });
    }

    #[test]
    fn query_param_extraction() {
        assert_eq!(
            extract_query_param(Some("a=1&token=t%20v&b=2"), "token").as_deref(),
            Some("t v")
        );
        assert_eq!(extract_query_param(Some("a=1"), "token"), None);
        assert_eq!(extract_query_param(None, "token"), None);
    }

    #[test]
    fn cookie_header_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::COOKIE,
            HeaderValue::from_static("theme=dark; relay_session=abc123; other=1"),
        );
        assert_eq!(
            extract_cookie(&headers, SESSION_COOKIE).as_deref(),
            Some("abc123")
        );
    }

    #[test]
    fn cookie_value_attributes() {
        let value = session_cookie_value("tok");
        assert!(value.starts_with("relay_session=tok"));
        assert!(value.contains("HttpOnly"));
        assert!(value.contains("Secure"));
        assert!(value.contains("SameSite=Strict"));
    }
}
