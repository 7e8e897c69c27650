//! HTTP layer: the client endpoint, static assets, and path-prefix
//! handling.
//!
//! The root path serves either the client WebSocket upgrade or the
//! dashboard HTML depending on the request. Static assets (css/js/
//! images/fonts) bypass auth; HTML does not. The first successful bearer
//! token use mints an auth-session cookie so the client can scrub the
//! token from its URL.

use std::path::Path;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Redirect, Response};
use tracing::debug;

use crate::auth::{authenticate_client, session_cookie_value, ClientAuth};
use crate::server::{ws, HubState};

/// Fallback page served when no static directory is configured.
const EMBEDDED_INDEX: &str = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>Claude Relay</title></head>
<body>
<h1>Claude Relay hub</h1>
<p>The hub is running. Point the dashboard client at this host, or
configure <code>staticDir</code> to serve the bundled client.</p>
</body>
</html>
"#;

/// `/`: client WebSocket upgrade, or the dashboard HTML.
pub async fn root_handler(
    ws: Option<WebSocketUpgrade>,
    State(state): State<Arc<HubState>>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let auth = authenticate_client(
        &state.auth_token,
        uri.query(),
        &headers,
        &state.auth_sessions,
    );

    match ws {
        Some(upgrade) => ws::handle_upgrade(upgrade, state, auth != ClientAuth::Denied),
        None => serve_path(&state, "/", auth),
    }
}

/// Fallback route: path-prefix stripping plus static file resolution.
pub async fn static_handler(
    State(state): State<Arc<HubState>>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let raw_path = uri.path().to_string();

    let path = match state.config.path_prefix() {
        Some(prefix) => {
            if raw_path == prefix {
                // Bare prefix without trailing slash: redirect to the
                // prefixed root so relative asset URLs resolve.
                return Redirect::permanent(&format!("{}/", prefix)).into_response();
            }
            match raw_path.strip_prefix(&format!("{}/", prefix)) {
                Some(rest) => format!("/{}", rest),
                None => raw_path,
            }
        }
        None => raw_path,
    };

    if is_static_asset(&path) {
        return serve_path(&state, &path, ClientAuth::Cookie);
    }

    let auth = authenticate_client(
        &state.auth_token,
        uri.query(),
        &headers,
        &state.auth_sessions,
    );
    serve_path(&state, &path, auth)
}

/// Serve a resolved path with the given auth outcome. HTML requires auth;
/// assets were already exempted by the caller.
fn serve_path(state: &Arc<HubState>, path: &str, auth: ClientAuth) -> Response {
    if path.contains("..") {
        return (StatusCode::NOT_FOUND, "not found").into_response();
    }

    let requires_auth = !is_static_asset(path);
    if requires_auth && auth == ClientAuth::Denied {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }

    let mut response = match &state.config.static_dir {
        Some(dir) => serve_file(dir, path),
        None if path == "/" || path == "/index.html" => (
            [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
            EMBEDDED_INDEX,
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "not found").into_response(),
    };

    if let ClientAuth::Token { mint_cookie: true } = auth {
        let token = state.auth_sessions.mint();
        if let Ok(value) = header::HeaderValue::from_str(&session_cookie_value(&token)) {
            response.headers_mut().insert(header::SET_COOKIE, value);
            debug!("minted auth session cookie");
        }
    }
    response
}

fn serve_file(dir: &Path, path: &str) -> Response {
    let relative = if path == "/" {
        "index.html"
    } else {
        path.trim_start_matches('/')
    };
    let full = dir.join(relative);
    match std::fs::read(&full) {
        Ok(bytes) => (
            [(header::CONTENT_TYPE, content_type(&full))],
            bytes,
        )
            .into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}

/// Whether a request path names an asset that bypasses auth.
fn is_static_asset(path: &str) -> bool {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");
    matches!(
        ext,
        "css" | "js" | "mjs" | "map" | "png" | "jpg" | "jpeg" | "gif" | "svg" | "ico" | "woff"
            | "woff2" | "ttf" | "eot"
    )
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
        "html" => "text/html; charset=utf-8",
        "css" => "text/css",
        "js" | "mjs" => "application/javascript",
        "json" | "map" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asset_detection() {
        assert!(is_static_asset("/app.css"));
        assert!(is_static_asset("/bundle.js"));
        assert!(is_static_asset("/fonts/mono.woff2"));
        assert!(!is_static_asset("/"));
        assert!(!is_static_asset("/index.html"));
        assert!(!is_static_asset("/dashboard"));
    }

    #[test]
    fn content_types() {
        assert_eq!(content_type(Path::new("a.html")), "text/html; charset=utf-8");
        assert_eq!(content_type(Path::new("a.woff2")), "font/woff2");
        assert_eq!(content_type(Path::new("a.bin")), "application/octet-stream");
    }
}
