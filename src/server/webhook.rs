//! GitHub webhook endpoint.
//!
//! `POST /webhook/github` shares the hub listener. When a webhook secret
//! is configured, the `X-Hub-Signature-256` header must carry a valid
//! HMAC-SHA256 of the raw body; verification is skipped when no secret is
//! set. A verified delivery triggers the configured repo update command.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use tracing::{info, warn};

use super::HubState;
use std::sync::Arc;

type HmacSha256 = Hmac<Sha256>;

/// Verify a `sha256=<hex>` signature header against the raw body.
///
/// Constant-time comparison via the Mac verifier.
pub fn verify_signature(secret: &str, body: &[u8], signature_header: &str) -> bool {
    let Some(hex_sig) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

pub async fn github_webhook(
    State(state): State<Arc<HubState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(secret) = state.config.webhook_secret.as_deref() {
        let signature = headers
            .get("x-hub-signature-256")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !verify_signature(secret, &body, signature) {
            warn!("webhook signature mismatch");
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "invalid signature" })),
            )
                .into_response();
        }
    }

    let event = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");
    info!(event, "webhook received");

    if let Some(command) = state.config.webhook_command.as_deref() {
        let command = command.to_string();
        tokio::spawn(async move {
            match tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&command)
                .output()
                .await
            {
                Ok(output) if output.status.success() => {
                    info!("webhook command completed");
                }
                Ok(output) => {
                    warn!(code = ?output.status.code(), "webhook command failed");
                }
                Err(err) => warn!(error = %err, "webhook command did not start"),
            }
        });
    }

    (StatusCode::OK, Json(json!({ "ok": true }))).into_response()
}
