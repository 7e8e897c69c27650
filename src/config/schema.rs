//! Configuration validation.
//!
//! Produces a list of issues rather than failing on the first problem,
//! so startup logs show everything that needs fixing at once. Errors
//! abort hub startup; warnings do not.

use super::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone)]
pub struct Issue {
    pub severity: Severity,
    pub path: &'static str,
    pub message: String,
}

impl Issue {
    fn error(path: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            path,
            message: message.into(),
        }
    }

    fn warning(path: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            path,
            message: message.into(),
        }
    }
}

/// Validate a loaded configuration for hub use.
pub fn validate(config: &Config) -> Vec<Issue> {
    let mut issues = Vec::new();

    match config.auth_token.as_deref() {
        None | Some("") => issues.push(Issue::error(
            "authToken",
            "not set (set authToken or CLAUDE_RELAY_TOKEN)",
        )),
        Some(token) if token.len() < 16 => issues.push(Issue::warning(
            "authToken",
            "shorter than 16 characters; consider a longer secret",
        )),
        Some(_) => {}
    }

    if let Some(token) = config.agent_token.as_deref() {
        if !token.is_empty() && token.len() < 16 {
            issues.push(Issue::warning(
                "agentToken",
                "shorter than 16 characters; consider a longer secret",
            ));
        }
        if !token.is_empty() && config.auth_token.as_deref() == Some(token) {
            issues.push(Issue::warning(
                "agentToken",
                "identical to authToken; separate the keys",
            ));
        }
    }

    if config.port() == 0 {
        issues.push(Issue::error("port", "port 0 is not a valid listen port"));
    }

    match (&config.tls_cert_path, &config.tls_key_path) {
        (Some(cert), Some(key)) => {
            if !cert.exists() {
                issues.push(Issue::error(
                    "tlsCertPath",
                    format!("file not found: {}", cert.display()),
                ));
            }
            if !key.exists() {
                issues.push(Issue::error(
                    "tlsKeyPath",
                    format!("file not found: {}", key.display()),
                ));
            }
        }
        (None, None) => {}
        _ => issues.push(Issue::error(
            "tlsCertPath",
            "tlsCertPath and tlsKeyPath must be set together",
        )),
    }

    if let Some(dir) = &config.projects_dir {
        if !dir.is_dir() {
            issues.push(Issue::warning(
                "projectsDir",
                format!(
                    "{} does not exist yet; it will be created on first use",
                    dir.display()
                ),
            ));
        }
    }

    if let Some(dir) = &config.static_dir {
        if !dir.is_dir() {
            issues.push(Issue::error(
                "staticDir",
                format!("directory not found: {}", dir.display()),
            ));
        }
    }

    if config.max_upload_bytes() == 0 {
        issues.push(Issue::warning(
            "maxUploadBytes",
            "0 disables all uploads; set uploadEnabled=false instead",
        ));
    }

    if let Some(raw) = config.path_prefix.as_deref() {
        if raw.contains(char::is_whitespace) {
            issues.push(Issue::error("pathPrefix", "must not contain whitespace"));
        }
    }

    let geometry = config.pty_geometry();
    if geometry.cols == 0 || geometry.rows == 0 {
        issues.push(Issue::error(
            "ptyGeometry",
            "cols and rows must be non-zero",
        ));
    }

    issues
}

/// Whether any issue is severe enough to abort startup.
pub fn has_errors(issues: &[Issue]) -> bool {
    issues.iter().any(|i| i.severity == Severity::Error)
}
