//! TLS support for the relay hub
//!
//! Provides:
//! - Certificate and key loading from PEM files
//! - Self-signed certificate auto-generation using `rcgen` when no paths
//!   are configured
//! - SHA-256 fingerprint computation for trust-on-first-use
//! - A `rustls::ServerConfig` ready for `axum-server`

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{state_dir, Config};

/// Errors that can occur during TLS setup
#[derive(Error, Debug)]
pub enum TlsError {
    #[error("Failed to generate self-signed certificate: {0}")]
    CertGenerationFailed(String),

    #[error("Failed to read certificate file {path}: {message}")]
    CertReadError { path: String, message: String },

    #[error("Failed to read key file {path}: {message}")]
    KeyReadError { path: String, message: String },

    #[error("No certificates found in PEM file: {0}")]
    NoCertsFound(String),

    #[error("Failed to build TLS config: {0}")]
    ConfigBuildError(String),

    #[error("Failed to create TLS directory {path}: {message}")]
    DirCreationError { path: String, message: String },

    #[error("Failed to write certificate file {path}: {message}")]
    CertWriteError { path: String, message: String },

    #[error("Failed to write key file {path}: {message}")]
    KeyWriteError { path: String, message: String },
}

/// Result of TLS setup.
pub struct TlsSetupResult {
    /// The rustls server configuration, ready to use with axum-server
    pub server_config: Arc<rustls::ServerConfig>,
    /// SHA-256 fingerprint of the leaf certificate (hex, colon-separated)
    pub fingerprint: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Set up TLS from the relay configuration.
///
/// Configured cert/key paths are loaded from disk; when neither is set a
/// self-signed certificate is generated into `<state>/tls/` on first run.
/// A partially configured pair is an error.
pub fn setup_tls(config: &Config) -> Result<TlsSetupResult, TlsError> {
    let (cert_path, key_path) = match (&config.tls_cert_path, &config.tls_key_path) {
        (Some(cert), Some(key)) => {
            info!("Loading TLS certificate from configured paths");
            (cert.clone(), key.clone())
        }
        (None, None) => auto_generate_certificate()?,
        _ => {
            return Err(TlsError::ConfigBuildError(
                "tlsCertPath and tlsKeyPath must be set together".to_string(),
            ))
        }
    };

    let (server_config, fingerprint) = build_server_config(&cert_path, &key_path)?;
    Ok(TlsSetupResult {
        server_config,
        fingerprint,
        cert_path,
        key_path,
    })
}

/// Default TLS directory: `<state>/tls/`.
pub fn default_tls_dir() -> PathBuf {
    state_dir().join("tls")
}

/// Ensure a self-signed certificate exists in the default TLS directory,
/// generating one if necessary. Returns the cert and key paths.
fn auto_generate_certificate() -> Result<(PathBuf, PathBuf), TlsError> {
    let tls_dir = default_tls_dir();
    if !tls_dir.exists() {
        std::fs::create_dir_all(&tls_dir).map_err(|e| TlsError::DirCreationError {
            path: tls_dir.display().to_string(),
            message: e.to_string(),
        })?;
        debug!("Created TLS directory: {}", tls_dir.display());
    }

    let cert_path = tls_dir.join("cert.pem");
    let key_path = tls_dir.join("key.pem");

    if !cert_path.exists() || !key_path.exists() {
        generate_self_signed_cert(&cert_path, &key_path)?;
        info!(
            "Generated self-signed certificate at {}",
            cert_path.display()
        );
    } else {
        info!(
            "Using existing self-signed certificate at {}",
            cert_path.display()
        );
    }

    Ok((cert_path, key_path))
}

/// Load certificates and key, compute the fingerprint, and assemble a
/// `rustls::ServerConfig`.
fn build_server_config(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(Arc<rustls::ServerConfig>, String), TlsError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let fingerprint = compute_cert_fingerprint(&certs[0]);

    // Installing the provider is idempotent; a second call errors harmlessly.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TlsError::ConfigBuildError(e.to_string()))?;

    Ok((Arc::new(server_config), fingerprint))
}

/// Generate a self-signed certificate and private key as PEM files.
///
/// Valid for "localhost", 127.0.0.1, and ::1, plus the machine hostname.
pub fn generate_self_signed_cert(cert_path: &Path, key_path: &Path) -> Result<(), TlsError> {
    use rcgen::{CertificateParams, KeyPair, SanType};

    let mut names = vec!["localhost".to_string()];
    if let Ok(hostname) = std::env::var("HOSTNAME") {
        if !hostname.is_empty() {
            names.push(hostname);
        }
    }

    let mut params = CertificateParams::new(names)
        .map_err(|e| TlsError::CertGenerationFailed(e.to_string()))?;

    params.subject_alt_names.push(SanType::IpAddress(
        std::net::IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1)),
    ));
    params.subject_alt_names.push(SanType::IpAddress(
        std::net::IpAddr::V6(std::net::Ipv6Addr::LOCALHOST),
    ));

    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "Claude Relay Hub");

    let key_pair =
        KeyPair::generate().map_err(|e| TlsError::CertGenerationFailed(e.to_string()))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| TlsError::CertGenerationFailed(e.to_string()))?;

    std::fs::write(cert_path, cert.pem().as_bytes()).map_err(|e| TlsError::CertWriteError {
        path: cert_path.display().to_string(),
        message: e.to_string(),
    })?;
    std::fs::write(key_path, key_pair.serialize_pem().as_bytes()).map_err(|e| {
        TlsError::KeyWriteError {
            path: key_path.display().to_string(),
            message: e.to_string(),
        }
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        if let Err(e) = std::fs::set_permissions(key_path, perms) {
            warn!("Failed to set restrictive permissions on key file: {}", e);
        }
    }

    Ok(())
}

/// Load certificates from a PEM file
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs: Vec<CertificateDer<'static>> = CertificateDer::pem_file_iter(path)
        .map_err(|e| TlsError::CertReadError {
            path: path.display().to_string(),
            message: e.to_string(),
        })?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::CertReadError {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

    if certs.is_empty() {
        return Err(TlsError::NoCertsFound(path.display().to_string()));
    }
    Ok(certs)
}

/// Load the private key from a PEM file
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    PrivateKeyDer::from_pem_file(path).map_err(|e| TlsError::KeyReadError {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// SHA-256 fingerprint of a DER certificate, colon-separated uppercase hex.
pub fn compute_cert_fingerprint(cert: &CertificateDer<'_>) -> String {
    let digest = Sha256::digest(cert.as_ref());
    digest
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}
