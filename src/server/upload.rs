//! File upload handling.
//!
//! Uploads are small base64 payloads written into the target session's
//! working directory. The filename is sanitized to a single path
//! component and the resolved destination must remain under the session
//! cwd; violations fail closed with no side effects.

use std::path::{Component, Path};

use base64::Engine;
use thiserror::Error;

/// Characters never allowed in a stored filename.
const FORBIDDEN: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|', '\0'];

/// Maximum stored filename length in bytes.
const MAX_FILENAME_LEN: usize = 255;

#[derive(Debug, Error, PartialEq)]
pub enum UploadError {
    #[error("uploads are disabled")]
    Disabled,
    #[error("file exceeds the {max} byte upload limit")]
    TooLarge { max: u64 },
    #[error("invalid base64 payload")]
    BadEncoding,
    #[error("invalid filename")]
    BadFilename,
    #[error("destination escapes the session directory")]
    PathEscape,
    #[error("write failed: {0}")]
    Write(String),
}

/// Sanitize a client-supplied filename into a single safe path component.
///
/// Path segments are split on separators with `.`/`..` segments dropped,
/// the remainder joined with underscores; reserved characters become
/// underscores; leading and trailing dots/spaces are stripped; the result
/// is capped at 255 bytes. Empty results are rejected.
/// Idempotent: sanitizing an already-sanitized name is a no-op.
pub fn sanitize_filename(raw: &str) -> Result<String, UploadError> {
    let mut name = raw
        .split(['/', '\\'])
        .filter(|seg| !seg.is_empty() && *seg != "." && *seg != "..")
        .collect::<Vec<_>>()
        .join("_");

    name = name
        .chars()
        .map(|c| {
            if FORBIDDEN.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();

    name = name
        .trim_matches(|c: char| c == '.' || c == ' ')
        .to_string();

    if name.len() > MAX_FILENAME_LEN {
        name.truncate(crate::util::floor_char_boundary(&name, MAX_FILENAME_LEN));
        name = name
            .trim_matches(|c: char| c == '.' || c == ' ')
            .to_string();
    }

    if name.is_empty() {
        return Err(UploadError::BadFilename);
    }
    Ok(name)
}

/// Check that the client-supplied name, joined onto the session cwd and
/// lexically resolved, stays inside the session cwd. A name that climbs
/// out (or is absolute) is rejected outright rather than silently
/// flattened into a safe one.
pub fn check_containment(session_cwd: &Path, raw_filename: &str) -> Result<(), UploadError> {
    let mut resolved = session_cwd.to_path_buf();
    for component in Path::new(raw_filename).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() {
                    return Err(UploadError::PathEscape);
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(UploadError::PathEscape)
            }
        }
    }
    if resolved.starts_with(session_cwd) {
        Ok(())
    } else {
        Err(UploadError::PathEscape)
    }
}

/// Decode, validate, and write an upload. Returns the stored filename.
pub fn handle_upload(
    enabled: bool,
    max_bytes: u64,
    session_cwd: &Path,
    raw_filename: &str,
    base64_data: &str,
    declared_size: u64,
) -> Result<String, UploadError> {
    if !enabled {
        return Err(UploadError::Disabled);
    }
    if declared_size > max_bytes {
        return Err(UploadError::TooLarge { max: max_bytes });
    }

    let filename = sanitize_filename(raw_filename)?;
    check_containment(session_cwd, raw_filename)?;
    let dest = session_cwd.join(&filename);

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(base64_data)
        .map_err(|_| UploadError::BadEncoding)?;
    if bytes.len() as u64 > max_bytes {
        return Err(UploadError::TooLarge { max: max_bytes });
    }

    std::fs::write(&dest, &bytes).map_err(|e| UploadError::Write(e.to_string()))?;
    Ok(filename)
}
