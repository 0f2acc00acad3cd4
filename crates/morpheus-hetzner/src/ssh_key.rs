//! SSH key fingerprinting and the reconciliation decision tree.
//!
//! The HTTP calls (list-by-name, upload) live on [`crate::HetznerProvider`];
//! this module is the pure, provider-agnostic part: computing the MD5
//! fingerprint and deciding what to do given the provider's current answer.

use base64::Engine;
use morpheus_core::{MorpheusError, MorpheusResult, SSHKeyHandle};
use std::path::{Path, PathBuf};

/// Computes the MD5 fingerprint of an SSH public key line, rendered as 32
/// hex digits in 16 colon-separated pairs.
pub fn fingerprint(public_key_line: &str) -> MorpheusResult<String> {
    let body = public_key_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| MorpheusError::ConfigInvalid("malformed SSH public key: missing body field".into()))?;

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(body)
        .map_err(|e| MorpheusError::ConfigInvalid(format!("SSH public key body is not valid base64: {e}")))?;

    let digest = md5::compute(&decoded);
    let hex = format!("{digest:x}");
    let pairs: Vec<String> = hex
        .as_bytes()
        .chunks(2)
        .map(|c| std::str::from_utf8(c).unwrap().to_string())
        .collect();
    Ok(pairs.join(":"))
}

/// Locates the local public key: an explicit path, or a probe of
/// `~/.ssh/id_ed25519.pub` then `~/.ssh/id_rsa.pub`.
pub fn read_local_public_key(explicit_path: Option<&Path>) -> MorpheusResult<String> {
    if let Some(path) = explicit_path {
        return std::fs::read_to_string(path)
            .map(|s| s.trim().to_string())
            .map_err(|e| MorpheusError::ConfigInvalid(format!("failed to read SSH key at {}: {e}", path.display())));
    }

    let home = dirs::home_dir()
        .ok_or_else(|| MorpheusError::ConfigInvalid("could not determine home directory".into()))?;
    for candidate in ["id_ed25519.pub", "id_rsa.pub"] {
        let path: PathBuf = home.join(".ssh").join(candidate);
        if let Ok(contents) = std::fs::read_to_string(&path) {
            return Ok(contents.trim().to_string());
        }
    }
    Err(MorpheusError::ConfigInvalid(
        "no SSH public key found at ~/.ssh/id_ed25519.pub or ~/.ssh/id_rsa.pub".into(),
    ))
}

/// Outcome of comparing the local fingerprint against the provider's
/// existing keys named `name`.
pub enum Decision {
    Upload,
    NoOp(SSHKeyHandle),
    Mismatch { expected: String, actual: String },
}

/// The five-way decision tree from the reconciliation algorithm: none found
/// (upload), one matching (no-op), one mismatched (fatal), two-or-more
/// (fatal, treated as ambiguous regardless of whether any one of them matches).
pub fn decide(local_fingerprint: &str, existing: &[SSHKeyHandle]) -> Decision {
    match existing.len() {
        0 => Decision::Upload,
        1 => {
            let handle = &existing[0];
            if handle.fingerprint == local_fingerprint {
                Decision::NoOp(handle.clone())
            } else {
                Decision::Mismatch {
                    expected: local_fingerprint.to_string(),
                    actual: handle.fingerprint.clone(),
                }
            }
        }
        _ => Decision::Mismatch {
            expected: local_fingerprint.to_string(),
            actual: format!("{} keys named with ambiguous fingerprints", existing.len()),
        },
    }
}
