//! HMAC-SHA256 signatures stored in `<file>.sig` sidecars.

use std::fs;
use std::path::{Path, PathBuf};

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{DataSafetyError, Result, SecurityError};
use crate::io::atomic::{file_lock, lock_path_for, replace_file, sidecar};

type HmacSha256 = Hmac<Sha256>;

pub fn signature_path(path: &Path) -> PathBuf {
    sidecar(path, "sig")
}

fn mac_for(key: &[u8]) -> Result<HmacSha256, SecurityError> {
    HmacSha256::new_from_slice(key)
        .map_err(|err| SecurityError::Vault(format!("unusable signing key: {err}")))
}

/// Hex-encoded HMAC-SHA256 of `data`.
pub fn compute_signature(data: &[u8], key: &[u8]) -> Result<String, SecurityError> {
    let mut mac = mac_for(key)?;
    mac.update(data);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Write the signature sidecar for `path`. The caller holds the writer lock.
pub(crate) fn sign_file(path: &Path, key: &[u8]) -> Result<()> {
    let data = fs::read(path).map_err(|err| DataSafetyError::io(path, err))?;
    let mut signature = compute_signature(&data, key)?;
    signature.push('\n');
    replace_file(&signature_path(path), signature.as_bytes(), false, |_| Ok(()))
}

/// Sign an existing file, taking its writer lock first.
pub fn sign_existing(path: &Path, key: &[u8]) -> Result<()> {
    let _guard = file_lock(&lock_path_for(path), false, true)?;
    sign_file(path, key)
}

/// Check `path` against its `.sig` sidecar.
pub fn verify_signature(path: &Path, key: &[u8]) -> Result<(), SecurityError> {
    let failure = |reason: String| SecurityError::Signature {
        path: path.to_path_buf(),
        reason,
    };
    let sig_path = signature_path(path);
    let recorded = fs::read_to_string(&sig_path)
        .map_err(|err| failure(format!("read {}: {err}", sig_path.display())))?;
    let expected = hex::decode(recorded.trim())
        .map_err(|err| failure(format!("malformed signature: {err}")))?;
    let data = fs::read(path).map_err(|err| failure(format!("read file: {err}")))?;

    let mut mac = mac_for(key)?;
    mac.update(&data);
    mac.verify_slice(&expected)
        .map_err(|_| failure("signature mismatch".to_string()))
}
