//! The per-install secret: second factor of the vault key derivation.
//!
//! Stored in the OS keychain where one exists. If the keychain is present
//! but refuses the request, the vault aborts — a silent downgrade to the
//! file fallback would quietly weaken every vault on the machine. The file
//! fallback exists only for hosts with no keychain at all (headless Linux
//! without a secret service): a 0600 exclusive-create file whose mode is
//! re-verified on every read.

use primordial_core::error::VaultError;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

const KEYCHAIN_SERVICE: &str = "primordial-vault";
const KEYCHAIN_USER: &str = "install-secret";
const FALLBACK_FILE: &str = "install.secret";

/// Load the install secret, creating it on first use.
pub fn load_or_create(data_dir: &Path) -> Result<Zeroizing<Vec<u8>>, VaultError> {
    match keychain_secret() {
        Ok(secret) => Ok(secret),
        Err(KeychainOutcome::Absent) => file_secret(data_dir),
        Err(KeychainOutcome::Refused(reason)) => Err(VaultError::KeychainUnavailable(reason)),
    }
}

enum KeychainOutcome {
    /// No keychain on this host; the file fallback is legitimate.
    Absent,
    /// A keychain exists but refused. Abort, never downgrade.
    Refused(String),
}

fn keychain_secret() -> Result<Zeroizing<Vec<u8>>, KeychainOutcome> {
    let entry = keyring::Entry::new(KEYCHAIN_SERVICE, KEYCHAIN_USER)
        .map_err(|e| KeychainOutcome::Refused(e.to_string()))?;
    match entry.get_password() {
        Ok(secret) => Ok(Zeroizing::new(secret.into_bytes())),
        Err(keyring::Error::NoEntry) => {
            let fresh = new_secret_hex().map_err(|e| KeychainOutcome::Refused(e.to_string()))?;
            match entry.set_password(&fresh) {
                Ok(()) => Ok(Zeroizing::new(fresh.into_bytes())),
                Err(keyring::Error::PlatformFailure(_) | keyring::Error::NoStorageAccess(_)) => {
                    Err(KeychainOutcome::Absent)
                }
                Err(e) => Err(KeychainOutcome::Refused(e.to_string())),
            }
        }
        Err(keyring::Error::PlatformFailure(_) | keyring::Error::NoStorageAccess(_)) => {
            Err(KeychainOutcome::Absent)
        }
        Err(e) => Err(KeychainOutcome::Refused(e.to_string())),
    }
}

fn new_secret_hex() -> Result<String, VaultError> {
    let mut bytes = [0u8; 32];
    getrandom::getrandom(&mut bytes)
        .map_err(|_| VaultError::Io("entropy source failed".into()))?;
    Ok(hex::encode(bytes))
}

/// File fallback path for a given data dir.
pub fn fallback_path(data_dir: &Path) -> PathBuf {
    data_dir.join(FALLBACK_FILE)
}

/// Read (or create) the 0600 fallback file, re-verifying its mode.
pub fn file_secret(data_dir: &Path) -> Result<Zeroizing<Vec<u8>>, VaultError> {
    let path = fallback_path(data_dir);
    if path.exists() {
        verify_file_mode(&path)?;
        let bytes = std::fs::read(&path).map_err(|e| VaultError::Io(e.to_string()))?;
        if bytes.is_empty() {
            return Err(VaultError::Io("install secret file is empty".into()));
        }
        return Ok(Zeroizing::new(bytes));
    }

    std::fs::create_dir_all(data_dir).map_err(|e| VaultError::Io(e.to_string()))?;
    let secret = new_secret_hex()?;
    write_exclusive_0600(&path, secret.as_bytes())?;
    Ok(Zeroizing::new(secret.into_bytes()))
}

#[cfg(unix)]
fn verify_file_mode(path: &Path) -> Result<(), VaultError> {
    use std::os::unix::fs::MetadataExt;
    let meta = std::fs::symlink_metadata(path).map_err(|e| VaultError::Io(e.to_string()))?;
    if meta.file_type().is_symlink() {
        return Err(VaultError::Io("install secret file is a symlink".into()));
    }
    if meta.mode() & 0o077 != 0 {
        return Err(VaultError::PermissionTooOpen {
            path: path.display().to_string(),
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn verify_file_mode(_path: &Path) -> Result<(), VaultError> {
    Err(VaultError::Io(
        "vault file-mode verification requires a unix host".into(),
    ))
}

#[cfg(unix)]
fn write_exclusive_0600(path: &Path, bytes: &[u8]) -> Result<(), VaultError> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    // O_CREAT|O_EXCL refuses to follow an existing symlink at the final
    // component, so a pre-planted link cannot redirect the write.
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| VaultError::Io(e.to_string()))?;
    file.write_all(bytes)
        .and_then(|()| file.sync_all())
        .map_err(|e| VaultError::Io(e.to_string()))
}

#[cfg(not(unix))]
fn write_exclusive_0600(_path: &Path, _bytes: &[u8]) -> Result<(), VaultError> {
    Err(VaultError::Io(
        "vault file creation requires a unix host".into(),
    ))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn file_secret_is_created_once_and_stable() {
        let dir = tempfile::tempdir().unwrap();
        let first = file_secret(dir.path()).unwrap();
        let second = file_secret(dir.path()).unwrap();
        assert_eq!(&*first, &*second);
        assert_eq!(first.len(), 64); // 32 bytes hex-encoded
    }

    #[test]
    fn file_secret_has_mode_0600() {
        let dir = tempfile::tempdir().unwrap();
        file_secret(dir.path()).unwrap();
        let meta = std::fs::metadata(fallback_path(dir.path())).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn widened_mode_is_refused_on_read() {
        let dir = tempfile::tempdir().unwrap();
        file_secret(dir.path()).unwrap();
        let path = fallback_path(dir.path());
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        let err = file_secret(dir.path()).unwrap_err();
        assert!(matches!(err, VaultError::PermissionTooOpen { .. }));
    }
}
