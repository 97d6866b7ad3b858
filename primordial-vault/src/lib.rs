#![deny(missing_docs)]
//! Machine-bound encrypted credential store.
//!
//! The vault maps `(provider, key_id)` to a secret, encrypted at rest and
//! bound to the machine it was sealed on. The key is derived from three
//! factors — a stable machine identifier, a per-install secret held in the
//! OS keychain (or a 0600 fallback file), and an optional passphrase from
//! `PRIMORDIAL_VAULT_PASSPHRASE` — so the ciphertext is useless both to a
//! different user on the same host (file modes fail closed) and to the same
//! user on a different host.
//!
//! ## Contract
//!
//! - [`Vault::put`] replaces in place, atomically on disk.
//! - [`Vault::get`] returns the secret or `MissingKey`.
//! - [`Vault::list`] never reveals secret material.
//! - [`Vault::resolve_for`] returns only the entries whose provider appears
//!   in the manifest — never other providers' keys, whatever the caller
//!   asks for.
//!
//! The vault is synchronous and single-writer; callers serialize
//! externally. The KDF is CPU-bound (seconds, by design) — async callers
//! must run opens on a blocking worker.

use primordial_core::error::VaultError;
use primordial_core::manifest::Manifest;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use zeroize::Zeroizing;

pub mod format;
pub mod keychain;
pub mod machine;
mod secret;

pub use machine::{FactorKind, MachineFactor};
pub use secret::Secret;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use format::{Header, KDF_ITERATIONS};

/// The key id used when a caller does not specify one.
pub const DEFAULT_KEY_ID: &str = "default";

/// Env var an operator can set to add a passphrase factor to the KDF.
pub const PASSPHRASE_ENV: &str = "PRIMORDIAL_VAULT_PASSPHRASE";

/// The inputs the vault key is derived from.
pub struct KeyMaterial {
    /// The machine identity factor.
    pub machine: MachineFactor,
    /// The per-install secret (keychain or fallback file).
    pub install_secret: Zeroizing<Vec<u8>>,
    /// Optional user passphrase.
    pub passphrase: Option<Zeroizing<String>>,
}

impl KeyMaterial {
    /// Gather key material from this host: machine factor, keychain (or
    /// fallback file under `data_dir`), and the passphrase env var.
    pub fn from_host(data_dir: &Path) -> Result<Self, VaultError> {
        Ok(Self {
            machine: machine::detect()?,
            install_secret: keychain::load_or_create(data_dir)?,
            passphrase: std::env::var(PASSPHRASE_ENV).ok().map(Zeroizing::new),
        })
    }
}

/// Metadata for one stored entry. Never includes the secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySummary {
    /// Provider name.
    pub provider: String,
    /// Key id within the provider.
    pub key_id: String,
    /// When the entry was last written (Unix millis).
    pub created_at_ms: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryRecord {
    provider: String,
    key_id: String,
    secret_b64: String,
    created_at_ms: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct VaultDocument {
    entries: Vec<EntryRecord>,
}

/// An open credential vault.
pub struct Vault {
    path: PathBuf,
    header: Header,
    key: Zeroizing<[u8; 32]>,
}

impl Vault {
    /// Open (or create) the vault at the platform data directory, gathering
    /// key material from this host.
    pub fn open_default() -> Result<Self, VaultError> {
        let data_dir = dirs::data_local_dir()
            .ok_or_else(|| VaultError::Io("no platform data directory".into()))?
            .join("primordial");
        let material = KeyMaterial::from_host(&data_dir)?;
        Self::open_with_material(&data_dir.join("vault.bin"), material)
    }

    /// Open (or create) the vault at `path`, gathering key material from
    /// this host. The fallback install-secret file, if needed, lives next
    /// to the vault.
    pub fn open_at(path: &Path) -> Result<Self, VaultError> {
        let parent = path
            .parent()
            .ok_or_else(|| VaultError::Io("vault path has no parent".into()))?;
        let material = KeyMaterial::from_host(parent)?;
        Self::open_with_material(path, material)
    }

    /// Open (or create) the vault at `path` with explicit key material.
    pub fn open_with_material(path: &Path, material: KeyMaterial) -> Result<Self, VaultError> {
        if path.exists() {
            Self::open_existing(path, material)
        } else {
            Self::create(path, material)
        }
    }

    fn create(path: &Path, material: KeyMaterial) -> Result<Self, VaultError> {
        let parent = path
            .parent()
            .ok_or_else(|| VaultError::Io("vault path has no parent".into()))?;
        ensure_private_dir(parent)?;

        let salt = format::new_salt()?;
        let key = format::derive_key(
            &material.machine.value,
            &material.install_secret,
            material.passphrase.as_deref().map(|s| s.as_str()),
            &salt,
            KDF_ITERATIONS,
        );
        let header = Header {
            version: format::VERSION,
            factor: material.machine.kind,
            iterations: KDF_ITERATIONS,
            salt,
            verifier: format::verifier_for(&key),
        };

        let vault = Self {
            path: path.to_path_buf(),
            header,
            key,
        };
        vault.store(&VaultDocument::default())?;
        tracing::info!(path = %path.display(), factor = ?vault.header.factor, "created vault");
        Ok(vault)
    }

    fn open_existing(path: &Path, material: KeyMaterial) -> Result<Self, VaultError> {
        verify_modes(path)?;
        let bytes = std::fs::read(path).map_err(|e| VaultError::Io(e.to_string()))?;
        let header = format::parse_header(&bytes)?;

        if header.factor != material.machine.kind {
            return Err(VaultError::WrongMachine);
        }
        let key = format::derive_key(
            &material.machine.value,
            &material.install_secret,
            material.passphrase.as_deref().map(|s| s.as_str()),
            &header.salt,
            header.iterations,
        );
        if format::verifier_for(&key) != header.verifier {
            // The factor kind matches but the derived key does not: the
            // machine identity (or the passphrase) changed.
            return Err(VaultError::WrongMachine);
        }

        // Validate the ciphertext now so corruption surfaces at open, not
        // at first use.
        format::unseal(&key, &bytes)?;

        Ok(Self {
            path: path.to_path_buf(),
            header,
            key,
        })
    }

    /// Store or replace a secret. Atomic on disk: readers see the old file
    /// or the new one, never a truncated intermediate.
    pub fn put(&mut self, provider: &str, key_id: &str, secret: &[u8]) -> Result<(), VaultError> {
        let mut doc = self.load()?;
        let created_at_ms = now_ms();
        doc.entries
            .retain(|e| !(e.provider == provider && e.key_id == key_id));
        doc.entries.push(EntryRecord {
            provider: provider.to_string(),
            key_id: key_id.to_string(),
            secret_b64: BASE64.encode(secret),
            created_at_ms,
        });
        self.store(&doc)?;
        tracing::debug!(provider, key_id, "vault entry written");
        Ok(())
    }

    /// Fetch a secret.
    pub fn get(&self, provider: &str, key_id: &str) -> Result<Secret, VaultError> {
        let doc = self.load()?;
        let entry = doc
            .entries
            .iter()
            .find(|e| e.provider == provider && e.key_id == key_id)
            .ok_or_else(|| VaultError::MissingKey {
                provider: provider.to_string(),
                key_id: key_id.to_string(),
            })?;
        let bytes = BASE64
            .decode(&entry.secret_b64)
            .map_err(|_| VaultError::Corrupt)?;
        Ok(Secret::new(bytes))
    }

    /// List entry metadata. Never reveals secrets.
    pub fn list(&self) -> Result<Vec<EntrySummary>, VaultError> {
        let doc = self.load()?;
        let mut out: Vec<EntrySummary> = doc
            .entries
            .iter()
            .map(|e| EntrySummary {
                provider: e.provider.clone(),
                key_id: e.key_id.clone(),
                created_at_ms: e.created_at_ms,
            })
            .collect();
        out.sort_by(|a, b| (&a.provider, &a.key_id).cmp(&(&b.provider, &b.key_id)));
        Ok(out)
    }

    /// Remove an entry. Returns whether it existed.
    pub fn remove(&mut self, provider: &str, key_id: &str) -> Result<bool, VaultError> {
        let mut doc = self.load()?;
        let before = doc.entries.len();
        doc.entries
            .retain(|e| !(e.provider == provider && e.key_id == key_id));
        let removed = doc.entries.len() != before;
        if removed {
            self.store(&doc)?;
            tracing::debug!(provider, key_id, "vault entry removed");
        }
        Ok(removed)
    }

    /// Resolve the secrets a manifest needs: exactly the declared
    /// providers' `default` keys, nothing else. A declared provider with no
    /// vault entry fails the whole resolution with `MissingKey`.
    pub fn resolve_for(&self, manifest: &Manifest) -> Result<BTreeMap<String, Secret>, VaultError> {
        let mut out = BTreeMap::new();
        for provider in &manifest.providers {
            let secret = self.get(&provider.name, DEFAULT_KEY_ID)?;
            out.insert(provider.name.clone(), secret);
        }
        Ok(out)
    }

    fn load(&self) -> Result<VaultDocument, VaultError> {
        verify_modes(&self.path)?;
        let bytes = std::fs::read(&self.path).map_err(|e| VaultError::Io(e.to_string()))?;
        let plaintext = format::unseal(&self.key, &bytes)?;
        serde_json::from_slice(&plaintext).map_err(|_| VaultError::Corrupt)
    }

    fn store(&self, doc: &VaultDocument) -> Result<(), VaultError> {
        let plaintext = Zeroizing::new(
            serde_json::to_vec(doc).map_err(|e| VaultError::Io(e.to_string()))?,
        );
        let image = format::seal(&self.key, &self.header, &plaintext)?;
        write_atomic(&self.path, &image)
    }
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("path", &self.path)
            .field("key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ---------------------------------------------------------------------------
// File safety
// ---------------------------------------------------------------------------

#[cfg(unix)]
fn ensure_private_dir(dir: &Path) -> Result<(), VaultError> {
    use std::os::unix::fs::{MetadataExt, PermissionsExt};
    std::fs::create_dir_all(dir).map_err(|e| VaultError::Io(e.to_string()))?;
    let meta = std::fs::metadata(dir).map_err(|e| VaultError::Io(e.to_string()))?;
    if meta.mode() & 0o077 != 0 {
        // Tighten to 0700; refuse if the mode still leaks afterwards.
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))
            .map_err(|e| VaultError::Io(e.to_string()))?;
        let meta = std::fs::metadata(dir).map_err(|e| VaultError::Io(e.to_string()))?;
        if meta.mode() & 0o077 != 0 {
            return Err(VaultError::PermissionTooOpen {
                path: dir.display().to_string(),
            });
        }
    }
    Ok(())
}

/// Refuse to touch a vault whose file is wider than 0600, whose parent is
/// wider than 0700, or which is a symlink. Verified on every read.
#[cfg(unix)]
fn verify_modes(path: &Path) -> Result<(), VaultError> {
    use std::os::unix::fs::MetadataExt;
    let meta = std::fs::symlink_metadata(path).map_err(|e| VaultError::Io(e.to_string()))?;
    if meta.file_type().is_symlink() {
        return Err(VaultError::Io("vault path is a symlink".into()));
    }
    if meta.mode() & 0o077 != 0 {
        return Err(VaultError::PermissionTooOpen {
            path: path.display().to_string(),
        });
    }
    if let Some(parent) = path.parent() {
        let meta = std::fs::metadata(parent).map_err(|e| VaultError::Io(e.to_string()))?;
        if meta.mode() & 0o077 != 0 {
            return Err(VaultError::PermissionTooOpen {
                path: parent.display().to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn ensure_private_dir(_dir: &Path) -> Result<(), VaultError> {
    Err(VaultError::Io("vault requires a unix host".into()))
}

#[cfg(not(unix))]
fn verify_modes(_path: &Path) -> Result<(), VaultError> {
    Err(VaultError::Io("vault requires a unix host".into()))
}

/// Atomic replace: exclusive-create a 0600 temp file in the same
/// directory, fsync, rename over the target, fsync the directory.
#[cfg(unix)]
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), VaultError> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let parent = path
        .parent()
        .ok_or_else(|| VaultError::Io("vault path has no parent".into()))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| VaultError::Io("vault path has no file name".into()))?;
    let tmp = parent.join(format!(".{file_name}.tmp-{}", std::process::id()));

    let result = (|| {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&tmp)
            .map_err(|e| VaultError::Io(e.to_string()))?;
        file.write_all(bytes)
            .and_then(|()| file.sync_all())
            .map_err(|e| VaultError::Io(e.to_string()))?;
        std::fs::rename(&tmp, path).map_err(|e| VaultError::Io(e.to_string()))?;
        if let Ok(dir) = std::fs::File::open(parent) {
            let _ = dir.sync_all();
        }
        Ok(())
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

#[cfg(not(unix))]
fn write_atomic(_path: &Path, _bytes: &[u8]) -> Result<(), VaultError> {
    Err(VaultError::Io("vault requires a unix host".into()))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn material(machine_value: &str) -> KeyMaterial {
        KeyMaterial {
            machine: MachineFactor {
                kind: FactorKind::MachineId,
                value: machine_value.to_string(),
            },
            install_secret: Zeroizing::new(b"test-install-secret".to_vec()),
            passphrase: None,
        }
    }

    fn open(dir: &Path, machine_value: &str) -> Result<Vault, VaultError> {
        Vault::open_with_material(&dir.join("vault.bin"), material(machine_value))
    }

    #[test]
    fn put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut vault = open(dir.path(), "machine-a").unwrap();
        vault.put("anthropic", "default", b"sk-REAL").unwrap();

        let secret = vault.get("anthropic", "default").unwrap();
        secret.with_bytes(|b| assert_eq!(b, b"sk-REAL"));
    }

    #[test]
    fn reopen_reads_what_was_written() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut vault = open(dir.path(), "machine-a").unwrap();
            vault.put("openai", "default", b"sk-other").unwrap();
        }
        let vault = open(dir.path(), "machine-a").unwrap();
        vault
            .get("openai", "default")
            .unwrap()
            .with_bytes(|b| assert_eq!(b, b"sk-other"));
    }

    #[test]
    fn put_is_idempotent_by_provider_and_key_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut vault = open(dir.path(), "machine-a").unwrap();
        vault.put("anthropic", "default", b"first").unwrap();
        vault.put("anthropic", "default", b"second").unwrap();

        let entries = vault.list().unwrap();
        assert_eq!(entries.len(), 1);
        vault
            .get("anthropic", "default")
            .unwrap()
            .with_bytes(|b| assert_eq!(b, b"second"));
    }

    #[test]
    fn missing_key_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let vault = open(dir.path(), "machine-a").unwrap();
        let err = vault.get("anthropic", "default").unwrap_err();
        assert!(matches!(
            err,
            VaultError::MissingKey { ref provider, .. } if provider == "anthropic"
        ));
    }

    #[test]
    fn remove_reports_existence() {
        let dir = tempfile::tempdir().unwrap();
        let mut vault = open(dir.path(), "machine-a").unwrap();
        vault.put("groq", "default", b"gsk").unwrap();
        assert!(vault.remove("groq", "default").unwrap());
        assert!(!vault.remove("groq", "default").unwrap());
        assert!(vault.get("groq", "default").is_err());
    }

    #[test]
    fn list_never_contains_secret_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let mut vault = open(dir.path(), "machine-a").unwrap();
        vault.put("anthropic", "default", b"sk-SENSITIVE").unwrap();
        let listing = format!("{:?}", vault.list().unwrap());
        assert!(!listing.contains("sk-SENSITIVE"));
        assert!(listing.contains("anthropic"));
    }

    #[test]
    fn different_machine_value_refuses_with_wrong_machine() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut vault = open(dir.path(), "machine-a").unwrap();
            vault.put("anthropic", "default", b"sk-REAL").unwrap();
        }
        let err = open(dir.path(), "machine-b").unwrap_err();
        assert!(matches!(err, VaultError::WrongMachine));
    }

    #[test]
    fn different_factor_kind_refuses_with_wrong_machine() {
        let dir = tempfile::tempdir().unwrap();
        open(dir.path(), "machine-a").unwrap();

        let mut other = material("machine-a");
        other.machine.kind = FactorKind::HostMac;
        let err = Vault::open_with_material(&dir.path().join("vault.bin"), other).unwrap_err();
        assert!(matches!(err, VaultError::WrongMachine));
    }

    #[test]
    fn passphrase_is_part_of_the_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut with_pass = material("machine-a");
        with_pass.passphrase = Some(Zeroizing::new("hunter2".to_string()));
        Vault::open_with_material(&dir.path().join("vault.bin"), with_pass).unwrap();

        let err = open(dir.path(), "machine-a").unwrap_err();
        assert!(matches!(err, VaultError::WrongMachine));
    }

    #[test]
    fn flipped_ciphertext_byte_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut vault = open(dir.path(), "machine-a").unwrap();
            vault.put("anthropic", "default", b"sk-REAL").unwrap();
        }
        let path = dir.path().join("vault.bin");
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();

        let err = open(dir.path(), "machine-a").unwrap_err();
        assert!(matches!(err, VaultError::Corrupt));
    }

    #[test]
    fn vault_file_mode_is_0600_and_widening_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut vault = open(dir.path(), "machine-a").unwrap();
        vault.put("anthropic", "default", b"sk-REAL").unwrap();

        let path = dir.path().join("vault.bin");
        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        let err = vault.get("anthropic", "default").unwrap_err();
        assert!(matches!(err, VaultError::PermissionTooOpen { .. }));
    }

    #[test]
    fn wide_parent_directory_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let vault_dir = dir.path().join("data");
        std::fs::create_dir(&vault_dir).unwrap();
        {
            let _ = Vault::open_with_material(&vault_dir.join("vault.bin"), material("machine-a"))
                .unwrap();
        }
        std::fs::set_permissions(&vault_dir, std::fs::Permissions::from_mode(0o755)).unwrap();
        let err = Vault::open_with_material(&vault_dir.join("vault.bin"), material("machine-a"))
            .unwrap_err();
        assert!(matches!(err, VaultError::PermissionTooOpen { .. }));
    }

    #[test]
    fn no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let mut vault = open(dir.path(), "machine-a").unwrap();
        vault.put("anthropic", "default", b"sk-REAL").unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().all(|n| !n.contains(".tmp-")), "{names:?}");
    }

    #[test]
    fn resolve_for_returns_only_declared_providers() {
        use primordial_core::manifest::{Delegation, ProviderSpec, WorkspaceAccess};
        use primordial_core::provider::AuthStyle;

        let dir = tempfile::tempdir().unwrap();
        let mut vault = open(dir.path(), "machine-a").unwrap();
        vault.put("anthropic", "default", b"sk-ant").unwrap();
        vault.put("openai", "default", b"sk-oai").unwrap();

        let manifest = Manifest {
            name: "demo-agent".into(),
            version: "0.1.0".into(),
            run_command: "python main.py".into(),
            setup_command: None,
            dependencies: None,
            providers: vec![ProviderSpec {
                name: "anthropic".into(),
                domain: "api.anthropic.com".into(),
                auth_style: AuthStyle::Header("x-api-key".into()),
                env_var: "ANTHROPIC_API_KEY".into(),
                base_url_env: "ANTHROPIC_BASE_URL".into(),
                known: true,
            }],
            allowed_domains: vec![],
            network_unrestricted: false,
            filesystem: WorkspaceAccess::None,
            delegation: Delegation::default(),
            resources: Default::default(),
        };

        let resolved = vault.resolve_for(&manifest).unwrap();
        assert_eq!(resolved.len(), 1);
        assert!(resolved.contains_key("anthropic"));
        assert!(!resolved.contains_key("openai"));
    }

    #[test]
    fn resolve_for_fails_on_missing_provider() {
        use primordial_core::manifest::{Delegation, ProviderSpec, WorkspaceAccess};
        use primordial_core::provider::AuthStyle;

        let dir = tempfile::tempdir().unwrap();
        let vault = open(dir.path(), "machine-a").unwrap();

        let manifest = Manifest {
            name: "demo-agent".into(),
            version: "0.1.0".into(),
            run_command: "python main.py".into(),
            setup_command: None,
            dependencies: None,
            providers: vec![ProviderSpec {
                name: "mistral".into(),
                domain: "api.mistral.ai".into(),
                auth_style: AuthStyle::Bearer,
                env_var: "MISTRAL_API_KEY".into(),
                base_url_env: "MISTRAL_BASE_URL".into(),
                known: true,
            }],
            allowed_domains: vec![],
            network_unrestricted: false,
            filesystem: WorkspaceAccess::None,
            delegation: Delegation::default(),
            resources: Default::default(),
        };

        let err = vault.resolve_for(&manifest).unwrap_err();
        assert!(matches!(
            err,
            VaultError::MissingKey { ref provider, .. } if provider == "mistral"
        ));
    }
}
