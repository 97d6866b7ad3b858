//! The on-disk vault format.
//!
//! ```text
//! magic (8) | version (1) | factor tag (1) | kdf iterations (4, BE)
//! | salt (16) | key verifier (8) | nonce (12) | AEAD ciphertext
//! ```
//!
//! The key is PBKDF2-HMAC-SHA256 over the three derivation factors joined
//! with a fixed separator; the ciphertext is ChaCha20-Poly1305 with the
//! header (minus the nonce) as associated data, so header tampering fails
//! authentication. The verifier is a truncated hash of the derived key: it
//! lets a load distinguish "wrong key material" from "damaged ciphertext"
//! without attempting decryption.

use crate::machine::FactorKind;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use primordial_core::error::VaultError;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// File magic.
pub const MAGIC: &[u8; 8] = b"PRMVAULT";
/// Current format version.
pub const VERSION: u8 = 1;
/// PBKDF2 iteration count written to new vaults. Loads refuse anything lower.
pub const KDF_ITERATIONS: u32 = 600_000;
/// Separator between the derivation factors. Cannot appear in a machine id
/// or hex install secret, so factor boundaries are unambiguous.
const FACTOR_SEPARATOR: u8 = 0x1f;

const SALT_LEN: usize = 16;
const VERIFIER_LEN: usize = 8;
const NONCE_LEN: usize = 12;
const HEADER_LEN: usize = 8 + 1 + 1 + 4 + SALT_LEN + VERIFIER_LEN;

/// Parsed vault header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// Format version.
    pub version: u8,
    /// Which machine factor sealed this vault.
    pub factor: FactorKind,
    /// PBKDF2 iteration count.
    pub iterations: u32,
    /// Per-vault random salt.
    pub salt: [u8; SALT_LEN],
    /// Truncated hash of the derived key.
    pub verifier: [u8; VERIFIER_LEN],
}

impl Header {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN);
        out.extend_from_slice(MAGIC);
        out.push(self.version);
        out.push(self.factor.tag());
        out.extend_from_slice(&self.iterations.to_be_bytes());
        out.extend_from_slice(&self.salt);
        out.extend_from_slice(&self.verifier);
        out
    }
}

/// Derive the vault key from the three factors and the per-vault salt.
///
/// CPU-bound and deliberately slow (≥ [`KDF_ITERATIONS`] rounds); callers
/// on an event loop must run this on a blocking worker.
pub fn derive_key(
    machine_value: &str,
    install_secret: &[u8],
    passphrase: Option<&str>,
    salt: &[u8; SALT_LEN],
    iterations: u32,
) -> Zeroizing<[u8; 32]> {
    let mut password = Zeroizing::new(Vec::with_capacity(
        machine_value.len() + install_secret.len() + 64,
    ));
    password.extend_from_slice(machine_value.as_bytes());
    password.push(FACTOR_SEPARATOR);
    password.extend_from_slice(install_secret);
    password.push(FACTOR_SEPARATOR);
    if let Some(p) = passphrase {
        password.extend_from_slice(p.as_bytes());
    }

    let mut key = Zeroizing::new([0u8; 32]);
    pbkdf2::pbkdf2_hmac::<Sha256>(&password, salt, iterations, key.as_mut());
    key
}

/// The header's key verifier: a truncated domain-separated hash of the key.
pub fn verifier_for(key: &[u8; 32]) -> [u8; VERIFIER_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(b"primordial-vault-verifier");
    hasher.update(key);
    let digest = hasher.finalize();
    let mut out = [0u8; VERIFIER_LEN];
    out.copy_from_slice(&digest[..VERIFIER_LEN]);
    out
}

/// Encrypt `plaintext` under `key` and produce the full file image.
pub fn seal(key: &[u8; 32], header: &Header, plaintext: &[u8]) -> Result<Vec<u8>, VaultError> {
    let mut nonce = [0u8; NONCE_LEN];
    getrandom::getrandom(&mut nonce).map_err(|_| VaultError::Io("entropy source failed".into()))?;

    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| VaultError::Corrupt)?;
    let aad = header.encode();
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|_| VaultError::Corrupt)?;

    let mut out = aad;
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Parse the header of a vault file without touching the ciphertext.
pub fn parse_header(bytes: &[u8]) -> Result<Header, VaultError> {
    if bytes.len() < HEADER_LEN + NONCE_LEN || &bytes[..8] != MAGIC {
        return Err(VaultError::Corrupt);
    }
    let version = bytes[8];
    if version != VERSION {
        return Err(VaultError::Corrupt);
    }
    let factor = FactorKind::from_tag(bytes[9]).ok_or(VaultError::Corrupt)?;
    let iterations = u32::from_be_bytes([bytes[10], bytes[11], bytes[12], bytes[13]]);
    if iterations < KDF_ITERATIONS {
        // A weakened iteration count is tampering, not a config choice.
        return Err(VaultError::Corrupt);
    }
    let mut salt = [0u8; SALT_LEN];
    salt.copy_from_slice(&bytes[14..14 + SALT_LEN]);
    let mut verifier = [0u8; VERIFIER_LEN];
    verifier.copy_from_slice(&bytes[14 + SALT_LEN..HEADER_LEN]);
    Ok(Header {
        version,
        factor,
        iterations,
        salt,
        verifier,
    })
}

/// Decrypt a vault file image with an already-derived key.
pub fn unseal(key: &[u8; 32], bytes: &[u8]) -> Result<Zeroizing<Vec<u8>>, VaultError> {
    let header = parse_header(bytes)?;
    let aad = header.encode();
    let nonce = &bytes[HEADER_LEN..HEADER_LEN + NONCE_LEN];
    let ciphertext = &bytes[HEADER_LEN + NONCE_LEN..];

    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| VaultError::Corrupt)?;
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: &aad,
            },
        )
        .map_err(|_| VaultError::Corrupt)?;
    Ok(Zeroizing::new(plaintext))
}

/// Generate a fresh random salt.
pub fn new_salt() -> Result<[u8; SALT_LEN], VaultError> {
    let mut salt = [0u8; SALT_LEN];
    getrandom::getrandom(&mut salt).map_err(|_| VaultError::Io("entropy source failed".into()))?;
    Ok(salt)
}
