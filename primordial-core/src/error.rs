//! Error taxonomy for the security core.
//!
//! Every error here is safe to surface: display strings are short and fixed,
//! plus opaque identifiers (provider name, field path, port). Secret bytes,
//! ciphertext, and upstream response bodies never appear in any variant.

use crate::timeouts::DurationMs;
use thiserror::Error;

/// A single manifest rule violation. Validation is batched — authors get
/// every violation in one pass, not just the first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Dotted path to the offending field (e.g. `providers[1].env_var`).
    pub field: String,
    /// Why the value was rejected.
    pub reason: String,
}

impl Violation {
    /// Create a new violation.
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

/// The manifest was rejected. Returned before any side effects.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Every violation found, in declaration order.
    pub violations: Vec<Violation>,
}

impl std::error::Error for ValidationError {}

impl ValidationError {
    /// Wrap a batch of violations. Callers must pass at least one.
    pub fn new(violations: Vec<Violation>) -> Self {
        Self { violations }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "manifest validation failed ({})", self.violations.len())?;
        for v in &self.violations {
            write!(f, "; {v}")?;
        }
        Ok(())
    }
}

/// Credential vault failures.
///
/// Messages are fixed strings plus the offending provider/key_id. The
/// integrity variants (`Corrupt`, `WrongMachine`, `PermissionTooOpen`,
/// `KeychainUnavailable`) all fail closed: the vault refuses to open.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum VaultError {
    /// No entry for the requested provider/key.
    #[error("no vault entry for {provider}/{key_id}")]
    MissingKey {
        /// Provider the lookup was for.
        provider: String,
        /// Key id within the provider (usually `default`).
        key_id: String,
    },

    /// Ciphertext failed authentication or the header is malformed.
    #[error("vault file is corrupt or was tampered with")]
    Corrupt,

    /// The vault header records a different machine factor than this host.
    #[error("vault was sealed on a different machine")]
    WrongMachine,

    /// The vault file or its parent directory is readable by others.
    #[error("vault permissions too open: {path}")]
    PermissionTooOpen {
        /// The offending path (never contains secret material).
        path: String,
    },

    /// The OS keychain exists but refused the request. No silent downgrade.
    #[error("os keychain unavailable: {0}")]
    KeychainUnavailable(String),

    /// Disk I/O failure (open, read, fsync, rename).
    #[error("vault i/o failed: {0}")]
    Io(String),

    /// Catch-all.
    #[error("{0}")]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Snapshot pack/unpack failures.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// An archive entry failed the safety filter. The whole restore fails;
    /// no partial extraction is left behind.
    #[error("unsafe archive entry {path}: {reason}")]
    UnsafeEntry {
        /// The entry path as recorded in the archive.
        path: String,
        /// Which rule it violated.
        reason: String,
    },

    /// The archive is not a readable gzipped tar.
    #[error("malformed state archive: {0}")]
    Malformed(String),

    /// Disk I/O failure during pack or restore.
    #[error("snapshot i/o failed: {0}")]
    Io(String),

    /// Catch-all.
    #[error("{0}")]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

/// Sandbox orchestration failures. Any of these before the agent starts is
/// fatal for the session: the VM is destroyed and the error is surfaced.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The microVM provider failed (create, exec, destroy, network).
    #[error("vm provider failed: {0}")]
    Provider(String),

    /// Uploading agent code or the proxy binary failed.
    #[error("upload failed: {0}")]
    Upload(String),

    /// Prior-state restore hit the safety filter or could not be applied.
    #[error("state restore failed: {0}")]
    Restore(String),

    /// In-VM hardening could not be applied (fail-closed when keys are in use).
    #[error("hardening failed: {0}")]
    Harden(String),

    /// The credential proxy did not come up.
    #[error("proxy start failed: {0}")]
    ProxyStart(String),

    /// The manifest's setup command exited nonzero.
    #[error("setup command failed with exit code {exit_code}")]
    SetupFailed {
        /// The setup command's exit code.
        exit_code: i32,
    },

    /// A bounded wait exceeded its limit.
    #[error("timed out after {limit} waiting for {step}")]
    Timeout {
        /// Which bring-up step was being waited on.
        step: String,
        /// The configured bound.
        limit: DurationMs,
    },

    /// Packing session state at close failed. The VM is destroyed regardless.
    #[error("state save failed: {0}")]
    StateSave(String),

    /// A vault error propagated into orchestration.
    #[error(transparent)]
    Vault(#[from] VaultError),

    /// A manifest validation error propagated into orchestration.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A snapshot error propagated into orchestration.
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    /// Catch-all.
    #[error("{0}")]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}
