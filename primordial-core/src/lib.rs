//! # primordial-core — vocabulary for the primordial sandbox
//!
//! Primordial runs untrusted agent code inside fresh, network-isolated
//! microVMs while letting that code call real third-party APIs with
//! credentials it must never see. This crate defines the shared vocabulary
//! the other crates speak:
//!
//! | Module | What it defines |
//! |--------|-----------------|
//! | [`manifest`] | The validated agent declaration (providers, domains, permissions) |
//! | [`provider`] | Provider descriptors, the known-provider table, the protected env-var set |
//! | [`vm`] | The microVM-provider contract ([`VmProvider`], [`Vm`], [`VmProcess`]) and egress policy |
//! | [`resolver`] | The agent-registry contract ([`AgentResolver`]) |
//! | [`events`] | Observable session bring-up events and the ordered [`EventLog`] |
//! | [`timeouts`] | Every configurable bound, with the documented defaults |
//! | [`error`] | The error taxonomy (validation, vault, sandbox, snapshot) |
//!
//! ## Design principle
//!
//! The microVM provider and the agent registry are external collaborators.
//! This crate names their contracts as traits and nothing more — creating a
//! VM, enforcing an egress allowlist, uploading a file, and running a command
//! is everything the orchestrator is allowed to ask for. Anything a provider
//! cannot express through [`vm::Vm`] is something the security core must not
//! depend on.
//!
//! Data types here are serializable where they cross a boundary (manifests,
//! egress policies, events) and deliberately not where they must not
//! (secrets never appear in this crate at all — see `primordial-vault`).

#![deny(missing_docs)]

pub mod error;
pub mod events;
pub mod id;
pub mod manifest;
pub mod provider;
pub mod resolver;
pub mod timeouts;
pub mod vm;

#[cfg(feature = "test-utils")]
pub mod test_utils;

// Re-exports for convenience
pub use error::{SandboxError, SnapshotError, ValidationError, VaultError, Violation};
pub use events::{EventLog, SessionEvent, TimestampedEvent};
pub use id::{SessionId, VmId};
pub use manifest::{
    AllowedDomain, Delegation, Manifest, ProviderSpec, ResourceLimits, WorkspaceAccess,
};
pub use provider::{AuthStyle, KnownProvider, known_provider, known_providers};
pub use resolver::AgentResolver;
pub use timeouts::{DurationMs, Timeouts};
pub use vm::{
    EgressPolicy, ExecOutput, ExecRequest, NetworkAction, NetworkRule, SpawnRequest, Vm, VmConfig,
    VmProcess, VmProvider, VmUser,
};
