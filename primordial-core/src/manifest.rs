//! The validated agent manifest.
//!
//! These types are the *output* of `primordial-manifest`'s validator — a
//! declaration that has already passed every schema and semantic rule. Code
//! downstream of validation (the orchestrator, the vault's `resolve_for`)
//! consumes these and never re-parses YAML. Invariants are nonetheless
//! re-checked at orchestration time; a `Manifest` constructed by hand does
//! not get to skip them.

use crate::provider::AuthStyle;
use serde::{Deserialize, Serialize};

/// One upstream API the agent may call through the credential proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSpec {
    /// Lowercase provider name (`^[a-z][a-z0-9-]*$`).
    pub name: String,
    /// Upstream host. For known providers this is the pinned canonical
    /// domain regardless of what the manifest said.
    pub domain: String,
    /// How the upstream authenticates.
    pub auth_style: AuthStyle,
    /// Env var holding the placeholder token the agent reads.
    pub env_var: String,
    /// Env var holding the loopback proxy base URL.
    pub base_url_env: String,
    /// Whether this provider came from the known-provider table.
    pub known: bool,
}

/// A domain the agent asked to reach directly, with its stated reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedDomain {
    /// Fully qualified host name.
    pub domain: String,
    /// Free-text justification shown to the user at consent time.
    pub reason: String,
}

/// Workspace mount mode inside the VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceAccess {
    /// No workspace mount.
    #[default]
    None,
    /// Workspace visible read-only.
    Readonly,
    /// Workspace visible read-write.
    Readwrite,
}

/// Cross-agent delegation declaration. The core treats each delegated agent
/// as another independent invocation; this only records intent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Delegation {
    /// Whether this agent may delegate at all.
    pub enabled: bool,
    /// Opaque identifiers of agents it may delegate to. Not interpreted here.
    pub allowed_agents: Vec<String>,
}

/// Advisory resource limits, passed through to the VM provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory ceiling in MiB.
    pub memory_mb: Option<u32>,
    /// CPU count.
    pub cpus: Option<u32>,
}

/// One agent's validated declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Agent name, 3–40 chars, `^[a-z][a-z0-9-]*$`.
    pub name: String,
    /// Free-form version string.
    pub version: String,
    /// Command that starts the agent, run as the unprivileged user.
    pub run_command: String,
    /// Optional dependency-install command, run before the agent starts.
    pub setup_command: Option<String>,
    /// Optional path (relative to the agent dir) of a dependency listing.
    pub dependencies: Option<String>,
    /// Providers the agent calls through the credential proxy.
    pub providers: Vec<ProviderSpec>,
    /// Extra domains the agent may reach directly.
    pub allowed_domains: Vec<AllowedDomain>,
    /// Whether egress is unrestricted (requires prior user consent upstream).
    pub network_unrestricted: bool,
    /// Workspace mount mode.
    pub filesystem: WorkspaceAccess,
    /// Delegation declaration.
    pub delegation: Delegation,
    /// Advisory resource limits.
    pub resources: ResourceLimits,
}

impl Manifest {
    /// Names of all declared providers, in declaration order.
    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.name.as_str()).collect()
    }

    /// Look up a declared provider by name.
    pub fn provider(&self, name: &str) -> Option<&ProviderSpec> {
        self.providers.iter().find(|p| p.name == name)
    }
}
