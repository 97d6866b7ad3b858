#![deny(missing_docs)]
//! Strict parsing and validation of agent manifests.
//!
//! The manifest is the agent author's declaration of what their code needs:
//! providers to call through the credential proxy, extra domains, workspace
//! access, delegation, resource limits. Everything downstream — the egress
//! policy, the proxy route table, the placeholder env vars — is derived from
//! it, so this validator is the front door of the attack surface: domain
//! pinning, env-var namespacing, and duplicate detection all happen here,
//! before any side effect.
//!
//! Two layers of rejection:
//!
//! 1. **Schema shape** — YAML that does not deserialize (missing required
//!    fields, unknown fields inside `providers[]` or `permissions.*`,
//!    wrong types) fails immediately with the field path serde reports.
//!    Unknown *top-level* fields are ignored for forward compatibility.
//! 2. **Semantic rules** — everything else is batched: the validator
//!    collects every violation and returns them in one
//!    [`ValidationError`], so authors fix their manifest in one pass.
//!
//! No network or filesystem side effects; the input is a string, the output
//! a [`Manifest`].

use primordial_core::error::{ValidationError, Violation};
use primordial_core::manifest::{
    AllowedDomain, Delegation, Manifest, ProviderSpec, ResourceLimits, WorkspaceAccess,
};
use primordial_core::provider::{
    AuthStyle, default_base_url_env, default_env_var, is_protected_env_var, known_provider,
    known_provider_env_conflict,
};
use serde::Deserialize;

mod rules;

use rules::{is_env_var_name, is_fqdn, is_lower_name};

/// Parse a YAML manifest document and run every validation rule.
///
/// Returns the validated [`Manifest`] or a [`ValidationError`] listing
/// every violation found.
pub fn parse_and_validate(yaml: &str) -> Result<Manifest, ValidationError> {
    let raw: RawManifest = serde_yaml::from_str(yaml)
        .map_err(|e| ValidationError::new(vec![Violation::new("manifest", e.to_string())]))?;
    validate(raw)
}

// ---------------------------------------------------------------------------
// Raw schema
// ---------------------------------------------------------------------------

/// Top level: unknown fields ignored (no deny_unknown_fields) so future
/// manifest versions stay loadable.
#[derive(Debug, Deserialize)]
struct RawManifest {
    name: String,
    version: String,
    run_command: String,
    #[serde(default)]
    setup_command: Option<String>,
    #[serde(default)]
    dependencies: Option<String>,
    #[serde(default)]
    providers: Vec<RawProvider>,
    #[serde(default)]
    permissions: RawPermissions,
    #[serde(default)]
    resources: RawResources,
}

/// Providers are the attack surface; unknown fields here are rejected.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawProvider {
    name: String,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    auth_style: Option<String>,
    #[serde(default)]
    env_var: Option<String>,
    #[serde(default)]
    base_url_env: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPermissions {
    #[serde(default)]
    network: RawNetwork,
    #[serde(default)]
    filesystem: RawFilesystem,
    #[serde(default)]
    delegation: RawDelegation,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawNetwork {
    #[serde(default)]
    allowed_domains: Vec<RawAllowedDomain>,
    #[serde(default)]
    unrestricted: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAllowedDomain {
    domain: String,
    reason: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawFilesystem {
    #[serde(default)]
    workspace: WorkspaceAccess,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDelegation {
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    allowed_agents: Vec<String>,
}

/// Resource limits are advisory and not part of `permissions.*`; unknown
/// fields pass through ignored.
#[derive(Debug, Default, Deserialize)]
struct RawResources {
    #[serde(default)]
    memory_mb: Option<u32>,
    #[serde(default)]
    cpus: Option<u32>,
}

/// Re-check the provider invariants on an already-built [`Manifest`].
///
/// The orchestrator calls this before any side effect: a `Manifest` value
/// constructed by hand (or deserialized from a cache) does not get to skip
/// the env-var namespacing and collision rules.
pub fn recheck(manifest: &Manifest) -> Result<(), ValidationError> {
    let mut violations = Vec::new();
    for (i, p) in manifest.providers.iter().enumerate() {
        for (var, suffix) in [(&p.env_var, "env_var"), (&p.base_url_env, "base_url_env")] {
            if !is_env_var_name(var) {
                violations.push(Violation::new(
                    format!("providers[{i}].{suffix}"),
                    "must match ^[A-Z][A-Z0-9_]*$",
                ));
            }
            if is_protected_env_var(var) {
                violations.push(Violation::new(
                    format!("providers[{i}].{suffix}"),
                    format!("{var} is a protected environment variable"),
                ));
            }
            if let Some(owner) = known_provider_env_conflict(var, &p.name) {
                violations.push(Violation::new(
                    format!("providers[{i}].{suffix}"),
                    format!("{var} belongs to known provider {}", owner.name),
                ));
            }
        }
    }
    rules::scan_collisions(&manifest.providers, &mut violations);
    if violations.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::new(violations))
    }
}

// ---------------------------------------------------------------------------
// Semantic validation
// ---------------------------------------------------------------------------

fn validate(raw: RawManifest) -> Result<Manifest, ValidationError> {
    let mut violations = Vec::new();

    if raw.name.len() < 3 || raw.name.len() > 40 {
        violations.push(Violation::new("name", "must be 3-40 characters"));
    }
    if !is_lower_name(&raw.name) {
        violations.push(Violation::new(
            "name",
            "must match ^[a-z][a-z0-9-]*$ (lowercase, dashes, no underscores)",
        ));
    }
    if raw.version.trim().is_empty() {
        violations.push(Violation::new("version", "must not be empty"));
    }
    if raw.run_command.trim().is_empty() {
        violations.push(Violation::new("run_command", "must not be empty"));
    }
    if let Some(setup) = &raw.setup_command {
        if setup.trim().is_empty() {
            violations.push(Violation::new("setup_command", "must not be empty if present"));
        }
    }

    let providers = validate_providers(&raw.providers, &mut violations);

    let mut allowed_domains = Vec::with_capacity(raw.permissions.network.allowed_domains.len());
    for (i, entry) in raw.permissions.network.allowed_domains.iter().enumerate() {
        if !is_fqdn(&entry.domain) {
            violations.push(Violation::new(
                format!("permissions.network.allowed_domains[{i}].domain"),
                "must be a fully qualified host name (no IP literals, no single labels)",
            ));
        }
        allowed_domains.push(AllowedDomain {
            domain: entry.domain.clone(),
            reason: entry.reason.clone(),
        });
    }

    if let Some(0) = raw.resources.memory_mb {
        violations.push(Violation::new("resources.memory_mb", "must be positive"));
    }
    if let Some(0) = raw.resources.cpus {
        violations.push(Violation::new("resources.cpus", "must be positive"));
    }

    if !violations.is_empty() {
        return Err(ValidationError::new(violations));
    }

    Ok(Manifest {
        name: raw.name,
        version: raw.version,
        run_command: raw.run_command,
        setup_command: raw.setup_command,
        dependencies: raw.dependencies,
        providers,
        allowed_domains,
        network_unrestricted: raw.permissions.network.unrestricted,
        filesystem: raw.permissions.filesystem.workspace,
        delegation: Delegation {
            enabled: raw.permissions.delegation.enabled,
            allowed_agents: raw.permissions.delegation.allowed_agents,
        },
        resources: ResourceLimits {
            memory_mb: raw.resources.memory_mb,
            cpus: raw.resources.cpus,
        },
    })
}

fn validate_providers(raw: &[RawProvider], violations: &mut Vec<Violation>) -> Vec<ProviderSpec> {
    let mut providers = Vec::with_capacity(raw.len());
    let mut names_seen: std::collections::HashSet<&str> = std::collections::HashSet::new();

    for (i, p) in raw.iter().enumerate() {
        let field = |suffix: &str| format!("providers[{i}].{suffix}");

        if !names_seen.insert(p.name.as_str()) {
            violations.push(Violation::new(
                field("name"),
                format!("provider {} is declared more than once", p.name),
            ));
        }
        if !is_lower_name(&p.name) {
            violations.push(Violation::new(
                field("name"),
                "must match ^[a-z][a-z0-9-]*$ (lowercase, dashes, no underscores)",
            ));
        }

        let known = known_provider(&p.name);

        // Known providers are pinned: manifest-supplied domain and
        // auth_style are discarded, which is what defeats redirection.
        let (domain, auth_style) = match known {
            Some(k) => (k.domain.to_string(), k.auth_style()),
            None => {
                let domain = match &p.domain {
                    Some(d) if is_fqdn(d) => d.clone(),
                    Some(_) => {
                        violations.push(Violation::new(
                            field("domain"),
                            "must be a fully qualified host name (no IP literals, no single labels)",
                        ));
                        String::new()
                    }
                    None => {
                        violations.push(Violation::new(
                            field("domain"),
                            "required for providers not in the known-provider table",
                        ));
                        String::new()
                    }
                };
                let auth_style = match &p.auth_style {
                    None => AuthStyle::Bearer,
                    Some(s) => match AuthStyle::try_from(s.clone()) {
                        Ok(style) => style,
                        Err(_) => {
                            violations.push(Violation::new(
                                field("auth_style"),
                                "must be \"bearer\" or a header name matching ^[a-z][a-z0-9-]*$",
                            ));
                            AuthStyle::Bearer
                        }
                    },
                };
                (domain, auth_style)
            }
        };

        let env_var = p.env_var.clone().unwrap_or_else(|| default_env_var(&p.name));
        let base_url_env = p
            .base_url_env
            .clone()
            .unwrap_or_else(|| default_base_url_env(&p.name));

        for (var, suffix) in [(&env_var, "env_var"), (&base_url_env, "base_url_env")] {
            if !is_env_var_name(var) {
                violations.push(Violation::new(
                    field(suffix),
                    "must match ^[A-Z][A-Z0-9_]*$",
                ));
            }
            if is_protected_env_var(var) {
                violations.push(Violation::new(
                    field(suffix),
                    format!("{var} is a protected environment variable"),
                ));
            }
            if let Some(owner) = known_provider_env_conflict(var, &p.name) {
                violations.push(Violation::new(
                    field(suffix),
                    format!("{var} belongs to known provider {}", owner.name),
                ));
            }
        }

        providers.push(ProviderSpec {
            name: p.name.clone(),
            domain,
            auth_style,
            env_var,
            base_url_env,
            known: known.is_some(),
        });
    }

    rules::scan_collisions(&providers, violations);
    providers
}
