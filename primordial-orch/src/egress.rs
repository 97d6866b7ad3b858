//! Egress-policy construction.
//!
//! The policy is handed to the VM provider at create time and must be in
//! force before the VM runs anything. Known providers' pinned domains are
//! auto-allowed so the proxy can reach them; unknown providers get no such
//! favor — their domain must appear in `allowed_domains` explicitly, where
//! the user saw and approved it. Package registries are only opened when a
//! `setup_command` exists to need them.

use primordial_core::manifest::Manifest;
use primordial_core::vm::EgressPolicy;

/// Registries auto-allowed while a setup command installs dependencies.
pub const PACKAGE_REGISTRIES: &[&str] = &[
    "pypi.org",
    "files.pythonhosted.org",
    "registry.npmjs.org",
];

/// Build the egress policy for one session.
pub fn policy_for(manifest: &Manifest) -> EgressPolicy {
    if manifest.network_unrestricted {
        // Requires prior user consent at the CLI layer.
        return EgressPolicy::allow_all();
    }

    let mut domains: Vec<String> = Vec::new();
    let mut push = |domain: &str| {
        if !domain.is_empty() && !domains.iter().any(|d| d == domain) {
            domains.push(domain.to_string());
        }
    };

    for entry in &manifest.allowed_domains {
        push(&entry.domain);
    }
    // The proxy's upstream connections cross the same firewall as the
    // agent's, so pinned provider domains must be reachable. Only known
    // providers qualify: their domain came from the in-code table, not
    // the manifest.
    for provider in &manifest.providers {
        if provider.known {
            push(&provider.domain);
        }
    }
    if manifest.setup_command.is_some() {
        for registry in PACKAGE_REGISTRIES {
            push(registry);
        }
    }

    if domains.is_empty() {
        EgressPolicy::deny_all()
    } else {
        EgressPolicy::allow_domains(domains)
    }
}
