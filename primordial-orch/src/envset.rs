//! The host env allowlist and the agent environment.
//!
//! Nothing crosses the host→VM boundary except a fixed allowlist of benign
//! locale and terminal vars, plus the per-provider placeholder variables
//! the orchestrator constructs itself. The provider env values are the
//! session placeholder token and the loopback base URL — never a real key.

use primordial_core::manifest::Manifest;
use std::collections::BTreeMap;

/// Host vars allowed to cross into the VM. Positive list; anything not
/// here is dropped, not merely logged.
pub const HOST_ENV_ALLOWLIST: &[&str] = &["LANG", "LC_ALL", "LC_CTYPE", "TERM", "TZ"];

/// Filter the host environment down to the allowlist.
pub fn filtered_host_env() -> BTreeMap<String, String> {
    std::env::vars()
        .filter(|(name, _)| HOST_ENV_ALLOWLIST.contains(&name.as_str()))
        .collect()
}

/// The full environment the agent process launches with: the filtered
/// host vars plus, per provider, the placeholder token and the loopback
/// base URL of its proxy route.
pub fn agent_env(
    host_env: &BTreeMap<String, String>,
    manifest: &Manifest,
    session_token: &str,
    ports: &BTreeMap<String, u16>,
) -> BTreeMap<String, String> {
    let mut env = host_env.clone();
    for provider in &manifest.providers {
        if let Some(port) = ports.get(&provider.name) {
            env.insert(provider.env_var.clone(), session_token.to_string());
            env.insert(
                provider.base_url_env.clone(),
                format!("http://127.0.0.1:{port}"),
            );
        }
    }
    env
}
