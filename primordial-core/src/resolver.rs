//! The agent-registry contract.

use crate::error::SandboxError;
use async_trait::async_trait;
use std::path::PathBuf;

/// Fetches an agent archive by URL and optional ref, returning a local
/// directory containing the agent's code and its `agent.yaml`.
///
/// This is a named contract for an external collaborator — the registry
/// client, git fetcher, or local-directory passthrough all implement it.
/// The core never interprets the URL.
#[async_trait]
pub trait AgentResolver: Send + Sync {
    /// Resolve `url` (at `reference`, if given) to a local directory.
    async fn resolve(&self, url: &str, reference: Option<&str>) -> Result<PathBuf, SandboxError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn _assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn resolver_is_object_safe_send_sync() {
        _assert_send_sync::<Box<dyn AgentResolver>>();
    }
}
