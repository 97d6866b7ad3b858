//! The microVM-provider contract.
//!
//! The provider (Firecracker wrapper, cloud API, test fake) is an external
//! collaborator. This module names everything the orchestrator is allowed to
//! ask of it: create a VM under an egress policy, upload a file, run a
//! command, spawn a long-lived process, probe a loopback port, pull a tar of
//! paths, destroy the VM. The security ordering lives in the orchestrator;
//! providers only execute.
//!
//! Implementations must enforce the egress policy at the network level —
//! the core never inspects traffic and has no second line of defense if the
//! provider lets a denied destination through.

use crate::error::SandboxError;
use crate::id::VmId;
use crate::manifest::ResourceLimits;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Egress traffic action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkAction {
    /// Allow the traffic.
    Allow,
    /// Deny the traffic.
    Deny,
}

/// A single egress rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRule {
    /// Domain to match.
    pub destination: String,
    /// Port (None = all ports).
    pub port: Option<u16>,
    /// Allow or deny.
    pub action: NetworkAction,
}

impl NetworkRule {
    /// Allow all ports to the given destination.
    pub fn allow(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            port: None,
            action: NetworkAction::Allow,
        }
    }
}

/// The egress policy a VM is created under. The default action applies to
/// any destination no rule matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EgressPolicy {
    /// Action for unmatched destinations.
    pub default: NetworkAction,
    /// Explicit rules, first match wins.
    pub rules: Vec<NetworkRule>,
}

impl EgressPolicy {
    /// Deny everything.
    pub fn deny_all() -> Self {
        Self {
            default: NetworkAction::Deny,
            rules: Vec::new(),
        }
    }

    /// Allow everything. Only valid after explicit user consent upstream.
    pub fn allow_all() -> Self {
        Self {
            default: NetworkAction::Allow,
            rules: Vec::new(),
        }
    }

    /// Deny by default, allowing exactly the given domains.
    pub fn allow_domains<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            default: NetworkAction::Deny,
            rules: domains.into_iter().map(NetworkRule::allow).collect(),
        }
    }

    /// The allowed destinations, in rule order.
    pub fn allowed_destinations(&self) -> Vec<&str> {
        self.rules
            .iter()
            .filter(|r| r.action == NetworkAction::Allow)
            .map(|r| r.destination.as_str())
            .collect()
    }
}

/// Configuration for one VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmConfig {
    /// Egress policy, enforced by the provider's firewall.
    pub egress: EgressPolicy,
    /// Advisory resource limits.
    pub resources: ResourceLimits,
}

impl VmConfig {
    /// A deny-all VM with no resource limits.
    pub fn new(egress: EgressPolicy) -> Self {
        Self {
            egress,
            resources: ResourceLimits::default(),
        }
    }
}

/// Which in-VM user a command runs as. Two users, one boundary: the
/// privileged user owns the proxy and the hardening steps, the agent user
/// owns everything the untrusted code touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmUser {
    /// The privileged user (proxy owner, hardening).
    Privileged,
    /// The unprivileged agent user.
    Agent,
}

/// A command to run to completion inside the VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    /// Argument vector. Never a shell-interpolated string.
    pub argv: Vec<String>,
    /// User to run as.
    pub user: VmUser,
    /// Environment for the command. Nothing is inherited.
    pub env: BTreeMap<String, String>,
}

impl ExecRequest {
    /// Build a request with an empty environment.
    pub fn new<I, S>(argv: I, user: VmUser) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            user,
            env: BTreeMap::new(),
        }
    }
}

/// A long-lived process to spawn inside the VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    /// Argument vector. Never a shell-interpolated string.
    pub argv: Vec<String>,
    /// User to run as.
    pub user: VmUser,
    /// Environment for the process. Nothing is inherited.
    pub env: BTreeMap<String, String>,
    /// If set, written to the process's stdin which is then closed. This is
    /// the only channel the proxy's secrets travel over — never argv, never
    /// env, never disk. If None, stdin stays open for [`VmProcess::write_stdin`].
    pub stdin_payload: Option<Vec<u8>>,
}

/// Output of a completed in-VM command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// Process exit code.
    pub exit_code: i32,
    /// Captured stdout.
    pub stdout: Vec<u8>,
    /// Captured stderr.
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    /// Whether the command exited zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Creates VMs. One implementation per microVM backend.
#[async_trait]
pub trait VmProvider: Send + Sync {
    /// Create a fresh VM under the given egress policy. The policy must be
    /// in force before the call returns; there is no window where the VM
    /// has unrestricted egress.
    async fn create(&self, config: &VmConfig) -> Result<Box<dyn Vm>, SandboxError>;
}

/// One live microVM.
#[async_trait]
pub trait Vm: Send + Sync {
    /// The provider's handle for this VM.
    fn id(&self) -> &VmId;

    /// Write a file into the VM at the given absolute path, creating parent
    /// directories, with the given mode, owned by the given user.
    async fn upload(
        &self,
        dest: &str,
        bytes: &[u8],
        mode: u32,
        owner: VmUser,
    ) -> Result<(), SandboxError>;

    /// Run a command to completion and capture its output. A nonzero exit
    /// is not an error at this layer — callers decide.
    async fn exec(&self, req: ExecRequest) -> Result<ExecOutput, SandboxError>;

    /// Spawn a long-lived process.
    async fn spawn(&self, req: SpawnRequest) -> Result<Box<dyn VmProcess>, SandboxError>;

    /// Whether a loopback TCP port inside the VM currently accepts
    /// connections.
    async fn probe_tcp(&self, port: u16) -> Result<bool, SandboxError>;

    /// Pull a gzipped tar of the given in-VM paths (relative to the agent
    /// home). Paths that do not exist are omitted; if none exist the
    /// payload is empty.
    async fn pull_tar(&self, paths: &[String]) -> Result<Vec<u8>, SandboxError>;

    /// Destroy the VM. Idempotent: destroying an already-destroyed VM
    /// succeeds.
    async fn destroy(&self) -> Result<(), SandboxError>;
}

/// A process spawned inside a VM.
#[async_trait]
pub trait VmProcess: Send {
    /// Next line from the process's stderr, or None at EOF.
    async fn next_stderr_line(&mut self) -> Result<Option<String>, SandboxError>;

    /// Next chunk from the process's stdout, or None at EOF.
    async fn next_stdout_chunk(&mut self) -> Result<Option<Vec<u8>>, SandboxError>;

    /// Write to the process's stdin. Errors if the spawn delivered a
    /// one-shot stdin payload (the pipe is already closed).
    async fn write_stdin(&mut self, bytes: &[u8]) -> Result<(), SandboxError>;

    /// Wait for the process to exit and return its exit code.
    async fn wait(&mut self) -> Result<i32, SandboxError>;

    /// Kill the process. Idempotent.
    async fn kill(&mut self) -> Result<(), SandboxError>;
}
