#![deny(missing_docs)]
//! The sandbox orchestrator: from empty VM to running agent, in order.
//!
//! One session is one strict sequence:
//!
//! 1. Build the host env allowlist.
//! 2. Create the VM under the constructed egress policy.
//! 3. Upload agent code.
//! 4. Restore prior state (through the snapshot safety filter).
//! 5. Harden, as the privileged user, before any agent-controlled code.
//! 6. Start the credential proxy and wait for readiness.
//! 7. Run the manifest's `setup_command` — *after* the proxy holds its
//!    ports, so a malicious setup script cannot squat them.
//! 8. Exec the agent, whose environment carries only placeholder tokens
//!    and loopback base URLs.
//!
//! Every step must complete before the next begins; any failure before
//! step 8 destroys the VM — there is no partial start. The one
//! load-bearing happens-before (harden ∧ proxy-ready precede agent exec)
//! is re-checked against the event log immediately before the exec, not
//! just implied by control flow.
//!
//! Sessions are independent tasks; many can run in parallel. They share
//! nothing but the vault, which they only read.

use primordial_core::error::SandboxError;
use primordial_core::events::{EventLog, SessionEvent};
use primordial_core::id::SessionId;
use primordial_core::manifest::Manifest;
use primordial_core::timeouts::{DurationMs, Timeouts};
use primordial_core::vm::{Vm, VmConfig, VmProcess, VmProvider, VmUser};
use primordial_vault::Secret;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod boot;
pub mod egress;
pub mod envset;
pub mod hardening;
pub mod launch;
pub mod session;

pub use session::SessionHandle;

/// Orchestrator configuration.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct OrchConfig {
    /// Host path of the proxy binary artifact to upload.
    pub proxy_binary: PathBuf,
    /// Every bounded wait.
    pub timeouts: Timeouts,
    /// First loopback port assigned to a provider route.
    pub base_port: u16,
    /// The agent user's home inside the VM.
    pub agent_home: String,
    /// Where the proxy binary lands inside the VM (privileged path).
    pub proxy_guest_path: String,
}

impl OrchConfig {
    /// Defaults for everything but the proxy binary location.
    pub fn new(proxy_binary: impl Into<PathBuf>) -> Self {
        Self {
            proxy_binary: proxy_binary.into(),
            timeouts: Timeouts::default(),
            base_port: 9001,
            agent_home: "/home/agent".to_string(),
            proxy_guest_path: "/opt/primordial/primordial-proxy".to_string(),
        }
    }
}

/// Runs sessions against a VM provider.
pub struct Orchestrator {
    provider: Arc<dyn VmProvider>,
    config: OrchConfig,
}

/// Run `fut` under a bounded deadline, mapping expiry to
/// [`SandboxError::Timeout`].
pub(crate) async fn bounded<T>(
    step: &str,
    limit: DurationMs,
    fut: impl Future<Output = Result<T, SandboxError>>,
) -> Result<T, SandboxError> {
    match tokio::time::timeout(limit.to_std(), fut).await {
        Ok(result) => result,
        Err(_) => Err(SandboxError::Timeout {
            step: step.to_string(),
            limit,
        }),
    }
}

struct UploadFile {
    rel: String,
    bytes: Vec<u8>,
    mode: u32,
}

fn collect_files(root: &Path) -> std::io::Result<Vec<UploadFile>> {
    fn walk(root: &Path, rel: &Path, out: &mut Vec<UploadFile>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(root.join(rel))? {
            let entry = entry?;
            let child = rel.join(entry.file_name());
            let meta = std::fs::symlink_metadata(entry.path())?;
            if meta.file_type().is_symlink() {
                // Agent archives carry regular files; links are dropped
                // the same way the state snapshotter drops them.
                tracing::warn!(path = %child.display(), "skipping symlink in agent dir");
                continue;
            }
            if meta.is_dir() {
                walk(root, &child, out)?;
                continue;
            }
            out.push(UploadFile {
                rel: child.to_string_lossy().replace('\\', "/"),
                bytes: std::fs::read(entry.path())?,
                mode: file_mode(&meta),
            });
        }
        Ok(())
    }
    let mut out = Vec::new();
    walk(root, Path::new(""), &mut out)?;
    out.sort_by(|a, b| a.rel.cmp(&b.rel));
    Ok(out)
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    meta.mode() & 0o777
}

#[cfg(not(unix))]
fn file_mode(_meta: &std::fs::Metadata) -> u32 {
    0o644
}

impl Orchestrator {
    /// Create an orchestrator over a VM provider.
    pub fn new(provider: Arc<dyn VmProvider>, config: OrchConfig) -> Self {
        Self { provider, config }
    }

    /// Bring up one session. On success the agent is running and the
    /// returned handle owns the session lifetime; on any failure the VM
    /// (if one was created) has already been destroyed.
    pub async fn run(
        &self,
        manifest: &Manifest,
        agent_dir: &Path,
        prior_state: Option<Vec<u8>>,
        secrets: BTreeMap<String, Secret>,
    ) -> Result<SessionHandle, SandboxError> {
        // Parse-time invariants are re-checked here: a hand-built
        // Manifest does not bypass env-var namespacing or collision
        // rules.
        primordial_manifest::recheck(manifest)?;

        let events = Arc::new(EventLog::new());
        let timeouts = self.config.timeouts;

        // Step 1: env allowlist.
        let host_env = envset::filtered_host_env();
        events.record(SessionEvent::EnvFiltered {
            kept: host_env.len(),
        });

        // Step 2: VM under the constructed egress policy.
        let vm_config = VmConfig {
            egress: egress::policy_for(manifest),
            resources: manifest.resources,
        };
        let vm = bounded(
            "vm create",
            timeouts.vm_create,
            self.provider.create(&vm_config),
        )
        .await?;
        let vm: Arc<dyn Vm> = Arc::from(vm);
        events.record(SessionEvent::VmCreated {
            vm_id: vm.id().to_string(),
        });
        tracing::info!(vm_id = %vm.id(), agent = %manifest.name, "vm created");

        match self
            .bring_up(&vm, manifest, agent_dir, prior_state, secrets, &host_env, &events)
            .await
        {
            Ok((agent, proxy, token, ports)) => Ok(SessionHandle::new(
                SessionId::new(format!("session-{}", vm.id())),
                vm,
                agent,
                proxy,
                events,
                token,
                ports,
            )),
            Err(e) => {
                // No partial start: whatever step failed, the VM goes.
                tracing::error!(vm_id = %vm.id(), error = %e, "bring-up failed, destroying vm");
                let _ = vm.destroy().await;
                events.record(SessionEvent::VmDestroyed);
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn bring_up(
        &self,
        vm: &Arc<dyn Vm>,
        manifest: &Manifest,
        agent_dir: &Path,
        prior_state: Option<Vec<u8>>,
        secrets: BTreeMap<String, Secret>,
        host_env: &BTreeMap<String, String>,
        events: &Arc<EventLog>,
    ) -> Result<
        (
            Box<dyn VmProcess>,
            Option<Box<dyn VmProcess>>,
            String,
            BTreeMap<String, u16>,
        ),
        SandboxError,
    > {
        let timeouts = self.config.timeouts;
        let workdir = format!("{}/agent", self.config.agent_home);

        // Step 3: upload agent code, unprivileged ownership.
        let dir = agent_dir.to_path_buf();
        let files = tokio::task::spawn_blocking(move || collect_files(&dir))
            .await
            .map_err(|e| SandboxError::Upload(e.to_string()))?
            .map_err(|e| SandboxError::Upload(e.to_string()))?;
        bounded("code upload", timeouts.upload, async {
            for file in &files {
                vm.upload(
                    &format!("{workdir}/{}", file.rel),
                    &file.bytes,
                    file.mode,
                    VmUser::Agent,
                )
                .await?;
            }
            Ok(())
        })
        .await?;
        events.record(SessionEvent::CodeUploaded { files: files.len() });

        // Step 4: restore prior state through the safety filter. A
        // violating archive fails the whole session.
        if let Some(blob) = prior_state {
            let restored = tokio::task::spawn_blocking(
                move || -> Result<Vec<UploadFile>, SandboxError> {
                    let staging =
                        tempfile::tempdir().map_err(|e| SandboxError::Restore(e.to_string()))?;
                    primordial_snapshot::unpack(&blob, staging.path())?;
                    collect_files(staging.path()).map_err(|e| SandboxError::Restore(e.to_string()))
                },
            )
            .await
            .map_err(|e| SandboxError::Restore(e.to_string()))??;

            bounded("state upload", timeouts.upload, async {
                for file in &restored {
                    vm.upload(
                        &format!("{}/{}", self.config.agent_home, file.rel),
                        &file.bytes,
                        file.mode,
                        VmUser::Agent,
                    )
                    .await?;
                }
                Ok(())
            })
            .await?;
            events.record(SessionEvent::StateRestored {
                files: restored.len(),
            });
        }

        // Step 5: harden before any agent-controlled code runs.
        let keys_in_use = !secrets.is_empty();
        bounded(
            "harden",
            timeouts.harden,
            hardening::apply(&**vm, keys_in_use),
        )
        .await?;
        events.record(SessionEvent::HardenApplied);

        // Step 6: start the proxy and wait for readiness.
        let (proxy, token, ports) = if manifest.providers.is_empty() {
            (None, boot::generate_session_token()?, BTreeMap::new())
        } else {
            let booted = boot::start(&**vm, manifest, secrets, &self.config).await?;
            events.record(SessionEvent::ProxyReady {
                ports: booted.ports.values().copied().collect(),
            });
            (Some(booted.process), booted.token, booted.ports)
        };

        // Step 7: setup, after the proxy holds its ports.
        if let Some(setup_command) = &manifest.setup_command {
            let env = envset::agent_env(host_env, manifest, &token, &ports);
            let out = bounded(
                "setup command",
                timeouts.setup,
                vm.exec(launch::setup_exec(setup_command, &workdir, env)),
            )
            .await?;
            if !out.success() {
                return Err(SandboxError::SetupFailed {
                    exit_code: out.exit_code,
                });
            }
            events.record(SessionEvent::SetupFinished);
        }

        // Step 8: exec the agent. The ordering invariant is asserted from
        // the event log, not assumed from control flow.
        let hardened = events.happened(|e| matches!(e, SessionEvent::HardenApplied));
        let proxied = manifest.providers.is_empty()
            || events.happened(|e| matches!(e, SessionEvent::ProxyReady { .. }));
        if !(hardened && proxied) {
            return Err(SandboxError::Other(
                "ordering invariant violated: agent exec before harden/proxy-ready"
                    .to_string()
                    .into(),
            ));
        }

        let env = envset::agent_env(host_env, manifest, &token, &ports);
        let agent = vm
            .spawn(launch::agent_spawn(&manifest.run_command, &workdir, env))
            .await?;
        events.record(SessionEvent::AgentStarted);
        tracing::info!(agent = %manifest.name, "agent started");

        Ok((agent, proxy, token, ports))
    }
}
