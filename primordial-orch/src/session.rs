//! The live session handle.
//!
//! Returned once the agent process is running. Exposes the agent's stdin
//! and stdout, the event log, and [`SessionHandle::close`] — which packs
//! the allowlisted state subdirectories, then destroys the VM
//! *unconditionally*: a pack failure still tears the VM down and only
//! then surfaces. Close is idempotent; the second call is a successful
//! no-op.

use primordial_core::error::SandboxError;
use primordial_core::events::{EventLog, SessionEvent};
use primordial_core::id::SessionId;
use primordial_core::vm::{Vm, VmProcess};
use primordial_snapshot::STATE_ALLOWLIST;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

/// One running session: a VM, a proxy, an agent process.
pub struct SessionHandle {
    session_id: SessionId,
    vm: Arc<dyn Vm>,
    agent: Mutex<Box<dyn VmProcess>>,
    // Held so the proxy process handle lives exactly as long as the
    // session. The VM teardown terminates the process itself.
    _proxy: Option<Mutex<Box<dyn VmProcess>>>,
    events: Arc<EventLog>,
    token: String,
    ports: BTreeMap<String, u16>,
    closed: AtomicBool,
}

impl SessionHandle {
    pub(crate) fn new(
        session_id: SessionId,
        vm: Arc<dyn Vm>,
        agent: Box<dyn VmProcess>,
        proxy: Option<Box<dyn VmProcess>>,
        events: Arc<EventLog>,
        token: String,
        ports: BTreeMap<String, u16>,
    ) -> Self {
        Self {
            session_id,
            vm,
            agent: Mutex::new(agent),
            _proxy: proxy.map(Mutex::new),
            events,
            token,
            ports,
            closed: AtomicBool::new(false),
        }
    }

    /// This session's identifier.
    pub fn id(&self) -> &SessionId {
        &self.session_id
    }

    /// The underlying VM handle.
    pub fn vm(&self) -> &dyn Vm {
        &*self.vm
    }

    /// The session's event log.
    pub fn events(&self) -> Arc<EventLog> {
        Arc::clone(&self.events)
    }

    /// The placeholder token the agent authenticates with. A placeholder,
    /// not a secret: it is useless outside this VM's loopback.
    pub fn session_token(&self) -> &str {
        &self.token
    }

    /// provider name → loopback proxy port.
    pub fn ports(&self) -> &BTreeMap<String, u16> {
        &self.ports
    }

    /// Next chunk of the agent's stdout, or None at process exit.
    pub async fn next_stdout_chunk(&self) -> Result<Option<Vec<u8>>, SandboxError> {
        self.agent.lock().await.next_stdout_chunk().await
    }

    /// Write to the agent's stdin (the downstream message protocol).
    pub async fn write_stdin(&self, bytes: &[u8]) -> Result<(), SandboxError> {
        self.agent.lock().await.write_stdin(bytes).await
    }

    /// Wait for the agent to exit. The exit status is reported, never
    /// retried.
    pub async fn wait(&self) -> Result<i32, SandboxError> {
        let exit_code = self.agent.lock().await.wait().await?;
        self.events
            .record(SessionEvent::AgentExited { exit_code });
        Ok(exit_code)
    }

    /// End the session: offer the agent a shutdown, pack the allowlisted
    /// state for the caller, destroy the VM. Idempotent — the first call
    /// does the work, later calls return `Ok(None)`.
    ///
    /// The VM is destroyed even when state packing fails; the pack error
    /// surfaces only after teardown.
    pub async fn close(&self) -> Result<Option<Vec<u8>>, SandboxError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }

        // Best-effort shutdown message; an agent that does not speak the
        // protocol (or already exited) just ignores it.
        {
            let mut agent = self.agent.lock().await;
            let _ = agent.write_stdin(b"{\"type\":\"shutdown\"}\n").await;
        }

        let state = self.pack_state().await;
        let destroyed = self.vm.destroy().await;
        self.events.record(SessionEvent::VmDestroyed);

        match state {
            Ok(state) => {
                destroyed?;
                Ok(state)
            }
            Err(e) => {
                // Teardown already happened; the pack error wins.
                let _ = destroyed;
                Err(e)
            }
        }
    }

    async fn pack_state(&self) -> Result<Option<Vec<u8>>, SandboxError> {
        let paths: Vec<String> = STATE_ALLOWLIST.iter().map(|s| s.to_string()).collect();
        let raw = self
            .vm
            .pull_tar(&paths)
            .await
            .map_err(|e| SandboxError::StateSave(e.to_string()))?;
        if raw.is_empty() {
            // None of the allowlisted directories exist in the VM.
            return Ok(None);
        }

        // The pulled archive is agent-influenced: run it through the
        // snapshot safety filter and re-pack canonically before it
        // reaches durable storage.
        let bytes = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, SandboxError> {
            let staging = tempfile::tempdir().map_err(|e| SandboxError::StateSave(e.to_string()))?;
            primordial_snapshot::unpack(&raw, staging.path())?;
            Ok(primordial_snapshot::pack(staging.path())?)
        })
        .await
        .map_err(|e| SandboxError::StateSave(e.to_string()))??;

        self.events
            .record(SessionEvent::StateSaved { bytes: bytes.len() });
        Ok(Some(bytes))
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .field("ports", &self.ports)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
