//! In-memory fake of the microVM contract.
//!
//! Scriptable where tests need failures (create, specific exec commands,
//! port probes) and faithful where the orchestrator needs behavior (spawn
//! processes yield scripted stderr/stdout, destroy is idempotent and
//! counted).

use crate::error::SandboxError;
use crate::id::VmId;
use crate::vm::{ExecOutput, ExecRequest, SpawnRequest, Vm, VmConfig, VmProcess, VmProvider, VmUser};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// One recorded `upload` call.
#[derive(Debug, Clone)]
pub struct RecordedUpload {
    /// Destination path inside the VM.
    pub dest: String,
    /// File contents.
    pub bytes: Vec<u8>,
    /// File mode.
    pub mode: u32,
    /// Owning user.
    pub owner: VmUser,
}

/// One recorded `spawn` call.
#[derive(Debug, Clone)]
pub struct RecordedSpawn {
    /// Argument vector.
    pub argv: Vec<String>,
    /// User the process ran as.
    pub user: VmUser,
    /// Environment handed to the process.
    pub env: std::collections::BTreeMap<String, String>,
    /// One-shot stdin payload, if any.
    pub stdin_payload: Option<Vec<u8>>,
}

/// Everything one fake VM observed. Tests read this after the run.
#[derive(Debug, Default)]
pub struct FakeVmState {
    /// The config the VM was created under (egress policy included).
    pub config: Mutex<Option<VmConfig>>,
    /// Every upload, in order.
    pub uploads: Mutex<Vec<RecordedUpload>>,
    /// Every exec, in order.
    pub execs: Mutex<Vec<ExecRequest>>,
    /// Every spawn, in order.
    pub spawns: Mutex<Vec<RecordedSpawn>>,
    /// Every probed port, in order.
    pub probes: Mutex<Vec<u16>>,
    /// Bytes written to a spawned process's stdin after spawn time.
    pub late_stdin: Mutex<Vec<u8>>,
    /// How many times destroy was called.
    pub destroy_count: AtomicUsize,
}

impl FakeVmState {
    /// Every exec argv joined with spaces, for quick substring assertions.
    pub fn exec_lines(&self) -> Vec<String> {
        self.execs
            .lock()
            .unwrap()
            .iter()
            .map(|req| req.argv.join(" "))
            .collect()
    }

    /// The recorded spawns for a given user.
    pub fn spawns_for(&self, user: VmUser) -> Vec<RecordedSpawn> {
        self.spawns
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.user == user)
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone)]
struct Script {
    fail_create: bool,
    fail_exec_containing: Vec<String>,
    proxy_stderr: Vec<String>,
    agent_stdout: Vec<Vec<u8>>,
    agent_exit: i32,
    probe_ok: bool,
    state_tar: Vec<u8>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            fail_create: false,
            fail_exec_containing: Vec::new(),
            // The line a healthy proxy emits once every listener is bound.
            proxy_stderr: vec!["primordial-proxy ready ports=9001".to_string()],
            agent_stdout: Vec::new(),
            agent_exit: 0,
            probe_ok: true,
            state_tar: Vec::new(),
        }
    }
}

/// Scriptable fake [`VmProvider`]. Construct, chain `with_*` scripting, hand
/// to the orchestrator, then inspect [`FakeVmProvider::vms`].
#[derive(Debug, Default)]
pub struct FakeVmProvider {
    script: Script,
    created: Mutex<Vec<Arc<FakeVmState>>>,
    counter: AtomicUsize,
}

impl FakeVmProvider {
    /// A provider where everything succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail VM creation outright.
    pub fn with_create_failure(mut self) -> Self {
        self.script.fail_create = true;
        self
    }

    /// Any exec whose argv contains this substring exits 1.
    pub fn with_exec_failure(mut self, needle: impl Into<String>) -> Self {
        self.script.fail_exec_containing.push(needle.into());
        self
    }

    /// Replace the stderr lines emitted by a privileged spawn (the proxy).
    pub fn with_proxy_stderr<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.script.proxy_stderr = lines.into_iter().map(Into::into).collect();
        self
    }

    /// Script the agent process's stdout chunks and exit code.
    pub fn with_agent_output(mut self, chunks: Vec<Vec<u8>>, exit: i32) -> Self {
        self.script.agent_stdout = chunks;
        self.script.agent_exit = exit;
        self
    }

    /// Make loopback port probes report closed.
    pub fn with_closed_ports(mut self) -> Self {
        self.script.probe_ok = false;
        self
    }

    /// Bytes `pull_tar` returns (a provider-produced state archive).
    pub fn with_state_tar(mut self, bytes: Vec<u8>) -> Self {
        self.script.state_tar = bytes;
        self
    }

    /// The state of every VM created so far.
    pub fn vms(&self) -> Vec<Arc<FakeVmState>> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl VmProvider for FakeVmProvider {
    async fn create(&self, config: &VmConfig) -> Result<Box<dyn Vm>, SandboxError> {
        if self.script.fail_create {
            return Err(SandboxError::Provider("simulated create failure".into()));
        }
        let state = Arc::new(FakeVmState::default());
        *state.config.lock().unwrap() = Some(config.clone());
        self.created.lock().unwrap().push(Arc::clone(&state));
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeVm {
            id: VmId::new(format!("fake-vm-{n}")),
            state,
            script: self.script.clone(),
        }))
    }
}

/// One fake VM. Also constructible directly for lower-level tests.
#[derive(Debug)]
pub struct FakeVm {
    id: VmId,
    state: Arc<FakeVmState>,
    script: Script,
}

impl FakeVm {
    /// This VM's recorded state.
    pub fn state(&self) -> Arc<FakeVmState> {
        Arc::clone(&self.state)
    }
}

#[async_trait]
impl Vm for FakeVm {
    fn id(&self) -> &VmId {
        &self.id
    }

    async fn upload(
        &self,
        dest: &str,
        bytes: &[u8],
        mode: u32,
        owner: VmUser,
    ) -> Result<(), SandboxError> {
        self.state.uploads.lock().unwrap().push(RecordedUpload {
            dest: dest.to_string(),
            bytes: bytes.to_vec(),
            mode,
            owner,
        });
        Ok(())
    }

    async fn exec(&self, req: ExecRequest) -> Result<ExecOutput, SandboxError> {
        let line = req.argv.join(" ");
        self.state.execs.lock().unwrap().push(req);
        let failed = self
            .script
            .fail_exec_containing
            .iter()
            .any(|needle| line.contains(needle.as_str()));
        Ok(ExecOutput {
            exit_code: if failed { 1 } else { 0 },
            stdout: Vec::new(),
            stderr: if failed {
                b"simulated failure".to_vec()
            } else {
                Vec::new()
            },
        })
    }

    async fn spawn(&self, req: SpawnRequest) -> Result<Box<dyn VmProcess>, SandboxError> {
        let one_shot_stdin = req.stdin_payload.is_some();
        self.state.spawns.lock().unwrap().push(RecordedSpawn {
            argv: req.argv.clone(),
            user: req.user,
            env: req.env.clone(),
            stdin_payload: req.stdin_payload.clone(),
        });
        let (stderr, stdout, exit) = match req.user {
            VmUser::Privileged => (self.script.proxy_stderr.clone(), Vec::new(), 0),
            VmUser::Agent => (Vec::new(), self.script.agent_stdout.clone(), self.script.agent_exit),
        };
        Ok(Box::new(FakeProcess {
            stderr: stderr.into(),
            stdout: stdout.into(),
            exit,
            one_shot_stdin,
            state: Arc::clone(&self.state),
            killed: false,
        }))
    }

    async fn probe_tcp(&self, port: u16) -> Result<bool, SandboxError> {
        self.state.probes.lock().unwrap().push(port);
        Ok(self.script.probe_ok)
    }

    async fn pull_tar(&self, paths: &[String]) -> Result<Vec<u8>, SandboxError> {
        let _ = paths;
        Ok(self.script.state_tar.clone())
    }

    async fn destroy(&self) -> Result<(), SandboxError> {
        self.state.destroy_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeProcess {
    stderr: VecDeque<String>,
    stdout: VecDeque<Vec<u8>>,
    exit: i32,
    one_shot_stdin: bool,
    state: Arc<FakeVmState>,
    killed: bool,
}

#[async_trait]
impl VmProcess for FakeProcess {
    async fn next_stderr_line(&mut self) -> Result<Option<String>, SandboxError> {
        Ok(self.stderr.pop_front())
    }

    async fn next_stdout_chunk(&mut self) -> Result<Option<Vec<u8>>, SandboxError> {
        Ok(self.stdout.pop_front())
    }

    async fn write_stdin(&mut self, bytes: &[u8]) -> Result<(), SandboxError> {
        if self.one_shot_stdin {
            return Err(SandboxError::Provider("stdin already closed".into()));
        }
        self.state.late_stdin.lock().unwrap().extend_from_slice(bytes);
        Ok(())
    }

    async fn wait(&mut self) -> Result<i32, SandboxError> {
        Ok(if self.killed { 137 } else { self.exit })
    }

    async fn kill(&mut self) -> Result<(), SandboxError> {
        self.killed = true;
        Ok(())
    }
}
