//! Command construction for in-VM processes.
//!
//! Everything the orchestrator runs inside the VM is an argv vector; the
//! only shell involved is the one that runs the manifest's own command
//! strings, and every value the orchestrator interpolates into a shell
//! word goes through [`shell_quote`] first. Environment values travel in
//! the spawn request's env map, never spliced into command text.

use primordial_core::vm::{ExecRequest, SpawnRequest, VmUser};
use std::collections::BTreeMap;

/// Quote a string for POSIX sh. Wraps in single quotes; embedded single
/// quotes become `'\''`. The result is always exactly one shell word, so
/// no value can terminate its quoting and inject further commands.
pub fn shell_quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for ch in s.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

/// The exec request for the manifest's `setup_command`, run as the agent
/// user in the agent code directory.
pub fn setup_exec(
    setup_command: &str,
    workdir: &str,
    env: BTreeMap<String, String>,
) -> ExecRequest {
    let mut req = ExecRequest::new(
        ["/bin/sh", "-c", &wrap_in_workdir(workdir, setup_command)],
        VmUser::Agent,
    );
    req.env = env;
    req
}

/// The spawn request for the agent itself: `run_command` as the agent
/// user, stdin held open for the downstream message protocol.
pub fn agent_spawn(
    run_command: &str,
    workdir: &str,
    env: BTreeMap<String, String>,
) -> SpawnRequest {
    SpawnRequest {
        argv: vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            wrap_in_workdir(workdir, run_command),
        ],
        user: VmUser::Agent,
        env,
        stdin_payload: None,
    }
}

fn wrap_in_workdir(workdir: &str, command: &str) -> String {
    // The workdir is orchestrator-constructed but quoted anyway; the
    // command string is the agent author's own and runs as the agent user.
    format!("cd {} && exec {}", shell_quote(workdir), command)
}
