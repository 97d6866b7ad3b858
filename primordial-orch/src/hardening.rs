//! In-VM hardening, applied as the privileged user before any
//! agent-controlled byte runs.
//!
//! Three measures, in order:
//!
//! 1. Neutralize privilege-escalation binaries (clear others' read/execute
//!    on setuid escalators).
//! 2. Remove the agent user from administrative groups.
//! 3. Hide the process table (`hidepid=2`), so the agent cannot read the
//!    privileged proxy's environment or command line from `/proc`.
//!
//! Measures 1 and 2 failing is always fatal. Measure 3 failing is fatal
//! exactly when at least one provider key is in use — with no keys in the
//! VM there is nothing for an unhidden process table to leak, and the
//! session may proceed.

use primordial_core::error::SandboxError;
use primordial_core::vm::{ExecRequest, Vm, VmUser};

/// Clears others' access on every escalation binary present. Fixed
/// strings only; nothing manifest-controlled is interpolated.
const NEUTRALIZE_ESCALATORS: &str = "for b in /usr/bin/sudo /usr/bin/su /bin/su /usr/bin/pkexec /usr/bin/doas; do \
     if [ -e \"$b\" ]; then chmod o-rx \"$b\" || exit 1; fi; \
   done";

/// Drops the agent user from admin groups it may have been created in.
const DROP_ADMIN_GROUPS: &str = "for g in sudo wheel admin; do \
     if getent group \"$g\" >/dev/null 2>&1; then gpasswd -d agent \"$g\" >/dev/null 2>&1 || true; fi; \
   done";

/// Remounts /proc so unprivileged users see only their own processes.
const HIDE_PROCESS_TABLE: &str = "mount -o remount,rw,hidepid=2 /proc";

fn privileged_sh(script: &str) -> ExecRequest {
    ExecRequest::new(["/bin/sh", "-c", script], VmUser::Privileged)
}

/// Apply all hardening measures. `keys_in_use` is whether any provider
/// secret will enter this VM; it decides whether a process-hiding failure
/// is fatal.
pub async fn apply(vm: &dyn Vm, keys_in_use: bool) -> Result<(), SandboxError> {
    let out = vm.exec(privileged_sh(NEUTRALIZE_ESCALATORS)).await?;
    if !out.success() {
        return Err(SandboxError::Harden(
            "could not neutralize privilege-escalation binaries".into(),
        ));
    }

    let out = vm.exec(privileged_sh(DROP_ADMIN_GROUPS)).await?;
    if !out.success() {
        return Err(SandboxError::Harden(
            "could not drop agent from admin groups".into(),
        ));
    }

    let out = vm.exec(privileged_sh(HIDE_PROCESS_TABLE)).await?;
    if !out.success() {
        if keys_in_use {
            // Fail closed: an unhidden process table plus live keys means
            // the agent could read the proxy's memory map neighbors.
            return Err(SandboxError::Harden(
                "process-table hiding unavailable with provider keys in use".into(),
            ));
        }
        tracing::warn!("process-table hiding unavailable; continuing (no provider keys in use)");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use primordial_core::test_utils::FakeVmProvider;
    use primordial_core::vm::{EgressPolicy, VmConfig, VmProvider};

    #[tokio::test]
    async fn applies_all_three_measures_in_order() {
        let provider = FakeVmProvider::new();
        let vm = provider
            .create(&VmConfig::new(EgressPolicy::deny_all()))
            .await
            .unwrap();
        apply(&*vm, true).await.unwrap();

        let lines = provider.vms()[0].exec_lines();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("chmod o-rx"));
        assert!(lines[1].contains("gpasswd -d agent"));
        assert!(lines[2].contains("hidepid=2"));
    }

    #[tokio::test]
    async fn hiding_failure_with_keys_fails_closed() {
        let provider = FakeVmProvider::new().with_exec_failure("hidepid");
        let vm = provider
            .create(&VmConfig::new(EgressPolicy::deny_all()))
            .await
            .unwrap();
        let err = apply(&*vm, true).await.unwrap_err();
        assert!(matches!(err, SandboxError::Harden(_)));
    }

    #[tokio::test]
    async fn hiding_failure_without_keys_proceeds() {
        let provider = FakeVmProvider::new().with_exec_failure("hidepid");
        let vm = provider
            .create(&VmConfig::new(EgressPolicy::deny_all()))
            .await
            .unwrap();
        assert!(apply(&*vm, false).await.is_ok());
    }

    #[tokio::test]
    async fn escalator_failure_is_always_fatal() {
        let provider = FakeVmProvider::new().with_exec_failure("chmod o-rx");
        let vm = provider
            .create(&VmConfig::new(EgressPolicy::deny_all()))
            .await
            .unwrap();
        let err = apply(&*vm, false).await.unwrap_err();
        assert!(matches!(err, SandboxError::Harden(_)));
    }
}
