//! Observable session bring-up events.
//!
//! The bring-up sequence is a total order with one load-bearing
//! happens-before: no agent byte may execute until both hardening and
//! proxy readiness have completed. The [`EventLog`] makes that invariant
//! checkable — the orchestrator records each step as it completes and
//! refuses to launch the agent unless the log proves the prerequisites
//! happened. Tests assert the same property from the outside.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// One step of session bring-up or teardown completing.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The host env allowlist was applied.
    EnvFiltered {
        /// How many host vars survived the filter.
        kept: usize,
    },
    /// The VM exists and its egress policy is in force.
    VmCreated {
        /// The provider's VM handle.
        vm_id: String,
    },
    /// Agent code landed in the VM.
    CodeUploaded {
        /// Number of files uploaded.
        files: usize,
    },
    /// Prior state was restored into the allowlisted subdirectories.
    StateRestored {
        /// Number of files restored.
        files: usize,
    },
    /// All hardening measures applied.
    HardenApplied,
    /// The credential proxy bound every listener and answered a TCP probe.
    ProxyReady {
        /// The bound loopback ports, one per provider.
        ports: Vec<u16>,
    },
    /// The manifest's setup command exited zero.
    SetupFinished,
    /// The agent process was launched.
    AgentStarted,
    /// The agent process exited.
    AgentExited {
        /// Its exit code.
        exit_code: i32,
    },
    /// Session state was packed for the caller.
    StateSaved {
        /// Size of the packed archive.
        bytes: usize,
    },
    /// The VM was destroyed.
    VmDestroyed,
}

/// A recorded event with its wall-clock timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampedEvent {
    /// Unix timestamp in milliseconds.
    pub timestamp_ms: u64,
    /// The event.
    pub event: SessionEvent,
}

/// Ordered, append-only log of one session's events. Shared between the
/// orchestrator task and the session handle; interior mutability keeps the
/// recording call sites clean.
#[derive(Debug, Default)]
pub struct EventLog {
    entries: Mutex<Vec<TimestampedEvent>>,
}

impl EventLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event, stamped now.
    pub fn record(&self, event: SessionEvent) {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        self.entries
            .lock()
            .expect("event log poisoned")
            .push(TimestampedEvent {
                timestamp_ms,
                event,
            });
    }

    /// A point-in-time copy of the log.
    pub fn snapshot(&self) -> Vec<TimestampedEvent> {
        self.entries.lock().expect("event log poisoned").clone()
    }

    /// Whether any recorded event matches the predicate.
    pub fn happened(&self, pred: impl Fn(&SessionEvent) -> bool) -> bool {
        self.entries
            .lock()
            .expect("event log poisoned")
            .iter()
            .any(|e| pred(&e.event))
    }

    /// Position of the first event matching the predicate.
    pub fn index_of(&self, pred: impl Fn(&SessionEvent) -> bool) -> Option<usize> {
        self.entries
            .lock()
            .expect("event log poisoned")
            .iter()
            .position(|e| pred(&e.event))
    }
}
