//! Bounded waits: the one place every timeout is declared.
//!
//! Every external wait in the core carries a configurable bound — no
//! indefinite blocks anywhere. The [`Timeouts`] struct is that
//! configuration, with the documented defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Duration in milliseconds with a stable wire format.
///
/// Serializes as a plain `u64` integer so the value survives config files
/// and event logs without depending on serde's internal `Duration` layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DurationMs(u64);

impl DurationMs {
    /// Zero duration.
    pub const ZERO: Self = Self(0);

    /// Create from milliseconds.
    pub const fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    /// Create from seconds.
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1000))
    }

    /// Get the value in milliseconds.
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Convert to `std::time::Duration`.
    pub fn to_std(&self) -> Duration {
        Duration::from_millis(self.0)
    }
}

impl From<Duration> for DurationMs {
    fn from(d: Duration) -> Self {
        Self(d.as_millis() as u64)
    }
}

impl From<DurationMs> for Duration {
    fn from(d: DurationMs) -> Self {
        Duration::from_millis(d.0)
    }
}

impl std::fmt::Display for DurationMs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Every configurable bound in the bring-up sequence and the proxy.
///
/// The defaults are the contract: VM create 120 s, upload 60 s, proxy
/// readiness 10 s, setup 600 s, per-request proxy socket 60 s.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeouts {
    /// Creating the microVM, including its egress policy.
    pub vm_create: DurationMs,
    /// Uploading agent code, restored state, or the proxy binary.
    pub upload: DurationMs,
    /// Waiting for the proxy readiness marker and the first port probe.
    pub proxy_ready: DurationMs,
    /// Running the manifest's `setup_command`.
    pub setup: DurationMs,
    /// Per-request socket deadline inside the proxy.
    pub proxy_socket: DurationMs,
    /// Any single in-VM hardening command.
    pub harden: DurationMs,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            vm_create: DurationMs::from_secs(120),
            upload: DurationMs::from_secs(60),
            proxy_ready: DurationMs::from_secs(10),
            setup: DurationMs::from_secs(600),
            proxy_socket: DurationMs::from_secs(60),
            harden: DurationMs::from_secs(30),
        }
    }
}
