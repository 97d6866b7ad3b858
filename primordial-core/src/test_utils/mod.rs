//! Test fakes for the external collaborators.
//!
//! Enabled with the `test-utils` feature. The fakes record everything the
//! orchestrator asks of them, so tests can assert on the exact sequence of
//! uploads, commands, and spawns — including what crossed each boundary
//! (and, more importantly, what must not have).

mod fake_vm;

pub use fake_vm::{FakeVm, FakeVmProvider, FakeVmState, RecordedSpawn, RecordedUpload};
