//! Subprocess supervision.
//!
//! Every child the agent runners spawn is registered here by PID, the
//! global concurrency cap is enforced by a slot semaphore, and a periodic
//! reaper kills children whose sessions are gone - plus system-level
//! orphans left behind by a previous crash.

pub mod reaper;
pub mod registry;
pub mod spawn;

pub use registry::{ProcessRegistry, SlotPermit};
pub use spawn::{ensure_exit, spawn_captured};
