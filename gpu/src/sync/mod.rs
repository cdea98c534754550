//! Synchronization primitives.
//!
//! - [`SignalPool`]: recyclable semaphores guarding in-flight resources
//! - [`SyncObject`]: exportable semaphore pair for sharing with a foreign API

mod external;
mod signal;

pub use external::{SyncObject, SyncState};
pub use signal::{GuardSignal, SignalId, SignalPool, WaitKind};
