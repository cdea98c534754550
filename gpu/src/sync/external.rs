//! Export/interop synchronization objects.

use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;

use crate::command::CommandId;
use crate::driver::{Driver, ExternalHandle};
use crate::error::GpuResult;
use crate::resources::{DeferredDestructor, DeferredResource};

/// Consumption state of a [`SyncObject`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncState {
    /// Export command that signals the `wait` semaphore.
    pub exported_by: Option<CommandId>,
    /// The importer reported that it waited on `wait`.
    pub imported: bool,
    /// Our command that waits on the `signal` semaphore.
    pub consumed_by: Option<CommandId>,
}

/// A pair of exportable semaphores handed to a foreign API along with an
/// exported texture or buffer.
///
/// - `wait` is signaled by us when the export command completes; the importer
///   waits on it before touching the resource.
/// - `signal` is signaled by the importer when it is done; our next use of
///   the resource waits on it.
///
/// A resource cannot be exported again until both semaphores have been
/// consumed.
pub struct SyncObject {
    wait: vk::Semaphore,
    signal: vk::Semaphore,
    wait_handle: ExternalHandle,
    signal_handle: ExternalHandle,
    state: Mutex<SyncState>,
    deferred: Arc<DeferredDestructor>,
}

impl SyncObject {
    pub(crate) fn new(driver: &dyn Driver, deferred: Arc<DeferredDestructor>) -> GpuResult<Self> {
        let wait = driver.create_semaphore(true)?;
        let signal = match driver.create_semaphore(true) {
            Ok(signal) => signal,
            Err(err) => {
                driver.destroy_semaphore(wait);
                return Err(err);
            }
        };
        let handles = driver
            .export_semaphore(wait)
            .and_then(|w| driver.export_semaphore(signal).map(|s| (w, s)));
        let (wait_handle, signal_handle) = match handles {
            Ok(handles) => handles,
            Err(err) => {
                driver.destroy_semaphore(wait);
                driver.destroy_semaphore(signal);
                return Err(err);
            }
        };

        Ok(Self {
            wait,
            signal,
            wait_handle,
            signal_handle,
            state: Mutex::new(SyncState::default()),
            deferred,
        })
    }

    /// Semaphore the importer waits on.
    pub fn wait_semaphore(&self) -> vk::Semaphore {
        self.wait
    }

    /// Semaphore the importer signals when it is done.
    pub fn signal_semaphore(&self) -> vk::Semaphore {
        self.signal
    }

    pub fn wait_handle(&self) -> ExternalHandle {
        self.wait_handle
    }

    pub fn signal_handle(&self) -> ExternalHandle {
        self.signal_handle
    }

    /// Called by the importing side once it has waited on `wait`.
    pub fn mark_imported(&self) {
        self.state.lock().imported = true;
    }

    pub fn state(&self) -> SyncState {
        *self.state.lock()
    }

    /// Both semaphores have been consumed.
    pub fn is_consumed(&self) -> bool {
        let state = self.state.lock();
        state.imported && state.consumed_by.is_some()
    }

    pub(crate) fn arm(&self, command: CommandId) {
        self.state.lock().exported_by = Some(command);
    }

    pub(crate) fn consume_signal(&self, command: CommandId) {
        self.state.lock().consumed_by = Some(command);
    }

    pub(crate) fn snapshot(&self) -> SyncState {
        *self.state.lock()
    }

    pub(crate) fn restore(&self, state: SyncState) {
        *self.state.lock() = state;
    }
}

impl Drop for SyncObject {
    fn drop(&mut self) {
        let state = *self.state.get_mut();
        if state.exported_by.is_some() && !(state.imported && state.consumed_by.is_some()) {
            log::error!(
                "sync object dropped before both sides consumed it (imported: {}, consumed by: {:?})",
                state.imported,
                state.consumed_by
            );
        }
        let after = state.exported_by.max(state.consumed_by);
        self.deferred
            .queue(DeferredResource::Semaphore(self.wait), after);
        self.deferred
            .queue(DeferredResource::Semaphore(self.signal), after);
    }
}

impl std::fmt::Debug for SyncObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncObject")
            .field("wait", &self.wait)
            .field("signal", &self.signal)
            .field("state", &*self.state.lock())
            .finish()
    }
}

static_assertions::assert_impl_all!(SyncObject: Send, Sync);
