//! Rollback journal for optimistic state tracking.
//!
//! Resource state is updated when an operation is recorded, before the GPU
//! runs it. If the command never reaches the GPU (failed submission or
//! discard), the journal puts every touched resource back to the state it
//! had before the command first touched it.
//!
//! A [`mark`](StateJournal::mark) opens a new segment: resources are
//! journalled again on their first touch after it, so the work recorded
//! since the mark can be undone on its own.

use std::sync::{Arc, Weak};

use crate::hazard::{BufferState, TextureState};
use crate::resources::{Buffer, Texture};
use crate::sync::{SyncObject, SyncState};

enum JournalEntry {
    Texture(Weak<Texture>, TextureState),
    Buffer(Weak<Buffer>, BufferState),
    Sync(Weak<SyncObject>, SyncState),
}

impl JournalEntry {
    fn is_texture(&self, texture: &Arc<Texture>) -> bool {
        matches!(self, Self::Texture(weak, _) if std::ptr::eq(weak.as_ptr(), Arc::as_ptr(texture)))
    }

    fn is_buffer(&self, buffer: &Arc<Buffer>) -> bool {
        matches!(self, Self::Buffer(weak, _) if std::ptr::eq(weak.as_ptr(), Arc::as_ptr(buffer)))
    }

    fn is_sync(&self, sync: &Arc<SyncObject>) -> bool {
        matches!(self, Self::Sync(weak, _) if std::ptr::eq(weak.as_ptr(), Arc::as_ptr(sync)))
    }
}

#[derive(Default)]
pub(crate) struct StateJournal {
    entries: Vec<JournalEntry>,
    /// Start of the current segment.
    segment: usize,
}

impl StateJournal {
    fn current(&self) -> &[JournalEntry] {
        &self.entries[self.segment..]
    }

    /// Remember `state` unless the texture was already touched in the
    /// current segment.
    pub(crate) fn record_texture(&mut self, texture: &Arc<Texture>, state: &TextureState) {
        if !self.current().iter().any(|entry| entry.is_texture(texture)) {
            self.entries
                .push(JournalEntry::Texture(Arc::downgrade(texture), state.clone()));
        }
    }

    pub(crate) fn record_buffer(&mut self, buffer: &Arc<Buffer>, state: &BufferState) {
        if !self.current().iter().any(|entry| entry.is_buffer(buffer)) {
            self.entries
                .push(JournalEntry::Buffer(Arc::downgrade(buffer), state.clone()));
        }
    }

    pub(crate) fn record_sync(&mut self, sync: &Arc<SyncObject>) {
        if !self.current().iter().any(|entry| entry.is_sync(sync)) {
            self.entries
                .push(JournalEntry::Sync(Arc::downgrade(sync), sync.snapshot()));
        }
    }

    /// Apply a change made outside the command to every journalled state of
    /// `texture`, so a rollback keeps it.
    pub(crate) fn amend_texture(
        &mut self,
        texture: &Arc<Texture>,
        amend: impl Fn(&mut TextureState),
    ) {
        for entry in &mut self.entries {
            if let JournalEntry::Texture(weak, state) = entry
                && std::ptr::eq(weak.as_ptr(), Arc::as_ptr(texture))
            {
                amend(state);
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Open a new segment and return its position.
    pub(crate) fn mark(&mut self) -> usize {
        self.segment = self.entries.len();
        self.segment
    }

    /// Restore the states journalled since `mark`, newest first.
    pub(crate) fn restore_since(&mut self, mark: usize) {
        let mark = mark.min(self.entries.len());
        let undone = self.entries.split_off(mark);
        self.segment = self.segment.min(mark);
        apply(undone);
    }

    /// Restore every journalled state, newest first.
    pub(crate) fn restore(self) {
        apply(self.entries);
    }
}

/// Older entries of a resource are applied last and win.
fn apply(entries: Vec<JournalEntry>) {
    for entry in entries.into_iter().rev() {
        match entry {
            JournalEntry::Texture(weak, state) => {
                if let Some(texture) = weak.upgrade() {
                    texture.restore_state(state);
                }
            }
            JournalEntry::Buffer(weak, state) => {
                if let Some(buffer) = weak.upgrade() {
                    buffer.restore_state(state);
                }
            }
            JournalEntry::Sync(weak, state) => {
                if let Some(sync) = weak.upgrade() {
                    sync.restore(state);
                }
            }
        }
    }
}
