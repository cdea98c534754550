//! Command queue multiplexer.
//!
//! Owns the single "currently recording" command. Callers ask for a queue
//! type; if the recording command belongs to another queue family it is
//! closed and submitted first, so at most one command is open at any time.
//!
//! Submitted commands are tracked until [`CommandMultiplexer::poll`] observes
//! their completion, at which point the signals they consumed return to the
//! pool and timer results are delivered.
//!
//! The release half of an ownership transfer travels with the command that
//! acquires and is submitted just before it, so the two halves reach the GPU
//! together or not at all.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use ash::vk;
use parking_lot::{Mutex, MutexGuard};

use super::{Checkpoint, Command, CommandId, Handoff, HandoffTarget, RecordedOp, Timer};
use crate::driver::{Driver, Submission, SubmissionToken};
use crate::error::{GpuError, GpuResult};
use crate::hazard::PipelineBarrier;
use crate::sync::{GuardSignal, SignalId, SignalPool};
use crate::types::{QueueFamilies, QueueType};

/// A submitted command waiting for completion.
struct InFlight {
    id: CommandId,
    token: SubmissionToken,
    consumed: Vec<GuardSignal>,
    unsignaled: Vec<SignalId>,
    timer: Option<Arc<Timer>>,
}

#[derive(Default)]
struct CompletionTracker {
    /// Commands created but not yet known to be complete.
    outstanding: BTreeSet<CommandId>,
    in_flight: VecDeque<InFlight>,
}

/// Multiplexes callers onto one recording command per queue family.
pub struct CommandMultiplexer {
    driver: Arc<dyn Driver>,
    families: QueueFamilies,
    next_id: AtomicU64,
    slot: Mutex<Option<Command>>,
    /// Thread currently holding `slot`, for reentrancy detection.
    owner: Mutex<Option<ThreadId>>,
    signals: Mutex<SignalPool>,
    tracker: Mutex<CompletionTracker>,
    lost: AtomicBool,
}

/// Exclusive access to the recording command.
///
/// Holding a `Recording` is the proof required to mutate resource state.
/// Dropping it leaves the command open for the next caller; use
/// [`CommandMultiplexer::end`] to submit.
pub struct Recording<'a> {
    mux: &'a CommandMultiplexer,
    slot: MutexGuard<'a, Option<Command>>,
}

impl<'a> Recording<'a> {
    pub fn command(&self) -> GpuResult<&Command> {
        self.slot
            .as_ref()
            .ok_or_else(|| GpuError::Internal("no command is recording".into()))
    }

    pub fn command_mut(&mut self) -> GpuResult<&mut Command> {
        self.slot
            .as_mut()
            .ok_or_else(|| GpuError::Internal("no command is recording".into()))
    }

    pub(crate) fn multiplexer(&self) -> &'a CommandMultiplexer {
        self.mux
    }
}

impl Drop for Recording<'_> {
    fn drop(&mut self) {
        *self.mux.owner.lock() = None;
    }
}

impl std::fmt::Debug for Recording<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recording")
            .field("command", &*self.slot)
            .finish()
    }
}

impl CommandMultiplexer {
    pub fn new(driver: Arc<dyn Driver>, max_signals: Option<usize>) -> Self {
        let families = driver.queue_families();
        Self {
            driver,
            families,
            next_id: AtomicU64::new(1),
            slot: Mutex::new(None),
            owner: Mutex::new(None),
            signals: Mutex::new(SignalPool::new(max_signals)),
            tracker: Mutex::new(CompletionTracker::default()),
            lost: AtomicBool::new(false),
        }
    }

    pub fn families(&self) -> QueueFamilies {
        self.families
    }

    pub(crate) fn driver(&self) -> &dyn Driver {
        self.driver.as_ref()
    }

    pub(crate) fn signals(&self) -> MutexGuard<'_, SignalPool> {
        self.signals.lock()
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    pub(crate) fn check_alive(&self) -> GpuResult<()> {
        if self.is_lost() {
            Err(GpuError::DeviceLost)
        } else {
            Ok(())
        }
    }

    fn note_error(&self, err: &GpuError) {
        if err.is_fatal() && !self.lost.swap(true, Ordering::AcqRel) {
            log::error!("GPU device lost; all further operations will fail");
            crate::profile_message!("GPU device lost");
        }
    }

    /// Queue type used for commands on `family`.
    pub(crate) fn queue_of(&self, family: u32) -> QueueType {
        if family == self.families.graphics {
            QueueType::Graphics
        } else if family == self.families.compute {
            QueueType::Compute
        } else if family == self.families.transfer {
            QueueType::Transfer
        } else {
            QueueType::Graphics
        }
    }

    fn new_command(&self, queue: QueueType, family: u32, label: &str) -> Command {
        let id = CommandId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.tracker.lock().outstanding.insert(id);
        log::trace!("opening {id} '{label}' on {queue:?} (family {family})");
        Command::new(id, queue, family, label)
    }

    fn lock(&self, queue: QueueType) -> GpuResult<Recording<'_>> {
        let me = thread::current().id();
        if *self.owner.lock() == Some(me) {
            log::warn!("reentrant begin on {queue:?} rejected");
            return Err(GpuError::ReentrantRecording { queue });
        }
        let slot = self.slot.lock();
        *self.owner.lock() = Some(me);
        Ok(Recording { mux: self, slot })
    }

    /// Get the recording command for `queue`, opening one if needed.
    ///
    /// If the open command belongs to a different queue family, or carries a
    /// different timer, it is submitted first.
    pub fn begin(
        &self,
        queue: QueueType,
        label: &str,
        timer: Option<&Arc<Timer>>,
    ) -> GpuResult<Recording<'_>> {
        self.check_alive()?;
        let mut rec = self.lock(queue)?;

        let (queue, family) = match (queue, rec.slot.as_ref()) {
            (QueueType::Any, Some(cmd)) => (cmd.queue, cmd.family),
            (QueueType::Any, None) => (QueueType::Graphics, self.families.graphics),
            (queue, _) => (queue, self.families.family_of(queue)),
        };

        let must_close = rec.slot.as_ref().is_some_and(|cmd| {
            let timer_conflict = match (&cmd.timer, timer) {
                (Some(current), Some(requested)) => !Arc::ptr_eq(current, requested),
                _ => false,
            };
            cmd.family != family || timer_conflict
        });
        if must_close {
            if let Some(previous) = rec.slot.take() {
                log::debug!(
                    "closing {} on family {} for '{label}' on family {family}",
                    previous.id,
                    previous.family
                );
                self.submit(previous)?;
            }
        }

        let cmd = rec
            .slot
            .get_or_insert_with(|| self.new_command(queue, family, label));
        if let Some(timer) = timer {
            if cmd.timer.is_none() {
                cmd.timer = Some(Arc::clone(timer));
            }
        }
        Ok(rec)
    }

    /// Finish a caller's use of the recording command.
    ///
    /// With `submit == false` the command stays open so later operations on
    /// the same family batch into it.
    pub fn end(&self, mut rec: Recording<'_>, submit: bool) -> GpuResult<()> {
        if submit {
            if let Some(cmd) = rec.slot.take() {
                return self.submit(cmd);
            }
        }
        Ok(())
    }

    /// Drop the recording command without submitting it, restoring the
    /// state of every resource it touched.
    pub fn discard(&self, mut rec: Recording<'_>) {
        if let Some(cmd) = rec.slot.take() {
            log::debug!("discarding {} '{}' ({} ops)", cmd.id, cmd.label, cmd.ops.len());
            self.rollback(cmd);
        }
    }

    /// Submit the recording command, if any.
    pub fn flush(&self) -> GpuResult<()> {
        let mut rec = self.lock(QueueType::Any)?;
        match rec.slot.take() {
            Some(cmd) => self.submit(cmd),
            None => Ok(()),
        }
    }

    /// Submit the recording command if it is `id`.
    pub(crate) fn flush_command(&self, id: CommandId) -> GpuResult<()> {
        let mut rec = self.lock(QueueType::Any)?;
        if rec.slot.as_ref().is_some_and(|cmd| cmd.id == id) {
            if let Some(cmd) = rec.slot.take() {
                return self.submit(cmd);
            }
        }
        Ok(())
    }

    /// Id of the recording command.
    pub fn recording_id(&self) -> GpuResult<Option<CommandId>> {
        let rec = self.lock(QueueType::Any)?;
        Ok(rec.slot.as_ref().map(|cmd| cmd.id))
    }

    /// Run `amend` on the recording command, if any, while holding the slot.
    ///
    /// Resource state changes made outside a device operation go through
    /// here so they cannot interleave with a recording caller.
    pub(crate) fn with_recording<R>(
        &self,
        amend: impl FnOnce(Option<&mut Command>) -> R,
    ) -> GpuResult<R> {
        let mut rec = self.lock(QueueType::Any)?;
        Ok(amend(rec.slot.as_mut()))
    }

    /// Undo everything recorded since `checkpoint`. The command is dropped
    /// if nothing is left in it.
    pub(crate) fn rewind(&self, rec: &mut Recording<'_>, checkpoint: Checkpoint) {
        let Some(cmd) = rec.slot.as_mut() else {
            return;
        };
        log::trace!(
            "rewinding {} to {} ops ({} recorded since)",
            cmd.id,
            checkpoint.ops,
            cmd.ops.len().saturating_sub(checkpoint.ops)
        );
        cmd.ops.truncate(checkpoint.ops);
        cmd.waits = checkpoint.waits;
        cmd.external_signals.truncate(checkpoint.external_signals);
        let consumed = cmd.consumed.split_off(checkpoint.consumed.min(cmd.consumed.len()));
        let handoffs = cmd.handoffs.split_off(checkpoint.handoffs.min(cmd.handoffs.len()));
        let fresh: Vec<SignalId> = cmd
            .signals
            .iter()
            .chain(&cmd.unsignaled)
            .copied()
            .filter(|id| !checkpoint.signals.contains(id) && !checkpoint.unsignaled.contains(id))
            .collect();
        cmd.signals = checkpoint.signals;
        cmd.unsignaled = checkpoint.unsignaled;
        cmd.journal.restore_since(checkpoint.journal);
        {
            let mut pool = self.signals.lock();
            pool.rearm(&consumed);
            pool.release(fresh);
        }
        // Releases after the command, so their handoff signals are rearmed
        // before being freed.
        for handoff in handoffs {
            self.rollback(handoff.release);
        }

        if rec.slot.as_ref().is_some_and(Command::is_empty) {
            if let Some(cmd) = rec.slot.take() {
                self.rollback(cmd);
            }
        }
    }

    /// Record a one-shot command on `family` without submitting it.
    pub(crate) fn prepare_side<T>(
        &self,
        family: u32,
        label: &str,
        record: impl FnOnce(&mut Command, &mut SignalPool) -> GpuResult<T>,
    ) -> GpuResult<(Command, T)> {
        self.check_alive()?;
        let mut cmd = self.new_command(self.queue_of(family), family, label);
        let result = {
            let mut pool = self.signals.lock();
            record(&mut cmd, &mut pool)
        };
        match result {
            Ok(value) => Ok((cmd, value)),
            Err(err) => {
                self.rollback(cmd);
                Err(err)
            }
        }
    }

    /// Record and immediately submit a one-shot command on `family`.
    ///
    /// Used for draining external dependencies and for finishing ownership
    /// transfers; never touches the recording slot.
    pub(crate) fn submit_side<T>(
        &self,
        family: u32,
        label: &str,
        record: impl FnOnce(&mut Command, &mut SignalPool) -> GpuResult<T>,
    ) -> GpuResult<T> {
        let (cmd, value) = self.prepare_side(family, label, record)?;
        self.submit(cmd)?;
        Ok(value)
    }

    /// Submit `cmd`, preceded by the release halves of its handoffs.
    fn submit(&self, mut cmd: Command) -> GpuResult<()> {
        crate::profile_scope!("submit");
        if let Err(err) = self.check_alive() {
            self.rollback(cmd);
            return Err(err);
        }

        let mut pending = std::mem::take(&mut cmd.handoffs).into_iter();
        let mut released = Vec::new();
        while let Some(Handoff {
            release,
            signal,
            target,
            acquire,
        }) = pending.next()
        {
            match self.submit_one(&release) {
                Ok(token) => self.track(release, token),
                Err(err) => {
                    cmd.handoffs = pending.collect();
                    let family = cmd.family;
                    self.rollback(cmd);
                    self.rollback(release);
                    self.finish_transfers(family, released);
                    return Err(err);
                }
            }
            released.push((signal, target, acquire));
        }

        match self.submit_one(&cmd) {
            Ok(token) => {
                self.track(cmd, token);
                Ok(())
            }
            Err(err) => {
                let family = cmd.family;
                self.rollback(cmd);
                self.finish_transfers(family, released);
                Err(err)
            }
        }
    }

    fn submit_one(&self, cmd: &Command) -> GpuResult<SubmissionToken> {
        let semaphores: Vec<vk::Semaphore> = {
            let pool = self.signals.lock();
            cmd.signals
                .iter()
                .map(|id| pool.semaphore(*id))
                .chain(cmd.external_signals.iter().copied())
                .collect()
        };
        let submission = Submission {
            id: cmd.id,
            family: cmd.family,
            label: &cmd.label,
            ops: &cmd.ops,
            waits: &cmd.waits,
            signals: &semaphores,
            timed: cmd.timer.is_some(),
        };

        self.driver
            .submit(&submission)
            .inspect(|_| {
                log::debug!(
                    "submitted {} '{}' on family {}: {} ops, {} waits, {} signals",
                    cmd.id,
                    cmd.label,
                    cmd.family,
                    cmd.ops.len(),
                    cmd.waits.len(),
                    semaphores.len()
                );
            })
            .inspect_err(|err| {
                log::error!("submission of {} '{}' failed: {err}", cmd.id, cmd.label);
                self.note_error(err);
            })
    }

    fn track(&self, cmd: Command, token: SubmissionToken) {
        self.tracker.lock().in_flight.push_back(InFlight {
            id: cmd.id,
            token,
            consumed: cmd.consumed,
            unsignaled: cmd.unsignaled,
            timer: cmd.timer,
        });
    }

    /// Acquire on `family` the resources whose release already reached the
    /// GPU while the command meant to acquire them did not.
    fn finish_transfers(
        &self,
        family: u32,
        released: Vec<(GuardSignal, HandoffTarget, PipelineBarrier)>,
    ) {
        for (signal, target, acquire) in released {
            if !target.is_alive() {
                self.signals.lock().retire_stale(self.driver(), signal);
                continue;
            }
            let result = self.submit_side(family, "queue acquire", |side, pool| {
                pool.wait(side, signal, acquire.dst_stage);
                side.record(RecordedOp::Barrier(PipelineBarrier {
                    src_stage: acquire.dst_stage,
                    ..acquire
                }));
                let guard =
                    pool.acquire(self.driver(), side, vk::PipelineStageFlags::ALL_COMMANDS)?;
                Ok((side.id, guard))
            });
            match result {
                Ok((id, guard)) => target.complete(family, id, guard, &acquire),
                Err(err) => {
                    log::error!("could not finish ownership transfer to family {family}: {err}");
                }
            }
        }
    }

    /// Undo everything a command that never reached the GPU did.
    fn rollback(&self, cmd: Command) {
        let Command {
            id,
            journal,
            signals,
            consumed,
            unsignaled,
            handoffs,
            ..
        } = cmd;
        log::trace!("rolling back {id} ({} journalled states)", journal.len());
        journal.restore();
        {
            let mut pool = self.signals.lock();
            pool.rearm(&consumed);
            pool.release(signals.into_iter().chain(unsignaled));
        }
        self.tracker.lock().outstanding.remove(&id);
        for handoff in handoffs {
            self.rollback(handoff.release);
        }
    }

    /// Returns true once `id` has completed or was discarded.
    pub fn is_complete(&self, id: CommandId) -> bool {
        !self.tracker.lock().outstanding.contains(&id)
    }

    /// Number of submitted commands not yet retired.
    pub fn in_flight_count(&self) -> usize {
        self.tracker.lock().in_flight.len()
    }

    /// Retire completed commands, blocking up to `timeout` if none are done.
    /// Returns the number of retired commands.
    pub fn poll(&self, timeout: Duration) -> GpuResult<usize> {
        crate::profile_function!();
        let deadline = Instant::now() + timeout;
        loop {
            let tokens: Vec<SubmissionToken> =
                self.tracker.lock().in_flight.iter().map(|f| f.token).collect();
            let Some(&oldest) = tokens.first() else {
                return Ok(0);
            };

            let mut done = Vec::new();
            for token in tokens {
                if self.wait_token(token, Duration::ZERO)? {
                    done.push(token);
                }
            }
            if !done.is_empty() {
                return Ok(self.retire(&done));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(0);
            }
            self.wait_token(oldest, deadline - now)?;
        }
    }

    fn wait_token(&self, token: SubmissionToken, timeout: Duration) -> GpuResult<bool> {
        self.driver.wait(token, timeout).inspect_err(|err| {
            self.note_error(err);
        })
    }

    fn retire(&self, tokens: &[SubmissionToken]) -> usize {
        let finished: Vec<InFlight> = {
            let mut tracker = self.tracker.lock();
            let (done, pending): (VecDeque<_>, VecDeque<_>) = tracker
                .in_flight
                .drain(..)
                .partition(|f| tokens.contains(&f.token));
            tracker.in_flight = pending;
            crate::profile_plot!("gpu_in_flight", tracker.in_flight.len());
            for f in &done {
                tracker.outstanding.remove(&f.id);
            }
            done.into()
        };

        let mut pool = self.signals.lock();
        for f in &finished {
            log::trace!("retired {}", f.id);
            if let Some(elapsed) = self.driver.finish(f.token) {
                if let Some(timer) = &f.timer {
                    timer.push(elapsed);
                }
            }
            pool.release(
                f.consumed
                    .iter()
                    .map(|guard| guard.id)
                    .chain(f.unsignaled.iter().copied()),
            );
        }
        finished.len()
    }

    /// Poll until nothing is in flight or `timeout` expires. Returns whether
    /// the queues went idle.
    pub fn wait_idle(&self, timeout: Duration) -> GpuResult<bool> {
        let deadline = Instant::now() + timeout;
        while self.in_flight_count() > 0 {
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            self.poll(deadline - now)?;
        }
        Ok(true)
    }

    /// Free signals.
    pub fn free_signals(&self) -> usize {
        self.signals.lock().free_count()
    }

    /// Signals attached to unfinished work or guarding a resource.
    pub fn armed_signals(&self) -> usize {
        self.signals.lock().armed_count()
    }
}

impl std::fmt::Debug for CommandMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandMultiplexer")
            .field("driver", &self.driver.name())
            .field("families", &self.families)
            .field("in_flight", &self.in_flight_count())
            .field("lost", &self.is_lost())
            .finish()
    }
}

static_assertions::assert_impl_all!(CommandMultiplexer: Send, Sync);
