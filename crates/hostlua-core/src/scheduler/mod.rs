//! Cooperative task scheduler
//!
//! Script threads are VM coroutines. The scheduler keeps three pending queues per execution
//! domain (defer, delay, wait) and drains them once per host tick in [`Scheduler::frame_step`].
//! Draining is single-pass: anything queued while a step runs becomes eligible on the next
//! step, so a thread that keeps re-queuing itself cannot starve the others.
//!
//! The synchronized domain is only stepped from the state's primary driver OS thread; the
//! desynchronized domain may be stepped from any caller.

mod identity;
pub(crate) mod library;
mod queue;
mod thread;

pub use identity::{SecurityContext, ThreadIdentity};
pub use thread::ScriptThread;

use crate::error::{SchedulerError, Unwind, VmResult};
use crate::options::SchedulerOptions;
use crate::value::{Kind, OwnedValue, Value};
use crate::vm::{Resumed, StateInner, ThreadStatus, VmState};
use parking_lot::Mutex;
use queue::{DomainQueues, Queue, QueueEntry, QueueKind, Ready};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Weak;

/// Scheduling partition of a script thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Domain {
    /// Serialized with the primary host tick
    Synchronized,
    /// May be stepped from any OS thread
    Desynchronized,
}

impl Domain {
    pub const ALL: [Domain; 2] = [Domain::Synchronized, Domain::Desynchronized];

    pub(crate) fn index(self) -> usize {
        match self {
            Domain::Synchronized => 0,
            Domain::Desynchronized => 1,
        }
    }
}

/// Counts from one [`Scheduler::frame_step`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepReport {
    /// Threads resumed
    pub resumed: usize,
    /// Threads whose body returned
    pub completed: usize,
    /// Threads that raised an uncaught error
    pub errored: usize,
}

impl StepReport {
    fn absorb(&mut self, other: StepReport) {
        self.resumed += other.resumed;
        self.completed += other.completed;
        self.errored += other.errored;
    }
}

/// Number of queued entries per queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    pub deferred: usize,
    pub delayed: usize,
    pub waiting: usize,
}

impl PendingCounts {
    pub fn total(&self) -> usize {
        self.deferred + self.delayed + self.waiting
    }
}

pub struct Scheduler {
    state: Weak<StateInner>,
    options: SchedulerOptions,
    /// Seconds advanced through `frame_step`
    clock: Mutex<f64>,
    /// Steps started so far
    step: AtomicU64,
    /// Next enqueue sequence number
    sequence: AtomicU64,
    queues: [DomainQueues; 2],
}

fn check_duration(duration: f64) -> Result<f64, SchedulerError> {
    if duration.is_finite() && duration >= 0.0 {
        Ok(duration)
    } else {
        Err(SchedulerError::InvalidDuration(duration))
    }
}

impl Scheduler {
    pub(crate) fn new(state: Weak<StateInner>, options: SchedulerOptions) -> Self {
        Self {
            state,
            options,
            clock: Mutex::new(0.0),
            step: AtomicU64::new(0),
            sequence: AtomicU64::new(0),
            queues: Default::default(),
        }
    }

    fn state(&self) -> Result<VmState, SchedulerError> {
        self.state
            .upgrade()
            .map(VmState::from_inner)
            .ok_or(SchedulerError::StateClosed)
    }

    /// Scheduler time in seconds
    pub fn clock(&self) -> f64 {
        *self.clock.lock()
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    // ========================================================================
    // Thread resolution
    // ========================================================================

    fn check_thread(&self, state: &VmState, thread: &ScriptThread) -> Result<(), SchedulerError> {
        if thread.is_main() {
            return Err(SchedulerError::MainThread);
        }
        if !thread.vm().belongs_to(state) {
            return Err(SchedulerError::ForeignThread);
        }
        Ok(())
    }

    /// The thread to schedule for `target`: the thread itself, or a new coroutine running a
    /// function
    fn thread_for(
        &self,
        state: &VmState,
        target: &Value<'_>,
        domain: Option<Domain>,
    ) -> Result<ScriptThread, SchedulerError> {
        let thread = if let Some(thread) = target.as_thread() {
            self.check_thread(state, &thread)?;
            thread
        } else if target.is_kind(Kind::Function) {
            ScriptThread::attach(state.new_thread_with(target)?)
        } else {
            return Err(SchedulerError::NotRunnable(target.kind().name()));
        };
        if let Some(domain) = domain {
            thread.set_domain(domain);
        }
        Ok(thread)
    }

    // ========================================================================
    // Queues
    // ========================================================================

    fn queue(&self, domain: Domain, kind: QueueKind) -> &Queue {
        self.queues[domain.index()].get(kind)
    }

    /// Drop `thread` from every queue
    fn dequeue(&self, thread: &ScriptThread) {
        for domain in Domain::ALL {
            for kind in QueueKind::ALL {
                self.queue(domain, kind).remove(thread);
            }
        }
    }

    fn enqueue(
        &self,
        thread: &ScriptThread,
        kind: QueueKind,
        duration: f64,
        report_elapsed: bool,
        args: Vec<OwnedValue>,
    ) {
        self.dequeue(thread);
        let now = self.clock();
        let entry = QueueEntry {
            seq: self.sequence.fetch_add(1, AtomicOrdering::Relaxed),
            step: self.step.load(AtomicOrdering::Acquire),
            wake: now + duration,
            start: now,
            report_elapsed,
            args,
        };
        let domain = thread.domain();
        tracing::debug!(
            thread = thread.id(),
            queue = ?kind,
            domain = ?domain,
            wake = entry.wake,
            "thread queued"
        );
        self.queue(domain, kind).insert(thread, entry);
    }

    /// Whether `thread` sits in any queue
    pub fn is_queued(&self, thread: &ScriptThread) -> bool {
        Domain::ALL.iter().any(|&domain| {
            QueueKind::ALL
                .iter()
                .any(|&kind| self.queue(domain, kind).contains(thread))
        })
    }

    pub fn pending(&self, domain: Domain) -> PendingCounts {
        PendingCounts {
            deferred: self.queue(domain, QueueKind::Defer).len(),
            delayed: self.queue(domain, QueueKind::Delay).len(),
            waiting: self.queue(domain, QueueKind::Wait).len(),
        }
    }

    // ========================================================================
    // Scheduling operations
    // ========================================================================

    /// Resume `target` right away on the caller's stack
    ///
    /// `target` is a function (run in a new coroutine) or an existing thread. `domain` moves
    /// the thread before it runs; `None` keeps its current domain.
    pub fn spawn(
        &self,
        target: &Value<'_>,
        args: Vec<OwnedValue>,
        domain: Option<Domain>,
    ) -> Result<ScriptThread, SchedulerError> {
        let state = self.state()?;
        let thread = self.thread_for(&state, target, domain)?;
        self.dequeue(&thread);
        let mut report = StepReport::default();
        self.run(&state, &thread, args, &mut report);
        Ok(thread)
    }

    /// Queue `target` to resume on the next step
    pub fn defer(
        &self,
        target: &Value<'_>,
        args: Vec<OwnedValue>,
        domain: Option<Domain>,
    ) -> Result<ScriptThread, SchedulerError> {
        let state = self.state()?;
        let thread = self.thread_for(&state, target, domain)?;
        self.enqueue(&thread, QueueKind::Defer, 0.0, false, args);
        Ok(thread)
    }

    /// Queue `target` to resume once `duration` seconds have elapsed
    pub fn delay(
        &self,
        duration: f64,
        target: &Value<'_>,
        args: Vec<OwnedValue>,
        domain: Option<Domain>,
    ) -> Result<ScriptThread, SchedulerError> {
        let duration = check_duration(duration)?;
        let state = self.state()?;
        let thread = self.thread_for(&state, target, domain)?;
        self.enqueue(&thread, QueueKind::Delay, duration, false, args);
        Ok(thread)
    }

    /// Queue `thread` on the wait queue; it is resumed with no arguments
    ///
    /// `None` resumes it on the next step. The thread is expected to yield right after.
    pub fn wait(&self, thread: &ScriptThread, duration: Option<f64>) -> Result<(), SchedulerError> {
        self.wait_with(thread, duration, false)
    }

    pub(crate) fn wait_with(
        &self,
        thread: &ScriptThread,
        duration: Option<f64>,
        report_elapsed: bool,
    ) -> Result<(), SchedulerError> {
        let duration = check_duration(duration.unwrap_or(0.0))?;
        let state = self.state()?;
        self.check_thread(&state, thread)?;
        self.enqueue(thread, QueueKind::Wait, duration, report_elapsed, Vec::new());
        Ok(())
    }

    /// Remove `thread` from every queue and close it
    ///
    /// A running thread is only marked; it closes at its next suspension.
    pub fn cancel(&self, thread: &ScriptThread) -> Result<(), SchedulerError> {
        let state = self.state()?;
        self.check_thread(&state, thread)?;
        self.dequeue(thread);
        if thread.vm().close() {
            tracing::debug!(thread = thread.id(), "thread cancelled");
        } else if thread.status() == ThreadStatus::Running {
            tracing::warn!(
                thread = thread.id(),
                "cancel requested on a running thread; it closes at its next suspension"
            );
        }
        Ok(())
    }

    /// Move `thread` into `domain` and queue it there on the defer queue
    pub fn switch_domain(&self, thread: &ScriptThread, domain: Domain) -> Result<(), SchedulerError> {
        let state = self.state()?;
        self.check_thread(&state, thread)?;
        thread.set_domain(domain);
        self.enqueue(thread, QueueKind::Defer, 0.0, false, Vec::new());
        Ok(())
    }

    pub fn synchronize(&self, thread: &ScriptThread) -> Result<(), SchedulerError> {
        self.switch_domain(thread, Domain::Synchronized)
    }

    pub fn desynchronize(&self, thread: &ScriptThread) -> Result<(), SchedulerError> {
        self.switch_domain(thread, Domain::Desynchronized)
    }

    // ========================================================================
    // Driving
    // ========================================================================

    /// Advance the scheduler by one host tick of `delta` seconds
    ///
    /// Drains the defer queues, advances the clock, then resumes every timed entry whose wake
    /// time has passed in (wake time, enqueue order). Only entries queued before this call are
    /// eligible. From a thread other than the primary driver only the desynchronized domain is
    /// stepped.
    pub fn frame_step(&self, delta: f64) -> Result<StepReport, SchedulerError> {
        let delta = check_duration(delta)?;
        let state = self.state()?;
        let step = self.step.fetch_add(1, AtomicOrdering::AcqRel) + 1;
        let domains: &[Domain] = if state.is_primary_driver() {
            &Domain::ALL
        } else {
            &[Domain::Desynchronized]
        };
        let mut budget = self.options.max_resumes_per_step.unwrap_or(usize::MAX);
        let mut report = StepReport::default();

        for &domain in domains {
            let queue = self.queue(domain, QueueKind::Defer);
            for ready in queue.snapshot(step) {
                self.resume_entry(&state, queue, ready, 0.0, &mut budget, &mut report);
            }
        }

        let now = {
            let mut clock = self.clock.lock();
            *clock += delta;
            *clock
        };

        let mut timed = Vec::new();
        for &domain in domains {
            for kind in QueueKind::TIMED {
                let queue = self.queue(domain, kind);
                timed.extend(
                    queue
                        .snapshot(step)
                        .into_iter()
                        .filter(|ready| ready.wake <= now)
                        .map(|ready| (queue, ready)),
                );
            }
        }
        timed.sort_by(|(_, a), (_, b)| {
            a.wake
                .partial_cmp(&b.wake)
                .unwrap_or(Ordering::Equal)
                .then(a.seq.cmp(&b.seq))
        });
        for (queue, ready) in timed {
            self.resume_entry(&state, queue, ready, now, &mut budget, &mut report);
        }

        if report.resumed > 0 {
            tracing::debug!(
                step,
                clock = now,
                resumed = report.resumed,
                completed = report.completed,
                errored = report.errored,
                "scheduler step"
            );
        }
        Ok(report)
    }

    fn resume_entry(
        &self,
        state: &VmState,
        queue: &Queue,
        ready: Ready,
        now: f64,
        budget: &mut usize,
        report: &mut StepReport,
    ) {
        if *budget == 0 {
            return;
        }
        let Some(pending) = queue.take_if(ready.key, ready.seq) else {
            return;
        };
        let (thread, entry) = (pending.thread, pending.entry);
        *budget -= 1;
        let args = if entry.report_elapsed {
            vec![Value::Number(now - entry.start)]
        } else {
            entry.args
        };
        let mut resumed = StepReport::default();
        self.run(state, &thread, args, &mut resumed);
        report.absorb(resumed);
    }

    /// Resume `thread` once and record the outcome
    fn run(
        &self,
        state: &VmState,
        thread: &ScriptThread,
        args: Vec<OwnedValue>,
        report: &mut StepReport,
    ) {
        let status = thread.status();
        if status.is_finished() {
            tracing::debug!(thread = thread.id(), ?status, "skipping finished thread");
            return;
        }
        let raw = match args
            .iter()
            .map(|arg| arg.to_raw(state))
            .collect::<VmResult<Vec<_>>>()
        {
            Ok(raw) => raw,
            Err(err) => {
                tracing::error!(thread = thread.id(), error = %err, "failed to pass resume arguments");
                report.errored += 1;
                return;
            }
        };

        report.resumed += 1;
        match thread.vm().resume(state, raw) {
            Ok(Resumed::Yielded(_)) => {}
            Ok(Resumed::Returned(_)) => report.completed += 1,
            Ok(Resumed::Cancelled) => {
                tracing::debug!(thread = thread.id(), "thread terminated");
            }
            Err(Unwind::OutOfMemory) => {
                tracing::error!(thread = thread.id(), "thread ran out of memory");
                report.errored += 1;
            }
            Err(error) => {
                tracing::error!(thread = thread.id(), error = %error, "uncaught script error");
                report.errored += 1;
            }
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("clock", &self.clock())
            .field("step", &self.step.load(AtomicOrdering::Relaxed))
            .field("synchronized", &self.pending(Domain::Synchronized))
            .field("desynchronized", &self.pending(Domain::Desynchronized))
            .finish()
    }
}
