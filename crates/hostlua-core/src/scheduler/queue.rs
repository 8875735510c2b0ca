//! Pending queue entries
//!
//! Each domain owns three queues (defer, delay, wait). A queue holds at most one entry per
//! thread, keyed by the address of its VM coroutine.

use super::ScriptThread;
use crate::rc::Shared;
use crate::value::OwnedValue;
use rustc_hash::FxHashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueKind {
    Defer,
    Delay,
    Wait,
}

impl QueueKind {
    pub(crate) const ALL: [QueueKind; 3] = [QueueKind::Defer, QueueKind::Delay, QueueKind::Wait];
    pub(crate) const TIMED: [QueueKind; 2] = [QueueKind::Delay, QueueKind::Wait];
}

#[derive(Default)]
pub(crate) struct DomainQueues {
    defer: Queue,
    delay: Queue,
    wait: Queue,
}

impl DomainQueues {
    pub(crate) fn get(&self, kind: QueueKind) -> &Queue {
        match kind {
            QueueKind::Defer => &self.defer,
            QueueKind::Delay => &self.delay,
            QueueKind::Wait => &self.wait,
        }
    }
}

/// One pending resumption
#[derive(Debug, Clone)]
pub(crate) struct QueueEntry {
    /// Enqueue order across every queue of the scheduler
    pub(crate) seq: u64,
    /// Step counter at enqueue time; the entry is eligible from the following step
    pub(crate) step: u64,
    /// Clock time at which the entry becomes eligible
    pub(crate) wake: f64,
    /// Clock time at enqueue
    pub(crate) start: f64,
    /// Resume with the elapsed time instead of `args`
    pub(crate) report_elapsed: bool,
    pub(crate) args: Vec<OwnedValue>,
}

/// A queued thread and its entry
pub(crate) struct Pending {
    pub(crate) thread: ScriptThread,
    pub(crate) entry: QueueEntry,
}

/// Location of an eligible entry, taken from [`Queue::snapshot`]
#[derive(Debug, Clone, Copy)]
pub(crate) struct Ready {
    pub(crate) key: usize,
    pub(crate) seq: u64,
    pub(crate) wake: f64,
}

pub(crate) struct Queue {
    entries: Shared<FxHashMap<usize, Pending>>,
}

impl Default for Queue {
    fn default() -> Self {
        Queue {
            entries: Shared::new(FxHashMap::default()),
        }
    }
}

fn key_of(thread: &ScriptThread) -> usize {
    thread.vm().addr()
}

impl Queue {
    /// Queue `thread`, replacing any entry it already had here
    pub(crate) fn insert(&self, thread: &ScriptThread, entry: QueueEntry) {
        let pending = Pending {
            thread: thread.clone(),
            entry,
        };
        let replaced = self.entries.write().insert(key_of(thread), pending);
        drop(replaced);
    }

    /// Drop the entry of `thread`; true if it had one
    pub(crate) fn remove(&self, thread: &ScriptThread) -> bool {
        let removed = self.entries.write().remove(&key_of(thread));
        removed.is_some()
    }

    pub(crate) fn contains(&self, thread: &ScriptThread) -> bool {
        self.entries.read().contains_key(&key_of(thread))
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Entries eligible at `step`, in enqueue order
    pub(crate) fn snapshot(&self, step: u64) -> Vec<Ready> {
        let mut ready: Vec<Ready> = self
            .entries
            .read()
            .iter()
            .filter(|(_, pending)| pending.entry.step < step)
            .map(|(&key, pending)| Ready {
                key,
                seq: pending.entry.seq,
                wake: pending.entry.wake,
            })
            .collect();
        ready.sort_by_key(|ready| ready.seq);
        ready
    }

    /// Remove the entry at `key` if it is still the one numbered `seq`
    ///
    /// A thread re-queued since the snapshot carries a newer sequence number and stays put.
    pub(crate) fn take_if(&self, key: usize, seq: u64) -> Option<Pending> {
        let mut entries = self.entries.write();
        match entries.get(&key) {
            Some(pending) if pending.entry.seq == seq => entries.remove(&key),
            _ => None,
        }
    }
}
