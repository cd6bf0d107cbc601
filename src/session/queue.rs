// Operation Queue - Single-flight FIFO of command keys
//
// Commands are stored per key; a key enters the FIFO once, when its first
// command arrives, and later commands for the same key join that entry and
// share its timer. At most one key is active at a time. Every entry carries a
// generation so an expiry aimed at an earlier incarnation of the key is ignored.

use crate::session::{Command, CommandKey, SubscriberId};
use std::collections::{HashMap, VecDeque};
use tokio::task::AbortHandle;
use tokio::time::Instant;

/// Commands waiting on (or executing under) one key
#[derive(Debug)]
pub struct QueueEntry {
    generation: u64,
    commands: Vec<Command>,
    timer: Option<AbortHandle>,
    enqueued_at: Instant,
}

impl QueueEntry {
    fn new(generation: u64, command: Command) -> Self {
        Self {
            generation,
            commands: vec![command],
            timer: None,
            enqueued_at: Instant::now(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// The command whose arguments are submitted to the adapter
    pub fn head(&self) -> Option<&Command> {
        self.commands.first()
    }

    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Outcome of [`OperationQueue::enqueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// First command for the key; its timer must be armed with this generation
    Queued { generation: u64 },
    /// Joined an entry that was already pending
    Joined,
}

#[derive(Debug, Default)]
pub struct OperationQueue {
    fifo: VecDeque<CommandKey>,
    entries: HashMap<CommandKey, QueueEntry>,
    active: Option<CommandKey>,
    next_generation: u64,
}

impl OperationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, command: Command) -> Enqueued {
        let key = command.key();
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.commands.push(command);
            return Enqueued::Joined;
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        self.entries.insert(key, QueueEntry::new(generation, command));
        self.fifo.push_back(key);
        Enqueued::Queued { generation }
    }

    /// Attach the timeout timer of a freshly queued key.
    /// Aborts the timer at once if the entry is already gone.
    pub fn arm(&mut self, key: &CommandKey, timer: AbortHandle) {
        match self.entries.get_mut(key) {
            Some(entry) => {
                if let Some(previous) = entry.timer.replace(timer) {
                    previous.abort();
                }
            }
            None => timer.abort(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.active.is_none()
    }

    pub fn active(&self) -> Option<&CommandKey> {
        self.active.as_ref()
    }

    pub fn contains(&self, key: &CommandKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn entry(&self, key: &CommandKey) -> Option<&QueueEntry> {
        self.entries.get(key)
    }

    /// Activate the next pending key, skipping keys whose entry was removed.
    /// Returns `None` while a key is active or when nothing is pending.
    pub fn next(&mut self) -> Option<CommandKey> {
        if self.active.is_some() {
            return None;
        }
        while let Some(key) = self.fifo.pop_front() {
            if self.entries.contains_key(&key) {
                self.active = Some(key);
                return Some(key);
            }
        }
        None
    }

    /// Take one subscriber's commands out of a pending entry.
    /// The entry stays queued even when it is left empty.
    pub fn withdraw(&mut self, key: &CommandKey, subscriber: &SubscriberId) -> Vec<Command> {
        let Some(entry) = self.entries.get_mut(key) else {
            return Vec::new();
        };
        let (withdrawn, kept) = entry
            .commands
            .drain(..)
            .partition(|c| &c.subscriber().id() == subscriber);
        entry.commands = kept;
        withdrawn
    }

    /// Remove a finished entry and cancel its timer
    pub fn complete(&mut self, key: &CommandKey) -> Option<QueueEntry> {
        let mut entry = self.entries.remove(key)?;
        entry.cancel_timer();
        if self.active.as_ref() == Some(key) {
            self.active = None;
        } else {
            self.fifo.retain(|k| k != key);
        }
        Some(entry)
    }

    /// Remove an entry whose timer fired.
    ///
    /// Nothing happens unless the entry still exists with the same generation.
    /// The flag reports whether the expired key was the active one.
    pub fn expire(&mut self, key: &CommandKey, generation: u64) -> Option<(QueueEntry, bool)> {
        if self.entries.get(key)?.generation != generation {
            return None;
        }
        let was_active = self.active.as_ref() == Some(key);
        let entry = self.complete(key)?;
        Some((entry, was_active))
    }

    /// Empty the queue, active entry first, then in FIFO order
    pub fn drain(&mut self) -> Vec<QueueEntry> {
        let mut drained = Vec::with_capacity(self.entries.len());
        let order = self.active.take().into_iter().chain(self.fifo.drain(..));
        for key in order.collect::<Vec<_>>() {
            if let Some(mut entry) = self.entries.remove(&key) {
                entry.cancel_timer();
                drained.push(entry);
            }
        }
        for (_, mut entry) in self.entries.drain() {
            entry.cancel_timer();
            drained.push(entry);
        }
        drained
    }

    /// Number of pending keys, the active one included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
