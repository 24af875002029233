//! Outbound command staging.

use crate::protocol::Command;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// FIFO of commands waiting for the dispatch loop.
///
/// Producers are control requests; the single consumer is the dispatch loop.
/// Nothing here blocks beyond the short critical section of the lock.
#[derive(Debug, Default)]
pub struct CommandQueue {
    inner: Mutex<VecDeque<Command>>,
}

impl CommandQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a command.
    pub fn enqueue(&self, command: Command) {
        self.inner.lock().push_back(command);
    }

    /// Remove the oldest command.
    pub fn dequeue(&self) -> Option<Command> {
        self.inner.lock().pop_front()
    }

    /// Remove the oldest command only if it satisfies `pred`.
    pub fn dequeue_if(&self, pred: impl FnOnce(&Command) -> bool) -> Option<Command> {
        let mut queue = self.inner.lock();
        if queue.front().is_some_and(pred) {
            queue.pop_front()
        } else {
            None
        }
    }

    /// Drop every command matching `pred`, returning how many were removed.
    pub fn remove_where(&self, mut pred: impl FnMut(&Command) -> bool) -> usize {
        let mut queue = self.inner.lock();
        let before = queue.len();
        queue.retain(|command| !pred(command));
        before - queue.len()
    }

    /// Whether any command is waiting.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Number of waiting commands.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Run `f` with exclusive access to the queue.
    pub(crate) fn with_locked<R>(&self, f: impl FnOnce(&mut VecDeque<Command>) -> R) -> R {
        f(&mut self.inner.lock())
    }
}
