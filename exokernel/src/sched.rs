//! Round-robin run queue.
//!
//! Environments become schedulable through `sys_env_set_status`. The queue
//! lives in the [`Kernel`](crate::Kernel) and holds each runnable
//! environment at most once. Destroying an environment removes it from the
//! queue, so the queue never outgrows the environment table.

use crossbeam_queue::SegQueue;
use ulib::Envid;

/// A FIFO of runnable environments.
#[derive(Default)]
pub struct RunQueue {
    queue: SegQueue<Envid>,
}

impl RunQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `id` to the back of the queue.
    pub fn push(&self, id: Envid) {
        self.queue.push(id);
    }

    /// Takes the environment at the front of the queue.
    pub fn pop(&self) -> Option<Envid> {
        self.queue.pop()
    }

    /// Keeps only the identifiers for which `keep` returns `true`, in their
    /// original order.
    pub fn retain(&self, mut keep: impl FnMut(Envid) -> bool) {
        for _ in 0..self.queue.len() {
            match self.queue.pop() {
                Some(id) if keep(id) => self.queue.push(id),
                Some(_) => (),
                None => break,
            }
        }
    }

    /// Number of queued identifiers.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Returns `true` if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retain_keeps_order() {
        let runq = RunQueue::new();
        for id in 0x1000..0x1005 {
            runq.push(Envid(id));
        }
        runq.retain(|id| id.0 % 2 == 0);
        assert_eq!(runq.len(), 3);
        assert_eq!(runq.pop(), Some(Envid(0x1000)));
        assert_eq!(runq.pop(), Some(Envid(0x1002)));
        assert_eq!(runq.pop(), Some(Envid(0x1004)));
        assert!(runq.is_empty());
    }
}
