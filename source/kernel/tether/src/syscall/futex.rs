// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Futex wait queue: contexts parked on a user address until woken.

use crate::sched::ContextId;

/// Parked contexts the queue can hold at once.
pub const FUTEX_SLOTS: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Waiter {
    addr: usize,
    context: ContextId,
    /// Arrival order; oldest is woken first.
    seq: u64,
}

/// Queue is full; the caller returns to userspace as a spurious wakeup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFull;

/// Fixed-capacity wait queue keyed by user address.
#[derive(Debug)]
pub struct FutexQueue {
    slots: [Option<Waiter>; FUTEX_SLOTS],
    next_seq: u64,
}

impl FutexQueue {
    pub const fn new() -> Self {
        Self { slots: [None; FUTEX_SLOTS], next_seq: 0 }
    }

    /// Records `context` as waiting on `addr`.
    pub fn park(&mut self, addr: usize, context: ContextId) -> Result<(), QueueFull> {
        let slot = self.slots.iter_mut().find(|s| s.is_none()).ok_or(QueueFull)?;
        *slot = Some(Waiter { addr, context, seq: self.next_seq });
        self.next_seq += 1;
        Ok(())
    }

    /// Removes up to `max` waiters on `addr` in arrival order, calling `wake` for each.
    pub fn wake(&mut self, addr: usize, max: usize, mut wake: impl FnMut(ContextId)) -> usize {
        let mut woken = 0;
        while woken < max {
            let oldest = self
                .slots
                .iter_mut()
                .filter(|s| matches!(s, Some(w) if w.addr == addr))
                .min_by_key(|s| s.map_or(u64::MAX, |w| w.seq));
            let Some(slot) = oldest else { break };
            if let Some(waiter) = slot.take() {
                wake(waiter.context);
                woken += 1;
            }
        }
        woken
    }

    pub fn waiters(&self, addr: usize) -> usize {
        self.slots.iter().filter(|s| matches!(s, Some(w) if w.addr == addr)).count()
    }
}

impl Default for FutexQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    extern crate alloc;

    use alloc::vec::Vec;

    use super::*;

    #[test]
    fn wakes_in_arrival_order_up_to_count() {
        let mut queue = FutexQueue::new();
        queue.park(0x1000, 3).expect("slot");
        queue.park(0x2000, 4).expect("slot");
        queue.park(0x1000, 1).expect("slot");
        queue.park(0x1000, 2).expect("slot");

        let mut order = Vec::new();
        assert_eq!(queue.wake(0x1000, 2, |id| order.push(id)), 2);
        assert_eq!(order, [3, 1]);
        assert_eq!(queue.waiters(0x1000), 1);
        assert_eq!(queue.waiters(0x2000), 1);
    }

    #[test]
    fn wake_without_waiters_is_zero() {
        let mut queue = FutexQueue::new();
        assert_eq!(queue.wake(0x1000, usize::MAX, |_| panic!("nobody waits")), 0);
    }

    #[test]
    fn full_queue_refuses() {
        let mut queue = FutexQueue::new();
        for id in 0..FUTEX_SLOTS {
            queue.park(0x1000, id).expect("slot");
        }
        assert_eq!(queue.park(0x1000, FUTEX_SLOTS), Err(QueueFull));
        assert_eq!(queue.wake(0x1000, usize::MAX, |_| {}), FUTEX_SLOTS);
        assert!(queue.park(0x1000, 0).is_ok());
    }
}
