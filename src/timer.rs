//! Monotonic timers, ordered by an intrusive min-heap.
//!
//! A timer's position is `(expiry, start_id)`: absolute nanoseconds on the
//! monotonic clock, ties broken by start order. The heap's min supplies the
//! poll timeout; the timer phase pops everything that is due and lets repeats
//! catch up by whole periods so a stalled callback cannot build a backlog of
//! back-to-back fires.

use std::io;

use slab::Slab;

use crate::event_loop::EventLoop;
use crate::handle::{Handle, HandleData, HandleKind, HandleSlot, TimerHandle, TimerState};
use crate::heap::{HeapArena, HeapNode};

/// Heap view over the loop's handle slots; comparisons are by
/// `(expiry, start_id)`.
struct TimerArena<'a>(&'a mut Slab<HandleSlot>);

impl HeapArena for TimerArena<'_> {
    fn node(&self, idx: usize) -> &HeapNode {
        &self.0[idx].timer().heap_node
    }

    fn node_mut(&mut self, idx: usize) -> &mut HeapNode {
        &mut self.0[idx].timer_mut().heap_node
    }

    fn less_than(&self, a: usize, b: usize) -> bool {
        let (ta, tb) = (self.0[a].timer(), self.0[b].timer());
        (ta.expiry, ta.start_id) < (tb.expiry, tb.start_id)
    }
}

impl EventLoop {
    pub fn timer_init(&mut self) -> TimerHandle {
        let h = self.register_handle(
            HandleKind::Timer,
            HandleData::Timer(TimerState {
                heap_node: HeapNode::new(),
                expiry: 0,
                repeat: 0,
                start_id: 0,
                cb: None,
            }),
        );
        TimerHandle(h)
    }

    /// Arm the timer to fire once after `timeout_ms` and, if `repeat_ms` is
    /// non-zero, every `repeat_ms` thereafter. Starting a started timer
    /// re-arms it with the new values and callback.
    pub fn timer_start<F>(&mut self, t: TimerHandle, timeout_ms: u64, repeat_ms: u64, cb: F)
    where
        F: FnMut(&mut EventLoop, TimerHandle) + 'static,
    {
        let h = t.0;
        {
            let slot = self.slot_mut(h);
            assert!(!slot.is_closing(), "start on a closing handle");
        }
        if self.slots[h.index as usize].flags.contains(crate::handle::HandleFlags::ACTIVE) {
            self.timer_heap_remove(h);
        }

        let expiry = self.now.saturating_add(timeout_ms.saturating_mul(1_000_000));
        {
            let timer = self.slots[h.index as usize].timer_mut();
            timer.expiry = expiry;
            timer.repeat = repeat_ms.saturating_mul(1_000_000);
            timer.cb = Some(Box::new(cb));
        }
        self.timer_heap_insert(h);
        self.handle_start(h);
    }

    /// Disarm the timer. A no-op on a timer that is not running.
    pub fn timer_stop(&mut self, t: TimerHandle) {
        let h = t.0;
        let slot = self.slot(h);
        if slot.is_closing() || !slot.flags.contains(crate::handle::HandleFlags::ACTIVE) {
            return;
        }
        self.timer_heap_remove(h);
        self.handle_stop(h);
    }

    /// Re-arm a running repeating timer to fire one full period from now.
    /// Errors with `InvalidInput` if the timer is stopped or has no repeat.
    pub fn timer_again(&mut self, t: TimerHandle) -> io::Result<()> {
        let h = t.0;
        let repeat = {
            let slot = self.slot(h);
            if slot.is_closing() || !slot.flags.contains(crate::handle::HandleFlags::ACTIVE) {
                return Err(io::Error::from(io::ErrorKind::InvalidInput));
            }
            slot.timer().repeat
        };
        if repeat == 0 {
            return Err(io::Error::from(io::ErrorKind::InvalidInput));
        }

        self.timer_heap_remove(h);
        let expiry = self.now.saturating_add(repeat);
        self.slots[h.index as usize].timer_mut().expiry = expiry;
        self.timer_heap_insert(h);
        Ok(())
    }

    /// Change the repeat interval. Takes effect at the next (re)schedule; the
    /// currently pending expiry is left alone.
    pub fn timer_set_repeat(&mut self, t: TimerHandle, repeat_ms: u64) {
        self.slot_mut(t.0).timer_mut().repeat = repeat_ms.saturating_mul(1_000_000);
    }

    /// The repeat interval in milliseconds.
    pub fn timer_repeat(&self, t: TimerHandle) -> u64 {
        self.slot(t.0).timer().repeat / 1_000_000
    }

    // ---- loop integration -------------------------------------------------

    fn timer_heap_insert(&mut self, h: Handle) {
        let start_id = self.next_start_id;
        self.next_start_id += 1;
        self.slots[h.index as usize].timer_mut().start_id = start_id;
        self.timer_heap.insert(&mut TimerArena(&mut self.slots), h.index as usize);
    }

    fn timer_heap_remove(&mut self, h: Handle) {
        self.timer_heap.remove(&mut TimerArena(&mut self.slots), h.index as usize);
    }

    /// Pop and fire everything that is due. Repeats are rescheduled before
    /// their callback runs, catching up by whole periods: a callback that
    /// overruns its interval produces at most one immediate make-up fire, not
    /// a burst.
    pub(crate) fn run_timers(&mut self) {
        loop {
            let idx = match self.timer_heap.min() {
                Some(idx) => idx,
                None => break,
            };
            if self.slots[idx].timer().expiry > self.now {
                break;
            }

            let h = self.handle_at(idx);
            let popped = self.timer_heap.dequeue(&mut TimerArena(&mut self.slots));
            debug_assert_eq!(popped, Some(idx));

            let repeat = self.slots[idx].timer().repeat;
            if repeat > 0 {
                let expiry = self.slots[idx].timer().expiry;
                let next = self.now.max(expiry.saturating_add(repeat));
                self.slots[idx].timer_mut().expiry = next;
                self.timer_heap_insert(h);
            } else {
                // One-shots go inactive before their callback, so a loop with
                // nothing else to do can exit right after it.
                self.handle_stop(h);
            }

            let cb = self.slots[idx].timer_mut().cb.take();
            if let Some(mut cb) = cb {
                cb(self, TimerHandle(h));
                if let Some(slot) = self.slot_if_open(h) {
                    let timer = slot.timer_mut();
                    if timer.cb.is_none() {
                        timer.cb = Some(cb);
                    }
                }
            }
        }
    }

    /// Milliseconds until the nearest timer, rounded up; 0 if one is already
    /// due, -1 if there is none and the poll may block indefinitely.
    pub(crate) fn next_timeout(&self) -> i32 {
        let idx = match self.timer_heap.min() {
            Some(idx) => idx,
            None => return -1,
        };
        let expiry = self.slots[idx].timer().expiry;
        if expiry <= self.now {
            return 0;
        }
        let ms = (expiry - self.now).saturating_add(999_999) / 1_000_000;
        ms.min(i32::MAX as u64) as i32
    }

    pub(crate) fn timer_teardown(&mut self, h: Handle) {
        if self.slots[h.index as usize].flags.contains(crate::handle::HandleFlags::ACTIVE) {
            self.timer_heap_remove(h);
        }
    }
}
