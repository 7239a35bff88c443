//! Idle, prepare and check watchers.
//!
//! Three per-iteration hooks sharing one mechanism: idle runs before the loop
//! considers blocking (and forces a zero poll timeout while active), prepare
//! runs just before the readiness poll, check just after. A phase runs over a
//! snapshot of its queue, so a watcher started from inside a callback first
//! fires on the next iteration and one stopped from inside a callback does
//! not fire at all.

use crate::event_loop::EventLoop;
use crate::handle::{
    CheckHandle, Handle, HandleData, HandleKind, IdleHandle, LoopWatcherCb, LoopWatcherState,
    PrepareHandle,
};

macro_rules! loop_watcher_api {
    ($kind:ident, $handle:ty, $init:ident, $start:ident, $stop:ident) => {
        pub fn $init(&mut self) -> $handle {
            let h = self.register_handle(
                HandleKind::$kind,
                HandleData::LoopWatcher(LoopWatcherState { queued: false, cb: None }),
            );
            <$handle>::from_raw(h)
        }

        /// Activate the watcher. A no-op if it is already running; the
        /// original callback stays in place.
        pub fn $start<F>(&mut self, w: $handle, cb: F)
        where
            F: FnMut(&mut EventLoop, $handle) + 'static,
        {
            let mut cb = cb;
            self.loop_watcher_start(
                w.0,
                HandleKind::$kind,
                Box::new(move |lp, h| cb(lp, <$handle>::from_raw(h))),
            );
        }

        /// Deactivate the watcher. A no-op if it is not running.
        pub fn $stop(&mut self, w: $handle) {
            self.loop_watcher_stop(w.0, HandleKind::$kind);
        }
    };
}

impl IdleHandle {
    fn from_raw(h: Handle) -> IdleHandle {
        IdleHandle(h)
    }
}

impl PrepareHandle {
    fn from_raw(h: Handle) -> PrepareHandle {
        PrepareHandle(h)
    }
}

impl CheckHandle {
    fn from_raw(h: Handle) -> CheckHandle {
        CheckHandle(h)
    }
}

impl EventLoop {
    loop_watcher_api!(Idle, IdleHandle, idle_init, idle_start, idle_stop);
    loop_watcher_api!(Prepare, PrepareHandle, prepare_init, prepare_start, prepare_stop);
    loop_watcher_api!(Check, CheckHandle, check_init, check_start, check_stop);

    fn loop_watcher_start(&mut self, h: Handle, kind: HandleKind, cb: LoopWatcherCb) {
        {
            let slot = self.slot_mut(h);
            assert!(!slot.is_closing(), "start on a closing handle");
            debug_assert_eq!(slot.kind, kind);
            let state = slot.loop_watcher_mut();
            if state.queued {
                return;
            }
            state.queued = true;
            state.cb = Some(cb);
        }
        self.queue_of(kind).push_back(h);
        self.handle_start(h);
    }

    fn loop_watcher_stop(&mut self, h: Handle, kind: HandleKind) {
        {
            let slot = self.slot_mut(h);
            if slot.is_closing() {
                return;
            }
            let state = slot.loop_watcher_mut();
            if !state.queued {
                return;
            }
            state.queued = false;
        }
        self.queue_of(kind).retain(|&q| q != h);
        self.handle_stop(h);
    }

    pub(crate) fn loop_watcher_teardown(&mut self, h: Handle, kind: HandleKind) {
        let queued = {
            let state = self.slots[h.index as usize].loop_watcher_mut();
            std::mem::replace(&mut state.queued, false)
        };
        if queued {
            self.queue_of(kind).retain(|&q| q != h);
        }
    }

    fn queue_of(&mut self, kind: HandleKind) -> &mut std::collections::VecDeque<Handle> {
        match kind {
            HandleKind::Idle => &mut self.idle_queue,
            HandleKind::Prepare => &mut self.prepare_queue,
            HandleKind::Check => &mut self.check_queue,
            _ => unreachable!("not a loop watcher kind"),
        }
    }

    pub(crate) fn run_idle(&mut self) {
        self.run_loop_watchers(HandleKind::Idle);
    }

    pub(crate) fn run_prepare(&mut self) {
        self.run_loop_watchers(HandleKind::Prepare);
    }

    pub(crate) fn run_check(&mut self) {
        self.run_loop_watchers(HandleKind::Check);
    }

    fn run_loop_watchers(&mut self, kind: HandleKind) {
        let mut snapshot = std::mem::take(self.queue_of(kind));
        while let Some(h) = snapshot.pop_front() {
            // Put the entry back on the live queue before the callback so a
            // stop from inside it lands on the real queue; skip entries that
            // were stopped or closed earlier in this phase.
            let cb = {
                let slot = match self.slot_if_open(h) {
                    Some(slot) => slot,
                    None => continue,
                };
                let state = slot.loop_watcher_mut();
                if !state.queued {
                    continue;
                }
                state.cb.take()
            };
            self.queue_of(kind).push_back(h);

            if let Some(mut cb) = cb {
                cb(self, h);
                if let Some(slot) = self.slot_if_open(h) {
                    let state = slot.loop_watcher_mut();
                    if state.cb.is_none() {
                        state.cb = Some(cb);
                    }
                }
            }
        }
    }
}
