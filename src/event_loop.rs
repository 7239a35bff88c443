use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;

use log::{debug, trace};
use slab::Slab;

use crate::config::LoopConfig;
use crate::handle::{CloseCb, Handle, HandleData, HandleFlags, HandleKind, HandleSlot};
use crate::heap::Heap;
use crate::syscore::{hrtime, EventBuf, Poller};

/// How [`EventLoop::run`] decides when to come back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Iterate until no active handles, active requests or pending closes
    /// remain, or until [`EventLoop::stop`] is called.
    Default,
    /// One iteration, blocking for readiness if nothing is due yet.
    Once,
    /// One iteration with a non-blocking readiness poll.
    NoWait,
}

/// A single-threaded event loop.
///
/// One iteration visits its phases in a fixed order: cache the monotonic
/// clock, run due timers, run pending callbacks deferred from the previous
/// iteration, run idle then prepare watchers, poll the kernel for readiness,
/// run check watchers, then deliver close callbacks. All callbacks run on the
/// thread that called [`run`](EventLoop::run) and may freely re-enter the
/// loop's API, including closing the very handle they belong to.
pub struct EventLoop {
    pub(crate) now: u64,
    pub(crate) poller: Poller,
    pub(crate) event_batch: usize,
    pub(crate) events_buf: Option<EventBuf>,

    pub(crate) slots: Slab<HandleSlot>,
    next_gen: u32,

    /// Dense fd-indexed table of watching handles.
    pub(crate) fd_table: Vec<Option<Handle>>,
    /// Number of descriptors currently registered in `fd_table`.
    pub(crate) nfds: usize,
    /// Watchers whose requested interest has not been pushed to the kernel.
    pub(crate) watcher_queue: VecDeque<Handle>,
    /// Watchers with readiness deferred to the pending phase.
    pub(crate) pending_queue: VecDeque<Handle>,

    pub(crate) timer_heap: Heap,
    pub(crate) next_start_id: u64,

    pub(crate) idle_queue: VecDeque<Handle>,
    pub(crate) prepare_queue: VecDeque<Handle>,
    pub(crate) check_queue: VecDeque<Handle>,
    pub(crate) closing: VecDeque<Handle>,

    pub(crate) active_handles: u32,
    pub(crate) active_requests: u32,
    pub(crate) stop_flag: bool,
}

impl EventLoop {
    pub fn new() -> io::Result<EventLoop> {
        Self::with_config(LoopConfig::default())
    }

    pub fn with_config(config: LoopConfig) -> io::Result<EventLoop> {
        let poller = Poller::new()?;
        debug!("event loop created, backend fd {}", poller.fd());
        Ok(EventLoop {
            now: hrtime(),
            poller,
            event_batch: config.event_batch.max(1),
            events_buf: Some(EventBuf::new(config.event_batch)),
            slots: Slab::new(),
            next_gen: 1,
            fd_table: vec![None; config.fd_table_hint],
            nfds: 0,
            watcher_queue: VecDeque::new(),
            pending_queue: VecDeque::new(),
            timer_heap: Heap::new(),
            next_start_id: 0,
            idle_queue: VecDeque::new(),
            prepare_queue: VecDeque::new(),
            check_queue: VecDeque::new(),
            closing: VecDeque::new(),
            active_handles: 0,
            active_requests: 0,
            stop_flag: false,
        })
    }

    /// Cached monotonic time in nanoseconds, refreshed once per phase 1 and
    /// after every kernel wait.
    pub fn now(&self) -> u64 {
        self.now
    }

    /// Refresh the cached clock. Called by the loop itself at the top of each
    /// iteration; embedders running their own outer loop may call it between
    /// phases.
    pub fn update_time(&mut self) {
        self.now = hrtime();
    }

    /// The kernel readiness descriptor backing this loop.
    pub fn backend_fd(&self) -> RawFd {
        self.poller.fd()
    }

    /// True while anything would keep [`run`](EventLoop::run) going: an
    /// active handle, an in-flight request or an undelivered close.
    pub fn alive(&self) -> bool {
        self.active_handles > 0 || self.active_requests > 0 || !self.closing.is_empty()
    }

    /// The timeout the next readiness poll would use, in milliseconds; -1
    /// means it would block indefinitely.
    pub fn backend_timeout(&self) -> i32 {
        if self.stop_flag {
            return 0;
        }
        if self.active_handles == 0 && self.active_requests == 0 {
            return 0;
        }
        if !self.idle_queue.is_empty() {
            return 0;
        }
        if !self.pending_queue.is_empty() {
            return 0;
        }
        if !self.closing.is_empty() {
            return 0;
        }
        self.next_timeout()
    }

    /// Drive the loop. Returns `true` if work remained when the call ended,
    /// which for [`RunMode::Default`] can only happen through
    /// [`stop`](EventLoop::stop).
    pub fn run(&mut self, mode: RunMode) -> bool {
        let mut alive = self.alive();
        if !alive {
            self.update_time();
        }

        while alive && !self.stop_flag {
            self.update_time();
            self.run_timers();
            let ran_pending = self.run_pending();
            self.run_idle();
            self.run_prepare();

            let mut timeout = 0;
            if mode == RunMode::Default || (mode == RunMode::Once && !ran_pending) {
                timeout = self.backend_timeout();
            }

            self.poll_io(timeout);
            self.run_check();
            self.run_closing_handles();

            if mode == RunMode::Once {
                // The wait may have returned early on a signal, or on a
                // timeout that undershot the nearest timer by a tick; rerun
                // timers against a fresh clock so "once" makes progress.
                self.update_time();
                self.run_timers();
            }

            alive = self.alive();
            if mode != RunMode::Default {
                break;
            }
        }

        if self.stop_flag {
            self.stop_flag = false;
        }

        alive
    }

    /// Ask a running loop to return after the current iteration. Idempotent;
    /// safe to call from any callback.
    pub fn stop(&mut self) {
        self.stop_flag = true;
    }

    /// Count an external one-shot operation. The loop stays alive until the
    /// matching [`request_unregister`](EventLoop::request_unregister), which
    /// the operation's completion path must call after delivering its
    /// callback.
    pub fn request_register(&mut self) {
        self.active_requests += 1;
    }

    pub fn request_unregister(&mut self) {
        assert!(self.active_requests > 0, "no request is in flight");
        self.active_requests -= 1;
    }

    /// The kind of handle behind an id.
    pub fn handle_kind(&self, h: impl Into<Handle>) -> HandleKind {
        self.slot(h.into()).kind
    }

    /// Request that a handle be closed. The handle is deactivated and removed
    /// from every queue immediately; `cb` fires at the close phase, after
    /// which the id is stale and the slot is reclaimed. Closing a handle that
    /// is already closing is a programming error and panics.
    pub fn close<H, F>(&mut self, h: H, cb: F)
    where
        H: Into<Handle>,
        F: FnOnce(&mut EventLoop, Handle) + 'static,
    {
        let h = h.into();
        let kind = {
            let slot = self.slot(h);
            assert!(!slot.is_closing(), "close of an already-closing handle");
            slot.kind
        };

        match kind {
            HandleKind::Timer => self.timer_teardown(h),
            HandleKind::Io => self.fd_watcher_teardown(h),
            HandleKind::Idle | HandleKind::Prepare | HandleKind::Check => {
                self.loop_watcher_teardown(h, kind)
            }
            HandleKind::Async => {
                self.fd_watcher_teardown(h);
                self.async_teardown(h);
            }
        }

        self.handle_stop(h);

        let slot = &mut self.slots[h.index as usize];
        slot.flags |= HandleFlags::CLOSING;
        slot.close_cb = Some(Box::new(cb) as CloseCb);
        self.closing.push_back(h);
    }

    fn run_closing_handles(&mut self) {
        // Snapshot: a handle closed from inside a close callback is delivered
        // on the next iteration, not this one.
        let mut queue = std::mem::take(&mut self.closing);
        while let Some(h) = queue.pop_front() {
            self.finish_close(h);
        }
    }

    fn finish_close(&mut self, h: Handle) {
        let cb = {
            let slot = &mut self.slots[h.index as usize];
            debug_assert!(slot.flags.contains(HandleFlags::CLOSING));
            debug_assert!(!slot.flags.contains(HandleFlags::CLOSED));
            debug_assert!(!slot.flags.contains(HandleFlags::ACTIVE));
            slot.flags |= HandleFlags::CLOSED;
            slot.close_cb.take()
        };
        trace!("close delivered for {:?} handle {}", self.slots[h.index as usize].kind, h.index);
        if let Some(cb) = cb {
            cb(self, h);
        }
        self.slots.remove(h.index as usize);
    }

    // ---- slot plumbing ----------------------------------------------------

    pub(crate) fn register_handle(&mut self, kind: HandleKind, data: HandleData) -> Handle {
        let gen = self.next_gen;
        self.next_gen = self.next_gen.wrapping_add(1).max(1);
        let index = self.slots.insert(HandleSlot {
            gen,
            kind,
            flags: HandleFlags::empty(),
            data,
            close_cb: None,
        });
        Handle { index: index as u32, gen }
    }

    pub(crate) fn slot(&self, h: Handle) -> &HandleSlot {
        let slot = self
            .slots
            .get(h.index as usize)
            .unwrap_or_else(|| panic!("use of a closed handle"));
        assert!(slot.gen == h.gen, "use of a closed handle");
        slot
    }

    pub(crate) fn slot_mut(&mut self, h: Handle) -> &mut HandleSlot {
        let slot = self
            .slots
            .get_mut(h.index as usize)
            .unwrap_or_else(|| panic!("use of a closed handle"));
        assert!(slot.gen == h.gen, "use of a closed handle");
        slot
    }

    /// The slot for `h` if it still exists under the same generation, e.g.
    /// after user callbacks ran and may have closed it.
    pub(crate) fn slot_if_open(&mut self, h: Handle) -> Option<&mut HandleSlot> {
        match self.slots.get_mut(h.index as usize) {
            Some(slot) if slot.gen == h.gen && !slot.is_closing() => Some(slot),
            _ => None,
        }
    }

    /// Reconstruct the full id of a live slot from its slab index.
    pub(crate) fn handle_at(&self, index: usize) -> Handle {
        Handle { index: index as u32, gen: self.slots[index].gen }
    }

    pub(crate) fn handle_start(&mut self, h: Handle) {
        let slot = &mut self.slots[h.index as usize];
        if !slot.flags.contains(HandleFlags::ACTIVE) {
            slot.flags |= HandleFlags::ACTIVE;
            self.active_handles += 1;
        }
    }

    pub(crate) fn handle_stop(&mut self, h: Handle) {
        let slot = &mut self.slots[h.index as usize];
        if slot.flags.contains(HandleFlags::ACTIVE) {
            slot.flags -= HandleFlags::ACTIVE;
            debug_assert!(self.active_handles > 0);
            self.active_handles -= 1;
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        debug!("event loop torn down, backend fd {}", self.poller.fd());
        // Async slots close their wakeup descriptors on drop; the poller
        // closes the backend descriptor.
    }
}
