//! File-descriptor watchers: registration, kernel reconciliation and the
//! readiness poll phase.
//!
//! Interest changes never hit the kernel where they're requested. A start or
//! stop only edits the watcher's requested mask and parks it on the loop's
//! watcher queue; the queue is drained at the top of the poll phase and turned
//! into the minimal set of kernel operations. Edge-triggered watchers are
//! registered for both directions up front, so reactivating one is usually a
//! bookkeeping change with no syscall at all.

use std::io;
use std::os::unix::io::RawFd;

use log::{debug, trace};

use crate::event_loop::EventLoop;
use crate::handle::{HandleData, HandleKind, IoState, WatcherCore};
use crate::handle::{Handle, IoWatcher};
use crate::syscore::{CtlOp, EventBuf};

macro_rules! syscall {
    ($fn:ident $args:tt) => {{
        let res = unsafe { libc::$fn $args };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

bitflags::bitflags! {
    /// Readiness and interest bits for fd watchers.
    ///
    /// `ERROR` and `HANGUP` are always reported and cannot be requested.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Events: u32 {
        /// The descriptor is readable.
        const READABLE = libc::EPOLLIN as u32;
        /// The descriptor is writable.
        const WRITABLE = libc::EPOLLOUT as u32;
        /// An error condition is pending.
        const ERROR = libc::EPOLLERR as u32;
        /// The peer hung up.
        const HANGUP = libc::EPOLLHUP as u32;
        /// Report transitions instead of levels. Consumers must drain the
        /// descriptor completely on every callback.
        const EDGE = libc::EPOLLET as u32;
    }
}

impl EventLoop {
    /// Register a watcher over a caller-owned descriptor. The descriptor is
    /// switched to non-blocking mode; it is never duplicated and never closed
    /// by the loop.
    pub fn io_init(&mut self, fd: RawFd) -> io::Result<IoWatcher> {
        assert!(fd >= 0, "watcher fd out of range");
        let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
        syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
        let h = self.register_handle(
            HandleKind::Io,
            HandleData::Io(IoState { core: WatcherCore::new(fd), cb: None }),
        );
        Ok(IoWatcher(h))
    }

    /// Start observing `events` on the watcher's descriptor, replacing the
    /// callback. Accepts `READABLE`, `WRITABLE` and `EDGE`; idempotent in the
    /// mask — starting an already-started watcher adds interest bits.
    ///
    /// The callback receives the bits that fired, which may include `ERROR`
    /// or `HANGUP` whether or not they were asked for.
    pub fn io_start<F>(&mut self, w: IoWatcher, events: Events, cb: F)
    where
        F: FnMut(&mut EventLoop, IoWatcher, Events) + 'static,
    {
        let h = w.0;
        let requestable = Events::READABLE | Events::WRITABLE | Events::EDGE;
        assert!(
            requestable.contains(events) && events.intersects(Events::READABLE | Events::WRITABLE),
            "io_start takes READABLE and/or WRITABLE, optionally EDGE"
        );
        {
            let slot = self.slot_mut(h);
            assert!(!slot.is_closing(), "start on a closing handle");
            slot.io_mut().cb = Some(Box::new(cb));
        }
        self.io_start_raw(h, events);
        self.handle_start(h);
    }

    /// Withdraw interest bits. When the last bit clears, the watcher leaves
    /// the descriptor table and no longer keeps the loop alive; readiness
    /// already collected for this iteration is discarded.
    pub fn io_stop(&mut self, w: IoWatcher, events: Events) {
        let h = w.0;
        let slot = self.slot(h);
        if slot.is_closing() {
            return;
        }
        self.io_stop_raw(h, events);
        if self.slots[h.index as usize].watcher_core().levents.is_empty() {
            self.handle_stop(h);
        }
    }

    // ---- registry ---------------------------------------------------------

    pub(crate) fn io_start_raw(&mut self, h: Handle, events: Events) {
        let fd = {
            let core = self.slots[h.index as usize].watcher_core_mut();
            core.levents |= events;
            if !core.in_watcher_queue {
                core.in_watcher_queue = true;
                self.watcher_queue.push_back(h);
            }
            core.fd
        };

        self.ensure_fd_capacity(fd as usize + 1);
        match self.fd_table[fd as usize] {
            None => {
                self.fd_table[fd as usize] = Some(h);
                self.nfds += 1;
            }
            Some(existing) => {
                assert!(existing == h, "descriptor {} is watched by another handle", fd);
            }
        }
    }

    pub(crate) fn io_stop_raw(&mut self, h: Handle, events: Events) {
        let (fd, emptied, queued) = {
            let core = self.slots[h.index as usize].watcher_core_mut();
            core.levents -= events;
            (core.fd, core.levents.is_empty(), core.in_watcher_queue)
        };

        if emptied {
            if queued {
                self.watcher_queue.retain(|&q| q != h);
                self.slots[h.index as usize].watcher_core_mut().in_watcher_queue = false;
            }
            if self.fd_table.get(fd as usize).copied().flatten() == Some(h) {
                self.fd_table[fd as usize] = None;
                debug_assert!(self.nfds > 0);
                self.nfds -= 1;
                // The kernel registration is now stale; the next event it
                // produces gets a best-effort disarm in the poll phase.
                self.slots[h.index as usize].watcher_core_mut().events = Events::empty();
            }
        } else if !queued {
            // Kernel interest must shrink to the remaining bits at the next
            // reconcile.
            self.slots[h.index as usize].watcher_core_mut().in_watcher_queue = true;
            self.watcher_queue.push_back(h);
        }
    }

    /// Defer readiness delivery to the pending phase of the next iteration.
    pub(crate) fn io_feed(&mut self, h: Handle, events: Events) {
        let core = self.slots[h.index as usize].watcher_core_mut();
        core.pending_events |= events;
        if !core.in_pending_queue {
            core.in_pending_queue = true;
            self.pending_queue.push_back(h);
        }
    }

    pub(crate) fn run_pending(&mut self) -> bool {
        let mut ran = false;
        let mut queue = std::mem::take(&mut self.pending_queue);
        while let Some(h) = queue.pop_front() {
            let events = {
                let slot = &mut self.slots[h.index as usize];
                if slot.is_closing() {
                    continue;
                }
                let core = slot.watcher_core_mut();
                core.in_pending_queue = false;
                std::mem::replace(&mut core.pending_events, Events::empty())
            };
            if !events.is_empty() {
                self.io_dispatch(h, events);
                ran = true;
            }
        }
        ran
    }

    fn ensure_fd_capacity(&mut self, want: usize) {
        if self.fd_table.len() < want {
            self.fd_table.resize(want.next_power_of_two(), None);
        }
    }

    // ---- poll phase -------------------------------------------------------

    /// Reconcile requested interest with the kernel, then wait up to
    /// `timeout` milliseconds (0 polls, -1 blocks) and dispatch readiness.
    pub(crate) fn poll_io(&mut self, mut timeout: i32) {
        if self.nfds == 0 {
            debug_assert!(self.watcher_queue.is_empty());
            if timeout == 0 {
                return;
            }
            // Nothing registered: the wait below degrades to a pure sleep
            // until the nearest timer.
        }

        while let Some(h) = self.watcher_queue.pop_front() {
            let fd;
            let op;
            let levents;
            let mut deliver = Events::empty();
            let mut kernel_change = true;
            {
                let slot = &mut self.slots[h.index as usize];
                if slot.is_closing() {
                    continue;
                }
                let core = slot.watcher_core_mut();
                core.in_watcher_queue = false;
                debug_assert!(!core.levents.is_empty());
                debug_assert!(core.fd >= 0);
                fd = core.fd;
                levents = core.levents;
                op = if core.events.is_empty() { CtlOp::Add } else { CtlOp::Mod };

                if op == CtlOp::Mod && levents.contains(Events::EDGE) {
                    // Already registered for both directions edge-triggered;
                    // the kernel needs no update. Either readiness the kernel
                    // reported earlier is being re-requested, in which case it
                    // is handed over out of `revents`, or interest is being
                    // narrowed, which the dispatch mask handles by itself.
                    deliver = levents & core.revents;
                    core.revents -= deliver;
                    core.events = levents;
                    kernel_change = false;
                }
            }

            if !kernel_change {
                if !deliver.is_empty() {
                    self.io_feed(h, deliver);
                }
                continue;
            }

            let kernel_events = if levents.contains(Events::EDGE) {
                Events::READABLE | Events::WRITABLE | Events::EDGE
            } else {
                levents
            };

            match self.poller.ctl(op, fd, kernel_events) {
                Ok(()) => {}
                Err(e) if op == CtlOp::Add && e.raw_os_error() == Some(libc::EEXIST) => {
                    // The descriptor was registered before under a forgotten
                    // watcher, e.g. dup2'd onto a known fd. Level-triggered
                    // interest can simply be modified; edge-triggered has to
                    // be torn down and re-added because the prior trigger
                    // mode is unknown.
                    debug!("fd {} already registered, rebuilding interest", fd);
                    if !levents.contains(Events::EDGE) {
                        self.poller
                            .ctl(CtlOp::Mod, fd, kernel_events)
                            .unwrap_or_else(|e| panic!("interest update failed for fd {}: {}", fd, e));
                    } else {
                        self.poller
                            .ctl(CtlOp::Del, fd, Events::empty())
                            .unwrap_or_else(|e| panic!("interest removal failed for fd {}: {}", fd, e));
                        self.poller
                            .ctl(CtlOp::Add, fd, kernel_events)
                            .unwrap_or_else(|e| panic!("interest re-add failed for fd {}: {}", fd, e));
                    }
                }
                Err(e) => panic!("interest change failed for fd {}: {}", fd, e),
            }

            self.slots[h.index as usize].watcher_core_mut().events = levents;
        }

        // Reconciliation may have handed latent readiness to the pending
        // queue; that work must not sit behind a blocking wait.
        if !self.pending_queue.is_empty() {
            timeout = 0;
        }

        debug_assert!(timeout >= -1);
        let mut base = self.now;
        // Taken out for the duration of the wait so dispatch can borrow the
        // loop; a nested run from inside a callback just allocates its own.
        let mut buf = self
            .events_buf
            .take()
            .unwrap_or_else(|| EventBuf::new(self.event_batch));

        loop {
            let res = self.poller.wait(&mut buf, timeout);

            // Refresh the clock even for a zero timeout: the process may have
            // been descheduled inside the syscall for an arbitrary while.
            self.update_time();

            let mut interrupted = false;
            let nfds = match res {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    trace!("readiness wait interrupted by a signal");
                    interrupted = true;
                    0
                }
                Err(e) => panic!("readiness wait failed: {}", e),
            };

            if interrupted {
                if timeout == -1 {
                    continue;
                }
                if timeout == 0 {
                    break;
                }
                // Fall through to the timeout update below.
            } else if nfds == 0 {
                debug_assert!(timeout != -1);
                break;
            } else {
                let mut nevents = 0;
                for i in 0..nfds {
                    let (fd, ev) = buf.get(i);
                    debug_assert!(fd >= 0);

                    let h = match self.fd_table.get(fd as usize).copied().flatten() {
                        Some(h) => h,
                        None => {
                            // Stopped since the events were gathered; disarm.
                            // Errors are ignored, the descriptor may already
                            // be gone.
                            trace!("disarming stale fd {}", fd);
                            let _ = self.poller.ctl(CtlOp::Del, fd, Events::empty());
                            continue;
                        }
                    };

                    let fired = {
                        let core = self.slots[h.index as usize].watcher_core_mut();
                        core.revents |= ev;
                        // Edge-triggered watchers are registered for both
                        // directions; mask off whatever this one did not ask
                        // for. Errors and hangups always pass.
                        core.revents & (core.events | Events::ERROR | Events::HANGUP)
                    };
                    if !fired.is_empty() {
                        self.io_dispatch(h, fired);
                        nevents += 1;
                    }
                }

                if nevents != 0 {
                    break;
                }
                if timeout == 0 {
                    break;
                }
                if timeout == -1 {
                    continue;
                }
            }

            debug_assert!(timeout > 0);
            let elapsed_ms = ((self.now - base) / 1_000_000) as i64;
            if elapsed_ms >= timeout as i64 {
                break;
            }
            timeout -= elapsed_ms as i32;
            base = self.now;
        }

        self.events_buf = Some(buf);
    }

    pub(crate) fn io_dispatch(&mut self, h: Handle, events: Events) {
        match self.slots[h.index as usize].kind {
            HandleKind::Io => {
                let cb = self.slots[h.index as usize].io_mut().cb.take();
                if let Some(mut cb) = cb {
                    cb(self, IoWatcher(h), events);
                    if let Some(slot) = self.slot_if_open(h) {
                        let io = slot.io_mut();
                        if io.cb.is_none() {
                            io.cb = Some(cb);
                        }
                    }
                }
            }
            HandleKind::Async => self.async_io(h),
            kind => unreachable!("readiness for non-fd handle {:?}", kind),
        }
    }

    pub(crate) fn fd_watcher_teardown(&mut self, h: Handle) {
        let levents = self.slots[h.index as usize].watcher_core().levents;
        if !levents.is_empty() {
            self.io_stop_raw(h, levents);
        }
        let was_pending = {
            let core = self.slots[h.index as usize].watcher_core_mut();
            let was = core.in_pending_queue;
            core.in_pending_queue = false;
            core.pending_events = Events::empty();
            core.revents = Events::empty();
            was
        };
        if was_pending {
            self.pending_queue.retain(|&q| q != h);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    fn close_fds(fds: &[RawFd]) {
        for &fd in fds {
            unsafe { libc::close(fd) };
        }
    }

    #[test]
    fn start_stop_round_trip() {
        let mut lp = EventLoop::new().unwrap();
        let (r, w) = pipe();

        let io = lp.io_init(r).unwrap();
        assert_eq!(lp.nfds, 0);

        lp.io_start(io, Events::READABLE, |_, _, _| {});
        assert_eq!(lp.nfds, 1);
        assert_eq!(lp.fd_table[r as usize], Some(io.0));
        assert_eq!(lp.watcher_queue.len(), 1);
        assert!(lp.alive());

        lp.io_stop(io, Events::READABLE);
        assert_eq!(lp.nfds, 0);
        assert_eq!(lp.fd_table[r as usize], None);
        assert!(lp.watcher_queue.is_empty());
        assert!(!lp.alive());

        close_fds(&[r, w]);
    }

    #[test]
    fn level_triggered_dispatch() {
        let mut lp = EventLoop::new().unwrap();
        let (r, w) = pipe();
        assert_eq!(unsafe { libc::write(w, b"ping".as_ptr() as *const _, 4) }, 4);

        let fired = Rc::new(Cell::new(Events::empty()));
        let io = lp.io_init(r).unwrap();
        let seen = fired.clone();
        lp.io_start(io, Events::READABLE, move |_, _, ev| seen.set(ev));

        lp.poll_io(0);
        assert!(fired.get().contains(Events::READABLE));

        close_fds(&[r, w]);
    }

    #[test]
    fn narrowing_edge_interest_skips_the_kernel() {
        let mut lp = EventLoop::new().unwrap();
        let (r, w) = pipe();
        assert_eq!(unsafe { libc::write(w, b"ping".as_ptr() as *const _, 4) }, 4);

        let calls = Rc::new(Cell::new(0u32));
        let io = lp.io_init(r).unwrap();
        let seen = calls.clone();
        lp.io_start(io, Events::READABLE | Events::EDGE, move |_, _, _| {
            // Deliberately not draining: the readiness stays latent.
            seen.set(seen.get() + 1);
        });

        lp.poll_io(0);
        assert_eq!(calls.get(), 1);

        // Re-requesting interest on a committed edge-triggered watcher hands
        // the latent readiness over through the pending phase without a
        // kernel round trip.
        lp.io_start(io, Events::READABLE | Events::EDGE, {
            let seen = calls.clone();
            move |_, _, _| seen.set(seen.get() + 10)
        });
        lp.poll_io(0);
        assert_eq!(calls.get(), 1, "delivery is deferred to the pending phase");
        assert!(lp.run_pending());
        assert_eq!(calls.get(), 11);

        close_fds(&[r, w]);
    }

    #[test]
    fn stale_events_are_disarmed() {
        let mut lp = EventLoop::new().unwrap();
        let (r, w) = pipe();
        let (r2, w2) = pipe();
        assert_eq!(unsafe { libc::write(w, b"x".as_ptr() as *const _, 1) }, 1);
        assert_eq!(unsafe { libc::write(w2, b"x".as_ptr() as *const _, 1) }, 1);

        let hits = Rc::new(Cell::new(0u32));
        let io = lp.io_init(r).unwrap();
        let io2 = lp.io_init(r2).unwrap();

        // The first watcher's callback stops the second before its event is
        // dispatched; the second must never fire.
        let seen = hits.clone();
        lp.io_start(io, Events::READABLE, move |lp, _, _| {
            seen.set(seen.get() + 1);
            lp.io_stop(io2, Events::READABLE);
        });
        let seen = hits.clone();
        lp.io_start(io2, Events::READABLE, move |_, _, _| {
            seen.set(seen.get() + 100);
        });

        lp.poll_io(0);
        assert_eq!(hits.get(), 1);

        close_fds(&[r, w, r2, w2]);
    }

    #[test]
    #[should_panic(expected = "watched by another handle")]
    fn two_watchers_one_fd_panics() {
        let mut lp = EventLoop::new().unwrap();
        let (r, w) = pipe();
        let a = lp.io_init(r).unwrap();
        let b = lp.io_init(r).unwrap();
        lp.io_start(a, Events::READABLE, |_, _, _| {});
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            lp.io_start(b, Events::READABLE, |_, _, _| {});
        }));
        close_fds(&[r, w]);
        std::panic::resume_unwind(result.unwrap_err());
    }
}
