//! Cross-thread wakeups.
//!
//! The one sanctioned way into a running loop from another thread. Each async
//! handle owns an eventfd registered level-triggered on its loop; a sender
//! flips an atomic and writes to the descriptor only on the idle-to-signaled
//! transition, so any number of sends between two loop iterations collapse
//! into a single callback on the loop thread.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use log::trace;

use crate::event_loop::EventLoop;
use crate::handle::{AsyncHandle, AsyncShared, AsyncState, Handle, HandleData, HandleKind};
use crate::handle::WatcherCore;
use crate::watcher::Events;

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

/// Wakes an [`AsyncHandle`]'s loop from any thread.
///
/// `send` is safe to call from any thread, any number of times; calls made
/// before the loop ran the callback coalesce into one invocation. Sending
/// after the handle was closed is a no-op.
#[derive(Debug, Clone)]
pub struct AsyncSender {
    inner: Arc<AsyncShared>,
}

impl AsyncSender {
    pub fn send(&self) {
        if self.inner.pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let fd = self.inner.fd.load(Ordering::Acquire);
        if fd < 0 {
            return;
        }
        let one: u64 = 1;
        // A full eventfd counter means a wakeup is already queued; nothing to
        // do about errors here and nothing needed.
        unsafe { libc::write(fd, &one as *const u64 as *const libc::c_void, 8) };
    }
}

impl EventLoop {
    /// Create an async handle with its callback. The handle is active from
    /// birth and keeps the loop alive until closed; the loop owns the
    /// underlying wakeup descriptor.
    pub fn async_init<F>(&mut self, cb: F) -> io::Result<AsyncHandle>
    where
        F: FnMut(&mut EventLoop, AsyncHandle) + 'static,
    {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        let shared = Arc::new(AsyncShared {
            pending: AtomicBool::new(false),
            fd: AtomicI32::new(fd),
        });
        let h = self.register_handle(
            HandleKind::Async,
            HandleData::Async(AsyncState {
                core: WatcherCore::new(fd),
                shared,
                cb: Some(Box::new(cb)),
            }),
        );
        self.io_start_raw(h, Events::READABLE);
        self.handle_start(h);
        Ok(AsyncHandle(h))
    }

    /// A cloneable sender for the handle, usable from any thread.
    pub fn async_sender(&self, a: AsyncHandle) -> AsyncSender {
        let slot = self.slot(a.0);
        match &slot.data {
            HandleData::Async(state) => AsyncSender { inner: state.shared.clone() },
            _ => panic!("handle is not an async handle"),
        }
    }

    /// Readiness on the wakeup descriptor: drain it, then deliver at most one
    /// callback for however many sends accumulated.
    pub(crate) fn async_io(&mut self, h: Handle) {
        let (fd, shared) = {
            let state = self.slots[h.index as usize].async_mut();
            (state.core.fd, state.shared.clone())
        };

        let mut buf = [0u8; 8];
        loop {
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n == buf.len() as isize {
                continue;
            }
            if n == -1 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                debug_assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
            }
            break;
        }

        if !shared.pending.swap(false, Ordering::AcqRel) {
            return;
        }
        trace!("async wakeup delivered on fd {}", fd);

        let cb = self.slots[h.index as usize].async_mut().cb.take();
        if let Some(mut cb) = cb {
            cb(self, AsyncHandle(h));
            if let Some(slot) = self.slot_if_open(h) {
                let state = slot.async_mut();
                if state.cb.is_none() {
                    state.cb = Some(cb);
                }
            }
        }
    }

    /// Close-time teardown: poison the shared fd so senders on other threads
    /// degrade to no-ops, then close the descriptor.
    pub(crate) fn async_teardown(&mut self, h: Handle) {
        let state = self.slots[h.index as usize].async_mut();
        state.shared.fd.store(-1, Ordering::Release);
        if state.core.fd >= 0 {
            unsafe { libc::close(state.core.fd) };
            state.core.fd = -1;
        }
    }
}
