//! Handle identifiers and per-handle state.
//!
//! Handles live in a slab owned by their loop; callers hold small copyable
//! ids. Each slot carries a generation stamp so an id that outlived its
//! handle (the slot was freed by the close protocol and possibly reused) is
//! caught instead of silently addressing a stranger.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32};
use std::sync::Arc;

use crate::event_loop::EventLoop;
use crate::heap::HeapNode;
use crate::watcher::Events;

/// Untyped handle id. Every typed handle converts into one of these; `close`
/// and the close callback work at this level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    pub(crate) index: u32,
    pub(crate) gen: u32,
}

macro_rules! typed_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub(crate) Handle);

        impl From<$name> for Handle {
            fn from(h: $name) -> Handle {
                h.0
            }
        }
    };
}

typed_handle! {
    /// A watcher over a caller-owned file descriptor.
    IoWatcher
}
typed_handle! {
    /// A monotonic-clock timer.
    TimerHandle
}
typed_handle! {
    /// Runs every iteration before blocking; an active idle handle keeps the
    /// poll timeout at zero.
    IdleHandle
}
typed_handle! {
    /// Runs every iteration right before the loop polls for readiness.
    PrepareHandle
}
typed_handle! {
    /// Runs every iteration right after the loop polled for readiness.
    CheckHandle
}
typed_handle! {
    /// Receiver side of a cross-thread wakeup; see [`crate::AsyncSender`].
    AsyncHandle
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Io,
    Timer,
    Idle,
    Prepare,
    Check,
    Async,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct HandleFlags: u8 {
        const ACTIVE = 1 << 0;
        const CLOSING = 1 << 1;
        const CLOSED = 1 << 2;
    }
}

pub(crate) type IoCb = Box<dyn FnMut(&mut EventLoop, IoWatcher, Events)>;
pub(crate) type TimerCb = Box<dyn FnMut(&mut EventLoop, TimerHandle)>;
pub(crate) type LoopWatcherCb = Box<dyn FnMut(&mut EventLoop, Handle)>;
pub(crate) type AsyncCb = Box<dyn FnMut(&mut EventLoop, AsyncHandle)>;
pub(crate) type CloseCb = Box<dyn FnOnce(&mut EventLoop, Handle)>;

/// Registration state shared by everything that observes a file descriptor.
///
/// `events` is what the kernel currently watches, `levents` what the handle
/// asked for; the two are reconciled at the top of the poll phase. `revents`
/// holds readiness the kernel reported but nobody consumed yet.
#[derive(Debug)]
pub(crate) struct WatcherCore {
    pub(crate) fd: RawFd,
    pub(crate) events: Events,
    pub(crate) levents: Events,
    pub(crate) revents: Events,
    pub(crate) pending_events: Events,
    pub(crate) in_watcher_queue: bool,
    pub(crate) in_pending_queue: bool,
}

impl WatcherCore {
    pub(crate) fn new(fd: RawFd) -> WatcherCore {
        WatcherCore {
            fd,
            events: Events::empty(),
            levents: Events::empty(),
            revents: Events::empty(),
            pending_events: Events::empty(),
            in_watcher_queue: false,
            in_pending_queue: false,
        }
    }
}

pub(crate) struct IoState {
    pub(crate) core: WatcherCore,
    pub(crate) cb: Option<IoCb>,
}

pub(crate) struct TimerState {
    pub(crate) heap_node: HeapNode,
    pub(crate) expiry: u64,
    pub(crate) repeat: u64,
    pub(crate) start_id: u64,
    pub(crate) cb: Option<TimerCb>,
}

pub(crate) struct LoopWatcherState {
    pub(crate) queued: bool,
    pub(crate) cb: Option<LoopWatcherCb>,
}

/// State shared with [`crate::AsyncSender`]s on other threads. `fd` is
/// poisoned to -1 when the handle closes so late senders degrade to no-ops.
#[derive(Debug)]
pub(crate) struct AsyncShared {
    pub(crate) pending: AtomicBool,
    pub(crate) fd: AtomicI32,
}

pub(crate) struct AsyncState {
    pub(crate) core: WatcherCore,
    pub(crate) shared: Arc<AsyncShared>,
    pub(crate) cb: Option<AsyncCb>,
}

impl Drop for AsyncState {
    fn drop(&mut self) {
        if self.core.fd >= 0 {
            unsafe { libc::close(self.core.fd) };
            self.core.fd = -1;
        }
    }
}

pub(crate) enum HandleData {
    Io(IoState),
    Timer(TimerState),
    LoopWatcher(LoopWatcherState),
    Async(AsyncState),
}

pub(crate) struct HandleSlot {
    pub(crate) gen: u32,
    pub(crate) kind: HandleKind,
    pub(crate) flags: HandleFlags,
    pub(crate) data: HandleData,
    pub(crate) close_cb: Option<CloseCb>,
}

impl HandleSlot {
    pub(crate) fn is_closing(&self) -> bool {
        self.flags.intersects(HandleFlags::CLOSING | HandleFlags::CLOSED)
    }

    pub(crate) fn watcher_core(&self) -> &WatcherCore {
        match &self.data {
            HandleData::Io(s) => &s.core,
            HandleData::Async(s) => &s.core,
            _ => panic!("handle does not watch a file descriptor"),
        }
    }

    pub(crate) fn watcher_core_mut(&mut self) -> &mut WatcherCore {
        match &mut self.data {
            HandleData::Io(s) => &mut s.core,
            HandleData::Async(s) => &mut s.core,
            _ => panic!("handle does not watch a file descriptor"),
        }
    }

    pub(crate) fn io_mut(&mut self) -> &mut IoState {
        match &mut self.data {
            HandleData::Io(s) => s,
            _ => panic!("handle is not an io watcher"),
        }
    }

    pub(crate) fn timer(&self) -> &TimerState {
        match &self.data {
            HandleData::Timer(s) => s,
            _ => panic!("handle is not a timer"),
        }
    }

    pub(crate) fn timer_mut(&mut self) -> &mut TimerState {
        match &mut self.data {
            HandleData::Timer(s) => s,
            _ => panic!("handle is not a timer"),
        }
    }

    pub(crate) fn loop_watcher_mut(&mut self) -> &mut LoopWatcherState {
        match &mut self.data {
            HandleData::LoopWatcher(s) => s,
            _ => panic!("handle is not a loop watcher"),
        }
    }

    pub(crate) fn async_mut(&mut self) -> &mut AsyncState {
        match &mut self.data {
            HandleData::Async(s) => s,
            _ => panic!("handle is not an async handle"),
        }
    }
}
