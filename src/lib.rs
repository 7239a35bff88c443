//!
//! # Gyre
//!
//! Gyre is a single-threaded, callback-driven event loop. It folds the
//! operating system's scattered notification facilities — readiness polling
//! of file descriptors, monotonic timers, deferred work, cross-thread
//! wakeups — behind one uniform programming model: register handles against a
//! loop, run the loop, get called back.
//!
//! The loop multiplexes readiness through [epoll](https://en.wikipedia.org/wiki/Epoll),
//! keeps its timers in an intrusive binary min-heap so arming and cancelling
//! never allocate, and suspends only inside the kernel wait. Everything else
//! runs to completion on the loop thread; the one sanctioned way in from
//! other threads is the coalescing [`AsyncSender`].
//!
//! ## Features
//!
//! * Level- and edge-triggered fd watchers with lazy kernel reconciliation.
//! * Timers with repeat intervals that catch up by whole periods instead of
//!   replaying a backlog after a stall.
//! * Idle, prepare and check hooks around every poll.
//! * A deferred close protocol: any handle can be closed from any callback,
//!   including its own.
//!
//! ## Example
//!
//! ```
//! use gyre::{EventLoop, RunMode};
//!
//! let mut lp = EventLoop::new().unwrap();
//! let t = lp.timer_init();
//! lp.timer_start(t, 10, 0, |lp, t| {
//!     lp.close(t, |_, _| {});
//! });
//! lp.run(RunMode::Default);
//! ```

#[cfg(not(any(
    target_os = "linux",   // epoll
    target_os = "android", // epoll
    target_os = "illumos", // epoll
)))]
compile_error!("Target OS is not supported");

mod event_loop;
mod handle;
mod heap;
mod loop_watcher;
mod timer;
mod waker;
mod watcher;
/// Loop construction options reside here.
pub mod config;

mod syscore {
    mod linux;
    pub(crate) use linux::*;
}

pub use config::LoopConfig;
pub use event_loop::{EventLoop, RunMode};
pub use handle::{
    AsyncHandle, CheckHandle, Handle, HandleKind, IdleHandle, IoWatcher, PrepareHandle,
    TimerHandle,
};
pub use waker::AsyncSender;
pub use watcher::Events;
