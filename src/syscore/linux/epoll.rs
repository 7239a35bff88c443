use std::io;
use std::os::unix::io::RawFd;

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

/// Interest-table operation against the kernel readiness facility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CtlOp {
    Add,
    Mod,
    Del,
}

impl CtlOp {
    fn raw(self) -> libc::c_int {
        match self {
            CtlOp::Add => libc::EPOLL_CTL_ADD,
            CtlOp::Mod => libc::EPOLL_CTL_MOD,
            CtlOp::Del => libc::EPOLL_CTL_DEL,
        }
    }
}

/// Thin owner of an epoll descriptor: create, change interest, wait, close.
#[derive(Debug)]
pub(crate) struct Poller {
    fd: RawFd,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Poller> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd != -1 {
            return Ok(Poller { fd });
        }

        // epoll_create1 can fail either because it's not implemented (old
        // kernel) or because the kernel doesn't understand EPOLL_CLOEXEC.
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ENOSYS) | Some(libc::EINVAL) => {
                let fd = syscall!(epoll_create(256))?;
                syscall!(fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
                Ok(Poller { fd })
            }
            _ => Err(err),
        }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    /// The `u64` slot of the kernel event carries the target fd back out.
    pub(crate) fn ctl(&self, op: CtlOp, fd: RawFd, events: Events) -> io::Result<()> {
        let mut ev = libc::epoll_event { events: events.bits(), u64: fd as u64 };
        syscall!(epoll_ctl(self.fd, op.raw(), fd, &mut ev))?;
        Ok(())
    }

    /// Wait for readiness. `timeout_ms` of 0 polls, -1 blocks indefinitely.
    /// Interruption by a signal surfaces as `ErrorKind::Interrupted`.
    pub(crate) fn wait(&self, buf: &mut EventBuf, timeout_ms: i32) -> io::Result<usize> {
        let n = syscall!(epoll_wait(
            self.fd,
            buf.list.as_mut_ptr(),
            buf.list.len() as libc::c_int,
            timeout_ms,
        ))?;
        buf.len = n as usize;
        Ok(buf.len)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// Reusable batch of kernel readiness events.
pub(crate) struct EventBuf {
    list: Box<[libc::epoll_event]>,
    len: usize,
}

impl EventBuf {
    pub(crate) fn new(capacity: usize) -> EventBuf {
        let event = libc::epoll_event { events: 0, u64: 0 };
        EventBuf { list: vec![event; capacity.max(1)].into_boxed_slice(), len: 0 }
    }

    pub(crate) fn get(&self, i: usize) -> (RawFd, Events) {
        debug_assert!(i < self.len);
        let ev = self.list[i];
        (ev.u64 as RawFd, Events::from_bits_truncate(ev.events))
    }
}
