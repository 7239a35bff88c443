use std::cell::{Cell, RefCell};
use std::os::unix::io::RawFd;
use std::rc::Rc;

use gyre::{EventLoop, Events, RunMode};

fn pipe() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    (fds[0], fds[1])
}

fn write_all(fd: RawFd, bytes: &[u8]) {
    let n = unsafe { libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
    assert_eq!(n, bytes.len() as isize);
}

/// Read until the nonblocking descriptor runs dry; the edge-triggered
/// contract.
fn drain(fd: RawFd) -> usize {
    let mut total = 0;
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n <= 0 {
            break;
        }
        total += n as usize;
    }
    total
}

fn close_fds(fds: &[RawFd]) {
    for &fd in fds {
        unsafe { libc::close(fd) };
    }
}

#[test]
fn edge_triggered_reader_sees_each_burst() {
    let mut lp = EventLoop::new().unwrap();
    let (r, w) = pipe();

    // First burst is already in the pipe when the watcher registers.
    write_all(w, b"ping");

    let callbacks = Rc::new(Cell::new(0u32));
    let drained = Rc::new(Cell::new(0usize));

    let io = lp.io_init(r).unwrap();
    let calls = callbacks.clone();
    let total = drained.clone();
    lp.io_start(io, Events::READABLE | Events::EDGE, move |lp, io, ev| {
        assert!(ev.contains(Events::READABLE));
        calls.set(calls.get() + 1);
        total.set(total.get() + drain(r));
        if total.get() == 8 {
            lp.io_stop(io, Events::READABLE | Events::EDGE);
        }
    });

    // Second burst arrives 50 ms later.
    let t = lp.timer_init();
    lp.timer_start(t, 50, 0, move |_, _| write_all(w, b"pong"));

    lp.run(RunMode::Default);

    assert!(callbacks.get() >= 2, "one callback per burst at least");
    assert_eq!(drained.get(), 8);
    close_fds(&[r, w]);
}

#[test]
fn phases_run_in_order_within_an_iteration() {
    let mut lp = EventLoop::new().unwrap();
    let (r, w) = pipe();
    write_all(w, b"x");

    let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

    let io = lp.io_init(r).unwrap();
    let prepare = lp.prepare_init();
    let check = lp.check_init();

    let seen = order.clone();
    lp.prepare_start(prepare, move |lp, p| {
        seen.borrow_mut().push("prepare");
        lp.prepare_stop(p);
    });
    let seen = order.clone();
    lp.io_start(io, Events::READABLE, move |lp, io, _| {
        seen.borrow_mut().push("io");
        drain(r);
        lp.io_stop(io, Events::READABLE);
    });
    let seen = order.clone();
    lp.check_start(check, move |lp, c| {
        seen.borrow_mut().push("check");
        lp.check_stop(c);
    });

    lp.run(RunMode::Once);

    assert_eq!(*order.borrow(), vec!["prepare", "io", "check"]);
    assert!(!lp.alive());
    close_fds(&[r, w]);
}

#[test]
fn watcher_started_in_prepare_polls_the_same_iteration() {
    let mut lp = EventLoop::new().unwrap();
    let (r, w) = pipe();
    write_all(w, b"early");

    let got_io = Rc::new(Cell::new(false));

    let io = lp.io_init(r).unwrap();
    let prepare = lp.prepare_init();

    let flag = got_io.clone();
    lp.prepare_start(prepare, move |lp, p| {
        let flag = flag.clone();
        lp.io_start(io, Events::READABLE, move |lp, io, _| {
            flag.set(true);
            drain(r);
            lp.io_stop(io, Events::READABLE);
        });
        lp.prepare_stop(p);
    });

    lp.run(RunMode::Once);

    assert!(got_io.get(), "interest registered in prepare reaches the same poll");
    close_fds(&[r, w]);
}

#[test]
fn writable_reported_level_triggered() {
    let mut lp = EventLoop::new().unwrap();
    let (r, w) = pipe();

    let fired = Rc::new(Cell::new(Events::empty()));
    let io = lp.io_init(w).unwrap();
    let seen = fired.clone();
    lp.io_start(io, Events::WRITABLE, move |lp, io, ev| {
        seen.set(ev);
        lp.io_stop(io, Events::WRITABLE);
    });

    lp.run(RunMode::Default);
    assert!(fired.get().contains(Events::WRITABLE));
    close_fds(&[r, w]);
}

#[test]
fn hangup_is_delivered_unrequested() {
    let mut lp = EventLoop::new().unwrap();
    let (r, w) = pipe();
    write_all(w, b"bye");
    unsafe { libc::close(w) };

    let seen = Rc::new(Cell::new(Events::empty()));
    let io = lp.io_init(r).unwrap();
    let got = seen.clone();
    lp.io_start(io, Events::READABLE, move |lp, io, ev| {
        got.set(got.get() | ev);
        if ev.contains(Events::HANGUP) {
            drain(r);
            lp.io_stop(io, Events::READABLE);
        }
    });

    lp.run(RunMode::Default);
    assert!(seen.get().contains(Events::READABLE));
    assert!(seen.get().contains(Events::HANGUP));
    close_fds(&[r]);
}
