use std::os::unix::io::RawFd;

use gyre::{EventLoop, Events, RunMode};

fn main() -> std::io::Result<()> {
    env_logger::init();

    let mut fds = [0 as RawFd; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let (r, w) = (fds[0], fds[1]);

    let mut lp = EventLoop::new()?;

    // Edge-triggered reader: drain completely on every callback.
    let io = lp.io_init(r)?;
    lp.io_start(io, Events::READABLE | Events::EDGE, move |lp, io, ev| {
        let mut buf = [0u8; 256];
        let mut total = 0;
        loop {
            let n = unsafe { libc::read(r, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n <= 0 {
                break;
            }
            total += n as usize;
        }
        println!("{:?}: drained {} bytes", ev, total);
        if ev.contains(Events::HANGUP) {
            lp.io_stop(io, Events::READABLE | Events::EDGE);
        }
    });

    // A few bursts from a timer, then hang up.
    let t = lp.timer_init();
    let mut bursts = 0u32;
    lp.timer_start(t, 50, 50, move |lp, t| {
        bursts += 1;
        if bursts <= 3 {
            unsafe { libc::write(w, b"burst".as_ptr() as *const libc::c_void, 5) };
        } else {
            unsafe { libc::close(w) };
            lp.close(t, |_, _| {});
        }
    });

    lp.run(RunMode::Default);
    unsafe { libc::close(r) };
    Ok(())
}
