use std::mem::MaybeUninit;

/// Nanoseconds on the monotonic clock. Non-decreasing; unrelated to wall time.
pub(crate) fn hrtime() -> u64 {
    let mut ts = MaybeUninit::<libc::timespec>::uninit();
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, ts.as_mut_ptr()) };
    assert_eq!(rc, 0, "clock_gettime(CLOCK_MONOTONIC) cannot fail");
    let ts = unsafe { ts.assume_init() };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

#[cfg(test)]
mod tests {
    use super::hrtime;

    #[test]
    fn monotonic() {
        let a = hrtime();
        let b = hrtime();
        assert!(b >= a);
        assert!(a > 0);
    }
}
