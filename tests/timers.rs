use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use gyre::{EventLoop, RunMode};

#[test]
fn single_timer_fires_once_after_its_timeout() {
    let mut lp = EventLoop::new().unwrap();
    let fires = Rc::new(Cell::new(0u32));

    let started = Instant::now();
    let t = lp.timer_init();
    let count = fires.clone();
    lp.timer_start(t, 10, 0, move |_, _| count.set(count.get() + 1));

    let work_left = lp.run(RunMode::Default);

    assert!(!work_left);
    assert_eq!(fires.get(), 1);
    assert!(started.elapsed() >= Duration::from_millis(10));
}

#[test]
fn slow_repeating_callback_does_not_build_a_backlog() {
    let mut lp = EventLoop::new().unwrap();
    let fires = Rc::new(Cell::new(0u32));

    let started = Instant::now();
    let t = lp.timer_init();
    let count = fires.clone();
    lp.timer_start(t, 1, 1, move |lp, t| {
        count.set(count.get() + 1);
        // Overrun the interval fivefold; catch-up must collapse the missed
        // periods instead of replaying them.
        std::thread::sleep(Duration::from_millis(5));
        if count.get() == 3 {
            lp.timer_stop(t);
        }
    });

    lp.run(RunMode::Default);

    assert_eq!(fires.get(), 3);
    assert!(started.elapsed() >= Duration::from_millis(15));
}

#[test]
fn zero_timeout_fires_without_blocking() {
    let mut lp = EventLoop::new().unwrap();
    let fired = Rc::new(Cell::new(false));

    let t = lp.timer_init();
    let flag = fired.clone();
    lp.timer_start(t, 0, 0, move |_, _| flag.set(true));

    lp.run(RunMode::NoWait);
    assert!(fired.get());
    assert!(!lp.alive());
}

#[test]
fn once_blocks_until_the_nearest_timer() {
    let mut lp = EventLoop::new().unwrap();
    let fired = Rc::new(Cell::new(false));

    let t = lp.timer_init();
    let flag = fired.clone();
    lp.timer_start(t, 20, 0, move |_, _| flag.set(true));

    let started = Instant::now();
    // A wait may come back a hair before the deadline; embedders running
    // once-mode call it until their work is done.
    let mut work_left = lp.run(RunMode::Once);
    while work_left {
        work_left = lp.run(RunMode::Once);
    }

    assert!(fired.get());
    assert!(started.elapsed() >= Duration::from_millis(20));
}

#[test]
fn stopping_a_timer_prevents_its_callback() {
    let mut lp = EventLoop::new().unwrap();
    let fires = Rc::new(Cell::new(0u32));

    // A short keeper so the run observes a few iterations.
    let keeper = lp.timer_init();
    let t = lp.timer_init();

    let count = fires.clone();
    lp.timer_start(t, 30, 0, move |_, _| count.set(count.get() + 1));
    lp.timer_start(keeper, 5, 0, move |lp, _| lp.timer_stop(t));

    lp.run(RunMode::Default);
    assert_eq!(fires.get(), 0);
}
