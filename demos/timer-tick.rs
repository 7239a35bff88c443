use gyre::{EventLoop, RunMode};

fn main() -> std::io::Result<()> {
    env_logger::init();

    let mut lp = EventLoop::new()?;
    let t = lp.timer_init();

    let mut ticks = 0u32;
    lp.timer_start(t, 100, 100, move |lp, t| {
        ticks += 1;
        println!("tick {} at {} ns", ticks, lp.now());
        if ticks == 10 {
            lp.close(t, |_, _| println!("done"));
        }
    });

    lp.run(RunMode::Default);
    Ok(())
}
