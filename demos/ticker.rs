//! Count a `Ticker` to 10, then exit the loop from inside its own
//! callback — the smallest complete example of starting a source, having
//! it rearm itself, and tearing the loop down again.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use reactora::{Config, Loop, Ticker};

fn main() {
    env_logger::init();

    let lp = Loop::new(Config::new()).expect("failed to build loop");
    let count = Arc::new(AtomicUsize::new(0));

    let count_for_cb = Arc::clone(&count);
    let loop_for_cb = lp.clone();
    let ticker = Ticker::new(50_000, move || {
        let n = count_for_cb.fetch_add(1, Ordering::SeqCst) + 1;
        println!("tick {n}");
        if n >= 10 {
            loop_for_cb.exit();
        }
    });

    ticker.start(&lp).expect("failed to start ticker");
    lp.run();

    println!("stopped after {} ticks", count.load(Ordering::SeqCst));
}
