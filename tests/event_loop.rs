use std::cell::Cell;
use std::rc::Rc;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use evio::{EventLoop, LoopThread};

mod util;

#[test]
fn run_in_loop_is_immediate_on_loop_thread() {
    util::init();
    let event_loop = EventLoop::new().unwrap();
    let ran = Rc::new(Cell::new(false));

    let flag = ran.clone();
    event_loop.run_in_loop(move || flag.set(true));
    assert!(ran.get(), "must run before returning, no dispatch needed");
}

#[test]
fn queued_task_runs_at_the_iteration_tail() {
    util::init();
    let mut event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();
    let ran = Rc::new(Cell::new(false));

    // The timer wakes the poll; its callback queues work which must run in
    // the same iteration's drain phase, before the loop can block again.
    let flag = ran.clone();
    let queuer = handle.clone();
    event_loop.run_after(Duration::from_millis(10), move || {
        let flag = flag.clone();
        let quitter = queuer.clone();
        queuer.queue_in_loop(move || {
            flag.set(true);
            quitter.quit();
        });
    });

    let start = Instant::now();
    event_loop.run();
    assert!(ran.get());
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn cross_thread_posts_keep_their_order() {
    util::init();
    let mut event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();
    let order = Arc::new(Mutex::new(Vec::new()));

    let poster = {
        let handle = handle.clone();
        let order = order.clone();
        thread::spawn(move || {
            for i in 0..100 {
                let order = order.clone();
                handle.queue_in_loop(move || order.lock().unwrap().push(i));
            }
            let quitter = handle.clone();
            handle.queue_in_loop(move || quitter.quit());
        })
    };

    event_loop.run();
    poster.join().unwrap();

    let order = order.lock().unwrap();
    assert_eq!(*order, (0..100).collect::<Vec<_>>());
}

#[test]
fn foreign_post_wakes_a_blocked_loop() {
    util::init();
    let loop_thread = LoopThread::spawn("wakeup-test").unwrap();
    // Give the loop time to block in the kernel with the 10 s poll timeout.
    thread::sleep(Duration::from_millis(50));

    let (tx, rx) = mpsc::channel();
    let start = Instant::now();
    loop_thread.handle().queue_in_loop(move || {
        let _ = tx.send(());
    });
    rx.recv_timeout(Duration::from_secs(2))
        .expect("posted task never ran");
    // Far below the poll interval: only the wakeup channel explains it.
    assert!(start.elapsed() < Duration::from_millis(500));
}

#[test]
fn quit_from_another_thread_stops_the_loop() {
    util::init();
    let mut event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();

    let quitter = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        handle.quit();
    });

    let start = Instant::now();
    event_loop.run();
    assert!(start.elapsed() < Duration::from_secs(5));
    quitter.join().unwrap();
}

#[test]
fn tasks_queued_while_draining_run_promptly() {
    util::init();
    let mut event_loop = EventLoop::new().unwrap();
    let handle = event_loop.handle();
    let second_ran_at = Arc::new(Mutex::new(None));

    // A timer queues the first task; the first task queues a second one
    // mid-drain. The drain-time wakeup rule must get the second dispatched
    // well before a poll interval passes.
    let when = second_ran_at.clone();
    let inner_handle = handle.clone();
    let start = Instant::now();
    event_loop.run_after(Duration::from_millis(10), move || {
        let when = when.clone();
        let handle = inner_handle.clone();
        inner_handle.queue_in_loop(move || {
            let when = when.clone();
            let quitter = handle.clone();
            handle.queue_in_loop(move || {
                *when.lock().unwrap() = Some(start.elapsed());
                quitter.quit();
            });
        });
    });

    event_loop.run();
    let elapsed = second_ran_at.lock().unwrap().expect("second task never ran");
    assert!(elapsed < Duration::from_secs(1), "took {:?}", elapsed);
}

#[test]
fn two_loops_on_one_thread_panic() {
    util::init();
    let result = thread::spawn(|| {
        let _first = EventLoop::new().unwrap();
        let _second = EventLoop::new();
    })
    .join();
    assert!(result.is_err(), "second loop on the thread must panic");
}

#[test]
fn loop_slot_frees_up_after_drop() {
    util::init();
    {
        let _event_loop = EventLoop::new().unwrap();
    }
    // The previous loop is gone; a new one may claim the thread.
    let _event_loop = EventLoop::new().unwrap();
}
