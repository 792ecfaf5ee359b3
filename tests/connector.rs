use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use evio::{LoopThread, TcpClient};

mod util;

/// Binds and immediately releases a loopback port, leaving an address with
/// nothing listening behind it.
fn dead_addr() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

#[test]
fn connect_retries_after_the_initial_delay() {
    util::init();

    let addr = dead_addr();
    let loop_thread = LoopThread::spawn("backoff").unwrap();
    let connected = Arc::new(AtomicBool::new(false));

    let client = TcpClient::new(loop_thread.handle(), addr, "backoff");
    let flag = connected.clone();
    client.set_connection_callback(move |conn| {
        if conn.connected() {
            flag.store(true, Ordering::SeqCst);
        }
    });

    let start = Instant::now();
    client.connect();

    // The first attempt fails against the dead port. Bring a listener up
    // before the ~500 ms retry; only the retry can succeed.
    thread::sleep(Duration::from_millis(150));
    assert!(!connected.load(Ordering::SeqCst));
    let _listener = TcpListener::bind(addr).unwrap();

    assert!(util::wait_until(Duration::from_secs(3), || {
        connected.load(Ordering::SeqCst)
    }));
    let elapsed = start.elapsed();
    assert!(
        elapsed >= Duration::from_millis(400),
        "connected after {:?}, before the retry delay",
        elapsed
    );

    client.stop();
}

#[test]
fn stop_halts_retries() {
    util::init();

    let addr = dead_addr();
    let loop_thread = LoopThread::spawn("stopper").unwrap();
    let connected = Arc::new(AtomicBool::new(false));

    let client = TcpClient::new(loop_thread.handle(), addr, "stopper");
    let flag = connected.clone();
    client.set_connection_callback(move |conn| {
        if conn.connected() {
            flag.store(true, Ordering::SeqCst);
        }
    });

    client.connect();
    thread::sleep(Duration::from_millis(100));
    client.stop();

    // Even with a willing server the stopped connector must not proceed.
    let _listener = TcpListener::bind(addr).unwrap();
    assert!(!util::wait_until(Duration::from_millis(1500), || {
        connected.load(Ordering::SeqCst)
    }));
}
