//! Runs a loop against the `poll(2)` backend. This file is its own test
//! process, so forcing the backend through the environment cannot leak
//! into other tests.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::rc::Rc;
use std::cell::Cell;
use std::sync::{mpsc, Arc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use evio::{EventLoop, TcpServer};

mod util;

#[test]
fn poll_backend_serves_and_times() {
    std::env::set_var("EVIO_FORCE_POLL", "1");
    util::init();

    // Timers ride the same dispatch path as sockets.
    {
        let mut event_loop = EventLoop::new().unwrap();
        let fired = Rc::new(Cell::new(false));
        let flag = fired.clone();
        event_loop.run_after(Duration::from_millis(20), move || flag.set(true));
        let handle = event_loop.handle();
        event_loop.run_after(Duration::from_millis(60), move || handle.quit());
        event_loop.run();
        assert!(fired.get());
    }

    let saw_disconnect = Arc::new(AtomicBool::new(false));
    let (addr_tx, addr_rx) = mpsc::channel();

    let down = saw_disconnect.clone();
    let server_thread = thread::spawn(move || {
        let mut event_loop = EventLoop::new().unwrap();
        let mut server =
            TcpServer::bind(&event_loop, "127.0.0.1:0".parse().unwrap(), "poll-echo").unwrap();
        server.set_connection_callback(move |conn| {
            if !conn.connected() {
                down.store(true, Ordering::SeqCst);
            }
        });
        server.set_message_callback(|conn, buf, _when| {
            conn.send(&buf.retrieve_all_as_bytes());
        });
        server.start().unwrap();
        addr_tx
            .send((server.local_addr().unwrap(), event_loop.handle()))
            .unwrap();
        event_loop.run();
    });
    let (addr, server_handle) = addr_rx.recv().unwrap();

    let mut stream = TcpStream::connect(addr).unwrap();
    let mut reply = [0u8; 4];
    for _ in 0..100 {
        stream.write_all(b"ekko").unwrap();
        stream.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"ekko");
    }
    drop(stream);

    assert!(util::wait_until(Duration::from_secs(1), || {
        saw_disconnect.load(Ordering::SeqCst)
    }));

    server_handle.quit();
    server_thread.join().unwrap();
}
