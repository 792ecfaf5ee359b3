use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use evio::{EventLoop, LoopThread, TcpClient, TcpServer};

mod util;

/// Everything on one loop: echo server plus managed client.
#[test]
fn client_round_trip_and_graceful_disconnect() {
    util::init();

    let mut event_loop = EventLoop::new().unwrap();
    let mut server = TcpServer::bind(&event_loop, "127.0.0.1:0".parse().unwrap(), "echo").unwrap();
    server.set_message_callback(|conn, buf, _when| {
        conn.send(&buf.retrieve_all_as_bytes());
    });
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let client = TcpClient::new(event_loop.handle(), addr, "client");
    client.set_connection_callback(|conn| {
        if conn.connected() {
            conn.send(b"ping");
        }
    });
    let sink = received.clone();
    let quitter = event_loop.handle();
    client.set_message_callback(move |conn, buf, _when| {
        sink.lock().unwrap().extend_from_slice(buf.peek());
        buf.retrieve_all();
        if sink.lock().unwrap().len() >= 4 {
            conn.shutdown();
            quitter.quit();
        }
    });
    client.connect();

    event_loop.run();
    assert_eq!(&*received.lock().unwrap(), b"ping");
}

/// Dropping a client that still owns a live connection force-closes it;
/// the server notices promptly.
#[test]
fn drop_force_closes_a_live_connection() {
    util::init();

    let conn_count = Arc::new(AtomicI64::new(0));
    let (addr_tx, addr_rx) = mpsc::channel();

    let count = conn_count.clone();
    let server_thread = thread::spawn(move || {
        let mut event_loop = EventLoop::new().unwrap();
        let mut server =
            TcpServer::bind(&event_loop, "127.0.0.1:0".parse().unwrap(), "droppee").unwrap();
        server.set_connection_callback(move |conn| {
            if conn.connected() {
                count.fetch_add(1, Ordering::SeqCst);
            } else {
                count.fetch_sub(1, Ordering::SeqCst);
            }
        });
        server.start().unwrap();
        addr_tx
            .send((server.local_addr().unwrap(), event_loop.handle()))
            .unwrap();
        event_loop.run();
    });
    let (addr, server_handle) = addr_rx.recv().unwrap();

    let loop_thread = LoopThread::spawn("client").unwrap();
    let client = TcpClient::new(loop_thread.handle(), addr, "dropper");
    client.connect();
    assert!(util::wait_until(Duration::from_secs(2), || {
        conn_count.load(Ordering::SeqCst) == 1
    }));
    assert!(client.connection().is_some());

    drop(client);
    assert!(
        util::wait_until(Duration::from_secs(1), || {
            conn_count.load(Ordering::SeqCst) == 0
        }),
        "connection survived the client drop"
    );

    server_handle.quit();
    server_thread.join().unwrap();
}

/// With retry enabled the client re-runs its connector every time the
/// server hangs up on it.
#[test]
fn client_reconnects_after_server_close() {
    util::init();

    let (addr_tx, addr_rx) = mpsc::channel();
    let server_thread = thread::spawn(move || {
        let mut event_loop = EventLoop::new().unwrap();
        let mut server =
            TcpServer::bind(&event_loop, "127.0.0.1:0".parse().unwrap(), "bouncer").unwrap();
        // Hang up on every connection as soon as it lands.
        server.set_connection_callback(|conn| {
            if conn.connected() {
                conn.shutdown();
            }
        });
        server.start().unwrap();
        addr_tx
            .send((server.local_addr().unwrap(), event_loop.handle()))
            .unwrap();
        event_loop.run();
    });
    let (addr, server_handle) = addr_rx.recv().unwrap();

    let loop_thread = LoopThread::spawn("client").unwrap();
    let ups = Arc::new(AtomicUsize::new(0));
    let client = TcpClient::new(loop_thread.handle(), addr, "comeback");
    client.enable_retry();
    let count = ups.clone();
    client.set_connection_callback(move |conn| {
        if conn.connected() {
            count.fetch_add(1, Ordering::SeqCst);
        }
    });
    client.connect();

    assert!(
        util::wait_until(Duration::from_secs(3), || ups.load(Ordering::SeqCst) >= 2),
        "only {} connect(s)",
        ups.load(Ordering::SeqCst)
    );

    client.stop();
    drop(client);
    server_handle.quit();
    server_thread.join().unwrap();
}
