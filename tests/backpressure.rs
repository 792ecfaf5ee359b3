use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use evio::{EventLoop, TcpServer};

mod util;

const PAYLOAD: usize = 32 * 1024 * 1024;
const HIGH_WATER_MARK: usize = 1024 * 1024;

/// A slow reader forces the payload through the output buffer: the
/// high-water mark fires exactly once on the upward crossing and
/// write-complete exactly once after the full drain.
#[test]
fn high_water_mark_and_write_complete_fire_once() {
    util::init();

    let hwm_fires = Arc::new(AtomicUsize::new(0));
    let drain_fires = Arc::new(AtomicUsize::new(0));
    let (addr_tx, addr_rx) = mpsc::channel();

    let hwm = hwm_fires.clone();
    let drains = drain_fires.clone();
    let server_thread = thread::spawn(move || {
        let mut event_loop = EventLoop::new().unwrap();
        let mut server =
            TcpServer::bind(&event_loop, "127.0.0.1:0".parse().unwrap(), "firehose").unwrap();
        server.set_connection_callback(|conn| {
            if conn.connected() {
                conn.send(&vec![b'd'; PAYLOAD]);
                // FIN once the buffer drains, so the client sees a bounded
                // stream.
                conn.shutdown();
            }
        });
        server.set_high_water_mark_callback(
            move |_conn, size| {
                assert!(size >= HIGH_WATER_MARK);
                hwm.fetch_add(1, Ordering::SeqCst);
            },
            HIGH_WATER_MARK,
        );
        server.set_write_complete_callback(move |_conn| {
            drains.fetch_add(1, Ordering::SeqCst);
        });
        server.start().unwrap();
        addr_tx
            .send((server.local_addr().unwrap(), event_loop.handle()))
            .unwrap();
        event_loop.run();
    });

    let (addr, server_handle) = addr_rx.recv().unwrap();

    let mut stream = TcpStream::connect(addr).unwrap();
    // Let the server's direct write fill the kernel buffers and spill the
    // rest into its output buffer before we start draining.
    thread::sleep(Duration::from_millis(300));
    assert_eq!(hwm_fires.load(Ordering::SeqCst), 1, "high-water mark must have crossed by now");

    let mut received = Vec::new();
    stream.read_to_end(&mut received).unwrap();
    assert_eq!(received.len(), PAYLOAD);

    assert!(util::wait_until(Duration::from_secs(1), || {
        drain_fires.load(Ordering::SeqCst) == 1
    }));
    // No downward-crossing or stationary re-fires.
    assert_eq!(hwm_fires.load(Ordering::SeqCst), 1);

    server_handle.quit();
    server_thread.join().unwrap();
}
