use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use evio::{EventLoop, TcpServer};

mod util;

const CLIENTS: usize = 8;
const ROUNDS: usize = 1000;
const MESSAGE: &[u8] = b"hello\n";

#[test]
fn echo_round_trips_every_byte() {
    util::init();

    let conn_count = Arc::new(AtomicI64::new(0));
    let (addr_tx, addr_rx) = mpsc::channel();

    let count = conn_count.clone();
    let server_thread = thread::spawn(move || {
        let mut event_loop = EventLoop::new().unwrap();
        let mut server =
            TcpServer::bind(&event_loop, "127.0.0.1:0".parse().unwrap(), "echo").unwrap();
        server.set_io_threads(2);
        server.set_connection_callback(move |conn| {
            if conn.connected() {
                count.fetch_add(1, Ordering::SeqCst);
            } else {
                count.fetch_sub(1, Ordering::SeqCst);
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

    let clients: Vec<_> = (0..CLIENTS)
        .map(|_| {
            thread::spawn(move || {
                let mut stream = TcpStream::connect(addr).unwrap();
                let mut reply = [0u8; MESSAGE.len()];
                for _ in 0..ROUNDS {
                    stream.write_all(MESSAGE).unwrap();
                    stream.read_exact(&mut reply).unwrap();
                    assert_eq!(reply, MESSAGE);
                }
            })
        })
        .collect();
    for client in clients {
        client.join().unwrap();
    }

    // Every client has closed; the server must notice within a second.
    assert!(
        util::wait_until(Duration::from_secs(1), || {
            conn_count.load(Ordering::SeqCst) == 0
        }),
        "{} connections still registered",
        conn_count.load(Ordering::SeqCst)
    );

    server_handle.quit();
    server_thread.join().unwrap();
}
