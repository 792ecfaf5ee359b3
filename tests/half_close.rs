use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::{mpsc, Arc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use evio::{EventLoop, TcpServer};

mod util;

const REPLY_LEN: usize = 100 * 1024;

/// The client half-closes after a short request; the full reply must still
/// arrive, followed by the server's own EOF.
#[test]
fn half_close_delivers_the_reply() {
    util::init();

    let (addr_tx, addr_rx) = mpsc::channel();
    let got_eof = Arc::new(AtomicBool::new(false));

    let saw_eof = got_eof.clone();
    let server_thread = thread::spawn(move || {
        let mut event_loop = EventLoop::new().unwrap();
        let mut server =
            TcpServer::bind(&event_loop, "127.0.0.1:0".parse().unwrap(), "half-close").unwrap();
        server.set_connection_callback(move |conn| {
            if !conn.connected() {
                // Fires only once the read side saw the client's FIN.
                saw_eof.store(true, Ordering::SeqCst);
            }
        });
        server.set_message_callback(|conn, buf, _when| {
            if buf.readable_bytes() < 3 {
                return;
            }
            let request = buf.retrieve_all_as_bytes();
            assert_eq!(request, b"bye");
            conn.send(&vec![b'r'; REPLY_LEN]);
            // FIN follows the buffered reply, not the other way round.
            conn.shutdown();
        });
        server.start().unwrap();
        addr_tx
            .send((server.local_addr().unwrap(), event_loop.handle()))
            .unwrap();
        event_loop.run();
    });

    let (addr, server_handle) = addr_rx.recv().unwrap();

    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(b"bye").unwrap();
    stream.shutdown(Shutdown::Write).unwrap();

    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).unwrap();
    assert_eq!(reply.len(), REPLY_LEN, "reply truncated by the close");
    assert!(reply.iter().all(|&b| b == b'r'));

    assert!(util::wait_until(
        std::time::Duration::from_secs(1),
        || got_eof.load(Ordering::SeqCst)
    ));

    server_handle.quit();
    server_thread.join().unwrap();
}
