use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::os::fd::AsRawFd;

use evio::Buffer;
use rand::RngCore;

mod util;

const CHEAP_PREPEND: usize = 8;
const INITIAL_SIZE: usize = 1024;

#[test]
fn new_buffer_is_empty() {
    let buf = Buffer::new();
    assert_eq!(buf.readable_bytes(), 0);
    assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
    assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
}

#[test]
fn append_and_retrieve() {
    let mut buf = Buffer::new();
    buf.append(b"hello, world");
    assert_eq!(buf.readable_bytes(), 12);
    assert_eq!(buf.writable_bytes(), INITIAL_SIZE - 12);
    assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    assert_eq!(buf.peek(), b"hello, world");

    buf.retrieve(7);
    assert_eq!(buf.readable_bytes(), 5);
    assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND + 7);
    assert_eq!(buf.peek(), b"world");

    buf.retrieve_all();
    assert_eq!(buf.readable_bytes(), 0);
    assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
    assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
}

#[test]
fn append_read_identity() {
    let mut buf = Buffer::new();
    let mut data = vec![0u8; 4000];
    rand::rng().fill_bytes(&mut data);
    buf.append(&data);
    assert_eq!(buf.retrieve_all_as_bytes(), data);
}

#[test]
fn full_drain_restores_headroom() {
    let mut buf = Buffer::new();
    buf.append(&vec![b'x'; 2000]);
    buf.retrieve(1500);
    buf.retrieve(500);
    // Complete drain resets both indices.
    assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    assert_eq!(buf.readable_bytes(), 0);
}

#[test]
fn grow_shifts_before_reallocating() {
    let mut buf = Buffer::new();
    buf.append(&vec![b'a'; 800]);
    buf.retrieve(700);
    // 100 readable, plenty of dead prependable space: appending 900 must
    // fit by shifting, not reallocation.
    buf.append(&vec![b'b'; 900]);
    assert_eq!(buf.readable_bytes(), 1000);
    assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
    let mut expected = vec![b'a'; 100];
    expected.extend_from_slice(&vec![b'b'; 900]);
    assert_eq!(buf.peek(), &expected[..]);
}

#[test]
fn int_round_trips() {
    let mut buf = Buffer::new();
    for &x in &[i64::MIN, -1, 0, 1, i64::MAX] {
        buf.append_i64(x);
        assert_eq!(buf.peek_i64(), x);
        assert_eq!(buf.read_i64(), x);
    }
    for &x in &[i32::MIN, -1, 0, 1, i32::MAX] {
        buf.append_i32(x);
        assert_eq!(buf.read_i32(), x);
    }
    for &x in &[i16::MIN, -1, 0, 1, i16::MAX] {
        buf.append_i16(x);
        assert_eq!(buf.read_i16(), x);
    }
    for &x in &[i8::MIN, -1, 0, 1, i8::MAX] {
        buf.append_i8(x);
        assert_eq!(buf.read_i8(), x);
    }
    assert_eq!(buf.readable_bytes(), 0);
}

#[test]
fn ints_are_network_byte_order() {
    let mut buf = Buffer::new();
    buf.append_i32(0x0102_0304);
    assert_eq!(buf.peek(), &[1, 2, 3, 4]);

    buf.retrieve_all();
    buf.append_i16(0x0102);
    buf.append_i64(0x0102_0304_0506_0708);
    assert_eq!(buf.read_i16(), 0x0102);
    assert_eq!(buf.read_i64(), 0x0102_0304_0506_0708);
}

#[test]
fn prepend_header() {
    let mut buf = Buffer::new();
    buf.append(&vec![b'p'; 200]);
    assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);

    buf.prepend_i32(200);
    assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND - 4);
    assert_eq!(buf.readable_bytes(), 204);
    // The length header leads in network byte order.
    assert_eq!(&buf.peek()[..4], &[0, 0, 0, 200]);
    assert_eq!(buf.read_i32(), 200);
    assert_eq!(buf.peek(), &vec![b'p'; 200][..]);
}

#[test]
fn read_fd_fills_writable_region() {
    util::init();
    let (stream, mut peer) = loopback_pair();

    peer.write_all(b"hello from the peer").unwrap();

    let mut buf = Buffer::new();
    let mut total = 0;
    while total < 19 {
        total += buf.read_fd(stream.as_raw_fd()).unwrap();
    }
    assert_eq!(buf.peek(), b"hello from the peer");
}

#[test]
fn read_fd_overflow_spills_and_grows() {
    util::init();
    let (stream, mut peer) = loopback_pair();

    let mut data = vec![0u8; 4000];
    rand::rng().fill_bytes(&mut data);
    peer.write_all(&data).unwrap();

    // Only 64 writable bytes up front: the bulk must land in the stack
    // spillover and be appended.
    let mut buf = Buffer::with_capacity(64);
    while buf.readable_bytes() < data.len() {
        buf.read_fd(stream.as_raw_fd()).unwrap();
    }
    assert_eq!(buf.peek(), &data[..]);
}

#[test]
fn read_fd_sees_eof() {
    util::init();
    let (stream, mut peer) = loopback_pair();

    peer.write_all(b"bye").unwrap();
    drop(peer);

    let mut buf = Buffer::new();
    let mut total = 0;
    loop {
        let n = buf.read_fd(stream.as_raw_fd()).unwrap();
        if n == 0 {
            break;
        }
        total += n;
    }
    assert_eq!(total, 3);
    assert_eq!(buf.peek(), b"bye");
}

/// A connected blocking stream pair over loopback.
fn loopback_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let peer = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (stream, _) = listener.accept().unwrap();
    (stream, peer)
}
