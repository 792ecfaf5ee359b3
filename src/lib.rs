//! Reactor-style non-blocking TCP networking.
//!
//! evio implements the "one loop per thread" model: each operating-system
//! thread owns at most one [`EventLoop`], which multiplexes many non-blocking
//! sockets and timers through a readiness-based poller (`epoll(7)` by
//! default, `poll(2)` when `EVIO_FORCE_POLL` is set in the environment).
//! Applications register connection and message callbacks; the library
//! dispatches I/O, manages connection lifetime, buffers partial reads and
//! writes, expires timers, and marshals cross-thread work back onto the
//! owning loop.
//!
//! The user-facing pieces are:
//!
//! * [`EventLoop`] and its cloneable, `Send` counterpart [`LoopHandle`] --
//!   the dispatcher and the only legal entry point from foreign threads.
//! * [`TcpServer`] -- accepts connections and spreads them over a pool of
//!   I/O loops.
//! * [`TcpClient`] -- owns a single managed connection with optional
//!   auto-reconnect.
//! * [`TcpConnection`] -- the per-connection handle passed to callbacks;
//!   cheap to clone and usable from any thread.
//! * [`Buffer`] -- the byte buffer handed to message callbacks.
//!
//! All callbacks for a given connection run on that connection's loop
//! thread, one at a time. Callbacks must not block: the loop is cooperative
//! and a stalled callback stalls every socket on the same loop.
//!
//! # Example
//!
//! An echo server on the current thread:
//!
//! ```no_run
//! use evio::{EventLoop, TcpServer};
//!
//! let mut event_loop = EventLoop::new().unwrap();
//! let addr = "127.0.0.1:7000".parse().unwrap();
//! let mut server = TcpServer::bind(&event_loop, addr, "echo").unwrap();
//! server.set_message_callback(|conn, buf, _when| {
//!     conn.send(&buf.retrieve_all_as_bytes());
//! });
//! server.start().unwrap();
//! event_loop.run();
//! ```

#![cfg(unix)]

#[macro_use]
mod sys;

mod acceptor;
mod buffer;
mod channel;
mod client;
mod connection;
mod connector;
mod event_loop;
mod interest;
mod loop_thread;
mod poller;
mod ready;
mod server;
mod socket;
mod timer;

pub use crate::buffer::Buffer;
pub use crate::client::TcpClient;
pub use crate::connection::{
    ConnectionCallback, ConnectionState, HighWaterMarkCallback, MessageCallback, TcpConnection,
    WriteCompleteCallback,
};
pub use crate::event_loop::{EventLoop, LoopHandle};
pub use crate::loop_thread::{LoopThread, LoopThreadPool};
pub use crate::server::TcpServer;
pub use crate::timer::TimerId;
