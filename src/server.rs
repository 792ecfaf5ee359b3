use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use log::info;

use crate::acceptor::Acceptor;
use crate::buffer::Buffer;
use crate::connection::{
    default_connection_callback, default_message_callback, CloseCallback, ConnCore,
    ConnectionCallback, ConnectionCallbacks, ConnShared, HighWaterMarkCallback, MessageCallback,
    TcpConnection, WriteCompleteCallback,
};
use crate::event_loop::{EventLoop, LoopInner, Token};
use crate::loop_thread::LoopThreadPool;
use crate::sys::net;

/// A TCP server: accepts connections on a base loop and spreads them over
/// a pool of I/O loops.
///
/// The server lives on its base loop's thread: construct it, configure the
/// callbacks and thread count, then `start` it and run the loop. Each new
/// connection is named `"{server}-#{n}"`, assigned an I/O loop round-robin
/// (the base loop when the pool is empty) and registered in a name-keyed
/// map on the base loop; the map needs no lock because only the base loop
/// touches it.
pub struct TcpServer {
    core: Rc<ServerCore>,
}

struct ServerCore {
    base: Rc<LoopInner>,
    // This core's key in the base loop's slot registry; close callbacks
    // carry it across threads.
    self_token: Cell<Option<Token>>,
    name: String,
    acceptor: Rc<Acceptor>,
    pool: RefCell<LoopThreadPool>,
    num_threads: Cell<usize>,
    connections: RefCell<HashMap<String, TcpConnection>>,
    next_conn_id: Cell<u64>,
    started: Cell<bool>,
    callbacks: RefCell<Callbacks>,
}

struct Callbacks {
    connection: ConnectionCallback,
    message: MessageCallback,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<(HighWaterMarkCallback, usize)>,
}

impl TcpServer {
    /// Binds the listening socket on `event_loop`, which becomes the base
    /// loop. The listen itself happens in [`start`](TcpServer::start).
    pub fn bind(event_loop: &EventLoop, addr: SocketAddr, name: &str) -> io::Result<TcpServer> {
        let base = event_loop.inner().clone();
        let acceptor = Acceptor::new(base.clone(), &addr)?;
        let core = Rc::new(ServerCore {
            base: base.clone(),
            self_token: Cell::new(None),
            name: name.to_owned(),
            acceptor,
            pool: RefCell::new(LoopThreadPool::new(base.handle())),
            num_threads: Cell::new(0),
            connections: RefCell::new(HashMap::new()),
            next_conn_id: Cell::new(0),
            started: Cell::new(false),
            callbacks: RefCell::new(Callbacks {
                connection: Arc::new(default_connection_callback),
                message: Arc::new(default_message_callback),
                write_complete: None,
                high_water_mark: None,
            }),
        });
        core.self_token.set(Some(base.register_slot(core.clone())));

        let weak = Rc::downgrade(&core);
        core.acceptor
            .set_new_connection_callback(move |fd, peer_addr| {
                if let Some(core) = weak.upgrade() {
                    core.new_connection(fd, peer_addr);
                }
            });
        Ok(TcpServer { core })
    }

    /// The actual listening address; useful after binding port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.core.acceptor.local_addr()
    }

    /// Number of I/O loops to spawn in [`start`](TcpServer::start).
    /// 0 (the default) handles every connection on the base loop.
    pub fn set_io_threads(&mut self, num_threads: usize) {
        assert!(!self.core.started.get());
        self.core.num_threads.set(num_threads);
    }

    pub fn set_connection_callback(
        &mut self,
        callback: impl Fn(&TcpConnection) + Send + Sync + 'static,
    ) {
        self.core.callbacks.borrow_mut().connection = Arc::new(callback);
    }

    pub fn set_message_callback(
        &mut self,
        callback: impl Fn(&TcpConnection, &mut Buffer, Instant) + Send + Sync + 'static,
    ) {
        self.core.callbacks.borrow_mut().message = Arc::new(callback);
    }

    pub fn set_write_complete_callback(
        &mut self,
        callback: impl Fn(&TcpConnection) + Send + Sync + 'static,
    ) {
        self.core.callbacks.borrow_mut().write_complete = Some(Arc::new(callback));
    }

    /// `callback` fires when a connection's output buffer grows across
    /// `mark` bytes, exactly once per upward crossing.
    pub fn set_high_water_mark_callback(
        &mut self,
        callback: impl Fn(&TcpConnection, usize) + Send + Sync + 'static,
        mark: usize,
    ) {
        self.core.callbacks.borrow_mut().high_water_mark = Some((Arc::new(callback), mark));
    }

    /// Spawns the I/O pool and starts listening. Idempotent.
    pub fn start(&mut self) -> io::Result<()> {
        self.core.base.assert_in_loop_thread();
        if self.core.started.get() {
            return Ok(());
        }
        self.core.started.set(true);
        self.core
            .pool
            .borrow_mut()
            .start(self.core.num_threads.get(), &self.core.name)?;
        assert!(!self.core.acceptor.listening());
        self.core.acceptor.listen()
    }

    /// How many connections are currently registered. Base loop thread
    /// only.
    pub fn connection_count(&self) -> usize {
        self.core.base.assert_in_loop_thread();
        self.core.connections.borrow().len()
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        let connections = std::mem::take(&mut *self.core.connections.borrow_mut());
        for (_, conn) in connections {
            conn.queue_destroy();
        }
        if let Some(token) = self.core.self_token.take() {
            self.core.base.take_slot(token);
        }
    }
}

impl ServerCore {
    fn new_connection(&self, fd: OwnedFd, peer_addr: SocketAddr) {
        self.base.assert_in_loop_thread();
        let io_loop = self.pool.borrow().next_loop();
        let conn_id = self.next_conn_id.get();
        self.next_conn_id.set(conn_id + 1);
        let conn_name = format!("{}-#{}", self.name, conn_id);
        info!(
            "TcpServer::new_connection [{}] - new connection [{}] from {}",
            self.name, conn_name, peer_addr
        );
        let local_addr = match net::local_addr(fd.as_raw_fd()) {
            Ok(addr) => addr,
            Err(err) => {
                log::error!("TcpServer::new_connection: getsockname: {}", err);
                return;
            }
        };

        let shared = Arc::new(ConnShared::new(
            conn_name.clone(),
            local_addr,
            peer_addr,
            io_loop.clone(),
        ));
        let conn = TcpConnection::from_shared(shared.clone());

        let callbacks = self.callbacks.borrow();
        if let Some((_, mark)) = &callbacks.high_water_mark {
            conn.set_high_water_mark(*mark);
        }
        self.connections.borrow_mut().insert(conn_name, conn);

        // The close callback hops back to the base loop to erase the map
        // entry, then posts the destroy back to the I/O loop; the map stays
        // single-threaded that way.
        let base_handle = self.base.handle();
        let self_token = self.self_token.get().expect("server core not registered");
        let close: CloseCallback = Arc::new(move |conn: &TcpConnection| {
            let conn = conn.clone();
            base_handle.run_in_loop(move || {
                match LoopInner::current()
                    .and_then(|event_loop| event_loop.slot(self_token))
                    .and_then(|slot| slot.downcast::<ServerCore>().ok())
                {
                    Some(core) => core.remove_connection(&conn),
                    // Server already gone; still finish the connection off.
                    None => conn.queue_destroy(),
                }
            });
        });

        let connection_callbacks = ConnectionCallbacks {
            connection: callbacks.connection.clone(),
            message: callbacks.message.clone(),
            write_complete: callbacks.write_complete.clone(),
            high_water_mark: callbacks.high_water_mark.as_ref().map(|(cb, _)| cb.clone()),
            close: Some(close),
        };
        drop(callbacks);

        io_loop.run_in_loop(move || {
            let event_loop =
                LoopInner::current().expect("connection must be established on its own loop");
            ConnCore::establish(&event_loop, fd, shared, connection_callbacks);
        });
    }

    fn remove_connection(&self, conn: &TcpConnection) {
        self.base.assert_in_loop_thread();
        info!(
            "TcpServer::remove_connection [{}] - connection {}",
            self.name,
            conn.name()
        );
        self.connections.borrow_mut().remove(conn.name());
        conn.queue_destroy();
    }
}
