use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Instant;

use log::{error, info};

use crate::buffer::Buffer;
use crate::connection::{
    default_connection_callback, default_message_callback, CloseCallback, ConnCore,
    ConnectionCallback, ConnectionCallbacks, ConnShared, HighWaterMarkCallback, MessageCallback,
    TcpConnection, WriteCompleteCallback,
};
use crate::connector::Connector;
use crate::event_loop::{LoopHandle, LoopInner, Token};
use crate::sys::net;

/// A TCP client owning at most one managed connection.
///
/// The client posts its work onto the loop named at construction;
/// `connect`, `disconnect`, `stop` and `connection` may all be called from
/// any thread. With `enable_retry` the client re-runs its connector (with
/// backoff reset) whenever an established connection goes down.
///
/// Dropping the client force-closes a connection that is still up and
/// stops any in-flight connect; the connection is then destroyed on its
/// loop without further notice.
pub struct TcpClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    event_loop: LoopHandle,
    name: String,
    server_addr: SocketAddr,
    connector: OnceLock<Token>,
    // The connector's intent flag, shared so stop() works from any thread.
    connector_flag: Arc<AtomicBool>,
    // Whether the client wants to be connected at all.
    connect: AtomicBool,
    retry: AtomicBool,
    next_conn_id: AtomicU64,
    connection: Mutex<Option<TcpConnection>>,
    callbacks: Mutex<Callbacks>,
}

#[derive(Clone)]
struct Callbacks {
    connection: ConnectionCallback,
    message: MessageCallback,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<(HighWaterMarkCallback, usize)>,
}

impl TcpClient {
    /// Creates a client whose connector and connections live on the loop
    /// behind `event_loop`.
    pub fn new(event_loop: LoopHandle, server_addr: SocketAddr, name: &str) -> TcpClient {
        let inner = Arc::new(ClientInner {
            event_loop: event_loop.clone(),
            name: name.to_owned(),
            server_addr,
            connector: OnceLock::new(),
            connector_flag: Arc::new(AtomicBool::new(false)),
            connect: AtomicBool::new(false),
            retry: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(1),
            connection: Mutex::new(None),
            callbacks: Mutex::new(Callbacks {
                connection: Arc::new(default_connection_callback),
                message: Arc::new(default_message_callback),
                write_complete: None,
                high_water_mark: None,
            }),
        });

        let init = {
            let inner = Arc::clone(&inner);
            let connector_flag = Arc::clone(&inner.connector_flag);
            move || {
                let event_loop =
                    LoopInner::current().expect("client connector must be built on its loop");
                let connector =
                    Connector::new(event_loop.clone(), server_addr, connector_flag);
                let weak: Weak<ClientInner> = Arc::downgrade(&inner);
                connector.set_new_connection_callback(move |fd| {
                    if let Some(inner) = weak.upgrade() {
                        ClientInner::new_connection(&inner, fd);
                    }
                });
                let token = event_loop.register_slot(connector);
                assert!(inner.connector.set(token).is_ok());
            }
        };
        event_loop.run_in_loop(init);
        TcpClient { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.inner.server_addr
    }

    /// The live connection, if any. Callable from any thread.
    pub fn connection(&self) -> Option<TcpConnection> {
        self.inner.connection.lock().unwrap().clone()
    }

    /// Reconnect automatically (with the backoff reset) when an
    /// established connection goes down.
    pub fn enable_retry(&self) {
        self.inner.retry.store(true, Ordering::Release);
    }

    pub fn set_connection_callback(
        &self,
        callback: impl Fn(&TcpConnection) + Send + Sync + 'static,
    ) {
        self.inner.callbacks.lock().unwrap().connection = Arc::new(callback);
    }

    pub fn set_message_callback(
        &self,
        callback: impl Fn(&TcpConnection, &mut Buffer, Instant) + Send + Sync + 'static,
    ) {
        self.inner.callbacks.lock().unwrap().message = Arc::new(callback);
    }

    pub fn set_write_complete_callback(
        &self,
        callback: impl Fn(&TcpConnection) + Send + Sync + 'static,
    ) {
        self.inner.callbacks.lock().unwrap().write_complete = Some(Arc::new(callback));
    }

    pub fn set_high_water_mark_callback(
        &self,
        callback: impl Fn(&TcpConnection, usize) + Send + Sync + 'static,
        mark: usize,
    ) {
        self.inner.callbacks.lock().unwrap().high_water_mark = Some((Arc::new(callback), mark));
    }

    /// Starts connecting (or retrying) towards the server address.
    pub fn connect(&self) {
        info!(
            "TcpClient::connect [{}] - connecting to {}",
            self.inner.name, self.inner.server_addr
        );
        self.inner.connect.store(true, Ordering::Release);
        self.inner.connector_flag.store(true, Ordering::Release);
        self.inner.with_connector(|connector| connector.start_in_loop());
    }

    /// Closes the write side of the current connection, letting buffered
    /// output drain first. No reconnect follows.
    pub fn disconnect(&self) {
        self.inner.connect.store(false, Ordering::Release);
        if let Some(conn) = self.connection() {
            conn.shutdown();
        }
    }

    /// Halts connect attempts without touching an established connection.
    pub fn stop(&self) {
        self.inner.connect.store(false, Ordering::Release);
        self.inner.connector_flag.store(false, Ordering::Release);
        self.inner.with_connector(|connector| connector.stop_in_loop());
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        info!("TcpClient::drop [{}]", self.inner.name);
        self.inner.connect.store(false, Ordering::Release);
        self.inner.connector_flag.store(false, Ordering::Release);

        let conn = self.inner.connection.lock().unwrap().clone();
        match conn {
            // Still owning a live connection: force it closed. Its close
            // callback holds only a weak client reference, so the teardown
            // finishes on the loop even after the client is gone.
            Some(conn) => conn.force_close(),
            None => self.inner.with_connector(|connector| connector.stop_in_loop()),
        }

        // Unregister the connector from the loop.
        if let Some(&token) = self.inner.connector.get() {
            self.inner.event_loop.queue_in_loop(move || {
                if let Some(event_loop) = LoopInner::current() {
                    event_loop.take_slot(token);
                }
            });
        }
    }
}

impl ClientInner {
    /// Runs `f` with the loop-confined connector, on the loop.
    fn with_connector(&self, f: impl FnOnce(&std::rc::Rc<Connector>) + Send + 'static) {
        let token = self.connector.get().copied();
        self.event_loop.run_in_loop(move || {
            let connector = LoopInner::current()
                .zip(token)
                .and_then(|(event_loop, token)| event_loop.slot(token))
                .and_then(|slot| slot.downcast::<Connector>().ok());
            if let Some(connector) = connector {
                f(&connector);
            }
        });
    }

    /// The connector completed: wrap the descriptor into a managed
    /// connection. Runs on the loop.
    fn new_connection(inner: &Arc<ClientInner>, fd: OwnedFd) {
        let event_loop = LoopInner::current().expect("client connections live on the loop");
        let peer_addr = match net::peer_addr(fd.as_raw_fd()) {
            Ok(addr) => addr,
            Err(err) => {
                error!("TcpClient::new_connection: getpeername: {}", err);
                return;
            }
        };
        let local_addr = match net::local_addr(fd.as_raw_fd()) {
            Ok(addr) => addr,
            Err(err) => {
                error!("TcpClient::new_connection: getsockname: {}", err);
                return;
            }
        };
        let conn_id = inner.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}:{}#{}", inner.name, peer_addr, conn_id);

        let callbacks = inner.callbacks.lock().unwrap().clone();
        let shared = Arc::new(ConnShared::new(
            conn_name,
            local_addr,
            peer_addr,
            event_loop.handle(),
        ));
        let conn = TcpConnection::from_shared(shared.clone());
        if let Some((_, mark)) = &callbacks.high_water_mark {
            conn.set_high_water_mark(*mark);
        }

        let weak: Weak<ClientInner> = Arc::downgrade(inner);
        let close: CloseCallback = Arc::new(move |conn: &TcpConnection| {
            match weak.upgrade() {
                Some(inner) => ClientInner::remove_connection(&inner, conn),
                // Client destroyed while the connection lived on.
                None => conn.queue_destroy(),
            }
        });

        *inner.connection.lock().unwrap() = Some(conn);

        ConnCore::establish(
            &event_loop,
            fd,
            shared,
            ConnectionCallbacks {
                connection: callbacks.connection,
                message: callbacks.message,
                write_complete: callbacks.write_complete,
                high_water_mark: callbacks.high_water_mark.map(|(cb, _)| cb),
                close: Some(close),
            },
        );
    }

    /// Internal close callback: clears the slot and optionally restarts
    /// the connector. Runs on the loop.
    fn remove_connection(inner: &Arc<ClientInner>, conn: &TcpConnection) {
        {
            let mut slot = inner.connection.lock().unwrap();
            debug_assert!(slot.as_ref().map_or(true, |held| held.name() == conn.name()));
            *slot = None;
        }
        conn.queue_destroy();

        if inner.retry.load(Ordering::Acquire) && inner.connect.load(Ordering::Acquire) {
            info!(
                "TcpClient::remove_connection [{}] - reconnecting to {}",
                inner.name, inner.server_addr
            );
            inner.with_connector(|connector| connector.restart());
        }
    }
}
