//! RpcServer: accepts connections and groups them into sessions.
//!
//! ```text
//!   setup_*_server ──▶ join()/start() ──accept──▶ handshake ──▶ new session  (session id 0)
//!                                                          └──▶ join session (known id)
//! ```
//!
//! The listening socket is kept as a plain descriptor until the accept loop
//! starts, which is also how an externally supplied descriptor is held.

use std::collections::HashMap;
use std::io;
use std::os::fd::OwnedFd;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::binder::WeakBinder;
use crate::config::RpcServerConfig;
use crate::transport::{self, BoxStream, Listener, SocketAddress};
use crate::wire::{ConnectionAck, ConnectionOptions, RPC_WIRE_PROTOCOL_VERSION};
use crate::{RpcSession, SpBinder, Status, StatusCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerState {
    Running,
    ShuttingDown,
    Stopped,
}

enum Root {
    Strong(SpBinder),
    Weak(WeakBinder),
}

pub(crate) struct ServerInner {
    config: Mutex<RpcServerConfig>,
    root: Mutex<Option<Root>>,
    /// Listening socket not yet handed to the accept loop.
    listener: Mutex<Option<OwnedFd>>,
    state: Mutex<ServerState>,
    sessions: Mutex<HashMap<u64, RpcSession>>,
    session_count: watch::Sender<usize>,
    joining: watch::Sender<bool>,
    next_session_id: AtomicU64,
    cancel: CancellationToken,
}

impl ServerInner {
    pub(crate) fn root_object(&self) -> Option<SpBinder> {
        match &*self.root.lock() {
            Some(Root::Strong(binder)) => Some(binder.clone()),
            Some(Root::Weak(weak)) => weak.upgrade(),
            None => None,
        }
    }

    pub(crate) fn remove_session(&self, id: u64) {
        let removed = {
            let mut sessions = self.sessions.lock();
            let removed = sessions.remove(&id);
            self.session_count.send_replace(sessions.len());
            removed
        };
        if removed.is_some() {
            tracing::debug!(session_id = id, "session removed from server");
        }
    }
}

#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<ServerInner>,
}

/// Non-owning handle to a server, for objects that need to reach the
/// server they are served by.
#[derive(Clone)]
pub struct WeakServer {
    inner: Weak<ServerInner>,
}

impl WeakServer {
    pub fn upgrade(&self) -> Option<RpcServer> {
        self.inner.upgrade().map(|inner| RpcServer { inner })
    }
}

impl Default for RpcServer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("state", &self.state())
            .field("sessions", &self.inner.sessions.lock().len())
            .finish_non_exhaustive()
    }
}

fn setup_error(context: &str, e: io::Error) -> Status {
    let code = match e.kind() {
        io::ErrorKind::Unsupported => StatusCode::InvalidOperation,
        _ => StatusCode::BadValue,
    };
    Status::with_message(code, format!("{context}: {e}"))
}

impl RpcServer {
    pub fn new() -> Self {
        Self::with_config(RpcServerConfig::default())
    }

    pub fn with_config(config: RpcServerConfig) -> Self {
        let (session_count, _) = watch::channel(0);
        let (joining, _) = watch::channel(false);
        Self {
            inner: Arc::new(ServerInner {
                config: Mutex::new(config),
                root: Mutex::new(None),
                listener: Mutex::new(None),
                state: Mutex::new(ServerState::Running),
                sessions: Mutex::new(HashMap::new()),
                session_count,
                joining,
                next_session_id: AtomicU64::new(1),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakServer {
        WeakServer {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn state(&self) -> ServerState {
        *self.inner.state.lock()
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Size of the pool every client session opens. At least 1.
    pub fn set_max_threads(&self, threads: usize) -> Result<(), Status> {
        if threads == 0 {
            return Err(Status::with_message(
                StatusCode::BadValue,
                "a server needs at least one thread",
            ));
        }
        if *self.inner.joining.borrow() {
            return Err(Status::with_message(
                StatusCode::InvalidOperation,
                "server already accepting connections",
            ));
        }
        self.inner.config.lock().max_threads = threads;
        Ok(())
    }

    pub fn get_max_threads(&self) -> usize {
        self.inner.config.lock().max_threads
    }

    pub fn set_root_object(&self, root: SpBinder) {
        *self.inner.root.lock() = Some(Root::Strong(root));
    }

    /// Serve `root` without keeping it alive; once it dies clients get no
    /// root object.
    pub fn set_root_object_weak(&self, root: &SpBinder) {
        *self.inner.root.lock() = Some(Root::Weak(root.downgrade()));
    }

    pub fn get_root_object(&self) -> Option<SpBinder> {
        self.inner.root_object()
    }

    // ========================================================================
    // Listening socket
    // ========================================================================

    fn install_listener(&self, fd: OwnedFd) -> Result<(), Status> {
        if *self.inner.state.lock() != ServerState::Running {
            return Err(Status::with_message(
                StatusCode::InvalidOperation,
                "server is shut down",
            ));
        }
        let mut listener = self.inner.listener.lock();
        if listener.is_some() || *self.inner.joining.borrow() {
            return Err(Status::with_message(
                StatusCode::InvalidOperation,
                "server socket already set up",
            ));
        }
        *listener = Some(fd);
        Ok(())
    }

    pub fn setup_unix_domain_server(&self, path: impl AsRef<Path>) -> Result<(), Status> {
        let address = SocketAddress::unix(path);
        let (fd, _) = transport::bind(&address).map_err(|e| setup_error("bind unix socket", e))?;
        self.install_listener(fd)?;
        tracing::info!(%address, "server socket set up");
        Ok(())
    }

    /// Listen on `host:port`. Port 0 picks a free port; the bound port is
    /// returned.
    pub fn setup_inet_server(&self, host: &str, port: u16) -> Result<u16, Status> {
        let address = SocketAddress::inet(host, port);
        let (fd, bound) =
            transport::bind(&address).map_err(|e| setup_error("bind inet socket", e))?;
        self.install_listener(fd)?;
        let bound = bound.unwrap_or(port);
        tracing::info!(%address, port = bound, "server socket set up");
        Ok(bound)
    }

    /// Listen on a vsock port for any cid. Needs the `vsock` feature.
    pub fn setup_vsock_server(&self, port: u32) -> Result<(), Status> {
        let address = SocketAddress::Vsock { cid: 0, port };
        let (fd, _) = transport::bind(&address).map_err(|e| setup_error("bind vsock socket", e))?;
        self.install_listener(fd)?;
        tracing::info!(port, "vsock server socket set up");
        Ok(())
    }

    /// Serve an already bound and listening socket. Its family is detected
    /// when the accept loop starts.
    pub fn setup_external_server(&self, fd: OwnedFd) -> Result<(), Status> {
        self.install_listener(fd)
    }

    pub fn has_server(&self) -> bool {
        self.inner.listener.lock().is_some() || *self.inner.joining.borrow()
    }

    /// Take back the listening socket, if the accept loop has not started.
    pub fn release_server(&self) -> Option<OwnedFd> {
        self.inner.listener.lock().take()
    }

    // ========================================================================
    // Accept loop
    // ========================================================================

    /// Spawn [`RpcServer::join`] on the current runtime.
    pub fn start(&self) {
        let server = self.clone();
        tokio::spawn(async move {
            if let Err(status) = server.join().await {
                tracing::warn!(error = %status, "accept loop failed to start");
            }
        });
    }

    /// Accept connections until the server shuts down.
    pub async fn join(&self) -> Result<(), Status> {
        let fd = {
            let state = self.inner.state.lock();
            if *state != ServerState::Running {
                return Err(Status::with_message(
                    StatusCode::InvalidOperation,
                    "server is shut down",
                ));
            }
            let fd = self.inner.listener.lock().take().ok_or_else(|| {
                Status::with_message(StatusCode::InvalidOperation, "no server socket set up")
            })?;
            self.inner.joining.send_replace(true);
            fd
        };
        let result = self.accept_loop(fd).await;
        self.inner.joining.send_replace(false);
        result
    }

    async fn accept_loop(&self, fd: OwnedFd) -> Result<(), Status> {
        let listener = Listener::from_fd(fd).map_err(|e| setup_error("listen", e))?;
        tracing::info!("accepting connections");
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let server = self.clone();
                    tokio::spawn(async move { server.handle_connection(stream, peer).await });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::task::yield_now().await;
                }
            }
        }
        tracing::info!("accept loop stopped");
        Ok(())
    }

    async fn handle_connection(&self, mut stream: BoxStream, peer: String) {
        let (max_threads, timeout, limits) = {
            let config = self.inner.config.lock();
            (config.max_threads, config.handshake_timeout, config.limits)
        };
        let header = match transport::read_header(&mut stream, timeout).await {
            Ok(header) => header,
            Err(e) => {
                tracing::debug!(%peer, error = %e, "handshake failed");
                return;
            }
        };
        tracing::debug!(
            %peer,
            session_id = header.session_id,
            options = ?header.options,
            "incoming connection"
        );

        let rejection = if header.version != RPC_WIRE_PROTOCOL_VERSION {
            Some(StatusCode::BadValue)
        } else if self.inner.cancel.is_cancelled() {
            Some(StatusCode::DeadObject)
        } else if header.session_id == 0 && header.options.contains(ConnectionOptions::REVERSE) {
            Some(StatusCode::BadValue)
        } else {
            None
        };
        if let Some(code) = rejection {
            tracing::warn!(%peer, version = header.version, ?code, "connection rejected");
            Self::reject(&mut stream, code).await;
            return;
        }

        if header.session_id == 0 {
            let id = self.inner.next_session_id.fetch_add(1, Ordering::Relaxed);
            let session = RpcSession::new_server_side(
                id,
                Arc::downgrade(&self.inner),
                max_threads,
                limits,
                self.inner.cancel.child_token(),
            );
            let registered = {
                let mut sessions = self.inner.sessions.lock();
                let open = !self.inner.cancel.is_cancelled();
                if open {
                    sessions.insert(id, session.clone());
                    self.inner.session_count.send_replace(sessions.len());
                }
                open
            };
            if !registered {
                Self::reject(&mut stream, StatusCode::DeadObject).await;
                return;
            }
            if let Err(e) = Self::accept_ack(&mut stream, id, max_threads).await {
                tracing::debug!(%peer, session_id = id, error = %e, "ack failed");
                session.begin_shutdown("handshake failed");
                return;
            }
            tracing::info!(%peer, session_id = id, "new session");
            let conn = session.wrap_stream(stream);
            session.spawn_serving(conn);
            return;
        }

        let session = self
            .inner
            .sessions
            .lock()
            .get(&header.session_id)
            .filter(|session| session.is_open())
            .cloned();
        let Some(session) = session else {
            tracing::warn!(%peer, session_id = header.session_id, "unknown session");
            Self::reject(&mut stream, StatusCode::NameNotFound).await;
            return;
        };
        if let Err(e) = Self::accept_ack(&mut stream, header.session_id, max_threads).await {
            tracing::debug!(%peer, session_id = header.session_id, error = %e, "ack failed");
            return;
        }
        if header.options.contains(ConnectionOptions::REVERSE) {
            session.add_outgoing(stream);
        } else {
            let conn = session.wrap_stream(stream);
            session.spawn_serving(conn);
        }
    }

    async fn accept_ack(
        stream: &mut BoxStream,
        session_id: u64,
        max_threads: usize,
    ) -> Result<(), crate::TransportError> {
        transport::write_ack(
            stream,
            &ConnectionAck {
                version: RPC_WIRE_PROTOCOL_VERSION,
                status: StatusCode::Ok.as_i32(),
                session_id,
                max_threads: u32::try_from(max_threads).unwrap_or(u32::MAX),
            },
        )
        .await
    }

    async fn reject(stream: &mut BoxStream, code: StatusCode) {
        let ack = ConnectionAck {
            version: RPC_WIRE_PROTOCOL_VERSION,
            status: code.as_i32(),
            session_id: 0,
            max_threads: 0,
        };
        let _ = transport::write_ack(stream, &ack).await;
    }

    // ========================================================================
    // Sessions and shutdown
    // ========================================================================

    pub fn list_sessions(&self) -> Vec<RpcSession> {
        let mut sessions: Vec<_> = self.inner.sessions.lock().values().cloned().collect();
        sessions.sort_by_key(|s| s.session_id());
        sessions
    }

    /// Stop accepting, shut every session down and wait for all of them to
    /// finish.
    ///
    /// Returns `true` for the call that stopped the server and `false` when
    /// there was nothing to stop. Must not be awaited from a handler of
    /// this server's sessions; spawn it instead.
    pub async fn shutdown(&self) -> bool {
        {
            let mut state = self.inner.state.lock();
            if *state != ServerState::Running {
                return false;
            }
            let active = self.inner.listener.lock().is_some()
                || *self.inner.joining.borrow()
                || !self.inner.sessions.lock().is_empty();
            if !active {
                return false;
            }
            *state = ServerState::ShuttingDown;
        }
        tracing::info!("server shutting down");
        self.inner.cancel.cancel();
        drop(self.inner.listener.lock().take());

        for session in self.list_sessions() {
            session.begin_shutdown("server shutting down");
        }
        let mut joining = self.inner.joining.subscribe();
        let _ = joining.wait_for(|joining| !*joining).await;
        let mut count = self.inner.session_count.subscribe();
        let _ = count.wait_for(|count| *count == 0).await;

        *self.inner.state.lock() = ServerState::Stopped;
        tracing::info!("server stopped");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_count_must_be_positive() {
        let server = RpcServer::new();
        assert_eq!(server.get_max_threads(), 1);
        assert_eq!(server.set_max_threads(0).unwrap_err(), StatusCode::BadValue);
        server.set_max_threads(4).unwrap();
        assert_eq!(server.get_max_threads(), 4);
    }

    #[tokio::test]
    async fn nothing_to_shut_down_without_a_socket() {
        let server = RpcServer::new();
        assert!(!server.has_server());
        assert!(!server.shutdown().await);
        assert_eq!(server.state(), ServerState::Running);
    }

    #[tokio::test]
    async fn external_descriptor_is_released_unchanged() {
        use std::os::fd::AsRawFd;

        let file = std::fs::File::open("/dev/null").unwrap();
        let fd = OwnedFd::from(file);
        let raw = fd.as_raw_fd();
        let server = RpcServer::new();
        server.setup_external_server(fd).unwrap();
        assert!(server.has_server());
        let released = server.release_server().unwrap();
        assert_eq!(released.as_raw_fd(), raw);
        assert!(!server.has_server());
    }

    #[tokio::test]
    async fn second_socket_is_rejected() {
        let server = RpcServer::new();
        server.setup_inet_server("127.0.0.1", 0).unwrap();
        assert_eq!(
            server.setup_inet_server("127.0.0.1", 0).unwrap_err(),
            StatusCode::InvalidOperation
        );
        assert!(server.shutdown().await);
        assert!(!server.shutdown().await);
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn ack_clamps_pool_size_and_reports_rejections() {
        let timeout = std::time::Duration::from_secs(1);
        let (a, b) = tokio::io::duplex(256);
        let (mut a, mut b): (BoxStream, BoxStream) = (Box::new(a), Box::new(b));

        RpcServer::accept_ack(&mut a, 3, usize::MAX).await.unwrap();
        let ack = transport::read_ack(&mut b, timeout).await.unwrap();
        assert_eq!(ack.session_id, 3);
        assert_eq!(ack.max_threads, u32::MAX);

        RpcServer::reject(&mut a, StatusCode::NameNotFound).await;
        let ack = transport::read_ack(&mut b, timeout).await.unwrap();
        assert_eq!(StatusCode::from_i32(ack.status), StatusCode::NameNotFound);
        assert_eq!(ack.max_threads, 0);
    }
}
