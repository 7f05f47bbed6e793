//! RpcSession: one logical peer-to-peer association.
//!
//! A session owns the reference table for its peer and a set of
//! connections. On the client it is created by [`RpcSession::new`] and one
//! of the `setup_*_client` calls; on the server it is created when a new
//! client connects and lives until either side shuts it down.
//!
//! # Lifecycle
//!
//! ```text
//!   Open ──shutdown / peer notice / I/O error──▶ ShuttingDown ──last serving task exits──▶ Closed
//! ```
//!
//! Entering `ShuttingDown` cancels the session token, which wakes every
//! task blocked on one of its connections, writes a best-effort
//! `SessionShutdown` notice on each connection and releases every entry of
//! the reference table.
//!
//! A client session with reverse connections keeps serving tasks running,
//! so it stays alive until it is shut down explicitly.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio_util::sync::CancellationToken;

use crate::config::{Limits, RpcSessionConfig};
use crate::dispatch::ConnectionSet;
use crate::error::TransportError;
use crate::protocol::{SPECIAL_GET_MAX_THREADS, SPECIAL_GET_ROOT};
use crate::server::ServerInner;
use crate::table::ReferenceTable;
use crate::transport::{self, BoxStream, Connection, SocketAddress};
use crate::wire::{
    ConnectionHeader, ConnectionOptions, RPC_WIRE_PROTOCOL_VERSION, SPECIAL_ADDRESS,
};
use crate::{Parcel, SpBinder, Status, StatusCode, TransactFlags};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Open,
    ShuttingDown,
    Closed,
}

enum Side {
    Client {
        config: Mutex<RpcSessionConfig>,
    },
    Server {
        server: Weak<ServerInner>,
        max_threads: usize,
    },
}

pub(crate) struct SessionInner {
    id: AtomicU64,
    side: Side,
    table: ReferenceTable,
    state: Mutex<SessionState>,
    limits: Limits,
    remote_max_threads: AtomicUsize,
    flush_scheduled: AtomicBool,
    pub(crate) conns: Mutex<ConnectionSet>,
    /// Signalled whenever a leased connection is released.
    pub(crate) conn_released: Notify,
    pub(crate) cancel: CancellationToken,
    pub(crate) next_txn_id: AtomicU64,
    /// Live serving tasks.
    pub(crate) serving: watch::Sender<usize>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Handle to a session. Cheap to clone; all clones refer to the same
/// session.
#[derive(Clone)]
pub struct RpcSession {
    inner: Arc<SessionInner>,
}

/// Non-owning handle to a session.
#[derive(Clone)]
pub struct WeakSession {
    inner: Weak<SessionInner>,
}

impl WeakSession {
    pub fn upgrade(&self) -> Option<RpcSession> {
        self.inner.upgrade().map(|inner| RpcSession { inner })
    }
}

impl fmt::Debug for RpcSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcSession")
            .field("id", &self.session_id())
            .field("server_side", &self.is_server_side())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Default for RpcSession {
    fn default() -> Self {
        Self::new()
    }
}

impl RpcSession {
    /// A client session with the default configuration, not yet connected.
    pub fn new() -> Self {
        Self::with_config(RpcSessionConfig::default())
    }

    pub fn with_config(config: RpcSessionConfig) -> Self {
        let limits = config.limits;
        Self::build(
            0,
            Side::Client {
                config: Mutex::new(config),
            },
            limits,
            CancellationToken::new(),
        )
    }

    pub(crate) fn new_server_side(
        id: u64,
        server: Weak<ServerInner>,
        max_threads: usize,
        limits: Limits,
        cancel: CancellationToken,
    ) -> Self {
        Self::build(
            id,
            Side::Server {
                server,
                max_threads,
            },
            limits,
            cancel,
        )
    }

    fn build(id: u64, side: Side, limits: Limits, cancel: CancellationToken) -> Self {
        let is_server = matches!(side, Side::Server { .. });
        let (serving, _) = watch::channel(0);
        Self {
            inner: Arc::new(SessionInner {
                id: AtomicU64::new(id),
                side,
                table: ReferenceTable::new(is_server, limits.max_pending_oneway),
                state: Mutex::new(SessionState::Open),
                limits,
                remote_max_threads: AtomicUsize::new(0),
                flush_scheduled: AtomicBool::new(false),
                conns: Mutex::new(ConnectionSet::default()),
                conn_released: Notify::new(),
                cancel,
                next_txn_id: AtomicU64::new(1),
                serving,
            }),
        }
    }

    pub(crate) fn inner(&self) -> &SessionInner {
        &self.inner
    }

    pub(crate) fn table(&self) -> &ReferenceTable {
        &self.inner.table
    }

    pub fn ptr_eq(&self, other: &RpcSession) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn downgrade(&self) -> WeakSession {
        WeakSession {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Id assigned by the server; 0 before a client session connects.
    pub fn session_id(&self) -> u64 {
        self.inner.id.load(Ordering::Acquire)
    }

    pub fn is_server_side(&self) -> bool {
        matches!(self.inner.side, Side::Server { .. })
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Number of live entries in this session's reference table.
    pub fn count_binders(&self) -> usize {
        self.inner.table.count_binders()
    }

    /// Debug listing of the reference table and connections.
    pub fn dump(&self) -> String {
        let (outgoing, incoming) = {
            let conns = self.inner.conns.lock();
            (conns.outgoing_count(), conns.incoming_count())
        };
        format!(
            "session {} ({:?}, {} outgoing, {} incoming): {}",
            self.session_id(),
            self.state(),
            outgoing,
            incoming,
            self.inner.table.dump()
        )
    }

    // ========================================================================
    // Client configuration
    // ========================================================================

    /// Number of reverse connections to open, each served by one task.
    /// Must be called before the session connects.
    pub fn set_max_threads(&self, threads: usize) -> Result<(), Status> {
        let Side::Client { config } = &self.inner.side else {
            return Err(Status::with_message(
                StatusCode::InvalidOperation,
                "server-side sessions take their thread count from the server",
            ));
        };
        if self.inner.conns.lock().was_connected() {
            return Err(Status::with_message(
                StatusCode::InvalidOperation,
                "session already connected",
            ));
        }
        config.lock().max_threads = threads;
        Ok(())
    }

    /// Reverse connections of a client session, or the pool size of the
    /// server for a server-side session.
    pub fn get_max_threads(&self) -> usize {
        self.local_max_threads()
    }

    pub(crate) fn local_max_threads(&self) -> usize {
        match &self.inner.side {
            Side::Client { config } => config.lock().max_threads,
            Side::Server { max_threads, .. } => *max_threads,
        }
    }

    pub(crate) fn root_object(&self) -> Option<SpBinder> {
        match &self.inner.side {
            Side::Server { server, .. } => server.upgrade().and_then(|s| s.root_object()),
            Side::Client { .. } => None,
        }
    }

    // ========================================================================
    // Client setup
    // ========================================================================

    pub async fn setup_unix_domain_client(&self, path: impl AsRef<Path>) -> Result<(), Status> {
        self.setup_client(SocketAddress::unix(path)).await
    }

    pub async fn setup_inet_client(&self, host: &str, port: u16) -> Result<(), Status> {
        self.setup_client(SocketAddress::inet(host, port)).await
    }

    /// Needs the `vsock` feature; fails with [`StatusCode::DeadObject`]
    /// otherwise.
    pub async fn setup_vsock_client(&self, cid: u32, port: u32) -> Result<(), Status> {
        self.setup_client(SocketAddress::Vsock { cid, port }).await
    }

    /// Connect to a server: one connection creates the session, the rest of
    /// the server's pool and the configured reverse connections join it.
    pub async fn setup_client(&self, address: SocketAddress) -> Result<(), Status> {
        let (reverse, handshake_timeout) = match &self.inner.side {
            Side::Client { config } => {
                let config = config.lock();
                (config.max_threads, config.handshake_timeout)
            }
            Side::Server { .. } => {
                return Err(Status::with_message(
                    StatusCode::InvalidOperation,
                    "server-side sessions cannot connect",
                ));
            }
        };
        if self.inner.conns.lock().was_connected() {
            return Err(Status::with_message(
                StatusCode::InvalidOperation,
                "session already connected",
            ));
        }

        let result = self
            .connect_all(&address, reverse, handshake_timeout)
            .await;
        if let Err(status) = &result {
            tracing::warn!(%address, error = %status, "client setup failed");
            self.begin_shutdown("client setup failed");
        }
        result
    }

    async fn connect_all(
        &self,
        address: &SocketAddress,
        reverse: usize,
        handshake_timeout: Duration,
    ) -> Result<(), Status> {
        let (stream, ack) =
            connect_one(address, 0, ConnectionOptions::empty(), handshake_timeout).await?;
        self.inner.id.store(ack.session_id, Ordering::Release);
        let pool = ack.max_threads.max(1) as usize;
        self.inner.remote_max_threads.store(pool, Ordering::Release);
        self.add_outgoing(stream);
        tracing::info!(
            %address,
            session_id = ack.session_id,
            server_threads = pool,
            reverse,
            "session connected"
        );

        for _ in 1..pool {
            let (stream, _) = connect_one(
                address,
                ack.session_id,
                ConnectionOptions::empty(),
                handshake_timeout,
            )
            .await?;
            self.add_outgoing(stream);
        }
        for _ in 0..reverse {
            let (stream, _) = connect_one(
                address,
                ack.session_id,
                ConnectionOptions::REVERSE,
                handshake_timeout,
            )
            .await?;
            let conn = self.wrap_stream(stream);
            self.spawn_serving(conn);
        }
        Ok(())
    }

    pub(crate) fn wrap_stream(&self, stream: BoxStream) -> Arc<Connection> {
        Connection::new(
            stream,
            self.inner.cancel.child_token(),
            self.inner.limits.max_frame_size,
        )
    }

    pub(crate) fn add_outgoing(&self, stream: BoxStream) {
        let conn = self.wrap_stream(stream);
        self.inner.conns.lock().add_outgoing(conn);
        self.inner.conn_released.notify_waiters();
    }

    // ========================================================================
    // Queries to the peer
    // ========================================================================

    /// Fetch the peer's root object (`None` if it has none).
    pub async fn get_root_object(&self) -> Result<Option<SpBinder>, Status> {
        let mut reply = self
            .transact(
                SPECIAL_ADDRESS,
                SPECIAL_GET_ROOT,
                Parcel::for_session(self),
                TransactFlags::empty(),
            )
            .await?;
        reply.read_binder()
    }

    /// Pool size the server announced when this client connected, which is
    /// also the number of forward connections.
    pub fn connected_server_threads(&self) -> usize {
        self.inner.remote_max_threads.load(Ordering::Acquire)
    }

    /// Ask the peer for its thread pool size.
    pub async fn get_remote_max_threads(&self) -> Result<usize, Status> {
        let mut reply = self
            .transact(
                SPECIAL_ADDRESS,
                SPECIAL_GET_MAX_THREADS,
                Parcel::for_session(self),
                TransactFlags::empty(),
            )
            .await?;
        let threads = reply.read_i32()?;
        usize::try_from(threads)
            .map_err(|_| Status::with_message(StatusCode::BadValue, "negative thread count"))
    }

    // ========================================================================
    // References
    // ========================================================================

    /// Whether `binder` may be written into a parcel of this session.
    pub(crate) fn check_sendable(&self, binder: &SpBinder) -> Result<(), Status> {
        if binder.is_foreign() {
            return Err(Status::with_message(
                StatusCode::InvalidOperation,
                "objects of a foreign reference domain cannot be sent over a session",
            ));
        }
        if let Some(session) = binder.remote_session() {
            if !session.ptr_eq(self) {
                return Err(Status::with_message(
                    StatusCode::InvalidOperation,
                    "proxy belongs to a different session",
                ));
            }
        }
        Ok(())
    }

    pub(crate) fn on_proxy_dropped(&self, address: u64, proxy: *const crate::binder::BinderObject) {
        if self.inner.table.on_proxy_dropped(address, proxy) {
            self.schedule_flush();
        }
    }

    /// Try to deliver queued releases soon instead of waiting for the next
    /// transaction.
    fn schedule_flush(&self) {
        if self.inner.flush_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.inner.flush_scheduled.store(false, Ordering::Release);
            return;
        };
        let weak = self.downgrade();
        handle.spawn(async move {
            let Some(session) = weak.upgrade() else {
                return;
            };
            session.inner.flush_scheduled.store(false, Ordering::Release);
            if !session.is_open() || !session.inner.conns.lock().was_connected() {
                return;
            }
            if let Err(status) = session.flush_outbox().await {
                tracing::debug!(
                    session_id = session.session_id(),
                    error = %status,
                    "housekeeping flush failed"
                );
            }
        });
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Shut the session down.
    ///
    /// Returns `false` if the session never connected. With `wait`, also
    /// waits until every serving task of this session has exited; a
    /// handler must not wait for its own session.
    pub async fn shutdown_and_wait(&self, wait: bool) -> bool {
        if !self.inner.conns.lock().was_connected() {
            return false;
        }
        self.begin_shutdown("shutdown requested");
        if wait {
            let mut serving = self.inner.serving.subscribe();
            let _ = serving.wait_for(|count| *count == 0).await;
        }
        true
    }

    /// Enter `ShuttingDown`. Returns false if the session already left
    /// `Open`.
    pub(crate) fn begin_shutdown(&self, reason: &str) -> bool {
        {
            let mut state = self.inner.state.lock();
            if *state != SessionState::Open {
                return false;
            }
            *state = SessionState::ShuttingDown;
        }
        tracing::info!(
            session_id = self.session_id(),
            server_side = self.is_server_side(),
            reason,
            "session shutting down"
        );
        self.inner.cancel.cancel();
        self.inner.conn_released.notify_waiters();

        let conns = self.inner.conns.lock().take_all();
        if !conns.is_empty() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        for conn in conns {
                            conn.close_with_notice().await;
                        }
                    });
                }
                Err(_) => conns.iter().for_each(|conn| conn.close()),
            }
        }
        drop(self.inner.table.terminate());

        if *self.inner.serving.borrow() == 0 {
            self.finish_shutdown();
        }
        true
    }

    pub(crate) fn serving_task_exited(&self) {
        let mut remaining = 0;
        self.inner.serving.send_modify(|count| {
            *count = count.saturating_sub(1);
            remaining = *count;
        });
        if remaining == 0 && self.state() != SessionState::Open {
            self.finish_shutdown();
        }
    }

    fn finish_shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }
        tracing::debug!(session_id = self.session_id(), "session closed");
        if let Side::Server { server, .. } = &self.inner.side {
            if let Some(server) = server.upgrade() {
                server.remove_session(self.session_id());
            }
        }
    }
}

/// Open one connection and run the client side of the handshake.
pub(crate) async fn connect_one(
    address: &SocketAddress,
    session_id: u64,
    options: ConnectionOptions,
    handshake_timeout: Duration,
) -> Result<(BoxStream, crate::wire::ConnectionAck), TransportError> {
    let mut stream = transport::connect(address).await?;
    transport::write_header(
        &mut stream,
        &ConnectionHeader {
            version: RPC_WIRE_PROTOCOL_VERSION,
            options,
            session_id,
        },
    )
    .await?;
    let ack = transport::read_ack(&mut stream, handshake_timeout).await?;
    if ack.status != 0 {
        return Err(TransportError::Rejected(StatusCode::from_i32(ack.status)));
    }
    if ack.version != RPC_WIRE_PROTOCOL_VERSION {
        return Err(TransportError::Wire(crate::wire::WireError::UnsupportedVersion(
            ack.version,
        )));
    }
    tracing::debug!(%address, session_id = ack.session_id, ?options, "connection established");
    Ok((stream, ack))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconnected_session_has_nothing_to_shut_down() {
        let session = RpcSession::new();
        assert_eq!(session.state(), SessionState::Open);
        assert!(!session.shutdown_and_wait(true).await);
        assert_eq!(session.session_id(), 0);
    }

    #[tokio::test]
    async fn connecting_nowhere_fails_and_closes() {
        let dir = std::env::temp_dir().join(format!("sockbinder-missing-{}", std::process::id()));
        let session = RpcSession::new();
        let err = session
            .setup_unix_domain_client(dir.join("nope.sock"))
            .await
            .unwrap_err();
        assert_eq!(err, StatusCode::DeadObject);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn max_threads_is_a_client_setting() {
        let session = RpcSession::new();
        assert_eq!(session.get_max_threads(), 0);
        session.set_max_threads(3).unwrap();
        assert_eq!(session.get_max_threads(), 3);
    }
}
