//! Transaction processing for one session.
//!
//! Outgoing blocking calls lease a connection, write the request and then
//! read that connection until the matching reply arrives, processing any
//! nested transaction or housekeeping message that comes first. Serving
//! tasks run the same per-message processing in a loop.
//!
//! Any protocol violation is fatal: the session is shut down and waiters
//! see [`StatusCode::DeadObject`].

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use futures::FutureExt;

use crate::binder::{self, CallContext};
use crate::dispatch::{ConnectionUse, ExclusiveConnection, in_call_chain};
use crate::error::TransportError;
use crate::table::PendingOneway;
use crate::transport::Connection;
use crate::wire::{Message, Reply, SPECIAL_ADDRESS, Transact, WireParcel};
use crate::{Parcel, RpcSession, SpBinder, Status, StatusCode, TransactFlags};

/// Special transaction: fetch the root object.
pub(crate) const SPECIAL_GET_ROOT: u32 = 0;
/// Special transaction: fetch the peer's configured thread count.
pub(crate) const SPECIAL_GET_MAX_THREADS: u32 = 1;

impl RpcSession {
    /// Send a transaction to the remote object at `address`.
    pub(crate) async fn transact(
        &self,
        address: u64,
        code: u32,
        data: Parcel,
        flags: TransactFlags,
    ) -> Result<Parcel, Status> {
        in_call_chain(self.transact_in_chain(address, code, data, flags)).await
    }

    async fn transact_in_chain(
        &self,
        address: u64,
        code: u32,
        data: Parcel,
        flags: TransactFlags,
    ) -> Result<Parcel, Status> {
        let oneway = flags.contains(TransactFlags::ONEWAY);
        let usage = if oneway {
            ConnectionUse::Oneway
        } else {
            ConnectionUse::Client
        };
        let lease = ExclusiveConnection::find(self, usage)
            .await?
            .ok_or_else(|| Status::new(StatusCode::WouldBlock))?;
        let conn = lease.connection().clone();

        // Serialise before numbering: a rejected parcel must not leave a
        // gap in the object's oneway sequence.
        let parcel = data.into_wire(self)?;
        let async_number = if address == SPECIAL_ADDRESS {
            0
        } else {
            self.table().prepare_transact(address, oneway)?
        };
        let txn_id = self.inner().next_txn_id.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(
            session_id = self.session_id(),
            connection = conn.id(),
            address = format_args!("{address:#x}"),
            code,
            txn_id,
            oneway,
            "sending transaction"
        );

        let mut frames = self.table().take_outbox();
        frames.push(Message::Transact(Transact {
            address,
            code,
            flags,
            async_number,
            txn_id,
            parcel,
        }));
        if let Err(e) = conn.write_messages(&frames).await {
            return Err(self.connection_failed(e, "writing transaction"));
        }
        if oneway {
            return Ok(Parcel::for_session(self));
        }
        let reply = self.wait_for_reply(&conn, txn_id).await;
        drop(lease);
        reply
    }

    async fn wait_for_reply(&self, conn: &Arc<Connection>, txn_id: u64) -> Result<Parcel, Status> {
        loop {
            let message = match conn.read_message().await {
                Ok(message) => message,
                Err(e) => return Err(self.connection_failed(e, "waiting for reply")),
            };
            let reply = match message {
                Message::Reply(reply) => reply,
                other => {
                    if let Err(status) = self.process_incoming(conn, other).await {
                        self.log_fatal(&status);
                        self.begin_shutdown("fatal protocol error");
                        return Err(Status::dead_object());
                    }
                    continue;
                }
            };
            if reply.txn_id != txn_id {
                let status = Status::with_message(
                    StatusCode::BadType,
                    format!("reply for transaction {} while waiting for {txn_id}", reply.txn_id),
                );
                self.log_fatal(&status);
                self.begin_shutdown("mismatched reply");
                return Err(status);
            }
            let parcel = match Parcel::from_wire(reply.parcel, self) {
                Ok(parcel) => parcel,
                Err(status) => {
                    self.log_fatal(&status);
                    self.begin_shutdown("malformed reply");
                    return Err(Status::dead_object());
                }
            };
            let code = StatusCode::from_i32(reply.status);
            if !code.is_ok() {
                // References in an error reply are counted above and
                // released here.
                drop(parcel);
                return Err(Status::new(code));
            }
            return Ok(parcel);
        }
    }

    /// Handle one message read outside a reply wait, or a nested one read
    /// during a wait. An error is fatal to the session.
    pub(crate) async fn process_incoming(
        &self,
        conn: &Arc<Connection>,
        message: Message,
    ) -> Result<(), Status> {
        match message {
            Message::Transact(transact) => self.process_transact(conn, transact).await,
            Message::DecStrong {
                address,
                amount,
                mentions,
            } => {
                let released = self.table().dec_strong(address, amount, mentions)?;
                drop(released);
                Ok(())
            }
            Message::SessionShutdown => Err(Status::with_message(
                StatusCode::DeadObject,
                "peer shut the session down",
            )),
            Message::Reply(reply) => Err(Status::with_message(
                StatusCode::BadType,
                format!("unexpected reply for transaction {}", reply.txn_id),
            )),
        }
    }

    async fn process_transact(&self, conn: &Arc<Connection>, transact: Transact) -> Result<(), Status> {
        let Transact {
            address,
            code,
            flags,
            async_number,
            txn_id,
            parcel,
        } = transact;
        let oneway = flags.contains(TransactFlags::ONEWAY);
        tracing::trace!(
            session_id = self.session_id(),
            connection = conn.id(),
            address = format_args!("{address:#x}"),
            code,
            txn_id,
            oneway,
            "incoming transaction"
        );

        // A parcel that cannot be resolved leaves the table out of step with
        // the peer.
        let data = Parcel::from_wire(parcel, self)?;

        if address == SPECIAL_ADDRESS {
            if oneway {
                tracing::warn!(code, "ignoring oneway special transaction");
                return Ok(());
            }
            let result = self.process_special(code, data);
            return self.send_reply(conn, txn_id, result).await;
        }

        if !oneway {
            let result = match self.table().lookup_local(address) {
                Ok(target) => self.execute(target, code, data, flags).await,
                Err(e) => Err(e),
            };
            return self.send_reply(conn, txn_id, result).await;
        }

        let mut next = match self.table().claim_oneway(address, code, data, async_number) {
            Ok(next) => next,
            Err((status, data)) => {
                drop(data);
                return Err(status);
            }
        };
        let allow_nested = self.inner().conns.lock().set_allow_nested(conn, false);
        while let Some(PendingOneway {
            target,
            code,
            data,
            async_number,
        }) = next.take()
        {
            tracing::trace!(
                address = format_args!("{address:#x}"),
                code,
                async_number,
                "running oneway transaction"
            );
            if let Err(status) = self.execute(target, code, data, TransactFlags::ONEWAY).await {
                tracing::debug!(
                    address = format_args!("{address:#x}"),
                    code,
                    error = %status,
                    "oneway transaction failed"
                );
            }
            next = self.table().finish_oneway(address);
        }
        self.inner().conns.lock().set_allow_nested(conn, allow_nested);
        Ok(())
    }

    /// Run a handler, turning a panic into [`StatusCode::UnknownError`].
    async fn execute(
        &self,
        target: SpBinder,
        code: u32,
        data: Parcel,
        flags: TransactFlags,
    ) -> Result<Parcel, Status> {
        let Some(object) = target.object() else {
            return Err(Status::with_message(
                StatusCode::InvalidOperation,
                "transaction target is not a local object",
            ));
        };
        let cx = CallContext::new(target.clone(), Some(self.clone()), flags);
        let fut = binder::dispatch(object, code, data, cx);
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(
                    session_id = self.session_id(),
                    code,
                    panic = %message,
                    "transaction handler panicked"
                );
                Err(Status::with_message(StatusCode::UnknownError, message))
            }
        }
    }

    fn process_special(&self, code: u32, _data: Parcel) -> Result<Parcel, Status> {
        let mut reply = Parcel::for_session(self);
        match code {
            SPECIAL_GET_ROOT => {
                let root = self.root_object();
                reply.write_binder(root.as_ref())?;
            }
            SPECIAL_GET_MAX_THREADS => {
                reply.write_i32(i32::try_from(self.local_max_threads()).unwrap_or(i32::MAX));
            }
            other => {
                return Err(Status::with_message(
                    StatusCode::UnknownTransaction,
                    format!("unknown special transaction {other}"),
                ));
            }
        }
        Ok(reply)
    }

    async fn send_reply(
        &self,
        conn: &Arc<Connection>,
        txn_id: u64,
        result: Result<Parcel, Status>,
    ) -> Result<(), Status> {
        let (status, parcel) = match result.and_then(|reply| reply.into_wire(self)) {
            Ok(parcel) => (StatusCode::Ok.as_i32(), parcel),
            Err(e) => {
                tracing::debug!(txn_id, error = %e, "replying with error");
                let code = match e.code() {
                    StatusCode::Ok => StatusCode::UnknownError,
                    code => code,
                };
                (code.as_i32(), WireParcel::default())
            }
        };
        let mut frames = self.table().take_outbox();
        frames.push(Message::Reply(Reply {
            txn_id,
            status,
            parcel,
        }));
        conn.write_messages(&frames)
            .await
            .map_err(|e| self.connection_failed(e, "writing reply"))
    }

    /// Write queued housekeeping messages if a connection is free right now.
    pub(crate) async fn flush_outbox(&self) -> Result<(), Status> {
        in_call_chain(async {
            let Some(lease) = ExclusiveConnection::find(self, ConnectionUse::Refcount).await?
            else {
                return Ok(());
            };
            let frames = self.table().take_outbox();
            if frames.is_empty() {
                return Ok(());
            }
            tracing::trace!(
                session_id = self.session_id(),
                connection = lease.connection().id(),
                count = frames.len(),
                "flushing housekeeping messages"
            );
            lease
                .connection()
                .write_messages(&frames)
                .await
                .map_err(|e| self.connection_failed(e, "flushing housekeeping messages"))
        })
        .await
    }

    /// Shut the session down after an I/O failure and describe it.
    fn connection_failed(&self, e: TransportError, context: &'static str) -> Status {
        if e.is_disconnect() {
            tracing::debug!(session_id = self.session_id(), context, "connection closed");
        } else {
            tracing::warn!(session_id = self.session_id(), context, error = %e, "connection failed");
        }
        self.begin_shutdown(context);
        let status = Status::from(e);
        match status.code() {
            StatusCode::BadType | StatusCode::NoMemory => status,
            _ => Status::dead_object(),
        }
    }

    pub(crate) fn log_fatal(&self, status: &Status) {
        if status.code() == StatusCode::DeadObject {
            tracing::debug!(session_id = self.session_id(), reason = %status, "session ending");
        } else {
            tracing::error!(
                session_id = self.session_id(),
                error = %status,
                "fatal protocol error"
            );
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::config::DEFAULT_MAX_FRAME_SIZE;
    use crate::session::connect_one;
    use crate::transport::{self, BoxStream, SocketAddress};
    use crate::wire::{
        ADDRESS_SERVER_BIT, Command, ConnectionAck, ConnectionOptions, RPC_WIRE_PROTOCOL_VERSION,
    };
    use crate::{RpcServer, SessionState};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn socket_path(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "sockbinder-protocol-{name}-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        path
    }

    fn serve(path: &PathBuf) -> RpcServer {
        let server = RpcServer::new();
        server.setup_unix_domain_server(path).unwrap();
        server.start();
        server
    }

    /// Open a new session by hand and return its only connection stream.
    async fn raw_session(path: &PathBuf) -> BoxStream {
        let (stream, ack) = connect_one(
            &SocketAddress::unix(path),
            0,
            ConnectionOptions::empty(),
            TIMEOUT,
        )
        .await
        .unwrap();
        assert_eq!(ack.status, 0);
        stream
    }

    fn wrap(stream: BoxStream) -> Arc<Connection> {
        Connection::new(stream, CancellationToken::new(), DEFAULT_MAX_FRAME_SIZE)
    }

    fn slot(marker: i32, address: u64) -> WireParcel {
        let mut data = Vec::new();
        data.extend_from_slice(&marker.to_le_bytes());
        data.extend_from_slice(&address.to_le_bytes());
        WireParcel {
            data: data.into(),
            offsets: vec![0],
        }
    }

    fn get_root(parcel: WireParcel) -> Message {
        Message::Transact(Transact {
            address: SPECIAL_ADDRESS,
            code: SPECIAL_GET_ROOT,
            flags: TransactFlags::empty(),
            async_number: 0,
            txn_id: 1,
            parcel,
        })
    }

    /// The server ends the session instead of answering, and forgets it.
    async fn assert_session_ended(server: &RpcServer, conn: &Connection) {
        let outcome = tokio::time::timeout(TIMEOUT, conn.read_message())
            .await
            .expect("server neither replied nor closed the session");
        match outcome {
            Ok(Message::SessionShutdown) | Err(TransportError::Closed) => {}
            other => panic!("expected the session to end, got {other:?}"),
        }
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        while !server.list_sessions().is_empty() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "server kept the session"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn well_formed_transaction_is_answered() {
        let path = socket_path("answered");
        let server = serve(&path);
        let conn = wrap(raw_session(&path).await);

        conn.write_messages(&[get_root(WireParcel::default())])
            .await
            .unwrap();
        match tokio::time::timeout(TIMEOUT, conn.read_message()).await {
            Ok(Ok(Message::Reply(reply))) => {
                assert_eq!(reply.txn_id, 1);
                assert_eq!(reply.status, 0);
            }
            other => panic!("expected a reply, got {other:?}"),
        }
        assert_eq!(server.list_sessions().len(), 1);

        assert!(server.shutdown().await);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_local_address_in_transaction_ends_session() {
        let path = socket_path("unknown-address");
        let server = serve(&path);
        let conn = wrap(raw_session(&path).await);

        // An address in the server's range that it never handed out.
        conn.write_messages(&[get_root(slot(1, ADDRESS_SERVER_BIT | 0x99))])
            .await
            .unwrap();
        assert_session_ended(&server, &conn).await;

        server.shutdown().await;
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unmarked_object_slot_ends_session() {
        let path = socket_path("unmarked-slot");
        let server = serve(&path);
        let conn = wrap(raw_session(&path).await);

        conn.write_messages(&[get_root(slot(0, 7))]).await.unwrap();
        assert_session_ended(&server, &conn).await;

        server.shutdown().await;
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn truncated_frame_ends_session() {
        let path = socket_path("truncated");
        let server = serve(&path);
        let mut stream = raw_session(&path).await;

        // A transaction frame whose body stops after four bytes.
        let mut frame = Vec::new();
        frame.extend_from_slice(&(Command::Transact as u32).to_le_bytes());
        frame.extend_from_slice(&4u32.to_le_bytes());
        frame.extend_from_slice(&[0u8; 4]);
        stream.write_all(&frame).await.unwrap();
        stream.flush().await.unwrap();

        let conn = wrap(stream);
        assert_session_ended(&server, &conn).await;

        server.shutdown().await;
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn malformed_reply_ends_client_session() {
        let path = socket_path("malformed-reply");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();
        let peer = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream: BoxStream = Box::new(stream);
            let header = transport::read_header(&mut stream, TIMEOUT).await.unwrap();
            assert_eq!(header.session_id, 0);
            transport::write_ack(
                &mut stream,
                &ConnectionAck {
                    version: RPC_WIRE_PROTOCOL_VERSION,
                    status: 0,
                    session_id: 1,
                    max_threads: 1,
                },
            )
            .await
            .unwrap();
            let conn = wrap(stream);
            let Message::Transact(transact) = conn.read_message().await.unwrap() else {
                panic!("expected a transaction");
            };
            // A client-range address the client never sent.
            conn.write_messages(&[Message::Reply(Reply {
                txn_id: transact.txn_id,
                status: 0,
                parcel: slot(1, 0x42),
            })])
            .await
            .unwrap();
            conn
        });

        let session = RpcSession::new();
        session
            .setup_client(SocketAddress::unix(&path))
            .await
            .unwrap();
        let err = session.get_root_object().await.unwrap_err();
        assert_eq!(err, StatusCode::DeadObject);
        assert_ne!(session.state(), SessionState::Open);

        drop(peer.await.unwrap());
        let _ = std::fs::remove_file(&path);
    }
}
