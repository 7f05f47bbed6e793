//! Connection scheduling.
//!
//! Every task taking part in a session runs inside a *call chain*. A chain
//! is the unit that owns a connection exclusively while it waits for a
//! reply: nested transactions that come back on that connection are
//! processed by the waiting chain itself, and calls made from within those
//! nested handlers reuse the same connection instead of taking another one.
//!
//! Serving tasks get a chain at spawn time and keep their incoming
//! connection for life. Any other task gets a fresh chain for the duration
//! of one outgoing call.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::transport::Connection;
use crate::{RpcSession, Status, StatusCode};

tokio::task_local! {
    static CALL_CHAIN: u64;
}

static NEXT_CHAIN: AtomicU64 = AtomicU64::new(1);

fn new_chain() -> u64 {
    NEXT_CHAIN.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn current_chain() -> Option<u64> {
    CALL_CHAIN.try_with(|chain| *chain).ok()
}

/// Run `f` in the caller's chain, or in a new one if it has none.
pub(crate) async fn in_call_chain<F: Future>(f: F) -> F::Output {
    match current_chain() {
        Some(_) => f.await,
        None => CALL_CHAIN.scope(new_chain(), f).await,
    }
}

/// What a connection is leased for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionUse {
    /// Blocking transaction.
    Client,
    /// Oneway transaction.
    Oneway,
    /// Housekeeping only; never waits.
    Refcount,
}

struct Slot {
    conn: Arc<Connection>,
    /// Chain currently owning the connection.
    exclusive: Option<u64>,
    /// Whether the owning chain may send nested transactions on it. Cleared
    /// while a serving task runs a oneway handler, since the peer is not
    /// waiting on that connection.
    allow_nested: bool,
}

/// Connections of one session.
#[derive(Default)]
pub(crate) struct ConnectionSet {
    /// Connections this side writes requests on.
    outgoing: Vec<Slot>,
    /// Connections served by a dedicated task.
    incoming: Vec<Slot>,
    /// Rotates oneway traffic over the outgoing connections.
    outgoing_offset: usize,
    connected: bool,
}

impl ConnectionSet {
    pub fn add_outgoing(&mut self, conn: Arc<Connection>) {
        self.connected = true;
        self.outgoing.push(Slot {
            conn,
            exclusive: None,
            allow_nested: true,
        });
    }

    pub fn add_incoming(&mut self, conn: Arc<Connection>, chain: u64) {
        self.connected = true;
        self.incoming.push(Slot {
            conn,
            exclusive: Some(chain),
            allow_nested: true,
        });
    }

    pub fn was_connected(&self) -> bool {
        self.connected
    }

    pub fn outgoing_count(&self) -> usize {
        self.outgoing.len()
    }

    pub fn incoming_count(&self) -> usize {
        self.incoming.len()
    }

    /// Remove every connection, for shutdown.
    pub fn take_all(&mut self) -> Vec<Arc<Connection>> {
        self.outgoing
            .drain(..)
            .chain(self.incoming.drain(..))
            .map(|slot| slot.conn)
            .collect()
    }

    fn release(&mut self, conn: &Arc<Connection>) {
        if let Some(slot) = self
            .outgoing
            .iter_mut()
            .find(|slot| Arc::ptr_eq(&slot.conn, conn))
        {
            slot.exclusive = None;
        }
    }

    /// Set `allow_nested` on an incoming connection, returning the old value.
    pub fn set_allow_nested(&mut self, conn: &Arc<Connection>, allow: bool) -> bool {
        match self
            .incoming
            .iter_mut()
            .find(|slot| Arc::ptr_eq(&slot.conn, conn))
        {
            Some(slot) => std::mem::replace(&mut slot.allow_nested, allow),
            None => allow,
        }
    }

    /// Pick a connection for `chain`.
    fn select(&mut self, chain: u64, usage: ConnectionUse) -> Option<(Arc<Connection>, bool)> {
        let count = self.outgoing.len();
        let mut exclusive = None;
        let mut available = None;
        for i in 0..count {
            let index = match usage {
                ConnectionUse::Oneway => (i + self.outgoing_offset) % count,
                _ => i,
            };
            match self.outgoing[index].exclusive {
                Some(owner) if owner == chain => {
                    exclusive = Some(index);
                    break;
                }
                None if available.is_none() => available = Some(index),
                _ => {}
            }
        }
        if usage == ConnectionUse::Oneway && (exclusive.is_some() || available.is_some()) {
            // Consecutive oneway calls from one task land on different
            // connections, so a busy peer thread does not stall them all.
            self.outgoing_offset = (self.outgoing_offset + 1) % count;
        }

        if usage != ConnectionUse::Oneway {
            if let Some(slot) = self
                .incoming
                .iter()
                .find(|slot| slot.exclusive == Some(chain))
            {
                if slot.allow_nested
                    || (usage == ConnectionUse::Refcount && available.is_none())
                {
                    return Some((slot.conn.clone(), true));
                }
            }
        }

        if let Some(index) = exclusive {
            return Some((self.outgoing[index].conn.clone(), true));
        }
        let index = available?;
        let slot = &mut self.outgoing[index];
        slot.exclusive = Some(chain);
        Some((slot.conn.clone(), false))
    }
}

/// A connection held by the current chain for one call.
pub(crate) struct ExclusiveConnection {
    session: RpcSession,
    conn: Arc<Connection>,
    /// Reentrant leases ride on a connection the chain already owns and
    /// must not release it.
    reentrant: bool,
}

impl ExclusiveConnection {
    /// Lease a connection, waiting for one to become available.
    ///
    /// Fails with [`StatusCode::WouldBlock`] when this side has no outgoing
    /// connection it could ever wait for, and with
    /// [`StatusCode::DeadObject`] once the session shuts down. Refcount
    /// leases never wait and return `None` instead.
    pub async fn find(session: &RpcSession, usage: ConnectionUse) -> Result<Option<Self>, Status> {
        let chain = current_chain().unwrap_or_else(new_chain);
        let inner = session.inner();
        loop {
            let notified = inner.conn_released.notified();
            let mut notified = std::pin::pin!(notified);
            notified.as_mut().enable();
            {
                let mut conns = inner.conns.lock();
                if !session.is_open() {
                    return Err(Status::dead_object());
                }
                if let Some((conn, reentrant)) = conns.select(chain, usage) {
                    return Ok(Some(Self {
                        session: session.clone(),
                        conn,
                        reentrant,
                    }));
                }
                if usage == ConnectionUse::Refcount {
                    return Ok(None);
                }
                if conns.outgoing.is_empty() {
                    return Err(Status::with_message(
                        StatusCode::WouldBlock,
                        "no outgoing connection; a server can only call back \
                         on a reverse connection or from within a nested call",
                    ));
                }
                tracing::trace!(
                    session_id = session.session_id(),
                    chain,
                    outgoing = conns.outgoing.len(),
                    "waiting for a connection"
                );
            }
            tokio::select! {
                _ = notified => {}
                _ = inner.cancel.cancelled() => return Err(Status::dead_object()),
            }
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }
}

impl Drop for ExclusiveConnection {
    fn drop(&mut self) {
        if self.reentrant {
            return;
        }
        let inner = self.session.inner();
        inner.conns.lock().release(&self.conn);
        inner.conn_released.notify_waiters();
    }
}

// ============================================================================
// Serving tasks
// ============================================================================

impl RpcSession {
    /// Register `conn` as incoming and spawn the task that serves it.
    pub(crate) fn spawn_serving(&self, conn: Arc<Connection>) {
        let chain = new_chain();
        self.inner().conns.lock().add_incoming(conn.clone(), chain);
        self.inner().serving.send_modify(|count| *count += 1);
        let session = self.clone();
        tokio::spawn(CALL_CHAIN.scope(chain, async move {
            session.serve(conn).await;
        }));
    }

    async fn serve(&self, conn: Arc<Connection>) {
        tracing::debug!(
            session_id = self.session_id(),
            connection = conn.id(),
            "serving connection"
        );
        let reason = loop {
            let message = match conn.read_message().await {
                Ok(message) => message,
                Err(e) if e.is_disconnect() => break "connection closed",
                Err(e) => {
                    tracing::warn!(
                        session_id = self.session_id(),
                        connection = conn.id(),
                        error = %e,
                        "read failed"
                    );
                    break "read failed";
                }
            };
            if let Err(status) = self.process_incoming(&conn, message).await {
                self.log_fatal(&status);
                break "fatal protocol error";
            }
        };
        self.begin_shutdown(reason);
        self.serving_task_exited();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn conn() -> Arc<Connection> {
        let (a, _b) = tokio::io::duplex(64);
        Connection::new(Box::new(a), CancellationToken::new(), 1024)
    }

    #[tokio::test]
    async fn chains_own_one_outgoing_connection() {
        let mut set = ConnectionSet::default();
        let (a, b) = (conn(), conn());
        set.add_outgoing(a.clone());
        set.add_outgoing(b.clone());

        let (first, reentrant) = set.select(1, ConnectionUse::Client).unwrap();
        assert!(Arc::ptr_eq(&first, &a));
        assert!(!reentrant);
        let (again, reentrant) = set.select(1, ConnectionUse::Client).unwrap();
        assert!(Arc::ptr_eq(&again, &a));
        assert!(reentrant);

        let (other, _) = set.select(2, ConnectionUse::Client).unwrap();
        assert!(Arc::ptr_eq(&other, &b));
        assert!(set.select(3, ConnectionUse::Client).is_none());
        assert!(set.select(3, ConnectionUse::Refcount).is_none());

        set.release(&a);
        let (freed, _) = set.select(3, ConnectionUse::Client).unwrap();
        assert!(Arc::ptr_eq(&freed, &a));
    }

    #[tokio::test]
    async fn nested_calls_use_the_serving_connection() {
        let mut set = ConnectionSet::default();
        let (incoming, outgoing) = (conn(), conn());
        set.add_incoming(incoming.clone(), 7);
        set.add_outgoing(outgoing.clone());

        let (nested, reentrant) = set.select(7, ConnectionUse::Client).unwrap();
        assert!(Arc::ptr_eq(&nested, &incoming));
        assert!(reentrant);

        // Oneway calls never go back on a serving connection.
        let (oneway, _) = set.select(7, ConnectionUse::Oneway).unwrap();
        assert!(Arc::ptr_eq(&oneway, &outgoing));
        set.release(&outgoing);

        assert!(set.set_allow_nested(&incoming, false));
        let (fallback, _) = set.select(7, ConnectionUse::Client).unwrap();
        assert!(Arc::ptr_eq(&fallback, &outgoing));
    }

    #[tokio::test]
    async fn oneway_rotates_over_connections() {
        let mut set = ConnectionSet::default();
        let (a, b) = (conn(), conn());
        set.add_outgoing(a.clone());
        set.add_outgoing(b.clone());

        let (first, _) = set.select(1, ConnectionUse::Oneway).unwrap();
        set.release(&first);
        let (second, _) = set.select(1, ConnectionUse::Oneway).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
