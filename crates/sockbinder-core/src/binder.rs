//! Object references: the [`Binder`] trait implemented by local objects,
//! the strong [`SpBinder`] handle and its weak counterpart [`WeakBinder`].
//!
//! An `SpBinder` points at exactly one of
//! - a local object owned by this process,
//! - a proxy for an object owned by the peer of an [`RpcSession`],
//! - an object of a foreign reference domain (see [`crate::LocalServiceRegistry`]).
//!
//! Equality and hashing are by identity: two `SpBinder`s are equal when they
//! point at the same object or the same proxy. The per-session reference
//! table guarantees one proxy per remote object, so identity survives round
//! trips.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::{Parcel, RpcSession, Status, StatusCode, TransactFlags};

/// First code available to user-defined methods.
pub const FIRST_CALL_TRANSACTION: u32 = 0x0000_0001;
/// Last code available to user-defined methods.
pub const LAST_CALL_TRANSACTION: u32 = 0x00ff_ffff;
/// Liveness check, answered by the runtime with an empty reply.
pub const PING_TRANSACTION: u32 = u32::from_be_bytes(*b"_PNG");
/// Answered by the runtime with the object's descriptor string.
pub const INTERFACE_TRANSACTION: u32 = u32::from_be_bytes(*b"_NTF");

/// A local object that can receive transactions.
///
/// Handlers return a boxed `'static` future; implementations keep their
/// state behind an `Arc` and clone what the future needs.
pub trait Binder: Send + Sync + 'static {
    /// Interface descriptor, returned for [`INTERFACE_TRANSACTION`].
    fn descriptor(&self) -> &str;

    /// Handle one user-defined transaction.
    ///
    /// For oneway transactions the returned parcel is discarded.
    fn on_transact(
        &self,
        code: u32,
        data: Parcel,
        cx: CallContext,
    ) -> BoxFuture<'static, Result<Parcel, Status>>;
}

/// What a handler knows about the transaction it is serving.
#[derive(Clone)]
pub struct CallContext {
    this: SpBinder,
    session: Option<RpcSession>,
    flags: TransactFlags,
}

impl CallContext {
    pub(crate) fn new(this: SpBinder, session: Option<RpcSession>, flags: TransactFlags) -> Self {
        Self {
            this,
            session,
            flags,
        }
    }

    /// The object being called.
    pub fn this(&self) -> &SpBinder {
        &self.this
    }

    /// The session the call arrived on, `None` for in-process calls.
    pub fn session(&self) -> Option<&RpcSession> {
        self.session.as_ref()
    }

    pub fn is_oneway(&self) -> bool {
        self.flags.contains(TransactFlags::ONEWAY)
    }

    /// An empty parcel in the format the caller expects for the reply.
    pub fn reply(&self) -> Parcel {
        match &self.session {
            Some(session) => Parcel::for_session(session),
            None => Parcel::new(),
        }
    }
}

pub(crate) enum BinderKind {
    Local(Box<dyn Binder>),
    Foreign(Box<dyn Binder>),
    Remote { session: RpcSession, address: u64 },
}

pub(crate) struct BinderObject {
    kind: BinderKind,
}

impl Drop for BinderObject {
    fn drop(&mut self) {
        if let BinderKind::Remote { session, address } = &self.kind {
            session.on_proxy_dropped(*address, self as *const BinderObject);
        }
    }
}

/// Strong reference to a local object, a remote proxy, or a foreign object.
#[derive(Clone)]
pub struct SpBinder {
    inner: Arc<BinderObject>,
}

impl SpBinder {
    /// Wrap a local object.
    pub fn new<B: Binder>(object: B) -> Self {
        Self::from_kind(BinderKind::Local(Box::new(object)))
    }

    pub(crate) fn new_foreign(object: Box<dyn Binder>) -> Self {
        Self::from_kind(BinderKind::Foreign(object))
    }

    pub(crate) fn new_remote(session: RpcSession, address: u64) -> Self {
        Self::from_kind(BinderKind::Remote { session, address })
    }

    fn from_kind(kind: BinderKind) -> Self {
        Self {
            inner: Arc::new(BinderObject { kind }),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self.inner.kind, BinderKind::Local(_))
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.inner.kind, BinderKind::Remote { .. })
    }

    /// True for objects of a foreign reference domain.
    pub fn is_foreign(&self) -> bool {
        matches!(self.inner.kind, BinderKind::Foreign(_))
    }

    /// The session a proxy belongs to.
    pub fn remote_session(&self) -> Option<&RpcSession> {
        match &self.inner.kind {
            BinderKind::Remote { session, .. } => Some(session),
            _ => None,
        }
    }

    pub(crate) fn remote_address(&self) -> Option<u64> {
        match &self.inner.kind {
            BinderKind::Remote { address, .. } => Some(*address),
            _ => None,
        }
    }

    pub(crate) fn object(&self) -> Option<&dyn Binder> {
        match &self.inner.kind {
            BinderKind::Local(object) | BinderKind::Foreign(object) => Some(object.as_ref()),
            BinderKind::Remote { .. } => None,
        }
    }

    /// Descriptor of a local or foreign object, without a transaction.
    pub fn local_descriptor(&self) -> Option<&str> {
        self.object().map(|o| o.descriptor())
    }

    pub(crate) fn as_ptr(&self) -> *const BinderObject {
        Arc::as_ptr(&self.inner)
    }

    pub(crate) fn downgrade_raw(&self) -> Weak<BinderObject> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_raw(inner: Arc<BinderObject>) -> Self {
        Self { inner }
    }

    /// Create a weak reference.
    ///
    /// A weak reference to a proxy cannot be upgraded once every strong
    /// reference to that proxy has been dropped, even if the remote object
    /// is still alive.
    pub fn downgrade(&self) -> WeakBinder {
        let remote = match &self.inner.kind {
            BinderKind::Remote { session, address } => {
                session.table().inc_weak(*address);
                Some((session.clone(), *address))
            }
            _ => None,
        };
        WeakBinder {
            inner: Arc::downgrade(&self.inner),
            remote,
        }
    }

    /// Send a transaction to this object and wait for the reply.
    ///
    /// Parcels sent to a proxy must be created with [`Parcel::for_binder`]
    /// (or [`Parcel::for_session`] on the proxy's session); anything else
    /// fails with [`StatusCode::BadType`]. Oneway transactions return an
    /// empty parcel as soon as the request is written.
    pub async fn transact(
        &self,
        code: u32,
        data: Parcel,
        flags: TransactFlags,
    ) -> Result<Parcel, Status> {
        match &self.inner.kind {
            BinderKind::Remote { session, address } => {
                if !data.is_for_session(session) {
                    return Err(Status::with_message(
                        StatusCode::BadType,
                        "parcel is not marked for this proxy's session",
                    ));
                }
                session.transact(*address, code, data, flags).await
            }
            BinderKind::Local(object) | BinderKind::Foreign(object) => {
                let cx = CallContext::new(self.clone(), None, flags);
                let reply = dispatch(object.as_ref(), code, data, cx).await?;
                if flags.contains(TransactFlags::ONEWAY) {
                    Ok(Parcel::new())
                } else {
                    Ok(reply)
                }
            }
        }
    }

    pub async fn ping(&self) -> Result<(), Status> {
        self.transact(PING_TRANSACTION, Parcel::for_binder(self), TransactFlags::empty())
            .await
            .map(drop)
    }

    pub async fn get_interface_descriptor(&self) -> Result<String, Status> {
        if let Some(descriptor) = self.local_descriptor() {
            return Ok(descriptor.to_owned());
        }
        let mut reply = self
            .transact(
                INTERFACE_TRANSACTION,
                Parcel::for_binder(self),
                TransactFlags::empty(),
            )
            .await?;
        reply.read_str()
    }
}

/// Route a transaction to a local object, answering the reserved codes.
pub(crate) fn dispatch(
    object: &dyn Binder,
    code: u32,
    data: Parcel,
    cx: CallContext,
) -> BoxFuture<'static, Result<Parcel, Status>> {
    match code {
        PING_TRANSACTION => futures::future::ready(Ok(cx.reply())).boxed(),
        INTERFACE_TRANSACTION => {
            let mut reply = cx.reply();
            reply.write_str(object.descriptor());
            futures::future::ready(Ok(reply)).boxed()
        }
        _ => object.on_transact(code, data, cx),
    }
}

impl PartialEq for SpBinder {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for SpBinder {}

impl Hash for SpBinder {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.inner) as usize).hash(state);
    }
}

impl fmt::Debug for SpBinder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner.kind {
            BinderKind::Local(object) => f
                .debug_tuple("SpBinder::Local")
                .field(&object.descriptor())
                .finish(),
            BinderKind::Foreign(object) => f
                .debug_tuple("SpBinder::Foreign")
                .field(&object.descriptor())
                .finish(),
            BinderKind::Remote { session, address } => f
                .debug_struct("SpBinder::Remote")
                .field("session_id", &session.session_id())
                .field("address", &format_args!("{address:#x}"))
                .finish(),
        }
    }
}

/// Weak reference to an object.
pub struct WeakBinder {
    inner: Weak<BinderObject>,
    remote: Option<(RpcSession, u64)>,
}

impl WeakBinder {
    pub fn upgrade(&self) -> Option<SpBinder> {
        self.inner.upgrade().map(SpBinder::from_raw)
    }
}

impl Clone for WeakBinder {
    fn clone(&self) -> Self {
        if let Some((session, address)) = &self.remote {
            session.table().inc_weak(*address);
        }
        Self {
            inner: self.inner.clone(),
            remote: self.remote.clone(),
        }
    }
}

impl Drop for WeakBinder {
    fn drop(&mut self) {
        if let Some((session, address)) = &self.remote {
            session.table().dec_weak(*address);
        }
    }
}

impl fmt::Debug for WeakBinder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakBinder")
            .field("alive", &(self.inner.strong_count() > 0))
            .field("remote_address", &self.remote.as_ref().map(|(_, a)| *a))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl Binder for Echo {
        fn descriptor(&self) -> &str {
            "sockbinder.test.Echo"
        }

        fn on_transact(
            &self,
            code: u32,
            mut data: Parcel,
            cx: CallContext,
        ) -> BoxFuture<'static, Result<Parcel, Status>> {
            async move {
                if code != FIRST_CALL_TRANSACTION {
                    return Err(StatusCode::UnknownTransaction.into());
                }
                let value = data.read_i32()?;
                let mut reply = cx.reply();
                reply.write_i32(value * 2);
                Ok(reply)
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn local_transact_runs_handler_in_process() {
        let binder = SpBinder::new(Echo);
        let mut data = Parcel::for_binder(&binder);
        data.write_i32(21);
        let mut reply = binder
            .transact(FIRST_CALL_TRANSACTION, data, TransactFlags::empty())
            .await
            .unwrap();
        assert_eq!(reply.read_i32().unwrap(), 42);
    }

    #[tokio::test]
    async fn reserved_codes_are_answered_by_runtime() {
        let binder = SpBinder::new(Echo);
        binder.ping().await.unwrap();
        assert_eq!(
            binder.get_interface_descriptor().await.unwrap(),
            "sockbinder.test.Echo"
        );
        let err = binder
            .transact(1234, Parcel::new(), TransactFlags::empty())
            .await
            .unwrap_err();
        assert_eq!(err, StatusCode::UnknownTransaction);
    }

    #[test]
    fn identity_equality() {
        let a = SpBinder::new(Echo);
        let b = SpBinder::new(Echo);
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert!(a.is_local());
        assert!(!a.is_remote());
    }

    #[test]
    fn weak_local_reference_dies_with_object() {
        let a = SpBinder::new(Echo);
        let weak = a.downgrade();
        assert_eq!(weak.upgrade(), Some(a.clone()));
        drop(a);
        assert!(weak.upgrade().is_none());
    }
}
