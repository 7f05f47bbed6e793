//! Services used by the scenarios, with hand-written typed proxies.
//!
//! Every service works both as a server root and as an object a client
//! hands to the server, so nested and callback scenarios can bounce calls
//! in both directions.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use sockbinder_core::{
    Binder, CallContext, FIRST_CALL_TRANSACTION, Parcel, RpcServer, SpBinder, Status, StatusCode,
    TransactFlags, WeakServer,
};
use tokio::sync::{Notify, Semaphore};

// ============================================================================
// Test service
// ============================================================================

pub const TEST_SERVICE_DESCRIPTOR: &str = "sockbinder.test.IRpcTest";

const SEND_STRING: u32 = FIRST_CALL_TRANSACTION;
const DOUBLE_STRING: u32 = FIRST_CALL_TRANSACTION + 1;
const COUNT_BINDERS: u32 = FIRST_CALL_TRANSACTION + 2;
const PING_ME: u32 = FIRST_CALL_TRANSACTION + 3;
const REPEAT_BINDER: u32 = FIRST_CALL_TRANSACTION + 4;
const HOLD_BINDER: u32 = FIRST_CALL_TRANSACTION + 5;
const GET_HELD_BINDER: u32 = FIRST_CALL_TRANSACTION + 6;
const NEST_ME: u32 = FIRST_CALL_TRANSACTION + 7;
const ALWAYS_GIVE_ME_THE_SAME_BINDER: u32 = FIRST_CALL_TRANSACTION + 8;
const OPEN_SESSION: u32 = FIRST_CALL_TRANSACTION + 9;
const GET_NUM_OPEN_SESSIONS: u32 = FIRST_CALL_TRANSACTION + 10;
const LOCK: u32 = FIRST_CALL_TRANSACTION + 11;
const UNLOCK_IN_MS_ASYNC: u32 = FIRST_CALL_TRANSACTION + 12;
const LOCK_UNLOCK: u32 = FIRST_CALL_TRANSACTION + 13;
const SLEEP_MS: u32 = FIRST_CALL_TRANSACTION + 14;
const SLEEP_MS_ASYNC: u32 = FIRST_CALL_TRANSACTION + 15;
const DO_CALLBACK: u32 = FIRST_CALL_TRANSACTION + 16;
const DO_CALLBACK_ASYNC: u32 = FIRST_CALL_TRANSACTION + 17;
const DIE: u32 = FIRST_CALL_TRANSACTION + 18;
const SCHEDULE_SHUTDOWN: u32 = FIRST_CALL_TRANSACTION + 19;

/// Delay between answering `schedule_shutdown` and starting the shutdown,
/// so the reply is written first.
const SHUTDOWN_DELAY: Duration = Duration::from_millis(20);

struct TestState {
    server: Mutex<Option<WeakServer>>,
    held: Mutex<Option<SpBinder>>,
    same: SpBinder,
    open_sessions: Arc<AtomicI32>,
    block: Semaphore,
}

/// The root object of the fixture server.
#[derive(Clone)]
pub struct TestService {
    state: Arc<TestState>,
}

impl Default for TestService {
    fn default() -> Self {
        Self::new()
    }
}

impl TestService {
    pub fn new() -> Self {
        Self {
            state: Arc::new(TestState {
                server: Mutex::new(None),
                held: Mutex::new(None),
                same: SpBinder::new(Plain),
                open_sessions: Arc::new(AtomicI32::new(0)),
                block: Semaphore::new(1),
            }),
        }
    }

    /// Let the service reach the server it is the root of.
    pub fn attach(&self, server: &RpcServer) {
        *self.state.server.lock() = Some(server.downgrade());
    }

    /// [`SessionObject`]s opened through this service and still alive.
    pub fn open_sessions(&self) -> i32 {
        self.state.open_sessions.load(Ordering::SeqCst)
    }

    fn server(&self) -> Result<RpcServer, Status> {
        self.state
            .server
            .lock()
            .as_ref()
            .and_then(WeakServer::upgrade)
            .ok_or_else(|| Status::with_message(StatusCode::UnexpectedNull, "no server attached"))
    }

    async fn handle(self, code: u32, mut data: Parcel, cx: CallContext) -> Result<Parcel, Status> {
        let mut reply = cx.reply();
        match code {
            SEND_STRING => {
                data.read_str()?;
            }
            DOUBLE_STRING => {
                let value = data.read_str()?;
                reply.write_str(&format!("{value}{value}"));
            }
            COUNT_BINDERS => {
                let server = self.server()?;
                let sessions = server.list_sessions();
                reply.write_i32(sessions.len() as i32);
                for session in &sessions {
                    let count = session.count_binders();
                    if count != 1 {
                        tracing::debug!(
                            session_id = session.session_id(),
                            count,
                            dump = %session.dump(),
                            "unexpected binder count"
                        );
                    }
                    reply.write_i32(count as i32);
                }
            }
            PING_ME => {
                let binder = data
                    .read_binder()?
                    .ok_or_else(|| Status::new(StatusCode::UnexpectedNull))?;
                let status = match binder.ping().await {
                    Ok(()) => StatusCode::Ok,
                    Err(e) => e.code(),
                };
                reply.write_i32(status.as_i32());
            }
            REPEAT_BINDER => {
                let binder = data.read_binder()?;
                reply.write_binder(binder.as_ref())?;
            }
            HOLD_BINDER => {
                let binder = data.read_binder()?;
                let previous = std::mem::replace(&mut *self.state.held.lock(), binder);
                drop(previous);
            }
            GET_HELD_BINDER => {
                let held = self.state.held.lock().clone();
                reply.write_binder(held.as_ref())?;
            }
            NEST_ME => {
                let binder = data.read_strong_binder()?;
                let count = data.read_i32()?;
                if count > 0 {
                    TestServiceProxy::new(binder)
                        .nest_me(cx.this(), count - 1)
                        .await?;
                }
            }
            ALWAYS_GIVE_ME_THE_SAME_BINDER => {
                reply.write_binder(Some(&self.state.same))?;
            }
            OPEN_SESSION => {
                let name = data.read_str()?;
                let session = SessionObject::new(name, self.state.open_sessions.clone());
                reply.write_binder(Some(&SpBinder::new(session)))?;
            }
            GET_NUM_OPEN_SESSIONS => {
                reply.write_i32(self.open_sessions());
            }
            LOCK => {
                self.state
                    .block
                    .acquire()
                    .await
                    .map_err(|_| Status::new(StatusCode::DeadObject))?
                    .forget();
            }
            UNLOCK_IN_MS_ASYNC => {
                let ms = data.read_i32()?;
                sleep_ms(ms).await;
                self.state.block.add_permits(1);
            }
            LOCK_UNLOCK => {
                let _permit = self
                    .state
                    .block
                    .acquire()
                    .await
                    .map_err(|_| Status::new(StatusCode::DeadObject))?;
            }
            SLEEP_MS | SLEEP_MS_ASYNC => {
                sleep_ms(data.read_i32()?).await;
            }
            DO_CALLBACK | DO_CALLBACK_ASYNC => {
                let callback = data
                    .read_binder()?
                    .ok_or_else(|| Status::new(StatusCode::UnexpectedNull))?;
                let oneway = data.read_bool()?;
                let delayed = data.read_bool()?;
                let value = data.read_str()?;
                let callback = CallbackProxy::new(callback);
                if delayed {
                    tokio::spawn(async move {
                        tracing::debug!(value = %value, "executing delayed callback");
                        let result = callback.send(oneway, &value).await;
                        tracing::debug!(?result, "delayed callback finished");
                    });
                } else {
                    callback.send(oneway, &value).await?;
                }
            }
            DIE => {
                // The caller must never see a reply: drop the session, then
                // take the whole server down like a crashed process.
                if let Some(session) = cx.session() {
                    session.shutdown_and_wait(false).await;
                }
                let server = self.server()?;
                tokio::spawn(async move {
                    server.shutdown().await;
                });
            }
            SCHEDULE_SHUTDOWN => {
                let server = self.server()?;
                tokio::spawn(async move {
                    tokio::time::sleep(SHUTDOWN_DELAY).await;
                    if !server.shutdown().await {
                        tracing::warn!("scheduled shutdown found nothing to stop");
                    }
                });
            }
            _ => return Err(StatusCode::UnknownTransaction.into()),
        }
        Ok(reply)
    }
}

async fn sleep_ms(ms: i32) {
    tokio::time::sleep(Duration::from_millis(ms.max(0) as u64)).await;
}

impl Binder for TestService {
    fn descriptor(&self) -> &str {
        TEST_SERVICE_DESCRIPTOR
    }

    fn on_transact(
        &self,
        code: u32,
        data: Parcel,
        cx: CallContext,
    ) -> BoxFuture<'static, Result<Parcel, Status>> {
        Box::pin(self.clone().handle(code, data, cx))
    }
}

/// Typed client for [`TestService`], over any handle to one.
#[derive(Clone, Debug)]
pub struct TestServiceProxy {
    binder: SpBinder,
}

impl TestServiceProxy {
    pub fn new(binder: SpBinder) -> Self {
        Self { binder }
    }

    pub fn as_binder(&self) -> &SpBinder {
        &self.binder
    }

    fn parcel(&self) -> Parcel {
        Parcel::for_binder(&self.binder)
    }

    async fn call(&self, code: u32, data: Parcel) -> Result<Parcel, Status> {
        self.binder
            .transact(code, data, TransactFlags::empty())
            .await
    }

    async fn call_oneway(&self, code: u32, data: Parcel) -> Result<(), Status> {
        self.binder
            .transact(code, data, TransactFlags::ONEWAY)
            .await
            .map(drop)
    }

    /// Oneway.
    pub async fn send_string(&self, value: &str) -> Result<(), Status> {
        let mut data = self.parcel();
        data.write_str(value);
        self.call_oneway(SEND_STRING, data).await
    }

    pub async fn double_string(&self, value: &str) -> Result<String, Status> {
        let mut data = self.parcel();
        data.write_str(value);
        self.call(DOUBLE_STRING, data).await?.read_str()
    }

    /// Binder count of every session of the serving server.
    pub async fn count_binders(&self) -> Result<Vec<i32>, Status> {
        let mut reply = self.call(COUNT_BINDERS, self.parcel()).await?;
        let len = reply.read_i32()?;
        (0..len).map(|_| reply.read_i32()).collect()
    }

    /// Have the service ping `binder`; returns the ping's status.
    pub async fn ping_me(&self, binder: &SpBinder) -> Result<StatusCode, Status> {
        let mut data = self.parcel();
        data.write_binder(Some(binder))?;
        let status = self.call(PING_ME, data).await?.read_i32()?;
        Ok(StatusCode::from_i32(status))
    }

    pub async fn repeat_binder(&self, binder: Option<&SpBinder>) -> Result<Option<SpBinder>, Status> {
        let mut data = self.parcel();
        data.write_binder(binder)?;
        self.call(REPEAT_BINDER, data).await?.read_binder()
    }

    pub async fn hold_binder(&self, binder: Option<&SpBinder>) -> Result<(), Status> {
        let mut data = self.parcel();
        data.write_binder(binder)?;
        self.call(HOLD_BINDER, data).await.map(drop)
    }

    pub async fn get_held_binder(&self) -> Result<Option<SpBinder>, Status> {
        self.call(GET_HELD_BINDER, self.parcel()).await?.read_binder()
    }

    /// Ping-pong `count` nested calls between the service and `binder`.
    pub async fn nest_me(&self, binder: &SpBinder, count: i32) -> Result<(), Status> {
        let mut data = self.parcel();
        data.write_binder(Some(binder))?;
        data.write_i32(count);
        self.call(NEST_ME, data).await.map(drop)
    }

    pub async fn always_give_me_the_same_binder(&self) -> Result<SpBinder, Status> {
        self.call(ALWAYS_GIVE_ME_THE_SAME_BINDER, self.parcel())
            .await?
            .read_strong_binder()
    }

    pub async fn open_session(&self, name: &str) -> Result<SessionProxy, Status> {
        let mut data = self.parcel();
        data.write_str(name);
        let binder = self.call(OPEN_SESSION, data).await?.read_strong_binder()?;
        Ok(SessionProxy::new(binder))
    }

    pub async fn get_num_open_sessions(&self) -> Result<i32, Status> {
        self.call(GET_NUM_OPEN_SESSIONS, self.parcel())
            .await?
            .read_i32()
    }

    pub async fn lock(&self) -> Result<(), Status> {
        self.call(LOCK, self.parcel()).await.map(drop)
    }

    /// Oneway. Releases the lock taken by [`TestServiceProxy::lock`] after
    /// `ms` milliseconds.
    pub async fn unlock_in_ms_async(&self, ms: i32) -> Result<(), Status> {
        let mut data = self.parcel();
        data.write_i32(ms);
        self.call_oneway(UNLOCK_IN_MS_ASYNC, data).await
    }

    pub async fn lock_unlock(&self) -> Result<(), Status> {
        self.call(LOCK_UNLOCK, self.parcel()).await.map(drop)
    }

    pub async fn sleep_ms(&self, ms: i32) -> Result<(), Status> {
        let mut data = self.parcel();
        data.write_i32(ms);
        self.call(SLEEP_MS, data).await.map(drop)
    }

    /// Oneway.
    pub async fn sleep_ms_async(&self, ms: i32) -> Result<(), Status> {
        let mut data = self.parcel();
        data.write_i32(ms);
        self.call_oneway(SLEEP_MS_ASYNC, data).await
    }

    fn callback_parcel(
        &self,
        callback: &SpBinder,
        oneway: bool,
        delayed: bool,
        value: &str,
    ) -> Result<Parcel, Status> {
        let mut data = self.parcel();
        data.write_binder(Some(callback))?;
        data.write_bool(oneway);
        data.write_bool(delayed);
        data.write_str(value);
        Ok(data)
    }

    /// Have the service call `callback` back with `value`, as a oneway call
    /// when `oneway` and from a separate task when `delayed`.
    pub async fn do_callback(
        &self,
        callback: &SpBinder,
        oneway: bool,
        delayed: bool,
        value: &str,
    ) -> Result<(), Status> {
        let data = self.callback_parcel(callback, oneway, delayed, value)?;
        self.call(DO_CALLBACK, data).await.map(drop)
    }

    /// Oneway variant of [`TestServiceProxy::do_callback`].
    pub async fn do_callback_async(
        &self,
        callback: &SpBinder,
        oneway: bool,
        delayed: bool,
        value: &str,
    ) -> Result<(), Status> {
        let data = self.callback_parcel(callback, oneway, delayed, value)?;
        self.call_oneway(DO_CALLBACK_ASYNC, data).await
    }

    /// Kill the serving side mid-call. Never returns a reply.
    pub async fn die(&self) -> Result<(), Status> {
        self.call(DIE, self.parcel()).await.map(drop)
    }

    /// Ask the server to shut itself down shortly after replying.
    pub async fn schedule_shutdown(&self) -> Result<(), Status> {
        self.call(SCHEDULE_SHUTDOWN, self.parcel()).await.map(drop)
    }
}

// ============================================================================
// Session objects
// ============================================================================

pub const SESSION_DESCRIPTOR: &str = "sockbinder.test.IRpcSession";

const GET_NAME: u32 = FIRST_CALL_TRANSACTION;

/// Named object that counts its live instances.
pub struct SessionObject {
    name: String,
    alive: Arc<AtomicI32>,
}

impl SessionObject {
    pub fn new(name: impl Into<String>, alive: Arc<AtomicI32>) -> Self {
        alive.fetch_add(1, Ordering::SeqCst);
        Self {
            name: name.into(),
            alive,
        }
    }
}

impl Drop for SessionObject {
    fn drop(&mut self) {
        self.alive.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Binder for SessionObject {
    fn descriptor(&self) -> &str {
        SESSION_DESCRIPTOR
    }

    fn on_transact(
        &self,
        code: u32,
        _data: Parcel,
        cx: CallContext,
    ) -> BoxFuture<'static, Result<Parcel, Status>> {
        let name = self.name.clone();
        Box::pin(async move {
            match code {
                GET_NAME => {
                    let mut reply = cx.reply();
                    reply.write_str(&name);
                    Ok(reply)
                }
                _ => Err(StatusCode::UnknownTransaction.into()),
            }
        })
    }
}

#[derive(Clone, Debug)]
pub struct SessionProxy {
    binder: SpBinder,
}

impl SessionProxy {
    pub fn new(binder: SpBinder) -> Self {
        Self { binder }
    }

    pub fn as_binder(&self) -> &SpBinder {
        &self.binder
    }

    pub async fn get_name(&self) -> Result<String, Status> {
        self.binder
            .transact(GET_NAME, Parcel::for_binder(&self.binder), TransactFlags::empty())
            .await?
            .read_str()
    }
}

// ============================================================================
// Callbacks
// ============================================================================

pub const CALLBACK_DESCRIPTOR: &str = "sockbinder.test.IRpcCallback";

const SEND_CALLBACK: u32 = FIRST_CALL_TRANSACTION;
const SEND_ONEWAY_CALLBACK: u32 = FIRST_CALL_TRANSACTION + 1;

#[derive(Default)]
struct Recorded {
    values: Mutex<Vec<String>>,
    changed: Notify,
}

/// Records every value it is called back with.
#[derive(Clone, Default)]
pub struct Callback {
    recorded: Arc<Recorded>,
}

impl Callback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn values(&self) -> Vec<String> {
        self.recorded.values.lock().clone()
    }

    /// Wait up to `timeout` for at least one value, then return all of them.
    pub async fn wait_for_values(&self, timeout: Duration) -> Vec<String> {
        let _ = tokio::time::timeout(timeout, async {
            loop {
                let changed = self.recorded.changed.notified();
                let mut changed = std::pin::pin!(changed);
                changed.as_mut().enable();
                if !self.recorded.values.lock().is_empty() {
                    return;
                }
                changed.await;
            }
        })
        .await;
        self.values()
    }
}

impl Binder for Callback {
    fn descriptor(&self) -> &str {
        CALLBACK_DESCRIPTOR
    }

    fn on_transact(
        &self,
        code: u32,
        mut data: Parcel,
        cx: CallContext,
    ) -> BoxFuture<'static, Result<Parcel, Status>> {
        let recorded = self.recorded.clone();
        Box::pin(async move {
            match code {
                SEND_CALLBACK | SEND_ONEWAY_CALLBACK => {
                    let value = data.read_str()?;
                    recorded.values.lock().push(value);
                    recorded.changed.notify_waiters();
                    Ok(cx.reply())
                }
                _ => Err(StatusCode::UnknownTransaction.into()),
            }
        })
    }
}

#[derive(Clone, Debug)]
pub struct CallbackProxy {
    binder: SpBinder,
}

impl CallbackProxy {
    pub fn new(binder: SpBinder) -> Self {
        Self { binder }
    }

    /// Call back oneway when `oneway` is set.
    pub async fn send(&self, oneway: bool, value: &str) -> Result<(), Status> {
        let mut data = Parcel::for_binder(&self.binder);
        data.write_str(value);
        let (code, flags) = if oneway {
            (SEND_ONEWAY_CALLBACK, TransactFlags::ONEWAY)
        } else {
            (SEND_CALLBACK, TransactFlags::empty())
        };
        self.binder.transact(code, data, flags).await.map(drop)
    }
}

// ============================================================================
// Plain objects
// ============================================================================

/// An object with no methods beyond ping and descriptor.
pub struct Plain;

impl Binder for Plain {
    fn descriptor(&self) -> &str {
        "sockbinder.test.Plain"
    }

    fn on_transact(
        &self,
        _code: u32,
        _data: Parcel,
        _cx: CallContext,
    ) -> BoxFuture<'static, Result<Parcel, Status>> {
        Box::pin(async { Err(StatusCode::UnknownTransaction.into()) })
    }
}
