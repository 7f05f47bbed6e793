//! sockbinder-testkit: shared scenarios for sockbinder sessions.
//!
//! Provides the test services, an in-process server fixture and a `run_*`
//! function per behaviour. Every scenario starts a server on the given
//! [`SocketType`], exercises it through one or more client sessions and
//! finishes with the fixture's teardown checks: the server holds exactly
//! its root object per session, clients hold nothing, and no client
//! session is leaked.
//!
//! # Usage
//!
//! A test binary instantiates every scenario for one socket type:
//!
//! ```ignore
//! sockbinder_testkit::socket_tests!(Unix);
//! ```
//!
//! or runs single scenarios:
//!
//! ```ignore
//! #[tokio::test(flavor = "multi_thread")]
//! async fn ping() {
//!     sockbinder_testkit::run_ping(sockbinder_testkit::SocketType::Inet).await;
//! }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

use sockbinder_core::{
    LocalServiceRegistry, PING_TRANSACTION, Parcel, REGISTRY_ADD_SERVICE, SpBinder, Status,
    StatusCode, TransactFlags,
};

pub mod fixture;
pub mod services;

pub use fixture::{ProcessSession, SessionInfo, SocketType, TestProcess, eventually, expect_failure};
pub use services::{
    Callback, CallbackProxy, Plain, SessionObject, SessionProxy, TEST_SERVICE_DESCRIPTOR,
    TestService, TestServiceProxy,
};

/// Error type for test scenarios.
#[derive(Debug, thiserror::Error)]
pub enum TestError {
    /// Fixture creation failed.
    #[error("setup error: {0}")]
    Setup(String),
    /// A call failed.
    #[error("call failed: {0}")]
    Status(#[from] Status),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

/// Install a `fmt` subscriber filtered by `RUST_LOG`. Safe to call from
/// every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn check_eq<T: PartialEq + std::fmt::Debug>(what: &str, actual: T, expected: T) -> Result<(), TestError> {
    if actual == expected {
        Ok(())
    } else {
        Err(TestError::Assertion(format!(
            "{what}: expected {expected:?}, got {actual:?}"
        )))
    }
}

fn check(what: &str, condition: bool) -> Result<(), TestError> {
    if condition {
        Ok(())
    } else {
        Err(TestError::Assertion(what.to_owned()))
    }
}

async fn join_all<T>(tasks: Vec<tokio::task::JoinHandle<Result<T, Status>>>) -> Result<Vec<T>, TestError> {
    let mut out = Vec::with_capacity(tasks.len());
    for task in tasks {
        let value = task
            .await
            .map_err(|e| TestError::Setup(format!("client task panicked: {e}")))??;
        out.push(value);
    }
    Ok(out)
}

async fn report(name: &str, scenario: impl Future<Output = Result<(), TestError>>) {
    init_tracing();
    if let Err(e) = scenario.await {
        panic!("{name} failed: {e}");
    }
}

/// Instantiate every scenario as a `#[tokio::test]` for one [`SocketType`]
/// variant. Scenarios are skipped when the socket type is unavailable.
#[macro_export]
macro_rules! socket_tests {
    ($variant:ident) => {
        $crate::socket_tests!(@tests $variant;
            ping => run_ping,
            get_interface_descriptor => run_get_interface_descriptor,
            multiple_sessions => run_multiple_sessions,
            remote_max_threads => run_remote_max_threads,
            transactions_must_be_marked_rpc => run_transactions_must_be_marked_rpc,
            append_separate_formats => run_append_separate_formats,
            unknown_transaction => run_unknown_transaction,
            send_something_oneway => run_send_something_oneway,
            send_and_get_result_back => run_send_and_get_result_back,
            send_and_get_result_back_big => run_send_and_get_result_back_big,
            call_me_back => run_call_me_back,
            repeat_binder => run_repeat_binder,
            repeat_their_binder => run_repeat_their_binder,
            repeat_binder_null => run_repeat_binder_null,
            hold_binder => run_hold_binder,
            cannot_mix_binders_between_unrelated_sessions => run_cannot_mix_binders_between_unrelated_sessions,
            cannot_mix_binders_between_sessions_to_one_server => run_cannot_mix_binders_between_sessions_to_one_server,
            cannot_send_foreign_binder_over_session => run_cannot_send_foreign_binder_over_session,
            cannot_register_proxy_in_local_registry => run_cannot_register_proxy_in_local_registry,
            repeat_root_object => run_repeat_root_object,
            nested_transactions => run_nested_transactions,
            same_binder_equality => run_same_binder_equality,
            same_binder_equality_weak => run_same_binder_equality_weak,
            single_session => run_single_session,
            many_sessions => run_many_sessions,
            thread_pool_greater_than_equal_requested => run_thread_pool_greater_than_equal_requested,
            thread_pool_over_saturated => run_thread_pool_over_saturated,
            threading_stress => run_threading_stress,
            oneway_stress => run_oneway_stress,
            oneway_call_does_not_wait => run_oneway_call_does_not_wait,
            oneway_call_queueing => run_oneway_call_queueing,
            oneway_call_exhaustion => run_oneway_call_exhaustion,
            callbacks => run_callbacks,
            oneway_callback_with_no_thread => run_oneway_callback_with_no_thread,
            die => run_die,
        );
    };
    (@tests $variant:ident; $($name:ident => $run:ident,)*) => {
        $(
            #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
            async fn $name() {
                let socket = $crate::SocketType::$variant;
                if !socket.is_available().await {
                    eprintln!("skipping: {} sockets unavailable", socket.name());
                    return;
                }
                $crate::$run(socket).await;
            }
        )*
    };
}

// ============================================================================
// Basic calls
// ============================================================================

pub async fn run_ping(socket: SocketType) {
    report("run_ping", ping(socket)).await
}

async fn ping(socket: SocketType) -> Result<(), TestError> {
    let proc = TestProcess::spawn(socket, 1).await?;
    proc.root_binder.ping().await?;
    proc.finish().await
}

pub async fn run_get_interface_descriptor(socket: SocketType) {
    report("run_get_interface_descriptor", get_interface_descriptor(socket)).await
}

async fn get_interface_descriptor(socket: SocketType) -> Result<(), TestError> {
    let proc = TestProcess::spawn(socket, 1).await?;
    let descriptor = proc.root_binder.get_interface_descriptor().await?;
    check_eq("descriptor", descriptor.as_str(), TEST_SERVICE_DESCRIPTOR)?;
    proc.finish().await
}

pub async fn run_multiple_sessions(socket: SocketType) {
    report("run_multiple_sessions", multiple_sessions(socket)).await
}

async fn multiple_sessions(socket: SocketType) -> Result<(), TestError> {
    let proc = TestProcess::spawn_with(socket, 1, 5, 0).await?;
    for info in &proc.proc.sessions {
        let root = info
            .root
            .as_ref()
            .ok_or_else(|| TestError::Assertion("session without root".into()))?;
        root.ping().await?;
    }
    proc.finish().await
}

/// The handshake reports the server's pool size and the special
/// transaction agrees.
pub async fn run_remote_max_threads(socket: SocketType) {
    report("run_remote_max_threads", remote_max_threads(socket)).await
}

async fn remote_max_threads(socket: SocketType) -> Result<(), TestError> {
    let proc = TestProcess::spawn(socket, 3).await?;
    let session = &proc.proc.sessions[0].session;
    check_eq("handshake threads", session.connected_server_threads(), 3)?;
    check_eq("queried threads", session.get_remote_max_threads().await?, 3)?;
    proc.finish().await
}

pub async fn run_transactions_must_be_marked_rpc(socket: SocketType) {
    report(
        "run_transactions_must_be_marked_rpc",
        transactions_must_be_marked_rpc(socket),
    )
    .await
}

async fn transactions_must_be_marked_rpc(socket: SocketType) -> Result<(), TestError> {
    let proc = TestProcess::spawn(socket, 1).await?;
    let result = proc
        .root_binder
        .transact(PING_TRANSACTION, Parcel::new(), TransactFlags::empty())
        .await;
    expect_failure(result, StatusCode::BadType)?;
    proc.finish().await
}

pub async fn run_append_separate_formats(socket: SocketType) {
    report("run_append_separate_formats", append_separate_formats(socket)).await
}

async fn append_separate_formats(socket: SocketType) -> Result<(), TestError> {
    let proc = TestProcess::spawn(socket, 1).await?;
    let mut marked = Parcel::for_binder(&proc.root_binder);
    marked.write_i32(3);
    let mut local = Parcel::new();
    expect_failure(marked.append_from(&local, 0, local.data_size()), StatusCode::BadType)?;
    expect_failure(local.append_from(&marked, 0, marked.data_size()), StatusCode::BadType)?;
    drop(marked);
    proc.finish().await
}

pub async fn run_unknown_transaction(socket: SocketType) {
    report("run_unknown_transaction", unknown_transaction(socket)).await
}

async fn unknown_transaction(socket: SocketType) -> Result<(), TestError> {
    let proc = TestProcess::spawn(socket, 1).await?;
    let result = proc
        .root_binder
        .transact(1337, Parcel::for_binder(&proc.root_binder), TransactFlags::empty())
        .await;
    expect_failure(result, StatusCode::UnknownTransaction)?;
    proc.finish().await
}

pub async fn run_send_something_oneway(socket: SocketType) {
    report("run_send_something_oneway", send_something_oneway(socket)).await
}

async fn send_something_oneway(socket: SocketType) -> Result<(), TestError> {
    let proc = TestProcess::spawn(socket, 1).await?;
    proc.root.send_string("asdf").await?;
    proc.finish().await
}

pub async fn run_send_and_get_result_back(socket: SocketType) {
    report("run_send_and_get_result_back", double_string(socket, "cool ".into())).await
}

pub async fn run_send_and_get_result_back_big(socket: SocketType) {
    report(
        "run_send_and_get_result_back_big",
        double_string(socket, "a".repeat(1024)),
    )
    .await
}

async fn double_string(socket: SocketType, single: String) -> Result<(), TestError> {
    let proc = TestProcess::spawn(socket, 1).await?;
    let doubled = proc.root.double_string(&single).await?;
    check_eq("doubled", doubled, format!("{single}{single}"))?;
    proc.finish().await
}

// ============================================================================
// Object references
// ============================================================================

pub async fn run_call_me_back(socket: SocketType) {
    report("run_call_me_back", call_me_back(socket)).await
}

async fn call_me_back(socket: SocketType) -> Result<(), TestError> {
    let proc = TestProcess::spawn(socket, 1).await?;
    let alive = Arc::new(AtomicI32::new(0));
    let status = proc
        .root
        .ping_me(&SpBinder::new(SessionObject::new("foo", alive.clone())))
        .await?;
    check_eq("ping status", status, StatusCode::Ok)?;
    check_eq("live session objects", alive.load(Ordering::SeqCst), 0)?;
    proc.finish().await
}

pub async fn run_repeat_binder(socket: SocketType) {
    report("run_repeat_binder", repeat_binder(socket)).await
}

async fn repeat_binder(socket: SocketType) -> Result<(), TestError> {
    let proc = TestProcess::spawn(socket, 1).await?;
    let alive = Arc::new(AtomicI32::new(0));
    let in_binder = SpBinder::new(SessionObject::new("foo", alive.clone()));
    let out_binder = proc.root.repeat_binder(Some(&in_binder)).await?;
    check_eq("repeated binder", out_binder.as_ref(), Some(&in_binder))?;

    let weak = in_binder.downgrade();
    drop(in_binder);
    drop(out_binder);

    // The reply carries the peer's pending releases.
    proc.root_binder.ping().await?;

    check("local object released", weak.upgrade().is_none())?;
    check_eq("live session objects", alive.load(Ordering::SeqCst), 0)?;
    proc.finish().await
}

pub async fn run_repeat_their_binder(socket: SocketType) {
    report("run_repeat_their_binder", repeat_their_binder(socket)).await
}

async fn repeat_their_binder(socket: SocketType) -> Result<(), TestError> {
    let proc = TestProcess::spawn(socket, 1).await?;
    let session = proc.root.open_session("aoeu").await?;
    let in_binder = session.as_binder().clone();
    let out_binder = proc.root.repeat_binder(Some(&in_binder)).await?;
    check_eq("repeated binder", out_binder.as_ref(), Some(&in_binder))?;

    let weak = in_binder.downgrade();
    drop(session);
    drop(in_binder);
    drop(out_binder);

    proc.root_binder.ping().await?;

    check("proxy released", weak.upgrade().is_none())?;
    drop(weak);
    proc.finish().await
}

pub async fn run_repeat_binder_null(socket: SocketType) {
    report("run_repeat_binder_null", repeat_binder_null(socket)).await
}

async fn repeat_binder_null(socket: SocketType) -> Result<(), TestError> {
    let proc = TestProcess::spawn(socket, 1).await?;
    let out_binder = proc.root.repeat_binder(None).await?;
    check("null binder came back null", out_binder.is_none())?;
    proc.finish().await
}

pub async fn run_hold_binder(socket: SocketType) {
    report("run_hold_binder", hold_binder(socket)).await
}

async fn hold_binder(socket: SocketType) -> Result<(), TestError> {
    let proc = TestProcess::spawn(socket, 1).await?;
    let weak = {
        let binder = SpBinder::new(Plain);
        proc.root.hold_binder(Some(&binder)).await?;
        binder.downgrade()
    };

    let held = proc.root.get_held_binder().await?;
    check("held binder is alive", weak.upgrade().is_some())?;
    check_eq("held binder", &held, &weak.upgrade())?;
    drop(held);

    // Stop holding it, and flush the release.
    proc.root.hold_binder(None).await?;
    proc.root_binder.ping().await?;
    check("held binder released", weak.upgrade().is_none())?;
    proc.finish().await
}

pub async fn run_repeat_root_object(socket: SocketType) {
    report("run_repeat_root_object", repeat_root_object(socket)).await
}

async fn repeat_root_object(socket: SocketType) -> Result<(), TestError> {
    let proc = TestProcess::spawn(socket, 1).await?;
    let out_binder = proc.root.repeat_binder(Some(&proc.root_binder)).await?;
    check_eq("repeated root", out_binder.as_ref(), Some(&proc.root_binder))?;
    drop(out_binder);
    proc.finish().await
}

pub async fn run_nested_transactions(socket: SocketType) {
    report("run_nested_transactions", nested_transactions(socket)).await
}

async fn nested_transactions(socket: SocketType) -> Result<(), TestError> {
    let proc = TestProcess::spawn(socket, 1).await?;
    let nester = SpBinder::new(TestService::new());
    proc.root.nest_me(&nester, 10).await?;

    let weak = nester.downgrade();
    drop(nester);
    check("nested object released", weak.upgrade().is_none())?;
    proc.finish().await
}

pub async fn run_same_binder_equality(socket: SocketType) {
    report("run_same_binder_equality", same_binder_equality(socket)).await
}

async fn same_binder_equality(socket: SocketType) -> Result<(), TestError> {
    let proc = TestProcess::spawn(socket, 1).await?;
    let a = proc.root.always_give_me_the_same_binder().await?;
    let b = proc.root.always_give_me_the_same_binder().await?;
    check_eq("same binder", &a, &b)?;
    drop((a, b));
    proc.finish().await
}

/// Weak references to proxies are not re-promotable: once the last strong
/// reference is gone, the weak one stays dead even though the object lives.
pub async fn run_same_binder_equality_weak(socket: SocketType) {
    report("run_same_binder_equality_weak", same_binder_equality_weak(socket)).await
}

async fn same_binder_equality_weak(socket: SocketType) -> Result<(), TestError> {
    let proc = TestProcess::spawn(socket, 1).await?;
    let a = proc.root.always_give_me_the_same_binder().await?;
    let weak = a.downgrade();
    drop(a);

    let b = proc.root.always_give_me_the_same_binder().await?;
    check("weak proxy stays dead", weak.upgrade().is_none())?;
    b.ping().await?;
    drop(weak);
    drop(b);
    proc.finish().await
}

// ============================================================================
// Sub-sessions and cross-session limits
// ============================================================================

pub async fn run_single_session(socket: SocketType) {
    report("run_single_session", single_session(socket)).await
}

async fn single_session(socket: SocketType) -> Result<(), TestError> {
    let proc = TestProcess::spawn(socket, 1).await?;
    let session = proc.root.open_session("aoeu").await?;
    check_eq("name", session.get_name().await?, "aoeu".to_owned())?;

    check_eq("open sessions", proc.root.get_num_open_sessions().await?, 1)?;
    drop(session);
    check_eq("open sessions", proc.root.get_num_open_sessions().await?, 0)?;
    proc.finish().await
}

pub async fn run_many_sessions(socket: SocketType) {
    report("run_many_sessions", many_sessions(socket)).await
}

async fn many_sessions(socket: SocketType) -> Result<(), TestError> {
    let proc = TestProcess::spawn(socket, 1).await?;
    let mut sessions = Vec::new();
    for i in 0..15 {
        check_eq("open sessions", proc.root.get_num_open_sessions().await?, i)?;
        sessions.push(proc.root.open_session(&i.to_string()).await?);
    }
    check_eq("open sessions", proc.root.get_num_open_sessions().await?, 15)?;
    for (i, session) in sessions.iter().enumerate() {
        check_eq("name", session.get_name().await?, i.to_string())?;
    }
    while sessions.pop().is_some() {
        check_eq(
            "open sessions",
            proc.root.get_num_open_sessions().await?,
            sessions.len() as i32,
        )?;
    }
    check_eq("open sessions", proc.root.get_num_open_sessions().await?, 0)?;
    proc.finish().await
}

pub async fn run_cannot_mix_binders_between_unrelated_sessions(socket: SocketType) {
    report(
        "run_cannot_mix_binders_between_unrelated_sessions",
        cannot_mix_binders_between_unrelated_sessions(socket),
    )
    .await
}

async fn cannot_mix_binders_between_unrelated_sessions(socket: SocketType) -> Result<(), TestError> {
    let proc1 = TestProcess::spawn(socket, 1).await?;
    let proc2 = TestProcess::spawn(socket, 1).await?;
    let result = proc1.root.repeat_binder(Some(&proc2.root_binder)).await;
    expect_failure(result, StatusCode::InvalidOperation)?;
    proc1.finish().await?;
    proc2.finish().await
}

pub async fn run_cannot_mix_binders_between_sessions_to_one_server(socket: SocketType) {
    report(
        "run_cannot_mix_binders_between_sessions_to_one_server",
        cannot_mix_binders_between_sessions_to_one_server(socket),
    )
    .await
}

async fn cannot_mix_binders_between_sessions_to_one_server(
    socket: SocketType,
) -> Result<(), TestError> {
    let proc = TestProcess::spawn_with(socket, 1, 2, 0).await?;
    let other = proc.root_of(1)?;
    let result = proc.root.repeat_binder(Some(other.as_binder())).await;
    expect_failure(result, StatusCode::InvalidOperation)?;
    drop(other);
    proc.finish().await
}

pub async fn run_cannot_send_foreign_binder_over_session(socket: SocketType) {
    report(
        "run_cannot_send_foreign_binder_over_session",
        cannot_send_foreign_binder_over_session(socket),
    )
    .await
}

async fn cannot_send_foreign_binder_over_session(socket: SocketType) -> Result<(), TestError> {
    let proc = TestProcess::spawn(socket, 1).await?;
    let registry = LocalServiceRegistry::new();
    let result = proc.root.repeat_binder(Some(&registry.as_binder())).await;
    expect_failure(result, StatusCode::InvalidOperation)?;
    proc.finish().await
}

pub async fn run_cannot_register_proxy_in_local_registry(socket: SocketType) {
    report(
        "run_cannot_register_proxy_in_local_registry",
        cannot_register_proxy_in_local_registry(socket),
    )
    .await
}

async fn cannot_register_proxy_in_local_registry(socket: SocketType) -> Result<(), TestError> {
    let proc = TestProcess::spawn(socket, 1).await?;
    let registry = LocalServiceRegistry::new();

    let mut data = Parcel::new();
    data.write_str("not_suspicious");
    data.write_binder(Some(&proc.root_binder))?;
    let result = registry
        .as_binder()
        .transact(REGISTRY_ADD_SERVICE, data, TransactFlags::empty())
        .await;
    expect_failure(result, StatusCode::FailedTransaction)?;
    expect_failure(
        registry.add_service("not_suspicious", &proc.root_binder),
        StatusCode::FailedTransaction,
    )?;
    check("nothing registered", registry.list_services().is_empty())?;
    proc.finish().await
}

// ============================================================================
// Thread pool
// ============================================================================

pub async fn run_thread_pool_greater_than_equal_requested(socket: SocketType) {
    report(
        "run_thread_pool_greater_than_equal_requested",
        thread_pool_greater_than_equal_requested(socket),
    )
    .await
}

async fn thread_pool_greater_than_equal_requested(socket: SocketType) -> Result<(), TestError> {
    const THREADS: usize = 10;
    const BLOCK: Duration = Duration::from_millis(500);

    let proc = TestProcess::spawn(socket, THREADS).await?;
    proc.root.lock().await?;

    // Park all but one server thread on the lock.
    let blocked: Vec<_> = (0..THREADS - 1)
        .map(|_| {
            let root = proc.root.clone();
            tokio::spawn(async move { root.lock_unlock().await })
        })
        .collect();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The last thread still answers.
    proc.root_binder.ping().await?;

    let before = Instant::now();
    proc.root.unlock_in_ms_async(BLOCK.as_millis() as i32).await?;
    // Queued behind the unlock on the only free thread.
    proc.root_binder.ping().await?;
    let elapsed = before.elapsed();
    check(
        &format!("ping returned after {elapsed:?}, before the {BLOCK:?} unlock"),
        elapsed >= BLOCK,
    )?;

    join_all(blocked).await?;
    proc.finish().await
}

pub async fn run_thread_pool_over_saturated(socket: SocketType) {
    report("run_thread_pool_over_saturated", thread_pool_over_saturated(socket)).await
}

async fn thread_pool_over_saturated(socket: SocketType) -> Result<(), TestError> {
    const THREADS: usize = 10;
    const CALLS: usize = THREADS + 3;
    const SLEEP: Duration = Duration::from_millis(500);

    let proc = TestProcess::spawn(socket, THREADS).await?;
    let before = Instant::now();
    let calls: Vec<_> = (0..CALLS)
        .map(|_| {
            let root = proc.root.clone();
            tokio::spawn(async move { root.sleep_ms(SLEEP.as_millis() as i32).await })
        })
        .collect();
    join_all(calls).await?;
    let elapsed = before.elapsed();

    check(
        &format!("{CALLS} calls on {THREADS} threads took only {elapsed:?}"),
        elapsed >= 2 * SLEEP,
    )?;
    check(
        &format!("{CALLS} calls on {THREADS} threads took {elapsed:?}"),
        elapsed <= 3 * SLEEP,
    )?;
    proc.finish().await
}

pub async fn run_threading_stress(socket: SocketType) {
    report("run_threading_stress", threading_stress(socket)).await
}

async fn threading_stress(socket: SocketType) -> Result<(), TestError> {
    const CLIENT_TASKS: usize = 10;
    const SERVER_THREADS: usize = 10;
    const CALLS: usize = 100;

    let proc = TestProcess::spawn(socket, SERVER_THREADS).await?;
    let tasks: Vec<_> = (0..CLIENT_TASKS)
        .map(|_| {
            let root = proc.root.clone();
            let root_binder = proc.root_binder.clone();
            tokio::spawn(async move {
                let mut mismatches = 0;
                for _ in 0..CALLS {
                    if root.repeat_binder(Some(&root_binder)).await?.as_ref() != Some(&root_binder)
                    {
                        mismatches += 1;
                    }
                }
                Ok::<_, Status>(mismatches)
            })
        })
        .collect();
    let mismatches: usize = join_all(tasks).await?.into_iter().sum();
    check_eq("mismatched repeats", mismatches, 0)?;
    proc.finish().await
}

pub async fn run_oneway_stress(socket: SocketType) {
    report("run_oneway_stress", oneway_stress(socket)).await
}

async fn oneway_stress(socket: SocketType) -> Result<(), TestError> {
    const CLIENT_TASKS: usize = 10;
    const SERVER_THREADS: usize = 10;
    const CALLS: usize = 500;

    let proc = TestProcess::spawn(socket, SERVER_THREADS).await?;
    let tasks: Vec<_> = (0..CLIENT_TASKS)
        .map(|_| {
            let root = proc.root.clone();
            tokio::spawn(async move {
                for _ in 0..CALLS {
                    root.send_string("a").await?;
                }
                // Threads must not be stuck behind the oneway backlog.
                root.sleep_ms(250).await
            })
        })
        .collect();
    join_all(tasks).await?;
    proc.finish().await
}

// ============================================================================
// Oneway
// ============================================================================

pub async fn run_oneway_call_does_not_wait(socket: SocketType) {
    report("run_oneway_call_does_not_wait", oneway_call_does_not_wait(socket)).await
}

async fn oneway_call_does_not_wait(socket: SocketType) -> Result<(), TestError> {
    const REALLY_LONG: Duration = Duration::from_millis(100);

    let proc = TestProcess::spawn(socket, 1).await?;
    let before = Instant::now();
    proc.root
        .sleep_ms_async((REALLY_LONG * 5).as_millis() as i32)
        .await?;
    let elapsed = before.elapsed();
    check(
        &format!("oneway call took {elapsed:?}"),
        elapsed < REALLY_LONG,
    )?;
    proc.finish().await
}

pub async fn run_oneway_call_queueing(socket: SocketType) {
    report("run_oneway_call_queueing", oneway_call_queueing(socket)).await
}

async fn oneway_call_queueing(socket: SocketType) -> Result<(), TestError> {
    const SLEEPS: u32 = 10;
    const EXTRA_SERVER_THREADS: usize = 4;
    const SLEEP: Duration = Duration::from_millis(50);

    // Oneway calls to one object run one at a time however many threads
    // the server has.
    let proc = TestProcess::spawn(socket, 1 + EXTRA_SERVER_THREADS).await?;
    proc.root.lock().await?;
    for _ in 0..SLEEPS {
        proc.root.sleep_ms_async(SLEEP.as_millis() as i32).await?;
    }
    proc.root.unlock_in_ms_async(SLEEP.as_millis() as i32).await?;

    let before = Instant::now();
    proc.root.lock_unlock().await?;
    let elapsed = before.elapsed();
    check(
        &format!("lock acquired after {elapsed:?}, before the queued sleeps finished"),
        elapsed > SLEEP * SLEEPS,
    )?;

    // Every server thread is reading again.
    let tasks: Vec<_> = (0..1 + EXTRA_SERVER_THREADS)
        .map(|_| {
            let root = proc.root.clone();
            tokio::spawn(async move { root.sleep_ms(250).await })
        })
        .collect();
    join_all(tasks).await?;
    proc.finish().await
}

pub async fn run_oneway_call_exhaustion(socket: SocketType) {
    report("run_oneway_call_exhaustion", oneway_call_exhaustion(socket)).await
}

async fn oneway_call_exhaustion(socket: SocketType) -> Result<(), TestError> {
    const CLIENTS: usize = 2;
    const TOO_LONG_MS: i32 = 1000;

    let mut proc = TestProcess::spawn_with(socket, CLIENTS, 2, 0).await?;

    // Flood the second session until the server gives up on it; the first
    // session must be unaffected.
    let iface = proc.root_of(1)?;
    let flooders: Vec<_> = (0..CLIENTS)
        .map(|_| {
            let iface = iface.clone();
            tokio::spawn(async move {
                while iface.sleep_ms_async(TOO_LONG_MS).await.is_ok() {}
                Ok::<_, Status>(())
            })
        })
        .collect();
    join_all(flooders).await?;

    expect_failure(iface.sleep_ms_async(TOO_LONG_MS).await, StatusCode::DeadObject)?;
    drop(iface);
    drop(proc.proc.forget_session(1));

    // The other session to the same server keeps working.
    let survivor = proc.root_of(0)?;
    survivor.send_string("still here").await?;
    survivor.as_binder().ping().await?;
    drop(survivor);
    proc.finish().await
}

// ============================================================================
// Callbacks and failures
// ============================================================================

pub async fn run_callbacks(socket: SocketType) {
    report("run_callbacks", callbacks(socket)).await
}

async fn callbacks(socket: SocketType) -> Result<(), TestError> {
    const VALUE: &str = "good afternoon!";

    for call_is_oneway in [true, false] {
        for callback_is_oneway in [true, false] {
            for delayed in [true, false] {
                let case = format!(
                    "call oneway: {call_is_oneway}, callback oneway: {callback_is_oneway}, delayed: {delayed}"
                );
                let mut proc = TestProcess::spawn_with(socket, 1, 1, 1).await?;
                let callback = Callback::new();
                let callback_binder = SpBinder::new(callback.clone());

                if call_is_oneway {
                    proc.root
                        .do_callback_async(&callback_binder, callback_is_oneway, delayed, VALUE)
                        .await?;
                } else {
                    proc.root
                        .do_callback(&callback_binder, callback_is_oneway, delayed, VALUE)
                        .await?;
                }

                let values = callback.wait_for_values(Duration::from_secs(1)).await;
                check_eq(&case, values, vec![VALUE.to_owned()])?;

                proc.root.schedule_shutdown().await?;
                // A session with reverse connections is only closed by
                // shutting it down.
                let shut_down = proc.proc.sessions[0].session.shutdown_and_wait(true).await;
                check(&format!("{case}: session shut down"), shut_down)?;
                proc.expect_already_shutdown = true;

                drop(callback_binder);
                proc.finish().await?;
            }
        }
    }
    Ok(())
}

pub async fn run_oneway_callback_with_no_thread(socket: SocketType) {
    report(
        "run_oneway_callback_with_no_thread",
        oneway_callback_with_no_thread(socket),
    )
    .await
}

async fn oneway_callback_with_no_thread(socket: SocketType) -> Result<(), TestError> {
    let proc = TestProcess::spawn(socket, 1).await?;
    let callback = SpBinder::new(Callback::new());
    let result = proc.root.do_callback(&callback, true, false, "anything").await;
    expect_failure(result, StatusCode::WouldBlock)?;
    drop(callback);
    proc.finish().await
}

pub async fn run_die(socket: SocketType) {
    report("run_die", die(socket)).await
}

async fn die(socket: SocketType) -> Result<(), TestError> {
    let mut proc = TestProcess::spawn(socket, 1).await?;

    // State on both sides when the server goes away: we hold their
    // object, they hold ours.
    let session = proc.root.open_session("happy").await?;
    let binder = SpBinder::new(Plain);
    proc.root.hold_binder(Some(&binder)).await?;

    expect_failure(proc.root.die().await, StatusCode::DeadObject)?;
    proc.expect_already_shutdown = true;

    drop(session);
    drop(binder);
    proc.finish().await
}
