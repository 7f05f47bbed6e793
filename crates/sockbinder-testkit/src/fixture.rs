//! In-process server fixture.
//!
//! A [`ProcessSession`] stands in for a server process: an [`RpcServer`]
//! accepting on its own task, plus a number of client sessions connected to
//! it. [`ProcessSession::finish`] runs the teardown checks every scenario
//! ends with.

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use sockbinder_core::{RpcServer, RpcSession, SpBinder, Status, StatusCode};
use tokio::task::JoinHandle;

use crate::TestError;
use crate::services::{TestService, TestServiceProxy};

/// Local loopback cid for vsock clients.
#[cfg(feature = "vsock")]
const VMADDR_CID_LOCAL: u32 = 1;

/// How long teardown waits for asynchronous cleanup to settle.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketType {
    Unix,
    Inet,
    #[cfg(feature = "vsock")]
    Vsock,
}

impl SocketType {
    pub fn name(self) -> &'static str {
        match self {
            SocketType::Unix => "unix_domain_socket",
            SocketType::Inet => "inet_socket",
            #[cfg(feature = "vsock")]
            SocketType::Vsock => "vm_socket",
        }
    }

    /// Whether sockets of this type can be used on this machine. Only vsock
    /// can be missing: it needs loopback support from the kernel.
    pub async fn is_available(self) -> bool {
        match self {
            SocketType::Unix | SocketType::Inet => true,
            #[cfg(feature = "vsock")]
            SocketType::Vsock => vsock_loopback_supported().await,
        }
    }
}

#[cfg(feature = "vsock")]
async fn vsock_loopback_supported() -> bool {
    let port = allocate_vsock_port();
    let server = RpcServer::new();
    if server.setup_vsock_server(port).is_err() {
        return false;
    }
    server.start();
    let session = RpcSession::new();
    let supported = session.setup_vsock_client(VMADDR_CID_LOCAL, port).await.is_ok();
    session.shutdown_and_wait(false).await;
    server.shutdown().await;
    tracing::info!(supported, "vsock loopback check");
    supported
}

fn allocate_socket_path() -> PathBuf {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    let id = NEXT.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("sockbinder_test_{}_{id}", std::process::id()))
}

#[cfg(feature = "vsock")]
fn allocate_vsock_port() -> u32 {
    static NEXT: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(3456);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Where the fixture server listens.
enum Endpoint {
    Unix(PathBuf),
    Inet(u16),
    #[cfg(feature = "vsock")]
    Vsock(u32),
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub struct SessionInfo {
    pub session: RpcSession,
    pub root: Option<SpBinder>,
}

/// A server with its client sessions.
pub struct ProcessSession {
    pub server: RpcServer,
    pub sessions: Vec<SessionInfo>,
    join: Option<JoinHandle<()>>,
    socket_path: Option<PathBuf>,
}

impl ProcessSession {
    /// Start a server with `threads` threads, configured by `configure`,
    /// and connect `sessions` clients to it, each with `reverse` reverse
    /// connections.
    pub async fn spawn(
        socket: SocketType,
        threads: usize,
        sessions: usize,
        reverse: usize,
        configure: impl FnOnce(&RpcServer),
    ) -> Result<Self, TestError> {
        if sessions == 0 {
            return Err(TestError::Setup(
                "a server needs at least one session".into(),
            ));
        }
        let server = RpcServer::new();
        server.set_max_threads(threads)?;

        let endpoint = match socket {
            SocketType::Unix => {
                let path = allocate_socket_path();
                let _ = std::fs::remove_file(&path);
                server.setup_unix_domain_server(&path)?;
                Endpoint::Unix(path)
            }
            SocketType::Inet => {
                let port = server.setup_inet_server("127.0.0.1", 0)?;
                if port == 0 {
                    return Err(TestError::Setup("inet server reported port 0".into()));
                }
                Endpoint::Inet(port)
            }
            #[cfg(feature = "vsock")]
            SocketType::Vsock => {
                let port = allocate_vsock_port();
                server.setup_vsock_server(port)?;
                Endpoint::Vsock(port)
            }
        };
        configure(&server);

        let join = tokio::spawn({
            let server = server.clone();
            async move {
                if let Err(status) = server.join().await {
                    tracing::warn!(error = %status, "fixture server failed to join");
                }
            }
        });

        let socket_path = match &endpoint {
            Endpoint::Unix(path) => Some(path.clone()),
            _ => None,
        };
        let mut fixture = Self {
            server,
            sessions: Vec::with_capacity(sessions),
            join: Some(join),
            socket_path,
        };

        for _ in 0..sessions {
            let session = RpcSession::new();
            session.set_max_threads(reverse)?;
            match &endpoint {
                Endpoint::Unix(path) => session.setup_unix_domain_client(path).await?,
                Endpoint::Inet(port) => session.setup_inet_client("127.0.0.1", *port).await?,
                #[cfg(feature = "vsock")]
                Endpoint::Vsock(port) => {
                    session.setup_vsock_client(VMADDR_CID_LOCAL, *port).await?
                }
            }
            let root = session.get_root_object().await?;
            fixture.sessions.push(SessionInfo { session, root });
        }
        Ok(fixture)
    }

    /// Forget a client session without checking it, for sessions a scenario
    /// has deliberately broken.
    pub fn forget_session(&mut self, index: usize) -> SessionInfo {
        self.sessions.remove(index)
    }

    /// Release every client session and check that none of them still has
    /// binders or is kept alive, then wait for the server to stop accepting.
    ///
    /// The server must already be shutting down.
    pub async fn finish(mut self) -> Result<(), TestError> {
        for info in &mut self.sessions {
            info.root = None;
        }
        for info in std::mem::take(&mut self.sessions) {
            let session = info.session;
            let empty = eventually(SETTLE_TIMEOUT, || {
                let count = session.count_binders();
                async move { count == 0 }
            })
            .await;
            if !empty {
                return Err(TestError::Assertion(format!(
                    "client session {} still has {} binders:\n{}",
                    session.session_id(),
                    session.count_binders(),
                    session.dump()
                )));
            }
            let weak = session.downgrade();
            drop(session);
            if !eventually(SETTLE_TIMEOUT, || {
                let alive = weak.upgrade().is_some();
                async move { !alive }
            })
            .await
            {
                return Err(TestError::Assertion("leaked session".into()));
            }
        }

        if let Some(join) = self.join.take() {
            match tokio::time::timeout(SETTLE_TIMEOUT, join).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(TestError::Setup(format!("server task panicked: {e}"))),
                Err(_) => return Err(TestError::Assertion("server did not stop".into())),
            }
        }
        Ok(())
    }
}

impl Drop for ProcessSession {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            join.abort();
            let server = self.server.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    server.shutdown().await;
                });
            }
        }
        if let Some(path) = self.socket_path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// A [`ProcessSession`] whose server serves a [`TestService`].
pub struct TestProcess {
    pub proc: ProcessSession,
    /// Root object of the first session.
    pub root_binder: SpBinder,
    pub root: TestServiceProxy,
    /// The service instance behind every session's root.
    pub service: TestService,
    /// Set when a scenario has already brought the server down.
    pub expect_already_shutdown: bool,
}

impl TestProcess {
    pub async fn spawn(socket: SocketType, threads: usize) -> Result<Self, TestError> {
        Self::spawn_with(socket, threads, 1, 0).await
    }

    pub async fn spawn_with(
        socket: SocketType,
        threads: usize,
        sessions: usize,
        reverse: usize,
    ) -> Result<Self, TestError> {
        let service = TestService::new();
        let proc = ProcessSession::spawn(socket, threads, sessions, reverse, |server| {
            service.attach(server);
            server.set_root_object(SpBinder::new(service.clone()));
        })
        .await?;
        let root_binder = proc
            .sessions
            .first()
            .and_then(|info| info.root.clone())
            .ok_or_else(|| TestError::Setup("server returned no root object".into()))?;
        Ok(Self {
            proc,
            root: TestServiceProxy::new(root_binder.clone()),
            root_binder,
            service,
            expect_already_shutdown: false,
        })
    }

    /// Root proxy of session `index`.
    pub fn root_of(&self, index: usize) -> Result<TestServiceProxy, TestError> {
        self.proc
            .sessions
            .get(index)
            .and_then(|info| info.root.clone())
            .map(TestServiceProxy::new)
            .ok_or_else(|| TestError::Setup(format!("no root object for session {index}")))
    }

    /// Check that the server holds exactly its root in every session, shut
    /// it down, then run the client checks of [`ProcessSession::finish`].
    pub async fn finish(self) -> Result<(), TestError> {
        let TestProcess {
            proc,
            root_binder,
            root,
            service,
            expect_already_shutdown,
        } = self;
        if !expect_already_shutdown {
            let expected = vec![1; proc.sessions.len()];
            let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
            let counts = loop {
                let counts = root.count_binders().await?;
                if counts == expected || tokio::time::Instant::now() >= deadline {
                    break counts;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            };
            if counts != expected {
                return Err(TestError::Assertion(format!(
                    "server binder counts {counts:?}, expected {expected:?}"
                )));
            }
            root.schedule_shutdown().await?;
        }
        drop(root);
        drop(root_binder);
        drop(service);
        proc.finish().await
    }
}

/// Map a call that must fail onto the status it failed with.
pub fn expect_failure<T: std::fmt::Debug>(
    result: Result<T, Status>,
    expected: StatusCode,
) -> Result<(), TestError> {
    match result {
        Err(status) if status == expected => Ok(()),
        Err(status) => Err(TestError::Assertion(format!(
            "expected {expected}, got {status}"
        ))),
        Ok(value) => Err(TestError::Assertion(format!(
            "expected {expected}, got success: {value:?}"
        ))),
    }
}
