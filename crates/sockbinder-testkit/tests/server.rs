//! Server behaviour that does not depend on a socket family.

use std::net::TcpListener;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::Duration;

use sockbinder_core::{RpcServer, RpcSession, ServerState, SpBinder};
use sockbinder_testkit::{Plain, TestService, TestServiceProxy, eventually, init_tracing};
use tokio::sync::Notify;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn external_listener_is_served() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = RpcServer::new();
    server.set_root_object(SpBinder::new(TestService::new()));
    server.setup_external_server(OwnedFd::from(listener)).unwrap();
    server.start();

    let session = RpcSession::new();
    session.setup_inet_client("127.0.0.1", port).await.unwrap();
    let root = TestServiceProxy::new(session.get_root_object().await.unwrap().unwrap());
    assert_eq!(root.double_string("ab").await.unwrap(), "abab");

    drop(root);
    assert!(session.shutdown_and_wait(true).await);
    assert!(server.shutdown().await);
    assert_eq!(server.state(), ServerState::Stopped);
}

#[test]
fn weak_root_object() {
    for first_strong in [true, false] {
        for second_strong in [true, false] {
            let server = RpcServer::new();
            let set_root = |binder: SpBinder, strong: bool| {
                if strong {
                    server.set_root_object(binder);
                } else {
                    server.set_root_object_weak(&binder);
                }
            };

            let first = SpBinder::new(Plain);
            set_root(first.clone(), first_strong);
            assert_eq!(server.get_root_object().as_ref(), Some(&first));
            let weak = first.downgrade();
            drop(first);
            assert_eq!(server.get_root_object().is_some(), first_strong);
            assert_eq!(weak.upgrade().is_some(), first_strong);

            let second = SpBinder::new(Plain);
            set_root(second.clone(), second_strong);
            assert_eq!(server.get_root_object().as_ref(), Some(&second));
            // The first root is no longer held by the server.
            assert!(weak.upgrade().is_none());
            drop(second);
            assert_eq!(server.get_root_object().is_some(), second_strong);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_wakes_join() {
    init_tracing();
    let path = std::env::temp_dir().join(format!("sockbinder_shutdown_{}", std::process::id()));
    let _ = std::fs::remove_file(&path);

    let server = RpcServer::new();
    server.setup_unix_domain_server(&path).unwrap();

    let join_ended = Arc::new(Notify::new());
    tokio::spawn({
        let server = server.clone();
        let join_ended = join_ended.clone();
        async move {
            let _ = server.join().await;
            join_ended.notify_one();
        }
    });

    let mut shut_down = false;
    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(300)).await;
        if server.shutdown().await {
            shut_down = true;
            break;
        }
    }
    assert!(shut_down, "shutdown never returned true");
    tokio::time::timeout(Duration::from_secs(2), join_ended.notified())
        .await
        .expect("join did not return within 2s of shutdown");

    let _ = std::fs::remove_file(&path);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn server_lists_and_forgets_sessions() {
    init_tracing();
    let server = RpcServer::new();
    server.set_max_threads(2).unwrap();
    server.set_root_object(SpBinder::new(Plain));
    let port = server.setup_inet_server("127.0.0.1", 0).unwrap();
    server.start();

    let first = RpcSession::new();
    first.setup_inet_client("127.0.0.1", port).await.unwrap();
    let second = RpcSession::new();
    second.setup_inet_client("127.0.0.1", port).await.unwrap();
    assert_eq!(first.connected_server_threads(), 2);
    assert_eq!(server.list_sessions().len(), 2);

    assert!(first.shutdown_and_wait(true).await);
    assert!(
        eventually(Duration::from_secs(5), || {
            let count = server.list_sessions().len();
            async move { count == 1 }
        })
        .await
    );

    assert!(server.shutdown().await);
    assert!(!server.shutdown().await);
    assert!(server.list_sessions().is_empty());
    drop(second);
}
