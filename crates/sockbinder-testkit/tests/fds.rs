//! Descriptor accounting. Runs in its own binary so other tests do not
//! open descriptors concurrently.

use std::time::Duration;

use sockbinder_testkit::{SocketType, TestProcess, eventually, init_tracing};

fn count_fds() -> usize {
    std::fs::read_dir("/proc/self/fd")
        .map(|dir| dir.count())
        .unwrap_or(0)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn finished_process_leaves_no_descriptors() {
    init_tracing();
    if std::fs::metadata("/proc/self/fd").is_err() {
        eprintln!("skipping: no /proc/self/fd");
        return;
    }
    for socket in [SocketType::Unix, SocketType::Inet] {
        let before = count_fds();
        let proc = TestProcess::spawn(socket, 10).await.unwrap();
        proc.root_binder.ping().await.unwrap();
        proc.finish().await.unwrap();

        let settled = eventually(Duration::from_secs(5), || {
            let now = count_fds();
            async move { now <= before }
        })
        .await;
        assert!(
            settled,
            "{}: {} descriptors before, {} after",
            socket.name(),
            before,
            count_fds()
        );
    }
}
