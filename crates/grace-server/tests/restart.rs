//! Restarts a running server with SIGHUP while clients keep connecting.

use std::net::TcpListener as StdTcpListener;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn free_port() -> u16 {
    StdTcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn spawn_server(port: u16) -> Child {
    Command::new(env!("CARGO_BIN_EXE_grace-server"))
        .args(["--addr", &format!("127.0.0.1:{port}")])
        .args(["--drain-timeout-secs", "10"])
        .env_remove("GRACE_RESTART")
        .env("RUST_LOG", "info")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap()
}

async fn get(port: u16, path: &str) -> std::io::Result<String> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;
    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

fn served_pid(response: &str) -> Option<u32> {
    response
        .split("Welcome to the home page! ")
        .nth(1)?
        .trim()
        .parse()
        .ok()
}

async fn wait_for_pid(port: u16, accept: impl Fn(u32) -> bool) -> u32 {
    let deadline = Instant::now() + Duration::from_secs(20);
    while Instant::now() < deadline {
        if let Ok(response) = get(port, "/").await {
            if let Some(pid) = served_pid(&response) {
                if accept(pid) {
                    return pid;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("no matching server answered on port {port}");
}

async fn wait_exit(child: &mut Child) -> std::process::ExitStatus {
    let deadline = Instant::now() + Duration::from_secs(20);
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait().unwrap() {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let _ = child.kill();
    panic!("process {} did not exit", child.id());
}

fn signal(pid: u32, sig: libc::c_int) {
    let rc = unsafe { libc::kill(pid as libc::pid_t, sig) };
    assert_eq!(rc, 0, "kill({pid}, {sig}) failed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sighup_hands_over_without_failed_requests() {
    let port = free_port();
    let mut old = spawn_server(port);
    let old_pid = old.id();
    assert_eq!(wait_for_pid(port, |pid| pid == old_pid).await, old_pid);

    // Accepted by the old process now, request sent only after the handover.
    let mut early = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stop = Arc::new(AtomicBool::new(false));
    let failures = Arc::new(Mutex::new(Vec::new()));
    let served = Arc::new(AtomicUsize::new(0));
    let client = tokio::spawn({
        let stop = Arc::clone(&stop);
        let failures = Arc::clone(&failures);
        let served = Arc::clone(&served);
        async move {
            while !stop.load(Ordering::Relaxed) {
                match get(port, "/").await {
                    Ok(response) if served_pid(&response).is_some() => {
                        served.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(response) => {
                        failures.lock().unwrap().push(format!("bad response: {response:?}"));
                    }
                    Err(e) => {
                        failures.lock().unwrap().push(format!("request failed: {e}"));
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    });

    signal(old_pid, libc::SIGHUP);
    let new_pid = wait_for_pid(port, |pid| pid != old_pid).await;

    early
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    early.read_to_string(&mut response).await.unwrap();
    assert!(
        served_pid(&response).is_some(),
        "connection accepted before the handover got no answer: {response:?}"
    );

    let status = wait_exit(&mut old).await;
    assert!(status.success(), "old process exited with {status}");

    // Only the replacement answers once the old process is gone.
    assert_eq!(served_pid(&get(port, "/").await.unwrap()), Some(new_pid));

    stop.store(true, Ordering::Relaxed);
    client.await.unwrap();
    signal(new_pid, libc::SIGTERM);

    let failures = failures.lock().unwrap();
    assert!(failures.is_empty(), "requests failed during handover: {failures:?}");
    assert!(served.load(Ordering::Relaxed) > 0);
}

#[tokio::test]
async fn test_ctrl_stop_drains_and_exits() {
    let port = free_port();
    let mut server = spawn_server(port);
    let pid = server.id();
    wait_for_pid(port, |p| p == pid).await;

    let response = get(port, "/ctrl?action=stop").await.unwrap();
    assert!(response.ends_with("stop success"), "unexpected response: {response}");

    let status = wait_exit(&mut server).await;
    assert!(status.success(), "server exited with {status}");
}
