//! End-to-end tests against the real binary.
//!
//! The server logs JSON lines to stdout; the bound address is read from the
//! "Bound fresh listener" event.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// Grace period passed to every server under test.
const GRACE: Duration = Duration::from_secs(3);

/// Allowance for process exit after the drain.
const EXIT_MARGIN: Duration = Duration::from_secs(1);

struct Running {
    child: Child,
    addr: SocketAddr,
    logs: mpsc::Receiver<serde_json::Value>,
}

fn start_server(extra_args: &[&str]) -> Running {
    let mut child = Command::new(env!("CARGO_BIN_EXE_handoff-server"))
        .args(["--addr", "127.0.0.1:0", "--shutdown-timeout"])
        .arg(GRACE.as_secs().to_string())
        .args(["--stop-signals", "TERM", "--restart-signals", "USR2"])
        .args(extra_args)
        .env("HANDOFF_LOG_FORMAT", "json")
        .env("RUST_LOG", "info,handoff=debug")
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .unwrap();

    // Keep draining stdout: successors share the pipe.
    let stdout = child.stdout.take().unwrap();
    let (tx, logs) = mpsc::channel();
    thread::spawn(move || {
        for line in BufReader::new(stdout).lines().map_while(Result::ok) {
            if let Ok(event) = serde_json::from_str::<serde_json::Value>(&line) {
                if tx.send(event).is_err() {
                    break;
                }
            }
        }
    });

    let deadline = Instant::now() + Duration::from_secs(10);
    let addr = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let event = logs
            .recv_timeout(remaining)
            .expect("server did not report its address");
        if event["message"] == "Bound fresh listener" {
            break event["addr"].as_str().unwrap().parse().unwrap();
        }
    };

    Running { child, addr, logs }
}

/// One request on a fresh connection; the server closes after responding.
fn get(addr: SocketAddr, path: &str) -> std::io::Result<(u16, String)> {
    let mut stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    write!(
        stream,
        "GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"
    )?;

    let mut response = String::new();
    stream.read_to_string(&mut response)?;

    let status = response
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap_or(0);
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    Ok((status, body))
}

fn health(addr: SocketAddr) -> serde_json::Value {
    let (status, body) = get(addr, "/health").unwrap();
    assert_eq!(status, 200);
    serde_json::from_str(&body).unwrap()
}

fn signal(pid: u32, sig: libc::c_int) {
    assert_eq!(unsafe { libc::kill(pid as libc::pid_t, sig) }, 0);
}

fn wait_exit(child: &mut Child, timeout: Duration) -> ExitStatus {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait().unwrap() {
            return status;
        }
        if Instant::now() > deadline {
            let _ = child.kill();
            panic!("server did not exit within {timeout:?}");
        }
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn test_restart_hands_off_listener() {
    let mut server = start_server(&[]);
    let addr = server.addr;
    let old_pid = server.child.id();

    let before = health(addr);
    assert_eq!(before["pid"], old_pid);
    assert_eq!(before["mode"], "fresh");

    // In flight across the restart.
    let slow = thread::spawn(move || get(addr, "/slow?ms=1000"));
    thread::sleep(Duration::from_millis(200));

    let signalled = Instant::now();
    signal(old_pid, libc::SIGUSR2);

    let (status, body) = slow.join().unwrap().unwrap();
    assert_eq!(status, 200);
    assert!(body.starts_with("slept 1000 ms"));

    let exit = wait_exit(&mut server.child, GRACE + EXIT_MARGIN);
    assert!(exit.success(), "old generation exited with {exit}");
    assert!(signalled.elapsed() < GRACE + EXIT_MARGIN);

    // The successor answers on the same address without rebinding.
    let deadline = Instant::now() + Duration::from_secs(10);
    let successor = loop {
        let current = health(addr);
        if current["pid"] != old_pid {
            break current;
        }
        assert!(Instant::now() < deadline, "successor never answered");
        thread::sleep(Duration::from_millis(50));
    };
    assert_eq!(successor["mode"], "inherited");

    let new_pid = successor["pid"].as_u64().unwrap() as u32;
    assert!(server
        .logs
        .try_iter()
        .all(|event| event["message"] != "Bound fresh listener"));

    signal(new_pid, libc::SIGTERM);
    let deadline = Instant::now() + Duration::from_secs(10);
    while TcpStream::connect(addr).is_ok() {
        assert!(Instant::now() < deadline, "successor did not stop");
        thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn test_stop_drains_and_exits() {
    let mut server = start_server(&[]);
    let addr = server.addr;
    let pid = server.child.id();

    assert_eq!(get(addr, "/").unwrap().1, format!("hello from {pid}\n"));

    let slow = thread::spawn(move || get(addr, "/slow?ms=1500"));
    thread::sleep(Duration::from_millis(200));

    let started = Instant::now();
    signal(pid, libc::SIGTERM);

    // The listener closes at once, while the slow request is still draining.
    thread::sleep(Duration::from_millis(300));
    assert!(server.child.try_wait().unwrap().is_none());
    assert!(TcpStream::connect(addr).is_err());

    let (status, _) = slow.join().unwrap().unwrap();
    assert_eq!(status, 200);

    let exit = wait_exit(&mut server.child, GRACE + EXIT_MARGIN);
    assert!(exit.success(), "server exited with {exit}");
    assert!(started.elapsed() < GRACE + EXIT_MARGIN);

    assert!(TcpStream::connect(addr).is_err());
}

#[test]
fn test_invalid_signal_mapping_fails_startup() {
    let mut child = Command::new(env!("CARGO_BIN_EXE_handoff-server"))
        .args(["--addr", "127.0.0.1:0"])
        .args(["--stop-signals", "HUP", "--restart-signals", "HUP"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let exit = wait_exit(&mut child, Duration::from_secs(10));
    assert_eq!(exit.code(), Some(1));
}
