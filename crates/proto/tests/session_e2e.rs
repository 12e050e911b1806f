//! End-to-end session tests against the in-process server in `common`.
//!
//! These tests drive the whole stack over real TCP sockets:
//! - version exchange, curve25519 key exchange and host key policy
//! - publickey and password authentication
//! - exec and shell requests, stdout/stderr routing and exit statuses
//! - flow control in both directions
//! - key re-exchange while channel data is in flight

mod common;

use std::sync::Arc;

use common::{Capture, ServerConfig, TestServer, SERVER_WINDOW};
use tether_proto::ssh::trust::HostKeyStore;
use tether_proto::ssh::{
    ChannelMsg, Credentials, ExitStatus, HostKeyChecking, LiveSession, MemoryHostKeyStore,
    Options, PrivateKey, RekeyLimits, Session, SessionState, SshError, Target,
};
use tokio::time::{timeout, Duration};

const USER: &str = "alice";
const LIMIT: Duration = Duration::from_secs(20);

fn options(policy: HostKeyChecking) -> Options {
    Options::builder()
        .with_host_key_checking(policy)
        .with_request_tty(false)
        .with_keepalive(Duration::ZERO, 3)
        .build()
        .unwrap()
}

/// Like [`options`], with a pseudo-terminal the server will grant.
fn pty_options(policy: HostKeyChecking) -> Options {
    Options::builder()
        .with_host_key_checking(policy)
        .with_request_tty(true)
        .with_terminal("xterm-256color", 80, 24)
        .with_keepalive(Duration::ZERO, 3)
        .build()
        .unwrap()
}

/// Asserts the server granted a pty before running `command`.
fn assert_pty_before_exec(server: &TestServer, command: &str) {
    let events = server.events();
    let pty = events.iter().position(|e| e == "pty-req:xterm-256color").unwrap();
    let exec = events.iter().position(|e| *e == format!("exec:{}", command)).unwrap();
    assert!(pty < exec, "{:?}", events);
}

fn trusting(server: &TestServer) -> Arc<MemoryHostKeyStore> {
    let store = Arc::new(MemoryHostKeyStore::new());
    store
        .put("127.0.0.1", server.port(), "ssh-ed25519", &server.host_key_blob())
        .unwrap();
    store
}

/// Server accepting a fresh Ed25519 key, and a session configured with it.
async fn key_session(options: Options) -> (TestServer, Session) {
    let key = PrivateKey::generate_ed25519();
    let server = TestServer::start(ServerConfig::with_key(USER, key.public_key_blob())).await;
    let session = Session::new(Target::new(USER, "127.0.0.1", server.port()), options)
        .with_credentials(Credentials::new().with_key(key))
        .with_host_key_store(trusting(&server));
    (server, session)
}

async fn run(live: &mut LiveSession, command: Option<&str>, input: &[u8]) -> (tether_proto::ssh::Result<ExitStatus>, Capture, Capture) {
    let stdout = Capture::default();
    let stderr = Capture::default();
    let result = live
        .run(
            command,
            std::io::Cursor::new(input.to_vec()),
            stdout.clone(),
            stderr.clone(),
        )
        .await;
    (result, stdout, stderr)
}

#[tokio::test]
async fn test_echo_prints_and_exits_zero() {
    timeout(LIMIT, async {
        let (server, mut session) = key_session(pty_options(HostKeyChecking::Strict)).await;
        let mut live = session.connect().await.unwrap();
        assert_eq!(live.state(), SessionState::ChannelOpen);
        assert_eq!(live.authenticated().method, "publickey");

        let (status, stdout, stderr) = run(&mut live, Some("echo hi"), b"").await;
        assert_eq!(status.unwrap(), ExitStatus::Code(0));
        assert_eq!(stdout.text(), "hi\n");
        assert!(stderr.bytes().is_empty());
        assert_eq!(live.state(), SessionState::Closed);
        assert_pty_before_exec(&server, "echo hi");

        live.close().await.unwrap();
    })
    .await
    .expect("timed out");
}

#[tokio::test]
async fn test_exit_code_is_reported_without_output() {
    timeout(LIMIT, async {
        let (server, mut session) = key_session(pty_options(HostKeyChecking::Strict)).await;
        let mut live = session.connect().await.unwrap();

        let (status, stdout, _) = run(&mut live, Some("exit 3"), b"").await;
        let status = status.unwrap();
        assert_eq!(status, ExitStatus::Code(3));
        assert_eq!(status.code(), Some(3));
        assert!(!status.success());
        assert!(stdout.bytes().is_empty());
        assert_pty_before_exec(&server, "exit 3");

        live.close().await.unwrap();
    })
    .await
    .expect("timed out");
}

#[tokio::test]
async fn test_stderr_is_routed_separately() {
    timeout(LIMIT, async {
        let (_server, mut session) = key_session(options(HostKeyChecking::Strict)).await;
        let mut live = session.connect().await.unwrap();

        let (status, stdout, stderr) =
            run(&mut live, Some("echo out; echo oops >&2; nosuchcmd"), b"").await;
        assert_eq!(status.unwrap(), ExitStatus::Code(127));
        assert_eq!(stdout.text(), "out\n");
        assert_eq!(stderr.text(), "oops\nsh: nosuchcmd: command not found\n");

        live.close().await.unwrap();
    })
    .await
    .expect("timed out");
}

#[tokio::test]
async fn test_large_input_round_trips_through_windows() {
    timeout(LIMIT, async {
        let (_server, mut session) = key_session(options(HostKeyChecking::Strict)).await;
        let mut live = session.connect().await.unwrap();

        // Several times the server's window, so the writer has to wait for
        // WINDOW_ADJUST more than once.
        let input: Vec<u8> = (0..(SERVER_WINDOW as usize * 5))
            .map(|i| (i % 251) as u8)
            .collect();
        let (status, stdout, _) = run(&mut live, Some("cat"), &input).await;
        assert_eq!(status.unwrap(), ExitStatus::Code(0));
        assert_eq!(stdout.bytes(), input);

        live.close().await.unwrap();
    })
    .await
    .expect("timed out");
}

#[tokio::test]
async fn test_shell_reads_commands_from_stdin() {
    timeout(LIMIT, async {
        let (server, mut session) = key_session(options(HostKeyChecking::Strict)).await;
        let mut live = session.connect().await.unwrap();

        let (status, stdout, _) = run(&mut live, None, b"echo one\necho two\nexit 5\n").await;
        assert_eq!(status.unwrap(), ExitStatus::Code(5));
        assert_eq!(stdout.text(), "one\ntwo\n");
        assert!(server.events().contains(&"shell".to_string()));

        live.close().await.unwrap();
    })
    .await
    .expect("timed out");
}

#[tokio::test]
async fn test_pty_is_requested_and_refusal_is_tolerated() {
    timeout(LIMIT, async {
        let key = PrivateKey::generate_ed25519();
        let mut config = ServerConfig::with_key(USER, key.public_key_blob());
        config.refuse_pty = true;
        let server = TestServer::start(config).await;

        let options = Options::builder()
            .with_request_tty(true)
            .with_terminal("vt100", 100, 40)
            .with_keepalive(Duration::ZERO, 3)
            .build()
            .unwrap();
        let mut session = Session::new(Target::new(USER, "127.0.0.1", server.port()), options)
            .with_credentials(Credentials::new().with_key(key))
            .with_host_key_store(trusting(&server));
        let mut live = session.connect().await.unwrap();

        let (status, stdout, _) = run(&mut live, Some("echo still here"), b"").await;
        assert_eq!(status.unwrap(), ExitStatus::Code(0));
        assert_eq!(stdout.text(), "still here\n");

        let events = server.events();
        let pty = events.iter().position(|e| e == "pty-req:vt100").unwrap();
        let exec = events.iter().position(|e| e == "exec:echo still here").unwrap();
        assert!(pty < exec);

        live.close().await.unwrap();
    })
    .await
    .expect("timed out");
}

#[tokio::test]
async fn test_password_authentication() {
    timeout(LIMIT, async {
        let server = TestServer::start(ServerConfig::with_password(USER, "hunter2")).await;
        let mut session = Session::new(
            Target::new(USER, "127.0.0.1", server.port()),
            options(HostKeyChecking::Strict),
        )
        .with_credentials(Credentials::new().with_password("hunter2"))
        .with_host_key_store(trusting(&server));

        let mut live = session.connect().await.unwrap();
        assert_eq!(live.authenticated().method, "password");
        assert_eq!(server.events()[..2], ["auth:none", "auth:password"]);

        let (status, stdout, _) = run(&mut live, Some("echo hi"), b"").await;
        assert_eq!(status.unwrap(), ExitStatus::Code(0));
        assert_eq!(stdout.text(), "hi\n");
        live.close().await.unwrap();
    })
    .await
    .expect("timed out");
}

#[tokio::test]
async fn test_wrong_password_fails_authentication() {
    timeout(LIMIT, async {
        let server = TestServer::start(ServerConfig::with_password(USER, "hunter2")).await;
        let mut session = Session::new(
            Target::new(USER, "127.0.0.1", server.port()),
            options(HostKeyChecking::Strict),
        )
        .with_credentials(Credentials::new().with_password("letmein"))
        .with_host_key_store(trusting(&server));

        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, SshError::AuthFailed { .. }), "{:?}", err);
        assert_eq!(session.state(), SessionState::Failed);
    })
    .await
    .expect("timed out");
}

#[tokio::test]
async fn test_strict_rejects_unknown_host() {
    timeout(LIMIT, async {
        let key = PrivateKey::generate_ed25519();
        let server = TestServer::start(ServerConfig::with_key(USER, key.public_key_blob())).await;
        let store = Arc::new(MemoryHostKeyStore::new());
        let mut session = Session::new(
            Target::new(USER, "127.0.0.1", server.port()),
            options(HostKeyChecking::Strict),
        )
        .with_credentials(Credentials::new().with_key(key))
        .with_host_key_store(store.clone());

        match session.connect().await.unwrap_err() {
            SshError::HostKeyRejected {
                key_type,
                fingerprint,
                ..
            } => {
                assert_eq!(key_type, "ssh-ed25519");
                assert!(fingerprint.starts_with("SHA256:"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Failed);
        assert!(store.is_empty());
        assert!(!server.events().iter().any(|e| e.starts_with("auth:")));
    })
    .await
    .expect("timed out");
}

#[tokio::test]
async fn test_changed_host_key_is_rejected_under_accept_new() {
    timeout(LIMIT, async {
        let key = PrivateKey::generate_ed25519();
        let server = TestServer::start(ServerConfig::with_key(USER, key.public_key_blob())).await;
        let store = Arc::new(MemoryHostKeyStore::new());
        let impostor = PrivateKey::generate_ed25519().public_key_blob();
        store
            .put("127.0.0.1", server.port(), "ssh-ed25519", &impostor)
            .unwrap();

        let mut session = Session::new(
            Target::new(USER, "127.0.0.1", server.port()),
            options(HostKeyChecking::AcceptNew),
        )
        .with_credentials(Credentials::new().with_key(key))
        .with_host_key_store(store);

        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, SshError::HostKeyRejected { .. }), "{:?}", err);
    })
    .await
    .expect("timed out");
}

#[tokio::test]
async fn test_accept_new_records_key_in_known_hosts() {
    timeout(LIMIT, async {
        let dir = tempfile::tempdir().unwrap();
        let known_hosts = dir.path().join("known_hosts");
        let key = PrivateKey::generate_ed25519();
        let server = TestServer::start(ServerConfig::with_key(USER, key.public_key_blob())).await;
        let target = Target::new(USER, "127.0.0.1", server.port());

        let first = Options::builder()
            .with_host_key_checking(HostKeyChecking::AcceptNew)
            .with_known_hosts(&known_hosts)
            .with_request_tty(false)
            .with_keepalive(Duration::ZERO, 3)
            .build()
            .unwrap();
        let mut session = Session::new(target.clone(), first)
            .with_credentials(Credentials::new().with_key(key.clone()));
        let mut live = session.connect().await.unwrap();
        live.close().await.unwrap();

        let contents = std::fs::read_to_string(&known_hosts).unwrap();
        assert!(contents.contains(&format!("[127.0.0.1]:{}", server.port())));
        assert!(contents.contains("ssh-ed25519"));

        // The recorded key now satisfies strict checking.
        let second = Options::builder()
            .with_host_key_checking(HostKeyChecking::Strict)
            .with_known_hosts(&known_hosts)
            .with_request_tty(false)
            .with_keepalive(Duration::ZERO, 3)
            .build()
            .unwrap();
        let mut session =
            Session::new(target, second).with_credentials(Credentials::new().with_key(key));
        let mut live = session.connect().await.unwrap();
        let (status, stdout, _) = run(&mut live, Some("echo again"), b"").await;
        assert_eq!(status.unwrap(), ExitStatus::Code(0));
        assert_eq!(stdout.text(), "again\n");
        live.close().await.unwrap();
    })
    .await
    .expect("timed out");
}

#[tokio::test]
async fn test_insecure_needs_no_store() {
    timeout(LIMIT, async {
        let key = PrivateKey::generate_ed25519();
        let server = TestServer::start(ServerConfig::with_key(USER, key.public_key_blob())).await;
        let mut session = Session::new(
            Target::new(USER, "127.0.0.1", server.port()),
            options(HostKeyChecking::Insecure),
        )
        .with_credentials(Credentials::new().with_key(key));

        let mut live = session.connect().await.unwrap();
        let (status, _, _) = run(&mut live, Some("true"), b"").await;
        assert!(status.unwrap().success());
        live.close().await.unwrap();
    })
    .await
    .expect("timed out");
}

#[tokio::test]
async fn test_second_channel_on_same_connection() {
    timeout(LIMIT, async {
        let (_server, mut session) = key_session(options(HostKeyChecking::Strict)).await;
        let mut live = session.connect().await.unwrap();

        let mut extra = live.multiplexer().open_session().await.unwrap();
        assert_ne!(extra.local_id(), 0);
        extra.exec("exit 7").await.unwrap();
        loop {
            if let ChannelMsg::Closed(cause) = extra.read().await {
                assert!(cause.is_none());
                break;
            }
        }
        assert_eq!(extra.exit_status(), Some(&ExitStatus::Code(7)));

        live.close().await.unwrap();
    })
    .await
    .expect("timed out");
}

#[tokio::test]
async fn test_close_without_exit_status_is_indeterminate() {
    timeout(LIMIT, async {
        let key = PrivateKey::generate_ed25519();
        let mut config = ServerConfig::with_key(USER, key.public_key_blob());
        config.omit_exit_status = true;
        let server = TestServer::start(config).await;
        let mut session = Session::new(
            Target::new(USER, "127.0.0.1", server.port()),
            options(HostKeyChecking::Strict),
        )
        .with_credentials(Credentials::new().with_key(key))
        .with_host_key_store(trusting(&server));
        let mut live = session.connect().await.unwrap();

        let (status, stdout, _) = run(&mut live, Some("echo bye"), b"").await;
        let status = status.unwrap();
        assert_eq!(status, ExitStatus::Indeterminate);
        assert_ne!(status, ExitStatus::Code(0));
        assert!(!status.success());
        assert_eq!(status.code(), None);
        assert_eq!(stdout.text(), "bye\n");
        assert_eq!(live.state(), SessionState::Closed);

        live.close().await.unwrap();
    })
    .await
    .expect("timed out");
}

#[tokio::test]
async fn test_rekeys_during_transfer_keep_data_in_order() {
    timeout(LIMIT, async {
        let limits = RekeyLimits {
            bytes: 32 * 1024,
            ..RekeyLimits::default()
        };
        let options = Options::builder()
            .with_host_key_checking(HostKeyChecking::Strict)
            .with_request_tty(false)
            .with_keepalive(Duration::ZERO, 3)
            .with_rekey_limits(limits)
            .build()
            .unwrap();
        let (server, mut session) = key_session(options).await;
        let mut live = session.connect().await.unwrap();

        let input: Vec<u8> = (0..(SERVER_WINDOW as usize * 5))
            .map(|i| (i % 253) as u8)
            .collect();
        let (status, stdout, _) = run(&mut live, Some("cat"), &input).await;
        assert_eq!(status.unwrap(), ExitStatus::Code(0));
        assert_eq!(stdout.bytes(), input);

        let rekeys = server.events().iter().filter(|e| *e == "rekey").count();
        assert!(rekeys >= 2, "only {} rekeys", rekeys);

        live.close().await.unwrap();
    })
    .await
    .expect("timed out");
}

#[tokio::test]
async fn test_requested_rekey_holds_channel_traffic() {
    timeout(LIMIT, async {
        let (server, mut session) = key_session(options(HostKeyChecking::Strict)).await;
        let mut live = session.connect().await.unwrap();

        live.multiplexer().rekey().unwrap();
        let (status, stdout, _) = run(&mut live, Some("echo after rekey"), b"").await;
        assert_eq!(status.unwrap(), ExitStatus::Code(0));
        assert_eq!(stdout.text(), "after rekey\n");

        // The exec was held until the exchange finished.
        let events = server.events();
        let rekey = events.iter().position(|e| e == "rekey").unwrap();
        let exec = events.iter().position(|e| e == "exec:echo after rekey").unwrap();
        assert!(rekey < exec, "{:?}", events);

        live.close().await.unwrap();
    })
    .await
    .expect("timed out");
}

#[tokio::test]
async fn test_receive_window_overrun_fails_every_channel() {
    timeout(LIMIT, async {
        let key = PrivateKey::generate_ed25519();
        let mut config = ServerConfig::with_key(USER, key.public_key_blob());
        config.ignore_window = true;
        let server = TestServer::start(config).await;
        let mut session = Session::new(
            Target::new(USER, "127.0.0.1", server.port()),
            options(HostKeyChecking::Strict),
        )
        .with_credentials(Credentials::new().with_key(key))
        .with_host_key_store(trusting(&server));
        let live = session.connect().await.unwrap();
        let mux = live.multiplexer();

        // The server only tracks the newest channel, so the flooded one is
        // opened last. Nothing reads it, so its window is never replenished.
        let mut idle = mux.open_session().await.unwrap();
        let mut flooded = mux.open_session().await.unwrap();
        let window = tether_proto::ssh::connection::CHANNEL_WINDOW_SIZE as usize;
        flooded
            .exec(&format!("flood {}", window + 64 * 1024))
            .await
            .unwrap();

        while mux.failure().is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(matches!(mux.failure(), Some(SshError::Protocol(_))));

        match idle.read().await {
            ChannelMsg::Closed(Some(SshError::Protocol(msg))) => {
                assert!(msg.contains("receive window"), "{}", msg)
            }
            other => panic!("unexpected message: {:?}", other),
        }
        let mut received = 0;
        loop {
            match flooded.read().await {
                ChannelMsg::Data(data) => received += data.len(),
                ChannelMsg::Closed(cause) => {
                    assert!(matches!(cause, Some(SshError::Protocol(_))), "{:?}", cause);
                    break;
                }
                _ => {}
            }
        }
        assert!(received <= window);
    })
    .await
    .expect("timed out");
}
