//! In-process SSH server used by the end-to-end tests.
//!
//! Speaks just enough of the server side to exercise the client:
//! curve25519-sha256 with an Ed25519 host key (including client-initiated
//! rekeys), `publickey` and `password` authentication, and one session
//! channel that understands a tiny shell language (`echo`, `exit N`, `true`,
//! `false`, `cat`, `flood N`).

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tether_proto::ssh::auth::{
    construct_signature_data, service_accept, parse_service, AuthFailure, AuthMethod, AuthPkOk,
    AuthRequest, SERVICE_USERAUTH,
};
use tether_proto::ssh::connection::{
    ChannelOpenConfirmation, ChannelRequest, ChannelRequestType, ConnectionMessage,
    EXTENDED_DATA_STDERR,
};
use tether_proto::ssh::crypto::{PacketOpener, PacketSealer};
use tether_proto::ssh::hostkey::{verify_signature, Ed25519HostKey, HostKey};
use tether_proto::ssh::kex::{negotiate, AlgorithmPreferences, KexInit, NewKeys};
use tether_proto::ssh::kex_dh::{Curve25519Exchange, ExchangeHash, KexReply, Role, SessionKeys};
use tether_proto::ssh::message::MessageType;
use tether_proto::ssh::transport::{self, PacketReader, PacketWriter};
use tether_proto::ssh::version::Version;
use tether_proto::ssh::wire::WireReader;
use tether_proto::ssh::{Result, SshError};
use tokio::io::{AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Window the server grants the client; small so flow control is exercised.
pub const SERVER_WINDOW: u32 = 64 * 1024;

const SERVER_MAX_PACKET: u32 = 32 * 1024;

/// Who may log in, and how the server treats requests.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Accepted user name
    pub user: String,
    /// Accepted password, if password authentication is enabled
    pub password: Option<String>,
    /// Public key blobs accepted for `publickey`
    pub authorized_keys: Vec<Vec<u8>>,
    /// Answer `pty-req` with CHANNEL_FAILURE
    pub refuse_pty: bool,
    /// Close channels without sending `exit-status`
    pub omit_exit_status: bool,
    /// Send channel data regardless of the client's window
    pub ignore_window: bool,
}

impl ServerConfig {
    pub fn with_password(user: &str, password: &str) -> Self {
        Self {
            user: user.to_string(),
            password: Some(password.to_string()),
            ..Self::default()
        }
    }

    pub fn with_key(user: &str, key_blob: Vec<u8>) -> Self {
        Self {
            user: user.to_string(),
            authorized_keys: vec![key_blob],
            ..Self::default()
        }
    }
}

/// A listening test server. Aborted on drop.
pub struct TestServer {
    addr: SocketAddr,
    host_key: Ed25519HostKey,
    log: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(config: ServerConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let host_key = Ed25519HostKey::generate();
        let log = Arc::new(Mutex::new(Vec::new()));

        let task = {
            let host_key = host_key.clone();
            let log = log.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let conn = Connection::new(config.clone(), host_key.clone(), log.clone());
                    tokio::spawn(async move {
                        if let Err(e) = conn.serve(stream).await {
                            tracing::debug!(error = %e, "Test server connection ended");
                        }
                    });
                }
            })
        };

        Self {
            addr,
            host_key,
            log,
            task,
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn host_key_blob(&self) -> Vec<u8> {
        self.host_key.public_key_bytes()
    }

    /// Authentication methods tried and channel requests received, in order.
    pub fn events(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Output sink whose contents the test can inspect afterwards.
#[derive(Debug, Clone, Default)]
pub struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    pub fn bytes(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes()).into_owned()
    }
}

impl AsyncWrite for Capture {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

enum Mode {
    Idle,
    Shell(Vec<u8>),
    Cat,
    Done,
}

struct Connection {
    config: ServerConfig,
    host_key: Ed25519HostKey,
    log: Arc<Mutex<Vec<String>>>,
}

struct Channel {
    client_id: u32,
    client_window: u32,
    client_max_packet: u32,
    consumed: u32,
    pending: VecDeque<(Option<u32>, Vec<u8>)>,
    exit: Option<u32>,
    close_sent: bool,
    mode: Mode,
    last_status: u32,
    omit_exit_status: bool,
    ignore_window: bool,
}

/// Identification lines and session id shared by every key exchange.
struct KexContext {
    v_c: String,
    v_s: String,
    session_id: Option<Vec<u8>>,
}

type Reader = PacketReader<ReadHalf<TcpStream>>;
type Writer = PacketWriter<WriteHalf<TcpStream>>;

impl Connection {
    fn new(config: ServerConfig, host_key: Ed25519HostKey, log: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            config,
            host_key,
            log,
        }
    }

    fn record(&self, event: String) {
        self.log.lock().unwrap().push(event);
    }

    async fn serve(self, mut stream: TcpStream) -> Result<()> {
        let ours = Version::new("TestServer_1.0", None);
        let theirs = transport::exchange_versions(&mut stream, &ours, Duration::from_secs(5)).await?;
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = PacketReader::new(read_half);
        let mut writer = PacketWriter::new(write_half);

        let mut kex = KexContext {
            v_c: theirs.as_str().to_string(),
            v_s: ours.as_str().to_string(),
            session_id: None,
        };
        let session_id = self.key_exchange(&mut reader, &mut writer, &mut kex, None).await?;
        let request = expect(&mut reader, MessageType::ServiceRequest).await?;
        if parse_service(&request)? != SERVICE_USERAUTH {
            return Err(SshError::protocol("unexpected service"));
        }
        writer.send(service_accept(SERVICE_USERAUTH)).await?;
        self.authenticate(&mut reader, &mut writer, &session_id).await?;
        self.connection(&mut reader, &mut writer, &mut kex).await
    }

    /// Runs one exchange. `client_init` is the client's KEXINIT when the
    /// client started a rekey; otherwise ours goes first. Returns the
    /// session id.
    async fn key_exchange(
        &self,
        reader: &mut Reader,
        writer: &mut Writer,
        kex: &mut KexContext,
        client_init: Option<Vec<u8>>,
    ) -> Result<Vec<u8>> {
        let prefs = AlgorithmPreferences {
            kex: vec!["curve25519-sha256".to_string()],
            host_key: vec!["ssh-ed25519".to_string()],
            ..AlgorithmPreferences::default()
        };
        let ours = KexInit::from_preferences(&prefs);
        let i_s = ours.to_bytes();
        writer.send(i_s.clone()).await?;

        let i_c = match client_init {
            Some(i_c) => i_c,
            None => expect(reader, MessageType::KexInit).await?,
        };
        let negotiated = negotiate(&KexInit::from_bytes(&i_c)?, &ours)?;

        let init = expect(reader, MessageType::KexdhInit).await?;
        let mut r = WireReader::new(&init[1..]);
        let q_c = r.read_string()?.to_vec();

        let exchange = Curve25519Exchange::new()?;
        let q_s = exchange.public_key().to_vec();
        let k = exchange.compute_shared_secret(&q_c)?;
        let k_s = self.host_key.public_key_bytes();
        let h = ExchangeHash::new(&kex.v_c, &kex.v_s, &i_c, &i_s, &k_s).finish(&q_c, &q_s, &k, false);
        let session_id = kex.session_id.get_or_insert_with(|| h.clone()).clone();

        let reply = KexReply {
            host_key: k_s,
            server_public: q_s,
            signature: self.host_key.sign(&h)?,
        };
        writer.send(reply.to_bytes(false)).await?;

        let (outbound, inbound) = SessionKeys::derive(&k, &h, &session_id, &negotiated).split(Role::Server);
        writer.send(NewKeys.to_bytes()).await?;
        writer.install(PacketSealer::new(&outbound)?, false);
        expect(reader, MessageType::NewKeys).await?;
        reader.install(PacketOpener::new(&inbound)?, false);
        Ok(session_id)
    }

    async fn authenticate(&self, reader: &mut Reader, writer: &mut Writer, session_id: &[u8]) -> Result<()> {
        let mut methods = Vec::new();
        if !self.config.authorized_keys.is_empty() {
            methods.push("publickey".to_string());
        }
        if self.config.password.is_some() {
            methods.push("password".to_string());
        }
        let failure = AuthFailure::new(methods, false).to_bytes();

        loop {
            let payload = expect(reader, MessageType::UserauthRequest).await?;
            let request = AuthRequest::from_bytes(&payload)?;
            let user_ok = request.user_name() == self.config.user;
            self.record(format!("auth:{}", request.method().name()));

            let accepted = match request.method() {
                AuthMethod::Password(password) => {
                    user_ok && self.config.password.as_deref() == Some(password.as_str())
                }
                AuthMethod::PublicKey {
                    algorithm,
                    public_key,
                    signature,
                } => {
                    let authorized = user_ok && self.config.authorized_keys.contains(public_key);
                    match signature {
                        None if authorized => {
                            writer
                                .send(AuthPkOk::new(algorithm.clone(), public_key.clone()).to_bytes())
                                .await?;
                            continue;
                        }
                        None => false,
                        Some(signature) => {
                            let data = construct_signature_data(
                                session_id,
                                request.user_name(),
                                request.service_name(),
                                algorithm,
                                public_key,
                            );
                            authorized && verify_signature(algorithm, public_key, &data, signature).is_ok()
                        }
                    }
                }
                _ => false,
            };

            if accepted {
                writer.send(vec![MessageType::UserauthSuccess as u8]).await?;
                return Ok(());
            }
            writer.send(failure.clone()).await?;
        }
    }

    async fn connection(&self, reader: &mut Reader, writer: &mut Writer, kex: &mut KexContext) -> Result<()> {
        let mut channel: Option<Channel> = None;
        loop {
            let packet = match reader.receive().await {
                Ok(packet) => packet,
                Err(_) => return Ok(()),
            };
            let msg = packet.payload.first().copied().unwrap_or(0);
            if msg == MessageType::Disconnect as u8 {
                return Ok(());
            }
            if msg == MessageType::KexInit as u8 {
                self.key_exchange(reader, writer, kex, Some(packet.payload)).await?;
                self.record("rekey".to_string());
                continue;
            }
            if !(80..=100).contains(&msg) {
                continue;
            }
            match ConnectionMessage::parse(&packet.payload)? {
                ConnectionMessage::GlobalRequest { want_reply, .. } => {
                    if want_reply {
                        writer.send(ConnectionMessage::RequestFailure.to_bytes()).await?;
                    }
                }
                ConnectionMessage::Open(open) => {
                    let confirmation = ChannelOpenConfirmation {
                        recipient_channel: open.sender_channel,
                        sender_channel: 0,
                        initial_window_size: SERVER_WINDOW,
                        maximum_packet_size: SERVER_MAX_PACKET,
                    };
                    writer.send(confirmation.to_bytes()).await?;
                    channel = Some(Channel {
                        client_id: open.sender_channel,
                        client_window: open.initial_window_size,
                        client_max_packet: open.maximum_packet_size.max(1),
                        consumed: 0,
                        pending: VecDeque::new(),
                        exit: None,
                        close_sent: false,
                        mode: Mode::Idle,
                        last_status: 0,
                        omit_exit_status: self.config.omit_exit_status,
                        ignore_window: self.config.ignore_window,
                    });
                }
                ConnectionMessage::Request(request) => {
                    let Some(ch) = channel.as_mut() else { continue };
                    self.on_request(ch, writer, request).await?;
                }
                ConnectionMessage::WindowAdjust { bytes_to_add, .. } => {
                    if let Some(ch) = channel.as_mut() {
                        ch.client_window = ch.client_window.saturating_add(bytes_to_add);
                        ch.flush(writer).await?;
                    }
                }
                ConnectionMessage::Data { data, .. } => {
                    let Some(ch) = channel.as_mut() else { continue };
                    ch.consumed += data.len() as u32;
                    if ch.consumed >= SERVER_WINDOW / 2 {
                        let adjust = ConnectionMessage::WindowAdjust {
                            recipient: ch.client_id,
                            bytes_to_add: ch.consumed,
                        };
                        ch.consumed = 0;
                        writer.send(adjust.to_bytes()).await?;
                    }
                    ch.on_input(writer, &data).await?;
                }
                ConnectionMessage::Eof { .. } => {
                    if let Some(ch) = channel.as_mut() {
                        ch.on_eof(writer).await?;
                    }
                }
                ConnectionMessage::Close { .. } => {
                    if let Some(ch) = channel.as_mut() {
                        if !ch.close_sent {
                            ch.close_sent = true;
                            let close = ConnectionMessage::Close {
                                recipient: ch.client_id,
                            };
                            writer.send(close.to_bytes()).await?;
                        }
                    }
                    channel = None;
                }
                _ => {}
            }
        }
    }

    async fn on_request(&self, ch: &mut Channel, writer: &mut Writer, request: ChannelRequest) -> Result<()> {
        let (event, ok) = match &request.request_type {
            ChannelRequestType::PtyReq { term, .. } => (format!("pty-req:{}", term), !self.config.refuse_pty),
            ChannelRequestType::Exec { command } => (format!("exec:{}", command), true),
            ChannelRequestType::Shell => ("shell".to_string(), true),
            other => (other.name().to_string(), false),
        };
        self.record(event);

        if request.want_reply {
            let reply = if ok {
                ConnectionMessage::Success {
                    recipient: ch.client_id,
                }
            } else {
                ConnectionMessage::Failure {
                    recipient: ch.client_id,
                }
            };
            writer.send(reply.to_bytes()).await?;
        }

        match request.request_type {
            ChannelRequestType::Exec { command } if command.trim() == "cat" => ch.mode = Mode::Cat,
            ChannelRequestType::Exec { command } => {
                ch.mode = Mode::Done;
                let status = ch.run_script(writer, &command).await?;
                ch.finish(writer, status.unwrap_or(ch.last_status)).await?;
            }
            ChannelRequestType::Shell => ch.mode = Mode::Shell(Vec::new()),
            _ => {}
        }
        Ok(())
    }
}

impl Channel {
    async fn output(&mut self, writer: &mut Writer, code: Option<u32>, data: Vec<u8>) -> Result<()> {
        self.pending.push_back((code, data));
        self.flush(writer).await
    }

    async fn flush(&mut self, writer: &mut Writer) -> Result<()> {
        while let Some((code, data)) = self.pending.pop_front() {
            if self.client_window == 0 && !self.ignore_window {
                self.pending.push_front((code, data));
                return Ok(());
            }
            let window = if self.ignore_window {
                usize::MAX
            } else {
                self.client_window as usize
            };
            let n = data.len().min(window).min(self.client_max_packet as usize);
            let (now, later) = data.split_at(n);
            let message = match code {
                Some(code) => ConnectionMessage::ExtendedData {
                    recipient: self.client_id,
                    code,
                    data: now.to_vec(),
                },
                None => ConnectionMessage::Data {
                    recipient: self.client_id,
                    data: now.to_vec(),
                },
            };
            writer.send(message.to_bytes()).await?;
            self.client_window = self.client_window.saturating_sub(n as u32);
            if !later.is_empty() {
                self.pending.push_front((code, later.to_vec()));
            }
        }
        if let Some(status) = self.exit {
            if !self.close_sent {
                self.close_sent = true;
                if !self.omit_exit_status {
                    let exit = ChannelRequest::new(
                        self.client_id,
                        ChannelRequestType::ExitStatus { exit_status: status },
                        false,
                    );
                    writer.send(exit.to_bytes()).await?;
                }
                writer
                    .send(ConnectionMessage::Eof { recipient: self.client_id }.to_bytes())
                    .await?;
                writer
                    .send(ConnectionMessage::Close { recipient: self.client_id }.to_bytes())
                    .await?;
            }
        }
        Ok(())
    }

    async fn finish(&mut self, writer: &mut Writer, status: u32) -> Result<()> {
        self.mode = Mode::Done;
        self.exit = Some(status);
        self.flush(writer).await
    }

    async fn on_input(&mut self, writer: &mut Writer, data: &[u8]) -> Result<()> {
        if matches!(self.mode, Mode::Cat) {
            return self.output(writer, None, data.to_vec()).await;
        }
        let lines = match &mut self.mode {
            Mode::Shell(buffer) => {
                buffer.extend_from_slice(data);
                let mut lines = Vec::new();
                while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    lines.push(String::from_utf8_lossy(&line).trim().to_string());
                }
                lines
            }
            _ => return Ok(()),
        };
        for line in lines {
            if let Some(status) = self.run_script(writer, &line).await? {
                return self.finish(writer, status).await;
            }
        }
        Ok(())
    }

    async fn on_eof(&mut self, writer: &mut Writer) -> Result<()> {
        match self.mode {
            Mode::Cat | Mode::Shell(_) => {
                let status = self.last_status;
                self.finish(writer, status).await
            }
            Mode::Idle | Mode::Done => Ok(()),
        }
    }

    /// Runs `;`-separated commands. Returns the status if `exit` was run.
    async fn run_script(&mut self, writer: &mut Writer, script: &str) -> Result<Option<u32>> {
        for command in script.split(';').map(str::trim).filter(|c| !c.is_empty()) {
            let (command, to_stderr) = match command.strip_suffix(">&2") {
                Some(rest) => (rest.trim_end(), true),
                None => (command, false),
            };
            let code = to_stderr.then_some(EXTENDED_DATA_STDERR);

            if let Some(rest) = command.strip_prefix("exit") {
                let status = rest.trim().parse().unwrap_or(self.last_status);
                return Ok(Some(status));
            } else if command == "echo" || command.starts_with("echo ") {
                let text = command.strip_prefix("echo").unwrap_or_default().trim_start();
                self.output(writer, code, format!("{}\n", text).into_bytes()).await?;
                self.last_status = 0;
            } else if let Some(count) = command.strip_prefix("flood ") {
                let count: usize = count.trim().parse().unwrap_or(0);
                self.output(writer, code, vec![b'x'; count]).await?;
                self.last_status = 0;
            } else if command == "true" {
                self.last_status = 0;
            } else if command == "false" {
                self.last_status = 1;
            } else {
                let message = format!("sh: {}: command not found\n", command);
                self.output(writer, Some(EXTENDED_DATA_STDERR), message.into_bytes())
                    .await?;
                self.last_status = 127;
            }
        }
        Ok(None)
    }
}

async fn expect(reader: &mut Reader, message: MessageType) -> Result<Vec<u8>> {
    loop {
        let packet = reader.receive().await?;
        match packet.payload.first().copied() {
            Some(m) if m == message as u8 => return Ok(packet.payload),
            Some(m) if m == MessageType::Ignore as u8 || m == MessageType::Debug as u8 => continue,
            Some(m) if m == MessageType::Disconnect as u8 => {
                return Err(SshError::protocol("client disconnected"))
            }
            _ => {
                return Err(SshError::protocol(format!(
                    "expected {:?}, got {:?}",
                    message,
                    packet.payload.first()
                )))
            }
        }
    }
}
