//! Session facade: one target, one transport, one interactive channel.
//!
//! ```text
//! Disconnected -> Negotiating -> Authenticating -> ChannelOpen -> Running -> Closed
//!        \______________\_______________\_____________\____________\-> Failed
//! ```
//!
//! [`Session::connect`] covers everything up to `ChannelOpen` and returns a
//! [`LiveSession`]. [`LiveSession::run`] executes a command (or a shell),
//! streaming the caller's input to the channel and the channel's output to
//! the caller's sinks until the server closes the channel.
//!
//! # Example
//!
//! ```rust,no_run
//! use tether_proto::ssh::config::Options;
//! use tether_proto::ssh::session::Session;
//! use tether_proto::ssh::target::Target;
//! use tether_proto::ssh::userauth::Credentials;
//!
//! # async fn example() -> tether_proto::ssh::Result<()> {
//! let mut session = Session::new(Target::parse("alice@example.com"), Options::default())
//!     .with_credentials(Credentials::new().with_default_key());
//! let mut live = session.connect().await?;
//! let status = live
//!     .run(Some("uptime"), tokio::io::empty(), tokio::io::stdout(), tokio::io::stderr())
//!     .await?;
//! live.close().await?;
//! println!("{}", status);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ssh::channel::{Channel, ChannelMsg, ChannelWriter, ExitStatus};
use crate::ssh::config::Options;
use crate::ssh::connection::EXTENDED_DATA_STDERR;
use crate::ssh::dispatcher::DriverConfig;
use crate::ssh::error::{Result, SshError};
use crate::ssh::handshake::KexParams;
use crate::ssh::logging;
use crate::ssh::mux::{self, Multiplexer};
use crate::ssh::privatekey::PrivateKey;
use crate::ssh::target::Target;
use crate::ssh::transport;
use crate::ssh::trust::{HostKeyChecking, HostKeyStore, KnownHostsStore, MemoryHostKeyStore};
use crate::ssh::userauth::{Authenticated, Authenticator, Credentials};
use crate::ssh::version::Version;

/// How long [`LiveSession::close`] waits for the server's CHANNEL_CLOSE.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Size of the stdin copy buffer.
const INPUT_BUFFER: usize = 16 * 1024;

/// Where a session is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing started yet
    Disconnected,
    /// TCP, identification and key exchange
    Negotiating,
    /// User authentication
    Authenticating,
    /// The session channel is open
    ChannelOpen,
    /// A command or shell is running
    Running,
    /// Finished normally
    Closed,
    /// Finished with an error
    Failed,
}

impl SessionState {
    /// Returns `true` for `Closed` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    fn can_become(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Disconnected, Negotiating)
            | (Negotiating, Authenticating)
            | (Authenticating, ChannelOpen)
            | (ChannelOpen, Running)
            | (ChannelOpen, Closed)
            | (Running, Closed) => true,
            (current, Failed) => !current.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone)]
struct StateMachine {
    current: SessionState,
    peer: String,
}

impl StateMachine {
    fn new(peer: String, current: SessionState) -> Self {
        Self { current, peer }
    }

    fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.current.can_become(next) {
            return Err(SshError::protocol(format!(
                "Invalid session state transition: {} -> {}",
                self.current, next
            )));
        }
        logging::log_state_transition(&self.peer, &self.current.to_string(), &next.to_string());
        self.current = next;
        Ok(())
    }
}

/// A configured, not yet connected session.
pub struct Session {
    target: Target,
    options: Options,
    credentials: Option<Credentials>,
    store: Option<Arc<dyn HostKeyStore>>,
    state: StateMachine,
}

impl Session {
    /// Creates a session for `target`.
    pub fn new(target: Target, options: Options) -> Self {
        let peer = target.to_string();
        Self {
            target,
            options,
            credentials: None,
            store: None,
            state: StateMachine::new(peer, SessionState::Disconnected),
        }
    }

    /// Sets the keys and prompter used for authentication. Without this,
    /// the default key under `~/.ssh` is tried.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Overrides where host keys are looked up and recorded. By default the
    /// `UserKnownHostsFile` is used.
    pub fn with_host_key_store(mut self, store: Arc<dyn HostKeyStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Target of this session.
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Options of this session.
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state.current
    }

    /// Connects, negotiates keys, authenticates and opens a session
    /// channel.
    ///
    /// # Errors
    ///
    /// Any [`SshError`]; the session is then `Failed` and cannot be
    /// reused.
    pub async fn connect(&mut self) -> Result<LiveSession> {
        match self.establish().await {
            Ok(live) => Ok(live),
            Err(err) => {
                if !self.state.current.is_terminal() {
                    let _ = self.state.transition(SessionState::Failed);
                }
                Err(err)
            }
        }
    }

    async fn establish(&mut self) -> Result<LiveSession> {
        self.state.transition(SessionState::Negotiating)?;
        self.target.validate()?;
        self.options.validate()?;
        let user = self.target.resolved_user()?;
        let credentials = self.credentials();
        let store = self.host_key_store()?;
        let peer = self.target.address();

        let mut stream = transport::open(
            &self.target.host,
            self.target.port,
            self.options.connect_timeout,
        )
        .await?;
        let ours = Version::client_default();
        let theirs =
            transport::exchange_versions(&mut stream, &ours, self.options.connect_timeout).await?;
        logging::log_version_exchange(&peer, theirs.as_str());

        let params = KexParams {
            host: self.target.host.clone(),
            port: self.target.port,
            policy: self.options.host_key_checking,
            store,
            preferences: self.options.algorithms.clone(),
            client_version: ours.as_str().to_string(),
            server_version: theirs.as_str().to_string(),
        };
        let config = DriverConfig {
            peer: peer.clone(),
            rekey: self.options.rekey,
            keepalive_interval: self.options.server_alive_interval,
            keepalive_count_max: self.options.server_alive_count_max,
        };
        let (mux, mut handle) = mux::start(stream, params, config);
        let session_id = handle.ready().await?;

        self.state.transition(SessionState::Authenticating)?;
        let authenticated = match Authenticator::new(&mut handle, &session_id, &self.target.host)
            .authenticate(&user, &credentials)
            .await
        {
            Ok(authenticated) => authenticated,
            Err(err) => {
                let _ = mux.disconnect("authentication failed").await;
                return Err(err);
            }
        };
        handle.finish_auth()?;

        let channel = match mux.open_session().await {
            Ok(channel) => channel,
            Err(err) => {
                let _ = mux.disconnect("session channel refused").await;
                return Err(err);
            }
        };
        self.state.transition(SessionState::ChannelOpen)?;

        Ok(LiveSession {
            target: self.target.clone(),
            options: self.options.clone(),
            mux,
            channel: Some(channel),
            authenticated,
            state: StateMachine::new(peer, SessionState::ChannelOpen),
        })
    }

    fn credentials(&self) -> Credentials {
        let mut credentials = match &self.credentials {
            Some(credentials) => credentials.clone(),
            None => Credentials::new().with_default_key(),
        };
        for path in &self.options.identity_files {
            match PrivateKey::from_file(path) {
                Ok(key) => credentials = credentials.with_key(key),
                Err(e) => warn!(path = %path.display(), error = %e, "Cannot load identity file"),
            }
        }
        credentials
    }

    fn host_key_store(&self) -> Result<Arc<dyn HostKeyStore>> {
        if let Some(store) = &self.store {
            return Ok(store.clone());
        }
        if self.options.host_key_checking == HostKeyChecking::Insecure {
            return Ok(Arc::new(MemoryHostKeyStore::new()));
        }
        let store = KnownHostsStore::open(&self.options.known_hosts)?
            .with_hashed_hostnames(self.options.hash_known_hosts);
        Ok(Arc::new(store))
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("target", &self.target)
            .field("state", &self.state.current)
            .finish_non_exhaustive()
    }
}

/// An authenticated connection with its session channel.
pub struct LiveSession {
    target: Target,
    options: Options,
    mux: Multiplexer,
    channel: Option<Channel>,
    authenticated: Authenticated,
    state: StateMachine,
}

impl LiveSession {
    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state.current
    }

    /// Target this session is connected to.
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// How authentication succeeded.
    pub fn authenticated(&self) -> &Authenticated {
        &self.authenticated
    }

    /// The connection, for opening further channels.
    pub fn multiplexer(&self) -> &Multiplexer {
        &self.mux
    }

    /// Runs `command`, or the login shell when `None`, until the server
    /// closes the channel.
    ///
    /// A pseudo-terminal is requested first when `RequestTTY` is set; a
    /// refusal is logged and the command runs without one. Input is copied
    /// until `stdin` reaches end of file, then EOF is sent.
    pub async fn run<I, O, E>(
        &mut self,
        command: Option<&str>,
        stdin: I,
        stdout: O,
        stderr: E,
    ) -> Result<ExitStatus>
    where
        I: AsyncRead + Unpin + Send + 'static,
        O: AsyncWrite + Unpin + Send + 'static,
        E: AsyncWrite + Unpin + Send + 'static,
    {
        self.state.transition(SessionState::Running)?;
        let channel = self.channel.take().ok_or(SshError::ChannelClosed)?;

        match self.run_channel(channel, command, stdin, stdout, stderr).await {
            Ok(status) => {
                self.state.transition(SessionState::Closed)?;
                Ok(status)
            }
            Err(err) => {
                let next = if err.is_fatal() {
                    SessionState::Failed
                } else {
                    SessionState::Closed
                };
                let _ = self.state.transition(next);
                Err(err)
            }
        }
    }

    /// Runs the login shell on this process's stdin, stdout and stderr.
    pub async fn run_interactive(&mut self) -> Result<ExitStatus> {
        self.run(
            None,
            tokio::io::stdin(),
            tokio::io::stdout(),
            tokio::io::stderr(),
        )
        .await
    }

    async fn run_channel<I, O, E>(
        &self,
        channel: Channel,
        command: Option<&str>,
        stdin: I,
        stdout: O,
        stderr: E,
    ) -> Result<ExitStatus>
    where
        I: AsyncRead + Unpin + Send + 'static,
        O: AsyncWrite + Unpin + Send + 'static,
        E: AsyncWrite + Unpin + Send + 'static,
    {
        if self.options.request_tty {
            match channel
                .request_pty(&self.options.term, self.options.cols, self.options.rows)
                .await
            {
                Ok(()) => {}
                Err(SshError::RequestFailed { .. }) => warn!("PTY allocation request failed"),
                Err(err) => return Err(err),
            }
        }
        match command {
            Some(command) => channel.exec(command).await?,
            None => channel.request_shell().await?,
        }

        let token = CancellationToken::new();
        let mut input = tokio::spawn(copy_input(stdin, channel.writer(), token.clone()));
        let mut output = tokio::spawn(copy_output(channel, stdout, stderr, token.clone()));

        let mut input_done = false;
        let mut input_error = None;
        let status = loop {
            tokio::select! {
                result = &mut output => break flatten(result),
                result = &mut input, if !input_done => {
                    input_done = true;
                    if let Err(err) = flatten(result) {
                        warn!(error = %err, "Copying input failed");
                        input_error = Some(err);
                        token.cancel();
                    }
                }
            }
        };
        token.cancel();
        if !input_done {
            let _ = input.await;
        }

        let status = status?;
        match input_error {
            Some(err) => Err(err),
            None => Ok(status),
        }
    }

    /// Closes the channel, sends SSH_MSG_DISCONNECT and shuts the socket
    /// down. Missing replies from the server are tolerated.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(mut channel) = self.channel.take() {
            if channel.close().is_ok() {
                let drained = tokio::time::timeout(CLOSE_GRACE, async {
                    while !matches!(channel.read().await, ChannelMsg::Closed(_)) {}
                })
                .await;
                if drained.is_err() {
                    debug!("Server did not confirm channel close");
                }
            }
        }
        self.mux.disconnect("disconnected by user").await?;
        if !self.state.current.is_terminal() {
            self.state.transition(SessionState::Closed)?;
        }
        Ok(())
    }
}

impl fmt::Debug for LiveSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveSession")
            .field("target", &self.target)
            .field("state", &self.state.current)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

fn flatten<T>(result: std::result::Result<Result<T>, tokio::task::JoinError>) -> Result<T> {
    match result {
        Ok(inner) => inner,
        Err(join) => Err(std::io::Error::from(join).into()),
    }
}

async fn copy_input<I>(mut stdin: I, writer: ChannelWriter, token: CancellationToken) -> Result<()>
where
    I: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; INPUT_BUFFER];
    loop {
        let n = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            read = stdin.read(&mut buf) => read?,
        };
        if n == 0 {
            // The channel may already be closed by the server.
            if let Err(err) = writer.send_eof() {
                debug!(error = %err, "Could not send EOF");
            }
            return Ok(());
        }
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            written = writer.write(&buf[..n]) => {
                if let Err(err) = written {
                    if err.is_fatal() {
                        return Err(err);
                    }
                    debug!(error = %err, "Channel no longer accepts input");
                    return Ok(());
                }
            }
        }
    }
}

async fn copy_output<O, E>(
    mut channel: Channel,
    mut stdout: O,
    mut stderr: E,
    token: CancellationToken,
) -> Result<ExitStatus>
where
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    let mut closing = false;
    loop {
        let msg = tokio::select! {
            _ = token.cancelled(), if !closing => {
                closing = true;
                let _ = channel.close();
                continue;
            }
            msg = channel.read() => msg,
        };
        match msg {
            ChannelMsg::Data(data) => {
                stdout.write_all(&data).await?;
                stdout.flush().await?;
            }
            ChannelMsg::ExtendedData { code, data } => {
                if code != EXTENDED_DATA_STDERR {
                    debug!(code, "Extended data of unknown type written to stderr");
                }
                stderr.write_all(&data).await?;
                stderr.flush().await?;
            }
            ChannelMsg::Eof => debug!(channel = channel.local_id(), "Server sent EOF"),
            ChannelMsg::Closed(Some(cause)) => return Err(cause),
            ChannelMsg::Closed(None) => {
                return Ok(channel
                    .exit_status()
                    .cloned()
                    .unwrap_or(ExitStatus::Indeterminate))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_happy_path() {
        let mut state = StateMachine::new("h:22".into(), SessionState::Disconnected);
        for next in [
            SessionState::Negotiating,
            SessionState::Authenticating,
            SessionState::ChannelOpen,
            SessionState::Running,
            SessionState::Closed,
        ] {
            state.transition(next).unwrap();
        }
        assert!(state.current.is_terminal());
    }

    #[test]
    fn test_state_machine_rejects_invalid_transitions() {
        let mut state = StateMachine::new("h:22".into(), SessionState::Disconnected);
        assert!(state.transition(SessionState::Running).is_err());
        state.transition(SessionState::Negotiating).unwrap();
        assert!(state.transition(SessionState::ChannelOpen).is_err());
        state.transition(SessionState::Failed).unwrap();
        assert!(state.transition(SessionState::Failed).is_err());
        assert!(state.transition(SessionState::Negotiating).is_err());
    }

    #[tokio::test]
    async fn test_connect_without_host_fails_early() {
        let mut session = Session::new(Target::new("u", "", 22), Options::default());
        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, SshError::Config(_)));
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_connect_refused_is_connect_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let options = Options::builder()
            .with_host_key_checking(HostKeyChecking::Insecure)
            .build()
            .unwrap();
        let mut session = Session::new(Target::new("u", "127.0.0.1", port), options)
            .with_credentials(Credentials::new());
        let err = session.connect().await.unwrap_err();
        assert!(matches!(err, SshError::Connect { .. }));
        assert_eq!(session.state(), SessionState::Failed);
    }
}
