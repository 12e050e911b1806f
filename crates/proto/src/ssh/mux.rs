//! Handles onto a running connection.
//!
//! [`start`] splits the socket between a reader task and the connection
//! driver (see [`crate::ssh::dispatcher`]) and returns two handles:
//!
//! - [`Multiplexer`], cloneable, opens channels and ends the connection;
//! - [`TransportHandle`], used once by the session to wait for the initial
//!   key exchange and to run user authentication over the transport.
//!
//! Neither handle touches the socket. Everything goes through the driver as
//! a [`Command`], so the driver alone decides what may be sent while a key
//! exchange is in progress.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::ssh::channel::{Channel, ChannelParts};
use crate::ssh::connection::ChannelRequestType;
use crate::ssh::dispatcher::{self, Dispatcher, DriverConfig};
use crate::ssh::error::{Result, SshError};
use crate::ssh::handshake::{KexParams, KeyExchange};
use crate::ssh::message::DisconnectReason;
use crate::ssh::transport::{PacketReader, PacketWriter};
use crate::ssh::userauth::AuthTransport;

/// Packets the reader may queue ahead of the driver.
const INBOUND_QUEUE: usize = 64;

/// Requests from handles to the connection driver.
#[derive(Debug)]
pub(crate) enum Command {
    Open {
        channel_type: String,
        type_data: Vec<u8>,
        reply: oneshot::Sender<Result<ChannelParts>>,
    },
    Data {
        local: u32,
        code: Option<u32>,
        data: Vec<u8>,
    },
    Eof {
        local: u32,
    },
    Close {
        local: u32,
    },
    Request {
        local: u32,
        request: ChannelRequestType,
        reply: Option<oneshot::Sender<bool>>,
    },
    WindowAdjust {
        local: u32,
        bytes: u32,
    },
    /// Authentication-layer payload
    Send(Vec<u8>),
    AuthComplete,
    Rekey,
    Disconnect {
        reason: DisconnectReason,
        description: String,
        done: oneshot::Sender<()>,
    },
}

/// State the driver shares with every handle.
#[derive(Debug, Default)]
pub(crate) struct Shared {
    failure: Mutex<Option<SshError>>,
}

impl Shared {
    /// Records the error that ended the transport. The first one wins.
    pub(crate) fn fail(&self, err: SshError) {
        let mut failure = self.failure.lock().unwrap_or_else(|p| p.into_inner());
        if failure.is_none() {
            *failure = Some(err);
        }
    }

    pub(crate) fn failure(&self) -> Option<SshError> {
        self.failure
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Error for an operation that found the driver gone.
    pub(crate) fn cause(&self) -> SshError {
        self.failure().unwrap_or(SshError::ChannelClosed)
    }
}

/// Spawns the reader task and the connection driver over `stream`.
///
/// The driver sends our KEXINIT immediately; [`TransportHandle::ready`]
/// resolves once the first key exchange has completed.
pub fn start<S>(stream: S, params: KexParams, config: DriverConfig) -> (Multiplexer, TransportHandle)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
    let (keys_tx, keys_rx) = mpsc::unbounded_channel();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let (auth_tx, auth_rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = oneshot::channel();
    let shared = Arc::new(Shared::default());

    let reader = tokio::spawn(dispatcher::read_loop(
        PacketReader::new(read_half),
        inbound_tx,
        keys_rx,
    ));
    let driver = Dispatcher::new(
        PacketWriter::new(write_half),
        KeyExchange::new(params),
        keys_tx,
        auth_tx,
        ready_tx,
        shared.clone(),
        config,
    );
    tokio::spawn(async move {
        driver.run(inbound_rx, commands_rx).await;
        reader.abort();
    });

    let mux = Multiplexer {
        commands: commands_tx.clone(),
        shared: shared.clone(),
    };
    let handle = TransportHandle {
        commands: commands_tx,
        auth: auth_rx,
        ready: Some(ready_rx),
        shared,
    };
    (mux, handle)
}

/// Opens channels on a connection and ends it.
#[derive(Clone)]
pub struct Multiplexer {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl Multiplexer {
    fn submit(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| self.shared.cause())
    }

    /// Opens a `session` channel.
    pub async fn open_session(&self) -> Result<Channel> {
        self.open_channel("session", Vec::new()).await
    }

    /// Opens a channel of `channel_type` with type-specific data appended
    /// to the CHANNEL_OPEN message.
    ///
    /// # Errors
    ///
    /// [`SshError::ChannelOpenFailed`] when the server refuses; the
    /// connection stays usable.
    pub async fn open_channel(&self, channel_type: &str, type_data: Vec<u8>) -> Result<Channel> {
        let (reply, opened) = oneshot::channel();
        self.submit(Command::Open {
            channel_type: channel_type.to_string(),
            type_data,
            reply,
        })?;
        match opened.await {
            Ok(Ok(parts)) => Ok(Channel::new(parts, self.commands.clone())),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(self.shared.cause()),
        }
    }

    /// Starts a key re-exchange now.
    pub fn rekey(&self) -> Result<()> {
        self.submit(Command::Rekey)
    }

    /// Sends SSH_MSG_DISCONNECT and shuts the socket down. Waits until the
    /// driver has stopped; a connection that is already gone is not an
    /// error.
    pub async fn disconnect(&self, description: &str) -> Result<()> {
        let (done, stopped) = oneshot::channel();
        let sent = self.commands.send(Command::Disconnect {
            reason: DisconnectReason::ByApplication,
            description: description.to_string(),
            done,
        });
        if sent.is_err() {
            debug!("Connection driver already stopped");
            return Ok(());
        }
        let _ = stopped.await;
        Ok(())
    }

    /// Returns `true` once the driver has stopped.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Error that ended the transport, if it failed.
    pub fn failure(&self) -> Option<SshError> {
        self.shared.failure()
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// The session's view of the transport before channels exist.
pub struct TransportHandle {
    commands: mpsc::UnboundedSender<Command>,
    auth: mpsc::UnboundedReceiver<Vec<u8>>,
    ready: Option<oneshot::Receiver<Result<Vec<u8>>>>,
    shared: Arc<Shared>,
}

impl TransportHandle {
    /// Waits for the initial key exchange and returns the session
    /// identifier.
    pub async fn ready(&mut self) -> Result<Vec<u8>> {
        let ready = self
            .ready
            .take()
            .ok_or_else(|| SshError::protocol("Key exchange result already taken"))?;
        match ready.await {
            Ok(result) => result,
            Err(_) => Err(self.shared.cause()),
        }
    }

    /// Tells the driver that authentication is over; later authentication
    /// messages from the server are answered with UNIMPLEMENTED.
    pub fn finish_auth(self) -> Result<()> {
        self.commands
            .send(Command::AuthComplete)
            .map_err(|_| self.shared.cause())
    }
}

#[async_trait]
impl AuthTransport for TransportHandle {
    async fn send(&mut self, payload: Vec<u8>) -> Result<()> {
        self.commands
            .send(Command::Send(payload))
            .map_err(|_| self.shared.cause())
    }

    async fn recv(&mut self) -> Result<Vec<u8>> {
        match self.auth.recv().await {
            Some(payload) => Ok(payload),
            None => Err(self.shared.cause()),
        }
    }
}

impl std::fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandle")
            .field("awaiting_kex", &self.ready.is_some())
            .finish_non_exhaustive()
    }
}
