//! SSH connection driver.
//!
//! One task owns the sending half of the socket, the key exchange machine
//! and the channel table; a second task only reads and decrypts packets.
//! Inbound packets are routed by message number:
//!
//! | numbers   | destination                                   |
//! |-----------|-----------------------------------------------|
//! | 1 - 4     | handled here (disconnect, ignore, debug, ...) |
//! | 20 - 49   | [`KeyExchange`]                               |
//! | 5 - 7, 50 - 79 | the authenticator, via [`TransportHandle`](crate::ssh::mux::TransportHandle) |
//! | 80 - 82, 90 - 100 | global requests and channels          |
//! | other     | answered with SSH_MSG_UNIMPLEMENTED           |
//!
//! While a key exchange is in progress the driver stops taking commands
//! and holds every non-transport message it generates itself; the queue
//! is drained in order right after our NEWKEYS.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tether_platform::TetherResult;
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval};
use tracing::{debug, trace, warn};

use crate::ssh::channel::{ChannelEvent, ChannelParts, ExitStatus, ReceiveWindow, SendWindow};
use crate::ssh::connection::{
    ChannelOpen, ChannelOpenConfirmation, ChannelOpenFailure, ChannelOpenFailureReason,
    ChannelRequest, ChannelRequestType, ConnectionMessage, CHANNEL_MAX_PACKET,
    CHANNEL_WINDOW_SIZE, KEEPALIVE_REQUEST,
};
use crate::ssh::crypto::PacketOpener;
use crate::ssh::error::{Result, SshError};
use crate::ssh::handshake::{KexAction, KeyExchange};
use crate::ssh::keepalive::{Keepalive, KeepaliveAction};
use crate::ssh::kex::NewKeys;
use crate::ssh::logging;
use crate::ssh::message::{self, DisconnectReason, MessageType};
use crate::ssh::mux::{Command, Shared};
use crate::ssh::transport::{InboundPacket, PacketReader, PacketWriter, RekeyLimits, TrafficCounter};
use crate::ssh::wire::WireReader;

/// How long a failing transport waits to get its DISCONNECT out.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Connection-wide settings for the driver.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// `host:port`, for logs
    pub peer: String,
    /// When to re-exchange keys
    pub rekey: RekeyLimits,
    /// `ServerAliveInterval`; zero disables probing
    pub keepalive_interval: Duration,
    /// `ServerAliveCountMax`
    pub keepalive_count_max: u32,
}

/// Reads packets until the socket fails or the driver goes away.
///
/// After forwarding the peer's NEWKEYS the reader waits for the matching
/// inbound keys before reading on, since the next packet is already
/// protected by them.
pub(crate) async fn read_loop<R>(
    mut reader: PacketReader<R>,
    packets: mpsc::Sender<TetherResult<InboundPacket>>,
    mut keys: mpsc::UnboundedReceiver<(PacketOpener, bool)>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    loop {
        match reader.receive().await {
            Ok(packet) => {
                let newkeys = message::message_number(&packet.payload)
                    == Some(MessageType::NewKeys as u8);
                if packets.send(Ok(packet)).await.is_err() {
                    return;
                }
                if newkeys {
                    match keys.recv().await {
                        Some((opener, reset)) => reader.install(opener, reset),
                        None => return,
                    }
                }
            }
            Err(err) => {
                let _ = packets.send(Err(err)).await;
                return;
            }
        }
    }
}

struct Slot {
    remote_id: u32,
    events: mpsc::UnboundedSender<ChannelEvent>,
    send_window: Arc<SendWindow>,
    recv_window: Arc<ReceiveWindow>,
    replies: VecDeque<oneshot::Sender<bool>>,
    eof_sent: bool,
    close_sent: bool,
}

enum Flow {
    Continue,
    Stop,
}

/// Owner of the outbound half of a connection.
pub(crate) struct Dispatcher<W> {
    writer: PacketWriter<W>,
    kex: KeyExchange,
    keys: mpsc::UnboundedSender<(PacketOpener, bool)>,
    counter: TrafficCounter,
    keepalive: Keepalive,
    config: DriverConfig,
    paused: bool,
    held: VecDeque<Vec<u8>>,
    channels: HashMap<u32, Slot>,
    pending_opens: HashMap<u32, oneshot::Sender<Result<ChannelParts>>>,
    next_channel_id: u32,
    auth: Option<mpsc::UnboundedSender<Vec<u8>>>,
    authenticated: bool,
    ready: Option<oneshot::Sender<Result<Vec<u8>>>>,
    shared: Arc<Shared>,
}

impl<W: AsyncWrite + Unpin> Dispatcher<W> {
    pub(crate) fn new(
        writer: PacketWriter<W>,
        kex: KeyExchange,
        keys: mpsc::UnboundedSender<(PacketOpener, bool)>,
        auth: mpsc::UnboundedSender<Vec<u8>>,
        ready: oneshot::Sender<Result<Vec<u8>>>,
        shared: Arc<Shared>,
        config: DriverConfig,
    ) -> Self {
        Self {
            writer,
            kex,
            keys,
            counter: TrafficCounter::new(),
            keepalive: Keepalive::new(config.keepalive_interval, config.keepalive_count_max),
            config,
            paused: false,
            held: VecDeque::new(),
            channels: HashMap::new(),
            pending_opens: HashMap::new(),
            next_channel_id: 0,
            auth: Some(auth),
            authenticated: false,
            ready: Some(ready),
            shared,
        }
    }

    /// Drives the connection until it is disconnected or fails.
    pub(crate) async fn run(
        mut self,
        mut inbound: mpsc::Receiver<TetherResult<InboundPacket>>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        match self.drive(&mut inbound, &mut commands).await {
            Ok(()) => debug!(peer = %self.config.peer, "SSH connection driver stopped"),
            Err(err) => self.fail(err).await,
        }
    }

    async fn drive(
        &mut self,
        inbound: &mut mpsc::Receiver<TetherResult<InboundPacket>>,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Result<()> {
        let actions = self.kex.start()?;
        self.apply(actions).await?;

        let mut ticker = self.keepalive.enabled().then(|| {
            let period = self.keepalive.interval();
            tokio::time::interval_at(Instant::now() + period, period)
        });

        loop {
            let rekey_at = if self.kex.in_progress() || self.kex.is_initial() {
                None
            } else {
                self.counter.deadline(&self.config.rekey)
            };

            tokio::select! {
                packet = inbound.recv() => match packet {
                    Some(Ok(packet)) => self.on_packet(packet).await?,
                    Some(Err(err)) => return Err(err.into()),
                    None => return Err(SshError::protocol("Connection reader stopped")),
                },
                command = commands.recv(), if !self.paused => match command {
                    Some(command) => {
                        if let Flow::Stop = self.on_command(command).await? {
                            return Ok(());
                        }
                    }
                    None => {
                        self.disconnect(DisconnectReason::ByApplication, "session dropped").await;
                        return Ok(());
                    }
                },
                _ = tick(&mut ticker) => self.on_keepalive().await?,
                _ = sleep_until(rekey_at) => self.start_rekey().await?,
            }

            if !self.kex.in_progress()
                && !self.kex.is_initial()
                && self.counter.needs_rekey(&self.config.rekey)
            {
                self.start_rekey().await?;
            }
        }
    }

    async fn send_now(&mut self, payload: Vec<u8>) -> Result<()> {
        let wire_len = self.writer.send(payload).await?;
        self.counter.record_outbound(wire_len);
        Ok(())
    }

    /// Sends `payload`, or holds it while a key exchange forbids it.
    async fn queue(&mut self, payload: Vec<u8>) -> Result<()> {
        let number = message::message_number(&payload).unwrap_or(0);
        let allowed_during_kex = MessageType::is_transport(number) && !(5..=7).contains(&number);
        if self.paused && !allowed_during_kex {
            trace!(message = %message::describe(&payload), "Holding message until NEWKEYS");
            self.held.push_back(payload);
            return Ok(());
        }
        self.send_now(payload).await
    }

    async fn apply(&mut self, actions: Vec<KexAction>) -> Result<()> {
        for action in actions {
            match action {
                KexAction::Send(payload) => {
                    if message::message_number(&payload) == Some(MessageType::KexInit as u8) {
                        self.paused = true;
                    }
                    self.send_now(payload).await?;
                }
                KexAction::InstallInbound {
                    opener,
                    reset_sequence,
                } => {
                    self.keys
                        .send((opener, reset_sequence))
                        .map_err(|_| SshError::protocol("Connection reader stopped"))?;
                }
                KexAction::SendNewKeys {
                    sealer,
                    reset_sequence,
                } => {
                    self.send_now(NewKeys.to_bytes()).await?;
                    self.writer.install(sealer, reset_sequence);
                    self.paused = false;
                    while let Some(payload) = self.held.pop_front() {
                        self.send_now(payload).await?;
                    }
                }
                KexAction::Complete(outcome) => {
                    self.counter.reset();
                    if !outcome.rekey {
                        if let Some(ready) = self.ready.take() {
                            let session_id = self.kex.session_id().map(<[u8]>::to_vec);
                            let _ = ready.send(session_id.ok_or_else(|| {
                                SshError::protocol("Key exchange finished without a session id")
                            }));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn start_rekey(&mut self) -> Result<()> {
        let actions = self.kex.start()?;
        self.apply(actions).await
    }

    async fn on_packet(&mut self, packet: InboundPacket) -> Result<()> {
        self.counter.record_inbound(packet.wire_len);
        let number = message::message_number(&packet.payload)
            .ok_or_else(|| SshError::protocol("Empty packet payload"))?;
        self.kex.check_inbound(number)?;

        match number {
            1 => Err(self.peer_disconnect(&packet.payload)),
            2 | 4 => {
                trace!(message = %message::describe(&packet.payload), "Ignoring message");
                Ok(())
            }
            3 => {
                let mut r = WireReader::new(&packet.payload[1..]);
                let seq = r.read_u32().unwrap_or(0);
                warn!(seq_num = seq, "Server did not implement one of our messages");
                Ok(())
            }
            20..=49 => {
                let actions = self.kex.handle(&packet)?;
                self.apply(actions).await
            }
            5..=7 | 50..=79 => self.to_auth(packet).await,
            80..=82 | 90..=100 => {
                let msg = ConnectionMessage::parse(&packet.payload)?;
                self.on_connection(msg).await
            }
            _ => {
                debug!(message = %message::describe(&packet.payload), "Unknown message");
                self.queue(message::unimplemented(packet.sequence)).await
            }
        }
    }

    fn peer_disconnect(&self, payload: &[u8]) -> SshError {
        let mut r = WireReader::new(&payload[1..]);
        let reason = r.read_u32().unwrap_or(0);
        let description = r
            .read_string()
            .map(|d| String::from_utf8_lossy(d).into_owned())
            .unwrap_or_default();
        logging::log_disconnect(&self.config.peer, reason, &description, false);
        SshError::Disconnected {
            reason,
            description,
        }
    }

    async fn to_auth(&mut self, packet: InboundPacket) -> Result<()> {
        let number = message::message_number(&packet.payload).unwrap_or(0);
        if let Some(auth) = &self.auth {
            if auth.send(packet.payload).is_ok() {
                return Ok(());
            }
            self.auth = None;
        }
        if number == MessageType::ExtInfo as u8 {
            return Ok(());
        }
        debug!(message = number, "Authentication message after authentication");
        self.queue(message::unimplemented(packet.sequence)).await
    }

    fn slot(&self, local: u32) -> Result<&Slot> {
        self.channels
            .get(&local)
            .ok_or_else(|| SshError::protocol(format!("Message for unknown channel {}", local)))
    }

    fn slot_mut(&mut self, local: u32) -> Result<&mut Slot> {
        self.channels
            .get_mut(&local)
            .ok_or_else(|| SshError::protocol(format!("Message for unknown channel {}", local)))
    }

    async fn on_connection(&mut self, msg: ConnectionMessage) -> Result<()> {
        match msg {
            ConnectionMessage::GlobalRequest { name, want_reply } => {
                logging::log_refused_request("global", &name);
                if want_reply {
                    self.queue(ConnectionMessage::RequestFailure.to_bytes()).await?;
                }
            }
            ConnectionMessage::RequestSuccess | ConnectionMessage::RequestFailure => {
                self.keepalive.on_reply();
            }
            ConnectionMessage::Open(open) => {
                logging::log_refused_request("channel-open", &open.channel_type);
                let refusal = ChannelOpenFailure::new(
                    open.sender_channel,
                    ChannelOpenFailureReason::AdministrativelyProhibited,
                );
                self.queue(refusal.to_bytes()).await?;
            }
            ConnectionMessage::OpenConfirmation(confirmation) => {
                self.on_open_confirmed(confirmation).await?;
            }
            ConnectionMessage::OpenFailure(failure) => {
                let reply = self
                    .pending_opens
                    .remove(&failure.recipient_channel)
                    .ok_or_else(|| {
                        SshError::protocol(format!(
                            "Open failure for channel {} we did not open",
                            failure.recipient_channel
                        ))
                    })?;
                logging::log_channel_event(failure.recipient_channel, "open-failed");
                let _ = reply.send(Err(SshError::ChannelOpenFailed {
                    reason: failure.reason_code,
                    description: failure.description,
                }));
            }
            ConnectionMessage::WindowAdjust {
                recipient,
                bytes_to_add,
            } => {
                self.slot(recipient)?.send_window.adjust(bytes_to_add)?;
            }
            ConnectionMessage::Data { recipient, data } => {
                let slot = self.slot(recipient)?;
                slot.recv_window.on_data(data.len())?;
                let _ = slot.events.send(ChannelEvent::Data(data));
            }
            ConnectionMessage::ExtendedData {
                recipient,
                code,
                data,
            } => {
                let slot = self.slot(recipient)?;
                slot.recv_window.on_data(data.len())?;
                let _ = slot.events.send(ChannelEvent::ExtendedData { code, data });
            }
            ConnectionMessage::Eof { recipient } => {
                logging::log_channel_event(recipient, "eof-received");
                let _ = self.slot(recipient)?.events.send(ChannelEvent::Eof);
            }
            ConnectionMessage::Close { recipient } => self.on_peer_close(recipient).await?,
            ConnectionMessage::Request(request) => self.on_channel_request(request).await?,
            ConnectionMessage::Success { recipient } => self.on_request_reply(recipient, true)?,
            ConnectionMessage::Failure { recipient } => self.on_request_reply(recipient, false)?,
        }
        Ok(())
    }

    async fn on_open_confirmed(&mut self, confirmation: ChannelOpenConfirmation) -> Result<()> {
        let local = confirmation.recipient_channel;
        let reply = self.pending_opens.remove(&local).ok_or_else(|| {
            SshError::protocol(format!("Confirmation for channel {} we did not open", local))
        })?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let send_window = Arc::new(SendWindow::new(confirmation.initial_window_size));
        let recv_window = Arc::new(ReceiveWindow::new(CHANNEL_WINDOW_SIZE));
        let parts = ChannelParts {
            local_id: local,
            remote_id: confirmation.sender_channel,
            max_packet: confirmation.maximum_packet_size.clamp(1, CHANNEL_MAX_PACKET),
            events: events_rx,
            send_window: send_window.clone(),
            recv_window: recv_window.clone(),
        };
        self.channels.insert(
            local,
            Slot {
                remote_id: confirmation.sender_channel,
                events: events_tx,
                send_window,
                recv_window,
                replies: VecDeque::new(),
                eof_sent: false,
                close_sent: false,
            },
        );
        logging::log_channel_event(local, "open");

        if reply.send(Ok(parts)).is_err() {
            // Nobody is waiting for the channel any more.
            self.close_channel(local).await?;
        }
        Ok(())
    }

    async fn on_peer_close(&mut self, local: u32) -> Result<()> {
        let slot = self
            .channels
            .remove(&local)
            .ok_or_else(|| SshError::protocol(format!("Close for unknown channel {}", local)))?;
        if !slot.close_sent {
            self.queue(ConnectionMessage::Close { recipient: slot.remote_id }.to_bytes())
                .await?;
        }
        slot.send_window.close(SshError::ChannelClosed);
        let _ = slot.events.send(ChannelEvent::Closed(None));
        logging::log_channel_event(local, "close");
        Ok(())
    }

    async fn on_channel_request(&mut self, request: ChannelRequest) -> Result<()> {
        let local = request.recipient_channel;
        let want_reply = request.want_reply;
        let (remote, events) = {
            let slot = self.slot(local)?;
            (slot.remote_id, slot.events.clone())
        };

        let status = match request.request_type {
            ChannelRequestType::ExitStatus { exit_status } => ExitStatus::Code(exit_status),
            ChannelRequestType::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
            } => ExitStatus::Signal {
                name: signal_name,
                core_dumped,
                message: error_message,
            },
            other => {
                logging::log_refused_request("channel", other.name());
                if want_reply {
                    self.queue(ConnectionMessage::Failure { recipient: remote }.to_bytes())
                        .await?;
                }
                return Ok(());
            }
        };

        let _ = events.send(ChannelEvent::Exit(status));
        if want_reply {
            self.queue(ConnectionMessage::Success { recipient: remote }.to_bytes())
                .await?;
        }
        Ok(())
    }

    fn on_request_reply(&mut self, local: u32, success: bool) -> Result<()> {
        match self.slot_mut(local)?.replies.pop_front() {
            Some(reply) => {
                let _ = reply.send(success);
            }
            None => warn!(channel = local, "Unsolicited channel request reply"),
        }
        Ok(())
    }

    async fn on_command(&mut self, command: Command) -> Result<Flow> {
        match command {
            Command::Open {
                channel_type,
                type_data,
                reply,
            } => {
                let local = self.next_channel_id;
                match local.checked_add(1) {
                    Some(next) => self.next_channel_id = next,
                    None => {
                        let _ = reply.send(Err(SshError::protocol("Channel numbers exhausted")));
                        return Ok(Flow::Continue);
                    }
                }
                let open = ChannelOpen {
                    channel_type,
                    sender_channel: local,
                    initial_window_size: CHANNEL_WINDOW_SIZE,
                    maximum_packet_size: CHANNEL_MAX_PACKET,
                    type_data,
                };
                logging::log_channel_event(local, "open-requested");
                self.pending_opens.insert(local, reply);
                self.queue(open.to_bytes()).await?;
            }
            Command::Data { local, code, data } => {
                let remote = match self.channels.get(&local) {
                    Some(slot) if !slot.eof_sent && !slot.close_sent => slot.remote_id,
                    _ => return Ok(Flow::Continue),
                };
                let msg = match code {
                    None => ConnectionMessage::Data {
                        recipient: remote,
                        data,
                    },
                    Some(code) => ConnectionMessage::ExtendedData {
                        recipient: remote,
                        code,
                        data,
                    },
                };
                self.queue(msg.to_bytes()).await?;
            }
            Command::Eof { local } => {
                let remote = match self.channels.get_mut(&local) {
                    Some(slot) if !slot.eof_sent && !slot.close_sent => {
                        slot.eof_sent = true;
                        slot.remote_id
                    }
                    _ => return Ok(Flow::Continue),
                };
                logging::log_channel_event(local, "eof-sent");
                self.queue(ConnectionMessage::Eof { recipient: remote }.to_bytes())
                    .await?;
            }
            Command::Close { local } => self.close_channel(local).await?,
            Command::Request {
                local,
                request,
                reply,
            } => {
                let want_reply = reply.is_some();
                let remote = match self.channels.get_mut(&local) {
                    Some(slot) if !slot.close_sent => {
                        if let Some(reply) = reply {
                            slot.replies.push_back(reply);
                        }
                        slot.remote_id
                    }
                    _ => return Ok(Flow::Continue),
                };
                debug!(channel = local, request = request.name(), "Sending channel request");
                let msg = ChannelRequest::new(remote, request, want_reply);
                self.queue(msg.to_bytes()).await?;
            }
            Command::WindowAdjust { local, bytes } => {
                let remote = match self.channels.get(&local) {
                    Some(slot) if !slot.close_sent => slot.remote_id,
                    _ => return Ok(Flow::Continue),
                };
                let msg = ConnectionMessage::WindowAdjust {
                    recipient: remote,
                    bytes_to_add: bytes,
                };
                self.queue(msg.to_bytes()).await?;
            }
            Command::Send(payload) => self.queue(payload).await?,
            Command::AuthComplete => {
                self.authenticated = true;
                self.auth = None;
            }
            Command::Rekey => self.start_rekey().await?,
            Command::Disconnect {
                reason,
                description,
                done,
            } => {
                self.disconnect(reason, &description).await;
                let _ = done.send(());
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    async fn close_channel(&mut self, local: u32) -> Result<()> {
        let remote = match self.channels.get_mut(&local) {
            Some(slot) if !slot.close_sent => {
                slot.close_sent = true;
                slot.send_window.close(SshError::ChannelClosed);
                slot.remote_id
            }
            _ => return Ok(()),
        };
        logging::log_channel_event(local, "close-sent");
        self.queue(ConnectionMessage::Close { recipient: remote }.to_bytes())
            .await
    }

    async fn on_keepalive(&mut self) -> Result<()> {
        if !self.authenticated || self.kex.in_progress() {
            return Ok(());
        }
        match self.keepalive.on_tick() {
            KeepaliveAction::Probe => {
                debug!(
                    outstanding = self.keepalive.outstanding(),
                    "Sending keepalive probe"
                );
                let probe = ConnectionMessage::GlobalRequest {
                    name: KEEPALIVE_REQUEST.to_string(),
                    want_reply: true,
                };
                self.queue(probe.to_bytes()).await
            }
            KeepaliveAction::Expired => Err(SshError::Timeout {
                stage: "keepalive",
                after: self.keepalive.deadline(),
            }),
        }
    }

    /// Orderly local shutdown.
    async fn disconnect(&mut self, reason: DisconnectReason, description: &str) {
        logging::log_disconnect(&self.config.peer, reason as u32, description, true);
        let payload = message::disconnect(reason, description);
        match tokio::time::timeout(DISCONNECT_GRACE, self.send_now(payload)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(error = %err, "Could not send disconnect"),
            Err(_) => debug!("Timed out sending disconnect"),
        }
        self.writer.shutdown().await;
        self.close_all(None);
    }

    /// Terminal failure: every channel and waiter learns the cause.
    async fn fail(&mut self, err: SshError) {
        logging::log_transport_failed(&self.config.peer, &err.to_string());
        self.shared.fail(err.clone());
        if let Some(reason) = disconnect_reason(&err) {
            let payload = message::disconnect(reason, &err.to_string());
            let _ = tokio::time::timeout(DISCONNECT_GRACE, self.writer.send(payload)).await;
        }
        self.writer.shutdown().await;
        self.close_all(Some(err));
    }

    fn close_all(&mut self, cause: Option<SshError>) {
        let err = cause.clone().unwrap_or(SshError::ChannelClosed);
        for (local, slot) in self.channels.drain() {
            slot.send_window.close(err.clone());
            let _ = slot.events.send(ChannelEvent::Closed(cause.clone()));
            logging::log_channel_event(local, "close");
        }
        for (_, reply) in self.pending_opens.drain() {
            let _ = reply.send(Err(err.clone()));
        }
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Err(err));
        }
        self.auth = None;
    }
}

/// Reason code to send when the transport fails with `err`, if the peer is
/// still worth telling.
fn disconnect_reason(err: &SshError) -> Option<DisconnectReason> {
    match err {
        SshError::Protocol(_) => Some(DisconnectReason::ProtocolError),
        SshError::NoCommonAlgorithm { .. } => Some(DisconnectReason::KeyExchangeFailed),
        SshError::HostKeyRejected { .. } => Some(DisconnectReason::HostKeyNotVerifiable),
        SshError::Timeout { .. } => Some(DisconnectReason::ConnectionLost),
        _ => None,
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
