//! SSH channels (RFC 4254 Section 5).
//!
//! A [`Channel`] is the application's end of one logical stream on the
//! connection. The connection driver owns the wire; channels talk to it
//! through commands and receive [`ChannelEvent`]s back. Flow control is
//! split between the two sides:
//!
//! - [`SendWindow`] holds the bytes the peer still lets us send. Writers
//!   reserve from it and suspend while it is empty; the driver credits it on
//!   SSH_MSG_CHANNEL_WINDOW_ADJUST.
//! - [`ReceiveWindow`] holds the bytes we still accept. The driver debits it
//!   for every data message; the channel credits it back as the application
//!   consumes data, so unread data never exceeds the advertised window.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, oneshot, Notify};

use crate::ssh::connection::ChannelRequestType;
use crate::ssh::error::{Result, SshError};
use crate::ssh::logging;
use crate::ssh::mux::Command;

/// Channel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Open in both directions
    Open,
    /// We sent EOF; the peer may still send
    EofSent,
    /// We sent CLOSE and wait for the peer's
    Closing,
    /// Both sides closed, or the transport failed
    Closed,
}

/// How a remote command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ExitStatus {
    /// `exit-status` with this code
    Code(u32),
    /// `exit-signal`
    Signal {
        /// Signal name without the `SIG` prefix
        name: String,
        /// Whether a core was dumped
        core_dumped: bool,
        /// Error message sent by the server
        message: String,
    },
    /// The channel closed without reporting either
    Indeterminate,
}

impl ExitStatus {
    /// Returns `true` for exit code 0.
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Code(0))
    }

    /// Exit code, if the command exited normally.
    pub fn code(&self) -> Option<u32> {
        match self {
            ExitStatus::Code(code) => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Code(code) => write!(f, "exit code {}", code),
            ExitStatus::Signal {
                name, core_dumped, ..
            } => {
                write!(f, "killed by signal {}", name)?;
                if *core_dumped {
                    write!(f, " (core dumped)")?;
                }
                Ok(())
            }
            ExitStatus::Indeterminate => write!(f, "exit status unknown"),
        }
    }
}

/// What the driver delivers to a channel.
#[derive(Debug)]
pub(crate) enum ChannelEvent {
    Data(Vec<u8>),
    ExtendedData { code: u32, data: Vec<u8> },
    Eof,
    Exit(ExitStatus),
    Closed(Option<SshError>),
}

/// Result of [`Channel::read`].
#[derive(Debug, Clone)]
pub enum ChannelMsg {
    /// Bytes on the main stream (stdout)
    Data(Vec<u8>),
    /// Bytes on an extended stream (code 1 is stderr)
    ExtendedData {
        /// Data type code
        code: u32,
        /// Payload bytes
        data: Vec<u8>,
    },
    /// The peer will send no more data
    Eof,
    /// The channel is closed; `Some` carries the transport failure that
    /// closed it
    Closed(Option<SshError>),
}

/// Why [`Channel::try_write`] wrote nothing.
#[derive(Debug, Clone)]
pub enum TryWriteError {
    /// The send window is empty; retry after the peer adjusts it.
    WouldBlock,
    /// The channel is closed or the transport failed.
    Closed(SshError),
}

impl fmt::Display for TryWriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TryWriteError::WouldBlock => write!(f, "send window exhausted"),
            TryWriteError::Closed(cause) => write!(f, "{}", cause),
        }
    }
}

impl std::error::Error for TryWriteError {}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct SendState {
    available: u32,
    closed: Option<SshError>,
}

/// Bytes the peer currently lets us send on one channel.
///
/// The window never goes negative: a reservation takes at most what is
/// available, and only WINDOW_ADJUST adds to it.
pub struct SendWindow {
    state: Mutex<SendState>,
    notify: Notify,
}

impl SendWindow {
    /// Creates a window with the peer's initial size.
    pub fn new(initial: u32) -> Self {
        Self {
            state: Mutex::new(SendState {
                available: initial,
                closed: None,
            }),
            notify: Notify::new(),
        }
    }

    /// Bytes that may be sent right now.
    pub fn available(&self) -> u32 {
        lock(&self.state).available
    }

    /// Takes up to `want` bytes without waiting. `Ok(0)` means the window is
    /// empty.
    pub fn try_reserve(&self, want: u32) -> Result<u32> {
        let mut state = lock(&self.state);
        if let Some(cause) = &state.closed {
            return Err(cause.clone());
        }
        let granted = want.min(state.available);
        state.available -= granted;
        Ok(granted)
    }

    /// Takes between 1 and `want` bytes, waiting while the window is empty.
    pub async fn reserve(&self, want: u32) -> Result<u32> {
        loop {
            let notified = self.notify.notified();
            let granted = self.try_reserve(want)?;
            if granted > 0 || want == 0 {
                return Ok(granted);
            }
            notified.await;
        }
    }

    /// Credits the window after SSH_MSG_CHANNEL_WINDOW_ADJUST.
    ///
    /// A window pushed past 2^32 - 1 is a protocol error (RFC 4254
    /// Section 5.2).
    pub fn adjust(&self, bytes: u32) -> Result<()> {
        {
            let mut state = lock(&self.state);
            state.available = state
                .available
                .checked_add(bytes)
                .ok_or_else(|| SshError::protocol("Window adjust overflows the send window"))?;
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Fails every current and future reservation with `cause`.
    pub fn close(&self, cause: SshError) {
        {
            let mut state = lock(&self.state);
            if state.closed.is_none() {
                state.closed = Some(cause);
            }
        }
        self.notify.notify_waiters();
    }

    /// Returns `true` once [`SendWindow::close`] was called.
    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed.is_some()
    }
}

impl fmt::Debug for SendWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("SendWindow")
            .field("available", &state.available)
            .field("closed", &state.closed.is_some())
            .finish()
    }
}

struct ReceiveState {
    window: u32,
    unacknowledged: u32,
}

/// Bytes we still accept from the peer on one channel.
pub struct ReceiveWindow {
    initial: u32,
    state: Mutex<ReceiveState>,
}

impl ReceiveWindow {
    /// Creates a window of `initial` bytes, as advertised in our CHANNEL_OPEN.
    pub fn new(initial: u32) -> Self {
        Self {
            initial,
            state: Mutex::new(ReceiveState {
                window: initial,
                unacknowledged: 0,
            }),
        }
    }

    /// Bytes the peer may still send.
    pub fn remaining(&self) -> u32 {
        lock(&self.state).window
    }

    /// Debits `len` bytes of received data.
    pub fn on_data(&self, len: usize) -> Result<()> {
        let mut state = lock(&self.state);
        match u32::try_from(len) {
            Ok(len) if len <= state.window => {
                state.window -= len;
                Ok(())
            }
            _ => Err(SshError::protocol(format!(
                "Peer sent {} bytes with only {} left in the receive window",
                len, state.window
            ))),
        }
    }

    /// Records that the application consumed `len` bytes. Returns the
    /// amount to announce in a WINDOW_ADJUST once half the window has been
    /// consumed.
    pub fn consume(&self, len: usize) -> Option<u32> {
        let mut state = lock(&self.state);
        let len = u32::try_from(len).unwrap_or(u32::MAX);
        state.unacknowledged = state.unacknowledged.saturating_add(len);
        if state.unacknowledged < self.initial / 2 {
            return None;
        }
        let adjust = state.unacknowledged;
        state.unacknowledged = 0;
        state.window = state.window.saturating_add(adjust);
        Some(adjust)
    }
}

impl fmt::Debug for ReceiveWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiveWindow")
            .field("initial", &self.initial)
            .field("remaining", &self.remaining())
            .finish()
    }
}

/// Everything the driver hands over when the peer confirms an open.
#[derive(Debug)]
pub(crate) struct ChannelParts {
    pub local_id: u32,
    pub remote_id: u32,
    pub max_packet: u32,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
    pub send_window: Arc<SendWindow>,
    pub recv_window: Arc<ReceiveWindow>,
}

/// Sending side of a channel; clones can write concurrently with reads.
#[derive(Clone)]
pub struct ChannelWriter {
    local_id: u32,
    max_packet: u32,
    window: Arc<SendWindow>,
    commands: mpsc::UnboundedSender<Command>,
    eof_sent: Arc<AtomicBool>,
}

impl ChannelWriter {
    /// Local channel number.
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    fn submit(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| SshError::ChannelClosed)
    }

    fn check_open(&self) -> std::result::Result<(), SshError> {
        if self.eof_sent.load(Ordering::Acquire) {
            return Err(SshError::ChannelClosed);
        }
        Ok(())
    }

    fn send_chunk(&self, code: Option<u32>, chunk: &[u8]) -> Result<()> {
        self.submit(Command::Data {
            local: self.local_id,
            code,
            data: chunk.to_vec(),
        })
    }

    /// Writes as much of `data` as the send window allows right now, up to
    /// one maximum-size packet.
    pub fn try_write(&self, data: &[u8]) -> std::result::Result<usize, TryWriteError> {
        self.check_open().map_err(TryWriteError::Closed)?;
        if data.is_empty() {
            return Ok(0);
        }
        let want = self.chunk_len(data.len());
        let granted = self
            .window
            .try_reserve(want)
            .map_err(TryWriteError::Closed)?;
        if granted == 0 {
            return Err(TryWriteError::WouldBlock);
        }
        let granted = granted as usize;
        self.send_chunk(None, &data[..granted])
            .map_err(TryWriteError::Closed)?;
        Ok(granted)
    }

    /// Writes all of `data`, suspending while the send window is empty.
    /// Data is split into messages no larger than the peer's maximum packet.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        self.write_stream(None, data).await
    }

    /// Writes all of `data` as extended data of type `code`.
    pub async fn write_extended(&self, code: u32, data: &[u8]) -> Result<usize> {
        self.write_stream(Some(code), data).await
    }

    async fn write_stream(&self, code: Option<u32>, data: &[u8]) -> Result<usize> {
        self.check_open()?;
        let mut offset = 0;
        while offset < data.len() {
            let want = self.chunk_len(data.len() - offset);
            let granted = self.window.reserve(want).await? as usize;
            self.send_chunk(code, &data[offset..offset + granted])?;
            offset += granted;
        }
        Ok(data.len())
    }

    fn chunk_len(&self, remaining: usize) -> u32 {
        u32::try_from(remaining)
            .unwrap_or(u32::MAX)
            .min(self.max_packet)
    }

    /// Sends SSH_MSG_CHANNEL_EOF; later writes fail with
    /// [`SshError::ChannelClosed`].
    pub fn send_eof(&self) -> Result<()> {
        if self.eof_sent.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.submit(Command::Eof {
            local: self.local_id,
        })
    }
}

impl fmt::Debug for ChannelWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelWriter")
            .field("local_id", &self.local_id)
            .field("max_packet", &self.max_packet)
            .field("window", &self.window)
            .finish()
    }
}

/// One open SSH channel.
pub struct Channel {
    local_id: u32,
    remote_id: u32,
    state: ChannelState,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    writer: ChannelWriter,
    recv_window: Arc<ReceiveWindow>,
    exit_status: Option<ExitStatus>,
    close_cause: Option<SshError>,
}

impl Channel {
    pub(crate) fn new(parts: ChannelParts, commands: mpsc::UnboundedSender<Command>) -> Self {
        let writer = ChannelWriter {
            local_id: parts.local_id,
            max_packet: parts.max_packet,
            window: parts.send_window,
            commands,
            eof_sent: Arc::new(AtomicBool::new(false)),
        };
        Self {
            local_id: parts.local_id,
            remote_id: parts.remote_id,
            state: ChannelState::Open,
            events: parts.events,
            writer,
            recv_window: parts.recv_window,
            exit_status: None,
            close_cause: None,
        }
    }

    /// Our channel number.
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// The peer's channel number.
    pub fn remote_id(&self) -> u32 {
        self.remote_id
    }

    /// Current state.
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Exit status reported by the server, if any arrived yet.
    pub fn exit_status(&self) -> Option<&ExitStatus> {
        self.exit_status.as_ref()
    }

    /// Returns a writer that can be moved to another task.
    pub fn writer(&self) -> ChannelWriter {
        self.writer.clone()
    }

    /// See [`ChannelWriter::try_write`].
    pub fn try_write(&self, data: &[u8]) -> std::result::Result<usize, TryWriteError> {
        self.writer.try_write(data)
    }

    /// See [`ChannelWriter::write`].
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        self.writer.write(data).await
    }

    /// Waits for the next message from the peer.
    ///
    /// Exit status and exit signal requests are recorded (see
    /// [`Channel::exit_status`]) rather than returned. Once the channel is
    /// closed every call returns [`ChannelMsg::Closed`].
    pub async fn read(&mut self) -> ChannelMsg {
        loop {
            if self.state == ChannelState::Closed {
                return ChannelMsg::Closed(self.close_cause.clone());
            }
            let event = match self.events.recv().await {
                Some(event) => event,
                None => ChannelEvent::Closed(Some(SshError::ChannelClosed)),
            };
            match event {
                ChannelEvent::Data(data) => {
                    self.consumed(data.len());
                    return ChannelMsg::Data(data);
                }
                ChannelEvent::ExtendedData { code, data } => {
                    self.consumed(data.len());
                    return ChannelMsg::ExtendedData { code, data };
                }
                ChannelEvent::Eof => return ChannelMsg::Eof,
                ChannelEvent::Exit(status) => {
                    logging::log_exit_status(self.local_id, &status.to_string());
                    self.exit_status = Some(status);
                }
                ChannelEvent::Closed(cause) => {
                    self.state = ChannelState::Closed;
                    self.close_cause = cause;
                }
            }
        }
    }

    fn consumed(&self, len: usize) {
        if let Some(bytes) = self.recv_window.consume(len) {
            // A dead driver surfaces through the next read.
            let _ = self.writer.submit(Command::WindowAdjust {
                local: self.local_id,
                bytes,
            });
        }
    }

    async fn request(&self, request_type: ChannelRequestType) -> Result<()> {
        if self.state == ChannelState::Closed || self.state == ChannelState::Closing {
            return Err(SshError::ChannelClosed);
        }
        let name = request_type.name().to_string();
        let (reply, answer) = oneshot::channel();
        self.writer.submit(Command::Request {
            local: self.local_id,
            request: request_type,
            reply: Some(reply),
        })?;
        match answer.await {
            Ok(true) => Ok(()),
            Ok(false) => Err(SshError::RequestFailed { request: name }),
            Err(_) => Err(SshError::ChannelClosed),
        }
    }

    /// Requests a pseudo-terminal of `cols` x `rows` characters.
    pub async fn request_pty(&self, term: &str, cols: u32, rows: u32) -> Result<()> {
        self.request(ChannelRequestType::PtyReq {
            term: term.to_string(),
            width_chars: cols,
            height_rows: rows,
            width_pixels: 0,
            height_pixels: 0,
            modes: vec![0],
        })
        .await
    }

    /// Starts the user's login shell.
    pub async fn request_shell(&self) -> Result<()> {
        self.request(ChannelRequestType::Shell).await
    }

    /// Runs `command` on the server.
    pub async fn exec(&self, command: &str) -> Result<()> {
        self.request(ChannelRequestType::Exec {
            command: command.to_string(),
        })
        .await
    }

    /// Tells the server the terminal was resized. No reply is expected.
    pub fn window_change(&self, cols: u32, rows: u32) -> Result<()> {
        self.writer.submit(Command::Request {
            local: self.local_id,
            request: ChannelRequestType::WindowChange {
                width_chars: cols,
                height_rows: rows,
                width_pixels: 0,
                height_pixels: 0,
            },
            reply: None,
        })
    }

    /// Sends EOF on our direction.
    pub fn send_eof(&mut self) -> Result<()> {
        self.writer.send_eof()?;
        if self.state == ChannelState::Open {
            self.state = ChannelState::EofSent;
        }
        Ok(())
    }

    /// Sends SSH_MSG_CHANNEL_CLOSE. Reads keep draining until the peer's
    /// close arrives.
    pub fn close(&mut self) -> Result<()> {
        match self.state {
            ChannelState::Closing | ChannelState::Closed => Ok(()),
            _ => {
                self.state = ChannelState::Closing;
                self.writer.submit(Command::Close {
                    local: self.local_id,
                })
            }
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("local_id", &self.local_id)
            .field("remote_id", &self.remote_id)
            .field("state", &self.state)
            .field("exit_status", &self.exit_status)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    fn test_channel(window: u32, max_packet: u32) -> (
        Channel,
        mpsc::UnboundedSender<ChannelEvent>,
        mpsc::UnboundedReceiver<Command>,
        Arc<SendWindow>,
    ) {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let send_window = Arc::new(SendWindow::new(window));
        let parts = ChannelParts {
            local_id: 0,
            remote_id: 7,
            max_packet,
            events,
            send_window: send_window.clone(),
            recv_window: Arc::new(ReceiveWindow::new(64)),
        };
        (Channel::new(parts, commands), events_tx, commands_rx, send_window)
    }

    fn data_len(command: Command) -> usize {
        match command {
            Command::Data { data, .. } => data.len(),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_try_write_would_block_on_empty_window() {
        let (channel, _events, mut commands, window) = test_channel(4, 1024);
        assert_eq!(channel.try_write(b"hello").unwrap(), 4);
        assert_eq!(data_len(commands.try_recv().unwrap()), 4);
        assert!(matches!(
            channel.try_write(b"o"),
            Err(TryWriteError::WouldBlock)
        ));

        window.adjust(10).unwrap();
        assert_eq!(channel.try_write(b"o").unwrap(), 1);
    }

    #[test]
    fn test_try_write_after_close_reports_cause() {
        let (channel, _events, _commands, window) = test_channel(100, 1024);
        window.close(SshError::protocol("bad MAC"));
        match channel.try_write(b"x") {
            Err(TryWriteError::Closed(SshError::Protocol(msg))) => assert_eq!(msg, "bad MAC"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_write_splits_at_max_packet() {
        let (channel, _events, mut commands, _window) = test_channel(10_000, 16);
        assert_eq!(channel.write(&[7u8; 40]).await.unwrap(), 40);
        let sizes: Vec<usize> = (0..3).map(|_| data_len(commands.try_recv().unwrap())).collect();
        assert_eq!(sizes, vec![16, 16, 8]);
        assert!(commands.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_write_waits_for_window_adjust() {
        let (channel, _events, mut commands, window) = test_channel(0, 1024);
        let writer = channel.writer();
        let task = tokio::spawn(async move { writer.write(b"abc").await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());
        assert!(commands.try_recv().is_err());

        window.adjust(2).unwrap();
        window.adjust(5).unwrap();
        assert_eq!(task.await.unwrap().unwrap(), 3);

        let mut total = 0;
        while let Ok(command) = commands.try_recv() {
            total += data_len(command);
        }
        assert_eq!(total, 3);
    }

    #[tokio::test]
    async fn test_blocked_writer_sees_transport_failure() {
        let (channel, _events, _commands, window) = test_channel(0, 1024);
        let writer = channel.writer();
        let task = tokio::spawn(async move { writer.write(b"abc").await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        window.close(SshError::Disconnected {
            reason: 11,
            description: "bye".into(),
        });
        assert!(matches!(
            task.await.unwrap(),
            Err(SshError::Disconnected { reason: 11, .. })
        ));
    }

    #[tokio::test]
    async fn test_read_records_exit_status_and_close() {
        let (mut channel, events, _commands, _window) = test_channel(100, 1024);
        events.send(ChannelEvent::Data(b"hi\n".to_vec())).unwrap();
        events.send(ChannelEvent::Eof).unwrap();
        events.send(ChannelEvent::Exit(ExitStatus::Code(3))).unwrap();
        events.send(ChannelEvent::Closed(None)).unwrap();

        assert!(matches!(channel.read().await, ChannelMsg::Data(ref d) if d == b"hi\n"));
        assert!(matches!(channel.read().await, ChannelMsg::Eof));
        assert!(matches!(channel.read().await, ChannelMsg::Closed(None)));
        assert_eq!(channel.exit_status(), Some(&ExitStatus::Code(3)));
        assert_eq!(channel.state(), ChannelState::Closed);
        // Closed is sticky.
        assert!(matches!(channel.read().await, ChannelMsg::Closed(None)));
    }

    #[tokio::test]
    async fn test_read_adjusts_window_after_half_consumed() {
        let (mut channel, events, mut commands, _window) = test_channel(100, 1024);
        events.send(ChannelEvent::Data(vec![0; 20])).unwrap();
        events.send(ChannelEvent::Data(vec![0; 20])).unwrap();

        channel.read().await;
        assert!(commands.try_recv().is_err());
        channel.read().await;
        match commands.try_recv().unwrap() {
            Command::WindowAdjust { local, bytes } => {
                assert_eq!(local, 0);
                assert_eq!(bytes, 40);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_writes_fail_after_eof() {
        let (mut channel, _events, mut commands, _window) = test_channel(100, 1024);
        channel.send_eof().unwrap();
        assert!(matches!(commands.try_recv().unwrap(), Command::Eof { local: 0 }));
        assert!(matches!(channel.write(b"x").await, Err(SshError::ChannelClosed)));
        assert_eq!(channel.state(), ChannelState::EofSent);
    }

    #[tokio::test]
    async fn test_request_failure_is_reported() {
        let (channel, _events, mut commands, _window) = test_channel(100, 1024);
        let server = tokio::spawn(async move {
            match commands.recv().await {
                Some(Command::Request { request, reply, .. }) => {
                    assert_eq!(request.name(), "pty-req");
                    reply.unwrap().send(false).unwrap();
                }
                other => panic!("unexpected {:?}", other),
            }
        });
        let err = channel.request_pty("xterm", 80, 24).await.unwrap_err();
        assert!(matches!(err, SshError::RequestFailed { ref request } if request == "pty-req"));
        assert!(!err.is_fatal());
        server.await.unwrap();
    }

    #[test]
    fn test_receive_window_rejects_overrun() {
        let window = ReceiveWindow::new(10);
        window.on_data(6).unwrap();
        assert!(window.on_data(5).is_err());
        assert_eq!(window.consume(6), Some(6));
        window.on_data(10).unwrap();
    }

    #[test]
    fn test_adjust_overflow_is_protocol_error() {
        let window = SendWindow::new(u32::MAX - 1);
        assert!(window.adjust(2).is_err());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Write(u32),
        Adjust(u32),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u32..5000).prop_map(Op::Write),
            (0u32..3000).prop_map(Op::Adjust),
        ]
    }

    proptest! {
        #[test]
        fn prop_send_window_never_overdrawn(initial in 0u32..10_000, ops in proptest::collection::vec(op(), 0..64)) {
            let window = SendWindow::new(initial);
            let mut credited = initial as u64;
            let mut sent = 0u64;
            for op in ops {
                match op {
                    Op::Write(want) => {
                        let before = window.available();
                        let granted = window.try_reserve(want).unwrap();
                        prop_assert!(granted <= want);
                        prop_assert!(granted <= before);
                        prop_assert!(want == 0 || before == 0 || granted > 0);
                        sent += granted as u64;
                    }
                    Op::Adjust(bytes) => {
                        window.adjust(bytes).unwrap();
                        credited += bytes as u64;
                    }
                }
                prop_assert!(sent <= credited);
                prop_assert_eq!(window.available() as u64, credited - sent);
            }
        }
    }
}
