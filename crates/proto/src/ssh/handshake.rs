//! Client key exchange state machine.
//!
//! [`KeyExchange`] is message driven: the connection driver feeds it every
//! key exchange packet and carries out the [`KexAction`]s it returns. The
//! same machine runs the initial exchange and every rekey, so there is only
//! ever one exchange in progress per transport. A KEXINIT from the server
//! while ours is outstanding joins that exchange instead of starting a
//! second one.
//!
//! ```text
//! Idle --start()--> Sent --KEXINIT--> Exchanging --REPLY--> AwaitNewKeys --NEWKEYS--> Idle
//!   \_____________________KEXINIT (peer initiated)___/
//! ```

use std::sync::Arc;

use tracing::debug;

use crate::ssh::crypto::{PacketOpener, PacketSealer};
use crate::ssh::error::{Result, SshError};
use crate::ssh::hostkey::{blob_key_type, fingerprint, verify_signature};
use crate::ssh::kex::{negotiate, AlgorithmPreferences, KexInit, Negotiated, NewKeys};
use crate::ssh::kex_dh::{ExchangeHash, KexMethod, KexReply, Role, SessionKeys};
use crate::ssh::logging;
use crate::ssh::message::MessageType;
use crate::ssh::transport::{InboundPacket, State, StateTracker};
use crate::ssh::trust::{verify_host_key, HostKeyChecking, HostKeyStore};

/// Everything a key exchange needs to know about the connection.
#[derive(Clone)]
pub struct KexParams {
    /// Host name the user asked for (known-hosts lookups use it verbatim)
    pub host: String,
    /// Remote port
    pub port: u16,
    /// Host key policy for the initial exchange
    pub policy: HostKeyChecking,
    /// Where trusted host keys live
    pub store: Arc<dyn HostKeyStore>,
    /// Our algorithm preferences
    pub preferences: AlgorithmPreferences,
    /// Our identification line, without CR LF
    pub client_version: String,
    /// The server's identification line, without CR LF
    pub server_version: String,
}

impl std::fmt::Debug for KexParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KexParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("policy", &self.policy)
            .field("client_version", &self.client_version)
            .field("server_version", &self.server_version)
            .finish_non_exhaustive()
    }
}

/// Work the driver has to do on behalf of the key exchange.
#[derive(Debug)]
pub enum KexAction {
    /// Send this payload as is.
    Send(Vec<u8>),
    /// Send SSH_MSG_NEWKEYS, then switch the outbound direction to `sealer`.
    SendNewKeys {
        /// Protection for every packet after our NEWKEYS
        sealer: PacketSealer,
        /// Restart the send sequence at zero (strict kex)
        reset_sequence: bool,
    },
    /// Switch the inbound direction to `opener` right after the peer's NEWKEYS.
    InstallInbound {
        /// Protection for every packet after the peer's NEWKEYS
        opener: PacketOpener,
        /// Restart the receive sequence at zero (strict kex)
        reset_sequence: bool,
    },
    /// Both directions are on the new keys.
    Complete(KexOutcome),
}

/// Summary of a finished exchange.
#[derive(Debug, Clone)]
pub struct KexOutcome {
    /// Algorithms in effect
    pub negotiated: Negotiated,
    /// `false` for the initial exchange
    pub rekey: bool,
}

enum Phase {
    Idle,
    Sent {
        ours: KexInit,
        ours_bytes: Vec<u8>,
    },
    Exchanging {
        negotiated: Negotiated,
        method: KexMethod,
        ours_bytes: Vec<u8>,
        theirs_bytes: Vec<u8>,
        skip_guess: bool,
    },
    AwaitNewKeys {
        negotiated: Negotiated,
    },
}

/// Client side of SSH key exchange, for the whole life of a transport.
pub struct KeyExchange {
    params: KexParams,
    state: StateTracker,
    phase: Phase,
    session_id: Option<Vec<u8>>,
    host_key: Option<Vec<u8>>,
    strict: bool,
    completed: u32,
}

impl KeyExchange {
    /// Creates the machine; nothing is sent until [`KeyExchange::start`] or
    /// the server's KEXINIT arrives.
    pub fn new(params: KexParams) -> Self {
        Self {
            params,
            state: StateTracker::new(),
            phase: Phase::Idle,
            session_id: None,
            host_key: None,
            strict: false,
            completed: 0,
        }
    }

    /// Returns `true` while an exchange is running.
    pub fn in_progress(&self) -> bool {
        !matches!(self.phase, Phase::Idle)
    }

    /// Returns `true` until the first exchange has completed.
    pub fn is_initial(&self) -> bool {
        self.completed == 0
    }

    /// Session identifier, fixed by the first exchange.
    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    /// Host key blob presented in the first exchange.
    pub fn host_key(&self) -> Option<&[u8]> {
        self.host_key.as_deref()
    }

    /// Whether strict key exchange is in effect.
    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Current transport state.
    pub fn state(&self) -> State {
        self.state.current()
    }

    /// Sends our KEXINIT unless an exchange is already running.
    pub fn start(&mut self) -> Result<Vec<KexAction>> {
        if self.in_progress() {
            return Ok(Vec::new());
        }
        if !self.is_initial() {
            logging::log_rekey_start("client");
        }
        self.state.transition(State::KexInit)?;
        let ours = KexInit::client(&self.params.preferences, self.is_initial());
        let ours_bytes = ours.to_bytes();
        let send = KexAction::Send(ours_bytes.clone());
        self.phase = Phase::Sent { ours, ours_bytes };
        Ok(vec![send])
    }

    /// Rejects messages the transport must not carry at this point.
    ///
    /// During the initial exchange only transport messages may arrive, and
    /// once strict kex is agreed only key exchange messages may.
    pub fn check_inbound(&self, msg: u8) -> Result<()> {
        if !self.is_initial() {
            return Ok(());
        }
        if !MessageType::is_transport(msg) {
            return Err(SshError::protocol(format!(
                "Message {} received before key exchange completed",
                msg
            )));
        }
        let agreed_strict = matches!(
            &self.phase,
            Phase::Exchanging { negotiated, .. } | Phase::AwaitNewKeys { negotiated } if negotiated.strict
        );
        if agreed_strict && !MessageType::is_kex(msg) {
            return Err(SshError::protocol(format!(
                "Message {} not allowed during strict key exchange",
                msg
            )));
        }
        Ok(())
    }

    /// Feeds one key exchange packet (message numbers 20 to 49).
    pub fn handle(&mut self, packet: &InboundPacket) -> Result<Vec<KexAction>> {
        let msg = packet.payload.first().copied().unwrap_or(0);
        match MessageType::from_u8(msg) {
            Some(MessageType::KexInit) => self.on_kexinit(packet),
            Some(MessageType::KexdhReply) if self.skipping_guess() => self.skip_guess(msg),
            Some(MessageType::KexdhReply) => self.on_reply(&packet.payload),
            Some(MessageType::NewKeys) => self.on_newkeys(&packet.payload),
            _ if self.skipping_guess() => self.skip_guess(msg),
            _ => Err(SshError::protocol(format!(
                "Unexpected key exchange message {}",
                msg
            ))),
        }
    }

    fn skipping_guess(&self) -> bool {
        matches!(self.phase, Phase::Exchanging { skip_guess: true, .. })
    }

    fn skip_guess(&mut self, msg: u8) -> Result<Vec<KexAction>> {
        debug!(message = msg, "Discarding server's wrongly guessed kex packet");
        if let Phase::Exchanging { skip_guess, .. } = &mut self.phase {
            *skip_guess = false;
        }
        Ok(Vec::new())
    }

    fn on_kexinit(&mut self, packet: &InboundPacket) -> Result<Vec<KexAction>> {
        let theirs = KexInit::from_bytes(&packet.payload)?;
        let mut actions = Vec::new();

        let (ours, ours_bytes) = match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Idle => {
                if !self.is_initial() {
                    logging::log_rekey_start("server");
                }
                self.state.transition(State::KexInit)?;
                let ours = KexInit::client(&self.params.preferences, self.is_initial());
                let ours_bytes = ours.to_bytes();
                actions.push(KexAction::Send(ours_bytes.clone()));
                (ours, ours_bytes)
            }
            Phase::Sent { ours, ours_bytes } => (ours, ours_bytes),
            _ => return Err(SshError::protocol("KEXINIT received during key exchange")),
        };

        let negotiated = negotiate(&ours, &theirs)?;
        if self.is_initial() {
            if negotiated.strict && packet.sequence != 0 {
                return Err(SshError::protocol(
                    "Strict key exchange: KEXINIT was not the first packet",
                ));
            }
            self.strict = negotiated.strict;
        }
        logging::log_negotiated(
            &negotiated.kex,
            &negotiated.host_key,
            negotiated.cipher_client_to_server.name(),
            negotiated.cipher_server_to_client.name(),
            negotiated.mac_client_to_server.map_or("<implicit>", |m| m.name()),
        );

        let method = KexMethod::start(&negotiated.kex)?;
        actions.push(KexAction::Send(method.init_message()));
        self.state.transition(State::KeyExchange)?;

        let skip_guess = theirs.first_kex_packet_follows() && !theirs.guess_matches(&ours);
        self.phase = Phase::Exchanging {
            negotiated,
            method,
            ours_bytes,
            theirs_bytes: packet.payload.clone(),
            skip_guess,
        };
        Ok(actions)
    }

    fn on_reply(&mut self, payload: &[u8]) -> Result<Vec<KexAction>> {
        let (negotiated, method, ours_bytes, theirs_bytes) =
            match std::mem::replace(&mut self.phase, Phase::Idle) {
                Phase::Exchanging {
                    negotiated,
                    method,
                    ours_bytes,
                    theirs_bytes,
                    ..
                } => (negotiated, method, ours_bytes, theirs_bytes),
                _ => return Err(SshError::protocol("Unexpected key exchange reply")),
            };

        let mpint = method.uses_mpint();
        let reply = KexReply::parse(payload, mpint)?;

        let client_public = method.public_value();
        let shared_secret = zeroize::Zeroizing::new(method.agree(&reply.server_public)?);
        let hash = ExchangeHash::new(
            &self.params.client_version,
            &self.params.server_version,
            &ours_bytes,
            &theirs_bytes,
            &reply.host_key,
        )
        .finish(&client_public, &reply.server_public, &shared_secret, mpint);

        verify_signature(&negotiated.host_key, &reply.host_key, &hash, &reply.signature)
            .map_err(|e| self.rejected(&reply.host_key, &e.to_string()))?;
        // Only a key that has proven possession may reach the store.
        self.check_host_key(&reply.host_key)?;

        if self.host_key.is_none() {
            self.host_key = Some(reply.host_key.clone());
        }
        let session_id = self.session_id.get_or_insert_with(|| hash.clone()).clone();

        let keys = SessionKeys::derive(&shared_secret, &hash, &session_id, &negotiated);
        let (outbound, inbound) = keys.split(Role::Client);
        let sealer = PacketSealer::new(&outbound)?;
        let opener = PacketOpener::new(&inbound)?;

        self.state.transition(State::NewKeys)?;
        self.phase = Phase::AwaitNewKeys { negotiated };
        Ok(vec![
            KexAction::InstallInbound {
                opener,
                reset_sequence: self.strict,
            },
            KexAction::SendNewKeys {
                sealer,
                reset_sequence: self.strict,
            },
        ])
    }

    fn on_newkeys(&mut self, payload: &[u8]) -> Result<Vec<KexAction>> {
        NewKeys::from_bytes(payload)?;
        let negotiated = match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::AwaitNewKeys { negotiated } => negotiated,
            _ => return Err(SshError::protocol("NEWKEYS received out of order")),
        };
        self.state.transition(State::Encrypted)?;
        let rekey = !self.is_initial();
        self.completed += 1;
        logging::log_kex_complete(&negotiated.kex, rekey, self.strict);
        Ok(vec![KexAction::Complete(KexOutcome { negotiated, rekey })])
    }

    fn check_host_key(&self, key_blob: &[u8]) -> Result<()> {
        match &self.host_key {
            Some(first) if first.as_slice() != key_blob => {
                Err(self.rejected(key_blob, "host key changed during key re-exchange"))
            }
            Some(_) => Ok(()),
            None => verify_host_key(
                self.params.store.as_ref(),
                self.params.policy,
                &self.params.host,
                self.params.port,
                key_blob,
            )
            .map(|_| ()),
        }
    }

    fn rejected(&self, key_blob: &[u8], reason: &str) -> SshError {
        SshError::HostKeyRejected {
            host: self.params.host.clone(),
            port: self.params.port,
            key_type: blob_key_type(key_blob).unwrap_or_default(),
            fingerprint: fingerprint(key_blob),
            reason: reason.to_string(),
        }
    }
}

impl std::fmt::Debug for KeyExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyExchange")
            .field("state", &self.state.current())
            .field("in_progress", &self.in_progress())
            .field("completed", &self.completed)
            .field("strict", &self.strict)
            .finish()
    }
}
