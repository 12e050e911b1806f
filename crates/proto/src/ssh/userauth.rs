//! Client user authentication flow (RFC 4252).
//!
//! [`Authenticator`] requests the `ssh-userauth` service, sends `none` to
//! learn which methods the server accepts, then works through the
//! configured [`Credentials`] in a fixed order:
//!
//! 1. every private key (`publickey`: query, then sign on PK_OK)
//! 2. `password`, when a prompter is available
//! 3. `keyboard-interactive`, when a prompter is available
//!
//! A partial success updates the list of methods the server still wants
//! and the loop carries on. When nothing is left to try the result is
//! [`SshError::AuthFailed`] with every attempt made. Retrying is up to the
//! caller.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::ssh::auth::{
    construct_signature_data, parse_service, service_request, AuthBanner, AuthFailure,
    AuthMethod, AuthRequest, InfoRequest, InfoResponse, SERVICE_CONNECTION, SERVICE_USERAUTH,
};
use crate::ssh::error::{AttemptOutcome, AuthAttempt, Result, SshError};
use crate::ssh::logging;
use crate::ssh::message::{MessageType, USERAUTH_INFO_REQUEST};
use crate::ssh::privatekey::PrivateKey;

/// Message exchange the authenticator runs over.
#[async_trait]
pub trait AuthTransport: Send {
    /// Sends one payload.
    async fn send(&mut self, payload: Vec<u8>) -> Result<()>;

    /// Receives the next authentication-layer payload.
    async fn recv(&mut self) -> Result<Vec<u8>>;
}

/// Asks the user for secrets and shows server banners.
#[async_trait]
pub trait AuthPrompter: Send + Sync {
    /// Password for `prompt`; `None` declines.
    async fn password(&self, prompt: &str) -> Option<Zeroizing<String>>;

    /// One answer per prompt of `request`; `None` declines.
    async fn keyboard_interactive(&self, request: &InfoRequest) -> Option<Vec<Zeroizing<String>>>;

    /// Displays a USERAUTH_BANNER.
    async fn banner(&self, message: &str) {
        info!(banner = message, "SSH server banner");
    }
}

/// Prompter that answers every password prompt with one fixed secret.
pub struct StaticPrompter {
    password: Zeroizing<String>,
}

impl StaticPrompter {
    /// Creates a prompter for `password`.
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: Zeroizing::new(password.into()),
        }
    }
}

impl std::fmt::Debug for StaticPrompter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticPrompter(<redacted>)")
    }
}

#[async_trait]
impl AuthPrompter for StaticPrompter {
    async fn password(&self, _prompt: &str) -> Option<Zeroizing<String>> {
        Some(self.password.clone())
    }

    async fn keyboard_interactive(&self, request: &InfoRequest) -> Option<Vec<Zeroizing<String>>> {
        // Only hidden prompts get the password; anything else is unanswerable.
        if request.prompts.iter().any(|p| p.echo) {
            return None;
        }
        Some(request.prompts.iter().map(|_| self.password.clone()).collect())
    }
}

/// What the client may authenticate with.
#[derive(Clone, Default)]
pub struct Credentials {
    keys: Vec<Arc<PrivateKey>>,
    prompter: Option<Arc<dyn AuthPrompter>>,
}

impl Credentials {
    /// No keys and no prompter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a private key; keys are tried in the order they were added.
    pub fn with_key(mut self, key: PrivateKey) -> Self {
        self.keys.push(Arc::new(key));
        self
    }

    /// Sets the prompter used for password and keyboard-interactive.
    pub fn with_prompter(mut self, prompter: Arc<dyn AuthPrompter>) -> Self {
        self.prompter = Some(prompter);
        self
    }

    /// Shorthand for a [`StaticPrompter`].
    pub fn with_password(self, password: impl Into<String>) -> Self {
        self.with_prompter(Arc::new(StaticPrompter::new(password)))
    }

    /// Adds the first default key found under `~/.ssh`, if any.
    pub fn with_default_key(self) -> Self {
        match PrivateKey::load_default() {
            Ok(key) => self.with_key(key),
            Err(e) => {
                debug!(error = %e, "No default private key loaded");
                self
            }
        }
    }

    /// Configured keys.
    pub fn keys(&self) -> &[Arc<PrivateKey>] {
        &self.keys
    }

    /// Configured prompter.
    pub fn prompter(&self) -> Option<&Arc<dyn AuthPrompter>> {
        self.prompter.as_ref()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<String> = self.keys.iter().map(|k| k.fingerprint()).collect();
        f.debug_struct("Credentials")
            .field("keys", &keys)
            .field("prompter", &self.prompter.is_some())
            .finish()
    }
}

/// Attempts made so far and the methods the server still accepts.
#[derive(Debug, Clone, Default)]
pub struct AuthState {
    attempts: Vec<AuthAttempt>,
    allowed: Option<Vec<String>>,
    partial: bool,
}

impl AuthState {
    /// Whether the server currently accepts `method`. Before the first
    /// failure message everything is assumed to be allowed.
    pub fn allows(&self, method: &str) -> bool {
        self.allowed
            .as_ref()
            .map_or(true, |list| list.iter().any(|m| m == method))
    }

    /// Attempts in order.
    pub fn attempts(&self) -> &[AuthAttempt] {
        &self.attempts
    }

    /// Whether any method succeeded partially.
    pub fn had_partial_success(&self) -> bool {
        self.partial
    }

    fn record(&mut self, user: &str, method: &str, key: Option<String>, outcome: AttemptOutcome) {
        let text = match &outcome {
            AttemptOutcome::Rejected => "rejected".to_string(),
            AttemptOutcome::PartialSuccess => "partial-success".to_string(),
            AttemptOutcome::Skipped(why) => format!("skipped: {}", why),
        };
        logging::log_auth_attempt(user, method, key.as_deref(), &text);
        self.attempts.push(AuthAttempt {
            method: method.to_string(),
            key,
            outcome,
        });
    }

    fn update(&mut self, failure: &AuthFailure) {
        if failure.partial_success() {
            self.partial = true;
        }
        self.allowed = Some(failure.methods_can_continue().to_vec());
    }
}

/// Successful authentication.
#[derive(Debug, Clone)]
pub struct Authenticated {
    /// Method that completed authentication
    pub method: String,
    /// Earlier attempts, including partial successes
    pub attempts: Vec<AuthAttempt>,
}

enum Step {
    Success,
    Failure(AuthFailure),
    Skipped(String),
}

/// Drives one authentication exchange.
pub struct Authenticator<'a, T: ?Sized> {
    transport: &'a mut T,
    session_id: &'a [u8],
    host: String,
    prompter: Option<Arc<dyn AuthPrompter>>,
    state: AuthState,
}

impl<'a, T: AuthTransport + ?Sized> Authenticator<'a, T> {
    /// Creates an authenticator for a transport whose first exchange
    /// produced `session_id`.
    pub fn new(transport: &'a mut T, session_id: &'a [u8], host: &str) -> Self {
        Self {
            transport,
            session_id,
            host: host.to_string(),
            prompter: None,
            state: AuthState::default(),
        }
    }

    /// Authenticates `user`.
    pub async fn authenticate(mut self, user: &str, credentials: &Credentials) -> Result<Authenticated> {
        self.transport.send(service_request(SERVICE_USERAUTH)).await?;
        loop {
            let payload = self.transport.recv().await?;
            match payload.first().copied() {
                Some(m) if m == MessageType::ServiceAccept as u8 => {
                    debug!(service = %parse_service(&payload)?, "SSH service accepted");
                    break;
                }
                Some(m) if m == MessageType::ExtInfo as u8 => continue,
                _ => {
                    return Err(SshError::protocol(format!(
                        "Expected SERVICE_ACCEPT, got {}",
                        crate::ssh::message::describe(&payload)
                    )))
                }
            }
        }

        let prompter = credentials.prompter().cloned();
        self.prompter = prompter.clone();
        match self.request(user, AuthMethod::None).await? {
            Step::Success => return Ok(self.succeeded(user, "none")),
            Step::Failure(failure) => self.state.update(&failure),
            Step::Skipped(_) => {}
        }

        let mut tried_keys = HashSet::new();
        let mut password_tried = false;
        let mut interactive_tried = false;

        loop {
            let next_key = credentials
                .keys()
                .iter()
                .enumerate()
                .find(|(i, _)| !tried_keys.contains(i));

            let (method, key_id, step) = match next_key {
                Some((i, key)) if self.state.allows("publickey") => {
                    tried_keys.insert(i);
                    let step = self.try_public_key(user, key).await?;
                    ("publickey", Some(key.fingerprint()), step)
                }
                _ if !password_tried && self.state.allows("password") => {
                    password_tried = true;
                    let step = match &prompter {
                        Some(p) => self.try_password(user, p.as_ref()).await?,
                        None => Step::Skipped("no prompter".to_string()),
                    };
                    ("password", None, step)
                }
                _ if !interactive_tried && self.state.allows("keyboard-interactive") => {
                    interactive_tried = true;
                    let step = match &prompter {
                        Some(p) => self.try_keyboard_interactive(user, p.as_ref()).await?,
                        None => Step::Skipped("no prompter".to_string()),
                    };
                    ("keyboard-interactive", None, step)
                }
                _ => break,
            };

            match step {
                Step::Success => return Ok(self.succeeded(user, method)),
                Step::Failure(failure) => {
                    let outcome = if failure.partial_success() {
                        AttemptOutcome::PartialSuccess
                    } else {
                        AttemptOutcome::Rejected
                    };
                    self.state.record(user, method, key_id, outcome);
                    self.state.update(&failure);
                }
                Step::Skipped(why) => {
                    self.state
                        .record(user, method, key_id, AttemptOutcome::Skipped(why))
                }
            }
        }

        Err(SshError::AuthFailed {
            attempts: self.state.attempts,
        })
    }

    fn succeeded(self, user: &str, method: &str) -> Authenticated {
        logging::log_authenticated(user, method);
        Authenticated {
            method: method.to_string(),
            attempts: self.state.attempts,
        }
    }

    async fn request(&mut self, user: &str, method: AuthMethod) -> Result<Step> {
        let request = AuthRequest::new(user, SERVICE_CONNECTION, method);
        self.transport.send(request.to_bytes()).await?;
        let reply = self.next_reply().await?;
        self.final_step(&reply)
    }

    fn final_step(&self, reply: &[u8]) -> Result<Step> {
        match reply.first().copied() {
            Some(m) if m == MessageType::UserauthSuccess as u8 => Ok(Step::Success),
            Some(m) if m == MessageType::UserauthFailure as u8 => {
                Ok(Step::Failure(AuthFailure::from_bytes(reply)?))
            }
            _ => Err(SshError::protocol(format!(
                "Unexpected authentication reply {}",
                crate::ssh::message::describe(reply)
            ))),
        }
    }

    /// Next reply, showing any banners that come first.
    async fn next_reply(&mut self) -> Result<Vec<u8>> {
        loop {
            let payload = self.transport.recv().await?;
            if payload.first() != Some(&(MessageType::UserauthBanner as u8)) {
                return Ok(payload);
            }
            let banner = AuthBanner::from_bytes(&payload)?;
            match &self.prompter {
                Some(p) => p.banner(banner.message()).await,
                None => debug!(len = banner.message().len(), "SSH banner received"),
            }
        }
    }

    async fn try_public_key(&mut self, user: &str, key: &PrivateKey) -> Result<Step> {
        let algorithm = key.algorithm_name();
        let blob = key.public_key_blob();

        let query = AuthRequest::new(
            user,
            SERVICE_CONNECTION,
            AuthMethod::PublicKey {
                algorithm: algorithm.to_string(),
                public_key: blob.clone(),
                signature: None,
            },
        );
        self.transport.send(query.to_bytes()).await?;
        let reply = self.next_reply().await?;
        if reply.first() != Some(&(MessageType::UserauthPkOk as u8)) {
            return self.final_step(&reply);
        }

        let data = construct_signature_data(self.session_id, user, SERVICE_CONNECTION, algorithm, &blob);
        let signature = match key.sign(&data) {
            Ok(sig) => sig,
            Err(e) => return Ok(Step::Skipped(format!("signing failed: {}", e))),
        };
        self.request(
            user,
            AuthMethod::PublicKey {
                algorithm: algorithm.to_string(),
                public_key: blob,
                signature: Some(signature),
            },
        )
        .await
    }

    async fn try_password(&mut self, user: &str, prompter: &dyn AuthPrompter) -> Result<Step> {
        let prompt = format!("{}@{}'s password: ", user, self.host);
        let Some(password) = prompter.password(&prompt).await else {
            return Ok(Step::Skipped("prompt declined".to_string()));
        };
        let request = AuthRequest::new(user, SERVICE_CONNECTION, AuthMethod::Password(password));
        self.transport.send(request.to_bytes()).await?;
        let reply = self.next_reply().await?;
        if reply.first() == Some(&USERAUTH_INFO_REQUEST) {
            // SSH_MSG_USERAUTH_PASSWD_CHANGEREQ shares this number.
            return Ok(Step::Skipped("server requested a password change".to_string()));
        }
        self.final_step(&reply)
    }

    async fn try_keyboard_interactive(&mut self, user: &str, prompter: &dyn AuthPrompter) -> Result<Step> {
        let request = AuthRequest::new(
            user,
            SERVICE_CONNECTION,
            AuthMethod::KeyboardInteractive {
                submethods: String::new(),
            },
        );
        self.transport.send(request.to_bytes()).await?;

        loop {
            let reply = self.next_reply().await?;
            if reply.first() != Some(&USERAUTH_INFO_REQUEST) {
                return self.final_step(&reply);
            }
            let info = InfoRequest::from_bytes(&reply)?;
            let responses = match prompter.keyboard_interactive(&info).await {
                Some(answers) if answers.len() == info.prompts.len() => answers,
                // The exchange cannot be cancelled; empty answers make the server fail it.
                _ => info.prompts.iter().map(|_| Zeroizing::new(String::new())).collect(),
            };
            let response = InfoResponse { responses };
            self.transport.send(response.to_bytes().to_vec()).await?;
        }
    }
}
