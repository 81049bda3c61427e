//! Session Controller
//!
//! Drives one connection from handshake to close:
//!
//! ```text
//! Handshaking ──> Authenticating ──┬──> Rejected ─────────────┐
//!                                  └──> Authenticated ──> Serving ──> Closed
//! ```
//!
//! While serving, every request gets exactly one reply. Requests that are
//! not understood (unknown verb, undecodable record, unusable file name)
//! count as strikes; a valid request resets the count and the third
//! consecutive strike closes the connection. Storage failures are not
//! strikes: they are reported in the reply and the session carries on.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, warn};

use crate::channel::SecureChannel;
use crate::credentials::{CredentialError, CredentialStore};
use crate::handshake::KeyPair;
use crate::protocol::{validate_name, AuthReply, Command, Credentials, Message};
use crate::storage::{StorageRoot, UserArea};

/// Consecutive invalid requests tolerated before the connection is closed
pub const MAX_INVALID_COMMANDS: u32 = 3;

/// Separator between names in a `list` reply
pub const LISTING_SEPARATOR: &str = "\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    Authenticating,
    Authenticated,
    Rejected,
    Serving,
    Closed,
}

/// How a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Credentials (or registration) were refused
    Rejected,
    /// The client sent `logout`
    LoggedOut,
    /// Too many consecutive invalid requests
    TooManyErrors,
    /// The client went away between requests
    Disconnected,
}

/// Process-wide state every session borrows
#[derive(Clone)]
pub struct SessionContext {
    pub identity: Arc<KeyPair>,
    pub credentials: Arc<CredentialStore>,
    pub storage: StorageRoot,
}

pub struct Session<S> {
    channel: SecureChannel<S>,
    ctx: SessionContext,
    peer: String,
    state: SessionState,
    strikes: u32,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Run a complete session over `stream`
    ///
    /// Handshake failures abort with an error; everything after the
    /// handshake ends in a [`SessionOutcome`] unless the transport breaks.
    pub async fn run(
        stream: S,
        peer: impl fmt::Display,
        ctx: SessionContext,
    ) -> Result<SessionOutcome> {
        let peer = peer.to_string();
        debug!("[{}] state: {:?}", peer, SessionState::Handshaking);

        let channel = SecureChannel::establish(stream, &ctx.identity)
            .await
            .context("Handshake failed")?;
        info!("🔐 Secure channel established with {}", peer);

        let mut session = Session {
            channel,
            ctx,
            peer,
            state: SessionState::Handshaking,
            strikes: 0,
        };
        session.transition(SessionState::Authenticating);

        let outcome = match session.authenticate().await? {
            Some(area) => session.serve(area).await?,
            None => SessionOutcome::Rejected,
        };

        if let Err(e) = session.channel.close().await {
            debug!("[{}] close: {}", session.peer, e);
        }
        session.transition(SessionState::Closed);

        Ok(outcome)
    }

    fn transition(&mut self, next: SessionState) {
        debug!("[{}] state: {:?} -> {:?}", self.peer, self.state, next);
        self.state = next;
    }

    /// Read the credentials record and answer it. Returns the user's
    /// storage area on success.
    async fn authenticate(&mut self) -> Result<Option<UserArea>> {
        let creds: Credentials = self
            .channel
            .receive()
            .await
            .context("Failed to read credentials")?;

        if creds.register {
            if let Err(e) = self
                .ctx
                .credentials
                .register(&creds.username, &creds.password)
                .await
            {
                let reason = match e {
                    CredentialError::Io(_) | CredentialError::Corrupt(_) => {
                        error!("[{}] credential store failure: {}", self.peer, e);
                        "registration failed on the server".to_string()
                    }
                    other => other.to_string(),
                };
                return self.reject(reason).await;
            }
        }

        let secret = match self
            .ctx
            .credentials
            .authenticate(&creds.username, &creds.password)
            .await
        {
            Ok(Some(secret)) => secret,
            Ok(None) => return self.reject("invalid username or password").await,
            Err(e) => {
                error!("[{}] credential store failure: {}", self.peer, e);
                return self.reject("authentication failed on the server").await;
            }
        };

        let area = self.ctx.storage.user_area(&creds.username)?;
        self.channel
            .send(&AuthReply::accepted(secret.as_bytes().to_vec()))
            .await
            .context("Failed to send authentication reply")?;

        info!("✅ {} authenticated as {}", self.peer, creds.username);
        self.transition(SessionState::Authenticated);
        Ok(Some(area))
    }

    async fn reject(&mut self, reason: impl Into<String>) -> Result<Option<UserArea>> {
        let reason = reason.into();
        warn!("🚫 Rejected {}: {}", self.peer, reason);

        self.channel
            .send(&AuthReply::rejected(reason))
            .await
            .context("Failed to send rejection")?;
        self.transition(SessionState::Rejected);
        Ok(None)
    }

    /// Command loop for an authenticated user
    async fn serve(&mut self, area: UserArea) -> Result<SessionOutcome> {
        self.transition(SessionState::Serving);

        loop {
            let request: Message = match self.channel.receive().await {
                Ok(request) => request,
                Err(e) if e.is_disconnect() => {
                    info!("Client {} disconnected", self.peer);
                    return Ok(SessionOutcome::Disconnected);
                }
                Err(e) if e.is_recoverable() => {
                    if self.strike(&Message::default(), e.to_string()).await? {
                        return Ok(SessionOutcome::TooManyErrors);
                    }
                    continue;
                }
                Err(e) => return Err(e).context("Failed to read request"),
            };

            debug!(
                "[{}] request: {} {:?}",
                self.peer, request.command, request.file_name
            );

            let command = match self.check(&request) {
                Ok(command) => command,
                Err(reason) => {
                    if self.strike(&request, reason).await? {
                        return Ok(SessionOutcome::TooManyErrors);
                    }
                    continue;
                }
            };
            self.strikes = 0;

            let reply = self.execute(command, &request, &area).await;
            self.channel
                .send(&reply)
                .await
                .context("Failed to send reply")?;

            if command == Command::Logout {
                info!("👋 {} logged out", self.peer);
                return Ok(SessionOutcome::LoggedOut);
            }
        }
    }

    /// Validate the verb and, where needed, the file name
    fn check(&self, request: &Message) -> std::result::Result<Command, String> {
        let command = request.parsed_command().map_err(|e| e.to_string())?;

        if command.takes_file() {
            validate_name(&request.file_name).map_err(|e| e.to_string())?;
        }

        Ok(command)
    }

    /// Count an invalid request and tell the client. Returns true once the
    /// limit is reached.
    async fn strike(&mut self, request: &Message, reason: String) -> Result<bool> {
        self.strikes += 1;
        let exhausted = self.strikes >= MAX_INVALID_COMMANDS;

        warn!(
            "[{}] invalid request ({}/{}): {}",
            self.peer, self.strikes, MAX_INVALID_COMMANDS, reason
        );

        let detail = if exhausted {
            format!("{}; too many invalid commands, closing connection", reason)
        } else {
            format!(
                "{}; expected one of up/down/delete/list/logout ({} attempts left)",
                reason,
                MAX_INVALID_COMMANDS - self.strikes
            )
        };

        self.channel
            .send(&Message::reply_to(request).with_error(detail))
            .await
            .context("Failed to send error reply")?;

        Ok(exhausted)
    }

    async fn execute(&self, command: Command, request: &Message, area: &UserArea) -> Message {
        let mut reply = Message::reply_to(request);
        let name = request.file_name.as_str();

        match command {
            Command::Up => {
                let data = request.payload.as_deref().unwrap_or_default();
                match area.put(name, data).await {
                    Ok(()) => info!("📤 [{}] stored {} ({} bytes)", self.peer, name, data.len()),
                    Err(e) => {
                        error!("[{}] upload of {} failed: {}", self.peer, name, e);
                        reply = reply.with_error(format!("upload failed: {}", e));
                    }
                }
            }
            Command::Down => match area.get(name).await {
                Ok(Some(data)) => {
                    info!("📥 [{}] sending {} ({} bytes)", self.peer, name, data.len());
                    reply = reply.with_payload(data);
                }
                Ok(None) => debug!("[{}] {} not found", self.peer, name),
                Err(e) => {
                    error!("[{}] download of {} failed: {}", self.peer, name, e);
                    reply = reply.with_error(format!("download failed: {}", e));
                }
            },
            Command::Delete => match area.delete(name).await {
                Ok(removed) => {
                    info!("🗑️  [{}] delete {} (existed: {})", self.peer, name, removed)
                }
                Err(e) => {
                    error!("[{}] delete of {} failed: {}", self.peer, name, e);
                    reply = reply.with_error(format!("delete failed: {}", e));
                }
            },
            Command::List => match area.list().await {
                Ok(names) => reply.listing = names.join(LISTING_SEPARATOR),
                Err(e) => {
                    error!("[{}] listing failed: {}", self.peer, e);
                    reply = reply.with_error(format!("list failed: {}", e));
                }
            },
            Command::Logout => {}
        }

        reply
    }
}
