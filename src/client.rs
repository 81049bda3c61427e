//! Cipherbox Client Module
//!
//! This module implements the client side of the protocol:
//! - Opens a TCP connection and runs the RSA handshake with a fresh,
//!   per-connection key pair
//! - Logs in (optionally registering first) over the encrypted channel
//! - Encrypts files locally with the per-user secret before upload and
//!   decrypts them after download, so the server only sees ciphertext
//!
//! ## Connection Lifecycle
//!
//! ```text
//! Client::connect ──> ClientSession ──login──┬──> UserSession ── commands ── logout
//!                                            └──> Rejected (connection dropped)
//! ```
//!
//! A rejected login consumes its connection. [`Client::login_with_retry`]
//! opens a fresh connection for every attempt.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::fs;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::channel::SecureChannel;
use crate::cipher::{decrypt_buffer, encrypt_buffer};
use crate::credentials::UserSecret;
use crate::handshake::{KeyPair, DEFAULT_KEY_BITS};
use crate::protocol::{AuthReply, AuthStatus, Command, Credentials, Message};
use crate::session::LISTING_SEPARATOR;

/// Client configuration
pub struct ClientConfig {
    /// Server address to connect to
    pub server_addr: SocketAddr,
    /// Modulus size of the per-connection RSA key
    pub key_bits: usize,
}

impl ClientConfig {
    pub fn new(server_addr: SocketAddr) -> Self {
        Self {
            server_addr,
            key_bits: DEFAULT_KEY_BITS,
        }
    }
}

/// Cipherbox client
pub struct Client {
    config: ClientConfig,
}

impl Client {
    /// Create a new client instance
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Connect to the server and run the handshake
    pub async fn connect(&self) -> Result<ClientSession> {
        info!("🔗 Connecting to {}...", self.config.server_addr);

        let keys = KeyPair::generate_async(self.config.key_bits)
            .await
            .context("Failed to generate client key pair")?;

        let tcp_stream = TcpStream::connect(&self.config.server_addr)
            .await
            .with_context(|| format!("Failed to connect to {}", self.config.server_addr))?;
        tcp_stream.set_nodelay(true)?;

        debug!("TCP connection established");

        let channel = SecureChannel::establish(tcp_stream, &keys)
            .await
            .context("Handshake failed")?;

        info!("🔐 Secure channel established");

        Ok(ClientSession { channel })
    }

    /// Connect and log in once
    pub async fn login(&self, credentials: &Credentials) -> Result<LoginResult> {
        self.connect().await?.login(credentials).await
    }

    /// Log in, asking `prompt` for credentials until the server accepts them
    ///
    /// `prompt` receives the previous rejection reason (`None` on the first
    /// attempt) and returns `None` to give up.
    pub async fn login_with_retry<F>(&self, mut prompt: F) -> Result<Option<UserSession>>
    where
        F: FnMut(Option<&str>) -> Result<Option<Credentials>>,
    {
        let mut last_rejection: Option<String> = None;

        loop {
            let Some(credentials) = prompt(last_rejection.as_deref())? else {
                return Ok(None);
            };

            match self.login(&credentials).await? {
                LoginResult::Accepted(session) => return Ok(Some(session)),
                LoginResult::Rejected(reason) => {
                    warn!("🚫 Login rejected: {}", reason);
                    last_rejection = Some(reason);
                }
            }
        }
    }
}

/// Outcome of a login attempt
#[derive(Debug)]
pub enum LoginResult {
    Accepted(UserSession),
    Rejected(String),
}

/// Connection that has completed the handshake but not logged in yet
pub struct ClientSession {
    channel: SecureChannel<TcpStream>,
}

impl ClientSession {
    /// Send credentials. A rejection closes the connection.
    pub async fn login(mut self, credentials: &Credentials) -> Result<LoginResult> {
        self.channel
            .send(credentials)
            .await
            .context("Failed to send credentials")?;

        let reply: AuthReply = self
            .channel
            .receive()
            .await
            .context("Failed to read authentication reply")?;

        match (reply.status, reply.secret) {
            (AuthStatus::Ok, Some(secret)) => {
                info!("✅ Logged in as {}", credentials.username);
                Ok(LoginResult::Accepted(UserSession {
                    channel: self.channel,
                    username: credentials.username.clone(),
                    secret: UserSecret::from_bytes(secret),
                }))
            }
            (AuthStatus::Ok, None) => anyhow::bail!("Server accepted login without a secret"),
            (AuthStatus::No, _) => Ok(LoginResult::Rejected(reply.reason)),
        }
    }
}

/// Authenticated connection
pub struct UserSession {
    channel: SecureChannel<TcpStream>,
    username: String,
    secret: UserSecret,
}

impl std::fmt::Debug for UserSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserSession")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl UserSession {
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Per-user secret, also the file-encryption key
    pub fn secret(&self) -> &UserSecret {
        &self.secret
    }

    /// Send one raw message and return the server's reply unchanged
    pub async fn exchange(&mut self, request: &Message) -> Result<Message> {
        self.channel
            .send(request)
            .await
            .with_context(|| format!("Failed to send {} request", request.command))?;

        self.channel
            .receive()
            .await
            .with_context(|| format!("Failed to read {} reply", request.command))
    }

    /// Send a command and turn an error reply into an error
    async fn command(&mut self, request: Message) -> Result<Message> {
        let reply = self.exchange(&request).await?;

        if reply.is_error() {
            anyhow::bail!("{} failed: {}", request.command, reply.error);
        }
        if reply.command != request.command {
            anyhow::bail!(
                "Unexpected reply: expected {}, got {}",
                request.command,
                reply.command
            );
        }

        Ok(reply)
    }

    fn request(&self, command: Command, file_name: &str) -> Message {
        Message::request(&self.username, command.as_str(), file_name)
    }

    /// Encrypt `data` with the per-user secret and store it as `remote_name`
    pub async fn upload_bytes(&mut self, remote_name: &str, data: &[u8]) -> Result<()> {
        let sealed = encrypt_buffer(data, self.secret.as_bytes())
            .context("Failed to encrypt file")?;

        let pb = create_spinner(format!("Uploading {}", remote_name));
        let result = self
            .command(self.request(Command::Up, remote_name).with_payload(sealed))
            .await;
        pb.finish_and_clear();

        result?;
        info!("✅ Uploaded {} ({} bytes)", remote_name, data.len());
        Ok(())
    }

    /// Upload a local file
    pub async fn upload(&mut self, local_path: &Path, remote_name: &str) -> Result<()> {
        let metadata = fs::metadata(local_path)
            .await
            .with_context(|| format!("File not found: {:?}", local_path))?;

        if metadata.is_dir() {
            anyhow::bail!("Cannot upload a directory: {:?}", local_path);
        }

        let data = fs::read(local_path)
            .await
            .with_context(|| format!("Failed to read {:?}", local_path))?;

        self.upload_bytes(remote_name, &data).await
    }

    /// Fetch and decrypt `remote_name`; `None` if the server has no such file
    pub async fn download_bytes(&mut self, remote_name: &str) -> Result<Option<Vec<u8>>> {
        let pb = create_spinner(format!("Downloading {}", remote_name));
        let result = self.command(self.request(Command::Down, remote_name)).await;
        pb.finish_and_clear();

        let Some(sealed) = result?.payload else {
            return Ok(None);
        };

        let data = decrypt_buffer(&sealed, self.secret.as_bytes())
            .with_context(|| format!("Failed to decrypt {}", remote_name))?;
        Ok(Some(data))
    }

    /// Download `remote_name` into `local_dir`, returning the written path
    pub async fn download(
        &mut self,
        remote_name: &str,
        local_dir: &Path,
    ) -> Result<Option<PathBuf>> {
        let Some(data) = self.download_bytes(remote_name).await? else {
            warn!("⚠️  {} does not exist on the server", remote_name);
            return Ok(None);
        };

        fs::create_dir_all(local_dir)
            .await
            .with_context(|| format!("Failed to create {:?}", local_dir))?;

        let local_path = local_dir.join(remote_name);
        if local_path.exists() {
            warn!("⚠️  Overwriting local file {:?}", local_path);
        }
        fs::write(&local_path, &data)
            .await
            .with_context(|| format!("Failed to write {:?}", local_path))?;

        info!("✅ Downloaded {} ({} bytes) to {:?}", remote_name, data.len(), local_path);
        Ok(Some(local_path))
    }

    /// Delete a file on the server (missing files are fine)
    pub async fn delete(&mut self, remote_name: &str) -> Result<()> {
        self.command(self.request(Command::Delete, remote_name)).await?;
        info!("🗑️  Deleted: {}", remote_name);
        Ok(())
    }

    /// Names of the user's files on the server
    pub async fn list(&mut self) -> Result<Vec<String>> {
        let reply = self.command(self.request(Command::List, "")).await?;

        Ok(reply
            .listing
            .split(LISTING_SEPARATOR)
            .filter(|name| !name.is_empty())
            .map(String::from)
            .collect())
    }

    /// End the session
    pub async fn logout(mut self) -> Result<()> {
        self.command(self.request(Command::Logout, "")).await?;
        if let Err(e) = self.channel.close().await {
            debug!("Close after logout: {}", e);
        }
        info!("👋 Logged out");
        Ok(())
    }
}

/// Spinner shown while a transfer round-trip is in flight
fn create_spinner(message: String) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}
