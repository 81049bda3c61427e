//! Protocol Definition Module
//!
//! This module defines the cipherbox wire protocol including:
//! - Frame codec shared by the cleartext handshake and the encrypted channel
//! - Handshake, authentication and command records
//! - File/user name validation for the per-user storage area
//!
//! ## Protocol Overview
//!
//! ```text
//! Client                                       Server
//!   |                                            |
//!   |-- PublicKey(client SPKI) ----------------->|   cleartext
//!   |<---------------- PublicKey(server SPKI) ---|
//!   |-- Token(RSA(client token)) --------------->|
//!   |<--------------- Token(RSA(server token)) --|
//!   |                                            |
//!   |   [AES-256-CTR keyed by token XOR token]   |
//!   |                                            |
//!   |-- Credentials(user, pass, register) ------>|
//!   |<------------------- AuthReply(Ok, secret) -|
//!   |-- Message(up/down/delete/list) ----------->|
//!   |<------------------------ Message(reply) ---|
//!   |-- Message(logout) ------------------------>|
//!   |<------------------------ Message(reply) ---|
//! ```
//!
//! Every frame, encrypted or not, is laid out as
//!
//! ```text
//! +----------+-----------+--------------+
//! | Magic(4) | Length(4) | JSON payload |
//! +----------+-----------+--------------+
//! ```

use std::fmt;
use std::io;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (64 MB) - prevents memory exhaustion
pub const MAX_MESSAGE_SIZE: u64 = 64 * 1024 * 1024;

/// Maximum frame size before the session key exists. Public keys and token
/// ciphertexts are well under 1 KB.
pub const MAX_HANDSHAKE_MESSAGE_SIZE: u64 = 8 * 1024;

/// Magic bytes to identify our protocol
pub const PROTOCOL_MAGIC: &[u8; 4] = b"CBX1";

/// Actor name the server puts on every reply
pub const SERVER_ACTOR: &str = "server";

/// Protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(u64, u64),

    #[error("Invalid protocol magic")]
    InvalidMagic,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Unknown command: {0:?}")]
    UnknownCommand(String),
}

impl ProtocolError {
    /// True when the peer closed the connection between frames
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ProtocolError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }

    /// True when the frame was read completely but its content was bad,
    /// so the stream is still positioned on a frame boundary.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ProtocolError::Serialization(_))
    }
}

/// Cleartext records exchanged before the session key exists
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HandshakeMessage {
    /// DER-encoded SubjectPublicKeyInfo of the sender's RSA key
    PublicKey {
        #[serde(with = "b64")]
        der: Vec<u8>,
    },

    /// The sender's token, RSA/PKCS#1 v1.5 encrypted to the receiver
    Token {
        #[serde(with = "b64")]
        ciphertext: Vec<u8>,
    },
}

/// First record on the secure channel: who the client claims to be
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Create the account before authenticating
    #[serde(default)]
    pub register: bool,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            register: false,
        }
    }

    pub fn registering(mut self) -> Self {
        self.register = true;
        self
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("register", &self.register)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthStatus {
    Ok,
    No,
}

/// Server verdict on the submitted credentials
#[derive(Clone, Serialize, Deserialize)]
pub struct AuthReply {
    pub status: AuthStatus,
    /// Per-user secret, present only when `status` is `Ok`
    #[serde(with = "b64_opt", default)]
    pub secret: Option<Vec<u8>>,
    #[serde(default)]
    pub reason: String,
}

impl AuthReply {
    pub fn accepted(secret: Vec<u8>) -> Self {
        Self {
            status: AuthStatus::Ok,
            secret: Some(secret),
            reason: String::new(),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            status: AuthStatus::No,
            secret: None,
            reason: reason.into(),
        }
    }
}

impl fmt::Debug for AuthReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthReply")
            .field("status", &self.status)
            .field("secret", &self.secret.as_ref().map(|_| "[REDACTED]"))
            .field("reason", &self.reason)
            .finish()
    }
}

/// Command verbs understood by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Up,
    Down,
    Delete,
    List,
    Logout,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Up => "up",
            Command::Down => "down",
            Command::Delete => "delete",
            Command::List => "list",
            Command::Logout => "logout",
        }
    }

    /// Whether the command operates on a named file
    pub fn takes_file(&self) -> bool {
        matches!(self, Command::Up | Command::Down | Command::Delete)
    }
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(Command::Up),
            "down" => Ok(Command::Down),
            "delete" => Ok(Command::Delete),
            "list" => Ok(Command::List),
            "logout" => Ok(Command::Logout),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command request or reply
///
/// `command` stays a free-form string on the wire so that unknown verbs can
/// be received, counted and answered instead of failing to decode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub actor: String,
    pub command: String,
    pub file_name: String,
    pub destination_path: String,
    #[serde(with = "b64_opt", default)]
    pub payload: Option<Vec<u8>>,
    #[serde(default)]
    pub listing: String,
    #[serde(default)]
    pub error: String,
}

impl Message {
    /// Build a client request
    pub fn request(actor: &str, command: &str, file_name: &str) -> Self {
        Self {
            actor: actor.to_string(),
            command: command.to_string(),
            file_name: file_name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Build a server reply echoing the request's command and file name
    pub fn reply_to(request: &Message) -> Self {
        Self {
            actor: SERVER_ACTOR.to_string(),
            command: request.command.clone(),
            file_name: request.file_name.clone(),
            destination_path: request.destination_path.clone(),
            ..Default::default()
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = error.into();
        self
    }

    pub fn is_error(&self) -> bool {
        !self.error.is_empty()
    }

    /// Parse the verb carried by this message
    pub fn parsed_command(&self) -> Result<Command, ProtocolError> {
        self.command.parse()
    }
}

/// Length-prefixed frame codec
pub struct MessageFramer;

impl MessageFramer {
    /// Write a message with length prefix
    pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
        T: Serialize,
    {
        let payload = serde_json::to_vec(message)?;
        let len = payload.len() as u64;

        if len > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(len, MAX_MESSAGE_SIZE));
        }

        writer.write_all(PROTOCOL_MAGIC).await?;
        writer.write_u32(len as u32).await?;
        writer.write_all(&payload).await?;
        writer.flush().await?;

        Ok(())
    }

    /// Read a message with length prefix
    pub async fn read_message<R, T>(reader: &mut R) -> Result<T, ProtocolError>
    where
        R: AsyncRead + Unpin,
        T: for<'de> Deserialize<'de>,
    {
        Self::read_message_limited(reader, MAX_MESSAGE_SIZE).await
    }

    /// Read a message, refusing any frame announced as larger than `max_len`
    /// before its body is buffered
    pub async fn read_message_limited<R, T>(
        reader: &mut R,
        max_len: u64,
    ) -> Result<T, ProtocolError>
    where
        R: AsyncRead + Unpin,
        T: for<'de> Deserialize<'de>,
    {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).await?;

        if &magic != PROTOCOL_MAGIC {
            return Err(ProtocolError::InvalidMagic);
        }

        let len = reader.read_u32().await? as u64;

        if len > max_len {
            return Err(ProtocolError::MessageTooLarge(len, max_len));
        }

        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload).await?;

        let message = serde_json::from_slice(&payload)?;

        Ok(message)
    }
}

/// Validate a client-supplied name before it becomes a path segment
///
/// # Security
/// File names and user names are joined onto the storage root, so anything
/// that could address a different directory is rejected outright rather
/// than normalized.
pub fn validate_name(name: &str) -> Result<&str, ProtocolError> {
    if name.is_empty() {
        return Err(ProtocolError::InvalidName("empty name".to_string()));
    }

    if name == "." || name == ".." {
        return Err(ProtocolError::InvalidName(format!(
            "{:?} is a directory reference",
            name
        )));
    }

    if name.contains(['/', '\\']) {
        return Err(ProtocolError::InvalidName(format!(
            "{:?} contains a path separator",
            name
        )));
    }

    if name.contains('\0') {
        return Err(ProtocolError::InvalidName("name contains NUL".to_string()));
    }

    // Windows drive prefixes such as "C:"
    if name.contains(':') {
        return Err(ProtocolError::InvalidName(format!(
            "{:?} contains a drive separator",
            name
        )));
    }

    Ok(name)
}

/// Serde adapter: `Vec<u8>` as a standard base64 string
pub(crate) mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Serde adapter: `Option<Vec<u8>>` as base64 or `null`
pub(crate) mod b64_opt {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom))
            .transpose()
    }
}
