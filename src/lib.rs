//! Cipherbox
//!
//! Encrypted per-user file storage over a hand-rolled secure channel.
//!
//! ## Features
//! - RSA key exchange deriving a per-connection AES-256-CTR session key
//! - Framed JSON records over the encrypted stream
//! - Salted SHA-256 credential table with registration
//! - Per-user upload, download, delete and listing
//! - Client-side file encryption under a per-user secret
//!
//! ## Usage
//!
//! ```bash
//! # Generate the server key
//! cbx keygen --output ./server_key.pem
//!
//! # Start server
//! cbx server --key ./server_key.pem --storage ./storage
//!
//! # Create an account and upload a file
//! cbx register --user alice
//! cbx upload --user alice notes.txt
//!
//! # Download it again
//! cbx download --user alice notes.txt --dir ./downloads
//! ```

pub mod channel;
pub mod cipher;
pub mod client;
pub mod credentials;
pub mod handshake;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;

pub use channel::SecureChannel;
pub use client::{Client, ClientConfig, ClientSession, LoginResult, UserSession};
pub use handshake::{KeyPair, SessionKey};
pub use protocol::{Command, Credentials, Message};
pub use server::{Server, ServerConfig};
