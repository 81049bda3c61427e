//! Cipherbox Server Module
//!
//! This module implements the connection acceptor that:
//! - Binds one listening socket for the lifetime of the process
//! - Holds the server's long-lived RSA identity, shared read-only
//! - Spawns one independent Tokio task per accepted connection
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   Acceptor (this module)                 │
//! │   TcpListener ── accept ──> tokio::spawn(Session::run)   │
//! └─────────────────────────────────────────────────────────┘
//!                            │ per connection
//! ┌─────────────────────────────────────────────────────────┐
//! │  Handshake (RSA token exchange) -> AES-256-CTR channel   │
//! │  Authentication (CredentialStore, shared, mutex)         │
//! │  Command loop (up / down / delete / list / logout)       │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//! ┌─────────────────────────────────────────────────────────┐
//! │  <storage>/users.json        credential table            │
//! │  <storage>/files/<user>/     per-user ciphertext files   │
//! └─────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::fs;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::credentials::CredentialStore;
use crate::handshake::KeyPair;
use crate::session::{Session, SessionContext};
use crate::storage::StorageRoot;

/// Default endpoint shared by client and server
pub const DEFAULT_ADDR: &str = "127.0.0.1:1337";

/// Credential table file name inside the storage directory
pub const USERS_FILE: &str = "users.json";

/// Sub-directory of the storage directory holding per-user areas
pub const FILES_DIR: &str = "files";

/// Server configuration
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,
    /// Directory for the credential table and user files
    pub storage_dir: PathBuf,
    /// Long-lived RSA identity, shared by every connection
    pub identity: Arc<KeyPair>,
}

/// Cipherbox server
pub struct Server {
    config: ServerConfig,
    context: SessionContext,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: ServerConfig) -> Self {
        let context = SessionContext {
            identity: config.identity.clone(),
            credentials: Arc::new(CredentialStore::new(config.storage_dir.join(USERS_FILE))),
            storage: StorageRoot::new(config.storage_dir.join(FILES_DIR)),
        };

        Self { config, context }
    }

    /// Bind the configured address and serve forever
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", self.config.bind_addr))?;

        self.serve(listener).await
    }

    /// Accept connections on an already bound listener
    ///
    /// Only returns on an accept failure, which is fatal for the server.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        self.setup_storage_directory().await?;

        info!(
            "🔒 Cipherbox server listening on {}",
            listener.local_addr().context("Listener has no local address")?
        );
        info!("📁 Storage directory: {:?}", self.config.storage_dir);
        info!("🔑 Server key: {} bits", self.context.identity.bits());

        loop {
            let (tcp_stream, peer_addr) = listener
                .accept()
                .await
                .context("Failed to accept connection")?;

            let context = self.context.clone();
            tokio::spawn(async move {
                Self::handle_connection(tcp_stream, peer_addr, context).await;
            });
        }
    }

    /// Set up storage directory with proper permissions
    async fn setup_storage_directory(&self) -> Result<()> {
        let files_dir = self.context.storage.path();
        if !files_dir.exists() {
            fs::create_dir_all(files_dir)
                .await
                .with_context(|| format!("Failed to create storage directory: {:?}", files_dir))?;
            info!("Created storage directory: {:?}", files_dir);
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let metadata = fs::metadata(&self.config.storage_dir).await?;
            let mut permissions = metadata.permissions();
            permissions.set_mode(0o700);
            fs::set_permissions(&self.config.storage_dir, permissions).await?;
        }

        Ok(())
    }

    /// Handle a single client connection
    async fn handle_connection(
        tcp_stream: TcpStream,
        peer_addr: SocketAddr,
        context: SessionContext,
    ) {
        info!("📥 New connection from {}", peer_addr);

        if let Err(e) = tcp_stream.set_nodelay(true) {
            debug!("set_nodelay on {} failed: {}", peer_addr, e);
        }

        match Session::run(tcp_stream, peer_addr, context).await {
            Ok(outcome) => info!("Connection from {} closed: {:?}", peer_addr, outcome),
            Err(e) => warn!("Connection from {} aborted: {:#}", peer_addr, e),
        }
    }
}
