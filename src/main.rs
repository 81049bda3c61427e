//! Cipherbox CLI - Main Entry Point
//!
//! One binary for both sides of the protocol.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          CLI Application                                 │
//! │  ┌─────────────────────────────────────────────────────────────────────┐│
//! │  │                         Commands                                    ││
//! │  │  keygen  server  register  upload  download  delete  list          ││
//! │  └─────────────────────────────────────────────────────────────────────┘│
//! │                                    │                                     │
//! │  ┌─────────────────────────────────────────────────────────────────────┐│
//! │  │                    Handshake (rsa)                                  ││
//! │  │  - Public key exchange          - Encrypted 48-byte tokens         ││
//! │  │  - Session key = token XOR token                                   ││
//! │  └─────────────────────────────────────────────────────────────────────┘│
//! │                                    │                                     │
//! │  ┌─────────────────────────────────────────────────────────────────────┐│
//! │  │                    Secure Channel (aes + ctr)                       ││
//! │  │  - AES-256-CTR stream           - Framed JSON records              ││
//! │  └─────────────────────────────────────────────────────────────────────┘│
//! │                                    │                                     │
//! │  ┌─────────────────────────────────────────────────────────────────────┐│
//! │  │                    Network Layer (tokio)                            ││
//! │  │  - Async TCP streams            - One task per connection          ││
//! │  └─────────────────────────────────────────────────────────────────────┘│
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::io::{self, BufRead, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use cipherbox::client::{Client, ClientConfig, UserSession};
use cipherbox::handshake::{KeyPair, DEFAULT_KEY_BITS};
use cipherbox::protocol::Credentials;
use cipherbox::server::{Server, ServerConfig, DEFAULT_ADDR};

/// Cipherbox CLI
///
/// Encrypted file storage over a hand-rolled RSA / AES-256-CTR channel.
/// Files are encrypted on the client before upload.
#[derive(Parser)]
#[command(name = "cbx")]
#[command(version)]
#[command(about = "Encrypted per-user file storage", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate the server's long-lived RSA key
    Keygen {
        /// Where to write the private key (PKCS#8 PEM)
        #[arg(short, long, default_value = "./server_key.pem")]
        output: PathBuf,

        /// Modulus size in bits
        #[arg(long, default_value_t = DEFAULT_KEY_BITS)]
        bits: usize,
    },

    /// Start the server
    Server {
        /// Address to bind to
        #[arg(short, long, default_value = DEFAULT_ADDR)]
        bind: SocketAddr,

        /// Storage directory for the user table and files
        #[arg(short, long, default_value = "./storage")]
        storage: PathBuf,

        /// Server private key (PEM); a fresh key is generated if omitted
        #[arg(long)]
        key: Option<PathBuf>,
    },

    /// Create an account
    Register {
        #[command(flatten)]
        conn: ConnectArgs,
    },

    /// Encrypt and upload a file
    Upload {
        #[command(flatten)]
        conn: ConnectArgs,

        /// Name of the file to upload
        file: String,

        /// Local directory the file is read from
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
    },

    /// Download and decrypt a file
    Download {
        #[command(flatten)]
        conn: ConnectArgs,

        /// Name of the file to download
        file: String,

        /// Local directory the file is written to
        #[arg(short, long, default_value = "./downloads")]
        dir: PathBuf,
    },

    /// Delete a file on the server
    Delete {
        #[command(flatten)]
        conn: ConnectArgs,

        /// Name of the file to delete
        file: String,
    },

    /// List your files on the server
    List {
        #[command(flatten)]
        conn: ConnectArgs,
    },
}

#[derive(Args)]
struct ConnectArgs {
    /// Server address
    #[arg(long, default_value = DEFAULT_ADDR)]
    server: SocketAddr,

    /// Username
    #[arg(short, long)]
    user: Option<String>,

    /// Password (prompted if not given)
    #[arg(short, long, env = "CBX_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

enum Action {
    Register,
    Upload { file: String, dir: PathBuf },
    Download { file: String, dir: PathBuf },
    Delete { file: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Keygen { output, bits } => run_keygen(output, bits).await,
        Commands::Server { bind, storage, key } => run_server(bind, storage, key).await,
        Commands::Register { conn } => run_client(conn, Action::Register).await,
        Commands::Upload { conn, file, dir } => {
            run_client(conn, Action::Upload { file, dir }).await
        }
        Commands::Download { conn, file, dir } => {
            run_client(conn, Action::Download { file, dir }).await
        }
        Commands::Delete { conn, file } => run_client(conn, Action::Delete { file }).await,
        Commands::List { conn } => run_client(conn, Action::List).await,
    }
}

async fn run_keygen(output: PathBuf, bits: usize) -> Result<()> {
    info!("🔐 Generating {}-bit RSA key...", bits);

    let keys = KeyPair::generate_async(bits).await?;

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {:?}", parent))?;
    }
    keys.save(&output)?;

    info!("✅ Key generated successfully!");
    info!("   Private key: {:?}", output);
    info!("");
    info!("📝 Usage:");
    info!("   Server: cbx server --key {:?}", output);

    Ok(())
}

async fn run_server(bind: SocketAddr, storage: PathBuf, key: Option<PathBuf>) -> Result<()> {
    info!("🚀 Starting cipherbox server...");

    let identity = match key {
        Some(path) => {
            info!("🔑 Loading server key from {:?}", path);
            KeyPair::load(&path)?
        }
        None => {
            info!("🔑 No --key given, generating an ephemeral {}-bit key", DEFAULT_KEY_BITS);
            KeyPair::generate_async(DEFAULT_KEY_BITS).await?
        }
    };

    let config = ServerConfig {
        bind_addr: bind,
        storage_dir: storage,
        identity: Arc::new(identity),
    };

    let server = Server::new(config);
    server.run().await
}

async fn run_client(conn: ConnectArgs, action: Action) -> Result<()> {
    let register = matches!(action, Action::Register);
    let client = Client::new(ClientConfig::new(conn.server));

    let mut user = conn.user;
    let mut password = conn.password;

    let session = client
        .login_with_retry(|rejection| {
            if let Some(reason) = rejection {
                eprintln!("❌ Login failed: {}", reason);
                if !confirm("Try again?")? {
                    return Ok(None);
                }
                user = None;
                password = None;
            }

            let username = match user.take() {
                Some(username) => username,
                None => prompt("Username")?,
            };
            let secret = match password.take() {
                Some(secret) => secret,
                None => prompt("Password")?,
            };

            let credentials = Credentials::new(username, secret);
            Ok(Some(if register {
                credentials.registering()
            } else {
                credentials
            }))
        })
        .await?;

    let Some(mut session) = session else {
        info!("Giving up");
        return Ok(());
    };

    let result = perform(&mut session, action).await;
    session.logout().await?;
    result
}

async fn perform(session: &mut UserSession, action: Action) -> Result<()> {
    match action {
        Action::Register => {
            info!("✅ Account {} is ready", session.username());
        }
        Action::Upload { file, dir } => {
            session.upload(&dir.join(&file), &file).await?;
        }
        Action::Download { file, dir } => {
            if session.download(&file, &dir).await?.is_none() {
                println!("{} does not exist", file);
            }
        }
        Action::Delete { file } => {
            session.delete(&file).await?;
        }
        Action::List => {
            let files = session.list().await?;

            if files.is_empty() {
                info!("📁 No files found");
            } else {
                info!("📁 Files on server:");
                println!();
                for name in files {
                    println!("  {}", name);
                }
            }
        }
    }

    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    eprint!("{}: ", label);
    io::stderr().flush()?;

    let mut line = String::new();
    let read = io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read from stdin")?;
    if read == 0 {
        anyhow::bail!("stdin closed while reading {}", label.to_lowercase());
    }

    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn confirm(question: &str) -> Result<bool> {
    let answer = prompt(&format!("{} [y/N]", question))?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}
