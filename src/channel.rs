//! Secure Channel
//!
//! A typed, encrypted message pipe over one connection: the raw stream is
//! wrapped once in [`CtrStream`] using the session key from the handshake,
//! and every record is then written through [`MessageFramer`].
//!
//! The channel is strictly request/response and has exactly one owner per
//! side, so it needs no internal locking.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::cipher::{wrap_stream, CtrStream};
use crate::handshake::{self, HandshakeError, KeyPair, SessionKey};
use crate::protocol::{MessageFramer, ProtocolError};

pub struct SecureChannel<S> {
    stream: CtrStream<S>,
}

impl<S> SecureChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a stream whose session key has already been agreed
    pub fn new(stream: S, key: &SessionKey) -> Self {
        Self {
            stream: wrap_stream(stream, key.cipher_key(), key.iv()),
        }
    }

    /// Run the handshake on `stream` and wrap it with the resulting key
    pub async fn establish(mut stream: S, local: &KeyPair) -> Result<Self, HandshakeError> {
        let key = handshake::perform(&mut stream, local).await?;
        Ok(Self::new(stream, &key))
    }

    /// Serialize and send one record
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), ProtocolError> {
        MessageFramer::write_message(&mut self.stream, message).await
    }

    /// Block until one complete record has arrived
    pub async fn receive<T: DeserializeOwned>(&mut self) -> Result<T, ProtocolError> {
        MessageFramer::read_message(&mut self.stream).await
    }

    /// Flush pending ciphertext and close the write side
    pub async fn close(&mut self) -> Result<(), ProtocolError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::MIN_KEY_BITS;
    use crate::protocol::{Credentials, Message, MessageFramer, PROTOCOL_MAGIC};
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn test_typed_exchange_after_handshake() {
        let (client_io, server_io) = duplex(64 * 1024);
        let server_keys = KeyPair::generate(MIN_KEY_BITS).unwrap();
        let client_keys = KeyPair::generate(MIN_KEY_BITS).unwrap();

        let server = tokio::spawn(async move {
            let mut channel = SecureChannel::establish(server_io, &server_keys).await.unwrap();
            let creds: Credentials = channel.receive().await.unwrap();
            let msg: Message = channel.receive().await.unwrap();
            channel.send(&Message::reply_to(&msg)).await.unwrap();
            creds
        });

        let mut channel = SecureChannel::establish(client_io, &client_keys).await.unwrap();
        channel
            .send(&Credentials::new("alice", "secret123"))
            .await
            .unwrap();
        channel
            .send(&Message::request("alice", "list", ""))
            .await
            .unwrap();
        let reply: Message = channel.receive().await.unwrap();

        assert_eq!(reply.command, "list");
        assert_eq!(reply.actor, "server");
        assert_eq!(server.await.unwrap().username, "alice");
    }

    #[tokio::test]
    async fn test_frames_are_not_readable_in_clear() {
        let (a, mut b) = duplex(64 * 1024);
        let key = {
            let (mut x, mut y) = duplex(16 * 1024);
            let kx = KeyPair::generate(MIN_KEY_BITS).unwrap();
            let ky = KeyPair::generate(MIN_KEY_BITS).unwrap();
            let peer = tokio::spawn(async move { handshake::perform(&mut y, &ky).await });
            let key = handshake::perform(&mut x, &kx).await.unwrap();
            peer.await.unwrap().unwrap();
            key
        };

        let mut channel = SecureChannel::new(a, &key);
        channel
            .send(&Credentials::new("alice", "secret123"))
            .await
            .unwrap();

        let mut raw = vec![0u8; 64];
        b.read_exact(&mut raw).await.unwrap();
        let raw = &raw[..];
        assert_ne!(&raw[..4], PROTOCOL_MAGIC);
        assert!(!raw.windows(5).any(|w| w == b"alice"));

        // A plain framer on the raw side sees garbage
        let mut rest: &[u8] = raw;
        assert!(MessageFramer::read_message::<_, Credentials>(&mut rest)
            .await
            .is_err());
    }
}
