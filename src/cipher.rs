//! Symmetric Cipher Adapter
//!
//! AES-256 in counter mode (128-bit big-endian counter), used two ways:
//!
//! - **Buffers**: [`encrypt_buffer`] / [`decrypt_buffer`] seal a whole byte
//!   buffer under a fresh random IV that travels in front of the
//!   ciphertext. The client uses these to encrypt files with its per-user
//!   secret before upload, so the server only ever stores ciphertext.
//! - **Streams**: [`CtrStream`] wraps a live duplex byte stream. Reads and
//!   writes are XORed with two independent keystreams that both start at
//!   the beginning of the stream from the same key and IV.
//!
//! Counter mode needs no padding, so records of any length pass through
//! unchanged in size.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// AES-256 key length in bytes
pub const KEY_SIZE: usize = 32;

/// Counter block / IV length in bytes
pub const IV_SIZE: usize = 16;

/// Largest plaintext slice encrypted per `poll_write`
const WRITE_CHUNK: usize = 16 * 1024;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

#[derive(Error, Debug)]
pub enum CipherError {
    #[error("invalid key length: {0} bytes (expected {KEY_SIZE})")]
    InvalidKeyLength(usize),

    #[error("ciphertext too short: {0} bytes (need at least {IV_SIZE})")]
    TruncatedCiphertext(usize),
}

fn keystream(key: &[u8], iv: &[u8]) -> Result<Aes256Ctr, CipherError> {
    Aes256Ctr::new_from_slices(key, iv).map_err(|_| CipherError::InvalidKeyLength(key.len()))
}

/// Encrypt `plaintext` under `key`, returning `IV || ciphertext`
pub fn encrypt_buffer(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>, CipherError> {
    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);

    let mut cipher = keystream(key, &iv)?;

    let mut out = Vec::with_capacity(IV_SIZE + plaintext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(plaintext);
    cipher.apply_keystream(&mut out[IV_SIZE..]);

    Ok(out)
}

/// Reverse [`encrypt_buffer`]
pub fn decrypt_buffer(ciphertext: &[u8], key: &[u8]) -> Result<Vec<u8>, CipherError> {
    if ciphertext.len() < IV_SIZE {
        return Err(CipherError::TruncatedCiphertext(ciphertext.len()));
    }

    let (iv, body) = ciphertext.split_at(IV_SIZE);
    let mut cipher = keystream(key, iv)?;

    let mut plaintext = body.to_vec();
    cipher.apply_keystream(&mut plaintext);

    Ok(plaintext)
}

/// Wrap `inner` so everything read from and written to it is transparently
/// decrypted / encrypted
pub fn wrap_stream<S>(inner: S, key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE]) -> CtrStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    CtrStream::new(inner, key, iv)
}

/// Duplex stream encrypted with AES-256-CTR
///
/// Written bytes are encrypted into an internal buffer as soon as they are
/// accepted, which pins their keystream position; the buffer is drained to
/// the inner stream on the next write, flush or shutdown. A short write by
/// the inner stream therefore never desynchronizes the two counters.
pub struct CtrStream<S> {
    inner: S,
    reader: Aes256Ctr,
    writer: Aes256Ctr,
    pending: Vec<u8>,
    pending_pos: usize,
}

impl<S> CtrStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(inner: S, key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE]) -> Self {
        Self {
            inner,
            reader: Aes256Ctr::new(key.into(), iv.into()),
            writer: Aes256Ctr::new(key.into(), iv.into()),
            pending: Vec::new(),
            pending_pos: 0,
        }
    }

    /// Push buffered ciphertext into the inner stream
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.pending_pos < self.pending.len() {
            let unsent = &self.pending[self.pending_pos..];
            let n = match Pin::new(&mut self.inner).poll_write(cx, unsent) {
                Poll::Ready(Ok(n)) => n,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            };
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.pending_pos += n;
        }

        self.pending.clear();
        self.pending_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S> AsyncRead for CtrStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let already = buf.filled().len();

        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                this.reader.apply_keystream(&mut buf.filled_mut()[already..]);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S> AsyncWrite for CtrStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Pending => return Poll::Pending,
        }

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let take = buf.len().min(WRITE_CHUNK);
        this.pending.extend_from_slice(&buf[..take]);
        this.writer.apply_keystream(&mut this.pending);

        Poll::Ready(Ok(take))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_flush(cx),
            other => other,
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        match this.poll_drain(cx) {
            Poll::Ready(Ok(())) => Pin::new(&mut this.inner).poll_shutdown(cx),
            other => other,
        }
    }
}
