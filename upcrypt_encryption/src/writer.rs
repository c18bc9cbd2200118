use bytes::BytesMut;
use chacha20poly1305::{aead::stream::EncryptorLE31, ChaCha20Poly1305, Key};
use pin_project::pin_project;
use std::{
    io::ErrorKind,
    pin::Pin,
    task::{ready, Context, Poll},
};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::{HelperBuf, CIPHERTEXT_OVERHEAD, LENGTH_PREFIX, MAX_CHUNK_SIZE, NONCE_SIZE};

pub trait AsyncWritable: AsyncWrite + Send + Unpin {}
impl<T: AsyncWrite + Send + Unpin> AsyncWritable for T {}

/// Encrypts everything written to it into the inner writer.
///
/// Plaintext is collected until a chunk of [`MAX_CHUNK_SIZE`] bytes is full.
/// Flushing seals whatever was collected, so once `flush` returns the inner
/// writer has received the ciphertext of every byte written so far.
#[pin_project]
pub struct EncryptedWriter<T: AsyncWritable> {
    #[pin]
    writer: T,
    encryptor: EncryptorLE31<ChaCha20Poly1305>,
    /// Plaintext that hasn't been sealed yet.
    plaintext: BytesMut,
    /// Sealed chunks that haven't reached `writer` yet.
    sealed: HelperBuf,
}

impl<T: AsyncWritable> EncryptedWriter<T> {
    /// Writes a fresh random nonce to `writer` and returns
    /// an [`EncryptedWriter`] that encrypts under `key`.
    pub async fn new(mut writer: T, key: &[u8; 32]) -> std::io::Result<Self> {
        let nonce: [u8; NONCE_SIZE] = rand::random();

        writer.write_all(&nonce).await?;
        let encryptor = EncryptorLE31::new(Key::from_slice(key), &nonce.into());
        Ok(Self {
            writer,
            encryptor,
            plaintext: BytesMut::with_capacity(MAX_CHUNK_SIZE + CIPHERTEXT_OVERHEAD),
            sealed: HelperBuf::with_capacity(LENGTH_PREFIX + MAX_CHUNK_SIZE + CIPHERTEXT_OVERHEAD),
        })
    }

    /// Returns the inner writer. Anything not yet flushed is lost.
    pub fn into_inner(self) -> T {
        self.writer
    }

    /// Moves the collected plaintext into `sealed` as one encrypted chunk.
    fn seal(&mut self) -> std::io::Result<()> {
        if self.plaintext.is_empty() {
            return Ok(());
        }

        self.encryptor
            .encrypt_next_in_place(&[], &mut self.plaintext)
            .map_err(|_| std::io::Error::new(ErrorKind::InvalidData, "Encryption error"))?;

        let len = u32::try_from(self.plaintext.len())
            .map_err(|_| std::io::Error::new(ErrorKind::InvalidData, "Chunk too long"))?;

        self.sealed.buf.extend_from_slice(&len.to_be_bytes());
        self.sealed.buf.extend_from_slice(&self.plaintext);
        self.plaintext.clear();
        Ok(())
    }

    /// Hands all sealed chunks to the inner writer.
    fn poll_drain(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let mut this = self.project();

        while !this.sealed.data().is_empty() {
            let bytes_wrote = ready!(this.writer.as_mut().poll_write(cx, this.sealed.data()))?;
            if bytes_wrote == 0 {
                return Poll::Ready(Err(ErrorKind::WriteZero.into()));
            }
            this.sealed.advance_cursor(bytes_wrote);
        }

        Poll::Ready(Ok(()))
    }
}

impl<T: AsyncWritable> AsyncWrite for EncryptedWriter<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        ready!(self.as_mut().poll_drain(cx))?;

        let bytes_taken = std::cmp::min(buf.len(), MAX_CHUNK_SIZE - self.plaintext.len());
        self.plaintext.extend_from_slice(&buf[..bytes_taken]);

        if self.plaintext.len() == MAX_CHUNK_SIZE {
            self.seal()?;
        }

        Poll::Ready(Ok(bytes_taken))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.seal()?;
        ready!(self.as_mut().poll_drain(cx))?;
        self.project().writer.poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        ready!(self.as_mut().poll_flush(cx))?;
        self.project().writer.poll_shutdown(cx)
    }
}
