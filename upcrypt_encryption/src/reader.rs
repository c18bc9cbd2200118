use bytes::{Buf, BytesMut};
use chacha20poly1305::{aead::stream::DecryptorLE31, ChaCha20Poly1305, Key};
use pin_project::pin_project;
use std::{
    io::ErrorKind,
    pin::Pin,
    task::{ready, Context, Poll},
};
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, ReadBuf};

use crate::{HelperBuf, CIPHERTEXT_OVERHEAD, LENGTH_PREFIX, MAX_CHUNK_SIZE, NONCE_SIZE};

pub trait AsyncReadable: AsyncRead + Send + Unpin {}
impl<T: AsyncRead + Send + Unpin> AsyncReadable for T {}

/// Decrypts a stream produced by [`crate::EncryptedWriter`].
///
/// A chunk that fails authentication yields [`ErrorKind::InvalidData`].
/// A stream that ends in the middle of a chunk yields [`ErrorKind::UnexpectedEof`].
#[pin_project]
pub struct EncryptedReader<T: AsyncReadable> {
    #[pin]
    reader: T,
    decryptor: DecryptorLE31<ChaCha20Poly1305>,
    cleartext: HelperBuf,
    ciphertext: BytesMut,
    scratch: Box<[u8]>,
    is_eof: bool,
}

impl<T: AsyncReadable> EncryptedReader<T> {
    /// Reads the nonce header from `reader` and returns
    /// an [`EncryptedReader`] that decrypts under `key`.
    pub async fn new(mut reader: T, key: &[u8; 32]) -> std::io::Result<Self> {
        let mut nonce = [0; NONCE_SIZE];
        reader.read_exact(&mut nonce).await?;

        let decryptor = DecryptorLE31::new(Key::from_slice(key), &nonce.into());
        Ok(Self {
            reader,
            decryptor,
            cleartext: HelperBuf::with_capacity(MAX_CHUNK_SIZE + CIPHERTEXT_OVERHEAD),
            ciphertext: BytesMut::with_capacity(2 * (LENGTH_PREFIX + MAX_CHUNK_SIZE + CIPHERTEXT_OVERHEAD)),
            scratch: vec![0; MAX_CHUNK_SIZE].into_boxed_slice(),
            is_eof: false,
        })
    }

    /// Decrypts the next chunk buffered in `ciphertext` into `cleartext`.
    /// Returns false if no complete chunk is buffered yet.
    fn decrypt_next_chunk(&mut self) -> std::io::Result<bool> {
        let Some(prefix) = self.ciphertext.get(..LENGTH_PREFIX) else {
            return Ok(false);
        };
        let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;

        if !(CIPHERTEXT_OVERHEAD..=MAX_CHUNK_SIZE + CIPHERTEXT_OVERHEAD).contains(&len) {
            return Err(std::io::Error::new(
                ErrorKind::InvalidData,
                "Chunk length out of range",
            ));
        }

        let Some(msg) = self.ciphertext.get(LENGTH_PREFIX..LENGTH_PREFIX + len) else {
            return Ok(false);
        };

        debug_assert!(self.cleartext.data().is_empty());
        self.cleartext.buf.clear();
        self.cleartext.cursor = 0;
        self.cleartext.buf.extend_from_slice(msg);
        self.ciphertext.advance(LENGTH_PREFIX + len);

        self.decryptor
            .decrypt_next_in_place(&[], &mut self.cleartext.buf)
            .map_err(|_| std::io::Error::new(ErrorKind::InvalidData, "Decryption error"))?;

        Ok(true)
    }

    /// Reads more ciphertext from the inner reader, noting when it ends.
    fn poll_fill_ciphertext(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.project();

        let mut read_buf = ReadBuf::new(&mut this.scratch[..]);
        ready!(this.reader.poll_read(cx, &mut read_buf))?;

        if read_buf.filled().is_empty() {
            *this.is_eof = true;
        } else {
            this.ciphertext.extend_from_slice(read_buf.filled());
        }

        Poll::Ready(Ok(()))
    }

    /// Ready once `cleartext` holds data or the stream cleanly ended.
    fn poll_cleartext(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        while self.cleartext.data().is_empty() {
            if self.decrypt_next_chunk()? {
                continue;
            }

            if self.is_eof {
                if self.ciphertext.is_empty() {
                    break;
                }
                return Poll::Ready(Err(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "Ciphertext ends mid-chunk",
                )));
            }

            ready!(self.as_mut().poll_fill_ciphertext(cx))?;
        }

        Poll::Ready(Ok(()))
    }
}

impl<T: AsyncReadable> AsyncRead for EncryptedReader<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        ready!(self.as_mut().poll_cleartext(cx))?;

        let chunk = self.cleartext.data();
        let num_bytes = std::cmp::min(buf.remaining(), chunk.len());
        buf.put_slice(&chunk[..num_bytes]);
        self.cleartext.advance_cursor(num_bytes);

        Poll::Ready(Ok(()))
    }
}

impl<T: AsyncReadable> AsyncBufRead for EncryptedReader<T> {
    fn poll_fill_buf(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<&[u8]>> {
        ready!(self.as_mut().poll_cleartext(cx))?;
        Poll::Ready(Ok(self.project().cleartext.data()))
    }

    fn consume(mut self: Pin<&mut Self>, amt: usize) {
        self.cleartext.advance_cursor(amt);
    }
}
