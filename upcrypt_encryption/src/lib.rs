//! Chunked ChaCha20-Poly1305 streams over tokio readers and writers.
//!
//! A stream starts with a random [`NONCE_SIZE`]-byte nonce. After that come
//! chunks, each a big endian `u32` length followed by that many bytes of
//! ciphertext. Every chunk carries its own [`CIPHERTEXT_OVERHEAD`]-byte tag,
//! so ciphertext is always longer than the plaintext it protects.

mod reader;
mod writer;

#[cfg(test)]
mod tests;

use bytes::BytesMut;
pub use reader::EncryptedReader;
pub use writer::EncryptedWriter;

/// Largest amount of plaintext sealed into a single chunk.
pub const MAX_CHUNK_SIZE: usize = 8 * 1024;

/// Authentication tag appended to each chunk.
pub const CIPHERTEXT_OVERHEAD: usize = 16;

/// Length of the nonce header.
pub const NONCE_SIZE: usize = 8;

const LENGTH_PREFIX: usize = 4;

/// Bytes with a read cursor, drained from the front.
struct HelperBuf {
    buf: BytesMut,
    cursor: usize,
}

impl HelperBuf {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            cursor: 0,
        }
    }

    fn advance_cursor(&mut self, num_bytes: usize) {
        self.cursor += num_bytes;
        assert!(self.cursor <= self.buf.len());

        if self.cursor == self.buf.len() {
            self.cursor = 0;
            self.buf.clear();
        }
    }

    fn data(&self) -> &[u8] {
        &self.buf[self.cursor..]
    }
}
