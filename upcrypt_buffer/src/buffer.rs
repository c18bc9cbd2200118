use bytes::{Bytes, BytesMut};
use pin_project::pin_project;
use std::{
    io::{Cursor, ErrorKind},
    path::{Path, PathBuf},
    pin::Pin,
    task::{ready, Context, Poll},
};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader, ReadBuf},
};
use tracing::{debug, warn};
use upcrypt_encryption::{EncryptedReader, EncryptedWriter, MAX_CHUNK_SIZE};

use crate::{key::SecretKey, Error};

/// Where the buffered bytes currently live.
enum Storage {
    /// Plaintext held in memory, at most `threshold` bytes of it.
    Memory(BytesMut),
    /// Ciphertext in `file`. `writer` is `None` once the sink is closed.
    Disk {
        file: BackingFile,
        writer: Option<EncryptedWriter<File>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SinkState {
    Unopened,
    Open,
    Closed,
    Failed,
}

/// A ciphertext file that is removed when dropped, unless disarmed.
struct BackingFile {
    path: PathBuf,
    armed: bool,
}

impl BackingFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    /// Deletes the file. An already missing file isn't an error.
    async fn remove(&mut self) -> std::io::Result<()> {
        if self.armed {
            match tokio::fs::remove_file(&self.path).await {
                Ok(()) => debug!(path = %self.path.display(), "Removed backing file"),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
            self.armed = false;
        }
        Ok(())
    }

    /// Gives up ownership of the file without deleting it.
    fn disarm(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }
}

impl Drop for BackingFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed backing file on drop"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(path = %self.path.display(), "Couldn't remove backing file: {err}"),
        }
    }
}

/// How a closed buffer's content is handed over when the buffer is taken apart.
pub(crate) enum Detached {
    Memory(Bytes),
    Disk { path: PathBuf, size: u64 },
}

/// Buffers a stream of bytes in memory, moving it to an encrypted
/// file once more than `threshold` bytes have been written.
///
/// Each buffer has its own random key that never leaves the process
/// (except through [`crate::ItemRecord`]). The file only ever holds
/// ciphertext; plaintext never touches the disk.
///
/// [`Self::size`] always reports plaintext bytes written, never the
/// length of the ciphertext file.
pub struct EncryptingDeferredBuffer {
    threshold: usize,
    path: PathBuf,
    key: SecretKey,
    storage: Storage,
    sink: SinkState,
    byte_count: u64,
    cache: Option<Bytes>,
}

impl EncryptingDeferredBuffer {
    /// Creates an empty buffer with a fresh key. Nothing is created at
    /// `path` until the threshold is crossed.
    pub fn new(threshold: usize, path: PathBuf) -> Self {
        debug!(path = %path.display(), threshold, "Created buffer");
        Self {
            threshold,
            path,
            key: SecretKey::generate(),
            storage: Storage::Memory(BytesMut::new()),
            sink: SinkState::Unopened,
            byte_count: 0,
            cache: None,
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Opens the one and only write sink of this buffer.
    pub fn open_write_sink(&mut self) -> Result<WriteSink<'_>, Error> {
        if self.sink != SinkState::Unopened {
            return Err(Error::AlreadyWriting);
        }
        self.sink = SinkState::Open;
        Ok(WriteSink { buffer: self })
    }

    /// Returns a handle to this buffer's sink, opening it on first use.
    pub(crate) fn attach_write_sink(&mut self) -> WriteSink<'_> {
        if self.sink == SinkState::Unopened {
            self.sink = SinkState::Open;
        }
        WriteSink { buffer: self }
    }

    pub fn is_in_memory(&self) -> bool {
        matches!(self.storage, Storage::Memory(_))
    }

    /// Number of plaintext bytes written.
    pub fn size(&self) -> u64 {
        self.byte_count
    }

    /// Path of the ciphertext file, if the content moved to disk.
    pub fn store_location(&self) -> Option<&Path> {
        match self.storage {
            Storage::Memory(_) => None,
            Storage::Disk { .. } => Some(&self.path),
        }
    }

    /// Opens a fresh reader over the plaintext, starting at the beginning.
    ///
    /// Fails with [`Error::NotFound`] if the ciphertext file is gone.
    pub async fn open_read_source(&self) -> Result<ReadSource, Error> {
        if self.sink == SinkState::Failed {
            return Err(Error::Poisoned);
        }
        match &self.storage {
            Storage::Memory(content) => {
                let content = self
                    .cache
                    .clone()
                    .unwrap_or_else(|| Bytes::copy_from_slice(content));
                Ok(ReadSource::Memory(Cursor::new(content)))
            }
            Storage::Disk { .. } => self.open_disk_source().await.map_err(|err| {
                if err.kind() == ErrorKind::NotFound {
                    Error::NotFound(self.path.clone())
                } else {
                    Error::IO(err)
                }
            }),
        }
    }

    /// Returns all the plaintext, decrypting it if needed.
    /// The result is cached for later calls.
    pub async fn get_all_bytes(&mut self) -> Result<Bytes, Error> {
        if self.sink == SinkState::Failed {
            return Err(Error::Poisoned);
        }
        if let Some(cached) = &self.cache {
            return Ok(cached.clone());
        }

        let content = match &self.storage {
            Storage::Memory(content) => Bytes::copy_from_slice(content),
            Storage::Disk { .. } => self.decrypt_all().await.map_err(Error::Read)?,
        };

        self.cache = Some(content.clone());
        Ok(content)
    }

    /// Drops the in-memory content and deletes the ciphertext file.
    /// Afterwards [`Self::size`] is 0. Calling this more than once is fine.
    pub async fn discard(&mut self) -> Result<(), Error> {
        self.cache = None;
        self.byte_count = 0;
        if self.sink == SinkState::Open {
            self.sink = SinkState::Closed;
        }

        match &mut self.storage {
            Storage::Memory(content) => content.clear(),
            Storage::Disk { file, writer } => {
                writer.take();
                file.remove().await?;
            }
        }
        debug!(path = %self.path.display(), "Discarded buffer");
        Ok(())
    }

    /// Closes the sink and splits the buffer into its key and content.
    /// A ciphertext file is handed over to the caller instead of deleted,
    /// along with the number of plaintext bytes it holds.
    pub(crate) async fn detach(mut self) -> Result<(SecretKey, Detached), Error> {
        self.finish().await?;
        if self.sink == SinkState::Failed {
            return Err(Error::Poisoned);
        }

        let content = match self.storage {
            Storage::Memory(content) => Detached::Memory(content.freeze()),
            Storage::Disk { file, .. } => Detached::Disk {
                path: file.disarm(),
                size: self.byte_count,
            },
        };
        Ok((self.key, content))
    }

    async fn open_disk_source(&self) -> std::io::Result<ReadSource> {
        ReadSource::decrypting(&self.path, &self.key, self.byte_count).await
    }

    async fn decrypt_all(&self) -> std::io::Result<Bytes> {
        let mut source = self.open_disk_source().await?;

        let mut plaintext = Vec::with_capacity(usize::try_from(self.byte_count).unwrap_or(0));
        source.read_to_end(&mut plaintext).await?;
        Ok(plaintext.into())
    }

    async fn append(&mut self, bytes: &[u8]) -> Result<(), Error> {
        match self.sink {
            SinkState::Open => {}
            SinkState::Unopened | SinkState::Closed => return Err(Error::SinkClosed),
            SinkState::Failed => return Err(Error::Poisoned),
        }
        if bytes.is_empty() {
            return Ok(());
        }

        self.cache = None;
        let result = self.append_inner(bytes).await;
        if result.is_err() {
            self.sink = SinkState::Failed;
        }
        result
    }

    async fn append_inner(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let total = self.byte_count + bytes.len() as u64;

        match &mut self.storage {
            Storage::Memory(content) if total <= self.threshold as u64 => {
                content.extend_from_slice(bytes);
            }
            Storage::Memory(content) => {
                let content = std::mem::take(content);
                self.spill(content, bytes).await?;
            }
            Storage::Disk {
                writer: Some(writer),
                ..
            } => {
                writer.write_all(bytes).await?;
                writer.flush().await?;
            }
            Storage::Disk { writer: None, .. } => return Err(Error::SinkClosed),
        }

        self.byte_count = total;
        Ok(())
    }

    /// Moves from memory to disk: encrypts `content` followed by `bytes`
    /// into a new file, then keeps the file open for later writes.
    async fn spill(&mut self, content: BytesMut, bytes: &[u8]) -> Result<(), Error> {
        debug!(
            path = %self.path.display(),
            buffered = content.len(),
            incoming = bytes.len(),
            "Threshold crossed, moving content to an encrypted file"
        );

        self.storage = Storage::Disk {
            file: BackingFile::new(self.path.clone()),
            writer: None,
        };

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);
        let file = options.open(&self.path).await?;

        let mut writer = EncryptedWriter::new(file, self.key.expose()).await?;
        writer.write_all(&content).await?;
        writer.write_all(bytes).await?;
        writer.flush().await?;

        if let Storage::Disk { writer: slot, .. } = &mut self.storage {
            *slot = Some(writer);
        }
        Ok(())
    }

    /// Flushes and closes the ciphertext file, if any.
    async fn finish(&mut self) -> Result<(), Error> {
        if self.sink != SinkState::Open {
            return Ok(());
        }

        if let Storage::Disk { writer, .. } = &mut self.storage {
            if let Some(mut writer) = writer.take() {
                if let Err(err) = writer.shutdown().await {
                    self.sink = SinkState::Failed;
                    return Err(err.into());
                }
            }
        }
        self.sink = SinkState::Closed;
        Ok(())
    }
}

/// The write end of an [`EncryptingDeferredBuffer`].
///
/// Holds the buffer mutably, so nothing can read the buffer while writing.
pub struct WriteSink<'a> {
    buffer: &'a mut EncryptingDeferredBuffer,
}

impl WriteSink<'_> {
    /// Appends `bytes`. Once this returns, anything on disk is the
    /// ciphertext of everything written so far.
    ///
    /// After a failed write the buffer is unusable.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.buffer.append(bytes).await
    }

    /// Writes everything from `reader`, returning the number of bytes copied.
    ///
    /// Errors from `reader` are reported as [`Error::Read`].
    pub async fn write_from(&mut self, reader: &mut (impl AsyncRead + Unpin)) -> Result<u64, Error> {
        let mut buf = vec![0; MAX_CHUNK_SIZE];
        let mut copied = 0;
        loop {
            let bytes_read = reader.read(&mut buf).await.map_err(Error::Read)?;
            if bytes_read == 0 {
                return Ok(copied);
            }
            self.write(&buf[..bytes_read]).await?;
            copied += bytes_read as u64;
        }
    }

    /// Plaintext bytes written to the buffer so far.
    pub fn bytes_written(&self) -> u64 {
        self.buffer.size()
    }

    pub fn is_in_memory(&self) -> bool {
        self.buffer.is_in_memory()
    }

    /// Flushes and closes the file, if there is one. Calling this again does nothing.
    pub async fn close(&mut self) -> Result<(), Error> {
        self.buffer.finish().await
    }
}

/// Plaintext of an [`EncryptingDeferredBuffer`], from memory or decrypted from disk.
///
/// A decrypting source knows how many bytes were written. A file that ends
/// before that many bytes decrypt is reported as [`ErrorKind::UnexpectedEof`]
/// instead of a clean end of stream.
#[pin_project(project = ReadSourceProj)]
pub enum ReadSource {
    Memory(#[pin] Cursor<Bytes>),
    Disk {
        #[pin]
        reader: EncryptedReader<BufReader<File>>,
        remaining: u64,
    },
}

impl ReadSource {
    /// Opens the ciphertext file at `path` for decryption with `key`.
    /// `expected` is the number of plaintext bytes the file must hold.
    pub(crate) async fn decrypting(
        path: &Path,
        key: &SecretKey,
        expected: u64,
    ) -> std::io::Result<Self> {
        let file = File::open(path).await?;
        let reader = EncryptedReader::new(BufReader::new(file), key.expose()).await?;
        Ok(Self::Disk {
            reader,
            remaining: expected,
        })
    }
}

impl AsyncRead for ReadSource {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.project() {
            ReadSourceProj::Memory(reader) => reader.poll_read(cx, buf),
            ReadSourceProj::Disk { reader, remaining } => {
                if buf.remaining() == 0 {
                    return Poll::Ready(Ok(()));
                }
                let before = buf.filled().len();
                ready!(reader.poll_read(cx, buf))?;
                let read = (buf.filled().len() - before) as u64;

                if read == 0 && *remaining > 0 {
                    return Poll::Ready(Err(std::io::Error::new(
                        ErrorKind::UnexpectedEof,
                        format!("Ciphertext ended {remaining} bytes short"),
                    )));
                }
                if read > *remaining {
                    return Poll::Ready(Err(std::io::Error::new(
                        ErrorKind::InvalidData,
                        "Ciphertext holds more bytes than were written",
                    )));
                }
                *remaining -= read;
                Poll::Ready(Ok(()))
            }
        }
    }
}
