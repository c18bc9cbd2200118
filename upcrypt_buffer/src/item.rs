use bytes::Bytes;
use std::{
    fmt,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tokio::{fs::File, io::AsyncWriteExt};
use tracing::debug;

use crate::{
    buffer::{EncryptingDeferredBuffer, ReadSource, WriteSink},
    charset::{charset_param, Charset, DEFAULT_CHARSET},
    temp_path::unique_temp_path,
    Error,
};

/// One uploaded item: form metadata plus its content, which lives in
/// an [`EncryptingDeferredBuffer`] created on the first write.
///
/// Call [`Self::delete`] once the item is no longer needed. If that
/// never happens the ciphertext file is still removed on drop.
pub struct BufferedItem {
    pub(crate) field_name: Option<String>,
    pub(crate) content_type: Option<String>,
    pub(crate) file_name: Option<String>,
    pub(crate) is_form_field: bool,
    pub(crate) size_threshold: usize,
    pub(crate) repository: Option<PathBuf>,
    pub(crate) buffer: Option<EncryptingDeferredBuffer>,
}

impl BufferedItem {
    /// Creates an empty item. Content over `size_threshold` bytes is
    /// stored encrypted in `repository`, or the system temp directory if `None`.
    pub fn new(
        field_name: Option<String>,
        content_type: Option<String>,
        is_form_field: bool,
        file_name: Option<String>,
        size_threshold: usize,
        repository: Option<PathBuf>,
    ) -> Self {
        Self {
            field_name,
            content_type,
            is_form_field,
            file_name,
            size_threshold,
            repository,
            buffer: None,
        }
    }

    /// Returns the sink for this item's content.
    ///
    /// The buffer, with its key and temp path, is created on the first call.
    /// Later calls hand back the same sink rather than a second stream.
    pub fn write_sink(&mut self) -> WriteSink<'_> {
        let threshold = self.size_threshold;
        let repository = self.repository.as_deref();
        self.buffer
            .get_or_insert_with(|| {
                EncryptingDeferredBuffer::new(threshold, unique_temp_path(repository))
            })
            .attach_write_sink()
    }

    /// Returns all the content. Fails rather than returning nothing if
    /// the content can't be decrypted or read.
    pub async fn read_all(&mut self) -> Result<Bytes, Error> {
        match &mut self.buffer {
            Some(buffer) => buffer.get_all_bytes().await,
            None => Ok(Bytes::new()),
        }
    }

    /// Opens a new reader over the content.
    pub async fn open_read_source(&self) -> Result<ReadSource, Error> {
        match &self.buffer {
            Some(buffer) => buffer.open_read_source().await,
            None => Ok(ReadSource::Memory(std::io::Cursor::new(Bytes::new()))),
        }
    }

    /// Returns the content decoded with the charset named `charset`.
    pub async fn read_as_text(&mut self, charset: &str) -> Result<String, Error> {
        let charset: Charset = charset.parse()?;
        Ok(charset.decode(&self.read_all().await?))
    }

    /// Returns the content decoded with the charset of the content type,
    /// or [`DEFAULT_CHARSET`] if there is none. Unsupported charsets fall back to UTF-8.
    pub async fn read_string(&mut self) -> Result<String, Error> {
        let charset = match self.charset() {
            Some(name) => name.parse().unwrap_or(Charset::Utf8),
            None => DEFAULT_CHARSET,
        };
        Ok(charset.decode(&self.read_all().await?))
    }

    /// Writes the plaintext content to `destination`.
    ///
    /// Content on disk is decrypted into `destination`. The ciphertext file is
    /// left in place, so this can be called any number of times.
    /// A partially written `destination` is removed on failure.
    pub async fn write_to(&mut self, destination: &Path) -> Result<(), Error> {
        let Some(buffer) = self.buffer.as_mut() else {
            return Err(Error::WriteTargetUnavailable);
        };

        if buffer.is_in_memory() {
            let content = buffer.get_all_bytes().await?;
            tokio::fs::write(destination, &content).await?;
            return Ok(());
        }

        let mut source = buffer.open_read_source().await?;
        let mut file = File::create(destination).await?;

        let copied = async {
            let copied = tokio::io::copy(&mut source, &mut file).await?;
            file.flush().await?;
            if copied != buffer.size() {
                return Err(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    format!("Decrypted {copied} bytes, but {} were written", buffer.size()),
                ));
            }
            Ok(copied)
        }
        .await;

        match copied {
            Ok(copied) => {
                debug!(destination = %destination.display(), copied, "Wrote decrypted content");
                Ok(())
            }
            Err(err) => {
                drop(file);
                if let Err(remove_err) = tokio::fs::remove_file(destination).await {
                    debug!(destination = %destination.display(), "Couldn't remove partial output: {remove_err}");
                }
                match err.kind() {
                    ErrorKind::InvalidData | ErrorKind::UnexpectedEof => Err(Error::Read(err)),
                    _ => Err(Error::IO(err)),
                }
            }
        }
    }

    /// Drops the content, deleting any ciphertext file.
    /// Afterwards the item behaves as if nothing was ever written.
    pub async fn delete(&mut self) -> Result<(), Error> {
        if let Some(mut buffer) = self.buffer.take() {
            buffer.discard().await?;
        }
        Ok(())
    }

    /// Path of the ciphertext file, or `None` while the content is in memory.
    pub fn store_location(&self) -> Option<&Path> {
        self.buffer.as_ref()?.store_location()
    }

    /// Plaintext size in bytes.
    pub fn size(&self) -> u64 {
        self.buffer.as_ref().map_or(0, EncryptingDeferredBuffer::size)
    }

    pub fn is_in_memory(&self) -> bool {
        self.buffer
            .as_ref()
            .map_or(true, EncryptingDeferredBuffer::is_in_memory)
    }

    pub fn field_name(&self) -> Option<&str> {
        self.field_name.as_deref()
    }

    pub fn set_field_name(&mut self, field_name: impl Into<String>) {
        self.field_name = Some(field_name.into());
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// The `charset` parameter of the content type, lowercased.
    pub fn charset(&self) -> Option<String> {
        charset_param(self.content_type.as_deref()?)
    }

    /// The original file name on the client.
    ///
    /// Names containing a NUL character are rejected, since they are
    /// often a sign of an attempt to truncate the name.
    pub fn name(&self) -> Result<Option<&str>, Error> {
        match self.file_name.as_deref() {
            Some(name) if name.contains('\0') => Err(Error::InvalidFileName(name.to_string())),
            name => Ok(name),
        }
    }

    pub fn is_form_field(&self) -> bool {
        self.is_form_field
    }

    pub fn set_form_field(&mut self, is_form_field: bool) {
        self.is_form_field = is_form_field;
    }

    pub fn size_threshold(&self) -> usize {
        self.size_threshold
    }

    pub fn repository(&self) -> Option<&Path> {
        self.repository.as_deref()
    }
}

impl fmt::Display for BufferedItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "name={:?}, store_location={:?}, size={} bytes, is_form_field={}, field_name={:?}",
            self.file_name,
            self.store_location(),
            self.size(),
            self.is_form_field,
            self.field_name
        )
    }
}
