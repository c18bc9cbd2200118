//! Moving an item across a process or storage boundary.
//!
//! [`BufferedItem::into_record`] embeds in-memory content directly and
//! hands a ciphertext file over by path. [`BufferedItem::restore`] replays
//! the content into a new buffer under a new key, then deletes the old file.

use serde::{Deserialize, Serialize};
use std::{
    fmt,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tracing::debug;

use crate::{
    buffer::{Detached, ReadSource},
    item::BufferedItem,
    key::SecretKey,
    Error,
};

/// The content of an [`ItemRecord`].
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordContent {
    /// Nothing was ever written.
    Empty,
    /// Plaintext of an item that stayed in memory.
    Embedded(Vec<u8>),
    /// Ciphertext file of an item that moved to disk.
    External(PathBuf),
}

impl fmt::Debug for RecordContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordContent::Empty => f.write_str("Empty"),
            RecordContent::Embedded(bytes) => write!(f, "Embedded({} bytes)", bytes.len()),
            RecordContent::External(path) => f.debug_tuple("External").field(path).finish(),
        }
    }
}

/// Serializable form of a [`BufferedItem`].
///
/// Holds the item's key, so it must be protected like the content itself.
/// A record with [`RecordContent::External`] owns that file: either restore
/// the record or [`ItemRecord::discard`] it.
#[derive(Debug, Serialize, Deserialize)]
pub struct ItemRecord {
    pub field_name: Option<String>,
    pub content_type: Option<String>,
    pub file_name: Option<String>,
    pub is_form_field: bool,
    pub size_threshold: usize,
    pub repository: Option<PathBuf>,
    pub(crate) key: SecretKey,
    pub(crate) content: RecordContent,
    pub(crate) size: u64,
}

impl ItemRecord {
    pub fn content(&self) -> &RecordContent {
        &self.content
    }

    /// Plaintext size of the recorded content.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        Ok(postcard::to_stdvec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        Ok(postcard::from_bytes(bytes)?)
    }

    /// Deletes the ciphertext file of a record that won't be restored.
    pub async fn discard(self) -> Result<(), Error> {
        if let RecordContent::External(path) = &self.content {
            remove_if_present(path).await?;
        }
        Ok(())
    }
}

impl BufferedItem {
    /// Turns the item into a record, closing its sink first.
    ///
    /// In-memory content is embedded. A ciphertext file is not embedded;
    /// the record takes it over and refers to it by path.
    pub async fn into_record(self) -> Result<ItemRecord, Error> {
        let (key, content, size) = match self.buffer {
            None => (SecretKey::generate(), RecordContent::Empty, 0),
            Some(buffer) => match buffer.detach().await? {
                (key, Detached::Memory(bytes)) => {
                    let size = bytes.len() as u64;
                    (key, RecordContent::Embedded(bytes.to_vec()), size)
                }
                (key, Detached::Disk { path, size }) => (key, RecordContent::External(path), size),
            },
        };

        Ok(ItemRecord {
            field_name: self.field_name,
            content_type: self.content_type,
            file_name: self.file_name,
            is_form_field: self.is_form_field,
            size_threshold: self.size_threshold,
            repository: self.repository,
            key,
            content,
            size,
        })
    }

    /// Rebuilds an item from `record`.
    ///
    /// The repository must still be a directory. The content is written
    /// into a new buffer with a new key; a ciphertext file is decrypted
    /// with the record's key, re-encrypted, and then deleted.
    ///
    /// If the file holds fewer bytes than the record says, this fails
    /// with [`Error::Read`] and the file is left in place.
    pub async fn restore(record: ItemRecord) -> Result<Self, Error> {
        let ItemRecord {
            field_name,
            content_type,
            file_name,
            is_form_field,
            size_threshold,
            repository,
            key,
            content,
            size,
        } = record;

        if let Some(repository) = &repository {
            validate_repository(repository).await?;
        }

        let mut item = BufferedItem::new(
            field_name,
            content_type,
            is_form_field,
            file_name,
            size_threshold,
            repository,
        );

        match content {
            RecordContent::Empty => {}
            RecordContent::Embedded(bytes) => {
                let mut sink = item.write_sink();
                sink.write(&bytes).await?;
                sink.close().await?;
            }
            RecordContent::External(path) => {
                let mut source = ReadSource::decrypting(&path, &key, size)
                    .await
                    .map_err(|err| match err.kind() {
                        ErrorKind::NotFound => Error::NotFound(path.clone()),
                        ErrorKind::InvalidData | ErrorKind::UnexpectedEof => Error::Read(err),
                        _ => Error::IO(err),
                    })?;

                let mut sink = item.write_sink();
                sink.write_from(&mut source).await?;
                sink.close().await?;

                remove_if_present(&path).await?;
            }
        }

        debug!(size = item.size(), in_memory = item.is_in_memory(), "Restored item");
        Ok(item)
    }
}

/// The repository must be a directory and contain no NUL characters.
async fn validate_repository(repository: &Path) -> Result<(), Error> {
    if repository.as_os_str().to_string_lossy().contains('\0') {
        return Err(Error::InvalidRepository {
            path: repository.to_path_buf(),
            reason: "contains a null character",
        });
    }

    match tokio::fs::metadata(repository).await {
        Ok(meta) if meta.is_dir() => Ok(()),
        _ => Err(Error::InvalidRepository {
            path: repository.to_path_buf(),
            reason: "is not a directory",
        }),
    }
}

async fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(err) if err.kind() != ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}
