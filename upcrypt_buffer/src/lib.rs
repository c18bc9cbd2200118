//! # upcrypt-buffer
//! Holds uploaded bytes in memory until they cross a size threshold,
//! then moves them into a temporary file that only ever holds ciphertext.
//!
//! ```no_run
//! # async fn run() -> Result<(), upcrypt_buffer::Error> {
//! use upcrypt_buffer::ItemFactory;
//!
//! let factory = ItemFactory::new(100, None);
//! let mut item = factory.create_item(Some("upload".into()), None, false, Some("a.txt".into()));
//!
//! let mut sink = item.write_sink();
//! sink.write(&[b'A'; 150]).await?;
//! sink.close().await?;
//!
//! assert!(!item.is_in_memory());
//! assert_eq!(item.size(), 150);
//! assert_eq!(item.read_all().await?.len(), 150);
//! item.delete().await?;
//! # Ok(())
//! # }
//! ```

mod buffer;
mod charset;
mod factory;
mod item;
mod key;
mod record;
mod temp_path;


use std::path::PathBuf;
use thiserror::Error;

pub use buffer::{EncryptingDeferredBuffer, ReadSource, WriteSink};
pub use charset::{Charset, DEFAULT_CHARSET};
pub use factory::{ItemFactory, DEFAULT_SIZE_THRESHOLD};
pub use item::BufferedItem;
pub use key::SecretKey;
pub use record::{ItemRecord, RecordContent};
pub use temp_path::unique_temp_path;

#[derive(Error, Debug)]
pub enum Error {
    #[error("A write sink was already opened for this buffer")]
    AlreadyWriting,

    #[error("The write sink is closed")]
    SinkClosed,

    #[error("IO Error: {0}")]
    IO(#[from] std::io::Error),

    #[error("Couldn't read back buffered content: {0}")]
    Read(#[source] std::io::Error),

    #[error("Backing file {0:?} not found")]
    NotFound(PathBuf),

    #[error("A previous write failed, so this buffer can't be used")]
    Poisoned,

    #[error("The repository {path:?} {reason}")]
    InvalidRepository { path: PathBuf, reason: &'static str },

    #[error("Cannot write uploaded content to disk: nothing was buffered")]
    WriteTargetUnavailable,

    #[error("Unsupported charset: {0}")]
    UnsupportedCharset(String),

    #[error("Invalid file name: {0:?}")]
    InvalidFileName(String),

    #[error("Error with encoding/decoding record: {0}")]
    Postcard(#[from] postcard::Error),
}
