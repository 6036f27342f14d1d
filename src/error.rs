use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BurrowError>;

/// Every failure a public operation can report.
#[derive(Debug, Error)]
pub enum BurrowError {
    #[error("invalid database: magic mismatch on both meta pages")]
    InvalidDatabase,
    #[error("database format version differs from this build")]
    VersionMismatch,
    #[error("database is not open")]
    DatabaseNotOpen,
    #[error("database is already open")]
    DatabaseAlreadyOpen,
    #[error("bucket not found")]
    BucketNotFound,
    #[error("bucket already exists")]
    BucketExists,
    #[error("invalid bucket name: {0}")]
    BucketNameInvalid(&'static str),
    #[error("bucket catalog page is full")]
    CatalogFull,
    #[error("key required")]
    KeyRequired,
    #[error("key too large")]
    KeyTooLarge,
    #[error("value too large")]
    ValueTooLarge,
    #[error("transaction closed")]
    TxClosed,
    #[error("transaction is read-only")]
    TxReadOnly,
    #[error("transaction conflict")]
    TxConflict,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("corruption detected: {0}")]
    Corruption(String),
}

impl BurrowError {
    pub(crate) fn corruption(msg: impl Into<String>) -> Self {
        BurrowError::Corruption(msg.into())
    }
}
