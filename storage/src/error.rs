use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(#[from] sled::Error),

    #[error("storage codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("storage corrupt: {0}")]
    Corrupt(String),

    #[error("write attempted through a read-only cursor")]
    ReadOnlyCursor,
}
