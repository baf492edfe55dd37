use thiserror::Error;

#[derive(Error, Debug)]
pub enum MempoolError {
    #[error(transparent)]
    Storage(#[from] storage::StorageError),
}
