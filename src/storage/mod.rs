//! Storage layer: the sled-backed partitioned key-value store and the transaction buffer
//! that stages and atomically commits batches of mutations against it.
//!
//! The document engine never writes to sled directly outside of opening the database; every
//! mutation is staged in a [`Transaction`] and lands through [`Backend::apply`] in one
//! multi-tree sled transaction, so a bulk write is either fully visible or not at all.

pub mod backend;
pub mod txn;

pub use backend::{
    parse_seq_key, seq_key, Backend, BackendConfig, BackendError, BackendResult, BatchOp,
    Partition, ScanOptions,
};
pub use txn::Transaction;

use thiserror::Error;

/// Storage engine errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Encodes a record for a metadata partition.
pub fn encode<T: serde::Serialize>(value: &T) -> StorageResult<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Decodes a record written by [`encode`].
pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> StorageResult<T> {
    Ok(bincode::deserialize(bytes)?)
}
