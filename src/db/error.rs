use thiserror::Error;

use crate::revs::RevError;
use crate::scheduler::SchedulerError;
use crate::storage::{BackendError, StorageError};

/// Errors surfaced by the document engine.
#[derive(Error, Debug)]
pub enum DbError {
    /// No such document, revision or attachment. The payload says which ("missing", "deleted").
    #[error("Document not found: {0}")]
    MissingDoc(String),

    #[error("Document update conflict")]
    RevisionConflict,

    #[error("Unknown stub attachment: {0}")]
    MissingAttachmentStub(String),

    #[error("Bad argument: {0}")]
    BadArgument(String),

    #[error("Database is not open")]
    NotOpen,

    #[error("Invalid revision: {0}")]
    InvalidRev(String),

    #[error("Invalid document: {0}")]
    InvalidDoc(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type DbResult<T> = Result<T, DbError>;

impl DbError {
    /// HTTP-style status code for the error.
    pub fn status(&self) -> u16 {
        match self {
            DbError::MissingDoc(_) => 404,
            DbError::RevisionConflict => 409,
            DbError::MissingAttachmentStub(_) | DbError::NotOpen => 412,
            DbError::BadArgument(_) | DbError::InvalidRev(_) | DbError::InvalidDoc(_) => 400,
            DbError::Storage(_) | DbError::Serialization(_) => 500,
        }
    }

    pub(crate) fn missing() -> Self {
        DbError::MissingDoc("missing".to_string())
    }

    pub(crate) fn deleted() -> Self {
        DbError::MissingDoc("deleted".to_string())
    }
}

impl From<BackendError> for DbError {
    fn from(err: BackendError) -> Self {
        DbError::Storage(StorageError::Backend(err))
    }
}

impl From<SchedulerError> for DbError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::NotOpen => DbError::NotOpen,
        }
    }
}

impl From<RevError> for DbError {
    fn from(err: RevError) -> Self {
        match err {
            RevError::Invalid(rev) => DbError::InvalidRev(rev),
        }
    }
}
