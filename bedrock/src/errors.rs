use thiserror::Error;

use crate::lock_manager::LockError;
use crate::PageId;

#[derive(Debug, Error)]
pub enum BedrockError {
    #[error("malformed record: {0}")]
    MalformedRecord(String),
    #[error("page {page_id} failed checksum verification")]
    PageChecksum { page_id: PageId },
    #[error("page {0} is not part of the index")]
    MissingPage(PageId),
    #[error("cursor is not positioned on a page")]
    CursorNotPositioned,
    #[error("overflow value {0} does not exist")]
    MissingBlob(u64),
    #[error("version {0} is not in the version arena")]
    MissingVersion(u64),
    #[error("duplicate key in index {index}")]
    DuplicateKey { index: String },
    #[error("row not found")]
    RowNotFound,
    #[error("column {col_no} does not accept this value: {reason}")]
    InvalidValue { col_no: usize, reason: String },
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    #[error("failpoint triggered: {0}")]
    Failpoint(String),
    #[error(transparent)]
    Lock(#[from] LockError),
}

pub type Result<T> = std::result::Result<T, BedrockError>;
