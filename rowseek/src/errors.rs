use bedrock::lock_manager::{LockError, LockTicket};
use bedrock::BedrockError;
use thiserror::Error;

/// Failures that end a scan call without a row and without a defined place
/// in the scan protocol: API misuse and storage errors.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error(transparent)]
    Storage(#[from] BedrockError),
    #[error("search tuple has {given} fields but index {index} has {max}")]
    TupleTooLong {
        index: String,
        given: usize,
        max: usize,
    },
    #[error("output buffer holds {given} bytes, row template needs {needed}")]
    BufferTooSmall { given: usize, needed: usize },
    #[error("column {0} is not part of the table")]
    UnknownColumn(usize),
    #[error("index {0} does not exist")]
    UnknownIndex(String),
    #[error("invalid row template: {0}")]
    Template(String),
    #[error("scan failed earlier and must be reopened")]
    ScanFailed,
    #[error("version chain of index {index} is longer than {limit}")]
    VersionChainTooLong { index: String, limit: usize },
    #[error(transparent)]
    Lock(#[from] LockError),
}

pub type Result<T> = std::result::Result<T, SearchError>;

/// Why a fetch returned no row.
#[derive(Debug, Error)]
pub enum ScanOutcome {
    /// The cursor ran off the end of the index in the scan direction.
    #[error("end of index")]
    EndOfIndex,
    /// The match range (or the residual predicate's range) is exhausted.
    #[error("no more matching rows")]
    NotFound,
    /// A row lock is queued behind another transaction. Fetch again, or
    /// wait on the ticket, to resume on the same record.
    #[error("waiting for lock ticket {}", .0.id())]
    LockWait(LockTicket),
    #[error("deadlock while waiting for a row lock")]
    Deadlock,
    #[error("row lock wait timed out")]
    LockTimeout,
    /// The scan used up its work allowance. Fetch again to continue.
    #[error("scan yielded")]
    Yielded,
    #[error("index page failed verification")]
    Corrupted,
    #[error("row does not fit the large-value arena")]
    TooLargeRecord,
    #[error(transparent)]
    Failed(#[from] SearchError),
}

impl ScanOutcome {
    /// Outcomes after which fetching in the same direction returns the same
    /// outcome again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanOutcome::EndOfIndex | ScanOutcome::NotFound)
    }
}

impl From<BedrockError> for ScanOutcome {
    fn from(err: BedrockError) -> Self {
        ScanOutcome::Failed(SearchError::Storage(err))
    }
}

/// Errors of the executor layer in [`crate::select`].
#[derive(Debug, Error)]
pub enum SelectError {
    #[error(transparent)]
    Search(#[from] SearchError),
    #[error(transparent)]
    Storage(#[from] BedrockError),
    /// A scan stopped with an outcome the executor cannot absorb.
    #[error("scan on {index} stopped: {outcome}")]
    Scan { index: String, outcome: ScanOutcome },
    #[error("aggregate input has no column {0}")]
    NoSuchColumn(usize),
    #[error("cannot sum non-numeric value {0}")]
    NotNumeric(String),
}
