//! Row search over MVCC indexes.
//!
//! A [`SearchEngine`] opens a [`SearchContext`] on one index and delivers
//! rows one fetch at a time, in index order, as a caller-supplied
//! [`RowTemplate`] lays them out. Depending on isolation level and lock mode
//! a scan either reads a consistent snapshot through record version chains
//! or takes record, gap and next-key locks as it goes. Scans survive lock
//! waits, voluntary yields and direction changes by storing their cursor
//! position and restoring it on the next call.

pub mod access;

pub mod config;

pub mod context;

pub mod engine;

pub mod errors;

pub mod fetch_cache;

pub mod locking;

pub mod materialize;

pub mod resolver;

pub mod select;

pub mod template;

pub mod tuple;

pub use config::{LockWaitPolicy, SearchConfig};
pub use context::{Exhaustion, ScanRequest, ScanState, ScanStats, SearchContext};
pub use engine::{FetchResult, RowDelivered, SearchEngine};
pub use errors::{Result, ScanOutcome, SearchError, SelectError};
pub use template::{Charset, RowTemplate};
pub use tuple::{MatchMode, PredicateVerdict, RowAccess, ScanDirection, ScanOptions, SearchTuple, SelectLock};
