//! Storage substrate for the rowseek search engine.
//!
//! Everything here lives in memory: ordered index trees made of
//! latched leaf pages, the physical record format, a record/gap lock manager,
//! transactions with read views, the undo version arena and an overflow store
//! for large column values.

pub mod blob;

pub mod btree;

pub mod errors;

pub mod failpoint;

pub mod index;

pub mod lock_manager;

pub mod record;

pub mod table;

pub mod transaction;

pub mod undo;

pub mod value;

pub type PageId = u32;

pub type IndexId = u32;

pub type TransactionId = u64;

pub use errors::{BedrockError, Result};
pub use record::{Field, RecordView};
pub use value::Value;
