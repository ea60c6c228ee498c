//! Overflow store for column values too large to keep inline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::RwLock;

use crate::record::BlobRef;
use crate::{BedrockError, Result};

/// Values longer than this are moved out of the record by default.
pub const DEFAULT_INLINE_LIMIT: usize = 256;

#[derive(Debug)]
pub struct OverflowStore {
    next_id: AtomicU64,
    values: RwLock<HashMap<u64, Bytes>>,
    inline_limit: usize,
}

impl Default for OverflowStore {
    fn default() -> Self {
        Self::new(DEFAULT_INLINE_LIMIT)
    }
}

impl OverflowStore {
    pub fn new(inline_limit: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            values: RwLock::new(HashMap::new()),
            inline_limit,
        }
    }

    pub fn inline_limit(&self) -> usize {
        self.inline_limit
    }

    pub fn should_externalize(&self, len: usize) -> bool {
        len > self.inline_limit
    }

    pub fn store(&self, value: Bytes) -> Result<BlobRef> {
        let len = u32::try_from(value.len()).map_err(|_| {
            BedrockError::Unsupported(format!("overflow value of {} bytes", value.len()))
        })?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.values.write().insert(id, value);
        log::trace!("stored overflow value {id} ({len} bytes)");
        Ok(BlobRef { id, len })
    }

    pub fn fetch(&self, blob: BlobRef) -> Result<Bytes> {
        self.values
            .read()
            .get(&blob.id)
            .cloned()
            .ok_or(BedrockError::MissingBlob(blob.id))
    }
}
