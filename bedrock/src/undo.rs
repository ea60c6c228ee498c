//! Version arena holding prior row versions.
//!
//! A clustered record's `version_pointer` names the arena entry holding the
//! version it replaced. Entries are immutable once pushed, so a reader can
//! walk a chain without holding any page latch.

use bytes::Bytes;
use parking_lot::RwLock;

use crate::{BedrockError, Result};

pub type VersionId = u64;

#[derive(Debug, Default)]
pub struct VersionArena {
    entries: RwLock<Vec<Bytes>>,
}

impl VersionArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a full prior record image and returns its id.
    pub fn push(&self, record: Bytes) -> VersionId {
        let mut entries = self.entries.write();
        entries.push(record);
        (entries.len() - 1) as VersionId
    }

    pub fn get(&self, id: VersionId) -> Result<Bytes> {
        let entries = self.entries.read();
        usize::try_from(id)
            .ok()
            .and_then(|idx| entries.get(idx))
            .cloned()
            .ok_or(BedrockError::MissingVersion(id))
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
