//! Multi-version visibility.

use bedrock::index::IndexDef;
use bedrock::record::compare_fields;
use bedrock::transaction::ReadView;
use bedrock::{RecordView, TransactionId};
use bytes::Bytes;

use crate::access::VersionSource;
use crate::errors::{Result, SearchError};

/// The version of a record a read view sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Version<'r> {
    /// The record on the page.
    Current(&'r [u8]),
    /// An earlier version from the version arena.
    Prior(Bytes),
}

impl Version<'_> {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Version::Current(bytes) => bytes,
            Version::Prior(bytes) => bytes,
        }
    }

    pub fn is_prior(&self) -> bool {
        matches!(self, Version::Prior(_))
    }
}

pub struct VersionResolver<'a> {
    versions: &'a dyn VersionSource,
    max_chain: usize,
}

impl<'a> VersionResolver<'a> {
    pub fn new(versions: &'a dyn VersionSource, max_chain: usize) -> Self {
        Self { versions, max_chain }
    }

    /// Walks the version chain of a clustered record back to the newest
    /// version `view` sees. `None` when the row did not exist for the view.
    pub fn resolve<'r>(&self, def: &IndexDef, record: &'r [u8], view: &ReadView) -> Result<Option<Version<'r>>> {
        let current = RecordView::parse(record)?;
        if view.changes_visible(current.creator_id()) {
            return Ok(Some(Version::Current(record)));
        }
        let mut next = current.version_pointer();
        let mut steps = 0;
        while let Some(id) = next {
            steps += 1;
            if steps > self.max_chain {
                return Err(SearchError::VersionChainTooLong {
                    index: def.name.clone(),
                    limit: self.max_chain,
                });
            }
            let bytes = self.versions.version(id)?;
            let older = RecordView::parse(&bytes)?;
            if view.changes_visible(older.creator_id()) {
                log::trace!("{}: version {id} visible after {steps} steps", def.name);
                return Ok(Some(Version::Prior(bytes)));
            }
            next = older.version_pointer();
        }
        Ok(None)
    }

    /// Secondary records carry no creator. If nothing on their page changed
    /// since before the oldest transaction the view still considers active,
    /// every record on it is visible as stored.
    pub fn sec_rec_visible(page_max_trx_id: TransactionId, view: &ReadView) -> bool {
        page_max_trx_id < view.up_limit_id()
    }

    /// Whether a secondary entry belongs to this version of the row: every
    /// column the entry carries must hold the same value in the clustered
    /// version. A mismatch means another entry represents the version.
    pub fn sec_rec_is_for_clust_rec(
        sec_def: &IndexDef,
        sec: &RecordView<'_>,
        clust_def: &IndexDef,
        clust: &RecordView<'_>,
    ) -> Result<bool> {
        for (i, column) in sec_def.columns.iter().enumerate() {
            let Some(pos) = clust_def.field_position(column.col_no) else {
                return Ok(false);
            };
            if compare_fields(sec.field(i)?, clust.field(pos)?) != std::cmp::Ordering::Equal {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
