//! Per-scan state.

use std::sync::Arc;

use bedrock::index::{ColumnDef, ColumnType, IndexDef};
use bedrock::lock_manager::LockTicket;
use bedrock::table::Table;
use bedrock::transaction::Transaction;
use bedrock::Field;
use serde::Serialize;

use crate::access::{IndexCursor, IndexHandle, OverflowFetcher, TransactionContext, VersionSource};
use crate::errors::{Result, ScanOutcome, SearchError};
use crate::fetch_cache::FetchCache;
use crate::locking::{LockCoordinator, ReadKind};
use crate::materialize::BlobArena;
use crate::template::RowTemplate;
use crate::tuple::{ScanDirection, ScanOptions, SearchTuple, SelectLock};

/// Everything `SearchEngine::open` needs to start a scan.
#[derive(Clone)]
pub struct ScanRequest {
    pub(crate) index: Arc<dyn IndexHandle>,
    pub(crate) clustered: Arc<dyn IndexHandle>,
    pub(crate) column_types: Vec<ColumnType>,
    pub(crate) trx: Arc<dyn TransactionContext>,
    pub(crate) versions: Arc<dyn VersionSource>,
    pub(crate) overflow: Arc<dyn OverflowFetcher>,
    pub(crate) tuple: SearchTuple,
    pub(crate) select_lock: SelectLock,
    pub(crate) direction: ScanDirection,
    pub(crate) template: RowTemplate,
    pub(crate) options: ScanOptions,
}

impl ScanRequest {
    /// A full ascending lock-free scan of `index` returning every column.
    /// `clustered` must be the table's clustered index (it may be `index`
    /// itself).
    pub fn new(
        index: Arc<dyn IndexHandle>,
        clustered: Arc<dyn IndexHandle>,
        columns: &[ColumnDef],
        trx: Arc<dyn TransactionContext>,
        versions: Arc<dyn VersionSource>,
        overflow: Arc<dyn OverflowFetcher>,
    ) -> Result<Self> {
        Ok(Self {
            index,
            clustered,
            column_types: columns.iter().map(|c| c.ty).collect(),
            trx,
            versions,
            overflow,
            tuple: SearchTuple::full_scan(),
            select_lock: SelectLock::None,
            direction: ScanDirection::Ascending,
            template: RowTemplate::all(columns)?,
            options: ScanOptions::default(),
        })
    }

    /// Scan of one index of a bedrock table, by short name (`primary` for
    /// the clustered index).
    pub fn on_table(table: &Table, index: &str, trx: Arc<Transaction>) -> Result<Self> {
        let tree = table
            .index(index)
            .ok_or_else(|| SearchError::UnknownIndex(format!("{}.{index}", table.name())))?;
        Self::new(
            Arc::clone(tree) as Arc<dyn IndexHandle>,
            Arc::clone(table.clustered()) as Arc<dyn IndexHandle>,
            table.columns(),
            trx,
            Arc::clone(table.versions()) as Arc<dyn VersionSource>,
            Arc::clone(table.overflow()) as Arc<dyn OverflowFetcher>,
        )
    }

    pub fn tuple(mut self, tuple: SearchTuple) -> Self {
        self.tuple = tuple;
        self
    }

    pub fn lock(mut self, select_lock: SelectLock) -> Self {
        self.select_lock = select_lock;
        self
    }

    pub fn direction(mut self, direction: ScanDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn template(mut self, template: RowTemplate) -> Self {
        self.template = template;
        self
    }

    pub fn options(mut self, options: ScanOptions) -> Self {
        self.options = options;
        self
    }

    pub fn index_def(&self) -> &IndexDef {
        self.index.def()
    }

    pub fn row_template(&self) -> &RowTemplate {
        &self.template
    }

    pub fn scan_direction(&self) -> ScanDirection {
        self.direction
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Exhaustion {
    EndOfIndex,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// Opened; the first fetch positions the cursor from the tuple.
    Idle,
    /// A stored position waits to be restored.
    Positioning,
    /// Inside a fetch call, cursor latched.
    Scanning,
    /// Gave up its work allowance; the position is stored.
    Yielding,
    /// A row lock is queued; the position is stored.
    Waiting(LockTicket),
    Exhausted {
        reason: Exhaustion,
        direction: ScanDirection,
    },
    /// Unrecoverable; only `close` is valid.
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    pub rows_fetched: u64,
    pub records_examined: u64,
    pub clustered_lookups: u64,
    pub lock_waits: u64,
    pub yields: u64,
    pub cache_hits: u64,
    pub cache_fills: u64,
    pub direction_changes: u64,
    pub pages_skipped: u64,
}

/// The state of one open scan. Owned by its caller and driven through
/// [`crate::engine::SearchEngine`].
pub struct SearchContext {
    pub(crate) request: ScanRequest,
    pub(crate) read: ReadKind,
    pub(crate) locks: Option<LockCoordinator>,
    pub(crate) unique_search: bool,
    pub(crate) cursor: Box<dyn IndexCursor>,
    pub(crate) clust_cursor: Option<Box<dyn IndexCursor>>,
    /// Positions of the clustered ordering columns within a scan-index record.
    pub(crate) clust_ref_map: Vec<usize>,
    /// Per template column, the field of a scan-index record carrying it;
    /// `None` if some column is only in the clustered index.
    pub(crate) index_field_map: Option<Vec<usize>>,
    pub(crate) clust_field_map: Vec<usize>,
    pub(crate) needs_clustered: bool,
    pub(crate) cache: FetchCache,
    pub(crate) arena: BlobArena,
    pub(crate) state: ScanState,
    /// The stored position refers to a record already dealt with.
    pub(crate) processed: bool,
    pub(crate) direction: ScanDirection,
    pub(crate) last_delivered: Option<Vec<Field>>,
    /// A failure met while prefetching, reported once the buffered rows
    /// ahead of it have been delivered.
    pub(crate) deferred: Option<ScanOutcome>,
    pub(crate) open_gap_locked: bool,
    pub(crate) first_record: bool,
    pub(crate) stats: ScanStats,
}

impl SearchContext {
    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn stats(&self) -> &ScanStats {
        &self.stats
    }

    pub fn index(&self) -> &IndexDef {
        self.request.index.def()
    }

    pub fn template(&self) -> &RowTemplate {
        &self.request.template
    }

    pub fn direction(&self) -> ScanDirection {
        self.direction
    }

    pub fn read_kind(&self) -> ReadKind {
        self.read
    }

    pub fn is_unique_search(&self) -> bool {
        self.unique_search
    }

    pub fn pending_ticket(&self) -> Option<LockTicket> {
        match self.state {
            ScanState::Waiting(ticket) => Some(ticket),
            _ => None,
        }
    }

    pub fn cached_rows(&self) -> usize {
        self.cache.len()
    }

    /// Large values of the row last delivered.
    pub fn blob_arena(&self) -> &BlobArena {
        &self.arena
    }

    /// Raises (or lowers) the large-value limit, typically after a
    /// `TooLargeRecord` outcome, so the same row can be fetched again.
    pub fn set_blob_limit(&mut self, bytes: usize) {
        self.arena.set_limit(bytes);
    }

    /// Reads a row delivered by this scan back into values.
    pub fn decode_row(&self, row: &[u8]) -> Result<Vec<bedrock::Value>> {
        self.request.template.decode(row, &self.arena)
    }

    pub(crate) fn release_latches(&mut self) {
        self.cursor.release();
        if let Some(clust) = self.clust_cursor.as_mut() {
            clust.release();
        }
    }
}

impl std::fmt::Debug for SearchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchContext")
            .field("index", &self.request.index.def().name)
            .field("state", &self.state)
            .field("direction", &self.direction)
            .field("read", &self.read)
            .field("cached", &self.cache.len())
            .finish()
    }
}
