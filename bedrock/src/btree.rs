//! In-memory ordered index tree.
//!
//! Leaves are linked left to right and carry low/high fences. A sparse
//! directory of low fences stands in for the internal levels; a reader that
//! reached a leaf through a stale directory entry moves right until the high
//! fence covers its key. Latch order is directory, then leaf, then leaves
//! strictly left to right; moving to a left neighbour releases the current
//! leaf and searches again.

use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, RawRwLock, RwLock};
use serde::{Deserialize, Serialize};

use crate::failpoint;
use crate::index::IndexDef;
use crate::record::{Field, RecordView};
use crate::{BedrockError, PageId, Result, TransactionId};

pub type PageRef = Arc<RwLock<LeafPage>>;
type PageReadGuard = ArcRwLockReadGuard<RawRwLock, LeafPage>;
type PageWriteGuard = ArcRwLockWriteGuard<RawRwLock, LeafPage>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Records per leaf before it splits.
    pub leaf_capacity: usize,
    /// Verify the page checksum every time a cursor latches a leaf.
    pub verify_checksums: bool,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            leaf_capacity: 64,
            verify_checksums: true,
        }
    }
}

/// How a cursor positions itself relative to a search tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SearchMode {
    GreaterOrEqual,
    Greater,
    LessOrEqual,
    Less,
}

impl SearchMode {
    fn is_forward(self) -> bool {
        matches!(self, SearchMode::GreaterOrEqual | SearchMode::Greater)
    }
}

pub struct LeafPage {
    id: PageId,
    records: Vec<Bytes>,
    low: Option<Bytes>,
    high: Option<Bytes>,
    next: Option<PageRef>,
    modify_clock: u64,
    max_trx_id: TransactionId,
    checksum: u32,
}

impl fmt::Debug for LeafPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeafPage")
            .field("id", &self.id)
            .field("records", &self.records.len())
            .field("has_next", &self.next.is_some())
            .field("modify_clock", &self.modify_clock)
            .field("max_trx_id", &self.max_trx_id)
            .finish()
    }
}

impl LeafPage {
    fn empty(id: PageId) -> Self {
        let mut page = Self {
            id,
            records: Vec::new(),
            low: None,
            high: None,
            next: None,
            modify_clock: 0,
            max_trx_id: 0,
            checksum: 0,
        };
        page.checksum = page.compute_checksum();
        page
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn records(&self) -> &[Bytes] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_last(&self) -> bool {
        self.next.is_none()
    }

    /// Bumped whenever slots on the page shift.
    pub fn modify_clock(&self) -> u64 {
        self.modify_clock
    }

    /// Largest transaction id that modified this page.
    pub fn max_trx_id(&self) -> TransactionId {
        self.max_trx_id
    }

    fn compute_checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.id.to_le_bytes());
        hasher.update(&self.max_trx_id.to_le_bytes());
        for fence in [&self.low, &self.high] {
            match fence {
                Some(bytes) => {
                    hasher.update(&[1]);
                    hasher.update(bytes);
                }
                None => hasher.update(&[0]),
            }
        }
        for record in &self.records {
            hasher.update(&(record.len() as u32).to_le_bytes());
            hasher.update(record);
        }
        hasher.finalize()
    }

    fn seal(&mut self) {
        if failpoint::is_enabled(failpoint::LEAF_SKIP_CHECKSUM) {
            log::warn!("failpoint: leaving checksum of leaf {} stale", self.id);
            return;
        }
        self.checksum = self.compute_checksum();
    }

    pub fn verify(&self) -> Result<()> {
        if self.checksum != self.compute_checksum() {
            return Err(BedrockError::PageChecksum { page_id: self.id });
        }
        Ok(())
    }
}

struct DirEntry {
    low: Option<Bytes>,
    page: PageRef,
}

/// Index of the first element for which `pred` is false, given that `pred`
/// holds for a prefix of `records`.
fn partition_point<F>(records: &[Bytes], mut pred: F) -> Result<usize>
where
    F: FnMut(&[u8]) -> Result<bool>,
{
    let (mut lo, mut hi) = (0, records.len());
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if pred(&records[mid])? {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    Ok(lo)
}

pub struct IndexTree {
    def: IndexDef,
    config: TreeConfig,
    directory: RwLock<Vec<DirEntry>>,
    next_page_id: AtomicU32,
}

impl fmt::Debug for IndexTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexTree")
            .field("index", &self.def.name)
            .field("pages", &self.page_count())
            .finish()
    }
}

impl IndexTree {
    pub fn new(def: IndexDef, config: TreeConfig) -> Arc<Self> {
        let root = Arc::new(RwLock::new(LeafPage::empty(1)));
        Arc::new(Self {
            def,
            config,
            directory: RwLock::new(vec![DirEntry {
                low: None,
                page: root,
            }]),
            next_page_id: AtomicU32::new(2),
        })
    }

    pub fn def(&self) -> &IndexDef {
        &self.def
    }

    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    pub fn page_count(&self) -> usize {
        self.directory.read().len()
    }

    pub fn cursor(self: &Arc<Self>) -> Cursor {
        Cursor {
            tree: Arc::clone(self),
            page: None,
            guard: None,
            slot: CursorSlot::Infimum,
            stored: None,
        }
    }

    /// True when `record` lies before the boundary a search in `mode` looks
    /// for. The predicate holds for a prefix of the index.
    fn is_before(&self, tuple: &[Field], mode: SearchMode, record: &[u8]) -> Result<bool> {
        let view = RecordView::parse(record)?;
        let ord = self.def.compare_tuple(tuple, &view)?;
        Ok(match mode {
            SearchMode::GreaterOrEqual | SearchMode::Less => ord == Ordering::Greater,
            SearchMode::Greater | SearchMode::LessOrEqual => ord != Ordering::Less,
        })
    }

    fn directory_lookup(&self, tuple: &[Field], mode: SearchMode) -> Result<PageRef> {
        let dir = self.directory.read();
        let (mut lo, mut hi) = (1, dir.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let before = match &dir[mid].low {
                Some(low) => self.is_before(tuple, mode, low)?,
                None => true,
            };
            if before {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(Arc::clone(&dir[lo - 1].page))
    }

    /// Latches (shared) the leaf where a search in `mode` ends.
    fn locate(&self, tuple: &[Field], mode: SearchMode) -> Result<(PageRef, PageReadGuard)> {
        let mut page = self.directory_lookup(tuple, mode)?;
        let mut guard = page.read_arc();
        loop {
            let step = match (&guard.high, &guard.next) {
                (Some(high), Some(next)) if self.is_before(tuple, mode, high)? => Arc::clone(next),
                _ => break,
            };
            let next_guard = step.read_arc();
            guard = next_guard;
            page = step;
        }
        Ok((page, guard))
    }

    fn locate_for_write(&self, key: &[Field]) -> Result<PageWriteGuard> {
        let page = self.directory_lookup(key, SearchMode::Greater)?;
        let mut guard = page.write_arc();
        loop {
            let step = match (&guard.high, &guard.next) {
                (Some(high), Some(next)) if self.is_before(key, SearchMode::Greater, high)? => {
                    Arc::clone(next)
                }
                _ => break,
            };
            let next_guard = step.write_arc();
            guard = next_guard;
        }
        Ok(guard)
    }

    fn key_of(&self, record: &[u8]) -> Result<Vec<Field>> {
        self.def.ordering_key(&RecordView::parse(record)?)
    }

    fn verify(&self, page: &LeafPage) -> Result<()> {
        if self.config.verify_checksums {
            page.verify()?;
        }
        Ok(())
    }

    /// Slot holding exactly `key`, if any.
    fn find_slot(&self, page: &LeafPage, key: &[Field]) -> Result<(usize, bool)> {
        let pos = partition_point(&page.records, |r| {
            self.is_before(key, SearchMode::GreaterOrEqual, r)
        })?;
        let found = match page.records.get(pos) {
            Some(r) => self.is_before(key, SearchMode::Greater, r)?,
            None => false,
        };
        Ok((pos, found))
    }

    pub fn insert(&self, record: Bytes, trx_id: TransactionId) -> Result<()> {
        let key = self.key_of(&record)?;
        let mut guard = self.locate_for_write(&key)?;
        let (pos, found) = self.find_slot(&guard, &key)?;
        if found {
            return Err(BedrockError::DuplicateKey {
                index: self.def.name.clone(),
            });
        }
        guard.records.insert(pos, record);
        guard.modify_clock += 1;
        guard.max_trx_id = guard.max_trx_id.max(trx_id);
        if guard.records.len() > self.config.leaf_capacity {
            self.split(guard);
        } else {
            guard.seal();
        }
        Ok(())
    }

    fn split(&self, mut guard: PageWriteGuard) {
        let mid = guard.records.len() / 2;
        let moved = guard.records.split_off(mid);
        let low = moved[0].clone();
        let new_id = self.next_page_id.fetch_add(1, AtomicOrdering::SeqCst);
        let mut right = LeafPage {
            id: new_id,
            records: moved,
            low: Some(low.clone()),
            high: guard.high.take(),
            next: guard.next.take(),
            modify_clock: 0,
            max_trx_id: guard.max_trx_id,
            checksum: 0,
        };
        right.seal();
        let right = Arc::new(RwLock::new(right));
        guard.high = Some(low.clone());
        guard.next = Some(Arc::clone(&right));
        guard.modify_clock += 1;
        guard.seal();
        let left_id = guard.id;
        drop(guard);

        let mut dir = self.directory.write();
        let pos = dir
            .iter()
            .skip(1)
            .position(|entry| match &entry.low {
                Some(existing) => !self.fence_before(existing, &low),
                None => false,
            })
            .map_or(dir.len(), |p| p + 1);
        dir.insert(
            pos,
            DirEntry {
                low: Some(low),
                page: right,
            },
        );
        log::debug!(
            "split leaf {left_id} of index {} into {new_id} ({} leaves)",
            self.def.name,
            dir.len()
        );
    }

    fn fence_before(&self, a: &[u8], b: &[u8]) -> bool {
        match (RecordView::parse(a), RecordView::parse(b)) {
            (Ok(a), Ok(b)) => matches!(self.def.compare_records(&a, &b), Ok(Ordering::Less)),
            _ => false,
        }
    }

    /// Replaces the record carrying the same ordering key. Slots do not
    /// shift, so the modify clock is left alone.
    pub fn update_in_place(&self, record: Bytes, trx_id: TransactionId) -> Result<()> {
        let key = self.key_of(&record)?;
        let mut guard = self.locate_for_write(&key)?;
        let (pos, found) = self.find_slot(&guard, &key)?;
        if !found {
            return Err(BedrockError::RowNotFound);
        }
        guard.records[pos] = record;
        guard.max_trx_id = guard.max_trx_id.max(trx_id);
        guard.seal();
        Ok(())
    }

    /// Physically removes the record with `key`.
    pub fn remove(&self, key: &[Field]) -> Result<bool> {
        let mut guard = self.locate_for_write(key)?;
        let (pos, found) = self.find_slot(&guard, key)?;
        if !found {
            return Ok(false);
        }
        guard.records.remove(pos);
        guard.modify_clock += 1;
        guard.seal();
        Ok(true)
    }

    /// Exact lookup on the full ordering key.
    pub fn find(&self, key: &[Field]) -> Result<Option<Bytes>> {
        let (_, guard) = self.locate(key, SearchMode::Greater)?;
        let (pos, found) = self.find_slot(&guard, key)?;
        Ok(found.then(|| guard.records[pos].clone()))
    }

    /// Every record in index order. Walks the leaf chain with latch coupling.
    pub fn records(&self) -> Vec<Bytes> {
        let first = Arc::clone(&self.directory.read()[0].page);
        let mut out = Vec::new();
        let mut guard = first.read_arc();
        loop {
            out.extend(guard.records.iter().cloned());
            let Some(next) = guard.next.clone() else {
                break;
            };
            let next_guard = next.read_arc();
            guard = next_guard;
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorSlot {
    Infimum,
    User(usize),
    Supremum,
}

/// What the cursor is on. User records borrow from the latched page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorRecord<'a> {
    Infimum,
    Supremum,
    User(&'a [u8]),
}

/// Owned counterpart of [`CursorRecord`], used for look-ahead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotRecord {
    Infimum,
    Supremum,
    User(Bytes),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelativePosition {
    Before,
    On,
    After,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreOutcome {
    /// Where the cursor now is relative to the stored position.
    pub relative: RelativePosition,
    /// Whether the cursor landed on a user record.
    pub valid: bool,
}

#[derive(Debug, Clone)]
enum StoredPoint {
    On(Vec<Field>),
    Before(Vec<Field>),
    After(Vec<Field>),
    Start,
    End,
}

#[derive(Debug, Clone)]
struct StoredPosition {
    optimistic: Option<(PageRef, u64, usize)>,
    point: StoredPoint,
}

/// A positioned handle into one index. While positioned it holds a shared
/// latch on its leaf; `release` gives the latch up and only a stored
/// position survives.
pub struct Cursor {
    tree: Arc<IndexTree>,
    page: Option<PageRef>,
    guard: Option<PageReadGuard>,
    slot: CursorSlot,
    stored: Option<StoredPosition>,
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("index", &self.tree.def.name)
            .field("page", &self.guard.as_ref().map(|g| g.id))
            .field("slot", &self.slot)
            .finish()
    }
}

impl Cursor {
    pub fn tree(&self) -> &Arc<IndexTree> {
        &self.tree
    }

    fn page(&self) -> Result<&LeafPage> {
        self.guard
            .as_deref()
            .ok_or(BedrockError::CursorNotPositioned)
    }

    fn install(&mut self, page: PageRef, guard: PageReadGuard, slot: CursorSlot) {
        self.guard = Some(guard);
        self.page = Some(page);
        self.slot = slot;
    }

    pub fn is_positioned(&self) -> bool {
        self.guard.is_some()
    }

    pub fn slot(&self) -> CursorSlot {
        self.slot
    }

    /// Positions on the first record at or after (`GreaterOrEqual`,
    /// `Greater`) or the last record at or before (`LessOrEqual`, `Less`)
    /// the tuple. Falls back to the supremum of the last leaf or the
    /// infimum of the first leaf when no record qualifies.
    pub fn open(&mut self, tuple: &[Field], mode: SearchMode) -> Result<()> {
        self.guard = None;
        let (page, guard) = self.tree.locate(tuple, mode)?;
        let edge = if mode.is_forward() {
            CursorSlot::Infimum
        } else {
            CursorSlot::Supremum
        };
        self.install(page, guard, edge);
        self.tree.verify(self.page()?)?;

        let tree = Arc::clone(&self.tree);
        let page = self.page()?;
        let pp = partition_point(&page.records, |r| tree.is_before(tuple, mode, r))?;
        let len = page.records.len();
        if mode.is_forward() {
            if pp < len {
                self.slot = CursorSlot::User(pp);
            } else {
                self.next_page_forward()?;
            }
        } else if pp > 0 {
            self.slot = CursorSlot::User(pp - 1);
        } else {
            self.slot = CursorSlot::Infimum;
            if self.page()?.low.is_some() {
                self.prev_page_backward()?;
            }
        }
        Ok(())
    }

    pub fn current(&self) -> Result<CursorRecord<'_>> {
        let page = self.page()?;
        Ok(match self.slot {
            CursorSlot::Infimum => CursorRecord::Infimum,
            CursorSlot::Supremum => CursorRecord::Supremum,
            CursorSlot::User(i) => match page.records.get(i) {
                Some(record) => CursorRecord::User(record),
                None => return Err(BedrockError::CursorNotPositioned),
            },
        })
    }

    /// Advances one record. Returns false when already on the supremum of
    /// the last leaf.
    pub fn move_next(&mut self) -> Result<bool> {
        let len = self.page()?.records.len();
        match self.slot {
            CursorSlot::Supremum => return Ok(false),
            CursorSlot::Infimum if len > 0 => {
                self.slot = CursorSlot::User(0);
                return Ok(true);
            }
            CursorSlot::User(i) if i + 1 < len => {
                self.slot = CursorSlot::User(i + 1);
                return Ok(true);
            }
            _ => {}
        }
        self.next_page_forward()?;
        Ok(true)
    }

    /// Steps back one record. Returns false when already on the infimum of
    /// the first leaf.
    pub fn move_prev(&mut self) -> Result<bool> {
        let page = self.page()?;
        let len = page.records.len();
        let first_leaf = page.low.is_none();
        match self.slot {
            CursorSlot::Supremum if len > 0 => {
                self.slot = CursorSlot::User(len - 1);
                return Ok(true);
            }
            CursorSlot::User(i) if i > 0 => {
                self.slot = CursorSlot::User(i - 1);
                return Ok(true);
            }
            CursorSlot::Infimum if first_leaf => return Ok(false),
            _ => {}
        }
        self.prev_page_backward()?;
        Ok(true)
    }

    /// Leaves the current leaf to the right: first record of the next
    /// non-empty leaf, or the supremum of the last leaf.
    fn next_page_forward(&mut self) -> Result<()> {
        loop {
            let Some(next) = self.page()?.next.clone() else {
                self.slot = CursorSlot::Supremum;
                return Ok(());
            };
            let guard = next.read_arc();
            self.install(next, guard, CursorSlot::Infimum);
            self.tree.verify(self.page()?)?;
            if !self.page()?.records.is_empty() {
                self.slot = CursorSlot::User(0);
                return Ok(());
            }
        }
    }

    /// Leaves the current leaf to the left. The latch is released before the
    /// left neighbour is searched for by the current low fence.
    fn prev_page_backward(&mut self) -> Result<()> {
        loop {
            let Some(low) = self.page()?.low.clone() else {
                self.slot = CursorSlot::Infimum;
                return Ok(());
            };
            self.guard = None;
            let key = self.tree.key_of(&low)?;
            let (page, guard) = self.tree.locate(&key, SearchMode::Less)?;
            self.install(page, guard, CursorSlot::Supremum);
            self.tree.verify(self.page()?)?;
            let len = self.page()?.records.len();
            if len > 0 {
                self.slot = CursorSlot::User(len - 1);
                return Ok(());
            }
        }
    }

    /// Skips the rest of the current leaf, used to step over a leaf that
    /// failed verification.
    pub fn skip_page(&mut self, forward: bool) -> Result<()> {
        let page_id = self.page()?.id;
        log::warn!(
            "skipping leaf {page_id} of index {} ({})",
            self.tree.def.name,
            if forward { "forward" } else { "backward" }
        );
        if forward {
            self.next_page_forward()
        } else {
            self.prev_page_backward()
        }
    }

    /// The record after the current one without moving the cursor. Leaves to
    /// the right are latched in order while the current one stays held.
    pub fn peek_next(&self) -> Result<SlotRecord> {
        let page = self.page()?;
        let start = match self.slot {
            CursorSlot::Supremum => return Ok(SlotRecord::Supremum),
            CursorSlot::Infimum => 0,
            CursorSlot::User(i) => i + 1,
        };
        if let Some(record) = page.records.get(start) {
            return Ok(SlotRecord::User(record.clone()));
        }
        let mut next = page.next.clone();
        let mut _held: Option<PageReadGuard> = None;
        while let Some(page) = next {
            let guard = page.read_arc();
            if let Some(first) = guard.records.first() {
                return Ok(SlotRecord::User(first.clone()));
            }
            next = guard.next.clone();
            _held = Some(guard);
        }
        Ok(SlotRecord::Supremum)
    }

    pub fn is_after_last(&self) -> bool {
        matches!(self.slot, CursorSlot::Supremum)
            && self.page().map(|p| p.is_last()).unwrap_or(false)
    }

    pub fn is_before_first(&self) -> bool {
        matches!(self.slot, CursorSlot::Infimum)
            && self.page().map(|p| p.low.is_none()).unwrap_or(false)
    }

    pub fn page_id(&self) -> Result<PageId> {
        Ok(self.page()?.id)
    }

    pub fn page_max_trx_id(&self) -> Result<TransactionId> {
        Ok(self.page()?.max_trx_id)
    }

    /// Remembers the current position so it survives `release`.
    pub fn store_position(&mut self) -> Result<()> {
        let page = self.page()?;
        let key_of = |bytes: &Bytes| self.tree.key_of(bytes);
        let len = page.records.len();
        let (optimistic, point) = match self.slot {
            CursorSlot::User(i) => {
                let key = key_of(&page.records[i])?;
                let page_ref = self.page.clone().ok_or(BedrockError::CursorNotPositioned)?;
                (
                    Some((page_ref, page.modify_clock, i)),
                    StoredPoint::On(key),
                )
            }
            CursorSlot::Infimum => match (page.records.first(), &page.low) {
                (Some(first), _) => (None, StoredPoint::Before(key_of(first)?)),
                (None, Some(low)) => (None, StoredPoint::Before(key_of(low)?)),
                (None, None) => (None, StoredPoint::Start),
            },
            CursorSlot::Supremum => match (len.checked_sub(1), &page.high) {
                (Some(last), _) => (None, StoredPoint::After(key_of(&page.records[last])?)),
                (None, Some(high)) => (None, StoredPoint::Before(key_of(high)?)),
                (None, None) => (None, StoredPoint::End),
            },
        };
        self.stored = Some(StoredPosition { optimistic, point });
        Ok(())
    }

    /// Stores a position on the record with ordering key `key`, whether or
    /// not the cursor is currently there.
    pub fn store_key_position(&mut self, key: Vec<Field>) {
        self.stored = Some(StoredPosition {
            optimistic: None,
            point: StoredPoint::On(key),
        });
    }

    pub fn has_stored_position(&self) -> bool {
        self.stored.is_some()
    }

    /// Drops the leaf latch. The stored position, if any, is kept.
    pub fn release(&mut self) {
        self.guard = None;
        self.page = None;
    }

    /// Re-latches at the stored position. `GreaterOrEqual` lands on the
    /// stored record or the first one after it, `LessOrEqual` on the stored
    /// record or the last one before it.
    pub fn restore_position(&mut self, mode: SearchMode) -> Result<RestoreOutcome> {
        let stored = self.stored.clone().ok_or(BedrockError::CursorNotPositioned)?;
        if let Some((page, clock, slot)) = &stored.optimistic {
            let guard = page.read_arc();
            if guard.modify_clock == *clock && *slot < guard.records.len() {
                self.install(Arc::clone(page), guard, CursorSlot::User(*slot));
                self.tree.verify(self.page()?)?;
                return Ok(RestoreOutcome {
                    relative: RelativePosition::On,
                    valid: true,
                });
            }
        }

        let forward = mode.is_forward();
        let empty: &[Field] = &[];
        let (tuple, search, exact) = match &stored.point {
            StoredPoint::On(k) if forward => (k.as_slice(), SearchMode::GreaterOrEqual, true),
            StoredPoint::On(k) => (k.as_slice(), SearchMode::LessOrEqual, true),
            StoredPoint::Before(k) if forward => (k.as_slice(), SearchMode::GreaterOrEqual, false),
            StoredPoint::Before(k) => (k.as_slice(), SearchMode::Less, false),
            StoredPoint::After(k) if forward => (k.as_slice(), SearchMode::Greater, false),
            StoredPoint::After(k) => (k.as_slice(), SearchMode::LessOrEqual, false),
            StoredPoint::Start if forward => (empty, SearchMode::GreaterOrEqual, false),
            StoredPoint::Start => (empty, SearchMode::Less, false),
            StoredPoint::End if forward => (empty, SearchMode::Greater, false),
            StoredPoint::End => (empty, SearchMode::LessOrEqual, false),
        };
        self.open(tuple, search)?;

        let on_record = match self.current()? {
            CursorRecord::User(bytes) => Some(bytes),
            _ => None,
        };
        let same = match on_record {
            Some(bytes) if exact => {
                let view = RecordView::parse(bytes)?;
                self.tree.def.compare_tuple(tuple, &view)? == Ordering::Equal
            }
            _ => false,
        };
        let relative = if same {
            RelativePosition::On
        } else if forward {
            RelativePosition::After
        } else {
            RelativePosition::Before
        };
        Ok(RestoreOutcome {
            relative,
            valid: on_record.is_some(),
        })
    }
}
