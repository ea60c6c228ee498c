//! The narrow interfaces the engine consumes, and their implementations
//! for the bedrock storage types.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bedrock::blob::OverflowStore;
use bedrock::btree::{Cursor, CursorRecord, IndexTree, RestoreOutcome, SearchMode, SlotRecord};
use bedrock::index::IndexDef;
use bedrock::lock_manager::{LockError, LockKind, LockManager, LockMode, LockOutcome, LockTarget, LockTicket};
use bedrock::record::BlobRef;
use bedrock::transaction::{IsolationLevel, ReadView, Transaction};
use bedrock::undo::{VersionArena, VersionId};
use bedrock::{Field, RecordView, TransactionId};
use bytes::Bytes;

/// A positionable handle into one index. While positioned it pins (latches)
/// its current leaf; `release` unpins and keeps only the stored position.
pub trait IndexCursor {
    fn open(&mut self, tuple: &[Field], mode: SearchMode) -> bedrock::Result<()>;
    fn current(&self) -> bedrock::Result<CursorRecord<'_>>;
    /// False only at the very end of the index.
    fn move_next(&mut self) -> bedrock::Result<bool>;
    /// False only at the very start of the index.
    fn move_prev(&mut self) -> bedrock::Result<bool>;
    fn peek_next(&self) -> bedrock::Result<SlotRecord>;
    fn is_after_last(&self) -> bool;
    fn is_before_first(&self) -> bool;
    fn page_max_trx_id(&self) -> bedrock::Result<TransactionId>;
    fn store_position(&mut self) -> bedrock::Result<()>;
    fn store_key_position(&mut self, key: Vec<Field>);
    fn restore_position(&mut self, mode: SearchMode) -> bedrock::Result<RestoreOutcome>;
    fn release(&mut self);
    fn is_positioned(&self) -> bool;
    /// Steps over the rest of the current leaf.
    fn skip_to_next_page(&mut self, forward: bool) -> bedrock::Result<()>;
}

impl IndexCursor for Cursor {
    fn open(&mut self, tuple: &[Field], mode: SearchMode) -> bedrock::Result<()> {
        Cursor::open(self, tuple, mode)
    }

    fn current(&self) -> bedrock::Result<CursorRecord<'_>> {
        Cursor::current(self)
    }

    fn move_next(&mut self) -> bedrock::Result<bool> {
        Cursor::move_next(self)
    }

    fn move_prev(&mut self) -> bedrock::Result<bool> {
        Cursor::move_prev(self)
    }

    fn peek_next(&self) -> bedrock::Result<SlotRecord> {
        Cursor::peek_next(self)
    }

    fn is_after_last(&self) -> bool {
        Cursor::is_after_last(self)
    }

    fn is_before_first(&self) -> bool {
        Cursor::is_before_first(self)
    }

    fn page_max_trx_id(&self) -> bedrock::Result<TransactionId> {
        Cursor::page_max_trx_id(self)
    }

    fn store_position(&mut self) -> bedrock::Result<()> {
        Cursor::store_position(self)
    }

    fn store_key_position(&mut self, key: Vec<Field>) {
        Cursor::store_key_position(self, key)
    }

    fn restore_position(&mut self, mode: SearchMode) -> bedrock::Result<RestoreOutcome> {
        Cursor::restore_position(self, mode)
    }

    fn release(&mut self) {
        Cursor::release(self)
    }

    fn is_positioned(&self) -> bool {
        Cursor::is_positioned(self)
    }

    fn skip_to_next_page(&mut self, forward: bool) -> bedrock::Result<()> {
        Cursor::skip_page(self, forward)
    }
}

pub trait IndexHandle: Send + Sync {
    fn def(&self) -> &IndexDef;
    fn open_cursor(self: Arc<Self>) -> Box<dyn IndexCursor>;

    fn compare(&self, tuple: &[Field], record: &RecordView<'_>) -> bedrock::Result<Ordering> {
        self.def().compare_tuple(tuple, record)
    }
}

impl IndexHandle for IndexTree {
    fn def(&self) -> &IndexDef {
        IndexTree::def(self)
    }

    fn open_cursor(self: Arc<Self>) -> Box<dyn IndexCursor> {
        Box::new(self.cursor())
    }
}

pub trait LockService: Send + Sync {
    fn request(
        &self,
        trx: TransactionId,
        target: &LockTarget,
        mode: LockMode,
        kind: LockKind,
    ) -> Result<LockOutcome, LockError>;
    fn wait(&self, ticket: LockTicket, timeout: Duration) -> Result<(), LockError>;
    /// True once the ticket has been granted.
    fn poll(&self, ticket: LockTicket) -> Result<bool, LockError>;
    fn cancel(&self, ticket: LockTicket);
    fn release_all(&self, trx: TransactionId);
}

impl LockService for LockManager {
    fn request(
        &self,
        trx: TransactionId,
        target: &LockTarget,
        mode: LockMode,
        kind: LockKind,
    ) -> Result<LockOutcome, LockError> {
        LockManager::request(self, trx, target, mode, kind)
    }

    fn wait(&self, ticket: LockTicket, timeout: Duration) -> Result<(), LockError> {
        LockManager::wait(self, ticket, timeout)
    }

    fn poll(&self, ticket: LockTicket) -> Result<bool, LockError> {
        LockManager::poll(self, ticket)
    }

    fn cancel(&self, ticket: LockTicket) {
        LockManager::cancel(self, ticket)
    }

    fn release_all(&self, trx: TransactionId) {
        LockManager::release_all(self, trx)
    }
}

pub trait TransactionContext: Send + Sync {
    fn id(&self) -> TransactionId;
    fn isolation(&self) -> IsolationLevel;
    /// Assigned by the first consistent read and reused afterwards.
    fn read_view(&self) -> ReadView;
}

impl TransactionContext for Transaction {
    fn id(&self) -> TransactionId {
        Transaction::id(self)
    }

    fn isolation(&self) -> IsolationLevel {
        Transaction::isolation(self)
    }

    fn read_view(&self) -> ReadView {
        Transaction::read_view(self)
    }
}

pub trait OverflowFetcher: Send + Sync {
    fn fetch_overflow(&self, blob: BlobRef) -> bedrock::Result<Bytes>;
}

impl OverflowFetcher for OverflowStore {
    fn fetch_overflow(&self, blob: BlobRef) -> bedrock::Result<Bytes> {
        self.fetch(blob)
    }
}

/// Lookup of earlier record versions by arena id.
pub trait VersionSource: Send + Sync {
    fn version(&self, id: VersionId) -> bedrock::Result<Bytes>;
}

impl VersionSource for VersionArena {
    fn version(&self, id: VersionId) -> bedrock::Result<Bytes> {
        self.get(id)
    }
}
