//! Transaction management and read views.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::TransactionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// An immutable snapshot boundary.
#[derive(Debug, Clone)]
pub struct ReadView {
    low_limit_id: TransactionId,
    up_limit_id: TransactionId,
    creator_id: TransactionId,
    active: Arc<HashSet<TransactionId>>,
}

impl ReadView {
    pub fn new(
        low_limit_id: TransactionId,
        up_limit_id: TransactionId,
        creator_id: TransactionId,
        active: HashSet<TransactionId>,
    ) -> Self {
        Self {
            low_limit_id,
            up_limit_id,
            creator_id,
            active: Arc::new(active),
        }
    }

    /// Ids at or above this were not yet assigned when the view was made.
    pub fn low_limit_id(&self) -> TransactionId {
        self.low_limit_id
    }

    /// Ids below this had all committed when the view was made.
    pub fn up_limit_id(&self) -> TransactionId {
        self.up_limit_id
    }

    pub fn creator_id(&self) -> TransactionId {
        self.creator_id
    }

    /// Returns true if changes made by `trx_id` are visible in this view.
    pub fn changes_visible(&self, trx_id: TransactionId) -> bool {
        if trx_id == self.creator_id {
            return true;
        }
        if trx_id < self.up_limit_id {
            return true;
        }
        if trx_id >= self.low_limit_id {
            return false;
        }
        !self.active.contains(&trx_id)
    }
}

#[derive(Debug, Default)]
struct TransactionManagerState {
    next_transaction_id: AtomicU64,
    active_transactions: Mutex<HashSet<TransactionId>>,
    open_views: Mutex<HashMap<TransactionId, ReadView>>,
}

/// The transaction manager. Cheap to clone and shared across threads.
#[derive(Debug, Clone)]
pub struct TransactionManager {
    state: Arc<TransactionManagerState>,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new(1)
    }
}

impl TransactionManager {
    /// Id 0 is reserved for records that carry no creator.
    pub fn new(initial_tx_id: TransactionId) -> Self {
        let state = TransactionManagerState {
            next_transaction_id: AtomicU64::new(initial_tx_id.max(1)),
            ..Default::default()
        };
        Self {
            state: Arc::new(state),
        }
    }

    pub fn begin(&self, isolation: IsolationLevel) -> Arc<Transaction> {
        let mut active = self.state.active_transactions.lock();
        let id = self.state.next_transaction_id.fetch_add(1, Ordering::SeqCst);
        active.insert(id);
        log::debug!("begin trx {id} ({isolation:?}), {} active", active.len());
        Arc::new(Transaction {
            id,
            isolation,
            manager: self.clone(),
            view: Mutex::new(None),
        })
    }

    fn finish(&self, trx_id: TransactionId) {
        self.state.open_views.lock().remove(&trx_id);
        let mut active = self.state.active_transactions.lock();
        active.remove(&trx_id);
        log::debug!("commit trx {trx_id}, {} active", active.len());
    }

    pub fn is_active(&self, trx_id: TransactionId) -> bool {
        self.state.active_transactions.lock().contains(&trx_id)
    }

    /// Creates a read view for `creator_id` over the current state.
    pub fn create_read_view(&self, creator_id: TransactionId) -> ReadView {
        let active = self.state.active_transactions.lock();
        let low_limit_id = self.state.next_transaction_id.load(Ordering::SeqCst);
        let others: HashSet<TransactionId> =
            active.iter().copied().filter(|&id| id != creator_id).collect();
        let up_limit_id = others.iter().copied().min().unwrap_or(low_limit_id);
        let view = ReadView::new(low_limit_id, up_limit_id, creator_id, others);
        log::trace!("read view for trx {creator_id}: up {up_limit_id}, low {low_limit_id}");
        view
    }

    /// A delete by `trx_id` may be physically removed once it committed and
    /// every open read view already sees it.
    pub fn is_purgeable(&self, trx_id: TransactionId) -> bool {
        if self.is_active(trx_id) {
            return false;
        }
        self.state
            .open_views
            .lock()
            .values()
            .all(|view| view.changes_visible(trx_id))
    }
}

#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    isolation: IsolationLevel,
    manager: TransactionManager,
    view: Mutex<Option<ReadView>>,
}

impl Transaction {
    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn has_read_view(&self) -> bool {
        self.view.lock().is_some()
    }

    /// The transaction's read view, created by the first consistent read and
    /// reused until the statement (ReadCommitted) or transaction ends.
    pub fn read_view(&self) -> ReadView {
        let mut slot = self.view.lock();
        if let Some(view) = slot.as_ref() {
            return view.clone();
        }
        let view = self.manager.create_read_view(self.id);
        self.manager
            .state
            .open_views
            .lock()
            .insert(self.id, view.clone());
        *slot = Some(view.clone());
        view
    }

    /// Statement boundary. Below RepeatableRead the next consistent read
    /// sees a fresh snapshot.
    pub fn end_statement(&self) {
        if self.isolation <= IsolationLevel::ReadCommitted {
            self.view.lock().take();
            self.manager.state.open_views.lock().remove(&self.id);
        }
    }

    /// Commits the transaction. Locks are released separately through the
    /// lock manager.
    pub fn commit(&self) {
        self.view.lock().take();
        self.manager.finish(self.id);
    }
}
