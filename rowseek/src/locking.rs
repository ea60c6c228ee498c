//! Which row locks a read takes.

use std::sync::Arc;

use bedrock::index::IndexDef;
use bedrock::lock_manager::{LockError, LockKind, LockMode, LockOutcome, LockTarget};
use bedrock::transaction::IsolationLevel;
use bedrock::{RecordView, TransactionId};

use crate::access::LockService;
use crate::errors::Result;
use crate::tuple::SelectLock;

/// How a scan reads records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadKind {
    /// Lock-free, through the transaction's read view.
    Consistent,
    /// Lock-free, latest versions, no read view.
    Uncommitted,
    /// Latest versions, each protected by a row lock.
    Locking(LockMode),
}

impl ReadKind {
    pub fn decide(isolation: IsolationLevel, select: SelectLock) -> Self {
        match select {
            SelectLock::Shared => ReadKind::Locking(LockMode::Shared),
            SelectLock::Exclusive => ReadKind::Locking(LockMode::Exclusive),
            SelectLock::None => match isolation {
                IsolationLevel::Serializable => ReadKind::Locking(LockMode::Shared),
                IsolationLevel::ReadUncommitted => ReadKind::Uncommitted,
                _ => ReadKind::Consistent,
            },
        }
    }

    pub fn is_locking(self) -> bool {
        matches!(self, ReadKind::Locking(_))
    }
}

/// Issues the row locks of one locking scan. Gap components are only
/// requested above ReadCommitted.
pub struct LockCoordinator {
    service: Arc<dyn LockService>,
    trx: TransactionId,
    mode: LockMode,
    gap_locks: bool,
}

impl LockCoordinator {
    pub fn new(service: Arc<dyn LockService>, trx: TransactionId, isolation: IsolationLevel, mode: LockMode) -> Self {
        Self {
            service,
            trx,
            mode,
            gap_locks: isolation > IsolationLevel::ReadCommitted,
        }
    }

    pub fn service(&self) -> &Arc<dyn LockService> {
        &self.service
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn gap_locks(&self) -> bool {
        self.gap_locks
    }

    /// Kind for a record the scan is about to examine. `exact_hit` is set
    /// when the record is known to be the only possible match: a unique
    /// search on a matching record, or the first record of a clustered
    /// scan that equals the full key.
    pub fn record_kind(&self, exact_hit: bool) -> LockKind {
        if !self.gap_locks || exact_hit {
            LockKind::Record
        } else {
            LockKind::NextKey
        }
    }

    /// Locks a user record with `kind`.
    pub fn lock_record(&self, def: &IndexDef, record: &RecordView<'_>, kind: LockKind) -> Result<LockOutcome> {
        let target = def.lock_target(record)?;
        Ok(self.request(&target, kind)?)
    }

    /// Gap lock on a record beyond the match range. `None` when gaps are
    /// not locked at this isolation level.
    pub fn lock_gap_before(&self, def: &IndexDef, record: &RecordView<'_>) -> Result<Option<LockOutcome>> {
        if !self.gap_locks {
            return Ok(None);
        }
        let target = def.lock_target(record)?;
        Ok(Some(self.request(&target, LockKind::Gap)?))
    }

    /// Gap after the last entry of the index.
    pub fn lock_supremum(&self, def: &IndexDef) -> Result<Option<LockOutcome>> {
        if !self.gap_locks {
            return Ok(None);
        }
        Ok(Some(self.request(&def.supremum_target(), LockKind::NextKey)?))
    }

    fn request(&self, target: &LockTarget, kind: LockKind) -> std::result::Result<LockOutcome, LockError> {
        let outcome = self.service.request(self.trx, target, self.mode, kind)?;
        if let LockOutcome::Wait(ticket) = outcome {
            log::debug!(
                "trx {} queued for {:?} {:?} on {target} (ticket {})",
                self.trx,
                self.mode,
                kind,
                ticket.id()
            );
        }
        Ok(outcome)
    }
}
