//! Record, gap and next-key locks on index entries.
//!
//! Requests never block inside `request`: a conflicting request is queued
//! and handed back as a ticket the caller can `wait` on or `poll`.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{IndexId, TransactionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    fn covers(self, other: LockMode) -> bool {
        self == LockMode::Exclusive || other == LockMode::Shared
    }

    fn compatible(self, other: LockMode) -> bool {
        self == LockMode::Shared && other == LockMode::Shared
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockKind {
    /// The index record only.
    Record,
    /// The gap before the record, not the record itself.
    Gap,
    /// The record and the gap before it.
    NextKey,
    /// Announces an insert into the gap before the record.
    InsertIntention,
}

impl LockKind {
    fn has_record(self) -> bool {
        matches!(self, LockKind::Record | LockKind::NextKey)
    }

    fn has_gap(self) -> bool {
        matches!(self, LockKind::Gap | LockKind::NextKey)
    }

    fn covers(self, other: LockKind) -> bool {
        self == other || (self == LockKind::NextKey && matches!(other, LockKind::Record | LockKind::Gap))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockTarget {
    /// An index entry identified by its ordering key.
    Record { index: IndexId, key: Bytes },
    /// The gap after the last entry of an index.
    Supremum { index: IndexId },
}

impl fmt::Display for LockTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockTarget::Record { index, key } => write!(f, "index {index} key {key:02x?}"),
            LockTarget::Supremum { index } => write!(f, "index {index} supremum"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockTicket(u64);

impl LockTicket {
    pub fn id(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Granted,
    Wait(LockTicket),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("deadlock detected")]
    Deadlock,
    #[error("lock wait timed out")]
    Timeout,
    #[error("unknown lock ticket {0}")]
    UnknownTicket(u64),
}

#[derive(Debug)]
struct LockRequest {
    tx_id: TransactionId,
    mode: LockMode,
    kind: LockKind,
    granted: bool,
    ticket: u64,
}

impl LockRequest {
    /// Whether this lock, held by another transaction, blocks a request.
    fn blocks(&self, mode: LockMode, kind: LockKind) -> bool {
        match kind {
            LockKind::Gap => false,
            LockKind::InsertIntention => self.kind.has_gap(),
            LockKind::Record | LockKind::NextKey => {
                self.kind.has_record() && !self.mode.compatible(mode)
            }
        }
    }
}

#[derive(Debug, Default)]
struct LockQueue {
    requests: Vec<LockRequest>,
}

impl LockQueue {
    /// Returns the transactions holding a lock that conflicts with the given request.
    fn get_conflicting_holders(
        &self,
        tx_id: TransactionId,
        mode: LockMode,
        kind: LockKind,
    ) -> Vec<TransactionId> {
        let mut holders: Vec<TransactionId> = self
            .requests
            .iter()
            .filter(|req| req.granted && req.tx_id != tx_id && req.blocks(mode, kind))
            .map(|req| req.tx_id)
            .collect();
        holders.sort_unstable();
        holders.dedup();
        holders
    }

    fn is_covered(&self, tx_id: TransactionId, mode: LockMode, kind: LockKind) -> bool {
        self.requests.iter().any(|req| {
            req.granted && req.tx_id == tx_id && req.mode.covers(mode) && req.kind.covers(kind)
        })
    }
}

#[derive(Debug, Default)]
struct WaitQueue {
    queue: Mutex<LockQueue>,
    cvar: Condvar,
}

#[derive(Debug, Default)]
pub struct LockManager {
    table: Mutex<HashMap<LockTarget, Arc<WaitQueue>>>,
    waits_for: Mutex<HashMap<TransactionId, Vec<TransactionId>>>,
    tickets: Mutex<HashMap<u64, (LockTarget, TransactionId)>>,
    next_ticket: AtomicU64,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue_for(&self, target: &LockTarget) -> Arc<WaitQueue> {
        let mut table = self.table.lock();
        Arc::clone(table.entry(target.clone()).or_default())
    }

    /// Asks for a lock without blocking. Locks on the supremum only ever
    /// protect a gap.
    pub fn request(
        &self,
        tx_id: TransactionId,
        target: &LockTarget,
        mode: LockMode,
        kind: LockKind,
    ) -> Result<LockOutcome, LockError> {
        let kind = match (target, kind) {
            (LockTarget::Supremum { .. }, LockKind::Record | LockKind::NextKey) => LockKind::Gap,
            _ => kind,
        };
        let wait_queue = self.queue_for(target);
        let mut guard = wait_queue.queue.lock();

        // Insert intention is re-checked on every request: a writer asks again
        // after its insert to see whether a gap lock slipped in meanwhile.
        if kind != LockKind::InsertIntention && guard.is_covered(tx_id, mode, kind) {
            return Ok(LockOutcome::Granted);
        }

        let holders = guard.get_conflicting_holders(tx_id, mode, kind);
        if holders.is_empty() {
            guard.requests.push(LockRequest {
                tx_id,
                mode,
                kind,
                granted: true,
                ticket: 0,
            });
            log::trace!("trx {tx_id} granted {mode:?} {kind:?} on {target}");
            return Ok(LockOutcome::Granted);
        }

        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst) + 1;
        guard.requests.push(LockRequest {
            tx_id,
            mode,
            kind,
            granted: false,
            ticket,
        });

        if let Err(e) = self.update_waits_for_graph(tx_id, holders.clone()) {
            guard.requests.retain(|req| req.ticket != ticket);
            log::debug!("trx {tx_id} chosen as deadlock victim on {target}");
            return Err(e);
        }
        self.tickets.lock().insert(ticket, (target.clone(), tx_id));
        log::debug!("trx {tx_id} waits for {holders:?} on {target} ({mode:?} {kind:?})");
        Ok(LockOutcome::Wait(LockTicket(ticket)))
    }

    /// Blocks until the ticket's request is granted, a deadlock is found or
    /// `timeout` passes. A failed wait withdraws the request.
    pub fn wait(&self, ticket: LockTicket, timeout: Duration) -> Result<(), LockError> {
        let deadline = Instant::now() + timeout;
        let (target, tx_id) = self.ticket_target(ticket)?;
        let wait_queue = self.queue_for(&target);
        let mut guard = wait_queue.queue.lock();
        loop {
            match self.try_grant(&mut guard, ticket.0, tx_id) {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => {
                    self.withdraw(&mut guard, ticket.0, tx_id);
                    return Err(e);
                }
            }
            if wait_queue.cvar.wait_until(&mut guard, deadline).timed_out() {
                if self.try_grant(&mut guard, ticket.0, tx_id) == Ok(true) {
                    return Ok(());
                }
                self.withdraw(&mut guard, ticket.0, tx_id);
                log::debug!("trx {tx_id} timed out waiting on {target}");
                return Err(LockError::Timeout);
            }
        }
    }

    /// Non-blocking check of a pending ticket: true once granted.
    pub fn poll(&self, ticket: LockTicket) -> Result<bool, LockError> {
        let (target, tx_id) = self.ticket_target(ticket)?;
        let wait_queue = self.queue_for(&target);
        let mut guard = wait_queue.queue.lock();
        let result = self.try_grant(&mut guard, ticket.0, tx_id);
        if result.is_err() {
            self.withdraw(&mut guard, ticket.0, tx_id);
        }
        result
    }

    /// Requests and waits in one call.
    pub fn lock(
        &self,
        tx_id: TransactionId,
        target: &LockTarget,
        mode: LockMode,
        kind: LockKind,
        timeout: Duration,
    ) -> Result<(), LockError> {
        match self.request(tx_id, target, mode, kind)? {
            LockOutcome::Granted => Ok(()),
            LockOutcome::Wait(ticket) => self.wait(ticket, timeout),
        }
    }

    /// Drops a pending request, for a scan abandoned while waiting.
    pub fn cancel(&self, ticket: LockTicket) {
        if let Ok((target, tx_id)) = self.ticket_target(ticket) {
            let wait_queue = self.queue_for(&target);
            let mut guard = wait_queue.queue.lock();
            self.withdraw(&mut guard, ticket.0, tx_id);
        }
    }

    fn ticket_target(&self, ticket: LockTicket) -> Result<(LockTarget, TransactionId), LockError> {
        self.tickets
            .lock()
            .get(&ticket.0)
            .cloned()
            .ok_or(LockError::UnknownTicket(ticket.0))
    }

    fn try_grant(
        &self,
        queue: &mut LockQueue,
        ticket: u64,
        tx_id: TransactionId,
    ) -> Result<bool, LockError> {
        let Some(pos) = queue.requests.iter().position(|req| req.ticket == ticket) else {
            return Err(LockError::UnknownTicket(ticket));
        };
        let (mode, kind) = (queue.requests[pos].mode, queue.requests[pos].kind);
        let holders = queue.get_conflicting_holders(tx_id, mode, kind);
        if holders.is_empty() {
            queue.requests[pos].granted = true;
            queue.requests[pos].ticket = 0;
            self.tickets.lock().remove(&ticket);
            self.waits_for.lock().remove(&tx_id);
            log::trace!("trx {tx_id} granted {mode:?} {kind:?} after waiting");
            return Ok(true);
        }
        self.update_waits_for_graph(tx_id, holders)?;
        Ok(false)
    }

    fn withdraw(&self, queue: &mut LockQueue, ticket: u64, tx_id: TransactionId) {
        queue.requests.retain(|req| req.ticket != ticket || req.granted);
        self.tickets.lock().remove(&ticket);
        self.waits_for.lock().remove(&tx_id);
    }

    fn update_waits_for_graph(
        &self,
        waiting_tx_id: TransactionId,
        holders: Vec<TransactionId>,
    ) -> Result<(), LockError> {
        let mut waits_for_map = self.waits_for.lock();
        waits_for_map.insert(waiting_tx_id, holders);

        let mut visited = HashSet::new();
        let mut recursion_stack = HashSet::new();
        if self.has_cycle_util(
            waiting_tx_id,
            &mut visited,
            &mut recursion_stack,
            &waits_for_map,
        ) {
            waits_for_map.remove(&waiting_tx_id);
            return Err(LockError::Deadlock);
        }
        Ok(())
    }

    fn has_cycle_util(
        &self,
        tx_id: TransactionId,
        visited: &mut HashSet<TransactionId>,
        recursion_stack: &mut HashSet<TransactionId>,
        waits_for: &HashMap<TransactionId, Vec<TransactionId>>,
    ) -> bool {
        if recursion_stack.contains(&tx_id) {
            return true;
        }
        if visited.contains(&tx_id) {
            return false;
        }

        visited.insert(tx_id);
        recursion_stack.insert(tx_id);

        if let Some(waits_for_txs) = waits_for.get(&tx_id) {
            for waited_tx in waits_for_txs {
                if self.has_cycle_util(*waited_tx, visited, recursion_stack, waits_for) {
                    return true;
                }
            }
        }

        recursion_stack.remove(&tx_id);
        false
    }

    /// Whether `tx_id` holds a granted lock at least as strong as requested.
    pub fn holds(&self, tx_id: TransactionId, target: &LockTarget, mode: LockMode, kind: LockKind) -> bool {
        let table = self.table.lock();
        table
            .get(target)
            .map(|wq| wq.queue.lock().is_covered(tx_id, mode, kind))
            .unwrap_or(false)
    }

    /// Releases every lock and pending request of `tx_id` and wakes waiters.
    pub fn release_all(&self, tx_id: TransactionId) {
        let table = self.table.lock();
        let mut to_notify = Vec::new();
        let mut released = 0usize;

        for wait_queue in table.values() {
            let mut queue = wait_queue.queue.lock();
            let before = queue.requests.len();
            queue.requests.retain(|req| req.tx_id != tx_id);
            if queue.requests.len() != before {
                released += before - queue.requests.len();
                to_notify.push(Arc::clone(wait_queue));
            }
        }
        drop(table);

        self.waits_for.lock().remove(&tx_id);
        self.tickets.lock().retain(|_, (_, owner)| *owner != tx_id);
        log::debug!("trx {tx_id} released {released} locks");

        for wait_queue in to_notify {
            let _guard = wait_queue.queue.lock();
            wait_queue.cvar.notify_all();
        }
    }
}
