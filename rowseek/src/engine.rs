//! The search engine: drives a [`SearchContext`] through positioning,
//! locking, version resolution and materialization, one fetch at a time.
//!
//! Between fetch calls no page latch is held. The cursor keeps a stored
//! position and the context remembers whether the record there was already
//! dealt with, so every call starts by restoring that position.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::sync::Arc;

use bedrock::btree::{CursorRecord, RelativePosition, SearchMode, SlotRecord};
use bedrock::index::IndexDef;
use bedrock::lock_manager::{LockError, LockKind, LockOutcome, LockTicket};
use bedrock::transaction::ReadView;
use bedrock::{BedrockError, Field, RecordView};
use serde::Serialize;

use crate::access::{IndexCursor, LockService};
use crate::config::{LockWaitPolicy, SearchConfig};
use crate::context::{Exhaustion, ScanRequest, ScanState, ScanStats, SearchContext};
use crate::errors::{Result, ScanOutcome, SearchError};
use crate::fetch_cache::{CachedRow, FetchCache};
use crate::locking::{LockCoordinator, ReadKind};
use crate::materialize::{BlobArena, MaterializeError, RowMaterializer};
use crate::resolver::{Version, VersionResolver};
use crate::tuple::{PredicateVerdict, RowAccess, ScanDirection, SearchTuple};

/// A row was written to the caller's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RowDelivered {
    /// Only set for scans that include delete-marked rows.
    pub delete_marked: bool,
    pub from_cache: bool,
}

pub type FetchResult = std::result::Result<RowDelivered, ScanOutcome>;

impl From<Exhaustion> for ScanOutcome {
    fn from(reason: Exhaustion) -> Self {
        match reason {
            Exhaustion::EndOfIndex => ScanOutcome::EndOfIndex,
            Exhaustion::NotFound => ScanOutcome::NotFound,
        }
    }
}

enum Slot {
    Infimum,
    Supremum,
    User,
}

/// What to do with the record under the cursor.
enum Examined {
    Row { delete_marked: bool, key: Vec<Field> },
    Skip,
    End(Exhaustion),
    Wait(LockTicket),
    TooLarge,
}

enum Lookup {
    Found(Vec<u8>),
    Missing,
    Wait(LockTicket),
}

pub struct SearchEngine {
    config: SearchConfig,
    locks: Arc<dyn LockService>,
}

impl SearchEngine {
    pub fn new(config: SearchConfig, locks: Arc<dyn LockService>) -> Self {
        Self { config, locks }
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub fn lock_service(&self) -> &Arc<dyn LockService> {
        &self.locks
    }

    /// Validates the request and builds the scan context. Nothing is
    /// latched or locked until the first fetch.
    pub fn open(&self, request: ScanRequest) -> Result<SearchContext> {
        let def = request.index.def();
        if request.tuple.fields().len() > def.n_fields() {
            return Err(SearchError::TupleTooLong {
                index: def.name.clone(),
                given: request.tuple.fields().len(),
                max: def.n_fields(),
            });
        }
        let clust_def = request.clustered.def();
        if !clust_def.clustered {
            return Err(SearchError::Template(format!(
                "{} is not a clustered index",
                clust_def.name
            )));
        }

        let isolation = request.trx.isolation();
        let read = ReadKind::decide(isolation, request.select_lock);
        let locks = match read {
            ReadKind::Locking(mode) => Some(LockCoordinator::new(
                Arc::clone(&self.locks),
                request.trx.id(),
                isolation,
                mode,
            )),
            _ => None,
        };

        let clust_ref_map = clust_def.columns[..clust_def.n_unique]
            .iter()
            .map(|c| {
                def.field_position(c.col_no).ok_or_else(|| {
                    SearchError::Template(format!(
                        "index {} does not carry primary-key column {}",
                        def.name, c.col_no
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let index_field_map: Option<Vec<usize>> = request
            .template
            .col_nos()
            .map(|col_no| def.field_position(col_no))
            .collect();
        let clust_field_map = request
            .template
            .col_nos()
            .map(|col_no| clust_def.field_position(col_no).ok_or(SearchError::UnknownColumn(col_no)))
            .collect::<Result<Vec<_>>>()?;
        let needs_clustered = !def.clustered
            && (index_field_map.is_none() || request.options.predicate.is_some() || read.is_locking());
        let unique_search = request.tuple.is_unique_search(def);

        log::debug!(
            "open scan on {} ({:?}, {:?} {:?}, {} bound fields{})",
            def.name,
            read,
            request.direction,
            request.tuple.match_mode(),
            request.tuple.fields().len(),
            if unique_search { ", unique" } else { "" }
        );

        let cursor = Arc::clone(&request.index).open_cursor();
        let clust_cursor = (!def.clustered).then(|| Arc::clone(&request.clustered).open_cursor());
        Ok(SearchContext {
            read,
            locks,
            unique_search,
            cursor,
            clust_cursor,
            clust_ref_map,
            index_field_map,
            clust_field_map,
            needs_clustered,
            cache: FetchCache::new(self.config.fetch_cache_size, self.config.cache_threshold),
            arena: BlobArena::new(self.config.blob_limit),
            state: ScanState::Idle,
            processed: false,
            direction: request.direction,
            last_delivered: None,
            deferred: None,
            open_gap_locked: false,
            first_record: true,
            stats: ScanStats::default(),
            request,
        })
    }

    /// Restarts the scan from a new tuple, keeping the context's buffers
    /// and statistics.
    pub fn reopen(&self, ctx: &mut SearchContext, tuple: SearchTuple) -> Result<()> {
        let index = Arc::clone(&ctx.request.index);
        let def = index.def();
        if tuple.fields().len() > def.n_fields() {
            return Err(SearchError::TupleTooLong {
                index: def.name.clone(),
                given: tuple.fields().len(),
                max: def.n_fields(),
            });
        }
        if let ScanState::Waiting(ticket) = ctx.state {
            self.locks.cancel(ticket);
        }
        ctx.release_latches();
        ctx.unique_search = tuple.is_unique_search(def);
        ctx.request.tuple = tuple;
        ctx.cache.reset();
        ctx.arena.reset();
        ctx.state = ScanState::Idle;
        ctx.processed = false;
        ctx.direction = ctx.request.direction;
        ctx.last_delivered = None;
        ctx.deferred = None;
        ctx.open_gap_locked = false;
        ctx.first_record = true;
        Ok(())
    }

    pub fn fetch_next(&self, ctx: &mut SearchContext, out: &mut [u8]) -> FetchResult {
        self.fetch(ctx, ScanDirection::Ascending, out)
    }

    pub fn fetch_prev(&self, ctx: &mut SearchContext, out: &mut [u8]) -> FetchResult {
        self.fetch(ctx, ScanDirection::Descending, out)
    }

    /// Delivers the next row in `direction` into `out`.
    pub fn fetch(&self, ctx: &mut SearchContext, direction: ScanDirection, out: &mut [u8]) -> FetchResult {
        let needed = ctx.request.template.row_len();
        if out.len() < needed {
            return Err(SearchError::BufferTooSmall {
                given: out.len(),
                needed,
            }
            .into());
        }
        let changed = ctx.cache.note_fetch(direction);
        if ctx.unique_search && matches!(ctx.state, ScanState::Exhausted { .. }) {
            return Err(ScanOutcome::NotFound);
        }
        if changed {
            self.change_direction(ctx, direction);
        }
        ctx.direction = direction;
        ctx.arena.reset();

        if let Some(cached) = ctx.cache.pop() {
            out[..cached.row.len()].copy_from_slice(&cached.row);
            ctx.last_delivered = Some(cached.key);
            ctx.stats.cache_hits += 1;
            ctx.stats.rows_fetched += 1;
            return Ok(RowDelivered {
                delete_marked: cached.delete_marked,
                from_cache: true,
            });
        }

        match ctx.state {
            ScanState::Failed => {
                return Err(match ctx.deferred.take() {
                    Some(outcome) => outcome,
                    None => SearchError::ScanFailed.into(),
                })
            }
            ScanState::Exhausted { reason, direction: d } if d == direction => return Err(reason.into()),
            ScanState::Exhausted { .. } => ctx.state = ScanState::Positioning,
            ScanState::Waiting(ticket) => self.resume_wait(ctx, ticket)?,
            _ => {}
        }

        let fill = ctx.cache.is_active() && cache_allowed(ctx);
        let mut first = None;
        let result = self.run(ctx, direction, out, fill, &mut first);
        ctx.release_latches();
        match (first, result) {
            (Some(row), Err(outcome)) if ctx.state == ScanState::Failed => {
                log::debug!(
                    "{}: prefetch failed with {outcome}, reporting it after {} buffered rows",
                    ctx.index().name,
                    ctx.cache.len()
                );
                ctx.deferred = Some(outcome);
                Ok(row)
            }
            (Some(row), Err(outcome)) => {
                log::trace!("{}: prefetch stopped: {outcome}", ctx.index().name);
                Ok(row)
            }
            (Some(row), Ok(())) => Ok(row),
            (None, Err(outcome)) => Err(outcome),
            (None, Ok(())) => Err(SearchError::ScanFailed.into()),
        }
    }

    /// Blocks on the lock a scan is queued for. The next fetch resumes on
    /// the record that needed it.
    pub fn wait(&self, ctx: &mut SearchContext) -> std::result::Result<(), ScanOutcome> {
        let ScanState::Waiting(ticket) = ctx.state else {
            return Ok(());
        };
        match self.locks.wait(ticket, self.config.lock_wait_timeout) {
            Ok(()) => {
                ctx.state = ScanState::Positioning;
                Ok(())
            }
            Err(e) => {
                ctx.state = ScanState::Positioning;
                Err(lock_failure(e))
            }
        }
    }

    /// Ends the scan. A queued lock request is withdrawn; locks already
    /// granted stay with the transaction.
    pub fn close(&self, mut ctx: SearchContext) -> ScanStats {
        if let ScanState::Waiting(ticket) = ctx.state {
            self.locks.cancel(ticket);
        }
        ctx.release_latches();
        log::debug!("close scan on {}: {:?}", ctx.index().name, ctx.stats);
        ctx.stats
    }

    fn change_direction(&self, ctx: &mut SearchContext, direction: ScanDirection) {
        ctx.stats.direction_changes += 1;
        let dropped = ctx.cache.invalidate();
        if let ScanState::Waiting(ticket) = ctx.state {
            self.locks.cancel(ticket);
            ctx.state = ScanState::Positioning;
        }
        // The stored position may be ahead of delivery; go back behind the
        // last row the caller saw. An end reached with nothing buffered is
        // reversed from the end itself.
        let reposition = match ctx.state {
            ScanState::Idle | ScanState::Failed => false,
            ScanState::Exhausted { .. } => dropped > 0,
            _ => true,
        };
        if reposition {
            if let Some(key) = ctx.last_delivered.clone() {
                ctx.cursor.store_key_position(key);
                ctx.processed = true;
                ctx.state = ScanState::Positioning;
            }
        }
        log::debug!(
            "{}: scan turns {:?}, {dropped} prefetched rows dropped",
            ctx.index().name,
            direction
        );
    }

    fn resume_wait(&self, ctx: &mut SearchContext, ticket: LockTicket) -> std::result::Result<(), ScanOutcome> {
        let granted = match self.config.lock_wait_policy {
            LockWaitPolicy::Block => self
                .locks
                .wait(ticket, self.config.lock_wait_timeout)
                .map(|()| true),
            LockWaitPolicy::Return => self.locks.poll(ticket),
        };
        match granted {
            Ok(true) => {
                ctx.state = ScanState::Positioning;
                Ok(())
            }
            Ok(false) => Err(ScanOutcome::LockWait(ticket)),
            Err(e) => {
                ctx.state = ScanState::Positioning;
                Err(lock_failure(e))
            }
        }
    }

    /// The scan loop. Writes the first row found into `out`; when `fill`
    /// is set, keeps going and buffers further rows in the fetch cache.
    fn run(
        &self,
        ctx: &mut SearchContext,
        dir: ScanDirection,
        out: &mut [u8],
        fill: bool,
        first: &mut Option<RowDelivered>,
    ) -> std::result::Result<(), ScanOutcome> {
        let view = match ctx.read {
            ReadKind::Consistent => Some(ctx.request.trx.read_view()),
            _ => None,
        };
        self.position(ctx, dir)?;

        let row_len = ctx.request.template.row_len();
        let mut record = Vec::new();
        let mut spare = Vec::new();
        let mut budget = 0u64;
        loop {
            if self.config.yield_cost > 0 && budget >= self.config.yield_cost {
                self.park(ctx, false, ScanState::Yielding)?;
                ctx.stats.yields += 1;
                log::trace!("{}: yielding after {budget} records", ctx.index().name);
                return Err(ScanOutcome::Yielded);
            }
            budget += 1;

            let slot = match ctx.cursor.current() {
                Ok(CursorRecord::User(bytes)) => {
                    record.clear();
                    record.extend_from_slice(bytes);
                    Slot::User
                }
                Ok(CursorRecord::Infimum) => Slot::Infimum,
                Ok(CursorRecord::Supremum) => Slot::Supremum,
                Err(e) => {
                    self.recover(ctx, dir, e.into())?;
                    continue;
                }
            };
            match slot {
                Slot::Supremum if dir.is_forward() && ctx.cursor.is_after_last() => {
                    let index = Arc::clone(&ctx.request.index);
                    let locked = match ctx.locks.as_ref() {
                        Some(locks) => locks.lock_supremum(index.def()),
                        None => Ok(None),
                    };
                    match locked {
                        Ok(Some(LockOutcome::Wait(ticket))) => self.suspend(ctx, dir, ticket)?,
                        Ok(_) => return self.exhaust(ctx, dir, Exhaustion::EndOfIndex, false),
                        Err(e) => self.recover(ctx, dir, e)?,
                    }
                    continue;
                }
                Slot::Infimum if !dir.is_forward() && ctx.cursor.is_before_first() => {
                    return self.exhaust(ctx, dir, Exhaustion::EndOfIndex, false);
                }
                Slot::Supremum | Slot::Infimum => {
                    self.advance(ctx, dir)?;
                    continue;
                }
                Slot::User => {}
            }

            ctx.stats.records_examined += 1;
            let target: &mut [u8] = if first.is_none() {
                &mut *out
            } else {
                spare.resize(row_len, 0);
                &mut spare
            };
            let examined = match self.examine(ctx, dir, &record, view.as_ref(), target) {
                Ok(examined) => examined,
                Err(e) => {
                    self.recover(ctx, dir, e)?;
                    continue;
                }
            };
            match examined {
                Examined::Skip => self.advance(ctx, dir)?,
                Examined::End(reason) => return self.exhaust(ctx, dir, reason, true),
                Examined::Wait(ticket) => self.suspend(ctx, dir, ticket)?,
                Examined::TooLarge => {
                    self.park(ctx, false, ScanState::Positioning)?;
                    return Err(ScanOutcome::TooLargeRecord);
                }
                Examined::Row { delete_marked, key } => {
                    if first.is_none() {
                        *first = Some(RowDelivered {
                            delete_marked,
                            from_cache: false,
                        });
                        ctx.stats.rows_fetched += 1;
                        ctx.last_delivered = Some(key);
                        if ctx.unique_search {
                            ctx.state = ScanState::Exhausted {
                                reason: Exhaustion::NotFound,
                                direction: dir,
                            };
                            return Ok(());
                        }
                    } else {
                        ctx.cache.push(CachedRow {
                            row: std::mem::take(&mut spare),
                            key,
                            delete_marked,
                        });
                        ctx.stats.cache_fills += 1;
                    }
                    if !fill || ctx.cache.is_full() {
                        self.park(ctx, true, ScanState::Positioning)?;
                        return Ok(());
                    }
                    self.advance(ctx, dir)?;
                }
            }
        }
    }

    /// Latches the cursor where the scan continues: the tuple on the first
    /// call, the stored position afterwards.
    fn position(&self, ctx: &mut SearchContext, dir: ScanDirection) -> std::result::Result<(), ScanOutcome> {
        if ctx.state != ScanState::Idle {
            ctx.state = ScanState::Scanning;
            return self.restore(ctx, dir);
        }
        let mode = ctx.request.tuple.open_mode(dir);
        if let Err(e) = ctx.cursor.open(ctx.request.tuple.fields(), mode) {
            self.recover(ctx, dir, e.into())?;
        }
        ctx.state = ScanState::Scanning;
        ctx.first_record = true;
        if !dir.is_forward() && !ctx.open_gap_locked {
            self.lock_open_gap(ctx, dir)?;
        }
        Ok(())
    }

    /// A descending locking scan protects the gap above its first
    /// candidate before reading anything.
    fn lock_open_gap(&self, ctx: &mut SearchContext, dir: ScanDirection) -> std::result::Result<(), ScanOutcome> {
        ctx.open_gap_locked = true;
        let Some(locks) = ctx.locks.as_ref() else {
            return Ok(());
        };
        if !locks.gap_locks() {
            return Ok(());
        }
        let index = Arc::clone(&ctx.request.index);
        let outcome = match ctx.cursor.peek_next() {
            Ok(SlotRecord::User(bytes)) => RecordView::parse(&bytes)
                .map_err(SearchError::from)
                .and_then(|view| locks.lock_gap_before(index.def(), &view)),
            Ok(_) => locks.lock_supremum(index.def()),
            Err(e) => Err(e.into()),
        };
        match outcome {
            Ok(Some(LockOutcome::Wait(ticket))) => self.suspend(ctx, dir, ticket),
            Ok(_) => Ok(()),
            Err(e) => self.recover(ctx, dir, e),
        }
    }

    fn restore(&self, ctx: &mut SearchContext, dir: ScanDirection) -> std::result::Result<(), ScanOutcome> {
        match ctx.cursor.restore_position(dir.restore_mode()) {
            Ok(restored) => {
                if restored.relative == RelativePosition::On && ctx.processed {
                    self.advance(ctx, dir)?;
                }
                Ok(())
            }
            Err(e) => self.recover(ctx, dir, e.into()),
        }
    }

    fn advance(&self, ctx: &mut SearchContext, dir: ScanDirection) -> std::result::Result<(), ScanOutcome> {
        // A false return leaves the cursor on the end sentinel, which the
        // scan loop handles on its next turn.
        let moved = if dir.is_forward() {
            ctx.cursor.move_next()
        } else {
            ctx.cursor.move_prev()
        };
        match moved {
            Ok(_) => Ok(()),
            Err(e) => self.recover(ctx, dir, e.into()),
        }
    }

    /// Stores the position, records the state and drops every latch.
    fn park(
        &self,
        ctx: &mut SearchContext,
        processed: bool,
        state: ScanState,
    ) -> std::result::Result<(), ScanOutcome> {
        if let Err(e) = ctx.cursor.store_position() {
            ctx.state = ScanState::Failed;
            return Err(e.into());
        }
        ctx.processed = processed;
        ctx.state = state;
        ctx.release_latches();
        Ok(())
    }

    fn exhaust(
        &self,
        ctx: &mut SearchContext,
        dir: ScanDirection,
        reason: Exhaustion,
        processed: bool,
    ) -> std::result::Result<(), ScanOutcome> {
        self.park(ctx, processed, ScanState::Exhausted { reason, direction: dir })?;
        Err(reason.into())
    }

    /// The record under the cursor needs a lock another transaction holds.
    fn suspend(
        &self,
        ctx: &mut SearchContext,
        dir: ScanDirection,
        ticket: LockTicket,
    ) -> std::result::Result<(), ScanOutcome> {
        ctx.stats.lock_waits += 1;
        self.park(ctx, false, ScanState::Waiting(ticket))?;
        match self.config.lock_wait_policy {
            LockWaitPolicy::Return => Err(ScanOutcome::LockWait(ticket)),
            LockWaitPolicy::Block => match self.locks.wait(ticket, self.config.lock_wait_timeout) {
                Ok(()) => {
                    ctx.state = ScanState::Scanning;
                    self.restore(ctx, dir)
                }
                Err(e) => {
                    ctx.state = ScanState::Positioning;
                    Err(lock_failure(e))
                }
            },
        }
    }

    /// Handles an error raised while the cursor is latched. Leaves that fail
    /// verification are skipped under best-effort recovery; lock failures
    /// keep the position for a retry; anything else fails the scan.
    fn recover(
        &self,
        ctx: &mut SearchContext,
        dir: ScanDirection,
        err: SearchError,
    ) -> std::result::Result<(), ScanOutcome> {
        let mut err = err;
        loop {
            match err {
                SearchError::Storage(ref e) if is_corruption(e) => {
                    if !self.config.best_effort_recovery {
                        log::warn!("{}: {e}, failing the scan", ctx.index().name);
                        ctx.state = ScanState::Failed;
                        return Err(ScanOutcome::Corrupted);
                    }
                    ctx.stats.pages_skipped += 1;
                    match ctx.cursor.skip_to_next_page(dir.is_forward()) {
                        Ok(()) => return Ok(()),
                        Err(next) => err = next.into(),
                    }
                }
                SearchError::Lock(e @ (LockError::Deadlock | LockError::Timeout)) => {
                    self.park(ctx, false, ScanState::Positioning)?;
                    return Err(lock_failure(e));
                }
                other => {
                    ctx.state = ScanState::Failed;
                    return Err(ScanOutcome::Failed(other));
                }
            }
        }
    }

    /// Decides the fate of one user record: match range, lock, visible
    /// version, delete mark, residual predicate, then materialization into
    /// `target`.
    fn examine(
        &self,
        ctx: &mut SearchContext,
        dir: ScanDirection,
        record: &[u8],
        view: Option<&ReadView>,
        target: &mut [u8],
    ) -> Result<Examined> {
        let index = Arc::clone(&ctx.request.index);
        let clustered = Arc::clone(&ctx.request.clustered);
        let def = index.def();
        let clust_def = clustered.def();
        let rec = RecordView::parse(record)?;
        let tuple = &ctx.request.tuple;

        if tuple.requires_match() && def.compare_tuple(tuple.fields(), &rec)? != Ordering::Equal {
            if let Some(locks) = ctx.locks.as_ref() {
                if let Some(LockOutcome::Wait(ticket)) = locks.lock_gap_before(def, &rec)? {
                    return Ok(Examined::Wait(ticket));
                }
            }
            return Ok(Examined::End(Exhaustion::NotFound));
        }

        if let Some(locks) = ctx.locks.as_ref() {
            let exact_hit = ctx.unique_search
                || (ctx.first_record
                    && def.clustered
                    && dir.is_forward()
                    && tuple.is_inclusive()
                    && tuple.fields().len() >= def.n_unique
                    && !tuple.has_null()
                    && def.compare_tuple(&tuple.fields()[..def.n_unique], &rec)? == Ordering::Equal);
            let kind = locks.record_kind(exact_hit);
            if let LockOutcome::Wait(ticket) = locks.lock_record(def, &rec, kind)? {
                return Ok(Examined::Wait(ticket));
            }
        }
        ctx.first_record = false;

        let include_delete_marked = ctx.request.options.include_delete_marked;
        let resolver = VersionResolver::new(ctx.request.versions.as_ref(), self.config.max_version_chain);
        let (row, from_clustered): (Cow<'_, [u8]>, bool) = if def.clustered {
            let row = match view {
                Some(view) => match resolver.resolve(def, record, view)? {
                    None => return Ok(Examined::Skip),
                    Some(Version::Current(bytes)) => Cow::Borrowed(bytes),
                    Some(Version::Prior(bytes)) => Cow::Owned(bytes.to_vec()),
                },
                None => Cow::Borrowed(record),
            };
            (row, true)
        } else {
            let page_visible = match view {
                Some(view) => VersionResolver::sec_rec_visible(ctx.cursor.page_max_trx_id()?, view),
                None => true,
            };
            if rec.is_delete_marked() && !include_delete_marked && page_visible {
                return Ok(Examined::Skip);
            }
            if !ctx.needs_clustered && page_visible {
                (Cow::Borrowed(record), false)
            } else {
                ctx.stats.clustered_lookups += 1;
                let key = ctx
                    .clust_ref_map
                    .iter()
                    .map(|&pos| rec.field(pos).map(|f| f.to_field()))
                    .collect::<bedrock::Result<Vec<Field>>>()?;
                let Some(cursor) = ctx.clust_cursor.as_mut() else {
                    return Err(SearchError::Template(format!(
                        "secondary scan on {} has no clustered cursor",
                        def.name
                    )));
                };
                let looked_up = lookup_clustered(cursor.as_mut(), clust_def, &key, ctx.locks.as_ref());
                cursor.release();
                let clust_rec = match looked_up? {
                    Lookup::Found(bytes) => bytes,
                    Lookup::Wait(ticket) => return Ok(Examined::Wait(ticket)),
                    Lookup::Missing => {
                        log::trace!("{}: secondary entry without a clustered row", def.name);
                        return Ok(Examined::Skip);
                    }
                };
                let prior = match view {
                    Some(view) => match resolver.resolve(clust_def, &clust_rec, view)? {
                        None => return Ok(Examined::Skip),
                        Some(Version::Current(_)) => None,
                        Some(Version::Prior(bytes)) => Some(bytes),
                    },
                    None => None,
                };
                let row = match prior {
                    Some(bytes) => bytes.to_vec(),
                    None => clust_rec,
                };
                let clust_view = RecordView::parse(&row)?;
                if !VersionResolver::sec_rec_is_for_clust_rec(def, &rec, clust_def, &clust_view)? {
                    return Ok(Examined::Skip);
                }
                (Cow::Owned(row), true)
            }
        };

        let row_view = RecordView::parse(&row)?;
        if row_view.is_delete_marked() && !include_delete_marked {
            return Ok(Examined::Skip);
        }
        let (row_def, field_map): (&IndexDef, &[usize]) = if from_clustered {
            (clust_def, &ctx.clust_field_map)
        } else {
            let map = ctx.index_field_map.as_deref().ok_or_else(|| {
                SearchError::Template(format!("index {} lacks a requested column", def.name))
            })?;
            (def, map)
        };

        if let Some(predicate) = ctx.request.options.predicate.as_ref() {
            let access = RowAccess::new(
                row_def,
                &row_view,
                &ctx.request.column_types,
                ctx.request.overflow.as_ref(),
            );
            match (predicate.as_ref())(&access) {
                PredicateVerdict::Match => {}
                PredicateVerdict::NoMatch => return Ok(Examined::Skip),
                PredicateVerdict::OutOfRange => return Ok(Examined::End(Exhaustion::NotFound)),
            }
        }

        let materializer = RowMaterializer::new(&ctx.request.template, field_map, ctx.request.overflow.as_ref());
        match materializer.materialize(&row_view, target, &mut ctx.arena) {
            Ok(()) => {}
            Err(MaterializeError::TooLarge { needed, limit }) => {
                log::debug!("{}: row needs {needed} bytes of large values, limit {limit}", def.name);
                return Ok(Examined::TooLarge);
            }
            Err(MaterializeError::Storage(e)) => return Err(e.into()),
            Err(other) => return Err(SearchError::Template(other.to_string())),
        }
        Ok(Examined::Row {
            delete_marked: row_view.is_delete_marked(),
            key: def.ordering_key(&rec)?,
        })
    }
}

/// Finds the clustered record for `key` and, for locking reads, locks it
/// while the leaf is still latched.
fn lookup_clustered(
    cursor: &mut dyn IndexCursor,
    def: &IndexDef,
    key: &[Field],
    locks: Option<&LockCoordinator>,
) -> Result<Lookup> {
    cursor.open(key, SearchMode::GreaterOrEqual)?;
    let CursorRecord::User(bytes) = cursor.current()? else {
        return Ok(Lookup::Missing);
    };
    let view = RecordView::parse(bytes)?;
    if def.compare_tuple(key, &view)? != Ordering::Equal {
        return Ok(Lookup::Missing);
    }
    if let Some(locks) = locks {
        if let LockOutcome::Wait(ticket) = locks.lock_record(def, &view, LockKind::Record)? {
            return Ok(Lookup::Wait(ticket));
        }
    }
    Ok(Lookup::Found(bytes.to_vec()))
}

fn cache_allowed(ctx: &SearchContext) -> bool {
    !ctx.read.is_locking()
        && !ctx.unique_search
        && !ctx.request.template.has_large()
        && !ctx.request.options.disable_cache
}

fn is_corruption(err: &BedrockError) -> bool {
    matches!(err, BedrockError::PageChecksum { .. } | BedrockError::MalformedRecord(_))
}

fn lock_failure(err: LockError) -> ScanOutcome {
    match err {
        LockError::Deadlock => ScanOutcome::Deadlock,
        LockError::Timeout => ScanOutcome::LockTimeout,
        other => ScanOutcome::Failed(SearchError::Lock(other)),
    }
}
