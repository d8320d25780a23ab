//! The state machine: issues requests, processes peer messages, drives
//! replay-drain and quorum (spec §4.3). This is the largest component by
//! design; everything else in the crate exists to support it.
//!
//! Grounded on `safekeeper::safekeeper::SafeKeeper::process_msg`'s
//! per-message-kind dispatch, and on `examples/original_source/bdr_locks.c`
//! for the exact control flow of `bdr_acquire_ddl_lock`,
//! `bdr_process_acquire_ddl_lock`, `bdr_send_confirm_lock`,
//! `bdr_process_release_ddl_lock` and `bdr_locks_startup`, which this
//! module follows step for step.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, warn};
use utils::id::NodeId;
use utils::lsn::Lsn;

use crate::config::Config;
use crate::error::CoordinatorError;
use crate::journal::{Journal, JournalStatus};
use crate::lock_state::{LockKind, LockState, WakeHandle};
use crate::metrics::{ACQUIRES_DECLINED, ACQUIRES_GRANTED, JOURNAL_DELETES, JOURNAL_PROMOTES};
use crate::protocol::{InboundMessage, Payload};
use crate::transport::Transport;
use crate::waiter_gate::{WaiterGate, WriterId, WriterRegistry};

/// How long `acquire` waits on its wake latch between re-checks of
/// `acquire_confirmed`/`acquire_declined`. Analogous to the bounded
/// timeout of spec §4.3 step 5; there is no real postmaster to check for
/// liveness against in this port, so the timeout exists only to bound how
/// long a single `wait()` call can block before re-evaluating state.
const ACQUIRE_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Coordinator {
    config: Config,
    journal: Arc<dyn Journal>,
    transport: Arc<dyn Transport>,
    waiter_gate: WaiterGate,
    /// Set once at process start, after every configured database slot
    /// has been allocated. Reinstated from the original's
    /// `locked_and_loaded`, distinct from any one database's `ready`: it
    /// gates the Waiter Gate's fast path before per-database recovery is
    /// even meaningful to ask about.
    locked_and_loaded: AtomicBool,
    slots: Mutex<Vec<Option<Arc<Mutex<LockState>>>>>,
}

impl Coordinator {
    pub fn new(
        config: Config,
        journal: Arc<dyn Journal>,
        transport: Arc<dyn Transport>,
        writers: Arc<dyn WriterRegistry>,
    ) -> Arc<Self> {
        let max_databases = config.max_databases;
        let grace = config.ddl_grace_timeout();
        Arc::new(Coordinator {
            waiter_gate: WaiterGate::new(writers, grace),
            config,
            journal,
            transport,
            locked_and_loaded: AtomicBool::new(false),
            slots: Mutex::new((0..max_databases).map(|_| None).collect()),
        })
    }

    /// Marks the process as fully booted: every configured database slot
    /// has been allocated and the config is final. `check_dml` refuses to
    /// proceed past its fast path until this is set.
    pub fn mark_locked_and_loaded(&self) {
        self.locked_and_loaded.store(true, Ordering::SeqCst);
    }

    async fn get_or_allocate_slot(&self, db: u32) -> Result<Arc<Mutex<LockState>>, CoordinatorError> {
        let mut slots = self.slots.lock().await;
        for slot in slots.iter().flatten() {
            if slot.lock().await.db == db {
                return Ok(slot.clone());
            }
        }
        for entry in slots.iter_mut() {
            if entry.is_none() {
                let new_slot = Arc::new(Mutex::new(LockState::new(db)));
                *entry = Some(new_slot.clone());
                return Ok(new_slot);
            }
        }
        Err(CoordinatorError::ConfigLimit { db })
    }

    /// Sets the quorum denominator for `db`. Per the Open Question in
    /// spec §9, the source reads `peer_count` from another subsystem's
    /// shared memory without locking; this port protects it under the
    /// same per-database mutex as the rest of `LockState`. Calling this
    /// while an acquisition for `db` is in flight is undefined: the
    /// cluster must be quiesced for membership changes, the same
    /// requirement the source places on itself.
    pub async fn set_peer_count(&self, db: u32, peer_count: usize) -> Result<(), CoordinatorError> {
        let slot = self.get_or_allocate_slot(db).await?;
        slot.lock().await.peer_count = peer_count;
        Ok(())
    }

    /// Current `held` counter for `db`, exposed for diagnostics and tests.
    pub async fn held_count(&self, db: u32) -> Result<u32, CoordinatorError> {
        let slot = self.get_or_allocate_slot(db).await?;
        Ok(slot.lock().await.held)
    }

    // ---- Startup & Recovery (spec §4.4) ----

    pub async fn startup(&self, db: u32) -> anyhow::Result<()> {
        let slot = self
            .get_or_allocate_slot(db)
            .await
            .map_err(|e| anyhow::anyhow!(e))?;

        if slot.lock().await.ready {
            return Ok(());
        }

        let lsn = self.transport.log_standby_message(&Payload::Start).await?;
        self.transport.xlog_flush(lsn).await?;

        let rows = self.journal.scan_db(db).await?;
        if rows.len() > 1 {
            warn!(
                db,
                count = rows.len(),
                "more than one journal row for database at startup; representing all of them"
            );
        }

        for row in rows {
            match row.status {
                JournalStatus::Acquired => {
                    let mut guard = slot.lock().await;
                    guard.held += 1;
                    guard.holder = Some(row.holder);
                    guard.kind = row.kind;
                }
                JournalStatus::Catchup => {
                    {
                        let mut guard = slot.lock().await;
                        guard.held += 1;
                        guard.holder = Some(row.holder);
                        guard.kind = row.kind;
                    }
                    self.reissue_request_replay(db, &slot).await?;
                }
            }
        }

        slot.lock().await.ready = true;
        Ok(())
    }

    async fn reissue_request_replay(&self, db: u32, slot: &Mutex<LockState>) -> anyhow::Result<()> {
        let wait_lsn = self.transport.current_position();
        {
            let mut guard = slot.lock().await;
            guard.replay_wait_lsn = wait_lsn;
            guard.replay_confirmed = 0;
        }
        debug!(db, %wait_lsn, "reissuing REQUEST_REPLAY for in-flight catchup row");
        let lsn = self
            .transport
            .log_standby_message(&Payload::RequestReplay { wait_lsn })
            .await?;
        self.transport.xlog_flush(lsn).await?;
        Ok(())
    }

    // ---- Waiter Gate entry points (spec §4.5), delegated ----

    /// `own_guard`, if present, is the calling transaction's own
    /// [`LockGuard`] from an earlier `acquire` on this same database:
    /// spec's "this transaction is the holder" is a property of the
    /// specific transaction that acquired the lock, not of this node as a
    /// whole, since other local sessions on the same node must still
    /// block behind it.
    pub async fn check_dml(&self, db: u32, own_guard: Option<&LockGuard>) -> anyhow::Result<()> {
        if self.config.skip_ddl_locking {
            return Ok(());
        }
        // Busy-poll the boot gate; this is not the hot path; it is only
        // exercised for the brief window at process start before
        // `mark_locked_and_loaded` has run.
        while !self.locked_and_loaded.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let slot = self
            .get_or_allocate_slot(db)
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
        let is_this_transaction = own_guard.map(|g| g.db) == Some(db);
        self.waiter_gate
            .check_dml(&slot, move |_state| is_this_transaction)
            .await;
        Ok(())
    }

    // ---- Acquire path (spec §4.3, foreground caller) ----

    /// `already_held` is what the calling transaction believes it already
    /// holds locally, tracked by the caller across its own lifetime (the
    /// DDL command filter owns transaction-scoped state; this crate only
    /// owns the cluster-wide lock). If it is already at least `kind`, this
    /// is a no-op success and the returned guard releases nothing (the
    /// transaction's original guard, from its first `acquire`, still owns
    /// the real release).
    pub async fn acquire(
        self: &Arc<Self>,
        db: u32,
        kind: LockKind,
        already_held: LockKind,
    ) -> Result<LockGuard, CoordinatorError> {
        if !self.config.permit_ddl_locking {
            return Err(CoordinatorError::PermissionDenied);
        }
        if self.config.skip_ddl_locking {
            // "this caller is not a protocol worker" (step 1): an apply
            // worker runs with skip_ddl_locking and must never call
            // acquire directly.
            return Err(CoordinatorError::PermissionDenied);
        }

        let slot = self.get_or_allocate_slot(db).await?;
        if slot.lock().await.peer_count == 0 {
            return Err(CoordinatorError::NotReady);
        }

        if already_held >= kind {
            return Ok(LockGuard::noop(self.clone(), db));
        }

        // Only one local transaction may run the acquire protocol for
        // this database at a time; held for the whole function so a
        // second same-node caller blocks here instead of silently
        // re-initiating ACQUIRE over the first one's in-flight quorum
        // state.
        let local_acquire_lock = slot.lock().await.local_acquire_lock.clone();
        let _local_acquire_guard = local_acquire_lock.lock().await;

        let local_node = self.transport.local_node_id();
        let wake = WakeHandle::new();
        {
            let mut guard = slot.lock().await;
            if guard.held > 0 && guard.holder != Some(local_node) {
                return Err(CoordinatorError::LockUnavailable {
                    holder: guard.holder.expect("held>0 implies holder per invariant 1"),
                    kind: guard.kind,
                });
            }
            guard.held = 1;
            guard.holder = Some(local_node);
            guard.kind = kind;
            guard.acquire_confirmed = 0;
            guard.acquire_declined = 0;
            guard.requestor_wake = Some(wake.clone());
        }

        let lsn = self
            .transport
            .log_standby_message(&Payload::Acquire { kind })
            .await
            .map_err(|e| {
                // The emission failed; there is nothing useful to roll
                // back to locally beyond surfacing NotReady, since the
                // transport itself is what is broken.
                warn!(db, error = %e, "failed to emit ACQUIRE");
                CoordinatorError::NotReady
            })?;
        self.transport
            .xlog_flush(lsn)
            .await
            .map_err(|_| CoordinatorError::NotReady)?;

        loop {
            let _ = tokio::time::timeout(ACQUIRE_WAIT_TIMEOUT, wake.wait()).await;

            let mut guard = slot.lock().await;
            if guard.acquire_declined > 0 {
                guard.held = 0;
                guard.holder = None;
                guard.kind = LockKind::None;
                guard.clear_acquire_counters();
                guard.requestor_wake = None;
                drop(guard);

                // the xact-end hook's RELEASE: our optimistic local state
                // never committed anywhere else, but peers that saw our
                // ACQUIRE need the matching RELEASE.
                if let Ok(lsn) = self
                    .transport
                    .log_standby_message(&Payload::Release { target: local_node })
                    .await
                {
                    let _ = self.transport.xlog_flush(lsn).await;
                }

                ACQUIRES_DECLINED.with_label_values(&[kind.as_str()]).inc();
                // DECLINE carries no holder identity on the wire (only
                // `target`/`kind`); the true current holder is unknowable
                // from here, so the error names the only node we have.
                return Err(CoordinatorError::LockUnavailable {
                    holder: local_node,
                    kind,
                });
            }

            if guard.acquire_confirmed as usize >= guard.peer_count {
                guard.clear_acquire_counters();
                guard.requestor_wake = None;
                ACQUIRES_GRANTED.with_label_values(&[kind.as_str()]).inc();
                return Ok(LockGuard::new(self.clone(), db));
            }
            // otherwise keep waiting
        }
    }

    /// Transaction-end hook (spec §4.6): emits `RELEASE`, then decrements
    /// `held` and drains waiters if it reaches 0. The only path that
    /// relinquishes a lock this node holds; invoked by [`LockGuard`].
    async fn release(&self, db: u32) -> anyhow::Result<()> {
        let local_node = self.transport.local_node_id();
        let lsn = self
            .transport
            .log_standby_message(&Payload::Release { target: local_node })
            .await?;
        self.transport.xlog_flush(lsn).await?;

        let slot = self
            .get_or_allocate_slot(db)
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
        let mut guard = slot.lock().await;
        if guard.held == 0 {
            warn!(db, "release when held == 0");
            return Ok(());
        }
        guard.held -= 1;
        guard.holder = None;
        guard.kind = LockKind::None;
        guard.clear_acquire_counters();
        guard.requestor_wake = None;
        if guard.held == 0 {
            guard.drain_waiters();
        }
        Ok(())
    }

    // ---- Inbound message dispatch ----

    /// Entry point for an apply worker's inbound demux: `db` is the local
    /// database this worker's replication stream belongs to (each apply
    /// worker is bound to one peer origin and one local database).
    ///
    /// Known gap: step 1 of the remote-message handling ("discard if
    /// `msg.origin` is not a peer this worker represents") is not checked
    /// here or in any handler below. It relies entirely on whatever wires
    /// an apply worker to its one peer origin to route messages
    /// correctly; nothing in this crate validates `msg.origin` against a
    /// peer registry, so a misrouted message would be processed as if it
    /// came from a legitimate peer.
    pub async fn dispatch(&self, db: u32, msg: InboundMessage) -> anyhow::Result<()> {
        match msg.payload {
            Payload::Start => self.on_start(msg.origin).await,
            Payload::Acquire { kind } => self.on_acquire(db, msg.origin, kind).await,
            Payload::Decline { target, kind } => self.on_decline(db, msg.origin, target, kind).await,
            Payload::Confirm { target, kind } => self.on_confirm(db, msg.origin, target, kind).await,
            Payload::Release { target } => self.on_release(db, msg.origin, target).await,
            Payload::RequestReplay { wait_lsn } => {
                self.on_request_replay(db, msg.origin, wait_lsn).await
            }
            Payload::ReplayConfirm { request_lsn } => {
                self.on_replay_confirm(db, msg.origin, request_lsn).await
            }
        }
    }

    /// Peer `ACQUIRE(kind)` handler (spec §4.3). Does not itself verify
    /// `origin` against a peer registry; see the gap noted on
    /// [`Self::dispatch`].
    async fn on_acquire(&self, db: u32, origin: NodeId, kind: LockKind) -> anyhow::Result<()> {
        let slot = self
            .get_or_allocate_slot(db)
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
        let local_node = self.transport.local_node_id();

        enum Outcome {
            Decline { target: NodeId, kind: LockKind },
            DrainThenReplay,
            Confirm,
        }

        let outcome = {
            let mut guard = slot.lock().await;
            if guard.held == 0 {
                match self
                    .journal
                    .insert_catchup(db, origin, local_node, kind)
                    .await?
                {
                    crate::journal::InsertOutcome::Conflict => {
                        Outcome::Decline { target: origin, kind }
                    }
                    crate::journal::InsertOutcome::Inserted => {
                        guard.held = 1;
                        guard.holder = Some(origin);
                        guard.kind = kind;
                        if kind >= LockKind::Write {
                            Outcome::DrainThenReplay
                        } else {
                            Outcome::Confirm
                        }
                    }
                }
            } else if guard.holder == Some(origin) && kind > guard.kind {
                self.journal.update_kind(db, origin, kind).await?;
                guard.kind = kind;
                if kind >= LockKind::Write {
                    Outcome::DrainThenReplay
                } else {
                    Outcome::Confirm
                }
            } else {
                // `target` names the node whose ACQUIRE is being turned
                // down, not the existing holder: the wire schema's DECLINE
                // carries only `target`/`kind` (no holder identity), and the
                // requesting node's handler discards anything whose target
                // isn't itself, so the rejected requester is the only
                // coherent addressee here.
                Outcome::Decline {
                    target: origin,
                    kind: guard.kind,
                }
            }
        };

        match outcome {
            Outcome::Decline { target, kind } => {
                let lsn = self
                    .transport
                    .log_standby_message(&Payload::Decline { target, kind })
                    .await?;
                self.transport.xlog_flush(lsn).await?;
            }
            Outcome::DrainThenReplay => {
                self.waiter_gate.cancel_and_drain(db, None).await;
                self.reissue_request_replay(db, &slot).await?;
            }
            Outcome::Confirm => {
                self.confirm(db, origin).await?;
            }
        }
        Ok(())
    }

    /// Peer `REQUEST_REPLAY(lsn)` handler: the apply stream guarantees
    /// this node has already processed up to `lsn` by the time it sees
    /// the request, so the reply is immediate. Does not itself verify
    /// `origin` against a peer registry; see the gap noted on
    /// [`Self::dispatch`].
    async fn on_request_replay(&self, _db: u32, _origin: NodeId, wait_lsn: Lsn) -> anyhow::Result<()> {
        let lsn = self
            .transport
            .log_standby_message(&Payload::ReplayConfirm {
                request_lsn: wait_lsn,
            })
            .await?;
        self.transport.xlog_flush(lsn).await?;
        Ok(())
    }

    /// `REPLAY_CONFIRM(lsn)` handler.
    async fn on_replay_confirm(&self, db: u32, _origin: NodeId, request_lsn: Lsn) -> anyhow::Result<()> {
        let slot = self
            .get_or_allocate_slot(db)
            .await
            .map_err(|e| anyhow::anyhow!(e))?;

        let holder_to_confirm = {
            let mut guard = slot.lock().await;
            if guard.held > 0
                && guard.replay_wait_lsn.is_valid()
                && guard.replay_wait_lsn == request_lsn
            {
                guard.replay_confirmed += 1;
                if guard.replay_confirmed as usize >= guard.peer_count {
                    guard.holder
                } else {
                    None
                }
            } else {
                None
            }
        };

        if let Some(holder) = holder_to_confirm {
            self.confirm(db, holder).await?;
        }
        Ok(())
    }

    /// Confirm: the local transition from catchup to acquired. In one
    /// transaction, updates the journal row's status and emits a
    /// transactional `CONFIRM`. Crash-atomicity of the two depends on the
    /// caller running both the journal write (inside [`Journal::promote`])
    /// and the transactional `log_standby_message` call against the same
    /// ambient database transaction; this method issues them back to back
    /// and relies on that surrounding transaction for atomicity, matching
    /// how the original relies on Postgres's own transactional machinery
    /// rather than an explicit two-phase commit.
    async fn confirm(&self, db: u32, holder: NodeId) -> anyhow::Result<()> {
        let slot = self
            .get_or_allocate_slot(db)
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
        let kind = slot.lock().await.kind;

        self.journal.promote(db, holder).await?;
        JOURNAL_PROMOTES.with_label_values(&[&db.to_string()]).inc();

        let payload = Payload::Confirm { target: holder, kind };
        debug_assert!(payload.is_transactional());
        let lsn = self.transport.log_standby_message(&payload).await?;
        self.transport.xlog_flush(lsn).await?;
        Ok(())
    }

    /// Remote `CONFIRM(target, kind)` handler, on the requesting node.
    async fn on_confirm(&self, db: u32, _origin: NodeId, target: NodeId, kind: LockKind) -> anyhow::Result<()> {
        let local_node = self.transport.local_node_id();
        if target != local_node {
            return Ok(());
        }
        let slot = self
            .get_or_allocate_slot(db)
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
        let wake = {
            let mut guard = slot.lock().await;
            if guard.kind != kind {
                warn!(db, ?kind, current = ?guard.kind, "CONFIRM with mismatched kind, ignoring");
                return Ok(());
            }
            guard.acquire_confirmed += 1;
            guard.requestor_wake.clone()
        };
        if let Some(wake) = wake {
            wake.wake();
        }
        Ok(())
    }

    /// Remote `DECLINE(target, kind)` handler, mirror of [`Self::on_confirm`].
    async fn on_decline(&self, db: u32, _origin: NodeId, target: NodeId, kind: LockKind) -> anyhow::Result<()> {
        let local_node = self.transport.local_node_id();
        if target != local_node {
            return Ok(());
        }
        let slot = self
            .get_or_allocate_slot(db)
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
        let wake = {
            let mut guard = slot.lock().await;
            if guard.kind != kind {
                warn!(db, ?kind, current = ?guard.kind, "DECLINE with mismatched kind, ignoring");
                return Ok(());
            }
            guard.acquire_declined += 1;
            guard.requestor_wake.clone()
        };
        if let Some(wake) = wake {
            wake.wake();
        }
        Ok(())
    }

    /// Remote `RELEASE(target)` handler.
    async fn on_release(&self, db: u32, _origin: NodeId, target: NodeId) -> anyhow::Result<()> {
        let removed = self.journal.delete(db, target).await?;
        if removed == 0 {
            warn!(db, %target, "RELEASE for target with no journal row");
        } else {
            JOURNAL_DELETES.with_label_values(&[&db.to_string()]).inc();
        }

        let slot = self
            .get_or_allocate_slot(db)
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
        let wake = {
            let mut guard = slot.lock().await;
            if guard.held == 0 {
                warn!(db, "RELEASE when held == 0");
                return Ok(());
            }
            guard.held -= 1;
            guard.holder = None;
            guard.kind = LockKind::None;
            guard.clear_acquire_counters();
            if guard.held == 0 {
                guard.drain_waiters();
            }
            guard.requestor_wake.take()
        };
        if let Some(wake) = wake {
            wake.wake();
        }
        Ok(())
    }

    /// Remote `START(origin)` handler: `origin` crashed. Deletes every
    /// journal row it held across every database this process manages
    /// (spec §11: the cleanup is unconditional, not scoped to one
    /// database slot), clearing in-memory state and draining waiters for
    /// each slot it actually held a lock in. Idempotent: processing the
    /// same `START` twice finds nothing left to clear the second time.
    async fn on_start(&self, origin: NodeId) -> anyhow::Result<()> {
        let removed = self.journal.delete_all_for_holder(origin).await?;
        debug!(%origin, removed, "cleared journal rows for crashed node");

        let slots: Vec<_> = self.slots.lock().await.iter().flatten().cloned().collect();
        for slot in slots {
            let wake = {
                let mut guard = slot.lock().await;
                if guard.holder != Some(origin) {
                    None
                } else {
                    if guard.held == 0 {
                        warn!(%origin, db = guard.db, "START cleanup found holder set with held == 0");
                    }
                    guard.held = guard.held.saturating_sub(1);
                    guard.holder = None;
                    guard.kind = LockKind::None;
                    guard.clear_acquire_counters();
                    if guard.held == 0 {
                        guard.drain_waiters();
                    }
                    guard.requestor_wake.take()
                }
            };
            if let Some(wake) = wake {
                wake.wake();
            }
        }
        Ok(())
    }
}

/// Returned by [`Coordinator::acquire`] on success. Dropping it without
/// calling [`LockGuard::release`] logs a warning and spawns a background
/// release, the same "don't leak the lock even on a panicking caller"
/// guarantee spec's transaction-end hook provides; callers integrating a
/// real transaction manager should call `release` explicitly from their
/// commit/abort path instead of relying on `Drop`.
pub struct LockGuard {
    coordinator: Arc<Coordinator>,
    db: u32,
    released: AtomicBool,
}

impl LockGuard {
    fn new(coordinator: Arc<Coordinator>, db: u32) -> Self {
        LockGuard {
            coordinator,
            db,
            released: AtomicBool::new(false),
        }
    }

    /// The database this guard holds the lock for.
    pub fn db(&self) -> u32 {
        self.db
    }

    /// A guard for the "already held at least this kind" no-op success
    /// case: it owns nothing and releases nothing when dropped, since the
    /// transaction's original guard already owns the real release.
    fn noop(coordinator: Arc<Coordinator>, db: u32) -> Self {
        LockGuard {
            coordinator,
            db,
            released: AtomicBool::new(true),
        }
    }

    pub async fn release(self) -> anyhow::Result<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            // already released (or a noop guard, constructed pre-released):
            // nothing to do, and in particular nothing to clobber on some
            // other transaction's real holder of this database.
            return Ok(());
        }
        self.coordinator.release(self.db).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let coordinator = self.coordinator.clone();
        let db = self.db;
        warn!(db, "LockGuard dropped without explicit release");
        tokio::spawn(async move {
            if let Err(e) = coordinator.release(db).await {
                tracing::error!(db, error = %e, "background release on drop failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::InMemoryJournal;
    use crate::transport::LoopbackTransport;
    use crate::waiter_gate::WriterRegistry;
    use async_trait::async_trait;

    struct NoWriters;

    #[async_trait]
    impl WriterRegistry for NoWriters {
        async fn active_writers(&self, _db: u32, _exclude: Option<WriterId>) -> Vec<WriterId> {
            Vec::new()
        }
        async fn cancel(&self, _writer: WriterId) {}
    }

    fn node(n: u64) -> NodeId {
        NodeId::new(n, 1, 5)
    }

    fn coordinator_for(local: NodeId) -> (Arc<Coordinator>, Arc<LoopbackTransport>) {
        let transport = Arc::new(LoopbackTransport::new(local));
        let coordinator = Coordinator::new(
            Config::dummy(),
            Arc::new(InMemoryJournal::new()),
            transport.clone(),
            Arc::new(NoWriters),
        );
        coordinator.mark_locked_and_loaded();
        (coordinator, transport)
    }

    #[tokio::test]
    async fn not_ready_when_no_peers() {
        let (coordinator, _t) = coordinator_for(node(1));
        let err = coordinator
            .acquire(7, LockKind::Ddl, LockKind::None)
            .await
            .unwrap_err();
        assert_eq!(err, CoordinatorError::NotReady);
    }

    #[tokio::test]
    async fn permission_denied_when_not_permitted() {
        let transport = Arc::new(LoopbackTransport::new(node(1)));
        let mut config = Config::dummy();
        config.permit_ddl_locking = false;
        let coordinator = Coordinator::new(
            config,
            Arc::new(InMemoryJournal::new()),
            transport,
            Arc::new(NoWriters),
        );
        coordinator.mark_locked_and_loaded();
        coordinator.set_peer_count(7, 1).await.unwrap();
        let err = coordinator
            .acquire(7, LockKind::Ddl, LockKind::None)
            .await
            .unwrap_err();
        assert_eq!(err, CoordinatorError::PermissionDenied);
    }

    #[tokio::test]
    async fn already_held_kind_is_a_local_noop() {
        let (coordinator, _t) = coordinator_for(node(1));
        coordinator.set_peer_count(7, 1).await.unwrap();
        let guard = coordinator
            .acquire(7, LockKind::Ddl, LockKind::Write)
            .await
            .unwrap();
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn peer_acquire_on_idle_database_grants_ddl_immediately() {
        let (coordinator, _t) = coordinator_for(node(1));
        coordinator.on_acquire(7, node(2), LockKind::Ddl).await.unwrap();
        let slot = coordinator.get_or_allocate_slot(7).await.unwrap();
        let guard = slot.lock().await;
        assert_eq!(guard.held, 1);
        assert_eq!(guard.holder, Some(node(2)));
    }

    #[tokio::test]
    async fn conflicting_peer_acquire_is_declined() {
        let (coordinator, transport) = coordinator_for(node(1));
        let mut rx = transport.subscribe().await;
        coordinator.on_acquire(7, node(2), LockKind::Ddl).await.unwrap();
        coordinator.on_acquire(7, node(3), LockKind::Ddl).await.unwrap();

        let mut saw_decline = false;
        while let Ok((_, payload)) = rx.try_recv() {
            if matches!(payload, Payload::Decline { target, .. } if target == node(3)) {
                saw_decline = true;
            }
        }
        assert!(saw_decline, "node(3)'s rejected ACQUIRE should be the DECLINE target");
    }

    #[tokio::test]
    async fn start_cleanup_is_idempotent() {
        let (coordinator, _t) = coordinator_for(node(1));
        coordinator.on_acquire(7, node(2), LockKind::Ddl).await.unwrap();
        coordinator.on_start(node(2)).await.unwrap();
        let slot = coordinator.get_or_allocate_slot(7).await.unwrap();
        assert_eq!(slot.lock().await.held, 0);
        // second START for the same origin is a no-op, not a panic.
        coordinator.on_start(node(2)).await.unwrap();
    }
}
