//! Gates user DML against the lock (spec §4.5). Consulted at the start of
//! every user write and, separately, drives the cancel-and-drain step
//! that precedes granting a `Write`-class lock to a peer.
//!
//! The FIFO-registration-then-wait shape is grounded on
//! `safekeeper::send_wal::WalSenders::register`, whose `WalSenderGuard`
//! is pushed into a shared slot and removed by `Drop`; here a waiter
//! pushes its own [`WakeHandle`][crate::lock_state::WakeHandle] onto the
//! slot's FIFO and is removed by the Coordinator's drain on release
//! rather than by its own `Drop`, since draining must happen in arrival
//! order rather than whenever any individual waiter happens to be
//! dropped.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;
use utils::backoff::delay_for_attempt;

use crate::lock_state::{LockState, WakeHandle};
use crate::metrics::{CANCEL_AND_DRAIN_SECONDS, WAITERS_QUEUED};

/// Opaque identifier for a backend/session the executor hook can cancel.
pub type WriterId = u64;

/// The executor's registry of in-progress writer sessions, external to
/// this crate (spec §6 "Executor hook (caller)"). `cancel_and_drain`
/// enumerates through this trait rather than owning session state itself.
#[async_trait]
pub trait WriterRegistry: Send + Sync {
    /// Sessions with an in-progress write against `db`, other than
    /// `exclude` (the session that is itself about to become the
    /// holder, if any).
    async fn active_writers(&self, db: u32, exclude: Option<WriterId>) -> Vec<WriterId>;

    /// Requests cancellation of `writer`'s current transaction. Does not
    /// block for the cancellation to take effect; `cancel_and_drain`
    /// re-polls `active_writers` to observe it.
    async fn cancel(&self, writer: WriterId);
}

pub struct WaiterGate {
    writers: Arc<dyn WriterRegistry>,
    grace_timeout: Duration,
}

impl WaiterGate {
    pub fn new(writers: Arc<dyn WriterRegistry>, grace_timeout: Duration) -> Self {
        WaiterGate {
            writers,
            grace_timeout,
        }
    }

    /// Called at the top of every user write. Blocks until `ready`, then
    /// either returns immediately (no lock held, or caller already is the
    /// holder) or enqueues on the FIFO waiter queue and sleeps until
    /// woken by a release, re-checking on every wake (wakes can be
    /// spurious with respect to this particular waiter if several
    /// waiters were queued and only some of the backlog was relevant).
    pub async fn check_dml(
        &self,
        slot: &Mutex<LockState>,
        is_holder: impl Fn(&LockState) -> bool,
    ) {
        loop {
            {
                let guard = slot.lock().await;
                if !guard.ready {
                    drop(guard);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
                if guard.held == 0 || is_holder(&guard) {
                    return;
                }
            }
            let handle = WakeHandle::new();
            {
                let mut guard = slot.lock().await;
                // Re-check under the same critical section that registers
                // the waiter, so a release that happened between the
                // read above and this lock can't be missed.
                if guard.held == 0 || is_holder(&guard) {
                    return;
                }
                guard.waiters.push(handle.clone());
                WAITERS_QUEUED
                    .with_label_values(&[&guard.db.to_string()])
                    .set(guard.waiters.len() as i64);
            }
            handle.wait().await;
        }
    }

    /// Called internally before granting a `Write`-class lock. Enumerates
    /// conflicting writers in `db` (other than `exclude`, the
    /// to-be-holder) and, for each, allows a grace period with
    /// exponential backoff before forcibly cancelling it. Exits once no
    /// conflicting backend remains.
    pub async fn cancel_and_drain(&self, db: u32, exclude: Option<WriterId>) {
        let start = Instant::now();
        let deadline = start + self.grace_timeout;
        let mut attempt: u32 = 0;

        loop {
            let conflicting = self.writers.active_writers(db, exclude).await;
            if conflicting.is_empty() {
                break;
            }

            if Instant::now() >= deadline {
                for writer in &conflicting {
                    warn!(db, writer, "cancelling conflicting writer past grace period");
                    self.writers.cancel(*writer).await;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }

            let delay = delay_for_attempt(
                attempt,
                Duration::from_millis(1),
                Duration::from_secs(1),
            );
            tokio::time::sleep(delay.min(deadline.saturating_duration_since(Instant::now())))
                .await;
            attempt += 1;
        }

        CANCEL_AND_DRAIN_SECONDS
            .with_label_values(&[&db.to_string()])
            .observe(start.elapsed().as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tokio::sync::Mutex as TokioMutex;

    struct FakeWriters {
        remaining: TokioMutex<HashSet<WriterId>>,
    }

    #[async_trait]
    impl WriterRegistry for FakeWriters {
        async fn active_writers(&self, _db: u32, exclude: Option<WriterId>) -> Vec<WriterId> {
            self.remaining
                .lock()
                .await
                .iter()
                .copied()
                .filter(|w| Some(*w) != exclude)
                .collect()
        }

        async fn cancel(&self, writer: WriterId) {
            self.remaining.lock().await.remove(&writer);
        }
    }

    #[tokio::test]
    async fn drains_immediately_with_no_writers() {
        let writers = Arc::new(FakeWriters {
            remaining: TokioMutex::new(HashSet::new()),
        });
        let gate = WaiterGate::new(writers, Duration::from_secs(10));
        let start = Instant::now();
        gate.cancel_and_drain(1, None).await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn cancels_a_stuck_writer_after_grace_period() {
        let mut set = HashSet::new();
        set.insert(42u64);
        let writers = Arc::new(FakeWriters {
            remaining: TokioMutex::new(set),
        });
        let gate = WaiterGate::new(writers.clone(), Duration::from_millis(50));
        gate.cancel_and_drain(1, None).await;
        assert!(writers.remaining.lock().await.is_empty());
    }

    #[tokio::test]
    async fn check_dml_returns_immediately_when_not_held() {
        let slot = Mutex::new(LockState::new(1));
        slot.lock().await.ready = true;
        let writers = Arc::new(FakeWriters {
            remaining: TokioMutex::new(HashSet::new()),
        });
        let gate = WaiterGate::new(writers, Duration::from_secs(10));
        tokio::time::timeout(Duration::from_millis(100), gate.check_dml(&slot, |_| false))
            .await
            .expect("check_dml should not block");
    }

    #[tokio::test]
    async fn check_dml_wakes_on_release() {
        use crate::lock_state::LockKind;
        use utils::id::NodeId;

        let slot = Arc::new(Mutex::new(LockState::new(1)));
        {
            let mut guard = slot.lock().await;
            guard.ready = true;
            guard.held = 1;
            guard.holder = Some(NodeId::new(9, 0, 1));
            guard.kind = LockKind::Write;
        }

        let waiting_slot = slot.clone();
        let writers = Arc::new(FakeWriters {
            remaining: TokioMutex::new(HashSet::new()),
        });
        let gate = Arc::new(WaiterGate::new(writers, Duration::from_secs(10)));
        let waiter_gate = gate.clone();

        let handle = tokio::spawn(async move {
            waiter_gate.check_dml(&waiting_slot, |_| false).await;
        });

        // give the waiter time to register on the FIFO queue
        tokio::time::sleep(Duration::from_millis(20)).await;
        {
            let mut guard = slot.lock().await;
            guard.held = 0;
            guard.holder = None;
            guard.kind = LockKind::None;
            guard.drain_waiters();
        }

        tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .expect("waiter should wake after release")
            .unwrap();
    }
}
