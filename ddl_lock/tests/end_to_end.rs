//! Drives the end-to-end scenarios of spec §8 across two in-process
//! `Coordinator`s wired together by a shared `LoopbackTransport` per node,
//! in the style of the teacher's dedicated `tests/` directories (e.g.
//! `libs/postgres_backend/tests/`) rather than an inline `#[cfg(test)]`
//! module, since these scenarios span multiple `Coordinator` instances at
//! once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ddl_lock::config::Config;
use ddl_lock::coordinator::Coordinator;
use ddl_lock::journal::InMemoryJournal;
use ddl_lock::lock_state::LockKind;
use ddl_lock::protocol::{InboundMessage, Payload};
use ddl_lock::transport::{LoopbackTransport, Transport};
use ddl_lock::waiter_gate::{WriterId, WriterRegistry};
use ddl_lock::CoordinatorError;
use utils::id::NodeId;

struct NoWriters;

#[async_trait]
impl WriterRegistry for NoWriters {
    async fn active_writers(&self, _db: u32, _exclude: Option<WriterId>) -> Vec<WriterId> {
        Vec::new()
    }
    async fn cancel(&self, _writer: WriterId) {}
}

fn node(n: u64) -> NodeId {
    NodeId::new(n, 1, 9)
}

struct Peer {
    coordinator: Arc<Coordinator>,
    transport: Arc<LoopbackTransport>,
}

async fn spin_up(id: NodeId, db: u32, peer_count: usize) -> Peer {
    let transport = Arc::new(LoopbackTransport::new(id));
    let coordinator = Coordinator::new(
        Config::dummy(),
        Arc::new(InMemoryJournal::new()),
        transport.clone(),
        Arc::new(NoWriters),
    );
    coordinator.mark_locked_and_loaded();
    coordinator.set_peer_count(db, peer_count).await.unwrap();
    Peer {
        coordinator,
        transport,
    }
}

/// Wires `from`'s outgoing stream into `to`'s inbound dispatch for `db`,
/// standing in for one apply worker.
fn bridge(db: u32, from: &Peer, to: &Peer) {
    let to_coordinator = to.coordinator.clone();
    let transport = from.transport.clone();
    tokio::spawn(async move {
        let mut rx = transport.subscribe().await;
        while let Some((origin, payload)) = rx.recv().await {
            let _ = to_coordinator
                .dispatch(db, InboundMessage { origin, payload })
                .await;
        }
    });
}

fn wire_pair(db: u32, a: &Peer, b: &Peer) {
    bridge(db, a, b);
    bridge(db, b, a);
}

#[tokio::test]
async fn two_node_ddl_acquisition() {
    let db = 7;
    let a = spin_up(node(1), db, 1).await;
    let b = spin_up(node(2), db, 1).await;
    wire_pair(db, &a, &b);

    let guard = a
        .coordinator
        .acquire(db, LockKind::Ddl, LockKind::None)
        .await
        .expect("A should acquire the DDL lock with one confirming peer");
    guard.release().await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(a.coordinator.held_count(db).await.unwrap(), 0);
    assert_eq!(b.coordinator.held_count(db).await.unwrap(), 0);
}

#[tokio::test]
async fn concurrent_acquires_both_decline() {
    let db = 7;
    let a = spin_up(node(1), db, 1).await;
    let b = spin_up(node(2), db, 1).await;
    wire_pair(db, &a, &b);

    let (a_result, b_result) = tokio::join!(
        a.coordinator.acquire(db, LockKind::Ddl, LockKind::None),
        b.coordinator.acquire(db, LockKind::Ddl, LockKind::None),
    );

    assert!(matches!(
        a_result,
        Err(CoordinatorError::LockUnavailable { .. })
    ));
    assert!(matches!(
        b_result,
        Err(CoordinatorError::LockUnavailable { .. })
    ));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(a.coordinator.held_count(db).await.unwrap(), 0);
    assert_eq!(b.coordinator.held_count(db).await.unwrap(), 0);
}

#[tokio::test]
async fn write_lock_drains_then_grants_across_two_nodes() {
    let db = 2;
    let a = spin_up(node(1), db, 1).await;
    let b = spin_up(node(2), db, 1).await;
    wire_pair(db, &a, &b);

    let guard = a
        .coordinator
        .acquire(db, LockKind::Write, LockKind::None)
        .await
        .expect("write lock should be granted once B's replay-drain completes");
    guard.release().await.unwrap();
}

#[tokio::test]
async fn crash_mid_catchup_recovers_via_start_cleanup() {
    let db = 3;
    let b = spin_up(node(2), db, 1).await;
    let crashed_peer = node(1);

    b.coordinator
        .dispatch(
            db,
            InboundMessage {
                origin: crashed_peer,
                payload: Payload::Acquire {
                    kind: LockKind::Ddl,
                },
            },
        )
        .await
        .unwrap();
    assert_eq!(b.coordinator.held_count(db).await.unwrap(), 1);

    b.coordinator
        .dispatch(
            db,
            InboundMessage {
                origin: crashed_peer,
                payload: Payload::Start,
            },
        )
        .await
        .unwrap();
    assert_eq!(b.coordinator.held_count(db).await.unwrap(), 0);

    // processing START twice is idempotent, not an error.
    b.coordinator
        .dispatch(
            db,
            InboundMessage {
                origin: crashed_peer,
                payload: Payload::Start,
            },
        )
        .await
        .unwrap();
    assert_eq!(b.coordinator.held_count(db).await.unwrap(), 0);
}

#[tokio::test]
async fn session_abort_after_partial_quorum_releases_cleanly() {
    let db = 4;
    let a = spin_up(node(1), db, 2).await;
    let b = spin_up(node(2), db, 2).await;
    let c = spin_up(node(3), db, 2).await;
    bridge(db, &a, &b);
    bridge(db, &a, &c);
    bridge(db, &b, &a);
    // deliberately no bridge from c to a: C never gets a chance to
    // acquire-confirm before the operator cancels.

    let handle = tokio::spawn({
        let coordinator = a.coordinator.clone();
        async move { coordinator.acquire(db, LockKind::Ddl, LockKind::None).await }
    });

    // give B time to confirm, then cancel before C ever sees the ACQUIRE.
    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.abort();

    // A's acquire never returned, so its own guard was never constructed;
    // the scenario's "operator cancels" is simulated the way the xact-abort
    // path would trigger it: emit the RELEASE over the wire (so bridged
    // peers see it, exactly as `Coordinator::release` would) and also feed
    // it back through A's own dispatch demux to reset its local state,
    // since a node never bridges its own transport back to itself.
    let local_node = node(1);
    let lsn = a
        .transport
        .log_standby_message(&Payload::Release { target: local_node })
        .await
        .unwrap();
    a.transport.xlog_flush(lsn).await.unwrap();
    a.coordinator
        .dispatch(
            db,
            InboundMessage {
                origin: local_node,
                payload: Payload::Release { target: local_node },
            },
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(b.coordinator.held_count(db).await.unwrap(), 0);
}

#[tokio::test]
async fn local_writer_blocks_then_wakes_on_release() {
    let db = 5;
    let a = spin_up(node(1), db, 1).await;
    let b = spin_up(node(2), db, 1).await;
    wire_pair(db, &a, &b);

    let guard = a
        .coordinator
        .acquire(db, LockKind::Write, LockKind::None)
        .await
        .unwrap();

    let coordinator = a.coordinator.clone();
    let waiter = tokio::spawn(async move { coordinator.check_dml(db, None).await.unwrap() });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(
        !waiter.is_finished(),
        "a second local writer must block behind the held write lock"
    );

    guard.release().await.unwrap();

    tokio::time::timeout(Duration::from_millis(200), waiter)
        .await
        .expect("blocked writer should wake once the lock is released")
        .unwrap();
}
