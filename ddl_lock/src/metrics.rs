//! Ambient instrumentation, in the teacher's `Lazy<T> = Lazy::new(||
//! register_xxx!(...).expect(...))` idiom (compare
//! `safekeeper::metrics::WRITE_WAL_BYTES`).

use metrics::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge_vec, HistogramVec,
    IntCounterVec, IntGaugeVec, WAIT_SECONDS_BUCKETS,
};
use once_cell::sync::Lazy;

pub static ACQUIRES_GRANTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ddl_lock_acquires_granted_total",
        "Lock acquisitions granted, by kind",
        &["kind"]
    )
    .expect("failed to register ddl_lock_acquires_granted_total")
});

pub static ACQUIRES_DECLINED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ddl_lock_acquires_declined_total",
        "Lock acquisitions declined, by kind",
        &["kind"]
    )
    .expect("failed to register ddl_lock_acquires_declined_total")
});

pub static JOURNAL_PROMOTES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ddl_lock_journal_promotes_total",
        "Journal rows promoted from catchup to acquired, by database",
        &["db"]
    )
    .expect("failed to register ddl_lock_journal_promotes_total")
});

pub static JOURNAL_DELETES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ddl_lock_journal_deletes_total",
        "Journal rows deleted, by database",
        &["db"]
    )
    .expect("failed to register ddl_lock_journal_deletes_total")
});

pub static WAITERS_QUEUED: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "ddl_lock_waiters_queued",
        "Local DML sessions currently blocked behind the lock, by database",
        &["db"]
    )
    .expect("failed to register ddl_lock_waiters_queued")
});

pub static CANCEL_AND_DRAIN_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "ddl_lock_cancel_and_drain_seconds",
        "Time spent draining conflicting writers before granting a write lock",
        &["db"],
        WAIT_SECONDS_BUCKETS.to_vec()
    )
    .expect("failed to register ddl_lock_cancel_and_drain_seconds")
});
