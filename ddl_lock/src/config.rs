//! Runtime configuration, analogous to `safekeeper::SafeKeeperConf`:
//! a plain struct built via `clap::Parser` for the binary entry point,
//! and directly constructible (or `Config::dummy()`) for embedding and
//! tests.

use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "ddl_lock")]
pub struct Config {
    /// Any `acquire` fails with `PermissionDenied` if this is false.
    #[arg(long, default_value_t = false)]
    pub permit_ddl_locking: bool,

    /// Grace period, in milliseconds, that `cancel_and_drain` allows a
    /// conflicting writer to finish on its own before it is cancelled.
    #[arg(long, default_value_t = 10_000)]
    pub ddl_grace_timeout_ms: u64,

    /// Number of shared `LockState` slots; bounds how many local
    /// databases this process can track locks for at once.
    #[arg(long, default_value_t = 64)]
    pub max_databases: usize,

    /// Internal: set by the apply-worker runtime so it bypasses
    /// `check_dml`'s local-session gating (an apply worker replays
    /// already-locally-permitted writes and must not block on its own
    /// lock).
    #[arg(long, default_value_t = false)]
    pub skip_ddl_locking: bool,

    /// Connection string for the journal's backing Postgres database.
    #[arg(long, default_value = "")]
    pub journal_conninfo: String,
}

impl Config {
    pub fn ddl_grace_timeout(&self) -> Duration {
        Duration::from_millis(self.ddl_grace_timeout_ms)
    }

    /// A config suitable for tests and other embeddings that build their
    /// own `Config` in code rather than parsing `env::args()`.
    pub fn dummy() -> Self {
        Config {
            permit_ddl_locking: true,
            ddl_grace_timeout_ms: 10_000,
            max_databases: 8,
            skip_ddl_locking: false,
            journal_conninfo: String::new(),
        }
    }
}
