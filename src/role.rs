use std::env;

/// Environment variable the supervisor sets on spawned workers.
pub const WORKER_ENV: &str = "SWITCHYARD_WORKER";

/// Prefix of the single control line a worker writes to stdout once its
/// listening socket is bound. Everything else a worker emits goes to stderr.
pub const READY_LINE_PREFIX: &str = "listening ";

/// Which half of the system this OS process runs. Decided once at startup;
/// never changes for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    /// The original process: spawns and monitors workers, serves no traffic
    Supervisor,
    /// A spawned process: binds the shared port and serves requests
    Worker,
}

impl ProcessRole {
    /// `Worker` iff the supervisor's marker variable is present in the
    /// environment.
    pub fn detect() -> Self {
        if env::var_os(WORKER_ENV).is_some() {
            ProcessRole::Worker
        } else {
            ProcessRole::Supervisor
        }
    }
}
