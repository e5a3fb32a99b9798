//! Process-parallel context
//!
//! Parallelism is data-parallel across processes via collective
//! communication. The core only needs blocking reductions of scalar
//! quantities (CFL maxima, residual norms); the communicator is passed
//! explicitly into every component that performs one, never held as global
//! state. An MPI-backed implementation lives with the application, the
//! in-crate [`SerialComm`] covers single-process runs and tests.

/// Collective operations required by the time-integration core
pub trait Communicator: Send + Sync {
    /// Blocking all-reduce with max: every process receives the global
    /// maximum of `local`.
    fn all_reduce_max(&self, local: f64) -> f64;

    /// Rank of this process within the communicator
    fn rank(&self) -> usize;

    /// True on the rank that should emit log output
    fn is_root(&self) -> bool {
        self.rank() == 0
    }
}

/// Single-process communicator: every reduction is the identity
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialComm;

impl Communicator for SerialComm {
    fn all_reduce_max(&self, local: f64) -> f64 {
        local
    }

    fn rank(&self) -> usize {
        0
    }
}
