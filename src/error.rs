//! Error taxonomy of the time-integration core
//!
//! Configuration-validity errors are detected at setup and abort before any
//! stepping begins. Per-step numerical failures (`SolverDidNotConverge`) are
//! fatal: the run aborts with full diagnostic context, there is no automatic
//! step-size back-off.

use thiserror::Error;

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, TimeIntError>;

/// Errors produced by the time-integration core
#[derive(Error, Debug)]
pub enum TimeIntError {
    #[error("BDF order {order} not supported (must be 1..={max})")]
    InvalidOrder { order: usize, max: usize },

    #[error("History access {index} out of range (depth {depth})")]
    OutOfRange { index: usize, depth: usize },

    #[error("OIF sub-step count {0} is invalid (must be >= 1)")]
    InvalidSubstepCount(usize),

    #[error(
        "Solver did not converge at step {step} (t = {time:.6e}) after {iterations} iterations"
    )]
    SolverDidNotConverge {
        step: usize,
        time: f64,
        iterations: usize,
    },

    #[error("Restart was written with BDF order {stored}, configured order is {configured}")]
    RestartOrderMismatch { stored: usize, configured: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Restart I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Restart serialization failed: {0}")]
    Serialization(#[from] bincode::Error),
}

impl TimeIntError {
    /// Construct a non-convergence error without step context.
    ///
    /// Facade implementations report the iteration count only; the step
    /// controller attaches step number and time on the way up.
    pub fn solver_did_not_converge(iterations: usize) -> Self {
        Self::SolverDidNotConverge {
            step: 0,
            time: 0.0,
            iterations,
        }
    }

    pub(crate) fn with_step_context(self, step: usize, time: f64) -> Self {
        match self {
            Self::SolverDidNotConverge { iterations, .. } => Self::SolverDidNotConverge {
                step,
                time,
                iterations,
            },
            other => other,
        }
    }
}
