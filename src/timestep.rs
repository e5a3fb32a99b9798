//! Step-size selection
//!
//! Adaptive stepping derives the next step size from the CFL stability
//! bound `dt = cfl * h_min / (U_max * p^e)`, where `U_max` is the global
//! maximum velocity magnitude. The maximum must be reduced over all
//! parallel subdomains: a local-only maximum would silently mis-estimate
//! the stable step when work is unevenly distributed across processes.

use serde::{Deserialize, Serialize};

use crate::comm::Communicator;
use crate::error::{Result, TimeIntError};
use crate::operator::PdeOperator;

use nalgebra::DVector;

/// Step-size policy of the outer time loop
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum StepSizePolicy {
    /// Constant user-prescribed step size
    Fixed { dt: f64 },
    /// CFL-bounded adaptive stepping; `initial_dt` seeds the history before
    /// the first velocity field exists, `exponent_degree` is the exponent of
    /// the polynomial-degree penalty factor
    AdaptiveCfl {
        cfl: f64,
        initial_dt: f64,
        exponent_degree: f64,
    },
}

impl StepSizePolicy {
    /// Step size used to seed the history ring before the first step
    pub fn initial_dt(&self) -> f64 {
        match *self {
            StepSizePolicy::Fixed { dt } => dt,
            StepSizePolicy::AdaptiveCfl { initial_dt, .. } => initial_dt,
        }
    }

    /// Compute the size of the next step.
    ///
    /// Under fixed stepping the configured step size is returned
    /// unconditionally. Under adaptive stepping the CFL bound is evaluated
    /// with the globally reduced maximum velocity.
    pub fn next_step_size(
        &self,
        op: &dyn PdeOperator,
        comm: &dyn Communicator,
        velocity: &DVector<f64>,
    ) -> Result<f64> {
        match *self {
            StepSizePolicy::Fixed { dt } => Ok(dt),
            StepSizePolicy::AdaptiveCfl {
                cfl,
                exponent_degree,
                ..
            } => {
                let u_max = comm.all_reduce_max(op.max_local_velocity(velocity));
                if !(u_max > 0.0) {
                    return Err(TimeIntError::InvalidConfiguration(
                        "adaptive stepping requires a nonzero velocity field".into(),
                    ));
                }
                let degree_factor = (op.polynomial_degree() as f64).powf(exponent_degree);
                Ok(cfl * op.minimum_element_length() / (u_max * degree_factor))
            }
        }
    }

    /// Setup-time check of the adaptive policy against the initial velocity
    /// field; a zero field would make the first CFL bound undefined.
    pub fn validate_startup(
        &self,
        op: &dyn PdeOperator,
        comm: &dyn Communicator,
        velocity: &DVector<f64>,
    ) -> Result<()> {
        if let StepSizePolicy::AdaptiveCfl { .. } = self {
            self.next_step_size(op, comm, velocity).map(|_| ())
        } else {
            Ok(())
        }
    }
}
