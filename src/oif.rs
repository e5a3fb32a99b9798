//! Operator-integration-factor (OIF) sub-stepping
//!
//! Instead of extrapolating cached convective-term evaluations, the OIF
//! splitting advances the hyperbolic sub-problem
//!
//! ```text
//! d u~ / dt = -M^{-1} C(u~, t)
//! ```
//!
//! with an explicit Runge-Kutta scheme on a finer sub-grid of steps inside
//! the implicit outer step. One independent sub-stepping pass is run per
//! retained history level: level `i` is seeded from `history[i]` and
//! transported from t_{n-i} to t_{n+1}; each level contributes the
//! difference quotient `(u~_i - u_i) / dt_i` of its own transport interval.
//! The weighted sum `sum(beta_i * (u~_i - u_i) / dt_i)` is consumed by the
//! step controller in place of the extrapolated convective-term cache. For
//! a single Euler sub-step per outer step this reduces exactly to the
//! extrapolation of `-M^{-1} C(u_i)`, i.e. the non-OIF explicit path.
//!
//! The sub-step state (local solution, stage slopes) lives only for the
//! duration of one pass and never persists across outer steps.

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TimeIntError};
use crate::history::HistoryBuffer;
use crate::operator::{Contribution, PdeOperator};
use crate::state::FlowState;

/// Explicit Runge-Kutta scheme used for the sub-steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OifScheme {
    ExplicitEuler,
    Rk2,
    Rk3,
    Rk4,
}

impl OifScheme {
    pub fn order(&self) -> usize {
        match self {
            OifScheme::ExplicitEuler => 1,
            OifScheme::Rk2 => 2,
            OifScheme::Rk3 => 3,
            OifScheme::Rk4 => 4,
        }
    }

    fn stages(&self) -> usize {
        self.order()
    }
}

/// OIF configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OifConfig {
    pub scheme: OifScheme,
    /// Global CFL target (used for the sub-step count when the outer loop
    /// runs at a fixed step size)
    pub cfl: f64,
    /// Stricter CFL target of the explicit sub-integrator
    pub cfl_oif: f64,
}

/// Explicit sub-integrator for the convective term
///
/// All buffers are sized once at construction and reused across passes.
pub struct OifSubstepper {
    scheme: OifScheme,
    substeps: usize,
    solution: DVector<f64>,
    stages: Vec<DVector<f64>>,
    stage_state: DVector<f64>,
    conv: DVector<f64>,
}

impl OifSubstepper {
    /// Set up the sub-stepper. The sub-step count per outer step is
    /// `m = ceil(cfl / cfl_oif)`, the ratio of the global CFL target to the
    /// stricter OIF target.
    pub fn new(config: &OifConfig, global_cfl: f64, n_velocity: usize) -> Result<Self> {
        let ratio = global_cfl / config.cfl_oif;
        let substeps = if ratio.is_finite() && ratio > 0.0 {
            ratio.ceil() as usize
        } else {
            0
        };
        if substeps < 1 {
            return Err(TimeIntError::InvalidSubstepCount(substeps));
        }

        Ok(Self {
            scheme: config.scheme,
            substeps,
            solution: DVector::zeros(n_velocity),
            stages: vec![DVector::zeros(n_velocity); config.scheme.stages()],
            stage_state: DVector::zeros(n_velocity),
            conv: DVector::zeros(n_velocity),
        })
    }

    /// Sub-step count per outer step
    pub fn substeps(&self) -> usize {
        self.substeps
    }

    /// Run one sub-stepping pass over all retained history levels.
    ///
    /// # Arguments
    /// * `history` - solution history, `history[i]` at t_{n-i}
    /// * `beta` - extrapolation weights of the current step, length is the
    ///   number of levels to transport
    /// * `step_sizes` - step-size ring, most recent first; `step_sizes[0]`
    ///   is the outer step being taken
    /// * `outer_end_time` - t_{n+1}
    /// * `contribution` - receives `sum(beta_i * (u~_i - u_i) / dt_i)` in
    ///   velocity space (inverse mass included, outer mass application left
    ///   to the caller)
    pub fn run(
        &mut self,
        op: &dyn PdeOperator,
        history: &HistoryBuffer<FlowState>,
        beta: &[f64],
        step_sizes: &[f64],
        outer_end_time: f64,
        contribution: &mut DVector<f64>,
    ) -> Result<()> {
        let outer_dt = step_sizes[0];
        let dt_sub_target = outer_dt / self.substeps as f64;

        contribution.fill(0.0);

        for (i, &beta_i) in beta.iter().enumerate() {
            // Level i is transported over [t_{n-i}, t_{n+1}]
            let interval: f64 = step_sizes[..=i].iter().sum();
            let start_time = outer_end_time - interval;

            let m_i = (interval / dt_sub_target).ceil().max(1.0) as usize;
            let dt_sub = interval / m_i as f64;

            self.solution.copy_from(&history.get(i)?.velocity);
            let mut t = start_time;
            for _ in 0..m_i {
                self.advance_substep(op, t, dt_sub)?;
                t += dt_sub;
            }

            // Difference quotient of this level's transport
            self.solution.axpy(-1.0, &history.get(i)?.velocity, 1.0);
            contribution.axpy(beta_i / interval, &self.solution, 1.0);
        }

        Ok(())
    }

    /// One explicit Runge-Kutta step of the negative convective term
    /// composed with the inverse mass operator
    fn advance_substep(&mut self, op: &dyn PdeOperator, t: f64, dt: f64) -> Result<()> {
        match self.scheme {
            OifScheme::ExplicitEuler => {
                self.eval_stage(op, 0, t, None)?;
                self.solution.axpy(dt, &self.stages[0], 1.0);
            }
            OifScheme::Rk2 => {
                // Midpoint rule
                self.eval_stage(op, 0, t, None)?;
                self.eval_stage(op, 1, t + 0.5 * dt, Some(&[(0, 0.5 * dt)]))?;
                self.solution.axpy(dt, &self.stages[1], 1.0);
            }
            OifScheme::Rk3 => {
                // Kutta's third-order rule
                self.eval_stage(op, 0, t, None)?;
                self.eval_stage(op, 1, t + 0.5 * dt, Some(&[(0, 0.5 * dt)]))?;
                self.eval_stage(op, 2, t + dt, Some(&[(0, -dt), (1, 2.0 * dt)]))?;
                self.solution.axpy(dt / 6.0, &self.stages[0], 1.0);
                self.solution.axpy(4.0 * dt / 6.0, &self.stages[1], 1.0);
                self.solution.axpy(dt / 6.0, &self.stages[2], 1.0);
            }
            OifScheme::Rk4 => {
                // Classical RK4
                self.eval_stage(op, 0, t, None)?;
                self.eval_stage(op, 1, t + 0.5 * dt, Some(&[(0, 0.5 * dt)]))?;
                self.eval_stage(op, 2, t + 0.5 * dt, Some(&[(1, 0.5 * dt)]))?;
                self.eval_stage(op, 3, t + dt, Some(&[(2, dt)]))?;
                self.solution.axpy(dt / 6.0, &self.stages[0], 1.0);
                self.solution.axpy(2.0 * dt / 6.0, &self.stages[1], 1.0);
                self.solution.axpy(2.0 * dt / 6.0, &self.stages[2], 1.0);
                self.solution.axpy(dt / 6.0, &self.stages[3], 1.0);
            }
        }
        Ok(())
    }

    /// Evaluate stage slope `stage` at the state
    /// `solution + sum(weight * stages[j])`
    fn eval_stage(
        &mut self,
        op: &dyn PdeOperator,
        stage: usize,
        t: f64,
        increments: Option<&[(usize, f64)]>,
    ) -> Result<()> {
        self.stage_state.copy_from(&self.solution);
        if let Some(increments) = increments {
            for &(j, w) in increments {
                self.stage_state.axpy(w, &self.stages[j], 1.0);
            }
        }

        self.conv.fill(0.0);
        op.evaluate(Contribution::Convective, &mut self.conv, &self.stage_state, t)?;
        op.apply_inverse_mass(&mut self.stages[stage], &self.conv)?;
        self.stages[stage].neg_mut();
        Ok(())
    }
}
