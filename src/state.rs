//! Solution and time-level state
//!
//! [`FlowState`] is one snapshot of the discrete solution (velocity and
//! pressure coefficient vectors). Snapshots may be large distributed arrays,
//! so they are moved between history slots by ownership transfer, never
//! copied per step.
//!
//! [`TimeState`] is the bookkeeping of the outer time discretization:
//! current time, step index, the ring of previous step sizes and the current
//! scheme order (which ramps up from 1 during startup unless disabled).

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TimeIntError};

/// One snapshot of the discrete solution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowState {
    pub velocity: DVector<f64>,
    pub pressure: DVector<f64>,
}

impl FlowState {
    pub fn zeros(n_velocity: usize, n_pressure: usize) -> Self {
        Self {
            velocity: DVector::zeros(n_velocity),
            pressure: DVector::zeros(n_pressure),
        }
    }

    pub fn zeros_like(other: &Self) -> Self {
        Self::zeros(other.velocity.len(), other.pressure.len())
    }

    /// self = a * other
    pub fn set_scaled(&mut self, a: f64, other: &Self) {
        self.velocity.copy_from(&other.velocity);
        self.velocity *= a;
        self.pressure.copy_from(&other.pressure);
        self.pressure *= a;
    }

    /// self += a * other
    pub fn add_scaled(&mut self, a: f64, other: &Self) {
        self.velocity.axpy(a, &other.velocity, 1.0);
        self.pressure.axpy(a, &other.pressure, 1.0);
    }

    pub fn fill(&mut self, value: f64) {
        self.velocity.fill(value);
        self.pressure.fill(value);
    }
}

/// Time-level bookkeeping of the BDF scheme
///
/// The step-size ring is ordered most-recent first: `step_sizes()[0]` is the
/// size of the step currently being taken (or just taken). The ring always
/// holds `max_order` entries so that `len >= current order` is maintained by
/// construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeState {
    time: f64,
    step_number: usize,
    step_sizes: Vec<f64>,
    order: usize,
    max_order: usize,
    start_with_low_order: bool,
}

impl TimeState {
    pub fn new(
        start_time: f64,
        initial_dt: f64,
        max_order: usize,
        start_with_low_order: bool,
    ) -> Self {
        Self {
            time: start_time,
            step_number: 0,
            step_sizes: vec![initial_dt; max_order],
            order: if start_with_low_order { 1 } else { max_order },
            max_order,
            start_with_low_order,
        }
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    /// Index of the step about to be taken (0-based)
    pub fn step_number(&self) -> usize {
        self.step_number
    }

    /// Current effective scheme order
    pub fn order(&self) -> usize {
        self.order
    }

    pub fn max_order(&self) -> usize {
        self.max_order
    }

    /// Previous step sizes, most recent first
    pub fn step_sizes(&self) -> &[f64] {
        &self.step_sizes
    }

    /// Size of the step currently being taken
    pub fn current_dt(&self) -> f64 {
        self.step_sizes[0]
    }

    /// Install the size of the upcoming step, shifting the ring back.
    pub fn push_step_size(&mut self, dt: f64) {
        self.step_sizes.rotate_right(1);
        self.step_sizes[0] = dt;
    }

    /// Complete the current step: advance time, bump the step index, ramp
    /// the order during startup.
    pub fn advance(&mut self) {
        self.time += self.step_sizes[0];
        self.step_number += 1;
        if self.start_with_low_order {
            self.order = (self.step_number + 1).min(self.max_order);
        }
    }

    /// Check the order stored in a restart record against the configured one.
    pub fn check_restart_order(&self, stored_max_order: usize) -> Result<()> {
        if stored_max_order != self.max_order {
            return Err(TimeIntError::RestartOrderMismatch {
                stored: stored_max_order,
                configured: self.max_order,
            });
        }
        Ok(())
    }
}
