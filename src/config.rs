//! Time-integration configuration
//!
//! Plain serde-backed parameter structs, validated once at setup.
//! Configuration-validity errors are fatal before any stepping begins.

use serde::{Deserialize, Serialize};

use crate::bdf::MAX_ORDER;
use crate::error::{Result, TimeIntError};
use crate::oif::OifConfig;
use crate::timestep::StepSizePolicy;

/// Spatial scheme variant driving the per-step solve dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemeKind {
    /// Monolithic velocity-pressure solve (linear or Newton)
    Coupled,
    /// Segregated momentum -> pressure Poisson -> velocity correction
    PressureCorrection,
}

/// Treatment of the convective term
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvectiveTreatment {
    /// No convective term (Stokes problem)
    None,
    /// Explicit extrapolation from cached evaluations at previous levels
    Explicit,
    /// Implicit, solved by Newton iteration
    Implicit,
}

/// Parameters of the time-integration core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeIntConfig {
    pub start_time: f64,
    pub end_time: f64,
    /// Hard step budget; the loop stops at whichever of end time or budget
    /// is reached first
    pub max_steps: usize,

    /// Maximum BDF order, 1..=4
    pub max_order: usize,
    /// Ramp the order up from 1 during the first steps; if false, former
    /// solution levels are seeded analytically and the full order is used
    /// from step one
    pub start_with_low_order: bool,

    pub scheme: SchemeKind,
    pub convective: ConvectiveTreatment,
    /// Operator-integration-factor sub-stepping of the convective term;
    /// requires explicit convective treatment
    pub oif: Option<OifConfig>,

    pub step_size: StepSizePolicy,

    /// The pressure is defined only up to a constant (pure Neumann or
    /// periodic boundary conditions); the mean-value shift after each solve
    /// is mandatory in that case
    pub pure_neumann_pressure: bool,

    /// Add the continuity-penalty contribution of the extrapolated velocity
    /// to the momentum right-hand side
    pub continuity_penalty: bool,

    /// Emit solver info every this many steps (0 disables)
    pub solver_info_interval: usize,
}

impl TimeIntConfig {
    /// Validate the configuration. Called once at setup; any error aborts
    /// before stepping begins.
    pub fn validate(&self) -> Result<()> {
        if self.max_order == 0 || self.max_order > MAX_ORDER {
            return Err(TimeIntError::InvalidOrder {
                order: self.max_order,
                max: MAX_ORDER,
            });
        }
        if !(self.end_time > self.start_time) {
            return Err(TimeIntError::InvalidConfiguration(format!(
                "end time {} must exceed start time {}",
                self.end_time, self.start_time
            )));
        }
        if self.max_steps == 0 {
            return Err(TimeIntError::InvalidConfiguration(
                "max_steps must be positive".into(),
            ));
        }

        match self.step_size {
            StepSizePolicy::Fixed { dt } => {
                if !(dt > 0.0) {
                    return Err(TimeIntError::InvalidConfiguration(format!(
                        "fixed step size {} must be positive",
                        dt
                    )));
                }
            }
            StepSizePolicy::AdaptiveCfl {
                cfl,
                initial_dt,
                exponent_degree: _,
            } => {
                if !(cfl > 0.0) || !(initial_dt > 0.0) {
                    return Err(TimeIntError::InvalidConfiguration(
                        "adaptive stepping requires positive cfl and initial_dt".into(),
                    ));
                }
            }
        }

        if let Some(oif) = &self.oif {
            if self.convective != ConvectiveTreatment::Explicit {
                return Err(TimeIntError::InvalidConfiguration(
                    "OIF sub-stepping requires explicit convective treatment".into(),
                ));
            }
            let cfl = match self.step_size {
                StepSizePolicy::AdaptiveCfl { cfl, .. } => cfl,
                // Fixed stepping still needs the cfl/cfl_oif ratio to pick
                // the sub-step count
                StepSizePolicy::Fixed { .. } => oif.cfl,
            };
            if !(oif.cfl_oif > 0.0) || oif.cfl_oif > cfl {
                return Err(TimeIntError::InvalidConfiguration(format!(
                    "OIF cfl {} must be positive and no larger than the global cfl {}",
                    oif.cfl_oif, cfl
                )));
            }
        }

        if self.convective == ConvectiveTreatment::Implicit && self.scheme != SchemeKind::Coupled {
            return Err(TimeIntError::InvalidConfiguration(
                "implicit convective treatment requires the coupled scheme".into(),
            ));
        }

        Ok(())
    }

    /// Global CFL target used by the OIF sub-step count
    pub(crate) fn global_cfl(&self) -> f64 {
        match self.step_size {
            StepSizePolicy::AdaptiveCfl { cfl, .. } => cfl,
            StepSizePolicy::Fixed { .. } => self.oif.as_ref().map(|o| o.cfl).unwrap_or(1.0),
        }
    }
}
