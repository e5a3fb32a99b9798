//! dgtime - BDF time integration and operator splitting for DG flow solvers
//!
//! This crate implements the time-integration core of a high-order
//! discontinuous-Galerkin solver for time-dependent PDE systems
//! (incompressible Navier-Stokes, convection-diffusion): multi-step implicit
//! BDF schemes with per-step extrapolation, explicit or implicit treatment of
//! the convective term, operator-integration-factor (OIF) sub-cycling, and
//! CFL-based adaptive step-size control.
//!
//! The spatial discretization is *not* implemented here. The core talks to it
//! through narrow traits ([`operator::PdeOperator`], [`operator::SpatialScheme`])
//! that evaluate operator contributions and perform the linear/nonlinear
//! solves of one time step. Postprocessing and mesh motion are likewise
//! collaborators behind traits.
//!
//! # Architecture
//!
//! - [`bdf`] - variable-step BDF coefficients (derivative stencil,
//!   extrapolation weights, mass-matrix scaling)
//! - [`history`] - swap-rotated solution history buffers
//! - [`step`] - the per-step cycle (extrapolate, assemble RHS, solve,
//!   post-correct, rotate history)
//! - [`oif`] - explicit sub-stepping of the convective term
//! - [`timestep`] - fixed or CFL-adaptive step-size selection
//! - [`timeloop`] - outer driver with postprocessing hooks and restart
//!   persistence
//!
//! # Example
//!
//! ```rust,ignore
//! use dgtime::prelude::*;
//!
//! let config = TimeIntConfig { /* ... */ };
//! let controller = StepController::new(config, scheme, Box::new(SerialComm), None)?;
//! let mut time_loop = TimeLoop::new(controller, Some(Box::new(postprocessor)));
//! let summary = time_loop.run()?;
//! ```

pub mod bdf;
pub mod comm;
pub mod config;
pub mod error;
pub mod history;
pub mod oif;
pub mod operator;
pub mod state;
pub mod step;
pub mod timeloop;
pub mod timestep;

pub use error::{Result, TimeIntError};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::bdf::BdfCoefficients;
    pub use crate::comm::{Communicator, SerialComm};
    pub use crate::config::{ConvectiveTreatment, SchemeKind, TimeIntConfig};
    pub use crate::error::{Result, TimeIntError};
    pub use crate::history::HistoryBuffer;
    pub use crate::oif::{OifConfig, OifScheme};
    pub use crate::operator::{
        Contribution, MeshMotion, PdeOperator, PostProcessor, SolveInfo, SpatialScheme,
    };
    pub use crate::state::{FlowState, TimeState};
    pub use crate::step::{StepController, StepReport};
    pub use crate::timeloop::{RunSummary, TimeLoop};
    pub use crate::timestep::StepSizePolicy;
}
