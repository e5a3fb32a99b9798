//! Collaborator interfaces of the time-integration core
//!
//! The core never assembles finite-element operators itself. It asks the
//! spatial discretization to evaluate named contributions and to perform the
//! linear/nonlinear solves of one time step through the traits below, and it
//! hands solution vectors to the postprocessor once per completed step.
//! References passed into a facade call are borrowed for the duration of
//! that call only.

use nalgebra::DVector;

use crate::error::Result;
use crate::state::FlowState;

/// Named operator contributions evaluated additively into a destination
/// vector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Contribution {
    Mass,
    Convective,
    Diffusive,
    PressureGradient,
    Divergence,
    BodyForce,
    /// Div-div/continuity penalty applied to the extrapolated velocity in
    /// decoupled projection schemes
    ContinuityPenalty,
}

/// Iteration counts reported by an implicit solve
#[derive(Debug, Clone, Copy, Default)]
pub struct SolveInfo {
    pub newton_iterations: usize,
    pub linear_iterations: usize,
}

impl SolveInfo {
    pub fn linear(iterations: usize) -> Self {
        Self {
            newton_iterations: 0,
            linear_iterations: iterations,
        }
    }

    pub fn accumulate(&mut self, other: SolveInfo) {
        self.newton_iterations += other.newton_iterations;
        self.linear_iterations += other.linear_iterations;
    }
}

/// Operator evaluations and geometry queries of the spatial discretization
pub trait PdeOperator {
    /// Evaluate one operator contribution additively: `dst += Op(src)` at
    /// the given time. `src` is a velocity-space vector for all kinds except
    /// `PressureGradient`, which takes a pressure-space vector.
    fn evaluate(
        &self,
        kind: Contribution,
        dst: &mut DVector<f64>,
        src: &DVector<f64>,
        time: f64,
    ) -> Result<()>;

    /// `dst = M^{-1} src` on the velocity space
    fn apply_inverse_mass(&self, dst: &mut DVector<f64>, src: &DVector<f64>) -> Result<()>;

    /// Shift a pressure field that is determined only up to a constant to
    /// the reference mean value. Must be idempotent.
    fn shift_pressure(&self, pressure: &mut DVector<f64>);

    /// Evaluate the initial-condition functions at the given time
    fn prescribe_initial_conditions(
        &self,
        velocity: &mut DVector<f64>,
        pressure: &mut DVector<f64>,
        time: f64,
    );

    /// Maximum velocity magnitude over the locally owned cells (the caller
    /// performs the global reduction)
    fn max_local_velocity(&self, velocity: &DVector<f64>) -> f64;

    /// Smallest element length of the local mesh partition
    fn minimum_element_length(&self) -> f64;

    /// Polynomial degree of the velocity ansatz
    fn polynomial_degree(&self) -> usize;

    /// Number of velocity degrees of freedom
    fn n_velocity_dofs(&self) -> usize;

    /// Number of pressure degrees of freedom
    fn n_pressure_dofs(&self) -> usize;
}

/// Solve capabilities of one spatial scheme variant
///
/// The step controller depends only on this capability set, never on a
/// concrete discretization. A coupled (monolithic) scheme provides
/// `solve_linear`/`solve_nonlinear`; a pressure-correction scheme provides
/// the segregated sub-solves, which the controller invokes in the fixed
/// order momentum -> pressure Poisson -> velocity correction.
///
/// Each solve returns its iteration counts. An iterative method that
/// exhausts its budget reports [`crate::TimeIntError::solver_did_not_converge`];
/// the controller attaches step context and the run aborts.
pub trait SpatialScheme: PdeOperator {
    /// Linear (Stokes-like) coupled solve:
    /// `(mass_scaling * M + L) x = rhs` for velocity and pressure.
    fn solve_linear(
        &mut self,
        solution: &mut FlowState,
        rhs: &FlowState,
        mass_scaling: f64,
        update_preconditioner: bool,
    ) -> Result<usize>;

    /// Full nonlinear (Newton) coupled solve with implicit convective term.
    /// `sum_alphai_ui` is the discrete time-derivative source.
    fn solve_nonlinear(
        &mut self,
        solution: &mut FlowState,
        sum_alphai_ui: &DVector<f64>,
        time: f64,
        mass_scaling: f64,
    ) -> Result<SolveInfo>;

    /// Momentum sub-solve of the segregated scheme
    fn solve_momentum(
        &mut self,
        velocity: &mut DVector<f64>,
        rhs: &DVector<f64>,
        time: f64,
        mass_scaling: f64,
    ) -> Result<SolveInfo>;

    /// Pressure Poisson sub-solve of the segregated scheme
    fn solve_pressure_poisson(
        &mut self,
        pressure: &mut DVector<f64>,
        rhs: &DVector<f64>,
    ) -> Result<usize>;

    /// Velocity-correction (projection) sub-solve of the segregated scheme:
    /// make `velocity` divergence-free using the just-computed pressure.
    fn project_velocity(
        &mut self,
        velocity: &mut DVector<f64>,
        intermediate: &DVector<f64>,
        pressure: &DVector<f64>,
        dt_over_gamma0: f64,
    ) -> Result<usize>;
}

/// Postprocessing hook, invoked synchronously once per completed step and
/// once before the loop starts for the initial condition
pub trait PostProcessor {
    fn do_postprocessing(
        &mut self,
        velocity: &DVector<f64>,
        pressure: &DVector<f64>,
        time: f64,
        step_number: usize,
    );
}

/// Moving-mesh (ALE) collaborator
///
/// `update(time)` must complete and resynchronize all cached geometric data
/// before RHS assembly of the step targeting `time` begins; the step
/// controller guarantees this ordering.
pub trait MeshMotion {
    fn update(&mut self, time: f64) -> Result<()>;
}
