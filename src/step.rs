//! Per-step driver of the BDF scheme
//!
//! One [`StepController::advance`] call executes the full cycle for one time
//! step: extrapolate the initial guess, assemble the right-hand side from
//! cached and freshly evaluated operator contributions, dispatch the solve,
//! apply the post-solve pressure correction, and rotate the history buffers.
//! The cycle is not interruptible; there is no partial-step resumption.
//!
//! Ordering contract: if a moving mesh is configured, its geometry update
//! for the new time level completes before any operator evaluation of this
//! step (operator evaluation assumes the cached geometry matches the
//! requested evaluation time).

use log::info;
use nalgebra::DVector;

use crate::bdf::BdfCoefficients;
use crate::comm::Communicator;
use crate::config::{ConvectiveTreatment, SchemeKind, TimeIntConfig};
use crate::error::Result;
use crate::history::HistoryBuffer;
use crate::oif::OifSubstepper;
use crate::operator::{Contribution, MeshMotion, SolveInfo, SpatialScheme};
use crate::state::{FlowState, TimeState};

/// Diagnostics of one completed step
#[derive(Debug, Clone, Copy)]
pub struct StepReport {
    /// 1-based index of the completed step
    pub step_number: usize,
    /// Time level reached by this step
    pub time: f64,
    pub dt: f64,
    pub order: usize,
    pub iterations: SolveInfo,
}

/// Drives one time step of the BDF scheme against a spatial discretization
pub struct StepController<S: SpatialScheme> {
    config: TimeIntConfig,
    scheme: S,
    comm: Box<dyn Communicator>,
    mesh_motion: Option<Box<dyn MeshMotion>>,

    time_state: TimeState,
    coeffs: BdfCoefficients,
    /// (order, step sizes) the cached coefficients were computed for
    coeffs_key: (usize, Vec<f64>),

    /// Solution history; slot i holds the solution at t_{n-i}
    solution: HistoryBuffer<FlowState>,
    /// Incoming solution at t_{n+1}; doubles as the extrapolated initial
    /// guess before the solve
    solution_np: FlowState,

    /// Cache of explicit convective-term evaluations, rotated in lockstep
    /// with the solution history. Present only for explicit treatment
    /// without OIF.
    convective_cache: Option<HistoryBuffer<DVector<f64>>>,
    /// Convective term freshly evaluated at t_n (rotated into the cache)
    convective_np: DVector<f64>,

    oif: Option<OifSubstepper>,
    oif_contribution: DVector<f64>,

    sum_alphai_ui: DVector<f64>,
    rhs: FlowState,
    velocity_hat: DVector<f64>,
    divergence_rhs: DVector<f64>,

    last_dt: f64,
    total_iterations: SolveInfo,
}

impl<S: SpatialScheme> StepController<S> {
    /// Validate the configuration, size every buffer, and seed the history.
    ///
    /// With `start_with_low_order = false` the former solution levels (and
    /// the convective cache, if active) are seeded analytically at
    /// t, t - dt, t - 2 dt, ...; otherwise the order ramps up from 1 and
    /// only the current level is prescribed.
    pub fn new(
        config: TimeIntConfig,
        scheme: S,
        comm: Box<dyn Communicator>,
        mesh_motion: Option<Box<dyn MeshMotion>>,
    ) -> Result<Self> {
        config.validate()?;

        let n_u = scheme.n_velocity_dofs();
        let n_p = scheme.n_pressure_dofs();
        let q_max = config.max_order;
        let initial_dt = config.step_size.initial_dt();

        let time_state = TimeState::new(
            config.start_time,
            initial_dt,
            q_max,
            config.start_with_low_order,
        );

        let mut solution = HistoryBuffer::new_with(q_max, |_| FlowState::zeros(n_u, n_p));
        {
            let current = solution.get_mut(0)?;
            scheme.prescribe_initial_conditions(
                &mut current.velocity,
                &mut current.pressure,
                config.start_time,
            );
        }
        if !config.start_with_low_order {
            for i in 1..q_max {
                let t_i = config.start_time - i as f64 * initial_dt;
                let slot = solution.get_mut(i)?;
                scheme.prescribe_initial_conditions(&mut slot.velocity, &mut slot.pressure, t_i);
            }
        }

        config
            .step_size
            .validate_startup(&scheme, comm.as_ref(), &solution.get(0)?.velocity)?;

        let use_cache =
            config.convective == ConvectiveTreatment::Explicit && config.oif.is_none();
        let mut convective_cache =
            use_cache.then(|| HistoryBuffer::new_with(q_max, |_| DVector::zeros(n_u)));
        if let Some(cache) = convective_cache.as_mut() {
            if !config.start_with_low_order {
                // Seed the cache from the analytically seeded former levels.
                // Cache slot j holds the evaluation at solution level j + 1
                // (the level-0 evaluation is always computed fresh).
                for i in 1..q_max {
                    let t_i = config.start_time - i as f64 * initial_dt;
                    let mut term = DVector::zeros(n_u);
                    scheme.evaluate(
                        Contribution::Convective,
                        &mut term,
                        &solution.get(i)?.velocity,
                        t_i,
                    )?;
                    *cache.get_mut(i - 1)? = term;
                }
            }
        }

        let oif = match &config.oif {
            Some(oif_config) => Some(OifSubstepper::new(oif_config, config.global_cfl(), n_u)?),
            None => None,
        };

        let order = time_state.order();
        let startup_steps = &time_state.step_sizes()[..order];
        let coeffs = BdfCoefficients::compute(startup_steps, order)?;
        let coeffs_key = (order, startup_steps.to_vec());

        Ok(Self {
            scheme,
            comm,
            mesh_motion,
            time_state,
            coeffs,
            coeffs_key,
            solution,
            solution_np: FlowState::zeros(n_u, n_p),
            convective_cache,
            convective_np: DVector::zeros(n_u),
            oif,
            oif_contribution: DVector::zeros(n_u),
            sum_alphai_ui: DVector::zeros(n_u),
            rhs: FlowState::zeros(n_u, n_p),
            velocity_hat: DVector::zeros(n_u),
            divergence_rhs: DVector::zeros(n_p),
            last_dt: 0.0,
            total_iterations: SolveInfo::default(),
            config,
        })
    }

    pub fn config(&self) -> &TimeIntConfig {
        &self.config
    }

    pub fn time_state(&self) -> &TimeState {
        &self.time_state
    }

    /// Solution of the most recently completed step
    pub fn current_solution(&self) -> &FlowState {
        self.solution.current()
    }

    /// Cumulative iteration counts over all completed steps
    pub fn total_iterations(&self) -> SolveInfo {
        self.total_iterations
    }

    /// True once the end time or the step budget has been reached
    pub fn finished(&self) -> bool {
        let eps = 1e-12 * self.config.end_time.abs().max(1.0);
        self.time_state.time() >= self.config.end_time - eps
            || self.time_state.step_number() >= self.config.max_steps
    }

    /// Execute the full cycle of one time step.
    ///
    /// Fatal on `SolverDidNotConverge`: there is no automatic step-size
    /// back-off; the error carries step number, time and iteration count.
    pub fn advance(&mut self) -> Result<StepReport> {
        let t_n = self.time_state.time();

        // Select the step size and clamp the final step onto the end time
        let mut dt = self.config.step_size.next_step_size(
            &self.scheme,
            self.comm.as_ref(),
            &self.current_solution().velocity,
        )?;
        if t_n + dt > self.config.end_time {
            dt = self.config.end_time - t_n;
        }
        self.time_state.push_step_size(dt);
        let t_np1 = t_n + dt;

        // Geometry updates happen-before any operator evaluation of this step
        if let Some(mesh) = self.mesh_motion.as_mut() {
            mesh.update(t_np1)?;
        }

        self.update_coefficients()?;

        let step = self.time_state.step_number() + 1;
        let result = self.do_timestep(t_n, t_np1, dt);
        let iterations = result.map_err(|e| e.with_step_context(step, t_np1))?;

        self.rotate_history();
        self.time_state.advance();
        self.last_dt = dt;
        self.total_iterations.accumulate(iterations);

        let report = StepReport {
            step_number: self.time_state.step_number(),
            time: self.time_state.time(),
            dt,
            order: self.coeffs.order(),
            iterations,
        };

        if self.config.solver_info_interval > 0
            && report.step_number % self.config.solver_info_interval == 0
            && self.comm.is_root()
        {
            info!(
                "step {:6}  t = {:.6e}  dt = {:.6e}  order {}  newton {:3}  linear {:5}",
                report.step_number,
                report.time,
                report.dt,
                report.order,
                report.iterations.newton_iterations,
                report.iterations.linear_iterations,
            );
        }

        Ok(report)
    }

    /// Recompute the BDF coefficients when the step-size history or the
    /// effective order changed; keep the cached set otherwise (the common
    /// case under fixed stepping past the startup ramp).
    fn update_coefficients(&mut self) -> Result<()> {
        let order = self.time_state.order();
        let steps = &self.time_state.step_sizes()[..order];
        if order != self.coeffs_key.0 || steps != self.coeffs_key.1.as_slice() {
            self.coeffs = BdfCoefficients::compute(steps, order)?;
            self.coeffs_key.0 = order;
            self.coeffs_key.1.clear();
            self.coeffs_key.1.extend_from_slice(steps);
        }
        Ok(())
    }

    /// Extrapolate, assemble, solve and post-correct (everything between
    /// the geometry update and the history rotation)
    fn do_timestep(&mut self, t_n: f64, t_np1: f64, dt: f64) -> Result<SolveInfo> {
        let order = self.coeffs.order();
        let gamma0 = self.coeffs.gamma0();
        let mass_scaling = gamma0 / dt;

        // Extrapolated initial guess: sum(beta_i * u^{n-i})
        self.solution_np
            .set_scaled(self.coeffs.beta()[0], self.solution.get(0)?);
        for i in 1..order {
            let beta_i = self.coeffs.beta()[i];
            self.solution_np.add_scaled(beta_i, self.solution.get(i)?);
        }

        // Discrete time-derivative source: the known part of the stencil,
        // moved to the right-hand side
        self.sum_alphai_ui.fill(0.0);
        for i in 0..order {
            let alpha_i = self.coeffs.alpha()[i + 1];
            self.sum_alphai_ui
                .axpy(-alpha_i, &self.solution.get(i)?.velocity, 1.0);
        }

        let implicit_convection = self.config.convective == ConvectiveTreatment::Implicit;
        if !implicit_convection {
            self.assemble_rhs(t_n, t_np1)?;
        }

        let iterations = match self.config.scheme {
            SchemeKind::Coupled if implicit_convection => self.scheme.solve_nonlinear(
                &mut self.solution_np,
                &self.sum_alphai_ui,
                t_np1,
                mass_scaling,
            )?,
            SchemeKind::Coupled => {
                let update_preconditioner = dt != self.last_dt;
                let linear = self.scheme.solve_linear(
                    &mut self.solution_np,
                    &self.rhs,
                    mass_scaling,
                    update_preconditioner,
                )?;
                SolveInfo::linear(linear)
            }
            SchemeKind::PressureCorrection => {
                self.solve_segregated(t_np1, dt, mass_scaling)?
            }
        };

        // The pressure of a pure-Neumann/periodic problem is defined only up
        // to a constant; without the shift the solves drift
        if self.config.pure_neumann_pressure {
            self.scheme.shift_pressure(&mut self.solution_np.pressure);
        }

        Ok(iterations)
    }

    /// Assemble the momentum right-hand side for the linear and segregated
    /// solve paths
    fn assemble_rhs(&mut self, t_n: f64, t_np1: f64) -> Result<()> {
        let order = self.coeffs.order();
        self.rhs.fill(0.0);

        // Mass matrix applied to the time-derivative source
        self.scheme.evaluate(
            Contribution::Mass,
            &mut self.rhs.velocity,
            &self.sum_alphai_ui,
            t_np1,
        )?;

        // Body force at the new time
        self.scheme.evaluate(
            Contribution::BodyForce,
            &mut self.rhs.velocity,
            &self.solution_np.velocity,
            t_np1,
        )?;

        match (&self.config.convective, self.oif.as_mut()) {
            (ConvectiveTreatment::None, _) | (ConvectiveTreatment::Implicit, _) => {}
            (ConvectiveTreatment::Explicit, Some(oif)) => {
                // Sub-stepped transport in place of the extrapolated cache:
                // the explicit convective contribution is M applied to the
                // weighted per-level difference quotients, which reduces to
                // -C u^n for one Euler sub-step at order one.
                oif.run(
                    &self.scheme,
                    &self.solution,
                    self.coeffs.beta(),
                    self.time_state.step_sizes(),
                    t_np1,
                    &mut self.oif_contribution,
                )?;
                self.convective_np.fill(0.0);
                self.scheme.evaluate(
                    Contribution::Mass,
                    &mut self.convective_np,
                    &self.oif_contribution,
                    t_np1,
                )?;
                self.rhs.velocity += &self.convective_np;
            }
            (ConvectiveTreatment::Explicit, None) => {
                // Fresh evaluation at t_n plus cached evaluations at the
                // older levels, weighted by the extrapolation coefficients
                self.convective_np.fill(0.0);
                self.scheme.evaluate(
                    Contribution::Convective,
                    &mut self.convective_np,
                    &self.solution.get(0)?.velocity,
                    t_n,
                )?;
                self.rhs
                    .velocity
                    .axpy(-self.coeffs.beta()[0], &self.convective_np, 1.0);

                if let Some(cache) = self.convective_cache.as_ref() {
                    for i in 1..order {
                        self.rhs
                            .velocity
                            .axpy(-self.coeffs.beta()[i], cache.get(i - 1)?, 1.0);
                    }
                }
            }
        }

        if self.config.continuity_penalty {
            self.scheme.evaluate(
                Contribution::ContinuityPenalty,
                &mut self.rhs.velocity,
                &self.solution_np.velocity,
                t_np1,
            )?;
        }

        Ok(())
    }

    /// Segregated sub-solves in fixed order: momentum, pressure Poisson,
    /// velocity correction
    fn solve_segregated(&mut self, t_np1: f64, dt: f64, mass_scaling: f64) -> Result<SolveInfo> {
        let mut info = SolveInfo::default();

        // Momentum solve, warm-started from the extrapolated velocity
        self.velocity_hat.copy_from(&self.solution_np.velocity);
        let momentum = self.scheme.solve_momentum(
            &mut self.velocity_hat,
            &self.rhs.velocity,
            t_np1,
            mass_scaling,
        )?;
        info.accumulate(momentum);

        // Pressure Poisson: div of the intermediate velocity, scaled by
        // gamma0/dt
        self.divergence_rhs.fill(0.0);
        self.scheme.evaluate(
            Contribution::Divergence,
            &mut self.divergence_rhs,
            &self.velocity_hat,
            t_np1,
        )?;
        self.divergence_rhs *= mass_scaling;
        let ppe = self
            .scheme
            .solve_pressure_poisson(&mut self.solution_np.pressure, &self.divergence_rhs)?;
        info.accumulate(SolveInfo::linear(ppe));

        // Velocity correction
        let projection = self.scheme.project_velocity(
            &mut self.solution_np.velocity,
            &self.velocity_hat,
            &self.solution_np.pressure,
            dt / self.coeffs.gamma0(),
        )?;
        info.accumulate(SolveInfo::linear(projection));

        Ok(info)
    }

    /// Rotate the solution history and, in lockstep, the convective-term
    /// cache. Rotation is an ownership swap; the evicted slots become the
    /// scratch buffers of the next step.
    fn rotate_history(&mut self) {
        let incoming = std::mem::replace(&mut self.solution_np, FlowState::zeros(0, 0));
        self.solution_np = self.solution.rotate(incoming);

        if let Some(cache) = self.convective_cache.as_mut() {
            let incoming = std::mem::replace(&mut self.convective_np, DVector::zeros(0));
            self.convective_np = cache.rotate(incoming);
        }
    }

    // Restart support: the record holds exactly the history contents plus
    // the time state, in logical (most-recent-first) order.

    pub(crate) fn snapshot_time_state(&self) -> TimeState {
        self.time_state.clone()
    }

    pub(crate) fn snapshot_solutions(&self) -> Vec<FlowState> {
        self.solution.to_ordered_vec()
    }

    pub(crate) fn snapshot_convective_cache(&self) -> Option<Vec<DVector<f64>>> {
        self.convective_cache.as_ref().map(|c| c.to_ordered_vec())
    }

    pub(crate) fn restore(
        &mut self,
        time_state: TimeState,
        solutions: Vec<FlowState>,
        convective: Option<Vec<DVector<f64>>>,
    ) -> Result<()> {
        self.time_state.check_restart_order(time_state.max_order())?;
        if self.convective_cache.is_some() != convective.is_some() {
            return Err(crate::error::TimeIntError::InvalidConfiguration(
                "restart record disagrees about convective-term caching".into(),
            ));
        }
        self.solution.initialize_all(solutions)?;
        if let (Some(cache), Some(values)) = (self.convective_cache.as_mut(), convective) {
            cache.initialize_all(values)?;
        }
        self.time_state = time_state;
        self.update_coefficients()?;
        Ok(())
    }
}
