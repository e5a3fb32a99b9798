//! End-to-end tests of the time-integration core against a small model
//! discretization with a known closed-form solution.
//!
//! The model stands in for a DG flow discretization: componentwise diagonal
//! diffusion `lambda`, a linear convective term `C(u) = a u`, identity mass
//! matrix and a divergence-free velocity ansatz (so the pressure equation of
//! the segregated scheme is trivially zero). The exact solution of
//! `du/dt + (lambda + a) u = 0` is `u_i(t) = u0_i exp(-(lambda_i + a) t)`,
//! which also provides the analytic history seeding at negative times.

use std::cell::RefCell;
use std::rc::Rc;

use approx::assert_relative_eq;
use nalgebra::DVector;

use dgtime::prelude::*;

#[derive(Clone)]
struct ModelScheme {
    u0: DVector<f64>,
    lambda: DVector<f64>,
    a: f64,
    h_min: f64,
    degree: usize,
    /// Constant the solves write into the pressure vector; nonzero values
    /// exercise the post-solve mean shift
    p_offset: f64,
    fail_solves: bool,
}

impl ModelScheme {
    fn new(lambda: &[f64], a: f64) -> Self {
        Self {
            u0: DVector::from_vec(vec![1.0, -0.6]),
            lambda: DVector::from_vec(lambda.to_vec()),
            a,
            h_min: 0.5,
            degree: 2,
            p_offset: 0.0,
            fail_solves: false,
        }
    }

    fn exact(&self, time: f64) -> DVector<f64> {
        DVector::from_fn(self.u0.len(), |i, _| {
            self.u0[i] * (-(self.lambda[i] + self.a) * time).exp()
        })
    }
}

impl PdeOperator for ModelScheme {
    fn evaluate(
        &self,
        kind: Contribution,
        dst: &mut DVector<f64>,
        src: &DVector<f64>,
        _time: f64,
    ) -> Result<()> {
        match kind {
            Contribution::Mass => dst.axpy(1.0, src, 1.0),
            Contribution::Convective => dst.axpy(self.a, src, 1.0),
            Contribution::Diffusive => {
                for i in 0..dst.len() {
                    dst[i] += self.lambda[i] * src[i];
                }
            }
            // Divergence-free model: no pressure coupling, no penalty
            Contribution::PressureGradient
            | Contribution::Divergence
            | Contribution::BodyForce
            | Contribution::ContinuityPenalty => {}
        }
        Ok(())
    }

    fn apply_inverse_mass(&self, dst: &mut DVector<f64>, src: &DVector<f64>) -> Result<()> {
        dst.copy_from(src);
        Ok(())
    }

    fn shift_pressure(&self, pressure: &mut DVector<f64>) {
        let mean = pressure.mean();
        pressure.add_scalar_mut(-mean);
    }

    fn prescribe_initial_conditions(
        &self,
        velocity: &mut DVector<f64>,
        pressure: &mut DVector<f64>,
        time: f64,
    ) {
        velocity.copy_from(&self.exact(time));
        pressure.fill(0.0);
    }

    fn max_local_velocity(&self, velocity: &DVector<f64>) -> f64 {
        velocity.amax()
    }

    fn minimum_element_length(&self) -> f64 {
        self.h_min
    }

    fn polynomial_degree(&self) -> usize {
        self.degree
    }

    fn n_velocity_dofs(&self) -> usize {
        self.u0.len()
    }

    fn n_pressure_dofs(&self) -> usize {
        2
    }
}

impl SpatialScheme for ModelScheme {
    fn solve_linear(
        &mut self,
        solution: &mut FlowState,
        rhs: &FlowState,
        mass_scaling: f64,
        _update_preconditioner: bool,
    ) -> Result<usize> {
        if self.fail_solves {
            return Err(TimeIntError::solver_did_not_converge(42));
        }
        for i in 0..solution.velocity.len() {
            solution.velocity[i] = rhs.velocity[i] / (mass_scaling + self.lambda[i]);
        }
        solution.pressure.fill(self.p_offset);
        Ok(1)
    }

    fn solve_nonlinear(
        &mut self,
        solution: &mut FlowState,
        sum_alphai_ui: &DVector<f64>,
        _time: f64,
        mass_scaling: f64,
    ) -> Result<SolveInfo> {
        // The convective term is linear in the model, so one Newton update
        // is exact
        for i in 0..solution.velocity.len() {
            solution.velocity[i] = sum_alphai_ui[i] / (mass_scaling + self.lambda[i] + self.a);
        }
        solution.pressure.fill(self.p_offset);
        Ok(SolveInfo {
            newton_iterations: 1,
            linear_iterations: 1,
        })
    }

    fn solve_momentum(
        &mut self,
        velocity: &mut DVector<f64>,
        rhs: &DVector<f64>,
        _time: f64,
        mass_scaling: f64,
    ) -> Result<SolveInfo> {
        for i in 0..velocity.len() {
            velocity[i] = rhs[i] / (mass_scaling + self.lambda[i]);
        }
        Ok(SolveInfo::linear(1))
    }

    fn solve_pressure_poisson(
        &mut self,
        pressure: &mut DVector<f64>,
        rhs: &DVector<f64>,
    ) -> Result<usize> {
        pressure.copy_from(rhs);
        Ok(1)
    }

    fn project_velocity(
        &mut self,
        velocity: &mut DVector<f64>,
        intermediate: &DVector<f64>,
        _pressure: &DVector<f64>,
        _dt_over_gamma0: f64,
    ) -> Result<usize> {
        // Divergence-free model: the pressure gradient vanishes and the
        // correction is the identity
        velocity.copy_from(intermediate);
        Ok(1)
    }
}

fn base_config(dt: f64, end_time: f64, max_order: usize) -> TimeIntConfig {
    TimeIntConfig {
        start_time: 0.0,
        end_time,
        max_steps: 100_000,
        max_order,
        start_with_low_order: false,
        scheme: SchemeKind::Coupled,
        convective: ConvectiveTreatment::None,
        oif: None,
        step_size: StepSizePolicy::Fixed { dt },
        pure_neumann_pressure: false,
        continuity_penalty: false,
        solver_info_interval: 0,
    }
}

fn run_final(config: TimeIntConfig, scheme: ModelScheme) -> (DVector<f64>, RunSummary) {
    let controller =
        StepController::new(config, scheme, Box::new(SerialComm), None).unwrap();
    let mut time_loop = TimeLoop::new(controller, None);
    let summary = time_loop.run().unwrap();
    let velocity = time_loop.controller().current_solution().velocity.clone();
    (velocity, summary)
}

fn max_error(velocity: &DVector<f64>, exact: &DVector<f64>) -> f64 {
    (velocity - exact).amax()
}

#[test]
fn test_backward_euler_single_step_closed_form() {
    let dt = 0.1;
    let scheme = ModelScheme::new(&[1.0, 2.0], 0.0);
    let config = base_config(dt, dt, 1);
    let (velocity, summary) = run_final(config, scheme.clone());

    assert_eq!(summary.steps_completed, 1);
    for i in 0..2 {
        let expected = scheme.u0[i] / (1.0 + scheme.lambda[i] * dt);
        assert_relative_eq!(velocity[i], expected, epsilon = 1e-13);
    }
}

#[test]
fn test_bdf1_first_order_convergence() {
    let end_time = 0.5;
    let scheme = ModelScheme::new(&[1.0, 2.0], 0.0);
    let exact = scheme.exact(end_time);

    let (coarse, _) = run_final(base_config(0.025, end_time, 1), scheme.clone());
    let (fine, _) = run_final(base_config(0.0125, end_time, 1), scheme.clone());

    let ratio = max_error(&coarse, &exact) / max_error(&fine, &exact);
    assert!(
        (1.7..2.4).contains(&ratio),
        "BDF1 error ratio {} outside first-order range",
        ratio
    );
}

#[test]
fn test_bdf2_second_order_convergence() {
    let end_time = 0.5;
    let scheme = ModelScheme::new(&[1.0, 2.0], 0.0);
    let exact = scheme.exact(end_time);

    let (coarse, _) = run_final(base_config(0.025, end_time, 2), scheme.clone());
    let (fine, _) = run_final(base_config(0.0125, end_time, 2), scheme.clone());

    let ratio = max_error(&coarse, &exact) / max_error(&fine, &exact);
    assert!(
        (3.3..4.8).contains(&ratio),
        "BDF2 error ratio {} outside second-order range",
        ratio
    );
}

#[test]
fn test_bdf3_third_order_convergence() {
    let end_time = 0.5;
    let scheme = ModelScheme::new(&[1.0, 2.0], 0.0);
    let exact = scheme.exact(end_time);

    let (coarse, _) = run_final(base_config(0.025, end_time, 3), scheme.clone());
    let (fine, _) = run_final(base_config(0.0125, end_time, 3), scheme.clone());

    let ratio = max_error(&coarse, &exact) / max_error(&fine, &exact);
    assert!(
        (6.5..10.0).contains(&ratio),
        "BDF3 error ratio {} outside third-order range",
        ratio
    );
}

#[test]
fn test_explicit_convection_second_order() {
    let end_time = 0.5;
    let scheme = ModelScheme::new(&[1.0, 2.0], 0.8);
    let exact = scheme.exact(end_time);

    let mut config = base_config(0.02, end_time, 2);
    config.convective = ConvectiveTreatment::Explicit;
    let (coarse, _) = run_final(config, scheme.clone());

    let mut config = base_config(0.01, end_time, 2);
    config.convective = ConvectiveTreatment::Explicit;
    let (fine, _) = run_final(config, scheme.clone());

    let ratio = max_error(&coarse, &exact) / max_error(&fine, &exact);
    assert!(
        (3.3..4.8).contains(&ratio),
        "BDF2/EXT2 error ratio {} outside second-order range",
        ratio
    );
}

#[test]
fn test_implicit_convection_second_order() {
    let end_time = 0.5;
    let scheme = ModelScheme::new(&[1.0, 2.0], 0.8);
    let exact = scheme.exact(end_time);

    let mut config = base_config(0.02, end_time, 2);
    config.convective = ConvectiveTreatment::Implicit;
    let (coarse, summary) = run_final(config, scheme.clone());
    assert!(summary.total_iterations.newton_iterations > 0);

    let mut config = base_config(0.01, end_time, 2);
    config.convective = ConvectiveTreatment::Implicit;
    let (fine, _) = run_final(config, scheme.clone());

    let ratio = max_error(&coarse, &exact) / max_error(&fine, &exact);
    assert!(
        (3.3..4.8).contains(&ratio),
        "implicit BDF2 error ratio {} outside second-order range",
        ratio
    );
}

#[test]
fn test_order_ramp_startup_converges() {
    // Without analytic seeding the order ramps 1 -> 2; the run must still
    // track the exact solution closely over many steps.
    let end_time = 0.5;
    let scheme = ModelScheme::new(&[1.0, 2.0], 0.0);
    let exact = scheme.exact(end_time);

    let mut config = base_config(0.01, end_time, 2);
    config.start_with_low_order = true;
    let (velocity, _) = run_final(config, scheme);

    assert!(max_error(&velocity, &exact) < 5e-4);
}

/// With a single sub-step, first sub-order and first BDF order, the OIF
/// contribution M (aggregate - extrapolation) / dt collapses to the plain
/// explicit convective term; both paths must produce the same trajectory.
#[test]
fn test_oif_single_substep_matches_explicit_path() {
    let end_time = 0.1;
    let dt = 0.02;
    let scheme = ModelScheme::new(&[1.0, 2.0], 0.8);

    let mut plain = base_config(dt, end_time, 1);
    plain.convective = ConvectiveTreatment::Explicit;
    let (u_plain, _) = run_final(plain, scheme.clone());

    let mut oif = base_config(dt, end_time, 1);
    oif.convective = ConvectiveTreatment::Explicit;
    oif.oif = Some(OifConfig {
        scheme: OifScheme::ExplicitEuler,
        cfl: 1.0,
        cfl_oif: 1.0,
    });
    let (u_oif, _) = run_final(oif, scheme);

    for i in 0..2 {
        assert_relative_eq!(u_oif[i], u_plain[i], epsilon = 1e-12);
    }
}

/// Sub-cycling the convective term keeps the scheme convergent at the outer
/// order.
#[test]
fn test_oif_substepping_second_order() {
    let end_time = 0.5;
    let scheme = ModelScheme::new(&[1.0, 2.0], 0.8);
    let exact = scheme.exact(end_time);

    let mut config = base_config(0.02, end_time, 2);
    config.convective = ConvectiveTreatment::Explicit;
    config.oif = Some(OifConfig {
        scheme: OifScheme::Rk2,
        cfl: 1.0,
        cfl_oif: 0.25,
    });
    let (coarse, _) = run_final(config, scheme.clone());

    let mut config = base_config(0.01, end_time, 2);
    config.convective = ConvectiveTreatment::Explicit;
    config.oif = Some(OifConfig {
        scheme: OifScheme::Rk2,
        cfl: 1.0,
        cfl_oif: 0.25,
    });
    let (fine, _) = run_final(config, scheme.clone());

    let ratio = max_error(&coarse, &exact) / max_error(&fine, &exact);
    assert!(
        (3.0..5.0).contains(&ratio),
        "OIF error ratio {} outside second-order range",
        ratio
    );
}

/// The segregated scheme degenerates to the coupled one on the
/// divergence-free model.
#[test]
fn test_pressure_correction_matches_coupled() {
    let end_time = 0.2;
    let dt = 0.02;
    let scheme = ModelScheme::new(&[1.0, 2.0], 0.0);

    let (u_coupled, _) = run_final(base_config(dt, end_time, 2), scheme.clone());

    let mut config = base_config(dt, end_time, 2);
    config.scheme = SchemeKind::PressureCorrection;
    let (u_segregated, _) = run_final(config, scheme);

    for i in 0..2 {
        assert_relative_eq!(u_segregated[i], u_coupled[i], epsilon = 1e-13);
    }
}

#[test]
fn test_pressure_shift_enforces_zero_mean() {
    let dt = 0.05;
    let mut scheme = ModelScheme::new(&[1.0, 2.0], 0.0);
    scheme.p_offset = 3.7;

    let mut config = base_config(dt, dt, 1);
    config.pure_neumann_pressure = true;

    let controller =
        StepController::new(config, scheme.clone(), Box::new(SerialComm), None).unwrap();
    let mut time_loop = TimeLoop::new(controller, None);
    time_loop.run().unwrap();

    let mut pressure = time_loop.controller().current_solution().pressure.clone();
    assert_relative_eq!(pressure.mean(), 0.0, epsilon = 1e-13);

    // The shift is idempotent: re-applying it must not move the field
    let before = pressure.clone();
    scheme.shift_pressure(&mut pressure);
    assert_relative_eq!((pressure - before).amax(), 0.0, epsilon = 1e-14);
}

#[test]
fn test_end_time_clamp() {
    // 0.25 is not a multiple of the fixed step; the last step shrinks to
    // land on the end time exactly
    let scheme = ModelScheme::new(&[1.0, 2.0], 0.0);
    let (_, summary) = run_final(base_config(0.1, 0.25, 1), scheme);

    assert_eq!(summary.steps_completed, 3);
    assert_relative_eq!(summary.final_time, 0.25, epsilon = 1e-12);
}

#[test]
fn test_max_steps_budget() {
    let scheme = ModelScheme::new(&[1.0, 2.0], 0.0);
    let mut config = base_config(0.01, 10.0, 1);
    config.max_steps = 7;
    let (_, summary) = run_final(config, scheme);

    assert_eq!(summary.steps_completed, 7);
    assert!(summary.final_time < 10.0);
}

#[test]
fn test_adaptive_cfl_step_size() {
    let scheme = ModelScheme::new(&[1.0, 2.0], 0.0);
    let mut config = base_config(0.0, 1.0, 1);
    config.step_size = StepSizePolicy::AdaptiveCfl {
        cfl: 0.4,
        initial_dt: 1e-3,
        exponent_degree: 1.0,
    };

    let mut controller =
        StepController::new(config, scheme.clone(), Box::new(SerialComm), None).unwrap();
    let report = controller.advance().unwrap();

    // dt = cfl * h_min / (u_max * degree), u_max = amax of the initial field
    let expected = 0.4 * scheme.h_min / (scheme.u0.amax() * scheme.degree as f64);
    assert_relative_eq!(report.dt, expected, epsilon = 1e-13);

    // The field decays, so the stable step grows
    let report2 = controller.advance().unwrap();
    assert!(report2.dt > report.dt);
}

#[test]
fn test_solver_failure_carries_step_context() {
    let mut scheme = ModelScheme::new(&[1.0, 2.0], 0.0);
    scheme.fail_solves = true;
    let config = base_config(0.05, 1.0, 1);

    let mut controller =
        StepController::new(config, scheme, Box::new(SerialComm), None).unwrap();
    let err = controller.advance().unwrap_err();
    match err {
        TimeIntError::SolverDidNotConverge {
            step,
            time,
            iterations,
        } => {
            assert_eq!(step, 1);
            assert_eq!(iterations, 42);
            assert_relative_eq!(time, 0.05, epsilon = 1e-14);
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn test_postprocessor_called_initially_and_per_step() {
    struct Recorder(Rc<RefCell<Vec<(usize, f64)>>>);

    impl PostProcessor for Recorder {
        fn do_postprocessing(
            &mut self,
            _velocity: &DVector<f64>,
            _pressure: &DVector<f64>,
            time: f64,
            step_number: usize,
        ) {
            self.0.borrow_mut().push((step_number, time));
        }
    }

    let calls = Rc::new(RefCell::new(Vec::new()));
    let scheme = ModelScheme::new(&[1.0, 2.0], 0.0);
    let config = base_config(0.02, 0.1, 1);

    let controller = StepController::new(config, scheme, Box::new(SerialComm), None).unwrap();
    let mut time_loop = TimeLoop::new(controller, Some(Box::new(Recorder(calls.clone()))));
    time_loop.run().unwrap();

    let calls = calls.borrow();
    assert_eq!(calls.len(), 6);
    assert_eq!(calls[0], (0, 0.0));
    assert_eq!(calls[5].0, 5);
    assert_relative_eq!(calls[5].1, 0.1, epsilon = 1e-12);
}

#[test]
fn test_mesh_motion_updated_before_each_step() {
    struct Recorder(Rc<RefCell<Vec<f64>>>);

    impl MeshMotion for Recorder {
        fn update(&mut self, time: f64) -> Result<()> {
            self.0.borrow_mut().push(time);
            Ok(())
        }
    }

    let times = Rc::new(RefCell::new(Vec::new()));
    let scheme = ModelScheme::new(&[1.0, 2.0], 0.0);
    let config = base_config(0.05, 0.15, 1);

    let controller = StepController::new(
        config,
        scheme,
        Box::new(SerialComm),
        Some(Box::new(Recorder(times.clone()))),
    )
    .unwrap();
    let mut time_loop = TimeLoop::new(controller, None);
    time_loop.run().unwrap();

    // One geometry update per step, at the step's target time
    let times = times.borrow();
    assert_eq!(times.len(), 3);
    for (i, &t) in times.iter().enumerate() {
        assert_relative_eq!(t, 0.05 * (i + 1) as f64, epsilon = 1e-12);
    }
}

#[test]
fn test_restart_roundtrip_resumes_identically() {
    let dt = 0.02;
    let scheme = ModelScheme::new(&[1.0, 2.0], 0.8);
    let mut config = base_config(dt, 1.0, 2);
    config.convective = ConvectiveTreatment::Explicit;

    let path = std::env::temp_dir().join(format!("dgtime_restart_{}.bin", std::process::id()));

    // Reference run: 5 steps, checkpoint, 5 more steps
    let controller =
        StepController::new(config.clone(), scheme.clone(), Box::new(SerialComm), None).unwrap();
    let mut reference = TimeLoop::new(controller, None);
    for _ in 0..5 {
        reference.step().unwrap();
    }
    reference.write_restart(&path).unwrap();
    for _ in 0..5 {
        reference.step().unwrap();
    }
    let u_ref = reference.controller().current_solution().velocity.clone();

    // Restarted run: load the checkpoint, take the same 5 steps
    let controller =
        StepController::new(config, scheme, Box::new(SerialComm), None).unwrap();
    let mut restarted = TimeLoop::new(controller, None);
    restarted.read_restart(&path).unwrap();
    assert_eq!(restarted.controller().time_state().step_number(), 5);
    for _ in 0..5 {
        restarted.step().unwrap();
    }
    let u_restarted = restarted.controller().current_solution().velocity.clone();

    std::fs::remove_file(&path).ok();

    for i in 0..2 {
        assert_relative_eq!(u_restarted[i], u_ref[i], epsilon = 1e-14);
    }
}

#[test]
fn test_restart_order_mismatch_rejected() {
    let scheme = ModelScheme::new(&[1.0, 2.0], 0.0);
    let path =
        std::env::temp_dir().join(format!("dgtime_restart_order_{}.bin", std::process::id()));

    let controller = StepController::new(
        base_config(0.02, 1.0, 2),
        scheme.clone(),
        Box::new(SerialComm),
        None,
    )
    .unwrap();
    let mut writer = TimeLoop::new(controller, None);
    writer.step().unwrap();
    writer.write_restart(&path).unwrap();

    let controller = StepController::new(
        base_config(0.02, 1.0, 3),
        scheme,
        Box::new(SerialComm),
        None,
    )
    .unwrap();
    let mut reader = TimeLoop::new(controller, None);
    let err = reader.read_restart(&path).unwrap_err();

    std::fs::remove_file(&path).ok();

    assert!(matches!(
        err,
        TimeIntError::RestartOrderMismatch {
            stored: 2,
            configured: 3
        }
    ));
}
