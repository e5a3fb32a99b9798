//! Outer time loop and restart persistence
//!
//! [`TimeLoop`] drives the step controller until the end time or the step
//! budget is reached, invoking the postprocessor synchronously once for the
//! initial condition and once after every completed step.
//!
//! Restart records capture exactly what the next step consumes: the time
//! state (time, step index, step-size ring, order) and the full solution
//! history in logical order, plus the convective-term cache when explicit
//! treatment is active. Records are written with bincode; a record written
//! with a different maximum order is rejected at load time instead of
//! silently reseeding the history.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::time::Instant;

use log::info;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::operator::{PostProcessor, SolveInfo, SpatialScheme};
use crate::state::{FlowState, TimeState};
use crate::step::{StepController, StepReport};

/// Aggregate diagnostics of one completed run
#[derive(Debug, Clone, Copy)]
pub struct RunSummary {
    pub steps_completed: usize,
    pub final_time: f64,
    pub total_iterations: SolveInfo,
    pub wall_seconds: f64,
}

/// On-disk restart record
#[derive(Serialize, Deserialize)]
struct RestartRecord {
    time_state: TimeState,
    /// Solution history in logical order, most recent first
    solutions: Vec<FlowState>,
    /// Convective-term cache in logical order; present iff the run uses
    /// explicit convective treatment without OIF
    convective: Option<Vec<DVector<f64>>>,
}

/// Outer driver of the time integration
pub struct TimeLoop<S: SpatialScheme> {
    controller: StepController<S>,
    postprocessor: Option<Box<dyn PostProcessor>>,
}

impl<S: SpatialScheme> TimeLoop<S> {
    pub fn new(
        controller: StepController<S>,
        postprocessor: Option<Box<dyn PostProcessor>>,
    ) -> Self {
        Self {
            controller,
            postprocessor,
        }
    }

    pub fn controller(&self) -> &StepController<S> {
        &self.controller
    }

    /// Run until the end time or the step budget is reached.
    ///
    /// The initial condition is postprocessed before the first step so that
    /// output series always include t = start_time.
    pub fn run(&mut self) -> Result<RunSummary> {
        let start = Instant::now();
        self.postprocess_current();

        while !self.controller.finished() {
            let report = self.controller.advance()?;
            self.postprocess_report(&report);
        }

        let summary = RunSummary {
            steps_completed: self.controller.time_state().step_number(),
            final_time: self.controller.time_state().time(),
            total_iterations: self.controller.total_iterations(),
            wall_seconds: start.elapsed().as_secs_f64(),
        };
        info!(
            "time loop finished: {} steps, t = {:.6e}, {:.3} s wall time",
            summary.steps_completed, summary.final_time, summary.wall_seconds
        );
        Ok(summary)
    }

    /// Advance a single step and postprocess it (step-wise driving for
    /// callers that interleave their own work with the integration)
    pub fn step(&mut self) -> Result<StepReport> {
        let report = self.controller.advance()?;
        self.postprocess_report(&report);
        Ok(report)
    }

    fn postprocess_current(&mut self) {
        if let Some(pp) = self.postprocessor.as_mut() {
            let state = self.controller.time_state();
            let (time, step_number) = (state.time(), state.step_number());
            let solution = self.controller.current_solution();
            pp.do_postprocessing(&solution.velocity, &solution.pressure, time, step_number);
        }
    }

    fn postprocess_report(&mut self, report: &StepReport) {
        if let Some(pp) = self.postprocessor.as_mut() {
            let solution = self.controller.current_solution();
            pp.do_postprocessing(
                &solution.velocity,
                &solution.pressure,
                report.time,
                report.step_number,
            );
        }
    }

    /// Serialize the integrator state for a later restart.
    pub fn write_restart(&self, path: &Path) -> Result<()> {
        let record = RestartRecord {
            time_state: self.controller.snapshot_time_state(),
            solutions: self.controller.snapshot_solutions(),
            convective: self.controller.snapshot_convective_cache(),
        };
        let writer = BufWriter::new(File::create(path)?);
        bincode::serialize_into(writer, &record)?;
        Ok(())
    }

    /// Restore the integrator state from a restart record.
    ///
    /// Fails with `RestartOrderMismatch` if the record was written with a
    /// different maximum order, and leaves the current state untouched in
    /// that case.
    pub fn read_restart(&mut self, path: &Path) -> Result<()> {
        let reader = BufReader::new(File::open(path)?);
        let record: RestartRecord = bincode::deserialize_from(reader)?;
        self.controller.restore(
            record.time_state,
            record.solutions,
            record.convective,
        )?;
        info!(
            "restart loaded: t = {:.6e}, step {}",
            self.controller.time_state().time(),
            self.controller.time_state().step_number()
        );
        Ok(())
    }
}
