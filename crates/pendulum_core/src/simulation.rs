//! Fixed-rate trajectories from the adaptive stepper.
//!
//! The stepper picks its own irregular step sequence; samples on the output
//! grid are answered from the dense output of whichever accepted step covers
//! them. The two sequences are never assumed to coincide.
use crate::error::SimulationError;
use crate::model::{DoublePendulum, PhysicalParameters, State};
use crate::solvers::{DormandPrince45, IntegrationStats, Tolerances};
use crate::traits::DynamicalSystem;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Initial condition, duration and output rate of one run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub initial: State,
    pub tspan: f64,
    pub fps: f64,
}

impl SimulationConfig {
    pub fn new(initial: State, tspan: f64, fps: f64) -> Self {
        Self {
            initial,
            tspan,
            fps,
        }
    }

    pub fn validate(&self) -> Result<(), SimulationError> {
        validate_span(self.tspan, self.fps)?;
        if !self.initial.is_finite() {
            return Err(SimulationError::invalid(format!(
                "initial state must be finite, got {:?}",
                self.initial
            )));
        }
        Ok(())
    }

    /// Number of output samples, `floor(fps * tspan)` but never less than one.
    pub fn sample_count(&self) -> usize {
        sample_count(self.tspan, self.fps)
    }
}

/// One output sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub t: f64,
    pub state: State,
}

/// Samples of a double pendulum run in increasing time order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    samples: Vec<Sample>,
    stats: IntegrationStats,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Sample> {
        self.samples.iter()
    }

    pub fn times(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.t).collect()
    }

    pub fn states(&self) -> Vec<State> {
        self.samples.iter().map(|s| s.state).collect()
    }

    pub fn theta1(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.state.theta1).collect()
    }

    pub fn theta2(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.state.theta2).collect()
    }

    /// Step counters of the run that produced this trajectory.
    pub fn stats(&self) -> IntegrationStats {
        self.stats
    }

    pub fn into_samples(self) -> Vec<Sample> {
        self.samples
    }
}

impl<'a> IntoIterator for &'a Trajectory {
    type Item = &'a Sample;
    type IntoIter = std::slice::Iter<'a, Sample>;

    fn into_iter(self) -> Self::IntoIter {
        self.samples.iter()
    }
}

/// Grid samples of an arbitrary [`DynamicalSystem`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampledSolution {
    pub times: Vec<f64>,
    pub states: Vec<Vec<f64>>,
    pub stats: IntegrationStats,
}

/// Largest output grid a single run may request.
///
/// The grid and the sample buffer are allocated up front, so `fps * tspan`
/// above this is rejected as a configuration error.
pub const MAX_SAMPLES: usize = 10_000_000;

fn validate_span(tspan: f64, fps: f64) -> Result<(), SimulationError> {
    if !tspan.is_finite() || tspan <= 0.0 {
        return Err(SimulationError::invalid(format!(
            "tspan must be positive and finite, got {tspan}"
        )));
    }
    if !fps.is_finite() || fps <= 0.0 {
        return Err(SimulationError::invalid(format!(
            "fps must be positive and finite, got {fps}"
        )));
    }
    let requested = fps * tspan;
    if !requested.is_finite() || requested > MAX_SAMPLES as f64 {
        return Err(SimulationError::invalid(format!(
            "fps * tspan = {requested} exceeds the limit of {MAX_SAMPLES} samples"
        )));
    }
    Ok(())
}

fn sample_count(tspan: f64, fps: f64) -> usize {
    ((fps * tspan).floor() as usize).max(1)
}

/// Output times: `floor(fps * tspan)` evenly spaced points over `[0, tspan]`,
/// both ends included. Fewer than two points collapse to `[0]`.
pub fn output_grid(tspan: f64, fps: f64) -> Vec<f64> {
    let n = sample_count(tspan, fps);
    if n <= 1 {
        return vec![0.0];
    }
    let step = tspan / (n - 1) as f64;
    let mut grid: Vec<f64> = (0..n).map(|i| i as f64 * step).collect();
    grid[n - 1] = tspan;
    grid
}

/// Integrates the double pendulum over `[0, tspan]` and samples it at `fps`.
pub fn integrate(
    config: &SimulationConfig,
    params: &PhysicalParameters,
    tolerances: Tolerances,
) -> Result<Trajectory, SimulationError> {
    run(config, params, tolerances, None)
}

/// Like [`integrate`], but polls `cancel` once per accepted step.
pub fn integrate_with_cancel(
    config: &SimulationConfig,
    params: &PhysicalParameters,
    tolerances: Tolerances,
    cancel: &AtomicBool,
) -> Result<Trajectory, SimulationError> {
    run(config, params, tolerances, Some(cancel))
}

/// Integrates independent runs in parallel, returning results in input order.
///
/// Each run's step sequence stays sequential, so every result equals what
/// [`integrate`] returns for the same config.
pub fn integrate_batch(
    configs: &[SimulationConfig],
    params: &PhysicalParameters,
    tolerances: Tolerances,
) -> Vec<Result<Trajectory, SimulationError>> {
    configs
        .par_iter()
        .map(|config| integrate(config, params, tolerances))
        .collect()
}

/// Integrates any system from `t = 0` to `tspan` and samples it on
/// [`output_grid`].
pub fn integrate_system<S: DynamicalSystem>(
    system: &S,
    y0: &[f64],
    tspan: f64,
    fps: f64,
    tolerances: Tolerances,
) -> Result<SampledSolution, SimulationError> {
    validate_span(tspan, fps)?;
    if y0.iter().any(|v| !v.is_finite()) {
        return Err(SimulationError::invalid("initial state must be finite"));
    }
    let times = output_grid(tspan, fps);
    let (states, stats) = sample(system, y0, tspan, &times, tolerances, None)?;
    Ok(SampledSolution {
        times,
        states,
        stats,
    })
}

fn run(
    config: &SimulationConfig,
    params: &PhysicalParameters,
    tolerances: Tolerances,
    cancel: Option<&AtomicBool>,
) -> Result<Trajectory, SimulationError> {
    config.validate()?;
    params.validate()?;
    tolerances.validate()?;

    let times = output_grid(config.tspan, config.fps);
    debug!(
        tspan = config.tspan,
        fps = config.fps,
        samples = times.len(),
        rtol = tolerances.rtol,
        atol = tolerances.atol,
        "integrating double pendulum"
    );

    let system = DoublePendulum::new(*params);
    let y0 = config.initial.to_array();
    let (states, stats) = sample(&system, &y0, config.tspan, &times, tolerances, cancel)
        .inspect_err(|err| warn!(%err, "double pendulum integration failed"))?;

    let samples = times
        .into_iter()
        .zip(states)
        .map(|(t, y)| Sample {
            t,
            state: State::new(y[0], y[1], y[2], y[3]),
        })
        .collect();

    debug!(
        accepted = stats.accepted_steps,
        rejected = stats.rejected_steps,
        evaluations = stats.evaluations,
        "integration finished"
    );
    Ok(Trajectory { samples, stats })
}

/// Drives the stepper to `tspan`, answering each grid time from the dense
/// output of the accepted step that reaches it.
fn sample<S: DynamicalSystem>(
    system: &S,
    y0: &[f64],
    tspan: f64,
    times: &[f64],
    tolerances: Tolerances,
    cancel: Option<&AtomicBool>,
) -> Result<(Vec<Vec<f64>>, IntegrationStats), SimulationError> {
    let mut stepper = DormandPrince45::new(system, 0.0, y0, tspan, tolerances)?;
    let mut states = Vec::with_capacity(times.len());
    let mut next = 0;

    while !stepper.is_finished() {
        if cancel.is_some_and(|flag| flag.load(Ordering::Relaxed)) {
            return Err(SimulationError::Cancelled { t: stepper.t() });
        }
        stepper.step(system)?;

        let reached = stepper.t();
        while next < times.len() && times[next] <= reached {
            let mut y = vec![0.0; y0.len()];
            stepper.dense_output(times[next], &mut y);
            states.push(y);
            next += 1;
        }
    }

    debug_assert_eq!(states.len(), times.len());
    Ok((states, stepper.stats()))
}
