//! Adaptive explicit Runge-Kutta integration.
//!
//! [`DormandPrince45`] is the 7-stage, first-same-as-last 5(4) pair of Dormand
//! and Prince. The 5th-order solution is propagated, the embedded 4th-order
//! solution only feeds the error estimate, and every accepted step carries a
//! quartic interpolant so callers can sample the solution anywhere inside it.
use crate::error::SimulationError;
use crate::traits::DynamicalSystem;
use serde::{Deserialize, Serialize};
use tracing::trace;

const STAGES: usize = 6;

const C: [f64; STAGES] = [0.0, 1.0 / 5.0, 3.0 / 10.0, 4.0 / 5.0, 8.0 / 9.0, 1.0];

const A: [[f64; 5]; STAGES] = [
    [0.0, 0.0, 0.0, 0.0, 0.0],
    [1.0 / 5.0, 0.0, 0.0, 0.0, 0.0],
    [3.0 / 40.0, 9.0 / 40.0, 0.0, 0.0, 0.0],
    [44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0, 0.0, 0.0],
    [
        19372.0 / 6561.0,
        -25360.0 / 2187.0,
        64448.0 / 6561.0,
        -212.0 / 729.0,
        0.0,
    ],
    [
        9017.0 / 3168.0,
        -355.0 / 33.0,
        46732.0 / 5247.0,
        49.0 / 176.0,
        -5103.0 / 18656.0,
    ],
];

const B: [f64; STAGES] = [
    35.0 / 384.0,
    0.0,
    500.0 / 1113.0,
    125.0 / 192.0,
    -2187.0 / 6784.0,
    11.0 / 84.0,
];

// Difference between the 5th- and 4th-order weights, including the FSAL stage.
const E: [f64; STAGES + 1] = [
    -71.0 / 57600.0,
    0.0,
    71.0 / 16695.0,
    -71.0 / 1920.0,
    17253.0 / 339200.0,
    -22.0 / 525.0,
    1.0 / 40.0,
];

// Dense output coefficients: row j multiplies stage j, column m multiplies x^(m+1).
const P: [[f64; 4]; STAGES + 1] = [
    [
        1.0,
        -8048581381.0 / 2820520608.0,
        8663915743.0 / 2820520608.0,
        -12715105075.0 / 11282082432.0,
    ],
    [0.0, 0.0, 0.0, 0.0],
    [
        0.0,
        131558114200.0 / 32700410799.0,
        -68118460800.0 / 10900136933.0,
        87487479700.0 / 32700410799.0,
    ],
    [
        0.0,
        -1754552775.0 / 470086768.0,
        14199869525.0 / 1410260304.0,
        -10690763975.0 / 1880347072.0,
    ],
    [
        0.0,
        127303824393.0 / 49829197408.0,
        -318862633887.0 / 49829197408.0,
        701980252875.0 / 199316789632.0,
    ],
    [
        0.0,
        -282668133.0 / 205662961.0,
        2019193451.0 / 616988883.0,
        -1453857185.0 / 822651844.0,
    ],
    [
        0.0,
        40617522.0 / 29380423.0,
        -110615467.0 / 29380423.0,
        69997945.0 / 29380423.0,
    ],
];

/// Order of the embedded error estimator.
const ERROR_ORDER: f64 = 4.0;
const ERROR_EXPONENT: f64 = -1.0 / (ERROR_ORDER + 1.0);
const SAFETY: f64 = 0.9;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 10.0;

/// Local error tolerances and step cap for the adaptive controller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tolerances {
    pub rtol: f64,
    pub atol: f64,
    pub max_step: f64,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self {
            rtol: 1e-3,
            atol: 1e-6,
            max_step: f64::INFINITY,
        }
    }
}

impl Tolerances {
    pub fn validate(&self) -> Result<(), SimulationError> {
        if !self.rtol.is_finite() || self.rtol <= 0.0 {
            return Err(SimulationError::invalid(format!(
                "rtol must be positive and finite, got {}",
                self.rtol
            )));
        }
        if !self.atol.is_finite() || self.atol <= 0.0 {
            return Err(SimulationError::invalid(format!(
                "atol must be positive and finite, got {}",
                self.atol
            )));
        }
        if self.max_step.is_nan() || self.max_step <= 0.0 {
            return Err(SimulationError::invalid(format!(
                "max_step must be positive, got {}",
                self.max_step
            )));
        }
        Ok(())
    }
}

/// Work counters for one integration run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrationStats {
    pub accepted_steps: usize,
    pub rejected_steps: usize,
    pub evaluations: usize,
}

/// Dormand-Prince 5(4) stepper over `[t0, t_bound]`.
///
/// State machine over `(t, y, h)`: each call to [`step`](Self::step) attempts
/// steps until one is accepted, then adapts `h` for the next call. The run is
/// finished once `t` reaches `t_bound` exactly.
pub struct DormandPrince45 {
    tolerances: Tolerances,
    t: f64,
    t_bound: f64,
    h_abs: f64,
    y: Vec<f64>,
    f: Vec<f64>,
    k: [Vec<f64>; STAGES + 1],
    y_new: Vec<f64>,
    tmp: Vec<f64>,
    // Last accepted step, kept for dense output.
    t_old: f64,
    h_prev: f64,
    y_old: Vec<f64>,
    stats: IntegrationStats,
}

impl DormandPrince45 {
    pub fn new(
        system: &impl DynamicalSystem,
        t0: f64,
        y0: &[f64],
        t_bound: f64,
        tolerances: Tolerances,
    ) -> Result<Self, SimulationError> {
        tolerances.validate()?;
        let dim = system.dimension();
        if y0.len() != dim {
            return Err(SimulationError::invalid(format!(
                "initial state has {} components, system expects {dim}",
                y0.len()
            )));
        }
        if !t0.is_finite() || !t_bound.is_finite() || t_bound <= t0 {
            return Err(SimulationError::invalid(format!(
                "integration bound {t_bound} must be finite and exceed the start time {t0}"
            )));
        }

        let mut stepper = Self {
            tolerances,
            t: t0,
            t_bound,
            h_abs: 0.0,
            y: y0.to_vec(),
            f: vec![0.0; dim],
            k: std::array::from_fn(|_| vec![0.0; dim]),
            y_new: vec![0.0; dim],
            tmp: vec![0.0; dim],
            t_old: t0,
            h_prev: 0.0,
            y_old: y0.to_vec(),
            stats: IntegrationStats::default(),
        };

        system.apply(t0, &stepper.y, &mut stepper.f)?;
        stepper.stats.evaluations += 1;
        stepper.h_abs = stepper.initial_step(system)?;
        Ok(stepper)
    }

    pub fn t(&self) -> f64 {
        self.t
    }

    pub fn y(&self) -> &[f64] {
        &self.y
    }

    pub fn step_size(&self) -> f64 {
        self.h_abs
    }

    pub fn stats(&self) -> IntegrationStats {
        self.stats
    }

    pub fn is_finished(&self) -> bool {
        self.t >= self.t_bound
    }

    /// Interval `[t_old, t]` covered by the last accepted step.
    pub fn last_step(&self) -> (f64, f64) {
        (self.t_old, self.t)
    }

    /// Advances by one accepted step.
    pub fn step(&mut self, system: &impl DynamicalSystem) -> Result<(), SimulationError> {
        let t = self.t;
        let min_step = 10.0 * spacing_above(t);
        let max_step = self.tolerances.max_step;

        let mut h_abs = if self.h_abs > max_step {
            max_step
        } else if self.h_abs < min_step {
            min_step
        } else {
            self.h_abs
        };

        let mut rejected = false;
        loop {
            if h_abs < min_step {
                return Err(SimulationError::IntegrationDivergence { t });
            }

            let t_new = (t + h_abs).min(self.t_bound);
            let h = t_new - t;
            h_abs = h.abs();

            self.attempt(system, t, h)?;
            let error_norm = self.error_norm(h);

            if error_norm < 1.0 {
                let mut factor = if error_norm == 0.0 {
                    MAX_FACTOR
                } else {
                    MAX_FACTOR.min(SAFETY * error_norm.powf(ERROR_EXPONENT))
                };
                if rejected {
                    factor = factor.min(1.0);
                }
                self.accept(t, t_new, h);
                self.h_abs = h_abs * factor;
                return Ok(());
            }

            // NaN norms land here too and shrink by the minimum factor.
            let shrink = SAFETY * error_norm.powf(ERROR_EXPONENT);
            h_abs *= if shrink > MIN_FACTOR { shrink } else { MIN_FACTOR };
            rejected = true;
            self.stats.rejected_steps += 1;
            trace!(t, h, error_norm, next_h = h_abs, "rejected step");
        }
    }

    /// Evaluates the interpolant of the last accepted step at `t` into `out`.
    ///
    /// `t` should lie within [`last_step`](Self::last_step); the polynomial is
    /// still evaluated outside it but loses accuracy quickly.
    pub fn dense_output(&self, t: f64, out: &mut [f64]) {
        if self.h_prev == 0.0 {
            out.copy_from_slice(&self.y);
            return;
        }
        let x = (t - self.t_old) / self.h_prev;
        let powers = [x, x * x, x * x * x, x * x * x * x];
        for i in 0..out.len() {
            let mut acc = 0.0;
            for (stage, coeffs) in self.k.iter().zip(P.iter()) {
                let q = coeffs[0] * powers[0]
                    + coeffs[1] * powers[1]
                    + coeffs[2] * powers[2]
                    + coeffs[3] * powers[3];
                acc += stage[i] * q;
            }
            out[i] = self.y_old[i] + self.h_prev * acc;
        }
    }

    /// One Dormand-Prince trial step of size `h`, filling `k` and `y_new`.
    fn attempt(
        &mut self,
        system: &impl DynamicalSystem,
        t: f64,
        h: f64,
    ) -> Result<(), SimulationError> {
        let dim = self.y.len();
        self.k[0].copy_from_slice(&self.f);

        for s in 1..STAGES {
            for i in 0..dim {
                let mut dy = 0.0;
                for j in 0..s {
                    dy += A[s][j] * self.k[j][i];
                }
                self.tmp[i] = self.y[i] + h * dy;
            }
            system.apply(t + C[s] * h, &self.tmp, &mut self.k[s])?;
        }

        for i in 0..dim {
            let mut dy = 0.0;
            for j in 0..STAGES {
                dy += B[j] * self.k[j][i];
            }
            self.y_new[i] = self.y[i] + h * dy;
        }
        system.apply(t + h, &self.y_new, &mut self.k[STAGES])?;
        self.stats.evaluations += STAGES;
        Ok(())
    }

    /// RMS norm of the embedded error estimate, scaled per component.
    fn error_norm(&self, h: f64) -> f64 {
        let Tolerances { rtol, atol, .. } = self.tolerances;
        let dim = self.y.len();
        let mut sum = 0.0;
        for i in 0..dim {
            let mut err = 0.0;
            for (j, e) in E.iter().enumerate() {
                err += e * self.k[j][i];
            }
            let scale = atol + self.y[i].abs().max(self.y_new[i].abs()) * rtol;
            let ratio = h * err / scale;
            sum += ratio * ratio;
        }
        (sum / dim as f64).sqrt()
    }

    fn accept(&mut self, t: f64, t_new: f64, h: f64) {
        self.t_old = t;
        self.h_prev = h;
        std::mem::swap(&mut self.y_old, &mut self.y);
        self.y.copy_from_slice(&self.y_new);
        self.f.copy_from_slice(&self.k[STAGES]);
        self.t = t_new;
        self.stats.accepted_steps += 1;
    }

    /// Initial step size from the magnitudes of `y0`, `f0` and a trial
    /// derivative (Hairer, Norsett & Wanner, II.4).
    fn initial_step(&mut self, system: &impl DynamicalSystem) -> Result<f64, SimulationError> {
        let Tolerances {
            rtol,
            atol,
            max_step,
        } = self.tolerances;
        let t0 = self.t;
        let interval = self.t_bound - t0;
        let dim = self.y.len();

        let mut d0 = 0.0;
        let mut d1 = 0.0;
        for i in 0..dim {
            let scale = atol + self.y[i].abs() * rtol;
            d0 += (self.y[i] / scale).powi(2);
            d1 += (self.f[i] / scale).powi(2);
        }
        let d0 = (d0 / dim as f64).sqrt();
        let d1 = (d1 / dim as f64).sqrt();

        let h0 = if d0 < 1e-5 || d1 < 1e-5 {
            1e-6
        } else {
            0.01 * d0 / d1
        };
        let h0 = h0.min(interval);

        for i in 0..dim {
            self.tmp[i] = self.y[i] + h0 * self.f[i];
        }
        // k[1] is scratch until the first step overwrites it.
        system.apply(t0 + h0, &self.tmp, &mut self.k[1])?;
        self.stats.evaluations += 1;

        let mut d2 = 0.0;
        for i in 0..dim {
            let scale = atol + self.y[i].abs() * rtol;
            d2 += ((self.k[1][i] - self.f[i]) / scale).powi(2);
        }
        let d2 = (d2 / dim as f64).sqrt() / h0;

        let h1 = if d1 <= 1e-15 && d2 <= 1e-15 {
            (h0 * 1e-3).max(1e-6)
        } else {
            (0.01 / d1.max(d2)).powf(1.0 / (ERROR_ORDER + 1.0))
        };

        Ok((100.0 * h0).min(h1).min(interval).min(max_step))
    }
}

/// Distance from `t` to the next representable value above it.
fn spacing_above(t: f64) -> f64 {
    if !t.is_finite() {
        return f64::INFINITY;
    }
    let next = if t == 0.0 {
        f64::from_bits(1)
    } else if t > 0.0 {
        f64::from_bits(t.to_bits() + 1)
    } else {
        f64::from_bits(t.to_bits() - 1)
    };
    next - t
}
