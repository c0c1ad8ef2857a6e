//! Equations of motion for the pendulum scenes.
//!
//! The double pendulum is two uniform rods of equal length `l` hinged end to
//! end. Its accelerations come from a 2x2 linear system `M * alpha = b`, which
//! is solved here in closed form so that the hot path does not allocate.
use crate::error::SimulationError;
use crate::traits::DynamicalSystem;
use serde::{Deserialize, Serialize};

/// Relative determinant threshold below which the mass matrix counts as singular.
const SINGULAR_TOLERANCE: f64 = 64.0 * f64::EPSILON;

/// Angular configuration and velocity of the two arms.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct State {
    pub theta1: f64,
    pub theta2: f64,
    pub omega1: f64,
    pub omega2: f64,
}

impl State {
    pub const DIM: usize = 4;

    pub fn new(theta1: f64, theta2: f64, omega1: f64, omega2: f64) -> Self {
        Self {
            theta1,
            theta2,
            omega1,
            omega2,
        }
    }

    pub fn to_array(self) -> [f64; 4] {
        [self.theta1, self.theta2, self.omega1, self.omega2]
    }

    pub fn is_finite(&self) -> bool {
        self.to_array().iter().all(|v| v.is_finite())
    }
}

impl From<[f64; 4]> for State {
    fn from(value: [f64; 4]) -> Self {
        Self::new(value[0], value[1], value[2], value[3])
    }
}

impl From<State> for [f64; 4] {
    fn from(value: State) -> Self {
        value.to_array()
    }
}

/// Arm length and gravitational acceleration, fixed for one run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhysicalParameters {
    pub l: f64,
    pub g: f64,
}

impl PhysicalParameters {
    pub fn new(l: f64, g: f64) -> Self {
        Self { l, g }
    }

    /// Zero gravity is accepted; it gives the free-rotation equilibrium case.
    pub fn validate(&self) -> Result<(), SimulationError> {
        if !self.l.is_finite() || self.l <= 0.0 {
            return Err(SimulationError::invalid(format!(
                "arm length l must be positive and finite, got {}",
                self.l
            )));
        }
        if !self.g.is_finite() || self.g < 0.0 {
            return Err(SimulationError::invalid(format!(
                "gravity g must be non-negative and finite, got {}",
                self.g
            )));
        }
        Ok(())
    }
}

/// Angular accelerations `(alpha1, alpha2)` for the given configuration.
///
/// Returns `None` when the mass matrix is numerically singular at a finite
/// configuration.
#[inline]
fn angular_accelerations(x: &[f64], params: &PhysicalParameters) -> Option<[f64; 2]> {
    let (theta1, theta2, omega1, omega2) = (x[0], x[1], x[2], x[3]);
    let PhysicalParameters { l, g } = *params;

    let (sin_diff, cos_diff) = (theta1 - theta2).sin_cos();

    let b1 = -0.5 * l * omega2 * omega2 * sin_diff - 1.5 * g * theta1.sin();
    let b2 = 0.5 * l * omega1 * omega1 * sin_diff - 0.5 * g * theta2.sin();

    let m00 = 4.0 / 3.0 * l;
    let m01 = 0.5 * cos_diff;
    let m10 = l / 3.0;
    let m11 = 0.5 * l * cos_diff;

    let det = m00 * m11 - m01 * m10;
    let scale = m00.abs().max(m01.abs()).max(m10.abs()).max(m11.abs());
    // NaN fails this comparison, so non-finite states fall through and reach
    // the stepper as a rejected trial step.
    if det.abs() <= SINGULAR_TOLERANCE * scale * scale {
        return None;
    }

    // Cramer's rule
    let alpha1 = (b1 * m11 - m01 * b2) / det;
    let alpha2 = (m00 * b2 - m10 * b1) / det;
    Some([alpha1, alpha2])
}

/// Time derivative `(omega1, omega2, alpha1, alpha2)` of a double pendulum state.
///
/// The model is autonomous, so a singular solve is reported at `t = 0`.
pub fn evaluate_derivative(
    state: State,
    params: &PhysicalParameters,
) -> Result<State, SimulationError> {
    let x = state.to_array();
    let [alpha1, alpha2] =
        angular_accelerations(&x, params).ok_or_else(|| SimulationError::SingularDynamics {
            t: 0.0,
            state: x.to_vec(),
        })?;
    Ok(State::new(state.omega1, state.omega2, alpha1, alpha2))
}

/// Double pendulum vector field over `[theta1, theta2, omega1, omega2]`.
#[derive(Debug, Clone, Copy)]
pub struct DoublePendulum {
    pub params: PhysicalParameters,
}

impl DoublePendulum {
    pub fn new(params: PhysicalParameters) -> Self {
        Self { params }
    }
}

impl DynamicalSystem for DoublePendulum {
    fn dimension(&self) -> usize {
        State::DIM
    }

    fn apply(&self, t: f64, x: &[f64], out: &mut [f64]) -> Result<(), SimulationError> {
        let [alpha1, alpha2] = angular_accelerations(x, &self.params).ok_or_else(|| {
            SimulationError::SingularDynamics {
                t,
                state: x.to_vec(),
            }
        })?;
        out[0] = x[2];
        out[1] = x[3];
        out[2] = alpha1;
        out[3] = alpha2;
        Ok(())
    }
}

/// Single rigid pendulum over `[theta, omega]`,
/// `theta'' = -(g / l) sin(theta) - damping * omega`.
#[derive(Debug, Clone, Copy)]
pub struct SimplePendulum {
    pub params: PhysicalParameters,
    pub damping: f64,
}

impl SimplePendulum {
    pub fn new(params: PhysicalParameters) -> Self {
        Self {
            params,
            damping: 0.0,
        }
    }

    pub fn with_damping(mut self, damping: f64) -> Self {
        self.damping = damping;
        self
    }
}

impl DynamicalSystem for SimplePendulum {
    fn dimension(&self) -> usize {
        2
    }

    fn apply(&self, _t: f64, x: &[f64], out: &mut [f64]) -> Result<(), SimulationError> {
        out[0] = x[1];
        out[1] = -self.params.g / self.params.l * x[0].sin() - self.damping * x[1];
        Ok(())
    }
}

/// Cartesian positions of the two bobs, chained from `pivot`.
///
/// Angles are measured from the downward vertical with `y` growing downward,
/// which is the screen convention renderers use.
pub fn bob_positions(
    state: &State,
    params: &PhysicalParameters,
    pivot: [f64; 2],
) -> [[f64; 2]; 2] {
    let l = params.l;
    let first = [
        pivot[0] + l * state.theta1.sin(),
        pivot[1] + l * state.theta1.cos(),
    ];
    let second = [
        first[0] + l * state.theta2.sin(),
        first[1] + l * state.theta2.cos(),
    ];
    [first, second]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::FRAC_PI_2;

    #[test]
    fn derivative_passes_velocities_through() {
        let params = PhysicalParameters::new(200.0, 3000.0);
        let state = State::new(2.0, 2.2, 0.3, -0.7);
        let d = evaluate_derivative(state, &params).expect("derivative should evaluate");
        assert_eq!(d.theta1, 0.3);
        assert_eq!(d.theta2, -0.7);
    }

    #[test]
    fn derivative_satisfies_linear_system() {
        let params = PhysicalParameters::new(200.0, 3000.0);
        let state = State::new(2.0, 2.2, 1.5, -0.5);
        let d = evaluate_derivative(state, &params).expect("derivative should evaluate");

        let l = params.l;
        let g = params.g;
        let diff = state.theta1 - state.theta2;
        let b1 = -0.5 * l * state.omega2.powi(2) * diff.sin() - 1.5 * g * state.theta1.sin();
        let b2 = 0.5 * l * state.omega1.powi(2) * diff.sin() - 0.5 * g * state.theta2.sin();
        let r1 = 4.0 / 3.0 * l * d.omega1 + 0.5 * diff.cos() * d.omega2 - b1;
        let r2 = l / 3.0 * d.omega1 + 0.5 * l * diff.cos() * d.omega2 - b2;
        assert!(r1.abs() < 1e-9 * b1.abs().max(1.0));
        assert!(r2.abs() < 1e-9 * b2.abs().max(1.0));
    }

    #[test]
    fn zero_gravity_aligned_rest_is_equilibrium() {
        let params = PhysicalParameters::new(1.0, 0.0);
        let state = State::new(0.4, 0.4, 0.0, 0.0);
        let d = evaluate_derivative(state, &params).expect("derivative should evaluate");
        assert_eq!(d.to_array(), [0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn hanging_rest_is_equilibrium() {
        let params = PhysicalParameters::new(200.0, 3000.0);
        let d = evaluate_derivative(State::default(), &params).expect("derivative should evaluate");
        assert_eq!(d.to_array(), [0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn perpendicular_arms_are_singular() {
        let params = PhysicalParameters::new(1.0, 9.81);
        let state = State::new(FRAC_PI_2, 0.0, 0.0, 0.0);
        match evaluate_derivative(state, &params) {
            Err(SimulationError::SingularDynamics { t, state: reported }) => {
                assert_eq!(t, 0.0);
                assert_eq!(reported, vec![FRAC_PI_2, 0.0, 0.0, 0.0]);
            }
            other => panic!("expected singular dynamics, got {other:?}"),
        }
    }

    #[test]
    fn quarter_length_matrix_is_singular_everywhere() {
        let params = PhysicalParameters::new(0.25, 9.81);
        let result = evaluate_derivative(State::new(0.1, 0.2, 0.0, 0.0), &params);
        assert!(matches!(
            result,
            Err(SimulationError::SingularDynamics { .. })
        ));
    }

    #[test]
    fn system_apply_reports_evaluation_time() {
        let system = DoublePendulum::new(PhysicalParameters::new(0.25, 1.0));
        let mut out = [0.0; 4];
        let err = system
            .apply(3.5, &[0.0, 0.0, 0.0, 0.0], &mut out)
            .expect_err("matrix should be singular");
        assert!(matches!(err, SimulationError::SingularDynamics { t, .. } if t == 3.5));
    }

    #[test]
    fn system_apply_matches_evaluate_derivative() {
        let params = PhysicalParameters::new(2.0, 9.81);
        let state = State::new(0.3, -1.1, 0.2, 0.9);
        let expected = evaluate_derivative(state, &params).expect("derivative should evaluate");
        let mut out = [0.0; 4];
        DoublePendulum::new(params)
            .apply(0.0, &state.to_array(), &mut out)
            .expect("apply should succeed");
        assert_eq!(out, expected.to_array());
    }

    #[test]
    fn simple_pendulum_restoring_force() {
        let system = SimplePendulum::new(PhysicalParameters::new(2.0, 9.81));
        let mut out = [0.0; 2];
        system.apply(0.0, &[0.5, 1.0], &mut out).expect("apply should succeed");
        assert_eq!(out[0], 1.0);
        assert!((out[1] + 9.81 / 2.0 * 0.5_f64.sin()).abs() < 1e-15);
    }

    #[test]
    fn non_finite_state_is_not_singular() {
        let system = DoublePendulum::new(PhysicalParameters::new(200.0, 3000.0));
        let mut out = [0.0; 4];
        system
            .apply(0.0, &[0.0, 0.0, f64::INFINITY, 0.0], &mut out)
            .expect("overflowed stage should not be reported as singular");
        assert!(out[2].is_nan() || out[3].is_nan());

        system
            .apply(0.0, &[f64::NAN, 0.0, 0.0, 0.0], &mut out)
            .expect("NaN stage should not be reported as singular");
        assert!(out[2].is_nan());
    }

    #[test]
    fn damped_simple_pendulum_opposes_velocity() {
        let params = PhysicalParameters::new(2.0, 9.81);
        let system = SimplePendulum::new(params).with_damping(0.5);
        let mut out = [0.0; 2];
        system.apply(0.0, &[0.0, 2.0], &mut out).expect("apply should succeed");
        assert_eq!(out, [2.0, -1.0]);
    }

    #[test]
    fn params_validation() {
        assert!(PhysicalParameters::new(1.0, 0.0).validate().is_ok());
        assert!(PhysicalParameters::new(0.0, 1.0).validate().is_err());
        assert!(PhysicalParameters::new(1.0, -1.0).validate().is_err());
        assert!(PhysicalParameters::new(f64::NAN, 1.0).validate().is_err());
        assert!(PhysicalParameters::new(1.0, f64::INFINITY).validate().is_err());
    }

    #[test]
    fn bobs_hang_below_pivot_at_rest() {
        let params = PhysicalParameters::new(200.0, 3000.0);
        let [first, second] = bob_positions(&State::default(), &params, [0.0, -100.0]);
        assert_eq!(first, [0.0, 100.0]);
        assert_eq!(second, [0.0, 300.0]);

        let raised = State::new(FRAC_PI_2, FRAC_PI_2, 0.0, 0.0);
        let [first, second] = bob_positions(&raised, &params, [0.0, 0.0]);
        assert!((first[0] - 200.0).abs() < 1e-9);
        assert!((second[0] - 400.0).abs() < 1e-9);
        assert!(second[1].abs() < 1e-9);
    }
}
