use crate::{
    model::{PhysicalParameters, State},
    simulation::Trajectory,
};
use anyhow::{anyhow, bail, Result};
use nalgebra::{Matrix2, Vector2};
use serde::Serialize;

/// Normal modes of the double pendulum linearized about the hanging rest state.
///
/// Near `theta1 = theta2 = 0` the equations reduce to `theta'' = -A theta` with
/// `A = M0^-1 K`. In modal coordinates `q = V^-1 theta` each mode is a harmonic
/// oscillator, so `sum(q_dot_i^2 + lambda_i q_i^2)` is conserved.
#[derive(Debug, Clone, Serialize)]
pub struct LinearModes {
    /// Squared angular frequencies, descending.
    pub eigenvalues: [f64; 2],
    /// Unit eigenvectors of `A`, one per column.
    pub eigenvectors: Matrix2<f64>,
    modal_transform: Matrix2<f64>,
}

pub fn linear_modes(params: &PhysicalParameters) -> Result<LinearModes> {
    let PhysicalParameters { l, g } = *params;
    if !l.is_finite() || l <= 0.0 {
        bail!("Arm length must be positive to linearize.");
    }
    if !g.is_finite() || g <= 0.0 {
        bail!("Gravity must be positive for oscillatory modes.");
    }

    let mass = Matrix2::new(4.0 / 3.0 * l, 0.5, l / 3.0, 0.5 * l);
    let stiffness = Matrix2::new(1.5 * g, 0.0, 0.0, 0.5 * g);
    let mass_inv = mass
        .try_inverse()
        .ok_or_else(|| anyhow!("Linearized mass matrix is singular."))?;
    let a = mass_inv * stiffness;

    let half_trace = 0.5 * a.trace();
    let det = a.determinant();
    let disc = half_trace * half_trace - det;
    if disc < 0.0 {
        bail!("Linearized modes are not real (discriminant {disc}).");
    }
    let root = disc.sqrt();
    let eigenvalues = [half_trace + root, half_trace - root];
    if eigenvalues[1] <= 0.0 {
        bail!(
            "Linearized modes must have positive eigenvalues, got {:?}.",
            eigenvalues
        );
    }

    let v1 = eigenvector(&a, eigenvalues[0]);
    let v2 = eigenvector(&a, eigenvalues[1]);
    let eigenvectors = Matrix2::from_columns(&[v1, v2]);
    let modal_transform = eigenvectors
        .try_inverse()
        .ok_or_else(|| anyhow!("Eigenvectors of the linearized system are degenerate."))?;

    Ok(LinearModes {
        eigenvalues,
        eigenvectors,
        modal_transform,
    })
}

/// Unit null vector of `A - lambda I`, taken from whichever row is better scaled.
fn eigenvector(a: &Matrix2<f64>, lambda: f64) -> Vector2<f64> {
    let from_first = Vector2::new(a[(0, 1)], lambda - a[(0, 0)]);
    let from_second = Vector2::new(lambda - a[(1, 1)], a[(1, 0)]);
    let v = if from_first.norm() >= from_second.norm() {
        from_first
    } else {
        from_second
    };
    v.normalize()
}

impl LinearModes {
    /// Angular frequencies of the two modes, descending.
    pub fn frequencies(&self) -> [f64; 2] {
        [self.eigenvalues[0].sqrt(), self.eigenvalues[1].sqrt()]
    }

    /// Modal coordinates `(q, q_dot)` of a state.
    pub fn modal_coordinates(&self, state: &State) -> (Vector2<f64>, Vector2<f64>) {
        let q = self.modal_transform * Vector2::new(state.theta1, state.theta2);
        let q_dot = self.modal_transform * Vector2::new(state.omega1, state.omega2);
        (q, q_dot)
    }

    pub fn modal_energy(&self, state: &State) -> f64 {
        let (q, q_dot) = self.modal_coordinates(state);
        (0..2)
            .map(|i| q_dot[i] * q_dot[i] + self.eigenvalues[i] * q[i] * q[i])
            .sum()
    }
}

/// Largest relative deviation of the modal energy from its initial value.
pub fn relative_energy_drift(trajectory: &Trajectory, modes: &LinearModes) -> Result<f64> {
    let first = trajectory
        .samples()
        .first()
        .ok_or_else(|| anyhow!("Trajectory has no samples."))?;
    let reference = modes.modal_energy(&first.state);
    if reference <= f64::EPSILON {
        bail!("Initial modal energy vanishes; relative drift is undefined.");
    }
    Ok(trajectory
        .iter()
        .map(|sample| (modes.modal_energy(&sample.state) - reference).abs() / reference)
        .fold(0.0, f64::max))
}

#[cfg(test)]
mod tests {
    use super::{linear_modes, relative_energy_drift};
    use crate::model::{PhysicalParameters, State};
    use crate::simulation::{integrate, SimulationConfig};
    use crate::solvers::Tolerances;
    use nalgebra::{Matrix2, Vector2};

    fn assert_err_contains<T: std::fmt::Debug>(result: anyhow::Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    #[test]
    fn unit_length_modes_match_closed_form() {
        let g = 9.81;
        let modes = linear_modes(&PhysicalParameters::new(1.0, g)).expect("modes should compute");
        // A = [[1.5g, -0.5g], [-g, 4g/3]] for l = 1
        let trace = 1.5 * g + 4.0 / 3.0 * g;
        let det = 1.5 * g * g;
        let root = (0.25 * trace * trace - det).sqrt();
        assert!((modes.eigenvalues[0] - (0.5 * trace + root)).abs() < 1e-10);
        assert!((modes.eigenvalues[1] - (0.5 * trace - root)).abs() < 1e-10);
        let [fast, slow] = modes.frequencies();
        assert!(fast > slow && slow > 0.0);
    }

    #[test]
    fn eigenvectors_satisfy_eigen_equation() {
        let params = PhysicalParameters::new(200.0, 3000.0);
        let modes = linear_modes(&params).expect("modes should compute");
        let mass = Matrix2::new(4.0 / 3.0 * 200.0, 0.5, 200.0 / 3.0, 100.0);
        let stiffness = Matrix2::new(4500.0, 0.0, 0.0, 1500.0);
        let a = mass.try_inverse().expect("invertible") * stiffness;
        for i in 0..2 {
            let v: Vector2<f64> = modes.eigenvectors.column(i).into_owned();
            let residual = a * v - v * modes.eigenvalues[i];
            assert!(residual.norm() < 1e-9 * modes.eigenvalues[0]);
            assert!((v.norm() - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn single_mode_has_energy_in_one_coordinate() {
        let modes =
            linear_modes(&PhysicalParameters::new(1.0, 9.81)).expect("modes should compute");
        let v = modes.eigenvectors.column(1);
        let state = State::new(0.01 * v[0], 0.01 * v[1], 0.0, 0.0);
        let (q, q_dot) = modes.modal_coordinates(&state);
        assert!(q[0].abs() < 1e-15);
        assert!((q[1] - 0.01).abs() < 1e-15);
        assert_eq!(q_dot, Vector2::zeros());
        let expected = modes.eigenvalues[1] * 1e-4;
        assert!((modes.modal_energy(&state) - expected).abs() < 1e-15);
    }

    #[test]
    fn linear_modes_rejects_degenerate_parameters() {
        assert_err_contains(
            linear_modes(&PhysicalParameters::new(1.0, 0.0)),
            "Gravity must be positive",
        );
        assert_err_contains(
            linear_modes(&PhysicalParameters::new(0.0, 9.81)),
            "Arm length",
        );
        assert_err_contains(
            linear_modes(&PhysicalParameters::new(0.25, 9.81)),
            "singular",
        );
    }

    #[test]
    fn drift_rejects_resting_trajectory() {
        let params = PhysicalParameters::new(1.0, 9.81);
        let modes = linear_modes(&params).expect("modes should compute");
        let config = SimulationConfig::new(State::default(), 1.0, 10.0);
        let trajectory =
            integrate(&config, &params, Tolerances::default()).expect("integration should succeed");
        assert_err_contains(relative_energy_drift(&trajectory, &modes), "vanishes");
    }
}
