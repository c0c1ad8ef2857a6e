pub mod analysis;
pub mod error;
pub mod model;
pub mod simulation;
pub mod solvers;
/// The `pendulum_core` crate integrates the double pendulum and samples its
/// trajectory at a fixed output rate.
///
/// Key components:
/// - **Traits**: `DynamicalSystem`, the vector-field seam the integrator drives.
/// - **Model**: `State`, `PhysicalParameters`, and the closed-form `evaluate_derivative`.
/// - **Solvers**: `DormandPrince45`, an adaptive 5(4) stepper with dense output.
/// - **Simulation**: `integrate` and friends, resampling onto a fixed `fps` grid.
/// - **Analysis**: linearized normal modes and the modal energy used as an accuracy check.
pub mod traits;

pub use error::SimulationError;
pub use model::{
    bob_positions, evaluate_derivative, DoublePendulum, PhysicalParameters, SimplePendulum, State,
};
pub use simulation::{
    integrate, integrate_batch, integrate_system, integrate_with_cancel, output_grid,
    SampledSolution, Sample, SimulationConfig, Trajectory, MAX_SAMPLES,
};
pub use solvers::{DormandPrince45, IntegrationStats, Tolerances};
