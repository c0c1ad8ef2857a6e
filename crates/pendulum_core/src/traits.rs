use crate::error::SimulationError;

/// A continuous-time system `dx/dt = f(t, x)` that the integrator can drive.
pub trait DynamicalSystem {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Evaluates the vector field.
    /// t: current time
    /// x: current state
    /// out: buffer to write dx/dt into
    ///
    /// Implementations must not allocate or keep state between calls; the
    /// integrator calls this several times per step.
    fn apply(&self, t: f64, x: &[f64], out: &mut [f64]) -> Result<(), SimulationError>;
}
