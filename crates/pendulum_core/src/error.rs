use thiserror::Error;

/// Failures surfaced by derivative evaluation and trajectory integration.
///
/// Every variant is terminal for the call that produced it; no partial
/// trajectory accompanies an error.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SimulationError {
    /// Inputs rejected before any integration work was done.
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },

    /// The mass matrix of the model could not be solved at this state.
    #[error("singular dynamics at t = {t}: state {state:?}")]
    SingularDynamics { t: f64, state: Vec<f64> },

    /// The step size fell below the resolvable spacing at `t`.
    #[error("integration diverged at t = {t}: required step size is below floating-point spacing")]
    IntegrationDivergence { t: f64 },

    /// The caller raised the cancellation flag.
    #[error("integration cancelled at t = {t}")]
    Cancelled { t: f64 },
}

impl SimulationError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SimulationError;

    #[test]
    fn messages_carry_context() {
        let err = SimulationError::invalid("tspan must be positive");
        assert_eq!(
            err.to_string(),
            "invalid configuration: tspan must be positive"
        );

        let err = SimulationError::IntegrationDivergence { t: 1.5 };
        assert!(err.to_string().contains("t = 1.5"));

        let err = SimulationError::SingularDynamics {
            t: 0.25,
            state: vec![1.0, 0.0],
        };
        let message = err.to_string();
        assert!(message.contains("t = 0.25"));
        assert!(message.contains("[1.0, 0.0]"));
    }
}
