use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SimulationError {
    #[error("invalid parameter {field}: {reason}")]
    InvalidParameter { field: &'static str, reason: String },

    #[error("simulation cancelled after {completed} trials")]
    Cancelled { completed: u32 },
}

impl SimulationError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        SimulationError::InvalidParameter {
            field,
            reason: reason.into(),
        }
    }
}

pub type SimulationResult<T> = Result<T, SimulationError>;
