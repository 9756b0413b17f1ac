use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),
}

impl PlanError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidPlan(reason.into())
    }
}

pub type PlanResult<T> = Result<T, PlanError>;
