use thiserror::Error;

use crate::types::RunOutcome;

/// Failure taxonomy for a run. Recovery is always local-then-abort: every
/// transient condition gets a small bounded number of retries at the layer
/// that detected it, and nothing retries indefinitely.
#[derive(Debug, Error)]
pub enum AgentError {
    /// A policy block. Always aborts the run, always logged.
    #[error("safety violation: {reason}")]
    SafetyViolation { reason: String },

    /// The oracle returned a malformed or empty plan after the bounded
    /// re-ask.
    #[error("planning failed: {0}")]
    PlanningFailure(String),

    /// A step did not achieve its expected outcome within the retry cap.
    #[error("step {step} failed validation after {attempts} attempts: {reason}")]
    ValidationFailure {
        step: usize,
        attempts: u32,
        reason: String,
    },

    /// Automated CAPTCHA attempts exhausted and human fallback did not
    /// unblock the step.
    #[error("captcha unresolved on step {step}")]
    CaptchaUnresolved { step: usize },

    /// Session quota (actions, tokens) or deadline exceeded.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Emergency stop or user cancel observed. Preempts all other handling.
    #[error("cancellation requested")]
    CancellationRequested,

    #[error("browser driver error: {0}")]
    Driver(String),

    #[error("oracle error: {0}")]
    Oracle(String),

    #[error("image pipeline error: {0}")]
    Image(#[from] image::ImageError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Map a terminal error to the run outcome (and thus the exit status).
    pub fn outcome(&self) -> RunOutcome {
        match self {
            AgentError::SafetyViolation { .. } | AgentError::ResourceExhausted(_) => {
                RunOutcome::AbortedBySafety
            }
            AgentError::CancellationRequested => RunOutcome::AbortedByUser,
            _ => RunOutcome::AbortedByError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_mapping() {
        let safety = AgentError::SafetyViolation {
            reason: "blocked".to_string(),
        };
        assert_eq!(safety.outcome(), RunOutcome::AbortedBySafety);
        assert_eq!(
            AgentError::ResourceExhausted("max actions".to_string()).outcome(),
            RunOutcome::AbortedBySafety
        );
        assert_eq!(
            AgentError::CancellationRequested.outcome(),
            RunOutcome::AbortedByUser
        );
        assert_eq!(
            AgentError::PlanningFailure("empty".to_string()).outcome(),
            RunOutcome::AbortedByError
        );
    }
}
