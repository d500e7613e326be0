//! Safety-gated, cancellable browser automation.
//!
//! A run turns a natural-language goal into a plan of concrete browser
//! actions, asks a human to approve it, then drives a Chrome session
//! through an execute-capture-validate loop. Every action passes a safety
//! policy first, every wait is cancellable, and anything the automation
//! cannot clear (payments, CAPTCHAs it cannot solve) is handed back to
//! the human.

pub mod agent;
pub mod captcha;
pub mod config;
pub mod confirm;
pub mod diagnostics;
pub mod driver;
pub mod error;
pub mod executor;
pub mod oracle;
pub mod pipeline;
pub mod safety;
pub mod stop;
pub mod types;

pub use agent::ActionLoop;
pub use captcha::{CaptchaOutcome, CaptchaResolver};
pub use config::AgentConfig;
pub use confirm::{AutoGate, ConfirmationGate, PlanDecision, StepDecision, TerminalGate};
pub use driver::{BrowserDriver, ChromeDriver};
pub use error::AgentError;
pub use executor::StepExecutor;
pub use oracle::{HttpOracle, ReasoningOracle};
pub use pipeline::ImagePipeline;
pub use safety::{SafetyPolicy, SessionScope, Verdict, ViolationLog};
pub use stop::EmergencyStop;
pub use types::{ActionKind, Plan, RunOutcome, RunSummary, Step, ValidationResult};
