use std::sync::Arc;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::captcha::{CaptchaOutcome, CaptchaResolver};
use crate::config::AgentConfig;
use crate::confirm::{ConfirmationGate, PlanDecision, StepDecision};
use crate::diagnostics::save_failure;
use crate::driver::BrowserDriver;
use crate::error::AgentError;
use crate::executor::StepExecutor;
use crate::oracle::ReasoningOracle;
use crate::pipeline::ImagePipeline;
use crate::safety::{SafetyPolicy, SessionScope, Verdict, ViolationLog};
use crate::stop::EmergencyStop;
use crate::types::{
    ActionKind, Plan, RunOutcome, RunSummary, Step, ValidationErrorKind, ValidationResult,
};

/// Where the run currently is. Tracked so an abort can report what was in
/// flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Planning,
    AwaitingPlanConfirmation,
    Executing(usize),
    Validating(usize),
    AwaitingCaptcha(usize),
    Completed,
}

impl RunState {
    fn describe(self) -> String {
        match self {
            RunState::Planning => "planning".to_string(),
            RunState::AwaitingPlanConfirmation => "awaiting plan confirmation".to_string(),
            RunState::Executing(i) => format!("executing step {i}"),
            RunState::Validating(i) => format!("validating step {i}"),
            RunState::AwaitingCaptcha(i) => format!("handling captcha on step {i}"),
            RunState::Completed => "completed".to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct RunStats {
    steps_planned: usize,
    steps_attempted: usize,
    steps_succeeded: usize,
    retries: u32,
    captures_taken: usize,
    captures_skipped: usize,
}

/// The orchestrator: plan, gate, then execute-capture-validate each step
/// until the plan completes or something aborts the run. The loop never
/// busy-waits and observes the emergency stop at every suspension point.
pub struct ActionLoop {
    config: AgentConfig,
    oracle: Arc<dyn ReasoningOracle>,
    driver: Arc<dyn BrowserDriver>,
    gate: Arc<dyn ConfirmationGate>,
    stop: EmergencyStop,
    log: Arc<ViolationLog>,
}

impl ActionLoop {
    pub fn new(
        config: AgentConfig,
        oracle: Arc<dyn ReasoningOracle>,
        driver: Arc<dyn BrowserDriver>,
        gate: Arc<dyn ConfirmationGate>,
        stop: EmergencyStop,
        log: Arc<ViolationLog>,
    ) -> Self {
        Self {
            config,
            oracle,
            driver,
            gate,
            stop,
            log,
        }
    }

    pub async fn run(&self, goal: &str) -> RunSummary {
        let run_id = Uuid::new_v4();
        info!(%run_id, goal, "starting run");

        let scope = SessionScope::from_config(&self.config);
        let mut policy = SafetyPolicy::new(scope, run_id, self.log.clone());
        let mut stats = RunStats::default();
        let mut state = RunState::Planning;

        let result = self
            .drive(goal, &mut policy, &mut stats, &mut state)
            .await;

        let (outcome, last_error) = match result {
            Ok(()) => {
                state = RunState::Completed;
                (RunOutcome::Completed, None)
            }
            Err(e) => {
                error!(state = %state.describe(), error = %e, "run aborted");
                (e.outcome(), Some(e.to_string()))
            }
        };

        let summary = RunSummary {
            run_id,
            outcome,
            final_state: state.describe(),
            steps_planned: stats.steps_planned,
            steps_attempted: stats.steps_attempted,
            steps_succeeded: stats.steps_succeeded,
            retries: stats.retries,
            violations_blocked: self.log.blocked_count_for(run_id),
            captures_taken: stats.captures_taken,
            captures_skipped: stats.captures_skipped,
            tokens_used: self.oracle.tokens_used(),
            last_error,
        };
        info!(
            outcome = ?summary.outcome,
            steps = summary.steps_succeeded,
            tokens = summary.tokens_used,
            "run finished"
        );
        summary
    }

    async fn drive(
        &self,
        goal: &str,
        policy: &mut SafetyPolicy,
        stats: &mut RunStats,
        state: &mut RunState,
    ) -> Result<(), AgentError> {
        let plan = self.make_plan(goal, policy).await?;
        stats.steps_planned = plan.len();

        *state = RunState::AwaitingPlanConfirmation;
        let mode = self.confirm_plan(&plan).await?;
        if mode == PlanDecision::Cancel {
            info!("plan rejected by user");
            return Err(AgentError::CancellationRequested);
        }

        let executor = Arc::new(StepExecutor::new(self.driver.clone(), self.stop.clone()));
        let resolver =
            CaptchaResolver::new(self.driver.clone(), self.oracle.clone(), self.stop.clone());
        let pipeline = ImagePipeline::from_config(&self.config);

        let mut previous_ok = true;
        for step in &plan.steps {
            *state = RunState::Executing(step.index);
            self.stop.check()?;

            match policy.evaluate(step) {
                Verdict::Allow => {}
                Verdict::Block {
                    reason, terminal, ..
                } => {
                    return if terminal {
                        Err(AgentError::ResourceExhausted(reason))
                    } else {
                        Err(AgentError::SafetyViolation { reason })
                    };
                }
            }

            let high_risk = policy.requires_confirmation(step);
            if mode == PlanDecision::StepByStep || (high_risk && !self.config.assume_yes) {
                match self.confirm_step(step).await? {
                    StepDecision::Proceed => {}
                    StepDecision::Skip => {
                        info!(step = step.index, "step skipped by user");
                        policy.refund_action();
                        previous_ok = false;
                        continue;
                    }
                    StepDecision::Abort => return Err(AgentError::CancellationRequested),
                }
            }

            stats.steps_attempted += 1;
            self.run_step(step, &executor, &resolver, &pipeline, policy, stats, state, previous_ok)
                .await?;
            stats.steps_succeeded += 1;
            previous_ok = true;
        }

        info!(criteria = %plan.success_criteria, "all steps completed");
        Ok(())
    }

    async fn make_plan(
        &self,
        goal: &str,
        policy: &mut SafetyPolicy,
    ) -> Result<Plan, AgentError> {
        let hints = if self.config.dom_hints {
            let driver = self.driver.clone();
            tokio::task::spawn_blocking(move || driver.page_structure())
                .await
                .map_err(|e| AgentError::Driver(format!("structure task failed: {e}")))?
                .ok()
        } else {
            None
        };

        // One bounded re-ask on a malformed plan; cancellation preempts.
        let mut last = None;
        for attempt in 0..2 {
            let outcome = tokio::select! {
                r = self.oracle.plan(goal, hints.as_ref()) => r,
                _ = self.stop.cancelled() => Err(AgentError::CancellationRequested),
            };
            policy.sync_tokens(self.oracle.tokens_used());
            match outcome {
                Ok(plan) => {
                    info!(steps = plan.len(), "plan ready");
                    return Ok(plan);
                }
                Err(AgentError::CancellationRequested) => {
                    return Err(AgentError::CancellationRequested)
                }
                Err(e) => {
                    warn!(attempt, error = %e, "planning attempt failed");
                    last = Some(e);
                }
            }
        }
        Err(AgentError::PlanningFailure(
            last.map(|e| e.to_string())
                .unwrap_or_else(|| "no plan produced".to_string()),
        ))
    }

    async fn confirm_plan(&self, plan: &Plan) -> Result<PlanDecision, AgentError> {
        if self.config.assume_yes {
            return Ok(PlanDecision::RunAll);
        }
        let gate = self.gate.clone();
        let plan = plan.clone();
        let decision = tokio::task::spawn_blocking(move || gate.confirm_plan(&plan))
            .await
            .map_err(|e| AgentError::Driver(format!("confirmation task failed: {e}")))?;
        self.stop.check()?;
        Ok(decision)
    }

    async fn confirm_step(&self, step: &Step) -> Result<StepDecision, AgentError> {
        let gate = self.gate.clone();
        let step = step.clone();
        let decision = tokio::task::spawn_blocking(move || gate.confirm_step(&step))
            .await
            .map_err(|e| AgentError::Driver(format!("confirmation task failed: {e}")))?;
        self.stop.check()?;
        Ok(decision)
    }

    /// Execute one step with its retry and captcha handling. Returns only
    /// when the step succeeded or the whole run must abort.
    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        step: &Step,
        executor: &Arc<StepExecutor>,
        resolver: &CaptchaResolver,
        pipeline: &ImagePipeline,
        policy: &mut SafetyPolicy,
        stats: &mut RunStats,
        state: &mut RunState,
        previous_ok: bool,
    ) -> Result<(), AgentError> {
        let mut attempt: u32 = 0;
        let mut reexecute = true;
        let mut captcha_rounds: u32 = 0;

        loop {
            if reexecute {
                *state = RunState::Executing(step.index);
                self.execute_action(step, executor, resolver).await?;
                self.stop.sleep(self.config.settle_delay).await?;
            }
            reexecute = true;

            if pipeline.should_skip(&step.action, previous_ok && attempt == 0) {
                stats.captures_skipped += 1;
                info!(step = step.index, action = step.action.name(), "capture skipped");
                return Ok(());
            }

            *state = RunState::Validating(step.index);
            let raw = self.take_screenshot().await?;
            let processed = pipeline.process(&raw)?;
            stats.captures_taken += 1;

            let validation = tokio::select! {
                v = self.oracle.validate(&processed, step.expectation()) => v?,
                _ = self.stop.cancelled() => return Err(AgentError::CancellationRequested),
            };
            policy.sync_tokens(self.oracle.tokens_used());

            if validation.success {
                info!(
                    step = step.index,
                    confidence = validation.confidence,
                    "step validated"
                );
                return Ok(());
            }

            if validation.error_kind == ValidationErrorKind::CaptchaDetected {
                *state = RunState::AwaitingCaptcha(step.index);
                captcha_rounds += 1;
                if captcha_rounds > 2 {
                    return Err(AgentError::CaptchaUnresolved { step: step.index });
                }
                match resolver.resolve().await? {
                    CaptchaOutcome::Solved => {
                        // Page state may already satisfy the step; check
                        // before touching it again.
                        reexecute = false;
                        continue;
                    }
                    CaptchaOutcome::FallbackToHuman => {
                        let gate = self.gate.clone();
                        let msg = format!(
                            "CAPTCHA on step {} needs human help. Solve it in the browser.",
                            step.index
                        );
                        tokio::task::spawn_blocking(move || gate.wait_for_human(&msg))
                            .await
                            .map_err(|e| {
                                AgentError::Driver(format!("human wait task failed: {e}"))
                            })?;
                        self.stop.check()?;
                        continue;
                    }
                }
            }

            self.handle_failure(step, attempt, &validation, &raw).await?;
            attempt += 1;
            stats.retries += 1;
            warn!(
                step = step.index,
                attempt,
                reason = %validation.reason,
                "retrying step"
            );
        }
    }

    async fn execute_action(
        &self,
        step: &Step,
        executor: &Arc<StepExecutor>,
        resolver: &CaptchaResolver,
    ) -> Result<(), AgentError> {
        if step.action == ActionKind::SolveCaptcha {
            return match resolver.resolve().await? {
                CaptchaOutcome::Solved => Ok(()),
                CaptchaOutcome::FallbackToHuman => {
                    let gate = self.gate.clone();
                    let msg = format!(
                        "CAPTCHA on step {} needs human help. Solve it in the browser.",
                        step.index
                    );
                    tokio::task::spawn_blocking(move || gate.wait_for_human(&msg))
                        .await
                        .map_err(|e| AgentError::Driver(format!("human wait task failed: {e}")))?;
                    self.stop.check()
                }
            };
        }
        let executor = executor.clone();
        let action = step.action.clone();
        tokio::task::spawn_blocking(move || executor.execute(&action))
            .await
            .map_err(|e| AgentError::Driver(format!("execution task failed: {e}")))?
    }

    async fn take_screenshot(&self) -> Result<Vec<u8>, AgentError> {
        let driver = self.driver.clone();
        tokio::task::spawn_blocking(move || driver.screenshot())
            .await
            .map_err(|e| AgentError::Driver(format!("screenshot task failed: {e}")))?
    }

    /// Bounded retry bookkeeping: once the cap is hit, persist diagnostics
    /// (screenshot plus the page URL at failure time) and turn the
    /// validation failure into a run abort.
    async fn handle_failure(
        &self,
        step: &Step,
        attempt: u32,
        validation: &ValidationResult,
        screenshot: &[u8],
    ) -> Result<(), AgentError> {
        if attempt >= self.config.max_retries_per_step {
            let driver = self.driver.clone();
            let url = tokio::task::spawn_blocking(move || driver.current_url())
                .await
                .ok()
                .and_then(|r| r.ok())
                .unwrap_or_else(|| "unknown".to_string());
            if let Err(e) = save_failure(
                &self.config.diagnostics_dir,
                step.index,
                validation.error_kind,
                &validation.reason,
                &url,
                screenshot,
            ) {
                warn!(error = %e, "failed to write diagnostics");
            }
            return Err(AgentError::ValidationFailure {
                step: step.index,
                attempts: attempt + 1,
                reason: validation.reason.clone(),
            });
        }
        Ok(())
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirm::AutoGate;
    use crate::types::{CaptchaProbe, DomElement, DomHints};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;

    struct MockOracle {
        plan: Plan,
        validations: Mutex<VecDeque<ValidationResult>>,
        tokens: AtomicU64,
    }

    impl MockOracle {
        fn new(plan: Plan, validations: Vec<ValidationResult>) -> Self {
            Self {
                plan,
                validations: Mutex::new(validations.into()),
                tokens: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl ReasoningOracle for MockOracle {
        async fn plan(&self, _goal: &str, _hints: Option<&DomHints>) -> Result<Plan, AgentError> {
            self.tokens.fetch_add(100, Ordering::Relaxed);
            self.plan.clone().finalize().map_err(AgentError::PlanningFailure)
        }

        async fn validate(
            &self,
            _screenshot: &[u8],
            _expected: &str,
        ) -> Result<ValidationResult, AgentError> {
            self.tokens.fetch_add(50, Ordering::Relaxed);
            Ok(self
                .validations
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| ValidationResult::ok("default", 0.9)))
        }

        async fn read_captcha(
            &self,
            _screenshot: &[u8],
            _instruction: &str,
        ) -> Result<String, AgentError> {
            Ok("SLIDE_DISTANCE: 100".to_string())
        }

        fn tokens_used(&self) -> u64 {
            self.tokens.load(Ordering::Relaxed)
        }
    }

    struct MockDriver {
        calls: Mutex<Vec<String>>,
        probes: Mutex<VecDeque<Option<CaptchaProbe>>>,
        stop: Option<EmergencyStop>,
        stop_after_calls: AtomicUsize,
    }

    impl MockDriver {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                probes: Mutex::new(VecDeque::new()),
                stop: None,
                stop_after_calls: AtomicUsize::new(usize::MAX),
            }
        }

        fn stopping_after(stop: EmergencyStop, calls: usize) -> Self {
            let mut d = Self::new();
            d.stop = Some(stop);
            d.stop_after_calls = AtomicUsize::new(calls);
            d
        }

        fn record(&self, call: impl Into<String>) {
            let mut calls = self.calls.lock().unwrap();
            calls.push(call.into());
            if calls.len() >= self.stop_after_calls.load(Ordering::Relaxed)
                && let Some(stop) = &self.stop
            {
                stop.trigger();
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    fn tiny_png() -> Vec<u8> {
        let img = image::RgbImage::from_fn(8, 8, |x, y| image::Rgb([x as u8 * 8, y as u8 * 8, 0]));
        let mut out = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut out, image::ImageOutputFormat::Png)
            .unwrap();
        out.into_inner()
    }

    impl BrowserDriver for MockDriver {
        fn navigate(&self, url: &str) -> Result<(), AgentError> {
            self.record(format!("navigate {url}"));
            Ok(())
        }
        fn click(&self, _x: u32, _y: u32) -> Result<(), AgentError> {
            self.record("click");
            Ok(())
        }
        fn double_click(&self, _x: u32, _y: u32) -> Result<(), AgentError> {
            self.record("double_click");
            Ok(())
        }
        fn right_click(&self, _x: u32, _y: u32) -> Result<(), AgentError> {
            self.record("right_click");
            Ok(())
        }
        fn hover(&self, _x: u32, _y: u32) -> Result<(), AgentError> {
            self.record("hover");
            Ok(())
        }
        fn type_text(&self, text: &str) -> Result<(), AgentError> {
            self.record(format!("type {text}"));
            Ok(())
        }
        fn press_key(&self, key: &str) -> Result<(), AgentError> {
            self.record(format!("key {key}"));
            Ok(())
        }
        fn scroll(&self, _x: u32, _y: u32, _dx: i32, _dy: i32) -> Result<(), AgentError> {
            self.record("scroll");
            Ok(())
        }
        fn go_back(&self) -> Result<(), AgentError> {
            self.record("back");
            Ok(())
        }
        fn go_forward(&self) -> Result<(), AgentError> {
            self.record("forward");
            Ok(())
        }
        fn refresh(&self) -> Result<(), AgentError> {
            self.record("refresh");
            Ok(())
        }
        fn screenshot(&self) -> Result<Vec<u8>, AgentError> {
            Ok(tiny_png())
        }
        fn page_structure(&self) -> Result<DomHints, AgentError> {
            Ok(DomHints {
                elements: vec![DomElement {
                    kind: "button".to_string(),
                    text: "Go".to_string(),
                    id: String::new(),
                    x: 500,
                    y: 500,
                }],
            })
        }
        fn detect_captcha(&self) -> Result<Option<CaptchaProbe>, AgentError> {
            Ok(self.probes.lock().unwrap().pop_front().unwrap_or(None))
        }
        fn drag(&self, _path: &[(u32, u32)], _pause: Duration) -> Result<(), AgentError> {
            self.record("drag");
            Ok(())
        }
        fn current_url(&self) -> Result<String, AgentError> {
            Ok("about:blank".to_string())
        }
        fn viewport(&self) -> (u32, u32) {
            (1000, 1000)
        }
    }

    fn step(action: ActionKind, description: &str) -> Step {
        Step {
            index: 0,
            action,
            description: description.to_string(),
            target: None,
            value: None,
            expected_outcome: Some("expected page state".to_string()),
        }
    }

    fn plan(steps: Vec<Step>) -> Plan {
        Plan {
            goal: "test goal".to_string(),
            steps,
            success_criteria: "everything done".to_string(),
        }
    }

    fn test_config() -> AgentConfig {
        AgentConfig {
            assume_yes: true,
            violation_log: None,
            settle_delay: Duration::from_millis(1),
            diagnostics_dir: std::env::temp_dir().join("warden-test-unused"),
            ..AgentConfig::default()
        }
    }

    fn make_loop(
        config: AgentConfig,
        oracle: MockOracle,
        driver: MockDriver,
        gate: AutoGate,
    ) -> (ActionLoop, Arc<MockDriver>) {
        let driver = Arc::new(driver);
        let stop = driver.stop.clone().unwrap_or_default();
        let action_loop = ActionLoop::new(
            config,
            Arc::new(oracle),
            driver.clone(),
            Arc::new(gate),
            stop,
            Arc::new(ViolationLog::in_memory()),
        );
        (action_loop, driver)
    }

    #[tokio::test]
    async fn three_step_plan_runs_to_completion() {
        let p = plan(vec![
            step(
                ActionKind::Navigate {
                    url: "https://example.com".to_string(),
                },
                "open the site",
            ),
            step(
                ActionKind::TypeTextAt {
                    x: 500,
                    y: 200,
                    text: "rust".to_string(),
                    press_enter: true,
                },
                "search for rust",
            ),
            step(ActionKind::Click { x: 300, y: 400 }, "open first result"),
        ]);
        let oracle = MockOracle::new(
            p,
            vec![
                ValidationResult::ok("site loaded", 0.95),
                ValidationResult::ok("results shown", 0.9),
                ValidationResult::ok("article open", 0.9),
            ],
        );
        let (action_loop, driver) =
            make_loop(test_config(), oracle, MockDriver::new(), AutoGate::run_all());

        let summary = action_loop.run("read about rust").await;

        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!(summary.outcome.exit_code(), 0);
        assert_eq!(summary.steps_planned, 3);
        assert_eq!(summary.steps_succeeded, 3);
        assert_eq!(summary.captures_taken, 3);
        assert_eq!(summary.retries, 0);
        assert_eq!(summary.violations_blocked, 0);
        assert!(summary.tokens_used > 0);
        assert_eq!(driver.calls()[0], "navigate https://example.com");
    }

    #[tokio::test]
    async fn blocked_domain_aborts_before_any_browser_call() {
        let p = plan(vec![step(
            ActionKind::Navigate {
                url: "https://paypal.com/login".to_string(),
            },
            "open paypal",
        )]);
        let oracle = MockOracle::new(p, vec![]);
        let (action_loop, driver) =
            make_loop(test_config(), oracle, MockDriver::new(), AutoGate::run_all());

        let summary = action_loop.run("log into paypal").await;

        assert_eq!(summary.outcome, RunOutcome::AbortedBySafety);
        assert_eq!(summary.outcome.exit_code(), 2);
        assert_eq!(summary.steps_succeeded, 0);
        assert_eq!(summary.violations_blocked, 1);
        assert!(driver.calls().is_empty());
    }

    #[tokio::test]
    async fn rejected_plan_costs_nothing() {
        let p = plan(vec![step(
            ActionKind::Navigate {
                url: "https://example.com".to_string(),
            },
            "open the site",
        )]);
        let oracle = MockOracle::new(p, vec![]);
        let mut config = test_config();
        config.assume_yes = false;
        let gate = AutoGate {
            plan: PlanDecision::Cancel,
            step: StepDecision::Proceed,
        };
        let (action_loop, driver) = make_loop(config, oracle, MockDriver::new(), gate);

        let summary = action_loop.run("anything").await;

        assert_eq!(summary.outcome, RunOutcome::AbortedByUser);
        assert_eq!(summary.outcome.exit_code(), 3);
        assert_eq!(summary.steps_attempted, 0);
        assert_eq!(summary.violations_blocked, 0);
        assert!(driver.calls().is_empty());
    }

    #[tokio::test]
    async fn retry_cap_aborts_and_saves_diagnostics() {
        let p = plan(vec![step(
            ActionKind::Navigate {
                url: "https://example.com".to_string(),
            },
            "open the site",
        )]);
        let oracle = MockOracle::new(
            p,
            vec![
                ValidationResult::failed("blank page", 0.8, ValidationErrorKind::PageError),
                ValidationResult::failed("still blank", 0.8, ValidationErrorKind::PageError),
            ],
        );
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.max_retries_per_step = 1;
        config.diagnostics_dir = dir.path().to_path_buf();
        let (action_loop, driver) = make_loop(config, oracle, MockDriver::new(), AutoGate::run_all());

        let summary = action_loop.run("open the site").await;

        assert_eq!(summary.outcome, RunOutcome::AbortedByError);
        assert_eq!(summary.retries, 1);
        // initial execution plus one retry
        assert_eq!(
            driver.calls().iter().filter(|c| c.starts_with("navigate")).count(),
            2
        );
        let artifacts: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(artifacts.len(), 2);
        assert!(summary.last_error.as_deref().unwrap().contains("step 1"));

        let sidecar = artifacts
            .iter()
            .map(|e| e.as_ref().unwrap().path())
            .find(|p| p.extension().is_some_and(|e| e == "json"))
            .unwrap();
        let meta: serde_json::Value =
            serde_json::from_slice(&std::fs::read(sidecar).unwrap()).unwrap();
        assert_eq!(meta["url"], "about:blank");
    }

    #[tokio::test]
    async fn solved_captcha_revalidates_without_reexecuting() {
        let p = plan(vec![
            step(
                ActionKind::Navigate {
                    url: "https://example.com".to_string(),
                },
                "open the site",
            ),
            step(ActionKind::Click { x: 500, y: 500 }, "press the button"),
        ]);
        let oracle = MockOracle::new(
            p,
            vec![
                ValidationResult::ok("site loaded", 0.9),
                ValidationResult::failed(
                    "recaptcha shown",
                    0.9,
                    ValidationErrorKind::CaptchaDetected,
                ),
                ValidationResult::ok("button pressed", 0.9),
            ],
        );
        // No widget found when the resolver probes: page already clear.
        let driver = MockDriver::new();
        let (action_loop, driver) = make_loop(test_config(), oracle, driver, AutoGate::run_all());

        let summary = action_loop.run("press the button").await;

        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!(summary.steps_succeeded, 2);
        let calls = driver.calls();
        assert_eq!(calls.iter().filter(|c| *c == "click").count(), 1);
        assert_eq!(
            calls.iter().filter(|c| c.starts_with("navigate")).count(),
            1
        );
        // three validations means three captures
        assert_eq!(summary.captures_taken, 3);
    }

    #[tokio::test]
    async fn hover_after_success_skips_capture() {
        let p = plan(vec![
            step(
                ActionKind::Navigate {
                    url: "https://example.com".to_string(),
                },
                "open the site",
            ),
            step(ActionKind::Hover { x: 500, y: 500 }, "reveal the menu"),
        ]);
        let oracle = MockOracle::new(p, vec![ValidationResult::ok("site loaded", 0.9)]);
        let (action_loop, _driver) =
            make_loop(test_config(), oracle, MockDriver::new(), AutoGate::run_all());

        let summary = action_loop.run("reveal the menu").await;

        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!(summary.steps_succeeded, 2);
        assert_eq!(summary.captures_taken, 1);
        assert_eq!(summary.captures_skipped, 1);
    }

    #[tokio::test]
    async fn emergency_stop_mid_run_reports_completed_steps() {
        let p = plan(vec![
            step(
                ActionKind::Navigate {
                    url: "https://example.com".to_string(),
                },
                "open the site",
            ),
            step(ActionKind::Click { x: 500, y: 500 }, "press the button"),
            step(ActionKind::Scroll { x: 500, y: 500, dx: 0, dy: 300 }, "scroll down"),
        ]);
        let oracle = MockOracle::new(
            p,
            vec![
                ValidationResult::ok("site loaded", 0.9),
                ValidationResult::ok("button pressed", 0.9),
            ],
        );
        let stop = EmergencyStop::new();
        // navigate is call 1, click is call 2; the stop fires on the click
        let driver = MockDriver::stopping_after(stop, 2);
        let (action_loop, _driver) = make_loop(test_config(), oracle, driver, AutoGate::run_all());

        let summary = action_loop.run("do three things").await;

        assert_eq!(summary.outcome, RunOutcome::AbortedByUser);
        assert_eq!(summary.outcome.exit_code(), 3);
        assert_eq!(summary.steps_succeeded, 1);
        assert!(summary.final_state.contains("step 2"));
    }

    #[tokio::test]
    async fn step_by_step_skip_refunds_quota() {
        let p = plan(vec![
            step(
                ActionKind::Navigate {
                    url: "https://example.com".to_string(),
                },
                "open the site",
            ),
            step(ActionKind::Click { x: 500, y: 500 }, "press the button"),
        ]);
        let oracle = MockOracle::new(p, vec![]);
        let mut config = test_config();
        config.assume_yes = false;
        let gate = AutoGate {
            plan: PlanDecision::StepByStep,
            step: StepDecision::Skip,
        };
        let (action_loop, driver) = make_loop(config, oracle, MockDriver::new(), gate);

        let summary = action_loop.run("do things").await;

        // every step skipped, nothing executed, run still completes
        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!(summary.steps_attempted, 0);
        assert_eq!(summary.steps_succeeded, 0);
        assert!(driver.calls().is_empty());
    }
}
