use std::io::{BufRead, Write};

use crate::types::{Plan, Step};

/// Human decision over a whole plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanDecision {
    RunAll,
    StepByStep,
    Cancel,
}

/// Human decision over a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDecision {
    Proceed,
    Skip,
    Abort,
}

/// The confirmation gate is the only component permitted to block on human
/// input; the action loop calls it through `spawn_blocking`. All other
/// suspension points are bounded and cancellable.
pub trait ConfirmationGate: Send + Sync {
    fn confirm_plan(&self, plan: &Plan) -> PlanDecision;
    fn confirm_step(&self, step: &Step) -> StepDecision;
    /// Suspend until the human signals they have handled something the
    /// agent could not (e.g. a CAPTCHA fallback).
    fn wait_for_human(&self, message: &str);
}

/// Interactive gate over stdin/stdout.
#[derive(Debug, Default)]
pub struct TerminalGate;

impl TerminalGate {
    pub fn new() -> Self {
        Self
    }

    fn prompt(&self, text: &str) -> String {
        print!("{text}");
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        let _ = std::io::stdin().lock().read_line(&mut line);
        line.trim().to_uppercase()
    }

    fn print_plan_preview(&self, plan: &Plan) {
        println!("\n{}", "=".repeat(60));
        println!("EXECUTION PLAN - review before approving");
        println!("{}", "=".repeat(60));
        println!("\nGoal: {}\n", plan.goal);
        for step in &plan.steps {
            println!("  Step {}: {}", step.index, step.action.name().to_uppercase());
            println!("    {}", step.description);
            if let Some(target) = &step.target {
                println!("    target: {target}");
            }
            if let Some(value) = &step.value {
                println!("    value: {value}");
            }
            if let Some(expected) = &step.expected_outcome {
                println!("    expected: {expected}");
            }
        }
        println!("\nSuccess criteria: {}", plan.success_criteria);
        println!("{}", "=".repeat(60));
    }
}

impl ConfirmationGate for TerminalGate {
    fn confirm_plan(&self, plan: &Plan) -> PlanDecision {
        self.print_plan_preview(plan);
        println!("\n  [Y] run all steps   [S] confirm each step   [N] cancel");
        loop {
            match self.prompt("Your choice [Y/S/N]: ").as_str() {
                "Y" | "YES" => return PlanDecision::RunAll,
                "S" | "STEP" => return PlanDecision::StepByStep,
                "N" | "NO" | "" => return PlanDecision::Cancel,
                _ => println!("  Please enter Y, S, or N"),
            }
        }
    }

    fn confirm_step(&self, step: &Step) -> StepDecision {
        println!("\nStep {}: {}", step.index, step.action.name().to_uppercase());
        println!("  {}", step.description);
        if let Some(target) = &step.target {
            println!("  target: {target}");
        }
        println!("  [Y] execute   [S] skip   [C] cancel the run");
        loop {
            match self.prompt("  Choice [Y/S/C]: ").as_str() {
                "Y" | "YES" | "" => return StepDecision::Proceed,
                "S" | "SKIP" => return StepDecision::Skip,
                "C" | "CANCEL" => return StepDecision::Abort,
                _ => println!("  Please enter Y, S, or C"),
            }
        }
    }

    fn wait_for_human(&self, message: &str) {
        println!("\n{message}");
        self.prompt("Press Enter to continue... ");
    }
}

/// Non-interactive gate with fixed answers, used for `--yes` and in tests.
#[derive(Debug, Clone, Copy)]
pub struct AutoGate {
    pub plan: PlanDecision,
    pub step: StepDecision,
}

impl AutoGate {
    pub fn run_all() -> Self {
        Self {
            plan: PlanDecision::RunAll,
            step: StepDecision::Proceed,
        }
    }
}

impl ConfirmationGate for AutoGate {
    fn confirm_plan(&self, _plan: &Plan) -> PlanDecision {
        self.plan
    }

    fn confirm_step(&self, _step: &Step) -> StepDecision {
        self.step
    }

    fn wait_for_human(&self, _message: &str) {}
}
