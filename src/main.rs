use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use browser_warden::{
    ActionLoop, AgentConfig, AutoGate, ChromeDriver, ConfirmationGate, HttpOracle, TerminalGate,
};
use browser_warden::safety::ViolationLog;
use browser_warden::stop::EmergencyStop;

/// Drive a browser toward a natural-language goal, with a safety policy
/// in front of every action and an emergency stop on Ctrl-C.
#[derive(Parser, Debug)]
#[command(name = "warden", version, about)]
struct Cli {
    /// What the agent should accomplish.
    goal: String,

    /// Skip all confirmation prompts and run the whole plan.
    #[arg(short = 'y', long)]
    yes: bool,

    /// Restrict navigation to these domains (repeatable).
    #[arg(long = "allow-domain", value_name = "DOMAIN")]
    allow_domains: Vec<String>,

    /// Block these domains in addition to the built-in list (repeatable).
    #[arg(long = "block-domain", value_name = "DOMAIN")]
    block_domains: Vec<String>,

    /// Block steps containing this keyword (repeatable).
    #[arg(long = "block-keyword", value_name = "WORD")]
    block_keywords: Vec<String>,

    /// Maximum browser actions for the whole run.
    #[arg(long, default_value_t = 100)]
    max_actions: u32,

    /// Retries per step before the run aborts.
    #[arg(long, default_value_t = 3)]
    max_retries: u32,

    /// Whole-run deadline in minutes.
    #[arg(long, default_value_t = 30)]
    timeout_minutes: u64,

    /// Screenshot downscale factor in (0, 1].
    #[arg(long)]
    screenshot_scale: Option<f32>,

    /// JPEG quality in [1, 100], used with --grayscale.
    #[arg(long)]
    screenshot_quality: Option<u8>,

    /// Send grayscale screenshots to the validator.
    #[arg(long)]
    grayscale: bool,

    /// Plan from the goal alone, without a DOM element map.
    #[arg(long)]
    no_dom_hints: bool,

    /// Directory for failure screenshots and metadata.
    #[arg(long, value_name = "DIR")]
    diagnostics_dir: Option<PathBuf>,

    /// JSONL audit log of safety violations.
    #[arg(long, value_name = "FILE")]
    violation_log: Option<PathBuf>,
}

impl Cli {
    fn into_config(self) -> (String, AgentConfig) {
        // Environment first, explicit flags on top.
        let mut config = AgentConfig::default();
        config.apply_env();

        config.allowed_domains = self.allow_domains;
        config.blocked_domains = self.block_domains;
        config.blocked_keywords = self.block_keywords;
        config.max_actions = self.max_actions;
        config.max_retries_per_step = self.max_retries;
        config.timeout = Duration::from_secs(self.timeout_minutes * 60);
        config.assume_yes = self.yes;
        if self.grayscale {
            config.grayscale = true;
        }
        if self.no_dom_hints {
            config.dom_hints = false;
        }
        if let Some(scale) = self.screenshot_scale {
            config.screenshot_scale = scale;
        }
        if let Some(quality) = self.screenshot_quality {
            config.screenshot_quality = quality;
        }
        if let Some(dir) = self.diagnostics_dir {
            config.diagnostics_dir = dir;
        }
        if let Some(path) = self.violation_log {
            config.violation_log = Some(path);
        }
        config.clamp();
        (self.goal, config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let (goal, config) = Cli::parse().into_config();

    let stop = EmergencyStop::new();
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                stop.trigger();
            }
        });
    }

    let log = match ViolationLog::open(config.violation_log.as_deref()) {
        Ok(log) => Arc::new(log),
        Err(e) => {
            error!(error = %e, "cannot open violation log");
            return ExitCode::from(1);
        }
    };

    let oracle = match HttpOracle::from_env() {
        Ok(oracle) => Arc::new(oracle),
        Err(e) => {
            error!(error = %e, "oracle setup failed");
            return ExitCode::from(1);
        }
    };

    let (width, height) = (config.screen_width, config.screen_height);
    let driver = match tokio::task::spawn_blocking(move || ChromeDriver::launch(width, height))
        .await
        .map_err(|e| e.to_string())
    {
        Ok(Ok(driver)) => Arc::new(driver),
        Ok(Err(e)) => {
            error!(error = %e, "browser launch failed");
            return ExitCode::from(1);
        }
        Err(e) => {
            error!(error = %e, "browser launch task failed");
            return ExitCode::from(1);
        }
    };

    let gate: Arc<dyn ConfirmationGate> = if config.assume_yes {
        Arc::new(AutoGate::run_all())
    } else {
        Arc::new(TerminalGate::new())
    };

    let action_loop = ActionLoop::new(config, oracle, driver, gate, stop, log);
    let summary = action_loop.run(&goal).await;

    println!();
    println!("Run {}: {:?}", summary.run_id, summary.outcome);
    println!(
        "  steps: {}/{} succeeded ({} attempted, {} retries)",
        summary.steps_succeeded, summary.steps_planned, summary.steps_attempted, summary.retries
    );
    println!(
        "  captures: {} taken, {} skipped; tokens: {}",
        summary.captures_taken, summary.captures_skipped, summary.tokens_used
    );
    if summary.violations_blocked > 0 {
        println!("  safety blocks: {}", summary.violations_blocked);
    }
    if let Some(err) = &summary.last_error {
        println!("  last error: {err}");
    }
    info!(state = %summary.final_state, "exiting");

    ExitCode::from(summary.outcome.exit_code())
}
