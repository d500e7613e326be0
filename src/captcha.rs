use std::sync::Arc;
use std::time::Duration;

use rand::RngExt;
use tracing::{info, warn};

use crate::driver::BrowserDriver;
use crate::error::AgentError;
use crate::oracle::ReasoningOracle;
use crate::stop::EmergencyStop;
use crate::types::{CaptchaKind, CaptchaProbe};

/// How a CAPTCHA encounter ended. `FallbackToHuman` means the page still
/// shows a challenge and a person has to clear it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptchaOutcome {
    Solved,
    FallbackToHuman,
}

/// Best-effort challenge handling. Checkbox captchas get a click, sliders
/// get a humanized drag, image puzzles get one transcription attempt, and
/// anything that resists is handed to a human rather than hammered.
pub struct CaptchaResolver {
    driver: Arc<dyn BrowserDriver>,
    oracle: Arc<dyn ReasoningOracle>,
    stop: EmergencyStop,
    max_attempts: u32,
}

impl CaptchaResolver {
    pub fn new(
        driver: Arc<dyn BrowserDriver>,
        oracle: Arc<dyn ReasoningOracle>,
        stop: EmergencyStop,
    ) -> Self {
        Self {
            driver,
            oracle,
            stop,
            max_attempts: 1,
        }
    }

    pub async fn resolve(&self) -> Result<CaptchaOutcome, AgentError> {
        self.stop.check()?;
        let driver = self.driver.clone();
        let probe = tokio::task::spawn_blocking(move || driver.detect_captcha())
            .await
            .map_err(|e| AgentError::Driver(format!("captcha probe task failed: {e}")))??;

        let Some(probe) = probe else {
            // Nothing detectable on the page; treat as already cleared.
            info!("no captcha widget found, continuing");
            return Ok(CaptchaOutcome::Solved);
        };
        info!(kind = ?probe.kind, "captcha detected");

        match probe.kind {
            CaptchaKind::RecaptchaCheckbox => self.click_checkbox(&probe).await,
            CaptchaKind::Slider => self.drag_slider(&probe).await,
            CaptchaKind::RecaptchaImage | CaptchaKind::ImageText | CaptchaKind::Hcaptcha => {
                self.transcribe(&probe).await
            }
        }
    }

    async fn click_checkbox(&self, probe: &CaptchaProbe) -> Result<CaptchaOutcome, AgentError> {
        let Some((x, y)) = probe.anchor else {
            return Ok(CaptchaOutcome::FallbackToHuman);
        };
        let driver = self.driver.clone();
        tokio::task::spawn_blocking(move || driver.click(x, y))
            .await
            .map_err(|e| AgentError::Driver(format!("captcha click task failed: {e}")))??;
        self.stop.sleep(Duration::from_secs(2)).await?;

        // A checkbox click may escalate to an image grid.
        let driver = self.driver.clone();
        let after = tokio::task::spawn_blocking(move || driver.detect_captcha())
            .await
            .map_err(|e| AgentError::Driver(format!("captcha probe task failed: {e}")))??;
        match after {
            None => Ok(CaptchaOutcome::Solved),
            Some(p) if p.kind == CaptchaKind::RecaptchaCheckbox => Ok(CaptchaOutcome::Solved),
            Some(_) => Ok(CaptchaOutcome::FallbackToHuman),
        }
    }

    async fn drag_slider(&self, probe: &CaptchaProbe) -> Result<CaptchaOutcome, AgentError> {
        let Some((x, y)) = probe.anchor else {
            return Ok(CaptchaOutcome::FallbackToHuman);
        };
        let screenshot = self.screenshot().await?;
        let reply = self
            .ask_oracle(
                &screenshot,
                "This page shows a slider puzzle. Estimate how many pixels the slider \
                 handle must move right to fill the gap. Reply with exactly \
                 'SLIDE_DISTANCE: <n>' where <n> is an integer.",
            )
            .await?;
        let distance = parse_slide_distance(&reply).unwrap_or(200);
        info!(distance, "dragging slider");

        let path = humanized_path(x, y, distance);
        let driver = self.driver.clone();
        tokio::task::spawn_blocking(move || driver.drag(&path, Duration::from_millis(20)))
            .await
            .map_err(|e| AgentError::Driver(format!("slider drag task failed: {e}")))??;
        self.stop.sleep(Duration::from_secs(2)).await?;

        let driver = self.driver.clone();
        let after = tokio::task::spawn_blocking(move || driver.detect_captcha())
            .await
            .map_err(|e| AgentError::Driver(format!("captcha probe task failed: {e}")))??;
        if after.is_none() {
            Ok(CaptchaOutcome::Solved)
        } else {
            warn!("slider still present after drag");
            Ok(CaptchaOutcome::FallbackToHuman)
        }
    }

    async fn transcribe(&self, probe: &CaptchaProbe) -> Result<CaptchaOutcome, AgentError> {
        for attempt in 0..self.max_attempts {
            self.stop.check()?;
            let screenshot = self.screenshot().await?;
            let reply = self
                .ask_oracle(
                    &screenshot,
                    "This page shows a text CAPTCHA. Transcribe the distorted characters \
                     exactly. Reply with only the characters, or 'UNREADABLE' if you cannot.",
                )
                .await?;
            let text = reply.trim();
            if text.is_empty() || text.eq_ignore_ascii_case("UNREADABLE") {
                warn!(attempt, "captcha transcription unreadable");
                continue;
            }
            if let Some((x, y)) = probe.anchor {
                let driver = self.driver.clone();
                tokio::task::spawn_blocking(move || driver.click(x, y))
                    .await
                    .map_err(|e| AgentError::Driver(format!("captcha click task failed: {e}")))??;
            }
            let driver = self.driver.clone();
            let answer = text.to_string();
            tokio::task::spawn_blocking(move || {
                driver.type_text(&answer)?;
                driver.press_key("Enter")
            })
            .await
            .map_err(|e| AgentError::Driver(format!("captcha entry task failed: {e}")))??;
            self.stop.sleep(Duration::from_secs(2)).await?;

            let driver = self.driver.clone();
            let after = tokio::task::spawn_blocking(move || driver.detect_captcha())
                .await
                .map_err(|e| AgentError::Driver(format!("captcha probe task failed: {e}")))??;
            if after.is_none() {
                return Ok(CaptchaOutcome::Solved);
            }
        }
        Ok(CaptchaOutcome::FallbackToHuman)
    }

    /// Oracle call raced against the stop token, so a long-running read
    /// cannot delay an emergency stop beyond the observation bound.
    async fn ask_oracle(&self, screenshot: &[u8], instruction: &str) -> Result<String, AgentError> {
        tokio::select! {
            r = self.oracle.read_captcha(screenshot, instruction) => r,
            _ = self.stop.cancelled() => Err(AgentError::CancellationRequested),
        }
    }

    async fn screenshot(&self) -> Result<Vec<u8>, AgentError> {
        let driver = self.driver.clone();
        tokio::task::spawn_blocking(move || driver.screenshot())
            .await
            .map_err(|e| AgentError::Driver(format!("screenshot task failed: {e}")))?
    }
}

fn parse_slide_distance(reply: &str) -> Option<u32> {
    let idx = reply.find("SLIDE_DISTANCE")?;
    let tail = &reply[idx..];
    let digits: String = tail
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok().filter(|&d| d > 0 && d <= 2000)
}

/// Slider drag path with slight vertical wobble so the motion does not
/// look machine-straight.
fn humanized_path(x: u32, y: u32, distance: u32) -> Vec<(u32, u32)> {
    const WAYPOINTS: u32 = 20;
    let mut rng = rand::rng();
    let mut path = vec![(x, y)];
    for i in 1..=WAYPOINTS {
        let px = x + distance * i / WAYPOINTS;
        let wobble: i32 = rng.random_range(-2..=2);
        let py = (y as i64 + wobble as i64).max(0) as u32;
        path.push((px, py));
    }
    path
}
