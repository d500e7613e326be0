use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration for a run. Defaults mirror the recognized option
/// surface; environment variables override screenshot and viewport settings
/// (loaded from `.env` by the binary via `dotenvy`).
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Empty means unrestricted.
    pub allowed_domains: Vec<String>,
    /// Merged with the built-in blocklist.
    pub blocked_domains: Vec<String>,
    /// Merged with the built-in keyword list.
    pub blocked_keywords: Vec<String>,
    pub max_actions: u32,
    pub max_tokens: u64,
    /// Whole-run deadline, measured from run start.
    pub timeout: Duration,
    pub max_retries_per_step: u32,

    /// Screenshot downscale factor in (0, 1].
    pub screenshot_scale: f32,
    /// JPEG quality in [1, 100].
    pub screenshot_quality: u8,
    pub grayscale: bool,

    /// Feed the planner a DOM element map alongside the goal.
    pub dom_hints: bool,
    /// Browser viewport; also the denormalization basis for coordinates.
    pub screen_width: u32,
    pub screen_height: u32,
    /// Settle delay after each executed action.
    pub settle_delay: Duration,

    pub diagnostics_dir: PathBuf,
    /// Appended-to JSONL violation log; `None` keeps violations in memory
    /// only (tests).
    pub violation_log: Option<PathBuf>,

    /// Skip the confirmation gate entirely (implies run-all mode).
    pub assume_yes: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            allowed_domains: Vec::new(),
            blocked_domains: Vec::new(),
            blocked_keywords: Vec::new(),
            max_actions: 100,
            max_tokens: 200_000,
            timeout: Duration::from_secs(30 * 60),
            max_retries_per_step: 3,
            screenshot_scale: 0.75,
            screenshot_quality: 85,
            grayscale: false,
            dom_hints: true,
            screen_width: 1440,
            screen_height: 900,
            settle_delay: Duration::from_millis(1000),
            diagnostics_dir: PathBuf::from("error_screenshots"),
            violation_log: Some(PathBuf::from("safety_log.jsonl")),
            assume_yes: false,
        }
    }
}

impl AgentConfig {
    /// Apply environment overrides on top of the current values.
    pub fn apply_env(&mut self) {
        if let Some(v) = env_parse::<f32>("SCREENSHOT_SCALE") {
            self.screenshot_scale = v;
        }
        if let Some(v) = env_parse::<u8>("SCREENSHOT_QUALITY") {
            self.screenshot_quality = v;
        }
        if let Some(v) = env_flag("ENABLE_GRAYSCALE") {
            self.grayscale = v;
        }
        if let Some(v) = env_flag("ENABLE_DOM_HINTS") {
            self.dom_hints = v;
        }
        if let Some(v) = env_parse::<u32>("SCREEN_WIDTH") {
            self.screen_width = v;
        }
        if let Some(v) = env_parse::<u32>("SCREEN_HEIGHT") {
            self.screen_height = v;
        }
        self.clamp();
    }

    /// Keep image settings inside their documented ranges.
    pub fn clamp(&mut self) {
        self.screenshot_scale = self.screenshot_scale.clamp(f32::MIN_POSITIVE, 1.0);
        self.screenshot_quality = self.screenshot_quality.clamp(1, 100);
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.trim().parse().ok()
}

fn env_flag(key: &str) -> Option<bool> {
    Some(matches!(
        std::env::var(key).ok()?.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_recognized_options() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.max_actions, 100);
        assert_eq!(cfg.max_tokens, 200_000);
        assert_eq!(cfg.timeout, Duration::from_secs(1800));
        assert_eq!(cfg.max_retries_per_step, 3);
        assert!((cfg.screenshot_scale - 0.75).abs() < f32::EPSILON);
        assert_eq!(cfg.screenshot_quality, 85);
        assert!(!cfg.grayscale);
        assert!(cfg.allowed_domains.is_empty());
    }

    #[test]
    fn clamp_keeps_image_settings_in_range() {
        let mut cfg = AgentConfig {
            screenshot_scale: 3.0,
            screenshot_quality: 0,
            ..AgentConfig::default()
        };
        cfg.clamp();
        assert!((cfg.screenshot_scale - 1.0).abs() < f32::EPSILON);
        assert_eq!(cfg.screenshot_quality, 1);
    }
}
