use serde::{Deserialize, Serialize};

/// Model-facing coordinates live in a 0-1000 normalized space; only the
/// step executor converts them to device pixels.
pub const NORMALIZED_RANGE: u32 = 1000;

/// A single concrete browser action the agent can perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionKind {
    Navigate {
        url: String,
    },
    Click {
        x: u32,
        y: u32,
    },
    DoubleClick {
        x: u32,
        y: u32,
    },
    RightClick {
        x: u32,
        y: u32,
    },
    Hover {
        x: u32,
        y: u32,
    },
    TypeText {
        text: String,
    },
    TypeTextAt {
        x: u32,
        y: u32,
        text: String,
        #[serde(default)]
        press_enter: bool,
    },
    PressKey {
        key: String,
    },
    Scroll {
        x: u32,
        y: u32,
        dx: i32,
        dy: i32,
    },
    GoBack,
    GoForward,
    Refresh,
    Wait {
        seconds: f64,
    },
    SolveCaptcha,
}

impl ActionKind {
    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::Navigate { .. } => "navigate",
            ActionKind::Click { .. } => "click",
            ActionKind::DoubleClick { .. } => "double_click",
            ActionKind::RightClick { .. } => "right_click",
            ActionKind::Hover { .. } => "hover",
            ActionKind::TypeText { .. } => "type_text",
            ActionKind::TypeTextAt { .. } => "type_text_at",
            ActionKind::PressKey { .. } => "press_key",
            ActionKind::Scroll { .. } => "scroll",
            ActionKind::GoBack => "go_back",
            ActionKind::GoForward => "go_forward",
            ActionKind::Refresh => "refresh",
            ActionKind::Wait { .. } => "wait",
            ActionKind::SolveCaptcha => "solve_captcha",
        }
    }

    /// URL this action navigates to, if any.
    pub fn target_url(&self) -> Option<&str> {
        match self {
            ActionKind::Navigate { url } => Some(url),
            _ => None,
        }
    }

    /// Text this action would enter into the page, if any.
    pub fn typed_text(&self) -> Option<&str> {
        match self {
            ActionKind::TypeText { text } | ActionKind::TypeTextAt { text, .. } => Some(text),
            _ => None,
        }
    }
}

/// One step of an execution plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// 1-based position in the plan, assigned when the plan is built.
    #[serde(default)]
    pub index: usize,
    #[serde(flatten)]
    pub action: ActionKind,
    pub description: String,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub expected_outcome: Option<String>,
}

impl Step {
    /// Lowercased text a keyword filter should see: the description, the
    /// declared target/value, and any text the action would type.
    pub fn haystack(&self) -> String {
        let mut s = self.description.to_lowercase();
        for part in [
            self.target.as_deref(),
            self.value.as_deref(),
            self.action.typed_text(),
        ]
        .into_iter()
        .flatten()
        {
            s.push(' ');
            s.push_str(&part.to_lowercase());
        }
        s
    }

    /// Expected-outcome text used for visual validation.
    pub fn expectation(&self) -> &str {
        self.expected_outcome.as_deref().unwrap_or(&self.description)
    }
}

/// Ordered action sequence produced from a goal. Never mutated after
/// creation; a re-plan replaces it wholesale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub goal: String,
    pub steps: Vec<Step>,
    pub success_criteria: String,
}

impl Plan {
    /// Assign 1-based step indices. Returns an error message when the plan
    /// is structurally unusable (no steps).
    pub fn finalize(mut self) -> Result<Self, String> {
        if self.steps.is_empty() {
            return Err("plan contains no steps".to_string());
        }
        for (i, step) in self.steps.iter_mut().enumerate() {
            step.index = i + 1;
        }
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Error category reported by the visual validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ValidationErrorKind {
    #[default]
    None,
    PageError,
    CaptchaDetected,
    AccessBlocked,
    Timeout,
}

/// Outcome of validating a single step against its expected state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub success: bool,
    pub reason: String,
    pub confidence: f32,
    #[serde(default)]
    pub error_kind: ValidationErrorKind,
}

impl ValidationResult {
    pub fn ok(reason: impl Into<String>, confidence: f32) -> Self {
        Self {
            success: true,
            reason: reason.into(),
            confidence: confidence.clamp(0.0, 1.0),
            error_kind: ValidationErrorKind::None,
        }
    }

    pub fn failed(
        reason: impl Into<String>,
        confidence: f32,
        error_kind: ValidationErrorKind,
    ) -> Self {
        Self {
            success: false,
            reason: reason.into(),
            confidence: confidence.clamp(0.0, 1.0),
            error_kind,
        }
    }
}

/// An interactive page element with normalized coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomElement {
    pub kind: String,
    pub text: String,
    #[serde(default)]
    pub id: String,
    pub x: u32,
    pub y: u32,
}

/// Structured description of the interactive elements on the current page,
/// handed to the planner so it can target coordinates precisely.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomHints {
    pub elements: Vec<DomElement>,
}

impl DomHints {
    /// Render as a text block for the planner prompt.
    pub fn to_prompt_block(&self) -> String {
        if self.elements.is_empty() {
            return "No interactive elements detected.".to_string();
        }
        let mut lines = vec!["INTERACTIVE ELEMENTS (normalized coordinates 0-1000):".to_string()];
        for (i, el) in self.elements.iter().enumerate() {
            let mut line = format!("{}. {}", i + 1, el.kind.to_uppercase());
            if !el.text.is_empty() {
                line.push_str(&format!(" '{}'", el.text));
            }
            if !el.id.is_empty() {
                line.push_str(&format!(" (id={})", el.id));
            }
            line.push_str(&format!(" @ ({}, {})", el.x, el.y));
            lines.push(line);
        }
        lines.join("\n")
    }
}

/// CAPTCHA variant detected on a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptchaKind {
    RecaptchaCheckbox,
    RecaptchaImage,
    Slider,
    ImageText,
    Hcaptcha,
}

/// Result of the driver's page-structure CAPTCHA probe. The anchor, when
/// present, is in device pixels (the driver's own coordinate space).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptchaProbe {
    pub kind: CaptchaKind,
    pub anchor: Option<(u32, u32)>,
}

/// Terminal outcome of a run, mapped to the process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    AbortedBySafety,
    AbortedByUser,
    AbortedByError,
}

impl RunOutcome {
    pub fn exit_code(self) -> u8 {
        match self {
            RunOutcome::Completed => 0,
            RunOutcome::AbortedByError => 1,
            RunOutcome::AbortedBySafety => 2,
            RunOutcome::AbortedByUser => 3,
        }
    }
}

/// Final accounting for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: uuid::Uuid,
    pub outcome: RunOutcome,
    /// State the run was in when it ended (for abort reporting).
    pub final_state: String,
    pub steps_planned: usize,
    pub steps_attempted: usize,
    pub steps_succeeded: usize,
    pub retries: u32,
    pub violations_blocked: usize,
    pub captures_taken: usize,
    pub captures_skipped: usize,
    pub tokens_used: u64,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_kind_round_trips_through_tagged_json() {
        let json = r#"{"action":"type_text_at","x":512,"y":230,"text":"rust","press_enter":true}"#;
        let action: ActionKind = serde_json::from_str(json).unwrap();
        assert_eq!(
            action,
            ActionKind::TypeTextAt {
                x: 512,
                y: 230,
                text: "rust".to_string(),
                press_enter: true,
            }
        );
    }

    #[test]
    fn step_deserializes_with_flattened_action() {
        let json = r#"{
            "action": "navigate",
            "url": "https://example.com",
            "description": "Open the example site",
            "expected_outcome": "Example homepage visible"
        }"#;
        let step: Step = serde_json::from_str(json).unwrap();
        assert_eq!(step.action.target_url(), Some("https://example.com"));
        assert_eq!(step.expectation(), "Example homepage visible");
    }

    #[test]
    fn finalize_rejects_empty_plan_and_numbers_steps() {
        let empty = Plan {
            goal: "g".to_string(),
            steps: vec![],
            success_criteria: "s".to_string(),
        };
        assert!(empty.finalize().is_err());

        let plan = Plan {
            goal: "g".to_string(),
            steps: vec![
                Step {
                    index: 0,
                    action: ActionKind::GoBack,
                    description: "back".to_string(),
                    target: None,
                    value: None,
                    expected_outcome: None,
                },
                Step {
                    index: 0,
                    action: ActionKind::Refresh,
                    description: "refresh".to_string(),
                    target: None,
                    value: None,
                    expected_outcome: None,
                },
            ],
            success_criteria: "s".to_string(),
        };
        let plan = plan.finalize().unwrap();
        assert_eq!(plan.steps[0].index, 1);
        assert_eq!(plan.steps[1].index, 2);
    }

    #[test]
    fn haystack_includes_typed_text_and_target() {
        let step = Step {
            index: 1,
            action: ActionKind::TypeText {
                text: "MY Card Number".to_string(),
            },
            description: "Fill the form".to_string(),
            target: Some("Billing field".to_string()),
            value: None,
            expected_outcome: None,
        };
        let hay = step.haystack();
        assert!(hay.contains("fill the form"));
        assert!(hay.contains("billing field"));
        assert!(hay.contains("my card number"));
    }

    #[test]
    fn exit_codes_match_contract() {
        assert_eq!(RunOutcome::Completed.exit_code(), 0);
        assert_eq!(RunOutcome::AbortedByError.exit_code(), 1);
        assert_eq!(RunOutcome::AbortedBySafety.exit_code(), 2);
        assert_eq!(RunOutcome::AbortedByUser.exit_code(), 3);
    }
}
