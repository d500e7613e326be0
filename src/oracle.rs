use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::error::AgentError;
use crate::types::{DomHints, Plan, ValidationErrorKind, ValidationResult};

const PLANNER_PROMPT: &str = r#"You are a browser automation planner. Convert the user's goal into a step-by-step plan of concrete browser actions.

USER GOAL: {goal}

{hints}

Return a JSON object with this EXACT structure:
{
  "goal": "the user's goal restated clearly",
  "steps": [
    {
      "action": "navigate", "url": "https://...",
      "description": "what this step does in plain language",
      "target": "element description (if applicable)",
      "value": "text being entered (if applicable)",
      "expected_outcome": "what should be visible after this step succeeds"
    }
  ],
  "success_criteria": "how to know the entire task completed"
}

Available actions (coordinates are normalized to 0-1000):
- {"action":"navigate","url":"https://..."}
- {"action":"click","x":500,"y":300}
- {"action":"double_click","x":500,"y":300}
- {"action":"right_click","x":500,"y":300}
- {"action":"hover","x":500,"y":300}
- {"action":"type_text","text":"..."}
- {"action":"type_text_at","x":500,"y":300,"text":"...","press_enter":true}
- {"action":"press_key","key":"Enter"}
- {"action":"scroll","x":500,"y":500,"dx":0,"dy":300}
- {"action":"go_back"} / {"action":"go_forward"} / {"action":"refresh"}
- {"action":"wait","seconds":2}
- {"action":"solve_captcha"}

RULES:
1. Break the task into simple, atomic steps; one action per step.
2. Always start by navigating to the right website.
3. Use the interactive-element coordinates above when provided.
4. Every step needs an expected_outcome for visual validation.
5. Maximum 10 steps.

Return ONLY valid JSON, no markdown or explanation."#;

const VALIDATOR_PROMPT: &str = r#"Analyze this browser screenshot and determine if the expected state was achieved.

EXPECTED STATE: {expected}

Respond with ONLY this JSON:
{
  "success": true/false,
  "reason": "brief explanation of what you see",
  "confidence": 0.0-1.0,
  "error_type": null or "captcha" or "error_page" or "not_found" or "blocked" or "timeout"
}

RULES:
1. success=true ONLY if the expected state is clearly visible.
2. Detect error pages (404, 500, "page not found", connection errors).
3. Detect CAPTCHA challenges (reCAPTCHA, "verify you're human", puzzles).
4. Detect blocked states ("unusual traffic", "access denied", rate limiting).
5. Be strict: if unsure, set success=false with lower confidence.

Return ONLY valid JSON."#;

/// External planning and visual-validation capability. Substitutable for
/// testing; the contract is the only thing the loop relies on.
#[async_trait]
pub trait ReasoningOracle: Send + Sync {
    async fn plan(&self, goal: &str, hints: Option<&DomHints>) -> Result<Plan, AgentError>;

    async fn validate(
        &self,
        screenshot: &[u8],
        expected: &str,
    ) -> Result<ValidationResult, AgentError>;

    /// Best-effort CAPTCHA reading (transcription, slide distance). No
    /// real solving power is assumed.
    async fn read_captcha(
        &self,
        screenshot: &[u8],
        instruction: &str,
    ) -> Result<String, AgentError>;

    /// Cumulative token usage across all calls so far.
    fn tokens_used(&self) -> u64;
}

/// Chat-completions oracle over HTTP. Calls are bounded by a client
/// timeout; transient transport failures are retried exactly once, and a
/// structurally invalid body is never retried here.
pub struct HttpOracle {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    tokens: AtomicU64,
}

impl HttpOracle {
    pub fn new(endpoint: String, api_key: String, model: String) -> Result<Self, AgentError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| AgentError::Oracle(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            endpoint,
            api_key,
            model,
            tokens: AtomicU64::new(0),
        })
    }

    pub fn from_env() -> Result<Self, AgentError> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| AgentError::Oracle("OPENAI_API_KEY not set in environment".to_string()))?;
        let endpoint = std::env::var("WARDEN_API_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1/chat/completions".to_string());
        let model = std::env::var("WARDEN_MODEL").unwrap_or_else(|_| "gpt-4o".to_string());
        Self::new(endpoint, api_key, model)
    }

    /// One chat turn: a text prompt plus an optional attached screenshot.
    async fn chat(&self, prompt: &str, screenshot: Option<&[u8]>) -> Result<String, AgentError> {
        let content = match screenshot {
            Some(bytes) => {
                let data_url = format!("data:image/png;base64,{}", BASE64.encode(bytes));
                json!([
                    {"type": "text", "text": prompt},
                    {"type": "image_url", "image_url": {"url": data_url}},
                ])
            }
            None => json!(prompt),
        };
        let body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": content}],
            "temperature": 0.0,
        });

        let mut last_err = None;
        for attempt in 0..2 {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            match self.send(&body).await {
                Ok(text) => return Ok(text),
                Err(RequestError::Transient(e)) => {
                    warn!(attempt, error = %e, "transient oracle failure, retrying");
                    last_err = Some(e);
                }
                Err(RequestError::Fatal(e)) => return Err(AgentError::Oracle(e)),
            }
        }
        Err(AgentError::Oracle(
            last_err.unwrap_or_else(|| "oracle request failed".to_string()),
        ))
    }

    async fn send(&self, body: &serde_json::Value) -> Result<String, RequestError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(body)
            .send()
            .await
            .map_err(|e| RequestError::Transient(format!("request failed: {e}")))?;

        let status = response.status();
        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RequestError::Transient(format!("invalid response body: {e}")))?;

        if !status.is_success() {
            let message = payload["error"]["message"]
                .as_str()
                .unwrap_or("unknown api error")
                .to_string();
            let err = format!("api error ({status}): {message}");
            return if status.as_u16() == 429 || status.is_server_error() {
                Err(RequestError::Transient(err))
            } else {
                Err(RequestError::Fatal(err))
            };
        }

        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| RequestError::Fatal(format!("no content in response: {payload}")))?
            .to_string();

        let used = payload["usage"]["total_tokens"]
            .as_u64()
            .unwrap_or_else(|| (content.len() / 4) as u64);
        self.tokens.fetch_add(used, Ordering::Relaxed);
        debug!(tokens = used, "oracle call finished");

        Ok(content)
    }
}

enum RequestError {
    Transient(String),
    Fatal(String),
}

#[async_trait]
impl ReasoningOracle for HttpOracle {
    async fn plan(&self, goal: &str, hints: Option<&DomHints>) -> Result<Plan, AgentError> {
        let hints_block = hints.map(DomHints::to_prompt_block).unwrap_or_default();
        let prompt = PLANNER_PROMPT
            .replace("{goal}", goal)
            .replace("{hints}", &hints_block);

        let text = self.chat(&prompt, None).await?;
        let cleaned = strip_fences(&text);
        let plan: Plan = serde_json::from_str(cleaned)
            .map_err(|e| AgentError::Oracle(format!("failed to parse plan: {e}")))?;
        plan.finalize().map_err(AgentError::PlanningFailure)
    }

    async fn validate(
        &self,
        screenshot: &[u8],
        expected: &str,
    ) -> Result<ValidationResult, AgentError> {
        let prompt = VALIDATOR_PROMPT.replace("{expected}", expected);
        let text = self.chat(&prompt, Some(screenshot)).await?;
        Ok(parse_validation(&text))
    }

    async fn read_captcha(
        &self,
        screenshot: &[u8],
        instruction: &str,
    ) -> Result<String, AgentError> {
        let text = self.chat(instruction, Some(screenshot)).await?;
        Ok(text.trim().to_string())
    }

    fn tokens_used(&self) -> u64 {
        self.tokens.load(Ordering::Relaxed)
    }
}

/// Strip markdown code fences the model may wrap around JSON.
fn strip_fences(text: &str) -> &str {
    text.trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

#[derive(Debug, Deserialize)]
struct RawValidation {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    reason: String,
    #[serde(default = "default_confidence")]
    confidence: f32,
    #[serde(default)]
    error_type: Option<String>,
}

fn default_confidence() -> f32 {
    0.5
}

/// Parse the validator's JSON reply; an unparseable reply is a failed
/// validation, not an error worth retrying.
fn parse_validation(text: &str) -> ValidationResult {
    let cleaned = strip_fences(text);
    match serde_json::from_str::<RawValidation>(cleaned) {
        Ok(raw) => {
            let error_kind = match raw.error_type.as_deref() {
                Some("captcha") => ValidationErrorKind::CaptchaDetected,
                Some("error_page") | Some("not_found") => ValidationErrorKind::PageError,
                Some("blocked") => ValidationErrorKind::AccessBlocked,
                Some("timeout") => ValidationErrorKind::Timeout,
                _ => ValidationErrorKind::None,
            };
            if raw.success {
                ValidationResult::ok(raw.reason, raw.confidence)
            } else {
                ValidationResult::failed(raw.reason, raw.confidence, error_kind)
            }
        }
        Err(e) => {
            let preview: String = text.chars().take(100).collect();
            ValidationResult::failed(
                format!("unparseable validation reply ({e}): {preview}"),
                0.0,
                ValidationErrorKind::None,
            )
        }
    }
}
