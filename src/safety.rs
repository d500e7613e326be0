use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;
use uuid::Uuid;

use crate::config::AgentConfig;
use crate::types::Step;

/// Domains no automated action may touch: payment processors, banking,
/// account deletion, crypto exchanges.
pub const BLOCKED_DOMAINS: &[&str] = &[
    "paypal.com",
    "stripe.com",
    "checkout.stripe.com",
    "razorpay.com",
    "paytm.com",
    "*bank*",
    "*banking*",
    "chase.com",
    "wellsfargo.com",
    "binance.com",
    "coinbase.com",
    "kraken.com",
];

/// Action text that blocks regardless of domain.
pub const BLOCKED_KEYWORDS: &[&str] = &[
    // payment
    "pay now",
    "make payment",
    "checkout",
    "place order",
    "confirm purchase",
    "buy now",
    "enter card",
    "credit card",
    "debit card",
    "cvv",
    // destructive
    "delete account",
    "delete all",
    "remove permanently",
    "cancel subscription",
    "factory reset",
    "format drive",
    // credentials
    "enter password",
    "change password",
    "reset password",
    "enter otp",
    "enter pin",
    "social security",
    // financial
    "transfer money",
    "send money",
    "withdraw",
    "bitcoin",
    "wallet address",
];

/// Whole-URL patterns caught even when the host itself is clean.
pub const BLOCKED_URL_PATTERNS: &[&str] = &[
    "*checkout*",
    "*/payment*",
    "*cart/checkout*",
    "*order/confirm*",
    "*delete*account*",
    "*close*account*",
];

/// Softer heuristic: matching text does not block but forces a per-step
/// confirmation and leaves an audit entry.
const SENSITIVE_WORDS: &[&str] = &[
    "pay", "bank", "checkout", "delete", "password", "sign in", "log in", "subscribe",
];

/// Category of a recorded violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    BlockedDomain,
    BlockedKeyword,
    BlockedUrl,
    ScopeExceeded,
    LimitExceeded,
    HighRisk,
}

/// Append-only audit record. Never mutated or deleted once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Violation {
    pub timestamp: DateTime<Utc>,
    pub run_id: Uuid,
    pub kind: ViolationKind,
    pub action: String,
    pub detail: String,
    pub blocked: bool,
}

/// Shared violation sink: an in-memory list plus an optional JSONL file.
/// File appends go through a mutex so concurrent runs interleave whole
/// records, never partial lines.
#[derive(Debug)]
pub struct ViolationLog {
    entries: Mutex<Vec<Violation>>,
    file: Mutex<Option<File>>,
}

impl ViolationLog {
    pub fn open(path: Option<&Path>) -> std::io::Result<Self> {
        let file = match path {
            Some(p) => {
                if let Some(parent) = p.parent().filter(|d| !d.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                Some(OpenOptions::new().create(true).append(true).open(p)?)
            }
            None => None,
        };
        Ok(Self {
            entries: Mutex::new(Vec::new()),
            file: Mutex::new(file),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            file: Mutex::new(None),
        }
    }

    pub fn append(&self, violation: Violation) {
        if let Ok(mut file) = self.file.lock()
            && let Some(f) = file.as_mut()
        {
            match serde_json::to_string(&violation) {
                Ok(line) => {
                    if let Err(e) = writeln!(f, "{line}") {
                        warn!(error = %e, "failed to persist violation record");
                    }
                }
                Err(e) => warn!(error = %e, "failed to serialize violation record"),
            }
        }
        self.entries
            .lock()
            .expect("violation log poisoned")
            .push(violation);
    }

    pub fn entries(&self) -> Vec<Violation> {
        self.entries.lock().expect("violation log poisoned").clone()
    }

    pub fn blocked_count_for(&self, run_id: Uuid) -> usize {
        self.entries
            .lock()
            .expect("violation log poisoned")
            .iter()
            .filter(|v| v.run_id == run_id && v.blocked)
            .count()
    }
}

/// Static rule set and mutable counters for one run.
#[derive(Debug, Clone)]
pub struct SessionScope {
    pub allowed_domains: Vec<String>,
    pub blocked_domains: Vec<String>,
    pub blocked_keywords: Vec<String>,
    pub blocked_url_patterns: Vec<String>,
    pub max_actions: u32,
    pub max_tokens: u64,
    pub deadline: Instant,
    pub actions_used: u32,
    pub tokens_used: u64,
}

impl SessionScope {
    /// Merge the built-in rule sets with user configuration and start the
    /// deadline clock.
    pub fn from_config(config: &AgentConfig) -> Self {
        let mut blocked_domains: Vec<String> =
            BLOCKED_DOMAINS.iter().map(|s| s.to_string()).collect();
        blocked_domains.extend(config.blocked_domains.iter().map(|s| s.to_lowercase()));

        let mut blocked_keywords: Vec<String> =
            BLOCKED_KEYWORDS.iter().map(|s| s.to_string()).collect();
        blocked_keywords.extend(config.blocked_keywords.iter().map(|s| s.to_lowercase()));

        Self {
            allowed_domains: config
                .allowed_domains
                .iter()
                .map(|s| s.to_lowercase())
                .collect(),
            blocked_domains,
            blocked_keywords,
            blocked_url_patterns: BLOCKED_URL_PATTERNS.iter().map(|s| s.to_string()).collect(),
            max_actions: config.max_actions,
            max_tokens: config.max_tokens,
            deadline: Instant::now() + config.timeout,
            actions_used: 0,
            tokens_used: 0,
        }
    }
}

/// Allow/Block decision for one proposed step.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Allow,
    Block {
        kind: ViolationKind,
        reason: String,
        /// Terminal blocks (quota, deadline) abort the run as resource
        /// exhaustion rather than a step-level safety violation.
        terminal: bool,
    },
}

impl Verdict {
    pub fn is_allow(&self) -> bool {
        matches!(self, Verdict::Allow)
    }
}

/// Pure rule evaluator plus the run's quota bookkeeping. Every Block
/// records a `blocked=true` violation; `actions_used` moves only on Allow,
/// so a blocked plan cannot burn the budget.
pub struct SafetyPolicy {
    scope: SessionScope,
    run_id: Uuid,
    log: std::sync::Arc<ViolationLog>,
    violations_blocked: usize,
}

impl SafetyPolicy {
    pub fn new(scope: SessionScope, run_id: Uuid, log: std::sync::Arc<ViolationLog>) -> Self {
        Self {
            scope,
            run_id,
            log,
            violations_blocked: 0,
        }
    }

    pub fn actions_used(&self) -> u32 {
        self.scope.actions_used
    }

    pub fn tokens_used(&self) -> u64 {
        self.scope.tokens_used
    }

    pub fn violations_blocked(&self) -> usize {
        self.violations_blocked
    }

    /// Record the cumulative token usage reported by the oracle client.
    pub fn sync_tokens(&mut self, total: u64) {
        self.scope.tokens_used = self.scope.tokens_used.max(total);
    }

    /// Evaluate one step. Allow consumes one action from the budget.
    pub fn evaluate(&mut self, step: &Step) -> Verdict {
        let action_desc = format!("{} {}", step.action.name(), step.description);

        if let Some(url) = step_url(step) {
            if let Some((kind, reason)) = self.url_block(&url) {
                return self.block(kind, &action_desc, reason, false);
            }
            if let Some(reason) = self.scope_block(&url) {
                return self.block(ViolationKind::ScopeExceeded, &action_desc, reason, false);
            }
        }

        let hay = step.haystack();
        for keyword in &self.scope.blocked_keywords {
            if hay.contains(keyword.as_str()) {
                let reason = format!("action contains blocked keyword: {keyword}");
                return self.block(ViolationKind::BlockedKeyword, &action_desc, reason, false);
            }
        }

        if let Some(reason) = self.limit_block() {
            return self.block(ViolationKind::LimitExceeded, &action_desc, reason, true);
        }

        self.scope.actions_used += 1;
        Verdict::Allow
    }

    /// Return one unused action to the budget after a human gate skip.
    pub fn refund_action(&mut self) {
        self.scope.actions_used = self.scope.actions_used.saturating_sub(1);
    }

    /// Soft heuristic: the step text brushes a sensitive area without hard
    /// blocking. Forces per-step confirmation even in run-all mode and
    /// leaves a non-blocking audit entry.
    pub fn requires_confirmation(&mut self, step: &Step) -> bool {
        let hay = step.haystack();
        for word in SENSITIVE_WORDS {
            if hay.contains(word) {
                self.log.append(Violation {
                    timestamp: Utc::now(),
                    run_id: self.run_id,
                    kind: ViolationKind::HighRisk,
                    action: format!("{} {}", step.action.name(), step.description),
                    detail: format!("sensitive term \"{word}\" flagged for confirmation"),
                    blocked: false,
                });
                return true;
            }
        }
        false
    }

    fn url_block(&self, url: &str) -> Option<(ViolationKind, String)> {
        let url_lower = url.to_lowercase();
        let host = normalize_host(&url_lower)?;

        for pattern in &self.scope.blocked_domains {
            if domain_match(&host, pattern) {
                return Some((
                    ViolationKind::BlockedDomain,
                    format!("host {host} matches blocked pattern: {pattern}"),
                ));
            }
        }
        for pattern in &self.scope.blocked_url_patterns {
            if wildcard_match(&url_lower, pattern) {
                return Some((
                    ViolationKind::BlockedUrl,
                    format!("url matches blocked pattern: {pattern}"),
                ));
            }
        }
        None
    }

    fn scope_block(&self, url: &str) -> Option<String> {
        if self.scope.allowed_domains.is_empty() {
            return None;
        }
        let host = normalize_host(&url.to_lowercase())?;
        let allowed = self
            .scope
            .allowed_domains
            .iter()
            .any(|d| domain_match(&host, d));
        if allowed {
            None
        } else {
            // Absence from a non-empty allowlist is a block, not an
            // allow-by-default.
            Some(format!(
                "host {host} not in allowed scope {:?}",
                self.scope.allowed_domains
            ))
        }
    }

    fn limit_block(&self) -> Option<String> {
        if self.scope.actions_used >= self.scope.max_actions {
            return Some(format!(
                "max actions exceeded: {}/{}",
                self.scope.actions_used, self.scope.max_actions
            ));
        }
        if self.scope.tokens_used >= self.scope.max_tokens {
            return Some(format!(
                "max tokens exceeded: {}/{}",
                self.scope.tokens_used, self.scope.max_tokens
            ));
        }
        if Instant::now() >= self.scope.deadline {
            return Some("session deadline exceeded".to_string());
        }
        None
    }

    fn block(
        &mut self,
        kind: ViolationKind,
        action: &str,
        reason: String,
        terminal: bool,
    ) -> Verdict {
        warn!(kind = ?kind, action, %reason, "safety policy blocked action");
        self.violations_blocked += 1;
        self.log.append(Violation {
            timestamp: Utc::now(),
            run_id: self.run_id,
            kind,
            action: action.to_string(),
            detail: reason.clone(),
            blocked: true,
        });
        Verdict::Block {
            kind,
            reason,
            terminal,
        }
    }
}

/// URL a step would act on: an explicit navigation target, or a target /
/// value / typed text that itself looks like a URL.
fn step_url(step: &Step) -> Option<String> {
    if let Some(url) = step.action.target_url() {
        return Some(url.to_string());
    }
    [
        step.target.as_deref(),
        step.value.as_deref(),
        step.action.typed_text(),
    ]
    .into_iter()
    .flatten()
    .find(|s| s.contains("://"))
    .map(|s| s.to_string())
}

/// Host with scheme, port and a leading `www.` stripped. Bare hosts
/// (no scheme) are accepted too.
fn normalize_host(url: &str) -> Option<String> {
    let host = match Url::parse(url) {
        Ok(parsed) => parsed.host_str()?.to_string(),
        Err(_) => {
            // Not an absolute URL; treat the leading authority-ish chunk
            // as a host if it looks like one.
            let candidate = url.split(['/', '?', '#']).next()?;
            if candidate.is_empty() || !candidate.contains('.') {
                return None;
            }
            candidate.split(':').next()?.to_string()
        }
    };
    Some(host.strip_prefix("www.").unwrap_or(&host).to_string())
}

/// Domain rule match: a plain pattern matches the host exactly or as a
/// parent domain; a `*` pattern matches by wildcard.
fn domain_match(host: &str, pattern: &str) -> bool {
    if pattern.contains('*') {
        return wildcard_match(host, pattern);
    }
    host == pattern || host.ends_with(&format!(".{pattern}"))
}

/// Minimal `*`-wildcard matcher: literal segments must appear in order,
/// anchored at the ends unless the pattern starts/ends with `*`.
fn wildcard_match(text: &str, pattern: &str) -> bool {
    if !pattern.contains('*') {
        return text == pattern;
    }
    let parts: Vec<&str> = pattern.split('*').filter(|p| !p.is_empty()).collect();
    if parts.is_empty() {
        return true;
    }
    let anchored_start = !pattern.starts_with('*');
    let anchored_end = !pattern.ends_with('*');

    let mut pos = 0usize;
    for (i, part) in parts.iter().enumerate() {
        match text[pos..].find(part) {
            Some(idx) => {
                if i == 0 && anchored_start && idx != 0 {
                    return false;
                }
                pos += idx + part.len();
            }
            None => return false,
        }
    }
    !anchored_end || text.ends_with(parts[parts.len() - 1])
}
