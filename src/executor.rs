use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::driver::BrowserDriver;
use crate::error::AgentError;
use crate::stop::EmergencyStop;
use crate::types::{ActionKind, NORMALIZED_RANGE};

/// Translates planned actions into driver calls. Owns the coordinate
/// denormalization from the planner's 0-1000 space to device pixels.
pub struct StepExecutor {
    driver: Arc<dyn BrowserDriver>,
    stop: EmergencyStop,
    width: u32,
    height: u32,
}

impl StepExecutor {
    pub fn new(driver: Arc<dyn BrowserDriver>, stop: EmergencyStop) -> Self {
        let (width, height) = driver.viewport();
        Self {
            driver,
            stop,
            width,
            height,
        }
    }

    pub fn denormalize(&self, nx: u32, ny: u32) -> (u32, u32) {
        (scale(nx, self.width), scale(ny, self.height))
    }

    /// Run one action to completion. Blocking; the loop wraps this in
    /// spawn_blocking. Waits are sliced so a stop request lands within a
    /// second.
    pub fn execute(&self, action: &ActionKind) -> Result<(), AgentError> {
        self.stop.check()?;
        debug!(action = action.name(), "executing");
        match action {
            ActionKind::Navigate { url } => self.driver.navigate(url),
            ActionKind::Click { x, y } => {
                let (px, py) = self.denormalize(*x, *y);
                self.driver.click(px, py)
            }
            ActionKind::DoubleClick { x, y } => {
                let (px, py) = self.denormalize(*x, *y);
                self.driver.double_click(px, py)
            }
            ActionKind::RightClick { x, y } => {
                let (px, py) = self.denormalize(*x, *y);
                self.driver.right_click(px, py)
            }
            ActionKind::Hover { x, y } => {
                let (px, py) = self.denormalize(*x, *y);
                self.driver.hover(px, py)
            }
            ActionKind::TypeText { text } => self.driver.type_text(text),
            ActionKind::TypeTextAt {
                x,
                y,
                text,
                press_enter,
            } => {
                let (px, py) = self.denormalize(*x, *y);
                self.driver.click(px, py)?;
                self.stop.blocking_sleep(Duration::from_millis(200))?;
                self.driver.type_text(text)?;
                if *press_enter {
                    self.driver.press_key("Enter")?;
                }
                Ok(())
            }
            ActionKind::PressKey { key } => self.driver.press_key(&normalize_key(key)),
            ActionKind::Scroll { x, y, dx, dy } => {
                let (px, py) = self.denormalize(*x, *y);
                self.driver.scroll(px, py, *dx, *dy)
            }
            ActionKind::GoBack => self.driver.go_back(),
            ActionKind::GoForward => self.driver.go_forward(),
            ActionKind::Refresh => self.driver.refresh(),
            ActionKind::Wait { seconds } => {
                let clamped = seconds.clamp(0.0, 30.0);
                self.stop
                    .blocking_sleep(Duration::from_millis((clamped * 1000.0) as u64))
            }
            // Routed to the captcha resolver before execution reaches here.
            ActionKind::SolveCaptcha => Ok(()),
        }
    }
}

fn scale(n: u32, dim: u32) -> u32 {
    let n = n.min(NORMALIZED_RANGE);
    ((n as u64 * dim as u64) / NORMALIZED_RANGE as u64) as u32
}

/// Map loose planner key names onto DOM key values.
fn normalize_key(key: &str) -> String {
    match key.to_ascii_lowercase().as_str() {
        "enter" | "return" => "Enter".to_string(),
        "tab" => "Tab".to_string(),
        "esc" | "escape" => "Escape".to_string(),
        "space" | "spacebar" => " ".to_string(),
        "backspace" => "Backspace".to_string(),
        "delete" | "del" => "Delete".to_string(),
        "up" | "arrowup" => "ArrowUp".to_string(),
        "down" | "arrowdown" => "ArrowDown".to_string(),
        "left" | "arrowleft" => "ArrowLeft".to_string(),
        "right" | "arrowright" => "ArrowRight".to_string(),
        "pageup" => "PageUp".to_string(),
        "pagedown" => "PageDown".to_string(),
        "home" => "Home".to_string(),
        "end" => "End".to_string(),
        _ => key.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use crate::types::{CaptchaProbe, DomHints};

    #[derive(Default)]
    struct RecordingDriver {
        calls: Mutex<Vec<String>>,
    }

    impl BrowserDriver for RecordingDriver {
        fn navigate(&self, url: &str) -> Result<(), AgentError> {
            self.calls.lock().unwrap().push(format!("navigate {url}"));
            Ok(())
        }
        fn click(&self, x: u32, y: u32) -> Result<(), AgentError> {
            self.calls.lock().unwrap().push(format!("click {x},{y}"));
            Ok(())
        }
        fn double_click(&self, x: u32, y: u32) -> Result<(), AgentError> {
            self.calls.lock().unwrap().push(format!("dblclick {x},{y}"));
            Ok(())
        }
        fn right_click(&self, _x: u32, _y: u32) -> Result<(), AgentError> {
            Ok(())
        }
        fn hover(&self, _x: u32, _y: u32) -> Result<(), AgentError> {
            Ok(())
        }
        fn type_text(&self, text: &str) -> Result<(), AgentError> {
            self.calls.lock().unwrap().push(format!("type {text}"));
            Ok(())
        }
        fn press_key(&self, key: &str) -> Result<(), AgentError> {
            self.calls.lock().unwrap().push(format!("key {key}"));
            Ok(())
        }
        fn scroll(&self, _x: u32, _y: u32, dx: i32, dy: i32) -> Result<(), AgentError> {
            self.calls.lock().unwrap().push(format!("scroll {dx},{dy}"));
            Ok(())
        }
        fn go_back(&self) -> Result<(), AgentError> {
            Ok(())
        }
        fn go_forward(&self) -> Result<(), AgentError> {
            Ok(())
        }
        fn refresh(&self) -> Result<(), AgentError> {
            Ok(())
        }
        fn screenshot(&self) -> Result<Vec<u8>, AgentError> {
            Ok(vec![])
        }
        fn page_structure(&self) -> Result<DomHints, AgentError> {
            Ok(DomHints::default())
        }
        fn detect_captcha(&self) -> Result<Option<CaptchaProbe>, AgentError> {
            Ok(None)
        }
        fn drag(&self, _path: &[(u32, u32)], _pause: Duration) -> Result<(), AgentError> {
            Ok(())
        }
        fn current_url(&self) -> Result<String, AgentError> {
            Ok("about:blank".to_string())
        }
        fn viewport(&self) -> (u32, u32) {
            (1440, 900)
        }
    }

    fn executor() -> (StepExecutor, Arc<RecordingDriver>) {
        let driver = Arc::new(RecordingDriver::default());
        let exec = StepExecutor::new(driver.clone(), EmergencyStop::default());
        (exec, driver)
    }

    #[test]
    fn denormalize_scales_to_viewport() {
        let (exec, _) = executor();
        assert_eq!(exec.denormalize(0, 0), (0, 0));
        assert_eq!(exec.denormalize(500, 500), (720, 450));
        assert_eq!(exec.denormalize(1000, 1000), (1440, 900));
        // out-of-range input clamps to the viewport edge
        assert_eq!(exec.denormalize(1500, 2000), (1440, 900));
    }

    #[test]
    fn click_lands_at_device_pixels() {
        let (exec, driver) = executor();
        exec.execute(&ActionKind::Click { x: 500, y: 100 }).unwrap();
        assert_eq!(driver.calls.lock().unwrap().as_slice(), ["click 720,90"]);
    }

    #[test]
    fn type_text_at_clicks_then_types_then_enters() {
        let (exec, driver) = executor();
        exec.execute(&ActionKind::TypeTextAt {
            x: 250,
            y: 250,
            text: "rust".to_string(),
            press_enter: true,
        })
        .unwrap();
        let calls = driver.calls.lock().unwrap();
        assert_eq!(calls.as_slice(), ["click 360,225", "type rust", "key Enter"]);
    }

    #[test]
    fn key_names_are_normalized() {
        let (exec, driver) = executor();
        exec.execute(&ActionKind::PressKey {
            key: "esc".to_string(),
        })
        .unwrap();
        exec.execute(&ActionKind::PressKey {
            key: "F5".to_string(),
        })
        .unwrap();
        let calls = driver.calls.lock().unwrap();
        assert_eq!(calls.as_slice(), ["key Escape", "key F5"]);
    }

    #[test]
    fn stopped_executor_refuses_to_run() {
        let (exec, driver) = executor();
        exec.stop.trigger();
        let err = exec
            .execute(&ActionKind::Navigate {
                url: "https://example.com".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, AgentError::CancellationRequested));
        assert!(driver.calls.lock().unwrap().is_empty());
    }
}
