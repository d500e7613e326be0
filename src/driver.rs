use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;

use headless_chrome::protocol::cdp::Page;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::AgentError;
use crate::types::{CaptchaKind, CaptchaProbe, DomElement, DomHints};

/// Everything the executor needs from a live browser. Coordinates are
/// device pixels; callers denormalize before reaching this boundary.
/// Implementations are synchronous and run under spawn_blocking.
pub trait BrowserDriver: Send + Sync {
    fn navigate(&self, url: &str) -> Result<(), AgentError>;
    fn click(&self, x: u32, y: u32) -> Result<(), AgentError>;
    fn double_click(&self, x: u32, y: u32) -> Result<(), AgentError>;
    fn right_click(&self, x: u32, y: u32) -> Result<(), AgentError>;
    fn hover(&self, x: u32, y: u32) -> Result<(), AgentError>;
    fn type_text(&self, text: &str) -> Result<(), AgentError>;
    fn press_key(&self, key: &str) -> Result<(), AgentError>;
    fn scroll(&self, x: u32, y: u32, dx: i32, dy: i32) -> Result<(), AgentError>;
    fn go_back(&self) -> Result<(), AgentError>;
    fn go_forward(&self) -> Result<(), AgentError>;
    fn refresh(&self) -> Result<(), AgentError>;
    fn screenshot(&self) -> Result<Vec<u8>, AgentError>;
    fn page_structure(&self) -> Result<DomHints, AgentError>;
    fn detect_captcha(&self) -> Result<Option<CaptchaProbe>, AgentError>;
    /// Press at the first waypoint, move through the rest, release at the
    /// last. `pause` is slept between waypoints.
    fn drag(&self, path: &[(u32, u32)], pause: Duration) -> Result<(), AgentError>;
    fn current_url(&self) -> Result<String, AgentError>;
    fn viewport(&self) -> (u32, u32);
}

/// Collects interactive elements with viewport-normalized coordinates so
/// the planner can aim without seeing raw pixels.
const STRUCTURE_JS: &str = r#"
(() => {
  const out = [];
  const seen = new Set();
  const tags = ['a','button','input','textarea','select'];
  for (const el of document.querySelectorAll(tags.join(','))) {
    if (out.length >= 40) break;
    const r = el.getBoundingClientRect();
    if (r.width === 0 || r.height === 0) continue;
    if (r.bottom < 0 || r.top > window.innerHeight) continue;
    const s = getComputedStyle(el);
    if (s.display === 'none' || s.visibility === 'hidden') continue;
    const tag = el.tagName.toLowerCase();
    let text = (el.textContent || '').trim().slice(0, 60);
    if (tag === 'input' || tag === 'textarea') {
      text = el.placeholder || el.name || el.type || '';
    }
    const key = tag + '|' + text + '|' + (el.id || '');
    if (seen.has(key)) continue;
    seen.add(key);
    out.push({
      kind: tag,
      text: text,
      id: el.id || '',
      x: Math.round((r.left + r.width / 2) / window.innerWidth * 1000),
      y: Math.round((r.top + r.height / 2) / window.innerHeight * 1000),
    });
  }
  return JSON.stringify(out);
})()
"#;

/// Looks for common challenge widgets and reports the center of the one
/// the cursor should land on.
const CAPTCHA_PROBE_JS: &str = r#"
(() => {
  const center = (el) => {
    const r = el.getBoundingClientRect();
    return [Math.round(r.left + r.width / 2), Math.round(r.top + r.height / 2)];
  };
  const visible = (el) => {
    const r = el.getBoundingClientRect();
    return r.width > 0 && r.height > 0;
  };
  let el = document.querySelector("iframe[src*='recaptcha/api2/bframe']");
  if (el && visible(el)) return JSON.stringify({kind: 'recaptcha_image', anchor: center(el)});
  el = document.querySelector("iframe[src*='recaptcha']");
  if (el && visible(el)) return JSON.stringify({kind: 'recaptcha_checkbox', anchor: center(el)});
  el = document.querySelector("iframe[src*='hcaptcha']");
  if (el && visible(el)) return JSON.stringify({kind: 'hcaptcha', anchor: center(el)});
  for (const sel of ['.slider-btn', '.slide-verify', '#slider', '.geetest_slider_button']) {
    el = document.querySelector(sel);
    if (el && visible(el)) return JSON.stringify({kind: 'slider', anchor: center(el)});
  }
  el = document.querySelector("img[src*='captcha'], img[alt*='captcha' i]");
  if (el && visible(el)) return JSON.stringify({kind: 'image_text', anchor: center(el)});
  return 'null';
})()
"#;

#[derive(Deserialize)]
struct RawProbe {
    kind: String,
    anchor: Option<(u32, u32)>,
}

/// Live Chrome session over the DevTools protocol. Attaches to a running
/// instance on port 9222 when one exists, otherwise launches its own.
pub struct ChromeDriver {
    _browser: Browser,
    tab: Arc<Tab>,
    width: u32,
    height: u32,
}

impl ChromeDriver {
    pub fn launch(width: u32, height: u32) -> Result<Self, AgentError> {
        if let Ok(browser) = Browser::connect("http://127.0.0.1:9222".to_string()) {
            info!("attached to existing chrome on port 9222");
            let tab = {
                let tabs_lock = browser.get_tabs();
                let tabs = tabs_lock.lock().map_err(|_| driver_err("tab list poisoned"))?;
                match tabs.first() {
                    Some(t) => t.clone(),
                    None => browser.new_tab().map_err(to_driver)?,
                }
            };
            return Ok(Self {
                _browser: browser,
                tab,
                width,
                height,
            });
        }

        info!(width, height, "launching chrome");
        let options = LaunchOptions {
            headless: false,
            window_size: Some((width, height)),
            args: vec![
                OsStr::new("--no-first-run"),
                OsStr::new("--no-default-browser-check"),
                OsStr::new("--disable-blink-features=AutomationControlled"),
                OsStr::new("--disable-infobars"),
            ],
            idle_browser_timeout: Duration::from_secs(300),
            ..Default::default()
        };
        let browser = Browser::new(options).map_err(to_driver)?;
        let tab = browser.new_tab().map_err(to_driver)?;
        tab.navigate_to("about:blank").map_err(to_driver)?;

        Ok(Self {
            _browser: browser,
            tab,
            width,
            height,
        })
    }

    fn eval(&self, js: &str) -> Result<Option<serde_json::Value>, AgentError> {
        let result = self.tab.evaluate(js, false).map_err(to_driver)?;
        Ok(result.value)
    }

    /// Dispatch a full mouse-event sequence at device coordinates through
    /// the page itself. Covers event listeners that synthetic CDP input
    /// misses in iframes and canvas UIs.
    fn dispatch_mouse(&self, x: u32, y: u32, events: &[&str]) -> Result<(), AgentError> {
        let sequence = events
            .iter()
            .map(|e| format!("'{e}'"))
            .collect::<Vec<_>>()
            .join(",");
        let js = format!(
            r#"(() => {{
  const el = document.elementFromPoint({x}, {y});
  if (!el) return false;
  for (const type of [{sequence}]) {{
    el.dispatchEvent(new MouseEvent(type, {{
      bubbles: true, cancelable: true, view: window,
      clientX: {x}, clientY: {y}, button: type === 'contextmenu' ? 2 : 0,
    }}));
  }}
  if ([{sequence}].includes('mousedown') && el.focus) el.focus();
  return true;
}})()"#
        );
        let hit = self
            .eval(&js)?
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if !hit {
            return Err(driver_err(format!("no element at ({x}, {y})")));
        }
        Ok(())
    }
}

impl BrowserDriver for ChromeDriver {
    fn navigate(&self, url: &str) -> Result<(), AgentError> {
        debug!(url, "navigate");
        self.tab.navigate_to(url).map_err(to_driver)?;
        self.tab.wait_until_navigated().map_err(to_driver)?;
        Ok(())
    }

    fn click(&self, x: u32, y: u32) -> Result<(), AgentError> {
        self.dispatch_mouse(x, y, &["mousedown", "mouseup", "click"])
    }

    fn double_click(&self, x: u32, y: u32) -> Result<(), AgentError> {
        self.dispatch_mouse(
            x,
            y,
            &["mousedown", "mouseup", "click", "mousedown", "mouseup", "click", "dblclick"],
        )
    }

    fn right_click(&self, x: u32, y: u32) -> Result<(), AgentError> {
        self.dispatch_mouse(x, y, &["mousedown", "mouseup", "contextmenu"])
    }

    fn hover(&self, x: u32, y: u32) -> Result<(), AgentError> {
        self.dispatch_mouse(x, y, &["mouseover", "mouseenter", "mousemove"])
    }

    fn type_text(&self, text: &str) -> Result<(), AgentError> {
        self.tab.type_str(text).map_err(to_driver)?;
        Ok(())
    }

    fn press_key(&self, key: &str) -> Result<(), AgentError> {
        self.tab.press_key(key).map_err(to_driver)?;
        Ok(())
    }

    fn scroll(&self, x: u32, y: u32, dx: i32, dy: i32) -> Result<(), AgentError> {
        // Scroll the scrollable ancestor under the point, falling back to
        // the window.
        let js = format!(
            r#"(() => {{
  let el = document.elementFromPoint({x}, {y});
  while (el && el !== document.body) {{
    const s = getComputedStyle(el);
    if (/(auto|scroll)/.test(s.overflowY) && el.scrollHeight > el.clientHeight) {{
      el.scrollBy({dx}, {dy});
      return true;
    }}
    el = el.parentElement;
  }}
  window.scrollBy({dx}, {dy});
  return true;
}})()"#
        );
        self.eval(&js)?;
        Ok(())
    }

    fn go_back(&self) -> Result<(), AgentError> {
        self.eval("history.back()")?;
        Ok(())
    }

    fn go_forward(&self) -> Result<(), AgentError> {
        self.eval("history.forward()")?;
        Ok(())
    }

    fn refresh(&self) -> Result<(), AgentError> {
        self.eval("location.reload()")?;
        Ok(())
    }

    fn screenshot(&self) -> Result<Vec<u8>, AgentError> {
        self.tab
            .capture_screenshot(Page::CaptureScreenshotFormatOption::Png, None, None, true)
            .map_err(to_driver)
    }

    fn page_structure(&self) -> Result<DomHints, AgentError> {
        let raw = self
            .eval(STRUCTURE_JS)?
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| "[]".to_string());
        let elements: Vec<DomElement> = serde_json::from_str(&raw)
            .map_err(|e| driver_err(format!("bad structure payload: {e}")))?;
        Ok(DomHints { elements })
    }

    fn detect_captcha(&self) -> Result<Option<CaptchaProbe>, AgentError> {
        let raw = self
            .eval(CAPTCHA_PROBE_JS)?
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| "null".to_string());
        let probe: Option<RawProbe> = serde_json::from_str(&raw)
            .map_err(|e| driver_err(format!("bad captcha probe: {e}")))?;
        Ok(probe.map(|p| CaptchaProbe {
            kind: match p.kind.as_str() {
                "recaptcha_image" => CaptchaKind::RecaptchaImage,
                "hcaptcha" => CaptchaKind::Hcaptcha,
                "slider" => CaptchaKind::Slider,
                "image_text" => CaptchaKind::ImageText,
                _ => CaptchaKind::RecaptchaCheckbox,
            },
            anchor: p.anchor,
        }))
    }

    fn drag(&self, path: &[(u32, u32)], pause: Duration) -> Result<(), AgentError> {
        let Some((&(sx, sy), &(ex, ey))) = path.first().zip(path.last()) else {
            return Err(driver_err("empty drag path"));
        };
        self.dispatch_mouse(sx, sy, &["mousedown"])?;
        let midway = if path.len() > 2 {
            &path[1..path.len() - 1]
        } else {
            &[]
        };
        for &(mx, my) in midway {
            let js = format!(
                r#"document.dispatchEvent(new MouseEvent('mousemove', {{
  bubbles: true, clientX: {mx}, clientY: {my}, buttons: 1,
}}))"#
            );
            self.eval(&js)?;
            std::thread::sleep(pause);
        }
        let js = format!(
            r#"(() => {{
  document.dispatchEvent(new MouseEvent('mousemove', {{bubbles: true, clientX: {ex}, clientY: {ey}, buttons: 1}}));
  document.dispatchEvent(new MouseEvent('mouseup', {{bubbles: true, clientX: {ex}, clientY: {ey}}}));
}})()"#
        );
        self.eval(&js)?;
        Ok(())
    }

    fn current_url(&self) -> Result<String, AgentError> {
        Ok(self
            .eval("window.location.href")?
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| "about:blank".to_string()))
    }

    fn viewport(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

fn to_driver(e: anyhow::Error) -> AgentError {
    AgentError::Driver(e.to_string())
}

fn driver_err(msg: impl Into<String>) -> AgentError {
    AgentError::Driver(msg.into())
}
