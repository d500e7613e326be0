use std::path::{Path, PathBuf};

use chrono::Local;
use serde_json::json;
use tracing::info;

use crate::error::AgentError;
use crate::types::ValidationErrorKind;

/// Write a failure artifact pair: the screenshot that failed validation
/// and a JSON sidecar describing why. Returns the screenshot path.
pub fn save_failure(
    dir: &Path,
    step_index: usize,
    error_kind: ValidationErrorKind,
    reason: &str,
    url: &str,
    screenshot: &[u8],
) -> Result<PathBuf, AgentError> {
    std::fs::create_dir_all(dir)?;
    let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
    let base = format!("error_{stamp}_step{step_index}");

    let image_path = dir.join(format!("{base}.png"));
    std::fs::write(&image_path, screenshot)?;

    let meta = json!({
        "step": step_index,
        "error_kind": error_kind,
        "reason": reason,
        "url": url,
        "captured_at": Local::now().to_rfc3339(),
    });
    let meta_path = dir.join(format!("{base}.json"));
    let body = serde_json::to_vec_pretty(&meta).map_err(std::io::Error::other)?;
    std::fs::write(&meta_path, body)?;

    info!(path = %image_path.display(), "saved failure diagnostics");
    Ok(image_path)
}
