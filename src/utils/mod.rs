use anyhow::{Context, Result};
use std::path::Path;

/// Create a directory (and its parents) if it does not exist yet
pub fn ensure_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory: {}", path.display()))?;
    }
    Ok(())
}

/// Current time as unix seconds
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Current time as an RFC3339 string, the format used for `created_at` columns
pub fn rfc3339_now() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
