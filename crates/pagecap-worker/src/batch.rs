//! URL list files.
//!
//! One URL per line. Blank lines and lines starting with `#` are ignored.

use std::path::Path;

use pagecap_models::validate_page_url;

use crate::error::{RecorderError, RecorderResult};

/// Parse a URL list, rejecting the whole list on the first invalid entry.
pub fn parse_url_list(content: &str) -> RecorderResult<Vec<String>> {
    let mut urls = Vec::new();

    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        validate_page_url(line).map_err(|e| {
            RecorderError::config_error(format!("line {}: {} ({})", line_no + 1, e, line))
        })?;
        urls.push(line.to_string());
    }

    if urls.is_empty() {
        return Err(RecorderError::config_error("URL list contains no URLs"));
    }
    Ok(urls)
}

pub async fn load_url_list(path: &Path) -> RecorderResult<Vec<String>> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        RecorderError::config_error(format!("cannot read URL list {}: {}", path.display(), e))
    })?;
    parse_url_list(&content)
}
