//! Helpers for pulling JSON out of free-form model output.

/// Try to extract a JSON object from a response that may contain surrounding text.
///
/// Prefers a fenced ```` ```json ```` block, then falls back to the span from
/// the first `{` to the last `}`.
pub fn extract_json_block(text: &str) -> Option<&str> {
    // Look for ```json ... ``` fenced blocks
    if let Some(start) = text.find("```json") {
        let json_start = start + 7;
        if let Some(end) = text[json_start..].find("```") {
            return Some(text[json_start..json_start + end].trim());
        }
    }

    // Look for first { to last }
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end > start {
        Some(&text[start..=end])
    } else {
        None
    }
}

/// Parse the first JSON object found in `text`.
pub fn parse_embedded_object(text: &str) -> Result<serde_json::Value, String> {
    let block = extract_json_block(text).ok_or_else(|| "no JSON object found".to_string())?;
    let value: serde_json::Value =
        serde_json::from_str(block).map_err(|e| format!("invalid JSON: {e}"))?;
    if value.is_object() {
        Ok(value)
    } else {
        Err("JSON value is not an object".to_string())
    }
}
