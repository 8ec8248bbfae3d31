//! Parse-with-fallback for JSON produced by external generators.
//!
//! Generator output is often wrapped in markdown fences, surrounded by prose
//! or written with single quotes. Parsing tries those repairs in turn and,
//! when nothing works, hands back the type's default with the reason.

use serde::de::DeserializeOwned;

#[derive(Debug, Clone, PartialEq)]
pub enum Parsed<T> {
    Value(T),
    Fallback { value: T, reason: String },
}

impl<T> Parsed<T> {
    pub fn into_value(self) -> T {
        match self {
            Parsed::Value(value) | Parsed::Fallback { value, .. } => value,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Parsed::Fallback { .. })
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Parsed::Value(_) => None,
            Parsed::Fallback { reason, .. } => Some(reason),
        }
    }
}

/// Body of the first ``` fenced block, or the input trimmed.
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(open) = trimmed.find("```") else {
        return trimmed;
    };
    let after_open = &trimmed[open + 3..];
    // skip the info string (e.g. `json`)
    let body_start = after_open.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after_open[body_start..];
    match body.find("```") {
        Some(close) => body[..close].trim(),
        None => body.trim(),
    }
}

/// Outermost `{...}` or `[...]` span in text with surrounding prose.
fn outermost_json(raw: &str) -> Option<&str> {
    let start = raw.find(['{', '['])?;
    let closer = if raw[start..].starts_with('{') { '}' } else { ']' };
    let end = raw.rfind(closer)?;
    (end > start).then(|| &raw[start..=end])
}

pub fn parse_json_or_default<T: DeserializeOwned + Default>(raw: &str) -> Parsed<T> {
    if raw.trim().is_empty() {
        return Parsed::Fallback {
            value: T::default(),
            reason: "empty input".to_string(),
        };
    }

    let body = strip_code_fences(raw);
    let first_error = match serde_json::from_str::<T>(body) {
        Ok(value) => return Parsed::Value(value),
        Err(e) => e.to_string(),
    };

    let mut candidates = Vec::new();
    if let Some(span) = outermost_json(body) {
        candidates.push(span.to_string());
    }
    candidates.push(body.replace('\'', "\""));

    for candidate in candidates {
        if let Ok(value) = serde_json::from_str::<T>(&candidate) {
            return Parsed::Value(value);
        }
    }

    Parsed::Fallback {
        value: T::default(),
        reason: format!("not valid JSON: {}", first_error),
    }
}
