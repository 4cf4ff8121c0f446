//! Output contracts and lenient parsing of model replies.
//!
//! Models wrap JSON in markdown fences, prepend `<think>` blocks or add a
//! sentence of prose around the payload. [`OutputContract::validate`] peels
//! those layers off before checking the declared shape and required fields.

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How a step's raw reply is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    Text,
}

/// Expected top-level JSON type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputShape {
    Object,
    Array,
    String,
    #[default]
    Any,
}

impl OutputShape {
    fn matches(self, value: &Value) -> bool {
        match self {
            OutputShape::Object => value.is_object(),
            OutputShape::Array => value.is_array(),
            OutputShape::String => value.is_string(),
            OutputShape::Any => true,
        }
    }
}

/// What a step promises to return.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputContract {
    #[serde(alias = "output_format")]
    pub format: OutputFormat,
    #[serde(alias = "type")]
    pub shape: OutputShape,
    /// Keys that must be present when the reply is a JSON object.
    pub required_fields: Vec<String>,
}

impl OutputContract {
    /// Plain text reply.
    pub fn text() -> Self {
        Self {
            format: OutputFormat::Text,
            ..Default::default()
        }
    }

    /// JSON reply of any shape.
    pub fn json() -> Self {
        Self::default()
    }

    /// JSON object reply carrying `fields`.
    pub fn json_object<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            format: OutputFormat::Json,
            shape: OutputShape::Object,
            required_fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn with_shape(mut self, shape: OutputShape) -> Self {
        self.shape = shape;
        self
    }

    /// Parse `raw` and check it against this contract.
    ///
    /// Text replies become a JSON string; JSON replies become the parsed
    /// value.
    pub fn validate(&self, raw: &str) -> Result<Value> {
        let (_, body) = strip_thinking(raw);
        match self.format {
            OutputFormat::Text => {
                let text = body.trim();
                if text.is_empty() {
                    return Err(PipelineError::OutputValidation(
                        "model returned empty text".to_string(),
                    ));
                }
                Ok(Value::String(text.to_string()))
            }
            OutputFormat::Json => {
                let value = parse_json_reply(&body)?;
                self.check(&value)?;
                Ok(value)
            }
        }
    }

    fn check(&self, value: &Value) -> Result<()> {
        if !self.shape.matches(value) {
            return Err(PipelineError::OutputValidation(format!(
                "expected {:?} output, got {}",
                self.shape,
                type_name(value)
            )));
        }
        if self.required_fields.is_empty() {
            return Ok(());
        }
        let Some(object) = value.as_object() else {
            return Err(PipelineError::OutputValidation(format!(
                "required fields {:?} need an object, got {}",
                self.required_fields,
                type_name(value)
            )));
        };
        let missing: Vec<&str> = self
            .required_fields
            .iter()
            .filter(|f| !object.contains_key(f.as_str()))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::OutputValidation(format!(
                "missing required fields in output: {:?}",
                missing
            )))
        }
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Split a `<think>...</think>` block off a reply.
///
/// Returns `(thinking, remainder)`; the remainder is trimmed.
pub fn strip_thinking(text: &str) -> (Option<String>, String) {
    const OPEN: &str = "<think>";
    const CLOSE: &str = "</think>";

    if let Some(start) = text.find(OPEN) {
        if let Some(rel_end) = text[start..].find(CLOSE) {
            let end = start + rel_end;
            let thinking = text[start + OPEN.len()..end].trim();
            let mut rest = String::with_capacity(text.len());
            rest.push_str(&text[..start]);
            rest.push_str(&text[end + CLOSE.len()..]);
            let thinking = (!thinking.is_empty()).then(|| thinking.to_string());
            return (thinking, rest.trim().to_string());
        }
    }
    (None, text.trim().to_string())
}

/// Contents of the first fenced code block, if any.
pub fn fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after = &text[start + 3..];
    // Skip an info string such as `json`.
    let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after[body_start..];
    let end = body.find("```")?;
    Some(body[..end].trim())
}

/// The first balanced `{...}` or `[...]` span in `text`, honouring string
/// literals and escapes.
pub fn balanced_span(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse a JSON reply, tolerating fences and surrounding prose.
pub fn parse_json_reply(text: &str) -> Result<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    let candidates = [fenced_block(trimmed), balanced_span(trimmed)];
    for candidate in candidates.into_iter().flatten() {
        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
            return Ok(value);
        }
        if let Some(inner) = balanced_span(candidate) {
            if let Ok(value) = serde_json::from_str::<Value>(inner) {
                return Ok(value);
            }
        }
    }

    Err(PipelineError::OutputValidation(format!(
        "no valid JSON found in model output: {}",
        preview(trimmed, 200)
    )))
}

/// First `max` characters of `text`, with an ellipsis when truncated.
pub(crate) fn preview(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_json() {
        let v = OutputContract::json().validate(r#"{"people": ["Alice"]}"#).unwrap();
        assert_eq!(v, json!({"people": ["Alice"]}));
    }

    #[test]
    fn test_fenced_json() {
        let raw = "Here you go:\n```json\n{\"a\": 1}\n```\nAnything else?";
        assert_eq!(OutputContract::json().validate(raw).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_json_inside_prose() {
        let raw = r#"Sure! The result is {"text": "a } inside", "n": [1, 2]} as requested."#;
        let v = OutputContract::json().validate(raw).unwrap();
        assert_eq!(v, json!({"text": "a } inside", "n": [1, 2]}));
    }

    #[test]
    fn test_thinking_block_is_stripped() {
        let raw = "<think>let me consider {stuff}</think>\n[1, 2, 3]";
        let contract = OutputContract::json().with_shape(OutputShape::Array);
        assert_eq!(contract.validate(raw).unwrap(), json!([1, 2, 3]));

        let (thinking, rest) = strip_thinking(raw);
        assert_eq!(thinking.as_deref(), Some("let me consider {stuff}"));
        assert_eq!(rest, "[1, 2, 3]");
    }

    #[test]
    fn test_invalid_json_is_validation_error() {
        let err = OutputContract::json().validate("no json here").unwrap_err();
        assert!(matches!(err, PipelineError::OutputValidation(_)));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_required_fields() {
        let contract = OutputContract::json_object(["people", "places"]);
        assert!(contract
            .validate(r#"{"people": [], "places": []}"#)
            .is_ok());

        let err = contract.validate(r#"{"people": []}"#).unwrap_err();
        assert!(err.to_string().contains("places"));
    }

    #[test]
    fn test_shape_mismatch() {
        let contract = OutputContract::json().with_shape(OutputShape::Object);
        let err = contract.validate("[1]").unwrap_err();
        assert!(err.to_string().contains("array"));
    }

    #[test]
    fn test_text_output_trimmed_and_non_empty() {
        let contract = OutputContract::text();
        assert_eq!(
            contract.validate("  Meeting between Alice and Bob.\n").unwrap(),
            json!("Meeting between Alice and Bob.")
        );
        assert!(contract.validate("   ").is_err());
        assert!(contract.validate("<think>hmm</think>").is_err());
    }

    #[test]
    fn test_contract_deserializes_source_keys() {
        let c: OutputContract = serde_json::from_str(
            r#"{"output_format": "json", "type": "object", "required_fields": ["x"]}"#,
        )
        .unwrap();
        assert_eq!(c, OutputContract::json_object(["x"]));
    }

    #[test]
    fn test_preview_respects_char_boundaries() {
        assert_eq!(preview("ééé", 2), "éé...");
        assert_eq!(preview("ab", 5), "ab");
    }
}
