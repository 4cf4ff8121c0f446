//! Prompt template interpolation.
//!
//! Templates reference variables with `{name}` where `name` matches
//! `[A-Za-z_][A-Za-z0-9_]*`. Use `{{` to insert a literal `{` and `}}` to
//! insert a literal `}`. Any other brace usage is a syntax error.
//!
//! Rendering is a single pass over the parsed template, so substituted
//! values are inserted as literal data and never scanned for placeholders.

use crate::error::InterpolationError;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Variable map used for rendering: `input` plus recorded step outputs.
pub type Variables = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment<'a> {
    Literal(&'a str),
    Brace(char),
    Var(&'a str),
}

/// Returns `true` if `name` is a legal placeholder name.
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse(template: &str) -> Result<Vec<Segment<'_>>, InterpolationError> {
    let bytes = template.as_bytes();
    let mut segments = Vec::new();
    let mut literal_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'{' if bytes.get(i + 1) == Some(&b'{') => {
                push_literal(&mut segments, &template[literal_start..i]);
                segments.push(Segment::Brace('{'));
                i += 2;
                literal_start = i;
            }
            b'}' if bytes.get(i + 1) == Some(&b'}') => {
                push_literal(&mut segments, &template[literal_start..i]);
                segments.push(Segment::Brace('}'));
                i += 2;
                literal_start = i;
            }
            b'{' => {
                push_literal(&mut segments, &template[literal_start..i]);
                let open = i;
                let close = template[open + 1..]
                    .find(['{', '}'])
                    .map(|offset| open + 1 + offset);
                let close = match close {
                    Some(idx) if bytes[idx] == b'}' => idx,
                    _ => {
                        return Err(InterpolationError::Syntax {
                            position: open,
                            message: "unclosed '{'".to_string(),
                        })
                    }
                };
                let name = &template[open + 1..close];
                if !is_valid_name(name) {
                    return Err(InterpolationError::Syntax {
                        position: open,
                        message: format!("'{{{}}}' is not a valid placeholder", name),
                    });
                }
                segments.push(Segment::Var(name));
                i = close + 1;
                literal_start = i;
            }
            b'}' => {
                return Err(InterpolationError::Syntax {
                    position: i,
                    message: "unmatched '}'".to_string(),
                })
            }
            _ => i += 1,
        }
    }
    push_literal(&mut segments, &template[literal_start..]);
    Ok(segments)
}

fn push_literal<'a>(segments: &mut Vec<Segment<'a>>, text: &'a str) {
    if !text.is_empty() {
        segments.push(Segment::Literal(text));
    }
}

/// Check template syntax without rendering.
pub fn validate_template(template: &str) -> Result<(), InterpolationError> {
    parse(template).map(|_| ())
}

/// Extract the de-duplicated set of variable names a template references.
///
/// # Example
///
/// ```
/// use llm_profile_engine::interpolate::extract_variables;
///
/// let vars = extract_variables("{input} and {extract}, again {input}").unwrap();
/// assert_eq!(vars.into_iter().collect::<Vec<_>>(), vec!["extract", "input"]);
/// ```
pub fn extract_variables(template: &str) -> Result<BTreeSet<String>, InterpolationError> {
    Ok(parse(template)?
        .into_iter()
        .filter_map(|seg| match seg {
            Segment::Var(name) => Some(name.to_string()),
            _ => None,
        })
        .collect())
}

/// Convert a variable value into the text inserted into a prompt.
///
/// Strings are inserted verbatim, `null` becomes empty text, and arrays or
/// objects are pretty-printed as JSON.
pub fn value_to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(_) | Value::Number(_) => value.to_string(),
        Value::Array(_) | Value::Object(_) => {
            serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
        }
    }
}

/// Render a template.
///
/// In strict mode every referenced variable must be present in `variables`,
/// otherwise [`InterpolationError::MissingVariables`] is returned and no
/// partial output is produced. Non-strict mode leaves unresolved
/// placeholders verbatim and is meant for previews and diagnostics only.
///
/// # Example
///
/// ```
/// use llm_profile_engine::interpolate::{render, Variables};
/// use serde_json::json;
///
/// let mut vars = Variables::new();
/// vars.insert("input".into(), json!("Alice met Bob."));
/// let out = render("Text: {input} JSON: {{\"k\": 1}}", &vars, true).unwrap();
/// assert_eq!(out, r#"Text: Alice met Bob. JSON: {"k": 1}"#);
/// ```
pub fn render(
    template: &str,
    variables: &Variables,
    strict: bool,
) -> Result<String, InterpolationError> {
    let segments = parse(template)?;

    if strict {
        let missing: BTreeSet<&str> = segments
            .iter()
            .filter_map(|seg| match seg {
                Segment::Var(name) if !variables.contains_key(*name) => Some(*name),
                _ => None,
            })
            .collect();
        if !missing.is_empty() {
            return Err(InterpolationError::MissingVariables(
                missing.into_iter().map(str::to_string).collect(),
            ));
        }
    }

    let mut out = String::with_capacity(template.len());
    for seg in segments {
        match seg {
            Segment::Literal(text) => out.push_str(text),
            Segment::Brace(c) => out.push(c),
            Segment::Var(name) => match variables.get(name) {
                Some(value) => out.push_str(&value_to_text(value)),
                None => {
                    out.push('{');
                    out.push_str(name);
                    out.push('}');
                }
            },
        }
    }
    Ok(out)
}
