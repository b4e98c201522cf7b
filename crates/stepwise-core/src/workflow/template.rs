//! `{{ path }}` template resolution against a JSON context.
//!
//! Resolution is total: an unknown path renders as an empty string and is
//! reported in `missing_paths`, so callers can record partial-resolution
//! diagnostics without failing. A string consisting of exactly one
//! placeholder resolves to the raw JSON value (so `"{{ input.count }}"` stays
//! a number); anything else is string interpolation.

use serde_json::Value;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Structural problems found by [`validate_template`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("unterminated placeholder starting at byte {0}")]
    Unterminated(usize),

    #[error("empty placeholder at byte {0}")]
    EmptyPath(usize),
}

// ---------------------------------------------------------------------------
// Result type
// ---------------------------------------------------------------------------

/// A resolved value plus the placeholder paths that had no value.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved<T> {
    pub value: T,
    /// Unique, in first-seen order.
    pub missing_paths: Vec<String>,
}

impl<T> Resolved<T> {
    fn new(value: T, missing_paths: Vec<String>) -> Self {
        Self {
            value,
            missing_paths,
        }
    }
}

// ---------------------------------------------------------------------------
// Scanning
// ---------------------------------------------------------------------------

enum Segment<'a> {
    Text(&'a str),
    Placeholder(&'a str),
}

/// Split a template into literal text and placeholder paths.
///
/// An opening `{{` without a closing `}}` is kept as literal text.
fn segments(template: &str) -> Vec<Segment<'_>> {
    let mut out = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        let after_open = &rest[open + 2..];
        let Some(close) = after_open.find("}}") else {
            break;
        };
        if open > 0 {
            out.push(Segment::Text(&rest[..open]));
        }
        out.push(Segment::Placeholder(after_open[..close].trim()));
        rest = &after_open[close + 2..];
    }
    if !rest.is_empty() {
        out.push(Segment::Text(rest));
    }
    out
}

/// Check that every `{{` is closed and names a path.
pub fn validate_template(template: &str) -> Result<(), TemplateError> {
    let mut offset = 0;
    let mut rest = template;
    while let Some(open) = rest.find("{{") {
        let start = offset + open;
        let after_open = &rest[open + 2..];
        let close = after_open
            .find("}}")
            .ok_or(TemplateError::Unterminated(start))?;
        if after_open[..close].trim().is_empty() {
            return Err(TemplateError::EmptyPath(start));
        }
        let consumed = open + 2 + close + 2;
        offset += consumed;
        rest = &rest[consumed..];
    }
    Ok(())
}

/// Whether the string contains at least one placeholder.
pub fn has_placeholders(template: &str) -> bool {
    segments(template)
        .iter()
        .any(|s| matches!(s, Segment::Placeholder(_)))
}

// ---------------------------------------------------------------------------
// Lookup
// ---------------------------------------------------------------------------

/// Walk a dotted path (`nodes.fetch.items.0.title`) through objects and arrays.
pub fn lookup_path<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }
    path.split('.').try_fold(context, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Render a JSON value for interpolation: strings raw, null empty, others as JSON.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn push_missing(missing: &mut Vec<String>, path: &str) {
    if !missing.iter().any(|p| p == path) {
        missing.push(path.to_string());
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Resolve a template string.
///
/// Returns the raw value when the whole (trimmed) string is one placeholder,
/// a string otherwise.
pub fn resolve_template_string(template: &str, context: &Value) -> Resolved<Value> {
    let mut missing = Vec::new();
    let parts = segments(template.trim());

    if let [Segment::Placeholder(path)] = parts.as_slice() {
        let value = match lookup_path(context, path) {
            Some(v) => v.clone(),
            None => {
                push_missing(&mut missing, path);
                Value::String(String::new())
            }
        };
        return Resolved::new(value, missing);
    }

    if !has_placeholders(template) {
        return Resolved::new(Value::String(template.to_string()), missing);
    }

    let mut rendered = String::with_capacity(template.len());
    for segment in segments(template) {
        match segment {
            Segment::Text(text) => rendered.push_str(text),
            Segment::Placeholder(path) => match lookup_path(context, path) {
                Some(v) => rendered.push_str(&value_to_string(v)),
                None => push_missing(&mut missing, path),
            },
        }
    }
    Resolved::new(Value::String(rendered), missing)
}

/// Resolve a template string and render the result as text.
pub fn render_template(template: &str, context: &Value) -> Resolved<String> {
    let resolved = resolve_template_string(template, context);
    Resolved::new(value_to_string(&resolved.value), resolved.missing_paths)
}

/// Resolve every string inside a JSON value (object keys are left untouched).
pub fn resolve_template_value(value: &Value, context: &Value) -> Resolved<Value> {
    let mut missing = Vec::new();
    let value = resolve_into(value, context, &mut missing);
    Resolved::new(value, missing)
}

fn resolve_into(value: &Value, context: &Value, missing: &mut Vec<String>) -> Value {
    match value {
        Value::String(s) => {
            let resolved = resolve_template_string(s, context);
            for path in &resolved.missing_paths {
                push_missing(missing, path);
            }
            resolved.value
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_into(item, context, missing))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_into(v, context, missing)))
                .collect(),
        ),
        other => other.clone(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
