//! The `{% path %}` template renderer.

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde_json::Value;

use crate::token::TokenFinder;
use pulse_types::data::to_display_string;

/// Renders every `{% ... %}` token in `template` against `finder`.
///
/// A token is either a bare path (`{% a.b %}`) or a transformer application
/// (`{% urlenc(a.b) %}`). Misses render as the empty string. Rendering is
/// pure.
pub fn render(template: &str, finder: &TokenFinder<'_>) -> String {
    let mut result = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '{' && chars.peek() == Some(&'%') {
            chars.next(); // consume %

            let mut token = String::new();
            loop {
                match chars.next() {
                    Some('%') if chars.peek() == Some(&'}') => {
                        chars.next(); // consume }
                        break;
                    }
                    Some(ch) => token.push(ch),
                    None => {
                        // Unterminated token: emit it raw and stop.
                        result.push_str("{%");
                        result.push_str(&token);
                        return result;
                    }
                }
            }

            result.push_str(&resolve_token(token.trim(), finder));
        } else {
            result.push(c);
        }
    }

    result
}

/// Recursively renders every string leaf of `value`.
///
/// Used to substitute tokens throughout a consequence's `detail` before it
/// is applied.
pub fn render_value(value: &Value, finder: &TokenFinder<'_>) -> Value {
    match value {
        Value::String(s) => Value::String(render(s, finder)),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, finder)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, finder)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_token(token: &str, finder: &TokenFinder<'_>) -> String {
    if let Some((name, rest)) = token.split_once('(') {
        if let Some(path) = rest.strip_suffix(')') {
            return apply_transformer(name.trim(), finder.find(path.trim()));
        }
    }

    finder
        .find(token)
        .map(|v| to_display_string(&v))
        .unwrap_or_default()
}

fn apply_transformer(name: &str, value: Option<Value>) -> String {
    let Some(value) = value else {
        return String::new();
    };

    match name {
        "urlenc" => {
            let plain = to_display_string(&value);
            utf8_percent_encode(&plain, NON_ALPHANUMERIC).to_string()
        }
        "int" => match &value {
            Value::Number(n) => n.as_f64().map(|f| (f as i64).to_string()).unwrap_or_default(),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(|f| (f as i64).to_string())
                .unwrap_or_default(),
            _ => String::new(),
        },
        unknown => {
            tracing::warn!(transformer = unknown, "unknown token transformer");
            to_display_string(&value)
        }
    }
}
