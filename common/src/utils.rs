// common/src/utils.rs
use serde_json::{Map, Value};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use url::Url;

use crate::error::BridgeError;

/// Setup tracing for consistent logging across crates
pub fn setup_tracing() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");
}

/// Extract the origin (scheme://host[:port]) of a URL
pub fn origin_of(url: &str) -> Result<String, BridgeError> {
    let parsed = Url::parse(url).map_err(|e| BridgeError::Config(format!("invalid url '{}': {}", url, e)))?;
    Ok(parsed.origin().ascii_serialization())
}

/// Whether two URLs share an origin
pub fn same_origin(a: &str, b: &str) -> bool {
    match (Url::parse(a), Url::parse(b)) {
        (Ok(a), Ok(b)) => a.origin() == b.origin(),
        _ => false,
    }
}

/// Convert a snake_case, kebab-case or PascalCase identifier to camelCase
pub fn to_camel_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = false;
    for (i, ch) in name.chars().enumerate() {
        if ch == '_' || ch == '-' {
            upper_next = true;
        } else if i == 0 {
            out.extend(ch.to_lowercase());
        } else if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

/// Recursively normalize every object key in a JSON value to camelCase
pub fn normalize_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, inner) in map {
                out.insert(to_camel_case(&key), normalize_keys(inner));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_keys).collect()),
        other => other,
    }
}

/// Pull the best human-readable message out of an error response body:
/// detail, message or title, first non-empty wins
pub fn extract_error_message(body: &Value) -> Option<String> {
    for key in ["detail", "message", "title"] {
        if let Some(text) = body.get(key).and_then(Value::as_str) {
            if !text.is_empty() {
                return Some(text.to_string());
            }
        }
    }
    None
}
