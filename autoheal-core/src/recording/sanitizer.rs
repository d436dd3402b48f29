use serde_json::Value;
use std::collections::HashMap;

/// Headers that carry credentials and must never reach a recording.
pub const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
    "x-github-token",
    "x-hub-signature",
    "x-hub-signature-256",
];

pub struct Sanitizer;

impl Sanitizer {
    pub fn is_sensitive_header(header_name: &str) -> bool {
        let lower = header_name.to_lowercase();
        SENSITIVE_HEADERS.contains(&lower.as_str())
    }

    pub fn sanitize_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
        headers
            .iter()
            .map(|(key, value)| {
                let sanitized_value = if Self::is_sensitive_header(key) {
                    "[REDACTED]".to_string()
                } else {
                    value.clone()
                };
                (key.clone(), sanitized_value)
            })
            .collect()
    }

    /// Redact secret-looking keys anywhere in a JSON document.
    pub fn sanitize_json(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut sanitized = serde_json::Map::new();
                for (key, val) in map {
                    let sanitized_val = match key.as_str() {
                        "token" | "private_key" | "secret" | "password" | "api_key" => {
                            Value::String("[REDACTED]".to_string())
                        }
                        _ => Self::sanitize_json(val),
                    };
                    sanitized.insert(key.clone(), sanitized_val);
                }
                Value::Object(sanitized)
            }
            Value::Array(arr) => Value::Array(arr.iter().map(Self::sanitize_json).collect()),
            _ => value.clone(),
        }
    }
}
