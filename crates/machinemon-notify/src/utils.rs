//! Helpers shared by the providers.

use serde_json::Value;

/// Longest upstream response body kept in errors and test results.
pub const MAX_BODY_LENGTH: usize = 2000;

/// Truncate a string to at most `max_len` bytes, respecting char boundaries.
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated]", &s[..end])
}

fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_lowercase();
    key.contains("password")
        || key.contains("token")
        || key.contains("secret")
        || key.ends_with("_key")
}

/// Replaces the values of secret-looking fields (passwords, tokens, keys) with `"***"`.
pub fn redact_sensitive_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, val)| {
                    let redacted = if is_sensitive_key(key) && !val.is_null() {
                        Value::String("***".to_string())
                    } else {
                        redact_sensitive_json(val)
                    };
                    (key.clone(), redacted)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_sensitive_json).collect()),
        _ => value.clone(),
    }
}

/// Redacts a provider config blob. Unparseable input is hidden entirely.
pub fn redact_json_string(json: &str) -> String {
    match serde_json::from_str::<Value>(json) {
        Ok(value) => redact_sensitive_json(&value).to_string(),
        Err(_) => "***".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn truncate_keeps_short_strings() {
        assert_eq!(truncate_string("ok", 10), "ok");
        assert_eq!(truncate_string("abcdef", 3), "abc... [truncated]");
        // Multi-byte char straddling the limit.
        assert_eq!(truncate_string("aé", 2), "a... [truncated]");
    }

    #[test]
    fn redacts_secrets_only() {
        let cfg = json!({
            "account_sid": "AC123",
            "auth_token": "secret-token",
            "user_key": "u-key",
            "password": "hunter2",
            "port": 587
        });
        let redacted = redact_sensitive_json(&cfg);
        assert_eq!(redacted["account_sid"], "AC123");
        assert_eq!(redacted["auth_token"], "***");
        assert_eq!(redacted["user_key"], "***");
        assert_eq!(redacted["password"], "***");
        assert_eq!(redacted["port"], 587);
    }

    #[test]
    fn redact_hides_garbage() {
        assert_eq!(redact_json_string("not json"), "***");
    }
}
