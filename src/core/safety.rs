//! Payload limits and snapshot redaction.
//!
//! Every output persisted to the store passes through [`SafetyLimits::redact`]
//! so secrets carried in payloads or notifier configs never land in the audit
//! tables.

use glob::Pattern;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Replacement written in place of redacted values
pub const REDACTED: &str = "[REDACTED]";

/// Safety limits applied to triggers and snapshots
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyLimits {
    /// Maximum serialized payload size in bytes (default: 1MB)
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: u64,

    /// Glob patterns matched against lowercased object keys
    #[serde(default = "default_redact_patterns")]
    pub redact_patterns: Vec<String>,
}

fn default_max_payload_bytes() -> u64 {
    1024 * 1024
}

fn default_redact_patterns() -> Vec<String> {
    vec![
        "*password*".to_string(),
        "*secret*".to_string(),
        "*token*".to_string(),
        "*api_key*".to_string(),
        "*apikey*".to_string(),
        "*authorization*".to_string(),
        "*webhook*".to_string(),
    ]
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_payload_bytes: default_max_payload_bytes(),
            redact_patterns: default_redact_patterns(),
        }
    }
}

impl SafetyLimits {
    /// Check if an object key should be redacted
    pub fn is_sensitive_key(&self, key: &str) -> bool {
        let key = key.to_ascii_lowercase();
        self.redact_patterns
            .iter()
            .filter_map(|p| Pattern::new(p).ok())
            .any(|pattern| pattern.matches(&key))
    }

    /// Reject payloads above the size limit
    pub fn validate_payload(&self, payload: &serde_json::Value) -> Result<(), SafetyViolation> {
        let size = serde_json::to_vec(payload).map(|b| b.len() as u64).unwrap_or(0);
        if size > self.max_payload_bytes {
            return Err(SafetyViolation::MaxPayloadBytes {
                actual: size,
                limit: self.max_payload_bytes,
            });
        }
        Ok(())
    }

    /// Return a copy of `value` with sensitive keys replaced, recursively
    pub fn redact(&self, value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let redacted = map
                    .iter()
                    .map(|(k, v)| {
                        if self.is_sensitive_key(k) && !v.is_null() {
                            (k.clone(), serde_json::Value::String(REDACTED.to_string()))
                        } else {
                            (k.clone(), self.redact(v))
                        }
                    })
                    .collect();
                serde_json::Value::Object(redacted)
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(|v| self.redact(v)).collect())
            }
            other => other.clone(),
        }
    }
}

/// Safety violation errors
#[derive(Debug, Clone, Error)]
pub enum SafetyViolation {
    #[error("Maximum payload bytes exceeded: {actual} > {limit}")]
    MaxPayloadBytes { actual: u64, limit: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_limits() {
        let limits = SafetyLimits::default();
        assert_eq!(limits.max_payload_bytes, 1024 * 1024);
        assert!(!limits.redact_patterns.is_empty());
    }

    #[test]
    fn test_sensitive_key_matching() {
        let limits = SafetyLimits::default();

        assert!(limits.is_sensitive_key("password"));
        assert!(limits.is_sensitive_key("DB_PASSWORD"));
        assert!(limits.is_sensitive_key("auth_token"));
        assert!(limits.is_sensitive_key("webhook_url"));
        assert!(limits.is_sensitive_key("Authorization"));

        assert!(!limits.is_sensitive_key("severity"));
        assert!(!limits.is_sensitive_key("fingerprint"));
    }

    #[test]
    fn test_redact_nested_values() {
        let limits = SafetyLimits::default();
        let value = json!({
            "alerts": [{"name": "cpu", "labels": {"api_key": "abc"}}],
            "notify_config": {"endpoint": "http://x", "token": "t0p"},
            "secret": null
        });

        let redacted = limits.redact(&value);

        assert_eq!(redacted["alerts"][0]["name"], "cpu");
        assert_eq!(redacted["alerts"][0]["labels"]["api_key"], REDACTED);
        assert_eq!(redacted["notify_config"]["token"], REDACTED);
        assert_eq!(redacted["notify_config"]["endpoint"], "http://x");
        assert!(redacted["secret"].is_null());
    }

    #[test]
    fn test_payload_validation() {
        let limits = SafetyLimits {
            max_payload_bytes: 20,
            ..Default::default()
        };

        assert!(limits.validate_payload(&json!({"a": 1})).is_ok());

        let big = json!({"alerts": "x".repeat(100)});
        let result = limits.validate_payload(&big);
        assert!(matches!(result, Err(SafetyViolation::MaxPayloadBytes { .. })));
    }
}
