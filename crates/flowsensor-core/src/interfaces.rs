//! Parsing and validation for the `capture.interface` configuration value.

use thiserror::Error;

/// A validated network interface identifier, or the `any`/`all` sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InterfaceId(String);

impl InterfaceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_sentinel(&self) -> bool {
        self.0 == "any" || self.0 == "all"
    }
}

impl std::fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("interface name {segment:?} is invalid: {reason}")]
    Invalid { segment: String, reason: &'static str },
}

const FORBIDDEN: &[char] = &[
    '/', '\\', '|', '&', ';', '$', '`', '(', ')', '{', '}', '[', ']', '<', '>', '"', '\'', ' ',
    '\t', '\r', '\n', '\0',
];

fn validate_segment(segment: &str) -> Result<(), InterfaceError> {
    if segment.is_empty() || segment.len() > 255 {
        return Err(InterfaceError::Invalid {
            segment: segment.to_string(),
            reason: "length must be between 1 and 255 characters",
        });
    }
    if segment.contains("..") {
        return Err(InterfaceError::Invalid {
            segment: segment.to_string(),
            reason: "must not contain '..'",
        });
    }
    if segment.contains(FORBIDDEN) {
        return Err(InterfaceError::Invalid {
            segment: segment.to_string(),
            reason: "contains a forbidden character",
        });
    }
    if !segment
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
    {
        return Err(InterfaceError::Invalid {
            segment: segment.to_string(),
            reason: "must be alphanumeric with only '.', '_' or '-' as separators",
        });
    }
    Ok(())
}

/// Parses the comma-separated `capture.interface` config value into a
/// deduplicated, order-preserving list of interfaces. An empty or
/// whitespace-only value falls back to `["any"]`.
pub fn parse_interfaces(raw: &str) -> Result<Vec<InterfaceId>, InterfaceError> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for part in raw.split(',') {
        let trimmed = part.trim();
        if trimmed.is_empty() {
            continue;
        }
        validate_segment(trimmed)?;
        if seen.insert(trimmed.to_string()) {
            out.push(InterfaceId(trimmed.to_string()));
        }
    }
    if out.is_empty() {
        out.push(InterfaceId("any".to_string()));
    }
    Ok(out)
}
