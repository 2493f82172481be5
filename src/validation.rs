//! Request input validation. Everything here rejects before any state is
//! touched, so a malformed request can never half-apply.

use crate::error::{Error, Result};
use crate::limits::MAX_CAPACITY;
use regex::Regex;

/// Longest accepted key, matching what fits comfortably in a Redis key.
pub const MAX_KEY_LENGTH: usize = 256;

/// Validates keys, patterns and token counts at the API boundary.
pub struct RequestValidator {
    key_syntax: Regex,
    pattern_syntax: Regex,
}

impl RequestValidator {
    pub fn new() -> Self {
        Self {
            // opaque identifiers: alphanumerics plus separator punctuation
            key_syntax: Regex::new(r"^[A-Za-z0-9_.:\-]+$").expect("key regex compiles"),
            // patterns additionally allow glob syntax
            pattern_syntax: Regex::new(r"^[A-Za-z0-9_.:\-*?\[\]]+$").expect("pattern regex compiles"),
        }
    }

    pub fn validate_key(&self, key: &str) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidInput("key must not be empty".to_string()));
        }
        if key.len() > MAX_KEY_LENGTH {
            return Err(Error::InvalidInput(format!(
                "key length {} exceeds maximum {}",
                key.len(),
                MAX_KEY_LENGTH
            )));
        }
        if !self.key_syntax.is_match(key) {
            return Err(Error::InvalidInput(
                "key may contain only alphanumerics, '-', '_', ':' and '.'".to_string(),
            ));
        }
        Ok(())
    }

    pub fn validate_pattern(&self, pattern: &str) -> Result<()> {
        if pattern.is_empty() || pattern.len() > MAX_KEY_LENGTH {
            return Err(Error::InvalidInput(
                "pattern must be 1..=256 characters".to_string(),
            ));
        }
        if !self.pattern_syntax.is_match(pattern) {
            return Err(Error::InvalidInput(
                "pattern may contain key characters and glob syntax only".to_string(),
            ));
        }
        Ok(())
    }

    /// Token counts: zero is a legal no-op probe, absurd values are not.
    pub fn validate_tokens(&self, tokens: u64) -> Result<()> {
        if tokens > MAX_CAPACITY {
            return Err(Error::InvalidInput(format!(
                "token count {} exceeds maximum {}",
                tokens, MAX_CAPACITY
            )));
        }
        Ok(())
    }
}

impl Default for RequestValidator {
    fn default() -> Self {
        Self::new()
    }
}
