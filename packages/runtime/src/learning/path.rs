//! Validation of names that become directory or file names.

use courier_core::ConfigError;

const INVALID_CHARACTERS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Checks queue and endpoint names before they are used as path segments.
pub struct PathChecker;

impl PathChecker {
    /// Validates `value` as a single path segment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPath`] naming `what` and the offending value.
    pub fn check(value: &str, what: &'static str) -> Result<(), ConfigError> {
        let reason = if value.is_empty() {
            Some("must not be empty")
        } else if value == "." || value == ".." {
            Some("must not be a relative path component")
        } else if value.contains(INVALID_CHARACTERS) {
            Some("contains a path separator or a character not allowed in file names")
        } else if value.chars().any(char::is_control) {
            Some("contains a control character")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(ConfigError::InvalidPath {
                what,
                value: value.to_string(),
                reason,
            }),
            None => Ok(()),
        }
    }
}

/// Makes a message type name usable as a directory name.
pub(crate) fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_control() || INVALID_CHARACTERS.contains(&c) {
                '_'
            } else {
                c
            }
        })
        .collect()
}
