//! Errors raised while checking job and course records.

use std::fmt::Display;

use thiserror::Error;

/// A job or course record broke a rule it must satisfy before it is stored
/// or processed. Storage and provider failures have their own error types.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Missing linkage, unknown enum text or an out-of-range value.
    #[error("invalid record: {0}")]
    Validation(String),

    #[error("malformed id: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// `owner` cannot exist without `field`, e.g. a lesson job without a lesson.
    pub fn required(owner: impl Display, field: &str) -> Self {
        Self::Validation(format!("{owner} requires {field}"))
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_names_the_owner_and_field() {
        let err = DomainError::required("lesson_content job", "lesson_id");
        assert_eq!(err, DomainError::Validation("lesson_content job requires lesson_id".into()));
        assert_eq!(err.to_string(), "invalid record: lesson_content job requires lesson_id");
    }

    #[test]
    fn malformed_ids_are_reported_separately() {
        let err = DomainError::invalid_id("JobId: bad length");
        assert!(matches!(err, DomainError::InvalidId(_)));
        assert_eq!(err.to_string(), "malformed id: JobId: bad length");
    }
}
