//! Field validation for registration, profile edits and catalog entries.

use std::sync::LazyLock;

use regex::Regex;

use crate::limits::*;

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email pattern"));

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9]{1,30}$").expect("name pattern"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldError {
    Email,
    Name(&'static str),
    Role(String),
    Empty(&'static str),
    TooLong(&'static str),
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldError::Email => write!(f, "Invalid email address."),
            FieldError::Name(field) => {
                write!(f, "Invalid {field}: 1 to 30 letters or digits.")
            }
            FieldError::Role(role) => write!(f, "Invalid role: {role} (expected user or admin)."),
            FieldError::Empty(field) => write!(f, "{field} is required."),
            FieldError::TooLong(field) => write!(f, "{field} is too long."),
        }
    }
}

impl std::error::Error for FieldError {}

pub fn email(value: &str) -> Result<(), FieldError> {
    if value.len() > MAX_EMAIL_LEN || !EMAIL_RE.is_match(value) {
        return Err(FieldError::Email);
    }
    Ok(())
}

pub fn name(field: &'static str, value: &str) -> Result<(), FieldError> {
    if value.len() > MAX_NAME_LEN || !NAME_RE.is_match(value) {
        return Err(FieldError::Name(field));
    }
    Ok(())
}

pub fn role(value: &str) -> Result<crate::model::Role, FieldError> {
    crate::model::Role::parse(value).ok_or_else(|| FieldError::Role(value.to_string()))
}

/// Non-empty after trimming and at most `max` bytes.
pub fn text(field: &'static str, value: &str, max: usize) -> Result<(), FieldError> {
    if value.trim().is_empty() {
        return Err(FieldError::Empty(field));
    }
    if value.len() > max {
        return Err(FieldError::TooLong(field));
    }
    Ok(())
}
