//! Field rules for incoming request bodies and query strings. Each check
//! returns the normalized value (trimmed or lowercased where the field is
//! stored that way).

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::db::Permissions;
use crate::rbac;

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9](?:[A-Za-z0-9\-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9\-]*[A-Za-z0-9])?)*\.[A-Za-z]{2,}$")
        .expect("valid email regex")
});

static USERNAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9._-]*$").expect("valid username regex"));

static TENANT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9-]+$").expect("valid tenant regex"));

const PASSWORD_SPECIALS: &str = "!@#$%^&*(),.?\":{}|<>";

pub const DEFAULT_LIMIT: i64 = 100;
pub const MAX_LIMIT: i64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

fn check_length(
    field: &'static str,
    value: &str,
    min: usize,
    max: usize,
) -> Result<(), ValidationError> {
    let len = value.chars().count();
    if len < min {
        return Err(ValidationError::new(
            field,
            format!("must be at least {min} characters"),
        ));
    }
    if len > max {
        return Err(ValidationError::new(
            field,
            format!("must be at most {max} characters"),
        ));
    }
    Ok(())
}

pub fn email(value: &str) -> Result<String, ValidationError> {
    let value = value.trim();
    check_length("email", value, 3, 255)?;
    if !EMAIL_RE.is_match(value) {
        return Err(ValidationError::new("email", "is not a valid email address"));
    }
    Ok(value.to_lowercase())
}

pub fn username(value: &str) -> Result<String, ValidationError> {
    check_length("username", value, 3, 100)?;
    if !USERNAME_RE.is_match(value) {
        return Err(ValidationError::new(
            "username",
            "must start with a letter and contain only letters, digits, dots, underscores and hyphens",
        ));
    }
    Ok(value.to_lowercase())
}

pub fn person_name(
    field: &'static str,
    value: Option<String>,
) -> Result<Option<String>, ValidationError> {
    if let Some(ref name) = value {
        check_length(field, name, 0, 100)?;
    }
    Ok(value)
}

pub fn tenant_id(value: &str) -> Result<String, ValidationError> {
    check_length("tenant_id", value, 1, 100)?;
    let lowered = value.to_lowercase();
    if !TENANT_RE.is_match(&lowered) {
        return Err(ValidationError::new(
            "tenant_id",
            "may only contain lowercase letters, digits and hyphens",
        ));
    }
    Ok(lowered)
}

/// Policy for passwords set through the user endpoints.
pub fn password(value: &str) -> Result<String, ValidationError> {
    check_length("password", value, 8, 100)?;

    let rules: [(fn(char) -> bool, &str); 4] = [
        (|c| c.is_ascii_uppercase(), "one uppercase letter"),
        (|c| c.is_ascii_lowercase(), "one lowercase letter"),
        (|c| c.is_ascii_digit(), "one digit"),
        (|c| PASSWORD_SPECIALS.contains(c), "one special character"),
    ];
    for (matches, requirement) in rules {
        if !value.chars().any(matches) {
            return Err(ValidationError::new(
                "password",
                format!("must contain at least {requirement}"),
            ));
        }
    }

    Ok(value.to_string())
}

pub fn role_name(value: &str) -> Result<String, ValidationError> {
    check_length("name", value, 2, 50)?;
    let stripped: String = value.chars().filter(|c| *c != '_').collect();
    if stripped.is_empty() || !stripped.chars().all(char::is_alphanumeric) {
        return Err(ValidationError::new(
            "name",
            "may only contain letters, digits and underscores",
        ));
    }
    Ok(value.to_lowercase())
}

pub fn role_description(value: Option<String>) -> Result<Option<String>, ValidationError> {
    if let Some(ref description) = value {
        check_length("description", description, 0, 500)?;
    }
    Ok(value)
}

pub fn permissions(value: &Permissions) -> Result<(), ValidationError> {
    for (resource, actions) in value {
        if let Some(action) = actions.iter().find(|a| !rbac::is_valid_action(a)) {
            return Err(ValidationError::new(
                "permissions",
                format!(
                    "invalid action '{action}' for '{resource}', expected one of {}",
                    rbac::ACTIONS.join(", ")
                ),
            ));
        }
    }
    Ok(())
}

/// Returns `(skip, limit)` with the defaults applied.
pub fn pagination(skip: Option<i64>, limit: Option<i64>) -> Result<(i64, i64), ValidationError> {
    let skip = skip.unwrap_or(0);
    let limit = limit.unwrap_or(DEFAULT_LIMIT);
    if skip < 0 {
        return Err(ValidationError::new("skip", "must be greater than or equal to 0"));
    }
    if !(1..=MAX_LIMIT).contains(&limit) {
        return Err(ValidationError::new(
            "limit",
            format!("must be between 1 and {MAX_LIMIT}"),
        ));
    }
    Ok((skip, limit))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use test_case::test_case;

    use super::*;

    #[test_case("Jane.Doe@Example.COM", "jane.doe@example.com")]
    #[test_case("  ops+alerts@acme.io ", "ops+alerts@acme.io")]
    fn emails_are_normalized(input: &str, expected: &str) {
        assert_eq!(email(input).expect("valid"), expected);
    }

    #[test_case("no-at-sign")]
    #[test_case("user@")]
    #[test_case("user@host")]
    #[test_case("a b@acme.io")]
    fn bad_emails(input: &str) {
        assert_eq!(email(input).expect_err("invalid").field, "email");
    }

    #[test]
    fn usernames_are_lowercased() {
        assert_eq!(username("Ahmed.M").expect("valid"), "ahmed.m");
    }

    #[test_case("ab" ; "too short")]
    #[test_case("1admin" ; "leading digit")]
    #[test_case("john doe" ; "space")]
    fn bad_usernames(input: &str) {
        assert!(username(input).is_err());
    }

    #[test]
    fn tenant_is_lowercased_slug() {
        assert_eq!(tenant_id("NextStep-Tunisia").expect("valid"), "nextstep-tunisia");
        assert!(tenant_id("acme_corp").is_err());
        assert!(tenant_id("").is_err());
    }

    #[test_case("Secure123!", true)]
    #[test_case("secure123!", false ; "no uppercase")]
    #[test_case("SECURE123!", false ; "no lowercase")]
    #[test_case("SecurePass!", false ; "no digit")]
    #[test_case("Secure1234", false ; "no special")]
    #[test_case("Se1!", false ; "too short")]
    fn password_policy(input: &str, ok: bool) {
        assert_eq!(password(input).is_ok(), ok);
    }

    #[test_case("Ops_Team", Some("ops_team"))]
    #[test_case("a", None ; "too short")]
    #[test_case("___", None ; "only underscores")]
    #[test_case("ops-team", None ; "hyphen")]
    fn role_names(input: &str, expected: Option<&str>) {
        assert_eq!(role_name(input).ok().as_deref(), expected);
    }

    #[test]
    fn long_description_is_rejected() {
        assert!(role_description(Some("x".repeat(501))).is_err());
        assert!(role_description(Some("x".repeat(500))).is_ok());
        assert!(role_description(None).is_ok());
    }

    #[test]
    fn unknown_actions_are_rejected() {
        let ok = BTreeMap::from([("vms".to_string(), vec!["read".to_string(), "*".to_string()])]);
        assert!(permissions(&ok).is_ok());

        let bad = BTreeMap::from([("vms".to_string(), vec!["execute".to_string()])]);
        let err = permissions(&bad).expect_err("invalid action");
        assert!(err.message.contains("execute"));
    }

    #[test]
    fn pagination_bounds() {
        assert_eq!(pagination(None, None).expect("defaults"), (0, 100));
        assert!(pagination(Some(-1), None).is_err());
        assert!(pagination(None, Some(0)).is_err());
        assert!(pagination(None, Some(1001)).is_err());
        assert_eq!(pagination(Some(20), Some(1000)).expect("max"), (20, 1000));
    }
}
