pub use self::token::{TokenIssuer, TokenType, verify_token_type};

pub mod token;

use thiserror::Error;

/// bcrypt ignores everything past this many bytes.
pub const MAX_PASSWORD_BYTES: usize = 72;

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("password cannot be empty")]
    EmptyPassword,
    #[error("password hashing failed: {0}")]
    Hash(#[from] bcrypt::BcryptError),
    #[error("token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
    #[error("unsupported token algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

fn truncate_password(password: &str) -> &str {
    if password.len() <= MAX_PASSWORD_BYTES {
        return password;
    }
    let mut end = MAX_PASSWORD_BYTES;
    while !password.is_char_boundary(end) {
        end -= 1;
    }
    &password[..end]
}

pub fn hash_password(password: &str, cost: u32) -> Result<String, SecurityError> {
    if password.is_empty() {
        return Err(SecurityError::EmptyPassword);
    }
    Ok(bcrypt::hash(truncate_password(password), cost)?)
}

/// A malformed hash counts as a mismatch.
pub fn verify_password(plain: &str, hashed: &str) -> bool {
    bcrypt::verify(truncate_password(plain), hashed).unwrap_or(false)
}

pub fn validate_password_strength(password: &str) -> Result<(), String> {
    if password.chars().count() < 8 {
        return Err("Password must be at least 8 characters long".to_string());
    }
    if password.len() > MAX_PASSWORD_BYTES {
        return Err(format!(
            "Password cannot exceed {MAX_PASSWORD_BYTES} bytes"
        ));
    }

    let has_lower = password.chars().any(|c| c.is_lowercase());
    let has_upper = password.chars().any(|c| c.is_uppercase());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    if !(has_lower && has_upper && has_digit) {
        return Err(
            "Password must contain at least one lowercase letter, one uppercase letter and one digit"
                .to_string(),
        );
    }

    Ok(())
}
