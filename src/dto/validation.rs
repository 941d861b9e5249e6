//! Validation helpers for DTOs.

use validator::ValidationError;

const MAX_WORD_CHARS: usize = 64;
const MAX_USER_ID_CHARS: usize = 128;

/// Validates a secret word: non-blank once trimmed and at most 64 characters.
///
/// # Examples
///
/// ```ignore
/// validate_word("apple") // Ok
/// validate_word("   ")   // Err - blank
/// ```
pub fn validate_word(word: &str) -> Result<(), ValidationError> {
    let trimmed = word.trim();
    if trimmed.is_empty() {
        let mut err = ValidationError::new("word_blank");
        err.message = Some("Word must not be blank".into());
        return Err(err);
    }

    let chars = trimmed.chars().count();
    if chars > MAX_WORD_CHARS {
        let mut err = ValidationError::new("word_length");
        err.message =
            Some(format!("Word must be at most {MAX_WORD_CHARS} characters (got {chars})").into());
        return Err(err);
    }

    Ok(())
}

/// Validates a user id: non-empty, bounded, and free of whitespace and control characters.
pub fn validate_user_id(id: &str) -> Result<(), ValidationError> {
    if id.is_empty() || id.chars().count() > MAX_USER_ID_CHARS {
        let mut err = ValidationError::new("user_id_length");
        err.message =
            Some(format!("User ID must be 1 to {MAX_USER_ID_CHARS} characters").into());
        return Err(err);
    }

    if id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        let mut err = ValidationError::new("user_id_format");
        err.message = Some("User ID must not contain whitespace".into());
        return Err(err);
    }

    Ok(())
}
