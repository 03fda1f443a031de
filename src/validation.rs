use crate::error::CourierError;

/// Maximum length of upload and bucket reference names
pub const MAX_NAME_LENGTH: usize = 128;

/// Validate an upload or bucket reference name
///
/// Names must:
/// - be 1..=128 characters
/// - start with an ASCII letter or digit
/// - contain only ASCII letters, digits, '_', '.' and '-'
pub fn validate_name(kind: &str, name: &str) -> Result<(), CourierError> {
    if name.is_empty() {
        return Err(CourierError::Validation(format!("{} must not be empty", kind)));
    }

    if name.len() > MAX_NAME_LENGTH {
        return Err(CourierError::Validation(format!(
            "{} is too long ({} characters, maximum {})",
            kind,
            name.len(),
            MAX_NAME_LENGTH
        )));
    }

    let mut chars = name.chars();
    if !chars.next().is_some_and(|c| c.is_ascii_alphanumeric()) {
        return Err(CourierError::Validation(format!(
            "{} must start with a letter or digit: {}",
            kind, name
        )));
    }

    if let Some(bad) = chars.find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))) {
        return Err(CourierError::Validation(format!(
            "{} contains invalid character {:?}: {}",
            kind, bad, name
        )));
    }

    Ok(())
}

/// Validate an S3 bucket name
pub fn validate_bucket_name(name: &str) -> Result<(), CourierError> {
    if !(3..=63).contains(&name.len()) {
        return Err(CourierError::Validation(format!(
            "Bucket name must be 3-63 characters: {}",
            name
        )));
    }

    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-');
    if !valid_chars {
        return Err(CourierError::Validation(format!(
            "Bucket name may only contain lowercase letters, digits, '.' and '-': {}",
            name
        )));
    }

    let edge_ok = |c: Option<char>| c.is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    if !edge_ok(name.chars().next()) || !edge_ok(name.chars().last()) {
        return Err(CourierError::Validation(format!(
            "Bucket name must start and end with a letter or digit: {}",
            name
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert!(validate_name("Upload name", "photos").is_ok());
        assert!(validate_name("Upload name", "Camera_2024.backup-1").is_ok());
    }

    #[test]
    fn test_invalid_names() {
        assert!(validate_name("Upload name", "").is_err());
        assert!(validate_name("Upload name", "-leading").is_err());
        assert!(validate_name("Upload name", "has space").is_err());
        assert!(validate_name("Upload name", &"x".repeat(MAX_NAME_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_bucket_names() {
        assert!(validate_bucket_name("my-bucket.01").is_ok());
        assert!(validate_bucket_name("ab").is_err());
        assert!(validate_bucket_name("Upper").is_err());
        assert!(validate_bucket_name("trailing-").is_err());
        assert!(validate_bucket_name("under_score").is_err());
    }
}
