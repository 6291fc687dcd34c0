use dropshot::HttpError;
use lazy_regex::regex;

pub fn arg<T: Clone>(
    name: &str,
    arg: T,
    validators: Vec<fn(T) -> Result<(), String>>,
) -> Result<(), HttpError> {
    for validator in validators {
        validator(arg.clone()).map_err(|e| {
            HttpError::for_bad_request(None, format!("arg '{}' invalid; {}", name, e))
        })?;
    }

    Ok(())
}

/// Identifiers are used as the primary key in most of brandforge's resources.
/// They're defined by the user and therefore should have some sane bounds.
/// For all ids we'll want the following:
/// * 32 > characters < 3
/// * Only alphanumeric characters or underscores
pub fn is_valid_identifier(id: String) -> Result<(), String> {
    let alphanumeric_w_underscores = regex!("^[a-zA-Z0-9_]*$");

    if id.len() > 32 {
        return Err("length cannot be greater than 32".to_string());
    }

    if id.len() < 3 {
        return Err("length cannot be less than 3".to_string());
    }

    if !alphanumeric_w_underscores.is_match(&id) {
        return Err("can only be made up of alphanumeric and underscore characters".to_string());
    }

    Ok(())
}

/// Git branch names allow a wider character set than our identifiers do.
pub fn is_valid_branch_name(branch: String) -> Result<(), String> {
    let branch_chars = regex!("^[a-zA-Z0-9._/-]+$");

    if !branch_chars.is_match(&branch) {
        return Err(
            "can only be made up of alphanumeric characters, dots, dashes, underscores, and \
            forward slashes"
                .to_string(),
        );
    }

    Ok(())
}

pub fn not_empty_str(s: String) -> Result<(), String> {
    if s.is_empty() {
        return Err("cannot be empty".to_string());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_valid_identifier() {
        assert!(is_valid_identifier("acme_dark".to_string()).is_ok());
        assert!(is_valid_identifier("a1".to_string()).is_err());
        assert!(is_valid_identifier("has-dashes".to_string()).is_err());
        assert!(is_valid_identifier("a".repeat(33)).is_err());
    }

    #[test]
    fn test_is_valid_branch_name() {
        assert!(is_valid_branch_name("main".to_string()).is_ok());
        assert!(is_valid_branch_name("feature/retry-flow".to_string()).is_ok());
        assert!(is_valid_branch_name("release-1.2".to_string()).is_ok());
        assert!(is_valid_branch_name("".to_string()).is_err());
        assert!(is_valid_branch_name("bad branch".to_string()).is_err());
    }
}
