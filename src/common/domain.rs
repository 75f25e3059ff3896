/// Why a name failed DNS-name validation. All variants fold into PermError
/// during evaluation, except on the initial sender domain.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DomainError {
    #[error("empty domain name")]
    Empty,
    #[error("domain name longer than 253 octets")]
    TooLong,
    #[error("label empty or longer than 63 octets")]
    BadLabel,
    #[error("purely numeric domain name")]
    AllNumeric,
}

/// Normalize a domain: lowercase + strip trailing dot.
pub fn normalize(domain: &str) -> String {
    let d = domain.to_ascii_lowercase();
    d.strip_suffix('.').unwrap_or(&d).to_string()
}

/// Compare two domains after normalization.
pub fn domains_equal(a: &str, b: &str) -> bool {
    normalize(a) == normalize(b)
}

/// Check if `child` is a subdomain of `parent` (after normalization).
/// A domain is NOT a subdomain of itself.
pub fn is_subdomain_of(child: &str, parent: &str) -> bool {
    let nc = normalize(child);
    let np = normalize(parent);
    if nc == np {
        return false;
    }
    nc.ends_with(&format!(".{}", np))
}

/// Validate a plain (post-macro-expansion) DNS name: labels of 1..=63
/// octets, at most 253 octets overall, and not purely dotted-numeric.
pub fn validate_domain(name: &str) -> Result<(), DomainError> {
    let name = name.strip_suffix('.').unwrap_or(name);
    if name.is_empty() {
        return Err(DomainError::Empty);
    }
    if name.len() > 253 {
        return Err(DomainError::TooLong);
    }
    for label in name.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(DomainError::BadLabel);
        }
    }
    if name.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return Err(DomainError::AllNumeric);
    }
    Ok(())
}

/// Drop leftmost labels until the name fits in 253 octets (or is empty).
/// Applied to macro-expanded target names before they are queried.
pub fn truncate_labels(name: &str) -> &str {
    let mut rest = name;
    while rest.len() > 253 {
        match rest.find('.') {
            Some(dot) => rest = &rest[dot + 1..],
            None => return "",
        }
    }
    rest
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- Normalize tests ---

    #[test]
    fn normalize_lowercase() {
        assert_eq!(normalize("EXAMPLE.COM"), "example.com");
    }

    #[test]
    fn normalize_strip_trailing_dot() {
        assert_eq!(normalize("example.com."), "example.com");
    }

    #[test]
    fn normalize_combined() {
        assert_eq!(normalize("Mail.EXAMPLE.COM."), "mail.example.com");
    }

    // --- domains_equal tests ---

    #[test]
    fn domains_equal_case_insensitive() {
        assert!(domains_equal("Example.COM", "example.com"));
    }

    #[test]
    fn domains_equal_trailing_dot() {
        assert!(domains_equal("example.com.", "example.com"));
    }

    #[test]
    fn domains_not_equal() {
        assert!(!domains_equal("example.com", "example.org"));
    }

    // --- is_subdomain_of tests ---

    #[test]
    fn subdomain_true() {
        assert!(is_subdomain_of("mail.example.com", "example.com"));
    }

    #[test]
    fn subdomain_deep() {
        assert!(is_subdomain_of("a.b.c.example.com", "example.com"));
    }

    #[test]
    fn subdomain_self_is_not_subdomain() {
        assert!(!is_subdomain_of("example.com", "example.com"));
    }

    #[test]
    fn subdomain_partial_label_no_match() {
        // "notexample.com" is NOT a subdomain of "example.com"
        assert!(!is_subdomain_of("notexample.com", "example.com"));
    }

    #[test]
    fn subdomain_case_insensitive() {
        assert!(is_subdomain_of("MAIL.Example.COM", "example.com"));
    }

    // --- validate_domain tests ---

    #[test]
    fn validate_plain_name() {
        assert!(validate_domain("example.com").is_ok());
        assert!(validate_domain("_spf.example.com").is_ok());
        assert!(validate_domain("example.com.").is_ok());
    }

    #[test]
    fn validate_empty() {
        assert_eq!(validate_domain(""), Err(DomainError::Empty));
        assert_eq!(validate_domain("."), Err(DomainError::Empty));
    }

    #[test]
    fn validate_empty_label() {
        assert_eq!(validate_domain("a..b"), Err(DomainError::BadLabel));
        assert_eq!(validate_domain(".example.com"), Err(DomainError::BadLabel));
    }

    #[test]
    fn validate_long_label() {
        let label = "a".repeat(64);
        assert_eq!(
            validate_domain(&format!("{label}.com")),
            Err(DomainError::BadLabel)
        );
        let label = "a".repeat(63);
        assert!(validate_domain(&format!("{label}.com")).is_ok());
    }

    #[test]
    fn validate_total_length() {
        // 4 * 63 + 3 dots = 255 > 253
        let long = ["a".repeat(63), "b".repeat(63), "c".repeat(63), "d".repeat(63)].join(".");
        assert_eq!(validate_domain(&long), Err(DomainError::TooLong));
    }

    #[test]
    fn validate_dotted_numeric() {
        assert_eq!(validate_domain("192.0.2.1"), Err(DomainError::AllNumeric));
        assert_eq!(validate_domain("12345"), Err(DomainError::AllNumeric));
        // One non-digit character is enough
        assert!(validate_domain("192.0.2.x").is_ok());
    }

    // --- truncate_labels tests ---

    #[test]
    fn truncate_noop_when_short() {
        assert_eq!(truncate_labels("example.com"), "example.com");
    }

    #[test]
    fn truncate_drops_leftmost() {
        let long = ["x".repeat(60), "y".repeat(60), "z".repeat(60), "w".repeat(60), "example.com".into()]
            .join(".");
        let trimmed = truncate_labels(&long);
        assert!(trimmed.len() <= 253);
        assert!(trimmed.ends_with("example.com"));
        assert!(!trimmed.starts_with('x'));
    }

    #[test]
    fn truncate_single_giant_label() {
        let label = "q".repeat(300);
        assert_eq!(truncate_labels(&label), "");
    }
}
