//! Turning display names into single, portable path components.

/// Substitute for characters that cannot appear in a path component.
pub const SAFE_SUBSTITUTE: char = '-';

/// Name used when sanitization leaves nothing usable.
pub const FALLBACK_COMPONENT: &str = "untitled";

/// Sanitize a display name into one directory name.
///
/// Path separators, colons and control characters become `-`; surrounding
/// whitespace is trimmed; names that would resolve to `.` or `..` fall back to
/// `untitled`. Pure, so it can be used before any directory exists.
pub fn sanitize_component(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => SAFE_SUBSTITUTE,
            c if c.is_control() => SAFE_SUBSTITUTE,
            c => c,
        })
        .collect();

    let trimmed = replaced.trim();
    if trimmed.is_empty() || trimmed.chars().all(|c| c == '.') {
        return FALLBACK_COMPONENT.to_string();
    }
    trimmed.to_string()
}

/// Key under which two names would collide on a case-insensitive filesystem.
pub fn collision_key(name: &str) -> String {
    sanitize_component(name).to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_separators_replaced() {
        assert_eq!(sanitize_component("api/v1"), "api-v1");
        assert_eq!(sanitize_component("C:\\temp"), "C--temp");
        assert_eq!(sanitize_component("a:b"), "a-b");
    }

    #[test]
    fn test_dot_names_fall_back() {
        assert_eq!(sanitize_component(".."), FALLBACK_COMPONENT);
        assert_eq!(sanitize_component("   "), FALLBACK_COMPONENT);
        assert_eq!(sanitize_component(""), FALLBACK_COMPONENT);
    }

    #[test]
    fn test_plain_names_unchanged() {
        assert_eq!(sanitize_component("Payment Service"), "Payment Service");
        assert_eq!(sanitize_component(" web "), "web");
    }

    #[test]
    fn test_collision_key() {
        assert_eq!(collision_key("API/x"), collision_key("api:x"));
    }
}
