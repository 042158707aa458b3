//! Terminal formatting utilities: star counts and safe truncation.

/// Format star count (e.g., 1.2k, 15k)
pub fn format_stars(stars: u64) -> String {
    if stars >= 1000 {
        format!("{}k", stars / 1000)
    } else {
        format!("{}", stars)
    }
}

/// Truncate string safely at char boundary
pub fn truncate_str(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max_chars - 3).collect();
        format!("{}...", truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_stars_under_1k() {
        assert_eq!(format_stars(0), "0");
        assert_eq!(format_stars(1), "1");
        assert_eq!(format_stars(999), "999");
    }

    #[test]
    fn test_format_stars_over_1k() {
        assert_eq!(format_stars(1000), "1k");
        assert_eq!(format_stars(1500), "1k");
        assert_eq!(format_stars(9999), "9k");
        assert_eq!(format_stars(15000), "15k");
        assert_eq!(format_stars(150000), "150k");
    }

    #[test]
    fn test_truncate_str_short() {
        // Strings shorter than max should be unchanged
        assert_eq!(truncate_str("hello", 10), "hello");
        assert_eq!(truncate_str("", 10), "");
        assert_eq!(truncate_str("abc", 5), "abc");
    }

    #[test]
    fn test_truncate_str_exact() {
        // Strings exactly at max should be unchanged
        assert_eq!(truncate_str("hello", 5), "hello");
    }

    #[test]
    fn test_truncate_str_long() {
        // Strings longer than max should be truncated with ellipsis
        assert_eq!(truncate_str("hello world", 8), "hello...");
        assert_eq!(truncate_str("this is a long string", 10), "this is...");
    }

    #[test]
    fn test_truncate_str_multibyte() {
        // Multibyte characters should not be split
        let chinese = "你好世界测试字符串";
        let truncated = truncate_str(chinese, 6);
        assert!(truncated.ends_with("..."));
        assert!(truncated.chars().count() <= 6);
    }
}
