//! License-plate string handling.

/// Comparison key: lowercase alphanumerics only (`"AB-12 cd"` → `"ab12cd"`).
pub fn normalize(plate: &str) -> String {
    plate
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Reduce a plate to characters that are safe in a directory name, a file
/// name and a comma-separated record line.
pub fn sanitize(plate: &str) -> String {
    plate
        .trim()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("AB-12 cd"), "ab12cd");
        assert_eq!(normalize("Z144PRSIM1"), "z144prsim1");
        assert_eq!(normalize(" - "), "");
    }

    #[test]
    fn test_sanitize_strips_path_and_csv_chars() {
        assert_eq!(sanitize("../etc/passwd"), "etcpasswd");
        assert_eq!(sanitize("AB,12"), "AB12");
        assert_eq!(sanitize(" 6-TBB-16 "), "6-TBB-16");
    }
}
