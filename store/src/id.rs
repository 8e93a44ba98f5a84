//! ID generation shared by every record type: `{6-char-hex}-{type}-{slug}`.

/// Generate a record ID from a type tag and a human title.
pub fn generate_id(record_type: &str, title: &str) -> String {
    let uuid = uuid::Uuid::now_v7();
    let hex_prefix = &uuid.to_string()[..6];
    format!("{}-{}-{}", hex_prefix, record_type, slugify(title))
}

/// Slugify a title for use in IDs: lowercase, non-alphanumerics become
/// hyphens, apostrophes are stripped rather than hyphenated.
pub fn slugify(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        .filter_map(|c| {
            if c.is_alphanumeric() {
                Some(c)
            } else if c == '\'' || c == '\u{2019}' || c == '\u{2018}' {
                None
            } else {
                Some('-')
            }
        })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_expected_shape() {
        let id = generate_id("task", "Add OAuth Support");
        assert!(id.contains("-task-"));
        assert!(id.ends_with("add-oauth-support"));
    }

    #[test]
    fn slugify_strips_apostrophes() {
        assert_eq!(slugify("don't stop"), "dont-stop");
        assert_eq!(slugify("Multiple   Spaces"), "multiple-spaces");
    }
}
