//! Domain ID generation
//!
//! Generated IDs use the format: `{8-char-hex}-{type}-{slug}`
//! Example: `3f9a01c2-run-add-oauth`

/// Generate a domain ID from type and title
pub fn generate_id(domain_type: &str, title: &str) -> String {
    let uuid = uuid::Uuid::now_v7().simple().to_string();
    // The tail of a v7 uuid is random; the head is a timestamp shared by bursts
    let hex = &uuid[uuid.len() - 8..];
    let slug = slugify(title);
    if slug.is_empty() {
        format!("{}-{}", hex, domain_type)
    } else {
        format!("{}-{}-{}", hex, domain_type, slug)
    }
}

/// Slugify a title for use in IDs, directory names and branch names
pub fn slugify(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        // Strip apostrophes entirely, replace other non-alphanumeric with hyphens
        .filter_map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' {
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
        .map(|s| s.trim_matches('.'))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}
