/// Maps arbitrary text (branch names, repo slugs) onto a single safe path segment.
pub fn sanitize_for_path(raw: &str) -> String {
    let sanitized: String = raw
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if sanitized.is_empty() || sanitized.chars().all(|ch| ch == '.') {
        "_".to_string()
    } else {
        sanitized
    }
}

/// Directory name used for one repository's state, e.g. `owner__repo`.
pub fn repository_dir_name(owner: &str, name: &str) -> String {
    sanitize_for_path(&format!("{owner}__{name}"))
}
