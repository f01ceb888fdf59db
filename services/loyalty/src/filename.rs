use chrono::{DateTime, Utc};

/// Maximum length of a sanitized name component. Two components plus the
/// date and extension keep the derived key under 200 bytes, within object
/// store key limits.
const MAX_COMPONENT_LEN: usize = 90;

/// Derive the storage key for a test-result document.
///
/// Format: `{member}_{type}_{YYYY-MM-DD}.pdf`, where both name components are
/// sanitized to `[A-Za-z0-9_]`. Deterministic and free of path separators;
/// the same member/type/day always derives the same key, so repeat
/// ingestions collide by design and are rejected at upload time.
pub fn derive_file_name(
    member_name: &str,
    type_title: &str,
    occurred_at: DateTime<Utc>,
) -> String {
    let date = occurred_at.format("%Y-%m-%d");
    format!(
        "{}_{}_{}.pdf",
        sanitize_component(member_name),
        sanitize_component(type_title),
        date
    )
}

/// Sanitize a name for use as a storage key component.
///
/// Every character outside `[A-Za-z0-9]` maps to `_`; empty input falls back
/// to `unknown` so no component is ever empty.
fn sanitize_component(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .take(MAX_COMPONENT_LEN)
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' => c,
            _ => '_',
        })
        .collect();

    if sanitized.is_empty() {
        "unknown".to_string()
    } else {
        sanitized
    }
}
