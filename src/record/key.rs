//! Canonical identity key derivation.
//!
//! Mirrors the host notification framework's own key algorithm so that
//! decorated and non-decorated identities remain comparable system-wide.
//! This is a fixed external contract, not a free design choice.

use super::plain::UserHandle;

/// Derive the canonical identity key for a record.
///
/// Format: `<user>|<package>|<id>|<tag>|<uid>`, with an absent tag rendered
/// as the literal `null` (host framework string-concatenation behavior),
/// and `|g:<group>` appended when an override group key is present.
///
/// Examples:
/// - `(0, "app.example", 1, None, 1000, None)`      → `0|app.example|1|null|1000`
/// - `(0, "app.example", 1, Some("promo"), 1000, None)` → `0|app.example|1|promo|1000`
/// - `(10, "app.example", 1, None, 1000, Some("grp"))`  → `10|app.example|1|null|1000|g:grp`
pub fn derive_key(
    user: UserHandle,
    package: &str,
    id: i32,
    tag: Option<&str>,
    uid: u32,
    override_group_key: Option<&str>,
) -> String {
    let mut key = format!(
        "{}|{}|{}|{}|{}",
        user.identifier(),
        package,
        id,
        tag.unwrap_or("null"),
        uid
    );
    if let Some(group) = override_group_key {
        key.push_str("|g:");
        key.push_str(group);
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_tag_renders_as_null_literal() {
        let key = derive_key(UserHandle::new(0), "app.example", 1, None, 1000, None);
        assert_eq!(key, "0|app.example|1|null|1000");
    }

    #[test]
    fn tag_and_group_key_contribute() {
        let key = derive_key(
            UserHandle::new(10),
            "app.example",
            1,
            Some("promo"),
            1000,
            Some("grp"),
        );
        assert_eq!(key, "10|app.example|1|promo|1000|g:grp");
    }

    #[test]
    fn derivation_is_stable() {
        let a = derive_key(UserHandle::new(0), "app.example", 7, Some("t"), 1000, None);
        let b = derive_key(UserHandle::new(0), "app.example", 7, Some("t"), 1000, None);
        assert_eq!(a, b);
    }
}
