//! Identifier generation for persisted records.

use uuid::Uuid;

/// Generates a new record identifier: 32 lowercase hex characters.
#[must_use]
pub fn generate_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::generate_id;
    use rstest::rstest;

    #[rstest]
    fn ids_are_hex_and_unique() {
        let first = generate_id();
        let second = generate_id();
        assert_eq!(first.len(), 32);
        assert!(first.chars().all(|ch| ch.is_ascii_hexdigit()));
        assert_ne!(first, second);
    }
}
