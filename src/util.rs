//! Small shared helpers.

use uuid::Uuid;

/// Generate an opaque 8-character identifier.
///
/// Short ids are used for sessions, agents, tasks, memory records and
/// intervention points alike; collisions are acceptable at the scale of a
/// single deployment and keep the ids readable in logs.
pub fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Truncate `text` to at most `limit` characters without splitting a
/// character in half.
pub fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_id_is_eight_chars() {
        let id = short_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn short_ids_are_unique_enough() {
        let a = short_id();
        let b = short_id();
        assert_ne!(a, b);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello", 3), "hel");
        // Multi-byte characters must not be split.
        assert_eq!(truncate_chars("héllo", 2), "hé");
    }
}
