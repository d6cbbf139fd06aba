//! Prefixed entity-id generation.

use chrono::Utc;

/// Allocate an id of the form `<prefix>_<millis><rand>`, e.g.
/// `ds_17126399218334f2a`. Millisecond timestamps keep ids roughly sortable
/// by creation time; the random suffix breaks same-millisecond collisions.
pub fn entity_id(prefix: &str) -> String {
    format!(
        "{}_{}{:04x}",
        prefix,
        Utc::now().timestamp_millis(),
        rand::random::<u16>()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_prefix_and_differ() {
        let a = entity_id("ds");
        let b = entity_id("ds");
        assert!(a.starts_with("ds_"));
        assert_ne!(a, b);
    }
}
