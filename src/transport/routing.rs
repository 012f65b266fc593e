//! Hierarchical routing-key segment automaton, topic-exchange semantics
//! (spec.md §4.6 "Routing key matching").

/// Sanitize an entity identifier for use in a routing key: lowercase, and
/// replace any character outside `[a-z0-9_-]` with `_` (spec.md §6).
pub fn sanitize_segment(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Build `exchange.message_class.from.to` (spec.md §4.6).
pub fn build_routing_key(exchange: &str, message_class: &str, from: &str, to: &str) -> String {
    [exchange, message_class, from, to]
        .iter()
        .map(|s| sanitize_segment(s))
        .collect::<Vec<_>>()
        .join(".")
}

/// Match a routing key against a pattern using topic-exchange semantics:
/// `*` consumes exactly one segment, `#` consumes zero or more, literal
/// segments must be equal (case-insensitive).
pub fn matches(key: &str, pattern: &str) -> bool {
    let key_segments: Vec<&str> = key.split('.').collect();
    let pattern_segments: Vec<&str> = pattern.split('.').collect();
    match_segments(&key_segments, &pattern_segments)
}

fn match_segments(key: &[&str], pattern: &[&str]) -> bool {
    match pattern.first() {
        None => key.is_empty(),
        Some(&"#") => {
            if pattern.len() == 1 {
                return true;
            }
            // Try every possible split point for the zero-or-more wildcard.
            for split in 0..=key.len() {
                if match_segments(&key[split..], &pattern[1..]) {
                    return true;
                }
            }
            false
        }
        Some(&"*") => {
            !key.is_empty() && match_segments(&key[1..], &pattern[1..])
        }
        Some(literal) => {
            // Sanitize both sides before comparing: `key` segments usually
            // already come from `build_routing_key`, but a caller-supplied
            // pattern literal may carry characters (spaces, dots, mixed
            // case) that key segments never would, so a plain
            // case-insensitive compare can under-match.
            !key.is_empty()
                && sanitize_segment(key[0]) == sanitize_segment(literal)
                && match_segments(&key[1..], &pattern[1..])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_segments_must_match() {
        assert!(matches("a.b.c", "a.b.c"));
        assert!(!matches("a.b.c", "a.b.d"));
    }

    #[test]
    fn star_matches_exactly_one_segment() {
        assert!(matches("a.x.c", "a.*.c"));
        assert!(!matches("a.c", "a.*.c"));
        assert!(!matches("a.x.y.c", "a.*.c"));
    }

    #[test]
    fn hash_matches_zero_or_more() {
        assert!(matches("a.b", "a.#.b"));
        assert!(matches("a.x.b", "a.#.b"));
        assert!(matches("a.x.y.b", "a.#.b"));
        assert!(!matches("a.c", "a.#.b"));
    }

    #[test]
    fn bare_hash_matches_everything_after_prefix() {
        assert!(matches("a.b.c.d", "a.#"));
        assert!(matches("a", "a.#"));
    }

    #[test]
    fn sanitize_lowercases_and_replaces_invalid_chars() {
        assert_eq!(sanitize_segment("Svc A!"), "svc_a_");
    }

    #[test]
    fn case_insensitive_literal_match() {
        assert!(matches("Svc.B", "svc.b"));
    }

    proptest::proptest! {
        #[test]
        fn exact_key_always_matches_itself_as_pattern(
            segments in proptest::collection::vec("[a-z]{1,5}", 1..5)
        ) {
            let key = segments.join(".");
            proptest::prop_assert!(matches(&key, &key));
        }
    }
}
