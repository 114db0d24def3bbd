//! Generation of child identifiers

use uuid::Uuid;

use crate::ChildId;

/// Generate a fresh identifier for a child process
///
/// Identifiers are UUIDv7 strings: time-ordered, with enough random bits that two
/// forks anywhere in a process tree will not collide.
#[must_use]
pub fn generate() -> ChildId {
    Uuid::now_v7().to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::generate;

    #[test]
    fn generated_ids_are_pairwise_distinct() {
        let ids: HashSet<String> = (0..50_000).map(|_| generate()).collect();
        assert_eq!(ids.len(), 50_000);
    }

    #[test]
    fn generated_ids_are_distinct_across_threads() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| (0..2_000).map(|_| generate()).collect::<Vec<_>>()))
            .collect();
        let mut ids = HashSet::new();
        for handle in handles {
            for id in handle.join().expect("generator thread panicked") {
                assert!(ids.insert(id), "duplicate id generated");
            }
        }
        assert_eq!(ids.len(), 16_000);
    }

    #[test]
    fn generated_id_is_a_v7_uuid() {
        let id = uuid::Uuid::parse_str(&generate()).expect("id should parse as a UUID");
        assert_eq!(id.get_version_num(), 7);
    }
}
