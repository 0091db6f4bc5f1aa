//! Lock key hierarchy
//!
//! Three scopes, acquired strictly top-down and never reversed:
//!
//! 1. [`totw`] - the single global key gating whether an operation needs a
//!    stable view of the entire challenge namespace. Enumeration is the only
//!    case that takes it as writer; point operations take it as reader.
//! 2. [`challenge`] - writer for create/update/delete of the challenge
//!    record itself, reader for anything that merely needs the challenge to
//!    keep existing while acting on its instances.
//! 3. [`instance`] - writer for any mutation, reader for pure retrieval.

/// Global top-of-the-world key.
pub const TOTW: &str = "totw";

/// Global lock key.
pub fn totw() -> String {
    TOTW.to_string()
}

/// Per-challenge lock key.
pub fn challenge(challenge_id: &str) -> String {
    format!("chall/{challenge_id}")
}

/// Per-instance lock key. Pool-held instances use their opaque identity in
/// place of a source ID.
pub fn instance(challenge_id: &str, source_id: &str) -> String {
    format!("chall/{challenge_id}/src/{source_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_shapes() {
        assert_eq!(totw(), "totw");
        assert_eq!(challenge("web-intro"), "chall/web-intro");
        assert_eq!(
            instance("web-intro", "team-a"),
            "chall/web-intro/src/team-a"
        );
    }

    #[test]
    fn test_keys_nest_top_down() {
        let chall = challenge("web-intro");
        let inst = instance("web-intro", "team-a");
        assert!(inst.starts_with(&chall));
    }
}
