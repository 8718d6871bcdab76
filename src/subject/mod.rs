//! Subject Codec: a total bijection between a user id and a bus subject
//! name for group traffic.
//!
//! The format is deliberately simple: a fixed `grp.` prefix (disjoint from
//! the `dm.` and `sys.` families a private-channel or system-event
//! subsystem would use) followed by the user's UUID in its canonical
//! hyphenated form. ASCII, bounded length, and no wildcard characters
//! (`*`, `>`) ever appear in a UUID's canonical rendering, so subjects stay
//! wildcard-free structurally rather than by an extra check.

use uuid::Uuid;

use crate::model::UserId;

const PREFIX: &str = "grp.";

/// Encode a user id as its group-traffic bus subject.
pub fn encode(user: UserId) -> String {
    format!("{PREFIX}{}", user.0)
}

/// Decode a bus subject back into a user id, if it is a group-traffic
/// subject produced by [`encode`].
pub fn decode(subject: &str) -> Option<UserId> {
    let rest = subject.strip_prefix(PREFIX)?;
    Uuid::parse_str(rest).ok().map(UserId)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_of_encode_is_identity() {
        let user = UserId(Uuid::now_v7());
        assert_eq!(decode(&encode(user)), Some(user));
    }

    #[test]
    fn distinct_users_encode_to_distinct_subjects() {
        let a = UserId(Uuid::now_v7());
        let b = UserId(Uuid::now_v7());
        assert_ne!(encode(a), encode(b));
    }

    #[test]
    fn encoded_subject_has_no_wildcards_and_is_ascii() {
        let user = UserId(Uuid::now_v7());
        let subject = encode(user);
        assert!(subject.is_ascii());
        assert!(!subject.contains('*'));
        assert!(!subject.contains('>'));
        assert!(subject.len() < 64);
    }

    #[test]
    fn decode_rejects_other_namespaces() {
        assert_eq!(decode("dm.not-a-group-subject"), None);
        assert_eq!(decode("sys.heartbeat"), None);
    }

    #[test]
    fn decode_rejects_malformed_uuid_suffix() {
        assert_eq!(decode("grp.not-a-uuid"), None);
    }

    proptest::proptest! {
        #[test]
        fn bijection_holds_for_arbitrary_uuids(bytes: [u8; 16]) {
            let user = UserId(Uuid::from_bytes(bytes));
            proptest::prop_assert_eq!(decode(&encode(user)), Some(user));
        }
    }
}
