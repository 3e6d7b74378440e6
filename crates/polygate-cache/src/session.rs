use uuid::Uuid;

use crate::hasher::sha256_hex;

/// Cache-session identity for a caller. A `user_id` of the form
/// `…_session_<UUID>…` pins the session to that UUID; anything else hashes
/// to a stable opaque id.
pub fn derive_session_id(user_id: &str) -> String {
    if let Some(uuid) = extract_session_uuid(user_id) {
        return uuid;
    }
    sha256_hex(user_id)
}

fn extract_session_uuid(user_id: &str) -> Option<String> {
    let start = user_id.find("_session_")? + "_session_".len();
    let candidate = user_id.get(start..start + 36)?;
    Uuid::parse_str(candidate).ok()?;
    Some(candidate.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_uuid_is_extracted() {
        assert_eq!(
            derive_session_id("abc_session_123e4567-e89b-12d3-a456-426614174000"),
            "123e4567-e89b-12d3-a456-426614174000"
        );
        assert_eq!(
            derive_session_id("abc_session_123e4567-e89b-12d3-a456-426614174000_suffix"),
            "123e4567-e89b-12d3-a456-426614174000"
        );
    }

    #[test]
    fn plain_ids_hash_to_hex() {
        let id = derive_session_id("plain-user-id");
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id, derive_session_id("plain-user-id"));
    }

    #[test]
    fn malformed_session_marker_falls_back_to_hash() {
        let id = derive_session_id("abc_session_not-a-uuid");
        assert_eq!(id.len(), 64);
    }
}
