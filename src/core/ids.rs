//! Opaque identifier generation.

use uuid::Uuid;

/// Generate a fresh UUIDv4, used for session ids, connection ids, jtis and
/// broker message ids alike.
pub fn new_id() -> Uuid {
    Uuid::new_v4()
}

/// Render an id the way it appears on the wire: lowercase hyphenated.
pub fn id_string() -> String {
    new_id().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let a = new_id();
        let b = new_id();
        assert_ne!(a, b);
    }
}
