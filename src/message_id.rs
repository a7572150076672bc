//! Time-ordered message identifiers
//!
//! Message ids are UUIDv7 values rendered as 32 lowercase hex characters.
//! The leading bits are a millisecond timestamp, so ids sort
//! lexicographically in creation order; a process-wide counter context
//! keeps ids minted within the same millisecond monotonic.

use std::sync::{LazyLock, Mutex};

use uuid::Uuid;
use uuid::timestamp::{Timestamp, context::ContextV7};

static CONTEXT: LazyLock<Mutex<ContextV7>> = LazyLock::new(|| Mutex::new(ContextV7::new()));

/// Mint a new message id
///
/// Globally unique with overwhelming probability, monotonic within this
/// process, and lexicographically sortable by creation time.
pub fn new_message_id() -> String {
    let context = CONTEXT.lock().unwrap_or_else(|e| e.into_inner());
    Uuid::new_v7(Timestamp::now(&*context))
        .simple()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::new_message_id;

    #[test]
    fn ids_are_32_hex_chars() {
        let id = new_message_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn ids_are_unique_and_sorted_by_mint_order() {
        let ids: Vec<String> = (0..64).map(|_| new_message_id()).collect();

        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);

        let mut deduped = ids.clone();
        deduped.dedup();
        assert_eq!(ids.len(), deduped.len());
    }
}
