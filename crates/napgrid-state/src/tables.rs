//! redb table definitions for the napgrid store.

use redb::TableDefinition;

/// Plain string values keyed by string (leadership record, topology snapshot, activity).
pub const KEY_VALUES: TableDefinition<&str, &str> = TableDefinition::new("key_values");

/// Queued payloads keyed by `{function}/{sequence:020}`.
pub const QUEUE_ITEMS: TableDefinition<&str, &[u8]> = TableDefinition::new("queue_items");

/// Queue cursors keyed by `{function}/head` and `{function}/tail`.
pub const QUEUE_CURSORS: TableDefinition<&str, u64> = TableDefinition::new("queue_cursors");

pub(crate) fn item_key(function: &str, sequence: u64) -> String {
    format!("{function}/{sequence:020}")
}

pub(crate) fn head_key(function: &str) -> String {
    format!("{function}/head")
}

pub(crate) fn tail_key(function: &str) -> String {
    format!("{function}/tail")
}
