//! redb table definitions for the Steer state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Backends keyed by `{backend_id}`.
pub const BACKENDS: TableDefinition<&str, &[u8]> = TableDefinition::new("backends");

/// Sessions keyed by `{session_id}`.
pub const SESSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("sessions");

/// Event records keyed by `{time_ms:020}:{seq:012}` so key order is creation order.
pub const EVENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("events");
