//! Persistence store: sessions, messages and clients over SQLite.

mod models;
mod repository;

pub use models::{
    ClientRecord, MessageRecord, MessageType, NewMessage, SessionPatch, SessionRecord, StoreStats,
};
pub use repository::SessionStore;

/// Current wall-clock time as epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
