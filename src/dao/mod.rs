/// Logical key layout shared by every store backend.
pub mod keys;
/// TTL-capable key/value store abstraction and its in-memory backend.
pub mod kv_store;
/// Named, TTL-bounded mutual exclusion on top of the key/value store.
pub mod lock;
/// Versioned storage models for rooms and vote counters.
pub mod models;
/// Typed persistence of rooms and their satellite keys.
pub mod room_store;
/// Storage error types.
pub mod storage;
/// User directory collaborator.
pub mod users;
