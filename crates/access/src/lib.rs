//! Persistence for key records: one row per `(logical key, wrapping key)`
//! pair, with write-through caching, cache-aside reads, and soft delete.

pub mod store;

pub use store::{KeyRecordStore, NewKeyRecord, UpdateKeyRecord};
