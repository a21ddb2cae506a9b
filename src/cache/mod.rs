//! # TTL Cache Manager
//!
//! A namespaced, TTL-keyed in-memory cache that doubles as the engine's
//! debounce primitive. Namespaces are created explicitly and locked
//! independently; the namespace table itself is guarded by a separate lock,
//! so operations on different namespaces never contend.
//!
//! Besides plain `set`/`get`/`delete` with per-key expiry, the manager
//! offers `set_with_finalizer` (run an action when the key expires, which is
//! what turns a TTL entry into a debounce window) and deadline-bounded
//! locked sections (`with_exclusive_lock`/`with_shared_lock`).

pub mod manager;

pub use manager::{CacheManager, Finalizer, LockedNamespace, SharedNamespace};
