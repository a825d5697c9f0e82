//! Persistent tier: store trait, SQL and in-memory backends, and the
//! write-through service the engine talks to.

pub mod memory;
pub mod persistent;
pub mod sql;
pub mod traits;

pub use persistent::PersistentCache;
