//! Concrete database backends.
//!
//! `memory` is always available; `rocksdb` and `surrealkv` follow their
//! cargo features.

#[cfg(any(feature = "rocksdb", feature = "surrealkv"))]
mod data_dir;
pub mod memory;
#[cfg(feature = "rocksdb")]
pub mod rocksdb;
#[cfg(feature = "surrealkv")]
pub mod surrealkv;

use crate::registry::Registry;

/// Register every backend compiled into this binary.
pub fn register_builtin(registry: &mut Registry) {
    registry.register(memory::NAME, memory::MemoryDb::create);
    #[cfg(feature = "rocksdb")]
    registry.register(rocksdb::NAME, rocksdb::RocksDb::create);
    #[cfg(feature = "surrealkv")]
    registry.register(surrealkv::NAME, surrealkv::SurrealKv::create);
}
