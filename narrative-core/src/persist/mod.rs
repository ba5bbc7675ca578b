//! Persistence: storage backends, debounced writes and versioned envelopes.

pub mod debounce;
pub mod migrate;
pub mod storage;

pub use debounce::{DebounceOptions, DebouncedStorage, SaveSubscription, StorageStats};
pub use migrate::{
    decode, decode_strict, encode, load, load_strict, HydrationSource, Hydrated, PersistError,
    PersistedStore,
};
pub use storage::{FileStorage, MemoryStorage, StorageBackend, StorageError};
