//! Purpose: Define the stable public Rust API boundary for libdesc.
//! Exports: Keyword records, the cache entry point, store and worker contracts.
//! Role: Public, additive-only surface used by the CLI and embedding hosts.
//! Invariants: `Cache::import_library` is the only operation callers need for keywords.
//! Invariants: Worker-side helpers are exported so hosts can ship their own worker binary.

mod local;

pub use crate::core::cache::{
    Cache, CacheConfig, Clock, DEFAULT_STALE_AFTER, Imported, LookupState, RefreshOutcome,
    SystemClock, WriteLock,
};
pub use crate::core::diff::materially_changed;
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::introspect::{
    DEFAULT_POLL_INTERVAL, Introspect, IntrospectorConfig, ProcessIntrospector, WorkerCommand,
};
pub use crate::core::keyword::{KeywordInfo, LibraryKey, ParamSpec};
pub use crate::core::store::{CacheEntry, DescriptorStore, FileStore, StoreSession};
#[cfg(unix)]
pub use crate::core::worker::reply_channel;
pub use crate::core::worker::{Describe, ManifestDescriber, WorkerReply, serve_worker};
pub use local::{LocalCache, LocalOptions};
