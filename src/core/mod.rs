// Core modules implementing keyword records, isolation, storage, and the cache state machine.
pub mod cache;
pub mod diff;
pub mod error;
pub mod introspect;
pub mod keyword;
pub mod store;
pub mod worker;
