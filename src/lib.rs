//! Purpose: Shared library crate used by the `libdesc` CLI and tests.
//! Exports: `api` (stable surface), `core` (keywords, diffing, store, worker isolation, cache), `notice`.
//! Role: Library keyword introspection with process isolation and a stale-while-revalidate cache.
//! Invariants: Untrusted library code only ever runs inside a worker process.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
pub mod core;
mod db_paths;
pub mod notice;
