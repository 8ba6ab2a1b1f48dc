//! Purpose: Unified client over a remote in-memory store: cache, lists, pub/sub, streams.
//! Exports: `api` (client and capability traits), `core` (store seam, codec, cursors, errors).
//! Role: Library backing the `cachelink` CLI and embedding applications.
//! Invariants: All store access goes through the `core::store::Store` trait.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
pub mod core;
