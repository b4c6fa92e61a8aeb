//! framekv: an in-memory key-value server
//!
//! Clients speak a length-prefixed framing protocol over TCP and may
//! pipeline requests. The server is a single-threaded, edge-triggered
//! event loop; payloads are handled by either:
//! - an echo protocol that returns every payload unchanged
//! - a key-value protocol (get, set, del, keys) backed by an incrementally
//!   resizing hash index

pub mod config;
pub mod hashtable;
pub mod protocols;
pub mod runtime;
pub mod storage;
