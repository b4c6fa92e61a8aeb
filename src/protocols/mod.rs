//! Protocol implementations.
//!
//! Every protocol rides on the same length-prefixed framing:
//! - `frame`: 4-byte length prefix codec shared by requests and responses
//!
//! Payload protocols:
//! - `echo`: returns each request payload unchanged
//! - `kv`: get/set/del/keys commands against the keyspace

pub mod echo;
pub mod frame;
pub mod kv;
