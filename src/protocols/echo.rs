//! Echo protocol.
//!
//! Every request payload is returned unchanged as the response payload.
//! Useful for exercising framing, pipelining and partial I/O without
//! touching the keyspace.
//!
//! ```text
//! Request:  05 00 00 00 "hello"
//! Response: 05 00 00 00 "hello"
//! ```

use tracing::trace;

/// Write the echo response for `request` into `response`.
pub fn process(request: &[u8], response: &mut Vec<u8>) {
    trace!(len = request.len(), "echo");
    response.extend_from_slice(request);
}
