//! Request dispatch for the event loop.
//!
//! Turns one request payload into one response payload for the configured
//! protocol. Runs synchronously on the event loop thread against raw byte
//! buffers.

use crate::protocols::echo;
use crate::protocols::kv::{self, Command, Status};
use crate::storage::Keyspace;
use bytes::BufMut;
use clap::ValueEnum;
use serde::Deserialize;

/// Protocol spoken inside frame payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Return every payload unchanged.
    #[default]
    Echo,
    /// Key-value commands against the keyspace.
    Kv,
}

/// Handle one request payload, writing the response payload to `response`.
///
/// `response` is empty on entry. Responses never exceed `max_payload`.
pub fn process(
    protocol: Protocol,
    request: &[u8],
    response: &mut Vec<u8>,
    keyspace: &mut Keyspace,
    max_payload: usize,
) {
    match protocol {
        Protocol::Echo => echo::process(request, response),
        Protocol::Kv => process_kv(request, response, keyspace, max_payload),
    }
}

fn process_kv(request: &[u8], response: &mut Vec<u8>, keyspace: &mut Keyspace, max_payload: usize) {
    match kv::parse(request) {
        Ok(command) => execute(command, response, keyspace),
        Err(e) => kv::write_response(Status::Err, e.to_string().as_bytes(), response),
    }

    if response.len() > max_payload {
        response.clear();
        kv::write_response(Status::Err, b"response too large", response);
    }
}

fn execute(command: Command<'_>, response: &mut Vec<u8>, keyspace: &mut Keyspace) {
    match command {
        Command::Get { key } => match keyspace.get(key) {
            Some(value) => kv::write_response(Status::Ok, value, response),
            None => kv::write_response(Status::Nx, b"", response),
        },
        Command::Set { key, value } => {
            keyspace.set(key, value);
            kv::write_response(Status::Ok, b"", response);
        }
        Command::Del { key } => {
            let status = if keyspace.del(key) {
                Status::Ok
            } else {
                Status::Nx
            };
            kv::write_response(status, b"", response);
        }
        Command::Keys => {
            kv::write_response(Status::Ok, b"", response);
            response.put_u32_le(keyspace.len() as u32);
            for key in keyspace.keys() {
                response.put_u32_le(key.len() as u32);
                response.put_slice(key);
            }
        }
    }
}
