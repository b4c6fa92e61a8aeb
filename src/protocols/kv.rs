//! Key-value command protocol.
//!
//! Carried inside the frame payload. All integers are little-endian `u32`.
//!
//! ```text
//! Request:  nargs | (len | bytes) * nargs
//! Response: status | data
//! ```
//!
//! Commands:
//! - `get <key>`: `OK <value>` or `NX`
//! - `set <key> <value>`: `OK`
//! - `del <key>`: `OK` or `NX`
//! - `keys`: `OK count | (len | key) * count`
//!
//! Malformed requests and unknown commands get an `ERR` response carrying a
//! UTF-8 message; they do not close the connection.

use bytes::{Buf, BufMut};
use thiserror::Error;

/// Maximum number of arguments in one request.
pub const MAX_ARGS: usize = 1024;

/// Size of the status prefix of a response.
pub const RESPONSE_HEADER_LEN: usize = 4;

/// Longest command name quoted back in an unknown-command error.
pub const MAX_QUOTED_NAME: usize = 32;

/// Response status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    Ok = 0,
    Err = 1,
    Nx = 2,
}

impl Status {
    pub fn from_u32(code: u32) -> Option<Self> {
        match code {
            0 => Some(Status::Ok),
            1 => Some(Status::Err),
            2 => Some(Status::Nx),
            _ => None,
        }
    }
}

/// Parsed command borrowing its arguments from the request payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    Get { key: &'a [u8] },
    Set { key: &'a [u8], value: &'a [u8] },
    Del { key: &'a [u8] },
    Keys,
}

/// Request parsing errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("request truncated")]
    Truncated,
    #[error("too many arguments: {0} > {max}", max = MAX_ARGS)]
    TooManyArgs(usize),
    #[error("{0} trailing bytes after arguments")]
    TrailingBytes(usize),
    #[error("empty command")]
    Empty,
    #[error("unknown command '{name}' with {args} arguments")]
    UnknownCommand { name: String, args: usize },
}

/// Parse a request payload into a command.
pub fn parse(payload: &[u8]) -> Result<Command<'_>, RequestError> {
    let args = parse_args(payload)?;
    let (&name, rest) = args.split_first().ok_or(RequestError::Empty)?;

    match rest {
        &[key] if name == b"get" => Ok(Command::Get { key }),
        &[key, value] if name == b"set" => Ok(Command::Set { key, value }),
        &[key] if name == b"del" => Ok(Command::Del { key }),
        &[] if name == b"keys" => Ok(Command::Keys),
        _ => Err(RequestError::UnknownCommand {
            name: String::from_utf8_lossy(&name[..name.len().min(MAX_QUOTED_NAME)]).into_owned(),
            args: rest.len(),
        }),
    }
}

/// Split a request payload into its argument vector.
pub fn parse_args(payload: &[u8]) -> Result<Vec<&[u8]>, RequestError> {
    let mut buf = payload;

    if buf.remaining() < 4 {
        return Err(RequestError::Truncated);
    }
    let nargs = buf.get_u32_le() as usize;
    if nargs > MAX_ARGS {
        return Err(RequestError::TooManyArgs(nargs));
    }

    let mut args = Vec::with_capacity(nargs);
    for _ in 0..nargs {
        if buf.remaining() < 4 {
            return Err(RequestError::Truncated);
        }
        let len = buf.get_u32_le() as usize;
        if buf.len() < len {
            return Err(RequestError::Truncated);
        }
        let (arg, rest) = buf.split_at(len);
        args.push(arg);
        buf = rest;
    }

    if !buf.is_empty() {
        return Err(RequestError::TrailingBytes(buf.len()));
    }
    Ok(args)
}

/// Encode an argument vector as a request payload.
pub fn encode_request(args: &[&[u8]], out: &mut Vec<u8>) {
    out.put_u32_le(args.len() as u32);
    for arg in args {
        out.put_u32_le(arg.len() as u32);
        out.put_slice(arg);
    }
}

/// Append a response with the given status and data.
pub fn write_response(status: Status, data: &[u8], out: &mut Vec<u8>) {
    out.put_u32_le(status as u32);
    out.put_slice(data);
}

/// Split a response payload into status and data.
pub fn decode_response(payload: &[u8]) -> Option<(Status, &[u8])> {
    if payload.len() < RESPONSE_HEADER_LEN {
        return None;
    }
    let (mut header, data) = payload.split_at(RESPONSE_HEADER_LEN);
    let status = Status::from_u32(header.get_u32_le())?;
    Some((status, data))
}
