//! Connection state machine.
//!
//! Each connection owns a bounded read buffer, a bounded write buffer and
//! its stream. The event loop drives it with `read_ready` / `write_ready`
//! when the stream reports readiness; both run non-blocking I/O until the
//! stream would block, so they are safe under edge-triggered notification.
//!
//! ```text
//!            +-----------+  responses pending, write would block
//!  accept -> |  Reading  | ------------------------------------+
//!            +-----------+                                     v
//!              |    ^    write buffer drained            +-----------+
//!              |    +----------------------------------- |  Writing  |
//!              |                                         +-----------+
//!              | EOF / I/O error / oversized frame             |
//!              v                                               |
//!            +-----------+  I/O error                          |
//!            |  Closing  | <-----------------------------------+
//!            +-----------+
//! ```
//!
//! Requests are handled strictly in arrival order, so pipelined frames are
//! answered in the order they were sent.

use crate::protocols::frame::{FrameCodec, FrameError};
use std::io::{self, Read, Write};
use thiserror::Error;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Filling the read buffer and handling complete frames.
    Reading,
    /// Flushing buffered responses.
    Writing,
    /// Terminal: no further I/O, the connection is torn down.
    Closing,
}

/// Conditions that close a connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("unexpected end of stream with {buffered} bytes buffered")]
    UnexpectedEof { buffered: usize },
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Outcome of a single read attempt.
enum Fill {
    Data,
    WouldBlock,
    Eof,
}

/// Read buffer: `buf[..filled]` holds received, unprocessed bytes.
struct ReadBuffer {
    buf: Vec<u8>,
    filled: usize,
}

impl ReadBuffer {
    /// Drop the first `n` bytes, shifting the rest to the front.
    fn consume(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        self.buf.copy_within(n..self.filled, 0);
        self.filled -= n;
    }
}

/// Write buffer: `buf[sent..filled]` is still to be written.
struct WriteBuffer {
    buf: Vec<u8>,
    filled: usize,
    sent: usize,
}

impl WriteBuffer {
    fn available(&self) -> usize {
        self.buf.len() - self.filled
    }

    fn pending(&self) -> usize {
        self.filled - self.sent
    }

    fn reset(&mut self) {
        self.filled = 0;
        self.sent = 0;
    }
}

/// A single client connection.
pub struct Connection<S> {
    stream: S,
    state: ConnState,
    rbuf: ReadBuffer,
    wbuf: WriteBuffer,
}

impl<S: Read + Write> Connection<S> {
    /// Create a connection in the reading state.
    ///
    /// Buffer capacities are the lengths of `read_buf` and `write_buf`; both
    /// must hold at least one maximum-size frame.
    pub fn new(stream: S, read_buf: Vec<u8>, write_buf: Vec<u8>) -> Self {
        Self {
            stream,
            state: ConnState::Reading,
            rbuf: ReadBuffer {
                buf: read_buf,
                filled: 0,
            },
            wbuf: WriteBuffer {
                buf: write_buf,
                filled: 0,
                sent: 0,
            },
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Bytes received but not yet handled.
    pub fn buffered(&self) -> usize {
        self.rbuf.filled
    }

    /// Response bytes not yet written.
    pub fn pending_write(&self) -> usize {
        self.wbuf.pending()
    }

    /// Tear down into the stream and the two buffers.
    pub fn into_parts(self) -> (S, Vec<u8>, Vec<u8>) {
        (self.stream, self.rbuf.buf, self.wbuf.buf)
    }

    /// Drive the reading state until the stream would block.
    ///
    /// Every complete frame is passed to `handler`, which writes the response
    /// payload into `scratch`. Responses are flushed as they accumulate; if
    /// the stream cannot take them the connection moves to `Writing`.
    ///
    /// A clean end of stream sets `Closing` and returns `Ok`. Errors also set
    /// `Closing` before being returned.
    pub fn read_ready<F>(
        &mut self,
        codec: &FrameCodec,
        scratch: &mut Vec<u8>,
        mut handler: F,
    ) -> Result<(), ConnectionError>
    where
        F: FnMut(&[u8], &mut Vec<u8>),
    {
        if self.state != ConnState::Reading {
            return Ok(());
        }

        let result = self.read_loop(codec, scratch, &mut handler);
        if result.is_err() {
            self.state = ConnState::Closing;
        }
        result
    }

    /// Drive the writing state until the buffer drains or the stream would
    /// block. Returns to `Reading` once everything is written.
    pub fn write_ready(&mut self) -> Result<(), ConnectionError> {
        if self.state != ConnState::Writing {
            return Ok(());
        }

        match self.flush() {
            Ok(true) => {
                self.state = ConnState::Reading;
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e) => {
                self.state = ConnState::Closing;
                Err(e)
            }
        }
    }

    fn read_loop<F>(
        &mut self,
        codec: &FrameCodec,
        scratch: &mut Vec<u8>,
        handler: &mut F,
    ) -> Result<(), ConnectionError>
    where
        F: FnMut(&[u8], &mut Vec<u8>),
    {
        loop {
            self.handle_buffered(codec, scratch, handler)?;

            if self.wbuf.pending() > 0 {
                self.state = ConnState::Writing;
                if !self.flush()? {
                    return Ok(());
                }
                // Drained: room for more responses from already buffered frames.
                self.state = ConnState::Reading;
                continue;
            }

            match self.fill()? {
                Fill::Data => {}
                Fill::WouldBlock => return Ok(()),
                Fill::Eof => {
                    self.state = ConnState::Closing;
                    return Ok(());
                }
            }
        }
    }

    /// Handle complete frames while the write buffer has room for a
    /// worst-case response, then compact the read buffer.
    fn handle_buffered<F>(
        &mut self,
        codec: &FrameCodec,
        scratch: &mut Vec<u8>,
        handler: &mut F,
    ) -> Result<(), ConnectionError>
    where
        F: FnMut(&[u8], &mut Vec<u8>),
    {
        let mut consumed = 0;

        while self.wbuf.available() >= codec.max_frame_len() {
            let input = &self.rbuf.buf[consumed..self.rbuf.filled];
            let Some((frame, len)) = codec.decode(input)? else {
                break;
            };

            scratch.clear();
            handler(frame.payload, scratch);
            consumed += len;

            let wbuf = &mut self.wbuf;
            let written = codec.encode(scratch.as_slice(), &mut wbuf.buf[wbuf.filled..])?;
            wbuf.filled += written;
        }

        self.rbuf.consume(consumed);
        Ok(())
    }

    /// One read into the spare capacity of the read buffer.
    fn fill(&mut self) -> Result<Fill, ConnectionError> {
        let rbuf = &mut self.rbuf;
        // Anything left after handling is a partial frame, which always fits.
        debug_assert!(rbuf.filled < rbuf.buf.len());

        loop {
            match self.stream.read(&mut rbuf.buf[rbuf.filled..]) {
                Ok(0) if rbuf.filled == 0 => return Ok(Fill::Eof),
                Ok(0) => {
                    return Err(ConnectionError::UnexpectedEof {
                        buffered: rbuf.filled,
                    })
                }
                Ok(n) => {
                    rbuf.filled += n;
                    return Ok(Fill::Data);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Fill::WouldBlock),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Write pending response bytes. Returns `true` once the buffer is empty.
    fn flush(&mut self) -> Result<bool, ConnectionError> {
        let wbuf = &mut self.wbuf;

        while wbuf.sent < wbuf.filled {
            match self.stream.write(&wbuf.buf[wbuf.sent..wbuf.filled]) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0").into());
                }
                Ok(n) => wbuf.sent += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        wbuf.reset();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    const MAX_PAYLOAD: usize = 64;

    /// One step of a scripted read side.
    enum Step {
        Data(Vec<u8>),
        WouldBlock,
        Interrupted,
        Eof,
    }

    /// In-memory stream replaying a read script and capturing writes.
    struct ScriptedStream {
        reads: VecDeque<Step>,
        written: Vec<u8>,
        /// Bytes accepted before writes report `WouldBlock`.
        write_budget: usize,
        /// Upper bound on bytes accepted by a single write call.
        max_write: usize,
    }

    impl ScriptedStream {
        fn new(reads: Vec<Step>) -> Self {
            Self {
                reads: reads.into(),
                written: Vec::new(),
                write_budget: usize::MAX,
                max_write: usize::MAX,
            }
        }
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                None | Some(Step::WouldBlock) => Err(io::ErrorKind::WouldBlock.into()),
                Some(Step::Interrupted) => Err(io::ErrorKind::Interrupted.into()),
                Some(Step::Eof) => {
                    self.reads.push_front(Step::Eof);
                    Ok(0)
                }
                Some(Step::Data(mut data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        self.reads.push_front(Step::Data(data.split_off(n)));
                    }
                    Ok(n)
                }
            }
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.write_budget == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.write_budget).min(self.max_write);
            self.written.extend_from_slice(&buf[..n]);
            self.write_budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn codec() -> FrameCodec {
        FrameCodec::new(MAX_PAYLOAD)
    }

    fn connection(reads: Vec<Step>) -> Connection<ScriptedStream> {
        let size = codec().max_frame_len();
        Connection::new(ScriptedStream::new(reads), vec![0; size], vec![0; size])
    }

    fn frames(payloads: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for payload in payloads {
            codec().encode_to_vec(payload, &mut out).unwrap();
        }
        out
    }

    fn echo(request: &[u8], response: &mut Vec<u8>) {
        response.extend_from_slice(request);
    }

    fn read(conn: &mut Connection<ScriptedStream>) -> Result<(), ConnectionError> {
        let mut scratch = Vec::new();
        conn.read_ready(&codec(), &mut scratch, echo)
    }

    #[test]
    fn test_pipelined_frames_answered_in_order() {
        let input = frames(&[b"hello1", b"hello2", b"hello3", b"hello4"]);
        let mut conn = connection(vec![Step::Data(input.clone()), Step::WouldBlock]);

        read(&mut conn).unwrap();

        assert_eq!(conn.state(), ConnState::Reading);
        assert_eq!(conn.stream().written, input);
        assert_eq!(conn.buffered(), 0);
        assert_eq!(conn.pending_write(), 0);
    }

    #[test]
    fn test_oversized_frame_closes_without_response() {
        let input = ((MAX_PAYLOAD + 1) as u32).to_le_bytes().to_vec();
        let mut conn = connection(vec![Step::Data(input)]);

        let err = read(&mut conn).unwrap_err();

        assert!(matches!(
            err,
            ConnectionError::Frame(FrameError::TooLarge { len, max })
                if len == MAX_PAYLOAD + 1 && max == MAX_PAYLOAD
        ));
        assert_eq!(conn.state(), ConnState::Closing);
        assert!(conn.stream().written.is_empty());
    }

    #[test]
    fn test_frames_before_violation_are_answered() {
        let mut input = frames(&[b"first"]);
        input.extend_from_slice(&u32::MAX.to_le_bytes());
        let mut conn = connection(vec![Step::Data(input)]);

        assert!(read(&mut conn).is_err());
        assert_eq!(conn.state(), ConnState::Closing);
        assert_eq!(conn.stream().written, frames(&[b"first"]));
    }

    #[test]
    fn test_frame_split_at_every_point() {
        let input = frames(&[b"split me"]);

        for i in 1..input.len() {
            for j in i..input.len() {
                let chunks = [&input[..i], &input[i..j], &input[j..]];
                let mut script = Vec::new();
                for chunk in chunks.iter().filter(|c| !c.is_empty()) {
                    script.push(Step::Data(chunk.to_vec()));
                    script.push(Step::WouldBlock);
                }
                let events = script.len() / 2;
                let mut conn = connection(script);

                for _ in 0..events {
                    read(&mut conn).unwrap();
                    assert_eq!(conn.state(), ConnState::Reading);
                }

                assert_eq!(conn.stream().written, input, "split at {i}/{j}");
                assert_eq!(conn.buffered(), 0);
            }
        }
    }

    #[test]
    fn test_byte_at_a_time_pipeline() {
        let input = frames(&[b"a", b"", b"ccc"]);
        let mut script = Vec::new();
        for &byte in &input {
            script.push(Step::Data(vec![byte]));
        }
        script.push(Step::WouldBlock);
        let mut conn = connection(script);

        read(&mut conn).unwrap();

        assert_eq!(conn.stream().written, input);
    }

    #[test]
    fn test_clean_eof() {
        let mut conn = connection(vec![Step::Data(frames(&[b"bye"])), Step::Eof]);

        read(&mut conn).unwrap();

        assert_eq!(conn.state(), ConnState::Closing);
        assert_eq!(conn.stream().written, frames(&[b"bye"]));
    }

    #[test]
    fn test_eof_with_partial_frame() {
        let input = frames(&[b"truncated"]);
        let mut conn = connection(vec![Step::Data(input[..6].to_vec()), Step::Eof]);

        let err = read(&mut conn).unwrap_err();

        assert!(matches!(err, ConnectionError::UnexpectedEof { buffered: 6 }));
        assert_eq!(conn.state(), ConnState::Closing);
    }

    #[test]
    fn test_interrupted_read_is_retried() {
        let input = frames(&[b"again"]);
        let mut conn = connection(vec![Step::Interrupted, Step::Data(input.clone())]);

        read(&mut conn).unwrap();

        assert_eq!(conn.stream().written, input);
    }

    #[test]
    fn test_backpressure_moves_to_writing_and_resumes() {
        let input = frames(&[b"one", b"two", b"three"]);
        let mut conn = connection(vec![Step::Data(input.clone()), Step::WouldBlock]);
        conn.stream_mut().write_budget = 0;

        read(&mut conn).unwrap();
        assert_eq!(conn.state(), ConnState::Writing);
        assert!(conn.pending_write() > 0);
        // Only the first frame was handled; the rest waits in the read buffer.
        assert_eq!(conn.buffered(), input.len() - frames(&[b"one"]).len());

        // Readable events are ignored while writing.
        read(&mut conn).unwrap();
        assert_eq!(conn.state(), ConnState::Writing);

        conn.stream_mut().write_budget = usize::MAX;
        conn.write_ready().unwrap();
        assert_eq!(conn.state(), ConnState::Reading);
        assert_eq!(conn.stream().written, frames(&[b"one"]));

        // Back in reading: the buffered frames are handled without new input.
        read(&mut conn).unwrap();
        assert_eq!(conn.state(), ConnState::Reading);
        assert_eq!(conn.stream().written, input);
        assert_eq!(conn.buffered(), 0);
    }

    #[test]
    fn test_partial_writes() {
        let input = frames(&[b"0123456789", b"abcdefghij"]);
        let mut conn = connection(vec![Step::Data(input.clone())]);
        conn.stream_mut().max_write = 3;
        conn.stream_mut().write_budget = 5;

        read(&mut conn).unwrap();
        assert_eq!(conn.state(), ConnState::Writing);
        assert_eq!(conn.stream().written.len(), 5);

        conn.stream_mut().write_budget = usize::MAX;
        conn.write_ready().unwrap();
        assert_eq!(conn.state(), ConnState::Reading);

        read(&mut conn).unwrap();
        assert_eq!(conn.stream().written, input);
    }

    #[test]
    fn test_oversized_response_closes() {
        let mut conn = connection(vec![Step::Data(frames(&[b"x"]))]);
        let mut scratch = Vec::new();

        let err = conn
            .read_ready(&codec(), &mut scratch, |_, out| {
                out.resize(MAX_PAYLOAD + 1, b'x')
            })
            .unwrap_err();

        assert!(matches!(err, ConnectionError::Frame(FrameError::TooLarge { .. })));
        assert_eq!(conn.state(), ConnState::Closing);
    }

    #[test]
    fn test_write_error_closes() {
        struct BrokenPipe;

        impl Read for BrokenPipe {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::ErrorKind::WouldBlock.into())
            }
        }

        impl Write for BrokenPipe {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Err(io::ErrorKind::BrokenPipe.into())
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let size = codec().max_frame_len();
        let mut conn = Connection::new(BrokenPipe, vec![0; size], vec![0; size]);
        conn.state = ConnState::Writing;
        conn.wbuf.filled = 4;

        assert!(matches!(conn.write_ready(), Err(ConnectionError::Io(_))));
        assert_eq!(conn.state(), ConnState::Closing);

        // Terminal: further readiness is ignored.
        assert!(conn.write_ready().is_ok());
        let mut scratch = Vec::new();
        assert!(conn.read_ready(&codec(), &mut scratch, echo).is_ok());
        assert_eq!(conn.state(), ConnState::Closing);
    }
}
