//! Non-blocking buffered socket.
//!
//! Owns a stream plus internal read and write buffers. `fill` and `write`
//! move bytes between caller buffers and the internal buffers; `flush`
//! drains the internal write buffer to the stream. Each returns a tri-state
//! result so the caller knows whether to proceed, wait for the next
//! readiness notification, or tear the connection down.
//!
//! Error taxonomy: EAGAIN/EWOULDBLOCK is backpressure (`Incomplete`), a
//! zero-byte read or a connection-reset class error is peer closure
//! (`Closed`), anything else is an unexpected OS fault and propagates as an
//! `Err` for the dispatch loop to treat as fatal.

use std::io::{self, Read, Write};

use crate::buffer::Buffer;

/// Internal read/write buffer size.
const IO_BUFFER_BYTES: usize = 64 * 1024;

/// Result of a `fill` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FillStatus {
    /// The destination buffer was fully populated.
    Complete,
    /// The socket would block before the destination was full; wait for the
    /// next readable notification and call again.
    Incomplete,
    /// The peer closed or reset the connection.
    Closed,
}

/// Result of a `write` or `flush` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlushStatus {
    Complete,
    /// The socket would block with buffered output still pending; wait for
    /// the next writable notification and call again.
    Incomplete,
    Closed,
}

/// A stream with internal buffering and partial-I/O accounting.
///
/// The write buffer is either accumulating caller bytes or being drained to
/// the stream (`flushing_in_progress`), never both at once. A stalled flush
/// is resumed before any new bytes are accepted.
pub struct BufferedSocket<S> {
    stream: S,
    read_buffer: Buffer,
    write_buffer: Buffer,
    flushing_in_progress: bool,
}

fn is_connection_reset(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

impl<S: Read + Write> BufferedSocket<S> {
    pub fn new(stream: S) -> BufferedSocket<S> {
        let mut read_buffer = Buffer::new(IO_BUFFER_BYTES);
        // The read buffer starts in read mode with nothing to read.
        read_buffer.flip();
        BufferedSocket {
            stream,
            read_buffer,
            write_buffer: Buffer::new(IO_BUFFER_BYTES),
            flushing_in_progress: false,
        }
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Copy bytes into `dest` until it is full, drawing from the internal
    /// read buffer and refilling it from the socket as needed.
    pub fn fill(&mut self, dest: &mut Buffer) -> io::Result<FillStatus> {
        while dest.remaining() > 0 {
            dest.fill_from(&mut self.read_buffer);
            if self.read_buffer.remaining() == 0 {
                match self.stream.read(self.read_buffer.storage_mut()) {
                    Ok(0) => return Ok(FillStatus::Closed),
                    Ok(n) => {
                        self.read_buffer.set_position(0);
                        self.read_buffer.set_limit(n);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) if is_connection_reset(&e) => return Ok(FillStatus::Closed),
                    Err(e) => return Err(e),
                }
            }
        }

        if dest.remaining() == 0 {
            Ok(FillStatus::Complete)
        } else {
            Ok(FillStatus::Incomplete)
        }
    }

    /// Copy `src` into the internal write buffer, flushing whenever it
    /// fills. An unfinished flush from an earlier call is resumed first so
    /// bytes are never reordered.
    pub fn write(&mut self, src: &mut Buffer) -> io::Result<FlushStatus> {
        if self.flushing_in_progress {
            let status = self.flush()?;
            if status != FlushStatus::Complete {
                return Ok(status);
            }
        }

        while src.remaining() > 0 {
            self.write_buffer.fill_from(src);
            if self.write_buffer.remaining() == 0 {
                let status = self.flush()?;
                if status != FlushStatus::Complete {
                    return Ok(status);
                }
            }
        }

        Ok(FlushStatus::Complete)
    }

    /// Drain the internal write buffer to the socket. Partial sends advance
    /// the buffer's position by exactly what the OS accepted, so a stalled
    /// flush resumes where it left off.
    pub fn flush(&mut self) -> io::Result<FlushStatus> {
        if !self.flushing_in_progress {
            self.write_buffer.flip();
            self.flushing_in_progress = true;
        }

        while self.write_buffer.remaining() > 0 {
            match self.stream.write(self.write_buffer.readable()) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket accepted zero bytes",
                    ))
                }
                Ok(n) => {
                    let pos = self.write_buffer.position();
                    self.write_buffer.set_position(pos + n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                // An outbound connect still in progress reports not-yet-
                // connected; the connect completion will fire writable.
                Err(e) if e.kind() == io::ErrorKind::NotConnected => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_connection_reset(&e) => return Ok(FlushStatus::Closed),
                Err(e) => return Err(e),
            }
        }

        if self.write_buffer.remaining() == 0 {
            self.write_buffer.clear();
            self.flushing_in_progress = false;
            Ok(FlushStatus::Complete)
        } else {
            Ok(FlushStatus::Incomplete)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Deterministic stream: reads pop scripted chunks (empty script means
    /// EAGAIN, an empty chunk means EOF); writes are capped by per-call
    /// quotas (missing quota means EAGAIN).
    struct ScriptedStream {
        reads: VecDeque<Vec<u8>>,
        write_quotas: VecDeque<usize>,
        written: Vec<u8>,
    }

    impl ScriptedStream {
        fn new() -> ScriptedStream {
            ScriptedStream {
                reads: VecDeque::new(),
                write_quotas: VecDeque::new(),
                written: Vec::new(),
            }
        }
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                None => Err(io::Error::new(io::ErrorKind::WouldBlock, "eagain")),
                Some(chunk) => {
                    assert!(chunk.len() <= buf.len());
                    buf[..chunk.len()].copy_from_slice(&chunk);
                    Ok(chunk.len())
                }
            }
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            match self.write_quotas.pop_front() {
                None => Err(io::Error::new(io::ErrorKind::WouldBlock, "eagain")),
                Some(quota) => {
                    let n = quota.min(buf.len());
                    self.written.extend_from_slice(&buf[..n]);
                    Ok(n)
                }
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn fill_complete_in_one_receive() {
        let mut stream = ScriptedStream::new();
        stream.reads.push_back(vec![1, 2, 3, 4]);
        let mut sock = BufferedSocket::new(stream);

        let mut dest = Buffer::new(4);
        assert_eq!(sock.fill(&mut dest).unwrap(), FillStatus::Complete);
        dest.flip();
        assert_eq!(dest.readable(), &[1, 2, 3, 4]);
    }

    #[test]
    fn fill_incomplete_then_resumes_across_chunks() {
        // Bytes arrive one at a time across many "readiness notifications";
        // the final contents must match a single-chunk delivery.
        let mut sock = BufferedSocket::new(ScriptedStream::new());
        let mut dest = Buffer::new(4);

        for (i, byte) in [0xAAu8, 0xBB, 0xCC, 0xDD].iter().enumerate() {
            sock.stream_mut().reads.push_back(vec![*byte]);
            let status = sock.fill(&mut dest).unwrap();
            if i < 3 {
                assert_eq!(status, FillStatus::Incomplete);
            } else {
                assert_eq!(status, FillStatus::Complete);
            }
        }

        dest.flip();
        assert_eq!(dest.readable(), &[0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn fill_leaves_surplus_for_next_call() {
        // One receive carries a full field plus the start of the next; the
        // surplus must come back on the following fill.
        let mut stream = ScriptedStream::new();
        stream.reads.push_back(vec![1, 2, 3, 4, 5, 6]);
        let mut sock = BufferedSocket::new(stream);

        let mut first = Buffer::new(4);
        assert_eq!(sock.fill(&mut first).unwrap(), FillStatus::Complete);

        let mut second = Buffer::new(2);
        assert_eq!(sock.fill(&mut second).unwrap(), FillStatus::Complete);
        second.flip();
        assert_eq!(second.readable(), &[5, 6]);
    }

    #[test]
    fn fill_reports_closed_on_zero_byte_read() {
        let mut stream = ScriptedStream::new();
        stream.reads.push_back(vec![]);
        let mut sock = BufferedSocket::new(stream);

        let mut dest = Buffer::new(4);
        assert_eq!(sock.fill(&mut dest).unwrap(), FillStatus::Closed);
    }

    #[test]
    fn fill_propagates_unexpected_errors() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::Other, "bad fd"))
            }
        }
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                unreachable!()
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut sock = BufferedSocket::new(Broken);
        let mut dest = Buffer::new(1);
        assert!(sock.fill(&mut dest).is_err());
    }

    #[test]
    fn flush_resumes_across_partial_sends_without_loss_or_duplication() {
        let payload: Vec<u8> = (0u8..200).collect();

        let mut sock = BufferedSocket::new(ScriptedStream::new());
        let mut src = Buffer::new(payload.len());
        src.put_bytes(&payload);
        src.flip();

        // No quota yet: the bytes land in the internal buffer and the
        // flush stalls immediately.
        assert_eq!(sock.write(&mut src).unwrap(), FlushStatus::Complete);
        assert_eq!(sock.flush().unwrap(), FlushStatus::Incomplete);

        // Each call accepts a small fixed number of bytes.
        loop {
            sock.stream_mut().write_quotas.push_back(13);
            match sock.flush().unwrap() {
                FlushStatus::Complete => break,
                FlushStatus::Incomplete => continue,
                FlushStatus::Closed => panic!("unexpected close"),
            }
        }

        assert_eq!(sock.stream_mut().written, payload);
    }

    #[test]
    fn write_queues_multiple_buffers_in_order() {
        let mut sock = BufferedSocket::new(ScriptedStream::new());

        for chunk in [&b"abc"[..], &b"defg"[..], &b"h"[..]] {
            let mut src = Buffer::new(chunk.len());
            src.put_bytes(chunk);
            src.flip();
            assert_eq!(sock.write(&mut src).unwrap(), FlushStatus::Complete);
        }

        sock.stream_mut().write_quotas.push_back(usize::MAX);
        assert_eq!(sock.flush().unwrap(), FlushStatus::Complete);
        assert_eq!(sock.stream_mut().written, b"abcdefgh");
    }

    #[test]
    fn flush_reports_closed_on_reset() {
        struct Resetting;
        impl Read for Resetting {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                unreachable!()
            }
        }
        impl Write for Resetting {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut sock = BufferedSocket::new(Resetting);
        let mut src = Buffer::new(3);
        src.put_bytes(b"xyz");
        src.flip();
        assert_eq!(sock.write(&mut src).unwrap(), FlushStatus::Complete);
        assert_eq!(sock.flush().unwrap(), FlushStatus::Closed);
    }
}
