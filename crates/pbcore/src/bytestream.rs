//! Pull and push byte channels.
//!
//! A [`ByteSource`] is the pull side a decoder reads from; a [`ByteSink`] is
//! the push side an encoder writes into. Both are small object-safe traits
//! so concrete transports (memory, file, socket) stay out of this crate.
//!
//! The string operations traffic in [`bytes::Bytes`] so that a source which
//! already holds its data contiguously (memory-mapped, pre-buffered) can
//! hand the caller an *aliased* view instead of copying. Copying is the
//! fallback, never the default.

use bytes::{Bytes, BytesMut};

use crate::config::READ_CHUNK;
use crate::error::Error;

/// Pull side of a byte channel.
///
/// Implementations own a status slot (the last error observed) and an
/// end-of-stream flag. The two are independent: a source can fail before
/// reaching eof, and eof itself is never an error.
pub trait ByteSource {
    /// Reads up to `dst.len()` bytes into `dst`, returning how many were
    /// written. `Ok(0)` legitimately means "no progress right now" when
    /// [`eof`](Self::eof) is still false. On failure the source records the
    /// error in its status slot and returns it.
    fn read(&mut self, dst: &mut [u8]) -> Result<usize, Error>;

    /// Returns up to `max` bytes, preferring to alias the source's internal
    /// buffer over copying. An empty result with `eof()` still false means
    /// the source has nothing contiguous to alias; fall back to
    /// [`read`](Self::read).
    fn get_str(&mut self, max: usize) -> Result<Bytes, Error>;

    /// True once the stream is exhausted.
    fn eof(&self) -> bool;

    /// The last error observed, if any.
    fn status(&self) -> Option<&Error>;

    /// Reads the remainder of the stream into one contiguous string.
    ///
    /// Asks for one maximal [`get_str`](Self::get_str) first so a zero-copy
    /// source can alias its whole buffer, then falls back to copying
    /// [`read`](Self::read)s in [`READ_CHUNK`] increments until eof. The
    /// result is trimmed to the exact final length.
    fn get_full_str(&mut self) -> Result<Bytes, Error> {
        let head = self.get_str(usize::MAX)?;
        if self.eof() {
            // Aliasing fast path: the whole stream in one handoff.
            return Ok(head);
        }

        let mut buf = BytesMut::with_capacity(head.len() + READ_CHUNK);
        buf.extend_from_slice(&head);
        while !self.eof() {
            let start = buf.len();
            buf.resize(start + READ_CHUNK, 0);
            let n = self.read(&mut buf[start..])?;
            buf.truncate(start + n);
            // A source that returns 0 without reaching eof is yielding;
            // keep asking. Non-blocking sources should not be drained
            // through this method.
        }
        Ok(buf.freeze())
    }
}

/// Push side of a byte channel.
pub trait ByteSink {
    /// Writes up to `src.len()` bytes, returning how many were accepted.
    fn write(&mut self, src: &[u8]) -> Result<usize, Error>;

    /// Writes an entire string. Sinks that can take ownership of the buffer
    /// (queueing it, splicing it) should override this; the default loops
    /// [`write`](Self::write) until everything is accepted.
    fn put_str(&mut self, data: Bytes) -> Result<usize, Error> {
        let total = data.len();
        let mut rest = &data[..];
        while !rest.is_empty() {
            let n = self.write(rest)?;
            if n == 0 {
                return Err(Error::Io("sink accepted no bytes".to_owned()));
            }
            rest = &rest[n..];
        }
        Ok(total)
    }
}
