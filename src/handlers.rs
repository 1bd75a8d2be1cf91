//! The streaming event surface shared by every codec.
//!
//! Producers (the wire decoder driver, the JSON parser, the message walker)
//! emit a stream of typed events against a [`Sink`]; consumers (the message
//! builder, the JSON and text printers) implement it. Every method has a
//! success-returning default, so a consumer only implements the events it
//! cares about; a missing handler is a no-op.
//!
//! Event protocol, per message:
//!
//! - the top-level message is bracketed by `start_msg` / `end_msg`;
//! - a singular submessage field is bracketed by `start_submsg` /
//!   `end_submsg`;
//! - a repeated (or map) field is bracketed by `start_seq` / `end_seq`, with
//!   each element emitted as a scalar put, a string triple, or a submessage
//!   bracket on the same field;
//! - string and bytes values arrive as `start_str`, one or more `put_str`
//!   chunks, and `end_str`;
//! - preserved unknown fields arrive as raw tag-framed bytes via
//!   `put_unknown`.
//!
//! Returning `false` from any handler cancels the producing operation.

use crate::defs::FieldDef;
use crate::status::{Error, Status};

#[allow(unused_variables)]
pub trait Sink {
    /// The error behind the most recent `false` return, for sinks that can
    /// say more than "handler rejected".
    fn take_error(&mut self) -> Option<Error> {
        None
    }

    fn start_msg(&mut self) -> bool {
        true
    }
    fn end_msg(&mut self, status: &mut Status) -> bool {
        true
    }

    fn put_int32(&mut self, f: &FieldDef, v: i32) -> bool {
        true
    }
    fn put_int64(&mut self, f: &FieldDef, v: i64) -> bool {
        true
    }
    fn put_uint32(&mut self, f: &FieldDef, v: u32) -> bool {
        true
    }
    fn put_uint64(&mut self, f: &FieldDef, v: u64) -> bool {
        true
    }
    fn put_float(&mut self, f: &FieldDef, v: f32) -> bool {
        true
    }
    fn put_double(&mut self, f: &FieldDef, v: f64) -> bool {
        true
    }
    fn put_bool(&mut self, f: &FieldDef, v: bool) -> bool {
        true
    }

    fn start_str(&mut self, f: &FieldDef, size_hint: usize) -> bool {
        true
    }
    fn put_str(&mut self, f: &FieldDef, chunk: &[u8]) -> bool {
        true
    }
    fn end_str(&mut self, f: &FieldDef) -> bool {
        true
    }

    fn start_seq(&mut self, f: &FieldDef) -> bool {
        true
    }
    fn end_seq(&mut self, f: &FieldDef) -> bool {
        true
    }

    fn start_submsg(&mut self, f: &FieldDef) -> bool {
        true
    }
    fn end_submsg(&mut self, f: &FieldDef) -> bool {
        true
    }

    fn put_unknown(&mut self, raw: &[u8]) -> bool {
        true
    }
}

/// Streaming byte consumer; `put_buf` reports how many bytes it accepted, and
/// anything short of the full chunk means failure or suspension.
#[allow(unused_variables)]
pub trait BytesSink {
    fn start(&mut self, size_hint: usize) -> bool {
        true
    }
    fn put_buf(&mut self, buf: &[u8]) -> usize;
    fn end(&mut self) -> bool {
        true
    }
}

impl BytesSink for Vec<u8> {
    fn put_buf(&mut self, buf: &[u8]) -> usize {
        self.extend_from_slice(buf);
        buf.len()
    }
}

/// Push one contiguous buffer through a bytes sink.
pub fn put_buffer(sink: &mut dyn BytesSink, buf: &[u8]) -> bool {
    if !sink.start(buf.len()) {
        return false;
    }
    if sink.put_buf(buf) != buf.len() {
        return false;
    }
    sink.end()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Half(Vec<u8>);

    impl BytesSink for Half {
        fn put_buf(&mut self, buf: &[u8]) -> usize {
            // Accept only half, to exercise the short-write path.
            let n = buf.len() / 2;
            self.0.extend_from_slice(&buf[..n]);
            n
        }
    }

    #[test]
    fn put_buffer_detects_short_writes() {
        let mut ok = Vec::new();
        assert!(put_buffer(&mut ok, b"all of it"));
        assert_eq!(ok, b"all of it");

        let mut bad = Half(Vec::new());
        assert!(!put_buffer(&mut bad, b"too much"));
    }

    struct NoopSink;
    impl Sink for NoopSink {}

    #[test]
    fn default_handlers_succeed() {
        // A sink with no handlers accepts every event.
        let mut s = NoopSink;
        assert!(s.start_msg());
        assert!(s.put_unknown(b"\x08\x01"));
        let mut status = Status::new();
        assert!(s.end_msg(&mut status));
        assert!(status.is_ok());
    }
}
