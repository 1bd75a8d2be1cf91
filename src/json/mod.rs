//! Proto3 canonical JSON: a streaming, schema-aware parser and printer.
//!
//! The parser is a push-down automaton fed bytes through the
//! [`BytesSink`](crate::handlers::BytesSink) interface; it may suspend at any
//! byte boundary and resumes on the next chunk. It emits handler events, so
//! piping it into a [`MessageSink`](crate::fill::MessageSink) yields
//! JSON-to-message conversion and, combined with the wire encoder,
//! JSON-to-binary. The printer is a [`Sink`](crate::handlers::Sink) driven by
//! the message walker.

pub mod parser;
pub mod printer;
pub(crate) mod wkt;

pub use parser::Parser;
pub use printer::Printer;

use crate::arena::Arena;
use crate::base::Msg;
use crate::defs::{MsgId, SymTab};
use crate::fill::MessageSink;
use crate::handlers::put_buffer;
use crate::layout::LayoutCache;
use crate::status::{Error, ErrorKind, Status};

/// Parse one JSON document into `msg`, which must have been created for
/// `def`'s layout.
pub fn parse_into(
    json: &[u8],
    st: &SymTab,
    def: MsgId,
    cache: &LayoutCache,
    msg: Msg,
    arena: &mut Arena,
    ignore_unknown: bool,
) -> Result<(), Error> {
    let sink = MessageSink::new(st, cache, def, msg, arena)?;
    let mut p = Parser::new(st, cache, def, sink, ignore_unknown);
    if !put_buffer(&mut p, json) {
        return Err(p.take_error());
    }
    Ok(())
}

/// Print `msg` as canonical JSON. `preserve_proto_fieldnames` selects
/// underscored proto names over lowerCamelCase.
pub fn print(
    msg: Msg,
    st: &SymTab,
    def: MsgId,
    cache: &LayoutCache,
    preserve_proto_fieldnames: bool,
) -> Result<String, Error> {
    let mut out = Vec::new();
    let mut status = Status::new();
    {
        let mut pr = Printer::new(st, cache, def, preserve_proto_fieldnames, &mut out);
        if !crate::visit::visit(msg, st, def, cache, &mut pr, &mut status) {
            if let Some(e) = pr.take_error() {
                return Err(e);
            }
            return Err(status
                .to_error()
                .unwrap_or_else(|| Error::new(ErrorKind::InvalidInput, "print cancelled")));
        }
    }
    String::from_utf8(out).map_err(|_| Error::new(ErrorKind::InvalidInput, "non-UTF-8 output"))
}

/// JSON bytes straight to wire bytes.
pub fn json_to_binary(
    json: &[u8],
    st: &SymTab,
    def: MsgId,
    cache: &LayoutCache,
    ignore_unknown: bool,
) -> Result<Vec<u8>, Error> {
    let mut arena = Arena::new(crate::global_alloc());
    let lid = cache.load(st, def)?;
    let layout = cache.get(lid);
    let msg = Msg::new(&layout, &mut arena)?;
    parse_into(json, st, def, cache, msg, &mut arena, ignore_unknown)?;
    crate::encoding::encode_to_vec(msg, cache, lid, &mut arena)
}

/// Wire bytes straight to JSON.
pub fn binary_to_json(
    bytes: &[u8],
    st: &SymTab,
    def: MsgId,
    cache: &LayoutCache,
    preserve_proto_fieldnames: bool,
) -> Result<String, Error> {
    let mut arena = Arena::new(crate::global_alloc());
    let lid = cache.load(st, def)?;
    let layout = cache.get(lid);
    let msg = Msg::new(&layout, &mut arena)?;
    crate::decoding::decode(bytes, msg, cache, lid, &mut arena)?;
    print(msg, st, def, cache, preserve_proto_fieldnames)
}
