//! Streaming JSON parser.
//!
//! A byte-driven push-down automaton: bytes arrive through the
//! [`BytesSink`] interface, may stop at any boundary, and resume on the next
//! chunk. The parser is schema-aware: every value is interpreted against the
//! field it lands in, including the well-known-type special forms, and emits
//! handler events against its output [`Sink`].
//!
//! Values whose text may straddle chunk boundaries (member names, numbers,
//! strings, the raw text of `Any` payload members) are accumulated in a
//! scratch buffer and processed when the closing delimiter arrives, so the
//! emitted event trace does not depend on how the input was chunked.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::debug;

use crate::arena::Arena;
use crate::base::Msg;
use crate::defs::{FieldDef, FieldId, MsgId, SymTab, WellKnown};
use crate::fill::MessageSink;
use crate::handlers::{put_buffer, BytesSink, Sink};
use crate::json::wkt;
use crate::layout::{CType, LayoutCache};
use crate::status::{Error, ErrorKind, Status};

/// Maximum frame depth, shared with the wire decoder.
pub const MAX_DEPTH: usize = 64;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Tok {
    ValueStart,
    ArrValOrEnd,
    ObjFirstKey,
    ObjKey,
    ObjColon,
    ObjNext,
    ArrNext,
    Str,
    StrEsc,
    StrHex,
    Number,
    Literal,
    Done,
}

enum MemberKind {
    Field,
    UnknownSkip,
    MapKey(Vec<u8>),
    AnyType,
    AnyMember(String),
}

struct AnyState {
    field: Option<FieldId>,
    members: Vec<(String, Vec<u8>)>,
    type_url: Option<String>,
}

enum FrameKind {
    Object {
        msg: MsgId,
        field: Option<FieldId>,
    },
    Seq {
        elem: FieldId,
    },
    MapObj {
        map_field: FieldId,
        entry: MsgId,
        in_value: bool,
    },
    AnyObj(AnyState),
}

struct Frame {
    kind: FrameKind,
    // Submessage brackets to close, innermost first, when this frame ends.
    close_chain: Vec<FieldId>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum RawKind {
    Unset,
    Container,
    StrTok,
    Scalar,
}

// Raw mode consumes one complete JSON value without tokenizing it: either
// skipping it (unknown members) or capturing its text (Any payload members).
struct Raw {
    name: Option<String>,
    buf: Vec<u8>,
    capture: bool,
    kind: RawKind,
    depth: u32,
    in_str: bool,
    esc: bool,
}

enum Ctx {
    Root,
    Field { f: FieldId, elem: bool },
}

pub struct Parser<'s, S: Sink> {
    st: &'s SymTab,
    cache: &'s LayoutCache,
    sink: S,
    root: MsgId,
    ignore_unknown: bool,
    status: Status,
    err: Option<Error>,
    offset: usize,
    started: bool,
    finished: bool,
    tok: Tok,
    str_is_name: bool,
    any_type_pending: bool,
    scratch: Vec<u8>,
    hex: u32,
    hex_n: u8,
    member: Option<MemberKind>,
    frames: Vec<Frame>,
    raw: Option<Raw>,
}

fn is_ws(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r')
}

fn bad(msg: impl Into<String>) -> Error {
    Error::new(ErrorKind::InvalidInput, msg)
}

impl<'s, S: Sink> Parser<'s, S> {
    pub fn new(
        st: &'s SymTab,
        cache: &'s LayoutCache,
        root: MsgId,
        sink: S,
        ignore_unknown: bool,
    ) -> Self {
        Parser {
            st,
            cache,
            sink,
            root,
            ignore_unknown,
            status: Status::new(),
            err: None,
            offset: 0,
            started: false,
            finished: false,
            tok: Tok::ValueStart,
            str_is_name: false,
            any_type_pending: false,
            scratch: Vec::new(),
            hex: 0,
            hex_n: 0,
            member: None,
            frames: Vec::new(),
            raw: None,
        }
    }

    /// Operation status; holds the error after a failed parse.
    pub fn status(&self) -> &Status {
        &self.status
    }

    /// Byte offset of the last known-good position.
    pub fn error_offset(&self) -> usize {
        self.offset
    }

    pub fn take_error(&mut self) -> Error {
        self.err
            .take()
            .unwrap_or_else(|| bad("incomplete JSON document"))
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    fn fail(&mut self, e: Error) {
        debug!("JSON parse error at byte {}: {}", self.offset, e.message);
        let e = Error::new(e.kind, format!("{} (at byte {})", e.message, self.offset));
        self.status.set_error(e.kind, &e.message);
        self.err = Some(e);
    }

    fn handler_err(&mut self) -> Error {
        self.sink
            .take_error()
            .unwrap_or_else(|| bad("handler rejected value"))
    }

    // --- emit helpers -----------------------------------------------------

    fn emit_start_submsg(&mut self, f: &FieldDef) -> Result<(), Error> {
        if self.sink.start_submsg(f) {
            Ok(())
        } else {
            Err(self.handler_err())
        }
    }

    fn emit_end_submsg(&mut self, f: &FieldDef) -> Result<(), Error> {
        if self.sink.end_submsg(f) {
            Ok(())
        } else {
            Err(self.handler_err())
        }
    }

    fn emit_str(&mut self, f: &FieldDef, bytes: &[u8]) -> Result<(), Error> {
        if self.sink.start_str(f, bytes.len())
            && self.sink.put_str(f, bytes)
            && self.sink.end_str(f)
        {
            Ok(())
        } else {
            Err(self.handler_err())
        }
    }

    fn check(&mut self, ok: bool) -> Result<(), Error> {
        if ok {
            Ok(())
        } else {
            Err(self.handler_err())
        }
    }

    fn wrapped(
        &mut self,
        wrap: Option<&FieldDef>,
        inner: impl FnOnce(&mut Self) -> Result<(), Error>,
    ) -> Result<(), Error> {
        if let Some(f) = wrap {
            self.emit_start_submsg(f)?;
        }
        inner(self)?;
        if let Some(f) = wrap {
            self.emit_end_submsg(f)?;
        }
        Ok(())
    }

    fn field_def(&self, id: FieldId) -> &'s FieldDef {
        self.st.field(id)
    }

    fn wkt_field(&self, m: MsgId, number: u32) -> Result<&'s FieldDef, Error> {
        self.st
            .msg(m)
            .field_by_number(number)
            .map(|fid| self.st.field(fid))
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::SchemaViolation,
                    "malformed well-known type descriptor",
                )
            })
    }

    // --- byte pump --------------------------------------------------------

    fn ensure_started(&mut self) -> Result<(), Error> {
        if !self.started {
            self.started = true;
            if !self.sink.start_msg() {
                return Err(self.handler_err());
            }
        }
        Ok(())
    }

    fn step(&mut self, b: u8) -> Result<(), Error> {
        if self.raw.is_some() {
            return self.raw_step(b);
        }
        match self.tok {
            Tok::Done => {
                if is_ws(b) {
                    Ok(())
                } else {
                    Err(bad("trailing bytes after document"))
                }
            }
            Tok::ValueStart => self.begin_value(b),
            Tok::ArrValOrEnd => {
                if is_ws(b) {
                    Ok(())
                } else if b == b']' {
                    self.close_bracket()
                } else {
                    self.begin_value(b)
                }
            }
            Tok::ObjFirstKey => {
                if is_ws(b) {
                    Ok(())
                } else if b == b'}' {
                    self.close_brace()
                } else if b == b'"' {
                    self.begin_name();
                    Ok(())
                } else {
                    Err(bad("expected member name or '}'"))
                }
            }
            Tok::ObjKey => {
                if is_ws(b) {
                    Ok(())
                } else if b == b'"' {
                    self.begin_name();
                    Ok(())
                } else {
                    Err(bad("expected member name"))
                }
            }
            Tok::ObjColon => {
                if is_ws(b) {
                    Ok(())
                } else if b == b':' {
                    self.after_colon()
                } else {
                    Err(bad("expected ':'"))
                }
            }
            Tok::ObjNext => {
                if is_ws(b) {
                    Ok(())
                } else if b == b',' {
                    self.tok = Tok::ObjKey;
                    Ok(())
                } else if b == b'}' {
                    self.close_brace()
                } else {
                    Err(bad("expected ',' or '}'"))
                }
            }
            Tok::ArrNext => {
                if is_ws(b) {
                    Ok(())
                } else if b == b',' {
                    self.tok = Tok::ValueStart;
                    Ok(())
                } else if b == b']' {
                    self.close_bracket()
                } else {
                    Err(bad("expected ',' or ']'"))
                }
            }
            Tok::Str | Tok::StrEsc | Tok::StrHex => self.str_step(b),
            Tok::Number => {
                if matches!(b, b'0'..=b'9' | b'+' | b'-' | b'.' | b'e' | b'E') {
                    self.scratch.push(b);
                    Ok(())
                } else {
                    self.end_number()?;
                    self.step(b)
                }
            }
            Tok::Literal => {
                if b.is_ascii_alphabetic() {
                    self.scratch.push(b);
                    Ok(())
                } else {
                    self.end_literal()?;
                    self.step(b)
                }
            }
        }
    }

    fn begin_name(&mut self) {
        self.tok = Tok::Str;
        self.str_is_name = true;
        self.scratch.clear();
    }

    fn begin_value(&mut self, b: u8) -> Result<(), Error> {
        if is_ws(b) {
            return Ok(());
        }
        match b {
            b'{' => self.open_brace(),
            b'[' => self.open_bracket(),
            b'"' => {
                if !self.any_type_pending {
                    self.check_token_ctx()?;
                }
                self.tok = Tok::Str;
                self.str_is_name = false;
                self.scratch.clear();
                Ok(())
            }
            b'-' | b'0'..=b'9' => {
                self.check_token_ctx()?;
                self.tok = Tok::Number;
                self.scratch.clear();
                self.scratch.push(b);
                Ok(())
            }
            b't' | b'f' | b'n' => {
                self.check_token_ctx()?;
                self.tok = Tok::Literal;
                self.scratch.clear();
                self.scratch.push(b);
                Ok(())
            }
            _ => Err(bad("unexpected character at value start")),
        }
    }

    fn value_ctx(&self) -> Result<Ctx, Error> {
        match self.frames.last() {
            None => Ok(Ctx::Root),
            Some(fr) => match &fr.kind {
                FrameKind::Object { field: Some(f), .. } => Ok(Ctx::Field {
                    f: *f,
                    elem: false,
                }),
                FrameKind::Seq { elem } => Ok(Ctx::Field {
                    f: *elem,
                    elem: true,
                }),
                FrameKind::MapObj {
                    entry,
                    in_value: true,
                    ..
                } => {
                    let (_, v) = self
                        .st
                        .map_entry_fields(*entry)
                        .ok_or_else(|| bad("malformed map entry"))?;
                    Ok(Ctx::Field { f: v, elem: true })
                }
                _ => Err(bad("value in unexpected position")),
            },
        }
    }

    // Scalar tokens are invalid where an array is required.
    fn check_token_ctx(&self) -> Result<(), Error> {
        if let Ctx::Field { f, elem: false } = self.value_ctx()? {
            if self.field_def(f).is_repeated() {
                return Err(bad("expected array for repeated field"));
            }
        }
        Ok(())
    }

    fn check_depth(&self) -> Result<(), Error> {
        if self.frames.len() >= MAX_DEPTH {
            return Err(Error::new(ErrorKind::RangeError, "JSON nesting too deep"));
        }
        Ok(())
    }

    // --- containers -------------------------------------------------------

    fn open_brace(&mut self) -> Result<(), Error> {
        self.check_depth()?;
        match self.value_ctx()? {
            Ctx::Root => {
                let wkt = self.st.msg(self.root).wkt;
                match wkt {
                    WellKnown::Struct => self.open_struct(self.root, Vec::new()),
                    WellKnown::Value => self.open_value_object(self.root, Vec::new()),
                    WellKnown::Any => {
                        self.frames.push(Frame {
                            kind: FrameKind::AnyObj(AnyState {
                                field: None,
                                members: Vec::new(),
                                type_url: None,
                            }),
                            close_chain: Vec::new(),
                        });
                        self.tok = Tok::ObjFirstKey;
                        Ok(())
                    }
                    WellKnown::ListValue => Err(bad("expected array for ListValue")),
                    w if w != WellKnown::Unspecified => Err(bad("expected scalar value")),
                    _ => {
                        self.frames.push(Frame {
                            kind: FrameKind::Object {
                                msg: self.root,
                                field: None,
                            },
                            close_chain: Vec::new(),
                        });
                        self.tok = Tok::ObjFirstKey;
                        Ok(())
                    }
                }
            }
            Ctx::Field { f, elem } => {
                let fd = self.field_def(f);
                if fd.is_repeated() && !elem {
                    if self.st.field_is_map(fd) {
                        { let ok = self.sink.start_seq(fd); self.check(ok) }?;
                        let entry = fd.msg_subdef().unwrap();
                        self.frames.push(Frame {
                            kind: FrameKind::MapObj {
                                map_field: f,
                                entry,
                                in_value: false,
                            },
                            close_chain: Vec::new(),
                        });
                        self.tok = Tok::ObjFirstKey;
                        return Ok(());
                    }
                    return Err(bad("expected array for repeated field"));
                }
                let Some(sub) = fd.msg_subdef() else {
                    return Err(bad("unexpected object value"));
                };
                match self.st.msg(sub).wkt {
                    WellKnown::Unspecified => {
                        self.emit_start_submsg(fd)?;
                        self.frames.push(Frame {
                            kind: FrameKind::Object {
                                msg: sub,
                                field: None,
                            },
                            close_chain: vec![f],
                        });
                        self.tok = Tok::ObjFirstKey;
                        Ok(())
                    }
                    WellKnown::Struct => {
                        self.emit_start_submsg(fd)?;
                        self.open_struct(sub, vec![f])
                    }
                    WellKnown::Value => {
                        self.emit_start_submsg(fd)?;
                        self.open_value_object(sub, vec![f])
                    }
                    WellKnown::Any => {
                        self.frames.push(Frame {
                            kind: FrameKind::AnyObj(AnyState {
                                field: Some(f),
                                members: Vec::new(),
                                type_url: None,
                            }),
                            close_chain: Vec::new(),
                        });
                        self.tok = Tok::ObjFirstKey;
                        Ok(())
                    }
                    _ => Err(bad("object is not a valid value for this type")),
                }
            }
        }
    }

    fn open_struct(&mut self, struct_def: MsgId, chain: Vec<FieldId>) -> Result<(), Error> {
        let fields_fd = self.wkt_field(struct_def, 1)?;
        { let ok = self.sink.start_seq(fields_fd); self.check(ok) }?;
        let entry = fields_fd
            .msg_subdef()
            .ok_or_else(|| bad("malformed Struct descriptor"))?;
        self.frames.push(Frame {
            kind: FrameKind::MapObj {
                map_field: self.st.msg(struct_def).field_by_number(1).unwrap(),
                entry,
                in_value: false,
            },
            close_chain: chain,
        });
        self.tok = Tok::ObjFirstKey;
        Ok(())
    }

    fn open_value_object(&mut self, value_def: MsgId, mut chain: Vec<FieldId>) -> Result<(), Error> {
        let sv = self.wkt_field(value_def, 5)?; // struct_value
        self.emit_start_submsg(sv)?;
        let struct_def = sv
            .msg_subdef()
            .ok_or_else(|| bad("malformed Value descriptor"))?;
        chain.insert(0, self.st.msg(value_def).field_by_number(5).unwrap());
        self.open_struct(struct_def, chain)
    }

    fn open_bracket(&mut self) -> Result<(), Error> {
        self.check_depth()?;
        match self.value_ctx()? {
            Ctx::Root => {
                let wkt = self.st.msg(self.root).wkt;
                match wkt {
                    WellKnown::ListValue => self.open_listvalue(self.root, Vec::new()),
                    WellKnown::Value => self.open_value_list(self.root, Vec::new()),
                    _ => Err(bad("unexpected array")),
                }
            }
            Ctx::Field { f, elem } => {
                let fd = self.field_def(f);
                if fd.is_repeated() && !elem {
                    if self.st.field_is_map(fd) {
                        return Err(bad("expected object for map field"));
                    }
                    { let ok = self.sink.start_seq(fd); self.check(ok) }?;
                    self.frames.push(Frame {
                        kind: FrameKind::Seq { elem: f },
                        close_chain: Vec::new(),
                    });
                    self.tok = Tok::ArrValOrEnd;
                    return Ok(());
                }
                let sub = fd.msg_subdef().ok_or_else(|| bad("unexpected array"))?;
                match self.st.msg(sub).wkt {
                    WellKnown::ListValue => {
                        self.emit_start_submsg(fd)?;
                        self.open_listvalue(sub, vec![f])
                    }
                    WellKnown::Value => {
                        self.emit_start_submsg(fd)?;
                        self.open_value_list(sub, vec![f])
                    }
                    _ => Err(bad("unexpected array")),
                }
            }
        }
    }

    fn open_listvalue(&mut self, lv_def: MsgId, chain: Vec<FieldId>) -> Result<(), Error> {
        let values_fd = self.wkt_field(lv_def, 1)?;
        { let ok = self.sink.start_seq(values_fd); self.check(ok) }?;
        self.frames.push(Frame {
            kind: FrameKind::Seq {
                elem: self.st.msg(lv_def).field_by_number(1).unwrap(),
            },
            close_chain: chain,
        });
        self.tok = Tok::ArrValOrEnd;
        Ok(())
    }

    fn open_value_list(&mut self, value_def: MsgId, mut chain: Vec<FieldId>) -> Result<(), Error> {
        let lv = self.wkt_field(value_def, 6)?; // list_value
        self.emit_start_submsg(lv)?;
        let lv_def = lv
            .msg_subdef()
            .ok_or_else(|| bad("malformed Value descriptor"))?;
        chain.insert(0, self.st.msg(value_def).field_by_number(6).unwrap());
        self.open_listvalue(lv_def, chain)
    }

    fn close_chain(&mut self, chain: Vec<FieldId>) -> Result<(), Error> {
        for f in chain {
            let fd = self.field_def(f);
            self.emit_end_submsg(fd)?;
        }
        Ok(())
    }

    fn close_brace(&mut self) -> Result<(), Error> {
        let fr = self.frames.pop().ok_or_else(|| bad("unbalanced '}'"))?;
        match fr.kind {
            FrameKind::Object { .. } => {
                self.close_chain(fr.close_chain)?;
                self.value_done()
            }
            FrameKind::MapObj {
                map_field,
                in_value,
                ..
            } => {
                if in_value {
                    return Err(bad("map entry missing value"));
                }
                let fd = self.field_def(map_field);
                { let ok = self.sink.end_seq(fd); self.check(ok) }?;
                self.close_chain(fr.close_chain)?;
                self.value_done()
            }
            FrameKind::AnyObj(state) => {
                self.finalize_any(state)?;
                self.close_chain(fr.close_chain)?;
                self.value_done()
            }
            FrameKind::Seq { .. } => Err(bad("unbalanced '}'")),
        }
    }

    fn close_bracket(&mut self) -> Result<(), Error> {
        let fr = self.frames.pop().ok_or_else(|| bad("unbalanced ']'"))?;
        match fr.kind {
            FrameKind::Seq { elem } => {
                let fd = self.field_def(elem);
                { let ok = self.sink.end_seq(fd); self.check(ok) }?;
                self.close_chain(fr.close_chain)?;
                self.value_done()
            }
            _ => Err(bad("unbalanced ']'")),
        }
    }

    // A complete value just landed; update the enclosing container.
    fn value_done(&mut self) -> Result<(), Error> {
        let mut close_entry = None;
        match self.frames.last_mut() {
            None => {
                let mut status = core::mem::take(&mut self.status);
                let ok = self.sink.end_msg(&mut status);
                self.status = status;
                if !ok {
                    return Err(self.handler_err());
                }
                if !self.status.is_ok() {
                    return Err(Error::new(self.status.kind(), self.status.message()));
                }
                self.finished = true;
                self.tok = Tok::Done;
                return Ok(());
            }
            Some(fr) => match &mut fr.kind {
                FrameKind::Object { field, .. } => {
                    *field = None;
                    self.tok = Tok::ObjNext;
                }
                FrameKind::Seq { .. } => {
                    self.tok = Tok::ArrNext;
                }
                FrameKind::MapObj {
                    map_field,
                    in_value,
                    ..
                } => {
                    *in_value = false;
                    close_entry = Some(*map_field);
                    self.tok = Tok::ObjNext;
                }
                FrameKind::AnyObj(_) => {
                    self.tok = Tok::ObjNext;
                }
            },
        }
        if let Some(mf) = close_entry {
            let fd = self.field_def(mf);
            self.emit_end_submsg(fd)?;
        }
        Ok(())
    }

    // --- member names -----------------------------------------------------

    fn member_name_done(&mut self) -> Result<(), Error> {
        let name = core::str::from_utf8(&self.scratch)
            .map_err(|_| bad("member name is not UTF-8"))?
            .to_owned();
        let kind = match self.frames.last_mut() {
            Some(Frame {
                kind: FrameKind::Object { msg, field },
                ..
            }) => {
                let m = self.st.msg(*msg);
                match m.field_by_json_name(&name) {
                    Some(fid) => {
                        *field = Some(fid);
                        MemberKind::Field
                    }
                    None if self.ignore_unknown => MemberKind::UnknownSkip,
                    None => {
                        return Err(bad(format!(
                            "unknown field '{name}' in {}",
                            m.full_name
                        )))
                    }
                }
            }
            Some(Frame {
                kind: FrameKind::MapObj { .. },
                ..
            }) => MemberKind::MapKey(self.scratch.clone()),
            Some(Frame {
                kind: FrameKind::AnyObj(_),
                ..
            }) => {
                if name == "@type" {
                    MemberKind::AnyType
                } else {
                    MemberKind::AnyMember(name)
                }
            }
            _ => return Err(bad("member name in unexpected position")),
        };
        self.member = Some(kind);
        self.tok = Tok::ObjColon;
        Ok(())
    }

    fn after_colon(&mut self) -> Result<(), Error> {
        match self.member.take().ok_or_else(|| bad("stray ':'"))? {
            MemberKind::Field => {
                self.tok = Tok::ValueStart;
                Ok(())
            }
            MemberKind::UnknownSkip => {
                self.raw = Some(Raw {
                    name: None,
                    buf: Vec::new(),
                    capture: false,
                    kind: RawKind::Unset,
                    depth: 0,
                    in_str: false,
                    esc: false,
                });
                Ok(())
            }
            MemberKind::MapKey(key) => {
                self.begin_map_entry(&key)?;
                self.tok = Tok::ValueStart;
                Ok(())
            }
            MemberKind::AnyType => {
                self.any_type_pending = true;
                self.tok = Tok::ValueStart;
                Ok(())
            }
            MemberKind::AnyMember(name) => {
                self.raw = Some(Raw {
                    name: Some(name),
                    buf: Vec::new(),
                    capture: true,
                    kind: RawKind::Unset,
                    depth: 0,
                    in_str: false,
                    esc: false,
                });
                Ok(())
            }
        }
    }

    fn begin_map_entry(&mut self, key: &[u8]) -> Result<(), Error> {
        let (map_field, entry) = match self.frames.last_mut() {
            Some(Frame {
                kind:
                    FrameKind::MapObj {
                        map_field,
                        entry,
                        in_value,
                    },
                ..
            }) => {
                *in_value = true;
                (*map_field, *entry)
            }
            _ => return Err(bad("map key in unexpected position")),
        };
        let map_fd = self.field_def(map_field);
        self.emit_start_submsg(map_fd)?;

        let (kf, _) = self
            .st
            .map_entry_fields(entry)
            .ok_or_else(|| bad("malformed map entry"))?;
        let kfd = self.field_def(kf);
        let text = core::str::from_utf8(key).map_err(|_| bad("map key is not UTF-8"))?;
        match kfd.descriptortype.ctype() {
            CType::String => self.emit_str(kfd, key),
            CType::Bool => match text {
                "true" => { let ok = self.sink.put_bool(kfd, true); self.check(ok) },
                "false" => { let ok = self.sink.put_bool(kfd, false); self.check(ok) },
                _ => Err(bad("bad boolean map key")),
            },
            CType::Int32 | CType::Int64 | CType::UInt32 | CType::UInt64 => {
                self.emit_number(kfd, text, true)
            }
            _ => Err(bad("unsupported map key type")),
        }
    }

    // --- strings ----------------------------------------------------------

    fn str_step(&mut self, b: u8) -> Result<(), Error> {
        match self.tok {
            Tok::Str => match b {
                b'"' => self.end_string(),
                b'\\' => {
                    self.tok = Tok::StrEsc;
                    Ok(())
                }
                _ => {
                    self.scratch.push(b);
                    Ok(())
                }
            },
            Tok::StrEsc => {
                let decoded = match b {
                    b'"' => b'"',
                    b'\\' => b'\\',
                    b'/' => b'/',
                    b'b' => 0x08,
                    b'f' => 0x0C,
                    b'n' => b'\n',
                    b'r' => b'\r',
                    b't' => b'\t',
                    b'u' => {
                        self.tok = Tok::StrHex;
                        self.hex = 0;
                        self.hex_n = 0;
                        return Ok(());
                    }
                    _ => return Err(bad("invalid escape character")),
                };
                self.scratch.push(decoded);
                self.tok = Tok::Str;
                Ok(())
            }
            Tok::StrHex => {
                let d = match b {
                    b'0'..=b'9' => b - b'0',
                    b'a'..=b'f' => b - b'a' + 10,
                    b'A'..=b'F' => b - b'A' + 10,
                    _ => return Err(bad("invalid hex digit in \\u escape")),
                };
                self.hex = self.hex * 16 + d as u32;
                self.hex_n += 1;
                if self.hex_n == 4 {
                    // Encoded directly to UTF-8 bytes; high surrogates are not
                    // paired.
                    let cp = self.hex;
                    if cp < 0x80 {
                        self.scratch.push(cp as u8);
                    } else if cp < 0x800 {
                        self.scratch.push(0xC0 | (cp >> 6) as u8);
                        self.scratch.push(0x80 | (cp & 0x3F) as u8);
                    } else {
                        self.scratch.push(0xE0 | (cp >> 12) as u8);
                        self.scratch.push(0x80 | ((cp >> 6) & 0x3F) as u8);
                        self.scratch.push(0x80 | (cp & 0x3F) as u8);
                    }
                    self.tok = Tok::Str;
                }
                Ok(())
            }
            _ => unreachable!(),
        }
    }

    fn end_string(&mut self) -> Result<(), Error> {
        if self.str_is_name {
            self.str_is_name = false;
            return self.member_name_done();
        }
        self.end_string_value()
    }

    fn end_string_value(&mut self) -> Result<(), Error> {
        if self.any_type_pending {
            self.any_type_pending = false;
            let url = core::str::from_utf8(&self.scratch)
                .map_err(|_| bad("@type is not UTF-8"))?
                .to_owned();
            match self.frames.last_mut() {
                Some(Frame {
                    kind: FrameKind::AnyObj(state),
                    ..
                }) => state.type_url = Some(url),
                _ => return Err(bad("@type outside Any")),
            }
            self.tok = Tok::ObjNext;
            return Ok(());
        }

        let text = core::mem::take(&mut self.scratch);
        match self.value_ctx()? {
            Ctx::Root => self.string_value_for_def(None, self.root, &text)?,
            Ctx::Field { f, .. } => {
                let fd = self.field_def(f);
                self.string_value_for_field(fd, &text)?;
            }
        }
        self.value_done()
    }

    fn string_value_for_field(&mut self, fd: &'s FieldDef, bytes: &[u8]) -> Result<(), Error> {
        match fd.descriptortype.ctype() {
            CType::String => self.emit_str(fd, bytes),
            CType::Bytes => {
                let decoded = BASE64
                    .decode(bytes)
                    .map_err(|_| bad("invalid base64 in bytes field"))?;
                self.emit_str(fd, &decoded)
            }
            CType::Enum => {
                let name = core::str::from_utf8(bytes).map_err(|_| bad("bad enum value"))?;
                let eid = fd
                    .enum_subdef()
                    .ok_or_else(|| bad("enum field without enum type"))?;
                let v = self
                    .st
                    .enm(eid)
                    .value_by_name(name)
                    .ok_or_else(|| bad(format!("unknown enum value '{name}'")))?;
                { let ok = self.sink.put_int32(fd, v); self.check(ok) }
            }
            CType::Int32 | CType::Int64 | CType::UInt32 | CType::UInt64 | CType::Float
            | CType::Double => {
                let text = core::str::from_utf8(bytes).map_err(|_| bad("bad number"))?;
                self.emit_number(fd, text, true)
            }
            CType::Bool => Err(bad("unexpected string for bool field")),
            CType::Message => {
                let sub = fd.msg_subdef().ok_or_else(|| bad("unexpected string"))?;
                self.string_value_for_def(Some(fd), sub, bytes)
            }
        }
    }

    fn string_value_for_def(
        &mut self,
        wrap: Option<&'s FieldDef>,
        def: MsgId,
        bytes: &[u8],
    ) -> Result<(), Error> {
        let wkt = self.st.msg(def).wkt;
        match wkt {
            WellKnown::StringValue => {
                let vf = self.wkt_field(def, 1)?;
                self.wrapped(wrap, |p| p.emit_str(vf, bytes))
            }
            WellKnown::BytesValue => {
                let vf = self.wkt_field(def, 1)?;
                let decoded = BASE64
                    .decode(bytes)
                    .map_err(|_| bad("invalid base64 in BytesValue"))?;
                self.wrapped(wrap, |p| p.emit_str(vf, &decoded))
            }
            WellKnown::DoubleValue
            | WellKnown::FloatValue
            | WellKnown::Int64Value
            | WellKnown::UInt64Value
            | WellKnown::Int32Value
            | WellKnown::UInt32Value => {
                let vf = self.wkt_field(def, 1)?;
                let text = core::str::from_utf8(bytes).map_err(|_| bad("bad number"))?;
                self.wrapped(wrap, |p| p.emit_number(vf, text, true))
            }
            WellKnown::Duration => {
                let text = core::str::from_utf8(bytes).map_err(|_| bad("bad duration"))?;
                let (seconds, nanos) = wkt::parse_duration(text)?;
                let sf = self.wkt_field(def, 1)?;
                let nf = self.wkt_field(def, 2)?;
                self.wrapped(wrap, |p| {
                    { let ok = p.sink.put_int64(sf, seconds); p.check(ok) }?;
                    { let ok = p.sink.put_int32(nf, nanos); p.check(ok) }
                })
            }
            WellKnown::Timestamp => {
                let text = core::str::from_utf8(bytes).map_err(|_| bad("bad timestamp"))?;
                let (seconds, nanos) = wkt::parse_timestamp(text)?;
                let sf = self.wkt_field(def, 1)?;
                let nf = self.wkt_field(def, 2)?;
                self.wrapped(wrap, |p| {
                    { let ok = p.sink.put_int64(sf, seconds); p.check(ok) }?;
                    { let ok = p.sink.put_int32(nf, nanos); p.check(ok) }
                })
            }
            WellKnown::FieldMask => {
                let text = core::str::from_utf8(bytes).map_err(|_| bad("bad field mask"))?;
                let paths: Vec<String> = if text.is_empty() {
                    Vec::new()
                } else {
                    text.split(',').map(wkt::camel_to_snake).collect()
                };
                let pf = self.wkt_field(def, 1)?;
                self.wrapped(wrap, |p| {
                    { let ok = p.sink.start_seq(pf); p.check(ok) }?;
                    for path in &paths {
                        p.emit_str(pf, path.as_bytes())?;
                    }
                    { let ok = p.sink.end_seq(pf); p.check(ok) }
                })
            }
            WellKnown::Value => {
                let svf = self.wkt_field(def, 3)?; // string_value
                self.wrapped(wrap, |p| p.emit_str(svf, bytes))
            }
            _ => Err(bad("unexpected string value")),
        }
    }

    // --- numbers ----------------------------------------------------------

    fn end_number(&mut self) -> Result<(), Error> {
        let text_bytes = core::mem::take(&mut self.scratch);
        let text = core::str::from_utf8(&text_bytes).map_err(|_| bad("bad number"))?;
        match self.value_ctx()? {
            Ctx::Root => self.number_value_for_def(None, self.root, text)?,
            Ctx::Field { f, .. } => {
                let fd = self.field_def(f);
                match fd.descriptortype.ctype() {
                    CType::Int32
                    | CType::Int64
                    | CType::UInt32
                    | CType::UInt64
                    | CType::Float
                    | CType::Double
                    | CType::Enum => self.emit_number(fd, text, false)?,
                    CType::Message => {
                        let sub = fd.msg_subdef().ok_or_else(|| bad("unexpected number"))?;
                        self.number_value_for_def(Some(fd), sub, text)?;
                    }
                    _ => return Err(bad("unexpected number value")),
                }
            }
        }
        self.value_done()
    }

    fn number_value_for_def(
        &mut self,
        wrap: Option<&'s FieldDef>,
        def: MsgId,
        text: &str,
    ) -> Result<(), Error> {
        match self.st.msg(def).wkt {
            WellKnown::DoubleValue
            | WellKnown::FloatValue
            | WellKnown::Int64Value
            | WellKnown::UInt64Value
            | WellKnown::Int32Value
            | WellKnown::UInt32Value => {
                let vf = self.wkt_field(def, 1)?;
                self.wrapped(wrap, |p| p.emit_number(vf, text, false))
            }
            WellKnown::Value => {
                let nf = self.wkt_field(def, 2)?; // number_value
                let v: f64 = text.parse().map_err(|_| bad("bad number"))?;
                self.wrapped(wrap, |p| { let ok = p.sink.put_double(nf, v); p.check(ok) })
            }
            _ => Err(bad("unexpected number value")),
        }
    }

    fn emit_number(&mut self, fd: &FieldDef, text: &str, quoted: bool) -> Result<(), Error> {
        match fd.descriptortype.ctype() {
            CType::Double => {
                let v = parse_float_text(text).ok_or_else(|| bad("bad double value"))?;
                { let ok = self.sink.put_double(fd, v); self.check(ok) }
            }
            CType::Float => {
                let v = parse_float_text(text).ok_or_else(|| bad("bad float value"))?;
                if v.is_finite() && (v > f32::MAX as f64 || v < f32::MIN as f64) {
                    return Err(Error::new(ErrorKind::RangeError, "float out of range"));
                }
                { let ok = self.sink.put_float(fd, v as f32); self.check(ok) }
            }
            CType::Int32 | CType::Enum => {
                let v = self.integer_value(text, quoted, i32::MIN as i128, i32::MAX as i128)?;
                { let ok = self.sink.put_int32(fd, v as i32); self.check(ok) }
            }
            CType::Int64 => {
                let v = self.integer_value(text, quoted, i64::MIN as i128, i64::MAX as i128)?;
                { let ok = self.sink.put_int64(fd, v as i64); self.check(ok) }
            }
            CType::UInt32 => {
                let v = self.integer_value(text, quoted, 0, u32::MAX as i128)?;
                { let ok = self.sink.put_uint32(fd, v as u32); self.check(ok) }
            }
            CType::UInt64 => {
                let v = self.integer_value(text, quoted, 0, u64::MAX as i128)?;
                { let ok = self.sink.put_uint64(fd, v as u64); self.check(ok) }
            }
            _ => Err(bad("field does not accept a number")),
        }
    }

    // Integer parsing: direct integer forms first (decimal, hex, octal); a
    // double fallback for unquoted values with no fractional part.
    fn integer_value(
        &self,
        text: &str,
        quoted: bool,
        min: i128,
        max: i128,
    ) -> Result<i128, Error> {
        if let Some(v) = parse_int_text(text) {
            if v < min || v > max {
                return Err(Error::new(ErrorKind::RangeError, "integer out of range"));
            }
            return Ok(v);
        }
        if quoted {
            return Err(bad("bad quoted integer"));
        }
        let d: f64 = text.parse().map_err(|_| bad("bad number"))?;
        if d.fract() != 0.0 {
            return Err(bad("expected integer, got fraction"));
        }
        if d < min as f64 || d > max as f64 {
            return Err(Error::new(ErrorKind::RangeError, "integer out of range"));
        }
        Ok(d as i128)
    }

    // --- literals ---------------------------------------------------------

    fn end_literal(&mut self) -> Result<(), Error> {
        let text = core::mem::take(&mut self.scratch);
        match text.as_slice() {
            b"true" => self.literal_bool(true)?,
            b"false" => self.literal_bool(false)?,
            b"null" => self.literal_null()?,
            _ => return Err(bad("invalid literal")),
        }
        self.value_done()
    }

    fn literal_bool(&mut self, v: bool) -> Result<(), Error> {
        let (wrap, def) = match self.value_ctx()? {
            Ctx::Root => (None, self.root),
            Ctx::Field { f, .. } => {
                let fd = self.field_def(f);
                match fd.descriptortype.ctype() {
                    CType::Bool => return { let ok = self.sink.put_bool(fd, v); self.check(ok) },
                    CType::Message => (Some(fd), fd.msg_subdef().unwrap()),
                    _ => return Err(bad("unexpected boolean value")),
                }
            }
        };
        match self.st.msg(def).wkt {
            WellKnown::BoolValue => {
                let vf = self.wkt_field(def, 1)?;
                self.wrapped(wrap, |p| { let ok = p.sink.put_bool(vf, v); p.check(ok) })
            }
            WellKnown::Value => {
                let bf = self.wkt_field(def, 4)?; // bool_value
                self.wrapped(wrap, |p| { let ok = p.sink.put_bool(bf, v); p.check(ok) })
            }
            _ => Err(bad("unexpected boolean value")),
        }
    }

    fn literal_null(&mut self) -> Result<(), Error> {
        let (wrap, def) = match self.value_ctx()? {
            Ctx::Root => (None, self.root),
            Ctx::Field { f, .. } => {
                let fd = self.field_def(f);
                match fd.msg_subdef() {
                    Some(sub) => (Some(fd), sub),
                    // null sets the field to its default: nothing to emit.
                    None => return Ok(()),
                }
            }
        };
        if self.st.msg(def).wkt == WellKnown::Value {
            let nf = self.wkt_field(def, 1)?; // null_value
            return self.wrapped(wrap, |p| { let ok = p.sink.put_int32(nf, 0); p.check(ok) });
        }
        Ok(())
    }

    // --- raw skip / capture -----------------------------------------------

    fn raw_step(&mut self, b: u8) -> Result<(), Error> {
        let raw = self.raw.as_mut().unwrap();
        if raw.kind == RawKind::Unset {
            if is_ws(b) {
                return Ok(());
            }
            raw.kind = match b {
                b'{' | b'[' => {
                    raw.depth = 1;
                    RawKind::Container
                }
                b'"' => {
                    raw.in_str = true;
                    RawKind::StrTok
                }
                b'-' | b'0'..=b'9' | b't' | b'f' | b'n' => RawKind::Scalar,
                _ => return Err(bad("unexpected character at value start")),
            };
            raw.buf.push(b);
            return Ok(());
        }
        match raw.kind {
            RawKind::Container => {
                if raw.in_str {
                    if raw.esc {
                        raw.esc = false;
                    } else if b == b'\\' {
                        raw.esc = true;
                    } else if b == b'"' {
                        raw.in_str = false;
                    }
                    raw.buf.push(b);
                    return Ok(());
                }
                match b {
                    b'"' => raw.in_str = true,
                    b'{' | b'[' => {
                        raw.depth += 1;
                        if raw.depth as usize > MAX_DEPTH {
                            return Err(Error::new(
                                ErrorKind::RangeError,
                                "JSON nesting too deep",
                            ));
                        }
                    }
                    b'}' | b']' => raw.depth -= 1,
                    _ => {}
                }
                raw.buf.push(b);
                if raw.depth == 0 {
                    return self.raw_done(None);
                }
                Ok(())
            }
            RawKind::StrTok => {
                raw.buf.push(b);
                if raw.esc {
                    raw.esc = false;
                } else if b == b'\\' {
                    raw.esc = true;
                } else if b == b'"' {
                    return self.raw_done(None);
                }
                Ok(())
            }
            RawKind::Scalar => {
                if is_ws(b) || matches!(b, b',' | b'}' | b']') {
                    return self.raw_done(Some(b));
                }
                raw.buf.push(b);
                Ok(())
            }
            RawKind::Unset => unreachable!(),
        }
    }

    fn raw_done(&mut self, reprocess: Option<u8>) -> Result<(), Error> {
        let raw = self.raw.take().unwrap();
        if raw.capture {
            match self.frames.last_mut() {
                Some(Frame {
                    kind: FrameKind::AnyObj(state),
                    ..
                }) => state.members.push((raw.name.unwrap(), raw.buf)),
                _ => return Err(bad("captured value outside Any")),
            }
        }
        self.tok = Tok::ObjNext;
        if let Some(b) = reprocess {
            self.step(b)?;
        }
        Ok(())
    }

    // --- Any --------------------------------------------------------------

    fn finalize_any(&mut self, state: AnyState) -> Result<(), Error> {
        let AnyState {
            field,
            members,
            type_url,
        } = state;
        let wrap_fd = field.map(|f| self.field_def(f));
        let any_def = match wrap_fd {
            Some(fd) => fd.msg_subdef().unwrap(),
            None => self.root,
        };

        let Some(url) = type_url else {
            if members.is_empty() {
                // Empty object parses to an empty Any.
                return self.wrapped(wrap_fd, |_| Ok(()));
            }
            return Err(Error::new(
                ErrorKind::Unresolved,
                "Any object is missing @type",
            ));
        };

        let type_name = url.rsplit('/').next().unwrap_or(&url);
        let payload_def = self.st.lookup_msg(type_name).ok_or_else(|| {
            Error::new(
                ErrorKind::Unresolved,
                format!("unknown type in Any: {type_name}"),
            )
        })?;
        let payload_wkt = self.st.msg(payload_def).wkt;

        let payload_json: Vec<u8> = if payload_wkt != WellKnown::Unspecified {
            // The payload of a well-known type is the single member "value".
            let mut value = None;
            for (name, raw) in members {
                if name == "value" && value.is_none() {
                    value = Some(raw);
                } else {
                    return Err(bad("unexpected member alongside well-known Any payload"));
                }
            }
            value.ok_or_else(|| bad("well-known Any payload is missing \"value\""))?
        } else {
            let mut doc = Vec::with_capacity(64);
            doc.push(b'{');
            for (i, (name, raw)) in members.iter().enumerate() {
                if i > 0 {
                    doc.push(b',');
                }
                doc.push(b'"');
                doc.extend_from_slice(name.as_bytes());
                doc.extend_from_slice(b"\":");
                doc.extend_from_slice(raw);
            }
            doc.push(b'}');
            doc
        };

        // Secondary pipeline: parse the payload into a scratch message and
        // binary-encode it.
        let wire = {
            let mut arena = Arena::new(crate::global_alloc());
            let lid = self.cache.load(self.st, payload_def)?;
            let layout = self.cache.get(lid);
            let pmsg = Msg::new(&layout, &mut arena)?;
            {
                let sink =
                    MessageSink::new(self.st, self.cache, payload_def, pmsg, &mut arena)?;
                let mut sub = Parser::new(self.st, self.cache, payload_def, sink, self.ignore_unknown);
                if !put_buffer(&mut sub, &payload_json) {
                    return Err(sub.take_error());
                }
            }
            crate::encoding::encode_to_vec(pmsg, self.cache, lid, &mut arena)?
        };

        let url_fd = self.wkt_field(any_def, 1)?;
        let val_fd = self.wkt_field(any_def, 2)?;
        self.wrapped(wrap_fd, |p| {
            p.emit_str(url_fd, url.as_bytes())?;
            p.emit_str(val_fd, &wire)
        })
    }
}

fn parse_float_text(text: &str) -> Option<f64> {
    match text {
        "NaN" => Some(f64::NAN),
        "Infinity" => Some(f64::INFINITY),
        "-Infinity" => Some(f64::NEG_INFINITY),
        _ => text.parse().ok(),
    }
}

// Decimal, hex (0x), and octal (leading 0) integer forms.
fn parse_int_text(text: &str) -> Option<i128> {
    let (neg, rest) = match text.strip_prefix('-') {
        Some(r) => (true, r),
        None => (false, text),
    };
    if rest.is_empty() {
        return None;
    }
    let mag: i128 = if let Some(hex) = rest.strip_prefix("0x").or_else(|| rest.strip_prefix("0X")) {
        i128::from_str_radix(hex, 16).ok()?
    } else if rest.len() > 1 && rest.starts_with('0') && rest.bytes().all(|b| b.is_ascii_digit()) {
        i128::from_str_radix(rest, 8).ok()?
    } else if rest.bytes().all(|b| b.is_ascii_digit()) {
        rest.parse().ok()?
    } else {
        return None;
    };
    Some(if neg { -mag } else { mag })
}

impl<S: Sink> BytesSink for Parser<'_, S> {
    fn start(&mut self, _size_hint: usize) -> bool {
        match self.ensure_started() {
            Ok(()) => true,
            Err(e) => {
                self.fail(e);
                false
            }
        }
    }

    fn put_buf(&mut self, buf: &[u8]) -> usize {
        if self.err.is_some() {
            return 0;
        }
        if let Err(e) = self.ensure_started() {
            self.fail(e);
            return 0;
        }
        for (i, &b) in buf.iter().enumerate() {
            if let Err(e) = self.step(b) {
                self.fail(e);
                return i;
            }
            self.offset += 1;
        }
        buf.len()
    }

    fn end(&mut self) -> bool {
        if self.err.is_some() {
            return false;
        }
        // A top-level number or literal can end at end of input.
        let flush = match self.tok {
            Tok::Number => self.end_number(),
            Tok::Literal => self.end_literal(),
            _ => Ok(()),
        };
        if let Err(e) = flush {
            self.fail(e);
            return false;
        }
        if !self.finished {
            self.fail(Error::new(ErrorKind::Truncated, "incomplete JSON document"));
            return false;
        }
        true
    }
}
