//! JSON printer: a [`Sink`] that writes canonical proto3 JSON to a bytes
//! sink as it is driven by the message walker.
//!
//! Formatting policy: 64-bit integers and 64-bit map keys are quoted,
//! 32-bit integers are not; bytes are standard base64; enums print their
//! symbolic name when known, the raw number otherwise; `Infinity` and `NaN`
//! are quoted strings; field names are lowerCamelCase unless
//! `preserve_proto_fieldnames` was set at construction. Well-known types
//! print their special JSON forms. Unknown fields are dropped.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::arena::Arena;
use crate::base::Msg;
use crate::defs::{FieldDef, MsgId, SymTab, WellKnown};
use crate::handlers::{BytesSink, Sink};
use crate::json::wkt;
use crate::layout::{CType, LayoutCache};
use crate::status::{Error, ErrorKind, Status};

enum FrameKind {
    // Regular message: braces plus `"name": value` members.
    Msg,
    // JSON array for a repeated field; brackets owned by the seq events
    // unless a ListValue shell printed them.
    Seq { owns: bool },
    // JSON object for a map field; braces owned likewise (a Struct shell may
    // own them instead).
    Map { owns: bool, entry: MsgId },
    MapEntry { entry: MsgId, key_done: bool, value_done: bool },
    Wrapper { wkt: WellKnown, printed: bool },
    ValueMsg { printed: bool },
    StructShell,
    ListShell,
    DurTs { dur: bool, seconds: i64, nanos: i32 },
    Mask { paths: Vec<String> },
    AnyMsg { url: Vec<u8>, val: Vec<u8> },
}

struct Frame {
    kind: FrameKind,
    first: bool,
}

pub struct Printer<'s, 'o> {
    st: &'s SymTab,
    cache: &'s LayoutCache,
    out: &'o mut dyn BytesSink,
    preserve_names: bool,
    root: MsgId,
    frames: Vec<Frame>,
    sbuf: Vec<u8>,
    err: Option<Error>,
}

impl<'s, 'o> Printer<'s, 'o> {
    pub fn new(
        st: &'s SymTab,
        cache: &'s LayoutCache,
        root: MsgId,
        preserve_proto_fieldnames: bool,
        out: &'o mut dyn BytesSink,
    ) -> Self {
        Printer {
            st,
            cache,
            out,
            preserve_names: preserve_proto_fieldnames,
            root,
            frames: Vec::new(),
            sbuf: Vec::new(),
            err: None,
        }
    }

    pub fn take_error(&mut self) -> Option<Error> {
        self.err.take()
    }

    fn fail(&mut self, e: Error) -> bool {
        if self.err.is_none() {
            self.err = Some(e);
        }
        false
    }

    fn w(&mut self, bytes: &[u8]) -> bool {
        if self.out.put_buf(bytes) != bytes.len() {
            return self.fail(Error::new(ErrorKind::OutOfMemory, "output sink refused bytes"));
        }
        true
    }

    fn ws(&mut self, s: &str) -> bool {
        self.w(s.as_bytes())
    }

    // Comma separation within the current container.
    fn sep(&mut self) -> bool {
        let first = match self.frames.last_mut() {
            Some(fr) => {
                let was = fr.first;
                fr.first = false;
                was
            }
            None => true,
        };
        if first {
            true
        } else {
            self.w(b",")
        }
    }

    fn putkey(&mut self, f: &FieldDef) -> bool {
        if !self.sep() {
            return false;
        }
        let name = if self.preserve_names {
            &f.name
        } else {
            &f.json_name
        };
        self.w(b"\"") && self.ws(name) && self.w(b"\":")
    }

    fn quoted_escaped(&mut self, bytes: &[u8]) -> bool {
        if !self.w(b"\"") {
            return false;
        }
        let mut ok = true;
        for &b in bytes {
            ok = ok
                && match b {
                    b'"' => self.w(b"\\\""),
                    b'\\' => self.w(b"\\\\"),
                    0x08 => self.w(b"\\b"),
                    0x0C => self.w(b"\\f"),
                    b'\n' => self.w(b"\\n"),
                    b'\r' => self.w(b"\\r"),
                    b'\t' => self.w(b"\\t"),
                    b if b < 0x20 => self.ws(&format!("\\u{:04x}", b)),
                    _ => self.w(&[b]),
                };
            if !ok {
                break;
            }
        }
        ok && self.w(b"\"")
    }

    fn fmt_double(v: f64) -> String {
        if v.is_nan() {
            "\"NaN\"".to_owned()
        } else if v == f64::INFINITY {
            "\"Infinity\"".to_owned()
        } else if v == f64::NEG_INFINITY {
            "\"-Infinity\"".to_owned()
        } else {
            format!("{v}")
        }
    }

    // Scalar JSON text for the value of `f`.
    fn scalar_text(&self, f: &FieldDef, v: ScalarVal) -> String {
        match v {
            ScalarVal::I32(n) => {
                if f.descriptortype.ctype() == CType::Enum {
                    if let Some(eid) = f.enum_subdef() {
                        if let Some(name) = self.st.enm(eid).name_by_value(n) {
                            return format!("\"{name}\"");
                        }
                    }
                    return format!("{n}");
                }
                format!("{n}")
            }
            ScalarVal::U32(n) => format!("{n}"),
            ScalarVal::I64(n) => format!("\"{n}\""),
            ScalarVal::U64(n) => format!("\"{n}\""),
            ScalarVal::F32(x) => Self::fmt_double(x as f64),
            ScalarVal::F64(x) => Self::fmt_double(x),
            ScalarVal::Bool(b) => (if b { "true" } else { "false" }).to_owned(),
        }
    }

    // Map keys are always JSON strings.
    fn key_text(v: ScalarVal) -> String {
        match v {
            ScalarVal::I32(n) => format!("\"{n}\""),
            ScalarVal::U32(n) => format!("\"{n}\""),
            ScalarVal::I64(n) => format!("\"{n}\""),
            ScalarVal::U64(n) => format!("\"{n}\""),
            ScalarVal::Bool(b) => format!("\"{b}\""),
            _ => "\"\"".to_owned(),
        }
    }

    fn put_scalar(&mut self, f: &FieldDef, v: ScalarVal) -> bool {
        let Some(top) = self.frames.last_mut() else {
            return false;
        };
        match &mut top.kind {
            FrameKind::Msg => {
                let text = self.scalar_text(f, v);
                self.putkey(f) && self.ws(&text)
            }
            FrameKind::Seq { .. } => {
                let text = self.scalar_text(f, v);
                self.sep() && self.ws(&text)
            }
            FrameKind::Wrapper { printed, .. } => {
                *printed = true;
                let text = self.scalar_text(f, v);
                self.ws(&text)
            }
            FrameKind::ValueMsg { printed } => {
                *printed = true;
                let text = match f.number {
                    1 => "null".to_owned(), // null_value
                    2 => match v {
                        ScalarVal::F64(x) => Self::fmt_double(x),
                        _ => return false,
                    },
                    4 => self.scalar_text(f, v),
                    _ => return false,
                };
                self.ws(&text)
            }
            FrameKind::DurTs { seconds, nanos, .. } => {
                match (f.number, v) {
                    (1, ScalarVal::I64(s)) => *seconds = s,
                    (2, ScalarVal::I32(n)) => *nanos = n,
                    _ => {}
                }
                true
            }
            FrameKind::MapEntry {
                entry,
                key_done,
                value_done,
            } => {
                let entry = *entry;
                if f.number == 1 {
                    *key_done = true;
                    let text = Self::key_text(v);
                    self.ws(&text) && self.w(b":")
                } else {
                    *value_done = true;
                    let text = self.scalar_text(f, v);
                    let ok = self.default_key_if_needed(entry);
                    ok && self.ws(&text)
                }
            }
            _ => true,
        }
    }

    // A map entry whose key was a default value gets its key printed here,
    // just before the value.
    fn default_key_if_needed(&mut self, entry: MsgId) -> bool {
        let needs = match self.frames.last_mut() {
            Some(Frame {
                kind: FrameKind::MapEntry { key_done, .. },
                ..
            }) => {
                let n = !*key_done;
                *key_done = true;
                n
            }
            _ => false,
        };
        if !needs {
            return true;
        }
        let text = self.default_key_text(entry);
        self.ws(&text) && self.w(b":")
    }

    fn default_key_text(&self, entry: MsgId) -> String {
        let Some((kf, _)) = self.st.map_entry_fields(entry) else {
            return "\"\"".to_owned();
        };
        match self.st.field(kf).descriptortype.ctype() {
            CType::String => "\"\"".to_owned(),
            CType::Bool => "\"false\"".to_owned(),
            _ => "\"0\"".to_owned(),
        }
    }

    fn default_value_text(&self, entry: MsgId) -> String {
        let Some((_, vf)) = self.st.map_entry_fields(entry) else {
            return "null".to_owned();
        };
        let f = self.st.field(vf);
        match f.descriptortype.ctype() {
            CType::String | CType::Bytes => "\"\"".to_owned(),
            CType::Bool => "false".to_owned(),
            CType::Int64 | CType::UInt64 => "\"0\"".to_owned(),
            CType::Float | CType::Double => "0".to_owned(),
            CType::Enum => {
                if let Some(eid) = f.enum_subdef() {
                    if let Some(name) = self.st.enm(eid).name_by_value(self.st.enm(eid).default) {
                        return format!("\"{name}\"");
                    }
                }
                "0".to_owned()
            }
            CType::Message => match f.msg_subdef().map(|m| self.st.msg(m).wkt) {
                Some(WellKnown::Value) => "null".to_owned(),
                _ => "{}".to_owned(),
            },
            _ => "0".to_owned(),
        }
    }

    // Separator / key emission before a nested value starts, based on the
    // containing frame.
    fn begin_nested(&mut self, f: &FieldDef) -> Result<Option<MsgId>, ()> {
        // Returns Some(entry) when the nested value is a map entry.
        let Some(top) = self.frames.last_mut() else {
            return Err(());
        };
        match &mut top.kind {
            FrameKind::Msg => {
                if !self.putkey(f) {
                    return Err(());
                }
                Ok(None)
            }
            FrameKind::Seq { .. } => {
                if !self.sep() {
                    return Err(());
                }
                Ok(None)
            }
            FrameKind::Map { entry, .. } => {
                let entry = *entry;
                if !self.sep() {
                    return Err(());
                }
                Ok(Some(entry))
            }
            FrameKind::MapEntry { entry, value_done, .. } => {
                *value_done = true;
                let entry = *entry;
                if !self.default_key_if_needed(entry) {
                    return Err(());
                }
                Ok(None)
            }
            FrameKind::ValueMsg { printed } => {
                *printed = true;
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    fn enter_msg_frame(&mut self, def: MsgId) -> bool {
        let wkt = self.st.msg(def).wkt;
        let kind = match wkt {
            WellKnown::Duration => FrameKind::DurTs {
                dur: true,
                seconds: 0,
                nanos: 0,
            },
            WellKnown::Timestamp => FrameKind::DurTs {
                dur: false,
                seconds: 0,
                nanos: 0,
            },
            WellKnown::FieldMask => FrameKind::Mask { paths: Vec::new() },
            WellKnown::Value => FrameKind::ValueMsg { printed: false },
            WellKnown::Struct => {
                if !self.w(b"{") {
                    return false;
                }
                FrameKind::StructShell
            }
            WellKnown::ListValue => {
                if !self.w(b"[") {
                    return false;
                }
                FrameKind::ListShell
            }
            WellKnown::Any => FrameKind::AnyMsg {
                url: Vec::new(),
                val: Vec::new(),
            },
            w if w.is_wrapper() => FrameKind::Wrapper {
                wkt: w,
                printed: false,
            },
            _ => {
                if !self.w(b"{") {
                    return false;
                }
                FrameKind::Msg
            }
        };
        self.frames.push(Frame { kind, first: true });
        true
    }

    fn exit_frame(&mut self) -> bool {
        let Some(fr) = self.frames.pop() else {
            return false;
        };
        match fr.kind {
            FrameKind::Msg => self.w(b"}"),
            FrameKind::StructShell => self.w(b"}"),
            FrameKind::ListShell => self.w(b"]"),
            FrameKind::Wrapper { wkt, printed } => {
                if printed {
                    true
                } else {
                    let default = match wkt {
                        WellKnown::StringValue | WellKnown::BytesValue => "\"\"",
                        WellKnown::BoolValue => "false",
                        _ => "0",
                    };
                    self.ws(default)
                }
            }
            FrameKind::ValueMsg { printed } => printed || self.ws("null"),
            FrameKind::DurTs { dur, seconds, nanos } => {
                let text = if dur {
                    wkt::format_duration(seconds, nanos)
                } else {
                    wkt::format_timestamp(seconds, nanos)
                };
                match text {
                    Ok(t) => self.w(b"\"") && self.ws(&t) && self.w(b"\""),
                    Err(e) => self.fail(e),
                }
            }
            FrameKind::Mask { paths } => {
                let joined = paths
                    .iter()
                    .map(|p| wkt::snake_to_camel(p))
                    .collect::<Vec<_>>()
                    .join(",");
                self.w(b"\"") && self.ws(&joined) && self.w(b"\"")
            }
            FrameKind::AnyMsg { url, val } => self.print_any(&url, &val),
            FrameKind::MapEntry {
                entry,
                key_done,
                value_done,
            } => {
                let mut ok = true;
                if !key_done {
                    let text = self.default_key_text(entry);
                    ok = self.ws(&text) && self.w(b":");
                }
                if ok && !value_done {
                    let text = self.default_value_text(entry);
                    ok = self.ws(&text);
                }
                ok
            }
            FrameKind::Seq { .. } | FrameKind::Map { .. } => false,
        }
    }

    fn print_any(&mut self, url: &[u8], val: &[u8]) -> bool {
        let url_str = match core::str::from_utf8(url) {
            Ok(s) => s,
            Err(_) => return self.fail(Error::new(ErrorKind::InvalidInput, "bad Any type_url")),
        };
        if !(self.w(b"{\"@type\":") && self.quoted_escaped(url)) {
            return false;
        }
        if url_str.is_empty() && val.is_empty() {
            // Empty Any: only possible as {"@type":""}; print as empty object.
            return self.w(b"}");
        }
        let type_name = url_str.rsplit('/').next().unwrap_or(url_str);
        let Some(payload_def) = self.st.lookup_msg(type_name) else {
            return self.fail(Error::new(
                ErrorKind::Unresolved,
                format!("unknown type in Any: {type_name}"),
            ));
        };
        let printed = (|| -> Result<String, Error> {
            let mut arena = Arena::new(crate::global_alloc());
            let lid = self.cache.load(self.st, payload_def)?;
            let layout = self.cache.get(lid);
            let pmsg = Msg::new(&layout, &mut arena)?;
            crate::decoding::decode(val, pmsg, self.cache, lid, &mut arena)?;
            crate::json::print(pmsg, self.st, payload_def, self.cache, self.preserve_names)
        })();
        let printed = match printed {
            Ok(p) => p,
            Err(e) => return self.fail(e),
        };
        if self.st.msg(payload_def).wkt != WellKnown::Unspecified {
            self.w(b",\"value\":") && self.ws(&printed) && self.w(b"}")
        } else {
            let inner = printed
                .strip_prefix('{')
                .and_then(|p| p.strip_suffix('}'))
                .unwrap_or("");
            let mut ok = true;
            if !inner.is_empty() {
                ok = self.w(b",") && self.ws(inner);
            }
            ok && self.w(b"}")
        }
    }
}

#[derive(Clone, Copy)]
enum ScalarVal {
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Bool(bool),
}

impl Sink for Printer<'_, '_> {
    fn take_error(&mut self) -> Option<Error> {
        self.err.take()
    }

    fn start_msg(&mut self) -> bool {
        self.enter_msg_frame(self.root)
    }

    fn end_msg(&mut self, _status: &mut Status) -> bool {
        self.exit_frame() && self.frames.is_empty()
    }

    fn put_int32(&mut self, f: &FieldDef, v: i32) -> bool {
        self.put_scalar(f, ScalarVal::I32(v))
    }

    fn put_int64(&mut self, f: &FieldDef, v: i64) -> bool {
        self.put_scalar(f, ScalarVal::I64(v))
    }

    fn put_uint32(&mut self, f: &FieldDef, v: u32) -> bool {
        self.put_scalar(f, ScalarVal::U32(v))
    }

    fn put_uint64(&mut self, f: &FieldDef, v: u64) -> bool {
        self.put_scalar(f, ScalarVal::U64(v))
    }

    fn put_float(&mut self, f: &FieldDef, v: f32) -> bool {
        self.put_scalar(f, ScalarVal::F32(v))
    }

    fn put_double(&mut self, f: &FieldDef, v: f64) -> bool {
        self.put_scalar(f, ScalarVal::F64(v))
    }

    fn put_bool(&mut self, f: &FieldDef, v: bool) -> bool {
        self.put_scalar(f, ScalarVal::Bool(v))
    }

    fn start_str(&mut self, _f: &FieldDef, size_hint: usize) -> bool {
        self.sbuf.clear();
        self.sbuf.reserve(size_hint);
        true
    }

    fn put_str(&mut self, _f: &FieldDef, chunk: &[u8]) -> bool {
        self.sbuf.extend_from_slice(chunk);
        true
    }

    fn end_str(&mut self, f: &FieldDef) -> bool {
        let bytes = core::mem::take(&mut self.sbuf);
        let Some(top) = self.frames.last_mut() else {
            return false;
        };
        match &mut top.kind {
            FrameKind::Msg => {
                if !self.putkey(f) {
                    return false;
                }
                self.str_value(f, &bytes)
            }
            FrameKind::Seq { .. } => {
                if !self.sep() {
                    return false;
                }
                self.str_value(f, &bytes)
            }
            FrameKind::Wrapper { printed, .. } => {
                *printed = true;
                self.str_value(f, &bytes)
            }
            FrameKind::ValueMsg { printed } => {
                *printed = true;
                self.quoted_escaped(&bytes)
            }
            FrameKind::Mask { paths } => {
                paths.push(String::from_utf8_lossy(&bytes).into_owned());
                true
            }
            FrameKind::AnyMsg { url, val } => {
                if f.number == 1 {
                    *url = bytes;
                } else {
                    *val = bytes;
                }
                true
            }
            FrameKind::MapEntry {
                entry,
                key_done,
                value_done,
            } => {
                let entry = *entry;
                if f.number == 1 {
                    *key_done = true;
                    self.quoted_escaped(&bytes) && self.w(b":")
                } else {
                    *value_done = true;
                    self.default_key_if_needed(entry) && self.str_value(f, &bytes)
                }
            }
            _ => true,
        }
    }

    fn start_seq(&mut self, f: &FieldDef) -> bool {
        // Struct and ListValue shells already printed their own brackets.
        if let Some(Frame {
            kind: FrameKind::StructShell,
            ..
        }) = self.frames.last()
        {
            let entry = f.msg_subdef().unwrap_or_default();
            self.frames.push(Frame {
                kind: FrameKind::Map { owns: false, entry },
                first: true,
            });
            return true;
        }
        if let Some(Frame {
            kind: FrameKind::ListShell,
            ..
        }) = self.frames.last()
        {
            self.frames.push(Frame {
                kind: FrameKind::Seq { owns: false },
                first: true,
            });
            return true;
        }
        if self.st.field_is_map(f) {
            if !self.putkey(f) || !self.w(b"{") {
                return false;
            }
            let entry = f.msg_subdef().unwrap();
            self.frames.push(Frame {
                kind: FrameKind::Map { owns: true, entry },
                first: true,
            });
        } else {
            let keyed = match self.frames.last() {
                Some(Frame {
                    kind: FrameKind::Msg,
                    ..
                }) => self.putkey(f),
                _ => self.sep(),
            };
            if !keyed || !self.w(b"[") {
                return false;
            }
            self.frames.push(Frame {
                kind: FrameKind::Seq { owns: true },
                first: true,
            });
        }
        true
    }

    fn end_seq(&mut self, _f: &FieldDef) -> bool {
        let Some(fr) = self.frames.pop() else {
            return false;
        };
        match fr.kind {
            FrameKind::Seq { owns } => !owns || self.w(b"]"),
            FrameKind::Map { owns, .. } => !owns || self.w(b"}"),
            _ => false,
        }
    }

    fn start_submsg(&mut self, f: &FieldDef) -> bool {
        let entry = match self.begin_nested(f) {
            Ok(e) => e,
            Err(()) => return false,
        };
        if let Some(entry) = entry {
            // Map entry; key and value events fill it in.
            self.frames.push(Frame {
                kind: FrameKind::MapEntry {
                    entry,
                    key_done: false,
                    value_done: false,
                },
                first: true,
            });
            return true;
        }
        let Some(sub) = f.msg_subdef() else {
            return false;
        };
        self.enter_msg_frame(sub)
    }

    fn end_submsg(&mut self, _f: &FieldDef) -> bool {
        self.exit_frame()
    }
}

impl Printer<'_, '_> {
    fn str_value(&mut self, f: &FieldDef, bytes: &[u8]) -> bool {
        match f.descriptortype.ctype() {
            CType::Bytes => {
                let enc = BASE64.encode(bytes);
                self.w(b"\"") && self.ws(&enc) && self.w(b"\"")
            }
            _ => self.quoted_escaped(bytes),
        }
    }
}
