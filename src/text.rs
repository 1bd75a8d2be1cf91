//! Protobuf text-format printer.
//!
//! A [`Sink`] that renders the event stream as `field: value` lines with
//! nested `field { ... }` blocks, or as a single space-separated line. The
//! interface mirrors the JSON printer: bind it to a message walker and
//! collect the output from a bytes sink.

use crate::defs::FieldDef;
use crate::handlers::{BytesSink, Sink};
use crate::layout::CType;
use crate::status::Status;

pub struct TextPrinter<'s, 'o> {
    st: &'s crate::defs::SymTab,
    out: &'o mut dyn BytesSink,
    single_line: bool,
    indent: usize,
    sbuf: Vec<u8>,
}

impl<'s, 'o> TextPrinter<'s, 'o> {
    pub fn new(
        st: &'s crate::defs::SymTab,
        single_line: bool,
        out: &'o mut dyn BytesSink,
    ) -> Self {
        TextPrinter {
            st,
            out,
            single_line,
            indent: 0,
            sbuf: Vec::new(),
        }
    }

    fn w(&mut self, bytes: &[u8]) -> bool {
        self.out.put_buf(bytes) == bytes.len()
    }

    fn ws(&mut self, s: &str) -> bool {
        self.w(s.as_bytes())
    }

    fn indent(&mut self) -> bool {
        if self.single_line {
            return true;
        }
        for _ in 0..self.indent {
            if !self.w(b"  ") {
                return false;
            }
        }
        true
    }

    fn endline(&mut self) -> bool {
        if self.single_line {
            self.w(b" ")
        } else {
            self.w(b"\n")
        }
    }

    fn field_value(&mut self, f: &FieldDef, value: &str) -> bool {
        self.indent() && self.ws(&f.name) && self.w(b": ") && self.ws(value) && self.endline()
    }

    fn escaped(&mut self, bytes: &[u8]) -> bool {
        if !self.w(b"\"") {
            return false;
        }
        for &b in bytes {
            let ok = match b {
                b'"' => self.w(b"\\\""),
                b'\\' => self.w(b"\\\\"),
                b'\n' => self.w(b"\\n"),
                b'\r' => self.w(b"\\r"),
                b'\t' => self.w(b"\\t"),
                0x20..=0x7E => self.w(&[b]),
                _ => self.ws(&format!("\\{:03o}", b)),
            };
            if !ok {
                return false;
            }
        }
        self.w(b"\"")
    }
}

impl Sink for TextPrinter<'_, '_> {
    fn end_msg(&mut self, _status: &mut Status) -> bool {
        true
    }

    fn put_int32(&mut self, f: &FieldDef, v: i32) -> bool {
        if f.descriptortype.ctype() == CType::Enum {
            if let Some(eid) = f.enum_subdef() {
                if let Some(name) = self.st.enm(eid).name_by_value(v) {
                    let name = name.to_owned();
                    return self.field_value(f, &name);
                }
            }
        }
        self.field_value(f, &v.to_string())
    }

    fn put_int64(&mut self, f: &FieldDef, v: i64) -> bool {
        self.field_value(f, &v.to_string())
    }

    fn put_uint32(&mut self, f: &FieldDef, v: u32) -> bool {
        self.field_value(f, &v.to_string())
    }

    fn put_uint64(&mut self, f: &FieldDef, v: u64) -> bool {
        self.field_value(f, &v.to_string())
    }

    fn put_float(&mut self, f: &FieldDef, v: f32) -> bool {
        self.field_value(f, &format!("{v}"))
    }

    fn put_double(&mut self, f: &FieldDef, v: f64) -> bool {
        self.field_value(f, &format!("{v}"))
    }

    fn put_bool(&mut self, f: &FieldDef, v: bool) -> bool {
        self.field_value(f, if v { "true" } else { "false" })
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
        self.indent()
            && self.ws(&f.name)
            && self.w(b": ")
            && self.escaped(&bytes)
            && self.endline()
    }

    fn start_submsg(&mut self, f: &FieldDef) -> bool {
        let ok = self.indent() && self.ws(&f.name) && self.w(b" {") && self.endline();
        self.indent += 1;
        ok
    }

    fn end_submsg(&mut self, _f: &FieldDef) -> bool {
        self.indent -= 1;
        self.indent() && self.w(b"}") && self.endline()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::base::Msg;
    use crate::decoding::decode;
    use crate::defs::SymTab;
    use crate::layout::LayoutCache;
    use crate::testutil::{enum_type, enum_field, field, file, message, msg_field};
    use crate::visit::visit;
    use crate::wire::{make_tag, put_varint, WireType};
    use allocator_api2::alloc::Global;

    #[test]
    fn prints_nested_text() {
        let mut st = SymTab::new();
        let f = file("t.proto", "pkg", "proto3")
            .with_message(
                message("M")
                    .with_field(field("i", 1, "int32"))
                    .with_field(field("s", 2, "string"))
                    .with_field(msg_field("child", 3, ".pkg.M"))
                    .with_field(enum_field("color", 4, ".pkg.Color")),
            )
            .with_enum(enum_type("Color", &[("RED", 0), ("GREEN", 1)]));
        st.add_file_bytes(&f.encode()).unwrap();
        let mid = st.lookup_msg("pkg.M").unwrap();
        let cache = LayoutCache::new();
        let lid = cache.load(&st, mid).unwrap();
        let layout = cache.get(lid);

        let mut wire = Vec::new();
        put_varint(&mut wire, make_tag(1, WireType::Varint) as u64);
        put_varint(&mut wire, 5);
        put_varint(&mut wire, make_tag(2, WireType::Delimited) as u64);
        put_varint(&mut wire, 4);
        wire.extend_from_slice(b"a\"\nb");
        let mut inner = Vec::new();
        put_varint(&mut inner, make_tag(4, WireType::Varint) as u64);
        put_varint(&mut inner, 1);
        put_varint(&mut wire, make_tag(3, WireType::Delimited) as u64);
        put_varint(&mut wire, inner.len() as u64);
        wire.extend_from_slice(&inner);

        let mut arena = Arena::new(&Global);
        let msg = Msg::new(&layout, &mut arena).unwrap();
        decode(&wire, msg, &cache, lid, &mut arena).unwrap();

        let mut out = Vec::new();
        let mut status = Status::new();
        {
            let mut tp = TextPrinter::new(&st, false, &mut out);
            assert!(visit(msg, &st, mid, &cache, &mut tp, &mut status));
        }
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "i: 5\ns: \"a\\\"\\nb\"\nchild {\n  color: GREEN\n}\n"
        );
    }

    #[test]
    fn single_line_mode() {
        let mut st = SymTab::new();
        let f = file("t.proto", "pkg", "proto3")
            .with_message(message("M").with_field(field("i", 1, "int32")));
        st.add_file_bytes(&f.encode()).unwrap();
        let mid = st.lookup_msg("pkg.M").unwrap();
        let cache = LayoutCache::new();
        let lid = cache.load(&st, mid).unwrap();
        let layout = cache.get(lid);

        let mut wire = Vec::new();
        put_varint(&mut wire, make_tag(1, WireType::Varint) as u64);
        put_varint(&mut wire, 3);

        let mut arena = Arena::new(&Global);
        let msg = Msg::new(&layout, &mut arena).unwrap();
        decode(&wire, msg, &cache, lid, &mut arena).unwrap();

        let mut out = Vec::new();
        let mut status = Status::new();
        {
            let mut tp = TextPrinter::new(&st, true, &mut out);
            assert!(visit(msg, &st, mid, &cache, &mut tp, &mut status));
        }
        assert_eq!(String::from_utf8(out).unwrap(), "i: 3 ");
    }
}
