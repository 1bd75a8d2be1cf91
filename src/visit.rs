//! Event driver: walks a [`Msg`] per its layout and descriptor and pushes the
//! field values into any [`Sink`].
//!
//! This is the producer used for message-to-JSON and message-to-text
//! conversion: `visit` on a decoded message bound to a printer sink yields
//! the serialized form. Fields are visited in layout order; presence follows
//! the layout's presence encoding (hasbit, oneof discriminator, or non-zero
//! check for implicit-presence fields).

use crate::base::{Array, Msg, StrSlot};
use crate::defs::{FieldDef, MsgId, SymTab};
use crate::encoding::field_present;
use crate::handlers::Sink;
use crate::layout::{CType, LayoutCache, LayoutId};
use crate::status::Status;

/// Drive `sink` with the contents of `msg`. Returns false if any handler
/// cancels or the layout cannot be built; details land in `status`.
pub fn visit(
    msg: Msg,
    st: &SymTab,
    def: MsgId,
    cache: &LayoutCache,
    sink: &mut dyn Sink,
    status: &mut Status,
) -> bool {
    let lid = match cache.load(st, def) {
        Ok(l) => l,
        Err(e) => {
            status.set_error(e.kind, &e.message);
            return false;
        }
    };
    if !sink.start_msg() {
        return false;
    }
    if !visit_fields(msg, st, def, cache, lid, sink) {
        return false;
    }
    sink.end_msg(status)
}

/// Message body only, without the `start_msg`/`end_msg` bracket; recursion
/// uses the submsg bracket instead.
pub(crate) fn visit_fields(
    msg: Msg,
    st: &SymTab,
    def: MsgId,
    cache: &LayoutCache,
    lid: LayoutId,
    sink: &mut dyn Sink,
) -> bool {
    let layout = cache.get(lid);
    let mdef = st.msg(def);

    for lf in &layout.fields {
        let Some(fid) = mdef.field_by_number(lf.number) else {
            continue;
        };
        let f = st.field(fid);

        if lf.is_repeated() {
            let arr = *unsafe { msg.field_ref::<Array>(lf.offset) };
            if arr.is_empty() {
                continue;
            }
            if !sink.start_seq(f) {
                return false;
            }
            let ok = match f.descriptortype.ctype() {
                CType::String | CType::Bytes => unsafe { arr.as_slice::<StrSlot>() }
                    .iter()
                    .all(|slot| put_str_value(sink, f, slot.as_bytes())),
                CType::Message => {
                    let sub_lid = layout.submsgs[lf.submsg_index as usize];
                    let sub_def = f.msg_subdef().expect("message field without subdef");
                    unsafe { arr.as_slice::<*mut u8>() }.iter().all(|&p| {
                        let child = Msg::from_raw(p).expect("null repeated element");
                        sink.start_submsg(f)
                            && visit_fields(child, st, sub_def, cache, sub_lid, &mut *sink)
                            && sink.end_submsg(f)
                    })
                }
                CType::Bool => unsafe { arr.as_slice::<u8>() }
                    .iter()
                    .all(|&v| sink.put_bool(f, v != 0)),
                CType::Int32 | CType::Enum => unsafe { arr.as_slice::<i32>() }
                    .iter()
                    .all(|&v| sink.put_int32(f, v)),
                CType::UInt32 => unsafe { arr.as_slice::<u32>() }
                    .iter()
                    .all(|&v| sink.put_uint32(f, v)),
                CType::Float => unsafe { arr.as_slice::<f32>() }
                    .iter()
                    .all(|&v| sink.put_float(f, v)),
                CType::Int64 => unsafe { arr.as_slice::<i64>() }
                    .iter()
                    .all(|&v| sink.put_int64(f, v)),
                CType::UInt64 => unsafe { arr.as_slice::<u64>() }
                    .iter()
                    .all(|&v| sink.put_uint64(f, v)),
                CType::Double => unsafe { arr.as_slice::<f64>() }
                    .iter()
                    .all(|&v| sink.put_double(f, v)),
            };
            if !ok || !sink.end_seq(f) {
                return false;
            }
            continue;
        }

        if !field_present(&msg, lf) {
            continue;
        }
        let ok = match f.descriptortype.ctype() {
            CType::String | CType::Bytes => {
                let slot = unsafe { msg.get::<StrSlot>(lf.offset) };
                put_str_value(sink, f, slot.as_bytes())
            }
            CType::Message => {
                let child = msg.get_msg(lf.offset).expect("presence checked");
                let sub_lid = layout.submsgs[lf.submsg_index as usize];
                let sub_def = f.msg_subdef().expect("message field without subdef");
                sink.start_submsg(f)
                    && visit_fields(child, st, sub_def, cache, sub_lid, &mut *sink)
                    && sink.end_submsg(f)
            }
            CType::Bool => sink.put_bool(f, unsafe { msg.get::<u8>(lf.offset) } != 0),
            CType::Int32 | CType::Enum => sink.put_int32(f, unsafe { msg.get::<i32>(lf.offset) }),
            CType::UInt32 => sink.put_uint32(f, unsafe { msg.get::<u32>(lf.offset) }),
            CType::Float => sink.put_float(f, unsafe { msg.get::<f32>(lf.offset) }),
            CType::Int64 => sink.put_int64(f, unsafe { msg.get::<i64>(lf.offset) }),
            CType::UInt64 => sink.put_uint64(f, unsafe { msg.get::<u64>(lf.offset) }),
            CType::Double => sink.put_double(f, unsafe { msg.get::<f64>(lf.offset) }),
        };
        if !ok {
            return false;
        }
    }

    let unknown = msg.unknown();
    if !unknown.is_empty() && !sink.put_unknown(unknown) {
        return false;
    }
    true
}

fn put_str_value(sink: &mut dyn Sink, f: &FieldDef, bytes: &[u8]) -> bool {
    sink.start_str(f, bytes.len()) && sink.put_str(f, bytes) && sink.end_str(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::decoding::decode;
    use crate::testutil::{field, file, message, msg_field};
    use crate::wire::{make_tag, put_varint, WireType};
    use allocator_api2::alloc::Global;

    // Records the event trace as compact strings.
    #[derive(Default)]
    struct Trace(Vec<String>);

    impl Sink for Trace {
        fn start_msg(&mut self) -> bool {
            self.0.push("start".into());
            true
        }
        fn end_msg(&mut self, _s: &mut Status) -> bool {
            self.0.push("end".into());
            true
        }
        fn put_int32(&mut self, f: &FieldDef, v: i32) -> bool {
            self.0.push(format!("i32 {} {v}", f.name));
            true
        }
        fn start_str(&mut self, f: &FieldDef, _hint: usize) -> bool {
            self.0.push(format!("str< {}", f.name));
            true
        }
        fn put_str(&mut self, _f: &FieldDef, chunk: &[u8]) -> bool {
            self.0
                .push(format!("chunk {}", String::from_utf8_lossy(chunk)));
            true
        }
        fn end_str(&mut self, _f: &FieldDef) -> bool {
            self.0.push("str>".into());
            true
        }
        fn start_seq(&mut self, f: &FieldDef) -> bool {
            self.0.push(format!("seq< {}", f.name));
            true
        }
        fn end_seq(&mut self, _f: &FieldDef) -> bool {
            self.0.push("seq>".into());
            true
        }
        fn start_submsg(&mut self, f: &FieldDef) -> bool {
            self.0.push(format!("sub< {}", f.name));
            true
        }
        fn end_submsg(&mut self, _f: &FieldDef) -> bool {
            self.0.push("sub>".into());
            true
        }
    }

    #[test]
    fn walk_emits_expected_trace() {
        let mut st = SymTab::new();
        let f = file("t.proto", "pkg", "proto3").with_message(
            message("M")
                .with_field(field("i", 1, "int32"))
                .with_field(field("s", 2, "string"))
                .with_field(field("r", 3, "int32").repeated())
                .with_field(msg_field("child", 4, ".pkg.M")),
        );
        st.add_file_bytes(&f.encode()).unwrap();
        let mid = st.lookup_msg("pkg.M").unwrap();
        let cache = LayoutCache::new();
        let lid = cache.load(&st, mid).unwrap();
        let layout = cache.get(lid);

        let mut wire = Vec::new();
        put_varint(&mut wire, make_tag(1, WireType::Varint) as u64);
        put_varint(&mut wire, 7);
        put_varint(&mut wire, make_tag(2, WireType::Delimited) as u64);
        put_varint(&mut wire, 2);
        wire.extend_from_slice(b"ok");
        put_varint(&mut wire, make_tag(3, WireType::Varint) as u64);
        put_varint(&mut wire, 1);
        put_varint(&mut wire, make_tag(3, WireType::Varint) as u64);
        put_varint(&mut wire, 2);
        let mut inner = Vec::new();
        put_varint(&mut inner, make_tag(1, WireType::Varint) as u64);
        put_varint(&mut inner, 9);
        put_varint(&mut wire, make_tag(4, WireType::Delimited) as u64);
        put_varint(&mut wire, inner.len() as u64);
        wire.extend_from_slice(&inner);

        let mut arena = Arena::new(&Global);
        let msg = Msg::new(&layout, &mut arena).unwrap();
        decode(&wire, msg, &cache, lid, &mut arena).unwrap();

        let mut trace = Trace::default();
        let mut status = Status::new();
        assert!(visit(msg, &st, mid, &cache, &mut trace, &mut status));
        assert!(status.is_ok());

        assert_eq!(
            trace.0,
            vec![
                "start",
                "i32 i 7",
                "str< s",
                "chunk ok",
                "str>",
                "seq< r",
                "i32 r 1",
                "i32 r 2",
                "seq>",
                "sub< child",
                "i32 i 9",
                "sub>",
                "end",
            ]
        );
    }
}
