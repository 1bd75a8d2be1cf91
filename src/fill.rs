//! Message-building sink: turns a stream of handler events into an
//! arena-owned [`Msg`].
//!
//! This is the consumer half of every "parse into a message" pipeline: the
//! JSON parser (or any other producer) emits events against a `MessageSink`
//! bound to a root `MessageDef`, and the sink writes fields through the
//! message layout.

use std::sync::Arc;

use crate::arena::Arena;
use crate::base::{Array, Msg, StrSlot};
use crate::decoding::{child_msg, store_scalar, Scalar};
use crate::defs::{FieldDef, MsgId, SymTab};
use crate::handlers::Sink;
use crate::layout::{Field, LayoutCache, MsgLayout};
use crate::status::Error;

struct Frame {
    msg: Msg,
    layout: Arc<MsgLayout>,
}

pub struct MessageSink<'s, 'a, 'al> {
    cache: &'s LayoutCache,
    arena: &'a mut Arena<'al>,
    frames: Vec<Frame>,
    sbuf: Vec<u8>,
    error: Option<Error>,
}

impl<'s, 'a, 'al> MessageSink<'s, 'a, 'al> {
    /// Bind the sink to a pre-created root message. The root's layout must
    /// already be loaded in `cache`.
    pub fn new(
        st: &'s SymTab,
        cache: &'s LayoutCache,
        root_def: MsgId,
        root: Msg,
        arena: &'a mut Arena<'al>,
    ) -> Result<Self, Error> {
        let lid = cache.load(st, root_def)?;
        Ok(MessageSink {
            cache,
            arena,
            frames: vec![Frame {
                msg: root,
                layout: cache.get(lid),
            }],
            sbuf: Vec::new(),
            error: None,
        })
    }

    fn layout_field(&self, f: &FieldDef) -> Option<Field> {
        self.frames.last().unwrap().layout.field(f.number).copied()
    }

    fn fail(&mut self, e: Error) -> bool {
        self.error = Some(e);
        false
    }

    fn put_scalar(&mut self, f: &FieldDef, s: Scalar) -> bool {
        let Some(lf) = self.layout_field(f) else {
            return false;
        };
        let frame = self.frames.last_mut().unwrap();
        if lf.is_repeated() {
            let arr = unsafe { frame.msg.field_mut::<Array>(lf.offset) };
            let res = unsafe {
                match s {
                    Scalar::B1(v) => arr.push::<u8>(v, self.arena),
                    Scalar::B4(v) => arr.push::<u32>(v, self.arena),
                    Scalar::B8(v) => arr.push::<u64>(v, self.arena),
                }
            };
            if let Err(e) = res {
                return self.fail(e);
            }
        } else {
            store_scalar(&mut frame.msg, &lf, s);
        }
        true
    }
}

impl Sink for MessageSink<'_, '_, '_> {
    fn take_error(&mut self) -> Option<Error> {
        self.error.take()
    }

    fn put_int32(&mut self, f: &FieldDef, v: i32) -> bool {
        self.put_scalar(f, Scalar::B4(v as u32))
    }

    fn put_int64(&mut self, f: &FieldDef, v: i64) -> bool {
        self.put_scalar(f, Scalar::B8(v as u64))
    }

    fn put_uint32(&mut self, f: &FieldDef, v: u32) -> bool {
        self.put_scalar(f, Scalar::B4(v))
    }

    fn put_uint64(&mut self, f: &FieldDef, v: u64) -> bool {
        self.put_scalar(f, Scalar::B8(v))
    }

    fn put_float(&mut self, f: &FieldDef, v: f32) -> bool {
        self.put_scalar(f, Scalar::B4(v.to_bits()))
    }

    fn put_double(&mut self, f: &FieldDef, v: f64) -> bool {
        self.put_scalar(f, Scalar::B8(v.to_bits()))
    }

    fn put_bool(&mut self, f: &FieldDef, v: bool) -> bool {
        self.put_scalar(f, Scalar::B1(v as u8))
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
        let Some(lf) = self.layout_field(f) else {
            return false;
        };
        let slot = match StrSlot::from_bytes(&self.sbuf, self.arena) {
            Ok(s) => s,
            Err(e) => return self.fail(e),
        };
        self.sbuf.clear();
        let frame = self.frames.last_mut().unwrap();
        if lf.is_repeated() {
            let arr = unsafe { frame.msg.field_mut::<Array>(lf.offset) };
            if let Err(e) = unsafe { arr.push(slot, self.arena) } {
                return self.fail(e);
            }
        } else {
            frame.msg.mark_present(&lf);
            unsafe { frame.msg.set::<StrSlot>(lf.offset, slot) };
        }
        true
    }

    fn start_submsg(&mut self, f: &FieldDef) -> bool {
        let Some(lf) = self.layout_field(f) else {
            return false;
        };
        let frame = self.frames.last_mut().unwrap();
        let layout = frame.layout.clone();
        let mut msg = frame.msg;
        let child = match child_msg(&mut msg, &lf, &layout, self.cache, self.arena) {
            Ok(c) => c,
            Err(e) => return self.fail(e),
        };
        let sub_layout = self.cache.get(layout.submsgs[lf.submsg_index as usize]);
        self.frames.push(Frame {
            msg: child,
            layout: sub_layout,
        });
        true
    }

    fn end_submsg(&mut self, _f: &FieldDef) -> bool {
        if self.frames.len() <= 1 {
            return false;
        }
        self.frames.pop();
        true
    }

    fn put_unknown(&mut self, raw: &[u8]) -> bool {
        let frame = self.frames.last_mut().unwrap();
        let mut msg = frame.msg;
        match msg.append_unknown(raw, self.arena) {
            Ok(()) => true,
            Err(e) => self.fail(e),
        }
    }
}

// The defaulted start/end msg and seq events need no bookkeeping here:
// sequence extent is implied by the repeated label of the field each element
// event carries.

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::encode_to_vec;
    use crate::status::Status;
    use crate::testutil::{field, file, message, msg_field};
    use allocator_api2::alloc::Global;

    #[test]
    fn events_build_a_message() {
        let mut st = SymTab::new();
        let f = file("t.proto", "pkg", "proto3").with_message(
            message("M")
                .with_field(field("i", 1, "int32"))
                .with_field(field("s", 2, "string"))
                .with_field(field("r", 3, "int64").repeated())
                .with_field(msg_field("child", 4, ".pkg.M")),
        );
        st.add_file_bytes(&f.encode()).unwrap();
        let mid = st.lookup_msg("pkg.M").unwrap();
        let m = st.msg(mid);
        let fi = st.field(m.field_by_number(1).unwrap());
        let fs = st.field(m.field_by_number(2).unwrap());
        let fr = st.field(m.field_by_number(3).unwrap());
        let fc = st.field(m.field_by_number(4).unwrap());

        let cache = LayoutCache::new();
        let lid = cache.load(&st, mid).unwrap();
        let layout = cache.get(lid);
        let mut arena = Arena::new(&Global);
        let root = Msg::new(&layout, &mut arena).unwrap();

        {
            let mut sink = MessageSink::new(&st, &cache, mid, root, &mut arena).unwrap();
            assert!(sink.start_msg());
            assert!(sink.put_int32(fi, -5));
            assert!(sink.start_str(fs, 2));
            assert!(sink.put_str(fs, b"h"));
            assert!(sink.put_str(fs, b"i"));
            assert!(sink.end_str(fs));
            assert!(sink.start_seq(fr));
            assert!(sink.put_int64(fr, 1));
            assert!(sink.put_int64(fr, 2));
            assert!(sink.end_seq(fr));
            assert!(sink.start_submsg(fc));
            assert!(sink.put_int32(fi, 9));
            assert!(sink.end_submsg(fc));
            let mut status = Status::new();
            assert!(sink.end_msg(&mut status));
        }

        let lf_i = *layout.field(1).unwrap();
        let lf_s = *layout.field(2).unwrap();
        let lf_r = *layout.field(3).unwrap();
        let lf_c = *layout.field(4).unwrap();
        unsafe {
            assert_eq!(root.get::<i32>(lf_i.offset), -5);
            assert_eq!(root.get::<StrSlot>(lf_s.offset).as_bytes(), b"hi");
            let arr = root.field_ref::<Array>(lf_r.offset);
            assert_eq!(arr.as_slice::<u64>(), &[1, 2]);
        }
        let child = root.get_msg(lf_c.offset).unwrap();
        assert_eq!(unsafe { child.get::<i32>(lf_i.offset) }, 9);

        // The built message encodes cleanly.
        let bytes = encode_to_vec(root, &cache, lid, &mut arena).unwrap();
        assert!(!bytes.is_empty());
    }
}
