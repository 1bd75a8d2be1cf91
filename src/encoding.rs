//! Wire-format encoder.
//!
//! Serializes backwards, so that length prefixes are easy to write: the
//! output buffer fills from the end toward the start, and a submessage's
//! length varint is emitted after (i.e. in front of) its contents without any
//! measuring pre-pass. The buffer is arena-backed and grows by
//! power-of-two reallocation, moving the written tail.

use core::ptr::NonNull;

use crate::arena::Arena;
use crate::base::{Array, Msg, StrSlot};
use crate::layout::{CType, DescriptorType, Field, LayoutCache, LayoutId, MsgLayout};
use crate::status::{Error, ErrorKind};
use crate::wire::{make_tag, zigzag_encode, zigzag_encode32, WireType};

use crate::decoding::MAX_DEPTH;

/// Encode `msg` into an arena-backed buffer, returning the encoded bytes.
pub fn encode<'a>(
    msg: Msg,
    cache: &LayoutCache,
    layout: LayoutId,
    arena: &'a mut Arena<'_>,
) -> Result<&'a [u8], Error> {
    let l = cache.get(layout);
    let mut buf = BackBuf::new();
    encode_msg(msg, &l, cache, &mut buf, arena, MAX_DEPTH)?;
    Ok(buf.into_slice())
}

/// Like [`encode`], but copies the result out of the scratch arena.
pub fn encode_to_vec(
    msg: Msg,
    cache: &LayoutCache,
    layout: LayoutId,
    arena: &mut Arena<'_>,
) -> Result<Vec<u8>, Error> {
    Ok(encode(msg, cache, layout, arena)?.to_vec())
}

struct BackBuf {
    data: NonNull<u8>,
    cap: usize,
    cursor: usize, // first written byte; the region [cursor, cap) holds output
}

impl BackBuf {
    fn new() -> Self {
        BackBuf {
            data: NonNull::dangling(),
            cap: 0,
            cursor: 0,
        }
    }

    fn written(&self) -> usize {
        self.cap - self.cursor
    }

    fn ensure(&mut self, n: usize, arena: &mut Arena) -> Result<(), Error> {
        if self.cursor >= n {
            return Ok(());
        }
        let needed = self.written() + n;
        let new_cap = needed.max(self.cap * 2).max(64).next_power_of_two();
        let new_data = arena.alloc_raw(core::alloc::Layout::from_size_align(new_cap, 1).unwrap())?;
        let written = self.written();
        if written > 0 {
            unsafe {
                core::ptr::copy_nonoverlapping(
                    self.data.as_ptr().add(self.cursor),
                    new_data.as_ptr().add(new_cap - written),
                    written,
                );
            }
        }
        self.data = new_data;
        self.cap = new_cap;
        self.cursor = new_cap - written;
        Ok(())
    }

    fn push_slice(&mut self, bytes: &[u8], arena: &mut Arena) -> Result<(), Error> {
        self.ensure(bytes.len(), arena)?;
        self.cursor -= bytes.len();
        unsafe {
            core::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.data.as_ptr().add(self.cursor),
                bytes.len(),
            );
        }
        Ok(())
    }

    fn push_varint(&mut self, mut n: u64, arena: &mut Arena) -> Result<(), Error> {
        let mut tmp = [0u8; 10];
        let mut i = 0;
        while n >= 0x80 {
            tmp[i] = n as u8 | 0x80;
            n >>= 7;
            i += 1;
        }
        tmp[i] = n as u8;
        self.push_slice(&tmp[..i + 1], arena)
    }

    fn push_tag(&mut self, number: u32, wt: WireType, arena: &mut Arena) -> Result<(), Error> {
        self.push_varint(make_tag(number, wt) as u64, arena)
    }

    fn into_slice<'a>(self) -> &'a [u8] {
        if self.written() == 0 {
            return &[];
        }
        unsafe { core::slice::from_raw_parts(self.data.as_ptr().add(self.cursor), self.written()) }
    }
}

// Raw field storage, width-normalized.
#[derive(Clone, Copy)]
enum RawVal {
    B1(u8),
    B4(u32),
    B8(u64),
}

impl RawVal {
    fn is_zero(self) -> bool {
        match self {
            RawVal::B1(v) => v == 0,
            RawVal::B4(v) => v == 0,
            RawVal::B8(v) => v == 0,
        }
    }
}

fn read_raw(msg: &Msg, t: DescriptorType, offset: u16) -> RawVal {
    match t.ctype() {
        CType::Bool => RawVal::B1(unsafe { msg.get::<u8>(offset) }),
        CType::Int32 | CType::UInt32 | CType::Enum | CType::Float => {
            RawVal::B4(unsafe { msg.get::<u32>(offset) })
        }
        _ => RawVal::B8(unsafe { msg.get::<u64>(offset) }),
    }
}

// Value bytes for numeric types; tags are the caller's business.
fn push_numeric(
    buf: &mut BackBuf,
    t: DescriptorType,
    raw: RawVal,
    arena: &mut Arena,
) -> Result<(), Error> {
    use DescriptorType::*;
    match t {
        Bool => {
            let RawVal::B1(v) = raw else { unreachable!() };
            buf.push_varint((v != 0) as u64, arena)
        }
        Int32 | Enum => {
            let RawVal::B4(v) = raw else { unreachable!() };
            // Negative int32 sign-extends to a 10-byte varint.
            buf.push_varint(v as i32 as i64 as u64, arena)
        }
        UInt32 => {
            let RawVal::B4(v) = raw else { unreachable!() };
            buf.push_varint(v as u64, arena)
        }
        Int64 | UInt64 => {
            let RawVal::B8(v) = raw else { unreachable!() };
            buf.push_varint(v, arena)
        }
        SInt32 => {
            let RawVal::B4(v) = raw else { unreachable!() };
            buf.push_varint(zigzag_encode32(v as i32) as u64, arena)
        }
        SInt64 => {
            let RawVal::B8(v) = raw else { unreachable!() };
            buf.push_varint(zigzag_encode(v as i64), arena)
        }
        Fixed32 | SFixed32 | Float => {
            let RawVal::B4(v) = raw else { unreachable!() };
            buf.push_slice(&v.to_le_bytes(), arena)
        }
        Fixed64 | SFixed64 | Double => {
            let RawVal::B8(v) = raw else { unreachable!() };
            buf.push_slice(&v.to_le_bytes(), arena)
        }
        _ => unreachable!("not a numeric type"),
    }
}

pub(crate) fn field_present(msg: &Msg, f: &Field) -> bool {
    if f.presence > 0 {
        return msg.has_bit(f.presence as u16);
    }
    if f.presence < 0 {
        return msg.oneof_case(!(f.presence as i32) as u16) == f.number;
    }
    // Implicit presence: all-zeroes / empty / null means absent.
    match f.descriptortype.ctype() {
        CType::String | CType::Bytes => !unsafe { msg.get::<StrSlot>(f.offset) }.is_empty(),
        CType::Message => msg.get_msg(f.offset).is_some(),
        _ => !read_raw(msg, f.descriptortype, f.offset).is_zero(),
    }
}

fn encode_msg(
    msg: Msg,
    layout: &MsgLayout,
    cache: &LayoutCache,
    buf: &mut BackBuf,
    arena: &mut Arena,
    depth: u32,
) -> Result<(), Error> {
    if depth == 0 {
        return Err(Error::new(ErrorKind::RangeError, "message nesting too deep"));
    }
    // Unknown bytes come last in the output, so they are written first. They
    // were captured tag-framed and go out verbatim.
    buf.push_slice(msg.unknown(), arena)?;

    for f in layout.fields.iter().rev() {
        if f.is_repeated() {
            encode_repeated(msg, f, layout, cache, buf, arena, depth)?;
        } else {
            if !field_present(&msg, f) {
                continue;
            }
            encode_singular(msg, f, layout, cache, buf, arena, depth)?;
        }
    }
    Ok(())
}

fn encode_singular(
    msg: Msg,
    f: &Field,
    layout: &MsgLayout,
    cache: &LayoutCache,
    buf: &mut BackBuf,
    arena: &mut Arena,
    depth: u32,
) -> Result<(), Error> {
    use DescriptorType as DT;
    match f.descriptortype.ctype() {
        CType::String | CType::Bytes => {
            let slot = unsafe { msg.get::<StrSlot>(f.offset) };
            buf.push_slice(slot.as_bytes(), arena)?;
            buf.push_varint(slot.len() as u64, arena)?;
            buf.push_tag(f.number, WireType::Delimited, arena)
        }
        CType::Message => {
            let child = msg.get_msg(f.offset).expect("presence checked");
            let sub = cache.get(layout.submsgs[f.submsg_index as usize]);
            if f.descriptortype == DT::Group {
                buf.push_tag(f.number, WireType::EndGroup, arena)?;
                encode_msg(child, &sub, cache, buf, arena, depth - 1)?;
                buf.push_tag(f.number, WireType::StartGroup, arena)
            } else {
                let before = buf.written();
                encode_msg(child, &sub, cache, buf, arena, depth - 1)?;
                buf.push_varint((buf.written() - before) as u64, arena)?;
                buf.push_tag(f.number, WireType::Delimited, arena)
            }
        }
        _ => {
            let raw = read_raw(&msg, f.descriptortype, f.offset);
            push_numeric(buf, f.descriptortype, raw, arena)?;
            buf.push_tag(f.number, f.descriptortype.wire_type(), arena)
        }
    }
}

fn encode_repeated(
    msg: Msg,
    f: &Field,
    layout: &MsgLayout,
    cache: &LayoutCache,
    buf: &mut BackBuf,
    arena: &mut Arena,
    depth: u32,
) -> Result<(), Error> {
    use DescriptorType as DT;
    let arr = *unsafe { msg.field_ref::<Array>(f.offset) };
    if arr.is_empty() {
        return Ok(());
    }
    match f.descriptortype.ctype() {
        CType::String | CType::Bytes => {
            let slots = unsafe { arr.as_slice::<StrSlot>() };
            for slot in slots.iter().rev() {
                buf.push_slice(slot.as_bytes(), arena)?;
                buf.push_varint(slot.len() as u64, arena)?;
                buf.push_tag(f.number, WireType::Delimited, arena)?;
            }
            Ok(())
        }
        CType::Message => {
            let ptrs = unsafe { arr.as_slice::<*mut u8>() };
            let sub = cache.get(layout.submsgs[f.submsg_index as usize]);
            for &p in ptrs.iter().rev() {
                let child = Msg::from_raw(p).expect("null element in repeated message");
                if f.descriptortype == DT::Group {
                    buf.push_tag(f.number, WireType::EndGroup, arena)?;
                    encode_msg(child, &sub, cache, buf, arena, depth - 1)?;
                    buf.push_tag(f.number, WireType::StartGroup, arena)?;
                } else {
                    let before = buf.written();
                    encode_msg(child, &sub, cache, buf, arena, depth - 1)?;
                    buf.push_varint((buf.written() - before) as u64, arena)?;
                    buf.push_tag(f.number, WireType::Delimited, arena)?;
                }
            }
            Ok(())
        }
        CType::Bool => encode_packed::<u8>(&arr, f, buf, arena),
        CType::Int32 | CType::UInt32 | CType::Enum | CType::Float => {
            encode_packed::<u32>(&arr, f, buf, arena)
        }
        _ => encode_packed::<u64>(&arr, f, buf, arena),
    }
}

// Repeated primitives are always emitted packed: a contiguous backwards run,
// one length varint, one DELIMITED tag.
fn encode_packed<T: Copy + Into<RawWide>>(
    arr: &Array,
    f: &Field,
    buf: &mut BackBuf,
    arena: &mut Arena,
) -> Result<(), Error> {
    let elems = unsafe { arr.as_slice::<T>() };
    let before = buf.written();
    for &e in elems.iter().rev() {
        let raw = match e.into() {
            RawWide::W1(v) => RawVal::B1(v),
            RawWide::W4(v) => RawVal::B4(v),
            RawWide::W8(v) => RawVal::B8(v),
        };
        push_numeric(buf, f.descriptortype, raw, arena)?;
    }
    buf.push_varint((buf.written() - before) as u64, arena)?;
    buf.push_tag(f.number, WireType::Delimited, arena)
}

enum RawWide {
    W1(u8),
    W4(u32),
    W8(u64),
}

impl From<u8> for RawWide {
    fn from(v: u8) -> Self {
        RawWide::W1(v)
    }
}
impl From<u32> for RawWide {
    fn from(v: u32) -> Self {
        RawWide::W4(v)
    }
}
impl From<u64> for RawWide {
    fn from(v: u64) -> Self {
        RawWide::W8(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoding::decode;
    use crate::layout::{build_layout, FieldLabel, FieldSpec};
    use crate::wire::put_varint;
    use allocator_api2::alloc::Global;

    fn spec(number: u32, t: DescriptorType, label: FieldLabel) -> FieldSpec {
        FieldSpec {
            number,
            descriptortype: t,
            label,
            has_presence: false,
            oneof_index: None,
            submsg_index: None,
        }
    }

    fn roundtrip_layout() -> (LayoutCache, LayoutId) {
        use DescriptorType::*;
        let cache = LayoutCache::new();
        let node = cache.reserve("test.Node");
        let mut child = spec(4, Message, FieldLabel::Optional);
        child.submsg_index = Some(0);
        let mut kids = spec(5, Message, FieldLabel::Repeated);
        kids.submsg_index = Some(1);
        let specs = [
            spec(1, Int32, FieldLabel::Optional),
            spec(2, String, FieldLabel::Optional),
            spec(3, Int64, FieldLabel::Repeated),
            child,
            kids,
            spec(6, Bool, FieldLabel::Optional),
            spec(7, Double, FieldLabel::Optional),
        ];
        cache.fill(node, build_layout(&specs, vec![node, node], false));
        (cache, node)
    }

    fn build_wire() -> Vec<u8> {
        use crate::wire::make_tag;
        let mut inner = Vec::new();
        put_varint(&mut inner, make_tag(1, WireType::Varint) as u64);
        put_varint(&mut inner, 7);

        let mut buf = Vec::new();
        put_varint(&mut buf, make_tag(1, WireType::Varint) as u64);
        put_varint(&mut buf, (-42i64) as u64);
        put_varint(&mut buf, make_tag(2, WireType::Delimited) as u64);
        put_varint(&mut buf, 3);
        buf.extend_from_slice(b"abc");
        put_varint(&mut buf, make_tag(3, WireType::Varint) as u64);
        put_varint(&mut buf, 10);
        put_varint(&mut buf, make_tag(3, WireType::Varint) as u64);
        put_varint(&mut buf, 20);
        put_varint(&mut buf, make_tag(4, WireType::Delimited) as u64);
        put_varint(&mut buf, inner.len() as u64);
        buf.extend_from_slice(&inner);
        put_varint(&mut buf, make_tag(5, WireType::Delimited) as u64);
        put_varint(&mut buf, inner.len() as u64);
        buf.extend_from_slice(&inner);
        put_varint(&mut buf, make_tag(6, WireType::Varint) as u64);
        put_varint(&mut buf, 1);
        put_varint(&mut buf, make_tag(7, WireType::Fixed64) as u64);
        buf.extend_from_slice(&2.5f64.to_le_bytes());
        buf
    }

    #[test]
    fn decode_encode_decode_is_stable() {
        let (cache, id) = roundtrip_layout();
        let layout = cache.get(id);
        let wire = build_wire();

        let mut arena = Arena::new(&Global);
        let msg = Msg::new(&layout, &mut arena).unwrap();
        decode(&wire, msg, &cache, id, &mut arena).unwrap();
        let first = encode_to_vec(msg, &cache, id, &mut arena).unwrap();

        let msg2 = Msg::new(&layout, &mut arena).unwrap();
        decode(&first, msg2, &cache, id, &mut arena).unwrap();
        let second = encode_to_vec(msg2, &cache, id, &mut arena).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn repeated_primitives_encode_packed() {
        let (cache, id) = roundtrip_layout();
        let layout = cache.get(id);
        let mut arena = Arena::new(&Global);
        let mut msg = Msg::new(&layout, &mut arena).unwrap();

        let f = *layout.field(3).unwrap();
        for v in [1u64, 2, 300] {
            let arr = unsafe { msg.field_mut::<Array>(f.offset) };
            unsafe { arr.push(v, &mut arena).unwrap() };
        }
        let out = encode_to_vec(msg, &cache, id, &mut arena).unwrap();

        // tag(3, DELIMITED), len 4, then 1, 2, 300 as varints.
        let mut expect = Vec::new();
        put_varint(&mut expect, make_tag(3, WireType::Delimited) as u64);
        let mut run = Vec::new();
        put_varint(&mut run, 1);
        put_varint(&mut run, 2);
        put_varint(&mut run, 300);
        put_varint(&mut expect, run.len() as u64);
        expect.extend_from_slice(&run);
        assert_eq!(out, expect);
    }

    #[test]
    fn unknown_fields_survive_roundtrip() {
        let (cache, id) = roundtrip_layout();
        let layout = cache.get(id);

        let mut wire = Vec::new();
        put_varint(&mut wire, make_tag(1, WireType::Varint) as u64);
        put_varint(&mut wire, 5);
        let unknown_start = wire.len();
        put_varint(&mut wire, make_tag(99, WireType::Delimited) as u64);
        put_varint(&mut wire, 4);
        wire.extend_from_slice(b"opaq");
        let unknown = wire[unknown_start..].to_vec();

        let mut arena = Arena::new(&Global);
        let msg = Msg::new(&layout, &mut arena).unwrap();
        decode(&wire, msg, &cache, id, &mut arena).unwrap();
        let out = encode_to_vec(msg, &cache, id, &mut arena).unwrap();
        // Unknown bytes are preserved verbatim at the end of the output.
        assert!(out.ends_with(&unknown));

        let msg2 = Msg::new(&layout, &mut arena).unwrap();
        decode(&out, msg2, &cache, id, &mut arena).unwrap();
        assert_eq!(msg2.unknown(), &unknown[..]);
    }

    #[test]
    fn implicit_presence_skips_defaults() {
        let (cache, id) = roundtrip_layout();
        let layout = cache.get(id);
        let mut arena = Arena::new(&Global);
        let msg = Msg::new(&layout, &mut arena).unwrap();
        let out = encode_to_vec(msg, &cache, id, &mut arena).unwrap();
        assert!(out.is_empty());
    }
}
