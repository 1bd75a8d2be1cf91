//! Table-driven wire-format decoder.
//!
//! Decodes protobuf binary data into a [`Msg`] laid out per a
//! [`MsgLayout`](crate::layout::MsgLayout). Field lookup is by number; fields
//! whose wire type does not match their declared type are preserved in the
//! message's unknown-field buffer, as are fields absent from the layout.
//! Packed and non-packed encodings of the same repeated field both decode and
//! concatenate into the same array.

use log::trace;

use crate::arena::Arena;
use crate::base::{Array, Msg, StrSlot};
use crate::layout::{CType, DescriptorType, Field, LayoutCache, LayoutId, MsgLayout};
use crate::status::{Error, ErrorKind};
use crate::wire::{zigzag_decode, zigzag_decode32, Reader, WireType};

/// Maximum nesting of submessages and groups.
pub const MAX_DEPTH: u32 = 64;

/// Decode `buf` into `msg`. On failure the message may hold partial data;
/// discard it with the arena.
pub fn decode(
    buf: &[u8],
    msg: Msg,
    cache: &LayoutCache,
    layout: LayoutId,
    arena: &mut Arena,
) -> Result<(), Error> {
    let l = cache.get(layout);
    let mut r = Reader::new(buf);
    decode_msg(&mut r, buf.len(), None, msg, &l, cache, arena, MAX_DEPTH)
}

// Scalar values normalized to their storage width.
#[derive(Clone, Copy)]
pub(crate) enum Scalar {
    B1(u8),
    B4(u32),
    B8(u64),
}

pub(crate) fn scalar_from_varint(t: DescriptorType, v: u64) -> Scalar {
    use DescriptorType::*;
    match t {
        Bool => Scalar::B1((v != 0) as u8),
        Int32 | UInt32 | Enum => Scalar::B4(v as u32),
        SInt32 => Scalar::B4(zigzag_decode32(v as u32) as u32),
        SInt64 => Scalar::B8(zigzag_decode(v) as u64),
        Int64 | UInt64 => Scalar::B8(v),
        _ => unreachable!("not a varint type"),
    }
}

pub(crate) fn store_scalar(msg: &mut Msg, f: &Field, s: Scalar) {
    msg.mark_present(f);
    unsafe {
        match s {
            Scalar::B1(v) => msg.set::<u8>(f.offset, v),
            Scalar::B4(v) => msg.set::<u32>(f.offset, v),
            Scalar::B8(v) => msg.set::<u64>(f.offset, v),
        }
    }
}

pub(crate) fn append_scalar(msg: &mut Msg, f: &Field, s: Scalar, arena: &mut Arena) -> Result<(), Error> {
    let arr = unsafe { msg.field_mut::<Array>(f.offset) };
    unsafe {
        match s {
            Scalar::B1(v) => arr.push::<u8>(v, arena),
            Scalar::B4(v) => arr.push::<u32>(v, arena),
            Scalar::B8(v) => arr.push::<u64>(v, arena),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn decode_msg(
    r: &mut Reader,
    end: usize,
    group: Option<u32>,
    mut msg: Msg,
    layout: &MsgLayout,
    cache: &LayoutCache,
    arena: &mut Arena,
    depth: u32,
) -> Result<(), Error> {
    if depth == 0 {
        return Err(Error::new(ErrorKind::RangeError, "message nesting too deep"));
    }
    while r.pos < end {
        let tag_start = r.pos;
        let tag = r.varint(end)?;
        let num = (tag >> 3) as u32;
        let wt = WireType::from_tag(tag)
            .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "invalid wire type"))?;
        if num == 0 {
            return Err(Error::new(ErrorKind::RangeError, "field number 0"));
        }
        if wt == WireType::EndGroup {
            if group == Some(num) {
                return Ok(());
            }
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "end-group tag with wrong field number",
            ));
        }

        let consumed = match layout.field(num) {
            Some(f) => {
                let f = *f;
                decode_field(r, end, wt, &mut msg, &f, layout, cache, arena, depth)?
            }
            None => false,
        };
        if !consumed {
            // Unknown field, or wire-type/descriptor-type mismatch: skip the
            // payload and keep the raw tag + payload bytes.
            trace!("preserving unknown field {num} (wire type {wt:?})");
            skip_value(r, end, wt, num, depth)?;
            let raw = &r.buf[tag_start..r.pos];
            msg.append_unknown(raw, arena)?;
        }
    }
    if group.is_some() {
        return Err(Error::new(ErrorKind::Truncated, "group not terminated"));
    }
    Ok(())
}

// Returns Ok(false), without consuming the payload, when the wire type does
// not fit the declared field type.
#[allow(clippy::too_many_arguments)]
fn decode_field(
    r: &mut Reader,
    end: usize,
    wt: WireType,
    msg: &mut Msg,
    f: &Field,
    layout: &MsgLayout,
    cache: &LayoutCache,
    arena: &mut Arena,
    depth: u32,
) -> Result<bool, Error> {
    use DescriptorType as DT;
    let t = f.descriptortype;
    let repeated = f.is_repeated();

    match t.ctype() {
        CType::Message => match (t, wt) {
            (DT::Message, WireType::Delimited) => {
                let len = r.delimited_len(end)?;
                let sub_end = r.pos + len;
                let child = child_msg(msg, f, layout, cache, arena)?;
                let sub_layout = cache.get(layout.submsgs[f.submsg_index as usize]);
                decode_msg(r, sub_end, None, child, &sub_layout, cache, arena, depth - 1)?;
                if r.pos != sub_end {
                    return Err(Error::new(ErrorKind::Truncated, "submessage overran its length"));
                }
                Ok(true)
            }
            (DT::Group, WireType::StartGroup) => {
                let child = child_msg(msg, f, layout, cache, arena)?;
                let sub_layout = cache.get(layout.submsgs[f.submsg_index as usize]);
                decode_msg(r, end, Some(f.number), child, &sub_layout, cache, arena, depth - 1)?;
                Ok(true)
            }
            _ => Ok(false),
        },
        CType::String | CType::Bytes => {
            if wt != WireType::Delimited {
                return Ok(false);
            }
            let len = r.delimited_len(end)?;
            let bytes = r.slice(len);
            let slot = StrSlot::from_bytes(bytes, arena)?;
            if repeated {
                let arr = unsafe { msg.field_mut::<Array>(f.offset) };
                unsafe { arr.push(slot, arena)? };
            } else {
                msg.mark_present(f);
                unsafe { msg.set::<StrSlot>(f.offset, slot) };
            }
            Ok(true)
        }
        _ => {
            // Numeric scalar.
            let native_wt = t.wire_type();
            if wt == native_wt {
                let s = match native_wt {
                    WireType::Varint => scalar_from_varint(t, r.varint(end)?),
                    WireType::Fixed32 => Scalar::B4(r.fixed32(end)?),
                    WireType::Fixed64 => Scalar::B8(r.fixed64(end)?),
                    _ => unreachable!(),
                };
                if repeated {
                    append_scalar(msg, f, s, arena)?;
                } else {
                    store_scalar(msg, f, s);
                }
                Ok(true)
            } else if repeated && wt == WireType::Delimited && t.is_packable() {
                // Packed run: chunked decode into the same array.
                let len = r.delimited_len(end)?;
                let chunk_end = r.pos + len;
                match native_wt {
                    WireType::Varint => {
                        while r.pos < chunk_end {
                            let s = scalar_from_varint(t, r.varint(chunk_end)?);
                            append_scalar(msg, f, s, arena)?;
                        }
                    }
                    WireType::Fixed32 => {
                        if len % 4 != 0 {
                            return Err(Error::new(ErrorKind::Truncated, "packed fixed32 run misaligned"));
                        }
                        while r.pos < chunk_end {
                            append_scalar(msg, f, Scalar::B4(r.fixed32(chunk_end)?), arena)?;
                        }
                    }
                    WireType::Fixed64 => {
                        if len % 8 != 0 {
                            return Err(Error::new(ErrorKind::Truncated, "packed fixed64 run misaligned"));
                        }
                        while r.pos < chunk_end {
                            append_scalar(msg, f, Scalar::B8(r.fixed64(chunk_end)?), arena)?;
                        }
                    }
                    _ => unreachable!(),
                }
                Ok(true)
            } else {
                Ok(false)
            }
        }
    }
}

// Get or create the target submessage for a message/group field. Singular
// fields reuse an existing child; oneof members only when the oneof already
// holds this field.
pub(crate) fn child_msg(
    msg: &mut Msg,
    f: &Field,
    layout: &MsgLayout,
    cache: &LayoutCache,
    arena: &mut Arena,
) -> Result<Msg, Error> {
    let sub_layout = cache.get(layout.submsgs[f.submsg_index as usize]);
    if f.is_repeated() {
        let child = Msg::new(&sub_layout, arena)?;
        let arr = unsafe { msg.field_mut::<Array>(f.offset) };
        unsafe { arr.push(child.as_raw(), arena)? };
        return Ok(child);
    }
    let reusable = if f.presence < 0 {
        msg.oneof_case(!(f.presence as i32) as u16) == f.number
    } else {
        true
    };
    if reusable {
        if let Some(child) = msg.get_msg(f.offset) {
            msg.mark_present(f);
            return Ok(child);
        }
    }
    let child = Msg::new(&sub_layout, arena)?;
    msg.set_msg(f.offset, child);
    msg.mark_present(f);
    Ok(child)
}

// Skip one payload of the given wire type, validating structure.
fn skip_value(r: &mut Reader, end: usize, wt: WireType, num: u32, depth: u32) -> Result<(), Error> {
    match wt {
        WireType::Varint => {
            r.varint(end)?;
        }
        WireType::Fixed64 => {
            r.fixed64(end)?;
        }
        WireType::Fixed32 => {
            r.fixed32(end)?;
        }
        WireType::Delimited => {
            let len = r.delimited_len(end)?;
            r.pos += len;
        }
        WireType::StartGroup => skip_group(r, end, num, depth)?,
        WireType::EndGroup => {
            return Err(Error::new(ErrorKind::InvalidInput, "unexpected end-group tag"));
        }
    }
    Ok(())
}

fn skip_group(r: &mut Reader, end: usize, num: u32, depth: u32) -> Result<(), Error> {
    if depth == 0 {
        return Err(Error::new(ErrorKind::RangeError, "message nesting too deep"));
    }
    loop {
        if r.pos >= end {
            return Err(Error::new(ErrorKind::Truncated, "group not terminated"));
        }
        let tag = r.varint(end)?;
        let inner = (tag >> 3) as u32;
        let wt = WireType::from_tag(tag)
            .ok_or_else(|| Error::new(ErrorKind::InvalidInput, "invalid wire type"))?;
        if inner == 0 {
            return Err(Error::new(ErrorKind::RangeError, "field number 0"));
        }
        if wt == WireType::EndGroup {
            if inner == num {
                return Ok(());
            }
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "end-group tag with wrong field number",
            ));
        }
        skip_value(r, end, wt, inner, depth - 1)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{build_layout, FieldLabel, FieldSpec};
    use crate::wire::{make_tag, put_varint};
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

    fn scalar_layout() -> (LayoutCache, LayoutId) {
        use DescriptorType::*;
        let specs = [
            spec(1, Int32, FieldLabel::Optional),
            spec(2, String, FieldLabel::Optional),
            spec(3, Bool, FieldLabel::Optional),
            spec(4, SInt64, FieldLabel::Optional),
            spec(5, Double, FieldLabel::Optional),
            spec(6, Int64, FieldLabel::Repeated),
        ];
        let cache = LayoutCache::new();
        let id = cache.install("test.Scalars", build_layout(&specs, vec![], false));
        (cache, id)
    }

    #[test]
    fn decode_scalars() {
        let (cache, id) = scalar_layout();
        let layout = cache.get(id);

        let mut buf = Vec::new();
        put_varint(&mut buf, make_tag(1, WireType::Varint) as u64);
        put_varint(&mut buf, (-42i64) as u64);
        put_varint(&mut buf, make_tag(2, WireType::Delimited) as u64);
        put_varint(&mut buf, 5);
        buf.extend_from_slice(b"hello");
        put_varint(&mut buf, make_tag(3, WireType::Varint) as u64);
        put_varint(&mut buf, 7); // non-canonical bool, must normalize to 1
        put_varint(&mut buf, make_tag(4, WireType::Varint) as u64);
        put_varint(&mut buf, crate::wire::zigzag_encode(-99));
        put_varint(&mut buf, make_tag(5, WireType::Fixed64) as u64);
        buf.extend_from_slice(&1.5f64.to_le_bytes());

        let mut arena = Arena::new(&Global);
        let msg = Msg::new(&layout, &mut arena).unwrap();
        decode(&buf, msg, &cache, id, &mut arena).unwrap();

        unsafe {
            assert_eq!(msg.get::<i32>(layout.field(1).unwrap().offset), -42);
            let s = msg.get::<StrSlot>(layout.field(2).unwrap().offset);
            assert_eq!(s.as_bytes(), b"hello");
            assert_eq!(msg.get::<u8>(layout.field(3).unwrap().offset), 1);
            assert_eq!(msg.get::<i64>(layout.field(4).unwrap().offset), -99);
            assert_eq!(msg.get::<f64>(layout.field(5).unwrap().offset), 1.5);
        }
    }

    #[test]
    fn packed_and_unpacked_concatenate() {
        let (cache, id) = scalar_layout();
        let layout = cache.get(id);

        let mut buf = Vec::new();
        // Unpacked element.
        put_varint(&mut buf, make_tag(6, WireType::Varint) as u64);
        put_varint(&mut buf, 10);
        // Packed run of two.
        let mut run = Vec::new();
        put_varint(&mut run, 20);
        put_varint(&mut run, 30);
        put_varint(&mut buf, make_tag(6, WireType::Delimited) as u64);
        put_varint(&mut buf, run.len() as u64);
        buf.extend_from_slice(&run);
        // Another unpacked element.
        put_varint(&mut buf, make_tag(6, WireType::Varint) as u64);
        put_varint(&mut buf, 40);

        let mut arena = Arena::new(&Global);
        let msg = Msg::new(&layout, &mut arena).unwrap();
        decode(&buf, msg, &cache, id, &mut arena).unwrap();

        let f = layout.field(6).unwrap();
        let arr = unsafe { msg.field_ref::<Array>(f.offset) };
        assert_eq!(unsafe { arr.as_slice::<u64>() }, &[10, 20, 30, 40]);
    }

    #[test]
    fn unknown_fields_preserved() {
        let (cache, id) = scalar_layout();
        let layout = cache.get(id);

        let mut buf = Vec::new();
        let unknown_start = buf.len();
        put_varint(&mut buf, make_tag(99, WireType::Varint) as u64);
        put_varint(&mut buf, 1234);
        let unknown = buf[unknown_start..].to_vec();
        put_varint(&mut buf, make_tag(1, WireType::Varint) as u64);
        put_varint(&mut buf, 5);

        let mut arena = Arena::new(&Global);
        let msg = Msg::new(&layout, &mut arena).unwrap();
        decode(&buf, msg, &cache, id, &mut arena).unwrap();
        assert_eq!(msg.unknown(), &unknown[..]);
        assert_eq!(unsafe { msg.get::<i32>(layout.field(1).unwrap().offset) }, 5);
    }

    #[test]
    fn wire_type_mismatch_goes_to_unknown() {
        let (cache, id) = scalar_layout();
        let layout = cache.get(id);

        // Field 1 is int32 but arrives as fixed64.
        let mut buf = Vec::new();
        put_varint(&mut buf, make_tag(1, WireType::Fixed64) as u64);
        buf.extend_from_slice(&7u64.to_le_bytes());

        let mut arena = Arena::new(&Global);
        let msg = Msg::new(&layout, &mut arena).unwrap();
        decode(&buf, msg, &cache, id, &mut arena).unwrap();
        assert_eq!(msg.unknown(), &buf[..]);
        assert_eq!(unsafe { msg.get::<i32>(layout.field(1).unwrap().offset) }, 0);
    }

    #[test]
    fn field_number_zero_fails() {
        let (cache, id) = scalar_layout();
        let layout = cache.get(id);
        let buf = [0u8]; // tag 0
        let mut arena = Arena::new(&Global);
        let msg = Msg::new(&layout, &mut arena).unwrap();
        let err = decode(&buf, msg, &cache, id, &mut arena).unwrap_err();
        assert_eq!(err.kind, ErrorKind::RangeError);
    }

    #[test]
    fn truncated_delimited_fails() {
        let (cache, id) = scalar_layout();
        let layout = cache.get(id);
        let mut buf = Vec::new();
        put_varint(&mut buf, make_tag(2, WireType::Delimited) as u64);
        put_varint(&mut buf, 100); // length exceeds remaining
        buf.extend_from_slice(b"short");
        let mut arena = Arena::new(&Global);
        let msg = Msg::new(&layout, &mut arena).unwrap();
        let err = decode(&buf, msg, &cache, id, &mut arena).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Truncated);
    }

    fn nested_layout() -> (LayoutCache, LayoutId) {
        use DescriptorType::*;
        let cache = LayoutCache::new();
        // message Node { int32 v = 1; Node child = 2; }
        let node = cache.reserve("test.Node");
        let mut child_spec = spec(2, Message, FieldLabel::Optional);
        child_spec.submsg_index = Some(0);
        let specs = [spec(1, Int32, FieldLabel::Optional), child_spec];
        cache.fill(node, build_layout(&specs, vec![node], false));
        (cache, node)
    }

    #[test]
    fn nested_messages_decode() {
        let (cache, id) = nested_layout();
        let layout = cache.get(id);

        // Node{ v: 1, child: Node{ v: 2 } }
        let mut inner = Vec::new();
        put_varint(&mut inner, make_tag(1, WireType::Varint) as u64);
        put_varint(&mut inner, 2);
        let mut buf = Vec::new();
        put_varint(&mut buf, make_tag(1, WireType::Varint) as u64);
        put_varint(&mut buf, 1);
        put_varint(&mut buf, make_tag(2, WireType::Delimited) as u64);
        put_varint(&mut buf, inner.len() as u64);
        buf.extend_from_slice(&inner);

        let mut arena = Arena::new(&Global);
        let msg = Msg::new(&layout, &mut arena).unwrap();
        decode(&buf, msg, &cache, id, &mut arena).unwrap();

        let vf = *layout.field(1).unwrap();
        let cf = *layout.field(2).unwrap();
        assert_eq!(unsafe { msg.get::<i32>(vf.offset) }, 1);
        let child = msg.get_msg(cf.offset).unwrap();
        assert_eq!(unsafe { child.get::<i32>(vf.offset) }, 2);
        assert!(child.get_msg(cf.offset).is_none());
    }

    #[test]
    fn recursion_limit_enforced() {
        let (cache, id) = nested_layout();
        let layout = cache.get(id);

        // 70 levels of nesting via child fields.
        let mut buf = Vec::new();
        for _ in 0..70 {
            let mut outer = Vec::new();
            put_varint(&mut outer, make_tag(2, WireType::Delimited) as u64);
            put_varint(&mut outer, buf.len() as u64);
            outer.extend_from_slice(&buf);
            buf = outer;
        }

        let mut arena = Arena::new(&Global);
        let msg = Msg::new(&layout, &mut arena).unwrap();
        let err = decode(&buf, msg, &cache, id, &mut arena).unwrap_err();
        assert_eq!(err.kind, ErrorKind::RangeError);
    }
}
