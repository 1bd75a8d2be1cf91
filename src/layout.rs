//! Compact per-message layouts and the factory that derives them from
//! descriptors.
//!
//! A [`MsgLayout`] is the runtime-usable compilation of a message schema:
//! field offsets, presence encoding, and child-layout references. Layouts are
//! owned by a [`LayoutCache`] and addressed by [`LayoutId`]; a field's
//! `submsg_index` indexes the layout's `submsgs` table, which holds cache ids.
//! Memoization inserts a placeholder before recursing so mutually recursive
//! message types terminate.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::defs::{MsgId, SubDef, SymTab, Syntax};
use crate::status::{Error, ErrorKind};
use crate::wire::WireType;

/// Descriptor field types 1..=18 from descriptor.proto.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DescriptorType {
    Double = 1,
    Float = 2,
    Int64 = 3,
    UInt64 = 4,
    Int32 = 5,
    Fixed64 = 6,
    Fixed32 = 7,
    Bool = 8,
    String = 9,
    Group = 10,
    Message = 11,
    Bytes = 12,
    UInt32 = 13,
    Enum = 14,
    SFixed32 = 15,
    SFixed64 = 16,
    SInt32 = 17,
    SInt64 = 18,
}

/// Value categories; groups and messages collapse to `Message`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CType {
    Bool,
    Float,
    Int32,
    UInt32,
    Enum,
    Double,
    Int64,
    UInt64,
    String,
    Bytes,
    Message,
}

impl DescriptorType {
    pub fn from_i32(v: i32) -> Option<DescriptorType> {
        use DescriptorType::*;
        Some(match v {
            1 => Double,
            2 => Float,
            3 => Int64,
            4 => UInt64,
            5 => Int32,
            6 => Fixed64,
            7 => Fixed32,
            8 => Bool,
            9 => String,
            10 => Group,
            11 => Message,
            12 => Bytes,
            13 => UInt32,
            14 => Enum,
            15 => SFixed32,
            16 => SFixed64,
            17 => SInt32,
            18 => SInt64,
            _ => return None,
        })
    }

    pub fn ctype(self) -> CType {
        use DescriptorType::*;
        match self {
            Double => CType::Double,
            Float => CType::Float,
            Int64 | SFixed64 | SInt64 => CType::Int64,
            UInt64 | Fixed64 => CType::UInt64,
            Int32 | SFixed32 | SInt32 => CType::Int32,
            Fixed32 | UInt32 => CType::UInt32,
            Bool => CType::Bool,
            String => CType::String,
            Bytes => CType::Bytes,
            Group | Message => CType::Message,
            Enum => CType::Enum,
        }
    }

    /// Wire type of the non-packed encoding.
    pub fn wire_type(self) -> WireType {
        use DescriptorType::*;
        match self {
            Double | Fixed64 | SFixed64 => WireType::Fixed64,
            Float | Fixed32 | SFixed32 => WireType::Fixed32,
            Int64 | UInt64 | Int32 | UInt32 | Bool | Enum | SInt32 | SInt64 => WireType::Varint,
            String | Bytes | Message => WireType::Delimited,
            Group => WireType::StartGroup,
        }
    }

    pub fn is_packable(self) -> bool {
        !matches!(
            self,
            DescriptorType::String
                | DescriptorType::Bytes
                | DescriptorType::Message
                | DescriptorType::Group
        )
    }
}

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FieldLabel {
    Optional = 1,
    Required = 2,
    Repeated = 3,
}

impl FieldLabel {
    pub fn from_i32(v: i32) -> Option<FieldLabel> {
        match v {
            1 => Some(FieldLabel::Optional),
            2 => Some(FieldLabel::Required),
            3 => Some(FieldLabel::Repeated),
            _ => None,
        }
    }
}

/// No child layout; sentinel for `Field::submsg_index`.
pub const NO_SUBMSG: u16 = u16::MAX;

/// One field record of a layout. `presence` encodes three cases: 0 means
/// proto3 implicit presence, positive is a hasbit position within the message
/// body, negative is the bit-complement of the oneof discriminator offset.
#[derive(Clone, Copy, Debug)]
pub struct Field {
    pub number: u32,
    pub offset: u16,
    pub presence: i16,
    pub submsg_index: u16,
    pub descriptortype: DescriptorType,
    pub label: FieldLabel,
}

impl Field {
    pub fn is_repeated(&self) -> bool {
        self.label == FieldLabel::Repeated
    }
}

#[derive(Clone, Debug, Default)]
pub struct MsgLayout {
    pub size: u32,
    pub fields: Vec<Field>,
    pub submsgs: Vec<LayoutId>,
    pub extendable: bool,
}

impl MsgLayout {
    /// Field lookup is by number only; record order carries no meaning for
    /// decoders.
    pub fn field(&self, number: u32) -> Option<&Field> {
        self.fields.iter().find(|f| f.number == number)
    }
}

/// In-memory slot sizes for each field shape.
pub(crate) fn field_slot(t: DescriptorType, label: FieldLabel) -> (u32, u32) {
    if label == FieldLabel::Repeated {
        return (
            core::mem::size_of::<crate::base::Array>() as u32,
            core::mem::align_of::<crate::base::Array>() as u32,
        );
    }
    match t.ctype() {
        CType::Bool => (1, 1),
        CType::Int32 | CType::UInt32 | CType::Enum | CType::Float => (4, 4),
        CType::Int64 | CType::UInt64 | CType::Double => (8, 8),
        CType::String | CType::Bytes => (
            core::mem::size_of::<crate::base::StrSlot>() as u32,
            core::mem::align_of::<crate::base::StrSlot>() as u32,
        ),
        CType::Message => (
            core::mem::size_of::<*mut u8>() as u32,
            core::mem::align_of::<*mut u8>() as u32,
        ),
    }
}

/// Input to the placement algorithm, decoupled from the descriptor layer so
/// the bootstrap graph can use it too.
#[derive(Clone, Copy, Debug)]
pub struct FieldSpec {
    pub number: u32,
    pub descriptortype: DescriptorType,
    pub label: FieldLabel,
    /// Explicit presence: gets a hasbit.
    pub has_presence: bool,
    pub oneof_index: Option<u16>,
    pub submsg_index: Option<u16>,
}

fn align_up(n: u32, align: u32) -> u32 {
    (n + align - 1) & !(align - 1)
}

/// Assign hasbits and offsets. Hasbit positions start at 1 so that a positive
/// `presence` is unambiguous.
pub(crate) fn build_layout(specs: &[FieldSpec], submsgs: Vec<LayoutId>, extendable: bool) -> MsgLayout {
    let n_hasbits = specs.iter().filter(|s| s.has_presence).count() as u32;
    let mut size = if n_hasbits > 0 { (n_hasbits + 1).div_ceil(8) } else { 0 };

    // Oneof storage: one slot of the max member size per oneof, plus a u32
    // discriminator.
    let n_oneofs = specs
        .iter()
        .filter_map(|s| s.oneof_index)
        .max()
        .map(|i| i as usize + 1)
        .unwrap_or(0);
    let mut oneof_dims = vec![(0u32, 1u32); n_oneofs];
    for s in specs {
        if let Some(oi) = s.oneof_index {
            let (fs, fa) = field_slot(s.descriptortype, s.label);
            let d = &mut oneof_dims[oi as usize];
            d.0 = d.0.max(fs);
            d.1 = d.1.max(fa);
        }
    }

    // Non-oneof fields first, in record order, aligned to natural size.
    let mut offsets = vec![0u32; specs.len()];
    for (i, s) in specs.iter().enumerate() {
        if s.oneof_index.is_some() {
            continue;
        }
        let (fs, fa) = field_slot(s.descriptortype, s.label);
        size = align_up(size, fa);
        offsets[i] = size;
        size += fs;
    }

    // Then one data slot + case slot per oneof.
    let mut oneof_offsets = vec![(0u32, 0u32); n_oneofs]; // (data, case)
    for (oi, &(os, oa)) in oneof_dims.iter().enumerate() {
        if os == 0 {
            continue;
        }
        size = align_up(size, oa.max(4));
        let data = size;
        size += os;
        size = align_up(size, 4);
        let case = size;
        size += 4;
        oneof_offsets[oi] = (data, case);
    }
    for (i, s) in specs.iter().enumerate() {
        if let Some(oi) = s.oneof_index {
            offsets[i] = oneof_offsets[oi as usize].0;
        }
    }

    size = align_up(size.max(1), 8);

    let mut hasbit = 0u32;
    let fields = specs
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let presence = if let Some(oi) = s.oneof_index {
                let case = oneof_offsets[oi as usize].1;
                debug_assert!(case < 0x8000);
                !(case as i32) as i16
            } else if s.has_presence {
                hasbit += 1;
                hasbit as i16
            } else {
                0
            };
            Field {
                number: s.number,
                offset: offsets[i] as u16,
                presence,
                submsg_index: s.submsg_index.unwrap_or(NO_SUBMSG),
                descriptortype: s.descriptortype,
                label: s.label,
            }
        })
        .collect();

    MsgLayout {
        size,
        fields,
        submsgs,
        extendable,
    }
}

pub type LayoutId = u32;

/// Memoizing layout factory. Layouts are built on first request for a
/// `MessageDef` and shared thereafter. Reads after a completed `load` are safe
/// for concurrent readers; writers must be serialized by the caller.
#[derive(Default)]
pub struct LayoutCache {
    inner: RwLock<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
    layouts: Vec<Arc<MsgLayout>>,
    by_name: HashMap<String, LayoutId>,
}

impl LayoutCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: LayoutId) -> Arc<MsgLayout> {
        self.inner.read().unwrap().layouts[id as usize].clone()
    }

    pub fn lookup_name(&self, full_name: &str) -> Option<LayoutId> {
        self.inner.read().unwrap().by_name.get(full_name).copied()
    }

    /// Install a layout built elsewhere (bootstrap graph). The id is fixed at
    /// insertion; submsg references may use ids handed out earlier or later,
    /// as long as they exist before first use.
    pub(crate) fn install(&self, full_name: &str, layout: MsgLayout) -> LayoutId {
        let mut inner = self.inner.write().unwrap();
        let id = inner.layouts.len() as LayoutId;
        inner.layouts.push(Arc::new(layout));
        inner.by_name.insert(full_name.to_string(), id);
        id
    }

    /// Reserve an id with an empty placeholder layout; pair with [`Self::fill`].
    pub(crate) fn reserve(&self, full_name: &str) -> LayoutId {
        self.install(full_name, MsgLayout::default())
    }

    pub(crate) fn fill(&self, id: LayoutId, layout: MsgLayout) {
        self.inner.write().unwrap().layouts[id as usize] = Arc::new(layout);
    }

    /// Get or build the layout for `msg`, recursively resolving child
    /// layouts. A placeholder is registered before recursion so cycles in the
    /// message graph terminate.
    pub fn load(&self, st: &SymTab, msg: MsgId) -> Result<LayoutId, Error> {
        let full_name = st.msg(msg).full_name.clone();
        if let Some(id) = self.lookup_name(&full_name) {
            return Ok(id);
        }
        let id = self.reserve(&full_name);

        let m = st.msg(msg);
        let syntax = st.file(m.file).syntax;
        let mut specs = Vec::with_capacity(m.fields.len());
        // The descriptor layer assigns each submessage field a dense index
        // that doubles as its slot here.
        let mut submsgs = vec![0 as LayoutId; m.submsg_field_count as usize];
        for &fid in &m.fields {
            let f = st.field(fid);
            let submsg_index = match f.subdef {
                SubDef::Msg(sub) => {
                    let idx = f.submsg_index.ok_or_else(|| {
                        Error::new(
                            ErrorKind::SchemaViolation,
                            format!("field {} has no submessage index", f.full_name),
                        )
                    })?;
                    submsgs[idx as usize] = self.load(st, sub)?;
                    Some(idx)
                }
                _ => None,
            };
            if f.descriptortype.ctype() == CType::Message && submsg_index.is_none() {
                return Err(Error::new(
                    ErrorKind::SchemaViolation,
                    format!("field {} has no message type", f.full_name),
                ));
            }
            let oneof_index = f.oneof.map(|oid| st.oneof(oid).index);
            let has_presence = syntax == Syntax::Proto2
                && f.label != FieldLabel::Repeated
                && oneof_index.is_none()
                && f.descriptortype.ctype() != CType::Message;
            specs.push(FieldSpec {
                number: f.number,
                descriptortype: f.descriptortype,
                label: f.label,
                has_presence,
                oneof_index,
                submsg_index,
            });
        }
        let layout = build_layout(&specs, submsgs, m.extendable);
        self.fill(id, layout);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn offsets_are_aligned_and_disjoint() {
        use DescriptorType::*;
        let specs = [
            spec(1, Bool, FieldLabel::Optional),
            spec(2, Double, FieldLabel::Optional),
            spec(3, Int32, FieldLabel::Optional),
            spec(4, String, FieldLabel::Optional),
            spec(5, Int64, FieldLabel::Repeated),
        ];
        let l = build_layout(&specs, vec![], false);
        assert_eq!(l.size % 8, 0);
        let mut spans: Vec<(u32, u32)> = l
            .fields
            .iter()
            .zip(specs.iter())
            .map(|(f, s)| {
                let (fs, fa) = field_slot(s.descriptortype, s.label);
                assert_eq!(f.offset as u32 % fa, 0, "field {} misaligned", f.number);
                (f.offset as u32, fs)
            })
            .collect();
        spans.sort();
        for w in spans.windows(2) {
            assert!(w[0].0 + w[0].1 <= w[1].0, "field slots overlap");
        }
        assert!(spans.last().unwrap().0 + spans.last().unwrap().1 <= l.size);
    }

    #[test]
    fn hasbits_start_at_one() {
        use DescriptorType::*;
        let mut specs = [
            spec(1, Int32, FieldLabel::Optional),
            spec(2, Int32, FieldLabel::Optional),
        ];
        specs[0].has_presence = true;
        specs[1].has_presence = true;
        let l = build_layout(&specs, vec![], false);
        assert_eq!(l.fields[0].presence, 1);
        assert_eq!(l.fields[1].presence, 2);
        // Hasbit byte is reserved: no field offset may be 0.
        assert!(l.fields.iter().all(|f| f.offset > 0));
    }

    #[test]
    fn oneof_members_share_slot() {
        use DescriptorType::*;
        let mut specs = [
            spec(1, Int32, FieldLabel::Optional),
            spec(2, String, FieldLabel::Optional),
            spec(3, Double, FieldLabel::Optional),
        ];
        specs[0].oneof_index = Some(0);
        specs[1].oneof_index = Some(0);
        specs[2].oneof_index = Some(0);
        let l = build_layout(&specs, vec![], false);
        let off = l.fields[0].offset;
        assert!(l.fields.iter().all(|f| f.offset == off));
        let p = l.fields[0].presence;
        assert!(p < 0);
        assert!(l.fields.iter().all(|f| f.presence == p));
        let case_ofs = !(p as i32) as u32;
        // Discriminator must not overlap the shared data slot (StrSlot is
        // the widest member here).
        let (str_size, _) = field_slot(String, FieldLabel::Optional);
        assert!(case_ofs >= off as u32 + str_size);
    }

    #[test]
    fn empty_message_has_nonzero_size() {
        let l = build_layout(&[], vec![], false);
        assert!(l.size >= 8);
    }
}
