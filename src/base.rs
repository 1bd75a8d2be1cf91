//! The arena-owned message runtime.
//!
//! A [`Msg`] is a pointer into arena memory laid out per a
//! [`MsgLayout`](crate::layout::MsgLayout): the public pointer addresses the
//! first user byte, and an internal header (the unknown-field buffer, plus an
//! extension slot for extendable messages) sits at negative offsets. Field
//! access goes through typed offset reads and writes; the layout is the single
//! source of truth for what lives where.
//!
//! None of these types implement `Drop`: all storage is released when the
//! owning arena goes away.

use core::alloc::Layout;
use core::ptr::NonNull;

use crate::arena::Arena;
use crate::layout::{Field, MsgLayout};
use crate::status::Error;

/// Growable element storage for repeated fields. Element size is derived from
/// the field type by the codec; the array itself is type-erased.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Array {
    data: *mut u8,
    len: usize,
    cap: usize,
}

const MIN_ARRAY_CAP: usize = 8;

impl Array {
    pub const fn new() -> Self {
        Array {
            data: core::ptr::null_mut(),
            len: 0,
            cap: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// View the elements as a typed slice.
    ///
    /// Safety: `T` must match the element type every prior push used.
    pub unsafe fn as_slice<T>(&self) -> &[T] {
        if self.len == 0 {
            return &[];
        }
        unsafe { core::slice::from_raw_parts(self.data as *const T, self.len) }
    }

    /// Safety: as [`Self::as_slice`].
    pub unsafe fn as_mut_slice<T>(&mut self) -> &mut [T] {
        if self.len == 0 {
            return &mut [];
        }
        unsafe { core::slice::from_raw_parts_mut(self.data as *mut T, self.len) }
    }

    fn grow(
        &mut self,
        elem_size: usize,
        elem_align: usize,
        min_cap: usize,
        arena: &mut Arena,
    ) -> Result<(), Error> {
        let new_cap = self.cap.max(MIN_ARRAY_CAP / 2) * 2;
        let new_cap = new_cap.max(min_cap);
        let new_layout = Layout::from_size_align(elem_size * new_cap, elem_align).unwrap();
        let new_ptr = arena.alloc_raw(new_layout)?;
        if self.len > 0 {
            unsafe {
                core::ptr::copy_nonoverlapping(self.data, new_ptr.as_ptr(), elem_size * self.len);
            }
        }
        self.data = new_ptr.as_ptr();
        self.cap = new_cap;
        Ok(())
    }

    /// Safety: `T` must match the element type of this array.
    pub unsafe fn push<T: Copy>(&mut self, val: T, arena: &mut Arena) -> Result<(), Error> {
        if self.len == self.cap {
            self.grow(
                core::mem::size_of::<T>(),
                core::mem::align_of::<T>(),
                0,
                arena,
            )?;
        }
        unsafe {
            (self.data as *mut T).add(self.len).write(val);
        }
        self.len += 1;
        Ok(())
    }

    /// Byte-wise append; used for the unknown-field buffer.
    pub fn append_bytes(&mut self, bytes: &[u8], arena: &mut Arena) -> Result<(), Error> {
        if self.len + bytes.len() > self.cap {
            self.grow(1, 1, self.len + bytes.len(), arena)?;
        }
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), self.data.add(self.len), bytes.len());
        }
        self.len += bytes.len();
        Ok(())
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { self.as_slice::<u8>() }
    }
}

impl Default for Array {
    fn default() -> Self {
        Self::new()
    }
}

/// An arena-owned byte string: the storage for `string` and `bytes` fields.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct StrSlot {
    ptr: *const u8,
    len: usize,
}

impl StrSlot {
    pub const fn empty() -> Self {
        StrSlot {
            ptr: core::ptr::null(),
            len: 0,
        }
    }

    pub fn from_bytes(bytes: &[u8], arena: &mut Arena) -> Result<Self, Error> {
        if bytes.is_empty() {
            return Ok(Self::empty());
        }
        let p = arena.copy_bytes(bytes)?;
        Ok(StrSlot {
            ptr: p.as_ptr(),
            len: bytes.len(),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        unsafe { core::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

// Header preceding the user bytes of every message. Extendable messages get
// one extra pointer slot in front of it.
#[repr(C)]
struct MsgHeader {
    unknown: Array,
}

const HEADER_SIZE: usize = core::mem::size_of::<MsgHeader>();
const EXT_SLOT_SIZE: usize = core::mem::size_of::<*mut u8>();

/// A message instance. Copyable pointer; the pointee is owned by an arena.
#[derive(Clone, Copy, Debug)]
pub struct Msg(NonNull<u8>);

impl Msg {
    /// Allocate a zeroed message for `layout`.
    pub fn new(layout: &MsgLayout, arena: &mut Arena) -> Result<Msg, Error> {
        let header = HEADER_SIZE + if layout.extendable { EXT_SLOT_SIZE } else { 0 };
        let total = header + layout.size as usize;
        let mem = arena.alloc_zeroed(Layout::from_size_align(total, 8).unwrap())?;
        Ok(Msg(unsafe {
            NonNull::new_unchecked(mem.as_ptr().add(header))
        }))
    }

    pub(crate) fn from_raw(ptr: *mut u8) -> Option<Msg> {
        NonNull::new(ptr).map(Msg)
    }

    pub(crate) fn as_raw(&self) -> *mut u8 {
        self.0.as_ptr()
    }

    fn header(&self) -> *mut MsgHeader {
        unsafe { self.0.as_ptr().sub(HEADER_SIZE) as *mut MsgHeader }
    }

    /// Safety: `offset` + `size_of::<T>()` must lie inside the layout this
    /// message was allocated with, and `T` must match the field type there.
    pub unsafe fn get<T: Copy>(&self, offset: u16) -> T {
        unsafe { core::ptr::read(self.0.as_ptr().add(offset as usize) as *const T) }
    }

    /// Safety: as [`Self::get`].
    pub unsafe fn set<T>(&mut self, offset: u16, val: T) {
        unsafe { core::ptr::write(self.0.as_ptr().add(offset as usize) as *mut T, val) }
    }

    /// Safety: as [`Self::get`].
    pub unsafe fn field_ref<T>(&self, offset: u16) -> &T {
        unsafe { &*(self.0.as_ptr().add(offset as usize) as *const T) }
    }

    /// Safety: as [`Self::get`].
    pub unsafe fn field_mut<T>(&mut self, offset: u16) -> &mut T {
        unsafe { &mut *(self.0.as_ptr().add(offset as usize) as *mut T) }
    }

    pub fn has_bit(&self, idx: u16) -> bool {
        let byte = unsafe { self.get::<u8>(idx / 8) };
        byte & (1 << (idx % 8)) != 0
    }

    pub fn set_has_bit(&mut self, idx: u16) {
        unsafe {
            let p = self.0.as_ptr().add(idx as usize / 8);
            *p |= 1 << (idx % 8);
        }
    }

    pub fn oneof_case(&self, case_offset: u16) -> u32 {
        unsafe { self.get::<u32>(case_offset) }
    }

    pub fn set_oneof_case(&mut self, case_offset: u16, number: u32) {
        unsafe { self.set::<u32>(case_offset, number) }
    }

    /// Record presence per the field's `presence` encoding. Implicit-presence
    /// fields need no bookkeeping.
    pub fn mark_present(&mut self, f: &Field) {
        if f.presence > 0 {
            self.set_has_bit(f.presence as u16);
        } else if f.presence < 0 {
            self.set_oneof_case(!(f.presence as i32) as u16, f.number);
        }
    }

    /// Singular submessage pointer, null when absent.
    pub fn get_msg(&self, offset: u16) -> Option<Msg> {
        Msg::from_raw(unsafe { self.get::<*mut u8>(offset) })
    }

    pub fn set_msg(&mut self, offset: u16, child: Msg) {
        unsafe { self.set::<*mut u8>(offset, child.as_raw()) }
    }

    pub fn unknown(&self) -> &[u8] {
        unsafe { (*self.header()).unknown.as_bytes() }
    }

    pub fn append_unknown(&mut self, bytes: &[u8], arena: &mut Arena) -> Result<(), Error> {
        unsafe { (*self.header()).unknown.append_bytes(bytes, arena) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{build_layout, DescriptorType, FieldLabel, FieldSpec};
    use allocator_api2::alloc::Global;

    fn test_layout() -> MsgLayout {
        let specs = [
            FieldSpec {
                number: 1,
                descriptortype: DescriptorType::Int32,
                label: FieldLabel::Optional,
                has_presence: true,
                oneof_index: None,
                submsg_index: None,
            },
            FieldSpec {
                number: 2,
                descriptortype: DescriptorType::String,
                label: FieldLabel::Optional,
                has_presence: true,
                oneof_index: None,
                submsg_index: None,
            },
            FieldSpec {
                number: 3,
                descriptortype: DescriptorType::Int64,
                label: FieldLabel::Repeated,
                has_presence: false,
                oneof_index: None,
                submsg_index: None,
            },
        ];
        build_layout(&specs, vec![], false)
    }

    #[test]
    fn zeroed_on_creation() {
        let mut arena = Arena::new(&Global);
        let layout = test_layout();
        let msg = Msg::new(&layout, &mut arena).unwrap();
        let f = layout.field(1).unwrap();
        assert!(!msg.has_bit(f.presence as u16));
        assert_eq!(unsafe { msg.get::<i32>(f.offset) }, 0);
        assert!(msg.unknown().is_empty());
    }

    #[test]
    fn scalar_set_get() {
        let mut arena = Arena::new(&Global);
        let layout = test_layout();
        let mut msg = Msg::new(&layout, &mut arena).unwrap();
        let f = *layout.field(1).unwrap();
        unsafe { msg.set::<i32>(f.offset, -42) };
        msg.mark_present(&f);
        assert_eq!(unsafe { msg.get::<i32>(f.offset) }, -42);
        assert!(msg.has_bit(f.presence as u16));
    }

    #[test]
    fn string_slot_owned_by_arena() {
        let mut arena = Arena::new(&Global);
        let layout = test_layout();
        let mut msg = Msg::new(&layout, &mut arena).unwrap();
        let f = *layout.field(2).unwrap();
        let src = b"hello".to_vec();
        let slot = StrSlot::from_bytes(&src, &mut arena).unwrap();
        drop(src);
        unsafe { msg.set::<StrSlot>(f.offset, slot) };
        let got = unsafe { msg.get::<StrSlot>(f.offset) };
        assert_eq!(got.as_bytes(), b"hello");
    }

    #[test]
    fn repeated_push_and_read() {
        let mut arena = Arena::new(&Global);
        let layout = test_layout();
        let mut msg = Msg::new(&layout, &mut arena).unwrap();
        let f = *layout.field(3).unwrap();
        for i in 0..100i64 {
            let arr = unsafe { msg.field_mut::<Array>(f.offset) };
            unsafe { arr.push(i, &mut arena).unwrap() };
        }
        let arr = unsafe { msg.field_ref::<Array>(f.offset) };
        let vals = unsafe { arr.as_slice::<i64>() };
        assert_eq!(vals.len(), 100);
        assert_eq!(vals[0], 0);
        assert_eq!(vals[99], 99);
    }

    #[test]
    fn unknown_buffer_appends() {
        let mut arena = Arena::new(&Global);
        let layout = test_layout();
        let mut msg = Msg::new(&layout, &mut arena).unwrap();
        msg.append_unknown(&[1, 2, 3], &mut arena).unwrap();
        msg.append_unknown(&[4, 5], &mut arena).unwrap();
        assert_eq!(msg.unknown(), &[1, 2, 3, 4, 5]);
    }
}
