//! Bootstrap: the descriptor.proto message layouts and a typed reader over
//! decoded `FileDescriptorProto` messages.
//!
//! The symbol table consumes schemas as serialized `FileDescriptorProto`s,
//! which must themselves be decoded before any descriptor exists. The layout
//! graph for descriptor.proto is therefore built once, from a compact field
//! table, using the same placement algorithm the layout factory applies to
//! user schemas. Only the subset of descriptor.proto this runtime reads is
//! modeled.

use core::marker::PhantomData;
use std::sync::OnceLock;

use crate::arena::Arena;
use crate::base::{Array, Msg, StrSlot};
use crate::layout::{
    build_layout, DescriptorType, FieldLabel, FieldSpec, LayoutCache, LayoutId, MsgLayout,
};
use crate::status::Error;

pub struct BootstrapLayouts {
    pub cache: LayoutCache,
    pub file: LayoutId,
    pub message: LayoutId,
    pub field: LayoutId,
    pub oneof: LayoutId,
    pub enum_type: LayoutId,
    pub enum_value: LayoutId,
    pub ext_range: LayoutId,
    pub file_options: LayoutId,
    pub message_options: LayoutId,
    pub field_options: LayoutId,
}

pub fn layouts() -> &'static BootstrapLayouts {
    static LAYOUTS: OnceLock<BootstrapLayouts> = OnceLock::new();
    LAYOUTS.get_or_init(build)
}

// Field shorthand for the spec tables below. descriptor.proto is proto2:
// singular scalars and strings carry hasbits, submessages do not.
fn scalar(number: u32, t: DescriptorType) -> FieldSpec {
    FieldSpec {
        number,
        descriptortype: t,
        label: FieldLabel::Optional,
        has_presence: true,
        oneof_index: None,
        submsg_index: None,
    }
}

fn rep_str(number: u32) -> FieldSpec {
    FieldSpec {
        number,
        descriptortype: DescriptorType::String,
        label: FieldLabel::Repeated,
        has_presence: false,
        oneof_index: None,
        submsg_index: None,
    }
}

fn msg(number: u32, submsg_index: u16) -> FieldSpec {
    FieldSpec {
        number,
        descriptortype: DescriptorType::Message,
        label: FieldLabel::Optional,
        has_presence: false,
        oneof_index: None,
        submsg_index: Some(submsg_index),
    }
}

fn rep_msg(number: u32, submsg_index: u16) -> FieldSpec {
    FieldSpec {
        label: FieldLabel::Repeated,
        ..msg(number, submsg_index)
    }
}

fn build() -> BootstrapLayouts {
    let cache = LayoutCache::new();
    let file = cache.reserve("google.protobuf.FileDescriptorProto");
    let message = cache.reserve("google.protobuf.DescriptorProto");
    let field = cache.reserve("google.protobuf.FieldDescriptorProto");
    let oneof = cache.reserve("google.protobuf.OneofDescriptorProto");
    let enum_type = cache.reserve("google.protobuf.EnumDescriptorProto");
    let enum_value = cache.reserve("google.protobuf.EnumValueDescriptorProto");
    let ext_range = cache.reserve("google.protobuf.DescriptorProto.ExtensionRange");
    let file_options = cache.reserve("google.protobuf.FileOptions");
    let message_options = cache.reserve("google.protobuf.MessageOptions");
    let field_options = cache.reserve("google.protobuf.FieldOptions");

    use DescriptorType::*;

    cache.fill(
        file,
        build_layout(
            &[
                scalar(1, String),   // name
                scalar(2, String),   // package
                rep_str(3),          // dependency
                rep_msg(4, 0),       // message_type
                rep_msg(5, 1),       // enum_type
                rep_msg(7, 2),       // extension
                msg(8, 3),           // options
                scalar(12, String),  // syntax
            ],
            vec![message, enum_type, field, file_options],
            false,
        ),
    );

    cache.fill(
        message,
        build_layout(
            &[
                scalar(1, String), // name
                rep_msg(2, 0),     // field
                rep_msg(3, 1),     // nested_type
                rep_msg(4, 2),     // enum_type
                rep_msg(5, 3),     // extension_range
                rep_msg(6, 4),     // extension
                msg(7, 5),         // options
                rep_msg(8, 6),     // oneof_decl
            ],
            vec![
                field,
                message,
                enum_type,
                ext_range,
                field,
                message_options,
                oneof,
            ],
            false,
        ),
    );

    cache.fill(
        field,
        build_layout(
            &[
                scalar(1, String),  // name
                scalar(2, String),  // extendee
                scalar(3, Int32),   // number
                scalar(4, Int32),   // label
                scalar(5, Int32),   // type
                scalar(6, String),  // type_name
                scalar(7, String),  // default_value
                msg(8, 0),          // options
                scalar(9, Int32),   // oneof_index
                scalar(10, String), // json_name
            ],
            vec![field_options],
            false,
        ),
    );

    cache.fill(oneof, build_layout(&[scalar(1, String)], vec![], false));

    cache.fill(
        enum_type,
        build_layout(
            &[scalar(1, String), rep_msg(2, 0)],
            vec![enum_value],
            false,
        ),
    );

    cache.fill(
        enum_value,
        build_layout(&[scalar(1, String), scalar(2, Int32)], vec![], false),
    );

    cache.fill(
        ext_range,
        build_layout(&[scalar(1, Int32), scalar(2, Int32)], vec![], false),
    );

    cache.fill(
        file_options,
        build_layout(&[scalar(40, String), scalar(41, String)], vec![], false),
    );

    cache.fill(message_options, build_layout(&[scalar(7, Bool)], vec![], false));

    cache.fill(
        field_options,
        build_layout(&[scalar(2, Bool), scalar(5, Bool)], vec![], false),
    );

    BootstrapLayouts {
        cache,
        file,
        message,
        field,
        oneof,
        enum_type,
        enum_value,
        ext_range,
        file_options,
        message_options,
        field_options,
    }
}

// Typed reads against a layout. Presence of proto2 scalars is the hasbit;
// the returned references are valid for as long as the backing arena, which
// the view lifetimes tie down.

fn present(msg: Msg, l: &MsgLayout, number: u32) -> Option<crate::layout::Field> {
    let f = *l.field(number)?;
    if f.presence > 0 && !msg.has_bit(f.presence as u16) {
        return None;
    }
    Some(f)
}

fn get_str<'a>(msg: Msg, l: &MsgLayout, number: u32) -> Option<&'a str> {
    let f = present(msg, l, number)?;
    let slot = unsafe { msg.get::<StrSlot>(f.offset) };
    let bytes: &'a [u8] = unsafe { core::mem::transmute::<&[u8], &'a [u8]>(slot.as_bytes()) };
    core::str::from_utf8(bytes).ok()
}

fn get_i32(msg: Msg, l: &MsgLayout, number: u32) -> Option<i32> {
    let f = present(msg, l, number)?;
    Some(unsafe { msg.get::<i32>(f.offset) })
}

fn get_bool(msg: Msg, l: &MsgLayout, number: u32) -> Option<bool> {
    let f = present(msg, l, number)?;
    Some(unsafe { msg.get::<u8>(f.offset) } != 0)
}

fn get_submsg(msg: Msg, l: &MsgLayout, number: u32) -> Option<Msg> {
    let f = l.field(number)?;
    msg.get_msg(f.offset)
}

fn rep_submsgs(msg: Msg, l: &MsgLayout, number: u32) -> Vec<Msg> {
    let Some(f) = l.field(number) else {
        return Vec::new();
    };
    let arr = unsafe { msg.field_ref::<Array>(f.offset) };
    unsafe { arr.as_slice::<*mut u8>() }
        .iter()
        .filter_map(|&p| Msg::from_raw(p))
        .collect()
}

fn rep_strs<'a>(msg: Msg, l: &MsgLayout, number: u32) -> Vec<&'a str> {
    let Some(f) = l.field(number) else {
        return Vec::new();
    };
    let arr = unsafe { msg.field_ref::<Array>(f.offset) };
    unsafe { arr.as_slice::<StrSlot>() }
        .iter()
        .filter_map(|s| {
            let bytes: &'a [u8] =
                unsafe { core::mem::transmute::<&[u8], &'a [u8]>(s.as_bytes()) };
            core::str::from_utf8(bytes).ok()
        })
        .collect()
}

macro_rules! view {
    ($name:ident) => {
        #[derive(Clone, Copy)]
        pub struct $name<'a> {
            msg: Msg,
            _arena: PhantomData<&'a ()>,
        }

        impl<'a> $name<'a> {
            fn wrap(msg: Msg) -> Self {
                Self {
                    msg,
                    _arena: PhantomData,
                }
            }
        }
    };
}

view!(FileDescriptorProto);
view!(DescriptorProto);
view!(FieldDescriptorProto);
view!(OneofDescriptorProto);
view!(EnumDescriptorProto);
view!(EnumValueDescriptorProto);
view!(FileOptions);
view!(FieldOptions);

impl<'a> FileDescriptorProto<'a> {
    /// Decode serialized descriptor bytes into a readable view. The view
    /// borrows the arena that owns the decoded message.
    pub fn decode(bytes: &[u8], arena: &'a mut Arena<'_>) -> Result<Self, Error> {
        let b = layouts();
        let layout = b.cache.get(b.file);
        let msg = Msg::new(&layout, arena)?;
        crate::decoding::decode(bytes, msg, &b.cache, b.file, arena)?;
        Ok(Self::wrap(msg))
    }

    fn layout(&self) -> std::sync::Arc<MsgLayout> {
        layouts().cache.get(layouts().file)
    }

    pub fn name(&self) -> Option<&'a str> {
        get_str(self.msg, &self.layout(), 1)
    }

    pub fn package(&self) -> Option<&'a str> {
        get_str(self.msg, &self.layout(), 2)
    }

    pub fn syntax(&self) -> Option<&'a str> {
        get_str(self.msg, &self.layout(), 12)
    }

    pub fn dependencies(&self) -> Vec<&'a str> {
        rep_strs(self.msg, &self.layout(), 3)
    }

    pub fn messages(&self) -> Vec<DescriptorProto<'a>> {
        rep_submsgs(self.msg, &self.layout(), 4)
            .into_iter()
            .map(DescriptorProto::wrap)
            .collect()
    }

    pub fn enums(&self) -> Vec<EnumDescriptorProto<'a>> {
        rep_submsgs(self.msg, &self.layout(), 5)
            .into_iter()
            .map(EnumDescriptorProto::wrap)
            .collect()
    }

    pub fn extensions(&self) -> Vec<FieldDescriptorProto<'a>> {
        rep_submsgs(self.msg, &self.layout(), 7)
            .into_iter()
            .map(FieldDescriptorProto::wrap)
            .collect()
    }

    pub fn options(&self) -> Option<FileOptions<'a>> {
        get_submsg(self.msg, &self.layout(), 8).map(FileOptions::wrap)
    }
}

impl<'a> DescriptorProto<'a> {
    fn layout(&self) -> std::sync::Arc<MsgLayout> {
        layouts().cache.get(layouts().message)
    }

    pub fn name(&self) -> Option<&'a str> {
        get_str(self.msg, &self.layout(), 1)
    }

    pub fn fields(&self) -> Vec<FieldDescriptorProto<'a>> {
        rep_submsgs(self.msg, &self.layout(), 2)
            .into_iter()
            .map(FieldDescriptorProto::wrap)
            .collect()
    }

    pub fn nested_types(&self) -> Vec<DescriptorProto<'a>> {
        rep_submsgs(self.msg, &self.layout(), 3)
            .into_iter()
            .map(DescriptorProto::wrap)
            .collect()
    }

    pub fn enums(&self) -> Vec<EnumDescriptorProto<'a>> {
        rep_submsgs(self.msg, &self.layout(), 4)
            .into_iter()
            .map(EnumDescriptorProto::wrap)
            .collect()
    }

    pub fn has_extension_ranges(&self) -> bool {
        !rep_submsgs(self.msg, &self.layout(), 5).is_empty()
    }

    pub fn oneof_decls(&self) -> Vec<OneofDescriptorProto<'a>> {
        rep_submsgs(self.msg, &self.layout(), 8)
            .into_iter()
            .map(OneofDescriptorProto::wrap)
            .collect()
    }

    pub fn map_entry(&self) -> bool {
        let b = layouts();
        get_submsg(self.msg, &self.layout(), 7)
            .and_then(|o| get_bool(o, &b.cache.get(b.message_options), 7))
            .unwrap_or(false)
    }
}

impl<'a> FieldDescriptorProto<'a> {
    fn layout(&self) -> std::sync::Arc<MsgLayout> {
        layouts().cache.get(layouts().field)
    }

    pub fn name(&self) -> Option<&'a str> {
        get_str(self.msg, &self.layout(), 1)
    }

    pub fn extendee(&self) -> Option<&'a str> {
        get_str(self.msg, &self.layout(), 2)
    }

    pub fn number(&self) -> Option<i32> {
        get_i32(self.msg, &self.layout(), 3)
    }

    pub fn label(&self) -> Option<i32> {
        get_i32(self.msg, &self.layout(), 4)
    }

    pub fn type_(&self) -> Option<i32> {
        get_i32(self.msg, &self.layout(), 5)
    }

    pub fn type_name(&self) -> Option<&'a str> {
        get_str(self.msg, &self.layout(), 6)
    }

    pub fn default_value(&self) -> Option<&'a str> {
        get_str(self.msg, &self.layout(), 7)
    }

    pub fn options(&self) -> Option<FieldOptions<'a>> {
        get_submsg(self.msg, &self.layout(), 8).map(FieldOptions::wrap)
    }

    pub fn oneof_index(&self) -> Option<i32> {
        get_i32(self.msg, &self.layout(), 9)
    }

    pub fn json_name(&self) -> Option<&'a str> {
        get_str(self.msg, &self.layout(), 10)
    }
}

impl<'a> OneofDescriptorProto<'a> {
    pub fn name(&self) -> Option<&'a str> {
        let b = layouts();
        get_str(self.msg, &b.cache.get(b.oneof), 1)
    }
}

impl<'a> EnumDescriptorProto<'a> {
    fn layout(&self) -> std::sync::Arc<MsgLayout> {
        layouts().cache.get(layouts().enum_type)
    }

    pub fn name(&self) -> Option<&'a str> {
        get_str(self.msg, &self.layout(), 1)
    }

    pub fn values(&self) -> Vec<EnumValueDescriptorProto<'a>> {
        rep_submsgs(self.msg, &self.layout(), 2)
            .into_iter()
            .map(EnumValueDescriptorProto::wrap)
            .collect()
    }
}

impl<'a> EnumValueDescriptorProto<'a> {
    pub fn name(&self) -> Option<&'a str> {
        let b = layouts();
        get_str(self.msg, &b.cache.get(b.enum_value), 1)
    }

    pub fn number(&self) -> Option<i32> {
        let b = layouts();
        get_i32(self.msg, &b.cache.get(b.enum_value), 2)
    }
}

impl<'a> FileOptions<'a> {
    pub fn php_class_prefix(&self) -> Option<&'a str> {
        let b = layouts();
        get_str(self.msg, &b.cache.get(b.file_options), 40)
    }

    pub fn php_namespace(&self) -> Option<&'a str> {
        let b = layouts();
        get_str(self.msg, &b.cache.get(b.file_options), 41)
    }
}

impl<'a> FieldOptions<'a> {
    pub fn packed(&self) -> Option<bool> {
        let b = layouts();
        get_bool(self.msg, &b.cache.get(b.field_options), 2)
    }

    pub fn lazy(&self) -> bool {
        let b = layouts();
        get_bool(self.msg, &b.cache.get(b.field_options), 5).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{enum_type, field, file, message, msg_field};
    use allocator_api2::alloc::Global;

    #[test]
    fn layout_graph_builds() {
        let b = layouts();
        for id in [
            b.file,
            b.message,
            b.field,
            b.oneof,
            b.enum_type,
            b.enum_value,
            b.ext_range,
            b.file_options,
            b.message_options,
            b.field_options,
        ] {
            let l = b.cache.get(id);
            assert!(l.size >= 8);
            assert!(!l.fields.is_empty());
        }
    }

    #[test]
    fn reader_walks_decoded_file() {
        let tf = file("demo.proto", "demo", "proto3")
            .with_message(
                message("Person")
                    .with_field(field("name", 1, "string"))
                    .with_field(field("id", 2, "int32"))
                    .with_field(msg_field("boss", 3, ".demo.Person")),
            )
            .with_enum(enum_type("Kind", &[("NONE", 0), ("ADMIN", 1)]));
        let bytes = tf.encode();

        let mut arena = Arena::new(&Global);
        let fdp = FileDescriptorProto::decode(&bytes, &mut arena).unwrap();
        assert_eq!(fdp.name(), Some("demo.proto"));
        assert_eq!(fdp.package(), Some("demo"));
        assert_eq!(fdp.syntax(), Some("proto3"));

        let msgs = fdp.messages();
        assert_eq!(msgs.len(), 1);
        let person = &msgs[0];
        assert_eq!(person.name(), Some("Person"));
        let fields = person.fields();
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[0].name(), Some("name"));
        assert_eq!(fields[0].number(), Some(1));
        assert_eq!(fields[0].type_(), Some(9)); // TYPE_STRING
        assert_eq!(fields[2].type_name(), Some(".demo.Person"));
        assert_eq!(fields[2].default_value(), None);

        let enums = fdp.enums();
        assert_eq!(enums.len(), 1);
        let vals = enums[0].values();
        assert_eq!(vals.len(), 2);
        assert_eq!(vals[1].name(), Some("ADMIN"));
        assert_eq!(vals[1].number(), Some(1));
    }
}
