//! Test schema builders.
//!
//! Hand-encodes `FileDescriptorProto` wire bytes from a compact builder, so
//! tests exercise the real bootstrap decode path instead of constructing defs
//! directly. Also provides the well-known-type descriptors the JSON tests
//! need.

use crate::wire::{make_tag, put_varint, WireType};

fn put_tag(buf: &mut Vec<u8>, number: u32, wt: WireType) {
    put_varint(buf, make_tag(number, wt) as u64);
}

fn put_str_field(buf: &mut Vec<u8>, number: u32, s: &str) {
    put_tag(buf, number, WireType::Delimited);
    put_varint(buf, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

fn put_varint_field(buf: &mut Vec<u8>, number: u32, v: i64) {
    put_tag(buf, number, WireType::Varint);
    put_varint(buf, v as u64);
}

fn put_msg_field(buf: &mut Vec<u8>, number: u32, child: &[u8]) {
    put_tag(buf, number, WireType::Delimited);
    put_varint(buf, child.len() as u64);
    buf.extend_from_slice(child);
}

fn type_number(t: &str) -> i32 {
    match t {
        "double" => 1,
        "float" => 2,
        "int64" => 3,
        "uint64" => 4,
        "int32" => 5,
        "fixed64" => 6,
        "fixed32" => 7,
        "bool" => 8,
        "string" => 9,
        "group" => 10,
        "message" => 11,
        "bytes" => 12,
        "uint32" => 13,
        "enum" => 14,
        "sfixed32" => 15,
        "sfixed64" => 16,
        "sint32" => 17,
        "sint64" => 18,
        _ => panic!("unknown field type: {t}"),
    }
}

fn upper_camel(name: &str) -> String {
    let mut out = String::new();
    let mut upper_next = true;
    for c in name.chars() {
        if c == '_' {
            upper_next = true;
        } else if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

#[derive(Clone)]
pub struct TestField {
    name: String,
    number: u32,
    type_: i32,
    type_name: Option<String>,
    label: i32,
    default: Option<String>,
    oneof_index: Option<i32>,
    json_name: Option<String>,
}

pub fn field(name: &str, number: u32, t: &str) -> TestField {
    TestField {
        name: name.to_owned(),
        number,
        type_: type_number(t),
        type_name: None,
        label: 1,
        default: None,
        oneof_index: None,
        json_name: None,
    }
}

/// A message-typed field; `type_name` may be absolute (leading dot) or
/// relative to the containing scope.
pub fn msg_field(name: &str, number: u32, type_name: &str) -> TestField {
    TestField {
        type_name: Some(type_name.to_owned()),
        ..field(name, number, "message")
    }
}

pub fn enum_field(name: &str, number: u32, type_name: &str) -> TestField {
    TestField {
        type_name: Some(type_name.to_owned()),
        ..field(name, number, "enum")
    }
}

impl TestField {
    pub fn repeated(mut self) -> Self {
        self.label = 3;
        self
    }

    pub fn required(mut self) -> Self {
        self.label = 2;
        self
    }

    pub fn with_default(mut self, v: &str) -> Self {
        self.default = Some(v.to_owned());
        self
    }

    pub fn in_oneof(mut self, index: i32) -> Self {
        self.oneof_index = Some(index);
        self
    }

    pub fn with_json_name(mut self, v: &str) -> Self {
        self.json_name = Some(v.to_owned());
        self
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_str_field(&mut buf, 1, &self.name);
        put_varint_field(&mut buf, 3, self.number as i64);
        put_varint_field(&mut buf, 4, self.label as i64);
        put_varint_field(&mut buf, 5, self.type_ as i64);
        if let Some(tn) = &self.type_name {
            put_str_field(&mut buf, 6, tn);
        }
        if let Some(d) = &self.default {
            put_str_field(&mut buf, 7, d);
        }
        if let Some(oi) = self.oneof_index {
            put_varint_field(&mut buf, 9, oi as i64);
        }
        if let Some(j) = &self.json_name {
            put_str_field(&mut buf, 10, j);
        }
        buf
    }
}

pub struct MapField {
    name: String,
    number: u32,
    key_type: String,
    value_type: String,
}

/// `value_type` is a scalar type name, or a message type name starting with
/// `.`.
pub fn map_field(name: &str, number: u32, key_type: &str, value_type: &str) -> MapField {
    MapField {
        name: name.to_owned(),
        number,
        key_type: key_type.to_owned(),
        value_type: value_type.to_owned(),
    }
}

#[derive(Clone)]
pub struct TestMsg {
    name: String,
    fields: Vec<TestField>,
    nested: Vec<TestMsg>,
    oneofs: Vec<String>,
    map_entry: bool,
}

pub fn message(name: &str) -> TestMsg {
    TestMsg {
        name: name.to_owned(),
        fields: Vec::new(),
        nested: Vec::new(),
        oneofs: Vec::new(),
        map_entry: false,
    }
}

impl TestMsg {
    pub fn with_field(mut self, f: TestField) -> Self {
        self.fields.push(f);
        self
    }

    pub fn with_nested(mut self, m: TestMsg) -> Self {
        self.nested.push(m);
        self
    }

    pub fn with_oneof(mut self, name: &str) -> Self {
        self.oneofs.push(name.to_owned());
        self
    }

    pub fn mark_map_entry(mut self) -> Self {
        self.map_entry = true;
        self
    }

    /// Adds the synthesized entry message and the repeated entry field, the
    /// way protoc lowers a `map<K, V>` declaration.
    pub fn with_map_field(mut self, m: MapField) -> Self {
        let entry_name = format!("{}Entry", upper_camel(&m.name));
        let value = if let Some(stripped) = m.value_type.strip_prefix('.') {
            msg_field("value", 2, &format!(".{stripped}"))
        } else {
            field("value", 2, &m.value_type)
        };
        let entry = message(&entry_name)
            .with_field(field("key", 1, &m.key_type))
            .with_field(value)
            .mark_map_entry();
        self.nested.push(entry);
        self.fields
            .push(msg_field(&m.name, m.number, &entry_name).repeated());
        self
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_str_field(&mut buf, 1, &self.name);
        for f in &self.fields {
            put_msg_field(&mut buf, 2, &f.encode());
        }
        for n in &self.nested {
            put_msg_field(&mut buf, 3, &n.encode());
        }
        if self.map_entry {
            let mut opts = Vec::new();
            put_varint_field(&mut opts, 7, 1);
            put_msg_field(&mut buf, 7, &opts);
        }
        for o in &self.oneofs {
            let mut decl = Vec::new();
            put_str_field(&mut decl, 1, o);
            put_msg_field(&mut buf, 8, &decl);
        }
        buf
    }
}

#[derive(Clone)]
pub struct TestEnum {
    name: String,
    values: Vec<(String, i32)>,
}

pub fn enum_type(name: &str, values: &[(&str, i32)]) -> TestEnum {
    TestEnum {
        name: name.to_owned(),
        values: values
            .iter()
            .map(|(n, v)| ((*n).to_owned(), *v))
            .collect(),
    }
}

impl TestEnum {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_str_field(&mut buf, 1, &self.name);
        for (n, v) in &self.values {
            let mut val = Vec::new();
            put_str_field(&mut val, 1, n);
            put_varint_field(&mut val, 2, *v as i64);
            put_msg_field(&mut buf, 2, &val);
        }
        buf
    }
}

pub struct TestFile {
    name: String,
    package: String,
    syntax: String,
    deps: Vec<String>,
    msgs: Vec<TestMsg>,
    enums: Vec<TestEnum>,
}

pub fn file(name: &str, package: &str, syntax: &str) -> TestFile {
    TestFile {
        name: name.to_owned(),
        package: package.to_owned(),
        syntax: syntax.to_owned(),
        deps: Vec::new(),
        msgs: Vec::new(),
        enums: Vec::new(),
    }
}

impl TestFile {
    pub fn with_message(mut self, m: TestMsg) -> Self {
        self.msgs.push(m);
        self
    }

    pub fn with_enum(mut self, e: TestEnum) -> Self {
        self.enums.push(e);
        self
    }

    pub fn with_dependency(mut self, name: &str) -> Self {
        self.deps.push(name.to_owned());
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_str_field(&mut buf, 1, &self.name);
        if !self.package.is_empty() {
            put_str_field(&mut buf, 2, &self.package);
        }
        for d in &self.deps {
            put_str_field(&mut buf, 3, d);
        }
        for m in &self.msgs {
            put_msg_field(&mut buf, 4, &m.encode());
        }
        for e in &self.enums {
            put_msg_field(&mut buf, 5, &e.encode());
        }
        put_str_field(&mut buf, 12, &self.syntax);
        buf
    }
}

fn wrapper(name: &str, t: &str) -> TestMsg {
    message(name).with_field(field("value", 1, t))
}

/// Descriptors for the well-known types, as one file under the
/// `google.protobuf` package.
pub fn wkt_file() -> TestFile {
    file("google/protobuf/well_known.proto", "google.protobuf", "proto3")
        .with_message(
            message("Any")
                .with_field(field("type_url", 1, "string"))
                .with_field(field("value", 2, "bytes")),
        )
        .with_message(
            message("Duration")
                .with_field(field("seconds", 1, "int64"))
                .with_field(field("nanos", 2, "int32")),
        )
        .with_message(
            message("Timestamp")
                .with_field(field("seconds", 1, "int64"))
                .with_field(field("nanos", 2, "int32")),
        )
        .with_message(message("FieldMask").with_field(field("paths", 1, "string").repeated()))
        .with_message(
            message("Struct")
                .with_map_field(map_field("fields", 1, "string", ".google.protobuf.Value")),
        )
        .with_message(
            message("Value")
                .with_oneof("kind")
                .with_field(
                    enum_field("null_value", 1, ".google.protobuf.NullValue").in_oneof(0),
                )
                .with_field(field("number_value", 2, "double").in_oneof(0))
                .with_field(field("string_value", 3, "string").in_oneof(0))
                .with_field(field("bool_value", 4, "bool").in_oneof(0))
                .with_field(msg_field("struct_value", 5, ".google.protobuf.Struct").in_oneof(0))
                .with_field(msg_field("list_value", 6, ".google.protobuf.ListValue").in_oneof(0)),
        )
        .with_message(
            message("ListValue")
                .with_field(msg_field("values", 1, ".google.protobuf.Value").repeated()),
        )
        .with_message(wrapper("DoubleValue", "double"))
        .with_message(wrapper("FloatValue", "float"))
        .with_message(wrapper("Int64Value", "int64"))
        .with_message(wrapper("UInt64Value", "uint64"))
        .with_message(wrapper("Int32Value", "int32"))
        .with_message(wrapper("UInt32Value", "uint32"))
        .with_message(wrapper("BoolValue", "bool"))
        .with_message(wrapper("StringValue", "string"))
        .with_message(wrapper("BytesValue", "bytes"))
        .with_enum(enum_type("NullValue", &[("NULL_VALUE", 0)]))
}
