//! Schema descriptors: files, messages, fields, enums, oneofs, and the
//! symbol table that owns them.
//!
//! Defs are built from a parsed `FileDescriptorProto` by [`SymTab::add_file`]
//! in two passes: the first creates every def and stages its symbols, the
//! second resolves `type_name` references and typed defaults. Staged defs are
//! committed atomically; a failed add leaves the symbol table untouched.
//! Defs are addressed by index and live as long as the symbol table.

use std::collections::HashMap;

use crate::bootstrap::{self, DescriptorProto, EnumDescriptorProto, FieldDescriptorProto};
use crate::layout::{CType, DescriptorType, FieldLabel};
use crate::status::{Error, ErrorKind};
use crate::table::{IntTable, StrTable};

pub type FileId = u32;
pub type MsgId = u32;
pub type EnumId = u32;
pub type FieldId = u32;
pub type OneofId = u32;

pub const MAX_FIELD_NUMBER: u32 = (1 << 29) - 1;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Syntax {
    Proto2,
    Proto3,
}

/// Well-known types get special treatment in the JSON codec. Classification
/// is by full-name match.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WellKnown {
    Unspecified,
    Any,
    FieldMask,
    Duration,
    Timestamp,
    DoubleValue,
    FloatValue,
    Int64Value,
    UInt64Value,
    Int32Value,
    UInt32Value,
    BoolValue,
    StringValue,
    BytesValue,
    Value,
    ListValue,
    Struct,
}

impl WellKnown {
    fn classify(full_name: &str) -> WellKnown {
        let Some(short) = full_name.strip_prefix("google.protobuf.") else {
            return WellKnown::Unspecified;
        };
        match short {
            "Any" => WellKnown::Any,
            "FieldMask" => WellKnown::FieldMask,
            "Duration" => WellKnown::Duration,
            "Timestamp" => WellKnown::Timestamp,
            "DoubleValue" => WellKnown::DoubleValue,
            "FloatValue" => WellKnown::FloatValue,
            "Int64Value" => WellKnown::Int64Value,
            "UInt64Value" => WellKnown::UInt64Value,
            "Int32Value" => WellKnown::Int32Value,
            "UInt32Value" => WellKnown::UInt32Value,
            "BoolValue" => WellKnown::BoolValue,
            "StringValue" => WellKnown::StringValue,
            "BytesValue" => WellKnown::BytesValue,
            "Value" => WellKnown::Value,
            "ListValue" => WellKnown::ListValue,
            "Struct" => WellKnown::Struct,
            _ => WellKnown::Unspecified,
        }
    }

    pub fn is_wrapper(self) -> bool {
        matches!(
            self,
            WellKnown::DoubleValue
                | WellKnown::FloatValue
                | WellKnown::Int64Value
                | WellKnown::UInt64Value
                | WellKnown::Int32Value
                | WellKnown::UInt32Value
                | WellKnown::BoolValue
                | WellKnown::StringValue
                | WellKnown::BytesValue
        )
    }
}

/// Def reference with the kind packed into the low two bits, as stored in the
/// symbol table.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TaggedDef(u32);

const TAG_MSG: u32 = 0;
const TAG_ENUM: u32 = 1;
const TAG_FIELD: u32 = 2;
const TAG_ONEOF: u32 = 3;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DefRef {
    Msg(MsgId),
    Enum(EnumId),
    Field(FieldId),
    Oneof(OneofId),
}

impl TaggedDef {
    pub fn msg(id: MsgId) -> Self {
        TaggedDef(id << 2 | TAG_MSG)
    }
    pub fn enum_(id: EnumId) -> Self {
        TaggedDef(id << 2 | TAG_ENUM)
    }
    pub fn field(id: FieldId) -> Self {
        TaggedDef(id << 2 | TAG_FIELD)
    }
    pub fn oneof(id: OneofId) -> Self {
        TaggedDef(id << 2 | TAG_ONEOF)
    }

    pub fn unpack(self) -> DefRef {
        let id = self.0 >> 2;
        match self.0 & 3 {
            TAG_MSG => DefRef::Msg(id),
            TAG_ENUM => DefRef::Enum(id),
            TAG_FIELD => DefRef::Field(id),
            _ => DefRef::Oneof(id),
        }
    }
}

/// What a field's type refers to, after resolution.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SubDef {
    None,
    Msg(MsgId),
    Enum(EnumId),
}

/// Typed default value of a field.
#[derive(Clone, Debug, PartialEq)]
pub enum DefaultVal {
    Int64(i64),
    UInt64(u64),
    Double(f64),
    Float(f32),
    Bool(bool),
    Str(Box<[u8]>),
    Enum(i32),
}

/// Name-table entry of a message: field names and oneof names share one
/// namespace.
#[derive(Clone, Copy, Debug)]
pub enum NameRef {
    Field(FieldId),
    Oneof(OneofId),
}

#[derive(Debug)]
pub struct FieldDef {
    pub name: String,
    pub full_name: String,
    pub json_name: String,
    pub number: u32,
    pub index: u16,
    pub label: FieldLabel,
    pub descriptortype: DescriptorType,
    pub packed: bool,
    pub lazy: bool,
    pub is_extension: bool,
    pub containing_type: Option<MsgId>,
    pub oneof: Option<OneofId>,
    pub subdef: SubDef,
    pub default: DefaultVal,
    /// First selector of this field's handler-event block.
    pub selector_base: u32,
    /// Dense index among the message's submessage fields; doubles as the
    /// `submsgs[]` index of the layout and the STARTSUBMSG selector offset.
    pub submsg_index: Option<u16>,
}

impl FieldDef {
    pub fn is_repeated(&self) -> bool {
        self.label == FieldLabel::Repeated
    }

    pub fn is_submsg(&self) -> bool {
        self.descriptortype.ctype() == CType::Message
    }

    pub fn is_string(&self) -> bool {
        matches!(
            self.descriptortype.ctype(),
            CType::String | CType::Bytes
        )
    }

    /// Selector slots this field reserves.
    pub fn selector_count(&self) -> u32 {
        let is_seq = self.is_repeated() as u32;
        let is_string = self.is_string() as u32;
        let lazy = (self.lazy && self.is_submsg()) as u32;
        1 + 2 * is_seq + 2 * is_string + 3 * lazy
    }

    pub fn msg_subdef(&self) -> Option<MsgId> {
        match self.subdef {
            SubDef::Msg(m) => Some(m),
            _ => None,
        }
    }

    pub fn enum_subdef(&self) -> Option<EnumId> {
        match self.subdef {
            SubDef::Enum(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct MessageDef {
    pub name: String,
    pub full_name: String,
    pub file: FileId,
    /// Declaration order.
    pub fields: Vec<FieldId>,
    pub oneofs: Vec<OneofId>,
    pub map_entry: bool,
    pub extendable: bool,
    pub wkt: WellKnown,
    pub selector_count: u32,
    pub submsg_field_count: u32,
    ntof: StrTable<NameRef>,
    jtof: StrTable<FieldId>,
    itof: IntTable<FieldId>,
}

impl MessageDef {
    pub fn field_by_number(&self, number: u32) -> Option<FieldId> {
        self.itof.lookup(number as u64).copied()
    }

    pub fn entry_by_name(&self, name: &str) -> Option<NameRef> {
        self.ntof.lookup(name.as_bytes()).copied()
    }

    /// JSON member lookup: accepts the JSON (camelCase) name and the proto
    /// name.
    pub fn field_by_json_name(&self, name: &str) -> Option<FieldId> {
        self.jtof.lookup(name.as_bytes()).copied()
    }
}

#[derive(Debug)]
pub struct EnumDef {
    pub name: String,
    pub full_name: String,
    pub file: FileId,
    pub default: i32,
    ntoi: StrTable<i32>,
    iton: IntTable<String>,
}

impl EnumDef {
    pub fn value_by_name(&self, name: &str) -> Option<i32> {
        self.ntoi.lookup(name.as_bytes()).copied()
    }

    pub fn name_by_value(&self, value: i32) -> Option<&str> {
        // Negative values hash as their 64-bit pattern, same as insertion.
        self.iton.lookup(value as u32 as u64).map(|s| s.as_str())
    }
}

#[derive(Debug)]
pub struct OneofDef {
    pub name: String,
    pub full_name: String,
    pub parent: MsgId,
    pub index: u16,
    pub fields: Vec<FieldId>,
}

#[derive(Debug)]
pub struct FileDef {
    pub name: String,
    pub package: String,
    pub syntax: Syntax,
    pub msgs: Vec<MsgId>,
    pub enums: Vec<EnumId>,
    pub extensions: Vec<FieldId>,
    pub deps: Vec<FileId>,
    pub php_class_prefix: Option<String>,
    pub php_namespace: Option<String>,
}

/// Handler event kinds; with the descriptor-computed selector this addresses
/// one `(field, event)` pair.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HandlerType {
    Int32,
    Int64,
    UInt32,
    UInt64,
    Float,
    Double,
    Bool,
    String,
    StartStr,
    EndStr,
    StartSeq,
    EndSeq,
    StartSubMsg,
    EndSubMsg,
}

/// Selectors 0..3 are global to a message's handler table.
pub const SELECTOR_STARTMSG: u32 = 0;
pub const SELECTOR_ENDMSG: u32 = 1;
pub const SELECTOR_UNKNOWN: u32 = 2;
pub const STATIC_SELECTOR_COUNT: u32 = 3;

/// Dense selector for a `(field, event)` pair; `None` for combinations the
/// field does not support.
pub fn selector(f: &FieldDef, ev: HandlerType) -> Option<u32> {
    use HandlerType::*;
    let is_seq = f.is_repeated() as u32;
    match ev {
        StartSubMsg if f.is_submsg() => f
            .submsg_index
            .map(|i| STATIC_SELECTOR_COUNT + i as u32),
        EndSubMsg if f.is_submsg() => Some(f.selector_base),
        Int32 | Int64 | UInt32 | UInt64 | Float | Double | Bool => {
            let want = match f.descriptortype.ctype() {
                CType::Int32 | CType::Enum => Int32,
                CType::Int64 => Int64,
                CType::UInt32 => UInt32,
                CType::UInt64 => UInt64,
                CType::Float => Float,
                CType::Double => Double,
                CType::Bool => Bool,
                _ => return None,
            };
            (ev == want).then_some(f.selector_base)
        }
        String if f.is_string() => Some(f.selector_base),
        StartSeq if f.is_repeated() => Some(f.selector_base + 1),
        EndSeq if f.is_repeated() => Some(f.selector_base + 2),
        StartStr if f.is_string() => Some(f.selector_base + 1 + 2 * is_seq),
        EndStr if f.is_string() => Some(f.selector_base + 2 + 2 * is_seq),
        _ => None,
    }
}

/// The symbol table: owner of every def, keyed by fully qualified name.
#[derive(Default)]
pub struct SymTab {
    files: Vec<FileDef>,
    msgs: Vec<MessageDef>,
    enums: Vec<EnumDef>,
    fields: Vec<FieldDef>,
    oneofs: Vec<OneofDef>,
    syms: StrTable<TaggedDef>,
    files_by_name: StrTable<FileId>,
}

impl SymTab {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(&self, id: FileId) -> &FileDef {
        &self.files[id as usize]
    }
    pub fn msg(&self, id: MsgId) -> &MessageDef {
        &self.msgs[id as usize]
    }
    pub fn enm(&self, id: EnumId) -> &EnumDef {
        &self.enums[id as usize]
    }
    pub fn field(&self, id: FieldId) -> &FieldDef {
        &self.fields[id as usize]
    }
    pub fn oneof(&self, id: OneofId) -> &OneofDef {
        &self.oneofs[id as usize]
    }

    pub fn lookup(&self, sym: &str) -> Option<DefRef> {
        self.syms.lookup(sym.as_bytes()).map(|t| t.unpack())
    }

    pub fn lookup_msg(&self, sym: &str) -> Option<MsgId> {
        match self.lookup(sym) {
            Some(DefRef::Msg(m)) => Some(m),
            _ => None,
        }
    }

    pub fn lookup_enum(&self, sym: &str) -> Option<EnumId> {
        match self.lookup(sym) {
            Some(DefRef::Enum(e)) => Some(e),
            _ => None,
        }
    }

    pub fn lookup_file(&self, name: &str) -> Option<FileId> {
        self.files_by_name.lookup(name.as_bytes()).copied()
    }

    /// True when `f` is a map field: repeated message whose entry type is a
    /// synthesized map entry.
    pub fn field_is_map(&self, f: &FieldDef) -> bool {
        f.is_repeated()
            && match f.subdef {
                SubDef::Msg(m) => self.msg(m).map_entry,
                _ => false,
            }
    }

    /// Map entry key/value fields (numbers 1 and 2).
    pub fn map_entry_fields(&self, entry: MsgId) -> Option<(FieldId, FieldId)> {
        let m = self.msg(entry);
        Some((m.field_by_number(1)?, m.field_by_number(2)?))
    }

    /// Decode a serialized `FileDescriptorProto` and add it.
    pub fn add_file_bytes(&mut self, bytes: &[u8]) -> Result<FileId, Error> {
        let mut arena = crate::arena::Arena::new(crate::global_alloc());
        let fdp = bootstrap::FileDescriptorProto::decode(bytes, &mut arena)?;
        self.add_file(&fdp)
    }

    /// Build defs from a parsed `FileDescriptorProto`. Either the whole file
    /// is added or nothing is.
    pub fn add_file(&mut self, fdp: &bootstrap::FileDescriptorProto) -> Result<FileId, Error> {
        let stage = Stage::build(self, fdp)?;
        Ok(self.commit(stage))
    }

    fn commit(&mut self, stage: Stage) -> FileId {
        let file_id = self.files.len() as FileId;
        for (name, tag) in stage.syms {
            self.syms.insert(name.as_bytes(), tag);
        }
        self.files_by_name
            .insert(stage.file.name.as_bytes(), file_id);
        self.files.push(stage.file);
        self.msgs.extend(stage.msgs);
        self.enums.extend(stage.enums);
        self.fields.extend(stage.fields);
        self.oneofs.extend(stage.oneofs);
        file_id
    }
}

fn is_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_dotted_ident(s: &str) -> bool {
    !s.is_empty() && s.split('.').all(is_ident)
}

fn camel_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = false;
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

fn err(kind: ErrorKind, msg: impl Into<String>) -> Error {
    Error::new(kind, msg)
}

struct Pending {
    field: usize, // index into stage.fields
    type_name: Option<String>,
    extendee: Option<String>,
    default_str: Option<String>,
    type_declared: bool,
    scope: String,
}

struct Stage {
    file: FileDef,
    file_id: FileId,
    msgs: Vec<MessageDef>,
    enums: Vec<EnumDef>,
    fields: Vec<FieldDef>,
    oneofs: Vec<OneofDef>,
    syms: Vec<(String, TaggedDef)>,
    sym_map: HashMap<String, TaggedDef>,
    pending: Vec<Pending>,
    base_msg: u32,
    base_enum: u32,
    base_field: u32,
    base_oneof: u32,
}

impl Stage {
    fn build(st: &SymTab, fdp: &bootstrap::FileDescriptorProto) -> Result<Stage, Error> {
        let name = fdp
            .name()
            .ok_or_else(|| err(ErrorKind::SchemaViolation, "file has no name"))?;
        if st.lookup_file(name).is_some() {
            return Err(err(
                ErrorKind::SchemaViolation,
                format!("duplicate file name: {name}"),
            ));
        }
        let package = fdp.package().unwrap_or("");
        if !package.is_empty() && !is_dotted_ident(package) {
            return Err(err(
                ErrorKind::SchemaViolation,
                format!("invalid package name: {package}"),
            ));
        }
        let syntax = match fdp.syntax() {
            None | Some("proto2") => Syntax::Proto2,
            Some("proto3") => Syntax::Proto3,
            Some(other) => {
                return Err(err(
                    ErrorKind::SchemaViolation,
                    format!("unknown syntax: {other}"),
                ))
            }
        };
        let mut deps = Vec::new();
        for dep in fdp.dependencies() {
            let id = st.lookup_file(dep).ok_or_else(|| {
                err(
                    ErrorKind::SchemaViolation,
                    format!("unresolved dependency: {dep}"),
                )
            })?;
            deps.push(id);
        }
        let (php_class_prefix, php_namespace) = match fdp.options() {
            Some(o) => (
                o.php_class_prefix().map(str::to_owned),
                o.php_namespace().map(str::to_owned),
            ),
            None => (None, None),
        };

        let file_id = st.files.len() as FileId;
        let mut stage = Stage {
            file: FileDef {
                name: name.to_owned(),
                package: package.to_owned(),
                syntax,
                msgs: Vec::new(),
                enums: Vec::new(),
                extensions: Vec::new(),
                deps,
                php_class_prefix,
                php_namespace,
            },
            file_id,
            msgs: Vec::new(),
            enums: Vec::new(),
            fields: Vec::new(),
            oneofs: Vec::new(),
            syms: Vec::new(),
            sym_map: HashMap::new(),
            pending: Vec::new(),
            base_msg: st.msgs.len() as u32,
            base_enum: st.enums.len() as u32,
            base_field: st.fields.len() as u32,
            base_oneof: st.oneofs.len() as u32,
        };

        let prefix = package.to_owned();
        for m in fdp.messages() {
            let id = stage.add_message(st, &m, &prefix, syntax)?;
            stage.file.msgs.push(id);
        }
        for e in fdp.enums() {
            let id = stage.add_enum(st, &e, &prefix, syntax)?;
            stage.file.enums.push(id);
        }
        for x in fdp.extensions() {
            let id = stage.add_field(st, &x, None, &prefix, syntax, true)?;
            stage.file.extensions.push(id);
        }

        stage.resolve(st)?;
        stage.finalize();
        Ok(stage)
    }

    fn add_sym(&mut self, st: &SymTab, name: &str, tag: TaggedDef) -> Result<(), Error> {
        if st.syms.lookup(name.as_bytes()).is_some() || self.sym_map.contains_key(name) {
            return Err(err(
                ErrorKind::SchemaViolation,
                format!("duplicate symbol: {name}"),
            ));
        }
        self.sym_map.insert(name.to_owned(), tag);
        self.syms.push((name.to_owned(), tag));
        Ok(())
    }

    fn lookup_sym(&self, st: &SymTab, name: &str) -> Option<TaggedDef> {
        self.sym_map
            .get(name)
            .copied()
            .or_else(|| st.syms.lookup(name.as_bytes()).copied())
    }

    // `sym` starting with '.' is absolute; otherwise walk enclosing scopes
    // outward from `scope`.
    fn resolve_sym(&self, st: &SymTab, scope: &str, sym: &str) -> Option<TaggedDef> {
        if let Some(abs) = sym.strip_prefix('.') {
            return self.lookup_sym(st, abs);
        }
        let mut s = scope.to_owned();
        loop {
            let candidate = if s.is_empty() {
                sym.to_owned()
            } else {
                format!("{s}.{sym}")
            };
            if let Some(t) = self.lookup_sym(st, &candidate) {
                return Some(t);
            }
            if s.is_empty() {
                return None;
            }
            s = match s.rfind('.') {
                Some(i) => s[..i].to_owned(),
                None => String::new(),
            };
        }
    }

    fn add_message(
        &mut self,
        st: &SymTab,
        d: &DescriptorProto,
        prefix: &str,
        syntax: Syntax,
    ) -> Result<MsgId, Error> {
        let name = d
            .name()
            .ok_or_else(|| err(ErrorKind::SchemaViolation, "message has no name"))?;
        if !is_ident(name) {
            return Err(err(
                ErrorKind::SchemaViolation,
                format!("invalid message name: {name}"),
            ));
        }
        let full_name = if prefix.is_empty() {
            name.to_owned()
        } else {
            format!("{prefix}.{name}")
        };
        let msg_id = self.base_msg + self.msgs.len() as u32;
        self.add_sym(st, &full_name, TaggedDef::msg(msg_id))?;
        self.msgs.push(MessageDef {
            name: name.to_owned(),
            full_name: full_name.clone(),
            file: self.file_id,
            fields: Vec::new(),
            oneofs: Vec::new(),
            map_entry: d.map_entry(),
            extendable: d.has_extension_ranges(),
            wkt: WellKnown::Unspecified,
            selector_count: 0,
            submsg_field_count: 0,
            ntof: StrTable::new(),
            jtof: StrTable::new(),
            itof: IntTable::new(),
        });
        let stage_idx = (msg_id - self.base_msg) as usize;

        let oneof_decls = d.oneof_decls();
        for (i, o) in oneof_decls.iter().enumerate() {
            let oname = o
                .name()
                .ok_or_else(|| err(ErrorKind::SchemaViolation, "oneof has no name"))?;
            if !is_ident(oname) {
                return Err(err(
                    ErrorKind::SchemaViolation,
                    format!("invalid oneof name: {oname}"),
                ));
            }
            let oid = self.base_oneof + self.oneofs.len() as u32;
            let ofull = format!("{full_name}.{oname}");
            self.add_sym(st, &ofull, TaggedDef::oneof(oid))?;
            if !self.msgs[stage_idx]
                .ntof
                .insert(oname.as_bytes(), NameRef::Oneof(oid))
            {
                return Err(err(
                    ErrorKind::SchemaViolation,
                    format!("duplicate name in {full_name}: {oname}"),
                ));
            }
            self.oneofs.push(OneofDef {
                name: oname.to_owned(),
                full_name: ofull,
                parent: msg_id,
                index: i as u16,
                fields: Vec::new(),
            });
            self.msgs[stage_idx].oneofs.push(oid);
        }

        for f in d.fields() {
            let fid = self.add_field(st, &f, Some(msg_id), &full_name, syntax, false)?;
            self.msgs[stage_idx].fields.push(fid);
        }

        for e in d.enums() {
            let _ = self.add_enum(st, &e, &full_name, syntax)?;
        }
        for nested in d.nested_types() {
            let _ = self.add_message(st, &nested, &full_name, syntax)?;
        }
        Ok(msg_id)
    }

    #[allow(clippy::too_many_arguments)]
    fn add_field(
        &mut self,
        st: &SymTab,
        f: &FieldDescriptorProto,
        containing: Option<MsgId>,
        scope: &str,
        syntax: Syntax,
        is_extension: bool,
    ) -> Result<FieldId, Error> {
        let name = f
            .name()
            .ok_or_else(|| err(ErrorKind::SchemaViolation, "field has no name"))?;
        if !is_ident(name) {
            return Err(err(
                ErrorKind::SchemaViolation,
                format!("invalid field name: {name}"),
            ));
        }
        let full_name = format!("{scope}.{name}");
        let number = f
            .number()
            .ok_or_else(|| err(ErrorKind::SchemaViolation, format!("{full_name}: no number")))?;
        if number < 1 || number as u32 > MAX_FIELD_NUMBER {
            return Err(err(
                ErrorKind::RangeError,
                format!("{full_name}: field number {number} out of range"),
            ));
        }
        let number = number as u32;
        let label = f
            .label()
            .and_then(FieldLabel::from_i32)
            .unwrap_or(FieldLabel::Optional);
        if syntax == Syntax::Proto3 && label == FieldLabel::Required {
            return Err(err(
                ErrorKind::SchemaViolation,
                format!("{full_name}: required fields are not allowed in proto3"),
            ));
        }

        let (descriptortype, type_declared) = match f.type_() {
            Some(t) => (
                DescriptorType::from_i32(t).ok_or_else(|| {
                    err(
                        ErrorKind::SchemaViolation,
                        format!("{full_name}: bad field type {t}"),
                    )
                })?,
                true,
            ),
            // Type may be omitted when type_name is set; fixed up after
            // resolution.
            None if f.type_name().is_some() => (DescriptorType::Message, false),
            None => {
                return Err(err(
                    ErrorKind::SchemaViolation,
                    format!("{full_name}: field has no type"),
                ))
            }
        };

        let default_str = f.default_value().map(str::to_owned);
        if default_str.is_some() && syntax == Syntax::Proto3 {
            return Err(err(
                ErrorKind::SchemaViolation,
                format!("{full_name}: explicit defaults are not allowed in proto3"),
            ));
        }

        let (packed_opt, lazy) = match f.options() {
            Some(o) => (o.packed(), o.lazy()),
            None => (None, false),
        };
        let packed = packed_opt.unwrap_or(
            syntax == Syntax::Proto3
                && label == FieldLabel::Repeated
                && descriptortype.is_packable(),
        );

        let json_name = match f.json_name() {
            Some(j) => j.to_owned(),
            None => camel_case(name),
        };

        let field_id = self.base_field + self.fields.len() as u32;
        let stage_field_idx = self.fields.len();

        let mut oneof = None;
        if let Some(oi) = f.oneof_index() {
            let msg_id = containing.ok_or_else(|| {
                err(
                    ErrorKind::SchemaViolation,
                    format!("{full_name}: oneof_index on extension"),
                )
            })?;
            let msg = &self.msgs[(msg_id - self.base_msg) as usize];
            let oid = *msg.oneofs.get(oi as usize).ok_or_else(|| {
                err(
                    ErrorKind::SchemaViolation,
                    format!("{full_name}: oneof index {oi} out of range"),
                )
            })?;
            if label != FieldLabel::Optional {
                return Err(err(
                    ErrorKind::SchemaViolation,
                    format!("{full_name}: fields of oneofs must be optional"),
                ));
            }
            self.oneofs[(oid - self.base_oneof) as usize]
                .fields
                .push(field_id);
            oneof = Some(oid);
        }

        if let Some(msg_id) = containing {
            let msg = &mut self.msgs[(msg_id - self.base_msg) as usize];
            if !msg.ntof.insert(name.as_bytes(), NameRef::Field(field_id)) {
                return Err(err(
                    ErrorKind::SchemaViolation,
                    format!("duplicate name in {scope}: {name}"),
                ));
            }
            if !msg.itof.insert(number as u64, field_id) {
                return Err(err(
                    ErrorKind::SchemaViolation,
                    format!("duplicate field number in {scope}: {number}"),
                ));
            }
        } else {
            // Extensions are addressable by full name.
            self.add_sym(st, &full_name, TaggedDef::field(field_id))?;
        }

        self.pending.push(Pending {
            field: stage_field_idx,
            type_name: f.type_name().map(str::to_owned),
            extendee: if is_extension {
                f.extendee().map(str::to_owned)
            } else {
                None
            },
            default_str,
            type_declared,
            scope: scope.to_owned(),
        });

        let index = containing
            .map(|mid| self.msgs[(mid - self.base_msg) as usize].fields.len() as u16)
            .unwrap_or(0);
        self.fields.push(FieldDef {
            name: name.to_owned(),
            full_name,
            json_name,
            number,
            index,
            label,
            descriptortype,
            packed,
            lazy,
            is_extension,
            containing_type: containing,
            oneof,
            subdef: SubDef::None,
            default: DefaultVal::Int64(0),
            selector_base: 0,
            submsg_index: None,
        });
        Ok(field_id)
    }

    fn add_enum(
        &mut self,
        st: &SymTab,
        e: &EnumDescriptorProto,
        prefix: &str,
        syntax: Syntax,
    ) -> Result<EnumId, Error> {
        let name = e
            .name()
            .ok_or_else(|| err(ErrorKind::SchemaViolation, "enum has no name"))?;
        if !is_ident(name) {
            return Err(err(
                ErrorKind::SchemaViolation,
                format!("invalid enum name: {name}"),
            ));
        }
        let full_name = if prefix.is_empty() {
            name.to_owned()
        } else {
            format!("{prefix}.{name}")
        };
        let enum_id = self.base_enum + self.enums.len() as u32;
        self.add_sym(st, &full_name, TaggedDef::enum_(enum_id))?;

        let mut ntoi = StrTable::new();
        let mut iton = IntTable::new();
        let mut default = None;
        for v in e.values() {
            let vname = v
                .name()
                .ok_or_else(|| err(ErrorKind::SchemaViolation, "enum value has no name"))?;
            let vnum = v.number().ok_or_else(|| {
                err(
                    ErrorKind::SchemaViolation,
                    format!("{full_name}.{vname}: no number"),
                )
            })?;
            if !ntoi.insert(vname.as_bytes(), vnum) {
                return Err(err(
                    ErrorKind::SchemaViolation,
                    format!("duplicate enum value name: {full_name}.{vname}"),
                ));
            }
            // Aliased numbers keep the first name.
            iton.insert(vnum as u32 as u64, vname.to_owned());
            if default.is_none() {
                default = Some(vnum);
            }
        }
        let default = default
            .ok_or_else(|| err(ErrorKind::SchemaViolation, format!("{full_name}: empty enum")))?;
        if syntax == Syntax::Proto3 && default != 0 {
            return Err(err(
                ErrorKind::SchemaViolation,
                format!("{full_name}: proto3 enums must start with value 0"),
            ));
        }

        self.enums.push(EnumDef {
            name: name.to_owned(),
            full_name,
            file: self.file_id,
            default,
            ntoi,
            iton,
        });
        Ok(enum_id)
    }

    fn resolve(&mut self, st: &SymTab) -> Result<(), Error> {
        let pending = core::mem::take(&mut self.pending);
        for p in &pending {
            let full_name = self.fields[p.field].full_name.clone();

            if let Some(tn) = &p.type_name {
                let tag = self.resolve_sym(st, &p.scope, tn).ok_or_else(|| {
                    err(
                        ErrorKind::SchemaViolation,
                        format!("{full_name}: could not resolve type name {tn}"),
                    )
                })?;
                let f = &mut self.fields[p.field];
                match tag.unpack() {
                    DefRef::Msg(m) => {
                        if p.type_declared && f.descriptortype.ctype() != CType::Message {
                            return Err(err(
                                ErrorKind::SchemaViolation,
                                format!("{full_name}: type_name names a message"),
                            ));
                        }
                        if !p.type_declared {
                            f.descriptortype = DescriptorType::Message;
                        }
                        f.subdef = SubDef::Msg(m);
                    }
                    DefRef::Enum(en) => {
                        if p.type_declared && f.descriptortype.ctype() != CType::Enum {
                            return Err(err(
                                ErrorKind::SchemaViolation,
                                format!("{full_name}: type_name names an enum"),
                            ));
                        }
                        if !p.type_declared {
                            f.descriptortype = DescriptorType::Enum;
                        }
                        f.subdef = SubDef::Enum(en);
                    }
                    _ => {
                        return Err(err(
                            ErrorKind::SchemaViolation,
                            format!("{full_name}: type_name is not a type"),
                        ))
                    }
                }
            } else {
                let f = &self.fields[p.field];
                if matches!(f.descriptortype.ctype(), CType::Message | CType::Enum) {
                    return Err(err(
                        ErrorKind::SchemaViolation,
                        format!("{full_name}: missing type_name"),
                    ));
                }
            }

            if let Some(ext) = &p.extendee {
                let tag = self.resolve_sym(st, &p.scope, ext).ok_or_else(|| {
                    err(
                        ErrorKind::SchemaViolation,
                        format!("{full_name}: could not resolve extendee {ext}"),
                    )
                })?;
                match tag.unpack() {
                    DefRef::Msg(m) => self.fields[p.field].containing_type = Some(m),
                    _ => {
                        return Err(err(
                            ErrorKind::SchemaViolation,
                            format!("{full_name}: extendee is not a message"),
                        ))
                    }
                }
            }

            self.set_default(st, p)?;
        }
        Ok(())
    }

    fn set_default(&mut self, st: &SymTab, p: &Pending) -> Result<(), Error> {
        let f = &self.fields[p.field];
        let full_name = f.full_name.clone();
        let bad = |what: &str| {
            err(
                ErrorKind::InvalidInput,
                format!("{full_name}: bad default value ({what})"),
            )
        };
        let parsed = match (&p.default_str, f.descriptortype.ctype()) {
            (Some(_), CType::Message) => {
                return Err(err(
                    ErrorKind::SchemaViolation,
                    format!("{full_name}: message fields cannot have explicit defaults"),
                ))
            }
            (Some(s), CType::Int32) => {
                DefaultVal::Int64(s.parse::<i32>().map_err(|_| bad("int32"))? as i64)
            }
            (Some(s), CType::Int64) => DefaultVal::Int64(s.parse().map_err(|_| bad("int64"))?),
            (Some(s), CType::UInt32) => {
                DefaultVal::UInt64(s.parse::<u32>().map_err(|_| bad("uint32"))? as u64)
            }
            (Some(s), CType::UInt64) => DefaultVal::UInt64(s.parse().map_err(|_| bad("uint64"))?),
            (Some(s), CType::Double) => DefaultVal::Double(parse_float(s).ok_or_else(|| bad("double"))?),
            (Some(s), CType::Float) => {
                DefaultVal::Float(parse_float(s).ok_or_else(|| bad("float"))? as f32)
            }
            (Some(s), CType::Bool) => match s.as_str() {
                "true" => DefaultVal::Bool(true),
                "false" => DefaultVal::Bool(false),
                _ => return Err(bad("bool")),
            },
            (Some(s), CType::String | CType::Bytes) => {
                DefaultVal::Str(s.as_bytes().to_vec().into_boxed_slice())
            }
            (Some(s), CType::Enum) => {
                let SubDef::Enum(eid) = f.subdef else {
                    return Err(bad("enum"));
                };
                let v = self
                    .enum_value_by_name(st, eid, s)
                    .ok_or_else(|| bad("unknown enum label"))?;
                DefaultVal::Enum(v)
            }
            (None, ct) => match ct {
                CType::Int32 | CType::Int64 => DefaultVal::Int64(0),
                CType::UInt32 | CType::UInt64 => DefaultVal::UInt64(0),
                CType::Double => DefaultVal::Double(0.0),
                CType::Float => DefaultVal::Float(0.0),
                CType::Bool => DefaultVal::Bool(false),
                CType::String | CType::Bytes => DefaultVal::Str(Box::default()),
                CType::Enum => {
                    let SubDef::Enum(eid) = f.subdef else {
                        return Err(bad("enum subdef"));
                    };
                    DefaultVal::Enum(self.enum_default(st, eid))
                }
                CType::Message => DefaultVal::Int64(0),
            },
        };
        self.fields[p.field].default = parsed;
        Ok(())
    }

    // Referenced enums are either staged in this file or already committed.
    fn enum_value_by_name(&self, st: &SymTab, eid: EnumId, name: &str) -> Option<i32> {
        if eid >= self.base_enum {
            self.enums[(eid - self.base_enum) as usize].value_by_name(name)
        } else {
            st.enm(eid).value_by_name(name)
        }
    }

    fn enum_default(&self, st: &SymTab, eid: EnumId) -> i32 {
        if eid >= self.base_enum {
            self.enums[(eid - self.base_enum) as usize].default
        } else {
            st.enm(eid).default
        }
    }

    fn finalize(&mut self) {
        let base_field = self.base_field;
        for m in &mut self.msgs {
            m.wkt = WellKnown::classify(&m.full_name);

            // Selector assignment: submessage fields first, then by number.
            let mut order: Vec<FieldId> = m.fields.clone();
            order.sort_by_key(|&fid| {
                let f = &self.fields[(fid - base_field) as usize];
                (!f.is_submsg(), f.number)
            });
            let submsg_count = order
                .iter()
                .filter(|&&fid| self.fields[(fid - base_field) as usize].is_submsg())
                .count() as u32;
            let mut sel = STATIC_SELECTOR_COUNT + submsg_count;
            let mut submsg_i = 0u16;
            for &fid in &order {
                let f = &mut self.fields[(fid - base_field) as usize];
                if f.is_submsg() {
                    f.submsg_index = Some(submsg_i);
                    submsg_i += 1;
                }
                f.selector_base = sel;
                sel += f.selector_count();
            }
            m.selector_count = sel;
            m.submsg_field_count = submsg_count;

            // JSON name table: json_name plus the proto name.
            for &fid in &m.fields {
                let f = &self.fields[(fid - base_field) as usize];
                m.jtof.insert(f.json_name.as_bytes(), fid);
                if f.json_name != f.name {
                    m.jtof.insert(f.name.as_bytes(), fid);
                }
            }
        }
    }
}

fn parse_float(s: &str) -> Option<f64> {
    match s {
        "inf" => Some(f64::INFINITY),
        "-inf" => Some(f64::NEG_INFINITY),
        "nan" => Some(f64::NAN),
        _ => s.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{enum_type, field, file, map_field, message, msg_field};

    fn add(st: &mut SymTab, f: &crate::testutil::TestFile) -> Result<FileId, Error> {
        st.add_file_bytes(&f.encode())
    }

    fn test_file() -> crate::testutil::TestFile {
        file("test.proto", "pkg", "proto3")
            .with_message(
                message("Outer")
                    .with_field(field("a", 1, "int32"))
                    .with_field(field("name", 2, "string"))
                    .with_field(msg_field("inner", 3, ".pkg.Outer.Inner"))
                    .with_field(field("long_field_name", 4, "int64"))
                    .with_nested(message("Inner").with_field(field("x", 1, "int32"))),
            )
            .with_enum(enum_type("Color", &[("RED", 0), ("GREEN", 1), ("BLUE", 2)]))
    }

    #[test]
    fn add_file_resolves_and_registers() {
        let mut st = SymTab::new();
        add(&mut st, &test_file()).unwrap();

        let outer = st.lookup_msg("pkg.Outer").unwrap();
        let inner = st.lookup_msg("pkg.Outer.Inner").unwrap();
        assert!(st.lookup_enum("pkg.Color").is_some());

        let m = st.msg(outer);
        assert_eq!(m.fields.len(), 4);
        let inner_field = st.field(m.field_by_number(3).unwrap());
        assert_eq!(inner_field.subdef, SubDef::Msg(inner));
        assert_eq!(inner_field.descriptortype, DescriptorType::Message);
    }

    #[test]
    fn duplicate_file_rejected() {
        let mut st = SymTab::new();
        add(&mut st, &test_file()).unwrap();
        let errv = add(&mut st, &test_file()).unwrap_err();
        assert_eq!(errv.kind, ErrorKind::SchemaViolation);
    }

    #[test]
    fn json_names_derived() {
        let mut st = SymTab::new();
        add(&mut st, &test_file()).unwrap();
        let m = st.msg(st.lookup_msg("pkg.Outer").unwrap());
        let fid = m.field_by_json_name("longFieldName").unwrap();
        assert_eq!(st.field(fid).name, "long_field_name");
        // Proto name also accepted.
        assert_eq!(m.field_by_json_name("long_field_name"), Some(fid));
    }

    #[test]
    fn proto3_enum_must_start_at_zero() {
        let mut st = SymTab::new();
        let bad = file("bad.proto", "pkg", "proto3")
            .with_enum(enum_type("Bad", &[("ONE", 1)]));
        let errv = add(&mut st, &bad).unwrap_err();
        assert_eq!(errv.kind, ErrorKind::SchemaViolation);
    }

    #[test]
    fn proto3_required_rejected() {
        let mut st = SymTab::new();
        let bad = file("bad.proto", "pkg", "proto3")
            .with_message(message("M").with_field(field("a", 1, "int32").required()));
        let errv = add(&mut st, &bad).unwrap_err();
        assert_eq!(errv.kind, ErrorKind::SchemaViolation);
    }

    #[test]
    fn proto3_explicit_default_rejected() {
        let mut st = SymTab::new();
        let bad = file("bad.proto", "pkg", "proto3")
            .with_message(message("M").with_field(field("a", 1, "int32").with_default("5")));
        let errv = add(&mut st, &bad).unwrap_err();
        assert_eq!(errv.kind, ErrorKind::SchemaViolation);
    }

    #[test]
    fn duplicate_field_number_rejected() {
        let mut st = SymTab::new();
        let bad = file("bad.proto", "pkg", "proto3").with_message(
            message("M")
                .with_field(field("a", 1, "int32"))
                .with_field(field("b", 1, "int32")),
        );
        let errv = add(&mut st, &bad).unwrap_err();
        assert_eq!(errv.kind, ErrorKind::SchemaViolation);
    }

    #[test]
    fn unknown_type_name_rejected_without_partial_state() {
        let mut st = SymTab::new();
        let bad = file("bad.proto", "pkg", "proto3")
            .with_message(message("M").with_field(msg_field("x", 1, ".pkg.Missing")));
        let errv = add(&mut st, &bad).unwrap_err();
        assert_eq!(errv.kind, ErrorKind::SchemaViolation);
        // Atomic failure: nothing from the file is visible.
        assert!(st.lookup_msg("pkg.M").is_none());
        // The file name is free for a corrected retry.
        let good = file("bad.proto", "pkg", "proto3")
            .with_message(message("M").with_field(field("x", 1, "int32")));
        add(&mut st, &good).unwrap();
    }

    #[test]
    fn cross_file_reference_needs_dependency() {
        let mut st = SymTab::new();
        let base = file("base.proto", "lib", "proto3")
            .with_message(message("Shared").with_field(field("v", 1, "int32")));
        add(&mut st, &base).unwrap();

        let user = file("user.proto", "app", "proto3")
            .with_dependency("base.proto")
            .with_message(message("U").with_field(msg_field("s", 1, ".lib.Shared")));
        add(&mut st, &user).unwrap();

        let u = st.msg(st.lookup_msg("app.U").unwrap());
        let f = st.field(u.field_by_number(1).unwrap());
        assert_eq!(f.subdef, SubDef::Msg(st.lookup_msg("lib.Shared").unwrap()));

        // Unknown dependency is rejected outright.
        let orphan = file("orphan.proto", "app2", "proto3").with_dependency("missing.proto");
        let errv = add(&mut st, &orphan).unwrap_err();
        assert_eq!(errv.kind, ErrorKind::SchemaViolation);
    }

    #[test]
    fn selectors_dense_and_unique() {
        let mut st = SymTab::new();
        let f = file("sel.proto", "pkg", "proto3").with_message(
            message("M")
                .with_field(field("i", 1, "int32"))
                .with_field(field("s", 2, "string").repeated())
                .with_field(msg_field("m", 3, ".pkg.M"))
                .with_field(msg_field("r", 4, ".pkg.M").repeated()),
        );
        add(&mut st, &f).unwrap();
        let m = st.msg(st.lookup_msg("pkg.M").unwrap());

        let mut seen = std::collections::HashSet::new();
        for s in [SELECTOR_STARTMSG, SELECTOR_ENDMSG, SELECTOR_UNKNOWN] {
            assert!(seen.insert(s));
        }
        use HandlerType::*;
        for &fid in &m.fields {
            let fd = st.field(fid);
            for ev in [
                Int32, Int64, UInt32, UInt64, Float, Double, Bool, String, StartStr, EndStr,
                StartSeq, EndSeq, StartSubMsg, EndSubMsg,
            ] {
                if let Some(s) = selector(fd, ev) {
                    assert!(seen.insert(s), "duplicate selector {s} for {:?}", ev);
                    assert!(s < m.selector_count);
                }
            }
        }
        // STARTSUBMSG selectors are dense right after the globals and double
        // as submsgs[] indices.
        let msub = st.field(m.field_by_number(3).unwrap());
        let rsub = st.field(m.field_by_number(4).unwrap());
        let mut subs = [
            selector(msub, StartSubMsg).unwrap(),
            selector(rsub, StartSubMsg).unwrap(),
        ];
        subs.sort();
        assert_eq!(subs, [3, 4]);
    }

    #[test]
    fn map_fields_detected() {
        let mut st = SymTab::new();
        let f = file("map.proto", "pkg", "proto3")
            .with_message(message("M").with_map_field(map_field("tags", 1, "string", "int32")));
        add(&mut st, &f).unwrap();
        let m = st.msg(st.lookup_msg("pkg.M").unwrap());
        let fd = st.field(m.field_by_number(1).unwrap());
        assert!(st.field_is_map(fd));
        let entry = fd.msg_subdef().unwrap();
        let (k, v) = st.map_entry_fields(entry).unwrap();
        assert_eq!(st.field(k).descriptortype, DescriptorType::String);
        assert_eq!(st.field(v).descriptortype, DescriptorType::Int32);
    }

    #[test]
    fn proto2_defaults_parsed() {
        let mut st = SymTab::new();
        let f = file("def.proto", "pkg", "proto2").with_message(
            message("M")
                .with_field(field("i", 1, "int32").with_default("-7"))
                .with_field(field("s", 2, "string").with_default("hi"))
                .with_field(field("b", 3, "bool").with_default("true"))
                .with_field(field("d", 4, "double").with_default("2.5")),
        );
        add(&mut st, &f).unwrap();
        let m = st.msg(st.lookup_msg("pkg.M").unwrap());
        assert_eq!(
            st.field(m.field_by_number(1).unwrap()).default,
            DefaultVal::Int64(-7)
        );
        assert_eq!(
            st.field(m.field_by_number(2).unwrap()).default,
            DefaultVal::Str(b"hi".to_vec().into_boxed_slice())
        );
        assert_eq!(
            st.field(m.field_by_number(3).unwrap()).default,
            DefaultVal::Bool(true)
        );
        assert_eq!(
            st.field(m.field_by_number(4).unwrap()).default,
            DefaultVal::Double(2.5)
        );
    }

    #[test]
    fn wkt_classified() {
        let mut st = SymTab::new();
        add(&mut st, &crate::testutil::wkt_file()).unwrap();
        let d = st.msg(st.lookup_msg("google.protobuf.Duration").unwrap());
        assert_eq!(d.wkt, WellKnown::Duration);
        let w = st.msg(st.lookup_msg("google.protobuf.Int32Value").unwrap());
        assert!(w.wkt.is_wrapper());
        let s = st.msg(st.lookup_msg("google.protobuf.Struct").unwrap());
        assert_eq!(s.wkt, WellKnown::Struct);
    }
}
