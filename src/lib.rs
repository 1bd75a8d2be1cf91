//! upb: a small-footprint protocol-buffers runtime.
//!
//! Three tightly coupled subsystems make up the crate:
//!
//! - the arena-backed message runtime and table-driven wire codec
//!   ([`arena`], [`base`], [`layout`], [`decoding`], [`encoding`]);
//! - the descriptor/symbol system, built by parsing `FileDescriptorProto`
//!   messages ([`defs`], [`bootstrap`]);
//! - the streaming JSON codec for proto3 canonical JSON, including the
//!   well-known types ([`json`]), with a text-format printer alongside
//!   ([`text`]).
//!
//! The subsystems talk through a streaming handler abstraction
//! ([`handlers`]): codecs emit typed events against a sink, and generic glue
//! falls out of piping one codec's producer into another's consumer: the
//! JSON parser into the message builder ([`fill`]), or the message walker
//! ([`visit`]) into the JSON printer.
//!
//! # Example
//!
//! ```
//! use upb::arena::Arena;
//! use upb::base::Msg;
//! use upb::defs::SymTab;
//! use upb::layout::LayoutCache;
//! use upb::testutil::{field, file, message};
//!
//! // Register a schema from its serialized FileDescriptorProto.
//! let mut symtab = SymTab::new();
//! let schema = file("demo.proto", "demo", "proto3")
//!     .with_message(message("Pair")
//!         .with_field(field("name", 1, "string"))
//!         .with_field(field("count", 2, "int32")));
//! symtab.add_file_bytes(&schema.encode()).unwrap();
//! let pair = symtab.lookup_msg("demo.Pair").unwrap();
//!
//! // JSON -> message -> wire bytes -> JSON.
//! let cache = LayoutCache::new();
//! let wire = upb::json::json_to_binary(
//!     br#"{"name":"x","count":3}"#, &symtab, pair, &cache, false).unwrap();
//! let json = upb::json::binary_to_json(&wire, &symtab, pair, &cache, false).unwrap();
//! assert_eq!(json, r#"{"name":"x","count":3}"#);
//!
//! // Or decode the wire bytes into an arena-owned message directly.
//! let lid = cache.load(&symtab, pair).unwrap();
//! let mut arena = Arena::new(upb::global_alloc());
//! let msg = Msg::new(&cache.get(lid), &mut arena).unwrap();
//! upb::decoding::decode(&wire, msg, &cache, lid, &mut arena).unwrap();
//! ```

pub mod arena;
pub mod base;
pub mod bootstrap;
pub mod decoding;
pub mod defs;
pub mod encoding;
pub mod fill;
pub mod handlers;
pub mod json;
pub mod layout;
pub mod status;
pub mod table;
pub mod testutil;
pub mod text;
pub mod visit;
pub mod wire;

pub use status::{Error, ErrorKind, Status};

use allocator_api2::alloc::{Allocator, Global};

static GLOBAL_ALLOC: Global = Global;

/// The process-wide default allocator, for arenas that don't need a custom
/// one.
pub fn global_alloc() -> &'static dyn Allocator {
    &GLOBAL_ALLOC
}
