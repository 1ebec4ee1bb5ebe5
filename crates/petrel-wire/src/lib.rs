//! Self-describing binary values with a shared symbol table.
//!
//! Every binary surface of the engine speaks this encoding: rows produced
//! by the ingestion converter, trailers and index files in the store, and
//! the sub-table plans shipped to peer workers.
//!
//! A value is a one-byte type tag followed by a payload. Variable-length
//! payloads are prefixed with their byte length as a LEB128 varint, so a
//! reader can skip any value without understanding it. Struct keys are
//! either inline strings (self-contained data, e.g. rows inside a chunk)
//! or symbols resolved against a [`Symtab`] shared by the enclosing
//! message (e.g. a serialised plan).

#![warn(
    rust_2018_idioms,
    nonstandard_style,
    future_incompatible,
    clippy::mod_module_files,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::undocumented_unsafe_blocks
)]

mod buffer;
mod reader;
mod symtab;

pub use buffer::Buffer;
pub use reader::{
    contents, expect_consumed, read_bool, read_bytes, read_f64, read_int, read_null, read_string,
    read_symbol, read_timestamp, size_of, skip_padding, type_of, unpack_list, unpack_struct,
};
pub use symtab::{Sym, Symtab};

/// The type of an encoded value, as reported by [`type_of`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    Null,
    Bool,
    Int,
    Float,
    Timestamp,
    String,
    Bytes,
    Symbol,
    List,
    Struct,
}

pub(crate) const TAG_NULL: u8 = 0x00;
pub(crate) const TAG_FALSE: u8 = 0x01;
pub(crate) const TAG_TRUE: u8 = 0x02;
pub(crate) const TAG_INT: u8 = 0x03;
pub(crate) const TAG_FLOAT: u8 = 0x04;
pub(crate) const TAG_TIMESTAMP: u8 = 0x05;
pub(crate) const TAG_STRING: u8 = 0x06;
pub(crate) const TAG_BYTES: u8 = 0x07;
pub(crate) const TAG_SYMBOL: u8 = 0x08;
pub(crate) const TAG_LIST: u8 = 0x09;
pub(crate) const TAG_STRUCT: u8 = 0x0a;

#[derive(derive_more::Display, Debug)]
pub enum Error {
    #[display(fmt = "unexpected end of encoded input")]
    Truncated,
    #[display(fmt = "expected {expected:?}, found {found:?}")]
    Unexpected { expected: Type, found: Type },
    #[display(fmt = "unknown type tag {_0:#04x}")]
    UnknownTag(u8),
    #[display(fmt = "varint wider than 64 bits")]
    VarintOverflow,
    #[display(fmt = "invalid UTF-8 in encoded string")]
    InvalidUtf8,
    #[display(fmt = "symbol {_0} not present in symbol table")]
    UnknownSymbol(u64),
    #[display(fmt = "duplicate name in symbol table")]
    DuplicateSymbol,
    #[display(fmt = "struct key must be a string or symbol, found {_0:?}")]
    BadStructKey(Type),
    #[display(fmt = "{_0} trailing bytes after value")]
    TrailingBytes(usize),
    #[display(fmt = "timestamp out of representable range")]
    TimestampRange,
}

impl error_stack::Context for Error {}
