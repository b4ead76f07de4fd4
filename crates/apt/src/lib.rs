//! Apt binary movie decoder
//!
//! Apt files describe an interactive-graphics movie as a graph of typed
//! records (stage, frames, characters, shapes, actions) laid out at fixed
//! absolute offsets inside a single blob, accompanied by a `.const` sidecar
//! holding the constant pool and the entry offset.
//!
//! # Format Overview
//!
//! ## Apt blob (`X`)
//!
//! Purely positional; every offset in the file is absolute. A nonzero prefix
//! before the first decoded object is the file header; every other byte must
//! either be claimed by a decoded object or be zero.
//!
//! ## Constant sidecar (`X.const`)
//!
//! - Bytes 0..19: magic `"Apt constant file\x1A\0\0"`
//! - Bytes 20..23: entry offset into `X` (LE u32)
//! - Bytes 24..27: item count (LE u32)
//! - Bytes 28..31: skipped
//! - Then `count` entries of 8 bytes each: `(type code: LE u32, raw: 4 bytes)`
//!
//! ## Type definition texts
//!
//! Record layouts are not hardcoded; they are read from schema texts
//! (semicolon-terminated declarations with `$Base` inheritance and `$Derive`
//! discriminant dispatch, see [`definitions`]). The decoder interprets a
//! schema against the blob to materialize typed values, follows pointers
//! transitively, disassembles the action bytecode streams and reconstructs
//! the whole graph as annotated XML.

pub mod constfile;
pub mod decode;
pub mod definitions;
pub mod disasm;
pub mod pool;
pub mod refs;
pub mod schema;
pub mod source;
pub mod value;
pub mod xml;

// Re-export main types
pub use constfile::{ConstFile, ConstItem, CONST_FILE_MAGIC};
pub use decode::{decode, DecodedMovie, SchemaTexts};
pub use definitions::{parse_type_definitions, strip_block_comments};
pub use disasm::{read_instructions, resolve_function_ends, DestinationMap};
pub use pool::ObjectPool;
pub use refs::{analyze_references, ReferenceAnalysis};
pub use schema::{DerivedTypes, TypeEntry, TypeRegistry};
pub use source::{DataSource, Reader};
pub use value::{Address, AptValue, ArrayPointer, Padding, Pointer, Value};
pub use xml::movie_to_xml;

/// Errors from Apt decoding
#[derive(thiserror::Error, Debug)]
pub enum Error {
    // input integrity
    #[error("invalid const file magic")]
    BadConstMagic,

    #[error("data too short: need {needed} bytes at offset {offset}, have {available}")]
    Truncated {
        offset: u32,
        needed: u32,
        available: u32,
    },

    #[error("empty parse range: begin {begin} >= end {end}")]
    EmptyParseRange { begin: u32, end: u32 },

    #[error("string at offset {offset} has no null terminator")]
    UnterminatedString { offset: u32 },

    #[error("non-null unparsed data in [{begin}, {end})")]
    UnparsedData { begin: u32, end: u32 },

    #[error("unknown const item type {code}")]
    UnknownConstType { code: u32 },

    #[error("constant index {index} out of range")]
    ConstantIndex { index: u32 },

    // schema
    #[error("cannot find type {0}")]
    UnknownType(String),

    #[error("duplicate type {0} during merge")]
    DuplicateType(String),

    #[error("another derived type table already exists for {0}")]
    DeriveRedefined(String),

    #[error("alignment must be a nonzero integer, got {0:?}")]
    BadAlignment(String),

    #[error("discriminant id must be integral, got {0:?}")]
    BadDiscriminant(String),

    #[error("cannot find any base type named {0} with a derived type table")]
    MissingBase(String),

    #[error("unterminated block comment")]
    UnterminatedComment,

    #[error("malformed member declaration {0:?}")]
    MalformedMember(String),

    #[error("malformed derive clause {0:?}")]
    MalformedDerive(String),

    // structural overlap
    #[error(
        "{name} at {offset} (size {size}) does not fit: overlaps {other} at {other_offset} (size {other_size})"
    )]
    ObjectOverlap {
        name: String,
        offset: u32,
        size: u32,
        other: String,
        other_offset: u32,
        other_size: u32,
    },

    #[error("array [{begin}, {end}) overlaps existing array [{other_begin}, {other_end})")]
    ArrayOverlap {
        begin: u32,
        end: u32,
        other_begin: u32,
        other_end: u32,
    },

    // dispatch
    #[error("no derived type of {type_name} for discriminant {id}")]
    UnknownDiscriminant { type_name: String, id: u32 },

    // graph
    #[error("another type already exists at {address}: {existing}, expected {expected}")]
    TypeConflict {
        address: u32,
        existing: String,
        expected: String,
    },

    #[error("array length member {name} not found in {type_name}")]
    ArrayLengthMissing { type_name: String, name: String },

    #[error("array length not set")]
    ArrayLengthUnset,

    #[error("array element type {0} has zero size")]
    ZeroSizeElement(String),

    #[error("no object at address {address}")]
    MissingObject { address: u32 },

    #[error("no instruction array at address {address}")]
    MissingArray { address: u32 },

    #[error("no instruction precedes function body end {address}")]
    FunctionBodyEnd { address: u32 },

    #[error("no member named {name} in {type_name}")]
    MemberNotFound { type_name: String, name: String },

    // convert
    #[error("cannot convert a {type_name} value to a number")]
    NotNumeric { type_name: String },
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Truncated {
            offset: 8,
            needed: 4,
            available: 1,
        };
        assert!(err.to_string().contains("need 4 bytes at offset 8"));

        let err = Error::ObjectOverlap {
            name: "Frame".into(),
            offset: 16,
            size: 8,
            other: "Movie".into(),
            other_offset: 12,
            other_size: 32,
        };
        let text = err.to_string();
        assert!(text.contains("Frame at 16"));
        assert!(text.contains("Movie at 12"));

        let err = Error::UnknownDiscriminant {
            type_name: "Character".into(),
            id: 42,
        };
        assert!(err.to_string().contains("Character"));
        assert!(err.to_string().contains("42"));
    }
}
