//! End-to-end decode pipeline
//!
//! Serial phases over process-local state: load the const sidecar, merge
//! the main schema, construct the entry `Movie` record, transitively fetch
//! pointed objects, merge the action schemas, disassemble every action
//! stream, rewrite function-body ends, analyze references, then apply the
//! unparsed-byte policy (a nonzero prefix becomes the header object, every
//! other leftover byte must be zero).

use crate::constfile::ConstFile;
use crate::definitions::parse_type_definitions;
use crate::disasm::{read_instructions, resolve_function_ends, DestinationMap};
use crate::pool::ObjectPool;
use crate::refs::{analyze_references, ReferenceAnalysis};
use crate::source::DataSource;
use crate::value::{Address, AptValue, Value};
use crate::{Error, Result};
use std::collections::BTreeSet;

/// The three schema texts the decoder is driven by.
pub struct SchemaTexts {
    /// Record layouts of the movie object graph.
    pub type_definitions: String,
    /// The `Instruction` base type and its dispatch table.
    pub action_declarations: String,
    /// Layouts of the individual instructions.
    pub action_definitions: String,
}

/// Everything the emitter needs: the finished pool plus the instruction
/// destinations, the reference analysis and the constant table.
pub struct DecodedMovie {
    pub pool: ObjectPool,
    pub destinations: DestinationMap,
    pub references: ReferenceAnalysis,
    pub constants: ConstFile,
    pub entry_offset: Address,
}

/// Synthetic type name for the unrecognized file prefix.
pub const HEADER_TYPE_NAME: &str = "AptHeaderData";

pub fn decode(data: Vec<u8>, const_data: &[u8], schemas: &SchemaTexts) -> Result<DecodedMovie> {
    let constants = ConstFile::parse(const_data)?;
    let entry_offset = constants.entry_offset;

    let mut pool = ObjectPool::new(DataSource::new(data));
    let types = parse_type_definitions(&schemas.type_definitions, &pool.registry)?;
    pool.registry.merge(types)?;

    let movie = {
        let prototype = pool.registry.get_type("Movie")?;
        let mut reader = pool.reader_at(entry_offset)?;
        pool.construct_object(&prototype, &mut reader)?
    };
    pool.insert_object(movie.clone(), entry_offset)?;
    pool.fetch_pointed_objects(&movie)?;

    let declarations = parse_type_definitions(&schemas.action_declarations, &pool.registry)?;
    pool.registry.merge(declarations)?;
    let definitions = parse_type_definitions(&schemas.action_definitions, &pool.registry)?;
    pool.registry.merge(definitions)?;

    let mut destinations = DestinationMap::new();
    let action_offsets: BTreeSet<Address> = pool
        .objects
        .values()
        .filter_map(|object| match object.member("actionDataOffset") {
            Some(member) => match member.value {
                Value::U32(address) => Some(address),
                _ => None,
            },
            None => None,
        })
        .collect();
    for offset in action_offsets {
        read_instructions(&mut pool, offset, &mut destinations)?;
    }
    resolve_function_ends(&pool, &mut destinations)?;

    let references = analyze_references(&pool, entry_offset)?;

    // unparsed-byte policy: the prefix is the header, the rest must be zero
    for (begin, end) in pool.source.unparsed_ranges() {
        if begin == 0 {
            let text = format_header_bytes(&pool.source.bytes()[..end as usize]);
            let header = AptValue {
                type_name: HEADER_TYPE_NAME.to_string(),
                base_type_name: HEADER_TYPE_NAME.to_string(),
                value: Value::Str(text),
                overridden_size: Some(end),
            };
            pool.insert_object(header, 0)?;
            continue;
        }
        let bytes = &pool.source.bytes()[begin as usize..end as usize];
        if bytes.iter().any(|&byte| byte != 0) {
            return Err(Error::UnparsedData { begin, end });
        }
    }

    Ok(DecodedMovie {
        pool,
        destinations,
        references,
        constants,
        entry_offset,
    })
}

/// Printable bytes stay as-is, everything else becomes an upper-case
/// `\xNN` escape.
fn format_header_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for &byte in bytes {
        if byte.is_ascii_graphic() || byte == b' ' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("\\x{byte:02X}"));
        }
    }
    out
}
