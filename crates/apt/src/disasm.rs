//! Action bytecode disassembly
//!
//! Instructions are ordinary polymorphic records (`Instruction` plus a
//! discriminant dispatch table), decoded linearly from an action data
//! offset. `Branch*` and `DefineFunction*` instructions yield control-flow
//! destinations; a stream only ends once an `End` instruction has been
//! decoded and the cursor has passed every recorded destination, so an
//! `End` in the middle of a function body does not terminate the stream.

use crate::pool::ObjectPool;
use crate::value::Address;
use crate::{Error, Result};
use std::collections::BTreeMap;

/// `instruction start -> (destination, "TypeName@start")` for every branch
/// and function definition.
pub type DestinationMap = BTreeMap<Address, (Address, String)>;

/// Decode one instruction stream starting at `start`, inserting every
/// instruction into the pool and recording the stream's extent as an array.
pub fn read_instructions(
    pool: &mut ObjectPool,
    start: Address,
    destinations: &mut DestinationMap,
) -> Result<()> {
    let instruction_prototype = pool.registry.get_type("Instruction")?;

    let mut position = start;
    let mut can_end_after = start;

    loop {
        let current = position;
        let (instruction, after) = {
            let mut reader = pool.reader_at(current)?;
            let instruction = pool.construct_object(&instruction_prototype, &mut reader)?;
            (instruction, reader.absolute_position())
        };
        let type_name = instruction.type_name.clone();

        let mut record_destination = |destination: Address| {
            destinations.insert(current, (destination, format!("{type_name}@{current}")));
            can_end_after = can_end_after.max(destination);
        };

        if type_name.starts_with("Branch") {
            let offset = instruction
                .member("offset")
                .ok_or_else(|| Error::MemberNotFound {
                    type_name: type_name.clone(),
                    name: "offset".to_string(),
                })?
                .as_i32()?;
            record_destination((after as i64 + offset as i64) as Address);
        }
        if type_name.starts_with("DefineFunction") {
            let size = instruction
                .member("size")
                .ok_or_else(|| Error::MemberNotFound {
                    type_name: type_name.clone(),
                    name: "size".to_string(),
                })?
                .as_u32()?;
            record_destination(after + size);
        }

        let ends_stream = type_name == "End";

        pool.fetch_pointed_objects(&instruction)?;
        pool.insert_object(instruction, current)?;
        position = after;

        if ends_stream && position > can_end_after {
            break;
        }
    }

    pool.insert_array(start, position)
}

/// Rewrite every `DefineFunction*` destination from the body's
/// past-the-end offset to the start of the last instruction inside the
/// body.
pub fn resolve_function_ends(
    pool: &ObjectPool,
    destinations: &mut DestinationMap,
) -> Result<()> {
    for (destination, information) in destinations.values_mut() {
        if !information.starts_with("DefineFunction") {
            continue;
        }
        let (&last_start, _) = pool
            .objects
            .range(..*destination)
            .next_back()
            .ok_or(Error::FunctionBodyEnd {
                address: *destination,
            })?;
        *destination = last_start;
    }
    Ok(())
}
