//! Reference analysis over the resolved object graph
//!
//! A single traversal rooted at the entry object counts inbound references
//! per address and records, for every address reached through a pointer,
//! pointer-to-array or `actionDataOffset` member, which object referenced
//! it first and through which chain of member names. The emitter uses the
//! parent map to nest otherwise-top-level objects under the member that
//! referenced them. Cycles are cut with an ancestor-address stack local to
//! the traversal, so shared subgraphs are still visited through different
//! parents.

use crate::pool::ObjectPool;
use crate::value::{Address, AptValue, Value};
use crate::{Error, Result};
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct ReferenceAnalysis {
    /// Inbound reference count per reached address.
    pub counts: BTreeMap<Address, usize>,
    /// First referencing parent per reached address: the parent object's
    /// address and the member-name path inside it.
    pub parents: BTreeMap<Address, (Address, Vec<String>)>,
}

impl ReferenceAnalysis {
    fn record(&mut self, target: Address, ancestors: &[Address], path: &[String]) {
        *self.counts.entry(target).or_default() += 1;
        let parent = *ancestors.last().expect("traversal always has a root");
        self.parents
            .entry(target)
            .or_insert_with(|| (parent, path.to_vec()));
    }
}

pub fn analyze_references(pool: &ObjectPool, entry_offset: Address) -> Result<ReferenceAnalysis> {
    let mut analysis = ReferenceAnalysis::default();
    let entry = pool
        .objects
        .get(&entry_offset)
        .ok_or(Error::MissingObject {
            address: entry_offset,
        })?;

    let mut ancestors = vec![entry_offset];
    let mut path = Vec::new();
    visit(pool, entry, &mut path, &mut ancestors, &mut analysis)?;
    Ok(analysis)
}

/// Recursive walk. `path` accumulates member names inside the current
/// object and resets whenever the traversal hops to a pointed object;
/// `ancestors` holds the addresses currently on the traversal stack.
fn visit(
    pool: &ObjectPool,
    value: &AptValue,
    path: &mut Vec<String>,
    ancestors: &mut Vec<Address>,
    analysis: &mut ReferenceAnalysis,
) -> Result<()> {
    match &value.value {
        Value::Record(members) => {
            for (name, member) in members {
                path.push(name.clone());
                visit(pool, member, path, ancestors, analysis)?;
                path.pop();
            }
            Ok(())
        }

        Value::U32(address) => {
            // a u32 only participates in the graph as an action data offset
            if path.last().map(String::as_str) != Some("actionDataOffset") || *address == 0 {
                return Ok(());
            }
            let begin = *address;
            let past_end = *pool
                .arrays
                .get(&begin)
                .ok_or(Error::MissingArray { address: begin })?;
            analysis.record(begin, ancestors, path);

            for (&instruction_address, instruction) in pool.objects.range(begin..past_end) {
                if ancestors.contains(&instruction_address) {
                    return Ok(());
                }
                ancestors.push(instruction_address);
                let mut inner_path = Vec::new();
                visit(pool, instruction, &mut inner_path, ancestors, analysis)?;
                ancestors.pop();
            }
            Ok(())
        }

        Value::Pointer(pointer) => {
            if pointer.address == 0 || ancestors.contains(&pointer.address) {
                return Ok(());
            }
            analysis.record(pointer.address, ancestors, path);
            let next = pool
                .objects
                .get(&pointer.address)
                .ok_or(Error::MissingObject {
                    address: pointer.address,
                })?;
            ancestors.push(pointer.address);
            let mut inner_path = Vec::new();
            visit(pool, next, &mut inner_path, ancestors, analysis)?;
            ancestors.pop();
            Ok(())
        }

        Value::ArrayPointer(array) => {
            let length = array.length.unwrap_or(0);
            if length == 0 {
                return Ok(());
            }
            analysis.record(array.address, ancestors, path);

            let element_size = pool.registry.get_type(&array.pointed_type)?.size();
            for index in 0..length {
                let element_address = array.address + index * element_size;
                if ancestors.contains(&element_address) {
                    continue;
                }
                let element = pool
                    .objects
                    .get(&element_address)
                    .ok_or(Error::MissingObject {
                        address: element_address,
                    })?;
                ancestors.push(element_address);
                let mut inner_path = Vec::new();
                visit(pool, element, &mut inner_path, ancestors, analysis)?;
                ancestors.pop();
            }
            Ok(())
        }

        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::parse_type_definitions;
    use crate::source::DataSource;

    fn pool_with(schema: &str, data: Vec<u8>) -> ObjectPool {
        let mut pool = ObjectPool::new(DataSource::new(data));
        let types = parse_type_definitions(schema, &pool.registry).unwrap();
        pool.registry.merge(types).unwrap();
        pool
    }

    fn decode_entry(pool: &mut ObjectPool, type_name: &str, offset: Address) {
        let prototype = pool.registry.get_type(type_name).unwrap();
        let mut reader = pool.reader_at(offset).unwrap();
        let entry = pool.construct_object(&prototype, &mut reader).unwrap();
        pool.insert_object(entry.clone(), offset).unwrap();
        pool.fetch_pointed_objects(&entry).unwrap();
    }

    #[test]
    fn test_shared_leaf_counted_twice_first_parent_wins() {
        let schema = "Root = Pointer > Leaf:left, Pointer > Leaf:right; Leaf = Unsigned8:v;";
        let mut data = vec![0u8; 13];
        data[0..4].copy_from_slice(&12u32.to_le_bytes());
        data[4..8].copy_from_slice(&12u32.to_le_bytes());
        data[12] = 0x2A;

        let mut pool = pool_with(schema, data);
        decode_entry(&mut pool, "Root", 0);

        let analysis = analyze_references(&pool, 0).unwrap();
        assert_eq!(analysis.counts.get(&12), Some(&2));
        let (parent, path) = analysis.parents.get(&12).unwrap();
        assert_eq!(*parent, 0);
        assert_eq!(path, &vec!["left".to_string()]);
    }

    #[test]
    fn test_nested_member_path() {
        let schema = "Root = Inner:inner; Inner = Unsigned32:filler, Pointer > Leaf:target; \
                      Leaf = Unsigned8:v;";
        let mut data = vec![0u8; 9];
        data[4..8].copy_from_slice(&8u32.to_le_bytes());

        let mut pool = pool_with(schema, data);
        decode_entry(&mut pool, "Root", 0);

        let analysis = analyze_references(&pool, 0).unwrap();
        let (parent, path) = analysis.parents.get(&8).unwrap();
        assert_eq!(*parent, 0);
        assert_eq!(path, &vec!["inner".to_string(), "target".to_string()]);
    }

    #[test]
    fn test_cycle_is_cut() {
        let schema = "P = Pointer > Q:other; Q = Pointer > P:other;";
        let mut data = vec![0u8; 16];
        data[4..8].copy_from_slice(&12u32.to_le_bytes());
        data[12..16].copy_from_slice(&4u32.to_le_bytes());

        let mut pool = pool_with(schema, data);
        decode_entry(&mut pool, "P", 4);

        let analysis = analyze_references(&pool, 4).unwrap();
        // Q referenced once from P; the back edge to P is cut by the
        // ancestor stack and never counted
        assert_eq!(analysis.counts.get(&12), Some(&1));
        assert_eq!(analysis.counts.get(&4), None);
    }

    #[test]
    fn test_array_elements_visited() {
        let schema = "Root = Unsigned32:n, PointerToArray<n> > Item:items; \
                      Item = Pointer > Leaf:leaf; Leaf = Unsigned8:v;";
        let mut data = vec![0u8; 21];
        data[0..4].copy_from_slice(&2u32.to_le_bytes());
        data[4..8].copy_from_slice(&8u32.to_le_bytes());
        data[8..12].copy_from_slice(&16u32.to_le_bytes());
        data[12..16].copy_from_slice(&20u32.to_le_bytes());
        data[16] = 1;
        data[20] = 2;

        let mut pool = pool_with(schema, data);
        decode_entry(&mut pool, "Root", 0);

        let analysis = analyze_references(&pool, 0).unwrap();
        // the array itself, plus one leaf from each element
        assert_eq!(analysis.counts.get(&8), Some(&1));
        assert_eq!(analysis.counts.get(&16), Some(&1));
        assert_eq!(analysis.counts.get(&20), Some(&1));
        // leaves hang off their element, with a fresh path per object
        assert_eq!(
            analysis.parents.get(&16).unwrap(),
            &(8, vec!["leaf".to_string()])
        );
        assert_eq!(
            analysis.parents.get(&20).unwrap(),
            &(12, vec!["leaf".to_string()])
        );
        assert_eq!(
            analysis.parents.get(&8).unwrap(),
            &(0, vec!["items".to_string()])
        );
    }

    #[test]
    fn test_action_offset_references_instruction_array() {
        let schema = "Root = Unsigned32:actionDataOffset; \
                      Instruction = Unsigned8:op, $Derive: op 0 End; \
                      End = $Base:Instruction;";
        let mut data = vec![0u8; 9];
        data[0..4].copy_from_slice(&8u32.to_le_bytes());

        let mut pool = pool_with(schema, data);
        decode_entry(&mut pool, "Root", 0);
        let mut destinations = crate::disasm::DestinationMap::new();
        crate::disasm::read_instructions(&mut pool, 8, &mut destinations).unwrap();

        let analysis = analyze_references(&pool, 0).unwrap();
        assert_eq!(analysis.counts.get(&8), Some(&1));
        assert_eq!(
            analysis.parents.get(&8).unwrap(),
            &(0, vec!["actionDataOffset".to_string()])
        );
    }

    #[test]
    fn test_missing_action_array_fails() {
        let schema = "Root = Unsigned32:actionDataOffset;";
        let mut data = vec![0u8; 4];
        data[0..4].copy_from_slice(&2u32.to_le_bytes());
        let mut pool = pool_with(schema, data);
        decode_entry(&mut pool, "Root", 0);

        assert!(matches!(
            analyze_references(&pool, 0),
            Err(Error::MissingArray { address: 2 })
        ));
    }
}
