//! Object pool and constructor
//!
//! Decoded objects live in an address-keyed ordered map; the address is
//! their identity. The pool constructs values from prototypes, re-reads
//! records through their derived-type dispatch tables until a leaf type is
//! reached, resolves pointer-to-array lengths from sibling members, and
//! walks the pointer graph fetching pointed objects on demand. Inserts
//! enforce that no two objects overlap and that array extents stay
//! disjoint.

use crate::schema::TypeRegistry;
use crate::source::{DataSource, Reader};
use crate::value::{Address, AptValue, Pointer, Value};
use crate::{Error, Result};
use std::collections::BTreeMap;

#[derive(Debug)]
pub struct ObjectPool {
    pub source: DataSource,
    pub registry: TypeRegistry,
    /// Decoded objects by absolute offset. Extents never overlap.
    pub objects: BTreeMap<Address, AptValue>,
    /// Array extents as `begin -> past the end`.
    pub arrays: BTreeMap<Address, Address>,
    /// Objects whose pointees are being fetched, for cycle cutting.
    fetching: BTreeMap<Address, String>,
}

impl ObjectPool {
    pub fn new(source: DataSource) -> Self {
        Self {
            source,
            registry: TypeRegistry::new(),
            objects: BTreeMap::new(),
            arrays: BTreeMap::new(),
            fetching: BTreeMap::new(),
        }
    }

    pub fn reader_at(&self, offset: Address) -> Result<Reader<'_>> {
        self.source.reader_at(offset)
    }

    /// Build a value from a prototype at the reader's position. If the
    /// constructed record's type carries a dispatch table, the discriminant
    /// member picks the derived type and the record is re-read from the
    /// captured reader state; dispatch recurses until a leaf type is
    /// reached. Afterwards every pointer-to-array member gets its length
    /// from the sibling member it names.
    pub fn construct_object(&self, prototype: &AptValue, reader: &mut Reader) -> Result<AptValue> {
        let mut instance = prototype.clone();
        let original_state = *reader;

        match &mut instance.value {
            Value::Record(members) => {
                for (_, member) in members.iter_mut() {
                    let member_prototype = member.clone();
                    *member = self.construct_object(&member_prototype, reader)?;
                }
            }
            Value::U8(v) => *v = reader.read_u8()?,
            Value::U16(v) => *v = reader.read_u16()?,
            Value::U24(v) => *v = reader.read_u24()?,
            Value::I32(v) => *v = reader.read_i32()?,
            Value::U32(v) => *v = reader.read_u32()?,
            Value::F32(v) => *v = reader.read_f32()?,
            Value::Str(text) => *text = reader.read_string()?,
            Value::Pointer(pointer) => pointer.address = reader.read_u32()?,
            Value::ArrayPointer(array) => array.address = reader.read_u32()?,
            Value::Padding(padding) => {
                if padding.align == 0 {
                    return Err(Error::BadAlignment("0".to_string()));
                }
                padding.padded = 0;
                while reader.absolute_position() % padding.align != 0 {
                    reader.read_front(1)?;
                    padding.padded += 1;
                }
            }
        }

        if let Some(derived_name) = self.derived_type_for(&instance)? {
            *reader = original_state;
            let derived_prototype = self.registry.get_type(&derived_name)?;
            instance = self.construct_object(&derived_prototype, reader)?;
        }

        self.resolve_array_lengths(&mut instance)?;
        Ok(instance)
    }

    fn derived_type_for(&self, instance: &AptValue) -> Result<Option<String>> {
        let Some(entry) = self.registry.entry(&instance.type_name) else {
            return Ok(None);
        };
        let Some(derived) = &entry.derived else {
            return Ok(None);
        };

        let discriminant = instance
            .member(&derived.tag)
            .ok_or_else(|| Error::MemberNotFound {
                type_name: instance.type_name.clone(),
                name: derived.tag.clone(),
            })?
            .as_u32()?;
        let name = derived
            .map
            .get(&discriminant)
            .ok_or_else(|| Error::UnknownDiscriminant {
                type_name: instance.type_name.clone(),
                id: discriminant,
            })?;
        if *name == instance.type_name {
            return Ok(None);
        }
        Ok(Some(name.clone()))
    }

    fn resolve_array_lengths(&self, instance: &mut AptValue) -> Result<()> {
        let Value::Record(members) = &instance.value else {
            return Ok(());
        };
        let pending: Vec<(usize, String)> = members
            .iter()
            .enumerate()
            .filter_map(|(index, (_, member))| match &member.value {
                Value::ArrayPointer(array) => Some((index, array.length_member.clone())),
                _ => None,
            })
            .collect();

        for (index, length_member) in pending {
            let length = instance
                .member(&length_member)
                .ok_or_else(|| Error::ArrayLengthMissing {
                    type_name: instance.type_name.clone(),
                    name: length_member.clone(),
                })?
                .as_u32()?;
            if let Value::Record(members) = &mut instance.value {
                if let Value::ArrayPointer(array) = &mut members[index].1.value {
                    array.length = Some(length);
                }
            }
        }
        Ok(())
    }

    /// Place a constructed object at `offset`. The immediate neighbours in
    /// the map must not overlap it.
    pub fn insert_object(&mut self, value: AptValue, offset: Address) -> Result<()> {
        let size = value.size();

        if let Some((&before_offset, before)) = self.objects.range(..offset).next_back() {
            if before_offset + before.size() > offset {
                return Err(Error::ObjectOverlap {
                    name: value.type_name,
                    offset,
                    size,
                    other: before.type_name.clone(),
                    other_offset: before_offset,
                    other_size: before.size(),
                });
            }
        }
        if let Some((&after_offset, after)) = self.objects.range(offset..).next() {
            if offset + size > after_offset {
                return Err(Error::ObjectOverlap {
                    name: value.type_name,
                    offset,
                    size,
                    other: after.type_name.clone(),
                    other_offset: after_offset,
                    other_size: after.size(),
                });
            }
        }

        self.objects.insert(offset, value);
        Ok(())
    }

    /// Record an array extent. Empty extents are dropped, re-inserting the
    /// same extent is idempotent, distinct overlapping extents fail.
    pub fn insert_array(&mut self, begin: Address, past_end: Address) -> Result<()> {
        if begin == past_end {
            return Ok(());
        }
        if let Some((&other_begin, &other_end)) = self.arrays.range(..past_end).next_back() {
            let same = other_begin == begin && other_end == past_end;
            if !same && other_end > begin {
                return Err(Error::ArrayOverlap {
                    begin,
                    end: past_end,
                    other_begin,
                    other_end,
                });
            }
        }
        self.arrays.insert(begin, past_end);
        Ok(())
    }

    /// Transitively fetch every object reachable through pointer-valued
    /// fields of `value`, constructing and inserting missing ones. Cycles
    /// are cut by remembering which addresses are already being fetched.
    pub fn fetch_pointed_objects(&mut self, value: &AptValue) -> Result<()> {
        match &value.value {
            Value::Pointer(pointer) => self.fetch_pointer(pointer),
            Value::ArrayPointer(array) => {
                let length = array.length.ok_or(Error::ArrayLengthUnset)?;
                let element_size = self.registry.get_type(&array.pointed_type)?.size();
                if length > 0 && element_size == 0 {
                    return Err(Error::ZeroSizeElement(array.pointed_type.clone()));
                }

                let begin = array.address;
                let past_end = begin + length * element_size;
                let mut element = Pointer {
                    pointed_type: array.pointed_type.clone(),
                    address: begin,
                };
                while element.address < past_end {
                    self.fetch_pointer(&element)?;
                    element.address += element_size;
                }
                self.insert_array(begin, past_end)
            }
            Value::Record(members) => {
                for (_, member) in members {
                    self.fetch_pointed_objects(member)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn fetch_pointer(&mut self, pointer: &Pointer) -> Result<()> {
        if pointer.address == 0 {
            // null pointer
            return Ok(());
        }

        let pointed = self.registry.get_type(&pointer.pointed_type)?;
        match self.objects.get(&pointer.address) {
            Some(existing) => {
                // an object already lives here; it must be the pointed-to
                // type or derived from it
                if !self
                    .registry
                    .is_same_or_derived_from(existing, &pointed.type_name)?
                {
                    return Err(Error::TypeConflict {
                        address: pointer.address,
                        existing: existing.type_name.clone(),
                        expected: pointed.type_name.clone(),
                    });
                }
            }
            None => {
                let constructed = {
                    let mut reader = self.reader_at(pointer.address)?;
                    self.construct_object(&pointed, &mut reader)?
                };
                self.insert_object(constructed, pointer.address)?;
            }
        }

        let fetched = self
            .objects
            .get(&pointer.address)
            .cloned()
            .ok_or(Error::MissingObject {
                address: pointer.address,
            })?;
        if self.fetching.get(&pointer.address) == Some(&fetched.type_name) {
            // already being fetched further up the traversal
            return Ok(());
        }
        self.fetching.insert(pointer.address, fetched.type_name.clone());
        self.fetch_pointed_objects(&fetched)
    }
}
