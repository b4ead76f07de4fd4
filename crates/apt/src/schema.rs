//! Type descriptors and the schema registry
//!
//! A descriptor is a prototype value: construction clones it and fills it
//! in from the reader. Built-in descriptors cover the primitives plus the
//! parameterized pointer and padding kinds; user records come from the
//! schema texts. Inheritance and polymorphism are plain data here —
//! `base_type_name` chains and an optional discriminant dispatch table —
//! never a trait hierarchy.

use crate::value::{AptValue, ArrayPointer, Padding, Pointer, Value};
use crate::{Error, Result};
use std::collections::BTreeMap;

/// Dispatch table of a polymorphic record: the integer read from the member
/// named `tag` selects the derived type to reconstruct with.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedTypes {
    pub tag: String,
    pub map: BTreeMap<u32, String>,
}

/// A user-defined type: its prototype plus the optional dispatch table.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeEntry {
    pub prototype: AptValue,
    pub derived: Option<DerivedTypes>,
}

/// Catalog of built-in and user-defined type descriptors.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    types: BTreeMap<String, TypeEntry>,
}

/// Parse a decimal or `0x`-prefixed hexadecimal integer.
pub(crate) fn parse_integer(text: &str) -> Option<u32> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}

fn built_in(name: &str) -> Option<AptValue> {
    let value = match name {
        "PaddingForAlignment" => Value::Padding(Padding { align: 0, padded: 0 }),
        "Unsigned8" => Value::U8(0),
        "Unsigned16" => Value::U16(0),
        "Unsigned24" => Value::U24(0),
        "Int32" => Value::I32(0),
        "Unsigned32" => Value::U32(0),
        "Float32" => Value::F32(0.0),
        "String" => Value::Str(String::new()),
        "Pointer" => Value::Pointer(Pointer {
            pointed_type: String::new(),
            address: 0,
        }),
        "PointerToArray" => Value::ArrayPointer(ArrayPointer {
            pointed_type: String::new(),
            address: 0,
            length_member: String::new(),
            length: None,
        }),
        _ => return None,
    };
    Some(AptValue {
        type_name: name.to_string(),
        base_type_name: name.to_string(),
        value,
        overridden_size: None,
    })
}

/// `PaddingForAlignment > N` — padding up to a multiple of N bytes.
fn parse_padding_declaration(declaration: &str) -> Result<AptValue> {
    let (name, alignment) = declaration
        .split_once('>')
        .ok_or_else(|| Error::BadAlignment(declaration.to_string()))?;
    if name.trim() != "PaddingForAlignment" {
        return Err(Error::UnknownType(declaration.to_string()));
    }
    let align = parse_integer(alignment)
        .filter(|&align| align != 0)
        .ok_or_else(|| Error::BadAlignment(alignment.trim().to_string()))?;

    let mut padding = built_in("PaddingForAlignment").expect("built-in padding");
    padding.value = Value::Padding(Padding { align, padded: 0 });
    Ok(padding)
}

/// `Pointer > T` or `PointerToArray<lengthMember> > T`. The attribute may
/// also be given space-separated (`PointerToArray lengthMember > T`). The
/// pointed-to type is kept as text and resolved lazily, so it may itself be
/// a pointer declaration or a record that is defined later.
fn parse_pointer_declaration(declaration: &str) -> Result<AptValue> {
    let trimmed = declaration.trim();
    let (tag, rest) = if let Some(rest) = trimmed.strip_prefix("PointerToArray") {
        ("PointerToArray", rest)
    } else if let Some(rest) = trimmed.strip_prefix("Pointer") {
        ("Pointer", rest)
    } else {
        return Err(Error::UnknownType(declaration.to_string()));
    };

    let rest = rest.trim_start();
    let (attribute, pointed) = if let Some(bracketed) = rest.strip_prefix('<') {
        let close = bracketed
            .find('>')
            .ok_or_else(|| Error::UnknownType(declaration.to_string()))?;
        let attribute = bracketed[..close].trim();
        let after = bracketed[close + 1..].trim_start();
        let pointed = after
            .strip_prefix('>')
            .ok_or_else(|| Error::UnknownType(declaration.to_string()))?;
        (attribute, pointed)
    } else {
        let separator = rest
            .find('>')
            .ok_or_else(|| Error::UnknownType(declaration.to_string()))?;
        (rest[..separator].trim(), &rest[separator + 1..])
    };

    let pointed = pointed.trim();
    if pointed.is_empty() {
        return Err(Error::UnknownType(declaration.to_string()));
    }

    let mut instance = built_in(tag).expect("built-in pointer");
    match &mut instance.value {
        Value::Pointer(pointer) => pointer.pointed_type = pointed.to_string(),
        Value::ArrayPointer(array) => {
            array.pointed_type = pointed.to_string();
            array.length_member = attribute.to_string();
        }
        _ => unreachable!(),
    }
    Ok(instance)
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a type reference to a fresh prototype. Pointer and padding
    /// declarations are instantiated on the fly; other names resolve against
    /// the built-in table, then the user map.
    pub fn get_type(&self, name: &str) -> Result<AptValue> {
        let name = name.trim();
        if name.starts_with("PaddingForAlignment") {
            return parse_padding_declaration(name);
        }
        if name.starts_with("Pointer") {
            return parse_pointer_declaration(name);
        }
        if let Some(prototype) = built_in(name) {
            return Ok(prototype);
        }
        if let Some(entry) = self.types.get(name) {
            return Ok(entry.prototype.clone());
        }
        Err(Error::UnknownType(name.to_string()))
    }

    /// The user-defined entry for `name`, including its dispatch table.
    pub fn entry(&self, name: &str) -> Option<&TypeEntry> {
        self.types.get(name)
    }

    /// Bulk-add parsed declarations. Any collision with an existing user
    /// type fails.
    pub fn merge(&mut self, new_types: BTreeMap<String, TypeEntry>) -> Result<()> {
        for name in new_types.keys() {
            if self.types.contains_key(name) {
                return Err(Error::DuplicateType(name.clone()));
            }
        }
        self.types.extend(new_types);
        Ok(())
    }

    /// Walk the `type_name -> base_type_name` chain of `value` looking for
    /// `base`.
    pub fn is_same_or_derived_from(&self, value: &AptValue, base: &str) -> Result<bool> {
        let mut type_name = value.type_name.clone();
        let mut base_name = value.base_type_name.clone();
        loop {
            if type_name == base || base_name == base {
                return Ok(true);
            }
            if base_name == type_name {
                return Ok(false);
            }
            let parent = self.get_type(&base_name)?;
            type_name = parent.type_name;
            base_name = parent.base_type_name;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_built_in_primitive_sizes() {
        let registry = TypeRegistry::new();
        for (name, size) in [
            ("Unsigned8", 1),
            ("Unsigned16", 2),
            ("Unsigned24", 3),
            ("Int32", 4),
            ("Unsigned32", 4),
            ("Float32", 4),
        ] {
            assert_eq!(registry.get_type(name).unwrap().size(), size, "{name}");
        }
    }

    #[test]
    fn test_pointer_declaration() {
        let registry = TypeRegistry::new();
        let pointer = registry.get_type("Pointer > String").unwrap();
        assert_eq!(pointer.size(), 4);
        match pointer.value {
            Value::Pointer(p) => assert_eq!(p.pointed_type, "String"),
            other => panic!("expected pointer, got {other:?}"),
        }
    }

    #[test]
    fn test_pointer_to_array_declaration() {
        let registry = TypeRegistry::new();
        for declaration in [
            "PointerToArray<count> > Unsigned16",
            "PointerToArray count > Unsigned16",
        ] {
            let array = registry.get_type(declaration).unwrap();
            match array.value {
                Value::ArrayPointer(a) => {
                    assert_eq!(a.pointed_type, "Unsigned16");
                    assert_eq!(a.length_member, "count");
                    assert_eq!(a.length, None);
                }
                other => panic!("expected array pointer, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_nested_pointer_declaration() {
        let registry = TypeRegistry::new();
        let pointer = registry.get_type("Pointer > Pointer > String").unwrap();
        match pointer.value {
            Value::Pointer(p) => assert_eq!(p.pointed_type, "Pointer > String"),
            other => panic!("expected pointer, got {other:?}"),
        }
    }

    #[test]
    fn test_padding_declaration() {
        let registry = TypeRegistry::new();
        let padding = registry.get_type("PaddingForAlignment > 4").unwrap();
        match padding.value {
            Value::Padding(p) => assert_eq!(p.align, 4),
            other => panic!("expected padding, got {other:?}"),
        }

        let hex = registry.get_type("PaddingForAlignment > 0x10").unwrap();
        match hex.value {
            Value::Padding(p) => assert_eq!(p.align, 16),
            other => panic!("expected padding, got {other:?}"),
        }

        assert!(matches!(
            registry.get_type("PaddingForAlignment > zero"),
            Err(Error::BadAlignment(_))
        ));
        assert!(matches!(
            registry.get_type("PaddingForAlignment > 0"),
            Err(Error::BadAlignment(_))
        ));
    }

    #[test]
    fn test_unknown_type() {
        let registry = TypeRegistry::new();
        assert!(matches!(
            registry.get_type("Nonsense"),
            Err(Error::UnknownType(_))
        ));
        // bare pointer without a pointed-to type is malformed
        assert!(registry.get_type("Pointer").is_err());
    }

    #[test]
    fn test_merge_rejects_duplicates() {
        let mut registry = TypeRegistry::new();
        let entry = TypeEntry {
            prototype: AptValue {
                type_name: "Frame".into(),
                base_type_name: "Frame".into(),
                value: Value::Record(Vec::new()),
                overridden_size: None,
            },
            derived: None,
        };
        let mut first = BTreeMap::new();
        first.insert("Frame".to_string(), entry.clone());
        registry.merge(first).unwrap();

        let mut second = BTreeMap::new();
        second.insert("Frame".to_string(), entry);
        assert!(matches!(
            registry.merge(second),
            Err(Error::DuplicateType(name)) if name == "Frame"
        ));
    }

    #[test]
    fn test_parse_integer() {
        assert_eq!(parse_integer("42"), Some(42));
        assert_eq!(parse_integer("0x2A"), Some(42));
        assert_eq!(parse_integer(" 0X0a "), Some(10));
        assert_eq!(parse_integer("nope"), None);
    }
}
