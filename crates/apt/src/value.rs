//! The tagged value cell
//!
//! Every decoded field is one of a closed set of shapes: fixed-width
//! primitives, a null-terminated string, a pointer, a pointer-to-array, an
//! alignment pad, or an ordered record of named members. Consumers pattern
//! match over [`Value`]; there is no dynamic dispatch anywhere in the
//! decoder.

use crate::{Error, Result};

/// Absolute unsigned 32-bit offset into the Apt blob. Addresses are the
/// identity of decoded objects.
pub type Address = u32;

/// A pointer-valued field. Address 0 means null.
#[derive(Debug, Clone, PartialEq)]
pub struct Pointer {
    pub pointed_type: String,
    pub address: Address,
}

/// A pointer to a contiguous array whose element count is read from a
/// sibling member of the containing record. The length stays unset until
/// the containing record has been fully constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayPointer {
    pub pointed_type: String,
    pub address: Address,
    pub length_member: String,
    pub length: Option<u32>,
}

/// Alignment padding; `padded` is how many bytes construction actually
/// consumed to reach a multiple of `align`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Padding {
    pub align: u32,
    pub padded: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    U8(u8),
    U16(u16),
    /// Three-byte little-endian unsigned value.
    U24(u32),
    I32(i32),
    U32(u32),
    F32(f32),
    Str(String),
    Pointer(Pointer),
    ArrayPointer(ArrayPointer),
    Padding(Padding),
    Record(Vec<(String, AptValue)>),
}

/// A decoded value together with its schema identity. `type_name` is the
/// concrete type, `base_type_name` differs when the value was reconstructed
/// through a derived-type dispatch table.
#[derive(Debug, Clone, PartialEq)]
pub struct AptValue {
    pub type_name: String,
    pub base_type_name: String,
    pub value: Value,
    pub overridden_size: Option<u32>,
}

impl AptValue {
    /// The first member with the given name, if this is a record.
    pub fn member(&self, name: &str) -> Option<&AptValue> {
        match &self.value {
            Value::Record(members) => members
                .iter()
                .find(|(member_name, _)| member_name == name)
                .map(|(_, member)| member),
            _ => None,
        }
    }

    pub fn members(&self) -> Option<&[(String, AptValue)]> {
        match &self.value {
            Value::Record(members) => Some(members),
            _ => None,
        }
    }

    /// Decoded byte size. An overridden size wins; padding reports what it
    /// consumed; strings count their null terminator; records sum their
    /// members.
    pub fn size(&self) -> u32 {
        if let Some(size) = self.overridden_size {
            return size;
        }
        match &self.value {
            Value::U8(_) => 1,
            Value::U16(_) => 2,
            Value::U24(_) => 3,
            Value::I32(_) | Value::U32(_) | Value::F32(_) => 4,
            Value::Pointer(_) | Value::ArrayPointer(_) => 4,
            Value::Str(text) => text.len() as u32 + 1,
            Value::Padding(padding) => padding.padded,
            Value::Record(members) => members.iter().map(|(_, member)| member.size()).sum(),
        }
    }

    pub fn as_u32(&self) -> Result<u32> {
        match self.value {
            Value::U8(v) => Ok(v as u32),
            Value::U16(v) => Ok(v as u32),
            Value::U24(v) => Ok(v),
            Value::I32(v) => Ok(v as u32),
            Value::U32(v) => Ok(v),
            Value::F32(v) => Ok(v as u32),
            _ => Err(Error::NotNumeric {
                type_name: self.type_name.clone(),
            }),
        }
    }

    pub fn as_i32(&self) -> Result<i32> {
        match self.value {
            Value::U8(v) => Ok(v as i32),
            Value::U16(v) => Ok(v as i32),
            Value::U24(v) => Ok(v as i32),
            Value::I32(v) => Ok(v),
            Value::U32(v) => Ok(v as i32),
            Value::F32(v) => Ok(v as i32),
            _ => Err(Error::NotNumeric {
                type_name: self.type_name.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(members: Vec<(&str, AptValue)>) -> AptValue {
        AptValue {
            type_name: "Test".into(),
            base_type_name: "Test".into(),
            value: Value::Record(
                members
                    .into_iter()
                    .map(|(name, member)| (name.to_string(), member))
                    .collect(),
            ),
            overridden_size: None,
        }
    }

    fn u16_value(v: u16) -> AptValue {
        AptValue {
            type_name: "Unsigned16".into(),
            base_type_name: "Unsigned16".into(),
            value: Value::U16(v),
            overridden_size: None,
        }
    }

    #[test]
    fn test_member_lookup_first_match() {
        let value = record(vec![("a", u16_value(1)), ("a", u16_value(2))]);
        assert_eq!(value.member("a").unwrap().as_u32().unwrap(), 1);
        assert!(value.member("missing").is_none());
    }

    #[test]
    fn test_size_rules() {
        let string = AptValue {
            type_name: "String".into(),
            base_type_name: "String".into(),
            value: Value::Str("abc".into()),
            overridden_size: None,
        };
        assert_eq!(string.size(), 4);

        let padding = AptValue {
            type_name: "PaddingForAlignment".into(),
            base_type_name: "PaddingForAlignment".into(),
            value: Value::Padding(Padding { align: 4, padded: 3 }),
            overridden_size: None,
        };
        assert_eq!(padding.size(), 3);

        let rec = record(vec![("a", u16_value(0)), ("s", string), ("p", padding)]);
        assert_eq!(rec.size(), 2 + 4 + 3);

        let overridden = AptValue {
            overridden_size: Some(40),
            ..rec
        };
        assert_eq!(overridden.size(), 40);
    }

    #[test]
    fn test_numeric_conversion() {
        assert_eq!(u16_value(0x1234).as_u32().unwrap(), 0x1234);

        let negative = AptValue {
            type_name: "Int32".into(),
            base_type_name: "Int32".into(),
            value: Value::I32(-8),
            overridden_size: None,
        };
        assert_eq!(negative.as_i32().unwrap(), -8);

        let string = AptValue {
            type_name: "String".into(),
            base_type_name: "String".into(),
            value: Value::Str("x".into()),
            overridden_size: None,
        };
        assert!(matches!(string.as_u32(), Err(Error::NotNumeric { .. })));
    }
}
