//! Schema text parser
//!
//! Declarations are semicolon-terminated `Name = Type:member, ...` records.
//! Block comments are stripped first. Two pseudo-members steer the schema:
//! `$Base:Parent` copies the parent's member list and records the
//! inheritance edge (the parent must carry a `$Derive` table — that is the
//! convention for an extensible type), and
//! `$Derive: tag 0xID Name ...` installs the discriminant dispatch table.

use crate::schema::{parse_integer, DerivedTypes, TypeEntry, TypeRegistry};
use crate::value::{AptValue, Value};
use crate::{Error, Result};
use std::collections::BTreeMap;

/// Remove `/* ... */` comments. An unterminated comment fails.
pub fn strip_block_comments(text: &str) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(begin) = rest.find("/*") {
        let end = rest[begin + 2..]
            .find("*/")
            .ok_or(Error::UnterminatedComment)?;
        out.push_str(&rest[..begin]);
        rest = &rest[begin + 2 + end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

fn parse_derived_types(clause: &str) -> Result<DerivedTypes> {
    let mut tokens = clause.split_whitespace();
    let tag = tokens
        .next()
        .ok_or_else(|| Error::MalformedDerive(clause.to_string()))?
        .to_string();

    let mut map = BTreeMap::new();
    while let Some(id_text) = tokens.next() {
        let name = tokens
            .next()
            .ok_or_else(|| Error::MalformedDerive(clause.to_string()))?;
        let id =
            parse_integer(id_text).ok_or_else(|| Error::BadDiscriminant(id_text.to_string()))?;
        if map.insert(id, name.to_string()).is_some() {
            return Err(Error::MalformedDerive(clause.to_string()));
        }
    }
    if map.is_empty() {
        return Err(Error::MalformedDerive(clause.to_string()));
    }
    Ok(DerivedTypes { tag, map })
}

fn lookup_type(
    name: &str,
    new_types: &BTreeMap<String, TypeEntry>,
    registry: &TypeRegistry,
) -> Result<AptValue> {
    if let Some(entry) = new_types.get(name) {
        return Ok(entry.prototype.clone());
    }
    registry.get_type(name)
}

fn lookup_entry<'a>(
    name: &str,
    new_types: &'a BTreeMap<String, TypeEntry>,
    registry: &'a TypeRegistry,
) -> Option<&'a TypeEntry> {
    new_types.get(name).or_else(|| registry.entry(name))
}

fn parse_declaration(
    declaration: &str,
    new_types: &BTreeMap<String, TypeEntry>,
    registry: &TypeRegistry,
) -> Result<(String, TypeEntry)> {
    let (name_part, members_part) = declaration
        .split_once('=')
        .unwrap_or((declaration, ""));
    let type_name = name_part.trim().to_string();

    let mut entry = TypeEntry {
        prototype: AptValue {
            type_name: type_name.clone(),
            base_type_name: type_name.clone(),
            value: Value::Record(Vec::new()),
            overridden_size: None,
        },
        derived: None,
    };

    for member in members_part.split(',') {
        let member = member.trim();
        if member.is_empty() {
            continue;
        }
        let (member_type, member_name) = member
            .split_once(':')
            .ok_or_else(|| Error::MalformedMember(member.to_string()))?;
        let member_type = member_type.trim();
        let member_name = member_name.trim();

        match member_type {
            "$Base" => {
                let base = lookup_entry(member_name, new_types, registry)
                    .filter(|entry| entry.derived.is_some())
                    .ok_or_else(|| Error::MissingBase(member_name.to_string()))?;
                entry.prototype.base_type_name = base.prototype.type_name.clone();
                entry.prototype.value = base.prototype.value.clone();
            }
            "$Derive" => {
                if entry.derived.is_some() {
                    return Err(Error::DeriveRedefined(type_name));
                }
                entry.derived = Some(parse_derived_types(member_name)?);
            }
            _ => {
                let prototype = lookup_type(member_type, new_types, registry)?;
                if let Value::Record(members) = &mut entry.prototype.value {
                    members.push((member_name.to_string(), prototype));
                }
            }
        }
    }

    Ok((type_name, entry))
}

/// Parse a whole schema text into entries ready to be merged into the
/// registry. Earlier declarations in the same text are visible to later
/// ones; a later declaration reusing a name is dropped and the first one
/// kept. Collisions against already-merged types are only detected by
/// [`TypeRegistry::merge`].
pub fn parse_type_definitions(
    input: &str,
    registry: &TypeRegistry,
) -> Result<BTreeMap<String, TypeEntry>> {
    let stripped = strip_block_comments(input)?;
    let mut new_types = BTreeMap::new();
    for declaration in stripped.split(';') {
        let declaration = declaration.trim();
        if declaration.is_empty() {
            continue;
        }
        let (name, entry) = parse_declaration(declaration, &new_types, registry)?;
        new_types.entry(name).or_insert(entry);
    }
    Ok(new_types)
}
