//! XML reconstruction of the decoded movie
//!
//! Objects are written in address order as elements tagged by their base
//! type name, with scalar members as attributes and nested records as child
//! elements. Pointer-valued members become `<Ref member=... address=.../>`
//! children; the reference analysis then nests each pointed object (and
//! each instruction `<Array>`) under the `<Ref>` that first referenced it.
//! Branch and function-definition instructions get their raw operands
//! replaced by resolved addresses, and the constant pool contributes hint
//! comments.

use crate::decode::DecodedMovie;
use crate::value::{Address, AptValue, Value};
use crate::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};

const ROOT: usize = 0;

enum XmlNode {
    Element(usize),
    Comment(String),
}

struct XmlElement {
    tag: String,
    attributes: Vec<(String, String)>,
    children: Vec<XmlNode>,
}

/// Minimal arena-backed XML tree; everything is escaped when printed.
pub struct XmlDocument {
    nodes: Vec<XmlElement>,
}

impl XmlDocument {
    pub fn new(root_tag: &str) -> Self {
        Self {
            nodes: vec![XmlElement {
                tag: root_tag.to_string(),
                attributes: Vec::new(),
                children: Vec::new(),
            }],
        }
    }

    /// A detached element; attach it later with [`XmlDocument::append_child`].
    pub fn create_element(&mut self, tag: &str) -> usize {
        self.nodes.push(XmlElement {
            tag: tag.to_string(),
            attributes: Vec::new(),
            children: Vec::new(),
        });
        self.nodes.len() - 1
    }

    pub fn append_child(&mut self, parent: usize, child: usize) {
        self.nodes[parent].children.push(XmlNode::Element(child));
    }

    pub fn append_comment(&mut self, parent: usize, text: String) {
        self.nodes[parent].children.push(XmlNode::Comment(text));
    }

    /// Set an attribute, replacing any existing one of the same name.
    pub fn set_attribute(&mut self, element: usize, name: &str, value: String) {
        let attributes = &mut self.nodes[element].attributes;
        if let Some(existing) = attributes.iter_mut().find(|(n, _)| n == name) {
            existing.1 = value;
        } else {
            attributes.push((name.to_string(), value));
        }
    }

    fn element_child_count(&self, element: usize) -> usize {
        self.nodes[element]
            .children
            .iter()
            .filter(|child| matches!(child, XmlNode::Element(_)))
            .count()
    }

    pub fn to_xml(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\"?>\n");
        self.write_element(ROOT, 0, &mut out);
        out
    }

    fn write_element(&self, element: usize, depth: usize, out: &mut String) {
        let node = &self.nodes[element];
        let indent = "    ".repeat(depth);
        out.push_str(&indent);
        out.push('<');
        out.push_str(&node.tag);
        for (name, value) in &node.attributes {
            out.push(' ');
            out.push_str(name);
            out.push_str("=\"");
            out.push_str(&escape(value));
            out.push('"');
        }
        if node.children.is_empty() {
            out.push_str("/>\n");
            return;
        }
        out.push_str(">\n");
        for child in &node.children {
            match child {
                XmlNode::Element(id) => self.write_element(*id, depth + 1, out),
                XmlNode::Comment(text) => {
                    out.push_str(&indent);
                    out.push_str("    <!--");
                    out.push_str(&escape(text));
                    out.push_str("-->\n");
                }
            }
        }
        out.push_str(&indent);
        out.push_str("</");
        out.push_str(&node.tag);
        out.push_str(">\n");
    }
}

/// Escape text for use in attribute values and comments.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
    out
}

fn attribute_name(member_name: &str) -> &str {
    if member_name.is_empty() {
        "value"
    } else {
        member_name
    }
}

/// Render the whole decoded movie as an XML document.
pub fn movie_to_xml(movie: &DecodedMovie) -> Result<String> {
    let mut emitter = Emitter {
        movie,
        doc: XmlDocument::new("ParsedAptData"),
        object_elements: BTreeMap::new(),
        array_elements: BTreeMap::new(),
        ref_slots: BTreeMap::new(),
        destination_targets: BTreeSet::new(),
    };
    emitter.build()?;
    Ok(emitter.doc.to_xml())
}

struct Emitter<'a> {
    movie: &'a DecodedMovie,
    doc: XmlDocument,
    object_elements: BTreeMap<Address, usize>,
    array_elements: BTreeMap<Address, usize>,
    /// `target address -> <Ref> element` inside the parent the reference
    /// analysis picked for that target.
    ref_slots: BTreeMap<Address, usize>,
    /// Addresses some branch or function definition resolves to.
    destination_targets: BTreeSet<Address>,
}

impl<'a> Emitter<'a> {
    fn build(&mut self) -> Result<()> {
        let movie = self.movie;

        self.destination_targets = movie
            .destinations
            .values()
            .map(|&(destination, _)| destination)
            .collect();

        for (&address, object) in &movie.pool.objects {
            let element = self.create_object_element(address, object)?;
            self.object_elements.insert(address, element);
        }
        for (&begin, _) in &movie.pool.arrays {
            let element = self.doc.create_element("Array");
            self.doc.set_attribute(element, "startAddress", begin.to_string());
            self.array_elements.insert(begin, element);
        }
        self.place_all()
    }

    fn create_object_element(&mut self, address: Address, object: &AptValue) -> Result<usize> {
        let movie = self.movie;
        let element = self.doc.create_element(&object.base_type_name);

        let referenced = movie.references.counts.get(&address).copied().unwrap_or(0) > 0
            || self.destination_targets.contains(&address);
        let opens_array = movie.pool.arrays.contains_key(&address);
        if (referenced && !opens_array) || movie.destinations.contains_key(&address) {
            self.doc.set_attribute(element, "address", address.to_string());
        }

        // branch/function operands are replaced by resolved addresses
        let mut replacement = None;
        if object.base_type_name == "Instruction" {
            if let Some(&(destination, _)) = movie.destinations.get(&address) {
                if object.type_name.starts_with("Branch") {
                    replacement = Some(("offset", "destinationAddress", destination));
                } else if object.type_name.starts_with("DefineFunction") {
                    replacement = Some(("size", "lastInstructionStartAddress", destination));
                }
            }
        }

        self.write_value(element, address, "", object, replacement)?;
        self.write_type_attribute(element, object)?;
        Ok(element)
    }

    fn write_value(
        &mut self,
        element: usize,
        owner: Address,
        name: &str,
        value: &AptValue,
        replacement: Option<(&str, &str, Address)>,
    ) -> Result<()> {
        match &value.value {
            Value::U8(v) => self.doc.set_attribute(element, attribute_name(name), v.to_string()),
            Value::U16(v) => self.doc.set_attribute(element, attribute_name(name), v.to_string()),
            Value::U24(v) => self.doc.set_attribute(element, attribute_name(name), v.to_string()),
            Value::I32(v) => self.doc.set_attribute(element, attribute_name(name), v.to_string()),
            Value::U32(v) => self.doc.set_attribute(element, attribute_name(name), v.to_string()),
            Value::F32(v) => self.doc.set_attribute(element, attribute_name(name), v.to_string()),
            Value::Str(text) => self.doc.set_attribute(element, attribute_name(name), text.clone()),
            Value::Padding(_) => {}
            Value::Pointer(pointer) => {
                self.write_reference(element, owner, name, &pointer.pointed_type, pointer.address)
            }
            Value::ArrayPointer(array) => {
                self.write_reference(element, owner, name, &array.pointed_type, array.address)
            }
            Value::Record(members) => {
                for (member_name, member) in members {
                    if let Some((skipped, _, _)) = replacement {
                        if member_name == skipped && !matches!(member.value, Value::Record(_)) {
                            continue;
                        }
                    }
                    match &member.value {
                        Value::Record(_) => {
                            let child = self.doc.create_element(&member.base_type_name);
                            self.doc.append_child(element, child);
                            self.doc.set_attribute(child, "name", member_name.clone());
                            self.write_value(child, owner, "", member, None)?;
                            self.write_type_attribute(child, member)?;
                        }
                        Value::U32(v) if member_name == "actionDataOffset" && *v != 0 => {
                            self.write_reference(element, owner, member_name, "", *v);
                        }
                        _ => self.write_value(element, owner, member_name, member, None)?,
                    }
                }
                if let Some((_, attribute, destination)) = replacement {
                    self.doc.set_attribute(element, attribute, destination.to_string());
                }
            }
        }
        Ok(())
    }

    /// A `<Ref>` child for a pointer-valued member. When the reference
    /// analysis picked this owner as the target's parent, the target object
    /// will later be nested inside this element.
    fn write_reference(
        &mut self,
        element: usize,
        owner: Address,
        member_name: &str,
        pointed_type: &str,
        address: Address,
    ) {
        let reference = self.doc.create_element("Ref");
        self.doc.append_child(element, reference);
        self.doc
            .set_attribute(reference, "member", attribute_name(member_name).to_string());
        self.doc.set_attribute(reference, "address", address.to_string());
        if address == 0 {
            return;
        }

        if self
            .movie
            .references
            .parents
            .get(&address)
            .is_some_and(|(parent, _)| *parent == owner)
        {
            self.ref_slots.entry(address).or_insert(reference);
        }

        // string targets get their text inlined as a hint
        if pointed_type == "String" {
            if let Some(target) = self.movie.pool.objects.get(&address) {
                if let Value::Str(text) = &target.value {
                    let shown = if text.is_empty() { "(empty)" } else { text };
                    self.doc
                        .append_comment(reference, format!("Address {address} = {shown}"));
                }
            }
        }
    }

    /// Values reconstructed through dispatch carry their concrete type in
    /// an attribute named after the base type's discriminant tag.
    fn write_type_attribute(&mut self, element: usize, value: &AptValue) -> Result<()> {
        if value.type_name == value.base_type_name {
            return Ok(());
        }
        let tag = self
            .movie
            .pool
            .registry
            .entry(&value.base_type_name)
            .and_then(|entry| entry.derived.as_ref())
            .map(|derived| derived.tag.clone())
            .ok_or_else(|| Error::UnknownType(value.base_type_name.clone()))?;
        self.doc.set_attribute(element, &tag, value.type_name.clone());
        Ok(())
    }

    fn place_all(&mut self) -> Result<()> {
        let movie = self.movie;

        // destination comments, emitted in front of the instruction they
        // point at
        let mut pending: Vec<(Address, Address, &String)> = movie
            .destinations
            .iter()
            .map(|(&source, &(destination, ref information))| (destination, source, information))
            .collect();
        pending.sort_by_key(|&(destination, source, _)| (destination, source));
        let mut pending = pending.into_iter().peekable();

        let function_ends: BTreeSet<Address> = movie
            .destinations
            .values()
            .filter(|(_, information)| information.starts_with("DefineFunction"))
            .map(|&(destination, _)| destination)
            .collect();

        for (&address, object) in &movie.pool.objects {
            let array = movie
                .pool
                .arrays
                .range(..=address)
                .next_back()
                .map(|(&begin, &end)| (begin, end))
                .filter(|&(_, end)| end > address);

            let container = match array {
                Some((begin, _)) => {
                    if begin == address {
                        // the array opens here; place its element first
                        let outer = self.container_for(begin);
                        let array_element = self.array_elements[&begin];
                        self.doc.append_child(outer, array_element);
                    }
                    self.array_elements[&begin]
                }
                None => self.container_for(address),
            };

            while let Some(&(destination, _, information)) = pending.peek() {
                if destination > address {
                    break;
                }
                self.doc
                    .append_comment(container, format!("{destination} referenced by {information}"));
                pending.next();
            }

            if object.base_type_name == "Instruction" {
                if let Some(hint) = self.constant_hint(object)? {
                    self.doc.append_comment(container, hint);
                }
            }

            let element = self.object_elements[&address];
            if array.is_some() {
                let index = self.doc.element_child_count(container);
                self.doc.set_attribute(element, "index", index.to_string());
            }
            self.doc.append_child(container, element);

            if function_ends.contains(&address) && object.base_type_name == "Instruction" {
                self.doc.append_comment(container, "End Of Function".to_string());
            }
        }

        for (destination, _, information) in pending {
            self.doc
                .append_comment(ROOT, format!("{destination} referenced by {information}"));
        }
        Ok(())
    }

    fn container_for(&self, address: Address) -> usize {
        self.ref_slots.get(&address).copied().unwrap_or(ROOT)
    }

    /// `ConstantID <n> is <value>` for instructions carrying a constant-id
    /// operand. `ConstantPool` itself is skipped.
    fn constant_hint(&self, instruction: &AptValue) -> Result<Option<String>> {
        if instruction.type_name == "ConstantPool" {
            return Ok(None);
        }
        let Some(members) = instruction.members() else {
            return Ok(None);
        };
        let Some((_, member)) = members
            .iter()
            .find(|(name, _)| name.to_ascii_lowercase().contains("constantid"))
        else {
            return Ok(None);
        };

        let index = member.as_u32()?;
        let item = self
            .movie
            .constants
            .items
            .get(index as usize)
            .ok_or(Error::ConstantIndex { index })?;
        Ok(item
            .describe()
            .map(|text| format!("ConstantID {index} is {text}")))
    }
}
