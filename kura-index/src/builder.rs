//! Routing-index builder.
//!
//! Produces the format read by [`crate::BinaryIndex`]. Deployments generate
//! the index at build time; tests and writer-mode bootstrap generate it here
//! from `(name, context, type, exact)` records.
//!
//! A record's name is consumed one complete `.`-separated segment at a time,
//! creating trie nodes. What remains after the last separator becomes an
//! exact-match leaf, a prefix entry, or (when nothing remains, e.g. `ro.` or
//! `*`) the context of the node itself.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use byteorder::{LittleEndian, WriteBytesExt};

use kura_core::Result;

use crate::binary::{
    H_CONTEXTS_OFFSET, H_CURRENT_VERSION, H_MIN_SUPPORTED, H_NUM_CONTEXTS, H_NUM_TYPES,
    H_ROOT_OFFSET, H_SIZE, H_STRINGS_OFFSET, H_TYPES_OFFSET, HEADER_SIZE, NO_INDEX,
    SUPPORTED_VERSION,
};

#[derive(Default)]
struct BuildNode {
    context: Option<String>,
    type_name: Option<String>,
    /// Keyed by segment so serialization emits children in sorted order.
    children: BTreeMap<String, BuildNode>,
    exacts: Vec<Record>,
    prefixes: Vec<Record>,
}

struct Record {
    name: String,
    context: Option<String>,
    type_name: Option<String>,
}

/// Accumulates routing records and serializes the index.
#[derive(Default)]
pub struct IndexBuilder {
    root: BuildNode,
}

impl IndexBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one routing record. A trailing `*` marks a prefix match
    /// regardless of `exact`; `*` alone is the catch-all.
    pub fn add(&mut self, name: &str, context: &str, type_name: Option<&str>, exact: bool) {
        let (name, exact) = match name.strip_suffix('*') {
            Some(stripped) => (stripped, false),
            None => (name, exact),
        };

        let mut node = &mut self.root;
        let mut remaining = name;
        while let Some(pos) = remaining.find('.') {
            node = node.children.entry(remaining[..pos].to_string()).or_default();
            remaining = &remaining[pos + 1..];
        }

        let record = Record {
            name: remaining.to_string(),
            context: Some(context.to_string()),
            type_name: type_name.map(str::to_string),
        };
        if remaining.is_empty() {
            node.context = record.context;
            node.type_name = record.type_name;
        } else if exact {
            node.exacts.push(record);
        } else {
            node.prefixes.push(record);
        }
    }

    /// Serialize to the on-file format.
    pub fn build(&mut self) -> Vec<u8> {
        // Sort leaves up front: exact matches bytewise for the reader's
        // comparisons, prefixes longest-first so the first hit wins.
        sort_node(&mut self.root);

        let mut strings = StringPool::default();
        let mut contexts = Vec::new();
        let mut types = Vec::new();
        collect_strings(&self.root, "", &mut strings, &mut contexts, &mut types);
        contexts.sort();
        contexts.dedup();
        types.sort();
        types.dedup();

        let contexts_offset = HEADER_SIZE;
        let types_offset = contexts_offset + contexts.len() * 4;
        let strings_offset = types_offset + types.len() * 4;
        let nodes_offset = (strings_offset + strings.size()) + 3 & !3;
        strings.base = strings_offset as u32;

        let mut nodes = Vec::new();
        let root_offset = serialize_node(
            &self.root,
            "",
            nodes_offset,
            &mut nodes,
            &strings,
            &contexts,
            &types,
        );

        let total = nodes_offset + nodes.len();
        let mut out = Vec::with_capacity(total);
        let mut header = [0u32; HEADER_SIZE / 4];
        header[H_CURRENT_VERSION] = SUPPORTED_VERSION;
        header[H_MIN_SUPPORTED] = SUPPORTED_VERSION;
        header[H_SIZE] = total as u32;
        header[H_CONTEXTS_OFFSET] = contexts_offset as u32;
        header[H_NUM_CONTEXTS] = contexts.len() as u32;
        header[H_TYPES_OFFSET] = types_offset as u32;
        header[H_NUM_TYPES] = types.len() as u32;
        header[H_ROOT_OFFSET] = root_offset;
        header[H_STRINGS_OFFSET] = strings_offset as u32;
        for word in header {
            out.write_u32::<LittleEndian>(word).unwrap();
        }
        for context in &contexts {
            out.write_u32::<LittleEndian>(strings.offset_of(context)).unwrap();
        }
        for type_name in &types {
            out.write_u32::<LittleEndian>(strings.offset_of(type_name)).unwrap();
        }
        out.write_all(&strings.pool).unwrap();
        out.resize(nodes_offset, 0);
        out.write_all(&nodes).unwrap();
        out
    }

    /// Serialize and write to `path` (read-only, like the shipped index).
    pub fn write_to(&mut self, path: &Path) -> Result<()> {
        let bytes = self.build();
        std::fs::write(path, bytes)?;
        Ok(())
    }
}

fn sort_node(node: &mut BuildNode) {
    node.exacts.sort_by(|a, b| a.name.cmp(&b.name));
    node.prefixes
        .sort_by(|a, b| b.name.len().cmp(&a.name.len()).then_with(|| a.name.cmp(&b.name)));
    for child in node.children.values_mut() {
        sort_node(child);
    }
}

/// Deduplicating string pool; offsets are absolute once `base` is set.
#[derive(Default)]
struct StringPool {
    pool: Vec<u8>,
    offsets: BTreeMap<String, u32>,
    base: u32,
}

impl StringPool {
    fn intern(&mut self, s: &str) {
        if !self.offsets.contains_key(s) {
            self.offsets.insert(s.to_string(), self.pool.len() as u32);
            self.pool.extend_from_slice(s.as_bytes());
            self.pool.push(0);
        }
    }

    fn offset_of(&self, s: &str) -> u32 {
        self.base + self.offsets[s]
    }

    fn size(&self) -> usize {
        self.pool.len()
    }
}

fn collect_strings(
    node: &BuildNode,
    name: &str,
    strings: &mut StringPool,
    contexts: &mut Vec<String>,
    types: &mut Vec<String>,
) {
    strings.intern(name);
    let mut note = |record: &Record| {
        strings.intern(&record.name);
        if let Some(context) = &record.context {
            strings.intern(context);
            contexts.push(context.clone());
        }
        if let Some(type_name) = &record.type_name {
            strings.intern(type_name);
            types.push(type_name.clone());
        }
    };
    for record in node.exacts.iter().chain(&node.prefixes) {
        note(record);
    }
    if let Some(context) = &node.context {
        strings.intern(context);
        contexts.push(context.clone());
    }
    if let Some(type_name) = &node.type_name {
        strings.intern(type_name);
        types.push(type_name.clone());
    }
    for (segment, child) in &node.children {
        collect_strings(child, segment, strings, contexts, types);
    }
}

fn index_of(list: &[String], item: &Option<String>) -> u32 {
    item.as_ref()
        .and_then(|s| list.iter().position(|x| x == s))
        .map(|i| i as u32)
        .unwrap_or(NO_INDEX)
}

fn serialize_match(
    record: &Record,
    base: usize,
    out: &mut Vec<u8>,
    strings: &StringPool,
    contexts: &[String],
    types: &[String],
) -> u32 {
    let offset = (base + out.len()) as u32;
    out.write_u32::<LittleEndian>(strings.offset_of(&record.name)).unwrap();
    out.write_u32::<LittleEndian>(record.name.len() as u32).unwrap();
    out.write_u32::<LittleEndian>(index_of(contexts, &record.context)).unwrap();
    out.write_u32::<LittleEndian>(index_of(types, &record.type_name)).unwrap();
    offset
}

/// Children, match records, and offset arrays are emitted before the node
/// itself; returns the node's absolute offset.
fn serialize_node(
    node: &BuildNode,
    name: &str,
    base: usize,
    out: &mut Vec<u8>,
    strings: &StringPool,
    contexts: &[String],
    types: &[String],
) -> u32 {
    let child_offsets: Vec<u32> = node
        .children
        .iter()
        .map(|(segment, child)| serialize_node(child, segment, base, out, strings, contexts, types))
        .collect();
    let exact_offsets: Vec<u32> = node
        .exacts
        .iter()
        .map(|record| serialize_match(record, base, out, strings, contexts, types))
        .collect();
    let prefix_offsets: Vec<u32> = node
        .prefixes
        .iter()
        .map(|record| serialize_match(record, base, out, strings, contexts, types))
        .collect();

    let mut write_array = |offsets: &[u32]| -> u32 {
        let at = (base + out.len()) as u32;
        for offset in offsets {
            out.write_u32::<LittleEndian>(*offset).unwrap();
        }
        at
    };
    let children_at = write_array(&child_offsets);
    let exacts_at = write_array(&exact_offsets);
    let prefixes_at = write_array(&prefix_offsets);

    let node_offset = (base + out.len()) as u32;
    out.write_u32::<LittleEndian>(name.len() as u32).unwrap();
    out.write_u32::<LittleEndian>(strings.offset_of(name)).unwrap();
    out.write_u32::<LittleEndian>(index_of(contexts, &node.context)).unwrap();
    out.write_u32::<LittleEndian>(index_of(types, &node.type_name)).unwrap();
    out.write_u32::<LittleEndian>(child_offsets.len() as u32).unwrap();
    out.write_u32::<LittleEndian>(children_at).unwrap();
    out.write_u32::<LittleEndian>(exact_offsets.len() as u32).unwrap();
    out.write_u32::<LittleEndian>(exacts_at).unwrap();
    out.write_u32::<LittleEndian>(prefix_offsets.len() as u32).unwrap();
    out.write_u32::<LittleEndian>(prefixes_at).unwrap();
    node_offset
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_a_well_formed_header() {
        let mut builder = IndexBuilder::new();
        builder.add("ro.*", "u:object_r:ro_prop:s0", None, false);
        builder.add("ro.build.id", "u:object_r:build_prop:s0", Some("string"), true);
        let bytes = builder.build();

        let word = |i: usize| {
            u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap())
        };
        assert_eq!(word(H_CURRENT_VERSION), 1);
        assert_eq!(word(H_MIN_SUPPORTED), 1);
        assert_eq!(word(H_SIZE) as usize, bytes.len());
        assert_eq!(word(H_NUM_CONTEXTS), 2);
        assert_eq!(word(H_NUM_TYPES), 1);
        assert!(word(H_ROOT_OFFSET) as usize > HEADER_SIZE);
    }

    #[test]
    fn node_offsets_stay_aligned() {
        let mut builder = IndexBuilder::new();
        builder.add("odd", "label_one", None, true);
        builder.add("odd.length.names*", "label_two", None, false);
        let bytes = builder.build();
        let root = u32::from_le_bytes(
            bytes[H_ROOT_OFFSET * 4..H_ROOT_OFFSET * 4 + 4].try_into().unwrap(),
        );
        assert_eq!(root % 4, 0);
    }
}
