//! Read-only mapped routing index.
//!
//! The file is a compact trie over dot-separated name segments. Each node
//! optionally carries (context, type) indices, a sorted array of children,
//! a sorted array of exact-match leaves, and prefix entries checked after
//! the node itself. All strings live in one shared pool; context and type
//! name arrays are sorted so binary search by byte comparison is valid.
//!
//! Layout (little-endian u32 fields, offsets absolute within the file):
//!
//! ```text
//! header:  current_version · minimum_supported_version · size
//!          contexts_array_offset · num_contexts
//!          types_array_offset · num_types
//!          root_offset · strings_offset · reserved
//! node:    namelen · name_offset · context_index · type_index
//!          num_child_nodes · child_nodes_offset
//!          num_exact_matches · exact_matches_offset
//!          num_prefixes · prefix_entries_offset
//! match:   name_offset · namelen · context_index · type_index
//! ```

use std::cmp::Ordering;
use std::ffi::CStr;
use std::fs::OpenOptions;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::Path;

use memmap2::{Mmap, MmapOptions};

use kura_core::{Error, Result};

/// Sentinel for "no context/type here".
pub const NO_INDEX: u32 = u32::MAX;

pub(crate) const HEADER_WORDS: usize = 10;
pub(crate) const HEADER_SIZE: usize = HEADER_WORDS * 4;

// Header word indices.
pub(crate) const H_CURRENT_VERSION: usize = 0;
pub(crate) const H_MIN_SUPPORTED: usize = 1;
pub(crate) const H_SIZE: usize = 2;
pub(crate) const H_CONTEXTS_OFFSET: usize = 3;
pub(crate) const H_NUM_CONTEXTS: usize = 4;
pub(crate) const H_TYPES_OFFSET: usize = 5;
pub(crate) const H_NUM_TYPES: usize = 6;
pub(crate) const H_ROOT_OFFSET: usize = 7;
pub(crate) const H_STRINGS_OFFSET: usize = 8;

pub(crate) const SUPPORTED_VERSION: u32 = 1;

/// A read-only mapping of the routing index.
pub struct BinaryIndex {
    map: Mmap,
}

impl BinaryIndex {
    /// Map and validate an index file. Rejects unsafe ownership or modes,
    /// an unsupported format version, and a recorded size that disagrees
    /// with the mapped size.
    pub fn load(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NOFOLLOW | libc::O_CLOEXEC)
            .open(path)
            .map_err(|e| Error::MapFailure {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        let meta = file.metadata()?;
        let owner_ok = meta.uid() == 0 || meta.uid() == unsafe { libc::geteuid() };
        if !owner_ok || meta.mode() & 0o022 != 0 || (meta.len() as usize) < HEADER_SIZE {
            return Err(Error::MapFailure {
                path: path.to_path_buf(),
                message: "refusing index with unsafe ownership, mode, or size".to_string(),
            });
        }

        let map = unsafe { MmapOptions::new().map(&file) }.map_err(|e| Error::MapFailure {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let index = Self { map };
        if index.header(H_MIN_SUPPORTED) > SUPPORTED_VERSION {
            return Err(Error::MapFailure {
                path: path.to_path_buf(),
                message: format!(
                    "index requires version {}, this reader supports {}",
                    index.header(H_MIN_SUPPORTED),
                    SUPPORTED_VERSION
                ),
            });
        }
        if index.header(H_SIZE) as usize != index.map.len() {
            return Err(Error::MapFailure {
                path: path.to_path_buf(),
                message: "index recorded size does not match file size".to_string(),
            });
        }
        Ok(index)
    }

    pub fn num_contexts(&self) -> usize {
        self.header(H_NUM_CONTEXTS) as usize
    }

    pub fn num_types(&self) -> usize {
        self.header(H_NUM_TYPES) as usize
    }

    /// Context name by index. Sentinel or out-of-range yields `None`.
    pub fn context(&self, index: u32) -> Option<&str> {
        if index == NO_INDEX || index as usize >= self.num_contexts() {
            return None;
        }
        let array = self.header(H_CONTEXTS_OFFSET) as usize;
        Some(self.c_string(self.u32_at(array + index as usize * 4)))
    }

    /// Type name by index.
    pub fn type_name(&self, index: u32) -> Option<&str> {
        if index == NO_INDEX || index as usize >= self.num_types() {
            return None;
        }
        let array = self.header(H_TYPES_OFFSET) as usize;
        Some(self.c_string(self.u32_at(array + index as usize * 4)))
    }

    /// Binary-search the sorted context array for an exact name.
    pub fn find_context_index(&self, context: &str) -> Option<u32> {
        let array = self.header(H_CONTEXTS_OFFSET) as usize;
        binary_search(self.num_contexts(), |i| {
            self.c_string(self.u32_at(array + i * 4))
                .as_bytes()
                .cmp(context.as_bytes())
        })
        .map(|i| i as u32)
    }

    /// Resolve `name` to (context_index, type_index); [`NO_INDEX`] marks a
    /// missing match. Node and prefix hits accumulate as "current best"
    /// during descent; exact matches win at the leaf.
    pub fn get_indexes(&self, name: &str) -> (u32, u32) {
        let mut context = NO_INDEX;
        let mut type_index = NO_INDEX;
        let mut node = self.node_at(self.header(H_ROOT_OFFSET) as usize);
        let mut remaining = name;

        loop {
            if node.context_index() != NO_INDEX {
                context = node.context_index();
            }
            if node.type_index() != NO_INDEX {
                type_index = node.type_index();
            }
            // Prefixes rank below the node itself: by construction they are
            // strictly longer than the path to this node.
            node.check_prefix_match(remaining, &mut context, &mut type_index);

            let Some(pos) = remaining.find('.') else { break };
            let Some(child) = node.find_child(&remaining[..pos]) else { break };
            node = child;
            remaining = &remaining[pos + 1..];
        }

        for i in 0..node.num_exact_matches() {
            let m = node.exact_match(i);
            if self.c_string(m.name_offset) == remaining {
                let ctx = if m.context_index != NO_INDEX { m.context_index } else { context };
                let ty = if m.type_index != NO_INDEX { m.type_index } else { type_index };
                return (ctx, ty);
            }
        }
        (context, type_index)
    }

    /// Resolve `name` straight to its context label.
    pub fn context_for(&self, name: &str) -> Option<&str> {
        let (context, _) = self.get_indexes(name);
        self.context(context)
    }

    // ── raw accessors ───────────────────────────────────────────────────

    fn header(&self, word: usize) -> u32 {
        self.u32_at(word * 4)
    }

    fn u32_at(&self, offset: usize) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.map[offset..offset + 4]);
        u32::from_le_bytes(raw)
    }

    fn c_string(&self, offset: u32) -> &str {
        let bytes = &self.map[offset as usize..];
        CStr::from_bytes_until_nul(bytes)
            .ok()
            .and_then(|c| c.to_str().ok())
            .unwrap_or_default()
    }

    fn node_at(&self, offset: usize) -> NodeRef<'_> {
        NodeRef { index: self, offset }
    }
}

/// View of one serialized trie node.
struct NodeRef<'a> {
    index: &'a BinaryIndex,
    offset: usize,
}

struct MatchRef {
    name_offset: u32,
    namelen: u32,
    context_index: u32,
    type_index: u32,
}

impl<'a> NodeRef<'a> {
    fn word(&self, i: usize) -> u32 {
        self.index.u32_at(self.offset + i * 4)
    }

    fn name(&self) -> &'a [u8] {
        self.index.c_string(self.word(1)).as_bytes()
    }

    fn context_index(&self) -> u32 {
        self.word(2)
    }

    fn type_index(&self) -> u32 {
        self.word(3)
    }

    fn num_children(&self) -> usize {
        self.word(4) as usize
    }

    fn child(&self, i: usize) -> NodeRef<'a> {
        let array = self.word(5) as usize;
        self.index.node_at(self.index.u32_at(array + i * 4) as usize)
    }

    fn num_exact_matches(&self) -> usize {
        self.word(6) as usize
    }

    fn match_at(&self, array_word: usize, i: usize) -> MatchRef {
        let array = self.word(array_word) as usize;
        let off = self.index.u32_at(array + i * 4) as usize;
        MatchRef {
            name_offset: self.index.u32_at(off),
            namelen: self.index.u32_at(off + 4),
            context_index: self.index.u32_at(off + 8),
            type_index: self.index.u32_at(off + 12),
        }
    }

    fn exact_match(&self, i: usize) -> MatchRef {
        self.match_at(7, i)
    }

    fn num_prefixes(&self) -> usize {
        self.word(8) as usize
    }

    fn prefix(&self, i: usize) -> MatchRef {
        self.match_at(9, i)
    }

    /// Binary-search the sorted child array for a full segment match.
    fn find_child(&self, segment: &str) -> Option<NodeRef<'a>> {
        let segment = segment.as_bytes();
        let found = binary_search(self.num_children(), |i| {
            let child_name = self.child(i).name();
            let cmp = strncmp(child_name, segment, segment.len());
            if cmp == Ordering::Equal && child_name.len() > segment.len() {
                // Only a prefix of the child's name matched; the real match,
                // if any, sorts earlier.
                Ordering::Greater
            } else {
                cmp
            }
        })?;
        Some(self.child(found))
    }

    /// First matching prefix entry updates the accumulated indices. Entries
    /// are ordered longest-first, so the first hit is the longest match.
    fn check_prefix_match(&self, remaining: &str, context: &mut u32, type_index: &mut u32) {
        let remaining = remaining.as_bytes();
        for i in 0..self.num_prefixes() {
            let p = self.prefix(i);
            let len = p.namelen as usize;
            if len > remaining.len() {
                continue;
            }
            if self.index.c_string(p.name_offset).as_bytes() == &remaining[..len] {
                if p.context_index != NO_INDEX {
                    *context = p.context_index;
                }
                if p.type_index != NO_INDEX {
                    *type_index = p.type_index;
                }
                return;
            }
        }
    }
}

/// strncmp semantics: a missing byte compares as NUL.
fn strncmp(a: &[u8], b: &[u8], n: usize) -> Ordering {
    for i in 0..n {
        let ca = a.get(i).copied().unwrap_or(0);
        let cb = b.get(i).copied().unwrap_or(0);
        match ca.cmp(&cb) {
            Ordering::Equal if ca == 0 => return Ordering::Equal,
            Ordering::Equal => {}
            other => return other,
        }
    }
    Ordering::Equal
}

/// Classic bounded binary search over index space; `cmp(i)` compares element
/// `i` against the target.
fn binary_search(len: usize, cmp: impl Fn(usize) -> Ordering) -> Option<usize> {
    let mut bottom = 0isize;
    let mut top = len as isize - 1;
    while top >= bottom {
        let mid = (top + bottom) / 2;
        match cmp(mid as usize) {
            Ordering::Equal => return Some(mid as usize),
            Ordering::Less => bottom = mid + 1,
            Ordering::Greater => top = mid - 1,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strncmp_treats_missing_bytes_as_nul() {
        assert_eq!(strncmp(b"abc", b"abc", 3), Ordering::Equal);
        assert_eq!(strncmp(b"ab", b"abc", 3), Ordering::Less);
        assert_eq!(strncmp(b"abd", b"abc", 3), Ordering::Greater);
        assert_eq!(strncmp(b"abx", b"ab", 2), Ordering::Equal);
    }

    #[test]
    fn binary_search_finds_each_element() {
        let items = [1, 3, 5, 7, 9];
        for (i, v) in items.iter().enumerate() {
            assert_eq!(binary_search(items.len(), |j| items[j].cmp(v)), Some(i));
        }
        assert_eq!(binary_search(items.len(), |j| items[j].cmp(&4)), None);
        assert_eq!(binary_search(0, |_| Ordering::Equal), None);
    }
}
