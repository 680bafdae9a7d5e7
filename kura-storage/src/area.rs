//! Memory-mapped property area.
//!
//! One area is a fixed 128 KiB file: a header, then a data region holding a
//! trie of property entries managed by an append-only bump allocator. Many
//! reader processes traverse the trie without locks while a single writer
//! process mutates it; publication of new nodes and entries is a
//! release-store of their offset, value rewrites follow the dirty-bit
//! handshake in [`PropArea::update`].

use std::cmp::Ordering as CmpOrdering;
use std::ffi::CStr;
use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::Path;
use std::ptr;
use std::sync::atomic::{fence, AtomicU32, Ordering};

use memmap2::{Mmap, MmapMut, MmapOptions};
use tracing::warn;

use kura_core::{Error, Result, AREA_MAGIC, AREA_SIZE, AREA_VERSION, VALUE_MAX};

use crate::entry::{PropEntry, ENTRY_HEADER};
use crate::futex;
use crate::node::{TrieNode, NODE_HEADER};
use crate::serial::{next_serial, serial_dirty, serial_value_len, DIRTY_BIT};

/// On-file area header. Little-endian, 4-byte aligned; the data region
/// starts immediately after it. `reserved` padding keeps room for future
/// fields without moving the data region.
#[repr(C)]
struct AreaHeader {
    magic: u32,
    version: u32,
    reserved: [u32; 6],
    bytes_used: AtomicU32,
    serial: AtomicU32,
    dirty_backup: [u8; VALUE_MAX],
}

const HEADER_SIZE: usize = std::mem::size_of::<AreaHeader>();

enum Mapping {
    Ro(#[allow(dead_code)] Mmap),
    Rw(#[allow(dead_code)] MmapMut),
}

/// Stack buffer a value is read into. Sized so no read path ever allocates.
pub struct ValueBuf {
    buf: [u8; VALUE_MAX],
    len: usize,
}

impl ValueBuf {
    pub fn new() -> Self {
        Self {
            buf: [0; VALUE_MAX],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(self.as_bytes()).unwrap_or_default()
    }
}

impl Default for ValueBuf {
    fn default() -> Self {
        Self::new()
    }
}

/// A shared mapping of one property area file.
///
/// Readers hold shared references and never mutate; the writer process is
/// the only mutator and the only allocator. All methods take `&self`; the
/// single-writer discipline is what makes the interior raw-pointer writes
/// sound.
pub struct PropArea {
    base: *mut u8,
    size: usize,
    rw: bool,
    _map: Mapping,
}

// The mapping is shared memory deliberately accessed from many threads; all
// cross-thread traffic goes through atomics, fences, and raw-pointer copies
// ordered by the serial protocols.
unsafe impl Send for PropArea {}
unsafe impl Sync for PropArea {}

impl PropArea {
    /// Create a fresh area file, failing if it already exists.
    ///
    /// The file is created mode 0444, labelled via the `security.selinux`
    /// extended attribute when `label` is given, sized to 128 KiB, and
    /// mapped shared read-write. The returned flag reports an xattr apply
    /// failure; only the init daemon treats that as fatal.
    pub fn create(path: &Path, label: Option<&str>) -> Result<(Self, bool)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o444)
            .custom_flags(libc::O_NOFOLLOW | libc::O_CLOEXEC)
            .open(path)
            .map_err(|e| Error::MapFailure {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        let mut label_failed = false;
        if let Some(label) = label {
            if let Err(e) = apply_label(&file, label) {
                warn!(label, path = %path.display(), error = %e, "failed to apply area label");
                label_failed = true;
            }
        }

        file.set_len(AREA_SIZE as u64)?;
        let mut map = unsafe { MmapOptions::new().map_mut(&file) }.map_err(|e| {
            Error::MapFailure {
                path: path.to_path_buf(),
                message: e.to_string(),
            }
        })?;

        let base = map.as_mut_ptr();
        unsafe {
            let hdr = base as *mut AreaHeader;
            ptr::addr_of_mut!((*hdr).magic).write(AREA_MAGIC);
            ptr::addr_of_mut!((*hdr).version).write(AREA_VERSION);
            ptr::addr_of_mut!((*hdr).bytes_used).write(AtomicU32::new(0));
            ptr::addr_of_mut!((*hdr).serial).write(AtomicU32::new(0));
            // reserved words and the backup slot stay zero-filled.
        }

        let area = Self {
            base,
            size: AREA_SIZE,
            rw: true,
            _map: Mapping::Rw(map),
        };
        // Root trie node lands at data offset 0.
        area.alloc_node(b"")?;
        Ok((area, label_failed))
    }

    /// Map an existing area, read-write when the file permits it, read-only
    /// otherwise. Rejects files with the wrong owner, group/world write
    /// bits, a short size, or a bad magic/version.
    pub fn open(path: &Path) -> Result<Self> {
        let flags = libc::O_NOFOLLOW | libc::O_CLOEXEC;
        let (file, rw) = match OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(flags)
            .open(path)
        {
            Ok(f) => (f, true),
            Err(_) => (
                OpenOptions::new()
                    .read(true)
                    .custom_flags(flags)
                    .open(path)
                    .map_err(|e| Error::MapFailure {
                        path: path.to_path_buf(),
                        message: e.to_string(),
                    })?,
                false,
            ),
        };

        let meta = file.metadata()?;
        let owner_ok = meta.uid() == 0 || meta.uid() == unsafe { libc::geteuid() };
        if !owner_ok || meta.mode() & 0o022 != 0 || (meta.len() as usize) < HEADER_SIZE {
            return Err(Error::MapFailure {
                path: path.to_path_buf(),
                message: "refusing area with unsafe ownership, mode, or size".to_string(),
            });
        }
        let size = meta.len() as usize;

        let (base, map) = if rw {
            let mut map = unsafe { MmapOptions::new().map_mut(&file) }.map_err(|e| {
                Error::MapFailure {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                }
            })?;
            (map.as_mut_ptr(), Mapping::Rw(map))
        } else {
            let map = unsafe { MmapOptions::new().map(&file) }.map_err(|e| Error::MapFailure {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
            (map.as_ptr() as *mut u8, Mapping::Ro(map))
        };

        let area = Self {
            base,
            size,
            rw,
            _map: map,
        };
        let hdr = area.header();
        if hdr.magic != AREA_MAGIC || hdr.version != AREA_VERSION {
            return Err(Error::MapFailure {
                path: path.to_path_buf(),
                message: format!(
                    "bad area signature: magic {:#x}, version {:#x}",
                    hdr.magic, hdr.version
                ),
            });
        }
        Ok(area)
    }

    pub fn is_rw(&self) -> bool {
        self.rw
    }

    /// The area-wide serial word, bumped after every mutation in the area
    /// that owns the global serial.
    pub fn serial(&self) -> &AtomicU32 {
        &self.header().serial
    }

    /// Bump the area serial (release) and wake its waiters. Writer only.
    pub fn bump_serial(&self) {
        let serial = self.serial();
        serial.store(serial.load(Ordering::Relaxed).wrapping_add(1), Ordering::Release);
        futex::wake_all(serial);
    }

    // ── lookup ──────────────────────────────────────────────────────────

    /// Find the entry for `name`; returns its data-region offset.
    pub fn find(&self, name: &str) -> Option<u32> {
        let node = match self.traverse(name, false) {
            Ok(found) => found?,
            Err(_) => return None,
        };
        let off = node.prop.load(Ordering::Acquire);
        if off == 0 {
            return None;
        }
        self.entry_at(off).map(|_| off)
    }

    /// The entry at a data-region offset previously returned by [`find`] or
    /// [`foreach`](Self::foreach). Out-of-range offsets yield `None`.
    pub fn entry_at(&self, off: u32) -> Option<&PropEntry> {
        let off = off as usize;
        if off + ENTRY_HEADER > self.data_size() {
            return None;
        }
        Some(unsafe { &*(self.data().add(off) as *const PropEntry) })
    }

    /// The NUL-terminated long-value blob at a data-region offset.
    pub(crate) fn blob_str(&self, off: u32) -> &str {
        let off = off as usize;
        if off >= self.data_size() {
            return "";
        }
        unsafe {
            let c = CStr::from_ptr(self.data().add(off).cast());
            std::str::from_utf8(c.to_bytes()).unwrap_or_default()
        }
    }

    /// The full value of an entry in this area: the out-of-line blob for
    /// long form, the inline buffer otherwise. Only sound for `ro.` entries,
    /// which never change after `add`.
    pub fn read_only_value<'a>(&'a self, entry: &'a PropEntry) -> &'a str {
        if entry.is_long() {
            self.blob_str(entry.long_offset())
        } else {
            entry.value_str()
        }
    }

    // ── serial-word read protocol ───────────────────────────────────────

    /// Read a possibly-mutating value under the serial protocol.
    ///
    /// Loops until two serial reads agree; when the dirty bit is set the
    /// previous complete value is taken from the area's backup slot, so the
    /// caller always sees some complete value, never a torn mix. Returns the
    /// serial the value was read under.
    pub fn read_value(&self, entry: &PropEntry, out: &mut ValueBuf) -> u32 {
        let mut new_serial = entry.serial().load(Ordering::Acquire);
        loop {
            let serial = new_serial;
            let len = serial_value_len(serial).min(VALUE_MAX - 1);
            let src = if serial_dirty(serial) {
                self.dirty_backup()
            } else {
                entry.value_ptr()
            };
            unsafe {
                ptr::copy_nonoverlapping(src, out.buf.as_mut_ptr(), len + 1);
            }
            fence(Ordering::Acquire);
            new_serial = entry.serial().load(Ordering::Relaxed);
            if serial == new_serial {
                out.len = len;
                return serial;
            }
            // Order the next iteration's copy after this serial reload; the
            // acquire load on entry keeps the common no-retry path cheap.
            fence(Ordering::Acquire);
        }
    }

    // ── writer operations ───────────────────────────────────────────────

    /// Ensure an entry exists for `name`, allocating trie nodes and the
    /// entry on first add. Values of `VALUE_MAX` bytes or longer are stored
    /// out of line (the caller enforces the `ro.` policy for those). Adding
    /// an existing name succeeds without touching its value.
    pub fn add(&self, name: &str, value: &[u8]) -> Result<()> {
        if !self.rw {
            return Err(Error::Denied {
                name: name.to_string(),
            });
        }
        let node = self
            .traverse(name, true)?
            .ok_or_else(|| Error::InvalidName {
                name: name.to_string(),
            })?;
        if node.prop.load(Ordering::Acquire) != 0 {
            return Ok(());
        }
        let off = self.alloc_entry(name.as_bytes(), value)?;
        node.prop.store(off, Ordering::Release);
        Ok(())
    }

    /// Rewrite an entry's value under the dirty-bit handshake and wake
    /// waiters parked on its serial.
    pub fn update(&self, entry: &PropEntry, value: &[u8]) -> Result<()> {
        if !self.rw {
            return Err(Error::Denied {
                name: entry.name().to_string(),
            });
        }
        if entry.is_long() {
            return Err(Error::ReadOnly {
                name: entry.name().to_string(),
            });
        }
        if value.len() >= VALUE_MAX {
            return Err(Error::ValueTooLong {
                name: entry.name().to_string(),
                len: value.len(),
                limit: VALUE_MAX - 1,
            });
        }

        let serial_word = entry.serial();
        let serial = serial_word.load(Ordering::Relaxed);
        let old_len = serial_value_len(serial).min(VALUE_MAX - 1);

        // Contract with readers: whenever the dirty bit is visible, an
        // uncorrupted copy of the pre-dirty value is in the backup slot.
        unsafe {
            ptr::copy_nonoverlapping(entry.value_ptr(), self.dirty_backup(), old_len + 1);
        }
        fence(Ordering::Release);
        serial_word.store(serial | DIRTY_BIT, Ordering::Relaxed);
        unsafe {
            let dst = entry.value_ptr() as *mut u8;
            ptr::copy_nonoverlapping(value.as_ptr(), dst, value.len());
            dst.add(value.len()).write(0);
        }
        fence(Ordering::Release);
        serial_word.store(next_serial(serial | DIRTY_BIT, value.len()), Ordering::Relaxed);
        futex::wake_all(serial_word);
        Ok(())
    }

    /// Delete `name`: detach its entry from the trie, then zero the entry
    /// bytes (and long blob). With `prune`, a post-order pass additionally
    /// clears interior nodes whose subtree has become empty. Arena bytes are
    /// never reclaimed. Returns whether an entry was removed.
    pub fn remove(&self, name: &str, prune: bool) -> bool {
        if !self.rw {
            return false;
        }
        let node = match self.traverse(name, false) {
            Ok(Some(node)) => node,
            _ => return false,
        };
        let off = node.prop.load(Ordering::Relaxed);
        if off == 0 {
            return false;
        }
        let entry = match self.entry_at(off) {
            Some(entry) => entry,
            None => return false,
        };

        // Detach first so no new reader can reach the entry being wiped.
        node.prop.store(0, Ordering::Release);

        unsafe {
            if entry.is_long() {
                let blob = self.data().add(entry.long_offset() as usize);
                let len = CStr::from_ptr(blob.cast()).to_bytes().len();
                ptr::write_bytes(blob, 0, len);
            }
            let name_ptr = (entry as *const PropEntry as *mut u8).add(ENTRY_HEADER);
            let name_len = CStr::from_ptr(name_ptr.cast_const().cast()).to_bytes().len();
            ptr::write_bytes(name_ptr, 0, name_len);
            ptr::write_bytes(entry as *const PropEntry as *mut u8, 0, ENTRY_HEADER);
        }

        if prune {
            if let Some(root) = self.node_at(0) {
                self.prune_node(root);
            }
        }
        true
    }

    // ── enumeration ─────────────────────────────────────────────────────

    /// Visit every entry in the area. The order is left / self / children /
    /// right over the trie, i.e. a function of insertion history, not
    /// lexicographic.
    pub fn foreach(&self, mut f: impl FnMut(u32, &PropEntry)) {
        if let Some(root) = self.node_at(0) {
            self.walk(root, &mut f);
        }
    }

    fn walk(&self, node: &TrieNode, f: &mut impl FnMut(u32, &PropEntry)) {
        let left = node.left.load(Ordering::Acquire);
        if left != 0 {
            if let Some(child) = self.node_at(left) {
                self.walk(child, f);
            }
        }
        let prop = node.prop.load(Ordering::Acquire);
        if prop != 0 {
            if let Some(entry) = self.entry_at(prop) {
                f(prop, entry);
            }
        }
        let children = node.children.load(Ordering::Acquire);
        if children != 0 {
            if let Some(child) = self.node_at(children) {
                self.walk(child, f);
            }
        }
        let right = node.right.load(Ordering::Acquire);
        if right != 0 {
            if let Some(child) = self.node_at(right) {
                self.walk(child, f);
            }
        }
    }

    // ── trie internals ──────────────────────────────────────────────────

    /// Walk the trie to the node terminating `name`, optionally allocating
    /// missing nodes. `Ok(None)` covers both "not present" and malformed
    /// names (empty segments); `Err` is allocator exhaustion.
    fn traverse(&self, name: &str, alloc: bool) -> Result<Option<&TrieNode>> {
        let mut current = match self.node_at(0) {
            Some(root) => root,
            None => return Ok(None),
        };
        let mut remaining = name.as_bytes();
        loop {
            let (segment, rest) = match remaining.iter().position(|&b| b == b'.') {
                Some(pos) => (&remaining[..pos], Some(&remaining[pos + 1..])),
                None => (remaining, None),
            };
            if segment.is_empty() {
                return Ok(None);
            }

            let children_off = current.children.load(Ordering::Acquire);
            let bst_root = if children_off != 0 {
                match self.node_at(children_off) {
                    Some(node) => node,
                    None => return Ok(None),
                }
            } else if alloc {
                let off = self.alloc_node(segment)?;
                current.children.store(off, Ordering::Release);
                match self.node_at(off) {
                    Some(node) => node,
                    None => return Ok(None),
                }
            } else {
                return Ok(None);
            };

            current = match self.find_in_bst(bst_root, segment, alloc)? {
                Some(node) => node,
                None => return Ok(None),
            };

            match rest {
                Some(rest) => remaining = rest,
                None => return Ok(Some(current)),
            }
        }
    }

    /// Find `segment` within one intra-segment BST, optionally inserting it.
    fn find_in_bst<'a>(
        &'a self,
        mut current: &'a TrieNode,
        segment: &[u8],
        alloc: bool,
    ) -> Result<Option<&'a TrieNode>> {
        loop {
            let link = match cmp_segment(segment, current.segment()) {
                CmpOrdering::Equal => return Ok(Some(current)),
                CmpOrdering::Less => &current.left,
                CmpOrdering::Greater => &current.right,
            };
            let off = link.load(Ordering::Acquire);
            if off != 0 {
                current = match self.node_at(off) {
                    Some(node) => node,
                    None => return Ok(None),
                };
                continue;
            }
            if !alloc {
                return Ok(None);
            }
            let new_off = self.alloc_node(segment)?;
            link.store(new_off, Ordering::Release);
            return Ok(self.node_at(new_off));
        }
    }

    /// Post-order prune: zero any node with no children, siblings, or entry,
    /// and report emptiness so the parent clears its link.
    fn prune_node(&self, node: &TrieNode) -> bool {
        let mut is_leaf = true;
        for link in [&node.children, &node.left, &node.right] {
            let off = link.load(Ordering::Relaxed);
            if off == 0 {
                continue;
            }
            match self.node_at(off) {
                Some(child) if self.prune_node(child) => link.store(0, Ordering::Release),
                _ => is_leaf = false,
            }
        }
        if is_leaf && node.prop.load(Ordering::Relaxed) == 0 {
            unsafe {
                let base = node as *const TrieNode as *mut u8;
                let wipe = NODE_HEADER + node.namelen();
                ptr::write_bytes(base, 0, wipe);
            }
            return true;
        }
        false
    }

    // ── allocator ───────────────────────────────────────────────────────

    fn header(&self) -> &AreaHeader {
        unsafe { &*(self.base as *const AreaHeader) }
    }

    fn data(&self) -> *mut u8 {
        unsafe { self.base.add(HEADER_SIZE) }
    }

    fn data_size(&self) -> usize {
        self.size - HEADER_SIZE
    }

    fn dirty_backup(&self) -> *mut u8 {
        unsafe { ptr::addr_of!((*(self.base as *const AreaHeader)).dirty_backup) as *mut u8 }
    }

    /// Bump-allocate `size` bytes, 4-byte aligned. Offsets never shrink and
    /// freed structures are never reused.
    fn alloc(&self, size: usize) -> Result<u32> {
        let aligned = (size + 3) & !3;
        let used = self.header().bytes_used.load(Ordering::Relaxed) as usize;
        if used + aligned > self.data_size() {
            return Err(Error::AllocExhausted);
        }
        self.header()
            .bytes_used
            .store((used + aligned) as u32, Ordering::Relaxed);
        Ok(used as u32)
    }

    fn alloc_node(&self, segment: &[u8]) -> Result<u32> {
        let off = self.alloc(NODE_HEADER + segment.len() + 1)?;
        unsafe { TrieNode::construct(self.data().add(off as usize), segment) };
        Ok(off)
    }

    fn alloc_entry(&self, name: &[u8], value: &[u8]) -> Result<u32> {
        let off = self.alloc(ENTRY_HEADER + name.len() + 1)?;
        if value.len() >= VALUE_MAX {
            let blob_off = self.alloc(value.len() + 1)?;
            unsafe {
                let blob = self.data().add(blob_off as usize);
                ptr::copy_nonoverlapping(value.as_ptr(), blob, value.len());
                blob.add(value.len()).write(0);
                PropEntry::construct_long(self.data().add(off as usize), name, blob_off);
            }
        } else {
            unsafe {
                PropEntry::construct_short(self.data().add(off as usize), name, value);
            }
        }
        Ok(off)
    }

    fn node_at(&self, off: u32) -> Option<&TrieNode> {
        let off = off as usize;
        if off + NODE_HEADER > self.data_size() {
            return None;
        }
        Some(unsafe { &*(self.data().add(off) as *const TrieNode) })
    }
}

/// Segment ordering in the intra-segment BSTs: length first, then bytewise.
fn cmp_segment(a: &[u8], b: &[u8]) -> CmpOrdering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

fn apply_label(file: &std::fs::File, label: &str) -> std::io::Result<()> {
    let name = b"security.selinux\0";
    let value = std::ffi::CString::new(label)
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    let rc = unsafe {
        libc::fsetxattr(
            file.as_raw_fd(),
            name.as_ptr().cast(),
            value.as_ptr().cast(),
            label.len() + 1,
            0,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_stable() {
        assert_eq!(HEADER_SIZE, 132);
        assert_eq!(HEADER_SIZE % 4, 0);
    }

    #[test]
    fn segment_ordering_is_length_then_bytes() {
        assert_eq!(cmp_segment(b"zz", b"aaa"), CmpOrdering::Less);
        assert_eq!(cmp_segment(b"abc", b"abd"), CmpOrdering::Less);
        assert_eq!(cmp_segment(b"abc", b"abc"), CmpOrdering::Equal);
        assert_eq!(cmp_segment(b"b", b"a"), CmpOrdering::Greater);
    }
}
