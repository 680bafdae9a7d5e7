//! Context router: picks the area for a property name.
//!
//! One [`ContextNode`] per access label. Area files are mapped lazily on
//! first reader access behind a per-context lock; the fast path is a
//! lock-free `OnceLock` read. Denials observed during enumeration are
//! remembered so `foreach` skips quietly, but point lookups re-attempt every
//! time so each forbidden access is audited.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use kura_core::{Result, StoreConfig, SERIAL_AREA_NAME};
use kura_storage::PropArea;

use crate::binary::{BinaryIndex, NO_INDEX};
use crate::text::TextIndex;

enum RouteIndex {
    Binary(BinaryIndex),
    Text(TextIndex),
}

/// One context's control block: its label, its area file, and the lazy
/// mapping state.
pub struct ContextNode {
    label: String,
    path: PathBuf,
    area: OnceLock<Arc<PropArea>>,
    no_access: AtomicBool,
    open_lock: Mutex<()>,
}

impl ContextNode {
    fn new(label: String, dir: &Path) -> Self {
        let path = dir.join(&label);
        Self {
            label,
            path,
            area: OnceLock::new(),
            no_access: AtomicBool::new(false),
            open_lock: Mutex::new(()),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// The mapped area if this node has one open.
    pub fn area(&self) -> Option<Arc<PropArea>> {
        self.area.get().cloned()
    }

    /// Map the node's area read-only. The lock covers only the first
    /// mapping attempt; an already-open area returns without locking.
    fn open_ro(&self) -> Option<Arc<PropArea>> {
        if let Some(area) = self.area.get() {
            return Some(Arc::clone(area));
        }
        let _guard = self.open_lock.lock();
        if let Some(area) = self.area.get() {
            return Some(Arc::clone(area));
        }
        match PropArea::open(&self.path) {
            Ok(area) => {
                let area = Arc::new(area);
                let _ = self.area.set(Arc::clone(&area));
                Some(area)
            }
            Err(e) => {
                debug!(label = %self.label, error = %e, "context area not mappable");
                None
            }
        }
    }

    /// Create and map the node's area read-write (writer init). Reports an
    /// xattr label failure through the flag.
    fn open_rw(&self) -> Result<bool> {
        let _guard = self.open_lock.lock();
        if self.area.get().is_some() {
            return Ok(false);
        }
        let (area, label_failed) = PropArea::create(&self.path, Some(&self.label))?;
        let _ = self.area.set(Arc::new(area));
        Ok(label_failed)
    }

    /// Enumeration path: remember a denial so later sweeps skip silently.
    fn check_access_and_open(&self) -> Option<Arc<PropArea>> {
        if self.area.get().is_none() && !self.no_access.load(Ordering::Relaxed) {
            if !self.check_access() || self.open_ro().is_none() {
                self.no_access.store(true, Ordering::Relaxed);
            }
        }
        self.area()
    }

    fn check_access(&self) -> bool {
        let Ok(path) = CString::new(self.path.as_os_str().as_bytes()) else {
            return false;
        };
        unsafe { libc::access(path.as_ptr(), libc::R_OK) == 0 }
    }

    fn reset_access(&self) {
        self.no_access.store(!self.check_access(), Ordering::Relaxed);
    }
}

/// Owns the routing index, the per-context nodes, and the area holding the
/// process-global serial.
pub struct ContextRouter {
    index: RouteIndex,
    nodes: Box<[ContextNode]>,
    serial_area: Arc<PropArea>,
    rw: bool,
}

impl ContextRouter {
    /// Reader-mode init: indexed mode when the binary index exists at its
    /// configured path, text mode otherwise.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let index = Self::load_index(config)?;
        let nodes = Self::make_nodes(&index, &config.dir);
        let serial_area = Arc::new(PropArea::open(&config.dir.join(SERIAL_AREA_NAME))?);
        let rw = serial_area.is_rw();
        info!(
            contexts = nodes.len(),
            rw,
            indexed = matches!(index, RouteIndex::Binary(_)),
            "property router opened"
        );
        Ok(Self {
            index,
            nodes,
            serial_area,
            rw,
        })
    }

    /// Writer-mode init: create the directory (mode 0711) and every context
    /// area, labelled. Returns whether any label application failed; the
    /// init daemon aborts on that, everyone else proceeds.
    pub fn create(config: &StoreConfig) -> Result<(Self, bool)> {
        let index = Self::load_index(config)?;
        match std::fs::DirBuilder::new().mode(0o711).create(&config.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }

        let nodes = Self::make_nodes(&index, &config.dir);
        let mut label_failed = false;
        for node in nodes.iter() {
            label_failed |= node.open_rw()?;
        }
        let (serial_area, _) = PropArea::create(&config.dir.join(SERIAL_AREA_NAME), None)?;
        info!(contexts = nodes.len(), "property router created");
        Ok((
            Self {
                index,
                nodes,
                serial_area: Arc::new(serial_area),
                rw: true,
            },
            label_failed,
        ))
    }

    fn load_index(config: &StoreConfig) -> Result<RouteIndex> {
        if config.binary_index.exists() {
            Ok(RouteIndex::Binary(BinaryIndex::load(&config.binary_index)?))
        } else {
            Ok(RouteIndex::Text(TextIndex::load(&config.text_indexes)?))
        }
    }

    fn make_nodes(index: &RouteIndex, dir: &Path) -> Box<[ContextNode]> {
        match index {
            RouteIndex::Binary(binary) => (0..binary.num_contexts())
                .filter_map(|i| binary.context(i as u32))
                .map(|label| ContextNode::new(label.to_string(), dir))
                .collect(),
            RouteIndex::Text(text) => text
                .labels()
                .iter()
                .map(|label| ContextNode::new(label.clone(), dir))
                .collect(),
        }
    }

    pub fn is_rw(&self) -> bool {
        self.rw
    }

    /// The area carrying the process-global serial.
    pub fn serial_area(&self) -> &Arc<PropArea> {
        &self.serial_area
    }

    /// The context node a name routes to, or `None` when the index has no
    /// match (the caller treats that as denied).
    pub fn route(&self, name: &str) -> Option<&ContextNode> {
        let slot = match &self.index {
            RouteIndex::Binary(binary) => {
                let (context, _) = binary.get_indexes(name);
                if context == NO_INDEX {
                    return None;
                }
                context as usize
            }
            RouteIndex::Text(text) => text.route(name)? as usize,
        };
        self.nodes.get(slot)
    }

    /// Point-lookup path: route and lazily map. A denial is deliberately not
    /// remembered, so every forbidden access produces a fresh audit line.
    pub fn area_for_name(&self, name: &str) -> Option<Arc<PropArea>> {
        let Some(node) = self.route(name) else {
            warn!(name, "no context for property");
            return None;
        };
        let area = node.open_ro();
        if area.is_none() {
            warn!(name, label = %node.label(), "access denied to property area");
        }
        area
    }

    /// The access label a name routes to.
    pub fn label_for_name(&self, name: &str) -> Option<&str> {
        self.route(name).map(ContextNode::label)
    }

    /// Visit every accessible area once. Inaccessible contexts are skipped
    /// without auditing.
    pub fn foreach_area(&self, mut f: impl FnMut(&Arc<PropArea>)) {
        for node in self.nodes.iter() {
            if let Some(area) = node.check_access_and_open() {
                f(&area);
            }
        }
    }

    /// Re-check readability of every context; areas that became accessible
    /// since the last check are eligible for lazy open again.
    pub fn reset_access(&self) {
        for node in self.nodes.iter() {
            node.reset_access();
        }
    }
}
