//! Property store facade: find / read / enumerate / mutate / wait.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use kura_core::{is_read_only, Error, Result, StoreConfig, NAME_MAX, VALUE_MAX};
use kura_index::ContextRouter;
use kura_storage::{wait_for_change, PropArea, PropEntry, ValueBuf};

/// Opaque handle to one property: the area it lives in plus its offset.
/// Cheap to clone; stays valid for the life of the process because areas are
/// never unmapped and arena bytes are never reclaimed.
#[derive(Clone)]
pub struct PropertyRef {
    area: Arc<PropArea>,
    offset: u32,
}

impl PropertyRef {
    fn entry(&self) -> Option<&PropEntry> {
        self.area.entry_at(self.offset)
    }

    pub fn name(&self) -> &str {
        self.entry().map(PropEntry::name).unwrap_or_default()
    }

    /// Current serial of this property.
    pub fn serial(&self) -> u32 {
        self.entry()
            .map(|e| e.serial().load(Ordering::Acquire))
            .unwrap_or(0)
    }
}

/// Process-wide view of the property namespace.
pub struct PropertyStore {
    router: ContextRouter,
}

impl PropertyStore {
    /// Open for reading, with the standard layout under `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(&StoreConfig::for_dir(dir.as_ref()))
    }

    pub fn open_with_config(config: &StoreConfig) -> Result<Self> {
        Ok(Self {
            router: ContextRouter::open(config)?,
        })
    }

    /// Writer-mode init: create the directory and every context area. The
    /// flag reports a label-application failure (fatal only for the init
    /// daemon).
    pub fn init_writer(config: &StoreConfig) -> Result<(Self, bool)> {
        let (router, label_failed) = ContextRouter::create(config)?;
        info!(dir = %config.dir.display(), "property store initialized for writing");
        Ok((Self { router }, label_failed))
    }

    // ── reader API ──────────────────────────────────────────────────────

    /// Route `name` and look it up in its area. `None` covers both "no such
    /// property" and "no accessible area" (the latter is audited by the
    /// router).
    pub fn find(&self, name: &str) -> Option<PropertyRef> {
        let area = self.router.area_for_name(name)?;
        let offset = area.find(name)?;
        Some(PropertyRef { area, offset })
    }

    /// Read a property's value under the serial protocol. Returns the serial
    /// the value was read under.
    pub fn read(&self, prop: &PropertyRef, out: &mut ValueBuf) -> u32 {
        let Some(entry) = prop.entry() else { return 0 };
        let serial = prop.area.read_value(entry, out);
        let name = entry.name();
        if name.len() >= NAME_MAX {
            error!(
                name,
                limit = NAME_MAX - 1,
                "property name exceeds the legacy limit; use read_callback"
            );
        }
        if is_read_only(name) && entry.is_long() {
            error!(name, "long value does not fit a fixed read buffer; use read_callback");
        }
        serial
    }

    /// Read via callback. Read-only names are handed out in place (including
    /// the long form); anything mutable is copied to a stack buffer first.
    pub fn read_callback(&self, prop: &PropertyRef, f: impl FnOnce(&str, &str, u32)) {
        let Some(entry) = prop.entry() else { return };
        let name = entry.name();
        if is_read_only(name) {
            // Write-once: a relaxed load and no copy are enough.
            let serial = entry.serial().load(Ordering::Relaxed);
            f(name, prop.area.read_only_value(entry), serial);
            return;
        }
        let mut buf = ValueBuf::new();
        let serial = prop.area.read_value(entry, &mut buf);
        f(name, buf.as_str(), serial);
    }

    /// Find and read into `out`; the stored length (0 when absent).
    pub fn get_into(&self, name: &str, out: &mut ValueBuf) -> usize {
        match self.find(name) {
            Some(prop) => {
                self.read(&prop, out);
                out.len()
            }
            None => {
                *out = ValueBuf::new();
                0
            }
        }
    }

    /// Convenience owned read. Not for the hot path: it allocates.
    pub fn get(&self, name: &str) -> Option<String> {
        let prop = self.find(name)?;
        let mut owned = None;
        self.read_callback(&prop, |_, value, _| owned = Some(value.to_string()));
        owned
    }

    /// Visit every property in every accessible area. Order within an area
    /// follows the trie shape (insertion history), not lexicographic order.
    pub fn foreach(&self, mut f: impl FnMut(&PropertyRef)) {
        self.router.foreach_area(|area| {
            area.foreach(|offset, _| {
                f(&PropertyRef {
                    area: Arc::clone(area),
                    offset,
                })
            });
        });
    }

    /// The `n`-th property in [`foreach`](Self::foreach) order.
    pub fn nth(&self, n: usize) -> Option<PropertyRef> {
        let mut current = 0usize;
        let mut found = None;
        self.foreach(|prop| {
            if current == n && found.is_none() {
                found = Some(prop.clone());
            }
            current += 1;
        });
        found
    }

    /// The access label `name` routes to.
    pub fn context_for(&self, name: &str) -> Option<&str> {
        self.router.label_for_name(name)
    }

    /// Re-check per-context readability after a credential change.
    pub fn reset_access(&self) {
        self.router.reset_access();
    }

    // ── writer API ──────────────────────────────────────────────────────

    /// Create a property. Values of `VALUE_MAX` bytes or more are accepted
    /// only for `ro.` names (stored out of line). Adding an existing name
    /// succeeds without changing its value.
    pub fn add(&self, name: &str, value: &str) -> Result<()> {
        if value.len() >= VALUE_MAX && !is_read_only(name) {
            return Err(Error::ValueTooLong {
                name: name.to_string(),
                len: value.len(),
                limit: VALUE_MAX - 1,
            });
        }
        if name.is_empty() {
            return Err(Error::InvalidName {
                name: name.to_string(),
            });
        }
        self.require_rw(name)?;
        let area = self.router.area_for_name(name).ok_or_else(|| Error::Denied {
            name: name.to_string(),
        })?;
        area.add(name, value.as_bytes())?;
        self.router.serial_area().bump_serial();
        Ok(())
    }

    /// Overwrite an existing property under the dirty-bit protocol.
    pub fn update(&self, prop: &PropertyRef, value: &str) -> Result<()> {
        self.require_rw(prop.name())?;
        let entry = match prop.entry() {
            Some(entry) => entry,
            None => return Err(Error::NotInitialized),
        };
        prop.area.update(entry, value.as_bytes())?;
        self.router.serial_area().bump_serial();
        Ok(())
    }

    /// Update-or-add, the way the setter daemon applies a request.
    pub fn set(&self, name: &str, value: &str) -> Result<()> {
        match self.find(name) {
            Some(prop) => {
                if is_read_only(name) {
                    return Err(Error::ReadOnly {
                        name: name.to_string(),
                    });
                }
                self.update(&prop, value)
            }
            None => self.add(name, value),
        }
    }

    /// Delete a property; with `prune`, clear emptied interior trie nodes
    /// too. Returns whether anything was deleted.
    pub fn delete(&self, name: &str, prune: bool) -> Result<bool> {
        self.require_rw(name)?;
        let area = self.router.area_for_name(name).ok_or_else(|| Error::Denied {
            name: name.to_string(),
        })?;
        let removed = area.remove(name, prune);
        if removed {
            self.router.serial_area().bump_serial();
        }
        Ok(removed)
    }

    fn require_rw(&self, name: &str) -> Result<()> {
        if !self.router.is_rw() {
            return Err(Error::Denied {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    // ── wait API ────────────────────────────────────────────────────────

    /// The process-global serial, bumped by every successful mutation.
    pub fn area_serial(&self) -> u32 {
        self.router.serial_area().serial().load(Ordering::Acquire)
    }

    /// Block until the watched serial differs from `old_serial`: a single
    /// property when `prop` is given, otherwise the global serial. Returns
    /// the new serial, or `None` on timeout.
    pub fn wait(
        &self,
        prop: Option<&PropertyRef>,
        old_serial: u32,
        timeout: Option<Duration>,
    ) -> Option<u32> {
        match prop {
            Some(prop) => {
                let entry = prop.entry()?;
                wait_for_change(entry.serial(), old_serial, timeout)
            }
            None => wait_for_change(self.router.serial_area().serial(), old_serial, timeout),
        }
    }

    /// Wait for any property change, without a timeout.
    pub fn wait_any(&self, old_serial: u32) -> u32 {
        self.wait(None, old_serial, None).unwrap_or(old_serial)
    }
}
