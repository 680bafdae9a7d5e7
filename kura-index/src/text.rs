//! Text-mode routing index.
//!
//! The startup-parsed fallback for deployments without a binary index. Each
//! line of a configuration file is `<prefix> <label> [ignored fields...]`;
//! `#` starts a comment. Entries are kept ordered by decreasing prefix
//! length with the `*` wildcard last, so the first match is the most
//! specific one.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::debug;

use kura_core::{is_control, Error, Result};

struct PrefixEntry {
    prefix: String,
    label: u32,
}

/// Prefix → label routing table parsed from text configuration.
#[derive(Default)]
pub struct TextIndex {
    labels: Vec<String>,
    prefixes: Vec<PrefixEntry>,
}

impl TextIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load one or more configuration files. Files that cannot be opened
    /// are skipped; at least one must load.
    pub fn load(paths: &[impl AsRef<Path>]) -> Result<Self> {
        let mut index = Self::new();
        let mut loaded = 0usize;
        for path in paths {
            let path = path.as_ref();
            match File::open(path) {
                Ok(file) => {
                    index.read_from(BufReader::new(file))?;
                    loaded += 1;
                }
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "skipping routing config");
                }
            }
        }
        if loaded == 0 {
            return Err(Error::MapFailure {
                path: paths
                    .first()
                    .map(|p| p.as_ref().to_path_buf())
                    .unwrap_or_default(),
                message: "no text routing configuration could be loaded".to_string(),
            });
        }
        Ok(index)
    }

    pub fn read_from(&mut self, reader: impl BufRead) -> Result<()> {
        for line in reader.lines() {
            let line = line?;
            let line = line.split('#').next().unwrap_or_default();
            let mut fields = line.split_whitespace();
            let (Some(prefix), Some(label)) = (fields.next(), fields.next()) else {
                continue;
            };
            self.add(prefix, label);
        }
        Ok(())
    }

    /// Insert one entry, keeping the longest-first, wildcard-last order.
    /// Control-namespace prefixes are IPC, not storage, and are dropped.
    pub fn add(&mut self, prefix: &str, label: &str) {
        if is_control(prefix) {
            return;
        }
        let label = match self.labels.iter().position(|l| l == label) {
            Some(i) => i as u32,
            None => {
                self.labels.push(label.to_string());
                (self.labels.len() - 1) as u32
            }
        };
        let entry = PrefixEntry {
            prefix: prefix.to_string(),
            label,
        };
        let at = self
            .prefixes
            .iter()
            .position(|e| e.prefix.len() < entry.prefix.len() || e.prefix.starts_with('*'))
            .unwrap_or(self.prefixes.len());
        self.prefixes.insert(at, entry);
    }

    /// Route a name to a label index: first matching prefix wins, the
    /// wildcard is the last resort.
    pub fn route(&self, name: &str) -> Option<u32> {
        self.prefixes
            .iter()
            .find(|e| e.prefix.starts_with('*') || name.starts_with(&e.prefix))
            .map(|e| e.label)
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample() -> TextIndex {
        let mut index = TextIndex::new();
        index
            .read_from(Cursor::new(
                "# routing table\n\
                 ro.build.    u:object_r:build:s0  exact string\n\
                 ro.          u:object_r:ro:s0\n\
                 ctl.         u:object_r:ctl:s0\n\
                 persist.     u:object_r:persist:s0\n\
                 *            u:object_r:default:s0\n\
                 \n\
                 malformed_line_with_one_field\n",
            ))
            .unwrap();
        index
    }

    #[test]
    fn longest_prefix_wins() {
        let index = sample();
        let label = |name: &str| index.route(name).map(|i| index.labels()[i as usize].clone());
        assert_eq!(label("ro.build.id").as_deref(), Some("u:object_r:build:s0"));
        assert_eq!(label("ro.other").as_deref(), Some("u:object_r:ro:s0"));
        assert_eq!(label("persist.sys.x").as_deref(), Some("u:object_r:persist:s0"));
        assert_eq!(label("rw.x").as_deref(), Some("u:object_r:default:s0"));
    }

    #[test]
    fn control_prefixes_are_dropped() {
        let index = sample();
        // ctl. falls through to the wildcard because its entry was never stored.
        let label = index.route("ctl.start").map(|i| index.labels()[i as usize].clone());
        assert_eq!(label.as_deref(), Some("u:object_r:default:s0"));
        assert!(!index.labels().iter().any(|l| l.contains(":ctl:")));
    }

    #[test]
    fn duplicate_labels_share_one_slot() {
        let mut index = TextIndex::new();
        index.add("sys.", "shared_label");
        index.add("debug.", "shared_label");
        index.add("vendor.", "other_label");
        assert_eq!(index.labels().len(), 2);
        assert_eq!(index.route("sys.x"), index.route("debug.x"));
        assert_ne!(index.route("sys.x"), index.route("vendor.x"));
    }

    #[test]
    fn no_wildcard_means_unrouted_names_miss() {
        let mut index = TextIndex::new();
        index.add("sys.", "sys_label");
        assert_eq!(index.route("unknown.name"), None);
    }
}
