use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::info;

use crate::store::{io_err, ModelOpsError, Result};
use crate::ModelName;

const MARKER_PREFIX: &str = "port.";

#[derive(Default)]
struct PortTable {
    by_model: HashMap<String, Vec<u16>>,
    claimed: BTreeSet<u16>,
}

/// Process-wide port assignments, persisted as `port.<n>` marker files in
/// each model directory so assignments survive restarts.
pub struct PortRegistry {
    root: PathBuf,
    base: u16,
    table: Mutex<PortTable>,
}

impl PortRegistry {
    /// Scans every model directory under `root` for existing markers.
    pub fn open(root: impl Into<PathBuf>, base: u16) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(io_err(&root))?;

        let mut table = PortTable::default();
        for entry in fs::read_dir(&root).map_err(io_err(&root))? {
            let entry = entry.map_err(io_err(&root))?;
            if !entry.file_type().map_err(io_err(&entry.path()))?.is_dir() {
                continue;
            }
            let model = entry.file_name().to_string_lossy().to_string();
            let mut ports = scan_markers(&entry.path())?;
            ports.sort_unstable();
            if ports.is_empty() {
                continue;
            }
            table.claimed.extend(ports.iter().copied());
            table.by_model.insert(model, ports);
        }

        info!(root=%root.display(), claimed=table.claimed.len(), "ports: registry opened");
        Ok(Self {
            root,
            base,
            table: Mutex::new(table),
        })
    }

    /// Returns `count` ports for `model`, reusing earlier assignments and
    /// claiming new ones (with marker files) only when needed.
    pub fn allocate(&self, model: &ModelName, count: usize) -> Result<Vec<u16>> {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        let mut ports = table
            .by_model
            .get(model.as_str())
            .cloned()
            .unwrap_or_default();

        if ports.len() < count {
            let dir = self.root.join(model.as_str());
            fs::create_dir_all(&dir).map_err(io_err(&dir))?;

            let mut candidate = self.base;
            while ports.len() < count {
                while table.claimed.contains(&candidate) {
                    candidate = candidate
                        .checked_add(1)
                        .ok_or(ModelOpsError::PortsExhausted(self.base))?;
                }
                let marker = dir.join(format!("{MARKER_PREFIX}{candidate}"));
                fs::File::create(&marker).map_err(io_err(&marker))?;
                table.claimed.insert(candidate);
                ports.push(candidate);
                info!(model=%model, port=candidate, "ports: assigned");
            }
            ports.sort_unstable();
            table.by_model.insert(model.to_string(), ports.clone());
        }

        ports.truncate(count);
        Ok(ports)
    }

    pub fn assigned(&self, model: &ModelName) -> Vec<u16> {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table
            .by_model
            .get(model.as_str())
            .cloned()
            .unwrap_or_default()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn scan_markers(dir: &Path) -> Result<Vec<u16>> {
    let mut ports = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err(dir))? {
        let entry = entry.map_err(io_err(dir))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(port) = name
            .strip_prefix(MARKER_PREFIX)
            .and_then(|n| n.parse::<u16>().ok())
        {
            ports.push(port);
        }
    }
    Ok(ports)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_is_cached() {
        let tmp = tempfile::tempdir().unwrap();
        let reg = PortRegistry::open(tmp.path(), 5005).unwrap();
        let faq = ModelName::new("faq").unwrap();

        let first = reg.allocate(&faq, 2).unwrap();
        let again = reg.allocate(&faq, 2).unwrap();
        assert_eq!(first, vec![5005, 5006]);
        assert_eq!(first, again);
        assert!(tmp.path().join("faq/port.5005").exists());
        assert!(tmp.path().join("faq/port.5006").exists());
    }

    #[test]
    fn test_reopen_reads_markers() {
        let tmp = tempfile::tempdir().unwrap();
        let faq = ModelName::new("faq").unwrap();
        {
            let reg = PortRegistry::open(tmp.path(), 5005).unwrap();
            reg.allocate(&faq, 2).unwrap();
        }
        let reg = PortRegistry::open(tmp.path(), 5005).unwrap();
        assert_eq!(reg.assigned(&faq), vec![5005, 5006]);

        let shop = ModelName::new("shop").unwrap();
        assert_eq!(reg.allocate(&shop, 2).unwrap(), vec![5007, 5008]);
    }

    #[test]
    fn test_skips_ports_claimed_on_disk() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("legacy")).unwrap();
        fs::File::create(tmp.path().join("legacy/port.5006")).unwrap();

        let reg = PortRegistry::open(tmp.path(), 5005).unwrap();
        let faq = ModelName::new("faq").unwrap();
        assert_eq!(reg.allocate(&faq, 2).unwrap(), vec![5005, 5007]);
    }
}
