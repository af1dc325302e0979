use std::fs;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{Artifact, ARTIFACT_DIR, ARTIFACT_SUFFIX};

/// Number of artifacts kept per model directory.
pub const RETAIN_ARTIFACTS: usize = 2;

/// Top-level YAML sections whose entries may reference sibling files.
const PATH_SECTIONS: &[&str] = &["pipeline", "policies"];

#[derive(Debug, Error)]
pub enum ModelOpsError {
    #[error("invalid config {path}: {reason}")]
    InvalidConfig { path: String, reason: String },
    #[error("invalid model name: {0:?}")]
    InvalidModelName(String),
    #[error("path escapes model directory: {0}")]
    InvalidPath(String),
    #[error("no free port left above {0}")]
    PortsExhausted(u16),
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ModelOpsError>;

pub(crate) fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ModelOpsError + '_ {
    move |source| ModelOpsError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// File-system view of one model directory.
#[derive(Clone, Debug)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn artifact_dir(&self) -> PathBuf {
        self.dir.join(ARTIFACT_DIR)
    }

    /// Most recent artifact, or `None` when nothing has been trained yet.
    ///
    /// Not a pure read: every call prunes the artifact directory down to the
    /// `RETAIN_ARTIFACTS` newest entries.
    pub fn latest(&self) -> Result<Option<Artifact>> {
        let dir = self.artifact_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(&dir)(e)),
        };

        let mut artifacts = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_err(&dir))?;
            let filename = entry.file_name().to_string_lossy().to_string();
            if !filename.ends_with(ARTIFACT_SUFFIX) {
                continue;
            }
            let meta = entry.metadata().map_err(io_err(&entry.path()))?;
            if !meta.is_file() {
                continue;
            }
            // Artifacts are never rewritten, so mtime is their creation time.
            let created_at: DateTime<Utc> = meta
                .modified()
                .map_err(io_err(&entry.path()))?
                .into();
            artifacts.push(Artifact {
                filename,
                path: entry.path(),
                created_at,
            });
        }

        artifacts.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.filename.cmp(&a.filename))
        });

        for stale in artifacts.iter().skip(RETAIN_ARTIFACTS) {
            match fs::remove_file(&stale.path) {
                Ok(()) => info!(artifact=%stale.filename, "store: pruned stale artifact"),
                Err(e) => warn!(artifact=%stale.filename, "store: prune failed: {e}"),
            }
        }

        Ok(artifacts.into_iter().next())
    }

    /// Writes `content` to `rel_path` under the model directory.
    ///
    /// YAML and JSON files are parsed first and re-serialized; relative
    /// `.`-prefixed paths in the recognised YAML sections become absolute.
    /// Returns `false` when the file already held identical bytes.
    pub fn put(&self, rel_path: &str, content: &[u8]) -> Result<bool> {
        let (target, bytes) = self.prepare(rel_path, content)?;
        write_if_changed(&target, &bytes)
    }

    /// Like [`put`](Self::put) for several files, but every file is
    /// validated before the first one is written. Returns how many files
    /// actually changed.
    pub fn put_all<'a, I>(&self, files: I) -> Result<usize>
    where
        I: IntoIterator<Item = (&'a str, &'a [u8])>,
    {
        let prepared = files
            .into_iter()
            .map(|(path, content)| self.prepare(path, content))
            .collect::<Result<Vec<_>>>()?;
        let mut changed = 0;
        for (target, bytes) in prepared {
            if write_if_changed(&target, &bytes)? {
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Runs the validation of [`put_all`](Self::put_all) without writing.
    pub fn check_all<'a, I>(&self, files: I) -> Result<()>
    where
        I: IntoIterator<Item = (&'a str, &'a [u8])>,
    {
        for (path, content) in files {
            self.prepare(path, content)?;
        }
        Ok(())
    }

    /// Creates the model and artifact directories and copies every file of
    /// `template` that is missing. Returns how many files were copied.
    pub fn deploy_defaults(&self, template: Option<&Path>) -> Result<usize> {
        fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;
        fs::create_dir_all(self.artifact_dir()).map_err(io_err(&self.dir))?;
        match template {
            Some(t) if t.is_dir() => copy_missing(t, &self.dir),
            _ => Ok(0),
        }
    }

    fn prepare(&self, rel_path: &str, content: &[u8]) -> Result<(PathBuf, Vec<u8>)> {
        let target = self.resolve(rel_path)?;
        let bytes = match structured_kind(&target) {
            Some(Structured::Yaml) => self.normalize_yaml(rel_path, content)?,
            Some(Structured::Json) => normalize_json(rel_path, content)?,
            None => content.to_vec(),
        };
        Ok((target, bytes))
    }

    fn resolve(&self, rel_path: &str) -> Result<PathBuf> {
        let rel = Path::new(rel_path);
        let clean = !rel_path.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !clean {
            return Err(ModelOpsError::InvalidPath(rel_path.to_string()));
        }
        Ok(self.dir.join(rel))
    }

    fn normalize_yaml(&self, rel_path: &str, content: &[u8]) -> Result<Vec<u8>> {
        let invalid = |reason: String| ModelOpsError::InvalidConfig {
            path: rel_path.to_string(),
            reason,
        };
        let mut doc: serde_yaml::Value =
            serde_yaml::from_slice(content).map_err(|e| invalid(e.to_string()))?;

        fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;
        let root = fs::canonicalize(&self.dir).map_err(io_err(&self.dir))?;
        if let serde_yaml::Value::Mapping(map) = &mut doc {
            for section in PATH_SECTIONS {
                if let Some(serde_yaml::Value::Sequence(items)) = map.get_mut(*section) {
                    for item in items.iter_mut() {
                        absolutize_entry(&root, item);
                    }
                }
            }
        }

        serde_yaml::to_string(&doc)
            .map(String::into_bytes)
            .map_err(|e| invalid(e.to_string()))
    }
}

enum Structured {
    Yaml,
    Json,
}

fn structured_kind(path: &Path) -> Option<Structured> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("yml" | "yaml") => Some(Structured::Yaml),
        Some("json") => Some(Structured::Json),
        _ => None,
    }
}

fn normalize_json(rel_path: &str, content: &[u8]) -> Result<Vec<u8>> {
    let invalid = |reason: String| ModelOpsError::InvalidConfig {
        path: rel_path.to_string(),
        reason,
    };
    let doc: serde_json::Value =
        serde_json::from_slice(content).map_err(|e| invalid(e.to_string()))?;
    serde_json::to_vec_pretty(&doc).map_err(|e| invalid(e.to_string()))
}

fn absolutize_entry(root: &Path, item: &mut serde_yaml::Value) {
    let serde_yaml::Value::Mapping(entry) = item else { return };
    for (_, value) in entry.iter_mut() {
        if let serde_yaml::Value::String(s) = value {
            if s.starts_with('.') {
                let joined = {
                    let rel = s.strip_prefix("./").unwrap_or(s.as_str());
                    root.join(rel).to_string_lossy().to_string()
                };
                *s = joined;
            }
        }
    }
}

/// Tentative write to a sibling temp file, then atomic rename. Skipped when
/// the existing file already hashes to the same digest.
fn write_if_changed(target: &Path, bytes: &[u8]) -> Result<bool> {
    let digest = blake3::hash(bytes);
    if let Ok(existing) = fs::read(target) {
        if blake3::hash(&existing) == digest {
            debug!(path=%target.display(), "store: unchanged, skipping write");
            return Ok(false);
        }
    }

    let parent = target
        .parent()
        .ok_or_else(|| ModelOpsError::InvalidPath(target.display().to_string()))?;
    fs::create_dir_all(parent).map_err(io_err(parent))?;

    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = parent.join(format!(".{file_name}.tmp_{}", uuid::Uuid::new_v4()));
    fs::write(&tmp, bytes).map_err(io_err(&tmp))?;
    if let Err(e) = fs::rename(&tmp, target) {
        let _ = fs::remove_file(&tmp);
        return Err(io_err(target)(e));
    }

    debug!(
        path=%target.display(),
        digest=%hex::encode(digest.as_bytes()),
        "store: wrote file"
    );
    Ok(true)
}

fn copy_missing(from: &Path, to: &Path) -> Result<usize> {
    let mut copied = 0;
    for entry in fs::read_dir(from).map_err(io_err(from))? {
        let entry = entry.map_err(io_err(from))?;
        let src = entry.path();
        let dst = to.join(entry.file_name());
        let ty = entry.file_type().map_err(io_err(&src))?;
        if ty.is_dir() {
            fs::create_dir_all(&dst).map_err(io_err(&dst))?;
            copied += copy_missing(&src, &dst)?;
        } else if ty.is_file() && !dst.exists() {
            fs::copy(&src, &dst).map_err(io_err(&dst))?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    fn touch_artifact(store: &ArtifactStore, name: &str, age_secs: u64) {
        let dir = store.artifact_dir();
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let f = fs::File::create(&path).unwrap();
        f.set_modified(base - Duration::from_secs(age_secs)).unwrap();
    }

    #[test]
    fn test_latest_empty_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path().join("faq"));
        assert!(store.latest().unwrap().is_none());
    }

    #[test]
    fn test_latest_ignores_other_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path().join("faq"));
        touch_artifact(&store, "notes.txt", 0);
        touch_artifact(&store, "faq-20240101.tar.gz", 100);

        let latest = store.latest().unwrap().unwrap();
        assert_eq!(latest.filename, "faq-20240101.tar.gz");
        assert!(store.artifact_dir().join("notes.txt").exists());
    }

    #[test]
    fn test_latest_breaks_mtime_ties_by_name() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path().join("faq"));
        touch_artifact(&store, "faq-20240101.tar.gz", 50);
        touch_artifact(&store, "faq-20240202.tar.gz", 50);

        let latest = store.latest().unwrap().unwrap();
        assert_eq!(latest.filename, "faq-20240202.tar.gz");
    }

    #[test]
    fn test_put_rejects_escaping_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path().join("faq"));
        assert!(matches!(
            store.put("../outside.txt", b"x"),
            Err(ModelOpsError::InvalidPath(_))
        ));
        assert!(matches!(
            store.put("/etc/passwd", b"x"),
            Err(ModelOpsError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_put_invalid_yaml_leaves_file_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path().join("faq"));
        assert!(store.put("config.yml", b"language: en\n").unwrap());

        let err = store.put("config.yml", b"language: [unclosed\n").unwrap_err();
        assert!(matches!(err, ModelOpsError::InvalidConfig { .. }));
        let on_disk = fs::read_to_string(store.dir().join("config.yml")).unwrap();
        assert!(on_disk.contains("language: en"));
    }

    #[test]
    fn test_put_rewrites_pipeline_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path().join("faq"));
        let cfg = b"pipeline:\n- name: JiebaTokenizer\n  dictionary_path: ./dict\n- name: DIETClassifier\n  epochs: 100\n";
        store.put("config.yml", cfg).unwrap();

        let root = fs::canonicalize(store.dir()).unwrap();
        let written: serde_yaml::Value =
            serde_yaml::from_slice(&fs::read(store.dir().join("config.yml")).unwrap()).unwrap();
        let dict = written["pipeline"][0]["dictionary_path"].as_str().unwrap();
        assert_eq!(dict, root.join("dict").to_string_lossy());
        assert_eq!(written["pipeline"][1]["epochs"].as_u64(), Some(100));
    }

    #[test]
    fn test_put_all_rejects_before_writing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path().join("faq"));
        let files: Vec<(&str, &[u8])> = vec![
            ("domain.yml", &b"intents: [greet]\n"[..]),
            ("config.yml", &b"pipeline: [unclosed\n"[..]),
        ];
        assert!(store.put_all(files).is_err());
        assert!(!store.dir().join("domain.yml").exists());
    }

    #[test]
    fn test_check_all_validates_without_writing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path().join("faq"));
        let good: Vec<(&str, &[u8])> = vec![("domain.yml", &b"intents: [greet]\n"[..])];
        store.check_all(good).unwrap();
        assert!(!store.dir().join("domain.yml").exists());

        let escaping: Vec<(&str, &[u8])> = vec![("../x.yml", &b"a: 1\n"[..])];
        assert!(matches!(store.check_all(escaping), Err(ModelOpsError::InvalidPath(_))));
    }

    #[test]
    fn test_put_plain_file_verbatim() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(tmp.path().join("faq"));
        store.put("data/nlu.md", b"## intent:greet\n- hi").unwrap();
        assert_eq!(
            fs::read(store.dir().join("data/nlu.md")).unwrap(),
            b"## intent:greet\n- hi"
        );
    }

    #[test]
    fn test_deploy_defaults_keeps_existing_files() {
        let tmp = tempfile::tempdir().unwrap();
        let template = tmp.path().join("template");
        fs::create_dir_all(template.join("data")).unwrap();
        fs::write(template.join("config.yml"), "language: en\n").unwrap();
        fs::write(template.join("data/nlu.yml"), "nlu: []\n").unwrap();

        let store = ArtifactStore::new(tmp.path().join("faq"));
        fs::create_dir_all(store.dir()).unwrap();
        fs::write(store.dir().join("config.yml"), "language: zh\n").unwrap();

        assert_eq!(store.deploy_defaults(Some(&template)).unwrap(), 1);
        assert!(store.artifact_dir().is_dir());
        assert_eq!(
            fs::read_to_string(store.dir().join("config.yml")).unwrap(),
            "language: zh\n"
        );
        assert!(store.dir().join("data/nlu.yml").exists());
    }
}
