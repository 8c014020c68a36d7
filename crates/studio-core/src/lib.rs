use anyhow::{anyhow, Result};
use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

pub const BASELINE_SNAPSHOT: &str = "baseline";
pub const BUGGY_SNAPSHOT: &str = "buggy";

pub const TEST_SCRIPT_FILENAME: &str = "test_script.sh";
pub const TEST_FILES_FILENAME: &str = "test_files.txt";
pub const TEST_PARSER_FILENAME: &str = "test_parser.py";
pub const BUG_INJECT_DIFF_FILENAME: &str = "bug_inject.diff";
pub const TEST_WEAKEN_DIFF_FILENAME: &str = "test_weaken.diff";
pub const PRED_PATCH_FILENAME: &str = "pred_patch.diff";
pub const TOOL_TRACE_FILENAME: &str = "tool_trace.json";
pub const EPISODE_CONTROL_FILENAME: &str = "control.json";

static ID_SEQ: AtomicU64 = AtomicU64::new(0);

/// Mints a process-unique string id such as `ep_20260802_120301_0007`.
pub fn mint_id(prefix: &str) -> String {
    let seq = ID_SEQ.fetch_add(1, Ordering::Relaxed);
    format!(
        "{}_{}_{:04}",
        prefix,
        Utc::now().format("%Y%m%d_%H%M%S"),
        seq % 10_000
    )
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(sha256_bytes(&buf))
}

/// Digest of a directory tree: relative paths plus file contents, sorted, so
/// the result is stable across hosts and walk orders.
pub fn sha256_dir(root: &Path) -> Result<String> {
    let mut entries: Vec<PathBuf> = Vec::new();
    collect_files(root, root, &mut entries)?;
    entries.sort();
    let mut hasher = Sha256::new();
    for rel in entries {
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(fs::read(root.join(&rel))?);
        hasher.update([0u8]);
    }
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else if path.is_file() {
            out.push(path.strip_prefix(root)?.to_path_buf());
        }
    }
    Ok(())
}

pub fn canonical_json(value: &Value) -> String {
    canonical_json_inner(value)
}

fn canonical_json_inner(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => serde_json::to_string(s).unwrap_or_else(|_| format!("\"{}\"", s)),
        Value::Array(arr) => {
            let items: Vec<String> = arr.iter().map(canonical_json_inner).collect();
            format!("[{}]", items.join(","))
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut parts = Vec::with_capacity(keys.len());
            for k in keys {
                let v = map.get(k).unwrap();
                let ks = serde_json::to_string(k).unwrap();
                parts.push(format!("{}:{}", ks, canonical_json_inner(v)));
            }
            format!("{{{}}}", parts.join(","))
        }
    }
}

pub fn canonical_json_digest(value: &Value) -> String {
    sha256_bytes(canonical_json(value).as_bytes())
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

/// On-disk layout of a studio data directory.
#[derive(Debug, Clone)]
pub struct StudioPaths {
    pub root: PathBuf,
    pub environments_dir: PathBuf,
    pub episodes_dir: PathBuf,
    pub store_dir: PathBuf,
    pub facts_dir: PathBuf,
    pub sandboxes_dir: PathBuf,
}

pub fn studio_paths(root: &Path) -> StudioPaths {
    StudioPaths {
        root: root.to_path_buf(),
        environments_dir: root.join("environments"),
        episodes_dir: root.join("episodes"),
        store_dir: root.join("store"),
        facts_dir: root.join("facts"),
        sandboxes_dir: root.join("sandboxes"),
    }
}

impl StudioPaths {
    pub fn environment_record(&self, env_id: &str) -> PathBuf {
        self.environments_dir.join(format!("{}.json", env_id))
    }

    pub fn episode_dir(&self, episode_id: &str) -> PathBuf {
        self.episodes_dir.join(episode_id)
    }

    pub fn episode_record(&self, episode_id: &str) -> PathBuf {
        self.episode_dir(episode_id).join("episode.json")
    }

    pub fn episode_control(&self, episode_id: &str) -> PathBuf {
        self.episode_dir(episode_id)
            .join("state")
            .join(EPISODE_CONTROL_FILENAME)
    }
}

/// Keyed blob store rooted at a directory. Keys are slash-separated relative
/// paths; the returned ref is the key itself.
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.starts_with('/') {
            return Err(anyhow!("invalid object store key: {}", key));
        }
        for part in key.split('/') {
            if part.is_empty() || part == "." || part == ".." {
                return Err(anyhow!("invalid object store key: {}", key));
            }
        }
        Ok(self.root.join(key))
    }

    pub fn write(&self, key: &str, bytes: &[u8]) -> Result<String> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }
        fs::write(&path, bytes)?;
        Ok(key.to_string())
    }

    pub fn read(&self, object_ref: &str) -> Result<Vec<u8>> {
        let path = self.path_for(object_ref)?;
        Ok(fs::read(path)?)
    }

    pub fn read_to_string(&self, object_ref: &str) -> Result<String> {
        let path = self.path_for(object_ref)?;
        Ok(fs::read_to_string(path)?)
    }

    pub fn exists(&self, object_ref: &str) -> Result<bool> {
        Ok(self.path_for(object_ref)?.exists())
    }

    pub fn delete(&self, object_ref: &str) -> Result<()> {
        let path = self.path_for(object_ref)?;
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = if prefix.is_empty() {
            self.root.clone()
        } else {
            self.path_for(prefix)?
        };
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        let mut stack = vec![dir];
        while let Some(current) = stack.pop() {
            for entry in fs::read_dir(&current)? {
                let entry = entry?;
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path.is_file() {
                    keys.push(
                        path.strip_prefix(&self.root)?
                            .to_string_lossy()
                            .replace('\\', "/"),
                    );
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}
