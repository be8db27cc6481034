//! Atomic file writes for exported artifacts and replay files.
//!
//! Every artifact is written to a `.tmp` sibling first and then renamed over
//! the target, so readers see either the previous file or the complete new
//! one.

use std::io;
use std::path::{Path, PathBuf};

/// Sibling path used while an artifact is being written.
pub fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Atomically write raw bytes to a file.
///
/// Creates parent directories if they don't exist. On failure the staging
/// file is removed and any existing target is left as it was.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = staging_path(path);
    let result = std::fs::write(&tmp, data).and_then(|()| std::fs::rename(&tmp, path));
    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

/// Atomically write pretty-printed JSON.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(data).map_err(io::Error::other)?;
    atomic_write(path, json.as_bytes())
}

/// Atomically write one compact JSON document per line.
pub fn atomic_write_json_lines<'a, T, I>(path: &Path, items: I) -> io::Result<()>
where
    T: serde::Serialize + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let mut out = String::new();
    for item in items {
        out.push_str(&serde_json::to_string(item).map_err(io::Error::other)?);
        out.push('\n');
    }
    atomic_write(path, out.as_bytes())
}

/// Load and deserialize JSON from a file.
///
/// Returns `Ok(None)` if the file doesn't exist.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    let value =
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_staging_path_keeps_extension() {
        let p = Path::new("/tmp/out/graph.graphml");
        assert_eq!(staging_path(p), Path::new("/tmp/out/graph.graphml.tmp"));
    }

    #[test]
    fn test_atomic_write_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("dir").join("graph.graphml");
        atomic_write(&path, b"<graphml/>").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "<graphml/>");
        assert!(!staging_path(&path).exists());
    }

    #[test]
    fn test_failed_write_leaves_target_intact() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("graph.json");
        atomic_write(&path, b"old").unwrap();

        // A directory squatting on the staging path makes the write fail.
        std::fs::create_dir(staging_path(&path)).unwrap();
        assert!(atomic_write(&path, b"new").is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "old");
    }

    #[test]
    fn test_json_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("counts.json");
        atomic_write_json(&path, &vec![1, 2, 3]).unwrap();
        let loaded: Option<Vec<i32>> = load_json(&path).unwrap();
        assert_eq!(loaded, Some(vec![1, 2, 3]));
        let missing: Option<Vec<i32>> = load_json(&dir.path().join("nope.json")).unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_json_lines_one_document_per_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("replay.jsonl");
        let items = vec![serde_json::json!({"a": 1}), serde_json::json!({"b": [2, 3]})];
        atomic_write_json_lines(&path, &items).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines, vec![r#"{"a":1}"#, r#"{"b":[2,3]}"#]);
    }
}
