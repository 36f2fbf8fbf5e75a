use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Filesystem operations the lock protocol relies on.
///
/// Sentinels communicate through existence alone, so the whole protocol
/// needs only these primitives. Kept behind a trait so tests can observe or
/// perturb sentinel traffic.
pub trait Filesystem: Send + Sync {
    fn exists(&self, path: &Path) -> bool;

    /// Create (or truncate) a zero-length marker.
    fn create_empty(&self, path: &Path) -> std::io::Result<()>;

    /// Atomically publish a marker carrying `contents`.
    fn write(&self, path: &Path, contents: &[u8]) -> std::io::Result<()>;

    fn read_to_string(&self, path: &Path) -> std::io::Result<String>;

    /// Remove a marker. Returns `false` if it was already gone.
    fn remove(&self, path: &Path) -> std::io::Result<bool>;
}

/// The local (or shared, network-mounted) filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

impl Filesystem for LocalFs {
    fn exists(&self, path: &Path) -> bool {
        fs::metadata(path).is_ok()
    }

    fn create_empty(&self, path: &Path) -> std::io::Result<()> {
        ensure_parent(path)?;
        File::create(path)?;
        Ok(())
    }

    fn write(&self, path: &Path, contents: &[u8]) -> std::io::Result<()> {
        ensure_parent(path)?;
        let tmp_path = with_suffix(path, ".tmp");
        let mut file = File::create(&tmp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(tmp_path, path)
    }

    fn read_to_string(&self, path: &Path) -> std::io::Result<String> {
        fs::read_to_string(path)
    }

    fn remove(&self, path: &Path) -> std::io::Result<bool> {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }
}

fn ensure_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

/// Append a raw suffix to the final path component (`out.bp` + `.done`).
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw: OsString = path.as_os_str().to_owned();
    raw.push(suffix);
    PathBuf::from(raw)
}

/// The end-of-stream marker for a data file.
pub fn done_path(filename: &Path) -> PathBuf {
    with_suffix(filename, ".done")
}

/// Record that no further steps will be produced for `filename`.
pub fn mark_done(fs: &dyn Filesystem, filename: &Path, last_step: i64) -> std::io::Result<()> {
    fs.write(&done_path(filename), format!("{last_step}").as_bytes())
}

/// The final step recorded in a `.done` marker, if any.
///
/// A marker that exists but holds no parsable index still means "done".
pub fn read_done(fs: &dyn Filesystem, filename: &Path) -> Option<Option<i64>> {
    let path = done_path(filename);
    if !fs.exists(&path) {
        return None;
    }
    let contents = fs.read_to_string(&path).unwrap_or_default();
    Some(contents.trim().parse::<i64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_appends_to_file_name() {
        assert_eq!(
            with_suffix(Path::new("run/out.bp"), "-busy-writer"),
            PathBuf::from("run/out.bp-busy-writer")
        );
        assert_eq!(done_path(Path::new("out.bp")), PathBuf::from("out.bp.done"));
    }

    #[test]
    fn remove_reports_missing_marker() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("nested").join("marker");
        let fs = LocalFs;
        fs.create_empty(&marker).unwrap();
        assert!(fs.exists(&marker));
        assert!(fs.remove(&marker).unwrap());
        assert!(!fs.remove(&marker).unwrap());
    }

    #[test]
    fn done_marker_round_trips_last_step() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("field.bp");
        let fs = LocalFs;
        assert_eq!(read_done(&fs, &data), None);
        mark_done(&fs, &data, 41).unwrap();
        assert_eq!(read_done(&fs, &data), Some(Some(41)));

        fs.create_empty(&done_path(&data)).unwrap();
        assert_eq!(read_done(&fs, &data), Some(None));
    }
}
