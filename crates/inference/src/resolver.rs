//! Locating annotated result files inside run directories.

use crate::detection::DetectionRun;
use crate::error::ResolveError;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedResult {
    pub path: PathBuf,
    /// Lowercased text after the last `.` of the file name
    pub extension: String,
}

impl ResolvedResult {
    fn from_path(path: PathBuf) -> Result<Self, ResolveError> {
        let extension = extension_of(&path)
            .ok_or_else(|| ResolveError::MissingExtension(path.clone()))?;
        Ok(Self { path, extension })
    }

    pub fn is_jpeg(&self) -> bool {
        self.extension == "jpg"
    }
}

fn extension_of(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let (_, ext) = name.rsplit_once('.')?;
    if ext.is_empty() {
        return None;
    }
    Some(ext.to_lowercase())
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ResolveError + '_ {
    move |source| ResolveError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Creation time where the platform records it, modification time otherwise.
fn created_or_modified(metadata: &fs::Metadata) -> Option<SystemTime> {
    metadata.created().or_else(|_| metadata.modified()).ok()
}

/// Result file of the most recently created run directory under `root`.
///
/// Picks the first regular file of the newest subdirectory in listing order.
/// The choice is racy when other invocations create runs concurrently; prefer
/// [`resolve_output`] whenever the producing [`DetectionRun`] is at hand.
#[tracing::instrument(level = "debug")]
pub fn latest_result(root: &Path) -> Result<ResolvedResult, ResolveError> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ResolveError::NoRunsFound(root.to_path_buf()));
        }
        Err(e) => return Err(io_error(root)(e)),
    };

    let mut newest: Option<(SystemTime, PathBuf)> = None;
    for entry in entries {
        let entry = entry.map_err(io_error(root))?;
        let metadata = entry.metadata().map_err(io_error(&entry.path()))?;
        if !metadata.is_dir() {
            continue;
        }
        let stamp = created_or_modified(&metadata).unwrap_or(SystemTime::UNIX_EPOCH);
        if newest.as_ref().is_none_or(|(best, _)| stamp > *best) {
            newest = Some((stamp, entry.path()));
        }
    }

    let (_, run_dir) = newest.ok_or_else(|| ResolveError::NoRunsFound(root.to_path_buf()))?;

    let mut first_file = None;
    for entry in fs::read_dir(&run_dir).map_err(io_error(&run_dir))? {
        let entry = entry.map_err(io_error(&run_dir))?;
        let file_type = entry.file_type().map_err(io_error(&run_dir))?;
        if file_type.is_file() {
            first_file = Some(entry.path());
            break;
        }
    }

    let path = first_file.ok_or(ResolveError::EmptyRunDirectory(run_dir))?;
    tracing::debug!(path = %path.display(), "Resolved latest result");
    ResolvedResult::from_path(path)
}

/// Validate the exact file a detector run produced.
pub fn resolve_output(run: &DetectionRun) -> Result<ResolvedResult, ResolveError> {
    if !run.output_file.starts_with(&run.run_dir) || !run.output_file.is_file() {
        return Err(ResolveError::EmptyRunDirectory(run.run_dir.clone()));
    }
    ResolvedResult::from_path(run.output_file.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    fn make_run(root: &Path, name: &str, file: Option<&str>) -> PathBuf {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        if let Some(file) = file {
            fs::write(dir.join(file), b"data").unwrap();
        }
        // Keep timestamps strictly ordered between runs
        thread::sleep(Duration::from_millis(50));
        dir
    }

    fn run_for(dir: &Path, file: &str) -> DetectionRun {
        DetectionRun {
            detections: Vec::new(),
            run_dir: dir.to_path_buf(),
            output_file: dir.join(file),
        }
    }

    #[test]
    fn test_latest_result_picks_newest_run() {
        let root = tempdir().unwrap();
        make_run(root.path(), "predict", Some("a.jpg"));
        make_run(root.path(), "predict2", Some("b.jpg"));
        let newest = make_run(root.path(), "predict3", Some("c.JPG"));

        let resolved = latest_result(root.path()).unwrap();

        assert_eq!(resolved.path, newest.join("c.JPG"));
        assert_eq!(resolved.extension, "jpg");
        assert!(resolved.is_jpeg());
    }

    #[test]
    fn test_latest_result_ignores_plain_files_in_root() {
        let root = tempdir().unwrap();
        let run = make_run(root.path(), "predict", Some("a.png"));
        fs::write(root.path().join("stray.txt"), b"x").unwrap();

        let resolved = latest_result(root.path()).unwrap();

        assert_eq!(resolved.path, run.join("a.png"));
        assert_eq!(resolved.extension, "png");
        assert!(!resolved.is_jpeg());
    }

    #[test]
    fn test_latest_result_missing_or_empty_root() {
        let root = tempdir().unwrap();
        assert!(matches!(
            latest_result(&root.path().join("absent")),
            Err(ResolveError::NoRunsFound(_))
        ));
        assert!(matches!(
            latest_result(root.path()),
            Err(ResolveError::NoRunsFound(_))
        ));
    }

    #[test]
    fn test_latest_result_empty_run_dir() {
        let root = tempdir().unwrap();
        make_run(root.path(), "predict", None);
        assert!(matches!(
            latest_result(root.path()),
            Err(ResolveError::EmptyRunDirectory(_))
        ));
    }

    #[test]
    fn test_latest_result_missing_extension() {
        let root = tempdir().unwrap();
        make_run(root.path(), "predict", Some("result"));
        assert!(matches!(
            latest_result(root.path()),
            Err(ResolveError::MissingExtension(_))
        ));
    }

    #[test]
    fn test_extension_uses_last_dot() {
        assert_eq!(extension_of(Path::new("a.tar.GZ")).as_deref(), Some("gz"));
        assert_eq!(extension_of(Path::new("noext")), None);
        assert_eq!(extension_of(Path::new("trailing.")), None);
    }

    #[test]
    fn test_resolve_output_exact_file() {
        let root = tempdir().unwrap();
        let older = make_run(root.path(), "predict", Some("mine.jpg"));
        make_run(root.path(), "predict2", Some("theirs.jpg"));

        let resolved = resolve_output(&run_for(&older, "mine.jpg")).unwrap();

        assert_eq!(resolved.path, older.join("mine.jpg"));
        assert_eq!(resolved.extension, "jpg");
    }

    #[test]
    fn test_resolve_output_missing_file() {
        let root = tempdir().unwrap();
        let dir = make_run(root.path(), "predict", None);
        assert!(matches!(
            resolve_output(&run_for(&dir, "gone.jpg")),
            Err(ResolveError::EmptyRunDirectory(_))
        ));
    }

    #[test]
    fn test_resolve_output_rejects_file_outside_run_dir() {
        let root = tempdir().unwrap();
        let dir = make_run(root.path(), "predict", None);
        fs::write(root.path().join("outside.jpg"), b"x").unwrap();
        let run = DetectionRun {
            detections: Vec::new(),
            run_dir: dir,
            output_file: root.path().join("outside.jpg"),
        };
        assert!(resolve_output(&run).is_err());
    }
}
