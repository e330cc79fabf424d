//! Cache (spec §4.D): the content-addressed store mapping
//! `checksum -> {task snapshot, result, error}` over an ordered list of
//! cache roots, with the at-most-one-writer-per-key invariant from §5.
//!
//! Grounded in the teacher's `checkpoint.rs` (bincode + sha2 serialization,
//! file-based layout) folded together with `helpers.py`'s
//! `save`/`load_result`/`record_error`, whose directory-per-checksum model
//! this mirrors directly.

use crate::error::EngineError;
use crate::record::{ElementResult, Record};
use std::io::Write;
use std::path::{Path, PathBuf};

const TASK_FILE: &str = "_task.bin";
const RESULT_FILE: &str = "_result.bin";
const ERROR_FILE: &str = "_error.bin";
const LOCK_FILE: &str = "_lock";

fn bincode_config() -> bincode::config::Configuration {
    bincode::config::standard()
}

fn write_atomic(dir: &Path, file_name: &str, bytes: &[u8]) -> Result<(), EngineError> {
    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    let mut tmp = tempfile::Builder::new()
        .prefix(file_name)
        .tempfile_in(dir)
        .map_err(|e| io_err(dir, e))?;
    tmp.write_all(bytes).map_err(|e| io_err(dir, e))?;
    tmp.persist(dir.join(file_name))
        .map_err(|e| io_err(dir, e.error))?;
    Ok(())
}

fn io_err(path: &Path, e: std::io::Error) -> EngineError {
    EngineError::CacheCorruption {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

/// Ordered list of roots consulted by [`load`]; writes land in the first.
#[derive(Debug, Clone, Default)]
pub struct CacheConfig {
    pub roots: Vec<PathBuf>,
}

impl CacheConfig {
    pub fn single(root: impl Into<PathBuf>) -> Self {
        CacheConfig {
            roots: vec![root.into()],
        }
    }

    pub fn write_root(&self) -> Option<&Path> {
        self.roots.first().map(|p| p.as_path())
    }
}

/// Restore a result from the cache (spec §4.D `load`).
///
/// Roots are consulted in order; the first root containing a directory
/// named `checksum` is authoritative, even if `_result.bin` is absent or
/// empty (which this crate treats as "in progress" — the Open Question
/// resolution recorded in DESIGN.md). No further roots are consulted once a
/// matching directory is found.
pub fn load(checksum: &str, roots: &[PathBuf]) -> Result<Option<ElementResult>, EngineError> {
    for root in roots {
        let dir = root.join(checksum);
        if !dir.is_dir() {
            continue;
        }
        let result_path = dir.join(RESULT_FILE);
        return match std::fs::metadata(&result_path) {
            Ok(meta) if meta.len() > 0 => {
                let bytes = std::fs::read(&result_path).map_err(|e| io_err(&result_path, e))?;
                let (value, _): (ElementResult, usize) =
                    bincode::serde::decode_from_slice(&bytes, bincode_config()).map_err(|e| {
                        EngineError::CacheCorruption {
                            path: result_path.clone(),
                            reason: e.to_string(),
                        }
                    })?;
                tracing::trace!(checksum, root = %root.display(), "cache hit");
                Ok(Some(value))
            }
            _ => {
                tracing::trace!(checksum, root = %root.display(), "cache entry present but not finished");
                Ok(None)
            }
        };
    }
    tracing::trace!(checksum, "cache miss");
    Ok(None)
}

/// Write the task snapshot that marks an element as claimed, before the
/// runnable executes (spec §5 write discipline step 3).
pub fn save_task_snapshot(dir: &Path, task: &Record) -> Result<(), EngineError> {
    let bytes = bincode::serde::encode_to_vec(task, bincode_config())
        .map_err(|e| EngineError::CacheCorruption {
            path: dir.join(TASK_FILE),
            reason: e.to_string(),
        })?;
    write_atomic(dir, TASK_FILE, &bytes)
}

/// Write the finished result for an element (spec §5 write discipline step 5).
pub fn save_result(dir: &Path, result: &ElementResult) -> Result<(), EngineError> {
    let bytes = bincode::serde::encode_to_vec(result, bincode_config())
        .map_err(|e| EngineError::CacheCorruption {
            path: dir.join(RESULT_FILE),
            reason: e.to_string(),
        })?;
    write_atomic(dir, RESULT_FILE, &bytes)
}

/// Persist a runnable's failure (spec §7 `runnable-failure`), ported from
/// `helpers.py::record_error`.
pub fn record_error(dir: &Path, error: &str) -> Result<(), EngineError> {
    let bytes = bincode::serde::encode_to_vec(error.to_string(), bincode_config())
        .map_err(|e| EngineError::CacheCorruption {
            path: dir.join(ERROR_FILE),
            reason: e.to_string(),
        })?;
    tracing::warn!(dir = %dir.display(), error, "recording element failure");
    write_atomic(dir, ERROR_FILE, &bytes)
}

/// An advisory, file-based write lock held for the duration of one
/// element's execution (spec §5: "at most one executor per `(root,
/// checksum)` may hold the write lock"). Released on drop.
pub struct WriteLock {
    path: PathBuf,
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Try to acquire the write lock for `dir`. Returns `None` (not an error) if
/// another executor already holds it — readers never take the lock and
/// callers should simply skip the element this round.
pub fn try_acquire_lock(dir: &Path) -> Result<Option<WriteLock>, EngineError> {
    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    let path = dir.join(LOCK_FILE);
    match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
    {
        Ok(_) => Ok(Some(WriteLock { path })),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
        Err(e) => Err(io_err(&path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Scalar;
    use crate::record::Value;

    #[test]
    fn round_trips_a_result() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("AddTwo_abc123");
        let mut output = Record::new();
        output.set("out", Value::Scalar(Scalar::Int(4)));
        let result = ElementResult {
            output,
            runtime: Default::default(),
            error: None,
        };
        save_result(&dir, &result).unwrap();

        let loaded = load("AddTwo_abc123", &[tmp.path().to_path_buf()]).unwrap();
        let loaded = loaded.expect("result should be found");
        assert_eq!(loaded.output.get("out"), Some(&Value::Scalar(Scalar::Int(4))));
    }

    #[test]
    fn empty_task_file_reads_as_in_progress() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("AddTwo_abc123");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(TASK_FILE), []).unwrap();

        let loaded = load("AddTwo_abc123", &[tmp.path().to_path_buf()]).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn first_root_with_the_checksum_directory_is_authoritative() {
        let tmp1 = tempfile::tempdir().unwrap();
        let tmp2 = tempfile::tempdir().unwrap();
        // A directory exists in tmp1 but never finished; tmp2 has a real result.
        std::fs::create_dir_all(tmp1.path().join("X_1")).unwrap();
        let mut output = Record::new();
        output.set("out", Value::Scalar(Scalar::Int(1)));
        save_result(
            &tmp2.path().join("X_1"),
            &ElementResult {
                output,
                runtime: Default::default(),
                error: None,
            },
        )
        .unwrap();

        let loaded = load(
            "X_1",
            &[tmp1.path().to_path_buf(), tmp2.path().to_path_buf()],
        )
        .unwrap();
        assert!(loaded.is_none(), "tmp1's unfinished directory must win and short-circuit");
    }

    #[test]
    fn lock_is_exclusive_until_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("X_1");
        let first = try_acquire_lock(&dir).unwrap();
        assert!(first.is_some());
        assert!(try_acquire_lock(&dir).unwrap().is_none());
        drop(first);
        assert!(try_acquire_lock(&dir).unwrap().is_some());
    }
}
