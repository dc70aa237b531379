//! Advisory file locks and crash-safe file replacement.
//!
//! Writers of `<file>` serialize on a `<file>.lock` sidecar instead of the
//! destination itself: the destination is swapped by rename, and holding an
//! open handle on it can make that rename fail on some platforms. Readers see
//! either the complete old file or the complete new one.
//!
//! Lock acquisition never waits. Contention surfaces as
//! [`DataSafetyError::WriteConflict`] and retry policy belongs to the caller.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;
use tracing::{debug, instrument, warn};

use crate::error::{ConfigError, DataSafetyError, EngineError, Result};
use crate::io::signing::sign_file;

/// Held advisory lock; released when dropped.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
    shared: bool,
}

impl FileLock {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %err, "failed to release file lock");
        }
    }
}

/// Try to lock `path` without blocking.
///
/// A shared lock never creates the file and reports a missing file as
/// [`ConfigError::NotFound`]. An exclusive lock creates parent directories and
/// the file itself unless `create` is false.
pub fn file_lock(path: &Path, shared: bool, create: bool) -> Result<FileLock> {
    let file = if shared {
        File::open(path).map_err(|err| open_error(path, err))?
    } else {
        if create {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|err| DataSafetyError::io(parent, err))?;
            }
        }
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(path)
            .map_err(|err| open_error(path, err))?
    };

    let attempt = if shared {
        FileExt::try_lock_shared(&file)
    } else {
        FileExt::try_lock_exclusive(&file)
    };
    match attempt {
        Ok(()) => {
            debug!(path = %path.display(), shared, "lock acquired");
            Ok(FileLock {
                file,
                path: path.to_path_buf(),
                shared,
            })
        }
        Err(err) if is_contention(&err) => Err(DataSafetyError::WriteConflict {
            path: path.to_path_buf(),
        }
        .into()),
        Err(err) => Err(DataSafetyError::io(path, err).into()),
    }
}

fn open_error(path: &Path, err: io::Error) -> EngineError {
    if err.kind() == io::ErrorKind::NotFound {
        return ConfigError::NotFound(path.display().to_string()).into();
    }
    DataSafetyError::io(path, err).into()
}

fn is_contention(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Sidecar file used to serialize writers of `path`.
pub fn lock_path_for(path: &Path) -> PathBuf {
    sidecar(path, "lock")
}

pub(crate) fn sidecar(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(extension);
    path.with_file_name(name)
}

/// Options controlling how [`atomic_write_with`] commits.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions<'k> {
    /// HMAC key; when present a `<file>.sig` sidecar is written after the data.
    pub signing_key: Option<&'k [u8]>,
    /// Fall back to an in-place overwrite (logged) if the rename is refused.
    pub allow_non_atomic_fallback: bool,
}

/// Atomically replace `path` with `data`, optionally signing it.
pub fn atomic_write(path: &Path, data: &[u8], signing_key: Option<&[u8]>) -> Result<()> {
    atomic_write_with(
        path,
        data,
        WriteOptions {
            signing_key,
            allow_non_atomic_fallback: false,
        },
    )
}

#[instrument(skip_all, fields(path = %path.display(), bytes = data.len()))]
pub fn atomic_write_with(path: &Path, data: &[u8], options: WriteOptions<'_>) -> Result<()> {
    let _guard = file_lock(&lock_path_for(path), false, true)?;
    replace_file(path, data, options.allow_non_atomic_fallback, |_| Ok(()))?;
    if let Some(key) = options.signing_key {
        sign_file(path, key)?;
    }
    Ok(())
}

/// Write `data` to a temp file next to `path`, fsync it, then rename it over
/// `path`. The caller must already hold the sidecar lock.
///
/// `before_commit` runs after the temp file is durable and before the rename;
/// an error from it aborts the write and leaves `path` untouched.
pub(crate) fn replace_file<F>(
    path: &Path,
    data: &[u8],
    allow_non_atomic_fallback: bool,
    before_commit: F,
) -> Result<()>
where
    F: FnOnce(&Path) -> io::Result<()>,
{
    let write_err = |source: io::Error| DataSafetyError::AtomicWrite {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(write_err)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .suffix(".part")
        .tempfile_in(dir)
        .map_err(write_err)?;
    write_durably(&mut tmp, data).map_err(write_err)?;
    before_commit(tmp.path()).map_err(write_err)?;

    match tmp.persist(path) {
        Ok(_) => {
            sync_dir(dir);
            debug!(path = %path.display(), "atomic replace committed");
            Ok(())
        }
        Err(err)
            if allow_non_atomic_fallback && err.error.kind() == io::ErrorKind::PermissionDenied =>
        {
            warn!(
                path = %path.display(),
                error = %err.error,
                "rename refused; falling back to non-atomic overwrite"
            );
            fs::write(path, data).map_err(write_err)?;
            Ok(())
        }
        // Dropping `err.file` removes the temp file.
        Err(err) => Err(write_err(err.error).into()),
    }
}

fn write_durably(tmp: &mut NamedTempFile, data: &[u8]) -> io::Result<()> {
    tmp.write_all(data)?;
    tmp.flush()?;
    tmp.as_file().sync_all()
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

/// Serialize `value` as pretty JSON with a trailing newline.
pub fn to_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = serde_json::to_vec_pretty(value)
        .map_err(|err| EngineError::execution(format!("serialize json: {err}")))?;
    buf.push(b'\n');
    Ok(buf)
}

pub fn write_json_atomic<T: Serialize>(
    path: &Path,
    value: &T,
    signing_key: Option<&[u8]>,
) -> Result<()> {
    atomic_write(path, &to_json_bytes(value)?, signing_key)
}

/// Read and parse a JSON document while holding a shared lock on it.
pub fn read_json_shared<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let _guard = file_lock(path, true, false)?;
    read_json(path)
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path).map_err(|err| open_error(path, err))?;
    serde_json::from_str(&contents).map_err(|err| {
        ConfigError::Parse {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
        .into()
    })
}

/// Read-modify-write a JSON document under one exclusive sidecar lock.
///
/// A missing document starts from `T::default()`. The closure's return value
/// is passed back to the caller once the new document is committed.
pub fn locked_update<T, R, F>(path: &Path, update: F) -> Result<R>
where
    T: Serialize + DeserializeOwned + Default,
    F: FnOnce(&mut T) -> Result<R>,
{
    let _guard = file_lock(&lock_path_for(path), false, true)?;
    let mut doc: T = if path.exists() {
        read_json(path)?
    } else {
        T::default()
    };
    let result = update(&mut doc)?;
    replace_file(path, &to_json_bytes(&doc)?, false, |_| Ok(()))?;
    Ok(result)
}
