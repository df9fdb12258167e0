use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::id::new_uuid_v7;

fn sync_dir(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

fn sidecar(base: &Path, suffix: &str) -> PathBuf {
    let mut os = OsString::from(base.as_os_str());
    os.push(suffix);
    PathBuf::from(os)
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Delete a SQLite database together with its journal files. A leftover
/// `-journal` would otherwise be replayed into the fresh database.
pub fn remove_database_files(db_path: &Path) -> io::Result<()> {
    remove_if_present(db_path)?;
    for suffix in ["-wal", "-shm", "-journal"] {
        remove_if_present(&sidecar(db_path, suffix))?;
    }
    Ok(())
}

/// Replace `path` with `bytes` so readers see either the old or the new
/// contents, never a torn file. The parent directory must already exist.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;

    let mut tmp_name = OsString::from(".");
    tmp_name.push(file_name);
    tmp_name.push(format!(".{}.tmp", new_uuid_v7()));
    let tmp_path = parent.join(tmp_name);

    let result = (|| {
        let mut file = File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, path)
    })();

    if let Err(err) = result {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }

    // Directory fsync is best-effort; not every platform supports it.
    let _ = sync_dir(parent);
    Ok(())
}
