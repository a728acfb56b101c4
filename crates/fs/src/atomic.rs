//! Atomic per-entry write protocol: temp file in the target directory,
//! `fsync`, rename into place, unlink the temp file on any failure after
//! creation. Grounded in back-ldif/ldif.c's
//! `ldif_write_entry` (`mkstemp`/`fsync`/`rename`); expressed with the
//! `tempfile` crate rather than hand-rolled `mkstemp`, the way the rest
//! of this workspace reaches for ecosystem crates instead of raw libc
//! calls.

use std::io;
use std::path::Path;

use tempfile::Builder;

/// Write `content` to `path` atomically: stage in a sibling temp file,
/// fsync, then rename into place (replacing any existing file).
pub fn write_atomic(path: &Path, content: &[u8]) -> io::Result<()> {
    let dir = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "entry path has no parent directory")
    })?;
    std::fs::create_dir_all(dir)?;

    let mut tmp = Builder::new().prefix(".dirstore-tmp-").suffix(".ldif").tempfile_in(dir)?;
    tmp.write_all_and_sync(content)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

trait WriteAllAndSync {
    fn write_all_and_sync(&mut self, content: &[u8]) -> io::Result<()>;
}

impl WriteAllAndSync for tempfile::NamedTempFile {
    fn write_all_and_sync(&mut self, content: &[u8]) -> io::Result<()> {
        use std::io::Write;
        self.write_all(content)?;
        self.as_file().sync_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_atomic_creates_parent_and_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sub").join("entry.ldif");
        write_atomic(&path, b"cn: alice\n").unwrap();
        let read = std::fs::read_to_string(&path).unwrap();
        assert_eq!(read, "cn: alice\n");
    }

    #[test]
    fn write_atomic_replaces_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("entry.ldif");
        write_atomic(&path, b"cn: first\n").unwrap();
        write_atomic(&path, b"cn: second\n").unwrap();
        let read = std::fs::read_to_string(&path).unwrap();
        assert_eq!(read, "cn: second\n");
    }
}
