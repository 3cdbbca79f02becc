//! File service
//!
//! The engine's only view of object storage: opaque named objects with byte
//! extents, immutable once written. The local-directory implementation backs
//! tests and single-node deployments; a real deployment plugs in its own.

pub mod location;

pub use location::{Extent, Location};

use crate::error::{EngineError, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{Read as _, Seek, SeekFrom, Write as _};
use std::path::PathBuf;

pub trait FileService: Send + Sync {
    /// Write a new immutable object. The returned location covers the whole
    /// payload.
    fn write(&self, name: &str, payload: &[u8]) -> Result<Location>;

    /// Read an extent. `extent` is relative to the location's own extent;
    /// `None` reads the location in full.
    fn read(&self, location: &Location, extent: Option<Extent>) -> Result<Vec<u8>>;

    fn delete(&self, name: &str) -> Result<()>;

    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Objects as flat files under a root directory. Object names may contain
/// `/`, mapped to subdirectories.
pub struct LocalFileService {
    root: PathBuf,
}

impl LocalFileService {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn object_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl FileService for LocalFileService {
    fn write(&self, name: &str, payload: &[u8]) -> Result<Location> {
        let path = self.object_path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        if path.exists() {
            return Err(EngineError::Internal(format!("object {} already exists", name)));
        }
        let mut file = OpenOptions::new().create_new(true).write(true).open(&path)?;
        file.write_all(payload)?;
        file.sync_all()?;
        Ok(Location::new(name, Extent::new(0, payload.len() as u64), 0, 0))
    }

    fn read(&self, location: &Location, extent: Option<Extent>) -> Result<Vec<u8>> {
        let path = self.object_path(&location.object);
        let mut file = File::open(&path)?;
        let (offset, length) = match extent {
            Some(e) => {
                if e.end() > location.extent.length {
                    return Err(EngineError::Corruption(format!(
                        "extent {}..{} outside {}",
                        e.offset,
                        e.end(),
                        location
                    )));
                }
                (location.extent.offset + e.offset, e.length)
            }
            None => (location.extent.offset, location.extent.length),
        };
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; length as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn delete(&self, name: &str) -> Result<()> {
        let path = self.object_path(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            // Deleting an already-gone object is fine; GC retries sweeps.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for entry in entries {
                let entry = entry?;
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                if let Ok(rel) = path.strip_prefix(&self.root) {
                    let name = rel.to_string_lossy().replace('\\', "/");
                    if name.starts_with(prefix) {
                        names.push(name);
                    }
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let fs = LocalFileService::new(dir.path()).unwrap();
        let loc = fs.write("tables/obj-1", b"hello world").unwrap();
        assert_eq!(loc.extent.length, 11);
        assert_eq!(fs.read(&loc, None).unwrap(), b"hello world");
        assert_eq!(fs.read(&loc, Some(Extent::new(6, 5))).unwrap(), b"world");
    }

    #[test]
    fn test_objects_are_immutable() {
        let dir = TempDir::new().unwrap();
        let fs = LocalFileService::new(dir.path()).unwrap();
        fs.write("obj", b"first").unwrap();
        assert!(fs.write("obj", b"second").is_err());
    }

    #[test]
    fn test_extent_out_of_bounds() {
        let dir = TempDir::new().unwrap();
        let fs = LocalFileService::new(dir.path()).unwrap();
        let loc = fs.write("obj", b"abc").unwrap();
        assert!(fs.read(&loc, Some(Extent::new(2, 5))).is_err());
    }

    #[test]
    fn test_list_and_delete() {
        let dir = TempDir::new().unwrap();
        let fs = LocalFileService::new(dir.path()).unwrap();
        fs.write("a/obj-1", b"x").unwrap();
        fs.write("a/obj-2", b"y").unwrap();
        fs.write("b/obj-3", b"z").unwrap();
        assert_eq!(fs.list("a/").unwrap(), vec!["a/obj-1".to_string(), "a/obj-2".to_string()]);
        fs.delete("a/obj-1").unwrap();
        // Idempotent delete.
        fs.delete("a/obj-1").unwrap();
        assert_eq!(fs.list("a/").unwrap(), vec!["a/obj-2".to_string()]);
    }
}
