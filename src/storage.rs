//! Backing storage for file bytes.
//!
//! The transfer engine never touches the filesystem directly; it reads and
//! writes byte ranges through [`Storage`]. Calls block, so code on the runtime
//! runs them on the blocking pool.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::error::{PairError, Result};

pub trait Storage: Send + Sync {
    fn read(&self, file: &str, range: Range<u64>) -> Result<Vec<u8>>;

    fn write(&self, file: &str, offset: u64, bytes: &[u8]) -> Result<()>;

    fn len(&self, file: &str) -> Result<u64>;

    /// Moves `from` to `to`, replacing whatever `to` held.
    fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Names of every stored file, sorted.
    fn list(&self) -> Result<Vec<String>>;
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    files: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> PairError {
    PairError::Io(std::io::Error::other("storage lock poisoned"))
}

impl Storage for MemoryStorage {
    fn read(&self, file: &str, range: Range<u64>) -> Result<Vec<u8>> {
        let files = self.files.read().map_err(|_| poisoned())?;
        let data = files
            .get(file)
            .ok_or_else(|| PairError::UnknownFile(file.to_string()))?;
        if range.start > range.end || range.end > data.len() as u64 {
            return Err(PairError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("{file}: range {range:?} outside {} bytes", data.len()),
            )));
        }
        Ok(data[range.start as usize..range.end as usize].to_vec())
    }

    fn write(&self, file: &str, offset: u64, bytes: &[u8]) -> Result<()> {
        let mut files = self.files.write().map_err(|_| poisoned())?;
        let data = files.entry(file.to_string()).or_default();
        let end = offset as usize + bytes.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(bytes);
        Ok(())
    }

    fn len(&self, file: &str) -> Result<u64> {
        let files = self.files.read().map_err(|_| poisoned())?;
        files
            .get(file)
            .map(|data| data.len() as u64)
            .ok_or_else(|| PairError::UnknownFile(file.to_string()))
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut files = self.files.write().map_err(|_| poisoned())?;
        let data = files
            .remove(from)
            .ok_or_else(|| PairError::UnknownFile(from.to_string()))?;
        files.insert(to.to_string(), data);
        Ok(())
    }

    fn list(&self) -> Result<Vec<String>> {
        let files = self.files.read().map_err(|_| poisoned())?;
        let mut names: Vec<String> = files.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

/// Stores each file under one folder, one regular file per name.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, file: &str) -> Result<PathBuf> {
        if file.is_empty()
            || file == "."
            || file == ".."
            || file.contains(['/', '\\'])
        {
            return Err(PairError::Protocol(format!("invalid file name: {file:?}")));
        }
        Ok(self.root.join(file))
    }
}

impl Storage for FsStorage {
    fn read(&self, file: &str, range: Range<u64>) -> Result<Vec<u8>> {
        let path = self.path_of(file)?;
        let mut handle = fs::File::open(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PairError::UnknownFile(file.to_string()),
            _ => PairError::Io(e),
        })?;
        handle.seek(SeekFrom::Start(range.start))?;
        let mut buf = vec![0u8; range.end.saturating_sub(range.start) as usize];
        handle.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn write(&self, file: &str, offset: u64, bytes: &[u8]) -> Result<()> {
        let path = self.path_of(file)?;
        let mut handle = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        handle.seek(SeekFrom::Start(offset))?;
        handle.write_all(bytes)?;
        Ok(())
    }

    fn len(&self, file: &str) -> Result<u64> {
        let path = self.path_of(file)?;
        match fs::metadata(path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(PairError::UnknownFile(file.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let source = self.path_of(from)?;
        let target = self.path_of(to)?;
        fs::rename(source, target).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => PairError::UnknownFile(from.to_string()),
            _ => PairError::Io(e),
        })
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            // Names that are not valid UTF-8 cannot be advertised.
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}
