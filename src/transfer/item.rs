//! Local files offered in a transfer

use crate::checksum::{ChecksumEngine, ChecksumProgress, FileChecksum};
use crate::error::{IoResultExt, Result, RendezvousError};
use filetime::FileTime;
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use walkdir::WalkDir;

/// A local file together with the name the peer will see
#[derive(Debug)]
pub struct TransferItem {
    path: PathBuf,
    name: Vec<String>,
    size: u64,
    mod_time: u32,
    /// Prefix length -> checksum of that prefix
    checksums: Mutex<HashMap<u64, u32>>,
}

impl TransferItem {
    /// Offer a single file under its own file name
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| RendezvousError::config(format!("'{}' has no usable file name", path.display())))?
            .to_string();
        Self::with_name(path, vec![name])
    }

    /// Offer a file under an explicit segmented name
    pub fn with_name(path: impl Into<PathBuf>, name: Vec<String>) -> Result<Self> {
        let path = path.into();
        let metadata = std::fs::metadata(&path).with_path(&path)?;
        if !metadata.is_file() {
            return Err(RendezvousError::config(format!("'{}' is not a regular file", path.display())));
        }
        let mod_time = FileTime::from_last_modification_time(&metadata)
            .unix_seconds()
            .clamp(0, u32::MAX as i64) as u32;

        Ok(Self {
            path,
            name,
            size: metadata.len(),
            mod_time,
            checksums: Mutex::new(HashMap::new()),
        })
    }

    /// Expand files and directories into transfer items
    ///
    /// Files inside a directory are named relative to the directory's parent,
    /// so the peer recreates the directory itself.
    pub fn collect(paths: &[PathBuf]) -> Result<Vec<Self>> {
        let mut items = Vec::new();
        for root in paths {
            let metadata = std::fs::metadata(root).with_path(root)?;
            if metadata.is_file() {
                items.push(Self::from_path(root)?);
                continue;
            }

            let base = root.parent().unwrap_or_else(|| Path::new(""));
            let mut walker: Vec<_> = WalkDir::new(root)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.clone());
                    RendezvousError::io(path, std::io::Error::other(e.to_string()))
                })?;
            walker.retain(|entry| entry.file_type().is_file());

            for entry in walker {
                let relative = entry.path().strip_prefix(base).unwrap_or(entry.path());
                let name = relative
                    .components()
                    .map(|c| c.as_os_str().to_str().map(str::to_string))
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| {
                        RendezvousError::config(format!("'{}' is not valid UTF-8", entry.path().display()))
                    })?;
                items.push(Self::with_name(entry.path(), name)?);
            }
        }
        Ok(items)
    }

    /// Local path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Name segments sent to the peer
    pub fn name(&self) -> &[String] {
        &self.name
    }

    /// Name segments joined with `/`
    pub fn display_name(&self) -> String {
        self.name.join("/")
    }

    /// Size in bytes when the item was created
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Modification time in Unix seconds
    pub fn mod_time(&self) -> u32 {
        self.mod_time
    }

    /// Checksum of the first `len` bytes, cached per length
    pub fn checksum_prefix<F>(&self, engine: &ChecksumEngine, len: u64, progress: F) -> Result<u32>
    where
        F: FnMut(ChecksumProgress) -> ControlFlow<()>,
    {
        if let Some(sum) = self.cached(len) {
            return Ok(sum);
        }
        let sum = engine.compute(&self.path, FileChecksum::new(), len, progress)?.value();
        if let Ok(mut cache) = self.checksums.lock() {
            cache.insert(len, sum);
        }
        Ok(sum)
    }

    /// Checksum of the whole file
    pub fn checksum<F>(&self, engine: &ChecksumEngine, progress: F) -> Result<u32>
    where
        F: FnMut(ChecksumProgress) -> ControlFlow<()>,
    {
        self.checksum_prefix(engine, self.size, progress)
    }

    fn cached(&self, len: u64) -> Option<u32> {
        self.checksums.lock().ok()?.get(&len).copied()
    }
}
