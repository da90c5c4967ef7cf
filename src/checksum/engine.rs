//! Streams file ranges through [`FileChecksum`]
//!
//! Every computation opens its own file handle, so a checksum can be
//! recomputed over any range while another handle on the same file is
//! being read or written, without moving that handle's position.

use super::FileChecksum;
use crate::error::{IoResultExt, Result, RendezvousError};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::ops::ControlFlow;
use std::path::Path;

/// Progress of a running checksum computation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumProgress {
    /// Bytes hashed so far in this computation
    pub done: u64,
    /// Bytes this computation will hash
    pub total: u64,
}

/// Computes transfer checksums over files
#[derive(Debug, Clone)]
pub struct ChecksumEngine {
    buffer_size: usize,
    progress_interval: u64,
}

impl ChecksumEngine {
    /// Create an engine with the given read buffer size
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            progress_interval: 1024 * 1024,
        }
    }

    /// Report progress every `interval` bytes
    pub fn with_progress_interval(mut self, interval: u64) -> Self {
        self.progress_interval = interval.max(1);
        self
    }

    /// Checksum of the first `len` bytes of a file
    pub fn checksum_prefix(&self, path: &Path, len: u64) -> Result<u32> {
        self.compute(path, FileChecksum::new(), len, |_| ControlFlow::Continue(()))
            .map(|c| c.value())
    }

    /// Checksum of a whole file
    pub fn checksum_file(&self, path: &Path) -> Result<u32> {
        let len = std::fs::metadata(path).with_path(path)?.len();
        self.checksum_prefix(path, len)
    }

    /// Continue `state` over the file bytes from `state.offset()` up to `end`
    ///
    /// `progress` may return [`ControlFlow::Break`] to abort, which yields
    /// [`RendezvousError::Cancelled`].
    pub fn compute<F>(
        &self,
        path: &Path,
        mut state: FileChecksum,
        end: u64,
        mut progress: F,
    ) -> Result<FileChecksum>
    where
        F: FnMut(ChecksumProgress) -> ControlFlow<()>,
    {
        let start = state.offset();
        if end < start {
            return Err(RendezvousError::protocol(format!(
                "Checksum range ends at {} before its start {}",
                end, start
            )));
        }
        let total = end - start;

        let mut file = File::open(path).with_path(path)?;
        file.seek(SeekFrom::Start(start)).with_path(path)?;
        let mut reader = BufReader::with_capacity(self.buffer_size, file).take(total);
        let mut buffer = vec![0u8; self.buffer_size];
        let mut done = 0u64;
        let mut next_report = self.progress_interval;

        while done < total {
            let bytes_read = reader.read(&mut buffer).with_path(path)?;
            if bytes_read == 0 {
                return Err(RendezvousError::io(
                    path,
                    std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("file ended after {} of {} bytes", start + done, end),
                    ),
                ));
            }
            state.update(&buffer[..bytes_read]);
            done += bytes_read as u64;

            if done >= next_report || done == total {
                next_report = done + self.progress_interval;
                if progress(ChecksumProgress { done, total }).is_break() {
                    return Err(RendezvousError::Cancelled);
                }
            }
        }

        Ok(state)
    }
}

impl Default for ChecksumEngine {
    fn default() -> Self {
        Self::new(64 * 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &Path, name: &str, data: &[u8]) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 256) as u8).collect()
    }

    #[test]
    fn test_matches_in_memory() {
        let dir = TempDir::new().unwrap();
        let data = pattern(200_000);
        let path = write_file(dir.path(), "a.bin", &data);

        let engine = ChecksumEngine::new(4096);
        assert_eq!(engine.checksum_file(&path).unwrap(), FileChecksum::calculate(&data));
        assert_eq!(
            engine.checksum_prefix(&path, 777).unwrap(),
            FileChecksum::calculate(&data[..777])
        );
    }

    #[test]
    fn test_restartable_without_side_effects() {
        let dir = TempDir::new().unwrap();
        let data = pattern(50_000);
        let path = write_file(dir.path(), "b.bin", &data);

        let mut held = File::open(&path).unwrap();
        held.seek(SeekFrom::Start(1234)).unwrap();

        let engine = ChecksumEngine::new(1000);
        let first = engine.checksum_prefix(&path, 40_000).unwrap();
        let second = engine.checksum_prefix(&path, 40_000).unwrap();
        assert_eq!(first, second);

        assert_eq!(held.stream_position().unwrap(), 1234);
    }

    #[test]
    fn test_extend_prefix_state() {
        let dir = TempDir::new().unwrap();
        let data = pattern(30_001);
        let path = write_file(dir.path(), "c.bin", &data);

        let engine = ChecksumEngine::new(512);
        let prefix = engine
            .compute(&path, FileChecksum::new(), 10_001, |_| ControlFlow::Continue(()))
            .unwrap();
        let whole = engine
            .compute(&path, prefix, 30_001, |_| ControlFlow::Continue(()))
            .unwrap();

        assert_eq!(whole.value(), engine.checksum_file(&path).unwrap());
    }

    #[test]
    fn test_progress_and_abort() {
        let dir = TempDir::new().unwrap();
        let path = write_file(dir.path(), "d.bin", &pattern(10_000));

        let engine = ChecksumEngine::new(1000).with_progress_interval(2500);
        let mut reports = Vec::new();
        engine
            .compute(&path, FileChecksum::new(), 10_000, |p| {
                reports.push(p);
                ControlFlow::Continue(())
            })
            .unwrap();
        assert_eq!(reports.last().unwrap().done, 10_000);
        assert!(reports.len() >= 4);

        let aborted = engine.compute(&path, FileChecksum::new(), 10_000, |_| ControlFlow::Break(()));
        assert!(matches!(aborted, Err(RendezvousError::Cancelled)));
    }

    #[test]
    fn test_short_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("e.bin");
        File::create(&path).unwrap().write_all(b"short").unwrap();

        let engine = ChecksumEngine::default();
        assert!(engine.checksum_prefix(&path, 100).is_err());
    }
}
