//! Receiving side of the resumable file transfer protocol

use super::{FileTransferHeader, HeaderType, TransferMonitor, TransferSummary};
use crate::checksum::{ChecksumEngine, FileChecksum};
use crate::control::SessionId;
use crate::error::{IoResultExt, Result, RendezvousError};
use crate::rendezvous::RvEvent;
use filetime::FileTime;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Stores offered files under a destination directory
#[derive(Debug, Clone)]
pub struct FileReceiver {
    dest: PathBuf,
    cookie: SessionId,
    engine: ChecksumEngine,
    buffer_size: usize,
    progress_interval: u64,
}

impl FileReceiver {
    /// Create a receiver writing into `dest`
    pub fn new(dest: impl Into<PathBuf>, cookie: SessionId, buffer_size: usize, progress_interval: u64) -> Self {
        Self {
            dest: dest.into(),
            cookie,
            engine: ChecksumEngine::new(buffer_size).with_progress_interval(progress_interval),
            buffer_size: buffer_size.max(1),
            progress_interval: progress_interval.max(1),
        }
    }

    /// Destination directory
    pub fn dest(&self) -> &Path {
        &self.dest
    }

    /// Run the protocol until the sender's last file is stored
    pub fn receive<S: Read + Write>(&self, stream: &mut S, monitor: &dyn TransferMonitor) -> Result<TransferSummary> {
        let started = Instant::now();
        let mut summary = TransferSummary::default();
        std::fs::create_dir_all(&self.dest).with_path(&self.dest)?;

        loop {
            let offer = self.read_header(stream)?;
            if offer.header_type != HeaderType::Send {
                return Err(RendezvousError::protocol(format!("Expected SEND, got {:?}", offer.header_type)));
            }
            if offer.files_left == 0 || offer.parts_left == 0 {
                return Err(RendezvousError::protocol("SEND header with no files left"));
            }

            let file = offer.display_name();
            let target = self.dest.join(offer.relative_path()?);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).with_path(parent)?;
            }

            let (offset, state) = self.negotiate_offset(stream, &offer, &target, monitor)?;
            let state = self.write_file(stream, &offer, &target, offset, state, monitor)?;

            let actual = state.value();
            if actual != offer.checksum {
                return Err(RendezvousError::ChecksumMismatch {
                    file,
                    expected: offer.checksum,
                    actual,
                });
            }
            filetime::set_file_mtime(&target, FileTime::from_unix_time(offer.mod_time as i64, 0))
                .with_path(&target)?;

            let mut receipt = offer.reply(HeaderType::Received);
            receipt.files_left = offer.files_left - 1;
            receipt.parts_left = offer.parts_left - 1;
            receipt.bytes_received = offer.file_size;
            receipt.received_checksum = actual;
            receipt.write_to(stream)?;

            summary.files += 1;
            summary.bytes_transferred += offer.file_size - offset;
            summary.bytes_resumed += offset;
            tracing::info!(file = %file, size = offer.file_size, resumed = offset, "File received");
            monitor.emit(RvEvent::FileComplete {
                file,
                size: offer.file_size,
            });

            if receipt.files_left == 0 && receipt.parts_left == 0 {
                break;
            }
        }

        summary.elapsed = started.elapsed();
        Ok(summary)
    }

    fn read_header<S: Read>(&self, stream: &mut S) -> Result<FileTransferHeader> {
        let header = FileTransferHeader::read_from(stream)?;
        if header.cookie != self.cookie {
            return Err(RendezvousError::protocol(format!(
                "Header cookie {} does not match session {}",
                header.cookie, self.cookie
            )));
        }
        Ok(header)
    }

    /// Offer a resume when a shorter local copy exists, otherwise ACK
    fn negotiate_offset<S: Read + Write>(
        &self,
        stream: &mut S,
        offer: &FileTransferHeader,
        target: &Path,
        monitor: &dyn TransferMonitor,
    ) -> Result<(u64, FileChecksum)> {
        let local_len = match std::fs::metadata(target) {
            Ok(metadata) if metadata.is_file() => metadata.len(),
            _ => 0,
        };

        if local_len == 0 || local_len >= offer.file_size {
            let mut ack = offer.reply(HeaderType::Ack);
            ack.bytes_received = 0;
            ack.write_to(stream)?;
            return Ok((0, FileChecksum::new()));
        }

        let file = offer.display_name();
        let prefix = self.engine.compute(target, FileChecksum::new(), local_len, |p| {
            monitor.emit(RvEvent::Checksumming {
                file: file.clone(),
                done: p.done,
                total: p.total,
            });
            monitor.keep_going()
        })?;

        let mut resume = offer.reply(HeaderType::Resume);
        resume.bytes_received = local_len;
        resume.received_checksum = prefix.value();
        resume.write_to(stream)?;
        tracing::debug!(file = %file, have = local_len, "Asked to resume");

        let confirm = self.read_header(stream)?;
        if confirm.header_type != HeaderType::ResumeSend {
            return Err(RendezvousError::protocol(format!(
                "Expected RESUME_SEND, got {:?}",
                confirm.header_type
            )));
        }
        match confirm.bytes_received {
            0 => Ok((0, FileChecksum::new())),
            n if n == local_len => Ok((n, prefix)),
            n => Err(RendezvousError::protocol(format!(
                "Sender resumes at {} but we hold {} bytes",
                n, local_len
            ))),
        }
    }

    fn write_file<R: Read>(
        &self,
        stream: &mut R,
        offer: &FileTransferHeader,
        target: &Path,
        offset: u64,
        mut state: FileChecksum,
        monitor: &dyn TransferMonitor,
    ) -> Result<FileChecksum> {
        let file = if offset == 0 {
            File::create(target).with_path(target)?
        } else {
            let mut file = OpenOptions::new().write(true).open(target).with_path(target)?;
            file.set_len(offset).with_path(target)?;
            file.seek(SeekFrom::Start(offset)).with_path(target)?;
            file
        };
        let mut writer = BufWriter::with_capacity(self.buffer_size, file);

        let name = offer.display_name();
        let remaining = offer.file_size - offset;
        let mut buffer = vec![0u8; self.buffer_size];
        let mut received = 0u64;
        let mut next_report = self.progress_interval;

        while received < remaining {
            if monitor.is_stopped() {
                return Err(RendezvousError::Cancelled);
            }
            let want = (remaining - received).min(buffer.len() as u64) as usize;
            let n = stream
                .read(&mut buffer[..want])
                .map_err(|e| RendezvousError::connection("peer", e))?;
            if n == 0 {
                return Err(RendezvousError::connection(
                    "peer",
                    std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("stream ended after {} of {} bytes", offset + received, offer.file_size),
                    ),
                ));
            }
            state.update(&buffer[..n]);
            writer.write_all(&buffer[..n]).with_path(target)?;
            received += n as u64;

            if received >= next_report || received == remaining {
                next_report = received + self.progress_interval;
                monitor.emit(RvEvent::TransferringFile {
                    file: name.clone(),
                    transferred: offset + received,
                    total: offer.file_size,
                });
            }
        }

        writer.flush().with_path(target)?;
        Ok(state)
    }
}
