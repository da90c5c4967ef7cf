//! Sending side of the resumable file transfer protocol

use super::{FileTransferHeader, HeaderType, TransferItem, TransferMonitor, TransferSummary};
use crate::checksum::{ChecksumEngine, EMPTY_CHECKSUM};
use crate::control::SessionId;
use crate::error::{IoResultExt, Result, RendezvousError};
use crate::rendezvous::RvEvent;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::time::Instant;

/// Offers a batch of files and streams them to the receiver
#[derive(Debug, Clone)]
pub struct FileSender {
    items: Arc<Vec<TransferItem>>,
    cookie: SessionId,
    engine: ChecksumEngine,
    buffer_size: usize,
    progress_interval: u64,
}

impl FileSender {
    /// Create a sender for `items`
    pub fn new(items: Arc<Vec<TransferItem>>, cookie: SessionId, buffer_size: usize, progress_interval: u64) -> Self {
        Self {
            items,
            cookie,
            engine: ChecksumEngine::new(buffer_size).with_progress_interval(progress_interval),
            buffer_size: buffer_size.max(1),
            progress_interval: progress_interval.max(1),
        }
    }

    /// Run the protocol to completion over `stream`
    pub fn send<S: Read + Write>(&self, stream: &mut S, monitor: &dyn TransferMonitor) -> Result<TransferSummary> {
        let started = Instant::now();
        let total_files = u16::try_from(self.items.len())
            .map_err(|_| RendezvousError::protocol("Too many files for one transfer"))?;
        let total_size: u64 = self.items.iter().map(TransferItem::size).sum();
        let mut summary = TransferSummary::default();

        for (index, item) in self.items.iter().enumerate() {
            let file = item.display_name();
            let checksum = item.checksum(&self.engine, |p| {
                monitor.emit(RvEvent::Checksumming {
                    file: file.clone(),
                    done: p.done,
                    total: p.total,
                });
                monitor.keep_going()
            })?;

            let mut offer = FileTransferHeader::new(HeaderType::Send, self.cookie);
            offer.files_left = total_files - index as u16;
            offer.total_files = total_files;
            offer.parts_left = 1;
            offer.total_parts = 1;
            offer.total_size = total_size;
            offer.file_size = item.size();
            offer.mod_time = item.mod_time();
            offer.checksum = checksum;
            offer.name = item.name().to_vec();
            offer.write_to(stream)?;
            tracing::debug!(file = %file, size = item.size(), files_left = offer.files_left, "Offered file");

            let reply = self.read_header(stream)?;
            let offset = match reply.header_type {
                HeaderType::Ack => 0,
                HeaderType::Resume => {
                    let offset = self.resume_offset(item, &reply, monitor)?;
                    let mut confirm = offer.reply(HeaderType::ResumeSend);
                    confirm.bytes_received = offset;
                    confirm.received_checksum = if offset > 0 { reply.received_checksum } else { EMPTY_CHECKSUM };
                    confirm.write_to(stream)?;
                    offset
                }
                other => {
                    return Err(RendezvousError::protocol(format!(
                        "Expected ACK or RESUME for '{}', got {:?}",
                        file, other
                    )))
                }
            };

            let sent = self.stream_file(stream, item, offset, monitor)?;

            let receipt = self.read_header(stream)?;
            if receipt.header_type != HeaderType::Received {
                return Err(RendezvousError::protocol(format!(
                    "Expected RECEIVED for '{}', got {:?}",
                    file, receipt.header_type
                )));
            }
            if receipt.received_checksum != checksum {
                return Err(RendezvousError::ChecksumMismatch {
                    file,
                    expected: checksum,
                    actual: receipt.received_checksum,
                });
            }
            if receipt.files_left != offer.files_left - 1 {
                return Err(RendezvousError::protocol(format!(
                    "Receiver reports {} files left, expected {}",
                    receipt.files_left,
                    offer.files_left - 1
                )));
            }

            summary.files += 1;
            summary.bytes_transferred += sent;
            summary.bytes_resumed += offset;
            tracing::info!(file = %file, sent, resumed = offset, "File sent");
            monitor.emit(RvEvent::FileComplete {
                file,
                size: item.size(),
            });
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

    /// Offset to stream from after the receiver asked to resume
    fn resume_offset(&self, item: &TransferItem, reply: &FileTransferHeader, monitor: &dyn TransferMonitor) -> Result<u64> {
        let have = reply.bytes_received;
        if have == 0 || have >= item.size() {
            tracing::debug!(file = %item.display_name(), have, "Resume offset unusable, restarting");
            return Ok(0);
        }

        let file = item.display_name();
        let ours = item.checksum_prefix(&self.engine, have, |p| {
            monitor.emit(RvEvent::Checksumming {
                file: file.clone(),
                done: p.done,
                total: p.total,
            });
            monitor.keep_going()
        })?;

        if ours == reply.received_checksum {
            tracing::info!(file = %file, offset = have, "Resuming transfer");
            Ok(have)
        } else {
            tracing::info!(
                file = %file,
                ours = format_args!("{:#010x}", ours),
                theirs = format_args!("{:#010x}", reply.received_checksum),
                "Partial file differs, restarting from zero"
            );
            Ok(0)
        }
    }

    fn stream_file<W: Write>(
        &self,
        stream: &mut W,
        item: &TransferItem,
        offset: u64,
        monitor: &dyn TransferMonitor,
    ) -> Result<u64> {
        let path = item.path();
        let file_name = item.display_name();
        let size = item.size();
        let remaining = size - offset;

        let mut file = File::open(path).with_path(path)?;
        file.seek(SeekFrom::Start(offset)).with_path(path)?;
        let mut reader = file.take(remaining);
        let mut buffer = vec![0u8; self.buffer_size];
        let mut sent = 0u64;
        let mut next_report = self.progress_interval;

        while sent < remaining {
            if monitor.is_stopped() {
                return Err(RendezvousError::Cancelled);
            }
            let n = reader.read(&mut buffer).with_path(path)?;
            if n == 0 {
                return Err(RendezvousError::io(
                    path,
                    std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("file shrank to {} bytes during transfer", offset + sent),
                    ),
                ));
            }
            stream
                .write_all(&buffer[..n])
                .map_err(|e| RendezvousError::connection("peer", e))?;
            sent += n as u64;

            if sent >= next_report || sent == remaining {
                next_report = sent + self.progress_interval;
                monitor.emit(RvEvent::TransferringFile {
                    file: file_name.clone(),
                    transferred: offset + sent,
                    total: size,
                });
            }
        }
        stream.flush().map_err(|e| RendezvousError::connection("peer", e))?;
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::test_support::{socket_pair, Recorder};
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn test_rejects_unexpected_reply() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, vec![1u8; 100]).unwrap();
        let items = Arc::new(vec![TransferItem::from_path(&path).unwrap()]);
        let sender = FileSender::new(items, SessionId(3), 32, 64);

        let (mut ours, mut theirs) = socket_pair();
        let peer = thread::spawn(move || {
            let offer = FileTransferHeader::read_from(&mut theirs).unwrap();
            assert_eq!(offer.header_type, HeaderType::Send);
            assert_eq!(offer.files_left, 1);
            offer.reply(HeaderType::Received).write_to(&mut theirs).unwrap();
        });

        let result = sender.send(&mut ours, &Recorder::default());
        assert!(matches!(result, Err(RendezvousError::Protocol(_))));
        peer.join().unwrap();
    }

    #[test]
    fn test_rejects_foreign_cookie() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, vec![1u8; 10]).unwrap();
        let items = Arc::new(vec![TransferItem::from_path(&path).unwrap()]);
        let sender = FileSender::new(items, SessionId(3), 32, 64);

        let (mut ours, mut theirs) = socket_pair();
        let peer = thread::spawn(move || {
            let offer = FileTransferHeader::read_from(&mut theirs).unwrap();
            let mut ack = offer.reply(HeaderType::Ack);
            ack.cookie = SessionId(4);
            ack.write_to(&mut theirs).unwrap();
        });

        assert!(sender.send(&mut ours, &Recorder::default()).is_err());
        peer.join().unwrap();
    }

    #[test]
    fn test_stops_when_cancelled() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, vec![9u8; 4096]).unwrap();
        let items = Arc::new(vec![TransferItem::from_path(&path).unwrap()]);
        let sender = FileSender::new(items, SessionId(3), 512, 512);

        let (mut ours, _theirs) = socket_pair();
        let monitor = Recorder::default();
        monitor.stop();
        assert!(matches!(
            sender.send(&mut ours, &monitor),
            Err(RendezvousError::Cancelled)
        ));
    }
}
