//! Controllers that run the transfer protocol over an established stream

use super::{FileReceiver, FileSender, TransferSummary};
use crate::error::{Result, RendezvousError};
use crate::rendezvous::{ControlSignal, Controller, ControllerContext, ControllerKind, ControllerResult, RvEvent};
use crate::stream::ByteStream;

/// Take the stream a strategy produced
fn take_stream(previous: Option<ControllerResult>, signal: &ControlSignal) -> Result<ByteStream> {
    match previous {
        Some(ControllerResult::Connected(stream)) => {
            let canceller = stream
                .canceller()
                .map_err(|e| RendezvousError::connection(stream.peer_addr(), e))?;
            signal.attach(canceller);
            Ok(stream)
        }
        _ => Err(RendezvousError::protocol("Transfer phase started without a stream")),
    }
}

fn finish(kind: ControllerKind, signal: &ControlSignal, result: Result<TransferSummary>) -> ControllerResult {
    match result {
        Ok(summary) => ControllerResult::Completed(summary),
        Err(e) => {
            let e = if signal.is_stopped() { RendezvousError::Cancelled } else { e };
            ControllerResult::Failed(RvEvent::failed(kind, e))
        }
    }
}

/// Sends the outgoing batch
#[derive(Debug)]
pub struct SendController {
    sender: FileSender,
    signal: ControlSignal,
}

impl SendController {
    /// Wrap a configured sender
    pub fn new(sender: FileSender) -> Self {
        Self {
            sender,
            signal: ControlSignal::new(),
        }
    }
}

impl Controller for SendController {
    fn kind(&self) -> ControllerKind {
        ControllerKind::Sender
    }

    fn signal(&self) -> &ControlSignal {
        &self.signal
    }

    fn run(&self, ctx: &ControllerContext, previous: Option<ControllerResult>) -> ControllerResult {
        let result = take_stream(previous, &self.signal).and_then(|mut stream| {
            tracing::info!(peer = %ctx.peer(), remote = %stream.peer_addr(), "Sending files");
            self.sender.send(&mut stream, &ctx.monitor(&self.signal))
        });
        finish(self.kind(), &self.signal, result)
    }
}

/// Stores the incoming batch
#[derive(Debug)]
pub struct ReceiveController {
    receiver: FileReceiver,
    signal: ControlSignal,
}

impl ReceiveController {
    /// Wrap a configured receiver
    pub fn new(receiver: FileReceiver) -> Self {
        Self {
            receiver,
            signal: ControlSignal::new(),
        }
    }
}

impl Controller for ReceiveController {
    fn kind(&self) -> ControllerKind {
        ControllerKind::Receiver
    }

    fn signal(&self) -> &ControlSignal {
        &self.signal
    }

    fn run(&self, ctx: &ControllerContext, previous: Option<ControllerResult>) -> ControllerResult {
        let result = take_stream(previous, &self.signal).and_then(|mut stream| {
            tracing::info!(
                peer = %ctx.peer(),
                remote = %stream.peer_addr(),
                dest = %self.receiver.dest().display(),
                "Receiving files"
            );
            self.receiver.receive(&mut stream, &ctx.monitor(&self.signal))
        });
        finish(self.kind(), &self.signal, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RendezvousConfig;
    use crate::control::SessionId;
    use crate::rendezvous::test_support::{context, RecordingLink};
    use crate::transfer::test_support::socket_pair;
    use crate::transfer::TransferItem;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn test_without_stream_fails() {
        let ctx = context(RendezvousConfig::default(), None, Arc::new(RecordingLink::default()));
        let controller = SendController::new(FileSender::new(Arc::new(Vec::new()), SessionId(7), 1024, 1024));
        assert!(matches!(controller.run(&ctx, None), ControllerResult::Failed(_)));
    }

    #[test]
    fn test_phase_controllers_complete() {
        let src = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let path = src.path().join("data.bin");
        std::fs::write(&path, vec![42u8; 70_000]).unwrap();
        let items = Arc::new(vec![TransferItem::from_path(&path).unwrap()]);

        let (a, b) = socket_pair();
        let send = SendController::new(FileSender::new(items, SessionId(7), 8192, 16_384));
        let recv = ReceiveController::new(FileReceiver::new(dest.path(), SessionId(7), 8192, 16_384));

        let link = Arc::new(RecordingLink::default());
        let send_ctx = context(RendezvousConfig::default(), None, Arc::new(RecordingLink::default()));
        let recv_ctx = context(RendezvousConfig::default(), None, Arc::clone(&link));

        let sending = thread::spawn(move || {
            send.run(&send_ctx, Some(ControllerResult::Connected(ByteStream::new(a).unwrap())))
        });
        let received = recv.run(&recv_ctx, Some(ControllerResult::Connected(ByteStream::new(b).unwrap())));

        assert!(matches!(sending.join().unwrap(), ControllerResult::Completed(_)));
        match received {
            ControllerResult::Completed(summary) => assert_eq!(summary.bytes_transferred, 70_000),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(std::fs::read(dest.path().join("data.bin")).unwrap().len(), 70_000);
        assert!(link
            .events
            .lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, RvEvent::TransferringFile { .. })));
    }
}
