//! Direct connection to the peer's LAN or Internet address

use crate::error::{Result, RendezvousError};
use crate::rendezvous::{
    ControlSignal, Controller, ControllerContext, ControllerKind, ControllerResult, RvEvent, StrategyKind,
};
use crate::stream::ByteStream;

/// Connects straight to an address from the peer's descriptor
#[derive(Debug)]
pub struct DirectController {
    strategy: StrategyKind,
    signal: ControlSignal,
}

impl DirectController {
    /// Connect to the peer's LAN address
    pub fn lan() -> Self {
        Self {
            strategy: StrategyKind::DirectLan,
            signal: ControlSignal::new(),
        }
    }

    /// Connect to the peer's Internet address
    pub fn internet() -> Self {
        Self {
            strategy: StrategyKind::DirectInternet,
            signal: ControlSignal::new(),
        }
    }

    fn connect(&self, ctx: &ControllerContext) -> Result<ByteStream> {
        let info = ctx.info();
        let target = match self.strategy {
            StrategyKind::DirectLan => info.and_then(|i| i.lan_target()),
            _ => info.and_then(|i| i.internet_target()),
        }
        .ok_or_else(|| RendezvousError::protocol(format!("Peer offered no address for {}", self.strategy)))?;

        ctx.emit(RvEvent::Connecting {
            strategy: self.strategy,
            target: Some(target),
        });
        tracing::debug!(peer = %ctx.peer(), strategy = %self.strategy, %target, "Connecting");

        let socket = ctx
            .factory()
            .connect(target, ctx.deadline())
            .map_err(|e| RendezvousError::connection(target, e))?;
        self.signal.check()?;

        let stream = ByteStream::new(socket)?;
        if !self.signal.settle() {
            return Err(RendezvousError::Cancelled);
        }
        Ok(stream)
    }
}

impl Controller for DirectController {
    fn kind(&self) -> ControllerKind {
        ControllerKind::Strategy(self.strategy)
    }

    fn signal(&self) -> &ControlSignal {
        &self.signal
    }

    fn run(&self, ctx: &ControllerContext, _previous: Option<ControllerResult>) -> ControllerResult {
        match self.connect(ctx) {
            Ok(stream) => ControllerResult::Connected(stream),
            Err(e) => ControllerResult::Failed(RvEvent::failed(self.kind(), e)),
        }
    }
}
