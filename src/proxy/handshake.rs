//! Client side of the proxy init handshake
//!
//! These are plain functions over any `Read + Write` so both proxy strategies
//! (and the tests) share them. Blocking reads are aborted by shutting the
//! socket down from another thread.

use super::packet::ProxyPacket;
use crate::control::SessionId;
use crate::error::{Result, RendezvousError};
use std::io::{Read, Write};
use std::net::Ipv4Addr;

/// Relay allocated by the proxy for a hosting client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayAddress {
    /// Address the joining party should connect to
    pub ip: Ipv4Addr,
    /// Relay port identifying the relay on that proxy
    pub port: u16,
}

/// Announce send-intent and wait for the relay acknowledgement
pub fn host_relay<S: Read + Write>(
    stream: &mut S,
    screen_name: &str,
    cookie: SessionId,
) -> Result<RelayAddress> {
    ProxyPacket::InitSend {
        screen_name: screen_name.to_string(),
        cookie,
    }
    .write_to(stream)?;
    tracing::debug!(%cookie, "Sent proxy INIT_SEND");

    match ProxyPacket::read_from(stream)? {
        ProxyPacket::Ack { port, ip } => {
            tracing::debug!(%cookie, %ip, port, "Proxy relay allocated");
            Ok(RelayAddress { ip, port })
        }
        other => Err(unexpected(other, "ACK")),
    }
}

/// Announce receive-intent for an existing relay and wait until it is ready
pub fn join_relay<S: Read + Write>(
    stream: &mut S,
    screen_name: &str,
    port: u16,
    cookie: SessionId,
) -> Result<()> {
    ProxyPacket::InitRecv {
        screen_name: screen_name.to_string(),
        port,
        cookie,
    }
    .write_to(stream)?;
    tracing::debug!(%cookie, port, "Sent proxy INIT_RECV");

    await_ready(stream)
}

/// Wait for READY; after it the stream carries raw peer bytes
pub fn await_ready<S: Read>(stream: &mut S) -> Result<()> {
    match ProxyPacket::read_from(stream)? {
        ProxyPacket::Ready => Ok(()),
        other => Err(unexpected(other, "READY")),
    }
}

fn unexpected(packet: ProxyPacket, wanted: &str) -> RendezvousError {
    match packet {
        ProxyPacket::Error { code } => RendezvousError::ProxyRefused(code),
        other => RendezvousError::protocol(format!(
            "Expected proxy {} but got {:?}",
            wanted,
            other.command()
        )),
    }
}
