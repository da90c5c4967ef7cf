//! Rendezvous proxy packet codec
//!
//! Every packet starts with a fixed header:
//!
//! | Field    | Size | Notes                          |
//! |----------|------|--------------------------------|
//! | length   | 2    | bytes following this field     |
//! | version  | 2    | [`PROXY_VERSION`]              |
//! | command  | 2    | see [`ProxyCommand`]           |
//! | reserved | 4    | zero                           |
//! | flags    | 2    | zero                           |
//!
//! All integers are big-endian.

use crate::control::SessionId;
use crate::error::{Result, RendezvousError};
use std::io::{Read, Write};
use std::net::Ipv4Addr;

/// Protocol version carried in every packet
pub const PROXY_VERSION: u16 = 0x044a;

/// Header bytes after the length field
const HEADER_TAIL: usize = 10;

/// Upper bound on a packet body; real packets are tiny
const MAX_BODY: usize = 1024;

/// Malformed or unexpected request
pub const ERROR_BAD_REQUEST: u16 = 0x000d;
/// No relay is waiting under the given port and cookie
pub const ERROR_NO_SUCH_RELAY: u16 = 0x001a;
/// Client spoke another protocol version
pub const ERROR_BAD_VERSION: u16 = 0x0022;

/// Proxy packet command codes
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyCommand {
    /// Request refused
    Error = 1,
    /// Host a new relay (send-intent)
    InitSend = 2,
    /// Relay created
    Ack = 3,
    /// Join an existing relay (receive-intent)
    InitRecv = 4,
    /// Both ends are attached; raw bytes follow
    Ready = 5,
}

impl ProxyCommand {
    fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::Error),
            2 => Some(Self::InitSend),
            3 => Some(Self::Ack),
            4 => Some(Self::InitRecv),
            5 => Some(Self::Ready),
            _ => None,
        }
    }
}

/// A decoded proxy packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyPacket {
    /// Request refused with an error code
    Error { code: u16 },
    /// Host a relay for `cookie`
    InitSend { screen_name: String, cookie: SessionId },
    /// Relay is listening at `ip`, identified by `port`
    Ack { port: u16, ip: Ipv4Addr },
    /// Join the relay `port` hosted for `cookie`
    InitRecv {
        screen_name: String,
        port: u16,
        cookie: SessionId,
    },
    /// Relay complete
    Ready,
}

impl ProxyPacket {
    /// Command code of this packet
    pub fn command(&self) -> ProxyCommand {
        match self {
            Self::Error { .. } => ProxyCommand::Error,
            Self::InitSend { .. } => ProxyCommand::InitSend,
            Self::Ack { .. } => ProxyCommand::Ack,
            Self::InitRecv { .. } => ProxyCommand::InitRecv,
            Self::Ready => ProxyCommand::Ready,
        }
    }

    /// Serialize the packet
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        match self {
            Self::Error { code } => body.extend_from_slice(&code.to_be_bytes()),
            Self::InitSend { screen_name, cookie } => {
                put_name(&mut body, screen_name)?;
                body.extend_from_slice(&cookie.0.to_be_bytes());
            }
            Self::Ack { port, ip } => {
                body.extend_from_slice(&port.to_be_bytes());
                body.extend_from_slice(&ip.octets());
            }
            Self::InitRecv {
                screen_name,
                port,
                cookie,
            } => {
                put_name(&mut body, screen_name)?;
                body.extend_from_slice(&port.to_be_bytes());
                body.extend_from_slice(&cookie.0.to_be_bytes());
            }
            Self::Ready => {}
        }

        let mut packet = Vec::with_capacity(2 + HEADER_TAIL + body.len());
        packet.extend_from_slice(&((HEADER_TAIL + body.len()) as u16).to_be_bytes());
        packet.extend_from_slice(&PROXY_VERSION.to_be_bytes());
        packet.extend_from_slice(&(self.command() as u16).to_be_bytes());
        packet.extend_from_slice(&0u32.to_be_bytes());
        packet.extend_from_slice(&0u16.to_be_bytes());
        packet.extend_from_slice(&body);
        Ok(packet)
    }

    /// Write the packet and flush
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let packet = self.encode()?;
        writer
            .write_all(&packet)
            .and_then(|_| writer.flush())
            .map_err(|e| RendezvousError::connection("proxy", e))
    }

    /// Read one packet
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut len_buf = [0u8; 2];
        reader
            .read_exact(&mut len_buf)
            .map_err(|e| RendezvousError::connection("proxy", e))?;
        let len = u16::from_be_bytes(len_buf) as usize;
        if !(HEADER_TAIL..=HEADER_TAIL + MAX_BODY).contains(&len) {
            return Err(RendezvousError::protocol(format!("Bad proxy packet length {}", len)));
        }

        let mut data = vec![0u8; len];
        reader
            .read_exact(&mut data)
            .map_err(|e| RendezvousError::connection("proxy", e))?;
        Self::decode(&data)
    }

    /// Decode a packet from the bytes following the length field
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor { data, pos: 0 };
        let version = cursor.u16()?;
        if version != PROXY_VERSION {
            return Err(RendezvousError::protocol(format!(
                "Unsupported proxy version {:#06x}",
                version
            )));
        }
        let command = cursor.u16()?;
        cursor.skip(6)?;

        let command = ProxyCommand::from_u16(command)
            .ok_or_else(|| RendezvousError::protocol(format!("Unknown proxy command {}", command)))?;

        let packet = match command {
            ProxyCommand::Error => Self::Error { code: cursor.u16()? },
            ProxyCommand::InitSend => Self::InitSend {
                screen_name: cursor.name()?,
                cookie: SessionId(cursor.u64()?),
            },
            ProxyCommand::Ack => {
                let port = cursor.u16()?;
                let octets = cursor.take(4)?;
                Self::Ack {
                    port,
                    ip: Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]),
                }
            }
            ProxyCommand::InitRecv => Self::InitRecv {
                screen_name: cursor.name()?,
                port: cursor.u16()?,
                cookie: SessionId(cursor.u64()?),
            },
            ProxyCommand::Ready => Self::Ready,
        };
        Ok(packet)
    }
}

fn put_name(body: &mut Vec<u8>, name: &str) -> Result<()> {
    let bytes = name.as_bytes();
    if bytes.len() > u8::MAX as usize {
        return Err(RendezvousError::protocol("Screen name longer than 255 bytes"));
    }
    body.push(bytes.len() as u8);
    body.extend_from_slice(bytes);
    Ok(())
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        if end > self.data.len() {
            return Err(RendezvousError::protocol("Truncated proxy packet"));
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(buf))
    }

    fn name(&mut self) -> Result<String> {
        let len = self.take(1)?[0] as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| RendezvousError::protocol("Screen name is not UTF-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_layout() {
        let packet = ProxyPacket::Ack {
            port: 0x1234,
            ip: Ipv4Addr::new(10, 1, 2, 3),
        };
        let bytes = packet.encode().unwrap();
        assert_eq!(
            bytes,
            vec![0x00, 0x10, 0x04, 0x4a, 0x00, 0x03, 0, 0, 0, 0, 0, 0, 0x12, 0x34, 10, 1, 2, 3]
        );
    }

    #[test]
    fn test_read_init_recv() {
        let packet = ProxyPacket::InitRecv {
            screen_name: "bob".to_string(),
            port: 7,
            cookie: SessionId(0xDEAD_BEEF),
        };
        let bytes = packet.encode().unwrap();
        let decoded = ProxyPacket::read_from(&mut bytes.as_slice()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_rejects_bad_version() {
        let mut bytes = ProxyPacket::Ready.encode().unwrap();
        bytes[3] = 0x4b;
        assert!(matches!(
            ProxyPacket::read_from(&mut bytes.as_slice()),
            Err(RendezvousError::Protocol(_))
        ));
    }

    #[test]
    fn test_rejects_truncated_body() {
        let mut bytes = ProxyPacket::InitSend {
            screen_name: "alice".to_string(),
            cookie: SessionId(1),
        }
        .encode()
        .unwrap();
        // Claim the original length but drop the cookie
        bytes.truncate(bytes.len() - 8);
        let declared = (bytes.len() - 2) as u16;
        bytes[..2].copy_from_slice(&declared.to_be_bytes());
        assert!(ProxyPacket::read_from(&mut bytes.as_slice()).is_err());
    }

    #[test]
    fn test_rejects_long_name() {
        let packet = ProxyPacket::InitSend {
            screen_name: "x".repeat(300),
            cookie: SessionId(1),
        };
        assert!(packet.encode().is_err());
    }
}
