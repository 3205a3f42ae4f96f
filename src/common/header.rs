//! Tunnel request header codec.
//!
//! Layout of the first tunnel message:
//!
//! ```text
//! [version:1][identifier:16][optlen:1][options:optlen][cmd:1][port:2][atyp:1][addr:..][payload..]
//! ```

use bytes::Bytes;
use std::{
    fmt::{Display, Write},
    net::Ipv4Addr,
};
use thiserror::Error;

pub const CMD_TCP: u8 = 1u8;
pub const CMD_UDP: u8 = 2u8;
pub const ATYP_INET4: u8 = 1u8;
pub const ATYP_DOMAIN: u8 = 2u8;
pub const ATYP_INET6: u8 = 3u8;

/// Shortest first message that can reach the address type field.
pub const MIN_HEADER_LEN: usize = 24;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated request header")]
    Truncated,
    #[error("unsupported command: {0}")]
    UnsupportedCommand(u8),
    #[error("unsupported address type: {0}")]
    UnsupportedAddressType(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Inet4(Ipv4Addr),
    Domain(String),
    /// Kept as raw groups so the textual form is never compressed.
    Inet6([u16; 8]),
}

impl Address {
    pub fn address_type(&self) -> u8 {
        match self {
            Self::Inet4(_) => ATYP_INET4,
            Self::Domain(_) => ATYP_DOMAIN,
            Self::Inet6(_) => ATYP_INET6,
        }
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inet4(ip) => write!(f, "{}", ip),
            Self::Domain(domain) => f.write_str(domain),
            Self::Inet6(groups) => {
                for (i, group) in groups.iter().enumerate() {
                    if i > 0 {
                        f.write_char(':')?;
                    }
                    write!(f, "{:x}", group)?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub version: u8,
    pub identifier: [u8; 16],
    pub options_len: u8,
    pub command: Command,
    pub port: u16,
    pub address: Address,
    pub payload: Bytes,
}

impl RequestHeader {
    pub fn decode(buf: Bytes) -> Result<Self, DecodeError> {
        if buf.len() < MIN_HEADER_LEN {
            return Err(DecodeError::Truncated);
        }
        let mut reader = HeaderReader::new(&buf);
        let version = reader.read_u8()?;
        let mut identifier = [0u8; 16];
        identifier.copy_from_slice(reader.read_bytes(16)?);
        let options_len = reader.read_u8()?;
        reader.skip(options_len as usize)?;
        let command = match reader.read_u8()? {
            CMD_TCP => Command::Tcp,
            CMD_UDP => Command::Udp,
            x => return Err(DecodeError::UnsupportedCommand(x)),
        };
        let port = reader.read_u16()?;
        let address = match reader.read_u8()? {
            ATYP_INET4 => {
                let octets = reader.read_bytes(4)?;
                Address::Inet4(Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]))
            }
            ATYP_DOMAIN => {
                let len = reader.read_u8()? as usize;
                let domain = reader.read_bytes(len)?;
                Address::Domain(String::from_utf8_lossy(domain).into_owned())
            }
            ATYP_INET6 => {
                let mut groups = [0u16; 8];
                for group in groups.iter_mut() {
                    *group = reader.read_u16()?;
                }
                Address::Inet6(groups)
            }
            x => return Err(DecodeError::UnsupportedAddressType(x)),
        };
        let payload = buf.slice(reader.position()..);
        Ok(Self {
            version,
            identifier,
            options_len,
            command,
            port,
            address,
            payload,
        })
    }

    /// Textual destination host handed to the dialers.
    pub fn host(&self) -> String {
        self.address.to_string()
    }

    /// Two byte prefix of the first message sent back on the tunnel.
    pub fn ack(&self) -> [u8; 2] {
        [self.version, 0]
    }
}

struct HeaderReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> HeaderReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if n > self.remaining() {
            return Err(DecodeError::Truncated);
        }
        let ret = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(ret)
    }

    fn skip(&mut self, n: usize) -> Result<(), DecodeError> {
        self.read_bytes(n).map(|_| ())
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }
}
