use std::{
    io::Result as IoResult,
    net::{Ipv4Addr, Ipv6Addr},
    str::FromStr,
};

use easy_error::Error;
use serde::{Deserialize, Serialize};

use super::{AttemptError, split_host_port};
use crate::common::{
    dialers::{BoxedStream, TcpDialer},
    dns::DnsConfig,
};

/// Fixed intermediate host. Without an explicit port the session's
/// destination port is used.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(try_from = "String", into = "String")]
pub struct RelayEndpoint {
    pub host: String,
    pub port: Option<u16>,
}

impl FromStr for RelayEndpoint {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = split_host_port(s)?;
        Ok(Self { host, port })
    }
}

impl TryFrom<String> for RelayEndpoint {
    type Error = Error;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<RelayEndpoint> for String {
    fn from(r: RelayEndpoint) -> String {
        let host = if r.host.contains(':') {
            format!("[{}]", r.host)
        } else {
            r.host
        };
        match r.port {
            Some(port) => format!("{}:{}", host, port),
            None => host,
        }
    }
}

pub async fn connect_relay(
    dialer: &dyn TcpDialer,
    relay: &RelayEndpoint,
    port: u16,
) -> IoResult<BoxedStream> {
    dialer
        .connect(&relay.host, relay.port.unwrap_or(port))
        .await
}

/// Embeds `v4` in the low 32 bits of a /96 translation prefix.
pub fn synthesize_nat64(prefix: Ipv6Addr, v4: Ipv4Addr) -> Ipv6Addr {
    let mut octets = prefix.octets();
    octets[12..].copy_from_slice(&v4.octets());
    Ipv6Addr::from(octets)
}

pub async fn connect_nat64(
    dialer: &dyn TcpDialer,
    dns: &DnsConfig,
    prefix: Ipv6Addr,
    host: &str,
    port: u16,
) -> Result<BoxedStream, AttemptError> {
    if host.parse::<Ipv6Addr>().is_ok() {
        return Err(AttemptError::Unavailable(
            "nat64 needs an ipv4 reachable destination".into(),
        ));
    }
    let v4 = dns
        .lookup_v4(host)
        .await
        .map_err(|e| AttemptError::Unavailable(e.to_string()))?;
    let addr = synthesize_nat64(prefix, v4);
    Ok(dialer.connect(&addr.to_string(), port).await?)
}
