//! Outbound connection resolution.
//!
//! A [`Resolver`] tries the configured strategies one at a time, each bounded
//! by the connect timeout, and hands back the first live stream.

use std::{fmt::Display, io::Error as IoError, net::Ipv6Addr, sync::Arc, time::Duration};

use easy_error::{Error, bail};

use tracing::debug;

use crate::common::{
    dialers::{BoxedStream, TcpDialer},
    dns::DnsConfig,
    socks::ConnectError,
};

pub mod direct;
pub mod socks;

pub use direct::RelayEndpoint;
pub use socks::Socks5Endpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    Direct,
    Socks5,
    Nat64,
    Relay,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Socks5 => "socks5",
            Self::Nat64 => "nat64",
            Self::Relay => "relay",
        }
    }
}

impl Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("all {0} connection attempts failed")]
    AllAttemptsFailed(usize),
}

#[derive(Debug, thiserror::Error)]
pub enum AttemptError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Io(#[from] IoError),
    #[error(transparent)]
    Socks(#[from] ConnectError),
    #[error("{0}")]
    Unavailable(String),
}

/// Process wide fallback configuration, read-only once the server runs.
#[derive(Debug, Clone, Default)]
pub struct ProxyChain {
    pub socks5: Option<Socks5Endpoint>,
    pub relay: Option<RelayEndpoint>,
    pub nat64: Option<Ipv6Addr>,
    pub prefer_socks5: bool,
}

impl ProxyChain {
    /// Snapshot of the mutable part of the policy, owned by one session.
    pub fn session_policy(&self) -> SessionPolicy {
        SessionPolicy {
            prefer_socks5: self.prefer_socks5 && self.socks5.is_some(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    pub prefer_socks5: bool,
}

pub struct Outbound {
    pub stream: BoxedStream,
    pub strategy: Strategy,
}

pub struct Resolver {
    chain: Arc<ProxyChain>,
    dialer: Arc<dyn TcpDialer>,
    dns: Arc<DnsConfig>,
    connect_timeout: Duration,
}

impl Resolver {
    pub fn new(
        chain: Arc<ProxyChain>,
        dialer: Arc<dyn TcpDialer>,
        dns: Arc<DnsConfig>,
        connect_timeout: Duration,
    ) -> Result<Self, Error> {
        if connect_timeout.is_zero() {
            bail!("connect timeout must be positive");
        }
        Ok(Self {
            chain,
            dialer,
            dns,
            connect_timeout,
        })
    }

    pub fn chain(&self) -> &ProxyChain {
        &self.chain
    }

    /// Attempts, in order: SOCKS5 when the session prefers it, then direct,
    /// SOCKS5, NAT64 and the static relay. A failed preferred SOCKS5 attempt
    /// clears `policy.prefer_socks5` and is not repeated in the same pass.
    pub async fn resolve(
        &self,
        host: &str,
        port: u16,
        policy: &mut SessionPolicy,
    ) -> Result<Outbound, ResolveError> {
        let mut attempts = 0;
        let mut socks_tried = false;
        if policy.prefer_socks5 && self.chain.socks5.is_some() {
            attempts += 1;
            socks_tried = true;
            match self.attempt(Strategy::Socks5, host, port).await {
                Ok(stream) => {
                    return Ok(Outbound {
                        stream,
                        strategy: Strategy::Socks5,
                    });
                }
                Err(_) => {
                    debug!("preferred socks5 failed, downgrading session to ordered fallback");
                    policy.prefer_socks5 = false;
                }
            }
        }

        for strategy in self.fallback_order() {
            if strategy == Strategy::Socks5 && socks_tried {
                continue;
            }
            attempts += 1;
            if let Ok(stream) = self.attempt(strategy, host, port).await {
                return Ok(Outbound { stream, strategy });
            }
        }
        Err(ResolveError::AllAttemptsFailed(attempts))
    }

    fn fallback_order(&self) -> Vec<Strategy> {
        let mut ret = vec![Strategy::Direct];
        if self.chain.socks5.is_some() {
            ret.push(Strategy::Socks5);
        }
        if self.chain.nat64.is_some() {
            ret.push(Strategy::Nat64);
        }
        if self.chain.relay.is_some() {
            ret.push(Strategy::Relay);
        }
        ret
    }

    async fn attempt(
        &self,
        strategy: Strategy,
        host: &str,
        port: u16,
    ) -> Result<BoxedStream, AttemptError> {
        // a timed out attempt is dropped here, closing any half open socket
        let ret = tokio::time::timeout(self.connect_timeout, self.dial(strategy, host, port))
            .await
            .unwrap_or(Err(AttemptError::Timeout(self.connect_timeout)));
        match &ret {
            Ok(_) => debug!("{} connected to {}:{}", strategy, host, port),
            Err(e) => debug!("{} failed for {}:{}: {}", strategy, host, port, e),
        }
        #[cfg(feature = "metrics")]
        crate::metrics::CONNECT_ATTEMPTS
            .with_label_values(&[strategy.as_str(), if ret.is_ok() { "ok" } else { "error" }])
            .inc();
        ret
    }

    async fn dial(
        &self,
        strategy: Strategy,
        host: &str,
        port: u16,
    ) -> Result<BoxedStream, AttemptError> {
        let dialer = self.dialer.as_ref();
        match strategy {
            Strategy::Direct => Ok(dialer.connect(host, port).await?),
            Strategy::Socks5 => match &self.chain.socks5 {
                Some(endpoint) => Ok(socks::connect(dialer, endpoint, host, port).await?),
                None => Err(AttemptError::Unavailable("no socks5 endpoint".into())),
            },
            Strategy::Nat64 => match self.chain.nat64 {
                Some(prefix) => direct::connect_nat64(dialer, &self.dns, prefix, host, port).await,
                None => Err(AttemptError::Unavailable("no nat64 prefix".into())),
            },
            Strategy::Relay => match &self.chain.relay {
                Some(relay) => Ok(direct::connect_relay(dialer, relay, port).await?),
                None => Err(AttemptError::Unavailable("no relay endpoint".into())),
            },
        }
    }
}

/// Splits `host[:port]`, accepting bracketed IPv6 literals.
pub(crate) fn split_host_port(s: &str) -> Result<(String, Option<u16>), Error> {
    let s = s.trim();
    let (host, port) = if let Some(rest) = s.strip_prefix('[') {
        let Some((host, tail)) = rest.split_once(']') else {
            bail!("unterminated ipv6 literal: {}", s);
        };
        match tail.strip_prefix(':') {
            Some(port) => (host, Some(port)),
            None if tail.is_empty() => (host, None),
            None => bail!("bad address: {}", s),
        }
    } else if s.matches(':').count() == 1 {
        let (host, port) = s.split_once(':').unwrap_or((s, ""));
        (host, Some(port))
    } else {
        (s, None)
    };
    if host.is_empty() {
        bail!("missing host: {}", s);
    }
    let port = match port {
        Some(p) => Some(
            p.parse::<u16>()
                .map_err(|_| easy_error::err_msg(format!("bad port in {}", s)))?,
        ),
        None => None,
    };
    Ok((host.to_string(), port))
}
