use std::sync::Arc;

use bytes::Bytes;
use easy_error::{Error, ResultExt};
use tracing::{debug, info, trace, warn};

use crate::{
    common::{
        dialers::TokioTcpDialer,
        doh::{DohClient, HttpsDohClient},
        frames::{MessageReader, MessageWriter},
        header::{Command, DecodeError, RequestHeader},
    },
    config::{Config, IoParams},
    connectors::{ResolveError, Resolver},
    copy::copy_bidi,
    dns_relay::relay_dns,
};

pub const DNS_PORT: u16 = 53;

/// Everything a session needs, shared read-only by all of them.
pub struct Gateway {
    identifier: [u8; 16],
    resolver: Resolver,
    doh: Arc<dyn DohClient>,
    io_params: IoParams,
}

impl Gateway {
    pub fn new(
        identifier: [u8; 16],
        resolver: Resolver,
        doh: Arc<dyn DohClient>,
        io_params: IoParams,
    ) -> Self {
        Self {
            identifier,
            resolver,
            doh,
            io_params,
        }
    }

    pub fn from_config(cfg: &Config) -> Result<Self, Error> {
        let mut dns = cfg.dns.clone();
        dns.init().context("init dns resolver")?;
        let dns = Arc::new(dns);
        let dialer = Arc::new(TokioTcpDialer::new(dns.clone(), true));
        let resolver = Resolver::new(
            Arc::new(cfg.proxy_chain()),
            dialer,
            dns,
            cfg.timeouts.connect(),
        )?;
        let doh = Arc::new(HttpsDohClient::new(&cfg.doh)?);
        Ok(Self::new(
            cfg.identifier(),
            resolver,
            doh,
            cfg.io_params.clone(),
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingHeader,
    Authenticating,
    Resolving,
    Streaming,
    DnsRelaying,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("tunnel closed before a request header arrived")]
    NoHeader,
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("identifier mismatch")]
    AuthFailed,
    #[error("udp is only relayed to port 53, requested {0}")]
    UnsupportedUdpPort(u16),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Relay(#[from] Error),
}

impl SessionError {
    /// Whether the session ended before any byte went back to the peer.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, Self::Relay(_))
    }

    fn reason(&self) -> &'static str {
        match self {
            Self::NoHeader => "no_header",
            Self::Decode(_) => "decode",
            Self::AuthFailed => "auth",
            Self::UnsupportedUdpPort(_) => "udp_port",
            Self::Resolve(_) => "resolve",
            Self::Relay(_) => "relay",
        }
    }
}

/// Takes over an accepted tunnel for the rest of its life.
///
/// Rejected requests are dropped without writing anything back, so a prober
/// cannot tell a bad identifier from an unreachable destination.
pub async fn handle_tunnel(
    mut reader: Box<dyn MessageReader>,
    mut writer: Box<dyn MessageWriter>,
    early: Option<Bytes>,
    gateway: Arc<Gateway>,
) {
    let mut session = Session::new();
    let ret = session
        .drive(reader.as_mut(), writer.as_mut(), early, &gateway)
        .await;
    match ret {
        Ok(()) => debug!("session finished"),
        Err(e) if e.is_rejection() => {
            debug!("session dropped ({}) in {:?}: {}", e.reason(), session.state, e);
            #[cfg(feature = "metrics")]
            crate::metrics::SESSIONS_REJECTED
                .with_label_values(&[e.reason()])
                .inc();
        }
        Err(e) => warn!("session failed in {:?}: {}", session.state, e),
    }
    session.transition(SessionState::Closed);
}

struct Session {
    state: SessionState,
}

impl Session {
    fn new() -> Self {
        Self {
            state: SessionState::AwaitingHeader,
        }
    }

    fn transition(&mut self, next: SessionState) {
        trace!("{:?} -> {:?}", self.state, next);
        self.state = next;
    }

    async fn drive(
        &mut self,
        reader: &mut dyn MessageReader,
        writer: &mut dyn MessageWriter,
        early: Option<Bytes>,
        gateway: &Gateway,
    ) -> Result<(), SessionError> {
        let first = match early.filter(|b| !b.is_empty()) {
            Some(early) => early,
            None => reader
                .recv()
                .await
                .context("read request header")?
                .ok_or(SessionError::NoHeader)?,
        };
        let header = RequestHeader::decode(first)?;

        self.transition(SessionState::Authenticating);
        if header.identifier != gateway.identifier {
            return Err(SessionError::AuthFailed);
        }
        #[cfg(feature = "metrics")]
        crate::metrics::SESSIONS_ACCEPTED.inc();

        let ack = header.ack();
        let host = header.host();
        match header.command {
            Command::Udp => {
                if header.port != DNS_PORT {
                    return Err(SessionError::UnsupportedUdpPort(header.port));
                }
                self.transition(SessionState::DnsRelaying);
                info!("dns relay for {}:{}", host, header.port);
                relay_dns(reader, writer, header.payload, ack, gateway.doh.as_ref()).await?;
            }
            Command::Tcp => {
                self.transition(SessionState::Resolving);
                let mut policy = gateway.resolver.chain().session_policy();
                let outbound = gateway
                    .resolver
                    .resolve(&host, header.port, &mut policy)
                    .await?;
                info!("connected {}:{} via {}", host, header.port, outbound.strategy);

                self.transition(SessionState::Streaming);
                copy_bidi(
                    reader,
                    writer,
                    outbound.stream,
                    header.payload,
                    ack,
                    &gateway.io_params,
                )
                .await?;
            }
        }
        Ok(())
    }
}
