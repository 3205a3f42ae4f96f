use async_trait::async_trait;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::sync::Arc;
use tokio::net::TcpSocket;
use tracing::trace;

use crate::common::{IOStream, dns::DnsConfig, set_keepalive};

pub type BoxedStream = Box<dyn IOStream>;

/// Opens raw outbound transports. Resolution strategies are layered on top.
#[async_trait]
pub trait TcpDialer: Send + Sync + 'static {
    async fn connect(&self, host: &str, port: u16) -> IoResult<BoxedStream>;
}

pub struct TokioTcpDialer {
    dns: Arc<DnsConfig>,
    keepalive: bool,
}

impl TokioTcpDialer {
    pub fn new(dns: Arc<DnsConfig>, keepalive: bool) -> Self {
        Self { dns, keepalive }
    }
}

#[async_trait]
impl TcpDialer for TokioTcpDialer {
    async fn connect(&self, host: &str, port: u16) -> IoResult<BoxedStream> {
        let remote = self
            .dns
            .lookup_host(host, port)
            .await
            .map_err(|e| IoError::new(ErrorKind::NotFound, e.to_string()))?;
        trace!("{}:{} resolved to {}", host, port, remote);

        let socket = if remote.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        let stream = socket.connect(remote).await?;
        stream.set_nodelay(true)?;
        if self.keepalive {
            set_keepalive(&stream)?;
        }
        Ok(Box::new(stream))
    }
}
