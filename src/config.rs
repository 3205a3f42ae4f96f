use std::{net::Ipv6Addr, time::Duration};

use easy_error::{Error, ResultExt, bail};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[cfg(feature = "metrics")]
use crate::metrics::MetricsConfig;
use crate::{
    common::{dns::DnsConfig, doh::DohConfig},
    connectors::{ProxyChain, RelayEndpoint, Socks5Endpoint},
};

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_bind")]
    pub bind: String,
    pub uuid: Uuid,
    pub socks5: Option<Socks5Endpoint>,
    #[serde(default)]
    pub global_socks5: bool,
    pub proxy_ip: Option<RelayEndpoint>,
    pub nat64: Option<Ipv6Addr>,
    #[serde(default)]
    pub dns: DnsConfig,
    #[serde(default)]
    pub doh: DohConfig,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub io_params: IoParams,
    #[cfg(feature = "metrics")]
    pub metrics: Option<MetricsConfig>,
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

impl Config {
    pub async fn load(path: &str) -> Result<Self, Error> {
        let s = tokio::fs::read(path)
            .await
            .with_context(|| format!("read file {}", path))?;
        let s = String::from_utf8(s).context("parse utf8")?;
        Self::parse(&s)
    }

    pub fn parse(s: &str) -> Result<Self, Error> {
        let cfg: Config = serde_yaml_ng::from_str(s).context("parse yaml")?;
        cfg.verify()?;
        Ok(cfg)
    }

    pub fn verify(&self) -> Result<(), Error> {
        if self.io_params.batch_size == 0 {
            bail!("ioParams.batchSize must be at least 1");
        }
        if self.io_params.queue_depth == 0 {
            bail!("ioParams.queueDepth must be at least 1");
        }
        if self.io_params.buffer_size == 0 {
            bail!("ioParams.bufferSize must be at least 1");
        }
        if self.timeouts.connect == 0 {
            bail!("timeouts.connect must be at least 1 second");
        }
        if self.nat64.is_some_and(|p| p.segments()[6..] != [0, 0]) {
            bail!("nat64 prefix must be a /96 with zero low 32 bits");
        }
        Ok(())
    }

    pub fn identifier(&self) -> [u8; 16] {
        *self.uuid.as_bytes()
    }

    pub fn proxy_chain(&self) -> ProxyChain {
        let prefer_socks5 =
            self.global_socks5 || self.socks5.as_ref().is_some_and(|s| s.global);
        ProxyChain {
            socks5: self.socks5.clone(),
            relay: self.proxy_ip.clone(),
            nat64: self.nat64,
            prefer_socks5,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Timeouts {
    /// seconds, per connection attempt
    #[serde(default = "default_connect_timeout")]
    pub connect: u64,
}

fn default_connect_timeout() -> u64 {
    3
}

impl Timeouts {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect)
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            connect: default_connect_timeout(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct IoParams {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

fn default_buffer_size() -> usize {
    65536
}

fn default_batch_size() -> usize {
    10
}

fn default_queue_depth() -> usize {
    64
}

impl Default for IoParams {
    fn default() -> Self {
        IoParams {
            buffer_size: default_buffer_size(),
            batch_size: default_batch_size(),
            queue_depth: default_queue_depth(),
        }
    }
}
