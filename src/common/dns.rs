use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};

use easy_error::{Error, ResultExt, err_msg};
use hickory_resolver::{
    TokioResolver,
    config::{NameServerConfigGroup, ResolverConfig, ResolverOpts},
    name_server::TokioConnectionProvider,
};
use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone)]
pub struct DnsConfig {
    pub servers: String,
    #[serde(default)]
    pub family: AddressFamily,
    #[serde(skip)]
    resolver: Option<Arc<TokioResolver>>,
}

impl std::fmt::Debug for DnsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsConfig")
            .field("servers", &self.servers)
            .field("family", &self.family)
            .field("initialized", &self.resolver.is_some())
            .finish()
    }
}

impl Default for DnsConfig {
    fn default() -> Self {
        DnsConfig {
            servers: "system".to_string(),
            family: Default::default(),
            resolver: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AddressFamily {
    V4Only,
    V6Only,
    #[default]
    V4First,
    V6First,
}

impl DnsConfig {
    pub fn init(&mut self) -> Result<(), Error> {
        let resolver = if self.servers == "system" {
            TokioResolver::builder_tokio()
                .context("Failed to read system configuration")?
                .build()
        } else {
            let config = Self::parse_servers(&self.servers)?;
            TokioResolver::builder_with_config(config, TokioConnectionProvider::default())
                .with_options(ResolverOpts::default())
                .build()
        };
        self.resolver = Some(Arc::new(resolver));
        Ok(())
    }

    fn parse_servers(servers: &str) -> Result<ResolverConfig, Error> {
        match servers {
            "google" => Ok(ResolverConfig::google()),
            "cloudflare" => Ok(ResolverConfig::cloudflare()),
            _ => {
                let mut ips = Vec::new();
                for server in servers.split(',') {
                    let ip = server
                        .trim()
                        .parse::<IpAddr>()
                        .with_context(|| format!("Failed to parse DNS server address: {}", server))?;
                    ips.push(ip);
                }
                let group = NameServerConfigGroup::from_ips_clear(&ips, 53, true);
                Ok(ResolverConfig::from_parts(None, vec![], group))
            }
        }
    }

    fn resolver(&self) -> Result<&TokioResolver, Error> {
        self.resolver
            .as_deref()
            .ok_or_else(|| err_msg("dns resolver not initialized"))
    }

    pub async fn lookup_host(&self, host: &str, port: u16) -> Result<SocketAddr, Error> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }
        let resolver = self.resolver()?;
        let addr = match self.family {
            AddressFamily::V4Only => IpAddr::V4(self.lookup_v4(host).await?),
            AddressFamily::V6Only => resolver
                .ipv6_lookup(host)
                .await
                .context("ipv6_lookup")?
                .into_iter()
                .choose(&mut rand::rng())
                .map(|a| IpAddr::V6(a.0))
                .ok_or_else(|| err_msg(format!("No IPv6 address found for {}", host)))?,
            AddressFamily::V4First | AddressFamily::V6First => {
                let (v4, v6): (Vec<_>, Vec<_>) = resolver
                    .lookup_ip(host)
                    .await
                    .context("lookup_ip")?
                    .into_iter()
                    .partition(|a| a.is_ipv4());
                let (first, second) = if self.family == AddressFamily::V4First {
                    (v4, v6)
                } else {
                    (v6, v4)
                };
                first
                    .into_iter()
                    .choose(&mut rand::rng())
                    .or_else(|| second.into_iter().choose(&mut rand::rng()))
                    .ok_or_else(|| err_msg(format!("No address found for {}", host)))?
            }
        };
        Ok(SocketAddr::new(addr, port))
    }

    pub async fn lookup_v4(&self, host: &str) -> Result<Ipv4Addr, Error> {
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Ok(ip);
        }
        self.resolver()?
            .ipv4_lookup(host)
            .await
            .context("ipv4_lookup")?
            .into_iter()
            .choose(&mut rand::rng())
            .map(|a| a.0)
            .ok_or_else(|| err_msg(format!("No IPv4 address found for {}", host)))
    }
}
