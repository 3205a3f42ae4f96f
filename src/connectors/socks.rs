use std::str::FromStr;

use base64::{
    Engine,
    engine::general_purpose::{STANDARD, STANDARD_NO_PAD},
};
use easy_error::{Error, bail};
use serde::{Deserialize, Serialize};

use super::split_host_port;
use crate::common::{
    dialers::{BoxedStream, TcpDialer},
    socks::{ConnectError, Credentials, handshake},
};

pub const DEFAULT_SOCKS_PORT: u16 = 1080;

const SCHEMES: &[(&str, bool)] = &[
    ("socks5://", false),
    ("socks://", false),
    ("s5://", false),
    ("gsocks5://", true),
    ("gsocks://", true),
    ("gs5://", true),
];

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(try_from = "String", into = "String")]
pub struct Socks5Endpoint {
    pub host: String,
    pub port: u16,
    pub auth: Option<Credentials>,
    /// set by the `gs5://`, `gsocks5://` and `gsocks://` schemes
    pub global: bool,
}

impl FromStr for Socks5Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let mut rest = s;
        let mut global = false;
        for (scheme, g) in SCHEMES {
            if s
                .get(..scheme.len())
                .is_some_and(|p| p.eq_ignore_ascii_case(scheme))
            {
                rest = &s[scheme.len()..];
                global = *g;
                break;
            }
        }
        let (userinfo, hostport) = match rest.rsplit_once('@') {
            Some((u, h)) => (Some(u), h),
            None => (None, rest),
        };
        let auth = match userinfo {
            Some(u) => parse_userinfo(u)?,
            None => None,
        };
        let (host, port) = split_host_port(hostport)?;
        Ok(Self {
            host,
            port: port.unwrap_or(DEFAULT_SOCKS_PORT),
            auth,
            global,
        })
    }
}

/// `user:pass`, `user`, or base64 of either.
fn parse_userinfo(u: &str) -> Result<Option<Credentials>, Error> {
    let plain = if u.contains(':') {
        u.to_string()
    } else {
        STANDARD
            .decode(u)
            .or_else(|_| STANDARD_NO_PAD.decode(u))
            .ok()
            .and_then(|d| String::from_utf8(d).ok())
            .unwrap_or_else(|| u.to_string())
    };
    let (username, password) = plain.split_once(':').unwrap_or((&plain, ""));
    if username.is_empty() {
        return Ok(None);
    }
    if username.len() > 255 || password.len() > 255 {
        bail!("socks5 credentials longer than 255 bytes");
    }
    Ok(Some(Credentials {
        username: username.to_string(),
        password: password.to_string(),
    }))
}

impl TryFrom<String> for Socks5Endpoint {
    type Error = Error;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Socks5Endpoint> for String {
    fn from(e: Socks5Endpoint) -> String {
        let scheme = if e.global { "gsocks5://" } else { "socks5://" };
        let auth = e
            .auth
            .map(|a| format!("{}:{}@", a.username, a.password))
            .unwrap_or_default();
        let host = if e.host.contains(':') {
            format!("[{}]", e.host)
        } else {
            e.host
        };
        format!("{}{}{}:{}", scheme, auth, host, e.port)
    }
}

/// Dials the SOCKS5 endpoint and asks it to CONNECT to `host:port`.
pub async fn connect(
    dialer: &dyn TcpDialer,
    endpoint: &Socks5Endpoint,
    host: &str,
    port: u16,
) -> Result<BoxedStream, ConnectError> {
    let mut stream = dialer.connect(&endpoint.host, endpoint.port).await?;
    handshake(&mut stream, endpoint.auth.as_ref(), host, port).await?;
    Ok(stream)
}
