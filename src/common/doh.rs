use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use easy_error::{Error, ResultExt, err_msg};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

pub const DNS_MESSAGE: &str = "application/dns-message";

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DohConfig {
    #[serde(default = "default_url")]
    pub url: String,
    /// seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

fn default_url() -> String {
    "https://1.1.1.1/dns-query".to_string()
}

fn default_timeout() -> u64 {
    5
}

impl Default for DohConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            timeout: default_timeout(),
        }
    }
}

#[async_trait]
pub trait DohClient: Send + Sync {
    /// Sends one raw DNS message and returns the raw response.
    async fn query(&self, message: Bytes) -> Result<Bytes, Error>;
}

pub struct HttpsDohClient {
    url: String,
    client: reqwest::Client,
}

impl HttpsDohClient {
    pub fn new(config: &DohConfig) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .context("build doh client")?;
        Ok(Self {
            url: config.url.clone(),
            client,
        })
    }
}

#[async_trait]
impl DohClient for HttpsDohClient {
    async fn query(&self, message: Bytes) -> Result<Bytes, Error> {
        let resp = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, DNS_MESSAGE)
            .header(ACCEPT, DNS_MESSAGE)
            .body(message)
            .send()
            .await
            .context("doh request")?;
        if !resp.status().is_success() {
            return Err(err_msg(format!("doh upstream status {}", resp.status())));
        }
        resp.bytes().await.context("doh response body")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Router,
        extract::State,
        http::{HeaderMap, Method, StatusCode},
        routing::any,
    };
    use std::sync::{Arc, Mutex};
    use test_log::test;

    #[derive(Debug)]
    struct Seen {
        method: Method,
        content_type: Option<String>,
        body: Bytes,
    }

    type Log = Arc<Mutex<Vec<Seen>>>;

    async fn answer(
        State(log): State<Log>,
        method: Method,
        headers: HeaderMap,
        body: Bytes,
    ) -> Vec<u8> {
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let mut reply = b"answer:".to_vec();
        reply.extend_from_slice(&body);
        log.lock().unwrap().push(Seen {
            method,
            content_type,
            body,
        });
        reply
    }

    async fn start_upstream() -> (std::net::SocketAddr, Log) {
        let log = Log::default();
        let app = Router::new()
            .route("/dns-query", any(answer))
            .route("/down", any(|| async { StatusCode::SERVICE_UNAVAILABLE }))
            .with_state(log.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });
        (addr, log)
    }

    fn client(url: String) -> HttpsDohClient {
        HttpsDohClient::new(&DohConfig { url, timeout: 2 }).unwrap()
    }

    #[test(tokio::test)]
    async fn posts_raw_dns_message() {
        let (addr, log) = start_upstream().await;
        let doh = client(format!("http://{}/dns-query", addr));
        let query = Bytes::from_static(&[0x12, 0x34, 0x01, 0x00, 0x00, 0x01]);

        let ret = doh.query(query.clone()).await.unwrap();
        assert_eq!(&ret[..7], b"answer:");
        assert_eq!(&ret[7..], &query[..]);

        let seen = log.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].method, Method::POST);
        assert_eq!(seen[0].content_type.as_deref(), Some(DNS_MESSAGE));
        assert_eq!(seen[0].body, query);
    }

    #[test(tokio::test)]
    async fn upstream_error_status_fails_query() {
        let (addr, log) = start_upstream().await;
        let doh = client(format!("http://{}/down", addr));
        let err = doh.query(Bytes::from_static(b"\0\x01")).await.unwrap_err();
        assert!(err.to_string().contains("503"), "{}", err);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test(tokio::test)]
    async fn unreachable_upstream_fails_query() {
        let port = {
            let l = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let doh = client(format!("http://127.0.0.1:{}/dns-query", port));
        assert!(doh.query(Bytes::from_static(b"\0\x01")).await.is_err());
    }
}
