use axum::{
    Router,
    http::{StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::get,
};
use easy_error::{Error, ResultExt};
use prometheus::{
    Encoder, IntCounter, IntCounterVec, TextEncoder, register_int_counter,
    register_int_counter_vec,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

lazy_static::lazy_static! {
    pub static ref SESSIONS_ACCEPTED: IntCounter = register_int_counter!(
        "wsgate_sessions_accepted",
        "Number of tunnel sessions accepted."
    )
    .unwrap();
    pub static ref SESSIONS_REJECTED: IntCounterVec = register_int_counter_vec!(
        "wsgate_sessions_rejected",
        "Number of tunnel sessions dropped before relaying.",
        &["reason"]
    )
    .unwrap();
    pub static ref CONNECT_ATTEMPTS: IntCounterVec = register_int_counter_vec!(
        "wsgate_connect_attempts",
        "Number of outbound connection attempts.",
        &["strategy", "outcome"]
    )
    .unwrap();
    pub static ref RELAYED_BYTES: IntCounterVec = register_int_counter_vec!(
        "wsgate_relayed_bytes",
        "Number of payload bytes relayed.",
        &["direction"]
    )
    .unwrap();
    pub static ref DOH_QUERIES: IntCounterVec = register_int_counter_vec!(
        "wsgate_doh_queries",
        "Number of DNS-over-HTTPS queries.",
        &["outcome"]
    )
    .unwrap();
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MetricsConfig {
    pub bind: String,
}

impl MetricsConfig {
    /// Binds the endpoint and serves `GET /metrics` in the background.
    pub async fn listen(&self) -> Result<(), Error> {
        let listener = TcpListener::bind(&self.bind)
            .await
            .with_context(|| format!("bind metrics endpoint {}", self.bind))?;
        info!("metrics endpoint listening on {}", self.bind);
        let app = Router::new().route("/metrics", get(render));
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                warn!("metrics endpoint stopped: {}", e);
            }
        });
        Ok(())
    }
}

async fn render() -> Response {
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buf) {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }
    ([(CONTENT_TYPE, encoder.format_type().to_string())], buf).into_response()
}
