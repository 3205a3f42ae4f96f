use std::sync::Arc;

use easy_error::{Error, ResultExt};

use crate::{
    config::Config,
    listeners::WebSocketListener,
    session::Gateway,
};

pub struct GatewayServer {
    pub config: Config,
    pub gateway: Arc<Gateway>,
}

impl GatewayServer {
    pub async fn from_config_file(config_path: &str) -> Result<Self, Error> {
        let cfg = Config::load(config_path).await?;
        Self::from_config(cfg)
    }

    pub fn from_config(config: Config) -> Result<Self, Error> {
        let gateway = Gateway::from_config(&config).context("init gateway")?;
        Ok(Self {
            config,
            gateway: Arc::new(gateway),
        })
    }

    pub async fn bind(&self) -> Result<WebSocketListener, Error> {
        WebSocketListener::bind(&self.config.bind, self.gateway.clone()).await
    }

    pub async fn run(self) -> Result<(), Error> {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.config.metrics {
            metrics.listen().await?;
        }
        let listener = self.bind().await?;
        listener.serve().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
bind: 127.0.0.1:0
uuid: 4ba0eec8-25e1-4ab3-b188-fd8a70b53984
dns:
  servers: 127.0.0.1
"#;

    #[tokio::test]
    async fn construct_and_bind() {
        let server = GatewayServer::from_config(Config::parse(CONFIG).unwrap()).unwrap();
        let listener = server.bind().await.unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn missing_config_file() {
        assert!(
            GatewayServer::from_config_file("nonexistent_file.yaml")
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn bind_conflict() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut cfg = Config::parse(CONFIG).unwrap();
        cfg.bind = taken.local_addr().unwrap().to_string();
        let server = GatewayServer::from_config(cfg).unwrap();
        assert!(server.bind().await.is_err());
    }
}
