use easy_error::Terminator;
use tracing::info;

use wsgate::{GatewayServer, cli, config::Config};

#[tokio::main]
async fn main() -> Result<(), Terminator> {
    let args = cli::parse_args()?;
    let mut cfg = Config::load(&args.config_file).await?;
    args.apply_overrides(&mut cfg);
    if args.check_only {
        info!("config file {} ok", args.config_file);
        return Ok(());
    }
    let server = GatewayServer::from_config(cfg)?;
    server.run().await?;
    Ok(())
}
