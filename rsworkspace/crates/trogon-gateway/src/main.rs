use anyhow::Context;
use trogon_gateway::config::{self, CONFIG_PATH_VAR, PORT_VAR};
use trogon_gateway::{GatewayConfig, serve};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let path = config::config_path(std::env::var(CONFIG_PATH_VAR).ok());
    let port = config::parse_port(std::env::var(PORT_VAR).ok().as_deref());

    let config = GatewayConfig::load(&path)
        .with_context(|| format!("load config from {}", path.display()))?
        .with_port(port);

    serve(config).await.context("gateway server failed")
}
