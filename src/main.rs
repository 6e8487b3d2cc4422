mod cache;
mod client;
mod confidence;
mod config;
mod elicitation;
mod entity;
mod error;
mod executor;
mod manifest;
mod matcher;
mod service;
mod similarity;
mod transport;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use rmcp::ServiceExt;
use rmcp::transport::sse_server::SseServer;
use rmcp::transport::stdio;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::client::HomeAssistantClient;
use crate::config::{GatewaySettings, HomeAssistantConfig};
use crate::executor::ActionExecutor;
use crate::service::ResolverService;

#[derive(Parser)]
#[command(name = "hass-resolver-mcp")]
#[command(about = "Home Assistant MCP gateway with fuzzy entity resolution")]
#[command(version)]
struct Cli {
    /// Home Assistant URL (e.g., http://localhost:8123)
    #[arg(long = "url", env = "HASS_URL")]
    url: String,

    /// Home Assistant long-lived access token
    #[arg(long = "api-key", env = "HASS_API_KEY")]
    api_key: String,

    /// YAML file with resolver and transport settings
    #[arg(long = "config", env = "HASS_GATEWAY_CONFIG")]
    config: Option<PathBuf>,

    /// Serve MCP over SSE on this address instead of stdio
    #[arg(long = "sse-bind")]
    sse_bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let settings = GatewaySettings::load(cli.config.as_deref())?;

    let config = HomeAssistantConfig::new(cli.url.clone(), cli.api_key);
    // Fail fast on a URL the WebSocket session could never use
    config.websocket_url()?;

    let client = HomeAssistantClient::new(config, settings.transport.clone());
    let executor = ActionExecutor::new(Arc::new(client), settings.resolver.clone());
    let service = ResolverService::new(Arc::new(executor));

    tracing::info!(url = %cli.url, "Home Assistant resolver gateway starting");
    tracing::debug!(?settings, "effective settings");

    match cli.sse_bind {
        Some(bind) => {
            tracing::info!(%bind, "serving MCP over SSE");
            let ct = SseServer::serve(bind)
                .await?
                .with_service(move || service.clone());
            tokio::signal::ctrl_c().await?;
            ct.cancel();
        }
        None => {
            let server_service = service
                .serve(stdio())
                .await
                .inspect_err(|error| tracing::error!(%error, "Error serving"))?;
            server_service.waiting().await?;
        }
    }

    Ok(())
}
