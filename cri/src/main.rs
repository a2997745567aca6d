//! dockershim - Kubernetes Container Runtime Interface over the Docker engine API.
//!
//! Connects to the engine, checks its API version and serves the streaming
//! endpoint used by exec, attach and port-forward sessions.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Layer, Registry};

use dockershim_core::{LogFormat, ShimConfig};

use dockershim_cri::engine::{check_api_version, DockerEngine, EngineClient};
use dockershim_cri::network::NoopNetworkPlugin;
use dockershim_cri::server::CriServer;

/// dockershim CRI runtime
#[derive(Parser, Debug)]
#[command(name = "dockershim", about = "Kubernetes CRI shim for the Docker engine")]
struct Args {
    /// YAML configuration file.
    #[arg(long, env = "DOCKERSHIM_CONFIG")]
    config: Option<PathBuf>,

    /// Engine endpoint, e.g. unix:///var/run/docker.sock.
    #[arg(long, env = "DOCKER_HOST")]
    engine_endpoint: Option<String>,

    /// Listen address of the streaming server.
    #[arg(long)]
    streaming_addr: Option<SocketAddr>,

    /// Image backing every sandbox's infra container.
    #[arg(long)]
    pod_infra_image: Option<String>,

    /// Log output format (text, json).
    #[arg(long, env = "DOCKERSHIM_LOG_FORMAT")]
    log_format: Option<LogFormat>,
}

impl Args {
    fn load_config(&self) -> anyhow::Result<ShimConfig> {
        let mut config = match &self.config {
            Some(path) => ShimConfig::from_file(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => ShimConfig::default(),
        };
        if let Some(endpoint) = &self.engine_endpoint {
            config.engine_endpoint = Some(endpoint.clone());
        }
        if let Some(addr) = self.streaming_addr {
            config.streaming.addr = addr;
        }
        if let Some(image) = &self.pod_infra_image {
            config.pod_infra_image = image.clone();
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

type FormatLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn format_layer(format: LogFormat) -> FormatLayer {
    match format {
        LogFormat::Text => fmt::layer().boxed(),
        LogFormat::Json => fmt::layer().json().boxed(),
    }
}

/// Install the global subscriber. The returned handle switches the output
/// format once the configuration file has been read.
fn init_tracing(format: LogFormat) -> reload::Handle<FormatLayer, Registry> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (layer, handle) = reload::Layer::new(format_layer(format));
    tracing_subscriber::registry().with(layer).with(filter).init();
    handle
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let initial_format = args.log_format.unwrap_or(LogFormat::Text);
    let tracing_handle = init_tracing(initial_format);
    let config = args.load_config()?;
    if config.log_format != initial_format {
        tracing_handle
            .reload(format_layer(config.log_format))
            .context("failed to switch log format")?;
    }

    tracing::info!(
        version = dockershim_core::VERSION,
        endpoint = config.engine_endpoint.as_deref().unwrap_or("default"),
        streaming_addr = %config.streaming.addr,
        "Starting dockershim"
    );

    let engine = DockerEngine::connect(config.engine_endpoint.as_deref(), config.request_timeout())
        .await
        .context("failed to connect to the engine")?;
    let version = engine
        .version()
        .await
        .context("failed to query the engine version")?;
    check_api_version(&version.api_version, &config.min_api_version)
        .context("engine API version is not supported")?;
    tracing::info!(
        engine_version = %version.version,
        api_version = %version.api_version,
        "Connected to engine"
    );

    let server = CriServer::new(Arc::new(engine), Arc::new(NoopNetworkPlugin), &config);
    server
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("streaming server failed")?;
    Ok(())
}
