mod bridge;
mod http;
mod voice;

use preview_engine::{
    CatalogResolver, Collaborators, Engine, EngineSettings, HttpPreviewFetcher, SpotifyCatalog,
    StagingArea, StatusBoard,
};
use preview_proto::config::{CatalogCredentials, Config};
use preview_proto::protocol::Outbound;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Forwards WARN and ERROR events to connected adapters as `Log` frames.
struct BroadcastLayer {
    sender: broadcast::Sender<Outbound>,
}

impl BroadcastLayer {
    fn new(sender: broadcast::Sender<Outbound>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = format!("{} [{}] ", chrono::Local::now().format("%H:%M:%S"), level);
        event.record(&mut MessageVisitor(&mut message));

        // No adapters connected is fine.
        let _ = self.sender.send(Outbound::Log { message });
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Every frame to adapters, log lines included, goes through this channel.
    let (outbound_tx, _) = broadcast::channel::<Outbound>(256);

    let data_dir = preview_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .with(BroadcastLayer::new(outbound_tx.clone()))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(
                    "info,preview_daemon=debug,preview_engine=debug",
                )
            }),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    let credentials = CatalogCredentials::from_env();
    if credentials.is_none() {
        warn!(
            "{} / {} not set, catalog searches will fail",
            preview_proto::platform::ENV_CLIENT_ID,
            preview_proto::platform::ENV_CLIENT_SECRET
        );
    }

    let fetcher = HttpPreviewFetcher::new(&config.preview)?;
    let staging: &StagingArea = fetcher.staging();
    staging.prepare().await?;
    info!("Staging previews in {:?}", staging.dir());

    let catalog: Arc<dyn CatalogResolver> =
        Arc::new(SpotifyCatalog::connect(config.catalog.clone(), credentials).await);

    let bridge = bridge::Bridge::new(outbound_tx.clone(), config.bridge.voice_timeout());
    let collab = Collaborators {
        gateway: Arc::new(bridge.gateway()),
        voice: Arc::new(bridge.voice()),
        catalog: catalog.clone(),
        fetcher: Arc::new(fetcher),
    };

    let status = StatusBoard::new();
    let (engine, engine_task) = Engine::spawn(
        collab,
        EngineSettings::from_config(&config),
        status.clone(),
    );

    let _bridge_handle = bridge::start_server(
        config.bridge.bind_address.clone(),
        config.bridge.port,
        bridge.clone(),
        engine.clone(),
    );

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            http::HttpState {
                status,
                catalog,
                bridge,
            },
        );
    }

    info!("Daemon initialised, waiting for adapters");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    engine.shutdown().await?;
    engine_task.await?;

    Ok(())
}
