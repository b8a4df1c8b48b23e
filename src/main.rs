use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use iot_dashboard::config::DashboardConfig;
use iot_dashboard::mqtt::{CallbackId, MqttHandler, RumqttConnector};
use iot_dashboard::telemetry::VariableIndicator;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Headless dashboard: connects to the configured broker and logs on/off state
/// changes of the watched topics.
#[derive(Parser, Debug)]
#[command(name = "iot-dashboard")]
struct Args {
    /// Config file, defaults to <config dir>/iot-dashboard/config.toml
    #[arg(long)]
    config: Option<PathBuf>,

    /// Topic to watch, may be repeated. Replaces the topics from the config file.
    #[arg(long = "topic")]
    topics: Vec<String>,

    /// Only follow this variable
    #[arg(long)]
    variable: Option<String>,

    /// Broker URL, overrides the config file
    #[arg(long)]
    url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;
    let args = Args::parse();

    let path = args.config.unwrap_or_else(DashboardConfig::default_path);
    let mut config = DashboardConfig::load(&path).await?;
    if !args.topics.is_empty() {
        config.topics = args.topics;
    }
    if args.variable.is_some() {
        config.variable = args.variable;
    }
    if let Some(url) = args.url {
        config.broker.url = url;
    }

    let options = config.connect_options()?;
    let mqtt = MqttHandler::with_history_limit(
        Arc::new(RumqttConnector::default()),
        config.history_limit,
    );

    let mut status_rx = mqtt.watch_status();
    let _status_handle = tokio::spawn(async move {
        let mut last_state = status_rx.borrow().state;
        while status_rx.changed().await.is_ok() {
            let status = status_rx.borrow_and_update().clone();
            if status.state != last_state {
                info!("Broker: {}", status.label());
                last_state = status.state;
            }
            if let Some(err) = status.last_error {
                warn!("Last error: {}", err);
            }
        }
    });

    info!("Connecting to {}", options.url);
    mqtt.connect(options)
        .await
        .map_err(|e| eyre!("Failed to connect to MQTT broker: {}", e))?;

    let mut indicators: Vec<(String, CallbackId, Arc<VariableIndicator>)> = Vec::new();
    for topic in &config.topics {
        let indicator = Arc::new(VariableIndicator::new(config.variable.clone()));
        match mqtt.subscribe(topic, indicator.clone()).await {
            Ok(id) => {
                info!("Watching {}", topic);
                indicators.push((topic.clone(), id, indicator));
            }
            Err(e) => error!("Failed to subscribe to {}: {}", topic, e),
        }
    }
    if indicators.is_empty() {
        warn!("No topics to watch");
    }

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("Failed to listen for shutdown signal: {}", e))?;
    info!("Shutting down");

    for (topic, id, indicator) in indicators {
        info!("{}: {}", topic, indicator.status_text());
        mqtt.unsubscribe(&topic, Some(id)).await;
    }
    for message in mqtt.messages(None).iter().take(10) {
        info!("{}", message.render());
    }
    mqtt.disconnect();

    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
