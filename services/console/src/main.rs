use clap::Parser;
use console::{ClientConfig, ClientEvent, PulseClient};
use pulse_protocol::MessageType;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Terminal observer for a pulse hub: subscribes to a set of message types
/// and logs every update it receives.
#[derive(Debug, Parser)]
#[command(name = "console")]
struct Cli {
    /// Hub WebSocket URL.
    #[arg(long, default_value = "ws://127.0.0.1:8080/ws")]
    url: String,
    /// Identity presented to the hub; derived by the hub when omitted.
    #[arg(long)]
    identity: Option<String>,
    /// Comma-separated message types to subscribe to.
    #[arg(long, value_delimiter = ',', default_value = "status,stats,health")]
    types: Vec<String>,
}

#[tokio::main]
async fn main() {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let cli = Cli::parse();
    let types: Vec<MessageType> = cli
        .types
        .iter()
        .map(|t| {
            serde_json::from_value(serde_json::Value::String(t.clone())).unwrap_or_else(|_| {
                eprintln!("unknown message type: {t}");
                std::process::exit(2);
            })
        })
        .collect();

    let url = match &cli.identity {
        Some(identity) => format!("{}?identity={identity}", cli.url),
        None => cli.url.clone(),
    };
    let client = PulseClient::connect(ClientConfig::new(url));
    let mut events = client.events();
    client.subscribe(types);

    loop {
        match events.recv().await {
            Ok(ClientEvent::Connected { connection_id }) => {
                info!(connection_id = %connection_id, "connected");
            }
            Ok(ClientEvent::Subscribed { types }) => {
                info!(?types, "subscribed");
            }
            Ok(ClientEvent::Unsubscribed { types }) => {
                info!(?types, "unsubscribed");
            }
            Ok(ClientEvent::Update(frame)) => {
                info!(event = ?frame.event, data = %frame.data, "update");
            }
            Ok(ClientEvent::ServerError(err)) => {
                warn!(code = %err.code, message = %err.message, "server error");
            }
            Ok(ClientEvent::Disconnected { retrying: true }) => {
                warn!("disconnected, retrying");
            }
            Ok(ClientEvent::Disconnected { retrying: false }) => {
                info!("session closed");
                return;
            }
            Ok(ClientEvent::GaveUp) => {
                error!("hub unreachable, giving up");
                std::process::exit(1);
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event stream lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
    }
}
