//! Courier command-line interface: serve, call and emit over an AMQP broker.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use courier_bridge::broker::{AmqpConnector, Connector};
use courier_bridge::telemetry::{init_tracing, install_metrics_exporter};
use courier_bridge::{
    ActionRouter, BrokerConfig, ConnectionManager, EventBridge, EventConfig, PublisherConfig,
    RpcError, RpcPublisher, RpcServer, ServerConfig,
};
use courier_core::{handler_fn, RequestEnvelope};
use serde_json::{json, Value};
use tracing::info;

/// RPC over a message broker.
#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Request/reply RPC and one-way events over AMQP")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Broker URL
    #[arg(long, env = "RABBITMQ_URL", default_value = "amqp://localhost", global = true)]
    url: String,

    /// Delay before the first reconnect attempt, in milliseconds
    #[arg(long, default_value_t = 5000, global = true)]
    retry_interval_ms: u64,

    /// Upper bound for the reconnect delay, in milliseconds (defaults to the retry interval)
    #[arg(long, global = true)]
    max_backoff_ms: Option<u64>,

    /// Factor applied to the reconnect delay after each failed attempt
    #[arg(long, default_value_t = 2.0, global = true)]
    backoff_multiplier: f64,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Serve Prometheus metrics on this address
    #[arg(long, global = true)]
    metrics_addr: Option<SocketAddr>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve a request queue with the built-in `echo` and `ping` actions
    Serve {
        /// Request queue to consume
        #[arg(long)]
        queue: String,
        /// Maximum unacknowledged deliveries in flight
        #[arg(long, default_value_t = 1)]
        prefetch: u16,
        /// Per-handler time limit, in milliseconds
        #[arg(long)]
        handler_timeout_ms: Option<u64>,
    },
    /// Perform one RPC call and print the reply
    Call {
        #[arg(long)]
        queue: String,
        #[arg(long)]
        action: String,
        /// JSON payload
        #[arg(long, default_value = "null")]
        data: String,
        #[arg(long, default_value_t = 10_000)]
        timeout_ms: u64,
    },
    /// Send a one-way event
    Emit {
        #[arg(long)]
        queue: String,
        #[arg(long)]
        event: String,
        /// JSON payload
        #[arg(long, default_value = "null")]
        data: String,
        /// How long to wait for an optional acknowledgement reply
        #[arg(long, default_value_t = 2_000)]
        timeout_ms: u64,
    },
}

impl Cli {
    fn broker_config(&self) -> BrokerConfig {
        let retry_interval = Duration::from_millis(self.retry_interval_ms);
        BrokerConfig {
            url: self.url.clone(),
            retry_interval,
            max_backoff: self
                .max_backoff_ms
                .map_or(retry_interval, Duration::from_millis),
            backoff_multiplier: self.backoff_multiplier,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.log_json)?;
    if let Some(addr) = cli.metrics_addr {
        install_metrics_exporter(addr)?;
    }

    let config = cli.broker_config();
    let connector: Arc<dyn Connector> = Arc::new(AmqpConnector::new(config.url.clone()));
    let manager = Arc::new(ConnectionManager::new(connector, config));

    match cli.command {
        Commands::Serve {
            queue,
            prefetch,
            handler_timeout_ms,
        } => {
            let config = ServerConfig {
                prefetch,
                handler_timeout: handler_timeout_ms.map(Duration::from_millis),
            };
            serve(manager, queue, config).await
        }
        Commands::Call {
            queue,
            action,
            data,
            timeout_ms,
        } => {
            let data = parse_data(&data)?;
            let publisher = publisher(manager, &queue).await?;
            let envelope = RequestEnvelope::new(action, data);
            let reply = publisher
                .call(&queue, &envelope, Duration::from_millis(timeout_ms))
                .await?;
            println!("{}", serde_json::to_string_pretty(&reply)?);
            if reply.ok {
                Ok(())
            } else {
                Err(anyhow::anyhow!("remote call failed"))
            }
        }
        Commands::Emit {
            queue,
            event,
            data,
            timeout_ms,
        } => {
            let data = parse_data(&data)?;
            let publisher = Arc::new(publisher(manager, &queue).await?);
            let bridge = EventBridge::new(
                publisher,
                EventConfig {
                    event_timeout: Duration::from_millis(timeout_ms),
                },
            );
            match bridge.emit(queue.as_str(), event, data).await? {
                Ok(reply) => println!("{}", serde_json::to_string_pretty(&reply)?),
                // One-way consumers never answer.
                Err(RpcError::Timeout { .. }) => info!(queue = %queue, "event sent, no reply"),
                Err(err) => return Err(err.into()),
            }
            Ok(())
        }
    }
}

async fn serve(
    manager: Arc<ConnectionManager>,
    queue: String,
    config: ServerConfig,
) -> anyhow::Result<()> {
    let router = ActionRouter::builder()
        .register("echo", handler_fn(|data| async move { Ok(data) }))?
        .register(
            "ping",
            handler_fn(|_| async {
                let at = SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis();
                Ok::<_, anyhow::Error>(json!({ "pong": true, "at": u64::try_from(at)? }))
            }),
        )?
        .build();

    let mut handle = RpcServer::serve(manager, queue, router, config).await?;
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!(queue = handle.queue(), "shutting down");
    handle.stop().await;
    Ok(())
}

async fn publisher(manager: Arc<ConnectionManager>, queue: &str) -> anyhow::Result<RpcPublisher> {
    let config = PublisherConfig {
        request_queues: vec![queue.to_string()],
        ..PublisherConfig::default()
    };
    Ok(RpcPublisher::initialize(manager, config).await?)
}

fn parse_data(raw: &str) -> anyhow::Result<Value> {
    serde_json::from_str(raw).context("--data must be valid JSON")
}
