//! Courier CLI: send, publish, receive, and manage subscriptions against a
//! learning-transport storage directory.
//!
//! Commands:
//! - `send`        send one message to a queue
//! - `publish`     publish one event to its subscribers
//! - `receive`     print every message arriving at a queue until Ctrl-C
//! - `subscribe`   subscribe an endpoint to an event type
//! - `unsubscribe` remove that subscription

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use courier::learning::{LearningTransport, LearningTransportInfrastructure};
use courier::pipeline::{Behavior, IncomingContext, Next};
use courier::{
    Endpoint, EndpointConfig, MessageOps, PipelineError, PublishOptions, SendOptions,
};
use courier_core::transport::{ReceiveSettings, SubscriptionManager, TransportInfrastructure};
use courier_core::{Extensions, MessageType, OutgoingLogicalMessage};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "courier", about = "Courier: message endpoints over a file transport", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Storage directory of the learning transport (discovered when omitted)
    #[arg(long, global = true, env = "COURIER_STORAGE")]
    storage: Option<PathBuf>,

    /// Default log filter when `RUST_LOG` is unset
    #[arg(long, global = true, default_value = "info", env = "COURIER_LOG")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one message to a queue
    Send {
        #[arg(long)]
        queue: String,
        /// Declared message type
        #[arg(long = "type")]
        message_type: String,
        /// JSON body
        #[arg(long, default_value = "{}")]
        body: String,
        /// Deliver no earlier than this many milliseconds from now
        #[arg(long)]
        delay_ms: Option<u64>,
        /// Discard unless received within this many milliseconds
        #[arg(long)]
        ttbr_ms: Option<u64>,
    },

    /// Publish one event to every subscriber
    Publish {
        #[arg(long = "type")]
        message_type: String,
        #[arg(long, default_value = "{}")]
        body: String,
    },

    /// Print messages arriving at a queue until Ctrl-C
    Receive {
        #[arg(long)]
        queue: String,
        /// Maximum number of messages processed at once
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Subscribe an endpoint to an event type
    Subscribe {
        #[arg(long)]
        endpoint: String,
        #[arg(long = "type")]
        message_type: String,
    },

    /// Remove an endpoint's subscription to an event type
    Unsubscribe {
        #[arg(long)]
        endpoint: String,
        #[arg(long = "type")]
        message_type: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs);

    let transport = LearningTransport {
        storage_directory: cli.storage.clone(),
        ..LearningTransport::default()
    };
    let infrastructure = Arc::new(
        transport
            .initialize()
            .context("initializing the learning transport")?,
    );

    match cli.command {
        Commands::Send {
            queue,
            message_type,
            body,
            delay_ms,
            ttbr_ms,
        } => {
            let mut options = SendOptions::new().to(queue);
            if let Some(delay) = delay_ms {
                options = options.delay_delivery_with(Duration::from_millis(delay));
            }
            if let Some(ttbr) = ttbr_ms {
                options = options.discard_if_not_received_within(Duration::from_millis(ttbr));
            }
            let message = logical_message(&message_type, &body)?;
            let endpoint = start_send_only(infrastructure).await?;
            let result = endpoint.session().send_logical(message, &options).await;
            endpoint.stop().await?;
            result?;
            info!(%message_type, "message sent");
        }
        Commands::Publish { message_type, body } => {
            let message = logical_message(&message_type, &body)?;
            let endpoint = start_send_only(infrastructure).await?;
            let result = endpoint
                .session()
                .publish_logical(message, &PublishOptions::new())
                .await;
            endpoint.stop().await?;
            result?;
            info!(%message_type, "event published");
        }
        Commands::Receive { queue, concurrency } => receive(infrastructure, queue, concurrency).await?,
        Commands::Subscribe {
            endpoint,
            message_type,
        } => {
            manager(&infrastructure, &endpoint)?
                .subscribe(&MessageType::new(&message_type), &Extensions::root())
                .await?;
        }
        Commands::Unsubscribe {
            endpoint,
            message_type,
        } => {
            manager(&infrastructure, &endpoint)?
                .unsubscribe(&MessageType::new(&message_type), &Extensions::root())
                .await?;
        }
    }

    Ok(())
}

fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}

fn logical_message(message_type: &str, body: &str) -> anyhow::Result<OutgoingLogicalMessage> {
    let instance = serde_json::from_str(body).context("the message body must be valid JSON")?;
    Ok(OutgoingLogicalMessage {
        message_type: MessageType::new(message_type),
        instance,
    })
}

/// Subscription manager for `endpoint`, assumed to receive on a queue of
/// the same name.
fn manager(
    infrastructure: &LearningTransportInfrastructure,
    endpoint: &str,
) -> anyhow::Result<Arc<dyn SubscriptionManager>> {
    let settings = ReceiveSettings {
        id: "Main".to_string(),
        local_address: endpoint.to_string(),
        error_queue: "error".to_string(),
        use_publish_subscribe: true,
        purge_on_startup: false,
        required_transaction_mode: infrastructure.capabilities().preferred_transaction_mode(),
    };
    infrastructure
        .subscription_manager(endpoint, &settings)?
        .context("the transport has no native subscription support")
}

async fn start_send_only(
    infrastructure: Arc<LearningTransportInfrastructure>,
) -> anyhow::Result<courier::RunningEndpoint> {
    Endpoint::new(EndpointConfig::new("courier-cli").send_only(), infrastructure)
        .start()
        .await
}

async fn receive(
    infrastructure: Arc<LearningTransportInfrastructure>,
    queue: String,
    concurrency: Option<usize>,
) -> anyhow::Result<()> {
    infrastructure.create_queue(&queue).await?;
    let mut config = EndpointConfig::new(queue);
    config.concurrency_limit = concurrency;

    let mut endpoint = Endpoint::new(config, infrastructure);
    endpoint.register_incoming_behavior(PrintMessages);
    let running = endpoint.start().await?;
    info!(endpoint = %running.name(), "receiving; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    running.stop().await
}

/// Writes each delivery to stdout as one JSON line instead of invoking handlers.
struct PrintMessages;

#[async_trait]
impl Behavior<IncomingContext> for PrintMessages {
    async fn invoke(
        &self,
        context: &mut IncomingContext,
        _next: Next<'_, IncomingContext>,
    ) -> Result<(), PipelineError> {
        let (message_type, body) = context
            .logical_message
            .as_ref()
            .map(|logical| (logical.message_type.to_string(), logical.instance.clone()))
            .unwrap_or_default();
        let line = serde_json::json!({
            "message_id": context.message.message_id,
            "message_type": message_type,
            "headers": context.message.headers,
            "body": body,
        });
        println!("{line}");
        Ok(())
    }
}
