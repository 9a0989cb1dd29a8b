// topic-consumers
//
// Runs a consumer pool against a topic subscription until Ctrl-C or until
// every worker has failed, then prints the shutdown report as JSON.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use topic_consumers::consumer::{
    handler_fn, HandlerError, Outcome, PoolConfig, WorkerPool, DEFAULT_MAX_DELIVERY_COUNT,
    DEFAULT_WORKER_COUNT,
};
use topic_consumers::message_db::MessageDbConfig;
use topic_consumers::source::{
    Credential, InMemoryBroker, Message, MessageDbSource, MessageDbSourceOptions, MessageSource,
};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Backend {
    /// In-process broker, seeded with demo messages
    Memory,
    /// Message DB on PostgreSQL
    MessageDb,
}

#[derive(Parser)]
#[command(name = "topic-consumers")]
#[command(about = "Consume a topic subscription with a pool of concurrent workers")]
#[command(version)]
struct Cli {
    /// Message source
    #[arg(long, env = "CONSUMER_BACKEND", value_enum, default_value = "memory")]
    backend: Backend,

    /// Connection credential; a PostgreSQL URL for message-db
    #[arg(long, env = "CONSUMER_CONNECTION_STRING", hide_env_values = true)]
    connection_string: Option<String>,

    /// Topic (Message DB category)
    #[arg(long, env = "CONSUMER_TOPIC", default_value = "orders")]
    topic: String,

    /// Subscription on the topic
    #[arg(long, env = "CONSUMER_SUBSCRIPTION", default_value = "billing")]
    subscription: String,

    /// Number of concurrent workers
    #[arg(long, env = "CONSUMER_WORKERS", default_value_t = DEFAULT_WORKER_COUNT)]
    workers: usize,

    /// Deliveries before a message is dead-lettered
    #[arg(long, env = "CONSUMER_MAX_DELIVERY_COUNT", default_value_t = DEFAULT_MAX_DELIVERY_COUNT)]
    max_delivery_count: u32,

    /// Grace period for busy workers on shutdown
    #[arg(long, env = "CONSUMER_SHUTDOWN_TIMEOUT_SECS", default_value = "30")]
    shutdown_timeout_secs: u64,

    /// Messages published at startup (memory backend only)
    #[arg(long, default_value = "100")]
    demo_messages: usize,
}

async fn log_message(message: Message) -> Result<Outcome, HandlerError> {
    let thread = std::thread::current();
    tracing::info!(
        message_id = %message.id,
        sequence_number = message.sequence_number,
        delivery_count = message.delivery_count,
        body = message.body_str().unwrap_or("<binary>"),
        thread = thread.name().unwrap_or("unnamed"),
        "Received message"
    );
    Ok(Outcome::Complete)
}

fn build_source(cli: &Cli) -> Result<(Arc<dyn MessageSource>, Credential), String> {
    match cli.backend {
        Backend::Memory => {
            let broker = InMemoryBroker::new("memory://local");
            broker.create_subscription(&cli.topic, &cli.subscription);
            let bodies = (1..=cli.demo_messages).map(|i| format!("message {}", i));
            broker
                .publish_many(&cli.topic, bodies)
                .map_err(|e| e.to_string())?;
            tracing::info!(count = cli.demo_messages, topic = %cli.topic, "Published demo messages");

            let credential = Credential::new(cli.connection_string.clone().unwrap_or_default());
            Ok((Arc::new(broker), credential))
        }
        Backend::MessageDb => {
            let connection_string = cli
                .connection_string
                .clone()
                .ok_or("--connection-string is required for the message-db backend")?;
            let namespace = MessageDbConfig::from_connection_string(&connection_string)
                .map_err(|e| e.to_string())?
                .namespace();

            let source = MessageDbSource::new(MessageDbSourceOptions::default())
                .with_namespace(namespace);
            Ok((Arc::new(source), Credential::new(connection_string)))
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("topic_consumers=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let (source, credential) = match build_source(&cli) {
        Ok(built) => built,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::from(2);
        }
    };

    let config = PoolConfig::new(&cli.topic, &cli.subscription, credential)
        .with_worker_count(cli.workers)
        .with_max_delivery_count(cli.max_delivery_count);

    let handle = match WorkerPool::new(config, source, handler_fn(log_message)).start() {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::from(2);
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
        outage = handle.wait_for_outage() => {
            if outage {
                tracing::error!("Every worker failed; shutting down");
            } else {
                tracing::info!("All workers finished");
            }
        }
    }

    let report = handle
        .stop(Duration::from_secs(cli.shutdown_timeout_secs))
        .await;

    match serde_json::to_string_pretty(&report) {
        Ok(json) => println!("{}", json),
        Err(e) => tracing::warn!(error = %e, "Failed to render shutdown report"),
    }

    if report.is_total_outage() {
        eprintln!(
            "Total outage; failed worker categories: {:?}",
            report.failed_categories()
        );
        for worker in &report.workers {
            if let Some(error) = &worker.last_error {
                eprintln!("  worker {}: {}", worker.index, error);
            }
        }
    }

    ExitCode::from(report.exit_code() as u8)
}
