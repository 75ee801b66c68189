//! CLI for notifybus
//!
//! Subcommands:
//! - `listen`: print every notification on the given topics until Ctrl-C
//! - `publish`: send payloads to a topic as one batch
//! - `encode`: show the channel name a topic maps to

use clap::{Parser, Subcommand};
use notifybus_core::{Channel, Config, Error, Notification, PubSub, Result};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "notifybus", version, about = "Pub/sub over PostgreSQL LISTEN/NOTIFY")]
struct Cli {
    /// Database URL (defaults to NOTIFYBUS_DATABASE_URL, then DATABASE_URL)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Subscribe to topics and print `<topic>\t<payload>` lines
    Listen {
        #[arg(required = true)]
        topics: Vec<String>,
    },
    /// Publish payloads to a topic (no payload sends one empty notification)
    Publish { topic: String, payloads: Vec<String> },
    /// Print the channel name for a topic
    Encode { topic: String },
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // try_init so a second call is harmless
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Encode { topic } => {
            println!("{}", Channel::encode(&topic));
            Ok(())
        }
        Command::Listen { topics } => listen(cli.database_url, &topics).await,
        Command::Publish { topic, payloads } => publish(cli.database_url, &topic, payloads).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(database_url: Option<String>) -> Result<Config> {
    let mut config = Config::from_env()?;
    if let Some(url) = database_url {
        config.database_url = url;
    }
    if config.database_url.is_empty() {
        return Err(Error::Config(
            "no database URL; pass --database-url or set NOTIFYBUS_DATABASE_URL".into(),
        ));
    }
    Ok(config)
}

async fn listen(database_url: Option<String>, topics: &[String]) -> Result<()> {
    let pubsub = PubSub::new(load_config(database_url)?).await?;
    pubsub.start_loop(Some(Arc::new(|e: &Error| error!("listener: {}", e))))?;

    let mut subscriptions = Vec::with_capacity(topics.len());
    for topic in topics {
        let label = topic.clone();
        subscriptions.push(pubsub.subscribe(topic, move |payload| {
            println!("{}\t{}", label, payload);
        })?);
    }
    info!(
        topics = topics.len(),
        reconcile_ms = pubsub.config().reconcile_interval.as_millis() as u64,
        "listening; press Ctrl-C to stop"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to wait for Ctrl-C: {}", e);
    }
    info!("Shutdown signal received. Exiting gracefully.");

    drop(subscriptions);
    pubsub.shutdown().await;
    Ok(())
}

async fn publish(database_url: Option<String>, topic: &str, payloads: Vec<String>) -> Result<()> {
    let pubsub = PubSub::new(load_config(database_url)?).await?;
    // Publishing needs a started broker but a one-shot send has nothing to
    // listen for; stopping right away retires the run before it connects.
    pubsub.start_loop(None)?;
    pubsub.stop_loop();

    let batch: Vec<Notification> = if payloads.is_empty() {
        vec![Notification::empty(topic)]
    } else {
        payloads
            .into_iter()
            .map(|p| Notification::new(topic, p))
            .collect()
    };
    pubsub.publish_batch(&batch).await?;
    info!(count = batch.len(), topic, "published");

    pubsub.shutdown().await;
    Ok(())
}
