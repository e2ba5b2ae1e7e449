//! CLI for mqclient
//!
//! Subcommands:
//! - `declare`: declare a durable queue bound to a direct exchange
//! - `publish`: send one JSON message
//! - `consume`: print and acknowledge messages from a queue

use std::sync::Arc;

use clap::{Parser, Subcommand};
use mqclient::config::load_config;
use mqclient::utils::logging;
use mqclient::{AmqpTransport, BrokerEndpoint, Connection, Message, QueueSpec};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "mqclient", about = "Talk to an AMQP message broker")]
struct Cli {
    /// Log level; overrides the configured one
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Declare a queue and the exchange it is bound to
    Declare {
        queue: String,
        #[arg(long, default_value = "")]
        exchange: String,
        /// Ask the broker to mirror the queue (RabbitMQ 2.x only)
        #[arg(long)]
        mirrored: bool,
        /// Delete the queue after it has been unused this long
        #[arg(long, default_value_t = 0)]
        ttl_seconds: u32,
    },
    /// Publish a JSON body
    Publish {
        routing_key: String,
        /// JSON body, e.g. '{"x":1}'
        body: String,
        #[arg(long, default_value = "")]
        exchange: String,
        /// Message id; a random UUID when omitted
        #[arg(long)]
        id: Option<String>,
    },
    /// Consume messages, acknowledging each one after printing it
    Consume {
        queue: String,
        #[arg(long)]
        prefetch: Option<u16>,
        /// Stop after this many messages
        #[arg(long)]
        count: Option<usize>,
    },
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("ERROR: {e}");
            std::process::exit(1);
        }
    };
    logging::init(cli.log_level.as_deref().unwrap_or(&settings.log.level));

    let endpoint = BrokerEndpoint::from(&settings.broker);
    let mut conn = Connection::new(endpoint, Arc::new(AmqpTransport::new()));

    let prefetch = settings.consumer.prefetch_count;
    let result = tokio::select! {
        result = run(&mut conn, cli.command, prefetch) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
            Ok(())
        }
    };
    conn.close().await;

    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run(conn: &mut Connection, command: Command, default_prefetch: u16) -> mqclient::Result<()> {
    conn.connect().await?;

    match command {
        Command::Declare {
            queue,
            exchange,
            mirrored,
            ttl_seconds,
        } => {
            let spec = QueueSpec::new(queue)
                .exchange(exchange)
                .mirrored(mirrored)
                .ttl_seconds(ttl_seconds);
            conn.declare(&spec).await?;
            info!(queue = %spec.name, "Queue declared");
        }
        Command::Publish {
            routing_key,
            body,
            exchange,
            id,
        } => {
            let body: serde_json::Value = serde_json::from_str(&body)?;
            let message = match id {
                Some(id) => Message::new(id, body),
                None => Message::with_random_id(body),
            };
            conn.send(&message, &routing_key, &exchange).await?;
            info!(message_id = %message.id, "Message published");
        }
        Command::Consume {
            queue,
            prefetch,
            count,
        } => {
            let mut subscription = conn.open(&queue, prefetch.unwrap_or(default_prefetch)).await?;
            let mut received = 0;
            while count.is_none_or(|limit| received < limit) {
                let Some(mut delivery) = subscription.next().await? else {
                    break;
                };
                println!(
                    "{} {}",
                    delivery.id().unwrap_or("-"),
                    delivery.body()
                );
                delivery.ack().await?;
                received += 1;
            }
            subscription.close().await?;
        }
    }

    Ok(())
}
