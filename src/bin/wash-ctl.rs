//! Operator tool for a running lightning-wash controller.
//!
//! Publishes one command on the MQTT command topic and prints the reply.
//!
//! Usage:
//!   cargo run --bin wash-ctl -- status
//!   cargo run --bin wash-ctl -- start 600
//!   cargo run --bin wash-ctl -- add-time 120
//!   cargo run --bin wash-ctl -- stop

use clap::{Parser, Subcommand};
use lightning_wash::config::{self, Config};
use lightning_wash::input::mqtt::{MqttClient, MqttMessage, Topics};
use lightning_wash::input::{OperatorAction, OperatorReply};
use serde_json::json;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

#[derive(Parser)]
#[command(name = "wash-ctl")]
#[command(about = "Send operator commands to a running lightning-wash controller")]
struct Cli {
    /// Operator secret (WASHING_MACHINE_SECRET on the controller)
    #[arg(long, env = "WASHING_MACHINE_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Seconds to wait for the reply
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a wash (tops up a running one)
    Start {
        /// Duration in seconds
        duration: u32,
    },
    /// Add time to the running wash
    AddTime {
        /// Seconds to add
        duration: u32,
    },
    /// Stop the running wash
    Stop,
    /// Show the current status
    Status,
}

impl Commands {
    fn action(&self) -> OperatorAction {
        match self {
            Self::Start { .. } => OperatorAction::StartWash,
            Self::AddTime { .. } => OperatorAction::AddTime,
            Self::Stop => OperatorAction::StopWash,
            Self::Status => OperatorAction::Status,
        }
    }

    fn duration(&self) -> Option<u32> {
        match self {
            Self::Start { duration } | Self::AddTime { duration } => Some(*duration),
            Self::Stop | Self::Status => None,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    config::load_dotenv();
    let cli = Cli::parse();
    let config = Config::from_env();
    let topics = Topics::new(config.mqtt.topic_prefix.as_str());

    let action = cli.command.action();
    let request_id = format!("wash-ctl-{}", std::process::id());
    let mut request = json!({ "id": request_id });
    if action.is_privileged() {
        let Some(secret) = cli.secret.as_deref() else {
            eprintln!("{} needs --secret or WASHING_MACHINE_SECRET", action);
            std::process::exit(2);
        };
        request["secret"] = json!(secret);
    }
    if let Some(duration) = cli.command.duration() {
        request["duration"] = json!(duration);
    }

    println!(
        "Connecting to MQTT broker at {}:{}...",
        config.mqtt.broker_host, config.mqtt.broker_port
    );
    let mqtt_client = MqttClient::with_client_id(&config.mqtt, &request_id);
    let client = mqtt_client.client();

    let (msg_tx, mut msg_rx) = mpsc::channel::<MqttMessage>(16);
    let (connections_tx, mut connections) = watch::channel(0u64);
    let mqtt_loop = tokio::spawn(async move {
        mqtt_client.run(msg_tx, connections_tx).await;
    });

    let wait = Duration::from_secs(cli.timeout);
    let connected = tokio::time::timeout(wait, async {
        connections.wait_for(|count| *count > 0).await.is_ok()
    })
    .await;
    if !matches!(connected, Ok(true)) {
        eprintln!("Timeout connecting to the broker");
        mqtt_loop.abort();
        std::process::exit(1);
    }

    client
        .subscribe(topics.reply(), rumqttc::QoS::AtLeastOnce)
        .await?;
    // Give the broker a moment to register the subscription.
    tokio::time::sleep(Duration::from_millis(100)).await;
    client
        .publish(
            topics.command(action),
            rumqttc::QoS::AtLeastOnce,
            false,
            request.to_string(),
        )
        .await?;

    let reply = tokio::time::timeout(wait, async {
        while let Some(msg) = msg_rx.recv().await {
            if let Ok(reply) = serde_json::from_str::<OperatorReply>(&msg.payload)
                && reply.id.as_deref() == Some(request_id.as_str())
            {
                return Some(reply);
            }
        }
        None
    })
    .await;
    mqtt_loop.abort();

    match reply {
        Ok(Some(reply)) => {
            println!("{} -> {}", reply.action, reply.code);
            println!("{}", serde_json::to_string_pretty(&reply.body)?);
            if !reply.is_success() {
                std::process::exit(1);
            }
        }
        Ok(None) => {
            eprintln!("Connection closed before receiving a reply");
            std::process::exit(1);
        }
        Err(_) => {
            eprintln!("Timeout waiting for a reply. Is the controller running with MQTT enabled?");
            std::process::exit(1);
        }
    }

    Ok(())
}
