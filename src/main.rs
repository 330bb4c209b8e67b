use clap::Parser;
use lightning_wash::config::{self, Config, GpioMode};
use lightning_wash::controller::ActivationController;
use lightning_wash::device::{Actuator, SimulatedRelay, StatusFileSensor, SysfsRelay};
use lightning_wash::input::bitcoin_switch::SwitchHandler;
use lightning_wash::input::{BitcoinSwitchClient, MqttIntegration, OperatorService, WebhookHandler};
use lightning_wash::instance_lock::{InstanceLock, InstanceLockError};
use lightning_wash::invoice::InvoiceTracker;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "lightning-wash")]
#[command(about = "Pay-per-use washing machine relay controller for BTCPay Server")]
struct Cli {
    /// Connect to the BTCPay Bitcoin Switch websocket
    #[arg(long)]
    bitcoinswitch: bool,

    /// Accept operator commands over MQTT
    #[arg(long)]
    mqtt: bool,

    /// Enable every integration
    #[arg(long)]
    all: bool,
}

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn build_actuator(config: &Config) -> Arc<dyn Actuator> {
    match config.gpio.mode {
        GpioMode::Sysfs => match SysfsRelay::new(config.gpio.relay_pin) {
            Ok(relay) => Arc::new(relay),
            Err(e) => {
                error!("[Relay] Failed to initialize GPIO: {}", e);
                std::process::exit(1);
            }
        },
        GpioMode::Simulated => {
            warn!("[Relay] GPIO not available, using a simulated relay");
            Arc::new(SimulatedRelay::new(config.gpio.relay_pin))
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Load .env file before anything else
    config::load_dotenv();
    init_logger();
    info!("Starting Lightning Wash");

    let _lock = match InstanceLock::acquire() {
        Ok(lock) => lock,
        Err(InstanceLockError::AlreadyRunning) => {
            error!("Another instance is already running");
            std::process::exit(1);
        }
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let mut config = Config::from_env();
    if cli.bitcoinswitch || cli.all {
        config.bitcoin_switch.enabled = true;
    }
    if cli.mqtt || cli.all {
        config.mqtt.enabled = true;
    }
    config.warn_insecure_defaults();

    info!("Configuration loaded:");
    info!("  Max wash duration: {}s", config.wash.max_wash_duration);
    info!(
        "  GPIO: {:?}, relay pin {}, maintenance switch pin {}",
        config.gpio.mode, config.gpio.relay_pin, config.gpio.maintenance_switch_pin
    );
    info!("  External status file: {}", config.gpio.external_status_file.display());

    let actuator = build_actuator(&config);
    let sensor = Arc::new(StatusFileSensor::new(config.gpio.external_status_file.clone()));
    let controller = ActivationController::new(actuator, sensor, config.wash.max_wash_duration);

    let tracker = Arc::new(InvoiceTracker::new(controller.clone()));
    let mut tasks = vec![tracker.spawn_cleanup()];

    if config.bitcoin_switch.enabled {
        let handler = SwitchHandler::new(config.gpio.relay_pin, controller.clone());
        match BitcoinSwitchClient::new(config.bitcoin_switch.url.clone(), handler) {
            Ok(client) => tasks.push(client.start()),
            Err(e) => error!("[Switch] Not starting: {}", e),
        }
    } else {
        info!("[Switch] Bitcoin Switch integration disabled");
    }

    if config.mqtt.enabled {
        let operator = OperatorService::new(controller.clone(), config.wash.secret_key.clone());
        let mut integration = MqttIntegration::new(config.mqtt.clone(), operator);
        if config.webhook.enabled {
            integration = integration.with_webhook(WebhookHandler::new(
                config.webhook.clone(),
                tracker.clone(),
                config.wash.max_wash_duration,
            ));
        }
        tasks.push(integration.start());
    } else {
        info!("[MQTT] MQTT integration disabled");
    }

    info!("Lightning Wash is running");
    info!("  - Press Ctrl+C to exit");

    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received shutdown signal");
        }
        Err(e) => {
            error!("Failed to listen for shutdown signal: {}", e);
        }
    }

    for task in &tasks {
        task.abort();
    }
    controller.shutdown(SHUTDOWN_TIMEOUT).await;

    info!("Lightning Wash stopped");
}
