use log::warn;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Secret shipped as a placeholder; running with it logs a warning.
pub const DEFAULT_SECRET_KEY: &str = "default-unsafe-secret";
pub const DEFAULT_WEBHOOK_SECRET: &str = "btcpay-webhook-secret";
pub const DEFAULT_MAX_WASH_DURATION: u32 = 3600;

/// Load environment variables from .env file with robust parsing.
/// Handles values with spaces without requiring quotes.
pub fn load_dotenv() {
    load_dotenv_from(Path::new(".env"));
}

fn load_dotenv_from(env_path: &Path) {
    let Ok(content) = fs::read_to_string(env_path) else {
        return;
    };

    for (key, value) in parse_dotenv(&content) {
        // Only set if not already set (env vars take precedence)
        if std::env::var(key).is_err() {
            // SAFETY: called first thing in main, before any task reads the environment
            unsafe { std::env::set_var(key, value) };
        }
    }
}

/// Split `.env` content into key/value pairs, skipping blanks and comments.
fn parse_dotenv(content: &str) -> Vec<(&str, &str)> {
    let mut pairs = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        // Find the first '=' and split there
        if let Some(eq_pos) = line.find('=') {
            let key = line[..eq_pos].trim();
            let mut value = line[eq_pos + 1..].trim();

            // Remove surrounding quotes if present
            if value.len() >= 2
                && ((value.starts_with('"') && value.ends_with('"'))
                    || (value.starts_with('\'') && value.ends_with('\'')))
            {
                value = &value[1..value.len() - 1];
            }
            pairs.push((key, value));
        }
    }
    pairs
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub wash: WashConfig,
    pub gpio: GpioConfig,
    pub webhook: WebhookConfig,
    pub bitcoin_switch: BitcoinSwitchConfig,
    pub mqtt: MqttConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WashConfig {
    /// Shared secret for privileged operator commands.
    pub secret_key: String,
    /// Upper bound for a single start/extend request, in seconds.
    pub max_wash_duration: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpioMode {
    Sysfs,
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpioConfig {
    pub mode: GpioMode,
    pub relay_pin: u32,
    pub maintenance_switch_pin: u32,
    /// Status file written by the coin acceptor ("ON" while it holds the machine).
    pub external_status_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitcoinSwitchConfig {
    pub enabled: bool,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub enabled: bool,
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_prefix: String,
    /// Pause after a broker connection error before reconnecting.
    pub reconnect_delay_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            wash: WashConfig {
                secret_key: DEFAULT_SECRET_KEY.to_string(),
                max_wash_duration: DEFAULT_MAX_WASH_DURATION,
            },
            gpio: GpioConfig {
                mode: if Path::new("/sys/class/gpio").exists() {
                    GpioMode::Sysfs
                } else {
                    GpioMode::Simulated
                },
                relay_pin: 17,
                maintenance_switch_pin: 18,
                external_status_file: PathBuf::from("external_status.txt"),
            },
            webhook: WebhookConfig {
                enabled: true,
                secret: DEFAULT_WEBHOOK_SECRET.to_string(),
            },
            bitcoin_switch: BitcoinSwitchConfig {
                enabled: true,
                url: "ws://umbrel.local:3003/apps/32KCJgUTzUBBZD8GJprDxdGMSrXM/pos/bitcoinswitch"
                    .to_string(),
            },
            mqtt: MqttConfig {
                enabled: true,
                broker_host: "localhost".to_string(),
                broker_port: 1883,
                client_id: "lightning-wash".to_string(),
                username: None,
                password: None,
                topic_prefix: "lightning-wash".to_string(),
                reconnect_delay_secs: 5,
            },
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().eq_ignore_ascii_case("true"))
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(secret) = std::env::var("WASHING_MACHINE_SECRET") {
            config.wash.secret_key = secret;
        }
        if let Ok(max) = std::env::var("MAX_WASH_DURATION")
            && let Ok(m) = max.parse()
        {
            config.wash.max_wash_duration = m;
        }

        // GPIO configuration
        if let Ok(mode) = std::env::var("GPIO_MODE") {
            match mode.to_ascii_lowercase().as_str() {
                "sysfs" => config.gpio.mode = GpioMode::Sysfs,
                "simulated" => config.gpio.mode = GpioMode::Simulated,
                other => warn!("[Config] Unknown GPIO_MODE '{}', keeping {:?}", other, config.gpio.mode),
            }
        }
        if let Ok(pin) = std::env::var("RELAY_PIN")
            && let Ok(p) = pin.parse()
        {
            config.gpio.relay_pin = p;
        }
        if let Ok(pin) = std::env::var("MAINTENANCE_SWITCH_PIN")
            && let Ok(p) = pin.parse()
        {
            config.gpio.maintenance_switch_pin = p;
        }
        if let Ok(path) = std::env::var("EXTERNAL_STATUS_FILE") {
            config.gpio.external_status_file = PathBuf::from(path);
        }

        // BTCPay integrations
        if let Some(enabled) = env_flag("ENABLE_WEBHOOK_INTEGRATION") {
            config.webhook.enabled = enabled;
        }
        if let Ok(secret) = std::env::var("BTCPAY_WEBHOOK_SECRET") {
            config.webhook.secret = secret;
        }
        if let Some(enabled) = env_flag("ENABLE_BITCOINSWITCH_INTEGRATION") {
            config.bitcoin_switch.enabled = enabled;
        }
        if let Ok(url) = std::env::var("BTCPAY_WEBSOCKET_URL") {
            config.bitcoin_switch.url = url;
        }

        // MQTT configuration
        if let Some(enabled) = env_flag("ENABLE_MQTT_INTEGRATION") {
            config.mqtt.enabled = enabled;
        }
        if let Ok(host) = std::env::var("MQTT_BROKER_HOST") {
            config.mqtt.broker_host = host;
        }
        if let Ok(port) = std::env::var("MQTT_BROKER_PORT")
            && let Ok(p) = port.parse()
        {
            config.mqtt.broker_port = p;
        }
        if let Ok(client_id) = std::env::var("MQTT_CLIENT_ID") {
            config.mqtt.client_id = client_id;
        }
        if let Ok(username) = std::env::var("MQTT_USERNAME") {
            config.mqtt.username = Some(username);
        }
        if let Ok(password) = std::env::var("MQTT_PASSWORD") {
            config.mqtt.password = Some(password);
        }
        if let Ok(prefix) = std::env::var("MQTT_TOPIC_PREFIX") {
            config.mqtt.topic_prefix = prefix;
        }
        if let Ok(delay) = std::env::var("MQTT_RECONNECT_DELAY")
            && let Ok(d) = delay.parse()
        {
            config.mqtt.reconnect_delay_secs = d;
        }

        config
    }

    /// Log a warning for every secret still set to its shipped placeholder.
    pub fn warn_insecure_defaults(&self) {
        if self.wash.secret_key == DEFAULT_SECRET_KEY {
            warn!("[Config] Using the default secret key. Set WASHING_MACHINE_SECRET.");
        }
        if self.webhook.enabled && self.webhook.secret == DEFAULT_WEBHOOK_SECRET {
            warn!("[Config] Using the default webhook secret. Set BTCPAY_WEBHOOK_SECRET.");
        }
    }
}
