use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "TROVOBOT_";

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub trovo: TrovoConfig,
    pub store: StoreConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TrovoConfig {
    pub client_id: String,
    pub client_secret: String,
    pub channel_id: String,
    pub gateway_url: String,
    pub api_url: String,
    /// Message sent through the chat-send endpoint once the gateway
    /// acknowledges authentication.
    pub greeting: String,
}

impl Default for TrovoConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            channel_id: String::new(),
            gateway_url: "wss://open-chat.trovo.live/chat".to_string(),
            api_url: "https://open-api.trovo.live/openplatform".to_string(),
            greeting: "Awakening".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: String,
    pub backup_on_start: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: "data".to_string(),
            backup_on_start: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Delay between reconnect attempts. Deliberately fixed, no backoff; the
    /// floor in validate() keeps the client from hot-looping against the
    /// gateway during outages.
    pub reconnect_delay_secs: u64,
    pub heartbeat_gap_secs: u64,
    /// Upper bound on the chat-token fetch performed on the outbound hot path.
    pub token_fetch_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_secs: 5,
            heartbeat_gap_secs: 30,
            token_fetch_timeout_secs: 10,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = Self::default();
        let config_path = active_config_path();

        if let Ok(raw) = fs::read_to_string(&config_path) {
            config = toml::from_str::<Config>(&raw)?;
        }

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var(format!("{}CLIENT_ID", ENV_PREFIX)) {
            self.trovo.client_id = val;
        }
        if let Ok(val) = env::var(format!("{}CLIENT_SECRET", ENV_PREFIX)) {
            self.trovo.client_secret = val;
        }
        if let Ok(val) = env::var(format!("{}CHANNEL_ID", ENV_PREFIX)) {
            self.trovo.channel_id = val;
        }
        if let Ok(val) = env::var(format!("{}GATEWAY_URL", ENV_PREFIX)) {
            self.trovo.gateway_url = val;
        }
        if let Ok(val) = env::var(format!("{}API_URL", ENV_PREFIX)) {
            self.trovo.api_url = val;
        }
        if let Ok(val) = env::var(format!("{}GREETING", ENV_PREFIX)) {
            self.trovo.greeting = val;
        }
        if let Ok(val) = env::var(format!("{}DATA_DIR", ENV_PREFIX)) {
            self.store.data_dir = val;
        }
        if let Ok(val) = env::var(format!("{}BACKUP_ON_START", ENV_PREFIX)) {
            self.store.backup_on_start = val.parse().unwrap_or(true);
        }
        if let Ok(val) = env::var(format!("{}RECONNECT_DELAY_SECS", ENV_PREFIX)) {
            if let Ok(secs) = val.parse() {
                self.session.reconnect_delay_secs = secs;
            }
        }
        if let Ok(val) = env::var(format!("{}HEARTBEAT_GAP_SECS", ENV_PREFIX)) {
            if let Ok(secs) = val.parse() {
                self.session.heartbeat_gap_secs = secs;
            }
        }
        if let Ok(val) = env::var(format!("{}TOKEN_FETCH_TIMEOUT_SECS", ENV_PREFIX)) {
            if let Ok(secs) = val.parse() {
                self.session.token_fetch_timeout_secs = secs;
            }
        }
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.trovo.client_id.trim().is_empty() {
            return Err("trovo.client_id is required".into());
        }
        if self.trovo.client_secret.trim().is_empty() {
            return Err("trovo.client_secret is required".into());
        }
        if self.trovo.channel_id.trim().is_empty() {
            return Err("trovo.channel_id is required".into());
        }
        if self.trovo.gateway_url.trim().is_empty() {
            return Err("trovo.gateway_url must be set".into());
        }
        if self.trovo.api_url.trim().is_empty() {
            return Err("trovo.api_url must be set".into());
        }
        if self.store.data_dir.trim().is_empty() {
            return Err("store.data_dir must be set".into());
        }
        if self.session.reconnect_delay_secs < 3 {
            return Err("session.reconnect_delay_secs must be >= 3".into());
        }
        if self.session.heartbeat_gap_secs == 0 {
            return Err("session.heartbeat_gap_secs must be non-zero".into());
        }
        if self.session.token_fetch_timeout_secs == 0 {
            return Err("session.token_fetch_timeout_secs must be non-zero".into());
        }
        Ok(())
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err("config.toml already exists".into());
        }
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        active_config_path()
    }
}

fn active_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{}CONFIG_PATH", ENV_PREFIX)) {
        return PathBuf::from(path);
    }
    PathBuf::from(CONFIG_FILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> Config {
        let mut cfg = Config::default();
        cfg.trovo.client_id = "client".to_string();
        cfg.trovo.client_secret = "secret".to_string();
        cfg.trovo.channel_id = "12345".to_string();
        cfg
    }

    #[test]
    fn default_config_round_trips_through_toml() {
        let cfg = Config::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.trovo.gateway_url, cfg.trovo.gateway_url);
        assert_eq!(parsed.session.reconnect_delay_secs, 5);
    }

    #[test]
    fn validate_requires_credentials() {
        assert!(Config::default().validate().is_err());
        assert!(configured().validate().is_ok());

        let mut cfg = configured();
        cfg.trovo.channel_id = "  ".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_enforces_reconnect_floor() {
        let mut cfg = configured();
        cfg.session.reconnect_delay_secs = 2;
        assert!(cfg.validate().is_err());
        cfg.session.reconnect_delay_secs = 3;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_timers() {
        let mut cfg = configured();
        cfg.session.heartbeat_gap_secs = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = configured();
        cfg.session.token_fetch_timeout_secs = 0;
        assert!(cfg.validate().is_err());
    }
}
