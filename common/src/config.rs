use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::store::KvStore;

pub const MAX_SSID_BYTES: usize = 32;
pub const MAX_PASSWORD_BYTES: usize = 64;

pub const KEY_WIFI_SSID: &str = "wifi_ssid";
pub const KEY_WIFI_PASS: &str = "wifi_pass";
pub const KEY_HOSTNAME: &str = "hostname";
pub const KEY_INSTANCE_NAME: &str = "instance_name";
pub const KEY_TIME_SERVER: &str = "ntp_server";
pub const KEY_UPDATE_URL: &str = "update_url";
pub const KEY_TIMEZONE: &str = "timezone";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub tick_period_ms: u64,
    pub connect_timeout_ms: u64,
    pub reconnect_backoff_base_ms: u64,
    pub reconnect_backoff_max_ms: u64,
    pub restart_delay_ms: u64,
    pub update_chunk_size: usize,
    pub manual_watering_secs: u32,
    pub session_queue_capacity: usize,
    /// Accept `file://` update URLs (host simulator only).
    #[serde(default)]
    pub allow_file_urls: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_period_ms: 60_000,
            connect_timeout_ms: 30_000,
            reconnect_backoff_base_ms: 2_000,
            reconnect_backoff_max_ms: 60_000,
            restart_delay_ms: 3_000,
            update_chunk_size: 4096,
            manual_watering_secs: 900,
            session_queue_capacity: 5,
            allow_file_urls: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub hostname: String,
    pub instance_name: String,
    pub time_server: String,
    pub update_url: String,
    pub timezone: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            hostname: "bat".to_string(),
            instance_name: "irrigation".to_string(),
            time_server: "pool.ntp.org".to_string(),
            update_url: String::new(),
            timezone: "UTC".to_string(),
        }
    }
}

impl NetworkConfig {
    /// Reads each field from its own string key. Missing keys keep their defaults.
    pub fn load(store: &dyn KvStore) -> anyhow::Result<Self> {
        let mut config = Self::default();

        let fields: [(&str, &mut String); 7] = [
            (KEY_WIFI_SSID, &mut config.wifi_ssid),
            (KEY_WIFI_PASS, &mut config.wifi_pass),
            (KEY_HOSTNAME, &mut config.hostname),
            (KEY_INSTANCE_NAME, &mut config.instance_name),
            (KEY_TIME_SERVER, &mut config.time_server),
            (KEY_UPDATE_URL, &mut config.update_url),
            (KEY_TIMEZONE, &mut config.timezone),
        ];
        for (key, slot) in fields {
            if let Some(value) = store.get_str(key)? {
                *slot = value;
            }
        }

        config.sanitize();
        Ok(config)
    }

    pub fn save(&self, store: &mut dyn KvStore) -> anyhow::Result<()> {
        store.set_str(KEY_WIFI_SSID, &self.wifi_ssid)?;
        store.set_str(KEY_WIFI_PASS, &self.wifi_pass)?;
        store.set_str(KEY_HOSTNAME, &self.hostname)?;
        store.set_str(KEY_INSTANCE_NAME, &self.instance_name)?;
        store.set_str(KEY_TIME_SERVER, &self.time_server)?;
        store.set_str(KEY_UPDATE_URL, &self.update_url)?;
        store.set_str(KEY_TIMEZONE, &self.timezone)?;
        Ok(())
    }

    pub fn sanitize(&mut self) {
        let defaults = Self::default();

        self.wifi_ssid = self.wifi_ssid.trim().to_string();
        truncate_to_bytes(&mut self.wifi_ssid, MAX_SSID_BYTES);
        truncate_to_bytes(&mut self.wifi_pass, MAX_PASSWORD_BYTES);

        if self.hostname.trim().is_empty() {
            self.hostname = defaults.hostname;
        }
        if self.instance_name.trim().is_empty() {
            self.instance_name = defaults.instance_name;
        }
        if self.time_server.trim().is_empty() {
            self.time_server = defaults.time_server;
        }
        if self.timezone.parse::<Tz>().is_err() {
            self.timezone = defaults.timezone;
        }
        self.update_url = self.update_url.trim().to_string();
    }

    /// Station settings are only read when the radio starts.
    pub fn restart_required(&self, previous: &Self) -> bool {
        previous.wifi_ssid != self.wifi_ssid
            || previous.wifi_pass != self.wifi_pass
            || previous.hostname != self.hostname
            || previous.instance_name != self.instance_name
    }

    pub fn timezone(&self) -> Tz {
        self.timezone.parse().unwrap_or(Tz::UTC)
    }

    pub fn has_station_credentials(&self) -> bool {
        let ssid = self.wifi_ssid.trim();
        !ssid.is_empty() && ssid != "CHANGE_ME"
    }
}

fn truncate_to_bytes(value: &mut String, max: usize) {
    if value.len() <= max {
        return;
    }
    let mut end = max;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value.truncate(end);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryStore;

    #[test]
    fn load_falls_back_to_defaults() {
        let store = MemoryStore::default();
        let config = NetworkConfig::load(&store).unwrap();

        assert_eq!(config, NetworkConfig::default());
        assert!(!config.has_station_credentials());
    }

    #[test]
    fn load_reads_string_keys_and_sanitizes() {
        let mut store = MemoryStore::default();
        store.set_str(KEY_WIFI_SSID, "  garden  ").unwrap();
        store.set_str(KEY_HOSTNAME, " ").unwrap();
        store.set_str(KEY_TIMEZONE, "Mars/Olympus").unwrap();
        store
            .set_str(KEY_UPDATE_URL, "http://10.0.0.2/fw.bin")
            .unwrap();

        let config = NetworkConfig::load(&store).unwrap();

        assert_eq!(config.wifi_ssid, "garden");
        assert_eq!(config.hostname, "bat");
        assert_eq!(config.timezone, "UTC");
        assert_eq!(config.update_url, "http://10.0.0.2/fw.bin");
        assert!(config.has_station_credentials());
    }

    #[test]
    fn instance_name_survives_save_and_load() {
        let mut store = MemoryStore::default();
        let previous = NetworkConfig::default();
        let renamed = NetworkConfig {
            instance_name: "backyard".to_string(),
            ..previous.clone()
        };

        renamed.save(&mut store).unwrap();
        let reloaded = NetworkConfig::load(&store).unwrap();

        assert_eq!(reloaded.instance_name, "backyard");
        assert_eq!(reloaded, renamed);
        assert!(reloaded.restart_required(&previous));
    }

    #[test]
    fn credentials_are_clamped_to_radio_limits() {
        let mut config = NetworkConfig {
            wifi_ssid: "s".repeat(40),
            wifi_pass: "p".repeat(70),
            ..NetworkConfig::default()
        };
        config.sanitize();

        assert_eq!(config.wifi_ssid.len(), MAX_SSID_BYTES);
        assert_eq!(config.wifi_pass.len(), MAX_PASSWORD_BYTES);
    }

    #[test]
    fn only_station_fields_require_restart() {
        let previous = NetworkConfig::default();
        let retimed = NetworkConfig {
            timezone: "Europe/Berlin".to_string(),
            update_url: "http://fw/latest.bin".to_string(),
            ..previous.clone()
        };
        let moved = NetworkConfig {
            wifi_ssid: "garden".to_string(),
            ..previous.clone()
        };

        assert!(!retimed.restart_required(&previous));
        assert!(moved.restart_required(&previous));
        assert_eq!(retimed.timezone(), chrono_tz::Europe::Berlin);
    }
}
