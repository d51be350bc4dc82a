use serde::{Deserialize, Serialize};

use crate::{
    config::NetworkConfig,
    connectivity::ConnectivityState,
    event::{Schedule, WaterEvent},
    update::UpdateStatus,
};

#[derive(Debug, Clone, Serialize)]
pub struct DeviceStatus {
    #[serde(rename = "valveOpen")]
    pub valve_open: bool,
    #[serde(rename = "wateringStartedAt")]
    pub watering_started_at: Option<i64>,
    #[serde(rename = "lastDurationSeconds")]
    pub last_duration_seconds: u32,
    #[serde(rename = "queuedSessions")]
    pub queued_sessions: usize,
    #[serde(rename = "internetUp")]
    pub internet_up: bool,
    #[serde(rename = "connectivityState")]
    pub connectivity_state: ConnectivityState,
    #[serde(rename = "timeSynced")]
    pub time_synced: bool,
    pub schedule: Schedule,
    pub update: UpdateStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleSlotView {
    pub index: usize,
    #[serde(flatten)]
    pub event: WaterEvent,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct AddEventRequest {
    #[serde(default)]
    pub hour: u8,
    #[serde(default)]
    pub minute: u8,
    #[serde(rename = "skipSeconds", default)]
    pub skip_seconds: u32,
    #[serde(rename = "daysMask", default)]
    pub days_mask: u8,
    #[serde(rename = "durationSeconds")]
    pub duration_seconds: u32,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct AddEventResponse {
    pub index: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateRequest {
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateAccepted {
    pub accepted: bool,
    #[serde(rename = "restartInMs")]
    pub restart_in_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkConfigView {
    #[serde(rename = "wifiSsid")]
    pub wifi_ssid: String,
    #[serde(rename = "wifiPassSet")]
    pub wifi_pass_set: bool,
    pub hostname: String,
    #[serde(rename = "instanceName")]
    pub instance_name: String,
    #[serde(rename = "timeServer")]
    pub time_server: String,
    #[serde(rename = "updateUrl")]
    pub update_url: String,
    pub timezone: String,
}

impl From<&NetworkConfig> for NetworkConfigView {
    fn from(network: &NetworkConfig) -> Self {
        Self {
            wifi_ssid: network.wifi_ssid.clone(),
            wifi_pass_set: !network.wifi_pass.is_empty(),
            hostname: network.hostname.clone(),
            instance_name: network.instance_name.clone(),
            time_server: network.time_server.clone(),
            update_url: network.update_url.clone(),
            timezone: network.timezone.clone(),
        }
    }
}

/// Absent fields keep their current value; an absent password keeps the stored one.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NetworkConfigUpdate {
    #[serde(rename = "wifiSsid", default)]
    pub wifi_ssid: Option<String>,
    #[serde(rename = "wifiPass", default)]
    pub wifi_pass: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(rename = "instanceName", default)]
    pub instance_name: Option<String>,
    #[serde(rename = "timeServer", default)]
    pub time_server: Option<String>,
    #[serde(rename = "updateUrl", default)]
    pub update_url: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
}

impl NetworkConfigUpdate {
    pub fn apply_to(self, network: &mut NetworkConfig) {
        let fields = [
            (self.wifi_ssid, &mut network.wifi_ssid),
            (self.wifi_pass, &mut network.wifi_pass),
            (self.hostname, &mut network.hostname),
            (self.instance_name, &mut network.instance_name),
            (self.time_server, &mut network.time_server),
            (self.update_url, &mut network.update_url),
            (self.timezone, &mut network.timezone),
        ];
        for (value, slot) in fields {
            if let Some(value) = value {
                *slot = value;
            }
        }
        network.sanitize();
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkUpdateResponse {
    #[serde(rename = "restartRequired")]
    pub restart_required: bool,
    pub network: NetworkConfigView,
}
