//! Collaborators the device core drives. The ESP shell backs these with GPIO, the WiFi
//! driver, SNTP and mDNS; the host shell backs them with a simulator.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::NetworkConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum IndicatorPattern {
    Off,
    SlowBlink,
    FastBlink,
}

pub trait ValveOutput: Send {
    fn set_open(&mut self, open: bool) -> anyhow::Result<()>;
}

pub trait StatusIndicator: Send {
    fn set_pattern(&mut self, pattern: IndicatorPattern);
}

/// Station interface plus push-button pairing. Results arrive later as `NetEvent`s.
pub trait NetworkPort: Send {
    fn connect(&mut self) -> anyhow::Result<()>;
    fn enable_pairing(&mut self) -> anyhow::Result<()>;
    fn disable_pairing(&mut self) -> anyhow::Result<()>;
    /// Allow 802.11 b/g/n for access points that reject the default rate set.
    fn enable_legacy_protocols(&mut self) -> anyhow::Result<()>;
}

/// Services that only run while the station is connected: request surface and advertisement.
pub trait ServiceHost: Send {
    fn start(&mut self, config: &NetworkConfig) -> anyhow::Result<()>;
    fn stop(&mut self);
    fn start_time_sync(&mut self, server: &str) -> anyhow::Result<()>;
    fn show_pin(&mut self, pin: &str);
}

pub trait Clock: Send + Sync {
    fn monotonic_ms(&self) -> u64;
    /// `None` until wall-clock time has been synchronized.
    fn now_utc(&self) -> Option<DateTime<Utc>>;
}

pub trait Restarter: Send {
    fn restart(&mut self);
}
