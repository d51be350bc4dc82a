use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;

use crate::{config::ControllerConfig, ports::IndicatorPattern};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Connected,
    Pairing,
    AwaitingPairingPin,
}

impl ConnectivityState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Pairing => "pairing",
            Self::AwaitingPairingPin => "awaitingPairingPin",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The AP refused the station's rate set; retry with 802.11 b/g/n enabled.
    BasicRateNotSupported,
    Other(u16),
}

/// Inputs from the radio driver and from the timers owned by this machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetEvent {
    StationStarted { has_credentials: bool },
    /// The connect call itself returned an error.
    ConnectFailed,
    GotIp,
    Disconnected { reason: DisconnectReason },
    ConnectTimeout,
    ReconnectDue,
    PairingSucceeded,
    PairingFailed,
    PairingTimeout,
    PairingPin(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetAction {
    Connect,
    ArmConnectTimeout(Duration),
    CancelConnectTimeout,
    ArmReconnect(Duration),
    CancelReconnect,
    EnablePairing,
    DisablePairing,
    EnableLegacyProtocols,
    StartServices,
    StopServices,
    StartTimeSync,
    Indicator(IndicatorPattern),
    ShowPin(String),
}

#[derive(Debug, Clone)]
pub struct ConnectivityManager {
    state: ConnectivityState,
    connect_timeout: Duration,
    backoff_base: Duration,
    backoff_max: Duration,
    /// Consecutive failed attempts since the last connect or pairing entry.
    failures: u32,
    /// Set while the boot-time attempt with stored credentials is in flight.
    initial_attempt: bool,
}

impl ConnectivityManager {
    pub fn new(config: &ControllerConfig) -> Self {
        Self {
            state: ConnectivityState::Idle,
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            backoff_base: Duration::from_millis(config.reconnect_backoff_base_ms),
            backoff_max: Duration::from_millis(config.reconnect_backoff_max_ms),
            failures: 0,
            initial_attempt: false,
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    pub fn internet_up(&self) -> bool {
        self.state == ConnectivityState::Connected
    }

    pub fn handle(&mut self, event: NetEvent) -> Vec<NetAction> {
        use ConnectivityState as S;

        let before = self.state;
        let actions = match (self.state, event) {
            (S::Idle, NetEvent::StationStarted { has_credentials: true }) => {
                self.initial_attempt = true;
                self.state = S::Connecting;
                vec![
                    NetAction::Connect,
                    NetAction::ArmConnectTimeout(self.connect_timeout),
                ]
            }
            (S::Idle, NetEvent::StationStarted { has_credentials: false }) => {
                info!("no stored station credentials");
                self.enter_pairing(Vec::new())
            }

            (S::Connecting, NetEvent::ConnectFailed) if self.initial_attempt => {
                warn!("connect with stored credentials failed immediately");
                self.enter_pairing(vec![NetAction::CancelConnectTimeout])
            }
            (S::Connecting, NetEvent::ConnectFailed) => {
                self.schedule_retry(DisconnectReason::Other(0), Vec::new())
            }
            (S::Connecting, NetEvent::Disconnected { reason }) => {
                self.schedule_retry(reason, Vec::new())
            }
            (S::Connecting, NetEvent::ReconnectDue) => vec![NetAction::Connect],
            (S::Connecting, NetEvent::ConnectTimeout) => {
                warn!("no connection within {:?}", self.connect_timeout);
                self.enter_pairing(vec![NetAction::CancelReconnect])
            }

            (S::Connected, NetEvent::Disconnected { reason }) => {
                warn!("connection lost ({reason:?})");
                self.state = S::Connecting;
                self.schedule_retry(
                    reason,
                    vec![
                        NetAction::StopServices,
                        NetAction::Indicator(IndicatorPattern::FastBlink),
                    ],
                )
            }
            (S::Connected, NetEvent::GotIp) => {
                debug!("address renewed while connected");
                Vec::new()
            }

            (S::Pairing | S::AwaitingPairingPin, NetEvent::PairingSucceeded) => {
                info!("pairing obtained credentials");
                self.failures = 0;
                self.initial_attempt = false;
                self.state = S::Connecting;
                vec![
                    NetAction::DisablePairing,
                    NetAction::Indicator(IndicatorPattern::FastBlink),
                    NetAction::Connect,
                    NetAction::ArmConnectTimeout(self.connect_timeout),
                ]
            }
            (
                S::Pairing | S::AwaitingPairingPin,
                NetEvent::PairingFailed | NetEvent::PairingTimeout,
            ) => {
                info!("pairing attempt ended without credentials; restarting pairing");
                self.state = S::Pairing;
                vec![NetAction::DisablePairing, NetAction::EnablePairing]
            }
            (S::Pairing, NetEvent::PairingPin(pin)) => {
                self.state = S::AwaitingPairingPin;
                vec![NetAction::ShowPin(pin)]
            }

            (S::Idle | S::Connecting | S::Pairing | S::AwaitingPairingPin, NetEvent::GotIp) => {
                let mut actions = Vec::new();
                if matches!(self.state, S::Pairing | S::AwaitingPairingPin) {
                    actions.push(NetAction::DisablePairing);
                }
                self.enter_connected(actions)
            }

            (state, event) => {
                debug!("ignoring {event:?} in {state:?}");
                Vec::new()
            }
        };

        if self.state != before {
            info!(
                "connectivity: {} -> {}",
                before.as_str(),
                self.state.as_str()
            );
        }
        actions
    }

    /// Zero for the first retry, then `base * 2^(n-1)` up to the cap.
    pub fn backoff(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }

    fn schedule_retry(&mut self, reason: DisconnectReason, mut actions: Vec<NetAction>) -> Vec<NetAction> {
        let delay = self.backoff(self.failures);
        self.failures = self.failures.saturating_add(1);

        if reason == DisconnectReason::BasicRateNotSupported {
            actions.push(NetAction::EnableLegacyProtocols);
        }
        if delay.is_zero() {
            actions.push(NetAction::Connect);
        } else {
            debug!("reconnect #{} in {delay:?}", self.failures);
            actions.push(NetAction::ArmReconnect(delay));
        }
        actions.push(NetAction::ArmConnectTimeout(self.connect_timeout + delay));
        actions
    }

    fn enter_pairing(&mut self, mut actions: Vec<NetAction>) -> Vec<NetAction> {
        self.state = ConnectivityState::Pairing;
        self.failures = 0;
        self.initial_attempt = false;
        actions.push(NetAction::EnablePairing);
        actions.push(NetAction::Indicator(IndicatorPattern::SlowBlink));
        actions
    }

    fn enter_connected(&mut self, mut actions: Vec<NetAction>) -> Vec<NetAction> {
        self.state = ConnectivityState::Connected;
        self.failures = 0;
        self.initial_attempt = false;
        actions.extend([
            NetAction::CancelConnectTimeout,
            NetAction::CancelReconnect,
            NetAction::Indicator(IndicatorPattern::Off),
            NetAction::StartServices,
            NetAction::StartTimeSync,
        ]);
        actions
    }
}
