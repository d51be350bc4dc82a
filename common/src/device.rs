use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chrono::{DateTime, FixedOffset};
use chrono_tz::Tz;
use log::{debug, info, warn};

use crate::{
    actuator::{Actuator, OpenOutcome, ValveAction},
    config::{ControllerConfig, NetworkConfig},
    connectivity::{ConnectivityManager, ConnectivityState, NetAction, NetEvent},
    error::{IrrigationError, Result},
    event::{Schedule, WaterEvent},
    ports::{Clock, NetworkPort, Restarter, ServiceHost, StatusIndicator, ValveOutput},
    scheduler::Scheduler,
    store::{EventStore, KvStore},
    timer::{TimerId, TimerService, TimerToken, Timers},
    types::{DeviceStatus, NetworkConfigUpdate},
    update::{validate_update_url, FirmwareSource, UpdateManager, UpdatePartition, UpdateStatus},
};

/// Everything the device drives. Built by the platform shell.
pub struct DeviceParts {
    pub store: Box<dyn KvStore>,
    pub valve: Box<dyn ValveOutput>,
    pub indicator: Box<dyn StatusIndicator>,
    pub network: Box<dyn NetworkPort>,
    pub services: Box<dyn ServiceHost>,
    pub timers: Box<dyn TimerService>,
    pub clock: Box<dyn Clock>,
    pub restarter: Box<dyn Restarter>,
    pub firmware_source: Box<dyn FirmwareSource>,
    pub update_partition: Box<dyn UpdatePartition>,
}

struct Core {
    config: ControllerConfig,
    network_config: NetworkConfig,
    tz: Tz,

    events: EventStore,
    actuator: Actuator,
    scheduler: Scheduler,
    connectivity: ConnectivityManager,
    timers: Timers,
    update: UpdateStatus,

    store: Box<dyn KvStore>,
    valve: Box<dyn ValveOutput>,
    indicator: Box<dyn StatusIndicator>,
    network: Box<dyn NetworkPort>,
    timer_service: Box<dyn TimerService>,
    clock: Box<dyn Clock>,
    restarter: Box<dyn Restarter>,
}

/// Service work queued by the connectivity machine. It runs after the core lock is
/// released: stopping the request surface waits for in-flight handlers, which need the core.
#[derive(Debug)]
enum ServiceCall {
    Start(NetworkConfig),
    Stop,
    StartTimeSync(String),
    ShowPin(String),
}

/// The device state and every operation on it. Timer expiries, network events and
/// request handlers all funnel through one lock; firmware streaming and service
/// start/stop hold separate locks so status stays readable meanwhile.
pub struct Device {
    core: Mutex<Core>,
    services: Mutex<Box<dyn ServiceHost>>,
    updater: Mutex<UpdateManager>,
}

impl Device {
    /// Loads the schedule and network settings and forces the valve closed.
    pub fn new(config: ControllerConfig, parts: DeviceParts) -> anyhow::Result<Self> {
        let network_config = NetworkConfig::load(parts.store.as_ref())?;
        let events = EventStore::load(parts.store.as_ref());
        let updater = UpdateManager::new(
            parts.firmware_source,
            parts.update_partition,
            config.update_chunk_size,
        );

        let mut core = Core {
            tz: network_config.timezone(),
            network_config,
            events,
            actuator: Actuator::new(config.session_queue_capacity),
            scheduler: Scheduler::default(),
            connectivity: ConnectivityManager::new(&config),
            timers: Timers::default(),
            update: UpdateStatus::default(),
            config,
            store: parts.store,
            valve: parts.valve,
            indicator: parts.indicator,
            network: parts.network,
            timer_service: parts.timers,
            clock: parts.clock,
            restarter: parts.restarter,
        };
        core.valve.set_open(false)?;

        Ok(Self {
            core: Mutex::new(core),
            services: Mutex::new(parts.services),
            updater: Mutex::new(updater),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arms the periodic tick.
    pub fn start(&self) -> anyhow::Result<()> {
        let mut core = self.lock();
        let period = Duration::from_millis(core.config.tick_period_ms);
        let token = core.timers.arm(TimerId::Tick, true);
        core.timer_service.start_periodic(token, period)?;
        info!("scheduler ticking every {period:?}");
        Ok(())
    }

    pub fn config(&self) -> ControllerConfig {
        self.lock().config.clone()
    }

    pub fn network_config(&self) -> NetworkConfig {
        self.lock().network_config.clone()
    }

    pub fn has_station_credentials(&self) -> bool {
        self.lock().network_config.has_station_credentials()
    }

    pub fn connectivity_state(&self) -> ConnectivityState {
        self.lock().connectivity.state()
    }

    pub fn on_timer(&self, token: TimerToken) {
        let calls = {
            let mut core = self.lock();
            if !core.timers.accept(token) {
                debug!("ignoring stale {:?} expiry", token.id);
                return;
            }

            match token.id {
                TimerId::Tick => {
                    core.run_tick();
                    Vec::new()
                }
                TimerId::ValveOff => {
                    let (now_ms, epoch) = core.now();
                    let actions = core.actuator.close(now_ms, epoch);
                    core.apply_valve_actions(actions);
                    Vec::new()
                }
                TimerId::ConnectTimeout => core.dispatch_network(NetEvent::ConnectTimeout),
                TimerId::Reconnect => core.dispatch_network(NetEvent::ReconnectDue),
                TimerId::Restart => {
                    info!("restarting into new firmware");
                    core.restarter.restart();
                    Vec::new()
                }
            }
        };
        self.run_service_calls(calls);
    }

    pub fn on_network_event(&self, event: NetEvent) {
        let calls = self.lock().dispatch_network(event);
        self.run_service_calls(calls);
    }

    fn run_service_calls(&self, calls: Vec<ServiceCall>) {
        if calls.is_empty() {
            return;
        }
        let mut services = self.services.lock().unwrap_or_else(PoisonError::into_inner);
        for call in calls {
            match call {
                ServiceCall::Start(config) => {
                    if let Err(err) = services.start(&config) {
                        warn!("failed to start network services: {err:#}");
                    }
                }
                ServiceCall::Stop => services.stop(),
                ServiceCall::StartTimeSync(server) => {
                    if let Err(err) = services.start_time_sync(&server) {
                        warn!("failed to start time sync: {err:#}");
                    }
                }
                ServiceCall::ShowPin(pin) => services.show_pin(&pin),
            }
        }
    }

    /// Opens the valve for the manual duration. No-op while a session is open.
    pub fn trigger_water_on(&self) -> Result<()> {
        let mut core = self.lock();
        if core.actuator.is_open() {
            info!("manual watering requested while valve already open");
            return Ok(());
        }
        let duration = core.config.manual_watering_secs;
        core.open_valve(duration);
        Ok(())
    }

    /// Closes the valve now and drops queued sessions.
    pub fn trigger_water_off(&self) -> Result<()> {
        let mut core = self.lock();
        let (now_ms, epoch) = core.now();
        let actions = core.actuator.force_off(now_ms, epoch);
        core.apply_valve_actions(actions);
        Ok(())
    }

    pub fn add_event(
        &self,
        hour: u8,
        minute: u8,
        skip_seconds: u32,
        days_mask: u8,
        duration_seconds: u32,
    ) -> Result<usize> {
        let event = WaterEvent::new(hour, minute, skip_seconds, days_mask, duration_seconds)?;
        let mut guard = self.lock();
        let core = &mut *guard;
        core.events.add(core.store.as_mut(), event)
    }

    pub fn delete_event(&self, index: usize) -> Result<()> {
        let mut guard = self.lock();
        let core = &mut *guard;
        core.events.remove(core.store.as_mut(), index)
    }

    pub fn schedule(&self) -> Schedule {
        self.lock().events.schedule().clone()
    }

    /// Streams a firmware image into the inactive partition and arms the restart timer.
    /// An empty `url` falls back to the configured update URL.
    pub fn apply_update(&self, url: &str) -> Result<()> {
        let url = {
            let mut core = self.lock();
            let url = match url.trim() {
                "" => core.network_config.update_url.clone(),
                given => given.to_string(),
            };
            validate_update_url(&url, core.config.allow_file_urls)?;
            if core.update.in_progress {
                return Err(IrrigationError::UpdateInProgress);
            }
            core.update = UpdateStatus {
                in_progress: true,
                last_source_url: Some(url.clone()),
                ..UpdateStatus::default()
            };
            url
        };

        info!("applying firmware update from {url}");
        let result = {
            let mut updater = self.updater.lock().unwrap_or_else(PoisonError::into_inner);
            updater.apply(&url, &mut |written, total| {
                let mut core = self.lock();
                core.update.bytes_written = written;
                core.update.total_bytes = total;
            })
        };

        let mut core = self.lock();
        core.update.in_progress = false;
        match result {
            Ok(report) => {
                core.update.bytes_written = report.bytes_written;
                core.update.last_sha256 = Some(report.sha256);
                let delay = Duration::from_millis(core.config.restart_delay_ms);
                if let Err(err) = core.try_arm_once(TimerId::Restart, delay) {
                    let err = IrrigationError::Partition(
                        err.context("image staged but the restart could not be scheduled"),
                    );
                    warn!("{err:#}");
                    core.update.last_error = Some(format!("{err:#}"));
                    return Err(err);
                }
                info!("update staged; restarting in {delay:?}");
                Ok(())
            }
            Err(err) => {
                warn!("firmware update failed: {err}");
                core.update.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    pub fn update_network_config(&self, update: NetworkConfigUpdate) -> Result<(NetworkConfig, bool)> {
        let mut guard = self.lock();
        let core = &mut *guard;

        let previous = core.network_config.clone();
        let mut next = previous.clone();
        update.apply_to(&mut next);
        next.save(core.store.as_mut())
            .map_err(IrrigationError::Storage)?;

        core.tz = next.timezone();
        core.network_config = next.clone();
        let restart_required = next.restart_required(&previous);
        info!("network settings saved (restart required: {restart_required})");
        Ok((next, restart_required))
    }

    pub fn status(&self) -> DeviceStatus {
        let core = self.lock();
        DeviceStatus {
            valve_open: core.actuator.is_open(),
            watering_started_at: core.actuator.started_epoch(),
            last_duration_seconds: core.actuator.last_duration_secs(),
            queued_sessions: core.actuator.queued(),
            internet_up: core.connectivity.internet_up(),
            connectivity_state: core.connectivity.state(),
            time_synced: core.clock.now_utc().is_some(),
            schedule: core.events.schedule().clone(),
            update: core.update.clone(),
        }
    }
}

impl Core {
    fn now(&self) -> (u64, Option<i64>) {
        (
            self.clock.monotonic_ms(),
            self.clock.now_utc().map(|utc| utc.timestamp()),
        )
    }

    fn local_now(&self) -> Option<DateTime<FixedOffset>> {
        self.clock
            .now_utc()
            .map(|utc| utc.with_timezone(&self.tz).fixed_offset())
    }

    fn run_tick(&mut self) {
        let Some(now) = self.local_now() else {
            debug!("wall clock not synchronized; skipping schedule evaluation");
            return;
        };

        let triggers = self.scheduler.tick(self.events.schedule(), now);
        for trigger in triggers {
            info!(
                "schedule slot {} due: {}s watering",
                trigger.slot, trigger.duration_secs
            );
            self.open_valve(trigger.duration_secs);
        }
    }

    fn open_valve(&mut self, duration_secs: u32) {
        let (now_ms, epoch) = self.now();
        let (outcome, actions) = self.actuator.open(duration_secs, now_ms, epoch);
        if outcome == OpenOutcome::Started {
            self.apply_valve_actions(actions);
        }
    }

    fn apply_valve_actions(&mut self, actions: Vec<ValveAction>) {
        for action in actions {
            match action {
                ValveAction::Open => {
                    if let Err(err) = self.valve.set_open(true) {
                        warn!("failed to open valve: {err:#}");
                    }
                }
                ValveAction::Close => {
                    if let Err(err) = self.valve.set_open(false) {
                        warn!("failed to close valve: {err:#}");
                    }
                }
                ValveAction::ArmOffTimer(after) => self.arm_once(TimerId::ValveOff, after),
                ValveAction::CancelOffTimer => self.cancel(TimerId::ValveOff),
            }
        }
    }

    /// Runs the state machine to quiescence; failed connect calls feed back in as events.
    /// Returns the service work for the caller to run once the lock is released.
    fn dispatch_network(&mut self, event: NetEvent) -> Vec<ServiceCall> {
        let mut calls = Vec::new();
        let mut pending = VecDeque::from([event]);
        while let Some(event) = pending.pop_front() {
            for action in self.connectivity.handle(event) {
                if let Some(follow_up) = self.apply_network_action(action, &mut calls) {
                    pending.push_back(follow_up);
                }
            }
        }
        calls
    }

    fn apply_network_action(
        &mut self,
        action: NetAction,
        calls: &mut Vec<ServiceCall>,
    ) -> Option<NetEvent> {
        match action {
            NetAction::Connect => {
                if let Err(err) = self.network.connect() {
                    warn!("connect call failed: {err:#}");
                    return Some(NetEvent::ConnectFailed);
                }
            }
            NetAction::ArmConnectTimeout(after) => self.arm_once(TimerId::ConnectTimeout, after),
            NetAction::CancelConnectTimeout => self.cancel(TimerId::ConnectTimeout),
            NetAction::ArmReconnect(after) => self.arm_once(TimerId::Reconnect, after),
            NetAction::CancelReconnect => self.cancel(TimerId::Reconnect),
            NetAction::EnablePairing => {
                if let Err(err) = self.network.enable_pairing() {
                    warn!("failed to enable pairing: {err:#}");
                }
            }
            NetAction::DisablePairing => {
                if let Err(err) = self.network.disable_pairing() {
                    warn!("failed to disable pairing: {err:#}");
                }
            }
            NetAction::EnableLegacyProtocols => {
                if let Err(err) = self.network.enable_legacy_protocols() {
                    warn!("failed to enable 802.11b/g/n: {err:#}");
                }
            }
            NetAction::StartServices => {
                calls.push(ServiceCall::Start(self.network_config.clone()));
            }
            NetAction::StopServices => calls.push(ServiceCall::Stop),
            NetAction::StartTimeSync => {
                calls.push(ServiceCall::StartTimeSync(
                    self.network_config.time_server.clone(),
                ));
            }
            NetAction::Indicator(pattern) => self.indicator.set_pattern(pattern),
            NetAction::ShowPin(pin) => calls.push(ServiceCall::ShowPin(pin)),
        }
        None
    }

    fn arm_once(&mut self, id: TimerId, after: Duration) {
        if let Err(err) = self.try_arm_once(id, after) {
            warn!("failed to start {id:?} timer: {err:#}");
        }
    }

    fn try_arm_once(&mut self, id: TimerId, after: Duration) -> anyhow::Result<()> {
        let token = self.timers.arm(id, false);
        if let Err(err) = self.timer_service.start_once(token, after) {
            self.timers.disarm(id);
            return Err(err);
        }
        Ok(())
    }

    fn cancel(&mut self, id: TimerId) {
        if self.timers.disarm(id) {
            self.timer_service.stop(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        connectivity::DisconnectReason,
        ports::IndicatorPattern,
        testing::{Harness, NetCall},
    };

    #[test]
    fn boot_closes_valve_and_arms_tick() {
        let harness = Harness::new();

        assert_eq!(harness.valve_history(), vec![false]);
        assert!(harness.armed(TimerId::Tick).is_some());
    }

    #[test]
    fn manual_watering_runs_for_configured_duration() {
        let harness = Harness::new();
        harness.clock.set_utc(1_780_000_000);

        harness.device.trigger_water_on().unwrap();

        let (_, after) = harness.armed(TimerId::ValveOff).unwrap();
        assert_eq!(after, Duration::from_secs(900));
        let status = harness.device.status();
        assert!(status.valve_open);
        assert_eq!(status.watering_started_at, Some(1_780_000_000));

        // A second press while open changes nothing.
        harness.device.trigger_water_on().unwrap();
        assert_eq!(harness.device.status().queued_sessions, 0);
    }

    #[test]
    fn interval_event_opens_then_timer_closes() {
        let harness = Harness::new();
        harness.device.add_event(0, 0, 3600, 0, 15).unwrap();
        let aligned = 1_780_000_000_i64 - 1_780_000_000_i64.rem_euclid(3600);
        harness.clock.set_utc(aligned);

        harness.fire(TimerId::Tick);
        assert!(harness.device.status().valve_open);
        assert_eq!(harness.valve_history(), vec![false, true]);

        harness.clock.advance(Duration::from_secs(15));
        harness.fire(TimerId::ValveOff);

        let status = harness.device.status();
        assert!(!status.valve_open);
        assert_eq!(status.last_duration_seconds, 15);
        assert_eq!(harness.valve_history(), vec![false, true, false]);
    }

    #[test]
    fn day_time_scenario_with_tuesday_and_thursday() {
        let harness = Harness::new();
        harness.device.add_event(14, 30, 0, 0b0001_0100, 60).unwrap();

        // 2026-06-02 14:30 UTC is a Tuesday.
        harness.clock.set_utc(1_780_410_600);
        harness.fire(TimerId::Tick);
        assert!(harness.device.status().valve_open);
        let (_, after) = harness.armed(TimerId::ValveOff).unwrap();
        assert_eq!(after, Duration::from_secs(60));

        harness.device.trigger_water_off().unwrap();
        harness.clock.set_utc(1_780_410_660);
        harness.fire(TimerId::Tick);
        assert!(!harness.device.status().valve_open);
    }

    #[test]
    fn tick_without_time_sync_does_nothing() {
        let harness = Harness::new();
        harness.device.add_event(0, 0, 60, 0, 15).unwrap();

        harness.fire(TimerId::Tick);

        assert!(!harness.device.status().valve_open);
        assert!(!harness.device.status().time_synced);
    }

    #[test]
    fn overlapping_trigger_runs_after_current_session() {
        let harness = Harness::new();
        harness.device.add_event(0, 0, 60, 0, 90).unwrap();
        let aligned = 1_780_000_020_i64 - 1_780_000_020_i64.rem_euclid(60);
        harness.clock.set_utc(aligned);
        harness.fire(TimerId::Tick);

        harness.clock.advance(Duration::from_secs(60));
        harness.fire(TimerId::Tick);
        assert_eq!(harness.device.status().queued_sessions, 1);
        assert_eq!(harness.device.status().watering_started_at, Some(aligned));

        harness.clock.advance(Duration::from_secs(30));
        harness.fire(TimerId::ValveOff);

        let status = harness.device.status();
        assert!(status.valve_open);
        assert_eq!(status.last_duration_seconds, 90);
        assert_eq!(status.watering_started_at, Some(aligned + 90));
        assert_eq!(status.queued_sessions, 0);
    }

    #[test]
    fn force_off_cancels_the_valve_timer() {
        let harness = Harness::new();
        harness.device.trigger_water_on().unwrap();
        let (token, _) = harness.armed(TimerId::ValveOff).unwrap();

        harness.device.trigger_water_off().unwrap();
        assert!(harness.stopped(TimerId::ValveOff));
        let status = harness.device.status();
        assert!(!status.valve_open);
        assert_eq!(status.watering_started_at, None);

        // A late expiry of the cancelled timer is ignored.
        harness.device.trigger_water_on().unwrap();
        harness.device.on_timer(token);
        assert!(harness.device.status().valve_open);
    }

    #[test]
    fn add_event_validates_and_persists() {
        let harness = Harness::new();

        assert!(matches!(
            harness.device.add_event(24, 0, 0, 0, 10),
            Err(IrrigationError::Validation { field: "hour", .. })
        ));
        assert_eq!(harness.device.add_event(6, 0, 0, 0x7f, 10).unwrap(), 0);
        assert_eq!(harness.device.schedule().get(0).unwrap().days_mask, 0);

        harness.device.delete_event(0).unwrap();
        assert!(matches!(
            harness.device.delete_event(9),
            Err(IrrigationError::NotFound { index: 9 })
        ));
        assert_eq!(harness.device.schedule().enabled_count(), 0);
    }

    #[test]
    fn no_credentials_goes_to_pairing_without_connecting() {
        let harness = Harness::new();

        harness.device.on_network_event(NetEvent::StationStarted {
            has_credentials: harness.device.has_station_credentials(),
        });

        assert_eq!(
            harness.device.connectivity_state(),
            ConnectivityState::Pairing
        );
        assert_eq!(harness.network_calls(), vec![NetCall::EnablePairing]);
        assert_eq!(harness.indicator(), Some(IndicatorPattern::SlowBlink));
    }

    #[test]
    fn connect_timeout_moves_to_pairing_once() {
        let harness = Harness::with_credentials();
        harness.device.on_network_event(NetEvent::StationStarted {
            has_credentials: harness.device.has_station_credentials(),
        });
        assert_eq!(harness.network_calls(), vec![NetCall::Connect]);
        let (token, after) = harness.armed(TimerId::ConnectTimeout).unwrap();
        assert_eq!(after, Duration::from_secs(30));

        harness.device.on_timer(token);
        harness.device.on_timer(token);

        assert_eq!(
            harness.device.connectivity_state(),
            ConnectivityState::Pairing
        );
        assert_eq!(
            harness.network_calls(),
            vec![NetCall::Connect, NetCall::EnablePairing]
        );
    }

    #[test]
    fn immediate_connect_failure_enables_pairing() {
        let harness = Harness::with_credentials();
        harness.fail_connect(true);

        harness.device.on_network_event(NetEvent::StationStarted {
            has_credentials: true,
        });

        assert_eq!(
            harness.device.connectivity_state(),
            ConnectivityState::Pairing
        );
        assert!(!harness.is_armed(TimerId::ConnectTimeout));
    }

    #[test]
    fn connection_starts_and_stops_services() {
        let harness = Harness::with_credentials();
        harness.device.on_network_event(NetEvent::StationStarted {
            has_credentials: true,
        });
        harness.device.on_network_event(NetEvent::GotIp);

        assert!(harness.device.status().internet_up);
        assert!(harness.services_running());
        assert_eq!(harness.time_sync_servers(), vec!["pool.ntp.org".to_string()]);
        assert!(!harness.is_armed(TimerId::ConnectTimeout));

        harness.device.on_network_event(NetEvent::Disconnected {
            reason: DisconnectReason::Other(8),
        });

        assert!(!harness.device.status().internet_up);
        assert!(!harness.services_running());
        assert_eq!(
            harness.device.connectivity_state(),
            ConnectivityState::Connecting
        );
        assert!(harness.is_armed(TimerId::ConnectTimeout));
    }

    #[test]
    fn pairing_pin_is_shown_and_legacy_rates_enabled_on_rejection() {
        let harness = Harness::new();
        harness.device.on_network_event(NetEvent::StationStarted {
            has_credentials: false,
        });
        harness
            .device
            .on_network_event(NetEvent::PairingPin("40961234".to_string()));
        assert_eq!(harness.pins(), vec!["40961234".to_string()]);

        harness.device.on_network_event(NetEvent::PairingSucceeded);
        harness.device.on_network_event(NetEvent::Disconnected {
            reason: DisconnectReason::BasicRateNotSupported,
        });

        assert_eq!(
            harness.network_calls(),
            vec![
                NetCall::EnablePairing,
                NetCall::DisablePairing,
                NetCall::Connect,
                NetCall::EnableLegacyProtocols,
                NetCall::Connect,
            ]
        );
    }

    #[test]
    fn successful_update_arms_restart() {
        let harness = Harness::with_firmware(b"new-image".to_vec());

        harness.device.apply_update("http://fw/image.bin").unwrap();

        let (token, after) = harness.armed(TimerId::Restart).unwrap();
        assert_eq!(after, Duration::from_secs(3));
        let status = harness.device.status();
        assert!(!status.update.in_progress);
        assert_eq!(status.update.bytes_written, 9);
        assert!(status.update.last_sha256.is_some());

        harness.device.on_timer(token);
        assert_eq!(harness.restarts(), 1);
    }

    #[test]
    fn unschedulable_restart_fails_the_update() {
        let harness = Harness::with_firmware(b"new-image".to_vec());
        harness.fail_timer_starts(true);

        let result = harness.device.apply_update("http://fw/image.bin");

        assert!(matches!(result, Err(IrrigationError::Partition(_))));
        assert!(!harness.is_armed(TimerId::Restart));
        let status = harness.device.status();
        assert!(!status.update.in_progress);
        assert!(status
            .update
            .last_error
            .is_some_and(|error| error.contains("restart")));
    }

    #[test]
    fn status_and_schedule_stay_usable_while_update_streams() {
        let (harness, pause) = Harness::with_paused_firmware(b"firmware-image".to_vec(), 4);

        thread::scope(|scope| {
            let update = scope.spawn(|| harness.device.apply_update("http://fw/image.bin"));
            pause
                .reached
                .recv_timeout(Duration::from_secs(3))
                .expect("stream should reach its pause point");

            let status = harness.device.status();
            assert!(status.update.in_progress);
            assert_eq!(status.update.bytes_written, 4);
            assert_eq!(harness.device.add_event(6, 0, 0, 0, 60).unwrap(), 0);
            assert!(matches!(
                harness.device.apply_update("http://fw/other.bin"),
                Err(IrrigationError::UpdateInProgress)
            ));

            pause.resume.send(()).unwrap();
            update.join().unwrap().unwrap();
        });

        let status = harness.device.status();
        assert!(!status.update.in_progress);
        assert_eq!(status.update.bytes_written, 14);
        assert!(harness.partition_activated());
        assert!(harness.device.schedule().get(0).unwrap().enabled);
    }

    #[test]
    fn stopping_services_does_not_block_request_handlers() {
        let (harness, stop_requests) = Harness::with_stop_handshake();
        harness.device.on_network_event(NetEvent::StationStarted {
            has_credentials: true,
        });
        harness.device.on_network_event(NetEvent::GotIp);

        let device = &harness.device;
        thread::scope(|scope| {
            let handler = scope.spawn(move || {
                let done = stop_requests
                    .recv_timeout(Duration::from_secs(3))
                    .expect("services should be stopped");
                let status = device.status();
                let _ = done.send(());
                status
            });

            device.on_network_event(NetEvent::Disconnected {
                reason: DisconnectReason::Other(8),
            });

            let seen = handler.join().unwrap();
            assert!(!seen.internet_up);
        });

        assert!(!harness.stop_gave_up());
        assert!(!harness.services_running());
    }

    #[test]
    fn failed_update_never_arms_restart() {
        let harness = Harness::with_failing_partition_write(b"new-image".to_vec());

        let result = harness.device.apply_update("http://fw/image.bin");

        assert!(matches!(result, Err(IrrigationError::Network(_))));
        assert!(!harness.is_armed(TimerId::Restart));
        assert!(!harness.partition_activated());
        assert!(harness.device.status().update.last_error.is_some());
    }

    #[test]
    fn empty_update_url_uses_configured_one() {
        let harness = Harness::with_firmware(b"img".to_vec());

        assert!(matches!(
            harness.device.apply_update(""),
            Err(IrrigationError::Validation { field: "url", .. })
        ));

        harness
            .device
            .update_network_config(NetworkConfigUpdate {
                update_url: Some("https://fw/latest.bin".to_string()),
                ..NetworkConfigUpdate::default()
            })
            .unwrap();
        harness.device.apply_update("").unwrap();

        assert_eq!(
            harness.device.status().update.last_source_url.as_deref(),
            Some("https://fw/latest.bin")
        );
    }

    #[test]
    fn timezone_change_shifts_day_time_matching() {
        let harness = Harness::new();
        harness.device.add_event(8, 30, 0, 0, 60).unwrap();
        harness
            .device
            .update_network_config(NetworkConfigUpdate {
                timezone: Some("Europe/Berlin".to_string()),
                ..NetworkConfigUpdate::default()
            })
            .unwrap();

        // 06:30 UTC is 08:30 in Berlin during summer time.
        harness.clock.set_utc(1_780_381_800);
        harness.fire(TimerId::Tick);

        assert!(harness.device.status().valve_open);
    }
}
