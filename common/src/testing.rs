//! In-memory fakes for every port, plus a `Harness` that wires them into a `Device`.

use std::{
    collections::HashMap,
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::anyhow;
use chrono::{DateTime, Utc};

use crate::{
    config::{ControllerConfig, NetworkConfig, KEY_WIFI_SSID},
    device::{Device, DeviceParts},
    ports::{Clock, IndicatorPattern, NetworkPort, Restarter, ServiceHost, StatusIndicator, ValveOutput},
    store::KvStore,
    timer::{TimerId, TimerService, TimerToken},
    update::{FirmwareSource, FirmwareStream, UpdatePartition, UpdateWriter},
};

#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: HashMap<String, Vec<u8>>,
    strings: HashMap<String, String>,
    writes: usize,
    fail_writes: bool,
}

impl MemoryStore {
    pub fn writes(&self) -> usize {
        self.writes
    }

    pub fn fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    fn check_writable(&self) -> anyhow::Result<()> {
        if self.fail_writes {
            return Err(anyhow!("simulated flash write failure"));
        }
        Ok(())
    }
}

impl KvStore for MemoryStore {
    fn get_blob(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.blobs.get(key).cloned())
    }

    fn set_blob(&mut self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        self.check_writable()?;
        self.writes += 1;
        self.blobs.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get_str(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.strings.get(key).cloned())
    }

    fn set_str(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        self.check_writable()?;
        self.writes += 1;
        self.strings.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetCall {
    Connect,
    EnablePairing,
    DisablePairing,
    EnableLegacyProtocols,
}

#[derive(Debug, Default)]
struct Recorder {
    valve: Vec<bool>,
    indicator: Option<IndicatorPattern>,
    network: Vec<NetCall>,
    fail_connect: bool,
    services_running: bool,
    time_sync: Vec<String>,
    pins: Vec<String>,
    active_timers: HashMap<TimerId, (TimerToken, Duration, bool)>,
    stopped_timers: Vec<TimerId>,
    fail_timer_starts: bool,
    restarts: usize,
    stop_gave_up: bool,
}

/// How long fakes wait on the test thread before giving up instead of hanging.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);

type Shared = Arc<Mutex<Recorder>>;

struct FakeValve(Shared);

impl ValveOutput for FakeValve {
    fn set_open(&mut self, open: bool) -> anyhow::Result<()> {
        self.0.lock().unwrap().valve.push(open);
        Ok(())
    }
}

struct FakeIndicator(Shared);

impl StatusIndicator for FakeIndicator {
    fn set_pattern(&mut self, pattern: IndicatorPattern) {
        self.0.lock().unwrap().indicator = Some(pattern);
    }
}

struct FakeNetwork(Shared);

impl NetworkPort for FakeNetwork {
    fn connect(&mut self) -> anyhow::Result<()> {
        let mut recorder = self.0.lock().unwrap();
        if recorder.fail_connect {
            return Err(anyhow!("station not configured"));
        }
        recorder.network.push(NetCall::Connect);
        Ok(())
    }

    fn enable_pairing(&mut self) -> anyhow::Result<()> {
        self.0.lock().unwrap().network.push(NetCall::EnablePairing);
        Ok(())
    }

    fn disable_pairing(&mut self) -> anyhow::Result<()> {
        self.0.lock().unwrap().network.push(NetCall::DisablePairing);
        Ok(())
    }

    fn enable_legacy_protocols(&mut self) -> anyhow::Result<()> {
        self.0
            .lock()
            .unwrap()
            .network
            .push(NetCall::EnableLegacyProtocols);
        Ok(())
    }
}

/// With a stop handshake, `stop` hands a completion sender to the test and waits for it,
/// the way a web server waits for in-flight requests before shutting down.
struct FakeServices {
    recorder: Shared,
    stop_handshake: Option<Sender<Sender<()>>>,
}

impl ServiceHost for FakeServices {
    fn start(&mut self, _config: &NetworkConfig) -> anyhow::Result<()> {
        self.recorder.lock().unwrap().services_running = true;
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(handshake) = &self.stop_handshake {
            let (done_tx, done_rx) = mpsc::channel();
            if handshake.send(done_tx).is_ok() && done_rx.recv_timeout(HANDSHAKE_TIMEOUT).is_err() {
                self.recorder.lock().unwrap().stop_gave_up = true;
            }
        }
        self.recorder.lock().unwrap().services_running = false;
    }

    fn start_time_sync(&mut self, server: &str) -> anyhow::Result<()> {
        self.recorder
            .lock()
            .unwrap()
            .time_sync
            .push(server.to_string());
        Ok(())
    }

    fn show_pin(&mut self, pin: &str) {
        self.recorder.lock().unwrap().pins.push(pin.to_string());
    }
}

struct FakeTimers(Shared);

impl TimerService for FakeTimers {
    fn start_once(&mut self, token: TimerToken, after: Duration) -> anyhow::Result<()> {
        let mut recorder = self.0.lock().unwrap();
        if recorder.fail_timer_starts {
            return Err(anyhow!("timer service out of slots"));
        }
        recorder.active_timers.insert(token.id, (token, after, false));
        Ok(())
    }

    fn start_periodic(&mut self, token: TimerToken, period: Duration) -> anyhow::Result<()> {
        self.0
            .lock()
            .unwrap()
            .active_timers
            .insert(token.id, (token, period, true));
        Ok(())
    }

    fn stop(&mut self, id: TimerId) {
        let mut recorder = self.0.lock().unwrap();
        recorder.active_timers.remove(&id);
        recorder.stopped_timers.push(id);
    }
}

struct FakeRestarter(Shared);

impl Restarter for FakeRestarter {
    fn restart(&mut self) {
        self.0.lock().unwrap().restarts += 1;
    }
}

#[derive(Debug, Default)]
struct ClockState {
    monotonic_ms: u64,
    utc: Option<i64>,
}

/// Starts unsynchronized at monotonic zero. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock(Arc<Mutex<ClockState>>);

impl ManualClock {
    pub fn set_utc(&self, epoch: i64) {
        self.0.lock().unwrap().utc = Some(epoch);
    }

    pub fn advance(&self, by: Duration) {
        let mut state = self.0.lock().unwrap();
        state.monotonic_ms += by.as_millis() as u64;
        if let Some(utc) = state.utc.as_mut() {
            *utc += by.as_secs() as i64;
        }
    }
}

impl Clock for ManualClock {
    fn monotonic_ms(&self) -> u64 {
        self.0.lock().unwrap().monotonic_ms
    }

    fn now_utc(&self) -> Option<DateTime<Utc>> {
        self.0
            .lock()
            .unwrap()
            .utc
            .and_then(|epoch| DateTime::from_timestamp(epoch, 0))
    }
}

/// Test side of a stream that stops at a byte offset until told to continue.
pub struct UpdatePause {
    pub reached: Receiver<()>,
    pub resume: Sender<()>,
}

struct PausePoint {
    at: usize,
    reached: Sender<()>,
    resume: Receiver<()>,
}

pub struct ScriptedSource {
    image: Vec<u8>,
    unreachable: bool,
    fail_after: Option<usize>,
    pause: Option<PausePoint>,
}

impl ScriptedSource {
    pub fn serving(image: Vec<u8>) -> Self {
        Self {
            image,
            unreachable: false,
            fail_after: None,
            pause: None,
        }
    }

    pub fn unreachable() -> Self {
        Self {
            unreachable: true,
            ..Self::serving(Vec::new())
        }
    }

    /// Serves `at` bytes, then blocks the next read until resumed.
    pub fn pausing_at(mut self, at: usize) -> (Self, UpdatePause) {
        let (reached_tx, reached_rx) = mpsc::channel();
        let (resume_tx, resume_rx) = mpsc::channel();
        self.pause = Some(PausePoint {
            at,
            reached: reached_tx,
            resume: resume_rx,
        });
        (
            self,
            UpdatePause {
                reached: reached_rx,
                resume: resume_tx,
            },
        )
    }

    /// Reads fail once `bytes` have been served.
    pub fn failing_after(mut self, bytes: usize) -> Self {
        self.fail_after = Some(bytes);
        self
    }
}

impl FirmwareSource for ScriptedSource {
    fn open(&mut self, url: &str) -> anyhow::Result<Box<dyn FirmwareStream + '_>> {
        if self.unreachable {
            return Err(anyhow!("connection refused: {url}"));
        }
        Ok(Box::new(ScriptedStream {
            data: &self.image,
            position: 0,
            fail_after: self.fail_after,
            pause: self.pause.as_ref(),
            paused: false,
        }))
    }
}

struct ScriptedStream<'a> {
    data: &'a [u8],
    position: usize,
    fail_after: Option<usize>,
    pause: Option<&'a PausePoint>,
    paused: bool,
}

impl FirmwareStream for ScriptedStream<'_> {
    fn content_length(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    fn read(&mut self, buf: &mut [u8]) -> anyhow::Result<usize> {
        if self.fail_after.is_some_and(|limit| self.position >= limit) {
            return Err(anyhow!("connection reset"));
        }
        let mut end = self.data.len();
        if let Some(pause) = self.pause.filter(|_| !self.paused) {
            if self.position >= pause.at {
                self.paused = true;
                let _ = pause.reached.send(());
                pause
                    .resume
                    .recv_timeout(HANDSHAKE_TIMEOUT)
                    .map_err(|_| anyhow!("stream never resumed"))?;
            } else {
                end = end.min(pause.at);
            }
        }
        let remaining = &self.data[self.position..end];
        let read = remaining.len().min(buf.len());
        buf[..read].copy_from_slice(&remaining[..read]);
        self.position += read;
        Ok(read)
    }
}

#[derive(Debug, Default)]
pub struct PartitionLog {
    pub began: bool,
    pub written: Vec<u8>,
    pub aborted: bool,
    pub activated: bool,
}

#[derive(Default)]
pub struct ScriptedPartition {
    log: Arc<Mutex<PartitionLog>>,
    unavailable: bool,
    fail_write_after: Option<usize>,
    fail_activation: bool,
}

impl ScriptedPartition {
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    /// Writes fail once `bytes` have been accepted.
    pub fn failing_write_after(mut self, bytes: usize) -> Self {
        self.fail_write_after = Some(bytes);
        self
    }

    pub fn failing_activation(mut self) -> Self {
        self.fail_activation = true;
        self
    }

    pub fn log(&self) -> Arc<Mutex<PartitionLog>> {
        self.log.clone()
    }
}

impl UpdatePartition for ScriptedPartition {
    fn begin(&mut self) -> anyhow::Result<Box<dyn UpdateWriter + '_>> {
        if self.unavailable {
            return Err(anyhow!("no OTA slot in partition table"));
        }
        self.log.lock().unwrap().began = true;
        Ok(Box::new(ScriptedWriter {
            log: self.log.clone(),
            fail_write_after: self.fail_write_after,
            fail_activation: self.fail_activation,
        }))
    }
}

struct ScriptedWriter {
    log: Arc<Mutex<PartitionLog>>,
    fail_write_after: Option<usize>,
    fail_activation: bool,
}

impl UpdateWriter for ScriptedWriter {
    fn write(&mut self, chunk: &[u8]) -> anyhow::Result<()> {
        let mut log = self.log.lock().unwrap();
        if self
            .fail_write_after
            .is_some_and(|limit| log.written.len() >= limit)
        {
            return Err(anyhow!("flash write failed"));
        }
        log.written.extend_from_slice(chunk);
        Ok(())
    }

    fn abort(self: Box<Self>) -> anyhow::Result<()> {
        self.log.lock().unwrap().aborted = true;
        Ok(())
    }

    fn finalize_and_activate(self: Box<Self>) -> anyhow::Result<()> {
        if self.fail_activation {
            return Err(anyhow!("image validation failed"));
        }
        self.log.lock().unwrap().activated = true;
        Ok(())
    }
}

/// A started `Device` over fakes.
pub struct Harness {
    pub device: Device,
    pub clock: ManualClock,
    recorder: Shared,
    partition: Arc<Mutex<PartitionLog>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(
            MemoryStore::default(),
            ScriptedSource::serving(Vec::new()),
            ScriptedPartition::default(),
        )
    }

    pub fn with_credentials() -> Self {
        let mut store = MemoryStore::default();
        store.set_str(KEY_WIFI_SSID, "garden").unwrap();
        Self::build(
            store,
            ScriptedSource::serving(Vec::new()),
            ScriptedPartition::default(),
        )
    }

    pub fn with_firmware(image: Vec<u8>) -> Self {
        Self::build(
            MemoryStore::default(),
            ScriptedSource::serving(image),
            ScriptedPartition::default(),
        )
    }

    pub fn with_failing_partition_write(image: Vec<u8>) -> Self {
        Self::build(
            MemoryStore::default(),
            ScriptedSource::serving(image),
            ScriptedPartition::default().failing_write_after(0),
        )
    }

    /// The firmware stream stops after `at` bytes until the returned handle resumes it.
    pub fn with_paused_firmware(image: Vec<u8>, at: usize) -> (Self, UpdatePause) {
        let (source, pause) = ScriptedSource::serving(image).pausing_at(at);
        let harness = Self::build(MemoryStore::default(), source, ScriptedPartition::default());
        (harness, pause)
    }

    /// Stopping services waits until the test answers on the returned channel.
    pub fn with_stop_handshake() -> (Self, Receiver<Sender<()>>) {
        let mut store = MemoryStore::default();
        store.set_str(KEY_WIFI_SSID, "garden").unwrap();
        let (handshake_tx, handshake_rx) = mpsc::channel();
        let harness = Self::build_with(
            store,
            ScriptedSource::serving(Vec::new()),
            ScriptedPartition::default(),
            Some(handshake_tx),
        );
        (harness, handshake_rx)
    }

    fn build(store: MemoryStore, source: ScriptedSource, partition: ScriptedPartition) -> Self {
        Self::build_with(store, source, partition, None)
    }

    fn build_with(
        store: MemoryStore,
        source: ScriptedSource,
        partition: ScriptedPartition,
        stop_handshake: Option<Sender<Sender<()>>>,
    ) -> Self {
        let recorder = Shared::default();
        let clock = ManualClock::default();
        let partition_log = partition.log();

        let parts = DeviceParts {
            store: Box::new(store),
            valve: Box::new(FakeValve(recorder.clone())),
            indicator: Box::new(FakeIndicator(recorder.clone())),
            network: Box::new(FakeNetwork(recorder.clone())),
            services: Box::new(FakeServices {
                recorder: recorder.clone(),
                stop_handshake,
            }),
            timers: Box::new(FakeTimers(recorder.clone())),
            clock: Box::new(clock.clone()),
            restarter: Box::new(FakeRestarter(recorder.clone())),
            firmware_source: Box::new(source),
            update_partition: Box::new(partition),
        };
        let device = Device::new(ControllerConfig::default(), parts).unwrap();
        device.start().unwrap();

        Self {
            device,
            clock,
            recorder,
            partition: partition_log,
        }
    }

    /// Delivers the current expiry of `id`, as the timer service would.
    pub fn fire(&self, id: TimerId) {
        let token = {
            let mut recorder = self.recorder.lock().unwrap();
            let Some((token, _, periodic)) = recorder.active_timers.get(&id).copied() else {
                panic!("{id:?} is not running");
            };
            if !periodic {
                recorder.active_timers.remove(&id);
            }
            token
        };
        self.device.on_timer(token);
    }

    pub fn armed(&self, id: TimerId) -> Option<(TimerToken, Duration)> {
        self.recorder
            .lock()
            .unwrap()
            .active_timers
            .get(&id)
            .map(|(token, after, _)| (*token, *after))
    }

    pub fn is_armed(&self, id: TimerId) -> bool {
        self.armed(id).is_some()
    }

    pub fn stopped(&self, id: TimerId) -> bool {
        self.recorder.lock().unwrap().stopped_timers.contains(&id)
    }

    pub fn valve_history(&self) -> Vec<bool> {
        self.recorder.lock().unwrap().valve.clone()
    }

    pub fn indicator(&self) -> Option<IndicatorPattern> {
        self.recorder.lock().unwrap().indicator
    }

    pub fn network_calls(&self) -> Vec<NetCall> {
        self.recorder.lock().unwrap().network.clone()
    }

    pub fn fail_connect(&self, fail: bool) {
        self.recorder.lock().unwrap().fail_connect = fail;
    }

    pub fn services_running(&self) -> bool {
        self.recorder.lock().unwrap().services_running
    }

    pub fn time_sync_servers(&self) -> Vec<String> {
        self.recorder.lock().unwrap().time_sync.clone()
    }

    pub fn pins(&self) -> Vec<String> {
        self.recorder.lock().unwrap().pins.clone()
    }

    pub fn fail_timer_starts(&self, fail: bool) {
        self.recorder.lock().unwrap().fail_timer_starts = fail;
    }

    /// Whether a service stop timed out waiting for its handshake.
    pub fn stop_gave_up(&self) -> bool {
        self.recorder.lock().unwrap().stop_gave_up
    }

    pub fn restarts(&self) -> usize {
        self.recorder.lock().unwrap().restarts
    }

    pub fn partition_activated(&self) -> bool {
        self.partition.lock().unwrap().activated
    }
}
