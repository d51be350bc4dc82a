use std::{
    fs::{self, File},
    io::{ErrorKind, Read, Write},
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use axum::{
    extract::{Path as UrlPath, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{
    net::TcpListener,
    runtime::Handle,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use irrigation_common::{
    AddEventRequest, AddEventResponse, Clock, ControllerConfig, Device, DeviceParts,
    FirmwareSource, FirmwareStream, IndicatorPattern, IrrigationError, KvStore, NetEvent,
    NetworkConfig, NetworkConfigUpdate, NetworkConfigView, NetworkPort, NetworkUpdateResponse,
    Restarter, ScheduleSlotView, ServiceHost, StatusIndicator, TimerId, TimerService, TimerToken,
    UpdateAccepted, UpdatePartition, UpdateRequest, UpdateWriter, ValveOutput,
};

const SIM_CONNECT_DELAY: Duration = Duration::from_millis(500);
const SIM_PAIRING_DELAY: Duration = Duration::from_secs(5);
const SIM_PAIRED_SSID: &str = "sim-paired";

/// Serialized input to the device: everything the radio and timers report.
#[derive(Debug)]
enum HostEvent {
    Timer(TimerToken),
    Network(NetEvent),
}

#[derive(Clone)]
struct AppState {
    device: Arc<Device>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("IRRIGATION_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.irrigation"));

    let mut config = ControllerConfig {
        allow_file_urls: true,
        ..ControllerConfig::default()
    };
    if let Some(secs) = std::env::var("IRRIGATION_TICK_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
    {
        config.tick_period_ms = secs * 1000;
    }
    let http_port = std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);

    let store = FileStore::open(data_dir.join("nvs"))?;
    let stored_network = NetworkConfig::load(&store).unwrap_or_else(|err| {
        warn!("failed to load network config from store: {err:#}");
        NetworkConfig::default()
    });
    let sim_ssid = std::env::var("SIM_WIFI_SSID")
        .ok()
        .filter(|ssid| !ssid.trim().is_empty())
        .or_else(|| {
            stored_network
                .has_station_credentials()
                .then(|| stored_network.wifi_ssid.clone())
        });

    let (tx, rx) = mpsc::unbounded_channel();
    let runtime = Handle::current();
    let router = Arc::new(OnceLock::new());
    let time_synced = Arc::new(AtomicBool::new(false));

    let parts = DeviceParts {
        store: Box::new(store),
        valve: Box::new(LogValve),
        indicator: Box::new(LogIndicator),
        network: Box::new(SimNetwork::new(tx.clone(), runtime.clone(), sim_ssid.clone())),
        services: Box::new(HostServices {
            runtime: runtime.clone(),
            router: router.clone(),
            port: http_port,
            server: None,
            time_synced: time_synced.clone(),
        }),
        timers: Box::new(TokioTimers::new(tx.clone(), runtime.clone())),
        clock: Box::new(HostClock { time_synced }),
        restarter: Box::new(ExitRestarter),
        firmware_source: Box::new(FileSource),
        update_partition: Box::new(FilePartition::new(data_dir.join("ota"))),
    };

    let device = Arc::new(Device::new(config, parts).context("device init failed")?);
    if router
        .set(build_router(AppState {
            device: device.clone(),
        }))
        .is_err()
    {
        return Err(anyhow!("request router initialized twice"));
    }

    device.start()?;
    spawn_dispatcher(device.clone(), rx);

    let has_credentials = sim_ssid.is_some();
    tx.send(HostEvent::Network(NetEvent::StationStarted { has_credentials }))
        .map_err(|_| anyhow!("dispatcher stopped before boot completed"))?;

    info!(
        "irrigation controller simulator running (data dir {})",
        data_dir.display()
    );
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/water/on", post(handle_water_on))
        .route("/api/water/off", post(handle_water_off))
        .route(
            "/api/events",
            get(handle_get_events).post(handle_add_event),
        )
        .route("/api/events/{index}", delete(handle_delete_event))
        .route("/api/update", post(handle_apply_update))
        .route(
            "/api/network",
            get(handle_get_network).put(handle_put_network),
        )
        .with_state(state)
}

/// Timer expiries and radio events are handled one at a time, in arrival order.
fn spawn_dispatcher(device: Arc<Device>, mut rx: UnboundedReceiver<HostEvent>) {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            debug!("dispatch {event:?}");
            let device = device.clone();
            let result = tokio::task::spawn_blocking(move || match event {
                HostEvent::Timer(token) => device.on_timer(token),
                HostEvent::Network(event) => device.on_network_event(event),
            })
            .await;
            if let Err(err) = result {
                warn!("dispatch task failed: {err}");
            }
        }
        warn!("event dispatcher stopped");
    });
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.device.status())
}

async fn handle_water_on(State(state): State<AppState>) -> impl IntoResponse {
    match state.device.trigger_water_on() {
        Ok(()) => Json(state.device.status()).into_response(),
        Err(err) => device_error(err),
    }
}

async fn handle_water_off(State(state): State<AppState>) -> impl IntoResponse {
    match state.device.trigger_water_off() {
        Ok(()) => Json(state.device.status()).into_response(),
        Err(err) => device_error(err),
    }
}

async fn handle_get_events(State(state): State<AppState>) -> impl IntoResponse {
    let slots: Vec<ScheduleSlotView> = state
        .device
        .schedule()
        .slots()
        .iter()
        .enumerate()
        .map(|(index, event)| ScheduleSlotView {
            index,
            event: *event,
        })
        .collect();
    Json(slots)
}

async fn handle_add_event(
    State(state): State<AppState>,
    Json(request): Json<AddEventRequest>,
) -> impl IntoResponse {
    let result = state.device.add_event(
        request.hour,
        request.minute,
        request.skip_seconds,
        request.days_mask,
        request.duration_seconds,
    );
    match result {
        Ok(index) => (StatusCode::CREATED, Json(AddEventResponse { index })).into_response(),
        Err(err) => device_error(err),
    }
}

async fn handle_delete_event(
    State(state): State<AppState>,
    UrlPath(index): UrlPath<usize>,
) -> impl IntoResponse {
    match state.device.delete_event(index) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => device_error(err),
    }
}

async fn handle_apply_update(
    State(state): State<AppState>,
    Json(request): Json<UpdateRequest>,
) -> impl IntoResponse {
    let device = state.device.clone();
    let result = tokio::task::spawn_blocking(move || device.apply_update(&request.url)).await;

    match result {
        Ok(Ok(())) => Json(UpdateAccepted {
            accepted: true,
            restart_in_ms: state.device.config().restart_delay_ms,
        })
        .into_response(),
        Ok(Err(err)) => device_error(err),
        Err(err) => {
            warn!("update task failed: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Update task failed")
        }
    }
}

async fn handle_get_network(State(state): State<AppState>) -> impl IntoResponse {
    Json(NetworkConfigView::from(&state.device.network_config()))
}

async fn handle_put_network(
    State(state): State<AppState>,
    Json(update): Json<NetworkConfigUpdate>,
) -> impl IntoResponse {
    if update
        .wifi_ssid
        .as_deref()
        .is_some_and(|ssid| ssid.trim().is_empty())
    {
        return error_response(StatusCode::BAD_REQUEST, "wifiSsid cannot be empty");
    }

    match state.device.update_network_config(update) {
        Ok((network, restart_required)) => Json(NetworkUpdateResponse {
            restart_required,
            network: NetworkConfigView::from(&network),
        })
        .into_response(),
        Err(err) => device_error(err),
    }
}

fn device_error(err: IrrigationError) -> axum::response::Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        warn!("request failed: {err}");
    }
    error_response(status, &err.to_string())
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// One file per key under the store directory.
struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    fn open(dir: PathBuf) -> anyhow::Result<Self> {
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create store dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn read(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        match fs::read(self.dir.join(key)) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("failed to read key {key}")),
        }
    }

    fn write(&self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        let path = self.dir.join(key);
        let staging = path.with_extension("tmp");
        fs::write(&staging, value).with_context(|| format!("failed to write key {key}"))?;
        fs::rename(&staging, &path).with_context(|| format!("failed to commit key {key}"))?;
        Ok(())
    }
}

impl KvStore for FileStore {
    fn get_blob(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        self.read(key)
    }

    fn set_blob(&mut self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        self.write(key, value)
    }

    fn get_str(&self, key: &str) -> anyhow::Result<Option<String>> {
        self.read(key)?
            .map(|raw| String::from_utf8(raw).with_context(|| format!("key {key} is not UTF-8")))
            .transpose()
    }

    fn set_str(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        self.write(key, value.as_bytes())
    }
}

struct LogValve;

impl ValveOutput for LogValve {
    fn set_open(&mut self, open: bool) -> anyhow::Result<()> {
        info!("valve {}", if open { "OPEN" } else { "CLOSED" });
        Ok(())
    }
}

struct LogIndicator;

impl StatusIndicator for LogIndicator {
    fn set_pattern(&mut self, pattern: IndicatorPattern) {
        info!("status LED: {pattern:?}");
    }
}

struct TokioTimers {
    tx: UnboundedSender<HostEvent>,
    runtime: Handle,
    tasks: [Option<JoinHandle<()>>; TimerId::ALL.len()],
}

impl TokioTimers {
    fn new(tx: UnboundedSender<HostEvent>, runtime: Handle) -> Self {
        Self {
            tx,
            runtime,
            tasks: Default::default(),
        }
    }

    fn slot(id: TimerId) -> usize {
        TimerId::ALL
            .iter()
            .position(|candidate| *candidate == id)
            .unwrap_or_default()
    }

    fn replace(&mut self, id: TimerId, task: JoinHandle<()>) {
        if let Some(previous) = self.tasks[Self::slot(id)].replace(task) {
            previous.abort();
        }
    }
}

impl TimerService for TokioTimers {
    fn start_once(&mut self, token: TimerToken, after: Duration) -> anyhow::Result<()> {
        let tx = self.tx.clone();
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(HostEvent::Timer(token));
        });
        self.replace(token.id, task);
        Ok(())
    }

    fn start_periodic(&mut self, token: TimerToken, period: Duration) -> anyhow::Result<()> {
        let tx = self.tx.clone();
        let task = self.runtime.spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                if tx.send(HostEvent::Timer(token)).is_err() {
                    break;
                }
            }
        });
        self.replace(token.id, task);
        Ok(())
    }

    fn stop(&mut self, id: TimerId) {
        if let Some(task) = self.tasks[Self::slot(id)].take() {
            task.abort();
        }
    }
}

struct HostClock {
    time_synced: Arc<AtomicBool>,
}

impl Clock for HostClock {
    fn monotonic_ms(&self) -> u64 {
        monotonic_ms()
    }

    fn now_utc(&self) -> Option<DateTime<Utc>> {
        self.time_synced
            .load(Ordering::Relaxed)
            .then(Utc::now)
    }
}

/// Simulated station: connects shortly after a connect call when it has an SSID, and
/// "pairs" a few seconds after pairing is enabled.
struct SimNetwork {
    tx: UnboundedSender<HostEvent>,
    runtime: Handle,
    ssid: Arc<Mutex<Option<String>>>,
    pairing: Option<JoinHandle<()>>,
}

impl SimNetwork {
    fn new(tx: UnboundedSender<HostEvent>, runtime: Handle, ssid: Option<String>) -> Self {
        Self {
            tx,
            runtime,
            ssid: Arc::new(Mutex::new(ssid)),
            pairing: None,
        }
    }

    fn current_ssid(&self) -> Option<String> {
        self.ssid
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl NetworkPort for SimNetwork {
    fn connect(&mut self) -> anyhow::Result<()> {
        let ssid = self
            .current_ssid()
            .ok_or_else(|| anyhow!("no station credentials"))?;
        info!("sim radio: connecting to `{ssid}`");

        let tx = self.tx.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(SIM_CONNECT_DELAY).await;
            let _ = tx.send(HostEvent::Network(NetEvent::GotIp));
        });
        Ok(())
    }

    fn enable_pairing(&mut self) -> anyhow::Result<()> {
        info!("sim radio: push-button pairing enabled");
        let tx = self.tx.clone();
        let ssid = self.ssid.clone();
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(SIM_PAIRING_DELAY).await;
            *ssid.lock().unwrap_or_else(std::sync::PoisonError::into_inner) =
                Some(SIM_PAIRED_SSID.to_string());
            let _ = tx.send(HostEvent::Network(NetEvent::PairingSucceeded));
        });
        if let Some(previous) = self.pairing.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    fn disable_pairing(&mut self) -> anyhow::Result<()> {
        if let Some(task) = self.pairing.take() {
            task.abort();
        }
        Ok(())
    }

    fn enable_legacy_protocols(&mut self) -> anyhow::Result<()> {
        info!("sim radio: 802.11b/g/n enabled");
        Ok(())
    }
}

/// Runs the request surface while connected and stands in for SNTP and mDNS.
struct HostServices {
    runtime: Handle,
    router: Arc<OnceLock<Router>>,
    port: u16,
    server: Option<JoinHandle<()>>,
    time_synced: Arc<AtomicBool>,
}

impl ServiceHost for HostServices {
    fn start(&mut self, config: &NetworkConfig) -> anyhow::Result<()> {
        let router = self
            .router
            .get()
            .cloned()
            .ok_or_else(|| anyhow!("request router not ready"))?;
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));

        self.stop();
        self.server = Some(self.runtime.spawn(async move {
            let listener = match TcpListener::bind(addr).await {
                Ok(listener) => listener,
                Err(err) => {
                    warn!("failed to bind controller server at {addr}: {err}");
                    return;
                }
            };
            info!("controller listening on http://{addr}");
            if let Err(err) = axum::serve(listener, router).await {
                warn!("controller server stopped: {err}");
            }
        }));

        info!(
            "advertising {}.local as `{}` (_http._tcp, port {})",
            config.hostname, config.instance_name, self.port
        );
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(server) = self.server.take() {
            server.abort();
            info!("controller server stopped; advertisement withdrawn");
        }
    }

    fn start_time_sync(&mut self, server: &str) -> anyhow::Result<()> {
        info!("time sync via {server} (host clock)");
        self.time_synced.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn show_pin(&mut self, pin: &str) {
        info!("pairing PIN: {pin}");
    }
}

struct ExitRestarter;

impl Restarter for ExitRestarter {
    fn restart(&mut self) {
        info!("restart requested; exiting so the supervisor can boot the new image");
        std::process::exit(0);
    }
}

struct FileSource;

impl FirmwareSource for FileSource {
    fn open(&mut self, url: &str) -> anyhow::Result<Box<dyn FirmwareStream + '_>> {
        let Some(path) = url.strip_prefix("file://") else {
            return Err(anyhow!(
                "the simulator only fetches file:// images (got {url})"
            ));
        };
        let file = File::open(path).with_context(|| format!("failed to open {path}"))?;
        let length = file.metadata().ok().map(|meta| meta.len());
        Ok(Box::new(FileStream { file, length }))
    }
}

struct FileStream {
    file: File,
    length: Option<u64>,
}

impl FirmwareStream for FileStream {
    fn content_length(&self) -> Option<u64> {
        self.length
    }

    fn read(&mut self, buf: &mut [u8]) -> anyhow::Result<usize> {
        Ok(self.file.read(buf)?)
    }
}

/// Two image slots plus a `boot` marker naming the active one.
struct FilePartition {
    dir: PathBuf,
}

impl FilePartition {
    fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn boot_marker(&self) -> PathBuf {
        self.dir.join("boot")
    }

    fn active_slot(&self) -> String {
        fs::read_to_string(self.boot_marker())
            .map(|slot| slot.trim().to_string())
            .unwrap_or_else(|_| "a".to_string())
    }
}

impl UpdatePartition for FilePartition {
    fn begin(&mut self) -> anyhow::Result<Box<dyn UpdateWriter + '_>> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let target = if self.active_slot() == "a" { "b" } else { "a" };
        let staging = self.dir.join(format!("slot_{target}.partial"));
        let file = File::create(&staging)
            .with_context(|| format!("failed to open {}", staging.display()))?;

        info!("writing update into slot {target}");
        Ok(Box::new(FileWriter {
            file,
            staging,
            image: self.dir.join(format!("slot_{target}.bin")),
            boot_marker: self.boot_marker(),
            target,
        }))
    }
}

struct FileWriter {
    file: File,
    staging: PathBuf,
    image: PathBuf,
    boot_marker: PathBuf,
    target: &'static str,
}

impl UpdateWriter for FileWriter {
    fn write(&mut self, chunk: &[u8]) -> anyhow::Result<()> {
        self.file.write_all(chunk)?;
        Ok(())
    }

    fn abort(self: Box<Self>) -> anyhow::Result<()> {
        drop(self.file);
        remove_if_present(&self.staging)
    }

    fn finalize_and_activate(self: Box<Self>) -> anyhow::Result<()> {
        self.file.sync_all()?;
        drop(self.file);
        fs::rename(&self.staging, &self.image)
            .with_context(|| format!("failed to finalize {}", self.image.display()))?;
        fs::write(&self.boot_marker, self.target)
            .with_context(|| format!("failed to set boot slot {}", self.target))?;
        Ok(())
    }
}

fn remove_if_present(path: &Path) -> anyhow::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
