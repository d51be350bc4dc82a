use core::convert::TryInto;
use std::{
    ffi::c_void,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
        Arc, Mutex, OnceLock, PoisonError,
    },
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use embedded_svc::{
    http::Method,
    io::{Read, Write},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{AnyOutputPin, Output, OutputPin, PinDriver};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    mdns::EspMdns,
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    ota::{EspOta, EspOtaUpdate},
    sntp::{EspSntp, SntpConf},
    sys::{self, esp},
    timer::{EspTaskTimerService, EspTimer},
    wifi::EspWifi,
};
use log::{debug, info, warn};
use serde::Serialize;

use irrigation_common::{
    AddEventRequest, AddEventResponse, Clock, ControllerConfig, Device, DeviceParts,
    DisconnectReason, FirmwareSource, FirmwareStream, IndicatorPattern, IrrigationError, KvStore,
    NetEvent, NetworkConfig, NetworkConfigUpdate, NetworkConfigView, NetworkPort,
    NetworkUpdateResponse, Restarter, ScheduleSlotView, ServiceHost, StatusIndicator, TimerId,
    TimerService, TimerToken, UpdateAccepted, UpdatePartition, UpdateRequest, UpdateWriter,
    ValveOutput,
};

const NVS_NAMESPACE: &str = "irrigation";
const MAX_HTTP_BODY: usize = 4096;
const MAX_NVS_VALUE: usize = 4096;
const HTTP_PORT: u16 = 80;
const VALVE_PIN: i32 = 5;
const STATUS_LED_PIN: i32 = 2;
const LED_FAST_BLINK_MS: u64 = 250;
const LED_SLOW_BLINK_MS: u64 = 1_000;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const DISPATCH_IDLE: Duration = Duration::from_secs(5);
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Inputs serialized onto the main task.
#[derive(Debug)]
enum DeviceInput {
    Timer(TimerToken),
    Network(NetEvent),
}

static INPUTS: OnceLock<Sender<DeviceInput>> = OnceLock::new();
static STATION_HAS_CREDENTIALS: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let store = NvsStore {
        partition: nvs_partition.clone(),
    };

    let mut network = NetworkConfig::load(&store).unwrap_or_else(|err| {
        warn!("failed to load network config from NVS: {err:#}");
        NetworkConfig::default()
    });
    ensure_wifi_defaults(&mut network);
    info!(
        "NVS config loaded: ssid=`{}`, hostname=`{}`, tz=`{}`",
        network.wifi_ssid, network.hostname, network.timezone
    );

    let (tx, rx) = mpsc::channel();
    INPUTS
        .set(tx.clone())
        .map_err(|_| anyhow!("event channel already initialized"))?;

    let peripherals = Peripherals::take()?;
    let valve = GpioValve::new(peripherals.pins.gpio5.downgrade_output())?;
    let timer_service = EspTaskTimerService::new()?;
    let indicator = BlinkIndicator::new(&timer_service, peripherals.pins.gpio2.downgrade_output())?;

    let mut wifi = EspWifi::new(peripherals.modem, sys_loop, Some(nvs_partition))?;
    if let Err(err) = wifi.sta_netif_mut().set_hostname(&network.hostname) {
        warn!("failed to set station hostname: {err}");
    }
    let has_credentials = configure_station(&mut wifi, &network)?;
    STATION_HAS_CREDENTIALS.store(has_credentials, Ordering::SeqCst);
    register_event_handlers()?;
    // STA_START queues the first connect attempt; it is handled once dispatch begins.
    wifi.start().context("failed to start wifi")?;

    let mut ota = EspOta::new().map_err(|err| anyhow!("failed to acquire OTA: {err:?}"))?;
    if let Err(err) = ota.mark_running_slot_valid() {
        warn!("failed to mark running OTA slot valid: {err:?}");
    }

    let time_synced = Arc::new(AtomicBool::new(false));
    let device_slot = Arc::new(OnceLock::new());

    let parts = DeviceParts {
        store: Box::new(store),
        valve: Box::new(valve),
        indicator: Box::new(indicator),
        network: Box::new(StationPort { wifi }),
        services: Box::new(EspServices {
            device: device_slot.clone(),
            server: None,
            mdns: None,
            sntp: None,
            time_synced: time_synced.clone(),
        }),
        timers: Box::new(EspTimers::new(timer_service, tx)),
        clock: Box::new(EspClock { time_synced }),
        restarter: Box::new(EspRestarter),
        firmware_source: Box::new(HttpFirmwareSource),
        update_partition: Box::new(OtaPartition { ota }),
    };

    let device = Arc::new(Device::new(ControllerConfig::default(), parts)?);
    if device_slot.set(device.clone()).is_err() {
        return Err(anyhow!("device initialized twice"));
    }
    device.start()?;

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    dispatch_loop(&device, rx);
    Ok(())
}

fn ensure_wifi_defaults(network: &mut NetworkConfig) {
    if network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            network.wifi_ssid = ssid.to_string();
        }
    }

    if network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            network.wifi_pass = pass.to_string();
        }
    }
    network.sanitize();
}

/// Returns whether the station has something to connect to: either stored settings or
/// credentials the driver kept from an earlier push-button pairing.
fn configure_station(wifi: &mut EspWifi<'static>, network: &NetworkConfig) -> anyhow::Result<bool> {
    if network.has_station_credentials() {
        let auth_method = if network.wifi_pass.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };
        wifi.set_configuration(&Configuration::Client(ClientConfiguration {
            ssid: network
                .wifi_ssid
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("wifi ssid too long"))?,
            password: network
                .wifi_pass
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("wifi password too long"))?,
            auth_method,
            ..Default::default()
        }))?;
        return Ok(true);
    }

    let paired = match wifi.get_configuration()? {
        Configuration::Client(client) => !client.ssid.is_empty(),
        _ => false,
    };
    if !paired {
        wifi.set_configuration(&Configuration::Client(ClientConfiguration::default()))?;
    }
    Ok(paired)
}

fn dispatch_loop(device: &Device, rx: Receiver<DeviceInput>) {
    loop {
        match rx.recv_timeout(DISPATCH_IDLE) {
            Ok(DeviceInput::Timer(token)) => device.on_timer(token),
            Ok(DeviceInput::Network(event)) => {
                debug!("network event {event:?}");
                device.on_network_event(event);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                warn!("event channel closed");
                return;
            }
        }
        feed_watchdog();
    }
}

fn post_input(input: DeviceInput) {
    if let Some(tx) = INPUTS.get() {
        if tx.send(input).is_err() {
            warn!("dropping input; dispatcher stopped");
        }
    }
}

fn register_event_handlers() -> anyhow::Result<()> {
    unsafe extern "C" fn wifi_event_handler(
        _handler_arg: *mut c_void,
        _event_base: sys::esp_event_base_t,
        event_id: i32,
        event_data: *mut c_void,
    ) {
        let event = match event_id as u32 {
            sys::wifi_event_t_WIFI_EVENT_STA_START => Some(NetEvent::StationStarted {
                has_credentials: STATION_HAS_CREDENTIALS.load(Ordering::SeqCst),
            }),
            sys::wifi_event_t_WIFI_EVENT_STA_DISCONNECTED => {
                let code = if event_data.is_null() {
                    0
                } else {
                    (*(event_data as *const sys::wifi_event_sta_disconnected_t)).reason as u16
                };
                Some(NetEvent::Disconnected {
                    reason: disconnect_reason(code),
                })
            }
            sys::wifi_event_t_WIFI_EVENT_STA_WPS_ER_SUCCESS => {
                STATION_HAS_CREDENTIALS.store(true, Ordering::SeqCst);
                Some(NetEvent::PairingSucceeded)
            }
            sys::wifi_event_t_WIFI_EVENT_STA_WPS_ER_FAILED => Some(NetEvent::PairingFailed),
            sys::wifi_event_t_WIFI_EVENT_STA_WPS_ER_TIMEOUT => Some(NetEvent::PairingTimeout),
            sys::wifi_event_t_WIFI_EVENT_STA_WPS_ER_PIN if !event_data.is_null() => {
                let pin = &*(event_data as *const sys::wifi_event_sta_wps_er_pin_t);
                Some(NetEvent::PairingPin(
                    String::from_utf8_lossy(&pin.pin_code).into_owned(),
                ))
            }
            _ => None,
        };

        if let Some(event) = event {
            post_input(DeviceInput::Network(event));
        }
    }

    unsafe extern "C" fn ip_event_handler(
        _handler_arg: *mut c_void,
        _event_base: sys::esp_event_base_t,
        event_id: i32,
        _event_data: *mut c_void,
    ) {
        if event_id as u32 == sys::ip_event_t_IP_EVENT_STA_GOT_IP {
            post_input(DeviceInput::Network(NetEvent::GotIp));
        }
    }

    unsafe {
        esp!(sys::esp_event_handler_register(
            sys::WIFI_EVENT,
            sys::ESP_EVENT_ANY_ID,
            Some(wifi_event_handler),
            core::ptr::null_mut(),
        ))
        .context("failed to register wifi event handler")?;
        esp!(sys::esp_event_handler_register(
            sys::IP_EVENT,
            sys::ip_event_t_IP_EVENT_STA_GOT_IP as i32,
            Some(ip_event_handler),
            core::ptr::null_mut(),
        ))
        .context("failed to register ip event handler")?;
    }
    Ok(())
}

fn disconnect_reason(code: u16) -> DisconnectReason {
    if u32::from(code) == sys::wifi_err_reason_t_WIFI_REASON_BASIC_RATE_NOT_SUPPORT {
        DisconnectReason::BasicRateNotSupported
    } else {
        DisconnectReason::Other(code)
    }
}

struct StationPort {
    wifi: EspWifi<'static>,
}

impl StationPort {
    fn wps_config() -> sys::esp_wps_config_t {
        let mut config: sys::esp_wps_config_t = unsafe { core::mem::zeroed() };
        config.wps_type = sys::wps_type_WPS_TYPE_PBC;
        copy_c_str(&mut config.factory_info.manufacturer, "ESPRESSIF");
        copy_c_str(&mut config.factory_info.model_number, "ESP32");
        copy_c_str(&mut config.factory_info.model_name, "ESPRESSIF IOT");
        copy_c_str(&mut config.factory_info.device_name, "IRRIGATION");
        config
    }
}

fn copy_c_str(dst: &mut [core::ffi::c_char], value: &str) {
    let len = value.len().min(dst.len().saturating_sub(1));
    for (slot, byte) in dst.iter_mut().zip(value.bytes().take(len)) {
        *slot = byte as core::ffi::c_char;
    }
}

impl NetworkPort for StationPort {
    fn connect(&mut self) -> anyhow::Result<()> {
        if !STATION_HAS_CREDENTIALS.load(Ordering::SeqCst) {
            return Err(anyhow!("no station credentials"));
        }
        self.wifi.connect()?;
        Ok(())
    }

    fn enable_pairing(&mut self) -> anyhow::Result<()> {
        let config = Self::wps_config();
        unsafe {
            esp!(sys::esp_wifi_wps_enable(&config)).context("failed to enable WPS")?;
            esp!(sys::esp_wifi_wps_start(0)).context("failed to start WPS")?;
        }
        info!("push-button pairing enabled");
        Ok(())
    }

    fn disable_pairing(&mut self) -> anyhow::Result<()> {
        esp!(unsafe { sys::esp_wifi_wps_disable() }).context("failed to disable WPS")?;
        Ok(())
    }

    fn enable_legacy_protocols(&mut self) -> anyhow::Result<()> {
        let protocols =
            (sys::WIFI_PROTOCOL_11B | sys::WIFI_PROTOCOL_11G | sys::WIFI_PROTOCOL_11N) as u8;
        esp!(unsafe { sys::esp_wifi_set_protocol(sys::wifi_interface_t_WIFI_IF_STA, protocols) })
            .context("failed to enable 802.11b/g/n")?;
        Ok(())
    }
}

/// HTTP server, mDNS advertisement and SNTP: everything that runs while connected.
struct EspServices {
    device: Arc<OnceLock<Arc<Device>>>,
    server: Option<EspHttpServer<'static>>,
    mdns: Option<EspMdns>,
    sntp: Option<EspSntp<'static>>,
    time_synced: Arc<AtomicBool>,
}

impl EspServices {
    fn advertise(&mut self, config: &NetworkConfig) -> anyhow::Result<()> {
        let mdns = match self.mdns.as_mut() {
            Some(mdns) => mdns,
            None => self.mdns.insert(EspMdns::take()?),
        };
        mdns.set_hostname(&config.hostname)?;
        mdns.set_instance_name(&config.instance_name)?;
        mdns.add_service(
            Some(&config.instance_name),
            "_http",
            "_tcp",
            HTTP_PORT,
            &[("path", "/api/status")],
        )?;
        Ok(())
    }
}

impl ServiceHost for EspServices {
    fn start(&mut self, config: &NetworkConfig) -> anyhow::Result<()> {
        let device = self
            .device
            .get()
            .cloned()
            .ok_or_else(|| anyhow!("device not initialized"))?;
        if self.server.is_none() {
            self.server = Some(create_http_server(device)?);
            info!("HTTP server listening on port {HTTP_PORT}");
        }
        if let Err(err) = self.advertise(config) {
            warn!("failed to start mDNS: {err:#}");
        } else {
            info!("mDNS service started: {}.local", config.hostname);
        }
        Ok(())
    }

    fn stop(&mut self) {
        if self.server.take().is_some() {
            info!("HTTP server stopped");
        }
        if let Some(mdns) = self.mdns.as_mut() {
            if let Err(err) = mdns.remove_service("_http", "_tcp") {
                debug!("mDNS service removal failed: {err}");
            }
        }
    }

    fn start_time_sync(&mut self, server: &str) -> anyhow::Result<()> {
        if self.sntp.is_some() {
            return Ok(());
        }
        let mut conf = SntpConf::default();
        conf.servers[0] = server;
        let synced = self.time_synced.clone();
        let sntp = EspSntp::new_with_callback(&conf, move |_| {
            synced.store(true, Ordering::SeqCst);
        })
        .context("failed to start SNTP")?;
        self.sntp = Some(sntp);
        info!("SNTP initialized with `{server}`");
        Ok(())
    }

    fn show_pin(&mut self, pin: &str) {
        info!("WPS PIN = {pin}");
    }
}

fn create_http_server(device: Arc<Device>) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        http_port: HTTP_PORT,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    {
        let device = device.clone();
        server.fn_handler("/api/status", Method::Get, move |req| {
            write_json(req, 200, &device.status())
        })?;
    }

    {
        let device = device.clone();
        server.fn_handler("/api/water/on", Method::Post, move |req| {
            match device.trigger_water_on() {
                Ok(()) => write_json(req, 200, &device.status()),
                Err(err) => write_device_error(req, &err),
            }
        })?;
    }

    {
        let device = device.clone();
        server.fn_handler("/api/water/off", Method::Post, move |req| {
            match device.trigger_water_off() {
                Ok(()) => write_json(req, 200, &device.status()),
                Err(err) => write_device_error(req, &err),
            }
        })?;
    }

    {
        let device = device.clone();
        server.fn_handler("/api/events", Method::Get, move |req| {
            let slots: Vec<ScheduleSlotView> = device
                .schedule()
                .slots()
                .iter()
                .enumerate()
                .map(|(index, event)| ScheduleSlotView {
                    index,
                    event: *event,
                })
                .collect();
            write_json(req, 200, &slots)
        })?;
    }

    {
        let device = device.clone();
        server.fn_handler("/api/events", Method::Post, move |mut req| {
            let body = match read_request_body(&mut req) {
                Ok(body) => body,
                Err(err) => return write_error(req, 400, &err.to_string()),
            };
            let request = match serde_json::from_slice::<AddEventRequest>(&body) {
                Ok(request) => request,
                Err(err) => return write_error(req, 400, &format!("Invalid JSON body: {err}")),
            };

            match device.add_event(
                request.hour,
                request.minute,
                request.skip_seconds,
                request.days_mask,
                request.duration_seconds,
            ) {
                Ok(index) => write_json(req, 201, &AddEventResponse { index }),
                Err(err) => write_device_error(req, &err),
            }
        })?;
    }

    {
        let device = device.clone();
        server.fn_handler("/api/events/delete", Method::Post, move |req| {
            let uri = req.uri().to_string();
            let Some(index) = query_param(&uri, "index").and_then(|value| value.parse().ok())
            else {
                return write_error(req, 400, "Missing or invalid 'index' parameter");
            };

            match device.delete_event(index) {
                Ok(()) => write_json(req, 200, &device.status()),
                Err(err) => write_device_error(req, &err),
            }
        })?;
    }

    {
        let device = device.clone();
        server.fn_handler("/api/update", Method::Post, move |mut req| {
            let body = match read_request_body(&mut req) {
                Ok(body) => body,
                Err(err) => return write_error(req, 400, &err.to_string()),
            };
            let request = if body.is_empty() {
                UpdateRequest {
                    url: String::new(),
                }
            } else {
                match serde_json::from_slice::<UpdateRequest>(&body) {
                    Ok(request) => request,
                    Err(err) => {
                        return write_error(req, 400, &format!("Invalid JSON body: {err}"))
                    }
                }
            };

            match device.apply_update(&request.url) {
                Ok(()) => write_json(
                    req,
                    200,
                    &UpdateAccepted {
                        accepted: true,
                        restart_in_ms: device.config().restart_delay_ms,
                    },
                ),
                Err(err) => write_device_error(req, &err),
            }
        })?;
    }

    {
        let device = device.clone();
        server.fn_handler("/api/network", Method::Get, move |req| {
            write_json(req, 200, &NetworkConfigView::from(&device.network_config()))
        })?;
    }

    {
        let device = device.clone();
        server.fn_handler("/api/network", Method::Put, move |mut req| {
            let body = match read_request_body(&mut req) {
                Ok(body) => body,
                Err(err) => return write_error(req, 400, &err.to_string()),
            };
            let update = match serde_json::from_slice::<NetworkConfigUpdate>(&body) {
                Ok(update) => update,
                Err(err) => return write_error(req, 400, &format!("Invalid JSON body: {err}")),
            };
            if update
                .wifi_ssid
                .as_deref()
                .is_some_and(|ssid| ssid.trim().is_empty())
            {
                return write_error(req, 400, "wifiSsid cannot be empty");
            }

            match device.update_network_config(update) {
                Ok((network, restart_required)) => write_json(
                    req,
                    200,
                    &NetworkUpdateResponse {
                        restart_required,
                        network: NetworkConfigView::from(&network),
                    },
                ),
                Err(err) => write_device_error(req, &err),
            }
        })?;
    }

    Ok(server)
}

type HttpRequest<'r, 'c> =
    esp_idf_svc::http::server::Request<&'r mut esp_idf_svc::http::server::EspHttpConnection<'c>>;

fn read_request_body(req: &mut HttpRequest<'_, '_>) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(
    req: HttpRequest<'_, '_>,
    status_code: u16,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(req: HttpRequest<'_, '_>, status_code: u16, message: &str) -> anyhow::Result<()> {
    write_json(req, status_code, &ErrorBody { error: message })
}

fn write_device_error(req: HttpRequest<'_, '_>, err: &IrrigationError) -> anyhow::Result<()> {
    let status_code = err.status_code();
    if status_code >= 500 {
        warn!("request failed: {err}");
    }
    write_error(req, status_code, &err.to_string())
}

fn query_param(uri: &str, key: &str) -> Option<String> {
    let query = uri.split_once('?')?.1;
    for pair in query.split('&') {
        let mut parts = pair.splitn(2, '=');
        let name = parts.next()?;
        let value = parts.next().unwrap_or_default();
        if name == key {
            return Some(value.replace('+', " "));
        }
    }

    None
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
}

impl NvsStore {
    fn open(&self) -> anyhow::Result<EspNvs<NvsDefault>> {
        Ok(EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?)
    }
}

impl KvStore for NvsStore {
    fn get_blob(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let nvs = self.open()?;
        let mut buffer = vec![0_u8; MAX_NVS_VALUE];
        Ok(nvs.get_blob(key, &mut buffer)?.map(<[u8]>::to_vec))
    }

    fn set_blob(&mut self, key: &str, value: &[u8]) -> anyhow::Result<()> {
        let mut nvs = self.open()?;
        nvs.set_blob(key, value)?;
        Ok(())
    }

    fn get_str(&self, key: &str) -> anyhow::Result<Option<String>> {
        let nvs = self.open()?;
        let mut buffer = vec![0_u8; MAX_NVS_VALUE];
        Ok(nvs.get_str(key, &mut buffer)?.map(str::to_string))
    }

    fn set_str(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut nvs = self.open()?;
        nvs.set_str(key, value)?;
        Ok(())
    }
}

struct GpioValve {
    pin: PinDriver<'static, AnyOutputPin, Output>,
}

impl GpioValve {
    fn new(pin: AnyOutputPin) -> anyhow::Result<Self> {
        let mut pin = PinDriver::output(pin)
            .with_context(|| format!("valve output unavailable on GPIO{VALVE_PIN}"))?;
        pin.set_low()?;
        Ok(Self { pin })
    }
}

impl ValveOutput for GpioValve {
    fn set_open(&mut self, open: bool) -> anyhow::Result<()> {
        if open {
            self.pin.set_high()?;
        } else {
            self.pin.set_low()?;
        }
        Ok(())
    }
}

struct StatusLed {
    pin: PinDriver<'static, AnyOutputPin, Output>,
    lit: bool,
}

impl StatusLed {
    fn drive(&mut self, lit: bool) {
        let result = if lit {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        };

        if let Err(err) = result {
            warn!("failed to drive status LED: {err}");
        } else {
            self.lit = lit;
        }
    }
}

struct BlinkIndicator {
    led: Arc<Mutex<StatusLed>>,
    timer: EspTimer<'static>,
}

impl BlinkIndicator {
    fn new(timer_service: &EspTaskTimerService, pin: AnyOutputPin) -> anyhow::Result<Self> {
        let mut pin = PinDriver::output(pin)
            .with_context(|| format!("status LED unavailable on GPIO{STATUS_LED_PIN}"))?;
        pin.set_low()?;
        let led = Arc::new(Mutex::new(StatusLed { pin, lit: false }));

        let toggled = led.clone();
        let timer = timer_service.timer(move || {
            let mut led = toggled.lock().unwrap_or_else(PoisonError::into_inner);
            let lit = !led.lit;
            led.drive(lit);
        })?;
        Ok(Self { led, timer })
    }
}

impl StatusIndicator for BlinkIndicator {
    fn set_pattern(&mut self, pattern: IndicatorPattern) {
        if let Err(err) = self.timer.cancel() {
            warn!("failed to cancel blink timer: {err}");
        }

        let period_ms = match pattern {
            IndicatorPattern::Off => {
                self.led
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .drive(false);
                return;
            }
            IndicatorPattern::SlowBlink => LED_SLOW_BLINK_MS,
            IndicatorPattern::FastBlink => LED_FAST_BLINK_MS,
        };
        if let Err(err) = self.timer.every(Duration::from_millis(period_ms)) {
            warn!("failed to start blink timer: {err}");
        }
    }
}

struct EspTimers {
    service: EspTaskTimerService,
    tx: Sender<DeviceInput>,
    timers: [Option<EspTimer<'static>>; TimerId::ALL.len()],
}

impl EspTimers {
    fn new(service: EspTaskTimerService, tx: Sender<DeviceInput>) -> Self {
        Self {
            service,
            tx,
            timers: Default::default(),
        }
    }

    fn slot(id: TimerId) -> usize {
        TimerId::ALL
            .iter()
            .position(|candidate| *candidate == id)
            .unwrap_or_default()
    }

    fn create(&mut self, token: TimerToken) -> anyhow::Result<&mut EspTimer<'static>> {
        let tx = self.tx.clone();
        let timer = self.service.timer(move || {
            let _ = tx.send(DeviceInput::Timer(token));
        })?;
        Ok(self.timers[Self::slot(token.id)].insert(timer))
    }
}

impl TimerService for EspTimers {
    fn start_once(&mut self, token: TimerToken, after: Duration) -> anyhow::Result<()> {
        self.create(token)?.after(after)?;
        Ok(())
    }

    fn start_periodic(&mut self, token: TimerToken, period: Duration) -> anyhow::Result<()> {
        self.create(token)?.every(period)?;
        Ok(())
    }

    fn stop(&mut self, id: TimerId) {
        if let Some(timer) = self.timers[Self::slot(id)].take() {
            if let Err(err) = timer.cancel() {
                warn!("failed to cancel {id:?} timer: {err}");
            }
        }
    }
}

struct EspClock {
    time_synced: Arc<AtomicBool>,
}

impl Clock for EspClock {
    fn monotonic_ms(&self) -> u64 {
        monotonic_ms()
    }

    fn now_utc(&self) -> Option<DateTime<Utc>> {
        self.time_synced.load(Ordering::SeqCst).then(Utc::now)
    }
}

struct EspRestarter;

impl Restarter for EspRestarter {
    fn restart(&mut self) {
        info!("restarting into the updated image");
        unsafe { sys::esp_restart() };
    }
}

struct HttpFirmwareSource;

impl FirmwareSource for HttpFirmwareSource {
    fn open(&mut self, url: &str) -> anyhow::Result<Box<dyn FirmwareStream + '_>> {
        let http_conf = HttpClientConfiguration {
            timeout: Some(HTTP_TIMEOUT),
            crt_bundle_attach: Some(sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        let mut connection = EspHttpConnection::new(&http_conf)?;
        connection.initiate_request(Method::Get, url, &[])?;
        connection.initiate_response()?;

        let status = connection.status();
        if !(200..300).contains(&status) {
            return Err(anyhow!("firmware download failed with HTTP {status}"));
        }
        let length = connection
            .header("Content-Length")
            .and_then(|value| value.parse::<u64>().ok());

        Ok(Box::new(HttpFirmwareStream { connection, length }))
    }
}

struct HttpFirmwareStream {
    connection: EspHttpConnection,
    length: Option<u64>,
}

impl FirmwareStream for HttpFirmwareStream {
    fn content_length(&self) -> Option<u64> {
        self.length
    }

    fn read(&mut self, buf: &mut [u8]) -> anyhow::Result<usize> {
        Ok(self.connection.read(buf)?)
    }
}

struct OtaPartition {
    ota: EspOta,
}

impl UpdatePartition for OtaPartition {
    fn begin(&mut self) -> anyhow::Result<Box<dyn UpdateWriter + '_>> {
        let update = self
            .ota
            .initiate_update()
            .map_err(|err| anyhow!("failed to initiate OTA update: {err:?}"))?;
        Ok(Box::new(OtaWriter { update }))
    }
}

struct OtaWriter<'a> {
    update: EspOtaUpdate<'a>,
}

impl UpdateWriter for OtaWriter<'_> {
    fn write(&mut self, chunk: &[u8]) -> anyhow::Result<()> {
        self.update
            .write(chunk)
            .map_err(|err| anyhow!("failed writing OTA data: {err:?}"))?;
        Ok(())
    }

    fn abort(self: Box<Self>) -> anyhow::Result<()> {
        self.update
            .abort()
            .map_err(|err| anyhow!("failed aborting OTA update: {err:?}"))
    }

    fn finalize_and_activate(self: Box<Self>) -> anyhow::Result<()> {
        self.update
            .complete()
            .map_err(|err| anyhow!("failed finalizing OTA image: {err:?}"))
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { sys::esp_task_wdt_init(&config) };
    if rc == sys::ESP_OK || rc == sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == sys::ESP_OK || rc == sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { sys::esp_task_wdt_reset() };
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
